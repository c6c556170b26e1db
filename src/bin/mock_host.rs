//! Mock host CLI binary for integration testing
//!
//! Behaves like a small function-host CLI: `init`, `new` and `settings add`
//! write project files, `start` validates them, forks a language worker and
//! serves HTTP until killed. Error texts match what the scenarios look for.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, Stdio};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "mock-host")]
struct Cli {
    #[command(subcommand)]
    command: HostCommand,
}

#[derive(Subcommand)]
enum HostCommand {
    /// Create a project in the given directory
    Init {
        path: PathBuf,
        #[arg(long)]
        worker_runtime: String,
    },
    /// Add a function from a template
    New {
        #[arg(long)]
        template: String,
        #[arg(long)]
        name: String,
    },
    /// Start the host
    Start {
        #[arg(long, short, default_value_t = 7071)]
        port: u16,
        /// Only load these functions
        #[arg(long, num_args = 1..)]
        functions: Vec<String>,
        #[arg(long)]
        build: bool,
        #[arg(long)]
        language_worker: bool,
        /// Arguments passed through to the language worker
        #[arg(last = true)]
        worker_args: Vec<String>,
    },
    /// Manage local settings
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Language worker started by `start`
    #[command(hide = true)]
    Worker,
}

#[derive(Subcommand)]
enum SettingsCommand {
    Add { name: String, value: String },
}

const HOST_JSON: &str = "host.json";
const SETTINGS_JSON: &str = "local.settings.json";
const FUNCTION_JSON: &str = "function.json";

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        HostCommand::Init {
            path,
            worker_runtime,
        } => init(&path, &worker_runtime),
        HostCommand::New { template, name } => new_function(&template, &name),
        HostCommand::Start {
            port,
            functions,
            build,
            language_worker,
            worker_args,
        } => start(port, &functions, build, language_worker, &worker_args),
        HostCommand::Settings(SettingsCommand::Add { name, value }) => add_setting(&name, &value),
        HostCommand::Worker => worker(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn read_json(path: &Path) -> Result<Value, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("{}: {}", path.display(), e))
}

fn write_json(path: &Path, value: &Value) -> Result<(), String> {
    let content = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    std::fs::write(path, content).map_err(|e| format!("{}: {}", path.display(), e))
}

fn init(path: &Path, runtime: &str) -> Result<(), String> {
    std::fs::create_dir_all(path).map_err(|e| e.to_string())?;

    let mut host = json!({ "version": "2.0" });
    if runtime != "dotnet" {
        host["extensionBundle"] = json!({
            "id": "Microsoft.Azure.Functions.ExtensionBundle",
            "version": "[1.*, 2.0.0)"
        });
    }
    write_json(&path.join(HOST_JSON), &host)?;
    println!("Writing {}", HOST_JSON);

    let settings = json!({
        "IsEncrypted": false,
        "Values": { "FUNCTIONS_WORKER_RUNTIME": runtime }
    });
    write_json(&path.join(SETTINGS_JSON), &settings)?;
    println!("Writing {}", SETTINGS_JSON);
    Ok(())
}

fn new_function(template: &str, name: &str) -> Result<(), String> {
    if !template.to_ascii_lowercase().replace(' ', "").contains("httptrigger") {
        return Err(format!("Can't find template \"{template}\""));
    }
    let dir = Path::new(name);
    std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
    let function = json!({
        "bindings": [
            { "authLevel": "anonymous", "type": "httpTrigger", "direction": "in", "name": "req", "methods": ["get", "post"] },
            { "type": "http", "direction": "out", "name": "res" }
        ]
    });
    write_json(&dir.join(FUNCTION_JSON), &function)?;
    println!("The function \"{name}\" was created successfully from the \"{template}\" template.");
    Ok(())
}

fn add_setting(name: &str, value: &str) -> Result<(), String> {
    let path = Path::new(SETTINGS_JSON);
    let mut settings = read_json(path)?;
    settings["Values"][name] = json!(value);
    write_json(path, &settings)
}

fn start(
    port: u16,
    only: &[String],
    _build: bool,
    language_worker: bool,
    worker_args: &[String],
) -> Result<(), String> {
    let cwd = std::env::current_dir().map_err(|e| e.to_string())?;
    let host_path = cwd.join(HOST_JSON);
    if !host_path.exists() {
        return Err(format!(
            "Host.json file in missing. Please make sure host.json file is present at {}",
            cwd.display()
        ));
    }
    let host = read_json(&host_path)?;

    let settings = read_json(&cwd.join(SETTINGS_JSON)).unwrap_or_else(|_| json!({ "Values": {} }));
    let runtime = settings["Values"]["FUNCTIONS_WORKER_RUNTIME"]
        .as_str()
        .unwrap_or("node")
        .to_string();
    if runtime == "dotnet" && host.get("extensionBundle").is_some() {
        return Err(
            "Extension bundle configuration should not be present for the function app with compiled C# functions."
                .to_string(),
        );
    }

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(|_| {
        format!("Port {port} is unavailable. Close the process using that port, or specify another port using --port [-p].")
    })?;

    if let Some(values) = settings["Values"].as_object() {
        for name in values.keys() {
            if std::env::var_os(name).is_some() {
                println!(
                    "Skipping '{name}' from local settings as it's already defined in current environment variables."
                );
            }
        }
    }

    let functions = load_functions(&cwd, only)?;

    // Keep a worker in our process group, like a real language worker
    let exe = std::env::current_exe().map_err(|e| e.to_string())?;
    Command::new(exe)
        .arg("worker")
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| format!("Failed to start language worker: {e}"))?;

    if language_worker {
        for arg in worker_args {
            if let Some(inspect_port) = arg.strip_prefix("--inspect=") {
                println!("Debugger listening on ws://127.0.0.1:{inspect_port}/mock-session");
            }
        }
    }

    println!();
    println!("Http Functions:");
    println!();
    for name in &functions {
        println!("\t{name}: [GET,POST] http://localhost:{port}/api/{name}");
    }
    println!();
    println!("Host started");
    std::io::stdout().flush().ok();

    let dotnet = runtime == "dotnet";
    let names = Arc::new(functions);
    for stream in listener.incoming().flatten() {
        let names = names.clone();
        std::thread::spawn(move || handle_connection(stream, &names, dotnet));
    }
    Ok(())
}

/// Function directories under `root` whose bindings are all http
fn load_functions(root: &Path, only: &[String]) -> Result<Vec<String>, String> {
    let mut found = BTreeMap::new();
    let entries = std::fs::read_dir(root).map_err(|e| e.to_string())?;
    for entry in entries.flatten() {
        let path = entry.path().join(FUNCTION_JSON);
        if !path.exists() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        found.insert(name, read_json(&path)?);
    }

    let mut functions = Vec::new();
    for (name, definition) in found {
        if !only.is_empty() && !only.contains(&name) {
            continue;
        }
        let unknown: Vec<String> = definition["bindings"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|b| b["type"].as_str())
            .filter(|t| *t != "httpTrigger" && *t != "http")
            .map(|t| format!("'{t}'"))
            .collect();
        if !unknown.is_empty() {
            println!(
                "The binding type(s) {} are not registered. Please ensure the type is correct and the binding extension is installed.",
                unknown.join(", ")
            );
            continue;
        }
        functions.push(name);
    }
    Ok(functions)
}

fn handle_connection(mut stream: TcpStream, functions: &[String], dotnet: bool) {
    let mut request_line = String::new();
    {
        let mut reader = BufReader::new(&stream);
        if reader.read_line(&mut request_line).is_err() {
            return;
        }
        // Drain headers
        let mut line = String::new();
        while reader.read_line(&mut line).map(|n| n > 2).unwrap_or(false) {
            line.clear();
        }
    }

    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let name_param = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("name="))
        .unwrap_or("");

    let (status, body) = if path == "/admin/host/ping" {
        ("200 OK", String::new())
    } else if let Some(function) = path.strip_prefix("/api/") {
        if functions.iter().any(|f| f.eq_ignore_ascii_case(function)) {
            if dotnet {
                (
                    "200 OK",
                    format!("Hello, {name_param}. This HTTP triggered function executed successfully."),
                )
            } else {
                ("200 OK", format!("Hello {name_param}"))
            }
        } else {
            ("404 Not Found", String::new())
        }
    } else {
        ("404 Not Found", String::new())
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).ok();
    stream.flush().ok();
}

fn worker() -> Result<(), String> {
    std::fs::write("worker.pid", std::process::id().to_string()).map_err(|e| e.to_string())?;
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}

//! CLI command handling
//!
//! Loads scenario files, runs them and prints a summary.

use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::scenario::{load_scenario, RunnerOptions, Scenario, ScenarioReport, ScenarioRunner};

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            paths,
            cli,
            config,
            jobs,
            keep_workspace,
        } => {
            let mut config = match config {
                Some(path) => Config::load_from(&path)?,
                None => Config::load()?,
            };
            if let Some(program) = cli {
                config.cli.program = program;
            }

            let scenarios = load_all(&paths)?;
            let mut options = RunnerOptions::from_config(&config)?;
            options.keep_workspace = keep_workspace;
            println!(
                "{} {} scenario(s) against {}",
                "Running".blue().bold(),
                scenarios.len(),
                options.program.display().to_string().white().bold()
            );

            let runner = ScenarioRunner::new(options);
            let reports = runner.run_all(&scenarios, jobs).await;
            for report in &reports {
                print_report(report);
            }

            let failed = reports.iter().filter(|r| !r.passed).count();
            print_summary(reports.len(), failed);
            if failed > 0 {
                return Err(Error::Assertion(format!(
                    "{} of {} scenario(s) failed",
                    failed,
                    reports.len()
                )));
            }
            Ok(())
        }

        Commands::Check { paths } => {
            let mut invalid = 0;
            for path in &paths {
                match load_scenario(path) {
                    Ok(scenario) => println!(
                        "  {} {} ({} steps)",
                        "✓".green(),
                        scenario.name,
                        scenario.steps.len()
                    ),
                    Err(e) => {
                        invalid += 1;
                        println!("  {} {}", "✗".red(), e);
                    }
                }
            }
            if invalid > 0 {
                return Err(Error::Config(format!("{} invalid scenario file(s)", invalid)));
            }
            Ok(())
        }
    }
}

fn load_all(paths: &[PathBuf]) -> Result<Vec<Scenario>> {
    paths.iter().map(|p| load_scenario(Path::new(p))).collect()
}

fn print_report(report: &ScenarioReport) {
    let timing = format!(
        "({}/{} steps, {:.1}s)",
        report.steps_run,
        report.steps_total,
        report.duration.as_secs_f64()
    );

    if report.passed {
        println!("  {} {} {}", "✓".green(), report.name, timing.dimmed());
    } else {
        println!("  {} {} {}", "✗".red(), report.name.red().bold(), timing.dimmed());
        if let Some(failure) = &report.failure {
            for line in failure.to_string().lines() {
                println!("      {}", line);
            }
        }
    }

    if let Some(path) = &report.kept_workspace {
        println!("      workspace: {}", path.display().to_string().dimmed());
    }
}

fn print_summary(total: usize, failed: usize) {
    if failed == 0 {
        println!(
            "\n{} {}\n",
            "✓".green().bold(),
            format!("{} scenario(s) passed", total).green().bold()
        );
    } else {
        println!(
            "\n{} {}\n",
            "✗".red().bold(),
            format!("{} of {} scenario(s) failed", failed, total).red().bold()
        );
    }
}

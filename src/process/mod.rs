//! Spawned processes and their captured output

mod buffer;
mod command_line;
mod handle;

pub use buffer::OutputBuffer;
pub use command_line::CommandLine;
pub use handle::{ExitOutcome, ProcessHandle};

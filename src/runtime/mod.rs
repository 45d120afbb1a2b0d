pub mod docker;
pub mod kubectl;
pub mod process;

pub use process::{
    CommandOutput, CommandRunner, CommandSpec, ProcessHandle, RunnerError, SystemRunner,
};

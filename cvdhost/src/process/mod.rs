//! Spawning and controlling child processes.

mod command;
mod managed;
mod stopper;
mod subprocess;

pub use command::{
    CHILD_SETUP_FAILED_STATUS, Command, EXEC_FAILED_STATUS, StdIoChannel, SubprocessOptions,
};
pub use managed::{execute, execute_with_info, run_with_managed_stdio, run_with_managed_stdio_options};
pub use stopper::{
    Stopper, StopperResult, graceful_stopper, kill_subprocess, kill_subprocess_fallback,
};
pub use subprocess::{Subprocess, WaitInfo};

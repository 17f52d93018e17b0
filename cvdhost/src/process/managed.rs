//! Run a command to completion with its stdio captured in memory.

use std::sync::Arc;

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::propagate;

use super::command::{Command, StdIoChannel, SubprocessOptions};
use super::subprocess::WaitInfo;
use crate::fd::ScopedFd;

/// Feed `stdin`, capture stdout/stderr into the given buffers, and wait.
///
/// Returns the exit code (negated signal number on a signal death), or `-1`
/// when the command could not be set up or started.
pub fn run_with_managed_stdio(
    command: Command,
    stdin: Option<&[u8]>,
    stdout: Option<&mut Vec<u8>>,
    stderr: Option<&mut Vec<u8>>,
) -> i32 {
    run_with_managed_stdio_options(command, stdin, stdout, stderr, SubprocessOptions::default())
}

pub fn run_with_managed_stdio_options(
    command: Command,
    stdin: Option<&[u8]>,
    stdout: Option<&mut Vec<u8>>,
    stderr: Option<&mut Vec<u8>>,
    options: SubprocessOptions,
) -> i32 {
    let name = command.short_name();
    match managed(command, stdin, stdout, stderr, options) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(command = %name, "Managed run failed: {}", err);
            -1
        }
    }
}

fn managed(
    mut command: Command,
    stdin: Option<&[u8]>,
    stdout: Option<&mut Vec<u8>>,
    stderr: Option<&mut Vec<u8>>,
    options: SubprocessOptions,
) -> CvdResult<i32> {
    let mut stdin_writer = None;
    if stdin.is_some() {
        let (read, write) = propagate!(ScopedFd::pipe(), "stdin pipe");
        command = command.redirect_stdio(StdIoChannel::StdIn, Arc::new(read));
        stdin_writer = Some(write);
    }
    let mut stdout_reader = None;
    if stdout.is_some() {
        let (read, write) = propagate!(ScopedFd::pipe(), "stdout pipe");
        command = command.redirect_stdio(StdIoChannel::StdOut, Arc::new(write));
        stdout_reader = Some(read);
    }
    let mut stderr_reader = None;
    if stderr.is_some() {
        let (read, write) = propagate!(ScopedFd::pipe(), "stderr pipe");
        command = command.redirect_stdio(StdIoChannel::StdErr, Arc::new(write));
        stderr_reader = Some(read);
    }

    let mut subprocess = propagate!(command.start(options));
    // Our copies of the child's pipe ends must go, or the readers never see EOF.
    drop(command);

    std::thread::scope(|scope| {
        if let (Some(writer), Some(data)) = (stdin_writer.take(), stdin) {
            scope.spawn(move || {
                if let Err(err) = writer.write_all(data) {
                    tracing::debug!("Writing child stdin stopped: {}", err);
                }
            });
        }
        if let (Some(reader), Some(buffer)) = (stdout_reader.take(), stdout) {
            scope.spawn(move || read_to_end(&reader, buffer));
        }
        if let (Some(reader), Some(buffer)) = (stderr_reader.take(), stderr) {
            scope.spawn(move || read_to_end(&reader, buffer));
        }
    });

    Ok(propagate!(subprocess.wait()))
}

fn read_to_end(fd: &ScopedFd, buffer: &mut Vec<u8>) {
    let mut chunk = [0u8; 4096];
    loop {
        match fd.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(err) => {
                tracing::debug!("Reading child output stopped: {}", err);
                return;
            }
        }
    }
}

/// Run `argv` with `environment` (or the current one) and return the exit
/// code, negated signal number on a signal death.
pub fn execute(argv: &[&str], environment: Option<&[String]>) -> CvdResult<i32> {
    let info = propagate!(execute_with_info(
        argv,
        environment,
        SubprocessOptions::default(),
        libc::WEXITED
    ));
    Ok(info.as_status())
}

/// Run `argv` and return the `waitid(wait_flags)` result.
pub fn execute_with_info(
    argv: &[&str],
    environment: Option<&[String]>,
    options: SubprocessOptions,
    wait_flags: i32,
) -> CvdResult<WaitInfo> {
    let Some((program, args)) = argv.split_first() else {
        return Err(cvdhost_shared::stack_err!(
            kind = cvdhost_shared::ErrorKind::Config,
            "empty argv"
        ));
    };
    let mut command = Command::new(*program).add_parameters(args.iter());
    if let Some(environment) = environment {
        command = command.set_environment(environment.iter().cloned());
    }
    let mut subprocess = propagate!(command.start(options));
    let info = propagate!(subprocess.wait_with(wait_flags));
    Ok(propagate!(info, "no status for {}", program))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdin_echoed_to_stdout() {
        let mut out = Vec::new();
        let code = run_with_managed_stdio(
            Command::new("/bin/cat"),
            Some(b"through cat"),
            Some(&mut out),
            None,
        );
        assert_eq!(code, 0);
        assert_eq!(out, b"through cat");
    }

    #[test]
    fn test_empty_stdin_still_reaches_eof() {
        let mut out = Vec::new();
        let code = run_with_managed_stdio(Command::new("/bin/cat"), Some(b""), Some(&mut out), None);
        assert_eq!(code, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_stdout_and_stderr_separate() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = run_with_managed_stdio(
            Command::new("/bin/sh").add_parameters(["-c", "echo out; echo err >&2; exit 4"]),
            None,
            Some(&mut out),
            Some(&mut err),
        );
        assert_eq!(code, 4);
        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
    }

    #[test]
    fn test_large_output_does_not_deadlock() {
        let mut out = Vec::new();
        let code = run_with_managed_stdio(
            Command::new("/bin/sh").add_parameters(["-c", "head -c 1000000 /dev/zero"]),
            None,
            Some(&mut out),
            None,
        );
        assert_eq!(code, 0);
        assert_eq!(out.len(), 1_000_000);
    }

    #[test]
    fn test_start_failure_is_minus_one() {
        let command = Command::new("no-such-cvd-tool").set_environment(["PATH=/nonexistent"]);
        assert_eq!(run_with_managed_stdio(command, None, None, None), -1);
    }

    #[test]
    fn test_execute() {
        assert_eq!(execute(&["/bin/sh", "-c", "exit 7"], None).unwrap(), 7);
        assert_eq!(
            execute(&[], None).unwrap_err().kind(),
            cvdhost_shared::ErrorKind::Config
        );
        let env = vec!["CVD_X=1".to_string()];
        let info = execute_with_info(
            &["/bin/sh", "-c", "[ \"$CVD_X\" = 1 ]"],
            Some(&env),
            SubprocessOptions::default().verbose(false),
            libc::WEXITED,
        )
        .unwrap();
        assert!(info.success());
    }
}

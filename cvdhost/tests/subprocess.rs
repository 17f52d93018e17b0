use cvdhost::process::{Command, SubprocessOptions, execute, run_with_managed_stdio};

#[test]
fn test_echo_stdout_captured() {
    let mut stdout = Vec::new();
    let code = run_with_managed_stdio(
        Command::new("/bin/echo").add_parameter("hi"),
        None,
        Some(&mut stdout),
        None,
    );
    assert_eq!(code, 0);
    assert_eq!(stdout, b"hi\n");
}

#[test]
fn test_empty_stdin_reaches_eof() {
    let mut stdout = Vec::new();
    let code = run_with_managed_stdio(
        Command::new("/bin/cat"),
        Some(b""),
        Some(&mut stdout),
        None,
    );
    assert_eq!(code, 0);
    assert!(stdout.is_empty());
}

#[test]
fn test_two_runs_get_distinct_pids() {
    let command = Command::new("/bin/true");
    let mut first = command.start(SubprocessOptions::default()).unwrap();
    let mut second = command.start(SubprocessOptions::default()).unwrap();
    assert_ne!(first.pid(), second.pid());
    assert_eq!(first.wait().unwrap(), 0);
    assert_eq!(second.wait().unwrap(), 0);
}

#[test]
fn test_execute_reports_exit_code() {
    assert_eq!(execute(&["/bin/sh", "-c", "exit 4"], None).unwrap(), 4);
}

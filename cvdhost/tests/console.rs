//! Console forwarding through a published pty.

use std::fs::OpenOptions;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use cvdhost::fd::ScopedFd;
use cvdhost::relay::ConsoleForwarder;
use cvdhost::relay::pty::pty_supported;

fn wait_for_link(link: &Path, not: Option<&Path>) -> PathBuf {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(target) = std::fs::read_link(link)
            && Some(target.as_path()) != not
        {
            return target;
        }
        assert!(Instant::now() < deadline, "console link never (re)published");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_pty_reader_sees_output_and_pty_regenerates() {
    if !pty_supported() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let console_path = dir.path().join("console");
    let (console_out_read, console_out_write) = ScopedFd::pipe().unwrap();
    let (_console_in_read, console_in_write) = ScopedFd::pipe().unwrap();
    let (log_read, log_write) = ScopedFd::pipe().unwrap();

    let handle = ConsoleForwarder::new(&console_path, console_in_write, console_out_read, log_write)
        .start()
        .unwrap();

    let first = wait_for_link(&console_path, None);
    let mut reader = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&console_path)
        .unwrap();

    console_out_write.write_all(b"boot\n").unwrap();
    let mut buf = [0u8; 5];
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"boot\n");

    drop(reader);
    let second = wait_for_link(&console_path, Some(&first));
    assert_ne!(first, second);

    drop(console_out_write);
    handle.join().unwrap();

    let mut log = [0u8; 5];
    assert_eq!(log_read.read(&mut log).unwrap(), 5);
    assert_eq!(&log, b"boot\n");
}

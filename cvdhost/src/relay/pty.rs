//! Pseudo-terminal creation and publication behind a stable symlink.

use std::os::fd::IntoRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::pty::{PtyMaster, grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::termios::{self, LocalFlags, OutputFlags, SetArg};

use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::propagate;

use crate::fd::ScopedFd;

/// Master side of a fresh pty plus the path of its slave.
#[derive(Debug)]
pub struct Pty {
    pub master: ScopedFd,
    pub slave_path: PathBuf,
}

/// Open a non-blocking pty with local echo and `ONLCR` disabled.
pub fn open_pty() -> CvdResult<Pty> {
    let master: PtyMaster = propagate!(
        posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC),
        "posix_openpt"
    );
    propagate!(grantpt(&master), "grantpt");
    propagate!(unlockpt(&master), "unlockpt");
    let slave_path = PathBuf::from(propagate!(ptsname_r(&master), "ptsname_r"));

    let mut attrs = propagate!(termios::tcgetattr(&master), "tcgetattr");
    attrs.local_flags &= !(LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ECHOK | LocalFlags::ECHONL);
    attrs.output_flags &= !OutputFlags::ONLCR;
    propagate!(termios::tcsetattr(&master, SetArg::TCSANOW, &attrs), "tcsetattr");

    // SAFETY: into_raw_fd hands over sole ownership of the master.
    let master = unsafe { ScopedFd::from_raw(master.into_raw_fd()) };
    propagate!(master.set_nonblocking(true));
    Ok(Pty { master, slave_path })
}

/// Point `link` at `target`, replacing whatever was there.
pub fn publish_symlink(target: &Path, link: &Path) -> CvdResult<()> {
    match std::fs::remove_file(link) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(cvdhost_shared::StackTraceError::from(err).push_entry(
                cvdhost_shared::stack_entry!().with_message(format!("unlinking {}", link.display())),
            ));
        }
    }
    propagate!(
        std::os::unix::fs::symlink(target, link),
        "linking {} -> {}",
        link.display(),
        target.display()
    );
    Ok(())
}

/// Whether this host can allocate ptys at all.
pub fn pty_supported() -> bool {
    Path::new("/dev/ptmx").exists() && open_pty().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_pty_slave_exists() {
        if !pty_supported() {
            return;
        }
        let pty = open_pty().unwrap();
        assert!(pty.slave_path.starts_with("/dev/pts"));
        assert!(pty.slave_path.exists());
        let attrs = termios::tcgetattr(pty.master.borrow().unwrap()).unwrap();
        assert!(!attrs.local_flags.contains(LocalFlags::ECHO));
    }

    #[test]
    fn test_publish_symlink_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("console");
        publish_symlink(Path::new("/dev/null"), &link).unwrap();
        publish_symlink(Path::new("/dev/zero"), &link).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), Path::new("/dev/zero"));
    }
}

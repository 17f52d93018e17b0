//! Owned file descriptor with explicit, non-retrying I/O.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::fcntl::OFlag;

/// Retry a libc call returning `-1` on `EINTR`.
pub(crate) fn retry_eintr<F>(mut call: F) -> io::Result<isize>
where
    F: FnMut() -> isize,
{
    loop {
        let rc = call();
        if rc >= 0 {
            return Ok(rc);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Owner of one OS file descriptor, closed on drop.
///
/// A `ScopedFd` is either open or empty (moved-from or closed); it never
/// closes the same descriptor twice. Short reads and `EAGAIN` are surfaced to
/// the caller; only `EINTR` is retried.
#[derive(Default)]
pub struct ScopedFd {
    fd: Option<OwnedFd>,
}

impl ScopedFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    /// An empty owner, equivalent to a closed descriptor.
    pub fn empty() -> Self {
        Self { fd: None }
    }

    /// Take ownership of a raw descriptor.
    ///
    /// # Safety
    /// `fd` must be an open descriptor not owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        // SAFETY: guaranteed by the caller.
        Self::new(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// The raw descriptor, or `-1` when empty.
    pub fn raw(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    pub fn borrow(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn open_fd(&self) -> io::Result<RawFd> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.open_fd()?;
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let n = retry_eintr(|| unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })?;
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.open_fd()?;
        // SAFETY: buf is valid for reads of buf.len() bytes.
        let n = retry_eintr(|| unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })?;
        Ok(n as usize)
    }

    /// Write the whole buffer, looping over short writes.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    pub fn send(&self, buf: &[u8], flags: i32) -> io::Result<usize> {
        let fd = self.open_fd()?;
        // SAFETY: buf is valid for reads of buf.len() bytes.
        let n = retry_eintr(|| unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), flags) })?;
        Ok(n as usize)
    }

    pub fn recv(&self, buf: &mut [u8], flags: i32) -> io::Result<usize> {
        let fd = self.open_fd()?;
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let n = retry_eintr(|| unsafe {
            libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags)
        })?;
        Ok(n as usize)
    }

    /// `fcntl(fd, cmd, arg)`.
    pub fn fcntl(&self, cmd: i32, arg: i32) -> io::Result<i32> {
        let fd = self.open_fd()?;
        // SAFETY: plain integer fcntl commands.
        let rc = retry_eintr(|| unsafe { libc::fcntl(fd, cmd, arg) as isize })?;
        Ok(rc as i32)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let flags = OFlag::from_bits_retain(self.fcntl(libc::F_GETFL, 0)?);
        let flags = if nonblocking {
            flags | OFlag::O_NONBLOCK
        } else {
            flags - OFlag::O_NONBLOCK
        };
        self.fcntl(libc::F_SETFL, flags.bits())?;
        Ok(())
    }

    pub fn set_cloexec(&self, cloexec: bool) -> io::Result<()> {
        let flags = self.fcntl(libc::F_GETFD, 0)?;
        let flags = if cloexec {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        self.fcntl(libc::F_SETFD, flags)?;
        Ok(())
    }

    /// Read a socket option of plain-data type `T`.
    pub fn get_sockopt<T: Copy>(&self, level: i32, name: i32) -> io::Result<T> {
        let fd = self.open_fd()?;
        let mut value = std::mem::MaybeUninit::<T>::zeroed();
        let mut len = std::mem::size_of::<T>() as libc::socklen_t;
        // SAFETY: value has room for size_of::<T>() bytes; len reports it.
        let rc = unsafe { libc::getsockopt(fd, level, name, value.as_mut_ptr().cast(), &mut len) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: zero-initialized and possibly overwritten by the kernel.
        Ok(unsafe { value.assume_init() })
    }

    /// Set a socket option of plain-data type `T`.
    pub fn set_sockopt<T: Copy>(&self, level: i32, name: i32, value: &T) -> io::Result<()> {
        let fd = self.open_fd()?;
        let len = std::mem::size_of::<T>() as libc::socklen_t;
        // SAFETY: value points to size_of::<T>() readable bytes.
        let rc = unsafe { libc::setsockopt(fd, level, name, (value as *const T).cast(), len) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Independent owner of the same open file description.
    pub fn dup(&self) -> io::Result<ScopedFd> {
        self.dup_at_least(0)
    }

    /// Like [`dup`](Self::dup), with the new number `>= min`. The copy is
    /// close-on-exec.
    pub fn dup_at_least(&self, min: RawFd) -> io::Result<ScopedFd> {
        let fd = self.fcntl(libc::F_DUPFD_CLOEXEC, min)?;
        // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor we now own.
        Ok(unsafe { ScopedFd::from_raw(fd) })
    }

    /// Close now. Closing an empty owner is a no-op.
    pub fn close(&mut self) {
        self.fd = None;
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let fd = self.open_fd()?;
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        // SAFETY: fd is open.
        if unsafe { libc::shutdown(fd, how) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Release ownership without closing.
    pub fn into_owned(mut self) -> Option<OwnedFd> {
        self.fd.take()
    }

    /// A close-on-exec pipe, `(read_end, write_end)`.
    pub fn pipe() -> io::Result<(ScopedFd, ScopedFd)> {
        let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        Ok((ScopedFd::new(read), ScopedFd::new(write)))
    }

    /// Open `path` with raw `open(2)` flags (close-on-exec is always added).
    pub fn open(path: &Path, flags: OFlag, mode: u32) -> io::Result<ScopedFd> {
        let access = flags & OFlag::O_ACCMODE;
        let file = OpenOptions::new()
            .read(access == OFlag::O_RDONLY || access == OFlag::O_RDWR)
            .write(access == OFlag::O_WRONLY || access == OFlag::O_RDWR)
            .custom_flags((flags - OFlag::O_ACCMODE).bits() | libc::O_CLOEXEC)
            .mode(mode)
            .open(path)?;
        Ok(ScopedFd::new(file.into()))
    }
}

impl From<OwnedFd> for ScopedFd {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}

impl AsRawFd for ScopedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.raw()
    }
}

impl IntoRawFd for ScopedFd {
    fn into_raw_fd(self) -> RawFd {
        self.into_owned().map_or(-1, |fd| fd.into_raw_fd())
    }
}

impl fmt::Debug for ScopedFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScopedFd").field(&self.raw()).finish()
    }
}

//! Socket factories returning [`ScopedFd`]s.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use cvdhost_shared::Transport;
use cvdhost_shared::errors::CvdResult;
use cvdhost_shared::{errno_err, propagate};

use super::ScopedFd;
use super::scoped::retry_eintr;

const LISTEN_BACKLOG: i32 = 128;

/// Wildcard vsock context id for listeners.
pub const VMADDR_CID_ANY: u32 = libc::VMADDR_CID_ANY;

fn vsock_addr(cid: u32, port: u32) -> libc::sockaddr_vm {
    // SAFETY: sockaddr_vm is plain data; all-zero is a valid starting point.
    let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
    addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
    addr.svm_cid = cid;
    addr.svm_port = port;
    addr
}

fn vsock_socket() -> CvdResult<ScopedFd> {
    // SAFETY: plain socket(2) call.
    let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(errno_err!("socket(AF_VSOCK) failed"));
    }
    // SAFETY: fresh descriptor owned by nobody else.
    Ok(unsafe { ScopedFd::from_raw(fd) })
}

/// Listen on vsock `port` for connections from `cid` (or any cid).
pub fn vsock_server(port: u32, cid: Option<u32>) -> CvdResult<ScopedFd> {
    let fd = propagate!(vsock_socket());
    let addr = vsock_addr(cid.unwrap_or(VMADDR_CID_ANY), port);
    let len = std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t;
    // SAFETY: addr is a valid sockaddr_vm of length len.
    if unsafe { libc::bind(fd.raw(), (&addr as *const libc::sockaddr_vm).cast(), len) } < 0 {
        return Err(errno_err!("bind(vsock port {}) failed", port));
    }
    // SAFETY: fd is a bound socket.
    if unsafe { libc::listen(fd.raw(), LISTEN_BACKLOG) } < 0 {
        return Err(errno_err!("listen(vsock port {}) failed", port));
    }
    Ok(fd)
}

/// Connect to vsock `cid:port`.
pub fn vsock_client(cid: u32, port: u32) -> CvdResult<ScopedFd> {
    let fd = propagate!(vsock_socket());
    let addr = vsock_addr(cid, port);
    let len = std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t;
    // SAFETY: addr is a valid sockaddr_vm of length len.
    if unsafe { libc::connect(fd.raw(), (&addr as *const libc::sockaddr_vm).cast(), len) } < 0 {
        return Err(errno_err!("connect(vsock {}:{}) failed", cid, port));
    }
    Ok(fd)
}

/// Accept one connection on a listening socket of any family.
pub fn accept(listener: &ScopedFd) -> io::Result<ScopedFd> {
    let fd = listener.raw();
    // SAFETY: null address out-params are allowed by accept4(2).
    let client = retry_eintr(|| unsafe {
        libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_CLOEXEC) as isize
    })?;
    // SAFETY: accept4 returned a fresh descriptor.
    Ok(unsafe { ScopedFd::from_raw(client as i32) })
}

/// Listen on TCP `port` on every IPv4 interface. Port 0 picks a free port.
pub fn tcp_server(port: u16) -> CvdResult<ScopedFd> {
    let listener = propagate!(
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)),
        "binding tcp port {}",
        port
    );
    Ok(ScopedFd::new(listener.into()))
}

pub fn tcp_client(addr: SocketAddr) -> CvdResult<ScopedFd> {
    let stream = propagate!(TcpStream::connect(addr), "connecting to {}", addr);
    Ok(ScopedFd::new(stream.into()))
}

/// Port a bound TCP socket listens on.
pub fn local_tcp_port(fd: &ScopedFd) -> CvdResult<u16> {
    // SAFETY: sockaddr_storage is plain data.
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: addr has room for len bytes.
    if unsafe { libc::getsockname(fd.raw(), (&mut addr as *mut libc::sockaddr_storage).cast(), &mut len) } < 0 {
        return Err(errno_err!("getsockname failed"));
    }
    match addr.ss_family as i32 {
        libc::AF_INET => {
            // SAFETY: family says this is a sockaddr_in.
            let sin: libc::sockaddr_in = unsafe { std::ptr::read((&addr as *const libc::sockaddr_storage).cast()) };
            Ok(u16::from_be(sin.sin_port))
        }
        libc::AF_INET6 => {
            // SAFETY: family says this is a sockaddr_in6.
            let sin6: libc::sockaddr_in6 = unsafe { std::ptr::read((&addr as *const libc::sockaddr_storage).cast()) };
            Ok(u16::from_be(sin6.sin6_port))
        }
        family => Err(cvdhost_shared::stack_err!("not an inet socket (family {})", family)),
    }
}

/// Listen on a UNIX stream socket at `path`, replacing a stale socket file.
pub fn unix_server(path: &Path, mode: u32) -> CvdResult<ScopedFd> {
    if path.exists() {
        propagate!(std::fs::remove_file(path), "removing stale {}", path.display());
    }
    let listener = propagate!(UnixListener::bind(path), "binding {}", path.display());
    propagate!(
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)),
        "chmod {:o} {}",
        mode,
        path.display()
    );
    Ok(ScopedFd::new(listener.into()))
}

pub fn unix_client(path: &Path) -> CvdResult<ScopedFd> {
    let stream = propagate!(UnixStream::connect(path), "connecting to {}", path.display());
    Ok(ScopedFd::new(stream.into()))
}

/// A connected pair of UNIX sockets of `kind` (e.g. `SOCK_SEQPACKET`).
pub fn unix_pair(kind: i32) -> CvdResult<(ScopedFd, ScopedFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: fds has room for two descriptors.
    if unsafe { libc::socketpair(libc::AF_UNIX, kind | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr()) } < 0 {
        return Err(errno_err!("socketpair failed"));
    }
    // SAFETY: socketpair returned two fresh descriptors.
    Ok(unsafe { (ScopedFd::from_raw(fds[0]), ScopedFd::from_raw(fds[1])) })
}

/// Listen on `transport`. TCP listeners bind every interface; UNIX
/// listeners are created with mode `0o775`.
pub fn listen(transport: &Transport) -> CvdResult<ScopedFd> {
    match transport {
        Transport::Tcp { port, .. } => tcp_server(*port),
        Transport::Vsock { cid, port } => {
            let cid = (*cid != VMADDR_CID_ANY).then_some(*cid);
            vsock_server(*port, cid)
        }
        Transport::Unix { path } => unix_server(path, 0o775),
    }
}

/// Connect a stream socket to `transport`.
pub fn connect(transport: &Transport) -> CvdResult<ScopedFd> {
    match transport {
        Transport::Tcp { host, port } => {
            let stream = propagate!(
                TcpStream::connect((host.as_str(), *port)),
                "connecting to {}",
                transport
            );
            Ok(ScopedFd::new(stream.into()))
        }
        Transport::Vsock { cid, port } => vsock_client(*cid, *port),
        Transport::Unix { path } => unix_client(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::Shutdown;

    #[test]
    fn test_tcp_server_ephemeral_port() {
        let listener = tcp_server(0).unwrap();
        let port = local_tcp_port(&listener).unwrap();
        assert_ne!(port, 0);
        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        let accepted = accept(&listener).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        let n = accepted.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_unix_server_and_client() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        std::fs::write(&path, b"stale").unwrap();
        let listener = unix_server(&path, 0o775).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o775);
        let client = unix_client(&path).unwrap();
        let accepted = accept(&listener).unwrap();
        client.write_all(b"hi").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let mut stream = UnixStream::from(accepted.into_owned().unwrap());
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert_eq!(text, "hi");
    }

    #[test]
    fn test_listen_and_connect_unix_transport() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Transport::unix(dir.path().join("t.sock"));
        let listener = listen(&transport).unwrap();
        let client = connect(&transport).unwrap();
        let accepted = accept(&listener).unwrap();
        accepted.write_all(b"ok").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(client.read(&mut buf).unwrap(), 2);
    }

    #[test]
    fn test_vsock_client_failure_is_os_error() {
        // Either the family is unsupported or nothing listens on this port.
        let err = vsock_client(libc::VMADDR_CID_HOST, 0xfff0_0001).unwrap_err();
        assert!(err.errno().is_some());
    }
}

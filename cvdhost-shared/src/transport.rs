//! Host endpoint addressing.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, StackTraceError};

/// Where a host daemon listens or connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    Tcp { host: String, port: u16 },
    Vsock { cid: u32, port: u32 },
    Unix { path: PathBuf },
}

impl Transport {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Transport::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn vsock(cid: u32, port: u32) -> Self {
        Transport::Vsock { cid, port }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Transport::Unix { path: path.into() }
    }

    /// URI form: `tcp://host:port`, `vsock://cid:port` or `unix:///path`.
    pub fn to_uri(&self) -> String {
        match self {
            Transport::Tcp { host, port } => format!("tcp://{}:{}", host, port),
            Transport::Vsock { cid, port } => format!("vsock://{}:{}", cid, port),
            Transport::Unix { path } => format!("unix://{}", path.display()),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

impl FromStr for Transport {
    type Err = StackTraceError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| {
            StackTraceError::with_detail(ErrorKind::Config, format!("invalid transport {uri:?}: {why}"))
        };
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| bad("missing scheme"))?;
        match scheme {
            "unix" => {
                if rest.is_empty() {
                    return Err(bad("empty path"));
                }
                Ok(Transport::unix(rest))
            }
            "tcp" => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(|| bad("missing port"))?;
                let port = port.parse().map_err(|_| bad("bad port"))?;
                Ok(Transport::tcp(host, port))
            }
            "vsock" => {
                let (cid, port) = rest.split_once(':').ok_or_else(|| bad("missing port"))?;
                let cid = cid.parse().map_err(|_| bad("bad cid"))?;
                let port = port.parse().map_err(|_| bad("bad port"))?;
                Ok(Transport::vsock(cid, port))
            }
            _ => Err(bad("unknown scheme")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_forms() {
        assert_eq!(Transport::tcp("127.0.0.1", 6520).to_uri(), "tcp://127.0.0.1:6520");
        assert_eq!(Transport::vsock(3, 5555).to_uri(), "vsock://3:5555");
        assert_eq!(Transport::unix("/tmp/a.sock").to_uri(), "unix:///tmp/a.sock");
    }

    #[test]
    fn test_parse_uri() {
        assert_eq!("vsock://3:5555".parse::<Transport>().unwrap(), Transport::vsock(3, 5555));
        assert_eq!(
            "unix:///run/cvd/grpc.sock".parse::<Transport>().unwrap(),
            Transport::unix("/run/cvd/grpc.sock")
        );
        assert_eq!("tcp://[::1]:80".parse::<Transport>().unwrap(), Transport::tcp("[::1]", 80));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = "vsock://x:1".parse::<Transport>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!("ftp://host:1".parse::<Transport>().is_err());
        assert!("no-scheme".parse::<Transport>().is_err());
    }
}

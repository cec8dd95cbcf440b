//! Endpoint addresses in Wyoming URI form: `tcp://host:port` or `unix://path`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

/// Where a Wyoming server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WyomingUri {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

/// A URI that is not a valid Wyoming endpoint.
#[derive(Debug, thiserror::Error)]
#[error("invalid Wyoming URI {uri:?}: {reason}")]
pub struct UriError {
    pub uri: String,
    pub reason: &'static str,
}

/// Byte stream carrying Wyoming events, regardless of socket family.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

impl WyomingUri {
    /// Open a client connection to this endpoint.
    pub async fn connect(&self) -> io::Result<Box<dyn Transport>> {
        match self {
            WyomingUri::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            WyomingUri::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        }
    }
}

impl FromStr for WyomingUri {
    type Err = UriError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let error = |reason| UriError {
            uri: uri.to_string(),
            reason,
        };

        let (scheme, rest) = uri.split_once("://").ok_or(error("missing scheme"))?;
        match scheme {
            "tcp" => {
                let rest = rest.trim_end_matches('/');
                let (host, port) = rest.rsplit_once(':').ok_or(error("missing port"))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(error("missing host"));
                }
                let port: u16 = port.parse().map_err(|_| error("invalid port"))?;
                Ok(WyomingUri::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "unix" => {
                if rest.is_empty() {
                    return Err(error("missing socket path"));
                }
                Ok(WyomingUri::Unix(PathBuf::from(rest)))
            }
            _ => Err(error("scheme must be tcp or unix")),
        }
    }
}

impl fmt::Display for WyomingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WyomingUri::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{host}]:{port}")
            }
            WyomingUri::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            WyomingUri::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

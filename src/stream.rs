//! The blocking transport under the packet codec: TCP, unix socket, or a
//! TLS-wrapped TCP stream, each behind one buffered `Read + Write` surface.

use std::io::{self, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use bufstream::BufStream;
use log::debug;

use crate::error::{cr, Error, Result, ServerError};

pub enum Stream {
    Tcp(BufStream<TcpStream>),
    #[cfg(unix)]
    Unix(BufStream<UnixStream>),
    #[cfg(feature = "tls")]
    Tls(Box<BufStream<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>>),
}

impl Stream {
    pub fn connect_tcp(host: &str, port: u16) -> Result<Stream> {
        debug!("connecting to {host}:{port}");
        let tcp = TcpStream::connect((host, port)).map_err(|e| {
            Error::Connection(ServerError::client(
                cr::CR_CONN_HOST_ERROR,
                format!("Can't connect to MySQL server on '{host}:{port}' ({e})"),
            ))
        })?;
        let _ = tcp.set_nodelay(true);
        Ok(Stream::Tcp(BufStream::new(tcp)))
    }

    #[cfg(unix)]
    pub fn connect_unix(path: &str) -> Result<Stream> {
        debug!("connecting to unix socket {path}");
        let sock = UnixStream::connect(path).map_err(|e| {
            Error::Connection(ServerError::client(
                cr::CR_CONNECTION_ERROR,
                format!("Can't connect to local MySQL server through socket '{path}' ({e})"),
            ))
        })?;
        Ok(Stream::Unix(BufStream::new(sock)))
    }

    /// Unwraps back to the raw TCP stream for the TLS upgrade. Only the
    /// plain TCP arm can be upgraded.
    #[cfg(feature = "tls")]
    pub fn into_tcp(self) -> Result<TcpStream> {
        match self {
            Stream::Tcp(buf) => buf.into_inner().map_err(|e| {
                Error::Connection(ServerError::client(
                    cr::CR_SSL_CONNECTION_ERROR,
                    format!("flush before TLS upgrade failed: {}", e.error()),
                ))
            }),
            _ => Err(Error::Connection(ServerError::client(
                cr::CR_SSL_CONNECTION_ERROR,
                "TLS is only supported over TCP",
            ))),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.flush(),
        }
    }
}

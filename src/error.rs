//! Error taxonomy. Server-side failures carry the native error code, SQL
//! state and message; transport faults are mapped onto the client-side
//! `CR_*` code space at the failing call site.

use std::{fmt, io};

use thiserror::Error;

use crate::consts::ColumnType;

/// Client-side error codes, used when the failure happens on this side of
/// the wire. The numbering mirrors the classic client library.
pub mod cr {
    pub const CR_CONNECTION_ERROR: u16 = 2002;
    pub const CR_CONN_HOST_ERROR: u16 = 2003;
    pub const CR_SERVER_GONE_ERROR: u16 = 2006;
    pub const CR_SERVER_LOST: u16 = 2013;
    pub const CR_SSL_CONNECTION_ERROR: u16 = 2026;
    pub const CR_MALFORMED_PACKET: u16 = 2027;
    pub const CR_PARAMS_NOT_BOUND: u16 = 2031;
    pub const CR_NO_RESULT_SET: u16 = 2053;
    pub const CR_AUTH_PLUGIN_ERR: u16 = 2061;
}

/// One native diagnostic: numeric code, five-byte SQL state and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u16,
    pub state: String,
    pub message: String,
}

impl ServerError {
    pub fn new(code: u16, state: impl Into<String>, message: impl Into<String>) -> ServerError {
        ServerError {
            code,
            state: state.into(),
            message: message.into(),
        }
    }

    /// Client-side diagnostic with the generic `HY000` state.
    pub fn client(code: u16, message: impl Into<String>) -> ServerError {
        ServerError::new(code, "HY000", message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR {} ({}): {}", self.code, self.state, self.message)
    }
}

/// Everything a call can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid account field, e.g. a port outside the 16-bit range.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connect, TLS, session-option or autocommit failure, or a dead
    /// transport underneath a later call.
    #[error("connection error: {0}")]
    Connection(ServerError),

    /// Prepare, bind or prepared-execute failure.
    #[error("statement error: {0}")]
    Statement(ServerError),

    /// Direct-execute or result-chain failure.
    #[error("query error: {0}")]
    Query(ServerError),

    /// A column read was attempted before any successful row fetch.
    #[error("no result row available")]
    NoRow,

    /// Parameter or column index outside the handle's declared count.
    #[error("index {index} out of range ({count} available)")]
    IndexOutOfRange { index: usize, count: usize },

    /// The wire type has no defined conversion to the requested target.
    #[error("cannot convert {from:?} to {to}")]
    Conversion { from: ColumnType, to: &'static str },

    /// Null/empty required argument or an unknown option name.
    #[error("invalid value: {0}")]
    Value(String),
}

impl Error {
    /// Maps a transport fault to the connection class, choosing between
    /// "lost mid-command" and "never reached" codes.
    pub(crate) fn io(err: io::Error, code: u16) -> Error {
        Error::Connection(ServerError::client(code, err.to_string()))
    }

    pub(crate) fn lost(err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::Connection(ServerError::client(
                cr::CR_SERVER_LOST,
                "Lost connection to MySQL server during query",
            ))
        } else {
            Error::io(err, cr::CR_SERVER_LOST)
        }
    }

    pub(crate) fn malformed(what: &str) -> Error {
        Error::Connection(ServerError::client(
            cr::CR_MALFORMED_PACKET,
            format!("Malformed packet: {what}"),
        ))
    }

    pub(crate) fn gone() -> Error {
        Error::Connection(ServerError::client(
            cr::CR_SERVER_GONE_ERROR,
            "MySQL server has gone away",
        ))
    }

    /// The native diagnostic, when this error carries one.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Connection(e) | Error::Statement(e) | Error::Query(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

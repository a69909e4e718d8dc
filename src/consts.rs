//! Protocol-level constants: capability, status and column flags, column
//! type tags, command bytes and the collation ids the client negotiates.

use bitflags::bitflags;

bitflags! {
    /// Client/server capability bits exchanged during the handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CapabilityFlags: u32 {
        const CLIENT_LONG_PASSWORD = 0x0000_0001;
        const CLIENT_FOUND_ROWS = 0x0000_0002;
        const CLIENT_LONG_FLAG = 0x0000_0004;
        const CLIENT_CONNECT_WITH_DB = 0x0000_0008;
        const CLIENT_NO_SCHEMA = 0x0000_0010;
        const CLIENT_COMPRESS = 0x0000_0020;
        const CLIENT_ODBC = 0x0000_0040;
        const CLIENT_LOCAL_FILES = 0x0000_0080;
        const CLIENT_IGNORE_SPACE = 0x0000_0100;
        const CLIENT_PROTOCOL_41 = 0x0000_0200;
        const CLIENT_INTERACTIVE = 0x0000_0400;
        const CLIENT_SSL = 0x0000_0800;
        const CLIENT_IGNORE_SIGPIPE = 0x0000_1000;
        const CLIENT_TRANSACTIONS = 0x0000_2000;
        const CLIENT_RESERVED = 0x0000_4000;
        const CLIENT_SECURE_CONNECTION = 0x0000_8000;
        const CLIENT_MULTI_STATEMENTS = 0x0001_0000;
        const CLIENT_MULTI_RESULTS = 0x0002_0000;
        const CLIENT_PS_MULTI_RESULTS = 0x0004_0000;
        const CLIENT_PLUGIN_AUTH = 0x0008_0000;
        const CLIENT_CONNECT_ATTRS = 0x0010_0000;
        const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA = 0x0020_0000;
        const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS = 0x0040_0000;
        const CLIENT_SESSION_TRACK = 0x0080_0000;
        const CLIENT_DEPRECATE_EOF = 0x0100_0000;
    }
}

bitflags! {
    /// Server status bits carried by OK and EOF packets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u16 {
        const SERVER_STATUS_IN_TRANS = 0x0001;
        const SERVER_STATUS_AUTOCOMMIT = 0x0002;
        const SERVER_MORE_RESULTS_EXISTS = 0x0008;
        const SERVER_STATUS_NO_GOOD_INDEX_USED = 0x0010;
        const SERVER_STATUS_NO_INDEX_USED = 0x0020;
        const SERVER_STATUS_CURSOR_EXISTS = 0x0040;
        const SERVER_STATUS_LAST_ROW_SENT = 0x0080;
        const SERVER_STATUS_DB_DROPPED = 0x0100;
        const SERVER_STATUS_NO_BACKSLASH_ESCAPES = 0x0200;
        const SERVER_STATUS_METADATA_CHANGED = 0x0400;
        const SERVER_QUERY_WAS_SLOW = 0x0800;
        const SERVER_PS_OUT_PARAMS = 0x1000;
        const SERVER_STATUS_IN_TRANS_READONLY = 0x2000;
        const SERVER_SESSION_STATE_CHANGED = 0x4000;
    }
}

bitflags! {
    /// Per-column flags from a column definition packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ColumnFlags: u16 {
        const NOT_NULL_FLAG = 0x0001;
        const PRI_KEY_FLAG = 0x0002;
        const UNIQUE_KEY_FLAG = 0x0004;
        const MULTIPLE_KEY_FLAG = 0x0008;
        const BLOB_FLAG = 0x0010;
        const UNSIGNED_FLAG = 0x0020;
        const ZEROFILL_FLAG = 0x0040;
        const BINARY_FLAG = 0x0080;
        const ENUM_FLAG = 0x0100;
        const AUTO_INCREMENT_FLAG = 0x0200;
        const TIMESTAMP_FLAG = 0x0400;
        const SET_FLAG = 0x0800;
        const NO_DEFAULT_VALUE_FLAG = 0x1000;
        const ON_UPDATE_NOW_FLAG = 0x2000;
        const NUM_FLAG = 0x8000;
    }
}

/// Server-reported type tag of a column or parameter.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnType {
    MYSQL_TYPE_DECIMAL = 0,
    MYSQL_TYPE_TINY = 1,
    MYSQL_TYPE_SHORT = 2,
    MYSQL_TYPE_LONG = 3,
    MYSQL_TYPE_FLOAT = 4,
    MYSQL_TYPE_DOUBLE = 5,
    MYSQL_TYPE_NULL = 6,
    MYSQL_TYPE_TIMESTAMP = 7,
    MYSQL_TYPE_LONGLONG = 8,
    MYSQL_TYPE_INT24 = 9,
    MYSQL_TYPE_DATE = 10,
    MYSQL_TYPE_TIME = 11,
    MYSQL_TYPE_DATETIME = 12,
    MYSQL_TYPE_YEAR = 13,
    MYSQL_TYPE_NEWDATE = 14,
    MYSQL_TYPE_VARCHAR = 15,
    MYSQL_TYPE_BIT = 16,
    MYSQL_TYPE_JSON = 245,
    MYSQL_TYPE_NEWDECIMAL = 246,
    MYSQL_TYPE_ENUM = 247,
    MYSQL_TYPE_SET = 248,
    MYSQL_TYPE_TINY_BLOB = 249,
    MYSQL_TYPE_MEDIUM_BLOB = 250,
    MYSQL_TYPE_LONG_BLOB = 251,
    MYSQL_TYPE_BLOB = 252,
    MYSQL_TYPE_VAR_STRING = 253,
    MYSQL_TYPE_STRING = 254,
    MYSQL_TYPE_GEOMETRY = 255,
}

impl ColumnType {
    /// Decodes a wire tag. Unknown tags (including the server-internal
    /// fractional-seconds variants) yield `None`.
    pub fn from_tag(tag: u8) -> Option<ColumnType> {
        use ColumnType::*;
        Some(match tag {
            0 => MYSQL_TYPE_DECIMAL,
            1 => MYSQL_TYPE_TINY,
            2 => MYSQL_TYPE_SHORT,
            3 => MYSQL_TYPE_LONG,
            4 => MYSQL_TYPE_FLOAT,
            5 => MYSQL_TYPE_DOUBLE,
            6 => MYSQL_TYPE_NULL,
            7 => MYSQL_TYPE_TIMESTAMP,
            8 => MYSQL_TYPE_LONGLONG,
            9 => MYSQL_TYPE_INT24,
            10 => MYSQL_TYPE_DATE,
            11 => MYSQL_TYPE_TIME,
            12 => MYSQL_TYPE_DATETIME,
            13 => MYSQL_TYPE_YEAR,
            14 => MYSQL_TYPE_NEWDATE,
            15 => MYSQL_TYPE_VARCHAR,
            16 => MYSQL_TYPE_BIT,
            245 => MYSQL_TYPE_JSON,
            246 => MYSQL_TYPE_NEWDECIMAL,
            247 => MYSQL_TYPE_ENUM,
            248 => MYSQL_TYPE_SET,
            249 => MYSQL_TYPE_TINY_BLOB,
            250 => MYSQL_TYPE_MEDIUM_BLOB,
            251 => MYSQL_TYPE_LONG_BLOB,
            252 => MYSQL_TYPE_BLOB,
            253 => MYSQL_TYPE_VAR_STRING,
            254 => MYSQL_TYPE_STRING,
            255 => MYSQL_TYPE_GEOMETRY,
            _ => return None,
        })
    }

    /// Width of the fixed binary-protocol encoding, `None` for
    /// length-prefixed and temporal encodings.
    pub fn fixed_binary_width(self) -> Option<usize> {
        use ColumnType::*;
        match self {
            MYSQL_TYPE_TINY => Some(1),
            MYSQL_TYPE_SHORT | MYSQL_TYPE_YEAR => Some(2),
            MYSQL_TYPE_LONG | MYSQL_TYPE_INT24 | MYSQL_TYPE_FLOAT => Some(4),
            MYSQL_TYPE_LONGLONG | MYSQL_TYPE_DOUBLE => Some(8),
            _ => None,
        }
    }
}

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;
pub const COM_PING: u8 = 0x0e;
pub const COM_STMT_PREPARE: u8 = 0x16;
pub const COM_STMT_EXECUTE: u8 = 0x17;
pub const COM_STMT_CLOSE: u8 = 0x19;

/// Collation id the client requests in its handshake response.
pub const UTF8MB4_GENERAL_CI: u8 = 45;

/// Largest payload that fits one wire packet before continuation packets.
pub const MAX_PAYLOAD_LEN: usize = 0xff_ffff;

//! Generic server response packets: OK, ERR, EOF and column definitions.

use crate::column::Column;
use crate::consts::{ColumnFlags, ColumnType, StatusFlags};
use crate::error::{Error, Result, ServerError};
use crate::proto::codec::ParseBuf;

#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: StatusFlags,
    pub warnings: u16,
}

impl OkPacket {
    pub fn more_results(&self) -> bool {
        self.status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS)
    }
}

/// Parses an OK payload (header byte `0x00`, or `0xfe` under short-EOF
/// aliasing). The caller has already inspected the header byte.
pub fn parse_ok(payload: &[u8]) -> Result<OkPacket> {
    let mut b = ParseBuf(&payload[1..]);
    let affected_rows = b.eat_lenenc_int()?;
    let last_insert_id = b.eat_lenenc_int()?;
    let status = StatusFlags::from_bits_truncate(b.eat_u16_le()?);
    let warnings = b.eat_u16_le()?;
    // session-state info may follow; nothing here consumes it
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status,
        warnings,
    })
}

/// Parses an ERR payload into the native diagnostic.
pub fn parse_err(payload: &[u8]) -> Result<ServerError> {
    let mut b = ParseBuf(&payload[1..]);
    let code = b.eat_u16_le()?;
    let state = if b.peek_u8() == Some(b'#') {
        b.skip(1)?;
        String::from_utf8_lossy(b.eat_bytes(5)?).into_owned()
    } else {
        String::from("HY000")
    };
    let message = String::from_utf8_lossy(b.eat_rest()).into_owned();
    Ok(ServerError::new(code, state, message))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status: StatusFlags,
}

impl EofPacket {
    pub fn more_results(&self) -> bool {
        self.status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS)
    }
}

/// True for the classic EOF marker: `0xfe` header with a short payload.
pub fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&0xfe) && payload.len() < 9
}

pub fn parse_eof(payload: &[u8]) -> Result<EofPacket> {
    let mut b = ParseBuf(&payload[1..]);
    let warnings = b.eat_u16_le()?;
    let status = StatusFlags::from_bits_truncate(b.eat_u16_le()?);
    Ok(EofPacket { warnings, status })
}

/// Parses a protocol-4.1 column definition.
pub fn parse_column_definition(payload: &[u8]) -> Result<Column> {
    let mut b = ParseBuf(payload);
    let _catalog = b.eat_lenenc_bytes()?;
    let schema = lossy(b.eat_lenenc_bytes()?);
    let table = lossy(b.eat_lenenc_bytes()?);
    let org_table = lossy(b.eat_lenenc_bytes()?);
    let name = lossy(b.eat_lenenc_bytes()?);
    let org_name = lossy(b.eat_lenenc_bytes()?);
    let _fixed_len = b.eat_lenenc_int()?;
    let charset = b.eat_u16_le()?;
    let length = b.eat_u32_le()?;
    let type_tag = b.eat_u8()?;
    let flags = ColumnFlags::from_bits_truncate(b.eat_u16_le()?);
    let decimals = b.eat_u8()?;
    let column_type = ColumnType::from_tag(type_tag)
        .ok_or_else(|| Error::malformed(&format!("unknown column type tag {type_tag}")))?;
    Ok(Column {
        schema,
        table,
        org_table,
        name,
        org_name,
        charset,
        length,
        column_type,
        flags,
        decimals,
        max_len: 0,
    })
}

fn lossy(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}

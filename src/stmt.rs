//! Prepared statements: per-placeholder parameter slots, the binary
//! execute encoding, and the execute/insert/query entry points.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use log::debug;

use crate::conn::{Conn, Response};
use crate::consts::{ColumnType, COM_STMT_EXECUTE, COM_STMT_PREPARE};
use crate::error::{cr, Error, Result, ServerError};
use crate::proto::codec::{put_lenenc_bytes, ParseBuf};
use crate::proto::packets::parse_err;
use crate::result::ResultSet;
use crate::temporal::{Date, DateTime, Time};

/// One bound parameter value. `Vacant` means the slot was never assigned;
/// executing with a vacant slot is an error, unlike an explicit `Null`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ParamValue {
    Vacant,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Date(Date),
    Time(Time),
    DateTime(DateTime),
    Bytes(Vec<u8>),
    Null,
}

#[derive(Debug, Clone)]
pub(crate) struct ParamSlot {
    pub(crate) wire_type: ColumnType,
    pub(crate) unsigned: bool,
    pub(crate) value: ParamValue,
}

impl ParamSlot {
    fn vacant() -> ParamSlot {
        ParamSlot {
            wire_type: ColumnType::MYSQL_TYPE_NULL,
            unsigned: false,
            value: ParamValue::Vacant,
        }
    }
}

fn assign_slot(
    slots: &mut [ParamSlot],
    index: usize,
    wire_type: ColumnType,
    unsigned: bool,
    value: ParamValue,
) -> Result<()> {
    let count = slots.len();
    let slot = slots
        .get_mut(index)
        .ok_or(Error::IndexOutOfRange { index, count })?;
    slot.wire_type = wire_type;
    slot.unsigned = unsigned;
    slot.value = value;
    Ok(())
}

/// COM_STMT_EXECUTE body: statement id, no-cursor flag, iteration count,
/// then the null bitmap, type block and value block when the statement has
/// parameters. Every slot must carry a value or an explicit null.
fn encode_execute(id: u32, slots: &[ParamSlot]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(16 + slots.len() * 8);
    body.extend_from_slice(&id.to_le_bytes());
    body.push(0);
    body.extend_from_slice(&1u32.to_le_bytes());
    if slots.is_empty() {
        return Ok(body);
    }
    if let Some(index) = slots
        .iter()
        .position(|s| matches!(s.value, ParamValue::Vacant))
    {
        return Err(Error::Statement(ServerError::client(
            cr::CR_PARAMS_NOT_BOUND,
            format!("no data supplied for parameter {index}"),
        )));
    }
    let mut bitmap = vec![0u8; (slots.len() + 7) / 8];
    for (i, slot) in slots.iter().enumerate() {
        if matches!(slot.value, ParamValue::Null) {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    body.extend_from_slice(&bitmap);
    body.push(1); // types follow
    for slot in slots {
        body.push(slot.wire_type as u8);
        body.push(if slot.unsigned { 0x80 } else { 0 });
    }
    for slot in slots {
        encode_value(&mut body, slot);
    }
    Ok(body)
}

fn encode_value(out: &mut Vec<u8>, slot: &ParamSlot) {
    match &slot.value {
        // null travels in the bitmap, vacant never reaches this point
        ParamValue::Vacant | ParamValue::Null => {}
        ParamValue::Int(v) => {
            let width = slot.wire_type.fixed_binary_width().unwrap_or(8);
            out.extend_from_slice(&v.to_le_bytes()[..width]);
        }
        ParamValue::UInt(v) => {
            let width = slot.wire_type.fixed_binary_width().unwrap_or(8);
            out.extend_from_slice(&v.to_le_bytes()[..width]);
        }
        ParamValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        ParamValue::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        ParamValue::Date(d) => {
            if d.is_zero() {
                out.push(0);
            } else {
                out.push(4);
                out.extend_from_slice(&d.year.to_le_bytes());
                out.push(d.month);
                out.push(d.day);
            }
        }
        ParamValue::DateTime(dt) => {
            if dt.is_zero() {
                out.push(0);
            } else {
                out.push(if dt.micros == 0 { 7 } else { 11 });
                out.extend_from_slice(&dt.year.to_le_bytes());
                out.push(dt.month);
                out.push(dt.day);
                out.push(dt.hour);
                out.push(dt.minute);
                out.push(dt.second);
                if dt.micros != 0 {
                    out.extend_from_slice(&dt.micros.to_le_bytes());
                }
            }
        }
        ParamValue::Time(t) => {
            if t.is_zero() {
                out.push(0);
            } else {
                out.push(if t.micros == 0 { 8 } else { 12 });
                out.push(u8::from(t.negative));
                out.extend_from_slice(&(t.hours / 24).to_le_bytes());
                out.push((t.hours % 24) as u8);
                out.push(t.minutes);
                out.push(t.seconds);
                if t.micros != 0 {
                    out.extend_from_slice(&t.micros.to_le_bytes());
                }
            }
        }
        ParamValue::Bytes(b) => put_lenenc_bytes(out, b),
    }
}

pub(crate) struct StmtInner {
    pub(crate) conn: Rc<RefCell<Conn>>,
    id: u32,
    slots: Vec<ParamSlot>,
}

impl Drop for StmtInner {
    fn drop(&mut self) {
        // borrow can only fail while the session itself is being torn down
        if let Ok(mut conn) = self.conn.try_borrow_mut() {
            conn.close_statement(self.id);
        }
    }
}

/// A prepared statement. Parameter slots persist across executions until
/// overwritten, so a statement can be re-run with partial rebinds.
#[derive(Clone)]
pub struct Statement {
    inner: Rc<RefCell<StmtInner>>,
}

impl Statement {
    pub(crate) fn prepare(conn: Rc<RefCell<Conn>>, query: &str) -> Result<Statement> {
        if query.is_empty() {
            return Err(Error::Value(String::from("query string is empty")));
        }
        let (id, param_count) = {
            let mut c = conn.borrow_mut();
            c.send_command(COM_STMT_PREPARE, query.as_bytes())?;
            let payload = c.read_packet()?;
            match payload.first().copied() {
                Some(0x00) => {}
                Some(0xff) => {
                    let err = parse_err(&payload)?;
                    return Err(Error::Statement(c.record_error(err)));
                }
                _ => return Err(Error::malformed("unexpected prepare response")),
            }
            let mut b = ParseBuf(&payload[1..]);
            let id = b.eat_u32_le()?;
            let num_columns = b.eat_u16_le()? as usize;
            let num_params = b.eat_u16_le()? as usize;
            // filler and warning count trail only on the long form
            if !b.is_empty() {
                b.skip(1)?;
                let warnings = b.eat_u16_le()?;
                if warnings > 0 {
                    debug!("prepare reported {warnings} warning(s)");
                }
            }
            // the prepare-time column metadata is re-sent at execute time,
            // which is the copy the result set uses
            if num_params > 0 {
                c.read_columns(num_params, Error::Statement)?;
            }
            if num_columns > 0 {
                c.read_columns(num_columns, Error::Statement)?;
            }
            (id, num_params)
        };
        debug!("prepared statement {id}, {param_count} parameter(s)");
        Ok(Statement {
            inner: Rc::new(RefCell::new(StmtInner {
                conn,
                id,
                slots: vec![ParamSlot::vacant(); param_count],
            })),
        })
    }

    pub fn param_count(&self) -> usize {
        self.inner.borrow().slots.len()
    }

    fn set_slot(
        &self,
        index: usize,
        wire_type: ColumnType,
        unsigned: bool,
        value: ParamValue,
    ) -> Result<()> {
        assign_slot(
            &mut self.inner.borrow_mut().slots,
            index,
            wire_type,
            unsigned,
            value,
        )
    }

    pub fn set_i8(&self, index: usize, value: i8) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_TINY,
            false,
            ParamValue::Int(i64::from(value)),
        )
    }

    pub fn set_i16(&self, index: usize, value: i16) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_SHORT,
            false,
            ParamValue::Int(i64::from(value)),
        )
    }

    pub fn set_i32(&self, index: usize, value: i32) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_LONG,
            false,
            ParamValue::Int(i64::from(value)),
        )
    }

    pub fn set_i64(&self, index: usize, value: i64) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_LONGLONG,
            false,
            ParamValue::Int(value),
        )
    }

    pub fn set_u8(&self, index: usize, value: u8) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_TINY,
            true,
            ParamValue::UInt(u64::from(value)),
        )
    }

    pub fn set_u16(&self, index: usize, value: u16) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_SHORT,
            true,
            ParamValue::UInt(u64::from(value)),
        )
    }

    pub fn set_u32(&self, index: usize, value: u32) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_LONG,
            true,
            ParamValue::UInt(u64::from(value)),
        )
    }

    pub fn set_u64(&self, index: usize, value: u64) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_LONGLONG,
            true,
            ParamValue::UInt(value),
        )
    }

    pub fn set_f32(&self, index: usize, value: f32) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_FLOAT,
            false,
            ParamValue::Float(value),
        )
    }

    pub fn set_f64(&self, index: usize, value: f64) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_DOUBLE,
            false,
            ParamValue::Double(value),
        )
    }

    pub fn set_bool(&self, index: usize, value: bool) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_TINY,
            false,
            ParamValue::Int(i64::from(value)),
        )
    }

    pub fn set_date(&self, index: usize, value: Date) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_DATE,
            false,
            ParamValue::Date(value),
        )
    }

    pub fn set_time(&self, index: usize, value: Time) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_TIME,
            false,
            ParamValue::Time(value),
        )
    }

    pub fn set_datetime(&self, index: usize, value: DateTime) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_DATETIME,
            false,
            ParamValue::DateTime(value),
        )
    }

    pub fn set_str(&self, index: usize, value: &str) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_STRING,
            false,
            ParamValue::Bytes(value.as_bytes().to_vec()),
        )
    }

    /// Binds a string destined for an ENUM column.
    pub fn set_enum(&self, index: usize, value: &str) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_ENUM,
            false,
            ParamValue::Bytes(value.as_bytes().to_vec()),
        )
    }

    /// Binds a comma-joined string destined for a SET column.
    pub fn set_set(&self, index: usize, value: &str) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_SET,
            false,
            ParamValue::Bytes(value.as_bytes().to_vec()),
        )
    }

    pub fn set_bytes(&self, index: usize, value: &[u8]) -> Result<()> {
        self.set_slot(
            index,
            ColumnType::MYSQL_TYPE_BLOB,
            false,
            ParamValue::Bytes(value.to_vec()),
        )
    }

    pub fn set_null(&self, index: usize) -> Result<()> {
        self.set_slot(index, ColumnType::MYSQL_TYPE_NULL, false, ParamValue::Null)
    }

    fn send_execute(&self) -> Result<()> {
        let inner = self.inner.borrow();
        let body = encode_execute(inner.id, &inner.slots)?;
        let mut conn = inner.conn.borrow_mut();
        conn.send_command(COM_STMT_EXECUTE, &body)
    }

    /// Executes with the current bindings, drains every result with rows
    /// discarded, and returns the summed affected-row count.
    pub fn execute(&self) -> Result<u64> {
        self.send_execute()?;
        let inner = self.inner.borrow();
        let mut conn = inner.conn.borrow_mut();
        conn.drain_results(Error::Statement)
    }

    /// Executes and returns the auto-generated id the session reports once
    /// every result has been drained.
    pub fn insert(&self) -> Result<u64> {
        self.send_execute()?;
        let inner = self.inner.borrow();
        let mut conn = inner.conn.borrow_mut();
        conn.drain_results(Error::Statement)?;
        Ok(conn.last_insert_id)
    }

    /// Executes and materializes the first result set; further results in
    /// the batch are drained and discarded.
    pub fn query(&self) -> Result<ResultSet> {
        self.send_execute()?;
        let (columns, rows) = {
            let inner = self.inner.borrow();
            let mut conn = inner.conn.borrow_mut();
            match conn.read_response(Error::Statement)? {
                Response::ResultSet(n) => {
                    let columns = conn.read_columns(n, Error::Statement)?;
                    let (rows, eof) = conn.collect_rows(Error::Statement)?;
                    conn.drain_remaining(eof.more_results(), Error::Statement)?;
                    (columns, rows)
                }
                Response::Ok(ok) => {
                    conn.drain_remaining(ok.more_results(), Error::Statement)?;
                    let err = conn.record_error(ServerError::client(
                        cr::CR_NO_RESULT_SET,
                        "the statement returned no result set",
                    ));
                    return Err(Error::Statement(err));
                }
            }
        };
        ResultSet::bound(Rc::clone(&self.inner), columns, rows)
    }

    /// The most recent native diagnostic on the underlying session.
    pub fn last_error(&self) -> Option<ServerError> {
        self.inner.borrow().conn.borrow().last_error.clone()
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Statement")
                .field("id", &inner.id)
                .field("param_count", &inner.slots.len())
                .finish(),
            Err(_) => f.debug_struct("Statement").finish_non_exhaustive(),
        }
    }
}

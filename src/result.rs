//! Buffered result sets. Direct queries keep their rows in the text wire
//! format and convert on access; prepared-statement results decode each
//! fetched row into typed per-column slots.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::column::Column;
use crate::conn::Conn;
use crate::consts::ColumnType;
use crate::convert::{
    convert, date_to_epoch, datetime_to_epoch, parse_date_text, parse_datetime_text,
    parse_time_text, FromWire,
};
use crate::error::{Error, Result};
use crate::field::{Field, FieldId};
use crate::proto::codec::ParseBuf;
use crate::stmt::StmtInner;
use crate::temporal::{Date, DateTime, Time};

/// One decoded binary-protocol cell. Variable-length values live in the
/// slot's scratch buffer rather than in the variant.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CellValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Date(Date),
    Time(Time),
    DateTime(DateTime),
    Bytes,
}

/// Reusable per-column slot a fetched binary row is decoded into.
#[derive(Debug, Clone)]
pub(crate) struct ColumnSlot {
    value: CellValue,
    buf: Vec<u8>,
}

impl Default for ColumnSlot {
    fn default() -> ColumnSlot {
        ColumnSlot {
            value: CellValue::Null,
            buf: Vec::new(),
        }
    }
}

/// What pins the session open while this result (or a field on it) lives.
/// The handle inside is held, never read.
#[allow(dead_code)]
enum Owner {
    Session(Rc<RefCell<Conn>>),
    Statement(Rc<RefCell<StmtInner>>),
}

/// Cursor state for the current row, one arm per wire format.
enum RowData {
    /// Byte ranges of the current text row's cells, `None` for NULL.
    Text(Vec<Option<(usize, usize)>>),
    /// Decoded slots for the current binary row.
    Binary(Vec<ColumnSlot>),
}

pub(crate) struct ResultInner {
    _owner: Owner,
    columns: Vec<Column>,
    rows: Vec<Vec<u8>>,
    data: RowData,
    /// Row the next fetch loads.
    next_row: usize,
    /// Row currently loaded, meaningful only while `fetched` holds.
    current: usize,
    fetched: bool,
    name_cache: Option<HashMap<String, usize>>,
}

/// Splits a text-protocol row into per-cell byte ranges.
fn index_text_row(payload: &[u8], count: usize) -> Result<Vec<Option<(usize, usize)>>> {
    let mut cells = Vec::with_capacity(count);
    let mut pos = 0usize;
    for _ in 0..count {
        if payload.get(pos) == Some(&0xfb) {
            cells.push(None);
            pos += 1;
            continue;
        }
        let mut b = ParseBuf(&payload[pos..]);
        let before = b.len();
        let len = b.eat_lenenc_int()? as usize;
        let start = pos + (before - b.len());
        // start <= payload.len() holds here; len comes off the wire and
        // can be huge, so compare without forming start + len
        if len > payload.len() - start {
            return Err(Error::malformed("text row cell overruns its packet"));
        }
        cells.push(Some((start, len)));
        pos = start + len;
    }
    Ok(cells)
}

fn decode_date(b: &mut ParseBuf<'_>) -> Result<Date> {
    let len = usize::from(b.eat_u8()?);
    if len == 0 {
        return Ok(Date::default());
    }
    let mut p = ParseBuf(b.eat_bytes(len)?);
    Ok(Date::new(p.eat_u16_le()?, p.eat_u8()?, p.eat_u8()?))
}

fn decode_datetime(b: &mut ParseBuf<'_>) -> Result<DateTime> {
    let len = usize::from(b.eat_u8()?);
    if len == 0 {
        return Ok(DateTime::default());
    }
    let mut p = ParseBuf(b.eat_bytes(len)?);
    let mut dt = DateTime::new(p.eat_u16_le()?, p.eat_u8()?, p.eat_u8()?, 0, 0, 0);
    if len >= 7 {
        dt.hour = p.eat_u8()?;
        dt.minute = p.eat_u8()?;
        dt.second = p.eat_u8()?;
    }
    if len >= 11 {
        dt.micros = p.eat_u32_le()?;
    }
    Ok(dt)
}

fn decode_time(b: &mut ParseBuf<'_>) -> Result<Time> {
    let len = usize::from(b.eat_u8()?);
    if len == 0 {
        return Ok(Time::default());
    }
    let mut p = ParseBuf(b.eat_bytes(len)?);
    let negative = p.eat_u8()? != 0;
    let days = p.eat_u32_le()?;
    let mut t = Time::new(negative, days.saturating_mul(24), 0, 0);
    t.hours = t.hours.saturating_add(u32::from(p.eat_u8()?));
    t.minutes = p.eat_u8()?;
    t.seconds = p.eat_u8()?;
    if len >= 12 {
        t.micros = p.eat_u32_le()?;
    }
    Ok(t)
}

/// Decodes one binary-protocol row into the slots. The null bitmap starts
/// at bit offset 2.
fn decode_binary_row(payload: &[u8], columns: &[Column], slots: &mut [ColumnSlot]) -> Result<()> {
    let mut b = ParseBuf(payload);
    if b.eat_u8()? != 0 {
        return Err(Error::malformed("binary row header"));
    }
    let bitmap = b.eat_bytes((columns.len() + 9) / 8)?.to_vec();
    for (i, (col, slot)) in columns.iter().zip(slots.iter_mut()).enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            slot.value = CellValue::Null;
            slot.buf.clear();
            continue;
        }
        slot.value = decode_binary_value(&mut b, col, &mut slot.buf)?;
    }
    Ok(())
}

fn decode_binary_value(
    b: &mut ParseBuf<'_>,
    col: &Column,
    buf: &mut Vec<u8>,
) -> Result<CellValue> {
    use ColumnType::*;
    let unsigned = col.is_unsigned();
    Ok(match col.column_type() {
        MYSQL_TYPE_TINY => {
            let v = b.eat_u8()?;
            if unsigned {
                CellValue::UInt(u64::from(v))
            } else {
                CellValue::Int(i64::from(v as i8))
            }
        }
        MYSQL_TYPE_SHORT | MYSQL_TYPE_YEAR => {
            let v = b.eat_u16_le()?;
            if unsigned {
                CellValue::UInt(u64::from(v))
            } else {
                CellValue::Int(i64::from(v as i16))
            }
        }
        MYSQL_TYPE_LONG | MYSQL_TYPE_INT24 => {
            let v = b.eat_u32_le()?;
            if unsigned {
                CellValue::UInt(u64::from(v))
            } else {
                CellValue::Int(i64::from(v as i32))
            }
        }
        MYSQL_TYPE_LONGLONG => {
            let v = b.eat_u64_le()?;
            if unsigned {
                CellValue::UInt(v)
            } else {
                CellValue::Int(v as i64)
            }
        }
        MYSQL_TYPE_FLOAT => CellValue::Float(b.eat_f32_le()?),
        MYSQL_TYPE_DOUBLE => CellValue::Double(b.eat_f64_le()?),
        MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE => CellValue::Date(decode_date(b)?),
        MYSQL_TYPE_DATETIME | MYSQL_TYPE_TIMESTAMP => CellValue::DateTime(decode_datetime(b)?),
        MYSQL_TYPE_TIME => CellValue::Time(decode_time(b)?),
        _ => {
            let bytes = b.eat_lenenc_bytes()?;
            buf.clear();
            buf.extend_from_slice(bytes);
            CellValue::Bytes
        }
    })
}

/// Column-name lookup table. Plain names map to the first column wearing
/// them; `table.name` forms disambiguate, falling back to the real table
/// name when the query used no alias.
fn build_name_cache(columns: &[Column]) -> HashMap<String, usize> {
    let mut map = HashMap::with_capacity(columns.len() * 2);
    for (i, col) in columns.iter().enumerate() {
        map.entry(col.name().to_string()).or_insert(i);
        let table = if col.table().is_empty() {
            col.org_table()
        } else {
            col.table()
        };
        if !table.is_empty() {
            map.entry(format!("{}.{}", table, col.name())).or_insert(i);
        }
    }
    map
}

impl ResultInner {
    fn load_row(&mut self, index: usize) -> Result<()> {
        match &mut self.data {
            RowData::Text(cells) => {
                *cells = index_text_row(&self.rows[index], self.columns.len())?;
            }
            RowData::Binary(slots) => {
                decode_binary_row(&self.rows[index], &self.columns, slots)?;
            }
        }
        self.current = index;
        self.next_row = index + 1;
        self.fetched = true;
        Ok(())
    }

    fn name_index(&mut self, name: &str) -> Option<usize> {
        if self.name_cache.is_none() {
            self.name_cache = Some(build_name_cache(&self.columns));
        }
        self.name_cache.as_ref().and_then(|m| m.get(name).copied())
    }

    fn ensure_cell(&self, index: usize) -> Result<()> {
        if !self.fetched {
            return Err(Error::NoRow);
        }
        if index >= self.columns.len() {
            return Err(Error::IndexOutOfRange {
                index,
                count: self.columns.len(),
            });
        }
        Ok(())
    }

    /// Current-row cell bytes in direct mode, `None` for NULL.
    fn text_cell(&self, index: usize, cells: &[Option<(usize, usize)>]) -> Option<&[u8]> {
        cells[index].map(|(off, len)| &self.rows[self.current][off..off + len])
    }

    pub(crate) fn cell<T: FromWire>(&self, index: usize) -> Result<T> {
        self.ensure_cell(index)?;
        let tag = self.columns[index].column_type();
        match &self.data {
            RowData::Text(cells) => convert::<T>(self.text_cell(index, cells), tag),
            RowData::Binary(slots) => {
                let slot = &slots[index];
                let timestamp = tag == ColumnType::MYSQL_TYPE_TIMESTAMP;
                match &slot.value {
                    CellValue::Null => Ok(T::default()),
                    CellValue::Int(v) => Ok(T::from_i64(*v)),
                    CellValue::UInt(v) => Ok(T::from_u64(*v)),
                    CellValue::Float(v) => Ok(T::from_f64(f64::from(*v))),
                    CellValue::Double(v) => Ok(T::from_f64(*v)),
                    CellValue::Date(d) => Ok(T::from_i64(date_to_epoch(d, timestamp))),
                    CellValue::Time(t) => Ok(T::from_i64(t.total_seconds())),
                    CellValue::DateTime(dt) => Ok(T::from_i64(datetime_to_epoch(dt, timestamp))),
                    CellValue::Bytes => convert::<T>(Some(&slot.buf), tag),
                }
            }
        }
    }

    /// String form of the cell; NULL reads as the empty string.
    pub(crate) fn cell_str(&self, index: usize) -> Result<String> {
        self.ensure_cell(index)?;
        match &self.data {
            RowData::Text(cells) => Ok(self
                .text_cell(index, cells)
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .unwrap_or_default()),
            RowData::Binary(slots) => {
                let slot = &slots[index];
                Ok(match &slot.value {
                    CellValue::Null => String::new(),
                    CellValue::Int(v) => v.to_string(),
                    CellValue::UInt(v) => v.to_string(),
                    CellValue::Float(v) => v.to_string(),
                    CellValue::Double(v) => v.to_string(),
                    CellValue::Date(d) => d.to_string(),
                    CellValue::Time(t) => t.to_string(),
                    CellValue::DateTime(dt) => dt.to_string(),
                    CellValue::Bytes => String::from_utf8_lossy(&slot.buf).into_owned(),
                })
            }
        }
    }

    /// Raw cell bytes; scalar cells render through their string form.
    pub(crate) fn cell_bytes(&self, index: usize) -> Result<Vec<u8>> {
        self.ensure_cell(index)?;
        match &self.data {
            RowData::Text(cells) => Ok(self
                .text_cell(index, cells)
                .map(<[u8]>::to_vec)
                .unwrap_or_default()),
            RowData::Binary(slots) => {
                let slot = &slots[index];
                Ok(match &slot.value {
                    CellValue::Null => Vec::new(),
                    CellValue::Bytes => slot.buf.clone(),
                    _ => self.cell_str(index)?.into_bytes(),
                })
            }
        }
    }

    pub(crate) fn cell_date(&self, index: usize) -> Result<Date> {
        self.ensure_cell(index)?;
        let tag = self.columns[index].column_type();
        match &self.data {
            RowData::Text(cells) => Ok(self
                .text_cell(index, cells)
                .map(parse_date_text)
                .unwrap_or_default()),
            RowData::Binary(slots) => match &slots[index].value {
                CellValue::Null => Ok(Date::default()),
                CellValue::Date(d) => Ok(*d),
                CellValue::DateTime(dt) => Ok(dt.date()),
                CellValue::Bytes => Ok(parse_date_text(&slots[index].buf)),
                _ => Err(Error::Conversion {
                    from: tag,
                    to: "Date",
                }),
            },
        }
    }

    pub(crate) fn cell_time(&self, index: usize) -> Result<Time> {
        self.ensure_cell(index)?;
        let tag = self.columns[index].column_type();
        match &self.data {
            RowData::Text(cells) => Ok(self
                .text_cell(index, cells)
                .map(parse_time_text)
                .unwrap_or_default()),
            RowData::Binary(slots) => match &slots[index].value {
                CellValue::Null => Ok(Time::default()),
                CellValue::Time(t) => Ok(*t),
                CellValue::Bytes => Ok(parse_time_text(&slots[index].buf)),
                _ => Err(Error::Conversion {
                    from: tag,
                    to: "Time",
                }),
            },
        }
    }

    pub(crate) fn cell_datetime(&self, index: usize) -> Result<DateTime> {
        self.ensure_cell(index)?;
        let tag = self.columns[index].column_type();
        match &self.data {
            RowData::Text(cells) => Ok(self
                .text_cell(index, cells)
                .map(parse_datetime_text)
                .unwrap_or_default()),
            RowData::Binary(slots) => match &slots[index].value {
                CellValue::Null => Ok(DateTime::default()),
                CellValue::DateTime(dt) => Ok(*dt),
                CellValue::Date(d) => Ok(DateTime::from(*d)),
                CellValue::Bytes => Ok(parse_datetime_text(&slots[index].buf)),
                _ => Err(Error::Conversion {
                    from: tag,
                    to: "DateTime",
                }),
            },
        }
    }

    pub(crate) fn cell_is_null(&self, index: usize) -> Result<bool> {
        self.ensure_cell(index)?;
        match &self.data {
            RowData::Text(cells) => Ok(cells[index].is_none()),
            RowData::Binary(slots) => Ok(matches!(slots[index].value, CellValue::Null)),
        }
    }

    pub(crate) fn column(&self, index: usize) -> Result<Column> {
        if index >= self.columns.len() {
            return Err(Error::IndexOutOfRange {
                index,
                count: self.columns.len(),
            });
        }
        Ok(self.columns[index].clone())
    }
}

/// A fully buffered result set with a movable row cursor. Cloning shares
/// the buffer; the handle keeps its originating session alive.
#[derive(Clone)]
pub struct ResultSet {
    inner: Rc<RefCell<ResultInner>>,
}

impl ResultSet {
    /// Sentinel `field_index` returns for names no column wears.
    pub const NOT_FOUND: usize = usize::MAX;

    pub(crate) fn direct(
        conn: Rc<RefCell<Conn>>,
        mut columns: Vec<Column>,
        rows: Vec<Vec<u8>>,
    ) -> Result<ResultSet> {
        let mut max_lens = vec![0usize; columns.len()];
        for row in &rows {
            let cells = index_text_row(row, columns.len())?;
            for (len_slot, cell) in max_lens.iter_mut().zip(&cells) {
                if let Some((_, len)) = cell {
                    *len_slot = (*len_slot).max(*len);
                }
            }
        }
        for (col, &len) in columns.iter_mut().zip(&max_lens) {
            col.max_len = len;
        }
        let data = RowData::Text(vec![None; columns.len()]);
        Ok(ResultSet {
            inner: Rc::new(RefCell::new(ResultInner {
                _owner: Owner::Session(conn),
                columns,
                rows,
                data,
                next_row: 0,
                current: 0,
                fetched: false,
                name_cache: None,
            })),
        })
    }

    pub(crate) fn bound(
        stmt: Rc<RefCell<StmtInner>>,
        mut columns: Vec<Column>,
        rows: Vec<Vec<u8>>,
    ) -> Result<ResultSet> {
        // one decode pass validates every row and sizes the scratch buffers
        let mut scratch: Vec<ColumnSlot> = vec![ColumnSlot::default(); columns.len()];
        let mut max_lens = vec![0usize; columns.len()];
        for row in &rows {
            decode_binary_row(row, &columns, &mut scratch)?;
            for (len_slot, slot) in max_lens.iter_mut().zip(&scratch) {
                if matches!(slot.value, CellValue::Bytes) {
                    *len_slot = (*len_slot).max(slot.buf.len());
                }
            }
        }
        for (col, &len) in columns.iter_mut().zip(&max_lens) {
            col.max_len = len;
        }
        let slots = max_lens
            .iter()
            .map(|&len| ColumnSlot {
                value: CellValue::Null,
                buf: Vec::with_capacity(len),
            })
            .collect();
        Ok(ResultSet {
            inner: Rc::new(RefCell::new(ResultInner {
                _owner: Owner::Statement(stmt),
                columns,
                rows,
                data: RowData::Binary(slots),
                next_row: 0,
                current: 0,
                fetched: false,
                name_cache: None,
            })),
        })
    }

    /// Advances to the next row. `Ok(false)` past the last row, after
    /// which no current row is readable.
    pub fn next(&self) -> Result<bool> {
        let mut inner = self.inner.borrow_mut();
        if inner.next_row >= inner.rows.len() {
            inner.fetched = false;
            return Ok(false);
        }
        let target = inner.next_row;
        inner.load_row(target)?;
        Ok(true)
    }

    /// Jumps the cursor so that row `index` becomes current. Out-of-range
    /// indexes return `Ok(false)` and leave the cursor untouched.
    pub fn set_row_index(&self, index: u64) -> Result<bool> {
        let mut inner = self.inner.borrow_mut();
        let target = usize::try_from(index).unwrap_or(usize::MAX);
        if target >= inner.rows.len() {
            return Ok(false);
        }
        inner.load_row(target)?;
        Ok(true)
    }

    /// Index of the current row, `None` before the first fetch.
    pub fn row_index(&self) -> Option<u64> {
        let inner = self.inner.borrow();
        inner.fetched.then(|| inner.current as u64)
    }

    pub fn row_count(&self) -> u64 {
        self.inner.borrow().rows.len() as u64
    }

    pub fn column_count(&self) -> usize {
        self.inner.borrow().columns.len()
    }

    pub fn columns(&self) -> Vec<Column> {
        self.inner.borrow().columns.clone()
    }

    /// Resolves a column name (plain or `table.name`) to its index, or
    /// [`ResultSet::NOT_FOUND`]. Duplicate names resolve to the first
    /// column wearing them.
    pub fn field_index(&self, name: &str) -> usize {
        self.inner
            .borrow_mut()
            .name_index(name)
            .unwrap_or(ResultSet::NOT_FOUND)
    }

    /// A field handle by index or by name. Resolution failures surface on
    /// first access, not here.
    pub fn field<'a>(&self, id: impl Into<FieldId<'a>>) -> Field {
        let index = match id.into() {
            FieldId::Index(i) => i,
            FieldId::Name(name) => self.field_index(name),
        };
        Field::new(self.clone(), index)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.inner
            .borrow()
            .columns
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn fields(&self) -> Vec<Field> {
        (0..self.column_count())
            .map(|i| Field::new(self.clone(), i))
            .collect()
    }

    /// One field per distinct plain column name, first occurrence winning.
    pub fn fields_by_name(&self) -> HashMap<String, Field> {
        let mut map = HashMap::new();
        for (i, name) in self.field_names().into_iter().enumerate() {
            map.entry(name).or_insert_with(|| Field::new(self.clone(), i));
        }
        map
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&ResultInner) -> R) -> R {
        f(&self.inner.borrow())
    }
}

impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("ResultSet")
                .field("column_count", &inner.columns.len())
                .field("row_count", &inner.rows.len())
                .field("row_index", &inner.fetched.then_some(inner.current))
                .finish(),
            Err(_) => f.debug_struct("ResultSet").finish_non_exhaustive(),
        }
    }
}

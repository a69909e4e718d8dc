//! Field handles: one column of a result set's current row, read through
//! the conversion matrix.

use crate::column::Column;
use crate::consts::ColumnType;
use crate::convert::FromWire;
use crate::error::Result;
use crate::result::ResultSet;
use crate::temporal::{Date, DateTime, Time};

/// Identifies a column by position or by (possibly `table.`-qualified)
/// name.
#[derive(Debug, Clone, Copy)]
pub enum FieldId<'a> {
    Index(usize),
    Name(&'a str),
}

impl From<usize> for FieldId<'static> {
    fn from(index: usize) -> FieldId<'static> {
        FieldId::Index(index)
    }
}

impl<'a> From<&'a str> for FieldId<'a> {
    fn from(name: &'a str) -> FieldId<'a> {
        FieldId::Name(name)
    }
}

/// A column bound to its result set. The handle stays valid as the cursor
/// moves; reads always see the current row. A handle created from an
/// unknown name reports the failure on first read.
#[derive(Clone)]
pub struct Field {
    set: ResultSet,
    index: usize,
}

impl Field {
    pub(crate) fn new(set: ResultSet, index: usize) -> Field {
        Field { set, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Typed read of the current row's cell.
    pub fn get<T: FromWire>(&self) -> Result<T> {
        self.set.with_inner(|inner| inner.cell::<T>(self.index))
    }

    pub fn get_i8(&self) -> Result<i8> {
        self.get()
    }

    pub fn get_i16(&self) -> Result<i16> {
        self.get()
    }

    pub fn get_i32(&self) -> Result<i32> {
        self.get()
    }

    pub fn get_i64(&self) -> Result<i64> {
        self.get()
    }

    pub fn get_u8(&self) -> Result<u8> {
        self.get()
    }

    pub fn get_u16(&self) -> Result<u16> {
        self.get()
    }

    pub fn get_u32(&self) -> Result<u32> {
        self.get()
    }

    pub fn get_u64(&self) -> Result<u64> {
        self.get()
    }

    pub fn get_f32(&self) -> Result<f32> {
        self.get()
    }

    pub fn get_f64(&self) -> Result<f64> {
        self.get()
    }

    pub fn get_bool(&self) -> Result<bool> {
        self.get()
    }

    /// String form of the cell; NULL reads as the empty string.
    pub fn get_str(&self) -> Result<String> {
        self.set.with_inner(|inner| inner.cell_str(self.index))
    }

    /// Raw cell bytes; NULL reads as an empty buffer.
    pub fn get_bytes(&self) -> Result<Vec<u8>> {
        self.set.with_inner(|inner| inner.cell_bytes(self.index))
    }

    pub fn get_date(&self) -> Result<Date> {
        self.set.with_inner(|inner| inner.cell_date(self.index))
    }

    pub fn get_time(&self) -> Result<Time> {
        self.set.with_inner(|inner| inner.cell_time(self.index))
    }

    pub fn get_datetime(&self) -> Result<DateTime> {
        self.set.with_inner(|inner| inner.cell_datetime(self.index))
    }

    pub fn is_null(&self) -> Result<bool> {
        self.set.with_inner(|inner| inner.cell_is_null(self.index))
    }

    /// Metadata for this column.
    pub fn column(&self) -> Result<Column> {
        self.set.with_inner(|inner| inner.column(self.index))
    }

    pub fn name(&self) -> Result<String> {
        self.column().map(|c| c.name().to_string())
    }

    pub fn column_type(&self) -> Result<ColumnType> {
        self.column().map(|c| c.column_type())
    }
}

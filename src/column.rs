//! Column metadata as reported by column definition packets.

use crate::consts::{ColumnFlags, ColumnType};

/// One column of a result set (or prepared-statement metadata).
#[derive(Debug, Clone)]
pub struct Column {
    pub(crate) schema: String,
    pub(crate) table: String,
    pub(crate) org_table: String,
    pub(crate) name: String,
    pub(crate) org_name: String,
    pub(crate) charset: u16,
    pub(crate) length: u32,
    pub(crate) column_type: ColumnType,
    pub(crate) flags: ColumnFlags,
    pub(crate) decimals: u8,
    /// Largest value length observed while the result was buffered; sizes
    /// bound-mode scratch buffers.
    pub(crate) max_len: usize,
}

impl Column {
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Table alias in effect for the query, empty for computed columns.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Unaliased table name, when the server reports one.
    pub fn org_table(&self) -> &str {
        &self.org_table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn org_name(&self) -> &str {
        &self.org_name
    }

    pub fn charset(&self) -> u16 {
        self.charset
    }

    /// Declared display width from the column definition.
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn flags(&self) -> ColumnFlags {
        self.flags
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    /// Largest cell length observed when the result was buffered. Zero for
    /// prepare-time metadata, which precedes any rows.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags.contains(ColumnFlags::UNSIGNED_FLAG)
    }

    pub fn is_not_null(&self) -> bool {
        self.flags.contains(ColumnFlags::NOT_NULL_FLAG)
    }
}

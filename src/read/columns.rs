//! In-flight column state during a CSV read.
//!
//! Each input column carries its current parse type, bump flags, and output
//! buffers. The collection is resized only under the reader's shared mutex
//! held exclusively; the parallel data path writes into disjoint row ranges
//! of the buffers while holding it in shared mode.

use std::sync::Arc;

use crate::buffer::{Buffer, MemoryWritableBuffer, WritableBuffer};
use crate::column::storage::str_pos;
use crate::column::{SType, StorageColumn};
use crate::error::DtResult;
use crate::read::parsers::PT;

pub struct ReadColumn {
    pub name: String,
    pub pt: PT,
    /// Parser was widened after output had been written; the column's
    /// storage must be rebuilt in a second pass.
    pub type_bumped: bool,
    /// Excluded columns (deselected by the caller) are parsed over but never
    /// written out.
    pub present_in_output: bool,
    /// Whether the column occupies a slot in thread buffers this pass.
    pub present_in_buffer: bool,
    pub databuf: Buffer,
    pub strbuf: Option<Arc<MemoryWritableBuffer>>,
}

impl ReadColumn {
    pub fn new(name: String) -> Self {
        ReadColumn {
            name,
            pt: PT::Mu,
            type_bumped: false,
            present_in_output: true,
            present_in_buffer: true,
            databuf: Buffer::new(),
            strbuf: None,
        }
    }

    pub fn stype(&self) -> SType {
        self.pt.stype()
    }

    pub fn is_string(&self) -> bool {
        self.pt.is_string()
    }

    pub fn elemsize(&self) -> usize {
        self.pt.elemsize()
    }

    /// Allocate (or grow) output storage for `nrows` rows. String columns
    /// hold `nrows + 1` offsets, with entry 0 pinned to zero.
    pub fn allocate(&mut self, nrows: usize) -> DtResult<()> {
        if !self.present_in_output || self.pt == PT::Mu {
            return Ok(());
        }
        let is_str = self.is_string();
        let newsize = (nrows + is_str as usize) * self.elemsize();
        self.databuf.resize(newsize)?;
        if is_str {
            match self.pt {
                PT::Str32 => self.databuf.set_element::<i32>(0, 0)?,
                _ => self.databuf.set_element::<i64>(0, 0)?,
            }
            if self.strbuf.is_none() {
                self.strbuf = Some(Arc::new(MemoryWritableBuffer::new(nrows * 8)));
            }
        }
        Ok(())
    }

    /// Reset storage for a reread pass under a new parse type.
    pub fn reset_for_reread(&mut self, nrows: usize) -> DtResult<()> {
        self.type_bumped = false;
        self.databuf = Buffer::new();
        self.strbuf = None;
        self.allocate(nrows)
    }

    /// Convert the filled column into frame storage of exactly `nrows` rows.
    pub fn into_storage(mut self, nrows: usize) -> DtResult<StorageColumn> {
        if self.pt == PT::Mu {
            return Ok(StorageColumn::void(nrows));
        }
        let stype = self.stype();
        if self.is_string() {
            self.databuf.resize((nrows + 1) * self.elemsize())?;
            let strdata = match self.strbuf.take() {
                Some(wb) => {
                    let mut wb = Arc::try_unwrap(wb)
                        .unwrap_or_else(|_| unreachable!("strbuf uniquely held at finish"));
                    wb.finalize()?
                }
                None => Buffer::new(),
            };
            StorageColumn::from_buffers(stype, nrows, self.databuf, Some(strdata))
        } else {
            self.databuf.resize(nrows * self.elemsize())?;
            StorageColumn::from_buffers(stype, nrows, self.databuf, None)
        }
    }

    /// Byte offset of the string data end after `row` rows were written.
    pub fn str_data_end(&self, row: usize) -> usize {
        match self.pt {
            PT::Str32 => str_pos(self.databuf.get_element::<i32>(row) as i64),
            _ => str_pos(self.databuf.get_element::<i64>(row)),
        }
    }
}

/// The ordered set of read columns.
pub struct ReadColumns {
    pub cols: Vec<ReadColumn>,
    pub nrows_allocated: usize,
}

impl ReadColumns {
    pub fn new(names: Vec<String>) -> Self {
        ReadColumns {
            cols: names.into_iter().map(ReadColumn::new).collect(),
            nrows_allocated: 0,
        }
    }

    pub fn ncols(&self) -> usize {
        self.cols.len()
    }

    /// Number of columns with a slot in thread buffers.
    pub fn n_in_buffer(&self) -> usize {
        self.cols.iter().filter(|c| c.present_in_buffer).count()
    }

    pub fn allocate(&mut self, nrows: usize) -> DtResult<()> {
        for col in &mut self.cols {
            if col.present_in_buffer {
                col.allocate(nrows)?;
            }
        }
        self.nrows_allocated = nrows;
        Ok(())
    }

    pub fn any_reread_needed(&self) -> bool {
        // a deselected column is parsed over but never stored, so its bump
        // needs no second pass
        self.cols
            .iter()
            .any(|c| c.type_bumped && c.present_in_output)
    }
}

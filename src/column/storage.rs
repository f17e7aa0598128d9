//! Materialized columns backed by buffers.

use crate::buffer::Buffer;
use crate::column::stats::StatsCache;
use crate::column::stype::{Element, SType};
use crate::error::{DtError, DtResult};

/// A materialized, typed sequence of values.
///
/// For fixed-width stypes `data` holds `nrows` elements. For string stypes
/// `data` holds `nrows + 1` signed offsets into `strdata`: entry 0 is zero,
/// and element `i` spans bytes `off[i] .. off[i+1]`. A negative `off[i+1]`
/// marks element `i` as NA; its value is `-(pos) - 1` where `pos` is the
/// running byte offset, so later elements remain addressable (the bias keeps
/// an NA at position 0 representable).
pub struct StorageColumn {
    stype: SType,
    nrows: usize,
    data: Buffer,
    strdata: Option<Buffer>,
    stats: StatsCache,
}

impl Clone for StorageColumn {
    fn clone(&self) -> Self {
        StorageColumn {
            stype: self.stype,
            nrows: self.nrows,
            data: self.data.clone(),
            strdata: self.strdata.clone(),
            stats: StatsCache::new(),
        }
    }
}

impl StorageColumn {
    /// Column over pre-built buffers. Validates buffer sizes against `nrows`.
    pub fn from_buffers(
        stype: SType,
        nrows: usize,
        data: Buffer,
        strdata: Option<Buffer>,
    ) -> DtResult<Self> {
        match stype {
            SType::Void => {}
            s if s.is_string() => {
                let need = (nrows + 1) * s.elemsize();
                if data.len() < need {
                    return Err(DtError::value_error(format!(
                        "string column of {nrows} rows requires {need} offset bytes, got {}",
                        data.len()
                    )));
                }
                if strdata.is_none() {
                    return Err(DtError::value_error("string column lacks a strdata buffer"));
                }
            }
            s => {
                let need = nrows * s.elemsize();
                if data.len() < need {
                    return Err(DtError::value_error(format!(
                        "column of {nrows} {s} rows requires {need} bytes, got {}",
                        data.len()
                    )));
                }
            }
        }
        Ok(StorageColumn {
            stype,
            nrows,
            data,
            strdata,
            stats: StatsCache::new(),
        })
    }

    /// All-NA column of `nrows` rows with no storage.
    pub fn void(nrows: usize) -> Self {
        StorageColumn {
            stype: SType::Void,
            nrows,
            data: Buffer::new(),
            strdata: None,
            stats: StatsCache::new(),
        }
    }

    /// Fixed-width column from optional values; `None` becomes the NA
    /// sentinel of `T`.
    pub fn from_values<T: Element>(values: &[Option<T>]) -> Self {
        let mut data = Buffer::with_len(values.len() * size_of::<T>()).expect("allocation");
        {
            let slice = data.as_slice_mut::<T>().expect("fresh buffer");
            for (dst, v) in slice.iter_mut().zip(values) {
                *dst = v.unwrap_or_else(T::na);
            }
        }
        StorageColumn {
            stype: T::STYPE,
            nrows: values.len(),
            data,
            strdata: None,
            stats: StatsCache::new(),
        }
    }

    /// Bool8 column: values 0/1 stored as `i8`, NA as `i8::MIN`.
    pub fn from_bools(values: &[Option<bool>]) -> Self {
        let mut col = Self::from_values::<i8>(
            &values
                .iter()
                .map(|v| v.map(|b| b as i8))
                .collect::<Vec<_>>(),
        );
        col.stype = SType::Bool8;
        col
    }

    /// Str32 column from optional strings.
    pub fn from_strs<S: AsRef<str>>(values: &[Option<S>]) -> Self {
        let nrows = values.len();
        let mut bytes = Vec::new();
        let mut offsets = Vec::with_capacity(nrows + 1);
        offsets.push(0i32);
        for v in values {
            match v {
                Some(s) => {
                    bytes.extend_from_slice(s.as_ref().as_bytes());
                    offsets.push(bytes.len() as i32);
                }
                None => offsets.push(-(bytes.len() as i32) - 1),
            }
        }
        let data = Buffer::from_bytes(bytemuck::cast_slice(&offsets));
        let strdata = Buffer::from_bytes(&bytes);
        StorageColumn {
            stype: SType::Str32,
            nrows,
            data,
            strdata: Some(strdata),
            stats: StatsCache::new(),
        }
    }

    pub fn stype(&self) -> SType {
        self.stype
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn data(&self) -> &Buffer {
        &self.data
    }

    pub fn strdata(&self) -> Option<&Buffer> {
        self.strdata.as_ref()
    }

    pub fn stats_cache(&self) -> &StatsCache {
        &self.stats
    }

    /// Fixed-width element access. `T` must match the column's stype width
    /// and family (Bool8 reads as `i8`).
    pub fn get<T: Element>(&self, i: usize) -> Option<T> {
        debug_assert!(i < self.nrows);
        debug_assert_eq!(size_of::<T>(), self.stype.elemsize());
        let v = self.data.get_element::<T>(i);
        (!v.is_na()).then_some(v)
    }

    /// String element access.
    pub fn get_str(&self, i: usize) -> Option<&str> {
        debug_assert!(i < self.nrows);
        let (start, end) = match self.stype {
            SType::Str32 => {
                let offs = self.data.as_slice::<i32>();
                let end = offs[i + 1];
                if end < 0 {
                    return None;
                }
                (str_pos(offs[i] as i64), end as usize)
            }
            SType::Str64 => {
                let offs = self.data.as_slice::<i64>();
                let end = offs[i + 1];
                if end < 0 {
                    return None;
                }
                (str_pos(offs[i]), end as usize)
            }
            _ => unreachable!("get_str on a non-string column"),
        };
        let bytes = &self.strdata.as_ref().expect("strdata").as_bytes()[start..end];
        // Column construction only ever stores valid UTF-8.
        Some(std::str::from_utf8(bytes).expect("column holds valid UTF-8"))
    }

    /// Truncate or NA-extend to `nrows` rows. Invalidates cached stats.
    pub fn set_nrows(&mut self, nrows: usize) -> DtResult<()> {
        self.stats.invalidate();
        if nrows == self.nrows {
            return Ok(());
        }
        if self.stype == SType::Void {
            self.nrows = nrows;
            return Ok(());
        }
        if self.stype.is_string() {
            let old = self.nrows;
            self.data.resize((nrows + 1) * self.stype.elemsize())?;
            if nrows > old {
                // new rows are NA: negative (biased) running offset
                match self.stype {
                    SType::Str32 => {
                        let offs = self.data.as_slice_mut::<i32>()?;
                        let na = -(str_pos(offs[old] as i64) as i32) - 1;
                        for o in offs[old + 1..].iter_mut() {
                            *o = na;
                        }
                    }
                    _ => {
                        let offs = self.data.as_slice_mut::<i64>()?;
                        let na = -(str_pos(offs[old]) as i64) - 1;
                        for o in offs[old + 1..].iter_mut() {
                            *o = na;
                        }
                    }
                }
            }
        } else {
            let old = self.nrows;
            self.data.resize(nrows * self.stype.elemsize())?;
            if nrows > old {
                fill_na(&mut self.data, self.stype, old, nrows)?;
            }
        }
        self.nrows = nrows;
        Ok(())
    }
}

/// Running byte position encoded in a (possibly NA-marked) string offset.
pub(crate) fn str_pos(off: i64) -> usize {
    if off < 0 { (-off - 1) as usize } else { off as usize }
}

fn fill_na(data: &mut Buffer, stype: SType, from: usize, to: usize) -> DtResult<()> {
    match stype {
        SType::Bool8 | SType::Int8 => {
            data.as_slice_mut::<i8>()?[from..to].fill(i8::na());
        }
        SType::Int16 => data.as_slice_mut::<i16>()?[from..to].fill(i16::na()),
        SType::Int32 => data.as_slice_mut::<i32>()?[from..to].fill(i32::na()),
        SType::Int64 => data.as_slice_mut::<i64>()?[from..to].fill(i64::na()),
        SType::Float32 => data.as_slice_mut::<f32>()?[from..to].fill(f32::na()),
        SType::Float64 => data.as_slice_mut::<f64>()?[from..to].fill(f64::na()),
        _ => {}
    }
    Ok(())
}

/// Byte-level vertical concatenation of same-typed storage columns.
pub fn concat_storage(stype: SType, parts: &[StorageColumn]) -> DtResult<StorageColumn> {
    debug_assert!(parts.iter().all(|p| p.stype() == stype));
    let nrows: usize = parts.iter().map(|p| p.nrows()).sum();
    if stype == SType::Void {
        return Ok(StorageColumn::void(nrows));
    }
    if !stype.is_string() {
        let mut data = Buffer::with_len(nrows * stype.elemsize())?;
        let mut at = 0;
        {
            let out = data.as_slice_mut::<u8>()?;
            for p in parts {
                let nbytes = p.nrows() * stype.elemsize();
                out[at..at + nbytes].copy_from_slice(&p.data().as_bytes()[..nbytes]);
                at += nbytes;
            }
        }
        return StorageColumn::from_buffers(stype, nrows, data, None);
    }
    // Strings: rebuild the running offsets, rebasing each part.
    let total_bytes: usize = parts
        .iter()
        .map(|p| p.strdata().map_or(0, |b| b.len()))
        .sum();
    let mut bytes = Vec::with_capacity(total_bytes);
    let mut offsets64: Vec<i64> = Vec::with_capacity(nrows + 1);
    offsets64.push(0);
    for p in parts {
        for i in 0..p.nrows() {
            match p.get_str(i) {
                Some(s) => {
                    bytes.extend_from_slice(s.as_bytes());
                    offsets64.push(bytes.len() as i64);
                }
                None => offsets64.push(-(bytes.len() as i64) - 1),
            }
        }
    }
    let strdata = Buffer::from_bytes(&bytes);
    let data = match stype {
        SType::Str32 => {
            if bytes.len() > i32::MAX as usize {
                return Err(DtError::OverflowError(
                    "str32 column exceeds 2GB of string data; use str64".into(),
                ));
            }
            let offs32: Vec<i32> = offsets64.iter().map(|&o| o as i32).collect();
            Buffer::from_bytes(bytemuck::cast_slice(&offs32))
        }
        _ => Buffer::from_bytes(bytemuck::cast_slice(&offsets64)),
    };
    StorageColumn::from_buffers(stype, nrows, data, Some(strdata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_na() {
        let col = StorageColumn::from_values::<i32>(&[Some(1), None, Some(3)]);
        assert_eq!(col.nrows(), 3);
        assert_eq!(col.get::<i32>(0), Some(1));
        assert_eq!(col.get::<i32>(1), None);
        assert_eq!(col.get::<i32>(2), Some(3));
    }

    #[test]
    fn test_string_offsets() {
        let col = StorageColumn::from_strs(&[Some("a"), Some(""), None, Some("ccc")]);
        assert_eq!(col.get_str(0), Some("a"));
        assert_eq!(col.get_str(1), Some(""));
        assert_eq!(col.get_str(2), None);
        assert_eq!(col.get_str(3), Some("ccc"));
        // NA keeps the running offset, negated with a bias of one
        let offs = col.data().as_slice::<i32>();
        assert_eq!(offs, &[0, 1, 1, -2, 4]);
    }

    #[test]
    fn test_set_nrows_truncate_and_extend() {
        let mut col = StorageColumn::from_values::<i64>(&[Some(1), Some(2), Some(3)]);
        col.set_nrows(2).unwrap();
        assert_eq!(col.nrows(), 2);
        col.set_nrows(4).unwrap();
        assert_eq!(col.get::<i64>(1), Some(2));
        assert_eq!(col.get::<i64>(3), None);
    }

    #[test]
    fn test_concat_fixed() {
        let a = StorageColumn::from_values::<i32>(&[Some(1), None]);
        let b = StorageColumn::from_values::<i32>(&[Some(3)]);
        let c = concat_storage(SType::Int32, &[a, b]).unwrap();
        assert_eq!(c.nrows(), 3);
        assert_eq!(c.get::<i32>(2), Some(3));
        assert_eq!(c.get::<i32>(1), None);
    }

    #[test]
    fn test_concat_strings() {
        let a = StorageColumn::from_strs(&[Some("x"), None]);
        let b = StorageColumn::from_strs(&[Some("yz")]);
        let c = concat_storage(SType::Str32, &[a, b]).unwrap();
        assert_eq!(c.get_str(0), Some("x"));
        assert_eq!(c.get_str(1), None);
        assert_eq!(c.get_str(2), Some("yz"));
    }
}

//! The Jay binary frame format.
//!
//! Layout: an 8-byte header `"JAY1\0\0\0\0"`, then each column's buffers
//! (data, then string data when present) aligned to 8 bytes, then a
//! self-describing metadata record, its byte size in the 8 bytes preceding
//! the trailer, and the 8-byte trailer `"\0\0\0\0" + "1JAY"` (the `"JAY1"`
//! suffix variant is also accepted on read). Opening a Jay file memory-maps
//! it; column buffers are views into the mapping, so nothing is copied.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::column::stats::{StatValue, Stats};
use crate::column::{Column, SType, StorageColumn};
use crate::error::{DtError, DtResult};
use crate::frame::Frame;

const HEADER: &[u8; 8] = b"JAY1\0\0\0\0";
const TRAILER_1JAY: &[u8; 8] = b"\0\0\0\x001JAY";
const TRAILER_JAY1: &[u8; 8] = b"\0\0\0\0JAY1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum JayType {
    Bool8,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Str32,
    Str64,
}

impl JayType {
    fn from_stype(stype: SType) -> Option<JayType> {
        Some(match stype {
            SType::Bool8 => JayType::Bool8,
            SType::Int8 => JayType::Int8,
            SType::Int16 => JayType::Int16,
            SType::Int32 => JayType::Int32,
            SType::Int64 => JayType::Int64,
            SType::Float32 => JayType::Float32,
            SType::Float64 => JayType::Float64,
            SType::Str32 => JayType::Str32,
            SType::Str64 => JayType::Str64,
            SType::Void => return None,
        })
    }

    fn stype(self) -> SType {
        match self {
            JayType::Bool8 => SType::Bool8,
            JayType::Int8 => SType::Int8,
            JayType::Int16 => SType::Int16,
            JayType::Int32 => SType::Int32,
            JayType::Int64 => SType::Int64,
            JayType::Float32 => SType::Float32,
            JayType::Float64 => SType::Float64,
            JayType::Str32 => SType::Str32,
            JayType::Str64 => SType::Str64,
        }
    }
}

/// `(offset, length)` of a buffer within the payload (relative to the end
/// of the file header).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct JayBufferRef {
    offset: u64,
    length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JayStats {
    nullcount: u64,
    min_int: Option<i64>,
    max_int: Option<i64>,
    min_float: Option<f64>,
    max_float: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JayColumnMeta {
    name: String,
    jtype: JayType,
    data: JayBufferRef,
    strdata: Option<JayBufferRef>,
    stats: Option<JayStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JayMeta {
    nrows: u64,
    nkeys: u64,
    columns: Vec<JayColumnMeta>,
}

struct PayloadWriter<W: Write> {
    out: W,
    /// Bytes written past the header.
    pos: u64,
}

impl<W: Write> PayloadWriter<W> {
    /// Write one buffer 8-byte-aligned, returning its payload reference.
    fn write_buffer(&mut self, bytes: &[u8]) -> DtResult<JayBufferRef> {
        let misalign = (self.pos % 8) as usize;
        if misalign != 0 {
            let pad = [0u8; 8];
            self.out.write_all(&pad[..8 - misalign])?;
            self.pos += (8 - misalign) as u64;
        }
        let offset = self.pos;
        self.out.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(JayBufferRef {
            offset,
            length: bytes.len() as u64,
        })
    }
}

fn stats_to_jay(stats: &Stats) -> JayStats {
    let (min_int, min_float) = match stats.min {
        Some(StatValue::Int(v)) => (Some(v), None),
        Some(StatValue::Float(v)) => (None, Some(v)),
        None => (None, None),
    };
    let (max_int, max_float) = match stats.max {
        Some(StatValue::Int(v)) => (Some(v), None),
        Some(StatValue::Float(v)) => (None, Some(v)),
        None => (None, None),
    };
    JayStats {
        nullcount: stats.nullcount,
        min_int,
        max_int,
        min_float,
        max_float,
    }
}

fn stats_from_jay(js: &JayStats) -> Stats {
    Stats {
        nullcount: js.nullcount,
        min: js
            .min_int
            .map(StatValue::Int)
            .or(js.min_float.map(StatValue::Float)),
        max: js
            .max_int
            .map(StatValue::Int)
            .or(js.max_float.map(StatValue::Float)),
        ..Stats::default()
    }
}

/// Serialize `frame` into a Jay file at `path`.
pub fn save_jay(frame: &Frame, path: &Path) -> DtResult<()> {
    let file = std::fs::File::create(path)?;
    let mut out = std::io::BufWriter::new(file);
    out.write_all(HEADER)?;
    let mut payload = PayloadWriter { out, pos: 0 };

    let mut col_metas = Vec::with_capacity(frame.ncols());
    for (name, col) in frame.names().iter().zip(frame.columns()) {
        // Void columns have no Jay representation; store them as all-NA bools.
        let storage = if col.stype() == SType::Void {
            Column::const_na(SType::Bool8, col.nrows()).materialize()?
        } else {
            col.materialize()?
        };
        let jtype = JayType::from_stype(storage.stype()).expect("void handled above");
        let data = payload.write_buffer(storage.data().as_bytes())?;
        let strdata = match storage.strdata() {
            Some(b) => Some(payload.write_buffer(b.as_bytes())?),
            None => None,
        };
        // persist stats already computed on the source column
        let stats = match col {
            Column::Storage(c) => c.stats_cache().get().map(|s| stats_to_jay(&s)),
            _ => None,
        };
        col_metas.push(JayColumnMeta {
            name: name.clone(),
            jtype,
            data,
            strdata,
            stats,
        });
    }

    let meta = JayMeta {
        nrows: frame.nrows() as u64,
        nkeys: frame.nkeys() as u64,
        columns: col_metas,
    };
    let meta_bytes =
        bincode::serialize(&meta).map_err(|e| DtError::InvalidFormat(e.to_string()))?;
    payload.out.write_all(&meta_bytes)?;
    payload
        .out
        .write_all(&(meta_bytes.len() as u64).to_le_bytes())?;
    payload.out.write_all(TRAILER_1JAY)?;
    payload.out.flush()?;
    Ok(())
}

/// Open a Jay file as a frame. Column buffers are views into the mapping.
pub fn open_jay(path: &Path) -> DtResult<Frame> {
    let buf = Buffer::mmap(path)?;
    open_jay_buffer(buf)
}

pub fn open_jay_buffer(buf: Buffer) -> DtResult<Frame> {
    let len = buf.len();
    if len < 24 {
        return Err(DtError::InvalidFormat(format!(
            "invalid Jay file of size {len}"
        )));
    }
    let bytes = buf.as_bytes();
    if &bytes[..8] != HEADER {
        return Err(DtError::InvalidFormat(
            "invalid signature for a Jay file".to_string(),
        ));
    }
    let trailer = &bytes[len - 8..];
    if trailer != TRAILER_1JAY && trailer != TRAILER_JAY1 {
        return Err(DtError::InvalidFormat(
            "invalid signature for a Jay file".to_string(),
        ));
    }
    let meta_size =
        u64::from_le_bytes(bytes[len - 16..len - 8].try_into().expect("8 bytes")) as usize;
    if meta_size > len - 24 {
        return Err(DtError::InvalidFormat(format!(
            "meta record of {meta_size} bytes does not fit in a file of {len} bytes"
        )));
    }
    let meta_start = len - 16 - meta_size;
    let meta: JayMeta = bincode::deserialize(&bytes[meta_start..meta_start + meta_size])
        .map_err(|e| DtError::InvalidFormat(format!("invalid meta record: {e}")))?;

    let nrows = meta.nrows as usize;
    let payload_end = meta_start;
    let mut pairs = Vec::with_capacity(meta.columns.len());
    let extract = |r: JayBufferRef| -> DtResult<Buffer> {
        let start = 8usize
            .checked_add(r.offset as usize)
            .ok_or_else(|| DtError::InvalidFormat("buffer offset overflow".into()))?;
        let end = start
            .checked_add(r.length as usize)
            .ok_or_else(|| DtError::InvalidFormat("buffer length overflow".into()))?;
        if end > payload_end {
            return Err(DtError::InvalidFormat(format!(
                "column buffer [{start}, {end}) lies outside the payload"
            )));
        }
        buf.view(start, r.length as usize)
    };
    for cm in &meta.columns {
        let stype = cm.jtype.stype();
        let data = extract(cm.data)?;
        let strdata = match cm.strdata {
            Some(r) => Some(extract(r)?),
            None => None,
        };
        if stype.is_string() && strdata.is_none() {
            return Err(DtError::InvalidFormat(format!(
                "string column '{}' lacks a strdata buffer",
                cm.name
            )));
        }
        let storage = StorageColumn::from_buffers(stype, nrows, data, strdata).map_err(|e| {
            DtError::InvalidFormat(format!("column '{}': {e}", cm.name))
        })?;
        if let Some(js) = &cm.stats {
            storage
                .stats_cache()
                .set(std::sync::Arc::new(stats_from_jay(js)));
        }
        pairs.push((cm.name.clone(), Column::Storage(storage)));
    }
    let mut frame = Frame::from_columns(pairs)?;
    if meta.nkeys > 0 {
        // the key was validated when it was set; trust the file
        frame = Frame::from_parts(
            frame.columns().to_vec(),
            frame.names().to_vec(),
            meta.nkeys as usize,
        );
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Value;

    fn sample_frame() -> Frame {
        Frame::from_columns(vec![
            (
                "n".to_string(),
                Column::Storage(StorageColumn::from_values::<i32>(&[
                    Some(1),
                    Some(2),
                    None,
                    Some(4),
                ])),
            ),
            (
                "s".to_string(),
                Column::Storage(StorageColumn::from_strs(&[
                    Some("a"),
                    Some(""),
                    Some("b"),
                    Some("ccc"),
                ])),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jay");
        let frame = sample_frame();
        frame.to_jay(&path).unwrap();
        let back = Frame::open_jay(&path).unwrap();
        assert_eq!(frame, back);
        // NA must be preserved via the negative-offset encoding
        assert_eq!(back.cell(2, 0), Value::Na);
        assert_eq!(back.cell(1, 1), Value::Str(String::new()));
    }

    #[test]
    fn test_roundtrip_with_na_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nas.jay");
        let frame = Frame::from_columns(vec![(
            "s".to_string(),
            Column::Storage(StorageColumn::from_strs::<&str>(&[None, Some("x"), None])),
        )])
        .unwrap();
        frame.to_jay(&path).unwrap();
        let back = Frame::open_jay(&path).unwrap();
        assert_eq!(back.cell(0, 0), Value::Na);
        assert_eq!(back.cell(1, 0), Value::Str("x".to_string()));
        assert_eq!(back.cell(2, 0), Value::Na);
    }

    #[test]
    fn test_open_is_zero_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("z.jay");
        sample_frame().to_jay(&path).unwrap();
        let back = Frame::open_jay(&path).unwrap();
        if let Column::Storage(c) = back.column(0) {
            assert!(c.data().is_view());
        } else {
            panic!("expected storage column");
        }
    }

    #[test]
    fn test_header_and_trailer_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.jay");
        sample_frame().to_jay(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], b"JAY1\0\0\0\0");
        assert_eq!(&bytes[bytes.len() - 8..], b"\0\0\0\x001JAY");
    }

    #[test]
    fn test_accepts_alternate_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alt.jay");
        sample_frame().to_jay(&path).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 4..].copy_from_slice(b"JAY1");
        bytes[n - 8..n - 4].copy_from_slice(b"\0\0\0\0");
        std::fs::write(&path, &bytes).unwrap();
        let back = Frame::open_jay(&path).unwrap();
        assert_eq!(back.nrows(), 4);
    }

    #[test]
    fn test_corrupt_files_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jay");
        std::fs::write(&path, b"JAY1\0\0\0\0 truncated").unwrap();
        assert!(matches!(
            Frame::open_jay(&path),
            Err(DtError::InvalidFormat(_))
        ));

        let path2 = dir.path().join("tiny.jay");
        std::fs::write(&path2, b"short").unwrap();
        assert!(Frame::open_jay(&path2).is_err());
    }

    #[test]
    fn test_stats_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("st.jay");
        let frame = sample_frame();
        // populate the stats cache so the writer persists it
        frame.column(0).stats().unwrap();
        frame.to_jay(&path).unwrap();
        let back = Frame::open_jay(&path).unwrap();
        if let Column::Storage(c) = back.column(0) {
            let st = c.stats_cache().get().expect("stats persisted");
            assert_eq!(st.nullcount, 1);
            assert_eq!(st.min, Some(StatValue::Int(1)));
            assert_eq!(st.max, Some(StatValue::Int(4)));
        } else {
            panic!("expected storage column");
        }
    }

    #[test]
    fn test_void_column_becomes_bool_na() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.jay");
        let frame = Frame::from_columns(vec![("v".to_string(), Column::void(3))]).unwrap();
        frame.to_jay(&path).unwrap();
        let back = Frame::open_jay(&path).unwrap();
        assert_eq!(back.stypes(), vec![SType::Bool8]);
        assert_eq!(back.cell(1, 0), Value::Na);
    }

    #[test]
    fn test_keyed_frame_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.jay");
        let mut frame = sample_frame();
        frame.set_key(1).unwrap();
        frame.to_jay(&path).unwrap();
        let back = Frame::open_jay(&path).unwrap();
        assert_eq!(back.nkeys(), 1);
        assert_eq!(back.key(), &["n"]);
    }
}

//! Frames: ordered collections of equal-length named columns.

pub mod groupby;

pub use groupby::Groupby;

use std::collections::HashSet;
use std::path::Path;

use crate::column::cast::common_stype;
use crate::column::storage::concat_storage;
use crate::column::{Column, SType, Value};
use crate::error::{DtError, DtResult};

/// An ordered tuple of columns with a common row count, unique non-empty
/// names, and an optional key prefix.
#[derive(Clone)]
pub struct Frame {
    columns: Vec<Column>,
    names: Vec<String>,
    nkeys: usize,
}

impl Default for Frame {
    fn default() -> Self {
        Frame::new()
    }
}

impl Frame {
    /// Frame with no columns and no rows.
    pub fn new() -> Frame {
        Frame {
            columns: Vec::new(),
            names: Vec::new(),
            nkeys: 0,
        }
    }

    /// Build from `(name, column)` pairs. Names must be unique and
    /// non-empty; all columns must agree on the row count.
    pub fn from_columns(pairs: Vec<(String, Column)>) -> DtResult<Frame> {
        let mut names = Vec::with_capacity(pairs.len());
        let mut columns = Vec::with_capacity(pairs.len());
        let mut seen = HashSet::new();
        let mut nrows: Option<usize> = None;
        for (name, col) in pairs {
            if name.is_empty() {
                return Err(DtError::value_error("column names cannot be empty"));
            }
            if !seen.insert(name.clone()) {
                return Err(DtError::value_error(format!(
                    "duplicate column name '{name}'"
                )));
            }
            match nrows {
                None => nrows = Some(col.nrows()),
                Some(n) if n == col.nrows() => {}
                Some(n) => {
                    return Err(DtError::value_error(format!(
                        "column '{}' has {} rows, expected {}",
                        name,
                        col.nrows(),
                        n
                    )));
                }
            }
            names.push(name);
            columns.push(col);
        }
        Ok(Frame {
            columns,
            names,
            nkeys: 0,
        })
    }

    pub fn nrows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.nrows())
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn stypes(&self) -> Vec<SType> {
        self.columns.iter().map(|c| c.stype()).collect()
    }

    pub fn column(&self, i: usize) -> &Column {
        &self.columns[i]
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.columns[i])
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Names of the key columns (the first `nkeys`).
    pub fn key(&self) -> &[String] {
        &self.names[..self.nkeys]
    }

    pub fn nkeys(&self) -> usize {
        self.nkeys
    }

    /// Declare the first `nkeys` columns as the frame's key. Verifies that
    /// they form a unique key.
    pub fn set_key(&mut self, nkeys: usize) -> DtResult<()> {
        if nkeys > self.ncols() {
            return Err(DtError::value_error(format!(
                "cannot key on {} columns; frame has only {}",
                nkeys,
                self.ncols()
            )));
        }
        if nkeys > 0 {
            let key_names: Vec<&str> = self.names[..nkeys].iter().map(|s| s.as_str()).collect();
            let gb = self.groupby(&key_names)?;
            if gb.ngroups() != self.nrows() {
                return Err(DtError::value_error(
                    "cannot set key: key columns contain duplicate rows",
                ));
            }
        }
        self.nkeys = nkeys;
        Ok(())
    }

    pub fn cell(&self, row: usize, col: usize) -> Value {
        self.columns[col].value(row)
    }

    /// Column-major export.
    pub fn to_column_list(&self) -> Vec<Vec<Value>> {
        self.columns
            .iter()
            .map(|c| (0..c.nrows()).map(|i| c.value(i)).collect())
            .collect()
    }

    /// Row-major export.
    pub fn to_rows(&self) -> Vec<Vec<Value>> {
        (0..self.nrows())
            .map(|i| self.columns.iter().map(|c| c.value(i)).collect())
            .collect()
    }

    /// First `n` rows, as a zero-copy view.
    pub fn head(&self, n: usize) -> Frame {
        let n = n.min(self.nrows());
        self.slice_rows(0, 1, n)
    }

    /// Last `n` rows, as a zero-copy view.
    pub fn tail(&self, n: usize) -> Frame {
        let n = n.min(self.nrows());
        self.slice_rows(self.nrows() - n, 1, n)
    }

    fn slice_rows(&self, start: usize, step: isize, len: usize) -> Frame {
        Frame {
            columns: self
                .columns
                .iter()
                .map(|c| c.clone().slice(start, step, len))
                .collect(),
            names: self.names.clone(),
            nkeys: self.nkeys,
        }
    }

    /// Cheap copy: columns share their underlying buffers.
    pub fn copy(&self) -> Frame {
        self.clone()
    }

    /// Stack frames vertically. Columns are matched by name; types promote
    /// to the smallest common stype. Without `force`, every frame must have
    /// the same column set.
    pub fn rbind(&self, others: &[&Frame], force: bool) -> DtResult<Frame> {
        let mut frames: Vec<&Frame> = Vec::with_capacity(others.len() + 1);
        frames.push(self);
        frames.extend_from_slice(others);

        let mut names: Vec<String> = self.names.clone();
        if force {
            for f in others {
                for n in f.names() {
                    if !names.contains(n) {
                        names.push(n.clone());
                    }
                }
            }
        } else {
            for f in others {
                if f.names() != self.names.as_slice() {
                    return Err(DtError::value_error(
                        "cannot rbind frames with different columns; use force=true",
                    ));
                }
            }
        }

        let total_rows: usize = frames.iter().map(|f| f.nrows()).sum();
        let mut out = Vec::with_capacity(names.len());
        for name in &names {
            let mut stype = SType::Void;
            for f in &frames {
                if let Some(c) = f.column_by_name(name) {
                    stype = common_stype(stype, c.stype());
                }
            }
            let mut parts = Vec::with_capacity(frames.len());
            for f in &frames {
                match f.column_by_name(name) {
                    Some(c) => {
                        parts.push(c.clone().cast(stype).materialize()?);
                    }
                    None => {
                        parts.push(Column::const_na(stype, f.nrows()).materialize()?);
                    }
                }
            }
            let merged = concat_storage(stype, &parts)?;
            debug_assert_eq!(merged.nrows(), total_rows);
            out.push((name.clone(), Column::Storage(merged)));
        }
        Frame::from_columns(out)
    }

    /// Attach frames side by side. Row counts must agree; 1-row frames
    /// broadcast; with `force`, shorter frames pad with NAs. Duplicate
    /// names get a numeric suffix.
    pub fn cbind(&self, others: &[&Frame], force: bool) -> DtResult<Frame> {
        let mut frames: Vec<&Frame> = Vec::with_capacity(others.len() + 1);
        frames.push(self);
        frames.extend_from_slice(others);
        let nrows = frames.iter().map(|f| f.nrows()).max().unwrap_or(0);

        let mut out: Vec<(String, Column)> = Vec::new();
        let mut used: HashSet<String> = HashSet::new();
        for f in frames {
            for (name, col) in f.names.iter().zip(&f.columns) {
                let col = if col.nrows() == nrows {
                    col.clone()
                } else if col.nrows() == 1 {
                    col.clone().repeat(nrows)?
                } else if force {
                    let mut m = col.materialize()?;
                    m.set_nrows(nrows)?;
                    Column::Storage(m)
                } else {
                    return Err(DtError::value_error(format!(
                        "cannot cbind a column of {} rows to a frame of {} rows \
                         (use force=true)",
                        col.nrows(),
                        nrows
                    )));
                };
                let mut unique = name.clone();
                let mut suffix = 0;
                while used.contains(&unique) {
                    unique = format!("{name}.{suffix}");
                    suffix += 1;
                }
                used.insert(unique.clone());
                out.push((unique, col));
            }
        }
        Frame::from_columns(out)
    }

    /// The frame tiled `n` times.
    pub fn repeat(frame: &Frame, n: usize) -> DtResult<Frame> {
        let columns = frame
            .columns
            .iter()
            .map(|c| c.clone().repeat(n))
            .collect::<DtResult<Vec<_>>>()?;
        Frame::from_columns(frame.names.iter().cloned().zip(columns).collect())
    }

    /// Group rows by the named columns.
    pub fn groupby(&self, key_names: &[&str]) -> DtResult<Groupby> {
        groupby::compute_groupby(self, key_names)
    }

    /// Serialize into the Jay binary format.
    pub fn to_jay(&self, path: impl AsRef<Path>) -> DtResult<()> {
        crate::jay::save_jay(self, path.as_ref())
    }

    /// Open a Jay file as a frame; column data is memory-mapped, not copied.
    pub fn open_jay(path: impl AsRef<Path>) -> DtResult<Frame> {
        crate::jay::open_jay(path.as_ref())
    }

    pub(crate) fn from_parts(columns: Vec<Column>, names: Vec<String>, nkeys: usize) -> Frame {
        Frame {
            columns,
            names,
            nkeys,
        }
    }
}

impl PartialEq for Frame {
    /// Value equality: same shape, names, and cell values (NAs equal NAs).
    fn eq(&self, other: &Self) -> bool {
        if self.names != other.names || self.nrows() != other.nrows() {
            return false;
        }
        for (a, b) in self.columns.iter().zip(&other.columns) {
            for i in 0..a.nrows() {
                if a.value(i) != b.value(i) {
                    return false;
                }
            }
        }
        true
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame[{} x {}; ", self.nrows(), self.ncols())?;
        for (i, (n, c)) in self.names.iter().zip(&self.columns).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", n, c.stype())?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::StorageColumn;

    fn int_col(values: &[Option<i32>]) -> Column {
        Column::Storage(StorageColumn::from_values::<i32>(values))
    }

    fn str_col(values: &[Option<&str>]) -> Column {
        Column::Storage(StorageColumn::from_strs(values))
    }

    fn sample() -> Frame {
        Frame::from_columns(vec![
            ("n".to_string(), int_col(&[Some(1), Some(2), None, Some(4)])),
            (
                "s".to_string(),
                str_col(&[Some("a"), Some(""), Some("b"), Some("ccc")]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_shape_and_names() {
        let f = sample();
        assert_eq!(f.nrows(), 4);
        assert_eq!(f.ncols(), 2);
        assert_eq!(f.names(), &["n", "s"]);
        assert_eq!(f.stypes(), vec![SType::Int32, SType::Str32]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let r = Frame::from_columns(vec![
            ("x".to_string(), int_col(&[Some(1)])),
            ("x".to_string(), int_col(&[Some(2)])),
        ]);
        assert!(r.is_err());
    }

    #[test]
    fn test_mismatched_nrows_rejected() {
        let r = Frame::from_columns(vec![
            ("x".to_string(), int_col(&[Some(1)])),
            ("y".to_string(), int_col(&[Some(2), Some(3)])),
        ]);
        assert!(r.is_err());
    }

    #[test]
    fn test_head_tail_are_views() {
        let f = sample();
        let h = f.head(2);
        assert_eq!(h.nrows(), 2);
        assert_eq!(h.cell(1, 0), Value::Int(2));
        assert!(h.column(0).is_virtual());
        let t = f.tail(2);
        assert_eq!(t.cell(0, 0), Value::Na);
        assert_eq!(t.cell(1, 1), Value::Str("ccc".to_string()));
    }

    #[test]
    fn test_rbind_preserves_total_rows() {
        let f = sample();
        let g = sample();
        let combined = f.rbind(&[&g], false).unwrap();
        assert_eq!(combined.nrows(), 8);
        assert_eq!(combined.cell(4, 0), Value::Int(1));
        assert_eq!(combined.cell(7, 1), Value::Str("ccc".to_string()));
    }

    #[test]
    fn test_rbind_promotes_types() {
        let a = Frame::from_columns(vec![("x".to_string(), int_col(&[Some(1)]))]).unwrap();
        let b = Frame::from_columns(vec![(
            "x".to_string(),
            Column::Storage(StorageColumn::from_values::<f64>(&[Some(0.5)])),
        )])
        .unwrap();
        let c = a.rbind(&[&b], false).unwrap();
        assert_eq!(c.stypes(), vec![SType::Float64]);
        assert_eq!(c.cell(0, 0), Value::Float(1.0));
        assert_eq!(c.cell(1, 0), Value::Float(0.5));
    }

    #[test]
    fn test_rbind_force_fills_missing() {
        let a = Frame::from_columns(vec![("x".to_string(), int_col(&[Some(1)]))]).unwrap();
        let b = Frame::from_columns(vec![("y".to_string(), int_col(&[Some(9)]))]).unwrap();
        assert!(a.rbind(&[&b], false).is_err());
        let c = a.rbind(&[&b], true).unwrap();
        assert_eq!(c.ncols(), 2);
        assert_eq!(c.cell(0, 1), Value::Na);
        assert_eq!(c.cell(1, 1), Value::Int(9));
    }

    #[test]
    fn test_cbind_broadcasts_single_row() {
        let f = sample();
        let one = Frame::from_columns(vec![("k".to_string(), int_col(&[Some(7)]))]).unwrap();
        let c = f.cbind(&[&one], false).unwrap();
        assert_eq!(c.ncols(), 3);
        assert_eq!(c.cell(3, 2), Value::Int(7));
    }

    #[test]
    fn test_cbind_renames_duplicates() {
        let f = sample();
        let c = f.cbind(&[&f.clone()], false).unwrap();
        assert_eq!(c.names()[2], "n.0");
        assert_eq!(c.names()[3], "s.0");
    }

    #[test]
    fn test_repeat_frame() {
        let f = sample();
        let r = Frame::repeat(&f, 3).unwrap();
        assert_eq!(r.nrows(), 12);
        assert_eq!(r.cell(4, 0), Value::Int(1));
        assert_eq!(r.cell(6, 0), Value::Na);
    }

    #[test]
    fn test_set_key() {
        // n has values 1, 2, NA, 4 - all distinct, so keying succeeds
        let mut f = sample();
        assert!(f.set_key(1).is_ok());
        assert_eq!(f.key(), &["n"]);
    }

    #[test]
    fn test_set_key_rejects_duplicates() {
        let mut f = Frame::from_columns(vec![(
            "x".to_string(),
            int_col(&[Some(1), Some(1), Some(2)]),
        )])
        .unwrap();
        assert!(f.set_key(1).is_err());
        assert_eq!(f.nkeys(), 0);
    }

    #[test]
    fn test_frame_equality() {
        assert_eq!(sample(), sample());
        let mut other = sample();
        other = other.head(3);
        assert_ne!(sample(), other);
    }
}

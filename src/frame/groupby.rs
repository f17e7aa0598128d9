//! Grouping rows into equivalence classes.
//!
//! A groupby is a compact pair: a row ordering that places equal keys next
//! to each other, and an offsets array of length `ngroups + 1` such that
//! group `g` occupies positions `[offsets[g], offsets[g+1])` of that
//! ordering.

use std::cmp::Ordering;

use crate::column::rowindex::RowIndex;
use crate::column::{Column, LType};
use crate::error::{DtError, DtResult};
use crate::frame::Frame;

pub struct Groupby {
    offsets: Vec<usize>,
    ordering: RowIndex,
}

impl Groupby {
    pub fn ngroups(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn group_sizes(&self) -> Vec<usize> {
        self.offsets.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// The companion ordering: logical position -> physical row.
    pub fn ordering(&self) -> &RowIndex {
        &self.ordering
    }

    /// Physical rows of group `g`.
    pub fn group_rows(&self, g: usize) -> Vec<usize> {
        (self.offsets[g]..self.offsets[g + 1])
            .map(|i| self.ordering.get(i).expect("groupby ordering has no NAs"))
            .collect()
    }
}

fn compare_cells(col: &Column, a: usize, b: usize) -> Ordering {
    match col.stype().ltype() {
        LType::Str => {
            let va = col.get_str(a);
            let vb = col.get_str(b);
            match (va, vb) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => x.cmp(&y),
            }
        }
        LType::Real => {
            let va = col.get_f64_any(a);
            let vb = col.get_f64_any(b);
            match (va, vb) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            }
        }
        _ => {
            let va = col.get_i64_any(a);
            let vb = col.get_i64_any(b);
            va.cmp(&vb) // None sorts first
        }
    }
}

fn cells_equal(col: &Column, a: usize, b: usize) -> bool {
    match col.stype().ltype() {
        LType::Str => col.get_str(a) == col.get_str(b),
        _ => col.value(a) == col.value(b),
    }
}

pub(crate) fn compute_groupby(frame: &Frame, key_names: &[&str]) -> DtResult<Groupby> {
    if key_names.is_empty() {
        return Err(DtError::value_error("groupby requires at least one column"));
    }
    let mut keys = Vec::with_capacity(key_names.len());
    for name in key_names {
        let col = frame.column_by_name(name).ok_or_else(|| {
            DtError::value_error(format!("unknown column '{name}' in groupby"))
        })?;
        keys.push(col);
    }

    let n = frame.nrows();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        for col in &keys {
            let c = compare_cells(col, a, b);
            if c != Ordering::Equal {
                return c;
            }
        }
        // stable within equal keys: preserve the original row order
        a.cmp(&b)
    });

    let mut offsets = Vec::with_capacity(n + 1);
    offsets.push(0);
    if n > 0 {
        for i in 1..n {
            let same = keys
                .iter()
                .all(|col| cells_equal(col, order[i - 1], order[i]));
            if !same {
                offsets.push(i);
            }
        }
        offsets.push(n);
    }

    let ordering = RowIndex::from_i64(order.iter().map(|&i| i as i64).collect());
    Ok(Groupby { offsets, ordering })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::StorageColumn;

    fn frame() -> Frame {
        Frame::from_columns(vec![
            (
                "grp".to_string(),
                Column::Storage(StorageColumn::from_strs(&[
                    Some("b"),
                    Some("a"),
                    Some("b"),
                    None,
                    Some("a"),
                ])),
            ),
            (
                "v".to_string(),
                Column::Storage(StorageColumn::from_values::<i32>(&[
                    Some(1),
                    Some(2),
                    Some(3),
                    Some(4),
                    Some(5),
                ])),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_groups_partition_rows() {
        let f = frame();
        let gb = f.groupby(&["grp"]).unwrap();
        assert_eq!(gb.ngroups(), 3); // NA, "a", "b"
        let sizes = gb.group_sizes();
        assert_eq!(sizes.iter().sum::<usize>(), 5);
        // NA group sorts first
        assert_eq!(gb.group_rows(0), vec![3]);
        assert_eq!(gb.group_rows(1), vec![1, 4]);
        assert_eq!(gb.group_rows(2), vec![0, 2]);
    }

    #[test]
    fn test_offsets_contiguous() {
        let f = frame();
        let gb = f.groupby(&["grp"]).unwrap();
        let offs = gb.offsets();
        assert_eq!(offs[0], 0);
        assert_eq!(*offs.last().unwrap(), 5);
        assert!(offs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_multi_key() {
        let f = Frame::from_columns(vec![
            (
                "a".to_string(),
                Column::Storage(StorageColumn::from_values::<i32>(&[
                    Some(1),
                    Some(1),
                    Some(2),
                    Some(1),
                ])),
            ),
            (
                "b".to_string(),
                Column::Storage(StorageColumn::from_values::<i32>(&[
                    Some(10),
                    Some(20),
                    Some(10),
                    Some(10),
                ])),
            ),
        ])
        .unwrap();
        let gb = f.groupby(&["a", "b"]).unwrap();
        assert_eq!(gb.ngroups(), 3);
        assert_eq!(gb.group_rows(0), vec![0, 3]); // (1,10)
        assert_eq!(gb.group_rows(1), vec![1]); // (1,20)
        assert_eq!(gb.group_rows(2), vec![2]); // (2,10)
    }

    #[test]
    fn test_unknown_column() {
        let f = frame();
        assert!(f.groupby(&["nope"]).is_err());
    }
}

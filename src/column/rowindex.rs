//! Row indirections: mappings from logical to physical row numbers.

use std::sync::Arc;

/// Sentinel meaning "this logical row is an NA synthesized by the mapping".
pub const NA_I32: i32 = -1;
pub const NA_I64: i64 = -1;

/// An indirection mapping logical row `i` to a physical row.
#[derive(Debug, Clone)]
pub enum RowIndex {
    Slice { start: usize, step: isize, len: usize },
    Arr32(Arc<[i32]>),
    Arr64(Arc<[i64]>),
}

impl RowIndex {
    pub fn slice(start: usize, step: isize, len: usize) -> RowIndex {
        RowIndex::Slice { start, step, len }
    }

    /// Identity mapping over `len` rows.
    pub fn identity(len: usize) -> RowIndex {
        RowIndex::Slice {
            start: 0,
            step: 1,
            len,
        }
    }

    pub fn from_i32(indices: Vec<i32>) -> RowIndex {
        RowIndex::Arr32(indices.into())
    }

    pub fn from_i64(indices: Vec<i64>) -> RowIndex {
        RowIndex::Arr64(indices.into())
    }

    pub fn len(&self) -> usize {
        match self {
            RowIndex::Slice { len, .. } => *len,
            RowIndex::Arr32(a) => a.len(),
            RowIndex::Arr64(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical row for logical row `i`, or `None` for a synthesized NA.
    pub fn get(&self, i: usize) -> Option<usize> {
        match self {
            RowIndex::Slice { start, step, len } => {
                debug_assert!(i < *len);
                Some((*start as isize + i as isize * step) as usize)
            }
            RowIndex::Arr32(a) => {
                let j = a[i];
                (j != NA_I32).then_some(j as usize)
            }
            RowIndex::Arr64(a) => {
                let j = a[i];
                (j != NA_I64).then_some(j as usize)
            }
        }
    }

    /// Composition `self ∘ other`: the mapping that first applies `other`,
    /// then `self`. Length equals `other.len()`.
    pub fn compose(&self, other: &RowIndex) -> RowIndex {
        match (self, other) {
            (
                RowIndex::Slice {
                    start: s1,
                    step: t1,
                    ..
                },
                RowIndex::Slice {
                    start: s2,
                    step: t2,
                    len,
                },
            ) => RowIndex::Slice {
                start: (*s1 as isize + *s2 as isize * t1) as usize,
                step: t1 * t2,
                len: *len,
            },
            _ => {
                let mapped: Vec<i64> = (0..other.len())
                    .map(|i| match other.get(i) {
                        Some(j) => match self.get(j) {
                            Some(k) => k as i64,
                            None => NA_I64,
                        },
                        None => NA_I64,
                    })
                    .collect();
                RowIndex::Arr64(mapped.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_mapping() {
        let ri = RowIndex::slice(10, -2, 5);
        let got: Vec<_> = (0..5).map(|i| ri.get(i).unwrap()).collect();
        assert_eq!(got, vec![10, 8, 6, 4, 2]);
    }

    #[test]
    fn test_array_na() {
        let ri = RowIndex::from_i32(vec![3, -1, 0]);
        assert_eq!(ri.get(0), Some(3));
        assert_eq!(ri.get(1), None);
        assert_eq!(ri.get(2), Some(0));
    }

    #[test]
    fn test_compose_slices() {
        // other picks logical rows 1,3,5; self doubles them
        let outer = RowIndex::slice(0, 2, 100);
        let inner = RowIndex::slice(1, 2, 3);
        let composed = outer.compose(&inner);
        assert_eq!(composed.len(), 3);
        let got: Vec<_> = (0..3).map(|i| composed.get(i).unwrap()).collect();
        assert_eq!(got, vec![2, 6, 10]);
    }

    #[test]
    fn test_compose_propagates_na() {
        let outer = RowIndex::from_i32(vec![5, -1]);
        let inner = RowIndex::from_i32(vec![1, 0, -1]);
        let composed = outer.compose(&inner);
        assert_eq!(composed.get(0), None);
        assert_eq!(composed.get(1), Some(5));
        assert_eq!(composed.get(2), None);
    }

    #[test]
    fn test_compose_associative() {
        let a = RowIndex::from_i32(vec![2, 0, 1, -1]);
        let b = RowIndex::slice(0, 1, 4);
        let c = RowIndex::from_i32(vec![3, 1, 2]);
        let left = a.compose(&b).compose(&c);
        let right = a.compose(&b.compose(&c));
        for i in 0..3 {
            assert_eq!(left.get(i), right.get(i));
        }
    }
}

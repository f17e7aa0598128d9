//! Per-column statistics and their cache.
//!
//! Stats are computed through the runtime's parallel primitives and cached on
//! storage columns. The cache is guarded by the crate's shared mutex: readers
//! take it in shared mode, the fill path takes it exclusively. Any mutation
//! of the owning column invalidates the cache.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use xxhash_rust::xxh3::xxh3_64;

use crate::column::Column;
use crate::column::stype::LType;
use crate::error::DtResult;
use crate::parallel::{self, ChunkSize, SharedLock, SharedMutex};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
    Int(i64),
    Float(f64),
}

impl StatValue {
    pub fn as_f64(self) -> f64 {
        match self {
            StatValue::Int(v) => v as f64,
            StatValue::Float(f) => f,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub nullcount: u64,
    pub min: Option<StatValue>,
    pub max: Option<StatValue>,
    pub sum: Option<f64>,
    pub mean: Option<f64>,
    pub stdev: Option<f64>,
    pub nunique: Option<u64>,
}

/// Shared-mutex-guarded cache slot for a column's stats.
pub struct StatsCache {
    lock: SharedMutex,
    value: UnsafeCell<Option<Arc<Stats>>>,
}

// SAFETY: `value` is read under the shared lock and written under the
// exclusive lock only.
unsafe impl Sync for StatsCache {}
unsafe impl Send for StatsCache {}

impl Default for StatsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCache {
    pub fn new() -> Self {
        StatsCache {
            lock: SharedMutex::new(),
            value: UnsafeCell::new(None),
        }
    }

    pub fn get(&self) -> Option<Arc<Stats>> {
        let _lock = SharedLock::shared(&self.lock);
        unsafe { (*self.value.get()).clone() }
    }

    pub fn set(&self, stats: Arc<Stats>) {
        let _lock = SharedLock::exclusive(&self.lock);
        unsafe {
            *self.value.get() = Some(stats);
        }
    }

    pub fn invalidate(&self) {
        let _lock = SharedLock::exclusive(&self.lock);
        unsafe {
            *self.value.get() = None;
        }
    }
}

#[derive(Default)]
struct Partial {
    nullcount: u64,
    min_i: Option<i64>,
    max_i: Option<i64>,
    min_f: Option<f64>,
    max_f: Option<f64>,
    sum: f64,
    sum2: f64,
    count: u64,
    uniques: HashSet<u64>,
}

impl Partial {
    fn merge(&mut self, other: Partial) {
        self.nullcount += other.nullcount;
        self.count += other.count;
        self.sum += other.sum;
        self.sum2 += other.sum2;
        self.min_i = merge_min(self.min_i, other.min_i);
        self.max_i = merge_max(self.max_i, other.max_i);
        self.min_f = merge_min_f(self.min_f, other.min_f);
        self.max_f = merge_max_f(self.max_f, other.max_f);
        self.uniques.extend(other.uniques);
    }
}

fn merge_min(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

fn merge_max(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

fn merge_min_f(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

fn merge_max_f(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

/// Compute statistics for any column via `parallel_for_static`.
pub fn compute_stats(col: &Column) -> DtResult<Stats> {
    let n = col.nrows();
    let ltype = col.stype().ltype();
    let merged = Mutex::new(Partial::default());

    parallel::parallel_for_static(n, ChunkSize::new(4096), |i0, i1| {
        let mut part = Partial::default();
        for i in i0..i1 {
            match ltype {
                LType::Void => part.nullcount += 1,
                LType::Bool | LType::Int => match col.get_i64_any(i) {
                    None => part.nullcount += 1,
                    Some(v) => {
                        part.count += 1;
                        part.sum += v as f64;
                        part.sum2 += (v as f64) * (v as f64);
                        part.min_i = merge_min(part.min_i, Some(v));
                        part.max_i = merge_max(part.max_i, Some(v));
                        part.uniques.insert(v as u64);
                    }
                },
                LType::Real => match col.get_f64_any(i) {
                    None => part.nullcount += 1,
                    Some(v) => {
                        part.count += 1;
                        part.sum += v;
                        part.sum2 += v * v;
                        part.min_f = merge_min_f(part.min_f, Some(v));
                        part.max_f = merge_max_f(part.max_f, Some(v));
                        part.uniques.insert(v.to_bits());
                    }
                },
                LType::Str => match col.get_str(i) {
                    None => part.nullcount += 1,
                    Some(s) => {
                        part.count += 1;
                        part.uniques.insert(xxh3_64(s.as_bytes()));
                    }
                },
            }
        }
        merged.lock().unwrap().merge(part);
    })?;

    let merged = merged.into_inner().unwrap();
    let mut stats = Stats {
        nullcount: merged.nullcount,
        nunique: Some(merged.uniques.len() as u64),
        ..Stats::default()
    };
    if merged.count > 0 {
        match ltype {
            LType::Bool | LType::Int => {
                stats.min = merged.min_i.map(StatValue::Int);
                stats.max = merged.max_i.map(StatValue::Int);
            }
            LType::Real => {
                stats.min = merged.min_f.map(StatValue::Float);
                stats.max = merged.max_f.map(StatValue::Float);
            }
            _ => {}
        }
        if ltype != LType::Str && ltype != LType::Void {
            let count = merged.count as f64;
            let mean = merged.sum / count;
            stats.sum = Some(merged.sum);
            stats.mean = Some(mean);
            if merged.count > 1 {
                let var = (merged.sum2 - merged.sum * merged.sum / count) / (count - 1.0);
                stats.stdev = Some(var.max(0.0).sqrt());
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::storage::StorageColumn;

    #[test]
    fn test_int_stats() {
        let col = Column::Storage(StorageColumn::from_values::<i32>(&[
            Some(3),
            Some(1),
            None,
            Some(4),
            Some(1),
        ]));
        let s = col.stats().unwrap();
        assert_eq!(s.nullcount, 1);
        assert_eq!(s.min, Some(StatValue::Int(1)));
        assert_eq!(s.max, Some(StatValue::Int(4)));
        assert_eq!(s.sum, Some(9.0));
        assert_eq!(s.nunique, Some(3));
    }

    #[test]
    fn test_string_stats() {
        let col = Column::Storage(StorageColumn::from_strs(&[
            Some("a"),
            Some("b"),
            Some("a"),
            None,
        ]));
        let s = col.stats().unwrap();
        assert_eq!(s.nullcount, 1);
        assert_eq!(s.nunique, Some(2));
        assert!(s.min.is_none());
    }

    #[test]
    fn test_cache_hit_and_invalidate() {
        let storage = StorageColumn::from_values::<i64>(&[Some(1), Some(2)]);
        let col = Column::Storage(storage);
        let first = col.stats().unwrap();
        let second = col.stats().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        if let Column::Storage(c) = &col {
            c.stats_cache().invalidate();
            assert!(c.stats_cache().get().is_none());
        }
    }

    #[test]
    fn test_stats_parallel_large() {
        let col = Column::range(0, 100_000, 1, None).unwrap();
        let s = col.stats().unwrap();
        assert_eq!(s.min, Some(StatValue::Int(0)));
        assert_eq!(s.max, Some(StatValue::Int(99_999)));
        assert_eq!(s.sum, Some(100_000.0 * 99_999.0 / 2.0));
        assert_eq!(s.nullcount, 0);
    }
}

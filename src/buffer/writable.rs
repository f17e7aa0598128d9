//! Writable buffers used by parallel writers.
//!
//! `prep_write` reserves an output slot under an internal lock; the
//! subsequent `write_at` copies data into the reserved range without further
//! synchronization. Reserved ranges are disjoint by construction, so any
//! number of threads may call `write_at` concurrently.

use std::cell::UnsafeCell;
use std::io::Write;
use std::sync::Mutex;
use std::sync::RwLock;

use crate::buffer::Buffer;
use crate::error::{DtError, DtResult};

pub trait WritableBuffer: Send + Sync {
    /// Reserve `size` bytes of output and return the slot's offset.
    fn prep_write(&self, size: usize) -> usize;

    /// Copy `data` into a previously reserved slot.
    fn write_at(&self, offset: usize, data: &[u8]);

    /// Total number of bytes reserved so far.
    fn size(&self) -> usize;

    /// Consume the remaining state and produce a read-only buffer.
    fn finalize(&mut self) -> DtResult<Buffer>;
}

struct WState {
    data: Vec<u8>,
    used: usize,
}

/// In-memory writable buffer with geometric growth.
pub struct MemoryWritableBuffer {
    // Exclusive while reallocating, shared while copying into reserved slots.
    grow_lock: RwLock<()>,
    state: UnsafeCell<WState>,
    reserve_lock: Mutex<()>,
}

// SAFETY: `state.data` is reallocated only under the exclusive grow_lock;
// `write_at` copies into byte-disjoint reserved ranges under the shared
// grow_lock; `used` is changed only under reserve_lock.
unsafe impl Sync for MemoryWritableBuffer {}
unsafe impl Send for MemoryWritableBuffer {}

impl MemoryWritableBuffer {
    pub fn new(initial_capacity: usize) -> Self {
        MemoryWritableBuffer {
            grow_lock: RwLock::new(()),
            state: UnsafeCell::new(WState {
                data: Vec::with_capacity(initial_capacity.max(16)),
                used: 0,
            }),
            reserve_lock: Mutex::new(()),
        }
    }
}

impl WritableBuffer for MemoryWritableBuffer {
    fn prep_write(&self, size: usize) -> usize {
        let _guard = self.reserve_lock.lock().unwrap();
        // SAFETY: `used` is only touched under reserve_lock.
        let state = unsafe { &mut *self.state.get() };
        let offset = state.used;
        state.used += size;
        if state.used > state.data.len() {
            let new_len = (state.used * 2).max(64);
            let _excl = self.grow_lock.write().unwrap();
            state.data.resize(new_len, 0);
        }
        offset
    }

    fn write_at(&self, offset: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let _shared = self.grow_lock.read().unwrap();
        // SAFETY: [offset, offset+len) was reserved for this caller alone,
        // and the shared grow_lock excludes reallocation.
        unsafe {
            let state = &*self.state.get();
            debug_assert!(offset + data.len() <= state.data.len());
            let dst = (state.data.as_ptr() as *mut u8).add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
    }

    fn size(&self) -> usize {
        let _guard = self.reserve_lock.lock().unwrap();
        unsafe { (*self.state.get()).used }
    }

    fn finalize(&mut self) -> DtResult<Buffer> {
        let state = self.state.get_mut();
        state.data.truncate(state.used);
        let buf = Buffer::from_bytes(&state.data);
        state.data = Vec::new();
        state.used = 0;
        Ok(buf)
    }
}

/// Writable buffer that streams through a zstd compressor.
///
/// Unlike the in-memory variant, this sink is sequential: `write_at` must be
/// called in offset order. It suits writers that finalize one ordered chunk
/// at a time.
pub struct ZstdWritableBuffer {
    inner: Mutex<ZstdState>,
}

struct ZstdState {
    encoder: Option<zstd::Encoder<'static, Vec<u8>>>,
    reserved: usize,
    written: usize,
}

impl ZstdWritableBuffer {
    pub fn new(level: i32) -> DtResult<Self> {
        let encoder = zstd::Encoder::new(Vec::new(), level)?;
        Ok(ZstdWritableBuffer {
            inner: Mutex::new(ZstdState {
                encoder: Some(encoder),
                reserved: 0,
                written: 0,
            }),
        })
    }
}

impl WritableBuffer for ZstdWritableBuffer {
    fn prep_write(&self, size: usize) -> usize {
        let mut state = self.inner.lock().unwrap();
        let offset = state.reserved;
        state.reserved += size;
        offset
    }

    fn write_at(&self, offset: usize, data: &[u8]) {
        let mut state = self.inner.lock().unwrap();
        assert_eq!(
            offset, state.written,
            "compressed sink requires in-order writes"
        );
        state
            .encoder
            .as_mut()
            .expect("finalized sink")
            .write_all(data)
            .expect("zstd write");
        state.written = offset + data.len();
    }

    fn size(&self) -> usize {
        self.inner.lock().unwrap().reserved
    }

    fn finalize(&mut self) -> DtResult<Buffer> {
        let mut state = self.inner.lock().unwrap();
        let encoder = state
            .encoder
            .take()
            .ok_or_else(|| DtError::value_error("sink already finalized"))?;
        let compressed = encoder.finish()?;
        Ok(Buffer::from_bytes(&compressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_memory_writable_sequential() {
        let mut wb = MemoryWritableBuffer::new(4);
        let a = wb.prep_write(5);
        let b = wb.prep_write(3);
        wb.write_at(b, b"xyz");
        wb.write_at(a, b"hello");
        assert_eq!(wb.size(), 8);
        let buf = wb.finalize().unwrap();
        assert_eq!(buf.as_bytes(), b"helloxyz");
    }

    #[test]
    fn test_memory_writable_parallel() {
        let wb = Arc::new(MemoryWritableBuffer::new(8));
        let mut handles = Vec::new();
        for t in 0..8u8 {
            let wb = Arc::clone(&wb);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let chunk = [t; 16];
                    let off = wb.prep_write(chunk.len());
                    wb.write_at(off, &chunk);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut wb = Arc::try_unwrap(wb).ok().unwrap();
        let buf = wb.finalize().unwrap();
        assert_eq!(buf.len(), 8 * 50 * 16);
        // every 16-byte slot holds a single thread's fill byte
        for slot in buf.as_bytes().chunks(16) {
            assert!(slot.iter().all(|&b| b == slot[0]));
        }
    }

    #[test]
    fn test_zstd_sink_roundtrip() {
        let mut wb = ZstdWritableBuffer::new(3).unwrap();
        let a = wb.prep_write(6);
        wb.write_at(a, b"abcabc");
        let b = wb.prep_write(6);
        wb.write_at(b, b"abcabc");
        let buf = wb.finalize().unwrap();
        let decoded = zstd::decode_all(buf.as_bytes()).unwrap();
        assert_eq!(decoded, b"abcabcabcabc");
    }
}

//! Byte buffers underlying column storage.
//!
//! A [`Buffer`] is a cheap-to-clone handle over a contiguous byte region.
//! Regions come in several ownership flavors: heap-allocated (resizable),
//! memory-mapped (read-only), `'static` borrows, and views into a parent
//! buffer. Any number of buffers and columns may share the same bytes; the
//! region is freed when the last handle drops.

mod writable;

pub use writable::{MemoryWritableBuffer, WritableBuffer, ZstdWritableBuffer};

use std::cell::UnsafeCell;
use std::path::Path;
use std::sync::Arc;

use crate::error::{DtError, DtResult};

/// Heap storage is kept in `u64` units so that typed views up to 8-byte
/// elements are always properly aligned.
struct OwnedBytes {
    data: Vec<u64>,
    len: usize,
}

impl OwnedBytes {
    fn with_len(len: usize) -> DtResult<Self> {
        let nwords = len.div_ceil(8);
        let mut data = Vec::new();
        data.try_reserve_exact(nwords)
            .map_err(|_| DtError::MemoryError(len))?;
        data.resize(nwords, 0);
        Ok(OwnedBytes { data, len })
    }

    fn resize(&mut self, new_len: usize) -> DtResult<()> {
        let nwords = new_len.div_ceil(8);
        if nwords > self.data.len() {
            self.data
                .try_reserve(nwords - self.data.len())
                .map_err(|_| DtError::MemoryError(new_len))?;
            self.data.resize(nwords, 0);
        } else {
            self.data.truncate(nwords);
        }
        self.len = new_len;
        Ok(())
    }

    fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.data)[..self.len]
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut(&mut self.data)[..len]
    }
}

enum Storage {
    Owned(UnsafeCell<OwnedBytes>),
    Static(&'static [u8]),
    Mmap(memmap2::Mmap),
    View {
        parent: Buffer,
        offset: usize,
        len: usize,
    },
}

struct Inner {
    storage: Storage,
}

// SAFETY: the UnsafeCell in Storage::Owned is mutated only through
// (a) `&mut Buffer` methods that first prove unique ownership via
// Arc::get_mut, and (b) `write_ptr()` raw writes whose callers guarantee
// byte-disjoint ranges while no resize is in flight (the CSV reader holds
// its shared mutex in shared mode around such writes, and exclusively
// around resizes). All other access is read-only.
unsafe impl Sync for Inner {}
unsafe impl Send for Inner {}

/// Shared handle to a contiguous byte region.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<Inner>,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Empty owned buffer.
    pub fn new() -> Self {
        Buffer::from_storage(Storage::Owned(UnsafeCell::new(OwnedBytes {
            data: Vec::new(),
            len: 0,
        })))
    }

    /// Owned zero-filled buffer of `len` bytes.
    pub fn with_len(len: usize) -> DtResult<Self> {
        Ok(Buffer::from_storage(Storage::Owned(UnsafeCell::new(
            OwnedBytes::with_len(len)?,
        ))))
    }

    /// Owned buffer initialized from `bytes` (copied into aligned storage).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut owned = OwnedBytes::with_len(bytes.len()).expect("allocation");
        owned.as_bytes_mut().copy_from_slice(bytes);
        Buffer::from_storage(Storage::Owned(UnsafeCell::new(owned)))
    }

    /// Non-owning buffer over `'static` data.
    pub fn from_static(bytes: &'static [u8]) -> Self {
        Buffer::from_storage(Storage::Static(bytes))
    }

    /// Memory-map a file read-only.
    pub fn mmap(path: impl AsRef<Path>) -> DtResult<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        // SAFETY: the mapping is read-only; mutating the underlying file
        // while mapped is excluded by the engine's usage contract.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(Buffer::from_storage(Storage::Mmap(map)))
    }

    fn from_storage(storage: Storage) -> Self {
        Buffer {
            inner: Arc::new(Inner { storage }),
        }
    }

    /// A view over `[offset, offset + len)` of this buffer. The view holds a
    /// handle to the parent, so it can never outlive the parent's bytes.
    pub fn view(&self, offset: usize, len: usize) -> DtResult<Buffer> {
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(DtError::value_error(format!(
                "view [{offset}, {offset}+{len}) does not fit in a buffer of size {}",
                self.len()
            )));
        }
        Ok(Buffer::from_storage(Storage::View {
            parent: self.clone(),
            offset,
            len,
        }))
    }

    pub fn len(&self) -> usize {
        match &self.inner.storage {
            Storage::Owned(cell) => unsafe { (*cell.get()).len },
            Storage::Static(s) => s.len(),
            Storage::Mmap(m) => m.len(),
            Storage::View { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.inner.storage, Storage::Owned(_))
    }

    pub fn is_view(&self) -> bool {
        matches!(self.inner.storage, Storage::View { .. })
    }

    pub fn is_mmapped(&self) -> bool {
        matches!(self.inner.storage, Storage::Mmap(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.inner.storage {
            // SAFETY: see the Sync impl note; no writer overlaps a live read.
            Storage::Owned(cell) => unsafe { (*cell.get()).as_bytes() },
            Storage::Static(s) => s,
            Storage::Mmap(m) => &m[..],
            Storage::View {
                parent,
                offset,
                len,
            } => &parent.as_bytes()[*offset..offset + len],
        }
    }

    /// Typed read-only view. The buffer length must be a multiple of
    /// `size_of::<T>()` and the region properly aligned (always true for
    /// owned and 8-aligned view buffers).
    pub fn as_slice<T: bytemuck::AnyBitPattern>(&self) -> &[T] {
        bytemuck::cast_slice(self.as_bytes())
    }

    /// Typed mutable view; requires an owned, uniquely-held buffer.
    pub fn as_slice_mut<T: bytemuck::NoUninit + bytemuck::AnyBitPattern>(
        &mut self,
    ) -> DtResult<&mut [T]> {
        let inner = Arc::get_mut(&mut self.inner).ok_or_else(|| {
            DtError::value_error("cannot mutate a buffer shared by multiple handles")
        })?;
        match &mut inner.storage {
            Storage::Owned(cell) => Ok(bytemuck::cast_slice_mut(cell.get_mut().as_bytes_mut())),
            _ => Err(DtError::value_error("cannot mutate a non-owned buffer")),
        }
    }

    pub fn get_element<T: bytemuck::AnyBitPattern>(&self, i: usize) -> T {
        self.as_slice::<T>()[i]
    }

    pub fn set_element<T: bytemuck::NoUninit + bytemuck::AnyBitPattern>(
        &mut self,
        i: usize,
        value: T,
    ) -> DtResult<()> {
        self.as_slice_mut::<T>()?[i] = value;
        Ok(())
    }

    /// Grow or shrink an owned, uniquely-held buffer.
    pub fn resize(&mut self, new_len: usize) -> DtResult<()> {
        let inner = Arc::get_mut(&mut self.inner).ok_or_else(|| {
            DtError::value_error("cannot resize a buffer shared by multiple handles")
        })?;
        match &mut inner.storage {
            Storage::Owned(cell) => cell.get_mut().resize(new_len),
            _ => Err(DtError::value_error("cannot resize a non-owned buffer")),
        }
    }

    /// Raw pointer for parallel disjoint writes into an owned buffer.
    ///
    /// # Safety
    /// The caller must guarantee that (a) the buffer is owned, (b) written
    /// ranges never overlap between threads, and (c) no resize happens while
    /// writes are in flight.
    pub(crate) unsafe fn write_ptr(&self) -> *mut u8 {
        match &self.inner.storage {
            Storage::Owned(cell) => unsafe { (*cell.get()).data.as_ptr() as *mut u8 },
            _ => unreachable!("write_ptr on a non-owned buffer"),
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner.storage {
            Storage::Owned(_) => "owned",
            Storage::Static(_) => "static",
            Storage::Mmap(_) => "mmap",
            Storage::View { .. } => "view",
        };
        write!(f, "Buffer<{} {} bytes>", kind, self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_owned_resize() {
        let mut buf = Buffer::with_len(16).unwrap();
        assert_eq!(buf.len(), 16);
        assert!(buf.as_bytes().iter().all(|&b| b == 0));
        buf.resize(40).unwrap();
        assert_eq!(buf.len(), 40);
        buf.set_element::<i64>(4, -17).unwrap();
        assert_eq!(buf.get_element::<i64>(4), -17);
    }

    #[test]
    fn test_resize_shared_fails() {
        let mut buf = Buffer::with_len(8).unwrap();
        let _alias = buf.clone();
        assert!(buf.resize(16).is_err());
    }

    #[test]
    fn test_view_bounds() {
        let buf = Buffer::from_bytes(b"hello world");
        let v = buf.view(6, 5).unwrap();
        assert_eq!(v.as_bytes(), b"world");
        assert!(buf.view(8, 5).is_err());
    }

    #[test]
    fn test_view_keeps_parent_alive() {
        let v = {
            let buf = Buffer::from_bytes(b"transient");
            buf.view(0, 5).unwrap()
        };
        assert_eq!(v.as_bytes(), b"trans");
    }

    #[test]
    fn test_view_is_not_resizable() {
        let buf = Buffer::with_len(8).unwrap();
        let mut v = buf.view(0, 4).unwrap();
        assert!(v.resize(2).is_err());
    }

    #[test]
    fn test_mmap_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[1u8, 2, 3, 4])
            .unwrap();
        let buf = Buffer::mmap(&path).unwrap();
        assert!(buf.is_mmapped());
        assert_eq!(buf.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_typed_slices() {
        let mut buf = Buffer::with_len(24).unwrap();
        {
            let s = buf.as_slice_mut::<i32>().unwrap();
            for (i, v) in s.iter_mut().enumerate() {
                *v = i as i32 * 10;
            }
        }
        assert_eq!(buf.as_slice::<i32>(), &[0, 10, 20, 30, 40, 50]);
    }
}

use std::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering, fence},
};

use tether_pool as pool;
use tether_utils::check;

/// Refcount-and-geometry header living inline in front of the payload bytes.
///
/// The whole allocation is `[StorageHeader][capacity bytes]`; payload starts
/// at `offset` from the allocation base. `offset + capacity` equals the
/// allocation size at all times, so shifting the head (framing, prefix
/// reservation) trades `offset` against `capacity` without moving bytes.
#[repr(C)]
struct StorageHeader {
    refs: AtomicU32,
    size: u32,
    offset: u32,
    capacity: u32,
}

pub const STORAGE_HEADER_SIZE: u32 = std::mem::size_of::<StorageHeader>() as u32;

/// Shared handle to a pooled byte storage.
///
/// Clones share the storage by refcount; the last handle returns it to the
/// pool. Mutation is only allowed while the handle is unique — this is a
/// usage contract, not a lock, exactly like the send path requires.
pub struct ByteBuffer {
    storage: *mut StorageHeader,
}

unsafe impl Send for ByteBuffer {}
unsafe impl Sync for ByteBuffer {}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    /// An invalid handle with no storage attached.
    #[inline]
    pub fn new() -> Self {
        Self { storage: std::ptr::null_mut() }
    }

    pub fn with_capacity(capacity: u32) -> Self {
        Self { storage: Self::allocate(capacity) }
    }

    fn allocate(capacity: u32) -> *mut StorageHeader {
        let a = pool::alloc(capacity as usize + STORAGE_HEADER_SIZE as usize);
        let ptr = a.ptr.as_ptr().cast::<StorageHeader>();
        // SAFETY: the block is at least header-sized and 64-aligned.
        unsafe {
            ptr.write(StorageHeader {
                refs: AtomicU32::new(1),
                size: 0,
                offset: STORAGE_HEADER_SIZE,
                capacity: a.capacity as u32 - STORAGE_HEADER_SIZE,
            });
        }
        ptr
    }

    #[inline]
    pub fn valid(&self) -> bool {
        !self.storage.is_null()
    }

    #[inline]
    pub fn is_unique(&self) -> bool {
        self.valid() && unsafe { (*self.storage).refs.load(Ordering::Acquire) == 1 }
    }

    /// Makes the buffer empty with at least `capacity` bytes of room.
    /// Reuses the current storage in place when this handle is the only
    /// owner and the storage is large enough; allocates otherwise.
    pub fn init(&mut self, capacity: u32) {
        if !self.storage.is_null() {
            // SAFETY: handle owns a reference to the storage.
            unsafe {
                if (*self.storage).refs.load(Ordering::Acquire) == 1
                    && (*self.storage).capacity >= capacity
                {
                    self.reset_offset();
                    return;
                }
            }
            *self = ByteBuffer::new();
        }
        self.storage = Self::allocate(capacity);
    }

    /// Returns the head reservation to the storage: full capacity, zero
    /// size, payload starting right after the storage header.
    pub fn reset_offset(&mut self) {
        if self.storage.is_null() {
            return;
        }
        // SAFETY: geometry-only update; handle must be unique per contract.
        unsafe {
            let h = &mut *self.storage;
            h.capacity += h.offset - STORAGE_HEADER_SIZE;
            h.offset = STORAGE_HEADER_SIZE;
            h.size = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        if !self.storage.is_null() {
            unsafe { (*self.storage).size = 0 };
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        if self.storage.is_null() { 0 } else { unsafe { (*self.storage).size as usize } }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        if self.storage.is_null() { 0 } else { unsafe { (*self.storage).capacity as usize } }
    }

    /// Offset of the first payload byte from the allocation base.
    #[inline]
    pub fn head_offset(&self) -> usize {
        if self.storage.is_null() {
            0
        } else {
            unsafe { (*self.storage).offset as usize }
        }
    }

    /// Pointer to the first payload byte.
    #[inline]
    pub fn data(&self) -> *mut u8 {
        check!(self.valid());
        unsafe { self.storage.cast::<u8>().add((*self.storage).offset as usize) }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        if self.storage.is_null() {
            return &[];
        }
        // SAFETY: `size` bytes starting at `data()` are initialised.
        unsafe { std::slice::from_raw_parts(self.data(), self.size()) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.storage.is_null() {
            return &mut [];
        }
        // SAFETY: as above; mutation requires a unique handle per contract.
        unsafe { std::slice::from_raw_parts_mut(self.data(), self.size()) }
    }

    pub fn append(&mut self, src: &[u8]) {
        self.reserve(self.size() + src.len());
        // SAFETY: reserve guaranteed room for `src.len()` more bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data().add(self.size()), src.len());
            (*self.storage).size += src.len() as u32;
        }
    }

    /// Grows the storage to hold at least `new_capacity` payload bytes. The
    /// head offset (and so any reserved prefix) is preserved; only the live
    /// `size` bytes are copied.
    pub fn reserve(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity() && self.valid() {
            return;
        }
        if self.storage.is_null() {
            self.storage = Self::allocate(new_capacity as u32);
            return;
        }
        // SAFETY: reallocation; old storage stays intact until the copy is
        // done, then this handle's reference is dropped.
        unsafe {
            let old = self.storage;
            let old_offset = (*old).offset;
            let old_size = (*old).size;

            let fresh =
                Self::allocate(new_capacity as u32 + old_offset - STORAGE_HEADER_SIZE);
            (*fresh).capacity -= old_offset - STORAGE_HEADER_SIZE;
            (*fresh).offset = old_offset;
            (*fresh).size = old_size;
            std::ptr::copy_nonoverlapping(
                old.cast::<u8>().add(old_offset as usize),
                fresh.cast::<u8>().add(old_offset as usize),
                old_size as usize,
            );

            self.storage = fresh;
            Self::unref(old);
        }
    }

    pub fn resize(&mut self, new_size: usize) {
        if self.capacity() < new_size {
            self.reserve(new_size);
        }
        if !self.storage.is_null() {
            unsafe { (*self.storage).size = new_size as u32 };
        }
    }

    /// Reserves the fixed writer prefix in front of the payload:
    /// 4 bytes for the flags word plus up to 4 for the frame header.
    pub(crate) fn reserve_writer_prefix(&mut self) {
        check!(self.valid() && self.capacity() >= crate::wire::RESERVED_PREFIX as usize);
        unsafe {
            let h = &mut *self.storage;
            h.size = 0;
            h.capacity -= crate::wire::RESERVED_PREFIX;
            h.offset += crate::wire::RESERVED_PREFIX;
        }
    }

    /// Extends the payload backwards over `n` reserved prefix bytes, making
    /// them part of the visible frame. Used when the header is written in
    /// place just before the body.
    pub(crate) fn grow_head(&mut self, n: u32) {
        check!(self.head_offset() >= (STORAGE_HEADER_SIZE + n) as usize);
        unsafe {
            let h = &mut *self.storage;
            h.capacity += n;
            h.size += n;
            h.offset -= n;
        }
    }

    /// Stores the flags word in the reserved slot right after the storage
    /// header.
    pub(crate) fn write_reserved_flags(&mut self, flags: u32) {
        check!(self.head_offset() >= STORAGE_HEADER_SIZE as usize + 4);
        unsafe {
            self.storage
                .cast::<u8>()
                .add(STORAGE_HEADER_SIZE as usize)
                .cast::<[u8; 4]>()
                .write_unaligned(flags.to_le_bytes());
        }
    }

    unsafe fn unref(storage: *mut StorageHeader) {
        // SAFETY: caller transfers one reference.
        unsafe {
            if (*storage).refs.fetch_sub(1, Ordering::Release) == 1 {
                fence(Ordering::Acquire);
                let total = (*storage).offset + (*storage).capacity;
                pool::release(NonNull::new_unchecked(storage.cast::<u8>()), total as usize);
            }
        }
    }
}

impl Clone for ByteBuffer {
    fn clone(&self) -> Self {
        if !self.storage.is_null() {
            unsafe { (*self.storage).refs.fetch_add(1, Ordering::Relaxed) };
        }
        Self { storage: self.storage }
    }
}

impl Drop for ByteBuffer {
    fn drop(&mut self) {
        if !self.storage.is_null() {
            // SAFETY: this handle holds one reference.
            unsafe { Self::unref(self.storage) };
            self.storage = std::ptr::null_mut();
        }
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.storage.is_null() {
            return f.write_str("ByteBuffer(invalid)");
        }
        f.debug_struct("ByteBuffer")
            .field("size", &self.size())
            .field("offset", &self.head_offset())
            .field("capacity", &self.capacity())
            .finish()
    }
}

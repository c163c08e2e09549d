//! Device buffers and pinned host mappings.
//!
//! Buffers store 32-bit words so any page offset that is a multiple of the
//! element size stays naturally aligned, including for the atomic views the
//! region-update kernel takes. Byte-granular access is layered on top with
//! plain casts.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use parking_lot::Mutex;

use super::event::Event;
use super::queue::Queue;

#[derive(Debug, Default)]
struct BufferData {
    words: Vec<u32>,
    len_bytes: usize,
}

/// A typed-on-demand device buffer.
///
/// Handles are cheap clones sharing one allocation. Plain `read`/`write`
/// calls are host-synchronous; queued variants and [`PinnedBuffer::unpin`]
/// go through a [`Queue`] and return completion events.
#[derive(Clone, Debug)]
pub struct DeviceBuffer {
    storage: Arc<Mutex<BufferData>>,
}

impl DeviceBuffer {
    /// Allocate a buffer of `bytes` bytes.
    pub fn new(bytes: usize) -> Self {
        let buffer = Self {
            storage: Arc::new(Mutex::new(BufferData::default())),
        };
        buffer.resize(bytes);
        buffer
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.storage.lock().len_bytes
    }

    /// Resize to `bytes` bytes. Content up to the smaller size persists.
    pub fn resize(&self, bytes: usize) {
        let mut data = self.storage.lock();
        data.words.resize(bytes.div_ceil(4), 0);
        data.len_bytes = bytes;
    }

    /// Resize to hold `count` elements of `T`.
    pub fn elements_resize<T: bytemuck::Pod>(&self, count: usize) {
        self.resize(count * std::mem::size_of::<T>());
    }

    /// Number of complete elements of `T` the buffer holds.
    pub fn element_count<T: bytemuck::Pod>(&self) -> usize {
        self.size() / std::mem::size_of::<T>()
    }

    /// Fill every word with `word`.
    pub fn fill(&self, word: u32) {
        let mut data = self.storage.lock();
        data.words.fill(word);
    }

    /// Host-synchronous write of raw bytes at a byte offset.
    pub fn write_bytes(&self, src: &[u8], offset: usize) {
        let mut data = self.storage.lock();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut data.words);
        bytes[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Host-synchronous read of raw bytes at a byte offset.
    pub fn read_bytes(&self, dst: &mut [u8], offset: usize) {
        let data = self.storage.lock();
        let bytes: &[u8] = bytemuck::cast_slice(&data.words);
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
    }

    /// Host-synchronous typed write at an element offset.
    pub fn write_elements<T: bytemuck::Pod>(&self, src: &[T], element_offset: usize) {
        self.write_bytes(
            bytemuck::cast_slice(src),
            element_offset * std::mem::size_of::<T>(),
        );
    }

    /// Host-synchronous typed read at an element offset.
    pub fn read_elements<T: bytemuck::Pod>(&self, dst: &mut [T], element_offset: usize) {
        let byte_offset = element_offset * std::mem::size_of::<T>();
        let data = self.storage.lock();
        let bytes: &[u8] = bytemuck::cast_slice(&data.words);
        let dst_bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        dst_bytes.copy_from_slice(&bytes[byte_offset..byte_offset + dst_bytes.len()]);
    }

    /// Queue a write of `data`; the transfer runs after `wait` completes.
    pub fn write_queued(&self, queue: &Queue, data: Vec<u8>, offset: usize, wait: &[Event]) -> Event {
        let buffer = self.clone();
        queue.submit(wait, move || buffer.write_bytes(&data, offset))
    }

    /// Queue a full copy from `other` into this buffer.
    pub fn copy_from(&self, other: &DeviceBuffer, queue: &Queue, wait: &[Event]) -> Event {
        let dst = self.clone();
        let src = other.clone();
        queue.submit(wait, move || {
            let src_data = src.storage.lock();
            let mut dst_data = dst.storage.lock();
            let n = src_data.words.len().min(dst_data.words.len());
            dst_data.words[..n].copy_from_slice(&src_data.words[..n]);
        })
    }

    /// Run `f` over an atomic view of the buffer's words.
    ///
    /// Used by the region-update kernel, whose work items update voxels
    /// concurrently via compare-and-swap.
    pub(crate) fn with_atomic_words<R>(&self, f: impl FnOnce(&[AtomicU32]) -> R) -> R {
        let mut data = self.storage.lock();
        let words: &mut [u32] = &mut data.words;
        // SAFETY: AtomicU32 has the same size, alignment and bit validity
        // as u32, and the exclusive borrow is only shared through the
        // atomic view for the duration of `f`.
        let atomics = unsafe {
            std::slice::from_raw_parts(words.as_ptr() as *const AtomicU32, words.len())
        };
        f(atomics)
    }
}

/// Host-write (or host-read) mapping mode of a pinned buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinMode {
    /// Snapshot the buffer for host reads.
    Read,
    /// Stage host writes for transfer on unpin.
    Write,
}

/// A buffer mapped for host-side scatter access.
///
/// Writes land in a staging image; [`PinnedBuffer::unpin`] enqueues the
/// transfer and hands back its completion event.
pub struct PinnedBuffer {
    buffer: DeviceBuffer,
    staging: Vec<u8>,
    mode: PinMode,
}

impl PinnedBuffer {
    /// Map `buffer` with the given mode. The mapping covers the buffer's
    /// current size.
    pub fn new(buffer: &DeviceBuffer, mode: PinMode) -> Self {
        let size = buffer.size();
        let staging = match mode {
            PinMode::Read => {
                let mut bytes = vec![0u8; size];
                buffer.read_bytes(&mut bytes, 0);
                bytes
            }
            PinMode::Write => vec![0u8; size],
        };
        Self {
            buffer: buffer.clone(),
            staging,
            mode,
        }
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.staging.len()
    }

    /// Write raw bytes into the mapping at a byte offset.
    pub fn write(&mut self, src: &[u8], offset: usize) {
        self.staging[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Write typed elements into the mapping at an element offset.
    pub fn write_elements<T: bytemuck::Pod>(&mut self, src: &[T], element_offset: usize) {
        self.write(
            bytemuck::cast_slice(src),
            element_offset * std::mem::size_of::<T>(),
        );
    }

    /// Read typed elements from the mapping at an element offset.
    pub fn read_elements<T: bytemuck::Pod>(&self, dst: &mut [T], element_offset: usize) {
        let offset = element_offset * std::mem::size_of::<T>();
        let dst_bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        dst_bytes.copy_from_slice(&self.staging[offset..offset + dst_bytes.len()]);
    }

    /// Unmap, enqueueing the staged transfer after `wait`. Returns the
    /// transfer's completion event (already complete for read mappings).
    pub fn unpin(self, queue: &Queue, wait: &[Event]) -> Event {
        match self.mode {
            PinMode::Read => Event::complete(),
            PinMode::Write => self.buffer.write_queued(queue, self.staging, 0, wait),
        }
    }
}

//! Concrete implementation of the buffer/buffer-list collaborator from the
//! Glossary ("Buffer", "Buffer list"). Spec.md §1 lists the byte-buffer and
//! buffer-list abstractions among the external collaborators; this module is
//! the crate's own reference implementation of that contract (§6: "Required
//! from buffers: iteration over buffer lists, 'used' and 'available' regions
//! of a buffer, append `n` bytes to the used region"), grounded on the
//! teacher's `src/buf.rs`/`src/iovec.rs` split between an owned growable
//! buffer and a borrowed iovec view. The single-region case (`socket.rs`'s
//! `RecvTarget::Region`/`SendSource::Region`) is carried as a plain owned
//! `Box<[u8]>`/`Arc<[u8]>` rather than a borrowed type from this module,
//! since it must outlive the call and live inside an `Arc<Mutex<_>>` across
//! an async completion — a borrowed region can't satisfy that.

/// One buffer in a `BufferList`: an owned byte vector split into a `used`
/// prefix (already written) and an `available` suffix (remaining capacity).
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    used: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            storage: vec![0u8; capacity],
            used: 0,
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let used = bytes.len();
        Buffer {
            storage: bytes,
            used,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn used(&self) -> &[u8] {
        &self.storage[..self.used]
    }

    pub fn available_count(&self) -> usize {
        self.storage.len() - self.used
    }

    pub fn available_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.used..]
    }

    /// Append `n` bytes to the used region; the caller must already have
    /// written them into the slice returned by `available_mut`
    /// (spec.md §6).
    pub fn add(&mut self, n: usize) {
        assert!(n <= self.available_count(), "Buffer::add overruns capacity");
        self.used += n;
    }
}

/// Ordered sequence of `Buffer`s; the scatter/gather payload for a multi-
/// buffer `RecvV`/`SendV` (Glossary: "Buffer list").
#[derive(Debug, Clone, Default)]
pub struct BufferList {
    buffers: Vec<Buffer>,
}

impl BufferList {
    pub fn new() -> Self {
        BufferList {
            buffers: Vec::new(),
        }
    }

    pub fn push(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Buffer> {
        self.buffers.iter_mut()
    }

    pub fn total_available(&self) -> usize {
        self.buffers.iter().map(Buffer::available_count).sum()
    }

    pub fn total_used(&self) -> usize {
        self.buffers.iter().map(|b| b.used().len()).sum()
    }

    /// Advances write offsets across buffers to account for `n` freshly
    /// received bytes, in order (spec.md §4.4 "advance buffer-list write
    /// offsets").
    pub fn advance(&mut self, mut n: usize) {
        for buffer in self.buffers.iter_mut() {
            if n == 0 {
                break;
            }
            let take = n.min(buffer.available_count());
            buffer.add(take);
            n -= take;
        }
    }
}

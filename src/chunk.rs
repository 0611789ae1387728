use bytes::Bytes;

use crate::pool;
use crate::region::Region;

/// Backing storage of a chunk.
#[derive(Clone)]
pub(crate) enum Storage {
    /// A pool-backed region, owned by this chunk or aliased from another.
    Pooled(Region),
    /// Externally supplied bytes: adopted write buffers and zero-capacity
    /// placeholders. Never returned to the pool.
    External(Bytes),
}

/// One link of the buffer chain: a window onto a byte region plus the
/// read/publish/reserve offsets.
///
/// The window is `[base..base + cap)` of the underlying storage. Within it,
/// `off ≤ len ≤ malloc ≤ cap`: bytes below `off` are consumed, `[off..len)`
/// is readable, `[len..malloc)` is reserved but not yet published, and
/// `[malloc..cap)` is free.
pub(crate) struct Chunk {
    pub storage: Storage,
    pub base: usize,
    pub cap: usize,
    /// Published length (readable high-water mark).
    pub len: usize,
    /// Read offset.
    pub off: usize,
    /// Reserved high-water mark.
    pub malloc: usize,
    /// Read-only chunks alias foreign storage and are skipped by growth;
    /// their storage is never reset or rewritten.
    pub readonly: bool,
}

impl Chunk {
    /// A blank read-only header with no storage, recycled from the pool's
    /// free list when possible.
    fn blank() -> Chunk {
        pool::take_header().unwrap_or_else(|| Chunk {
            storage: Storage::External(Bytes::new()),
            base: 0,
            cap: 0,
            len: 0,
            off: 0,
            malloc: 0,
            readonly: true,
        })
    }

    /// A writable pool-backed chunk with at least `size` bytes of capacity.
    pub fn owned(size: usize) -> Chunk {
        let mut chunk = Chunk::blank();
        let region = Region::acquire(size);
        chunk.cap = region.capacity();
        chunk.storage = Storage::Pooled(region);
        chunk.readonly = false;
        chunk
    }

    /// A zero-capacity read-only chunk. Growth skips it and allocates a real
    /// chunk behind it, so it stands in wherever an empty tail is wanted
    /// without committing to a size yet.
    pub fn placeholder() -> Chunk {
        Chunk::blank()
    }

    /// A read-only chunk adopting external bytes without copying. The bytes
    /// count as reserved until a flush publishes them.
    pub fn adopted(bytes: Bytes) -> Chunk {
        let mut chunk = Chunk::blank();
        chunk.cap = bytes.len();
        chunk.malloc = bytes.len();
        chunk.storage = Storage::External(bytes);
        chunk
    }

    pub fn readable(&self) -> usize {
        self.len - self.off
    }

    pub fn free(&self) -> usize {
        self.cap - self.malloc
    }

    /// Reserved bytes not yet published.
    pub fn reserved(&self) -> usize {
        self.malloc - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.off == self.len
    }

    /// A view of the next `n` readable bytes, without consuming them.
    pub fn peek(&self, n: usize) -> &[u8] {
        debug_assert!(n <= self.readable());
        self.view(self.off, self.off + n)
    }

    /// Consumes and returns the next `n` readable bytes.
    pub fn next(&mut self, n: usize) -> &[u8] {
        debug_assert!(n <= self.readable());
        let start = self.off;
        self.off += n;
        self.view(start, start + n)
    }

    fn view(&self, from: usize, to: usize) -> &[u8] {
        match &self.storage {
            // SAFETY: `[from..to)` lies below this chunk's published length,
            // inside the window; writers only touch offsets at or beyond
            // `malloc >= len`, so the bytes are stable while borrowed.
            Storage::Pooled(region) => unsafe { region.bytes(self.base + from, self.base + to) },
            Storage::External(bytes) => &bytes[self.base + from..self.base + to],
        }
    }

    /// Reserves the next `n` free bytes and returns them for filling.
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        debug_assert!(!self.readonly && n <= self.free());
        let start = self.base + self.malloc;
        self.malloc += n;
        match &self.storage {
            // SAFETY: `[start..start + n)` was free until this call and is now
            // reserved exclusively for the returned borrow; readers never go
            // past `len` and aliases only cover published bytes.
            Storage::Pooled(region) => unsafe { region.bytes_mut(start, start + n) },
            Storage::External(_) => unreachable!("reserve on a read-only chunk"),
        }
    }

    /// Publishes all reserved bytes.
    pub fn commit(&mut self) {
        self.len = self.malloc;
    }

    /// Consumes `n` readable bytes into a new read-only chunk sharing this
    /// chunk's storage. The storage cannot be recycled until the alias (and
    /// every sibling) is dropped.
    pub fn refer(&mut self, n: usize) -> Chunk {
        debug_assert!(n <= self.readable());
        let start = self.base + self.off;
        self.off += n;
        let mut alias = Chunk::blank();
        alias.storage = self.storage.clone();
        alias.base = start;
        alias.cap = n;
        alias.len = n;
        alias.malloc = n;
        alias
    }

    /// Splits this chunk's reservation at window offset `at`
    /// (`len ≤ at ≤ malloc`). `self` keeps `[..at)` and becomes read-only;
    /// the returned continuation chunk takes over `[at..)` of the window,
    /// including the remaining reservation and free space.
    pub fn split_reserved(&mut self, at: usize) -> Chunk {
        debug_assert!(self.len <= at && at <= self.malloc);
        let mut tail = Chunk::blank();
        tail.storage = self.storage.clone();
        tail.base = self.base;
        tail.cap = self.cap;
        tail.off = at;
        tail.len = at;
        tail.malloc = self.malloc;
        tail.readonly = false;
        self.malloc = at;
        self.readonly = true;
        tail
    }

    /// Rewinds the offsets for in-place reuse. A no-op unless this chunk
    /// solely owns writable storage.
    pub fn reset(&mut self) {
        if self.readonly || !self.has_unique_storage() {
            return;
        }
        self.off = 0;
        self.len = 0;
        self.malloc = 0;
    }

    /// Drops any reservation. Owned chunks rewind for reuse; read-only ones
    /// release their storage and become placeholders.
    pub fn discard(&mut self) {
        if !self.readonly && self.has_unique_storage() {
            self.off = 0;
            self.len = 0;
            self.malloc = 0;
        } else if self.readonly {
            self.clear();
        } else {
            // Shared storage: keep published bytes, drop the reservation.
            self.malloc = self.len;
        }
    }

    /// Strips the chunk back to a blank header, dropping its storage.
    pub fn clear(&mut self) {
        self.storage = Storage::External(Bytes::new());
        self.base = 0;
        self.cap = 0;
        self.len = 0;
        self.off = 0;
        self.malloc = 0;
        self.readonly = true;
    }

    fn has_unique_storage(&self) -> bool {
        match &self.storage {
            Storage::Pooled(region) => region.is_unique(),
            Storage::External(_) => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Chunk, Storage};
    use bytes::Bytes;

    #[test]
    fn reserve_commit_consume() {
        let mut chunk = Chunk::owned(16);
        assert_eq!(chunk.readable(), 0);
        chunk.reserve(5).copy_from_slice(b"hello");
        assert_eq!(chunk.readable(), 0, "reserved bytes are not readable");
        assert_eq!(chunk.reserved(), 5);
        chunk.commit();
        assert_eq!(chunk.readable(), 5);
        assert_eq!(chunk.peek(5), b"hello");
        assert_eq!(chunk.next(2), b"he");
        assert_eq!(chunk.readable(), 3);
        assert_eq!(chunk.next(3), b"llo");
        assert!(chunk.is_empty());
    }

    #[test]
    fn placeholder_has_no_capacity() {
        let chunk = Chunk::placeholder();
        assert!(chunk.readonly);
        assert_eq!(chunk.free(), 0);
        assert_eq!(chunk.readable(), 0);
    }

    #[test]
    fn adopted_bytes_publish_on_commit() {
        let mut chunk = Chunk::adopted(Bytes::from_static(b"payload"));
        assert!(chunk.readonly);
        assert_eq!(chunk.readable(), 0);
        assert_eq!(chunk.reserved(), 7);
        chunk.commit();
        assert_eq!(chunk.peek(7), b"payload");
    }

    #[test]
    fn refer_blocks_reset_until_dropped() {
        let mut origin = Chunk::owned(8);
        origin.reserve(6).copy_from_slice(b"abcdef");
        origin.commit();

        let alias = origin.refer(4);
        assert!(alias.readonly);
        assert_eq!(alias.peek(4), b"abcd");
        assert_eq!(origin.readable(), 2, "refer consumes from the origin");

        origin.off = origin.len;
        origin.reset();
        assert_eq!(origin.len, 6, "reset is a no-op while an alias lives");

        drop(alias);
        origin.reset();
        assert_eq!(origin.len, 0);
        assert_eq!(origin.malloc, 0);
    }

    #[test]
    fn refer_from_alias_shares_the_same_storage() {
        let mut origin = Chunk::owned(8);
        origin.reserve(4).copy_from_slice(b"wxyz");
        origin.commit();
        let mut alias = origin.refer(4);
        let nested = alias.refer(2);
        assert_eq!(nested.peek(2), b"wx");
        match (&nested.storage, &origin.storage) {
            (Storage::Pooled(a), Storage::Pooled(b)) => {
                assert!(!a.is_unique());
                assert!(!b.is_unique());
            }
            _ => panic!("expected pooled storage"),
        }
    }

    #[test]
    fn split_reserved_hands_over_the_tail() {
        let mut chunk = Chunk::owned(16);
        chunk.reserve(3).copy_from_slice(b"abc");
        chunk.commit();
        chunk.reserve(6).copy_from_slice(b"defghi");

        let mut tail = chunk.split_reserved(5);
        assert!(chunk.readonly);
        assert_eq!(chunk.reserved(), 2, "head keeps [len..at)");
        assert_eq!(tail.reserved(), 4, "tail takes [at..malloc)");
        assert!(!tail.readonly);
        assert_eq!(tail.readable(), 0);

        chunk.commit();
        tail.commit();
        assert_eq!(chunk.next(3), b"abc");
        assert_eq!(chunk.next(2), b"de");
        assert_eq!(tail.next(4), b"fghi");
    }

    #[test]
    fn discard_rewinds_owned_chunks() {
        let mut chunk = Chunk::owned(8);
        chunk.reserve(4).copy_from_slice(b"data");
        chunk.discard();
        assert_eq!(chunk.reserved(), 0);
        assert_eq!(chunk.free(), chunk.cap);
    }
}

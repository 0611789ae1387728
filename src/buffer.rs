use std::borrow::Cow;
use std::cmp;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Buf, Bytes};

use crate::chunk::Chunk;
use crate::error::Error;
use crate::pool;
use crate::region::Region;
use crate::settings;
use crate::{Reader, Writer};

/// A zero-copy linked byte buffer.
///
/// Bytes flow in at the tail (reserve with [`malloc`], publish with
/// [`flush`]) and out at the head ([`next`], [`peek`], [`skip`], ...).
/// Storage is a chain of chunks partitioned by the read, flush, and write
/// cursors, with the chain head as the fourth: `[head..read)` is consumed and
/// recyclable, `[read..flush]` is readable, and `(flush..write]` holds
/// reservations that no reader can observe until a flush publishes them.
///
/// Reads that stay inside one chunk and [`slice`] are zero-copy: they hand
/// out views into (or aliases of) the chunks themselves. A buffer is owned by
/// at most one producer and one consumer at a time; only [`len`] may be read
/// without external synchronization.
///
/// [`malloc`]: Writer::malloc
/// [`flush`]: Writer::flush
/// [`next`]: Reader::next
/// [`peek`]: Reader::peek
/// [`skip`]: Reader::skip
/// [`slice`]: Reader::slice
/// [`len`]: LinkBuffer::len
pub struct LinkBuffer {
    /// Total readable bytes across `[read..flush]`.
    length: AtomicUsize,
    /// Reserved bytes not yet published.
    malloc_size: usize,
    /// The chunk chain; the front is the chain head.
    chunks: VecDeque<Chunk>,
    read: usize,
    flush: usize,
    write: usize,
    /// Regions backing cross-chunk copies, freed on release.
    caches: Vec<Region>,
    chunk_cap: usize,
    readonly: bool,
}

impl LinkBuffer {
    /// An empty buffer. The first reservation allocates its first real chunk.
    pub fn new() -> Self {
        Self::build(0, settings::chunk_cap())
    }

    /// An empty buffer whose first chunk holds at least `size` bytes.
    pub fn with_capacity(size: usize) -> Self {
        Self::build(size, settings::chunk_cap())
    }

    /// An empty buffer growing by chunks of roughly `chunk_cap` bytes
    /// instead of the process-wide [`settings::chunk_cap`]. Mostly useful to
    /// exercise chunk boundaries without touching global state.
    pub fn with_chunk_cap(chunk_cap: usize) -> Self {
        Self::build(0, chunk_cap.max(1))
    }

    fn build(size: usize, chunk_cap: usize) -> Self {
        let first = if size == 0 {
            Chunk::placeholder()
        } else {
            Chunk::owned(cmp::max(size, chunk_cap))
        };
        let mut chunks = VecDeque::with_capacity(4);
        chunks.push_back(first);
        LinkBuffer {
            length: AtomicUsize::new(0),
            malloc_size: 0,
            chunks,
            read: 0,
            flush: 0,
            write: 0,
            caches: Vec::new(),
            chunk_cap,
            readonly: false,
        }
    }

    /// Readable byte count. The only operation that is safe to call from the
    /// producer side while the consumer owns the buffer, and vice versa.
    pub fn len(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserved, unpublished byte count.
    pub fn malloc_len(&self) -> usize {
        self.malloc_size
    }

    fn recal_len(&self, delta: isize) -> usize {
        if delta >= 0 {
            self.length.fetch_add(delta as usize, Ordering::AcqRel) + delta as usize
        } else {
            let d = delta.unsigned_abs();
            self.length.fetch_sub(d, Ordering::AcqRel) - d
        }
    }

    fn ensure_writable(&self) -> Result<(), Error> {
        if self.readonly {
            return Err(Error::InvalidArgument {
                reason: "buffer is read-only",
            });
        }
        if self.chunks.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "buffer is closed",
            });
        }
        Ok(())
    }

    // ---- reader side ----

    fn do_next(&mut self, n: usize) -> Result<&[u8], Error> {
        if n == 0 {
            return Ok(&[]);
        }
        if self.len() < n {
            return Err(Error::NotEnough { requested: n });
        }
        self.recal_len(-(n as isize));
        if self.is_single_node(n) {
            return Ok(self.chunks[self.read].next(n));
        }
        // The bytes span chunks: gather them into a cache region that stays
        // alive until the next release.
        let region = Region::acquire(n);
        let mut filled = 0;
        let mut ack = n;
        loop {
            let node = &mut self.chunks[self.read];
            let l = node.readable();
            if l >= ack {
                // SAFETY: the cache region was freshly acquired above and is
                // uniquely referenced; `[filled..n)` is in bounds.
                unsafe { region.copy_in(filled, node.next(ack)) };
                break;
            } else if l > 0 {
                // SAFETY: as above.
                unsafe { region.copy_in(filled, node.next(l)) };
                filled += l;
                ack -= l;
            }
            self.read += 1;
        }
        self.caches.push(region);
        // SAFETY: `[0..n)` was just filled with published bytes; the region
        // lives in `caches` until a release, which needs `&mut self` and so
        // cannot happen while the returned borrow is alive.
        Ok(unsafe { self.caches[self.caches.len() - 1].bytes(0, n) })
    }

    fn do_peek(&mut self, n: usize) -> Result<&[u8], Error> {
        if n == 0 {
            return Ok(&[]);
        }
        if self.len() < n {
            return Err(Error::NotEnough { requested: n });
        }
        if self.is_single_node(n) {
            return Ok(self.chunks[self.read].peek(n));
        }
        let region = Region::acquire(n);
        let mut filled = 0;
        let mut idx = self.read;
        while filled < n {
            let node = &self.chunks[idx];
            let take = cmp::min(node.readable(), n - filled);
            if take > 0 {
                // SAFETY: as in `do_next`.
                unsafe { region.copy_in(filled, node.peek(take)) };
                filled += take;
            }
            idx += 1;
        }
        self.caches.push(region);
        // SAFETY: as in `do_next`.
        Ok(unsafe { self.caches[self.caches.len() - 1].bytes(0, n) })
    }

    fn do_skip(&mut self, n: usize) -> Result<(), Error> {
        if n == 0 {
            return Ok(());
        }
        if self.len() < n {
            return Err(Error::NotEnough { requested: n });
        }
        self.recal_len(-(n as isize));
        let mut ack = n;
        loop {
            let node = &mut self.chunks[self.read];
            let l = node.readable();
            if l >= ack {
                node.off += ack;
                return Ok(());
            }
            ack -= l;
            self.read += 1;
        }
    }

    fn do_release(&mut self) {
        while self.read != self.flush && self.chunks[self.read].is_empty() {
            self.read += 1;
        }
        while self.read > 0 {
            if let Some(chunk) = self.chunks.pop_front() {
                pool::recycle_header(chunk);
            }
            self.read -= 1;
            self.flush -= 1;
            self.write -= 1;
        }
        self.caches.clear();
    }

    fn do_read_binary(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if self.len() < n {
            return Err(Error::NotEnough { requested: n });
        }
        self.recal_len(-(n as isize));
        // Ownership transfers to the caller, so the copy is a plain heap
        // allocation rather than a pooled region.
        let mut p = vec![0u8; n];
        let mut filled = 0;
        let mut ack = n;
        loop {
            let node = &mut self.chunks[self.read];
            let l = node.readable();
            if l >= ack {
                p[filled..filled + ack].copy_from_slice(node.next(ack));
                return Ok(p);
            } else if l > 0 {
                p[filled..filled + l].copy_from_slice(node.next(l));
                filled += l;
                ack -= l;
            }
            self.read += 1;
        }
    }

    fn do_read_string(&mut self, n: usize) -> Result<String, Error> {
        let p = self.do_read_binary(n)?;
        String::from_utf8(p).map_err(|_| Error::InvalidArgument {
            reason: "read_string bytes are not valid utf-8",
        })
    }

    fn do_read_byte(&mut self) -> Result<u8, Error> {
        if self.len() < 1 {
            return Err(Error::Empty);
        }
        self.recal_len(-1);
        loop {
            let node = &mut self.chunks[self.read];
            if node.readable() >= 1 {
                return Ok(node.next(1)[0]);
            }
            self.read += 1;
        }
    }

    fn do_until(&mut self, delim: u8) -> Result<&[u8], Error> {
        match self.index_byte(delim, 0) {
            Some(i) => self.do_next(i + 1),
            None => Err(Error::DelimiterNotFound { delim }),
        }
    }

    fn do_slice(&mut self, n: usize) -> Result<LinkBuffer, Error> {
        if n == 0 {
            let mut empty = LinkBuffer::with_chunk_cap(self.chunk_cap);
            empty.readonly = true;
            return Ok(empty);
        }
        if self.len() < n {
            return Err(Error::NotEnough { requested: n });
        }
        self.recal_len(-(n as isize));
        let mut parts = VecDeque::new();
        let mut ack = n;
        loop {
            let node = &mut self.chunks[self.read];
            let l = node.readable();
            if l >= ack {
                parts.push_back(node.refer(ack));
                break;
            } else if l > 0 {
                parts.push_back(node.refer(l));
                ack -= l;
            }
            self.read += 1;
        }
        let last = parts.len() - 1;
        let sliced = LinkBuffer {
            length: AtomicUsize::new(n),
            malloc_size: 0,
            chunks: parts,
            read: 0,
            flush: last,
            write: last,
            caches: Vec::new(),
            chunk_cap: self.chunk_cap,
            readonly: true,
        };
        self.do_release();
        Ok(sliced)
    }

    /// Position of the first `delim` in the readable span after skipping
    /// `skip` bytes, relative to the read cursor.
    fn index_byte(&self, delim: u8, mut skip: usize) -> Option<usize> {
        let size = self.len();
        if skip >= size {
            return None;
        }
        let mut unread = size;
        let mut idx = self.read;
        while unread > 0 && idx < self.chunks.len() {
            let node = &self.chunks[idx];
            let n = cmp::min(node.readable(), unread);
            if skip >= n {
                skip -= n;
            } else if let Some(i) = memchr::memchr(delim, &node.peek(n)[skip..]) {
                return Some((size - unread) + skip + i);
            } else {
                skip = 0;
            }
            unread -= n;
            idx += 1;
        }
        None
    }

    /// Advances the read cursor past drained chunks and reports whether the
    /// next `n` readable bytes sit in one chunk. Requires `len() >= n > 0`.
    fn is_single_node(&mut self, n: usize) -> bool {
        debug_assert!(n > 0);
        loop {
            let l = self.chunks[self.read].readable();
            if l > 0 {
                return l >= n;
            }
            self.read += 1;
        }
    }

    // ---- writer side ----

    fn do_malloc(&mut self, n: usize) -> Result<&mut [u8], Error> {
        if n == 0 {
            return Ok(&mut []);
        }
        self.ensure_writable()?;
        self.malloc_size += n;
        self.growth(n);
        Ok(self.chunks[self.write].reserve(n))
    }

    fn do_malloc_ack(&mut self, n: usize) -> Result<(), Error> {
        self.ensure_writable()?;
        if n > self.malloc_size {
            return Err(Error::InvalidArgument {
                reason: "malloc_ack count exceeds the reserved length",
            });
        }
        self.malloc_size = n;
        self.write = self.flush;
        let mut ack = n;
        loop {
            let last = self.write + 1 == self.chunks.len();
            let node = &mut self.chunks[self.write];
            let reserved = node.reserved();
            if reserved >= ack || last {
                node.malloc = node.len + cmp::min(ack, reserved);
                break;
            }
            ack -= reserved;
            self.write += 1;
        }
        // Discard every reservation past the new write chunk; owned chunks
        // rewind in place for reuse.
        for idx in self.write + 1..self.chunks.len() {
            self.chunks[idx].discard();
        }
        Ok(())
    }

    fn do_flush(&mut self) -> Result<(), Error> {
        self.ensure_writable()?;
        self.malloc_size = 0;
        // An oversized tail would pin its region under later small writes;
        // park the write cursor on a fresh empty tail instead.
        if self.chunks[self.write].cap > settings::page_size() {
            if self.write + 1 == self.chunks.len() {
                self.chunks.push_back(Chunk::placeholder());
            }
            self.write += 1;
        }
        let mut published = 0;
        for idx in self.flush..=self.write {
            let node = &mut self.chunks[idx];
            let delta = node.reserved();
            if delta > 0 {
                published += delta;
                node.commit();
            }
        }
        self.flush = self.write;
        self.recal_len(published as isize);
        Ok(())
    }

    fn do_write_binary(&mut self, p: Bytes) -> Result<usize, Error> {
        self.ensure_writable()?;
        let n = p.len();
        if n == 0 {
            return Ok(0);
        }
        self.malloc_size += n;
        if n > settings::binary_inplace_threshold() {
            // Large writes adopt the caller's bytes as a read-only tail chunk
            // instead of copying; flush publishes them like any reservation.
            self.splice_tail(Chunk::adopted(p));
            return Ok(n);
        }
        let mut src = &p[..];
        while !src.is_empty() {
            self.growth(1);
            let node = &mut self.chunks[self.write];
            let take = cmp::min(node.free(), src.len());
            node.reserve(take).copy_from_slice(&src[..take]);
            src = &src[take..];
        }
        Ok(n)
    }

    fn do_write_string(&mut self, s: String) -> Result<usize, Error> {
        self.do_write_binary(Bytes::from(s.into_bytes()))
    }

    fn do_write_direct(&mut self, p: Bytes, remain: usize) -> Result<(), Error> {
        self.ensure_writable()?;
        if remain > self.malloc_size {
            return Err(Error::InvalidArgument {
                reason: "write_direct remain count exceeds the reserved length",
            });
        }
        let n = p.len();
        if n == 0 {
            return Ok(());
        }
        // Walk the reservation from the flush cursor to the chunk holding the
        // insertion point: everything reserved so far except the trailing
        // `remain` bytes the caller has already promised.
        let mut idx = self.flush;
        let mut pos = self.malloc_size - remain;
        while idx < self.write && self.chunks[idx].reserved() <= pos {
            pos -= self.chunks[idx].reserved();
            idx += 1;
        }
        let at = {
            let origin = &self.chunks[idx];
            origin.len + cmp::min(pos, origin.reserved())
        };
        let tail = self.chunks[idx].split_reserved(at);
        self.chunks.insert(idx + 1, Chunk::adopted(p));
        self.chunks.insert(idx + 2, tail);
        self.write = self.chunks.len() - 1;
        self.malloc_size += n;
        Ok(())
    }

    fn do_write_byte(&mut self, b: u8) -> Result<(), Error> {
        let dst = self.do_malloc(1)?;
        dst[0] = b;
        Ok(())
    }

    fn do_write_buffer(&mut self, mut other: LinkBuffer) -> Result<(), Error> {
        self.ensure_writable()?;
        let incoming_len = other.len();
        let incoming_reserved = other.malloc_len();
        if incoming_len + incoming_reserved == 0 {
            return Ok(());
        }
        // Strip the donor down to [read..=write]: its consumed head and
        // anything stranded past its write cursor go back to the pool.
        let consumed = other.read;
        for _ in 0..consumed {
            if let Some(chunk) = other.chunks.pop_front() {
                pool::recycle_header(chunk);
            }
        }
        other.read = 0;
        other.flush -= consumed;
        other.write -= consumed;
        while other.chunks.len() > other.write + 1 {
            if let Some(chunk) = other.chunks.pop_back() {
                pool::recycle_header(chunk);
            }
        }
        // Same for our own stranded tail chunks before splicing.
        while self.chunks.len() > self.write + 1 {
            if let Some(chunk) = self.chunks.pop_back() {
                pool::recycle_header(chunk);
            }
        }
        let settled = self.malloc_size == 0
            && self.flush == self.write
            && self.chunks[self.write].reserved() == 0;
        let base = self.chunks.len();
        let donor_flush = other.flush;
        while let Some(chunk) = other.chunks.pop_front() {
            self.chunks.push_back(chunk);
        }
        if settled {
            // No reservation pending on our side: the donor's readable chunks
            // become readable here immediately.
            self.flush = base + donor_flush;
        }
        self.write = self.chunks.len() - 1;
        other.read = 0;
        other.flush = 0;
        other.write = 0;
        other.length.store(0, Ordering::Release);
        other.malloc_size = 0;
        self.recal_len(incoming_len as isize);
        self.malloc_size += incoming_reserved;
        Ok(())
    }

    fn do_close(&mut self) {
        self.length.store(0, Ordering::Release);
        self.malloc_size = 0;
        while let Some(chunk) = self.chunks.pop_front() {
            pool::recycle_header(chunk);
        }
        self.read = 0;
        self.flush = 0;
        self.write = 0;
        self.caches.clear();
    }

    /// Advances the write cursor to a chunk with at least `n` contiguous free
    /// bytes, appending one when the chain runs out. Skipped chunks keep
    /// whatever free capacity they have; a reservation is never split.
    fn growth(&mut self, n: usize) {
        loop {
            let node = &self.chunks[self.write];
            if !node.readonly && node.free() >= n {
                return;
            }
            if self.write + 1 == self.chunks.len() {
                self.chunks
                    .push_back(Chunk::owned(cmp::max(n, self.chunk_cap)));
                self.write = self.chunks.len() - 1;
                return;
            }
            self.write += 1;
        }
    }

    /// Splices `chunk` in right behind the write cursor and parks the cursor
    /// on it.
    fn splice_tail(&mut self, chunk: Chunk) {
        if self.write + 1 == self.chunks.len() {
            self.chunks.push_back(chunk);
        } else {
            self.chunks.insert(self.write + 1, chunk);
        }
        self.write += 1;
    }

    // ---- connection-facing hooks ----

    /// All readable bytes: a borrowed view when they sit in one chunk, a
    /// gathered copy otherwise. Cursors are untouched.
    pub fn bytes(&self) -> Cow<'_, [u8]> {
        if self.chunks.is_empty() {
            return Cow::Borrowed(&[]);
        }
        if self.read == self.flush {
            let node = &self.chunks[self.read];
            return Cow::Borrowed(node.peek(node.readable()));
        }
        let mut p = Vec::with_capacity(self.len());
        for idx in self.read..=self.flush {
            let node = &self.chunks[idx];
            if node.readable() > 0 {
                p.extend_from_slice(node.peek(node.readable()));
            }
        }
        Cow::Owned(p)
    }

    /// Fills `slots` with per-chunk views of the readable span, skipping
    /// drained chunks, and returns how many were filled. No bytes move.
    pub fn get_bytes<'a>(&'a self, slots: &mut [&'a [u8]]) -> usize {
        if self.chunks.is_empty() {
            return 0;
        }
        let mut filled = 0;
        for idx in self.read..=self.flush {
            if filled == slots.len() {
                break;
            }
            let node = &self.chunks[idx];
            let l = node.readable();
            if l > 0 {
                slots[filled] = node.peek(l);
                filled += 1;
            }
        }
        filled
    }

    /// Reserves up to `book_size` contiguous bytes on the tail for a socket
    /// read, appending a chunk of `max_size` when the tail is full. The view
    /// never spans chunks; commit it with [`book_ack`].
    ///
    /// [`book_ack`]: LinkBuffer::book_ack
    pub fn book(&mut self, book_size: usize, max_size: usize) -> &mut [u8] {
        if self.readonly || self.chunks.is_empty() {
            return &mut [];
        }
        loop {
            let node = &self.chunks[self.write];
            if !node.readonly && node.free() > 0 {
                break;
            }
            if self.write + 1 == self.chunks.len() {
                self.chunks
                    .push_back(Chunk::owned(cmp::max(max_size, self.chunk_cap)));
            }
            self.write += 1;
        }
        let node = &mut self.chunks[self.write];
        let l = cmp::min(node.free(), book_size);
        node.reserve(l)
    }

    /// Publishes the first `n` bytes of the most recent [`book`], drops the
    /// rest of that reservation, and returns the new readable length.
    ///
    /// [`book`]: LinkBuffer::book
    pub fn book_ack(&mut self, n: usize) -> Result<usize, Error> {
        self.ensure_writable()?;
        let flush = self.write;
        let node = &mut self.chunks[flush];
        if n > node.reserved() {
            return Err(Error::InvalidArgument {
                reason: "book_ack count exceeds the booked reservation",
            });
        }
        node.malloc = node.len + n;
        node.commit();
        self.flush = flush;
        Ok(self.recal_len(n as isize))
    }

    /// Bytes accumulated between the last two releases; the socket layer
    /// sizes its next read burst from this.
    pub fn calc_max_size(&self) -> usize {
        let mut sum = 0;
        for idx in 0..=self.read {
            if let Some(node) = self.chunks.get(idx) {
                sum += node.len;
            }
        }
        sum
    }

    /// Rewinds the tail chunk for reuse, or parks the write cursor on a fresh
    /// empty tail when `max_size` outgrew the page threshold.
    pub fn reset_tail(&mut self, max_size: usize) {
        if self.readonly || self.chunks.is_empty() {
            return;
        }
        if max_size <= settings::page_size() {
            self.chunks[self.write].reset();
            return;
        }
        if self.write + 1 == self.chunks.len() {
            self.chunks.push_back(Chunk::placeholder());
        }
        self.write += 1;
        self.flush = self.write;
    }
}

impl Reader for LinkBuffer {
    fn len(&self) -> usize {
        LinkBuffer::len(self)
    }

    fn next(&mut self, n: usize) -> Result<&[u8], Error> {
        self.do_next(n)
    }

    fn peek(&mut self, n: usize) -> Result<&[u8], Error> {
        self.do_peek(n)
    }

    fn skip(&mut self, n: usize) -> Result<(), Error> {
        self.do_skip(n)
    }

    fn release(&mut self) {
        self.do_release()
    }

    fn read_string(&mut self, n: usize) -> Result<String, Error> {
        self.do_read_string(n)
    }

    fn read_binary(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        self.do_read_binary(n)
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        self.do_read_byte()
    }

    fn until(&mut self, delim: u8) -> Result<&[u8], Error> {
        self.do_until(delim)
    }

    fn slice(&mut self, n: usize) -> Result<LinkBuffer, Error> {
        self.do_slice(n)
    }
}

impl Writer for LinkBuffer {
    fn malloc(&mut self, n: usize) -> Result<&mut [u8], Error> {
        self.do_malloc(n)
    }

    fn malloc_len(&self) -> usize {
        LinkBuffer::malloc_len(self)
    }

    fn malloc_ack(&mut self, n: usize) -> Result<(), Error> {
        self.do_malloc_ack(n)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.do_flush()
    }

    fn append(&mut self, other: LinkBuffer) -> Result<(), Error> {
        self.do_write_buffer(other)
    }

    fn write_buffer(&mut self, other: LinkBuffer) -> Result<(), Error> {
        self.do_write_buffer(other)
    }

    fn write_string(&mut self, s: String) -> Result<usize, Error> {
        self.do_write_string(s)
    }

    fn write_binary(&mut self, p: Bytes) -> Result<usize, Error> {
        self.do_write_binary(p)
    }

    fn write_direct(&mut self, p: Bytes, remain: usize) -> Result<(), Error> {
        self.do_write_direct(p, remain)
    }

    fn write_byte(&mut self, b: u8) -> Result<(), Error> {
        self.do_write_byte(b)
    }

    fn close(&mut self) {
        self.do_close()
    }
}

/// Draining reads over the readable span, for codecs that speak `bytes`.
impl Buf for LinkBuffer {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn chunk(&self) -> &[u8] {
        if self.chunks.is_empty() {
            return &[];
        }
        for idx in self.read..=self.flush {
            let node = &self.chunks[idx];
            if node.readable() > 0 {
                return node.peek(node.readable());
            }
        }
        &[]
    }

    fn advance(&mut self, cnt: usize) {
        if cnt == 0 {
            return;
        }
        if self.do_skip(cnt).is_err() {
            panic!("advanced past end");
        }
    }
}

impl Default for LinkBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LinkBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkBuffer")
            .field("len", &self.len())
            .field("malloc_len", &self.malloc_size)
            .field("chunks", &self.chunks.len())
            .field("readonly", &self.readonly)
            .finish()
    }
}

impl Drop for LinkBuffer {
    fn drop(&mut self) {
        self.do_close();
    }
}

#[cfg(test)]
mod test {
    use super::LinkBuffer;
    use crate::chunk::Storage;
    use crate::error::Error;
    use crate::{Reader, Writer};
    use bytes::{Buf, Bytes};

    fn filled(chunk_cap: usize, data: &[u8]) -> LinkBuffer {
        let mut buf = LinkBuffer::with_chunk_cap(chunk_cap);
        buf.write_binary(Bytes::copy_from_slice(data)).unwrap();
        buf.flush().unwrap();
        buf
    }

    #[test]
    fn malloc_then_flush_publishes() {
        let mut buf = LinkBuffer::new();
        let dst = buf.malloc(5).unwrap();
        dst.copy_from_slice(b"hello");
        assert_eq!(buf.len(), 0, "reserved bytes are invisible to readers");
        assert_eq!(buf.malloc_len(), 5);
        buf.flush().unwrap();
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.malloc_len(), 0);
        assert_eq!(buf.next(5).unwrap(), b"hello");
    }

    #[test]
    fn growth_skips_partially_free_chunks() {
        let mut buf = LinkBuffer::with_chunk_cap(8);
        buf.malloc(5).unwrap();
        // 3 bytes free in the tail, but the reservation must be contiguous.
        buf.malloc(6).unwrap();
        buf.flush().unwrap();
        assert_eq!(buf.len(), 11);
        let views = {
            let mut slots = [&[][..]; 4];
            let n = buf.get_bytes(&mut slots);
            slots[..n].iter().map(|s| s.len()).collect::<Vec<_>>()
        };
        assert_eq!(views, vec![5, 6]);
    }

    #[test]
    fn write_binary_packs_existing_free_space() {
        let buf = filled(8, b"helloworld!");
        let mut slots = [&[][..]; 4];
        let n = buf.get_bytes(&mut slots);
        assert_eq!(n, 2);
        assert_eq!(slots[0], b"hellowor");
        assert_eq!(slots[1], b"ld!");
    }

    #[test]
    fn release_recycles_consumed_chunks() {
        let mut buf = filled(4, b"abcdefgh");
        buf.next(6).unwrap();
        buf.release();
        // The first chunk was fully consumed and popped; the second is now
        // the head.
        assert_eq!(buf.read, 0);
        assert_eq!(buf.bytes().as_ref(), b"gh");
        assert!(buf.caches.is_empty());
    }

    #[test]
    fn cross_chunk_next_caches_until_release() {
        let mut buf = filled(4, b"abcdefgh");
        assert_eq!(buf.next(6).unwrap(), b"abcdef");
        assert_eq!(buf.caches.len(), 1);
        buf.release();
        assert!(buf.caches.is_empty());
    }

    #[test]
    fn malloc_ack_discards_excess_reservation() {
        let mut buf = LinkBuffer::with_chunk_cap(8);
        buf.malloc(10).unwrap();
        buf.malloc(5).unwrap();
        assert_eq!(buf.malloc_len(), 15);
        buf.malloc_ack(12).unwrap();
        assert_eq!(buf.malloc_len(), 12);
        buf.flush().unwrap();
        assert_eq!(buf.len(), 12);
        assert!(matches!(
            buf.malloc_ack(1),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn malloc_ack_zero_discards_everything() {
        let mut buf = LinkBuffer::new();
        buf.malloc(64).unwrap();
        buf.malloc_ack(0).unwrap();
        assert_eq!(buf.malloc_len(), 0);
        buf.flush().unwrap();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn flush_parks_cursor_off_oversized_tail() {
        let mut buf = LinkBuffer::new();
        let oversized = crate::settings::page_size() * 2;
        buf.malloc(oversized).unwrap();
        buf.flush().unwrap();
        let tail = &buf.chunks[buf.write];
        assert_eq!(tail.cap, 0, "write cursor sits on a fresh empty tail");
        // The next reservation allocates a normal chunk behind it.
        buf.malloc(16).unwrap();
        assert!(buf.chunks[buf.write].cap <= crate::settings::page_size());
    }

    #[test]
    fn adopted_write_is_not_copied() {
        let mut buf = LinkBuffer::new();
        let big = Bytes::from(vec![0x5a; crate::settings::binary_inplace_threshold() + 1]);
        let payload = big.clone();
        buf.write_binary(big).unwrap();
        assert_eq!(buf.malloc_len(), payload.len());
        buf.flush().unwrap();
        let view = buf.next(payload.len()).unwrap();
        assert_eq!(view, &payload[..]);
        assert_eq!(
            view.as_ptr(),
            payload.as_ptr(),
            "the adopted chunk aliases the caller's bytes"
        );
    }

    #[test]
    fn write_direct_splices_into_the_reservation() {
        let mut buf = LinkBuffer::new();
        let header = buf.malloc(4).unwrap();
        header.copy_from_slice(b"LEN:");
        let trailer = buf.malloc(2).unwrap();
        trailer.copy_from_slice(b"\r\n");
        // Insert the body between header and trailer without copying it.
        buf.write_direct(Bytes::from_static(b"payload"), 2).unwrap();
        buf.flush().unwrap();
        assert_eq!(buf.len(), 13);
        assert_eq!(buf.next(13).unwrap(), b"LEN:payload\r\n");
    }

    #[test]
    fn write_direct_validates_remain() {
        let mut buf = LinkBuffer::new();
        buf.malloc(4).unwrap();
        assert!(matches!(
            buf.write_direct(Bytes::from_static(b"x"), 5),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn book_then_ack_publishes_one_chunk() {
        let mut buf = LinkBuffer::new();
        let dst = buf.book(8, 1 << 13);
        assert!(dst.len() <= 8);
        dst[..3].copy_from_slice(b"abc");
        let len = buf.book_ack(3).unwrap();
        assert_eq!(len, 3);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.next(3).unwrap(), b"abc");
        assert!(matches!(
            buf.book_ack(1 << 20),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn book_appends_when_tail_is_full() {
        let mut buf = LinkBuffer::with_chunk_cap(4);
        let dst = buf.book(4, 4);
        dst.copy_from_slice(b"abcd");
        buf.book_ack(4).unwrap();
        let chunks_before = buf.chunks.len();
        let dst = buf.book(4, 16);
        assert_eq!(dst.len(), 4);
        assert!(buf.chunks.len() > chunks_before);
    }

    #[test]
    fn reset_tail_rewinds_or_parks() {
        let mut buf = LinkBuffer::new();
        let dst = buf.book(4, 8);
        dst[..4].copy_from_slice(b"abcd");
        buf.book_ack(4).unwrap();
        buf.next(4).unwrap();
        buf.release();
        buf.reset_tail(8);
        assert_eq!(buf.chunks[buf.write].free(), buf.chunks[buf.write].cap);

        buf.reset_tail(crate::settings::page_size() + 1);
        assert_eq!(buf.chunks[buf.write].cap, 0);
        assert_eq!(buf.flush, buf.write);
    }

    #[test]
    fn slice_shares_storage_and_unpins_on_drop() {
        let mut buf = filled(4, b"ABCDEFGH");
        let mut sliced = buf.slice(6).unwrap();
        assert_eq!(sliced.len(), 6);
        assert_eq!(buf.len(), 2);

        // The source's remaining chunk is pinned by the alias.
        let pinned = match &buf.chunks[buf.read].storage {
            Storage::Pooled(region) => !region.is_unique(),
            Storage::External(_) => false,
        };
        assert!(pinned);

        assert_eq!(sliced.next(6).unwrap(), b"ABCDEF");
        assert!(matches!(
            sliced.malloc(1),
            Err(Error::InvalidArgument { .. })
        ));
        drop(sliced);

        let pinned = match &buf.chunks[buf.read].storage {
            Storage::Pooled(region) => !region.is_unique(),
            Storage::External(_) => false,
        };
        assert!(!pinned, "dropping the slice releases its aliases");
        assert_eq!(buf.next(2).unwrap(), b"GH");
    }

    #[test]
    fn write_buffer_transplants_readable_and_reserved() {
        let mut a = LinkBuffer::new();
        a.write_binary(Bytes::from(vec![b'a'; 100])).unwrap();
        a.flush().unwrap();

        let mut b = LinkBuffer::new();
        b.write_binary(Bytes::from(vec![b'b'; 50])).unwrap();
        b.flush().unwrap();
        b.malloc(30).unwrap();

        a.write_buffer(b).unwrap();
        assert_eq!(a.len(), 150);
        assert_eq!(a.malloc_len(), 30);
        assert_eq!(a.bytes().len(), 150, "donor readable bytes are readable");
        a.flush().unwrap();
        assert_eq!(a.len(), 180);
    }

    #[test]
    fn buf_impl_drains_across_chunks() {
        let mut buf = filled(4, b"abcdefgh");
        assert_eq!(buf.remaining(), 8);
        assert_eq!(Buf::chunk(&buf), b"abcd");
        buf.advance(6);
        assert_eq!(buf.remaining(), 2);
        assert_eq!(Buf::chunk(&buf), b"gh");
    }

    #[test]
    fn calc_max_size_counts_up_to_the_read_chunk() {
        let mut buf = filled(4, b"abcdefgh");
        buf.next(6).unwrap();
        assert_eq!(buf.calc_max_size(), 8);
    }

    #[test]
    fn closed_buffer_rejects_writes() {
        let mut buf = LinkBuffer::new();
        buf.close();
        assert!(matches!(buf.malloc(1), Err(Error::InvalidArgument { .. })));
        buf.close(); // idempotent
        assert_eq!(buf.len(), 0);
    }
}

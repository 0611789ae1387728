//! Buffer tuning knobs, each overridable once at startup through the
//! environment.

use once_cell::sync::Lazy;

const BLOCK_4K: usize = 1 << 12;
const BLOCK_8K: usize = 1 << 13;
const BLOCK_8M: usize = 1 << 23;

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

static CHUNK_CAP: Lazy<usize> = Lazy::new(|| env_usize("LINKBUF_CHUNK_CAP", BLOCK_4K));

static BINARY_INPLACE_THRESHOLD: Lazy<usize> =
    Lazy::new(|| env_usize("LINKBUF_BINARY_INPLACE_THRESHOLD", BLOCK_4K));

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| env_usize("LINKBUF_PAGE_SIZE", BLOCK_8K));

static MALLOC_MAX: Lazy<usize> = Lazy::new(|| env_usize("LINKBUF_MALLOC_MAX", BLOCK_8M));

/// Minimum capacity of a pool-backed chunk (default 4 KiB, env
/// `LINKBUF_CHUNK_CAP`). [`LinkBuffer::with_chunk_cap`] overrides this per
/// buffer.
///
/// [`LinkBuffer::with_chunk_cap`]: crate::LinkBuffer::with_chunk_cap
pub fn chunk_cap() -> usize {
    *CHUNK_CAP
}

/// Writes larger than this adopt the caller's buffer as a read-only chunk
/// instead of copying (default 4 KiB, env `LINKBUF_BINARY_INPLACE_THRESHOLD`).
pub fn binary_inplace_threshold() -> usize {
    *BINARY_INPLACE_THRESHOLD
}

/// Flushing a tail chunk larger than this appends a fresh empty tail so the
/// oversized region is not pinned by subsequent small writes (default 8 KiB,
/// env `LINKBUF_PAGE_SIZE`).
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Upper bound for pool-backed allocation (default 8 MiB, env
/// `LINKBUF_MALLOC_MAX`). Larger regions come from the general heap and are
/// never recycled.
pub fn malloc_max() -> usize {
    *MALLOC_MAX
}

//! Process-wide chunk pool: power-of-two buckets of raw byte regions plus a
//! free list of blank chunk headers.
//!
//! Regions with a power-of-two capacity up to [`malloc_max`] are recycled;
//! anything larger comes from the general heap and is dropped on release.
//!
//! [`malloc_max`]: crate::settings::malloc_max

use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;

use crate::chunk::Chunk;
use crate::settings;

/// Regions retained per bucket before further releases are dropped.
const BUCKET_KEEP: usize = 32;
/// Blank headers retained on the free list.
const HEADER_KEEP: usize = 128;

struct Buckets {
    shelves: Vec<Mutex<Vec<Box<[u8]>>>>,
}

static REGIONS: Lazy<Buckets> = Lazy::new(|| {
    let max = settings::malloc_max().next_power_of_two();
    let count = max.trailing_zeros() as usize + 1;
    Buckets {
        shelves: (0..count).map(|_| Mutex::new(Vec::new())).collect(),
    }
});

static HEADERS: Lazy<Mutex<Vec<Chunk>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Returns a zero-initialized or recycled region of at least `capacity`
/// bytes. Capacities up to [`settings::malloc_max`] are rounded up to a power
/// of two; larger requests fall back to an exact heap allocation.
pub(crate) fn acquire(capacity: usize) -> Box<[u8]> {
    debug_assert!(capacity > 0);
    if capacity > settings::malloc_max() {
        return vec![0u8; capacity].into_boxed_slice();
    }
    let cap = capacity.next_power_of_two();
    let shelf = cap.trailing_zeros() as usize;
    let recycled = REGIONS.shelves[shelf]
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop();
    match recycled {
        Some(buf) => buf,
        None => vec![0u8; cap].into_boxed_slice(),
    }
}

/// Returns a region to its bucket. Regions whose capacity is not a power of
/// two or exceeds [`settings::malloc_max`] are dropped instead.
pub(crate) fn release(buf: Box<[u8]>) {
    let cap = buf.len();
    if cap == 0 || !cap.is_power_of_two() || cap > settings::malloc_max() {
        return;
    }
    let shelf = cap.trailing_zeros() as usize;
    let mut bucket = REGIONS.shelves[shelf]
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if bucket.len() < BUCKET_KEEP {
        bucket.push(buf);
    }
}

/// Pops a blank header off the free list, if any.
pub(crate) fn take_header() -> Option<Chunk> {
    HEADERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop()
}

/// Strips a chunk back to a blank header and shelves it. Dropping the chunk's
/// storage here is what releases its region (or its adopted bytes).
pub(crate) fn recycle_header(mut chunk: Chunk) {
    chunk.clear();
    let mut headers = HEADERS.lock().unwrap_or_else(PoisonError::into_inner);
    if headers.len() < HEADER_KEEP {
        headers.push(chunk);
    }
}

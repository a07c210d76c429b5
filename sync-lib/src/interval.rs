use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Closed range of block numbers, `start <= end`. A single block is `[n, n]`.
///
/// Sets of ranges are kept canonical everywhere in this crate: sorted
/// ascending, disjoint, and maximally merged (adjacent ranges collapse,
/// `[0,3]` + `[4,7]` = `[0,7]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "invalid block range [{start}, {end}]");
        Self { start, end }
    }

    /// Number of blocks covered, inclusive of both bounds.
    pub fn block_count(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, block: u64) -> bool {
        self.start <= block && block <= self.end
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Sort and merge an arbitrary list of ranges into canonical form.
pub fn normalize(mut ranges: Vec<BlockRange>) -> Vec<BlockRange> {
    ranges.sort();
    ranges
        .into_iter()
        .coalesce(|prev, next| {
            // Merge overlapping and adjacent ranges.
            if next.start <= prev.end.saturating_add(1) {
                Ok(BlockRange::new(prev.start, prev.end.max(next.end)))
            } else {
                Err((prev, next))
            }
        })
        .collect()
}

/// Union of two canonical sets.
pub fn union(a: &[BlockRange], b: &[BlockRange]) -> Vec<BlockRange> {
    normalize(a.iter().chain(b.iter()).copied().collect())
}

/// Intersection of two canonical sets.
pub fn intersection(a: &[BlockRange], b: &[BlockRange]) -> Vec<BlockRange> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let start = a[i].start.max(b[j].start);
        let end = a[i].end.min(b[j].end);
        if start <= end {
            out.push(BlockRange::new(start, end));
        }
        // Advance whichever range ends first.
        if a[i].end < b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

/// Ranges covered by `a` but not by `b`. Both inputs canonical.
pub fn difference(a: &[BlockRange], b: &[BlockRange]) -> Vec<BlockRange> {
    let mut out = Vec::new();
    let mut j = 0;
    for range in a {
        let mut cursor = range.start;
        while j < b.len() && b[j].end < cursor {
            j += 1;
        }
        let mut k = j;
        while k < b.len() && b[k].start <= range.end {
            if b[k].start > cursor {
                out.push(BlockRange::new(cursor, b[k].start - 1));
            }
            cursor = b[k].end.saturating_add(1);
            if cursor > range.end {
                break;
            }
            k += 1;
        }
        if cursor <= range.end {
            out.push(BlockRange::new(cursor, range.end));
        }
    }
    out
}

/// Total number of blocks covered by a canonical set.
pub fn total_blocks(ranges: &[BlockRange]) -> u64 {
    ranges.iter().map(BlockRange::block_count).sum()
}

/// Split each range into consecutive chunks spanning at most
/// `max_chunk_size`, preserving order. Chunk boundaries sit on multiples of
/// the chunk size, so ranges produced across separate runs (or restored from
/// a partially synced cache) split along the same grid. Used to honor
/// per-source `eth_getLogs` range limits.
pub fn chunks(ranges: &[BlockRange], max_chunk_size: u64) -> Vec<BlockRange> {
    let max_chunk_size = max_chunk_size.max(1);
    let mut out = Vec::new();
    for range in ranges {
        let mut start = range.start;
        loop {
            let boundary = (start / max_chunk_size)
                .saturating_add(1)
                .saturating_mul(max_chunk_size);
            let end = range.end.min(boundary);
            out.push(BlockRange::new(start, end));
            if end >= range.end {
                break;
            }
            start = end + 1;
        }
    }
    out
}

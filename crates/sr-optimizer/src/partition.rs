//! Contiguous, near-equal splitting of the ordered region list across workers.

use sr_types::PartitionError;

use crate::search::IndexedRegion;

/// An ordered, non-empty run of regions assigned to exactly one worker.
pub type Chunk = Vec<IndexedRegion>;

/// Split `items` into exactly `n` contiguous chunks.
///
/// Split point `i` sits at `round(i * len / n)` with ties rounded to even, so
/// chunk sizes are `floor(len / n)` or `ceil(len / n)` and concatenating the
/// chunks in order gives back `items`. Fails when `n` is zero or larger than
/// `len`, since some chunk would then be empty.
pub fn split_contiguous<T>(items: Vec<T>, n: usize) -> Result<Vec<Vec<T>>, PartitionError> {
    let len = items.len();
    if n == 0 || n > len {
        return Err(PartitionError::InvalidPartition { requested: n, len });
    }

    let mut chunks = Vec::with_capacity(n);
    let mut rest = items.into_iter();
    for i in 0..n {
        let size = split_point(i + 1, len, n) - split_point(i, len, n);
        chunks.push(rest.by_ref().take(size).collect());
    }
    Ok(chunks)
}

/// Sizes of the chunks [`split_contiguous`] would produce.
pub fn chunk_sizes(len: usize, n: usize) -> Result<Vec<usize>, PartitionError> {
    if n == 0 || n > len {
        return Err(PartitionError::InvalidPartition { requested: n, len });
    }
    Ok((0..n)
        .map(|i| split_point(i + 1, len, n) - split_point(i, len, n))
        .collect())
}

/// `round(i * len / n)`, half to even, in integer arithmetic.
fn split_point(i: usize, len: usize, n: usize) -> usize {
    let scaled = i * len;
    let quotient = scaled / n;
    let twice_remainder = 2 * (scaled % n);
    if twice_remainder > n || (twice_remainder == n && quotient % 2 == 1) {
        quotient + 1
    } else {
        quotient
    }
}

/// Keep only regions at or after the resume offset.
pub fn apply_offset(regions: Vec<IndexedRegion>, offset: Option<usize>) -> Vec<IndexedRegion> {
    match offset {
        Some(start) => regions.into_iter().filter(|r| r.index >= start).collect(),
        None => regions,
    }
}

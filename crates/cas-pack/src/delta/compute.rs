//! Compute deltas between objects.
//!
//! Implements a simplified version of git's diff-delta algorithm. A rolling
//! hash indexes overlapping `BLOCK_SIZE`-byte windows of the source so that
//! matches don't need to land on a fixed grid; the target is then scanned
//! for windows with an equal hash, extending any hit as far as it will go.
//! Matching regions become copy instructions; non-matching regions become
//! insert instructions.

use std::collections::HashMap;

use super::{encode_copy, encode_insert, write_varint};

/// Block size for the rolling hash (must be a power of 2 for efficiency).
const BLOCK_SIZE: usize = 16;

/// Compute a delta that transforms `source` into `target`, with no size cap.
///
/// Returns the raw delta byte stream that can be applied with `apply_delta`.
/// Convenience wrapper over [`try_compute_delta`] for callers that don't need
/// the write-time size budget (tests, ad-hoc tooling).
pub fn compute_delta(source: &[u8], target: &[u8]) -> Vec<u8> {
    try_compute_delta(source, target, usize::MAX).expect("unbounded delta always fits")
}

/// Compute a delta transforming `source` into `target`, abandoning early if
/// the instruction stream would exceed `max_size` bytes.
///
/// This is the routine the pack writer's delta search (the sliding window
/// over candidate bases) calls for every `(base, target)` pair it considers:
/// most candidate pairs are poor matches, and the incremental size check
/// lets those be rejected without paying for a full target scan.
pub fn try_compute_delta(source: &[u8], target: &[u8], max_size: usize) -> Option<Vec<u8>> {
    let mut delta = Vec::new();

    delta.extend_from_slice(&write_varint(source.len()));
    delta.extend_from_slice(&write_varint(target.len()));
    if delta.len() > max_size {
        return None;
    }

    if target.is_empty() {
        return Some(delta);
    }

    let index = build_block_index(source);

    let mut tpos = 0;
    let mut pending_insert: Vec<u8> = Vec::new();
    let mut hash = RollingHash::new();
    if target.len() >= BLOCK_SIZE {
        hash.init(&target[..BLOCK_SIZE]);
    }

    while tpos < target.len() {
        let remaining = target.len() - tpos;

        let candidate = if remaining >= BLOCK_SIZE {
            index.get(&hash.value()).and_then(|offsets| {
                offsets
                    .iter()
                    .copied()
                    .find(|&src_offset| source[src_offset..src_offset + BLOCK_SIZE] == target[tpos..tpos + BLOCK_SIZE])
            })
        } else {
            None
        };

        if let Some(src_offset) = candidate {
            let match_len = extend_match(source, src_offset, target, tpos);

            flush_insert(&mut delta, &mut pending_insert);
            emit_copy(&mut delta, src_offset, match_len);
            if delta.len() > max_size {
                return None;
            }
            tpos += match_len;
            if tpos + BLOCK_SIZE <= target.len() {
                hash.init(&target[tpos..tpos + BLOCK_SIZE]);
            }
            continue;
        }

        pending_insert.push(target[tpos]);
        if tpos + BLOCK_SIZE < target.len() {
            hash.roll(target[tpos], target[tpos + BLOCK_SIZE]);
        }
        tpos += 1;

        if pending_insert.len() == 127 {
            flush_insert(&mut delta, &mut pending_insert);
            if delta.len() > max_size {
                return None;
            }
        }
    }

    flush_insert(&mut delta, &mut pending_insert);
    if delta.len() > max_size {
        return None;
    }

    Some(delta)
}

/// A Rabin-style rolling hash over a fixed-width window, letting the index
/// be consulted at every byte offset in the target rather than only at
/// `BLOCK_SIZE` boundaries.
struct RollingHash {
    value: u64,
}

const ROLL_BASE: u64 = 1_099_511_628_211; // FNV prime, doubles as a rolling multiplier
const ROLL_POW: u64 = {
    // ROLL_BASE ^ (BLOCK_SIZE - 1), computed at compile time via repeated squaring by hand
    let mut p: u64 = 1;
    let mut i = 0;
    while i < BLOCK_SIZE - 1 {
        p = p.wrapping_mul(ROLL_BASE);
        i += 1;
    }
    p
};

impl RollingHash {
    fn new() -> Self {
        Self { value: 0 }
    }

    fn init(&mut self, window: &[u8]) {
        debug_assert_eq!(window.len(), BLOCK_SIZE);
        let mut v: u64 = 0;
        for &b in window {
            v = v.wrapping_mul(ROLL_BASE).wrapping_add(b as u64);
        }
        self.value = v;
    }

    fn roll(&mut self, leaving: u8, entering: u8) {
        self.value = self
            .value
            .wrapping_sub((leaving as u64).wrapping_mul(ROLL_POW));
        self.value = self.value.wrapping_mul(ROLL_BASE).wrapping_add(entering as u64);
    }

    fn value(&self) -> u64 {
        self.value
    }
}

/// Build a hash map from BLOCK_SIZE chunks of source to their offsets.
///
/// Every offset (not just non-overlapping ones) is indexed so that the
/// rolling hash in the target can find a match starting anywhere.
fn build_block_index(source: &[u8]) -> HashMap<u64, Vec<usize>> {
    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
    if source.len() < BLOCK_SIZE {
        return index;
    }
    let mut hash = RollingHash::new();
    hash.init(&source[..BLOCK_SIZE]);
    index.entry(hash.value()).or_default().push(0);
    for offset in 1..=source.len() - BLOCK_SIZE {
        hash.roll(source[offset - 1], source[offset + BLOCK_SIZE - 1]);
        index.entry(hash.value()).or_default().push(offset);
    }
    index
}

/// Extend a match between source[src_off..] and target[tgt_off..] as far as possible.
fn extend_match(source: &[u8], src_off: usize, target: &[u8], tgt_off: usize) -> usize {
    let max_len = std::cmp::min(source.len() - src_off, target.len() - tgt_off);
    let mut len = BLOCK_SIZE;
    while len < max_len && source[src_off + len] == target[tgt_off + len] {
        len += 1;
    }
    len
}

/// Flush pending insert bytes as one or more insert instructions.
fn flush_insert(delta: &mut Vec<u8>, pending: &mut Vec<u8>) {
    while !pending.is_empty() {
        let chunk_len = std::cmp::min(pending.len(), 127);
        let chunk: Vec<u8> = pending.drain(..chunk_len).collect();
        delta.extend_from_slice(&encode_insert(&chunk));
    }
}

/// Emit a copy instruction, splitting into multiple if needed (max copy size = 0xffffff).
fn emit_copy(delta: &mut Vec<u8>, offset: usize, mut size: usize) {
    let mut off = offset;
    while size > 0 {
        let chunk = std::cmp::min(size, 0x00ff_ffff); // max 24-bit size
        delta.extend_from_slice(&encode_copy(off as u64, chunk));
        off += chunk;
        size -= chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::apply::apply_delta;

    #[test]
    fn identical_objects() {
        let data = b"Hello, World! This is a test of delta compression.";
        let delta = compute_delta(data, data);
        let result = apply_delta(data, &delta).unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn completely_different() {
        let source = b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let target = b"BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
        let delta = compute_delta(source, target);
        let result = apply_delta(source, &delta).unwrap();
        assert_eq!(result, target);
    }

    #[test]
    fn empty_target() {
        let source = b"something";
        let target = b"";
        let delta = compute_delta(source, target);
        let result = apply_delta(source, &delta).unwrap();
        assert_eq!(result, target.as_slice());
    }

    #[test]
    fn empty_source() {
        let source = b"";
        let target = b"new content here";
        let delta = compute_delta(source, target);
        let result = apply_delta(source, &delta).unwrap();
        assert_eq!(result, target);
    }

    #[test]
    fn prepend_data() {
        // Source has a block that's reused in target, just with a prefix
        let source = b"0123456789abcdef0123456789abcdef"; // 32 bytes
        let mut target = b"PREPENDED_".to_vec();
        target.extend_from_slice(source);
        let delta = compute_delta(source, &target);
        let result = apply_delta(source, &delta).unwrap();
        assert_eq!(result, target);
    }

    #[test]
    fn append_data() {
        let source = b"0123456789abcdef0123456789abcdef"; // 32 bytes
        let mut target = source.to_vec();
        target.extend_from_slice(b"_APPENDED");
        let delta = compute_delta(source, &target);
        let result = apply_delta(source, &delta).unwrap();
        assert_eq!(result, target);
    }

    #[test]
    fn large_similar_objects() {
        // Simulate two versions of a file with minor changes
        let source: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
        let mut target = source.clone();
        // Change a few bytes in the middle
        target[2048] = 0xFF;
        target[2049] = 0xFE;
        target[2050] = 0xFD;

        let delta = compute_delta(&source, &target);
        let result = apply_delta(&source, &delta).unwrap();
        assert_eq!(result, target);

        // Delta should be smaller than the full target
        assert!(delta.len() < target.len());
    }

    #[test]
    fn bounded_delta_gives_up_when_too_small() {
        let source = b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let target = b"BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
        // Completely dissimilar objects: the delta is all-insert and larger
        // than either object, so a tiny budget must fail.
        assert!(try_compute_delta(source, target, 2).is_none());
    }

    #[test]
    fn bounded_delta_succeeds_within_budget() {
        let source: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
        let mut target = source.clone();
        target[2048] = 0xFF;

        let delta = try_compute_delta(&source, &target, target.len()).unwrap();
        let result = apply_delta(&source, &delta).unwrap();
        assert_eq!(result, target);
    }

    #[test]
    fn rolling_hash_finds_unaligned_matches() {
        // The matching region in `target` starts at an offset that is not a
        // multiple of BLOCK_SIZE within `source`, which a fixed-grid index
        // (stepping by BLOCK_SIZE) would miss.
        let mut source = vec![0u8; 5];
        source.extend_from_slice(b"this sixteen+ byte run repeats verbatim");
        let mut target = vec![9u8; 3];
        target.extend_from_slice(b"this sixteen+ byte run repeats verbatim");

        let delta = compute_delta(&source, &target);
        let result = apply_delta(&source, &delta).unwrap();
        assert_eq!(result, target);
        assert!(delta.len() < target.len());
    }
}

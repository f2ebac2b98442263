// src/core/buffer/chain.rs

//! `BufChain`: a reference-counted, possibly segmented byte sequence with
//! cheap split, append and consume operations.
//!
//! A chain owns a small vector of segment descriptors. Each segment holds a
//! shared handle to an immutable byte region plus its own `[start, end)`
//! window into that region. Shared regions are never mutated after
//! publication unless the segment is uniquely owned, so any number of
//! shallow clones can read the same bytes concurrently. Consuming from the
//! front only advances `start`; trimming from the back only retracts `end`.

use std::any::Any;
use std::sync::Arc;

use bitflags::bitflags;

use super::hint::RoutingHint;
use crate::core::SqlGateError;

bitflags! {
    /// Buffer classification bits carried alongside the bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufType: u32 {
        /// Rows of the reply should be collected for checksumming.
        const COLLECT_ROWS   = 0b0001;
        /// The whole result should be collected before forwarding.
        const COLLECT_RESULT = 0b0010;
        /// The buffer is a replayed copy, not the client original.
        const REPLAYED       = 0b0100;
    }
}

/// One descriptor into a shared byte region.
#[derive(Debug, Clone)]
struct Segment {
    region: Arc<Vec<u8>>,
    start: usize,
    end: usize,
}

impl Segment {
    fn new(region: Arc<Vec<u8>>) -> Self {
        let end = region.len();
        Segment { region, start: 0, end }
    }

    fn len(&self) -> usize {
        self.end - self.start
    }

    fn as_slice(&self) -> &[u8] {
        &self.region[self.start..self.end]
    }

    fn is_shared(&self) -> bool {
        Arc::strong_count(&self.region) > 1
    }
}

/// A possibly segmented, reference-counted byte chain.
///
/// Cloning is deliberately not derived: `shallow_clone` and `deep_clone`
/// are explicit so ownership of the underlying regions stays visible at
/// every call site.
#[derive(Debug, Default)]
pub struct BufChain {
    segments: Vec<Segment>,
    type_mask: BufType,
    hints: Vec<RoutingHint>,
    protocol_info: Option<Arc<dyn Any + Send + Sync>>,
}

impl BufChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a chain owning the given bytes as a single segment.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let mut chain = Self::new();
        if !data.is_empty() {
            chain.segments.push(Segment::new(Arc::new(data)));
        }
        chain
    }

    /// Creates a chain by copying the given slice.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Total number of payload bytes across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.len() == 0)
    }

    /// Number of segments currently linked into the chain.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Appends another chain. The other chain's segments are moved in
    /// wholesale; its hints and protocol info are dropped.
    pub fn append(&mut self, mut other: BufChain) {
        self.segments.append(&mut other.segments);
    }

    /// Appends raw bytes. If the tail segment's region is uniquely owned and
    /// the segment window ends at the region's end, the region is extended
    /// in place; otherwise a new segment is allocated. Existing readers of
    /// sibling segments are never invalidated.
    pub fn append_bytes(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(tail) = self.segments.last_mut()
            && tail.end == tail.region.len()
            && let Some(region) = Arc::get_mut(&mut tail.region)
        {
            region.extend_from_slice(data);
            tail.end = region.len();
            return;
        }
        self.segments.push(Segment::new(Arc::new(data.to_vec())));
    }

    /// Consumes up to `n` bytes from the front, saturating at the chain
    /// length. Returns the number of bytes actually consumed. Fully
    /// consumed segments are unlinked.
    pub fn consume(&mut self, n: usize) -> usize {
        let mut left = n;
        let mut drop_to = 0;
        for seg in self.segments.iter_mut() {
            if left == 0 {
                break;
            }
            let take = left.min(seg.len());
            seg.start += take;
            left -= take;
            if seg.len() == 0 {
                drop_to += 1;
            } else {
                break;
            }
        }
        self.segments.drain(..drop_to);
        n - left
    }

    /// Consumes exactly `n` bytes or fails with `Underflow` without
    /// modifying the chain.
    pub fn consume_exact(&mut self, n: usize) -> Result<(), SqlGateError> {
        if n > self.len() {
            return Err(SqlGateError::Underflow);
        }
        self.consume(n);
        Ok(())
    }

    /// Splits off the front `n` bytes (saturating at the chain length) as an
    /// independent chain, leaving the remainder behind. Zero copy: only
    /// segment windows are adjusted. The split-off head inherits the type
    /// mask, hints and protocol info.
    pub fn split_front(&mut self, n: usize) -> BufChain {
        let mut head_segments = Vec::new();
        let mut left = n;
        let mut idx = 0;
        while left > 0 && idx < self.segments.len() {
            let seg = &mut self.segments[idx];
            if seg.len() <= left {
                left -= seg.len();
                idx += 1;
            } else {
                // Partial segment: the head gets a narrowed window over the
                // same region, the remainder keeps the rest.
                let mut front = seg.clone();
                front.end = front.start + left;
                seg.start = front.end;
                head_segments.extend(self.segments.drain(..idx));
                head_segments.push(front);
                return BufChain {
                    segments: head_segments,
                    type_mask: self.type_mask,
                    hints: self.hints.clone(),
                    protocol_info: self.protocol_info.clone(),
                };
            }
        }
        head_segments.extend(self.segments.drain(..idx));
        BufChain {
            segments: head_segments,
            type_mask: self.type_mask,
            hints: self.hints.clone(),
            protocol_info: self.protocol_info.clone(),
        }
    }

    /// Trims `n` bytes off the back. Over-trimming leaves the chain
    /// empty-but-present: all segments are unlinked, the value itself
    /// (mask, hints) survives.
    pub fn rtrim(&mut self, n: usize) {
        let mut left = n;
        while left > 0 {
            let Some(tail) = self.segments.last_mut() else {
                break;
            };
            let take = left.min(tail.len());
            tail.end -= take;
            left -= take;
            if tail.len() == 0 {
                self.segments.pop();
            }
        }
    }

    /// Best-effort copy-out: copies `min(n, len - offset)` bytes starting at
    /// `offset` into `dst`, returning the number of bytes copied.
    pub fn copy_data(&self, offset: usize, n: usize, dst: &mut [u8]) -> usize {
        let mut skipped = 0;
        let mut copied = 0;
        let want = n.min(dst.len());
        for seg in &self.segments {
            let bytes = seg.as_slice();
            let seg_off = if skipped < offset {
                let skip = (offset - skipped).min(bytes.len());
                skipped += skip;
                skip
            } else {
                0
            };
            if skipped < offset {
                continue;
            }
            let avail = &bytes[seg_off..];
            let take = avail.len().min(want - copied);
            dst[copied..copied + take].copy_from_slice(&avail[..take]);
            copied += take;
            if copied == want {
                break;
            }
        }
        copied
    }

    /// Returns the byte at logical offset `offset`, if within bounds.
    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        let mut skipped = 0;
        for seg in &self.segments {
            if offset < skipped + seg.len() {
                return Some(seg.as_slice()[offset - skipped]);
            }
            skipped += seg.len();
        }
        None
    }

    /// Iterates over all payload bytes in order.
    pub fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.segments.iter().flat_map(|s| s.as_slice().iter().copied())
    }

    /// Copies the full payload into a fresh vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for seg in &self.segments {
            out.extend_from_slice(seg.as_slice());
        }
        out
    }

    /// Collapses the chain into a single segment holding all current bytes
    /// and returns a slice over it. A single-segment chain is returned
    /// as-is.
    pub fn make_contiguous(&mut self) -> &[u8] {
        if self.segments.len() > 1 {
            let merged = self.to_vec();
            self.segments.clear();
            self.segments.push(Segment::new(Arc::new(merged)));
        }
        self.segments.first().map(Segment::as_slice).unwrap_or(&[])
    }

    /// Clones segment headers while sharing the underlying regions. Use only
    /// for in-flight duplication (e.g. tee); long-term storage requires
    /// `deep_clone`.
    pub fn shallow_clone(&self) -> BufChain {
        BufChain {
            segments: self.segments.clone(),
            type_mask: self.type_mask,
            hints: self.hints.clone(),
            protocol_info: self.protocol_info.clone(),
        }
    }

    /// Copies all bytes into one fresh region and drops auxiliary metadata
    /// (hints and cached protocol info). The type mask is kept.
    pub fn deep_clone(&self) -> BufChain {
        let mut chain = BufChain::from_vec(self.to_vec());
        chain.type_mask = self.type_mask;
        chain
    }

    /// Copies any shared region so that subsequent writes through this chain
    /// cannot be observed by sibling clones.
    pub fn ensure_unique(&mut self) {
        for seg in self.segments.iter_mut() {
            if seg.is_shared() {
                let copy = seg.as_slice().to_vec();
                seg.region = Arc::new(copy);
                seg.start = 0;
                seg.end = seg.region.len();
            }
        }
    }

    /// Overwrites the byte at logical offset `offset`. The caller must have
    /// called `ensure_unique` first; writing into a shared region is a
    /// logic error and is refused.
    pub fn write_at(&mut self, offset: usize, value: u8) -> Result<(), SqlGateError> {
        let mut skipped = 0;
        for seg in self.segments.iter_mut() {
            if offset < skipped + seg.len() {
                let idx = seg.start + (offset - skipped);
                let region = Arc::get_mut(&mut seg.region)
                    .ok_or_else(|| SqlGateError::Internal("write into shared region".into()))?;
                region[idx] = value;
                return Ok(());
            }
            skipped += seg.len();
        }
        Err(SqlGateError::Underflow)
    }

    // --- type mask ---

    pub fn type_mask(&self) -> BufType {
        self.type_mask
    }

    pub fn set_type(&mut self, mask: BufType) {
        self.type_mask |= mask;
    }

    pub fn has_type(&self, mask: BufType) -> bool {
        self.type_mask.contains(mask)
    }

    // --- routing hints ---

    pub fn add_hint(&mut self, hint: RoutingHint) {
        self.hints.push(hint);
    }

    pub fn hints(&self) -> &[RoutingHint] {
        &self.hints
    }

    pub fn take_hints(&mut self) -> Vec<RoutingHint> {
        std::mem::take(&mut self.hints)
    }

    // --- protocol info ---

    pub fn set_protocol_info(&mut self, info: Arc<dyn Any + Send + Sync>) {
        self.protocol_info = Some(info);
    }

    pub fn protocol_info(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.protocol_info.as_ref()
    }
}

impl PartialEq for BufChain {
    /// Logical byte equality, independent of segmentation.
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.bytes().eq(other.bytes())
    }
}

impl From<Vec<u8>> for BufChain {
    fn from(data: Vec<u8>) -> Self {
        BufChain::from_vec(data)
    }
}

use crate::invariants::report_invariant;
use crate::limits::{self, MIN_FRAME_BUFFER_SIZE};
use crate::types::{ByteCount, MAX_BYTE_COUNT};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::warn;


/// Fatal reassembly error: the peer fragmented the stream into more
/// tracked gaps than the configured budget. The caller must close the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("too many gaps in received data")]
pub struct TooManyGaps;

/// Notification that a pushed payload is no longer referenced by the
/// sorter. Fires exactly once: explicitly via [`ReleaseHandle::release`],
/// or implicitly when the handle is dropped.
pub struct ReleaseHandle(Option<Box<dyn FnOnce() + Send>>);

impl ReleaseHandle {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(callback)))
    }

    pub fn release(mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReleaseHandle")
    }
}

/// A stream region not yet received, as the half-open range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteInterval {
    start: ByteCount,
    end: ByteCount,
}

struct QueueEntry {
    data: Bytes,
    done: Option<ReleaseHandle>,
}

enum InsertOutcome {
    Inserted,
    Duplicate,
    TooManyGaps,
}

/// Reassembles a contiguous byte stream from offset-tagged segments that
/// may arrive out of order, overlap, or repeat.
///
/// Contiguous data is delivered in order exactly once through [`pop`].
/// The sorter is single-owner: callers serialize `push` and `pop`
/// themselves, typically from the receive loop.
///
/// [`pop`]: FrameSorter::pop
pub struct FrameSorter {
    /// Queued segments keyed by start offset. Entries never overlap once
    /// a push completes.
    queue: HashMap<ByteCount, QueueEntry>,
    read_pos: ByteCount,
    /// Unreceived regions, sorted, disjoint, never mergeable, always
    /// terminated by the open-ended tail interval.
    gaps: VecDeque<ByteInterval>,
    max_gaps: usize,
}

impl FrameSorter {
    pub fn new() -> Self {
        Self::with_max_gaps(limits::max_sorter_gaps())
    }

    /// Sorter with an explicit gap budget, for callers that negotiate
    /// their own limits.
    pub fn with_max_gaps(max_gaps: usize) -> Self {
        let mut gaps = VecDeque::new();
        gaps.push_back(ByteInterval {
            start: 0,
            end: MAX_BYTE_COUNT,
        });
        Self {
            queue: HashMap::new(),
            read_pos: 0,
            gaps,
            max_gaps,
        }
    }

    /// Accepts a segment of stream data starting at `offset`.
    ///
    /// Returns `Ok` both on genuine insertion and on a recognized
    /// duplicate; a duplicate fires the release handle before returning.
    /// Fails only when the gap budget would be exceeded, which is fatal
    /// for the connection. Offsets at or beyond [`MAX_BYTE_COUNT`] are a
    /// caller bug; window enforcement rejects them long before this
    /// point.
    pub fn push(
        &mut self,
        data: Bytes,
        offset: ByteCount,
        done: Option<ReleaseHandle>,
    ) -> Result<(), TooManyGaps> {
        let mut done = done;
        let outcome = self.insert(data, offset, &mut done);
        // The gap list mutates on the fatal path too; every outcome goes
        // through the structural check.
        self.check_invariants("push");
        match outcome {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::Duplicate => {
                if let Some(handle) = done.take() {
                    handle.release();
                }
                Ok(())
            }
            InsertOutcome::TooManyGaps => {
                warn!(
                    "reassembly gave up: gaps={} limit={} offset={}",
                    self.gaps.len(),
                    self.max_gaps,
                    offset
                );
                // The incoming handle fires when `done` drops here.
                Err(TooManyGaps)
            }
        }
    }

    fn insert(
        &mut self,
        mut data: Bytes,
        offset: ByteCount,
        done: &mut Option<ReleaseHandle>,
    ) -> InsertOutcome {
        if data.is_empty() {
            return InsertOutcome::Duplicate;
        }

        let mut start = offset;
        let mut end = offset.saturating_add(data.len() as ByteCount);

        // Entirely below data that was already delivered or queued
        // contiguously from the front.
        if end <= self.first_gap().start {
            return InsertOutcome::Duplicate;
        }

        let (start_gap_idx, starts_in_gap) = self.find_start_gap(start);
        let (end_gap_idx, ends_in_gap) = self.find_end_gap(start_gap_idx, end);
        let start_gap_equals_end_gap = start_gap_idx == end_gap_idx;

        let start_gap = self.gaps[start_gap_idx];
        let end_gap = self.gaps[end_gap_idx];

        if (start_gap_equals_end_gap && end <= start_gap.start)
            || (!start_gap_equals_end_gap
                && start_gap.end >= end_gap.start
                && end <= start_gap.start)
        {
            return InsertOutcome::Duplicate;
        }

        // The gap list is edited through saved copies: index edits below
        // must not observe each other's mutations.
        let start_gap_end = start_gap.end;
        let end_gap_start = end_gap.start;
        let end_gap_end = end_gap.end;
        let mut adjusted_start_gap_end = false;
        let mut was_cut = false;

        let mut pos = start;
        let mut has_replaced_at_least_one = false;
        loop {
            let Some(old_len) = self
                .queue
                .get(&pos)
                .map(|entry| entry.data.len() as ByteCount)
            else {
                break;
            };
            if end - pos > old_len || (has_replaced_at_least_one && end - pos == old_len) {
                // The queued segment is shorter than what the new one
                // covers from here. Removing it drops the entry and
                // fires its release handle.
                self.queue.remove(&pos);
                pos += old_len;
                has_replaced_at_least_one = true;
            } else {
                if !has_replaced_at_least_one {
                    return InsertOutcome::Duplicate;
                }
                // The queued segment is at least as long. Cut the new
                // segment so it ends where the queued one starts.
                data.truncate((pos - start) as usize);
                end = pos;
                was_cut = true;
                break;
            }
        }

        if !starts_in_gap && !has_replaced_at_least_one {
            // The left edge reaches into filled stream. Trim the segment
            // so it begins at the start gap.
            data = data.slice((start_gap.start - start) as usize..);
            start = start_gap.start;
            was_cut = true;
        }

        let mut remove_start_gap = false;
        if start <= start_gap.start {
            if end >= start_gap.end {
                // The segment covers the whole start gap.
                remove_start_gap = true;
            } else {
                self.gaps[start_gap_idx].start = end;
            }
        } else if !has_replaced_at_least_one {
            self.gaps[start_gap_idx].end = start;
            adjusted_start_gap_end = true;
        }

        if !start_gap_equals_end_gap {
            // Every gap strictly between the two is filled by this
            // segment; drop the entry chains that ended at those gaps.
            self.delete_consecutive(start_gap_end);
            for idx in start_gap_idx + 1..end_gap_idx {
                let gap_end = self.gaps[idx].end;
                debug_assert!(gap_end < end_gap_start);
                self.delete_consecutive(gap_end);
            }
        }

        if !ends_in_gap && start != end_gap_end && end > end_gap_end {
            // The right edge reaches into filled stream. Trim the
            // segment so it ends at the end gap.
            data.truncate((end_gap_end - start) as usize);
            end = end_gap_end;
            was_cut = true;
        }

        let mut remove_end_gap = false;
        let mut split_gap = None;
        if end == end_gap_end {
            if !start_gap_equals_end_gap {
                // The segment covers the whole end gap.
                remove_end_gap = true;
            }
        } else if start_gap_equals_end_gap && adjusted_start_gap_end {
            // The segment split one gap in two.
            split_gap = Some(ByteInterval {
                start: end,
                end: start_gap_end,
            });
        } else if !start_gap_equals_end_gap {
            self.gaps[end_gap_idx].start = end;
        }

        // Structural edits, in back-to-front index order.
        if let Some(gap) = split_gap {
            self.gaps.insert(start_gap_idx + 1, gap);
        }
        if remove_end_gap {
            let _ = self.gaps.remove(end_gap_idx);
        }
        if end_gap_idx > start_gap_idx + 1 {
            let _ = self.gaps.drain(start_gap_idx + 1..end_gap_idx);
        }
        if remove_start_gap {
            let _ = self.gaps.remove(start_gap_idx);
        }

        if was_cut && data.len() < MIN_FRAME_BUFFER_SIZE {
            // A short slice of a large buffer pins the whole allocation.
            // Copy it tight and let the caller release the source now.
            data = Bytes::copy_from_slice(&data);
            if let Some(handle) = done.take() {
                handle.release();
            }
        }

        if self.gaps.len() > self.max_gaps {
            return InsertOutcome::TooManyGaps;
        }

        self.queue.insert(
            start,
            QueueEntry {
                data,
                done: done.take(),
            },
        );
        InsertOutcome::Inserted
    }

    /// Returns the next contiguous entry at the current read position and
    /// transfers ownership of its release handle, or `None` while the
    /// read position sits inside a gap.
    pub fn pop(&mut self) -> Option<(ByteCount, Bytes, Option<ReleaseHandle>)> {
        let entry = self.queue.remove(&self.read_pos)?;
        let offset = self.read_pos;
        self.read_pos += entry.data.len() as ByteCount;
        assert!(
            self.first_gap().end > self.read_pos,
            "reassembly bug: read position {} crossed a gap ending at {}",
            self.read_pos,
            self.first_gap().end,
        );
        self.check_invariants("pop");
        Some((offset, entry.data, entry.done))
    }

    /// True if any segment is queued, at any offset.
    pub fn has_more_data(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Offset of the next byte [`pop`] would deliver.
    ///
    /// [`pop`]: FrameSorter::pop
    pub fn read_pos(&self) -> ByteCount {
        self.read_pos
    }

    pub fn gap_count(&self) -> usize {
        self.gaps.len()
    }

    pub fn queued_bytes(&self) -> ByteCount {
        self.queue
            .values()
            .map(|entry| entry.data.len() as ByteCount)
            .sum()
    }

    fn first_gap(&self) -> ByteInterval {
        *self
            .gaps
            .front()
            .expect("reassembly bug: gap list must never be empty")
    }

    /// The gap containing `offset`, or the first gap after it (in which
    /// case the offset lies in filled stream).
    fn find_start_gap(&self, offset: ByteCount) -> (usize, bool) {
        for (idx, gap) in self.gaps.iter().enumerate() {
            if offset >= gap.start && offset <= gap.end {
                return (idx, true);
            }
            if offset < gap.start {
                return (idx, false);
            }
        }
        panic!("reassembly bug: no gap found for start offset {offset}");
    }

    /// The gap containing `offset - 1`, scanning forward from the start
    /// gap, or the gap before the first one that begins past `offset`.
    fn find_end_gap(&self, start_gap_idx: usize, offset: ByteCount) -> (usize, bool) {
        for idx in start_gap_idx..self.gaps.len() {
            let gap = self.gaps[idx];
            if offset >= gap.start && offset < gap.end {
                return (idx, true);
            }
            if offset < gap.start {
                return (idx - 1, false);
            }
        }
        panic!("reassembly bug: no gap found for end offset {offset}");
    }

    /// Removes queued entries chained back to back starting at `pos`.
    /// Each removal fires the entry's release handle.
    fn delete_consecutive(&mut self, mut pos: ByteCount) {
        while let Some(entry) = self.queue.remove(&pos) {
            pos += entry.data.len() as ByteCount;
        }
    }

    fn check_invariants(&self, context: &str) {
        let first = self.first_gap();
        if first.end <= self.read_pos {
            report_invariant(|| {
                format!(
                    "reassembly invariant violated: read position past first gap context={} read_pos={} gap_end={}",
                    context, self.read_pos, first.end
                )
            });
        }
        if self.gaps.back().map(|gap| gap.end) != Some(MAX_BYTE_COUNT) {
            report_invariant(|| {
                format!(
                    "reassembly invariant violated: tail gap not open-ended context={} gaps={}",
                    context,
                    self.gaps.len()
                )
            });
        }
        let mut prev_end: Option<ByteCount> = None;
        for gap in &self.gaps {
            if gap.start >= gap.end || prev_end.is_some_and(|prev| gap.start <= prev) {
                report_invariant(|| {
                    format!(
                        "reassembly invariant violated: gap list unsorted or mergeable context={} gap=[{},{}) prev_end={:?}",
                        context, gap.start, gap.end, prev_end
                    )
                });
            }
            prev_end = Some(gap.end);
        }
    }
}

impl Default for FrameSorter {
    fn default() -> Self {
        Self::new()
    }
}

//! Core types shared by ingesters, workers and recovery tooling.

use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Direction ───────────────────────────────────────────────────────────────

/// Which way a cursor moves through chain history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Follows the tip. The checkpoint is the first height not yet processed.
    #[default]
    Forward,
    /// Fills older history. The checkpoint is the lowest processed height.
    Backward,
}

impl Direction {
    /// Returns `true` if moving the cursor from `current` to `next` is legal.
    pub fn is_advance(self, current: u64, next: u64) -> bool {
        match self {
            Self::Forward => next > current,
            Self::Backward => next < current,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── HeightRange ─────────────────────────────────────────────────────────────

/// Half-open interval of chain heights `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeightRange {
    pub start: u64,
    pub end: u64,
}

impl HeightRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, height: u64) -> bool {
        height >= self.start && height < self.end
    }

    /// Returns `true` if `other` lies entirely inside this range.
    pub fn covers(&self, other: &HeightRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Consecutive chunks of at most `chunk_size` heights, produced lazily.
    pub fn chunks(&self, chunk_size: u64) -> Chunks {
        Chunks {
            next: self.start,
            end: if chunk_size == 0 { self.start } else { self.end },
            step: chunk_size,
        }
    }

    /// How many chunks [`chunks`](Self::chunks) yields.
    pub fn chunk_count(&self, chunk_size: u64) -> u64 {
        if chunk_size == 0 {
            return 0;
        }
        self.len().div_ceil(chunk_size)
    }
}

/// Iterator returned by [`HeightRange::chunks`].
#[derive(Debug, Clone)]
pub struct Chunks {
    next: u64,
    end: u64,
    step: u64,
}

impl Iterator for Chunks {
    type Item = HeightRange;

    fn next(&mut self) -> Option<HeightRange> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        self.next = start.saturating_add(self.step).min(self.end);
        Some(HeightRange::new(start, self.next))
    }
}

impl fmt::Display for HeightRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Round `height` down to a multiple of `step`.
pub fn align_down(height: u64, step: u64) -> u64 {
    if step == 0 {
        return height;
    }
    (height / step) * step
}

// ─── Watermark ───────────────────────────────────────────────────────────────

/// Heights a derivation worker may read: `[low, high)`.
///
/// `low` is the lowest ingested raw height, `high` is the forward ingester's
/// checkpoint capped by the checkpoints of any upstream workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub low: u64,
    pub high: u64,
    /// Lowest height a new or fast-forwarded forward cursor may take.
    /// Raised by dependencies whose derived coverage starts above `low`.
    #[serde(default)]
    pub floor: u64,
}

impl Watermark {
    pub fn new(low: u64, high: u64) -> Self {
        Self { low, high, floor: 0 }
    }

    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.high <= self.low
    }

    /// Tighten the upper bound.
    pub fn cap(self, high: u64) -> Self {
        Self {
            high: self.high.min(high),
            ..self
        }
    }

    /// Tighten the lower bound.
    pub fn raise(self, low: u64) -> Self {
        Self {
            low: self.low.max(low),
            ..self
        }
    }

    pub fn with_floor(self, floor: u64) -> Self {
        Self {
            floor: self.floor.max(floor),
            ..self
        }
    }
}

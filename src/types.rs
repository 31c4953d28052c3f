use crate::crypto::Token;
use serde::{Deserialize, Serialize};

/// Block-production slot.
pub type Epoch = u64;
/// Propose/vote/commit attempt within an epoch.
pub type Round = u32;
/// Voting weight (stake units, or 1 per authority).
pub type Weight = u64;

/// Raw action bytes as carried in a block payload.
pub type ActionBytes = Vec<u8>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub token: Token,
    pub address: String,
    pub weight: Weight,
}

/// A node applying to sit on a future committee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInfo {
    pub token: Token,
    pub address: String,
}

/// Epochs `start..=end` sharing one committee and one checksum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WindowSpan {
    pub start: Epoch,
    pub end: Epoch,
}

impl WindowSpan {
    /// Window containing `epoch` for windows of `size` epochs starting at
    /// epoch 1 (epoch 0 is genesis).
    pub fn containing(epoch: Epoch, size: u64) -> Self {
        let index = epoch.saturating_sub(1) / size;
        let start = index * size + 1;
        Self {
            start,
            end: start + size - 1,
        }
    }

    pub fn contains(&self, epoch: Epoch) -> bool {
        epoch >= self.start && epoch <= self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Epoch at `fraction` of the window, clamped inside it.
    pub fn point(&self, fraction: f64) -> Epoch {
        let offset = ((self.len() as f64) * fraction).floor() as u64;
        (self.start + offset).min(self.end)
    }

    pub fn next(&self) -> Self {
        let size = self.len();
        Self {
            start: self.end + 1,
            end: self.end + size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_containing() {
        let w = WindowSpan::containing(1, 10);
        assert_eq!((w.start, w.end), (1, 10));
        let w = WindowSpan::containing(10, 10);
        assert_eq!((w.start, w.end), (1, 10));
        let w = WindowSpan::containing(11, 10);
        assert_eq!((w.start, w.end), (11, 20));
        assert_eq!(w.next().start, 21);
    }

    #[test]
    fn test_window_points() {
        let w = WindowSpan::containing(1, 10);
        assert_eq!(w.point(0.5), 6);
        assert_eq!(w.point(0.9), 10);
        assert_eq!(w.point(2.0), 10);
    }
}

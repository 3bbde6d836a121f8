//! Sector stepping for atomic-write devices.

/// One step of a sequential sector walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorStep {
    /// The first sector of the step.
    pub offset: u64,
    /// The number of sectors in the step. Never zero.
    pub count: u64,
}

/// Iterator over the steps covering `total` sectors, `step` sectors at a time, in increasing
/// offset order.
#[derive(Debug, Clone)]
pub struct SectorSteps {
    offset: u64,
    remaining: u64,
    step: u64,
}

impl SectorSteps {
    /// Panics if `step` is zero.
    pub fn new(total: u64, step: u64) -> Self {
        assert!(step > 0);
        SectorSteps {
            offset: 0,
            remaining: total,
            step,
        }
    }

    /// The number of sectors not yet covered by a returned step.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Iterator for SectorSteps {
    type Item = SectorStep;

    fn next(&mut self) -> Option<SectorStep> {
        if self.remaining == 0 {
            return None;
        }

        let count = self.step.min(self.remaining);
        let step = SectorStep {
            offset: self.offset,
            count,
        };
        self.offset += count;
        self.remaining -= count;
        Some(step)
    }
}

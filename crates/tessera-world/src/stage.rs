//! Tick stages and the world's current-stage clock.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ChunkError;

/// Phases of one world tick, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TickStage {
    /// Populate queued chunks and drain light queues.
    Lighting = 0,
    /// Deliver queued physics updates.
    Physics = 1,
    /// Entity and observer bookkeeping.
    Finalize = 2,
    /// Visibility diff and network dispatch.
    PreSnapshot = 3,
    /// Snapshot copy, then save and unload of marked chunks.
    Snapshot = 4,
    /// Compression, reaping, dirty resets.
    Maintenance = 5,
}

impl TickStage {
    /// All stages in tick order.
    pub const ALL: [TickStage; 6] = [
        TickStage::Lighting,
        TickStage::Physics,
        TickStage::Finalize,
        TickStage::PreSnapshot,
        TickStage::Snapshot,
        TickStage::Maintenance,
    ];

    fn from_u8(raw: u8) -> TickStage {
        Self::ALL
            .get(raw as usize)
            .copied()
            .unwrap_or(TickStage::Maintenance)
    }
}

/// Atomic holder of the current stage.
#[derive(Debug)]
pub struct StageClock(AtomicU8);

impl StageClock {
    /// Starts in `stage`.
    pub fn new(stage: TickStage) -> Self {
        Self(AtomicU8::new(stage as u8))
    }

    /// Current stage.
    pub fn get(&self) -> TickStage {
        TickStage::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Enters `stage`.
    pub fn set(&self, stage: TickStage) {
        self.0.store(stage as u8, Ordering::Release);
    }

    /// Fails with [`ChunkError::WrongStage`] unless the clock is at `expected`.
    pub fn check(&self, expected: TickStage) -> Result<(), ChunkError> {
        let actual = self.get();
        if actual == expected {
            Ok(())
        } else {
            Err(ChunkError::WrongStage { expected, actual })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrips_through_clock() {
        let clock = StageClock::new(TickStage::Maintenance);
        for stage in TickStage::ALL {
            clock.set(stage);
            assert_eq!(clock.get(), stage);
        }
    }

    #[test]
    fn test_check_reports_both_stages() {
        let clock = StageClock::new(TickStage::Physics);
        assert!(clock.check(TickStage::Physics).is_ok());
        match clock.check(TickStage::Finalize) {
            Err(ChunkError::WrongStage { expected, actual }) => {
                assert_eq!(expected, TickStage::Finalize);
                assert_eq!(actual, TickStage::Physics);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of the statistics corrector.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum CorrectorState {
    /// Constructed, not yet scheduled for activation.
    Inactive = 0,
    /// Activation of a freshly created database is pending.
    Activating = 1,
    /// Activation of a reopened database is pending.
    Reactivating = 2,
    /// Ready; no correction pass queued.
    Waiting = 3,
    /// A correction pass is queued on the lane.
    CorrectionQueued = 4,
    /// Terminal.
    Closed = 5,
}

impl CorrectorState {
    /// Whether `self -> next` is an edge of the lifecycle.
    pub const fn can_transition_to(self, next: CorrectorState) -> bool {
        use CorrectorState::*;
        matches!(
            (self, next),
            (Inactive, Activating)
                | (Inactive, Reactivating)
                | (Activating, Waiting)
                | (Reactivating, Waiting)
                | (Waiting, CorrectionQueued)
                | (CorrectionQueued, Waiting)
                | (Inactive, Closed)
                | (Activating, Closed)
                | (Reactivating, Closed)
                | (Waiting, Closed)
                | (CorrectionQueued, Closed)
        )
    }

    const fn from_u8(raw: u8) -> CorrectorState {
        match raw {
            0 => CorrectorState::Inactive,
            1 => CorrectorState::Activating,
            2 => CorrectorState::Reactivating,
            3 => CorrectorState::Waiting,
            4 => CorrectorState::CorrectionQueued,
            _ => CorrectorState::Closed,
        }
    }
}

/// Atomic cell holding a [`CorrectorState`] that only moves along legal edges.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Creates a cell in `initial`.
    pub const fn new(initial: CorrectorState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    /// Current state.
    pub fn get(&self) -> CorrectorState {
        CorrectorState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves `from -> to` if the cell currently holds `from`.
    ///
    /// # Panics
    ///
    /// Panics if `from -> to` is not an edge of the lifecycle.
    pub fn transition(&self, from: CorrectorState, to: CorrectorState) -> bool {
        assert!(
            from.can_transition_to(to),
            "illegal corrector transition {from:?} -> {to:?}"
        );
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to [`CorrectorState::Closed`] from any state and returns the previous one.
    pub fn close(&self) -> CorrectorState {
        CorrectorState::from_u8(self.0.swap(CorrectorState::Closed as u8, Ordering::AcqRel))
    }
}

//! Eventually-correct statistics counters.
//!
//! Vertex and has-edge counters are maintained optimistically by committing
//! transactions. [`StatisticsCorrector`] repairs the miscounts that overlapping
//! transactions can leave behind, on a single background [`CorrectionLane`].

mod corrector;
mod lane;
pub mod miscount;
mod state;

pub use corrector::{CorrectionReport, CorrectorConfig, StatisticsCorrector};
pub use lane::{CorrectionLane, LaneTask};
pub use state::{CorrectorState, StateCell};

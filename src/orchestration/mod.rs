//! Orchestration layer.
//!
//! The three engines that sit on top of the store, session and worker
//! ports: the step executor walks work groups, the convoy tracker decides
//! when aggregated work is finished, and the batch dispatcher hands items
//! to workers under an admission limit.

mod admission;
mod convoy;
mod dispatch;
mod formula;
mod liveness;
mod steps;

pub use admission::{pool_in_flight, AdmissionPolicy};
pub use convoy::{
    convoy_notify, convoy_owner, is_owned, notify_addresses, AddOutcome, CloseOutcome,
    ConvoyCheck, ConvoyOptions, ConvoyStatus, ConvoyTracker, ReadyReason, StrandedConvoy,
    TrackedItem, ALL_CLOSED_REASON, EMPTY_CONVOY_REASON, META_NOTIFY, META_OWNED, META_OWNER,
};
pub use dispatch::{
    BatchDispatcher, BatchResult, DispatchOptions, ItemOutcome, META_ATTACHED_MOLECULE,
    META_DISPATCHED_AT, META_DISPATCHED_BY,
};
pub use formula::{Formula, FormulaCatalog, FormulaStep, LazyFormula, Molecule};
pub use liveness::{LivenessProber, Probe};
pub use steps::{
    group_of, ReadyLevel, StepAdvance, StepExecutor, GROUP_DONE_REASON, STEP_DONE_REASON,
};

//! Cancelable background tasks and the per-entity registry that
//! deduplicates them.

mod registry;
mod runtime;

pub use registry::{Action, AdmissionError, TaskKey, TaskRegistry, TaskState};
pub use runtime::{BgTask, Job, ListenerKey, Phase, TaskContext, TaskEvent, TaskOutcome};

//! Patch protocol: validation rules and the engine that applies batches.

pub mod engine;
pub mod validator;

pub use engine::{PatchEngine, PatchOutcome};
pub use validator::{PatchLimits, PatchValidator, MAX_COMPONENT_ID_LEN};

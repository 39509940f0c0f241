pub mod admission;
pub mod lifetime;
pub mod pacing;
pub mod reloadable;
pub mod supervisor;

pub use admission::{AdmissionDecision, AdmissionLimiter, admission_middleware};
pub use lifetime::{CancelReason, Lifetime};
pub use reloadable::{ReloadError, ReloadHandle, ReloadableHandler};
pub use supervisor::{RunError, ServingState, StartupError, Supervisor};

pub mod activation;
pub mod sync;

pub use activation::{ActivationError, ActivationReconciler};
pub use sync::{project, ConfigSynchronizer, SaveError, SaveOutcome, SyncError};

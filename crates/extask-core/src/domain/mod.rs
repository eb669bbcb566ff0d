//! Domain model (ids, external task, state, blobs, failures, errors).

pub mod blob;
pub mod errors;
pub mod failure;
pub mod ids;
pub mod state;
pub mod task;

pub use blob::Blob;
pub use errors::LeaseError;
pub use failure::{ErrorPayload, FailureKind, TaskFailure};
pub use ids::{ParseIdError, TaskId};
pub use state::TaskState;
pub use task::{ExternalTask, InstanceTriple, NewExternalTask};

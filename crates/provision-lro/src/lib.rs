//! Long-running operations.
//!
//! A provisioning run takes minutes to hours, so callers receive an
//! [`Operation`] handle right away and poll it with
//! [`OperationManager::get_operation`] or block on it with
//! [`OperationManager::wait_operation`]. The flow publishes its outcome with
//! exactly one of [`OperationManager::set_result`] /
//! [`OperationManager::set_error`].
//!
//! Operation life cycle:
//!
//! ```text
//! Pending --set_result/set_error--> Done --(expiry | delete)--> removed
//! ```

mod error;
mod manager;
mod operation;

pub use error::LroError;
pub use manager::{ManagerConfig, OperationManager};
pub use operation::{Code, OPERATION_PREFIX, Operation, OperationResult, OperationStatus};

//! Secondary failure reporting
//!
//! Every public operation returns its error to the caller. When an observer is
//! attached it is shown the same error first, which keeps test assertions short.

use crate::error::{GhostgresError, Result};
use std::sync::Arc;

/// Callback informed of every error returned from a public operation
pub type FailureObserver = Arc<dyn Fn(&GhostgresError) + Send + Sync>;

/// Pass `result` through `observer`, returning it unchanged
pub(crate) fn report<T>(observer: Option<&FailureObserver>, result: Result<T>) -> Result<T> {
    if let (Some(observer), Err(err)) = (observer, &result) {
        observer(err);
    }
    result
}

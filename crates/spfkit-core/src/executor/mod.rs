//! Executors
//!
//! An executor drives a session from start to finish, performing each DNS
//! lookup the session suspends on. All executors run the same evaluation; they
//! differ only in how and where lookups are awaited.

mod blocking;
mod callback;
pub(crate) mod machine;
mod queued;

pub use blocking::BlockingExecutor;
pub use callback::CallbackExecutor;
pub use queued::QueuedExecutor;

use crate::checker::EvalContext;
use crate::error::SpfError;
use crate::session::SpfSession;
use async_trait::async_trait;
use std::sync::Arc;

/// Drives a prepared session to completion
#[async_trait]
pub trait SpfExecutor: Send + Sync {
    /// Run `session` until its stack is empty and return it
    ///
    /// Errors are executor failures (a dropped worker or closed queue), never
    /// evaluation results.
    async fn execute(
        &self,
        session: SpfSession,
        ctx: Arc<EvalContext>,
    ) -> Result<SpfSession, SpfError>;
}

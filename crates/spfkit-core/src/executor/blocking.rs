//! Lookups awaited in place by the calling task

use super::machine::{self, Progress};
use super::SpfExecutor;
use crate::checker::EvalContext;
use crate::dns;
use crate::error::SpfError;
use crate::session::SpfSession;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Performs each lookup inline; the caller does nothing else until the
/// session is done
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingExecutor;

impl BlockingExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SpfExecutor for BlockingExecutor {
    async fn execute(
        &self,
        mut session: SpfSession,
        ctx: Arc<EvalContext>,
    ) -> Result<SpfSession, SpfError> {
        let mut progress = machine::start(&mut session, &ctx);

        while let Progress::Suspended(continuation) = progress {
            debug!("Looking up {}", continuation.request);
            let response = dns::lookup(ctx.dns(), &continuation.request, ctx.timeout()).await;
            progress = machine::resume(&mut session, &ctx, continuation, response);
        }

        Ok(session)
    }
}

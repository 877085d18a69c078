//! Lookups completed through callbacks on spawned tasks

use super::machine::{self, Progress};
use super::SpfExecutor;
use crate::checker::{DnsLookupContinuation, EvalContext};
use crate::dns::{self, DnsResponse};
use crate::error::SpfError;
use crate::session::SpfSession;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Spawns each lookup with a completion callback
///
/// The callback resumes the session on whichever runtime thread the lookup
/// finished on and dispatches the next lookup; the caller only waits for the
/// final hand-back.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallbackExecutor;

impl CallbackExecutor {
    pub fn new() -> Self {
        Self
    }
}

type Completion = oneshot::Sender<SpfSession>;

fn dispatch(
    session: SpfSession,
    ctx: Arc<EvalContext>,
    continuation: DnsLookupContinuation,
    done: Completion,
) {
    tokio::spawn(async move {
        debug!("Looking up {}", continuation.request);
        let response = dns::lookup(ctx.dns(), &continuation.request, ctx.timeout()).await;
        on_response(session, ctx, continuation, response, done);
    });
}

fn on_response(
    mut session: SpfSession,
    ctx: Arc<EvalContext>,
    continuation: DnsLookupContinuation,
    response: DnsResponse,
    done: Completion,
) {
    match machine::resume(&mut session, &ctx, continuation, response) {
        Progress::Done => {
            // The caller may have gone away
            let _ = done.send(session);
        }
        Progress::Suspended(next) => dispatch(session, ctx, next, done),
    }
}

#[async_trait]
impl SpfExecutor for CallbackExecutor {
    async fn execute(
        &self,
        mut session: SpfSession,
        ctx: Arc<EvalContext>,
    ) -> Result<SpfSession, SpfError> {
        let continuation = match machine::start(&mut session, &ctx) {
            Progress::Done => return Ok(session),
            Progress::Suspended(continuation) => continuation,
        };

        let (done, finished) = oneshot::channel();
        dispatch(session, ctx, continuation, done);

        finished
            .await
            .map_err(|_| SpfError::temp("Evaluation task ended without a result"))
    }
}

//! Pop/execute loop shared by every executor

use crate::checker::{CheckResult, DnsLookupContinuation, EvalContext};
use crate::dns::DnsResponse;
use crate::error::SpfError;
use crate::result::SpfResult;
use crate::session::SpfSession;
use tracing::error;

/// Where a session stands after running as far as it can
#[derive(Debug)]
pub(crate) enum Progress {
    /// The stack is empty and the final result is committed
    Done,
    /// Waiting for the answer to this lookup
    Suspended(DnsLookupContinuation),
}

/// Run a freshly prepared session until it finishes or suspends
pub(crate) fn start(session: &mut SpfSession, ctx: &EvalContext) -> Progress {
    run(session, ctx, Ok(None))
}

/// Hand `response` to the suspended listener and keep running
pub(crate) fn resume(
    session: &mut SpfSession,
    ctx: &EvalContext,
    continuation: DnsLookupContinuation,
    response: DnsResponse,
) -> Progress {
    let outcome = continuation.resume(response, session, ctx);
    run(session, ctx, outcome)
}

fn run(session: &mut SpfSession, ctx: &EvalContext, mut outcome: CheckResult) -> Progress {
    loop {
        outcome = match outcome {
            Ok(Some(continuation)) => return Progress::Suspended(continuation),
            Ok(None) => match session.pop() {
                Some(checker) => checker.check(session, ctx),
                None => return Progress::Done,
            },
            Err(error) => unwind(session, ctx, error),
        };
    }
}

/// Offer `error` to each frame in turn until one handles it
fn unwind(session: &mut SpfSession, ctx: &EvalContext, mut error: SpfError) -> CheckResult {
    while let Some(checker) = session.pop() {
        match checker.catch(error, session, ctx) {
            Ok(()) => return Ok(None),
            Err(next) => error = next,
        }
    }

    error!("Unhandled SPF error with empty stack: {}", error);
    session.set_final_result(SpfResult::Neutral);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::from_fn;
    use crate::dns::{DnsRequest, RecordType};
    use crate::spf::tests::test_context;

    fn session() -> SpfSession {
        SpfSession::new("192.0.2.1", "user@example.com", "mx.example.com").unwrap()
    }

    #[test]
    fn test_suspends_and_resumes() {
        let ctx = test_context();
        let mut session = session();
        session.push(from_fn(|session, _ctx| {
            session.explanation = Some("after".into());
            Ok(None)
        }));
        session.push(from_fn(|_session, _ctx| {
            Ok(Some(DnsLookupContinuation::new(
                DnsRequest::new("example.com", RecordType::A),
                |response, session, _ctx| {
                    session.mechanism_matched = Some(!response.records()?.is_empty());
                    Ok(None)
                },
            )))
        }));

        let continuation = match start(&mut session, &ctx) {
            Progress::Suspended(continuation) => continuation,
            Progress::Done => panic!("expected a lookup"),
        };
        assert_eq!(continuation.request.hostname, "example.com");
        assert!(session.explanation.is_none());

        let response = DnsResponse::from(Ok(vec!["192.0.2.1".to_string()]));
        assert!(matches!(
            resume(&mut session, &ctx, continuation, response),
            Progress::Done
        ));
        assert_eq!(session.mechanism_matched, Some(true));
        assert_eq!(session.explanation.as_deref(), Some("after"));
    }

    #[test]
    fn test_unhandled_error_is_neutral() {
        let ctx = test_context();
        let mut session = session();
        session.push(from_fn(|_session, _ctx| Err(SpfError::perm("boom"))));
        assert!(matches!(start(&mut session, &ctx), Progress::Done));
        assert_eq!(session.final_result(), Some(SpfResult::Neutral));
    }

    #[test]
    fn test_error_skips_frames_until_caught() {
        let ctx = test_context();
        let mut session = session();
        crate::policy::begin(&mut session);
        // Drop the domain evaluation, keep the result formatter
        session.pop();
        session.push(from_fn(|session, _ctx| {
            session.explanation = Some("never".into());
            Ok(None)
        }));
        session.push(from_fn(|_session, _ctx| Err(SpfError::temp("timeout"))));

        assert!(matches!(start(&mut session, &ctx), Progress::Done));
        assert_eq!(session.final_result(), Some(SpfResult::TempError));
        assert!(session.explanation.is_none());
    }
}

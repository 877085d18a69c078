//! Checker frames and the DNS suspension protocol
//!
//! Evaluation is a stack of boxed [`Checker`] frames owned by the session.
//! A frame either finishes synchronously, fails with an [`SpfError`], or
//! suspends by returning a [`DnsLookupContinuation`]: the request to perform
//! and the listener that resumes the session once the answer arrives. Frames
//! never recurse into each other; nested work is pushed onto the stack.

use crate::dns::{DnsRequest, DnsResponse, DnsService};
use crate::error::SpfError;
use crate::macros::{ExpandContext, Expansion, MacroExpander};
use crate::policy::PolicyChain;
use crate::record::RecordParser;
use crate::result::SpfResult;
use crate::session::SpfSession;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of running a frame or a listener
pub type CheckResult = Result<Option<DnsLookupContinuation>, SpfError>;

/// Resumes a suspended session with a DNS answer
pub type Listener =
    Box<dyn FnOnce(DnsResponse, &mut SpfSession, &EvalContext) -> CheckResult + Send>;

/// A pending lookup and the code waiting for it
pub struct DnsLookupContinuation {
    pub request: DnsRequest,
    listener: Listener,
}

impl DnsLookupContinuation {
    pub fn new<F>(request: DnsRequest, listener: F) -> Self
    where
        F: FnOnce(DnsResponse, &mut SpfSession, &EvalContext) -> CheckResult + Send + 'static,
    {
        Self {
            request,
            listener: Box::new(listener),
        }
    }

    pub(crate) fn resume(
        self,
        response: DnsResponse,
        session: &mut SpfSession,
        ctx: &EvalContext,
    ) -> CheckResult {
        (self.listener)(response, session, ctx)
    }
}

impl std::fmt::Debug for DnsLookupContinuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsLookupContinuation")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// One frame of the evaluation stack
pub trait Checker: Send {
    fn check(self: Box<Self>, session: &mut SpfSession, ctx: &EvalContext) -> CheckResult;

    /// Offered an error raised above this frame while the stack unwinds.
    /// `Ok` swallows it and evaluation continues below this frame.
    fn catch(
        self: Box<Self>,
        error: SpfError,
        _session: &mut SpfSession,
        _ctx: &EvalContext,
    ) -> Result<(), SpfError> {
        Err(error)
    }
}

/// Frame that runs a closure once
pub struct FnChecker<F>(F);

impl<F> Checker for FnChecker<F>
where
    F: FnOnce(&mut SpfSession, &EvalContext) -> CheckResult + Send,
{
    fn check(self: Box<Self>, session: &mut SpfSession, ctx: &EvalContext) -> CheckResult {
        (self.0)(session, ctx)
    }
}

pub fn from_fn<F>(f: F) -> Box<dyn Checker>
where
    F: FnOnce(&mut SpfSession, &EvalContext) -> CheckResult + Send + 'static,
{
    Box::new(FnChecker(f))
}

/// Shared, read-only configuration of an evaluation
pub struct EvalContext {
    pub(crate) dns: Arc<dyn DnsService>,
    pub(crate) expander: MacroExpander,
    pub(crate) parser: Arc<RecordParser>,
    pub(crate) chain: PolicyChain,
    pub(crate) record_limit: usize,
    pub(crate) default_explanation: Option<String>,
    pub(crate) timeout: Duration,
}

impl EvalContext {
    pub(crate) fn new(
        dns: Arc<dyn DnsService>,
        parser: Arc<RecordParser>,
        chain: PolicyChain,
        default_explanation: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            expander: MacroExpander::new(dns.local_domain_names()),
            record_limit: dns.record_limit(),
            dns,
            parser,
            chain,
            default_explanation,
            timeout,
        }
    }

    pub fn dns(&self) -> &dyn DnsService {
        self.dns.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Expand `template` against the session and hand the result to `then`
///
/// When the template needs `%{p}` before the client domain is validated, a
/// retry frame is pushed and the validating PTR lookup is returned instead.
pub(crate) fn expand_then<F>(
    session: &mut SpfSession,
    ctx: &EvalContext,
    template: String,
    context: ExpandContext,
    then: F,
) -> CheckResult
where
    F: FnOnce(Result<String, SpfError>, &mut SpfSession, &EvalContext) -> CheckResult
        + Send
        + 'static,
{
    if context == ExpandContext::Explanation
        && session.receiving_domain.is_none()
        && (template.contains("%{r") || template.contains("%{R"))
    {
        session.receiving_domain = Some(ctx.expander.fallback_receiving_domain());
    }

    match ctx.expander.expand(&template, &*session, context) {
        Ok(Expansion::Expanded(expanded)) => then(Ok(expanded), session, ctx),
        Ok(Expansion::NeedsClientDomain) => {
            session.push(from_fn(move |session, ctx| {
                expand_then(session, ctx, template, context, then)
            }));
            Ok(Some(client_domain_lookup(session)))
        }
        Err(e) => then(Err(e), session, ctx),
    }
}

/// Validate the client domain: first PTR name whose forward lookup returns the
/// client address, otherwise `unknown`
fn client_domain_lookup(session: &SpfSession) -> DnsLookupContinuation {
    let request = DnsRequest::new(session.reverse_name(), crate::dns::RecordType::Ptr);

    DnsLookupContinuation::new(request, |response, session, _ctx| {
        let name = response
            .records()
            .ok()
            .and_then(|names| names.first().cloned());

        let Some(name) = name else {
            session.client_domain = Some("unknown".to_string());
            return Ok(None);
        };

        let request = DnsRequest::new(name.clone(), session.address_record_type());
        Ok(Some(DnsLookupContinuation::new(
            request,
            move |response, session, _ctx| {
                let validated = response
                    .records()
                    .map(|addresses| addresses.iter().any(|a| session.is_client_address(a)))
                    .unwrap_or(false);
                debug!("Client domain {} validated: {}", name, validated);
                session.client_domain = Some(if validated { name } else { "unknown".to_string() });
                Ok(None)
            },
        )))
    })
}

/// Bottom frame: commits the final result category
pub(crate) struct FinalResult;

impl Checker for FinalResult {
    fn check(self: Box<Self>, session: &mut SpfSession, _ctx: &EvalContext) -> CheckResult {
        let result = session
            .current_result
            .map(|q| q.to_result())
            .unwrap_or(SpfResult::Neutral);
        session.set_final_result(result);
        Ok(None)
    }

    fn catch(
        self: Box<Self>,
        error: SpfError,
        session: &mut SpfSession,
        _ctx: &EvalContext,
    ) -> Result<(), SpfError> {
        warn!("SPF check for {} ended with {}", session.sender_domain(), error);
        session.set_final_result(error.result());
        Ok(())
    }
}

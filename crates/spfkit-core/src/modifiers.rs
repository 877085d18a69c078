//! Modifier evaluation: `redirect=`, `exp=` and ignored unknown modifiers

use crate::checker::{expand_then, CheckResult, Checker, DnsLookupContinuation, EvalContext};
use crate::dns::{DnsRequest, RecordType};
use crate::error::SpfError;
use crate::macros::ExpandContext;
use crate::policy::EvaluateDomain;
use crate::record::{Modifier, Qualifier};
use crate::session::SpfSession;
use tracing::debug;

/// Evaluates one modifier after all directives have run
pub(crate) struct ModifierCheck(pub Modifier);

impl Checker for ModifierCheck {
    fn check(self: Box<Self>, session: &mut SpfSession, ctx: &EvalContext) -> CheckResult {
        match self.0 {
            Modifier::Redirect(domain) => {
                if session.current_result.is_some() {
                    return Ok(None);
                }
                session.increment_depth()?;
                expand_then(session, ctx, domain, ExpandContext::Domain, |target, session, _ctx| {
                    let target = target?;
                    debug!("Redirecting {} to {}", session.current_domain, target);
                    session.push(Box::new(RedirectCleanup));
                    session.current_domain = target;
                    session.push(Box::new(EvaluateDomain));
                    Ok(None)
                })
            }
            Modifier::Explanation(domain) => {
                if session.current_result != Some(Qualifier::Fail) || session.ignore_explanation {
                    return Ok(None);
                }
                expand_then(session, ctx, domain, ExpandContext::Domain, |host, session, ctx| {
                    let host = match host {
                        Ok(host) => host,
                        Err(e) => {
                            debug!("Invalid exp domain, using default explanation: {}", e);
                            return default_explanation(session, ctx);
                        }
                    };
                    Ok(Some(DnsLookupContinuation::new(
                        DnsRequest::new(host, RecordType::Txt),
                        |response, session, ctx| match response.records() {
                            Ok([text]) => explain(text.clone(), session, ctx),
                            Ok(records) => {
                                debug!(
                                    "exp lookup returned {} strings, using default explanation",
                                    records.len()
                                );
                                default_explanation(session, ctx)
                            }
                            Err(e) => {
                                debug!("exp lookup failed, using default explanation: {}", e);
                                default_explanation(session, ctx)
                            }
                        },
                    )))
                })
            }
            Modifier::Unknown { .. } => Ok(None),
        }
    }
}

/// Expand a published explanation, falling back to the default on error
fn explain(text: String, session: &mut SpfSession, ctx: &EvalContext) -> CheckResult {
    expand_then(session, ctx, text, ExpandContext::Explanation, |expanded, session, ctx| {
        match expanded {
            Ok(explanation) => {
                session.explanation = Some(explanation);
                Ok(None)
            }
            Err(e) => {
                debug!("Invalid explanation string, using default: {}", e);
                default_explanation(session, ctx)
            }
        }
    })
}

fn default_explanation(session: &mut SpfSession, ctx: &EvalContext) -> CheckResult {
    match &ctx.default_explanation {
        Some(template) => set_explanation(template.clone(), session, ctx),
        None => Ok(None),
    }
}

/// Expand `template` in explanation context into the session's explanation
pub(crate) fn set_explanation(template: String, session: &mut SpfSession, ctx: &EvalContext) -> CheckResult {
    expand_then(session, ctx, template, ExpandContext::Explanation, |expanded, session, _ctx| {
        match expanded {
            Ok(explanation) => session.explanation = Some(explanation),
            Err(e) => debug!("Could not expand default explanation: {}", e),
        }
        Ok(None)
    })
}

/// Suppresses the redirecting record's explanation and maps a missing target
/// policy onto `PermError`
struct RedirectCleanup;

impl Checker for RedirectCleanup {
    fn check(self: Box<Self>, session: &mut SpfSession, _ctx: &EvalContext) -> CheckResult {
        session.ignore_explanation = true;
        Ok(None)
    }

    fn catch(
        self: Box<Self>,
        error: SpfError,
        session: &mut SpfSession,
        _ctx: &EvalContext,
    ) -> Result<(), SpfError> {
        match error {
            SpfError::None(reason) => Err(SpfError::perm(format!(
                "Redirect target {} has no policy: {}",
                session.current_domain, reason
            ))),
            other => Err(other),
        }
    }
}

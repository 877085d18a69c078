//! Policy chain
//!
//! Every domain evaluated during a check (the sender's domain and each
//! include or redirect target) goes through the same ordered stages that
//! acquire, parse and decorate its record before the record is evaluated.

mod table;

pub use table::DomainTable;

use crate::checker::{CheckResult, Checker, DnsLookupContinuation, EvalContext, FinalResult};
use crate::dns::{DnsRequest, RecordType};
use crate::error::SpfError;
use crate::mechanisms::DirectiveCheck;
use crate::modifiers::{set_explanation, ModifierCheck};
use crate::record::{is_spf_record, Decoration, Directive, Mechanism, Qualifier};
use crate::session::SpfSession;
use std::sync::Arc;
use tracing::debug;

const MAX_LABEL_LENGTH: usize = 63;

/// One stage of the policy chain
#[derive(Debug, Clone)]
pub enum Stage {
    /// Records that replace DNS for matching hosts
    Override(Arc<DomainTable>),
    /// Reject domains with empty or over-long labels
    InitialChecks,
    /// Fetch the record; `strict` requires SPF and TXT records to agree
    Retrieve { strict: bool },
    /// Record assumed for domains that publish nothing
    BestGuess(String),
    Parse,
    /// Records used for hosts that publish nothing
    Fallback(Arc<DomainTable>),
    /// Fail with `none` when there is still no record
    NoRecord,
    /// Include the trusted forwarder domain ahead of a trailing `-all`/`?all`
    TrustedForwarder(String),
    /// Commit `neutral` when no directive matches
    NeutralIfNoMatch,
    /// Explanation template used on `fail` when the record sets none
    DefaultExplanation(String),
}

/// Ordered stages run for every evaluated domain
#[derive(Debug, Clone, Default)]
pub struct PolicyChain {
    stages: Vec<Stage>,
}

impl PolicyChain {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

/// Push the frames of a whole check: result formatting at the bottom, the
/// sender's domain on top
pub(crate) fn begin(session: &mut SpfSession) {
    session.push(Box::new(FinalResult));
    session.push(Box::new(EvaluateDomain));
}

/// Runs the policy chain and then the record for the current domain
pub(crate) struct EvaluateDomain;

impl Checker for EvaluateDomain {
    fn check(self: Box<Self>, session: &mut SpfSession, ctx: &EvalContext) -> CheckResult {
        debug!("Evaluating policy of {}", session.current_domain);
        session.push(Box::new(RecordEvaluation));
        for stage in ctx.chain.stages.iter().rev() {
            session.push(Box::new(stage.clone()));
        }
        Ok(None)
    }
}

impl Checker for Stage {
    fn check(self: Box<Self>, session: &mut SpfSession, ctx: &EvalContext) -> CheckResult {
        match *self {
            Stage::Override(table) => {
                if let Some(record) = table.lookup(&session.current_domain) {
                    debug!("Using local override for {}", session.current_domain);
                    session.record = Some(record);
                }
                Ok(None)
            }
            Stage::InitialChecks => {
                check_domain(&session.current_domain)?;
                Ok(None)
            }
            Stage::Retrieve { strict } => {
                if session.record.is_some() || session.raw_record.is_some() {
                    return Ok(None);
                }
                Ok(Some(retrieve(session.current_domain.clone(), strict)))
            }
            Stage::BestGuess(text) => {
                if session.record.is_none() && session.raw_record.is_none() {
                    debug!("No record for {}, using best guess", session.current_domain);
                    session.raw_record = Some(text);
                }
                Ok(None)
            }
            Stage::Parse => {
                if let Some(raw) = session.raw_record.take() {
                    session.record = Some(ctx.parser.parse(&raw)?);
                }
                Ok(None)
            }
            Stage::Fallback(table) => {
                if session.record.is_none() {
                    session.record = table.lookup(&session.current_domain);
                }
                Ok(None)
            }
            Stage::NoRecord => {
                if session.record.is_none() {
                    return Err(SpfError::none(format!(
                        "No SPF record found for {}",
                        session.current_domain
                    )));
                }
                Ok(None)
            }
            Stage::TrustedForwarder(domain) => {
                if session.current_domain.eq_ignore_ascii_case(&domain) {
                    return Ok(None);
                }
                if let Some(record) = session.record.as_mut() {
                    let position = match record.directives.last() {
                        Some(last)
                            if last.mechanism == Mechanism::All
                                && matches!(last.qualifier, Qualifier::Fail | Qualifier::Neutral) =>
                        {
                            record.directives.len() - 1
                        }
                        _ => record.directives.len(),
                    };
                    record.directives.insert(
                        position,
                        Directive::new(Qualifier::Pass, Mechanism::Include(domain)),
                    );
                }
                Ok(None)
            }
            Stage::NeutralIfNoMatch => {
                if let Some(record) = session.record.as_mut() {
                    if !record.directives.is_empty() {
                        record.decorations.push(Decoration::ForceNeutral);
                    }
                }
                Ok(None)
            }
            Stage::DefaultExplanation(template) => {
                if let Some(record) = session.record.as_mut() {
                    record.decorations.push(Decoration::DefaultExplanation(template));
                }
                Ok(None)
            }
        }
    }
}

/// Every label must be 1 to 63 octets; a trailing dot is allowed
fn check_domain(domain: &str) -> Result<(), SpfError> {
    let trimmed = domain.strip_suffix('.').unwrap_or(domain);
    if trimmed.is_empty()
        || trimmed
            .split('.')
            .any(|label| label.is_empty() || label.len() > MAX_LABEL_LENGTH)
    {
        return Err(SpfError::none(format!("Invalid domain name: {}", domain)));
    }
    Ok(())
}

/// At most one `v=spf1` record may be published per type
fn select_record(records: &[String]) -> Result<Option<String>, SpfError> {
    let mut candidates = records.iter().filter(|r| is_spf_record(r));
    let first = candidates.next().cloned();
    if candidates.next().is_some() {
        return Err(SpfError::perm("More than one SPF record published"));
    }
    Ok(first)
}

/// SPF RR type first, then TXT
fn retrieve(domain: String, strict: bool) -> DnsLookupContinuation {
    let request = DnsRequest::new(domain.clone(), RecordType::Spf);

    DnsLookupContinuation::new(request, move |response, session, _ctx| {
        let spf = select_record(response.records()?)?;
        if !strict && spf.is_some() {
            session.raw_record = spf;
            return Ok(None);
        }

        let request = DnsRequest::new(domain, RecordType::Txt);
        Ok(Some(DnsLookupContinuation::new(
            request,
            move |response, session, _ctx| {
                let txt = select_record(response.records()?)?;
                session.raw_record = if strict { reconcile(spf, txt)? } else { txt };
                if let Some(record) = &session.raw_record {
                    debug!("Found record for {}: {}", session.current_domain, record);
                }
                Ok(None)
            },
        )))
    })
}

/// Strict mode: the TXT record must exist and match any SPF RR record
fn reconcile(spf: Option<String>, txt: Option<String>) -> Result<Option<String>, SpfError> {
    match (spf, txt) {
        (Some(_), None) => Err(SpfError::perm("Record published only as SPF RR type")),
        (Some(spf), Some(txt)) if spf != txt => {
            Err(SpfError::perm("SPF and TXT records differ"))
        }
        (_, txt) => Ok(txt),
    }
}

/// Evaluates the record produced by the chain
struct RecordEvaluation;

impl Checker for RecordEvaluation {
    fn check(self: Box<Self>, session: &mut SpfSession, _ctx: &EvalContext) -> CheckResult {
        let record = session.record.take().ok_or_else(|| {
            SpfError::none(format!("No SPF record for {}", session.current_domain))
        })?;
        debug!("Evaluating {} for {}", record, session.current_domain);

        for decoration in record.decorations.into_iter().rev() {
            session.push(Box::new(DecorationCheck(decoration)));
        }
        for modifier in record.modifiers.into_iter().rev() {
            session.push(Box::new(ModifierCheck(modifier)));
        }
        for directive in record.directives.into_iter().rev() {
            session.push(Box::new(DirectiveCheck(directive)));
        }
        Ok(None)
    }
}

struct DecorationCheck(Decoration);

impl Checker for DecorationCheck {
    fn check(self: Box<Self>, session: &mut SpfSession, ctx: &EvalContext) -> CheckResult {
        match self.0 {
            Decoration::ForceNeutral => {
                if session.current_result.is_none() {
                    session.current_result = Some(Qualifier::Neutral);
                }
                Ok(None)
            }
            Decoration::DefaultExplanation(template) => {
                if session.current_result == Some(Qualifier::Fail)
                    && session.explanation.is_none()
                    && !session.ignore_explanation
                {
                    return set_explanation(template, session, ctx);
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_domain() {
        assert!(check_domain("example.com").is_ok());
        assert!(check_domain("example.com.").is_ok());
        assert!(matches!(check_domain(""), Err(SpfError::None(_))));
        assert!(matches!(check_domain("a..example.com"), Err(SpfError::None(_))));
        let long = format!("{}.example.com", "a".repeat(64));
        assert!(matches!(check_domain(&long), Err(SpfError::None(_))));
    }

    #[test]
    fn test_select_record() {
        let records = vec!["google-site-verification=x".to_string(), "v=spf1 -all".to_string()];
        assert_eq!(select_record(&records).unwrap(), Some("v=spf1 -all".to_string()));
        assert_eq!(select_record(&[]).unwrap(), None);

        let twice = vec!["v=spf1 -all".to_string(), "v=spf1 +all".to_string()];
        assert!(matches!(select_record(&twice), Err(SpfError::PermError(_))));
    }

    #[test]
    fn test_reconcile() {
        let a = Some("v=spf1 -all".to_string());
        let b = Some("v=spf1 +all".to_string());
        assert_eq!(reconcile(None, a.clone()).unwrap(), a);
        assert_eq!(reconcile(a.clone(), a.clone()).unwrap(), a);
        assert!(reconcile(a.clone(), None).is_err());
        assert!(reconcile(a, b).is_err());
    }
}

//! Directive evaluation
//!
//! A directive frame pushes an outcome frame and then evaluates its
//! mechanism, which records whether it matched in the session. The outcome
//! frame commits the qualifier once the mechanism (and any lookups it
//! suspended on) has finished.

use crate::checker::{expand_then, CheckResult, Checker, DnsLookupContinuation, EvalContext};
use crate::dns::{DnsRequest, RecordType};
use crate::error::SpfError;
use crate::macros::ExpandContext;
use crate::policy::EvaluateDomain;
use crate::record::{Directive, Mechanism, Qualifier};
use crate::session::SpfSession;
use std::collections::VecDeque;
use std::mem;
use std::net::IpAddr;
use tracing::debug;

/// Evaluates one directive unless a result is already committed
pub(crate) struct DirectiveCheck(pub Directive);

impl Checker for DirectiveCheck {
    fn check(self: Box<Self>, session: &mut SpfSession, ctx: &EvalContext) -> CheckResult {
        if session.current_result.is_some() {
            return Ok(None);
        }

        debug!("Evaluating {} for {}", self.0, session.current_domain);
        let Directive {
            qualifier,
            mechanism,
        } = self.0;

        session.mechanism_matched = None;
        session.push(Box::new(DirectiveOutcome(qualifier)));
        evaluate(mechanism, session, ctx)
    }
}

/// Commits the qualifier if the mechanism matched
struct DirectiveOutcome(Qualifier);

impl Checker for DirectiveOutcome {
    fn check(self: Box<Self>, session: &mut SpfSession, _ctx: &EvalContext) -> CheckResult {
        if session.mechanism_matched.unwrap_or(false) {
            debug!("Matched with qualifier {:?}", self.0);
            session.current_result = Some(self.0);
        }
        Ok(None)
    }
}

fn evaluate(mechanism: Mechanism, session: &mut SpfSession, ctx: &EvalContext) -> CheckResult {
    match mechanism {
        Mechanism::All => {
            session.mechanism_matched = Some(true);
            Ok(None)
        }
        Mechanism::Ip4(net) => {
            session.mechanism_matched = Some(match session.ip {
                IpAddr::V4(ip) => net.contains(&ip),
                IpAddr::V6(_) => false,
            });
            Ok(None)
        }
        Mechanism::Ip6(net) => {
            session.mechanism_matched = Some(match session.ip {
                IpAddr::V6(ip) => net.contains(&ip),
                IpAddr::V4(_) => false,
            });
            Ok(None)
        }
        Mechanism::A {
            domain,
            ip4_cidr,
            ip6_cidr,
        } => {
            session.increment_depth()?;
            let target = domain.unwrap_or_else(|| session.current_domain.clone());
            expand_then(session, ctx, target, ExpandContext::Domain, move |host, session, _ctx| {
                let request = DnsRequest::new(host?, session.address_record_type());
                Ok(Some(DnsLookupContinuation::new(
                    request,
                    move |response, session, _ctx| {
                        let matched = response
                            .records()?
                            .iter()
                            .any(|a| session.in_network(a, ip4_cidr, ip6_cidr));
                        session.mechanism_matched = Some(matched);
                        Ok(None)
                    },
                )))
            })
        }
        Mechanism::Mx {
            domain,
            ip4_cidr,
            ip6_cidr,
        } => {
            session.increment_depth()?;
            let target = domain.unwrap_or_else(|| session.current_domain.clone());
            expand_then(session, ctx, target, ExpandContext::Domain, move |host, _session, _ctx| {
                let request = DnsRequest::new(host?, RecordType::Mx);
                Ok(Some(DnsLookupContinuation::new(
                    request,
                    move |response, session, ctx| {
                        let exchanges: VecDeque<String> = response
                            .records()?
                            .iter()
                            .take(ctx.record_limit)
                            .cloned()
                            .collect();
                        debug!("Checking {} MX host(s)", exchanges.len());
                        next_exchange(exchanges, session, ip4_cidr, ip6_cidr)
                    },
                )))
            })
        }
        Mechanism::Ptr(domain) => {
            session.increment_depth()?;
            let target = domain.unwrap_or_else(|| session.current_domain.clone());
            expand_then(session, ctx, target, ExpandContext::Domain, |target, session, _ctx| {
                let target = target?;
                let request = DnsRequest::new(session.reverse_name(), RecordType::Ptr);
                Ok(Some(DnsLookupContinuation::new(
                    request,
                    move |response, session, ctx| {
                        let names: VecDeque<String> = match response.records() {
                            Ok(names) => names
                                .iter()
                                .take(ctx.record_limit)
                                .filter(|name| is_within(name, &target))
                                .cloned()
                                .collect(),
                            Err(e) => {
                                debug!("PTR lookup failed, no match: {}", e);
                                VecDeque::new()
                            }
                        };
                        next_ptr_name(names, session)
                    },
                )))
            })
        }
        Mechanism::Exists(domain) => {
            session.increment_depth()?;
            expand_then(session, ctx, domain, ExpandContext::Domain, |host, _session, _ctx| {
                let request = DnsRequest::new(host?, RecordType::A);
                Ok(Some(DnsLookupContinuation::new(
                    request,
                    |response, session, _ctx| {
                        session.mechanism_matched = Some(!response.records()?.is_empty());
                        Ok(None)
                    },
                )))
            })
        }
        Mechanism::Include(domain) => {
            session.increment_depth()?;
            expand_then(session, ctx, domain, ExpandContext::Domain, |target, session, _ctx| {
                begin_include(target?, session);
                Ok(None)
            })
        }
    }
}

/// Resolve the next MX exchange, stopping at the first one covering the client
fn next_exchange(
    mut exchanges: VecDeque<String>,
    session: &mut SpfSession,
    ip4_cidr: u8,
    ip6_cidr: u8,
) -> CheckResult {
    let Some(host) = exchanges.pop_front() else {
        session.mechanism_matched = Some(false);
        return Ok(None);
    };

    let request = DnsRequest::new(host, session.address_record_type());
    Ok(Some(DnsLookupContinuation::new(
        request,
        move |response, session, _ctx| {
            if response
                .records()?
                .iter()
                .any(|a| session.in_network(a, ip4_cidr, ip6_cidr))
            {
                session.mechanism_matched = Some(true);
                return Ok(None);
            }
            next_exchange(exchanges, session, ip4_cidr, ip6_cidr)
        },
    )))
}

/// Forward-resolve the next PTR name; names whose lookup fails are skipped
fn next_ptr_name(mut names: VecDeque<String>, session: &mut SpfSession) -> CheckResult {
    let Some(name) = names.pop_front() else {
        session.mechanism_matched = Some(false);
        return Ok(None);
    };

    let request = DnsRequest::new(name, session.address_record_type());
    Ok(Some(DnsLookupContinuation::new(
        request,
        move |response, session, _ctx| {
            let matched = match response.records() {
                Ok(addresses) => addresses.iter().any(|a| session.is_client_address(a)),
                Err(e) => {
                    debug!("Skipping PTR name: {}", e);
                    false
                }
            };
            if matched {
                session.mechanism_matched = Some(true);
                return Ok(None);
            }
            next_ptr_name(names, session)
        },
    )))
}

/// Whether `name` equals `domain` or is one of its subdomains
fn is_within(name: &str, domain: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    name == domain || name.ends_with(&format!(".{}", domain))
}

/// Evaluate `target` as a nested policy; restored by [`IncludeCleanup`]
///
/// The included policy's explanation is never reported, so its `exp=` and
/// default explanation are not evaluated.
fn begin_include(target: String, session: &mut SpfSession) {
    debug!("Including {} from {}", target, session.current_domain);
    let cleanup = IncludeCleanup {
        domain: mem::replace(&mut session.current_domain, target),
        explanation: session.explanation.take(),
        ignore_explanation: mem::replace(&mut session.ignore_explanation, true),
    };
    session.current_result = None;
    session.push(Box::new(cleanup));
    session.push(Box::new(EvaluateDomain));
}

/// Maps the included policy's result onto a match and restores the
/// including policy's state
struct IncludeCleanup {
    domain: String,
    explanation: Option<String>,
    ignore_explanation: bool,
}

impl IncludeCleanup {
    fn restore(self, session: &mut SpfSession) {
        session.current_domain = self.domain;
        session.explanation = self.explanation;
        session.ignore_explanation = self.ignore_explanation;
        session.current_result = None;
    }
}

impl Checker for IncludeCleanup {
    fn check(self: Box<Self>, session: &mut SpfSession, _ctx: &EvalContext) -> CheckResult {
        let child = session.current_result;
        debug!("Included {} returned {:?}", session.current_domain, child);
        session.mechanism_matched = Some(child == Some(Qualifier::Pass));
        (*self).restore(session);
        Ok(None)
    }

    fn catch(
        self: Box<Self>,
        error: SpfError,
        session: &mut SpfSession,
        _ctx: &EvalContext,
    ) -> Result<(), SpfError> {
        let included = session.current_domain.clone();
        (*self).restore(session);
        match error {
            SpfError::None(reason) => Err(SpfError::perm(format!(
                "Included domain {} has no policy: {}",
                included, reason
            ))),
            other => Err(other),
        }
    }
}

//! SPF record parser
//!
//! The term registry is compiled once into a single anchored expression of the
//! form `qualifier? (mechanism alternation) | (modifier alternation)`. Each
//! registered fragment is wrapped in an owning group, and the parser remembers
//! which overall group index belongs to which term so a matched token is handed
//! to exactly one constructor with its own capture slice.

use super::terms::{TermSpec, MECHANISMS, MODIFIERS};
use super::{is_spf_record, Directive, PolicyRecord, Qualifier, SPF_VERSION};
use crate::error::SpfError;
use regex::{Captures, Regex};
use std::mem::discriminant;
use tracing::debug;

/// Owning group of one registered term
#[derive(Debug, Clone, Copy)]
struct Route {
    term: usize,
    group: usize,
    captures: usize,
}

impl Route {
    fn args<'t>(&self, caps: &Captures<'t>) -> Vec<Option<&'t str>> {
        (self.group + 1..=self.group + self.captures)
            .map(|i| caps.get(i).map(|m| m.as_str()))
            .collect()
    }
}

/// Parser for `v=spf1` records
#[derive(Debug)]
pub struct RecordParser {
    term_regex: Regex,
    mechanism_routes: Vec<Route>,
    modifier_routes: Vec<Route>,
}

impl Default for RecordParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Append `specs` as an alternation of owning groups starting at `next_group`
fn compose<T>(specs: &[TermSpec<T>], next_group: &mut usize) -> (String, Vec<Route>) {
    let mut fragments = Vec::with_capacity(specs.len());
    let mut routes = Vec::with_capacity(specs.len());

    for (term, spec) in specs.iter().enumerate() {
        fragments.push(format!("({})", (spec.pattern)()));
        routes.push(Route {
            term,
            group: *next_group,
            captures: spec.captures,
        });
        *next_group += 1 + spec.captures;
    }

    (fragments.join("|"), routes)
}

impl RecordParser {
    pub fn new() -> Self {
        // Group 1 is the qualifier
        let mut next_group = 2;
        let (mechanisms, mechanism_routes) = compose(MECHANISMS, &mut next_group);
        let (modifiers, modifier_routes) = compose(MODIFIERS, &mut next_group);

        let pattern = format!(
            r"^(?:([+\-~?])?(?:{})|(?:{}))$",
            mechanisms, modifiers
        );
        let term_regex = Regex::new(&pattern).expect("Invalid SPF term grammar");

        Self {
            term_regex,
            mechanism_routes,
            modifier_routes,
        }
    }

    /// Parse a record
    ///
    /// Text without the `v=spf1` version token is `SpfError::None`; any
    /// malformed term is `SpfError::PermError`.
    pub fn parse(&self, text: &str) -> Result<PolicyRecord, SpfError> {
        if !is_spf_record(text) {
            return Err(SpfError::none(format!("Not an SPF record: {}", text)));
        }

        let mut record = PolicyRecord::new(text);

        for token in text[SPF_VERSION.len()..].split(' ').filter(|t| !t.is_empty()) {
            let caps = self
                .term_regex
                .captures(token)
                .ok_or_else(|| SpfError::perm(format!("Unknown term: {}", token)))?;

            if let Some(route) = self.mechanism_routes.iter().find(|r| caps.get(r.group).is_some()) {
                let qualifier = match caps.get(1) {
                    Some(q) => q
                        .as_str()
                        .chars()
                        .next()
                        .and_then(Qualifier::from_symbol)
                        .ok_or_else(|| SpfError::perm(format!("Invalid qualifier: {}", token)))?,
                    None => Qualifier::Pass,
                };
                let mechanism = (MECHANISMS[route.term].build)(&route.args(&caps))?;
                record.directives.push(Directive::new(qualifier, mechanism));
                continue;
            }

            let route = self
                .modifier_routes
                .iter()
                .find(|r| caps.get(r.group).is_some())
                .ok_or_else(|| SpfError::perm(format!("Unknown term: {}", token)))?;
            let modifier = (MODIFIERS[route.term].build)(&route.args(&caps))?;

            if modifier.is_single_instance()
                && record
                    .modifiers
                    .iter()
                    .any(|m| discriminant(m) == discriminant(&modifier))
            {
                return Err(SpfError::perm(format!(
                    "Duplicate {} modifier",
                    modifier.name()
                )));
            }
            record.modifiers.push(modifier);
        }

        debug!(
            "Parsed SPF record with {} directive(s) and {} modifier(s)",
            record.directives.len(),
            record.modifiers.len()
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Mechanism, Modifier};
    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> Result<PolicyRecord, SpfError> {
        RecordParser::new().parse(text)
    }

    #[test]
    fn test_parse_simple_record() {
        let record = parse("v=spf1 ip4:192.0.2.0/24 -all").unwrap();
        assert_eq!(record.directives.len(), 2);
        assert_eq!(
            record.directives[0],
            Directive::new(Qualifier::Pass, Mechanism::Ip4("192.0.2.0/24".parse().unwrap()))
        );
        assert_eq!(record.directives[1], Directive::new(Qualifier::Fail, Mechanism::All));
    }

    #[test]
    fn test_directive_order_follows_tokens() {
        let record =
            parse("v=spf1 mx  ~a:mail.example.com/24 ?ptr exists:%{i}.bl.example.com include:_spf.example.net ip6:2001:db8::/32 -all")
                .unwrap();
        let names: Vec<_> = record.directives.iter().map(|d| d.mechanism.name()).collect();
        assert_eq!(names, vec!["mx", "a", "ptr", "exists", "include", "ip6", "all"]);
        assert_eq!(record.directives[1].qualifier, Qualifier::SoftFail);
        assert_eq!(record.directives[2].qualifier, Qualifier::Neutral);
        assert_eq!(
            record.directives[1].mechanism,
            Mechanism::A {
                domain: Some("mail.example.com".into()),
                ip4_cidr: 24,
                ip6_cidr: 128,
            }
        );
    }

    #[test]
    fn test_case_insensitive_names() {
        let record = parse("V=SPF1 MX/24//64 Include:Example.COM REDIRECT=_spf.Example.com").unwrap();
        assert_eq!(
            record.directives[0].mechanism,
            Mechanism::Mx {
                domain: None,
                ip4_cidr: 24,
                ip6_cidr: 64,
            }
        );
        assert_eq!(
            record.directives[1].mechanism,
            Mechanism::Include("Example.COM".into())
        );
        assert_eq!(
            record.modifiers,
            vec![Modifier::Redirect("_spf.Example.com".into())]
        );
    }

    #[test]
    fn test_zero_terms() {
        let record = parse("v=spf1").unwrap();
        assert!(record.directives.is_empty());
        assert!(record.modifiers.is_empty());
    }

    #[test]
    fn test_missing_version_is_none() {
        assert!(matches!(parse("spf1 -all"), Err(SpfError::None(_))));
        assert!(matches!(parse("v=spf10 -all"), Err(SpfError::None(_))));
    }

    #[test]
    fn test_invalid_terms() {
        for text in [
            "v=spf1 foo",
            "v=spf1 !all",
            "v=spf1 ip4:192.0.2.0/33",
            "v=spf1 ip6:2001:db8::/129",
            "v=spf1 ip4:300.0.2.1",
            "v=spf1 a/40",
            "v=spf1 include:%{x}.example.com",
            "v=spf1 +redirect=example.com",
            "v=spf1 exists:example",
        ] {
            assert!(
                matches!(parse(text), Err(SpfError::PermError(_))),
                "{} should be a permerror",
                text
            );
        }
    }

    #[test]
    fn test_duplicate_single_instance_modifier() {
        assert!(matches!(
            parse("v=spf1 redirect=a.example.com redirect=b.example.com"),
            Err(SpfError::PermError(_))
        ));
        assert!(matches!(
            parse("v=spf1 exp=a.example.com exp=b.example.com"),
            Err(SpfError::PermError(_))
        ));
    }

    #[test]
    fn test_unknown_modifiers() {
        let record = parse("v=spf1 foo=bar foo=baz -all").unwrap();
        assert_eq!(record.modifiers.len(), 2);
        assert_eq!(
            record.modifiers[0],
            Modifier::Unknown {
                name: "foo".into(),
                value: "bar".into(),
            }
        );

        // A reserved name that fails its own grammar must not fall back to unknown
        assert!(matches!(parse("v=spf1 exp=%"), Err(SpfError::PermError(_))));
        assert!(matches!(parse("v=spf1 redirect=foo"), Err(SpfError::PermError(_))));
    }

    #[test]
    fn test_display_round_trip() {
        let text = "v=spf1 a/24 -mx:example.com ip4:192.0.2.1 ?all exp=explain.example.com";
        let record = parse(text).unwrap();
        assert_eq!(record.to_string(), text);
    }
}

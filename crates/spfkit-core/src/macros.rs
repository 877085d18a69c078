//! SPF macro expansion (RFC 4408 section 8)

use crate::error::SpfError;
use regex::Regex;

/// Identity values a macro string can reference
pub trait MacroData {
    /// `i`: dotted IPv4 or dot-separated IPv6 nibbles
    fn macro_ip(&self) -> &str;
    /// `s`
    fn mail_from(&self) -> &str;
    /// `l`
    fn local_part(&self) -> &str;
    /// `o`
    fn sender_domain(&self) -> &str;
    /// `h`
    fn helo(&self) -> &str;
    /// `d`
    fn current_domain(&self) -> &str;
    /// `v`: `in-addr` or `ip6`
    fn in_address(&self) -> &str;
    /// `c`: conventional text form of the client address
    fn readable_ip(&self) -> &str;
    /// `p`: validated client domain, once known
    fn client_domain(&self) -> Option<&str>;
    /// `r`
    fn receiving_domain(&self) -> Option<&str>;
    /// `t`: seconds since the epoch
    fn timestamp(&self) -> i64;
}

/// Where a macro string is being expanded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandContext {
    /// A domain-spec; the result is truncated to 255 octets
    Domain,
    /// An explanation string; `c`, `r` and `t` are allowed
    Explanation,
}

/// Outcome of an expansion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    Expanded(String),
    /// The template references `%{p}` and the client domain is not validated yet
    NeedsClientDomain,
}

const MAX_DOMAIN_LENGTH: usize = 255;

/// Macro string expander
#[derive(Debug)]
pub struct MacroExpander {
    token_regex: Regex,
    cell_regex: Regex,
    local_names: Vec<String>,
}

impl MacroExpander {
    /// Create an expander; `local_names` back the `%{r}` fallback
    pub fn new(local_names: Vec<String>) -> Self {
        Self {
            token_regex: Regex::new(r"%\{[^}]*\}|%[%_\-]|[^%]+").expect("Invalid macro token regex"),
            cell_regex: Regex::new(r"^([a-zA-Z])([0-9]*)([rR]?)([.\-+,/_=]*)$")
                .expect("Invalid macro cell regex"),
            local_names,
        }
    }

    /// Receiving domain used when the caller supplied none: the first
    /// fully-qualified local host name, else `unknown`
    pub fn fallback_receiving_domain(&self) -> String {
        self.local_names
            .iter()
            .map(|name| name.trim_end_matches('.'))
            .find(|name| name.contains('.'))
            .map(str::to_string)
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn expand(
        &self,
        template: &str,
        data: &dyn MacroData,
        context: ExpandContext,
    ) -> Result<Expansion, SpfError> {
        match context {
            ExpandContext::Domain => match self.expand_string(template, data, context)? {
                Some(expanded) => Ok(Expansion::Expanded(truncate_domain(expanded))),
                None => Ok(Expansion::NeedsClientDomain),
            },
            ExpandContext::Explanation => {
                let mut pieces = Vec::new();
                for piece in template.split(' ').filter(|p| !p.is_empty()) {
                    match self.expand_string(piece, data, context)? {
                        Some(expanded) => pieces.push(expanded),
                        None => return Ok(Expansion::NeedsClientDomain),
                    }
                }
                Ok(Expansion::Expanded(pieces.join(" ")))
            }
        }
    }

    /// Expand one space-free macro string; `None` when `%{p}` is not available
    fn expand_string(
        &self,
        template: &str,
        data: &dyn MacroData,
        context: ExpandContext,
    ) -> Result<Option<String>, SpfError> {
        let mut output = String::with_capacity(template.len());
        let mut position = 0;

        for token in self.token_regex.find_iter(template) {
            if token.start() != position {
                return Err(SpfError::perm(format!("Invalid macro string: {}", template)));
            }
            position = token.end();

            match token.as_str() {
                "%%" => output.push('%'),
                "%_" => output.push(' '),
                "%-" => output.push_str("%20"),
                cell if cell.starts_with("%{") => {
                    match self.expand_cell(&cell[2..cell.len() - 1], data, context)? {
                        Some(value) => output.push_str(&value),
                        None => return Ok(None),
                    }
                }
                literal => output.push_str(literal),
            }
        }

        if position != template.len() {
            return Err(SpfError::perm(format!("Invalid macro string: {}", template)));
        }
        Ok(Some(output))
    }

    fn expand_cell(
        &self,
        cell: &str,
        data: &dyn MacroData,
        context: ExpandContext,
    ) -> Result<Option<String>, SpfError> {
        let caps = self
            .cell_regex
            .captures(cell)
            .ok_or_else(|| SpfError::perm(format!("Invalid macro: %{{{}}}", cell)))?;

        let letter = caps
            .get(1)
            .and_then(|m| m.as_str().chars().next())
            .ok_or_else(|| SpfError::perm(format!("Invalid macro: %{{{}}}", cell)))?;
        let digits = caps.get(2).map_or("", |m| m.as_str());
        let reverse = caps.get(3).map_or(false, |m| !m.as_str().is_empty());
        let delimiters = caps.get(4).map_or("", |m| m.as_str());

        let explanation_only = context == ExpandContext::Explanation;
        let value = match letter.to_ascii_lowercase() {
            'i' => data.macro_ip().to_string(),
            's' => data.mail_from().to_string(),
            'l' => data.local_part().to_string(),
            'o' => data.sender_domain().to_string(),
            'h' => data.helo().to_string(),
            'd' => data.current_domain().to_string(),
            'v' => data.in_address().to_string(),
            'p' => match data.client_domain() {
                Some(domain) => domain.to_string(),
                None => return Ok(None),
            },
            'c' if explanation_only => data.readable_ip().to_string(),
            'r' if explanation_only => data
                .receiving_domain()
                .map(str::to_string)
                .unwrap_or_else(|| self.fallback_receiving_domain()),
            't' if explanation_only => data.timestamp().to_string(),
            _ => {
                return Err(SpfError::perm(format!(
                    "Unknown macro letter '{}' in this context",
                    letter
                )))
            }
        };

        let transformed = transform(&value, digits, reverse, delimiters)?;
        if letter.is_ascii_uppercase() {
            Ok(Some(url_escape(&transformed)))
        } else {
            Ok(Some(transformed))
        }
    }
}

/// Split on the delimiters, optionally reverse, keep the rightmost parts and
/// rejoin with dots
fn transform(value: &str, digits: &str, reverse: bool, delimiters: &str) -> Result<String, SpfError> {
    let delimiters = if delimiters.is_empty() { "." } else { delimiters };
    let mut parts: Vec<&str> = value.split(|c| delimiters.contains(c)).collect();

    if reverse {
        parts.reverse();
    }

    if !digits.is_empty() {
        let keep = digits.parse::<usize>().unwrap_or(usize::MAX);
        if keep == 0 {
            return Err(SpfError::perm("Macro digit transformer must be at least 1"));
        }
        if keep < parts.len() {
            parts.drain(..parts.len() - keep);
        }
    }

    Ok(parts.join("."))
}

/// Percent-encode everything outside the RFC 3986 unreserved set
fn url_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                escaped.push(byte as char)
            }
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

/// Drop leading labels until the domain fits in 255 octets
fn truncate_domain(mut domain: String) -> String {
    while domain.len() > MAX_DOMAIN_LENGTH {
        match domain.find('.') {
            Some(index) => {
                domain.drain(..=index);
            }
            None => break,
        }
    }
    domain
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Identity {
        domain: String,
        client_domain: Option<String>,
        receiving_domain: Option<String>,
        mail_from: String,
    }

    impl Identity {
        fn new() -> Self {
            Self {
                domain: "email.example.com".into(),
                client_domain: Some("mx.example.org".into()),
                receiving_domain: Some("receiver.example.net".into()),
                mail_from: "strong-bad@email.example.com".into(),
            }
        }
    }

    impl MacroData for Identity {
        fn macro_ip(&self) -> &str {
            "192.0.2.3"
        }
        fn mail_from(&self) -> &str {
            &self.mail_from
        }
        fn local_part(&self) -> &str {
            "strong-bad"
        }
        fn sender_domain(&self) -> &str {
            "email.example.com"
        }
        fn helo(&self) -> &str {
            "mx.example.org"
        }
        fn current_domain(&self) -> &str {
            &self.domain
        }
        fn in_address(&self) -> &str {
            "in-addr"
        }
        fn readable_ip(&self) -> &str {
            "192.0.2.3"
        }
        fn client_domain(&self) -> Option<&str> {
            self.client_domain.as_deref()
        }
        fn receiving_domain(&self) -> Option<&str> {
            self.receiving_domain.as_deref()
        }
        fn timestamp(&self) -> i64 {
            1_200_000_000
        }
    }

    fn expand(template: &str, data: &Identity, context: ExpandContext) -> Result<String, SpfError> {
        match MacroExpander::new(vec!["localhost".into(), "mail.local.test.".into()])
            .expand(template, data, context)?
        {
            Expansion::Expanded(s) => Ok(s),
            Expansion::NeedsClientDomain => panic!("unexpected client domain request"),
        }
    }

    fn domain(template: &str) -> Result<String, SpfError> {
        expand(template, &Identity::new(), ExpandContext::Domain)
    }

    #[test]
    fn test_rfc_examples() {
        assert_eq!(domain("%{s}").unwrap(), "strong-bad@email.example.com");
        assert_eq!(domain("%{o}").unwrap(), "email.example.com");
        assert_eq!(domain("%{d}").unwrap(), "email.example.com");
        assert_eq!(domain("%{d4}").unwrap(), "email.example.com");
        assert_eq!(domain("%{d3}").unwrap(), "email.example.com");
        assert_eq!(domain("%{d2}").unwrap(), "example.com");
        assert_eq!(domain("%{d1}").unwrap(), "com");
        assert_eq!(domain("%{dr}").unwrap(), "com.example.email");
        assert_eq!(domain("%{d2r}").unwrap(), "example.email");
        assert_eq!(domain("%{l}").unwrap(), "strong-bad");
        assert_eq!(domain("%{l-}").unwrap(), "strong.bad");
        assert_eq!(domain("%{lr}").unwrap(), "strong-bad");
        assert_eq!(domain("%{lr-}").unwrap(), "bad.strong");
        assert_eq!(domain("%{l1r-}").unwrap(), "strong");
        assert_eq!(
            domain("%{ir}.%{v}._spf.%{d2}").unwrap(),
            "3.2.0.192.in-addr._spf.example.com"
        );
        assert_eq!(
            domain("%{lr-}.lp._spf.%{d2}").unwrap(),
            "bad.strong.lp._spf.example.com"
        );
        assert_eq!(
            domain("%{ir}.%{v}.%{l1r-}.lp._spf.%{d2}").unwrap(),
            "3.2.0.192.in-addr.strong.lp._spf.example.com"
        );
    }

    #[test]
    fn test_digit_transformer() {
        let mut data = Identity::new();
        data.domain = "a.b.c.example.com".into();
        assert_eq!(expand("%{d2}", &data, ExpandContext::Domain).unwrap(), "example.com");
        assert_eq!(
            expand("%{dr}", &data, ExpandContext::Domain).unwrap(),
            "com.example.c.b.a"
        );
        assert_eq!(
            expand("%{d99}", &data, ExpandContext::Domain).unwrap(),
            "a.b.c.example.com"
        );
        assert!(matches!(
            expand("%{d0}", &data, ExpandContext::Domain),
            Err(SpfError::PermError(_))
        ));
    }

    #[test]
    fn test_escapes_and_url_encoding() {
        assert_eq!(domain("%%%_%-").unwrap(), "% %20");
        let mut data = Identity::new();
        data.mail_from = "a b@example.com".into();
        assert_eq!(
            expand("%{S}", &data, ExpandContext::Explanation).unwrap(),
            "a%20b%40example.com"
        );
        assert_eq!(
            expand("%{I}", &data, ExpandContext::Explanation).unwrap(),
            "192.0.2.3"
        );
    }

    #[test]
    fn test_malformed_macros() {
        for template in ["%", "%{d", "%{}", "%{x}", "%{d2x}", "a%b", "%{d}%"] {
            assert!(
                matches!(domain(template), Err(SpfError::PermError(_))),
                "{} should be rejected",
                template
            );
        }
    }

    #[test]
    fn test_explanation_only_letters() {
        for template in ["%{c}", "%{r}", "%{t}"] {
            assert!(matches!(domain(template), Err(SpfError::PermError(_))));
        }

        let data = Identity::new();
        assert_eq!(
            expand("%{c} %{r} %{t}", &data, ExpandContext::Explanation).unwrap(),
            "192.0.2.3 receiver.example.net 1200000000"
        );
    }

    #[test]
    fn test_receiving_domain_fallback() {
        let mut data = Identity::new();
        data.receiving_domain = None;
        assert_eq!(
            expand("%{r}", &data, ExpandContext::Explanation).unwrap(),
            "mail.local.test"
        );
        assert_eq!(
            MacroExpander::new(vec!["localhost".into()]).fallback_receiving_domain(),
            "unknown"
        );
    }

    #[test]
    fn test_explanation_pieces() {
        let data = Identity::new();
        assert_eq!(
            expand("%{i} is  not allowed to send for %{d}", &data, ExpandContext::Explanation)
                .unwrap(),
            "192.0.2.3 is not allowed to send for email.example.com"
        );
    }

    #[test]
    fn test_client_domain_pending() {
        let mut data = Identity::new();
        data.client_domain = None;
        let expansion = MacroExpander::new(Vec::new())
            .expand("%{p}.example.com", &data, ExpandContext::Domain)
            .unwrap();
        assert_eq!(expansion, Expansion::NeedsClientDomain);

        data.client_domain = Some("mx.example.org".into());
        assert_eq!(
            expand("%{p2}", &data, ExpandContext::Domain).unwrap(),
            "example.org"
        );
    }

    #[test]
    fn test_values_are_literal() {
        let mut data = Identity::new();
        data.mail_from = "$1\\0@example.com".into();
        assert_eq!(
            expand("%{s}", &data, ExpandContext::Domain).unwrap(),
            "$1\\0@example.com"
        );
    }

    #[test]
    fn test_plain_text_is_unchanged() {
        for template in ["example.com", "_spf.example.com.", "a-b.c_d.example"] {
            let once = domain(template).unwrap();
            assert_eq!(once, template);
            assert_eq!(domain(&once).unwrap(), once);
        }
    }

    #[test]
    fn test_domain_truncation() {
        let mut data = Identity::new();
        let label = "a".repeat(60);
        data.domain = vec![label.as_str(); 5].join(".") + ".example.com";
        let expanded = expand("%{d}", &data, ExpandContext::Domain).unwrap();
        assert!(expanded.len() <= 255);
        assert!(expanded.ends_with(".example.com"));
        assert_eq!(expanded, vec![label.as_str(); 4].join(".") + ".example.com");
    }
}

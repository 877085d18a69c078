//! Per-check evaluation state
//!
//! A session carries the identity of the connection being checked, the
//! evaluation state shared by the checkers, and the checker stack itself.
//! Everything a checker needs across a DNS suspension lives here as a typed
//! field.

use crate::checker::Checker;
use crate::dns::RecordType;
use crate::error::SpfError;
use crate::macros::MacroData;
use crate::record::{PolicyRecord, Qualifier};
use crate::result::{HeaderFields, SpfOutcome, SpfResult};
use ipnet::IpNet;
use std::net::IpAddr;

/// Maximum number of DNS-querying terms per check (RFC 4408 section 10.1)
pub const MAX_DEPTH: u32 = 10;

const DEFAULT_LOCAL_PART: &str = "postmaster";

/// Evaluation state of one SPF check
pub struct SpfSession {
    // Identity
    pub(crate) ip: IpAddr,
    pub(crate) macro_ip: String,
    pub(crate) readable_ip: String,
    pub(crate) in_address: &'static str,
    envelope_from: String,
    pub(crate) mail_from: String,
    pub(crate) local_part: String,
    pub(crate) sender_domain: String,
    pub(crate) helo: String,
    pub(crate) client_domain: Option<String>,
    pub(crate) receiving_domain: Option<String>,
    pub(crate) timestamp: i64,

    // Evaluation state
    pub(crate) current_domain: String,
    pub(crate) current_result: Option<Qualifier>,
    final_result: Option<SpfResult>,
    pub(crate) explanation: Option<String>,
    pub(crate) ignore_explanation: bool,
    depth: u32,
    pub(crate) raw_record: Option<String>,
    pub(crate) record: Option<PolicyRecord>,
    pub(crate) mechanism_matched: Option<bool>,

    stack: Vec<Box<dyn Checker>>,
}

impl SpfSession {
    /// Create a session for a connection from `ip` using `mail_from` and `helo`
    ///
    /// An unparsable IP is a `PermError`; a check with neither a MAIL FROM
    /// domain nor a HELO name is `None`.
    pub fn new(ip: &str, mail_from: &str, helo: &str) -> Result<Self, SpfError> {
        let ip = normalize_ip(
            ip.trim()
                .parse::<IpAddr>()
                .map_err(|_| SpfError::perm(format!("Invalid client IP address: {}", ip)))?,
        );

        let helo = helo.trim().trim_end_matches('.').to_string();
        let envelope_from = mail_from.trim().to_string();
        let (local_part, sender_domain) = match envelope_from.rsplit_once('@') {
            Some((local, domain)) => (local.to_string(), domain.to_string()),
            None if envelope_from.is_empty() => (String::new(), helo.clone()),
            None => (String::new(), envelope_from.clone()),
        };
        let local_part = if local_part.is_empty() {
            DEFAULT_LOCAL_PART.to_string()
        } else {
            local_part
        };
        let sender_domain = sender_domain.trim_end_matches('.').to_string();

        if sender_domain.is_empty() {
            return Err(SpfError::none("No sender domain to check"));
        }

        let (macro_ip, in_address) = match ip {
            IpAddr::V4(v4) => (v4.to_string(), "in-addr"),
            IpAddr::V6(v6) => {
                let nibbles: Vec<String> = v6
                    .octets()
                    .iter()
                    .flat_map(|b| [b >> 4, b & 0x0f])
                    .map(|n| format!("{:x}", n))
                    .collect();
                (nibbles.join("."), "ip6")
            }
        };

        Ok(Self {
            ip,
            macro_ip,
            readable_ip: ip.to_string(),
            in_address,
            mail_from: format!("{}@{}", local_part, sender_domain),
            envelope_from,
            local_part,
            current_domain: sender_domain.clone(),
            sender_domain,
            helo,
            client_domain: None,
            receiving_domain: None,
            timestamp: chrono::Utc::now().timestamp(),
            current_result: None,
            final_result: None,
            explanation: None,
            ignore_explanation: false,
            depth: 0,
            raw_record: None,
            record: None,
            mechanism_matched: None,
            stack: Vec::new(),
        })
    }

    /// Name of the receiving MTA, used by the `%{r}` macro
    pub fn with_receiving_domain(mut self, domain: impl Into<String>) -> Self {
        self.receiving_domain = Some(domain.into());
        self
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn sender_domain(&self) -> &str {
        &self.sender_domain
    }

    pub fn final_result(&self) -> Option<SpfResult> {
        self.final_result
    }

    pub(crate) fn push(&mut self, checker: Box<dyn Checker>) {
        self.stack.push(checker);
    }

    pub(crate) fn pop(&mut self) -> Option<Box<dyn Checker>> {
        self.stack.pop()
    }

    /// Count one DNS-querying term
    pub(crate) fn increment_depth(&mut self) -> Result<(), SpfError> {
        if self.depth >= MAX_DEPTH {
            return Err(SpfError::perm(format!(
                "Maximum of {} DNS-querying terms exceeded",
                MAX_DEPTH
            )));
        }
        self.depth += 1;
        Ok(())
    }

    /// Commit the final category; later attempts are ignored
    pub(crate) fn set_final_result(&mut self, result: SpfResult) {
        if self.final_result.is_none() {
            self.final_result = Some(result);
        }
    }

    /// Address record type matching the client's family
    pub(crate) fn address_record_type(&self) -> RecordType {
        match self.ip {
            IpAddr::V4(_) => RecordType::A,
            IpAddr::V6(_) => RecordType::Aaaa,
        }
    }

    /// Reverse-DNS name of the client address
    pub(crate) fn reverse_name(&self) -> String {
        let reversed: Vec<&str> = self.macro_ip.rsplit('.').collect();
        let zone = match self.ip {
            IpAddr::V4(_) => "in-addr.arpa",
            IpAddr::V6(_) => "ip6.arpa",
        };
        format!("{}.{}", reversed.join("."), zone)
    }

    /// Whether `address` equals the client address
    pub(crate) fn is_client_address(&self, address: &str) -> bool {
        address
            .parse::<IpAddr>()
            .map(|ip| normalize_ip(ip) == self.ip)
            .unwrap_or(false)
    }

    /// Whether the client lies in `address` masked with the CIDR length of its family
    pub(crate) fn in_network(&self, address: &str, ip4_cidr: u8, ip6_cidr: u8) -> bool {
        let Ok(address) = address.parse::<IpAddr>() else {
            return false;
        };
        let prefix = match address {
            IpAddr::V4(_) => ip4_cidr,
            IpAddr::V6(_) => ip6_cidr,
        };
        match IpNet::new(address, prefix) {
            Ok(net) => net.trunc().contains(&self.ip),
            Err(_) => false,
        }
    }

    pub(crate) fn header_fields(&self) -> HeaderFields {
        HeaderFields::new(
            &self.readable_ip,
            &self.envelope_from,
            &self.helo,
            &self.sender_domain,
        )
    }

    /// Finish the check
    pub(crate) fn into_outcome(self) -> SpfOutcome {
        let result = self.final_result.unwrap_or(SpfResult::Neutral);
        let explanation = match result {
            SpfResult::Fail => self.explanation.clone(),
            _ => None,
        };
        SpfOutcome::new(result, &self.header_fields(), explanation)
    }
}

/// Treat IPv4-mapped IPv6 addresses as IPv4
fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

impl MacroData for SpfSession {
    fn macro_ip(&self) -> &str {
        &self.macro_ip
    }

    fn mail_from(&self) -> &str {
        &self.mail_from
    }

    fn local_part(&self) -> &str {
        &self.local_part
    }

    fn sender_domain(&self) -> &str {
        &self.sender_domain
    }

    fn helo(&self) -> &str {
        &self.helo
    }

    fn current_domain(&self) -> &str {
        &self.current_domain
    }

    fn in_address(&self) -> &str {
        self.in_address
    }

    fn readable_ip(&self) -> &str {
        &self.readable_ip
    }

    fn client_domain(&self) -> Option<&str> {
        self.client_domain.as_deref()
    }

    fn receiving_domain(&self) -> Option<&str> {
        self.receiving_domain.as_deref()
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_identity_from_mail_from() {
        let session = SpfSession::new("192.0.2.3", "strong-bad@email.example.com", "mx.example.org").unwrap();
        assert_eq!(session.local_part, "strong-bad");
        assert_eq!(session.sender_domain, "email.example.com");
        assert_eq!(session.current_domain, "email.example.com");
        assert_eq!(session.macro_ip, "192.0.2.3");
        assert_eq!(session.in_address, "in-addr");
        assert_eq!(session.reverse_name(), "3.2.0.192.in-addr.arpa");
    }

    #[test]
    fn test_empty_mail_from_uses_helo() {
        let session = SpfSession::new("192.0.2.3", "", "mx.example.org").unwrap();
        assert_eq!(session.sender_domain, "mx.example.org");
        assert_eq!(session.mail_from, "postmaster@mx.example.org");
        assert_eq!(session.local_part, "postmaster");
    }

    #[test]
    fn test_invalid_identities() {
        assert!(matches!(
            SpfSession::new("not-an-ip", "a@example.com", "helo"),
            Err(SpfError::PermError(_))
        ));
        assert!(matches!(
            SpfSession::new("192.0.2.3", "", ""),
            Err(SpfError::None(_))
        ));
    }

    #[test]
    fn test_ipv6_identity() {
        let session = SpfSession::new("2001:db8::cb01", "a@example.com", "helo").unwrap();
        assert_eq!(
            session.macro_ip,
            "2.0.0.1.0.d.b.8.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.c.b.0.1"
        );
        assert_eq!(session.in_address, "ip6");
        assert_eq!(session.address_record_type(), RecordType::Aaaa);
        assert!(session.reverse_name().ends_with(".ip6.arpa"));
        assert!(session.reverse_name().starts_with("1.0.b.c."));

        let mapped = SpfSession::new("::ffff:192.0.2.3", "a@example.com", "helo").unwrap();
        assert_eq!(mapped.address_record_type(), RecordType::A);
    }

    #[test]
    fn test_depth_limit() {
        let mut session = SpfSession::new("192.0.2.3", "a@example.com", "helo").unwrap();
        for _ in 0..MAX_DEPTH {
            session.increment_depth().unwrap();
        }
        assert!(matches!(
            session.increment_depth(),
            Err(SpfError::PermError(_))
        ));
    }

    #[test]
    fn test_network_matching() {
        let session = SpfSession::new("192.0.2.130", "a@example.com", "helo").unwrap();
        assert!(session.in_network("192.0.2.1", 24, 128));
        assert!(!session.in_network("192.0.2.1", 32, 128));
        assert!(!session.in_network("2001:db8::1", 24, 0));
        assert!(session.is_client_address("192.0.2.130"));
    }

    #[test]
    fn test_final_result_set_once() {
        let mut session = SpfSession::new("192.0.2.3", "a@example.com", "helo").unwrap();
        session.set_final_result(SpfResult::Pass);
        session.set_final_result(SpfResult::Fail);
        assert_eq!(session.final_result(), Some(SpfResult::Pass));
    }
}

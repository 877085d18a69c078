//! DNS collaborator contract
//!
//! The engine never talks to the network itself. Checkers describe the
//! lookup they need as a [`DnsRequest`]; an executor performs it through a
//! [`DnsService`] and hands the [`DnsResponse`] back to the waiting listener.

mod memory;
mod resolver;

pub use memory::StaticDnsService;
pub use resolver::ResolverDnsService;

use crate::error::SpfError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Record types the engine asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
    Mx,
    Ptr,
    Txt,
    /// Obsolete SPF RR type (99)
    Spf,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Mx => "MX",
            RecordType::Ptr => "PTR",
            RecordType::Txt => "TXT",
            RecordType::Spf => "SPF",
        };
        f.write_str(name)
    }
}

/// A pending lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRequest {
    pub hostname: String,
    pub record_type: RecordType,
}

impl DnsRequest {
    pub fn new(hostname: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            hostname: hostname.into(),
            record_type,
        }
    }
}

impl fmt::Display for DnsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.record_type, self.hostname)
    }
}

/// Lookup failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("DNS lookup timed out: {0}")]
    Timeout(String),

    #[error("DNS lookup failed: {0}")]
    Failure(String),
}

/// Answer delivered to a continuation listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse(Result<Vec<String>, DnsError>);

impl DnsResponse {
    /// Records of a successful answer; lookup failures become `TempError`
    pub fn records(&self) -> Result<&[String], SpfError> {
        match &self.0 {
            Ok(records) => Ok(records),
            Err(e) => Err(SpfError::temp(e.to_string())),
        }
    }
}

impl From<Result<Vec<String>, DnsError>> for DnsResponse {
    fn from(result: Result<Vec<String>, DnsError>) -> Self {
        DnsResponse(result)
    }
}

/// Source of DNS answers
///
/// `get_records` returns the answer strings in order: addresses for A/AAAA,
/// exchange host names for MX (by preference), names for PTR, and the joined
/// character-strings of each record for TXT/SPF. A name without records is an
/// empty list, not an error.
#[async_trait]
pub trait DnsService: Send + Sync {
    async fn get_records(&self, request: &DnsRequest) -> Result<Vec<String>, DnsError>;

    /// Host names of this machine, used by the `%{r}` macro
    fn local_domain_names(&self) -> Vec<String>;

    /// Maximum number of MX/PTR answers considered per mechanism
    fn record_limit(&self) -> usize {
        10
    }
}

/// Perform `request`, turning an overrun of `timeout` into `DnsError::Timeout`
pub(crate) async fn lookup(
    dns: &dyn DnsService,
    request: &DnsRequest,
    timeout: Duration,
) -> DnsResponse {
    match tokio::time::timeout(timeout, dns.get_records(request)).await {
        Ok(result) => DnsResponse::from(result),
        Err(_) => DnsResponse::from(Err(DnsError::Timeout(request.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_records() {
        let ok = DnsResponse::from(Ok(vec!["192.0.2.1".to_string()]));
        assert_eq!(ok.records().unwrap(), &["192.0.2.1".to_string()]);

        let timeout = DnsResponse::from(Err(DnsError::Timeout("A example.com".into())));
        assert!(matches!(timeout.records(), Err(SpfError::TempError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_applies_timeout() {
        let dns = StaticDnsService::new().with_delay(Duration::from_secs(30));
        let response = lookup(
            &dns,
            &DnsRequest::new("example.com", RecordType::A),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(response.records(), Err(SpfError::TempError(_))));
    }
}

//! SPF verdicts and the outcome returned to callers

use serde::Serialize;
use std::fmt;

/// Name of the trace header carrying the verdict
pub const RECEIVED_SPF_HEADER: &str = "Received-SPF";

/// SPF verification result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    /// The sending IP is authorized
    Pass,
    /// The sending IP is explicitly not authorized
    Fail,
    /// The sending IP is probably not authorized (soft fail)
    SoftFail,
    /// The domain owner has no opinion
    Neutral,
    /// No SPF record found
    None,
    /// Temporary error (DNS timeout, etc.)
    TempError,
    /// Permanent error (invalid SPF record)
    PermError,
}

impl SpfResult {
    /// Convert to header value for Authentication-Results / Received-SPF
    pub fn as_header_value(&self) -> &'static str {
        match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }

    /// Process exit code used by `spfquery`
    pub fn exit_code(&self) -> u8 {
        match self {
            SpfResult::Pass => 0,
            SpfResult::Fail => 1,
            SpfResult::SoftFail => 2,
            SpfResult::Neutral => 3,
            SpfResult::TempError => 4,
            SpfResult::PermError => 5,
            SpfResult::None => 6,
        }
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_header_value())
    }
}

/// Completed check: verdict, header text and explanation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpfOutcome {
    pub result: SpfResult,
    pub header_text: String,
    pub explanation: Option<String>,
}

/// Identity values quoted in the header text
#[derive(Debug, Clone, Default)]
pub(crate) struct HeaderFields {
    pub ip: String,
    pub mail_from: String,
    pub helo: String,
    pub domain: String,
}

impl HeaderFields {
    pub fn new(ip: &str, mail_from: &str, helo: &str, domain: &str) -> Self {
        Self {
            ip: ip.to_string(),
            mail_from: mail_from.to_string(),
            helo: helo.to_string(),
            domain: domain.to_string(),
        }
    }
}

impl SpfOutcome {
    pub(crate) fn new(
        result: SpfResult,
        fields: &HeaderFields,
        explanation: Option<String>,
    ) -> Self {
        Self {
            result,
            header_text: header_text(result, fields),
            explanation,
        }
    }

    /// Full `Received-SPF:` header line
    pub fn header(&self) -> String {
        format!("{}: {}", RECEIVED_SPF_HEADER, self.header_text)
    }
}

fn header_text(result: SpfResult, f: &HeaderFields) -> String {
    let comment = match result {
        SpfResult::Pass => format!(
            "domain of {} designates {} as permitted sender",
            f.domain, f.ip
        ),
        SpfResult::Fail => format!(
            "domain of {} does not designate {} as permitted sender",
            f.domain, f.ip
        ),
        SpfResult::SoftFail => format!(
            "transitioning domain of {} does not designate {} as permitted sender",
            f.domain, f.ip
        ),
        SpfResult::Neutral | SpfResult::None => format!(
            "{} is neither permitted nor denied by domain of {}",
            f.ip, f.domain
        ),
        SpfResult::PermError => "Error in processing SPF Record".to_string(),
        SpfResult::TempError => "Error in retrieving data from DNS".to_string(),
    };

    format!(
        "{} (spfCheck: {}) client-ip={}; envelope-from={}; helo={};",
        result, comment, f.ip, f.mail_from, f.helo
    )
}

//! In-memory zone
//!
//! Answers lookups from a fixed table. Used for offline evaluation and by the
//! engine's own tests; can also simulate timeouts and slow answers.

use super::{DnsError, DnsRequest, DnsService, RecordType};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// DNS service backed by a static record table
#[derive(Debug, Default)]
pub struct StaticDnsService {
    records: HashMap<(String, RecordType), Vec<String>>,
    timeouts: HashSet<(String, RecordType)>,
    local_names: Vec<String>,
    record_limit: Option<usize>,
    delay: Option<Duration>,
    queries: Mutex<Vec<DnsRequest>>,
}

fn key(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

impl StaticDnsService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one answer for `host`
    pub fn with_record(mut self, host: &str, record_type: RecordType, value: &str) -> Self {
        self.records
            .entry((key(host), record_type))
            .or_default()
            .push(value.to_string());
        self
    }

    /// Publish `record` as the TXT answer of `host`
    pub fn with_txt(self, host: &str, record: &str) -> Self {
        self.with_record(host, RecordType::Txt, record)
    }

    /// Make lookups of `host`/`record_type` time out
    pub fn with_timeout(mut self, host: &str, record_type: RecordType) -> Self {
        self.timeouts.insert((key(host), record_type));
        self
    }

    pub fn with_local_names(mut self, names: &[&str]) -> Self {
        self.local_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_record_limit(mut self, limit: usize) -> Self {
        self.record_limit = Some(limit);
        self
    }

    /// Delay every answer, to exercise executor timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests seen so far, in arrival order
    pub fn queries(&self) -> Vec<DnsRequest> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl DnsService for StaticDnsService {
    async fn get_records(&self, request: &DnsRequest) -> Result<Vec<String>, DnsError> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let key = (key(&request.hostname), request.record_type);
        if self.timeouts.contains(&key) {
            return Err(DnsError::Timeout(request.to_string()));
        }

        Ok(self.records.get(&key).cloned().unwrap_or_default())
    }

    fn local_domain_names(&self) -> Vec<String> {
        self.local_names.clone()
    }

    fn record_limit(&self) -> usize {
        self.record_limit.unwrap_or(10)
    }
}

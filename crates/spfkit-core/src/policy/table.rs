//! Locally configured records that replace or back up DNS

use crate::error::SpfError;
use crate::record::{PolicyRecord, RecordParser};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Host-to-record table with `*.domain` wildcard entries
///
/// Reads are frequent and writes rare; entries can be changed while checks are
/// running.
#[derive(Debug)]
pub struct DomainTable {
    entries: RwLock<HashMap<String, PolicyRecord>>,
    parser: Arc<RecordParser>,
}

impl Default for DomainTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Exact hosts are stored as-is, wildcards as their `.suffix`
fn table_key(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    match host.strip_prefix('*') {
        Some(suffix) => suffix.to_string(),
        None => host,
    }
}

impl DomainTable {
    pub fn new() -> Self {
        Self::with_parser(Arc::new(RecordParser::new()))
    }

    pub fn with_parser(parser: Arc<RecordParser>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            parser,
        }
    }

    /// Add or replace the record for `host`; invalid records are rejected
    pub fn add_entry(&self, host: &str, record: &str) -> Result<(), SpfError> {
        let record = self.parser.parse(record)?;
        let key = table_key(host);
        debug!("Adding local record for {}", key);
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, record);
        Ok(())
    }

    pub fn remove_entry(&self, host: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&table_key(host))
            .is_some()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record for `domain`: an exact entry, else the longest matching wildcard
    pub fn lookup(&self, domain: &str) -> Option<PolicyRecord> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());

        if let Some(record) = entries.get(&domain) {
            return Some(record.clone());
        }

        entries
            .iter()
            .filter(|(key, _)| key.starts_with('.') && domain.ends_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, record)| record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_wildcard_entries() {
        let table = DomainTable::new();
        table.add_entry("example.com", "v=spf1 -all").unwrap();
        table.add_entry("*.example.com", "v=spf1 ?all").unwrap();
        table.add_entry("*.mail.example.com", "v=spf1 +all").unwrap();

        assert_eq!(table.lookup("EXAMPLE.com.").unwrap().text, "v=spf1 -all");
        assert_eq!(table.lookup("www.example.com").unwrap().text, "v=spf1 ?all");
        assert_eq!(table.lookup("a.mail.example.com").unwrap().text, "v=spf1 +all");
        assert!(table.lookup("example.org").is_none());
        assert!(table.lookup("notexample.com").is_none());
    }

    #[test]
    fn test_invalid_entries_rejected() {
        let table = DomainTable::new();
        assert!(matches!(
            table.add_entry("example.com", "v=spf1 bogus"),
            Err(SpfError::PermError(_))
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let table = DomainTable::new();
        table.add_entry("a.example", "v=spf1 -all").unwrap();
        table.add_entry("*.b.example", "v=spf1 -all").unwrap();
        assert_eq!(table.len(), 2);

        assert!(table.remove_entry("*.b.example"));
        assert!(!table.remove_entry("*.b.example"));
        assert_eq!(table.len(), 1);

        table.clear();
        assert!(table.is_empty());
    }
}

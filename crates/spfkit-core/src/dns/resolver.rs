//! DNS service over the trust-dns async resolver

use super::{DnsError, DnsRequest, DnsService, RecordType};
use async_trait::async_trait;
use spfkit_common::config::DnsConfig;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::proto::rr::{RData, RecordType as WireType};
use trust_dns_resolver::TokioAsyncResolver;

/// Production DNS service
pub struct ResolverDnsService {
    resolver: TokioAsyncResolver,
    local_names: Vec<String>,
    record_limit: usize,
}

impl ResolverDnsService {
    /// Create a service from configuration; system resolver settings are used
    /// when no nameservers are configured
    pub fn from_config(config: &DnsConfig) -> spfkit_common::Result<Self> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_millis(config.timeout_ms);

        let resolver = if config.nameservers.is_empty() {
            match TokioAsyncResolver::tokio_from_system_conf() {
                Ok(resolver) => resolver,
                Err(e) => {
                    warn!("Falling back to default resolver configuration: {}", e);
                    TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
                }
            }
        } else {
            let mut group = NameServerConfigGroup::new();
            for server in &config.nameservers {
                let addr = parse_nameserver(server)?;
                group.merge(NameServerConfigGroup::from_ips_clear(
                    &[addr.ip()],
                    addr.port(),
                    true,
                ));
            }
            TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], group), opts)
        };

        Ok(Self {
            resolver,
            local_names: config.local_domain_names.clone(),
            record_limit: config.record_limit,
        })
    }

    async fn query(&self, name: &str, record_type: RecordType) -> Result<Vec<String>, ResolveError> {
        match record_type {
            RecordType::A => {
                let lookup = self.resolver.ipv4_lookup(name).await?;
                Ok(lookup
                    .iter()
                    .map(|record| {
                        let ip: Ipv4Addr = (*record).into();
                        ip.to_string()
                    })
                    .collect())
            }
            RecordType::Aaaa => {
                let lookup = self.resolver.ipv6_lookup(name).await?;
                Ok(lookup
                    .iter()
                    .map(|record| {
                        let ip: Ipv6Addr = (*record).into();
                        ip.to_string()
                    })
                    .collect())
            }
            RecordType::Mx => {
                let lookup = self.resolver.mx_lookup(name).await?;
                let mut exchanges: Vec<(u16, String)> = lookup
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_string()))
                    .collect();
                exchanges.sort_by_key(|(preference, _)| *preference);
                Ok(exchanges
                    .into_iter()
                    .map(|(_, host)| host.trim_end_matches('.').to_string())
                    .collect())
            }
            RecordType::Ptr => {
                let lookup = self.resolver.lookup(name, WireType::PTR).await?;
                Ok(lookup
                    .iter()
                    .filter_map(|rdata| match rdata {
                        RData::PTR(ptr) => Some(ptr.to_string().trim_end_matches('.').to_string()),
                        _ => None,
                    })
                    .collect())
            }
            RecordType::Txt => {
                let lookup = self.resolver.txt_lookup(name).await?;
                Ok(lookup
                    .iter()
                    .map(|record| {
                        record
                            .txt_data()
                            .iter()
                            .map(|d| String::from_utf8_lossy(d))
                            .collect::<String>()
                    })
                    .collect())
            }
            RecordType::Spf => {
                // Type 99 is obsolete; publishers fall back to TXT.
                debug!("Skipping SPF RR type lookup for {}", name);
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl DnsService for ResolverDnsService {
    async fn get_records(&self, request: &DnsRequest) -> Result<Vec<String>, DnsError> {
        let name = format!("{}.", request.hostname.trim_end_matches('.'));

        match self.query(&name, request.record_type).await {
            Ok(records) => {
                debug!("{} -> {} record(s)", request, records.len());
                Ok(records)
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                ResolveErrorKind::Timeout => Err(DnsError::Timeout(request.to_string())),
                _ => {
                    warn!("DNS lookup failed for {}: {}", request, e);
                    Err(DnsError::Failure(format!("{}: {}", request, e)))
                }
            },
        }
    }

    fn local_domain_names(&self) -> Vec<String> {
        self.local_names.clone()
    }

    fn record_limit(&self) -> usize {
        self.record_limit
    }
}

fn parse_nameserver(server: &str) -> spfkit_common::Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    server
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| spfkit_common::Error::Dns(format!("Invalid nameserver: {}", server)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nameserver() {
        assert_eq!(
            parse_nameserver("192.0.2.53").unwrap(),
            "192.0.2.53:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_nameserver("[2001:db8::53]:5353").unwrap(),
            "[2001:db8::53]:5353".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_nameserver("ns.example.com").is_err());
    }
}

//! SPF checker entry point

use crate::checker::EvalContext;
use crate::dns::DnsService;
use crate::executor::{BlockingExecutor, CallbackExecutor, QueuedExecutor, SpfExecutor};
use crate::policy::{self, DomainTable, PolicyChain, Stage};
use crate::record::RecordParser;
use crate::result::{HeaderFields, SpfOutcome, SpfResult};
use crate::session::SpfSession;
use spfkit_common::config::{
    Config, ExecutorKind, DEFAULT_BEST_GUESS_RECORD, DEFAULT_EXPLANATION,
    DEFAULT_TRUSTED_FORWARDER,
};
use spfkit_common::Error;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// SPF checker
///
/// Holds the configured policy chain and executor; cheap to share between
/// tasks behind an `Arc`.
pub struct Spf {
    ctx: Arc<EvalContext>,
    executor: Arc<dyn SpfExecutor>,
}

/// Builder for [`Spf`]
pub struct SpfBuilder {
    dns: Arc<dyn DnsService>,
    parser: Arc<RecordParser>,
    timeout: Duration,
    default_explanation: Option<String>,
    best_guess: Option<String>,
    trusted_forwarder: Option<String>,
    strict_records: bool,
    overrides: Option<Arc<DomainTable>>,
    fallbacks: Option<Arc<DomainTable>>,
    executor: Option<Arc<dyn SpfExecutor>>,
}

impl SpfBuilder {
    /// Per-lookup timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Explanation template used on `fail` when the record publishes none
    pub fn default_explanation(mut self, template: &str) -> Self {
        self.default_explanation = Some(template.to_string());
        self
    }

    pub fn without_default_explanation(mut self) -> Self {
        self.default_explanation = None;
        self
    }

    /// Evaluate the default best-guess record for domains without SPF
    pub fn best_guess(mut self, enabled: bool) -> Self {
        self.best_guess = enabled.then(|| DEFAULT_BEST_GUESS_RECORD.to_string());
        self
    }

    pub fn best_guess_record(mut self, record: &str) -> Self {
        self.best_guess = Some(record.to_string());
        self
    }

    /// Include the default trusted forwarder domain in every record
    pub fn trusted_forwarder(mut self, enabled: bool) -> Self {
        self.trusted_forwarder = enabled.then(|| DEFAULT_TRUSTED_FORWARDER.to_string());
        self
    }

    pub fn trusted_forwarder_domain(mut self, domain: &str) -> Self {
        self.trusted_forwarder = Some(domain.to_string());
        self
    }

    /// Require the SPF RR and TXT records of a domain to agree
    pub fn strict_records(mut self, strict: bool) -> Self {
        self.strict_records = strict;
        self
    }

    pub fn overrides(mut self, table: Arc<DomainTable>) -> Self {
        self.overrides = Some(table);
        self
    }

    pub fn fallbacks(mut self, table: Arc<DomainTable>) -> Self {
        self.fallbacks = Some(table);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn SpfExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Parser shared with the override and fallback tables
    pub fn parser(&self) -> Arc<RecordParser> {
        self.parser.clone()
    }

    fn chain(&self) -> PolicyChain {
        let mut stages = Vec::new();

        if let Some(table) = &self.overrides {
            stages.push(Stage::Override(table.clone()));
        }
        stages.push(Stage::InitialChecks);
        stages.push(Stage::Retrieve {
            strict: self.strict_records,
        });
        if let Some(record) = &self.best_guess {
            stages.push(Stage::BestGuess(record.clone()));
        }
        stages.push(Stage::Parse);
        if let Some(table) = &self.fallbacks {
            stages.push(Stage::Fallback(table.clone()));
        }
        stages.push(Stage::NoRecord);
        if let Some(domain) = &self.trusted_forwarder {
            stages.push(Stage::TrustedForwarder(domain.clone()));
        }
        stages.push(Stage::NeutralIfNoMatch);
        if let Some(template) = &self.default_explanation {
            stages.push(Stage::DefaultExplanation(template.clone()));
        }

        PolicyChain::new(stages)
    }

    pub fn build(self) -> Spf {
        let chain = self.chain();
        debug!("SPF policy chain: {:?}", chain.stages());

        let ctx = EvalContext::new(
            self.dns,
            self.parser,
            chain,
            self.default_explanation,
            self.timeout,
        );

        Spf {
            ctx: Arc::new(ctx),
            executor: self
                .executor
                .unwrap_or_else(|| Arc::new(BlockingExecutor::new())),
        }
    }
}

/// Build a table from configured `host = record` entries
fn table_from_config(
    kind: &str,
    entries: &BTreeMap<String, String>,
    parser: Arc<RecordParser>,
) -> spfkit_common::Result<Arc<DomainTable>> {
    let table = DomainTable::with_parser(parser);
    for (host, record) in entries {
        table.add_entry(host, record).map_err(|e| {
            Error::Validation(format!("Invalid {} record for {}: {}", kind, host, e))
        })?;
    }
    Ok(Arc::new(table))
}

impl Spf {
    pub fn builder(dns: Arc<dyn DnsService>) -> SpfBuilder {
        SpfBuilder {
            dns,
            parser: Arc::new(RecordParser::new()),
            timeout: Duration::from_secs(5),
            default_explanation: Some(DEFAULT_EXPLANATION.to_string()),
            best_guess: None,
            trusted_forwarder: None,
            strict_records: false,
            overrides: None,
            fallbacks: None,
            executor: None,
        }
    }

    /// Create a checker from configuration
    ///
    /// The queued executor spawns its workers, so this must run inside a
    /// Tokio runtime when `executor.kind = "queued"`.
    pub fn from_config(config: &Config, dns: Arc<dyn DnsService>) -> spfkit_common::Result<Self> {
        let policy = &config.policy;
        let mut builder = Spf::builder(dns)
            .timeout(Duration::from_millis(config.dns.timeout_ms))
            .strict_records(policy.strict_records);

        builder = if policy.default_explanation.is_empty() {
            builder.without_default_explanation()
        } else {
            builder.default_explanation(&policy.default_explanation)
        };
        if policy.use_best_guess {
            builder = builder.best_guess_record(&policy.best_guess_record);
        }
        if policy.use_trusted_forwarder {
            builder = builder.trusted_forwarder_domain(&policy.trusted_forwarder);
        }
        if !policy.overrides.is_empty() {
            let table = table_from_config("override", &policy.overrides, builder.parser())?;
            builder = builder.overrides(table);
        }
        if !policy.fallbacks.is_empty() {
            let table = table_from_config("fallback", &policy.fallbacks, builder.parser())?;
            builder = builder.fallbacks(table);
        }

        let executor: Arc<dyn SpfExecutor> = match config.executor.kind {
            ExecutorKind::Blocking => Arc::new(BlockingExecutor::new()),
            ExecutorKind::Callback => Arc::new(CallbackExecutor::new()),
            ExecutorKind::Queued => Arc::new(QueuedExecutor::start(
                config.executor.workers,
                config.executor.max_outstanding,
            )),
        };

        Ok(builder.executor(executor).build())
    }

    /// Check whether `ip` may send mail for `mail_from` (or `helo` when the
    /// reverse path is empty)
    ///
    /// Never fails: problems are reported through the outcome's result.
    pub async fn check(&self, ip: &str, mail_from: &str, helo: &str) -> SpfOutcome {
        match SpfSession::new(ip, mail_from, helo) {
            Ok(session) => self.check_session(session).await,
            Err(e) => {
                warn!("Cannot check SPF for {} from {}: {}", mail_from, ip, e);
                let domain = mail_from
                    .rsplit_once('@')
                    .map(|(_, domain)| domain)
                    .unwrap_or(helo);
                SpfOutcome::new(
                    e.result(),
                    &HeaderFields::new(ip, mail_from, helo, domain),
                    None,
                )
            }
        }
    }

    /// Check a prepared session, e.g. one carrying a receiving domain
    pub async fn check_session(&self, mut session: SpfSession) -> SpfOutcome {
        let fields = session.header_fields();
        debug!("Checking SPF for {} from {}", fields.domain, fields.ip);

        policy::begin(&mut session);
        let outcome = match self.executor.execute(session, self.ctx.clone()).await {
            Ok(session) => session.into_outcome(),
            Err(e) => {
                error!("SPF evaluation for {} failed: {}", fields.domain, e);
                SpfOutcome::new(SpfResult::TempError, &fields, None)
            }
        };

        info!(
            "SPF {} for {} from {}",
            outcome.result, fields.domain, fields.ip
        );
        outcome
    }
}

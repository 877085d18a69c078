//! spfkit Core - Sender Policy Framework evaluation engine
//!
//! This crate evaluates RFC 4408 SPF policies: it parses `v=spf1` records,
//! expands macro strings, and runs the policy chain and the record's
//! directives and modifiers as a stack of checker frames. Frames suspend on
//! DNS lookups instead of blocking, so the same evaluation runs under a
//! blocking, a callback-driven or a queued worker-pool executor.
//!
//! ```no_run
//! use spfkit_core::{ResolverDnsService, Spf};
//! use spfkit_common::config::DnsConfig;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let dns = ResolverDnsService::from_config(&DnsConfig::default())?;
//! let spf = Spf::builder(Arc::new(dns)).build();
//! let outcome = spf.check("192.0.2.1", "user@example.com", "mx.example.com").await;
//! println!("{}", outcome.header());
//! # Ok(())
//! # }
//! ```

pub mod checker;
pub mod dns;
pub mod error;
pub mod executor;
pub mod macros;
mod mechanisms;
mod modifiers;
pub mod policy;
pub mod record;
pub mod result;
pub mod session;
pub mod spf;

pub use checker::{CheckResult, Checker, DnsLookupContinuation, EvalContext};
pub use dns::{DnsError, DnsRequest, DnsResponse, DnsService, RecordType, ResolverDnsService, StaticDnsService};
pub use error::SpfError;
pub use executor::{BlockingExecutor, CallbackExecutor, QueuedExecutor, SpfExecutor};
pub use macros::{ExpandContext, Expansion, MacroData, MacroExpander};
pub use policy::{DomainTable, PolicyChain, Stage};
pub use record::{Directive, Mechanism, Modifier, PolicyRecord, Qualifier, RecordParser};
pub use result::{SpfOutcome, SpfResult, RECEIVED_SPF_HEADER};
pub use session::SpfSession;
pub use spf::{Spf, SpfBuilder};

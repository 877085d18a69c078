//! SPF record model
//!
//! A [`PolicyRecord`] is the parsed form of a `v=spf1` record: its directives
//! in source order, its modifiers, and any decorations appended by the policy
//! chain.

mod parser;
mod terms;

pub use parser::RecordParser;
pub use terms::{Mechanism, Modifier};

use crate::result::SpfResult;
use std::fmt;

/// SPF version token
pub const SPF_VERSION: &str = "v=spf1";

/// SPF qualifier (prefix)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qualifier {
    #[default]
    Pass, // + (default)
    Fail,     // -
    SoftFail, // ~
    Neutral,  // ?
}

impl Qualifier {
    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            '+' => Some(Qualifier::Pass),
            '-' => Some(Qualifier::Fail),
            '~' => Some(Qualifier::SoftFail),
            '?' => Some(Qualifier::Neutral),
            _ => None,
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Qualifier::Pass => '+',
            Qualifier::Fail => '-',
            Qualifier::SoftFail => '~',
            Qualifier::Neutral => '?',
        }
    }

    pub fn to_result(self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

/// Parsed SPF directive (qualifier + mechanism)
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

impl Directive {
    pub fn new(qualifier: Qualifier, mechanism: Mechanism) -> Self {
        Self {
            qualifier,
            mechanism,
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.qualifier != Qualifier::Pass {
            write!(f, "{}", self.qualifier.symbol())?;
        }
        write!(f, "{}", self.mechanism)
    }
}

/// Trailing check appended to a record by the policy chain
#[derive(Debug, Clone, PartialEq)]
pub enum Decoration {
    /// Commit `neutral` when no directive matched
    ForceNeutral,
    /// Expand the template as explanation on `fail` when none was set
    DefaultExplanation(String),
}

/// A parsed SPF record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyRecord {
    pub text: String,
    pub directives: Vec<Directive>,
    pub modifiers: Vec<Modifier>,
    pub decorations: Vec<Decoration>,
}

impl PolicyRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for PolicyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SPF_VERSION)?;
        for directive in &self.directives {
            write!(f, " {}", directive)?;
        }
        for modifier in &self.modifiers {
            write!(f, " {}", modifier)?;
        }
        Ok(())
    }
}

/// Whether `text` carries the SPF version token
pub fn is_spf_record(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    lowered == SPF_VERSION || lowered.starts_with("v=spf1 ")
}

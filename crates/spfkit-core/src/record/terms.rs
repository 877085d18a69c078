//! SPF terms and their grammar registry
//!
//! Every mechanism and modifier is registered with the grammar fragment that
//! recognises it, the number of capture groups inside that fragment, and the
//! constructor that turns those captures into a typed term.

use crate::error::SpfError;
use ipnet::{Ipv4Net, Ipv6Net};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// SPF mechanism types
#[derive(Debug, Clone, PartialEq)]
pub enum Mechanism {
    All,
    Include(String),
    A {
        domain: Option<String>,
        ip4_cidr: u8,
        ip6_cidr: u8,
    },
    Mx {
        domain: Option<String>,
        ip4_cidr: u8,
        ip6_cidr: u8,
    },
    Ip4(Ipv4Net),
    Ip6(Ipv6Net),
    Ptr(Option<String>),
    Exists(String),
}

impl Mechanism {
    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::All => "all",
            Mechanism::Include(_) => "include",
            Mechanism::A { .. } => "a",
            Mechanism::Mx { .. } => "mx",
            Mechanism::Ip4(_) => "ip4",
            Mechanism::Ip6(_) => "ip6",
            Mechanism::Ptr(_) => "ptr",
            Mechanism::Exists(_) => "exists",
        }
    }
}

fn write_dual_cidr(f: &mut fmt::Formatter<'_>, ip4_cidr: u8, ip6_cidr: u8) -> fmt::Result {
    if ip4_cidr != 32 {
        write!(f, "/{}", ip4_cidr)?;
    }
    if ip6_cidr != 128 {
        write!(f, "//{}", ip6_cidr)?;
    }
    Ok(())
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Mechanism::All => Ok(()),
            Mechanism::Include(domain) | Mechanism::Exists(domain) => write!(f, ":{}", domain),
            Mechanism::A {
                domain,
                ip4_cidr,
                ip6_cidr,
            }
            | Mechanism::Mx {
                domain,
                ip4_cidr,
                ip6_cidr,
            } => {
                if let Some(domain) = domain {
                    write!(f, ":{}", domain)?;
                }
                write_dual_cidr(f, *ip4_cidr, *ip6_cidr)
            }
            Mechanism::Ip4(net) => {
                write!(f, ":{}", net.addr())?;
                if net.prefix_len() != 32 {
                    write!(f, "/{}", net.prefix_len())?;
                }
                Ok(())
            }
            Mechanism::Ip6(net) => {
                write!(f, ":{}", net.addr())?;
                if net.prefix_len() != 128 {
                    write!(f, "/{}", net.prefix_len())?;
                }
                Ok(())
            }
            Mechanism::Ptr(domain) => match domain {
                Some(domain) => write!(f, ":{}", domain),
                None => Ok(()),
            },
        }
    }
}

/// SPF modifiers
#[derive(Debug, Clone, PartialEq)]
pub enum Modifier {
    Redirect(String),
    Explanation(String),
    /// Unrecognised modifier, kept but ignored
    Unknown { name: String, value: String },
}

impl Modifier {
    /// Modifiers that may appear at most once per record
    pub fn is_single_instance(&self) -> bool {
        !matches!(self, Modifier::Unknown { .. })
    }

    pub fn name(&self) -> &str {
        match self {
            Modifier::Redirect(_) => "redirect",
            Modifier::Explanation(_) => "exp",
            Modifier::Unknown { name, .. } => name,
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modifier::Redirect(domain) => write!(f, "redirect={}", domain),
            Modifier::Explanation(domain) => write!(f, "exp={}", domain),
            Modifier::Unknown { name, value } => write!(f, "{}={}", name, value),
        }
    }
}

// Grammar fragments (RFC 4408 section 4.6.1 and 8.1)

const MACRO_EXPAND: &str = r"%(?:\{[slodipvhcrtSLODIPVHCRT][0-9]*[rR]?[.\-+,/_=]*\}|%|_|-)";
const MACRO_LITERAL: &str = r"[\x21-\x24\x26-\x7E]";
const TOPLABEL: &str =
    r"(?:[0-9A-Za-z]*[A-Za-z][0-9A-Za-z]*|[0-9A-Za-z]+-[0-9A-Za-z\-]*[0-9A-Za-z])";
const IP4_CIDR: &str = r"(?:/([0-9]+))?";
const DUAL_CIDR: &str = r"(?:/([0-9]+))?(?://([0-9]+))?";

fn macro_string() -> String {
    format!("(?:{}|{})*", MACRO_EXPAND, MACRO_LITERAL)
}

fn domain_spec() -> String {
    format!(
        r"{}(?:\.{}\.?|{})",
        macro_string(),
        TOPLABEL,
        MACRO_EXPAND
    )
}

/// A registered term: grammar fragment, capture count and constructor
pub(super) struct TermSpec<T> {
    pub name: &'static str,
    pub pattern: fn() -> String,
    pub captures: usize,
    pub build: fn(&[Option<&str>]) -> Result<T, SpfError>,
}

/// Mechanisms in alternation order
pub(super) const MECHANISMS: &[TermSpec<Mechanism>] = &[
    TermSpec {
        name: "all",
        pattern: || "(?i:all)".to_string(),
        captures: 0,
        build: |_| Ok(Mechanism::All),
    },
    TermSpec {
        name: "include",
        pattern: || format!("(?i:include):({})", domain_spec()),
        captures: 1,
        build: |args| Ok(Mechanism::Include(required(args, 0)?)),
    },
    TermSpec {
        name: "a",
        pattern: || format!("(?i:a)(?::({}))?{}", domain_spec(), DUAL_CIDR),
        captures: 3,
        build: |args| {
            Ok(Mechanism::A {
                domain: args[0].map(str::to_string),
                ip4_cidr: cidr(args[1], 32)?,
                ip6_cidr: cidr(args[2], 128)?,
            })
        },
    },
    TermSpec {
        name: "mx",
        pattern: || format!("(?i:mx)(?::({}))?{}", domain_spec(), DUAL_CIDR),
        captures: 3,
        build: |args| {
            Ok(Mechanism::Mx {
                domain: args[0].map(str::to_string),
                ip4_cidr: cidr(args[1], 32)?,
                ip6_cidr: cidr(args[2], 128)?,
            })
        },
    },
    TermSpec {
        name: "ptr",
        pattern: || format!("(?i:ptr)(?::({}))?", domain_spec()),
        captures: 1,
        build: |args| Ok(Mechanism::Ptr(args[0].map(str::to_string))),
    },
    TermSpec {
        name: "ip4",
        pattern: || format!(r"(?i:ip4):([0-9]{{1,3}}(?:\.[0-9]{{1,3}}){{3}}){}", IP4_CIDR),
        captures: 2,
        build: |args| {
            let text = required(args, 0)?;
            let addr: Ipv4Addr = text
                .parse()
                .map_err(|_| SpfError::perm(format!("Invalid ip4 address: {}", text)))?;
            let net = Ipv4Net::new(addr, cidr(args[1], 32)?)
                .map_err(|e| SpfError::perm(format!("Invalid ip4 network {}: {}", text, e)))?;
            Ok(Mechanism::Ip4(net))
        },
    },
    TermSpec {
        name: "ip6",
        pattern: || format!("(?i:ip6):([0-9A-Fa-f:.]+){}", IP4_CIDR),
        captures: 2,
        build: |args| {
            let text = required(args, 0)?;
            let addr: Ipv6Addr = text
                .parse()
                .map_err(|_| SpfError::perm(format!("Invalid ip6 address: {}", text)))?;
            let net = Ipv6Net::new(addr, cidr(args[1], 128)?)
                .map_err(|e| SpfError::perm(format!("Invalid ip6 network {}: {}", text, e)))?;
            Ok(Mechanism::Ip6(net))
        },
    },
    TermSpec {
        name: "exists",
        pattern: || format!("(?i:exists):({})", domain_spec()),
        captures: 1,
        build: |args| Ok(Mechanism::Exists(required(args, 0)?)),
    },
];

/// Modifiers in alternation order; the catch-all unknown modifier comes last
pub(super) const MODIFIERS: &[TermSpec<Modifier>] = &[
    TermSpec {
        name: "redirect",
        pattern: || format!("(?i:redirect)=({})", domain_spec()),
        captures: 1,
        build: |args| Ok(Modifier::Redirect(required(args, 0)?)),
    },
    TermSpec {
        name: "exp",
        pattern: || format!("(?i:exp)=({})", domain_spec()),
        captures: 1,
        build: |args| Ok(Modifier::Explanation(required(args, 0)?)),
    },
    TermSpec {
        name: "unknown",
        pattern: || format!(r"([A-Za-z][A-Za-z0-9\-_.]*)=({})", macro_string()),
        captures: 2,
        build: |args| {
            let name = required(args, 0)?;
            if name.eq_ignore_ascii_case("redirect") || name.eq_ignore_ascii_case("exp") {
                return Err(SpfError::perm(format!("Invalid value for {} modifier", name)));
            }
            Ok(Modifier::Unknown {
                name,
                value: args[1].unwrap_or_default().to_string(),
            })
        },
    },
];

fn required(args: &[Option<&str>], index: usize) -> Result<String, SpfError> {
    args.get(index)
        .copied()
        .flatten()
        .map(str::to_string)
        .ok_or_else(|| SpfError::perm("Missing term argument"))
}

fn cidr(text: Option<&str>, max: u8) -> Result<u8, SpfError> {
    let Some(text) = text else {
        return Ok(max);
    };
    match text.parse::<u8>() {
        Ok(len) if len <= max => Ok(len),
        _ => Err(SpfError::perm(format!(
            "Invalid CIDR length /{} (maximum {})",
            text, max
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_declared_capture_counts() {
        for spec in MECHANISMS {
            let re = Regex::new(&(spec.pattern)()).unwrap();
            assert_eq!(re.captures_len() - 1, spec.captures, "{}", spec.name);
        }
        for spec in MODIFIERS {
            let re = Regex::new(&(spec.pattern)()).unwrap();
            assert_eq!(re.captures_len() - 1, spec.captures, "{}", spec.name);
        }
    }

    #[test]
    fn test_domain_spec_fragment() {
        let re = Regex::new(&format!("^{}$", domain_spec())).unwrap();
        assert!(re.is_match("example.com"));
        assert!(re.is_match("example.com."));
        assert!(re.is_match("%{d}"));
        assert!(re.is_match("%{ir}.%{v}._spf.%{d2}"));
        assert!(re.is_match("_spf.my-host.example"));
        assert!(!re.is_match("example.123"));
        assert!(!re.is_match("example.com%"));
        assert!(!re.is_match("%{x}.example.com"));
    }

    #[test]
    fn test_cidr_bounds() {
        assert_eq!(cidr(None, 32), Ok(32));
        assert_eq!(cidr(Some("0"), 32), Ok(0));
        assert!(cidr(Some("33"), 32).is_err());
        assert!(cidr(Some("999"), 128).is_err());
    }

    #[test]
    fn test_mechanism_display() {
        let a = Mechanism::A {
            domain: Some("example.com".into()),
            ip4_cidr: 24,
            ip6_cidr: 128,
        };
        assert_eq!(a.to_string(), "a:example.com/24");
        let mx = Mechanism::Mx {
            domain: None,
            ip4_cidr: 32,
            ip6_cidr: 64,
        };
        assert_eq!(mx.to_string(), "mx//64");
        let ip4 = Mechanism::Ip4("192.0.2.0/24".parse().unwrap());
        assert_eq!(ip4.to_string(), "ip4:192.0.2.0/24");
    }
}

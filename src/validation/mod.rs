//! Pre-acceptance checks.
//!
//! Every check is toggled on its own and reports [`Check::Disabled`] when it
//! is switched off or when the tooling it needs is missing, so callers can
//! tell "not checked" apart from "checked and failed".

pub mod dns;
pub mod external;
pub mod spam;

use crate::config::ValidationConfig;
use std::net::IpAddr;
use std::sync::Arc;

pub use dns::{DnsCheck, DnsError, DnsVerdict, MxHost, MxResolver, SystemResolver};
pub use external::{ExternalTool, PolicyCheck, SignatureCheck};
pub use spam::SpamCheck;

/// Outcome of a check that may be switched off.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Check<T> {
    Enabled(T),
    Disabled,
}

impl<T> Check<T> {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Check::Enabled(_))
    }

    /// Collapse to a plain value, using `default` when the check did not run.
    pub fn value_or(self, default: T) -> T {
        match self {
            Check::Enabled(value) => value,
            Check::Disabled => default,
        }
    }
}

/// Results of the content checks for one message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationResult {
    pub dkim: Check<bool>,
    pub spf: Check<bool>,
    pub spam_score: Check<f64>,
    pub dns: Check<bool>,
}

impl ValidationResult {
    pub fn dkim_valid(&self) -> bool {
        self.dkim.value_or(false)
    }

    pub fn spf_valid(&self) -> bool {
        self.spf.value_or(false)
    }

    pub fn spam_score(&self) -> f64 {
        self.spam_score.value_or(0.0)
    }

    pub fn dns_ok(&self) -> bool {
        self.dns.value_or(false)
    }
}

/// Which side of the envelope an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressRole {
    Sender,
    Recipient,
}

/// Connection facts the policy check needs alongside the body.
#[derive(Debug, Clone, Copy)]
pub struct MessageFacts<'a> {
    pub sender_ip: IpAddr,
    pub sender: &'a str,
    pub helo: &'a str,
    pub raw: &'a [u8],
    /// Envelope DNS outcome. `Disabled` unless some address was looked up.
    pub dns: Check<bool>,
}

pub struct Validator {
    dns: DnsCheck,
    check_sender: bool,
    check_recipients: bool,
    signature: SignatureCheck,
    policy: PolicyCheck,
    spam: SpamCheck,
}

impl Validator {
    /// Build the validator using the system DNS configuration.
    pub fn from_config(config: &ValidationConfig) -> anyhow::Result<Self> {
        let resolver: Option<Arc<dyn MxResolver>> = if config.dns.enabled {
            Some(Arc::new(SystemResolver::from_system_conf()?))
        } else {
            None
        };
        Ok(Self::build(config, resolver))
    }

    /// Build the validator around a caller-provided resolver.
    pub fn with_resolver(config: &ValidationConfig, resolver: Arc<dyn MxResolver>) -> Self {
        Self::build(config, Some(resolver))
    }

    fn build(config: &ValidationConfig, resolver: Option<Arc<dyn MxResolver>>) -> Self {
        let dns = match resolver {
            Some(resolver) if config.dns.enabled => DnsCheck::new(resolver, &config.dns),
            _ => DnsCheck::disabled(),
        };

        Self {
            dns,
            check_sender: config.dns.check_sender,
            check_recipients: config.dns.check_recipients,
            signature: SignatureCheck::from_config(&config.dkim),
            policy: PolicyCheck::from_config(&config.spf),
            spam: SpamCheck::from_config(&config.spam),
        }
    }

    pub fn dns_enabled(&self) -> bool {
        self.dns.is_enabled()
    }

    /// DNS reachability of an envelope address.
    pub async fn check_address(&self, address: &str, role: AddressRole) -> DnsVerdict {
        let wanted = match role {
            AddressRole::Sender => self.check_sender,
            AddressRole::Recipient => self.check_recipients,
        };
        if !wanted {
            return DnsVerdict::Disabled;
        }
        self.dns.check(address).await
    }

    /// Run the signature, policy and spam checks concurrently.
    pub async fn inspect(&self, facts: &MessageFacts<'_>) -> ValidationResult {
        let (dkim, spf, spam_score) = tokio::join!(
            self.signature.verify(facts.raw),
            self.policy.verify(facts.sender_ip, facts.sender, facts.helo),
            self.spam.score(facts.raw),
        );

        ValidationResult {
            dkim,
            spf,
            spam_score,
            dns: facts.dns,
        }
    }

    /// Whether the spam score reached the configured rejection threshold.
    pub fn rejects_as_spam(&self, result: &ValidationResult) -> bool {
        self.spam.exceeds_threshold(result.spam_score)
    }
}

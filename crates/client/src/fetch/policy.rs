//! Domain allow/block policy.
//!
//! A listed domain matches itself and every subdomain. The blocklist always
//! wins; a non-empty allowlist admits only what it lists; with an empty
//! allowlist the configured default decides.

use csx_core::config::DefaultPolicy;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    #[error("{host} is blocked by rule {rule}")]
    Blocked { host: String, rule: String },

    #[error("{0} is not in the allowed domains")]
    NotAllowed(String),

    #[error("{0} is denied by the default domain policy")]
    DeniedByDefault(String),
}

#[derive(Debug, Clone)]
pub struct DomainPolicy {
    allowed: Vec<String>,
    blocked: Vec<String>,
    default: DefaultPolicy,
}

impl DomainPolicy {
    pub fn new(allowed: &[String], blocked: &[String], default: DefaultPolicy) -> Self {
        Self { allowed: normalize_all(allowed), blocked: normalize_all(blocked), default }
    }

    /// Permit everything not explicitly blocked.
    pub fn allow_all() -> Self {
        Self::new(&[], &[], DefaultPolicy::Allow)
    }

    pub fn check(&self, host: &str) -> Result<(), PolicyError> {
        let host = normalize(host);

        if let Some(rule) = self.blocked.iter().find(|d| matches_domain(&host, d)) {
            return Err(PolicyError::Blocked { host, rule: rule.clone() });
        }

        if !self.allowed.is_empty() {
            return if self.allowed.iter().any(|d| matches_domain(&host, d)) {
                Ok(())
            } else {
                Err(PolicyError::NotAllowed(host))
            };
        }

        match self.default {
            DefaultPolicy::Allow => Ok(()),
            DefaultPolicy::Deny => Err(PolicyError::DeniedByDefault(host)),
        }
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_start_matches("*.").trim_matches('.').to_lowercase()
}

fn normalize_all(domains: &[String]) -> Vec<String> {
    domains.iter().map(|d| normalize(d)).filter(|d| !d.is_empty()).collect()
}

fn matches_domain(host: &str, domain: &str) -> bool {
    host == domain || host.strip_suffix(domain).is_some_and(|prefix| prefix.ends_with('.'))
}

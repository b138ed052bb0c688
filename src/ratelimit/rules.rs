//! Rate limit rules and descriptor matching.
//!
//! Rules hang off a per-domain descriptor tree. Each node matches one
//! descriptor entry by key and, optionally, by value; deeper matches take
//! precedence over shallower ones.

use std::collections::HashMap;

use super::descriptor::{Descriptor, Entry};
use super::window::TimeUnit;

/// A configured quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Optional name/description for this limit
    pub name: Option<String>,
    /// Number of requests allowed per unit of time
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// Count and log, but never reject
    pub shadow_mode: bool,
    /// Never counted, always allowed
    pub unlimited: bool,
}

impl RateLimitRule {
    pub fn new(requests_per_unit: u64, unit: TimeUnit) -> Self {
        Self {
            name: None,
            requests_per_unit,
            unit,
            shadow_mode: false,
            unlimited: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn shadow(mut self) -> Self {
        self.shadow_mode = true;
        self
    }

    pub fn unlimited(mut self) -> Self {
        self.unlimited = true;
        self
    }
}

/// The rule a descriptor resolved to, with the path that matched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedLimit {
    pub domain: String,
    /// Descriptor keys from the tree root down to the matching node
    pub key_path: Vec<String>,
    pub rule: RateLimitRule,
}

impl MatchedLimit {
    pub fn new(domain: impl Into<String>, key_path: &[&str], rule: RateLimitRule) -> Self {
        Self {
            domain: domain.into(),
            key_path: key_path.iter().map(|k| k.to_string()).collect(),
            rule,
        }
    }

    /// `domain.key1.key2`, used in logs.
    pub fn full_key(&self) -> String {
        let mut key = self.domain.clone();
        for part in &self.key_path {
            key.push('.');
            key.push_str(part);
        }
        key
    }
}

/// Maps request descriptors to configured rules.
pub trait RuleResolver: Send + Sync {
    fn resolve(&self, domain: &str, descriptor: &Descriptor) -> Option<MatchedLimit>;

    /// Resolve every descriptor of a request, keeping positions aligned.
    fn resolve_all(&self, domain: &str, descriptors: &[Descriptor]) -> Vec<Option<MatchedLimit>> {
        descriptors
            .iter()
            .map(|descriptor| self.resolve(domain, descriptor))
            .collect()
    }

    /// Whether the whole domain is exempt from counting.
    fn is_unlimited(&self, _domain: &str) -> bool {
        false
    }
}

/// Rules for all domains.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfig {
    /// Map of domain name to domain configuration
    pub domains: HashMap<String, DomainConfig>,
}

/// Rules for a single domain.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// The domain name
    pub domain: String,
    /// Top-level descriptors for this domain
    pub descriptors: Vec<DescriptorConfig>,
    /// Every descriptor in this domain is allowed without counting
    pub unlimited: bool,
}

/// One node of the descriptor tree.
#[derive(Debug, Clone)]
pub struct DescriptorConfig {
    /// The key to match
    pub key: String,
    /// Value to match; `None` matches any value for this key
    pub value: Option<String>,
    /// Rate limit to apply at this level
    pub rate_limit: Option<RateLimitRule>,
    /// Child descriptors for more specific matching
    pub descriptors: Vec<DescriptorConfig>,
}

impl DescriptorConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            rate_limit: None,
            descriptors: Vec::new(),
        }
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn limit(mut self, rule: RateLimitRule) -> Self {
        self.rate_limit = Some(rule);
        self
    }

    pub fn child(mut self, child: DescriptorConfig) -> Self {
        self.descriptors.push(child);
        self
    }
}

impl RateLimitConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a domain.
    pub fn with_domain(mut self, domain: impl Into<String>, descriptors: Vec<DescriptorConfig>) -> Self {
        let domain = domain.into();
        self.domains.insert(
            domain.clone(),
            DomainConfig {
                domain,
                descriptors,
                unlimited: false,
            },
        );
        self
    }

    /// Mark a configured domain as unlimited.
    pub fn with_unlimited_domain(mut self, domain: &str) -> Self {
        if let Some(config) = self.domains.get_mut(domain) {
            config.unlimited = true;
        }
        self
    }

    /// Get the configuration for a specific domain.
    pub fn get_domain(&self, domain: &str) -> Option<&DomainConfig> {
        self.domains.get(domain)
    }

    /// Find the matching rule for a descriptor within a domain.
    pub fn find_limit(&self, domain: &str, descriptor: &Descriptor) -> Option<&RateLimitRule> {
        self.get_domain(domain)?
            .find_limit(descriptor)
            .map(|(rule, _)| rule)
    }
}

impl RuleResolver for RateLimitConfig {
    fn resolve(&self, domain: &str, descriptor: &Descriptor) -> Option<MatchedLimit> {
        let (rule, depth) = self.get_domain(domain)?.find_limit(descriptor)?;
        Some(MatchedLimit {
            domain: domain.to_string(),
            key_path: descriptor
                .keys()
                .take(depth + 1)
                .map(str::to_string)
                .collect(),
            rule: rule.clone(),
        })
    }

    fn is_unlimited(&self, domain: &str) -> bool {
        self.get_domain(domain).is_some_and(|d| d.unlimited)
    }
}

impl DomainConfig {
    /// Find the matching rule for a descriptor, with the index of the
    /// deepest entry that took part in the match.
    pub fn find_limit(&self, descriptor: &Descriptor) -> Option<(&RateLimitRule, usize)> {
        Self::find_limit_in_descriptors(&self.descriptors, &descriptor.entries, 0)
    }

    fn find_limit_in_descriptors<'a>(
        configs: &'a [DescriptorConfig],
        entries: &[Entry],
        entry_index: usize,
    ) -> Option<(&'a RateLimitRule, usize)> {
        let entry = entries.get(entry_index)?;
        let mut best_match = None;

        for config in configs {
            if config.key != entry.key {
                continue;
            }

            let value_matches = match &config.value {
                Some(v) => v == &entry.value,
                None => true,
            };
            if !value_matches {
                continue;
            }

            // A more specific match in the children wins
            if entry_index + 1 < entries.len() && !config.descriptors.is_empty() {
                if let Some(found) =
                    Self::find_limit_in_descriptors(&config.descriptors, entries, entry_index + 1)
                {
                    return Some(found);
                }
            }

            // Exact value matches beat wildcards at the same level
            if let Some(ref limit) = config.rate_limit {
                match best_match {
                    None => best_match = Some((limit, entry_index, config.value.is_some())),
                    Some((_, _, false)) if config.value.is_some() => {
                        best_match = Some((limit, entry_index, true))
                    }
                    _ => {}
                }
            }
        }

        best_match.map(|(limit, depth, _)| (limit, depth))
    }
}

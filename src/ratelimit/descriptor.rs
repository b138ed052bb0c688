//! Descriptors, requests and descriptor key generation.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// One key/value pair of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An ordered list of entries identifying the thing being limited,
/// e.g. `[service=checkout, client_id=42]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub entries: Vec<Entry>,
}

impl Descriptor {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            entries: entries.iter().map(|(k, v)| Entry::new(*k, *v)).collect(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }
}

/// A rate limit request as handed over by the transport layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitRequest {
    pub domain: String,
    pub descriptors: Vec<Descriptor>,
    /// Units to add to each counter; 0 means 1.
    #[serde(default)]
    pub hits_addend: u32,
}

impl RateLimitRequest {
    pub fn new(domain: impl Into<String>, descriptors: Vec<Descriptor>) -> Self {
        Self {
            domain: domain.into(),
            descriptors,
            hits_addend: 0,
        }
    }

    pub fn hits(&self) -> u64 {
        u64::from(self.hits_addend.max(1))
    }
}

/// Source identity of the request, consulted by the override filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub source_ip: Option<IpAddr>,
    pub source_uid: Option<String>,
}

impl RequestContext {
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.source_uid = Some(uid.into());
        self
    }
}

/// A key that uniquely identifies a descriptor within a domain.
///
/// Renders as `domain_key1_value1_key2_value2_`; the window start is appended
/// separately to form the counter key. `_` and `\` inside a part are
/// backslash-escaped so distinct entries never render to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    /// The domain this descriptor belongs to
    pub domain: String,
    /// Key-value pairs from the descriptor, in request order
    pub entries: Vec<(String, String)>,
}

impl DescriptorKey {
    /// Create a new descriptor key from a domain and descriptor.
    pub fn new(domain: &str, descriptor: &Descriptor) -> Self {
        Self::from_entries(domain, &descriptor.entries)
    }

    /// Create a key over a prefix (or all) of a descriptor's entries.
    pub fn from_entries(domain: &str, entries: &[Entry]) -> Self {
        Self {
            domain: domain.to_string(),
            entries: entries
                .iter()
                .map(|e| (e.key.clone(), e.value.clone()))
                .collect(),
        }
    }

    /// Convert the descriptor key to its string form.
    pub fn to_string_key(&self) -> String {
        let mut key = String::with_capacity(
            self.domain.len()
                + self
                    .entries
                    .iter()
                    .map(|(k, v)| k.len() + v.len() + 2)
                    .sum::<usize>(),
        );
        push_escaped(&mut key, &self.domain);
        key.push('_');
        for (k, v) in &self.entries {
            push_escaped(&mut key, k);
            key.push('_');
            push_escaped(&mut key, v);
            key.push('_');
        }
        key
    }
}

fn push_escaped(out: &mut String, part: &str) {
    for c in part.chars() {
        if c == '_' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

impl std::fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_key_creation() {
        let descriptor = Descriptor::new(&[("source", "client_a"), ("destination", "service_b")]);

        let key = DescriptorKey::new("test_domain", &descriptor);

        assert_eq!(key.domain, "test_domain");
        assert_eq!(key.entries.len(), 2);
        assert_eq!(key.entries[0], ("source".to_string(), "client_a".to_string()));
        assert_eq!(key.entries[1], ("destination".to_string(), "service_b".to_string()));
    }

    #[test]
    fn test_descriptor_key_to_string() {
        let descriptor = Descriptor::new(&[("key1", "value1"), ("key2", "value2")]);
        let key = DescriptorKey::new("domain", &descriptor);
        assert_eq!(key.to_string_key(), "domain_key1_value1_key2_value2_");
    }

    #[test]
    fn test_separator_in_parts_is_escaped() {
        let a = DescriptorKey::new("d", &Descriptor::new(&[("a_b", "c")]));
        let b = DescriptorKey::new("d", &Descriptor::new(&[("a", "b_c")]));

        assert_eq!(a.to_string_key(), "d_a\\_b_c_");
        assert_eq!(b.to_string_key(), "d_a_b\\_c_");
        assert_ne!(a.to_string_key(), b.to_string_key());

        let slash = DescriptorKey::new("d", &Descriptor::new(&[("k", "v\\")]));
        assert_eq!(slash.to_string_key(), "d_k_v\\\\_");
    }

    #[test]
    fn test_key_over_entry_prefix() {
        let descriptor = Descriptor::new(&[("service", "checkout"), ("client", "42")]);
        let key = DescriptorKey::from_entries("d", &descriptor.entries[..1]);
        assert_eq!(key.to_string_key(), "d_service_checkout_");
    }

    #[test]
    fn test_entry_order_is_significant() {
        let a = DescriptorKey::new("d", &Descriptor::new(&[("a", "1"), ("b", "2")]));
        let b = DescriptorKey::new("d", &Descriptor::new(&[("b", "2"), ("a", "1")]));
        assert_ne!(a.to_string_key(), b.to_string_key());
    }

    #[test]
    fn test_hits_defaults_to_one() {
        let mut request = RateLimitRequest::new("domain", vec![]);
        assert_eq!(request.hits(), 1);
        request.hits_addend = 5;
        assert_eq!(request.hits(), 5);
    }
}

//! Exact-match UID override filter.

use std::collections::HashSet;

use super::FilterVerdict;

/// Allow-list / deny-list of user identifiers.
#[derive(Debug, Clone, Default)]
pub struct UidFilter {
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl UidFilter {
    pub fn new(allow: HashSet<String>, deny: HashSet<String>) -> Self {
        Self { allow, deny }
    }

    pub fn verdict(&self, uid: &str) -> FilterVerdict {
        if self.deny.contains(uid) {
            FilterVerdict::Deny
        } else if self.allow.contains(uid) {
            FilterVerdict::Allow
        } else {
            FilterVerdict::Abstain
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_uid_list;

    #[test]
    fn test_uid_verdicts() {
        let filter = UidFilter::new(parse_uid_list("alice,bob"), parse_uid_list("bob,mallory"));

        assert_eq!(filter.verdict("alice"), FilterVerdict::Allow);
        assert_eq!(filter.verdict("bob"), FilterVerdict::Deny);
        assert_eq!(filter.verdict("mallory"), FilterVerdict::Deny);
        assert_eq!(filter.verdict("carol"), FilterVerdict::Abstain);
    }

    #[test]
    fn test_match_is_exact() {
        let filter = UidFilter::new(parse_uid_list("42"), HashSet::new());
        assert_eq!(filter.verdict("420"), FilterVerdict::Abstain);
        assert_eq!(filter.verdict(" 42"), FilterVerdict::Abstain);
    }
}

//! CIDR based override filter.

use std::net::IpAddr;

use ipnet::IpNet;

use super::FilterVerdict;

/// Allow-list / deny-list of CIDR ranges.
#[derive(Debug, Clone, Default)]
pub struct IpFilter {
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
}

impl IpFilter {
    pub fn new(allow: Vec<IpNet>, deny: Vec<IpNet>) -> Self {
        Self { allow, deny }
    }

    pub fn verdict(&self, ip: IpAddr) -> FilterVerdict {
        if contains(&self.deny, ip) {
            FilterVerdict::Deny
        } else if contains(&self.allow, ip) {
            FilterVerdict::Allow
        } else {
            FilterVerdict::Abstain
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

fn contains(nets: &[IpNet], ip: IpAddr) -> bool {
    nets.iter().any(|net| net.contains(&ip))
}

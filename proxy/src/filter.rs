//! Client IP and player-name filtering.
//!
//! Both filters follow the same shape: an empty allow list admits
//! everyone, the deny list is consulted second and always wins.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use hoppergate_common::config::FilterSettings;

/// CIDR-based client IP filter. Bare addresses parse as /32 (or /128).
pub struct IpFilter {
    allow: Vec<IpNetwork>,
    deny: Vec<IpNetwork>,
}

impl IpFilter {
    pub fn from_settings(settings: &FilterSettings) -> anyhow::Result<Self> {
        Ok(Self {
            allow: parse_networks(&settings.ip_allow)?,
            deny: parse_networks(&settings.ip_deny)?,
        })
    }

    pub fn permits(&self, ip: IpAddr) -> bool {
        if !self.allow.is_empty() && !self.allow.iter().any(|net| net.contains(ip)) {
            return false;
        }
        !self.deny.iter().any(|net| net.contains(ip))
    }
}

fn parse_networks(entries: &[String]) -> anyhow::Result<Vec<IpNetwork>> {
    entries
        .iter()
        .map(|raw| {
            raw.parse::<IpNetwork>()
                .map_err(|e| anyhow::anyhow!("invalid network {raw:?}: {e}"))
        })
        .collect()
}

/// Case-insensitive player-name filter, applied only to login/transfer
/// connections after LoginStart is sniffed.
pub struct PlayerFilter {
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl PlayerFilter {
    pub fn from_settings(settings: &FilterSettings) -> Self {
        Self {
            allow: lowered(&settings.player_allow),
            deny: lowered(&settings.player_deny),
        }
    }

    /// Whether any list is configured at all.
    pub fn is_active(&self) -> bool {
        !self.allow.is_empty() || !self.deny.is_empty()
    }

    pub fn permits(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        if !self.allow.is_empty() && !self.allow.contains(&name) {
            return false;
        }
        !self.deny.contains(&name)
    }
}

fn lowered(entries: &[String]) -> HashSet<String> {
    entries.iter().map(|s| s.to_ascii_lowercase()).collect()
}

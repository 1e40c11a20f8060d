//! Connection authorization
//!
//! Three independent checks feed one decision: bearer-token membership,
//! peer-address allowlisting (exact or CIDR), and Tailscale node identity
//! looked up through the local API. The combination rule:
//!
//! - token required (explicitly, or because tokens are configured and both
//!   allowlists are empty): `token_ok && ip_ok`;
//! - otherwise any one of token, listed peer address, or listed node
//!   identity is sufficient.
//!
//! The wire error for a denial is always the opaque "authentication
//! failed"; which check failed is only logged locally.

use broker_core::config::AuthConfig;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use subtle::ConstantTimeEq;

/// Tailscale local API base. The well-known quad-100 address answers on
/// every tailnet member.
const TAILSCALE_LOCALAPI: &str = "http://100.100.100.100";

const WHOIS_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Authorizer {
    policy: AuthConfig,
    whois_base: String,
    http: reqwest::Client,
}

impl Authorizer {
    pub fn new(policy: AuthConfig) -> Self {
        Self::with_whois_base(policy, TAILSCALE_LOCALAPI)
    }

    /// Same as [`Authorizer::new`] with the identity-service base URL
    /// overridden; tests point this at a local stub.
    pub fn with_whois_base(policy: AuthConfig, whois_base: impl Into<String>) -> Self {
        Self {
            policy,
            whois_base: whois_base.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Decide whether a request presenting `token` from `remote_addr`
    /// (a `host:port` string) may execute tools.
    pub async fn authorize(&self, token: &str, remote_addr: &str) -> bool {
        let client_ip = extract_ip(remote_addr);

        let token_ok = !token.is_empty()
            && self
                .policy
                .tokens
                .iter()
                .any(|candidate| bool::from(candidate.as_bytes().ct_eq(token.as_bytes())));

        let ip_ok = self.policy.allowed_ips.is_empty()
            || self
                .policy
                .allowed_ips
                .iter()
                .any(|allowed| matches_ip(&client_ip, allowed));

        let node_ok = if self.policy.tailscale_nodes.is_empty() {
            false
        } else {
            match self.whois_node_id(&client_ip).await {
                Some(node_id) => self.policy.tailscale_nodes.iter().any(|n| *n == node_id),
                None => false,
            }
        };

        let token_required = self.policy.require_token
            || (!self.policy.tokens.is_empty()
                && self.policy.allowed_ips.is_empty()
                && self.policy.tailscale_nodes.is_empty());

        let granted = if token_required {
            token_ok && ip_ok
        } else {
            token_ok || (ip_ok && !self.policy.allowed_ips.is_empty()) || node_ok
        };

        if !granted {
            tracing::debug!(
                peer = remote_addr,
                token_ok,
                ip_ok,
                node_ok,
                "authorization denied"
            );
        }
        granted
    }

    /// Resolve the peer's Tailscale node ID. Any failure (no daemon, bad
    /// status, unparseable body) means "no node identity", never a hard
    /// error.
    async fn whois_node_id(&self, client_ip: &str) -> Option<String> {
        let url = format!(
            "{}/localapi/v0/whois?addr={}:1",
            self.whois_base, client_ip
        );
        let response = self
            .http
            .get(&url)
            .timeout(WHOIS_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let whois: WhoisResponse = response.json().await.ok()?;
        let id = whois.node?.id?;
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }
}

#[derive(Deserialize)]
struct WhoisResponse {
    #[serde(rename = "Node")]
    node: Option<WhoisNode>,
}

#[derive(Deserialize)]
struct WhoisNode {
    #[serde(alias = "ID")]
    id: Option<String>,
}

/// Host portion of a `host:port` string, brackets stripped. Inputs that do
/// not look like host:port come back unchanged.
pub fn extract_ip(remote_addr: &str) -> String {
    if let Some(rest) = remote_addr.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host.to_string();
        }
    }
    match remote_addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            host.to_string()
        }
        _ => remote_addr.to_string(),
    }
}

/// Exact-equality or CIDR containment. IPv4-mapped IPv6 addresses are
/// compared in their native IPv4 form.
pub fn matches_ip(client_ip: &str, allowed: &str) -> bool {
    if client_ip == allowed {
        return true;
    }

    let Some((network, prefix)) = allowed.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u32>() else {
        return false;
    };
    let Ok(network) = network.parse::<IpAddr>() else {
        return false;
    };
    let Ok(client) = client_ip.parse::<IpAddr>() else {
        return false;
    };

    match (canonical(client), canonical(network)) {
        (IpAddr::V4(client), IpAddr::V4(network)) => {
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix)
            };
            (u32::from(client) & mask) == (u32::from(network) & mask)
        }
        (IpAddr::V6(client), IpAddr::V6(network)) => {
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix)
            };
            (u128::from(client) & mask) == (u128::from(network) & mask)
        }
        _ => false,
    }
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

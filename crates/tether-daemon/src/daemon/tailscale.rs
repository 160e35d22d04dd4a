//! `list_tailscale` passthrough — shell out to the VPN CLI and reduce
//! its status JSON to `{hostname, ip}` tuples.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TailscaleHost {
    pub hostname: String,
    pub ip: String,
}

pub async fn list() -> Result<Vec<TailscaleHost>, String> {
    let output = tokio::process::Command::new("tailscale")
        .args(["status", "--json"])
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => "tailscale CLI not found".to_owned(),
            _ => e.to_string(),
        })?;
    if !output.status.success() {
        return Err(format!("tailscale exited with {}", output.status));
    }
    let status: Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| format!("unreadable tailscale status: {e}"))?;
    Ok(parse_status(&status))
}

/// Pull `{hostname, ip}` out of `tailscale status --json`: the Self
/// entry plus every Peer entry that has an address.
pub fn parse_status(status: &Value) -> Vec<TailscaleHost> {
    let mut hosts = Vec::new();
    if let Some(node) = status.get("Self") {
        if let Some(host) = host_of(node) {
            hosts.push(host);
        }
    }
    if let Some(peers) = status.get("Peer").and_then(|p| p.as_object()) {
        for node in peers.values() {
            if let Some(host) = host_of(node) {
                hosts.push(host);
            }
        }
    }
    hosts.sort_by(|a, b| a.hostname.cmp(&b.hostname));
    hosts
}

fn host_of(node: &Value) -> Option<TailscaleHost> {
    let hostname = node.get("HostName")?.as_str()?.to_owned();
    let ip = node
        .get("TailscaleIPs")?
        .as_array()?
        .first()?
        .as_str()?
        .to_owned();
    Some(TailscaleHost { hostname, ip })
}

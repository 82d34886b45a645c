// ── Host tool probes ──

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::HostProbe;
use crate::error::CoreError;

const ZONE_QUERY: &str = "db.getSiblingDB(\"ace\").firewall_zone.find({default_zone:false})\
.sort({_id:1}).forEach(function(z){print(z.external_id.toString())})";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes backed by `iptables`, `ipset`, and the Network application's
/// local `mongo` shell.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    mongo_port: u16,
}

impl CommandProbe {
    pub fn new(mongo_port: u16) -> Self {
        Self { mongo_port }
    }
}

async fn run(program: &str, args: &[&str]) -> Option<Output> {
    let fut = Command::new(program).args(args).kill_on_drop(true).output();
    match tokio::time::timeout(PROBE_TIMEOUT, fut).await {
        Ok(Ok(out)) => Some(out),
        Ok(Err(e)) => {
            debug!(program, error = %e, "probe failed to start");
            None
        }
        Err(_) => {
            debug!(program, "probe timed out");
            None
        }
    }
}

async fn stdout_on_success(program: &str, args: &[&str]) -> Option<String> {
    let out = run(program, args).await?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Parse `print(z.external_id.toString())` lines, unwrapping `UUID("…")`.
pub(crate) fn parse_zone_ids(stdout: &str) -> Vec<String> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Vec::new();
    }
    // Positions are significant: a blank line still occupies an index.
    stdout
        .lines()
        .map(str::trim)
        .map(|l| {
            l.strip_prefix("UUID(\"")
                .and_then(|rest| rest.strip_suffix("\")"))
                .unwrap_or(l)
                .to_owned()
        })
        .collect()
}

#[async_trait]
impl HostProbe for CommandProbe {
    async fn chain_rules(&self, chain: &str) -> Option<String> {
        stdout_on_success("iptables", &["-w", "2", "-S", chain]).await
    }

    async fn ipset_list(&self, set: &str) -> Option<String> {
        stdout_on_success("ipset", &["list", set]).await
    }

    async fn custom_zone_ids(&self) -> Result<Vec<String>, CoreError> {
        let port = self.mongo_port.to_string();
        let out = run("mongo", &["--port", &port, "--quiet", "--eval", ZONE_QUERY])
            .await
            .ok_or_else(|| CoreError::Unreachable {
                target: format!("mongo on port {port}"),
                reason: "query did not complete".into(),
            })?;
        if !out.status.success() {
            return Err(CoreError::Unreachable {
                target: format!("mongo on port {port}"),
                reason: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
            });
        }
        Ok(parse_zone_ids(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn udp_port_free(&self, port: u16) -> Result<(), std::io::Error> {
        tokio::net::UdpSocket::bind(("0.0.0.0", port)).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_ids_unwrap_uuid_wrapper() {
        let out = "UUID(\"aa-1\")\n\n  bb-2 \nUUID(\"cc-3\")\n";
        assert_eq!(parse_zone_ids(out), vec!["aa-1", "", "bb-2", "cc-3"]);
    }

    #[test]
    fn zone_ids_empty_output() {
        assert!(parse_zone_ids("  \n").is_empty());
    }
}

//! Integration state and tunnel status.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tabled::Tabled;

use vpnpack_config::Config;
use vpnpack_core::{IntegrationStatus, TunnelView};

use crate::cli::{GlobalOpts, OutputFormat};
use crate::commands::open_pack;
use crate::error::CliError;
use crate::output;

#[derive(Tabled)]
struct TunnelRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Interface")]
    interface: String,
    #[tabled(rename = "Port")]
    port: u16,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Handshake")]
    handshake: String,
    #[tabled(rename = "Rx / Tx")]
    transfer: String,
    #[tabled(rename = "Zone")]
    zone: String,
}

#[derive(Serialize)]
struct StatusOut<'a> {
    integration: &'a IntegrationStatus,
    tunnels: &'a [TunnelView],
}

fn handshake_age(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = at else {
        return "never".into();
    };
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3600 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}

fn bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = n;
    let mut unit = 0;
    while value >= 1024 && unit < UNITS.len() - 1 {
        value /= 1024;
        unit += 1;
    }
    format!("{value} {}", UNITS[unit])
}

fn state(view: &TunnelView, color: bool) -> String {
    if !view.config.enabled {
        return output::dim("disabled", color);
    }
    let Some(status) = &view.status else {
        return output::flag(false, "down", color);
    };
    let mut text = if status.connected {
        output::flag(true, "connected", color)
    } else {
        output::flag(false, "waiting", color)
    };
    if status.forward_in_ok == Some(false) {
        text.push_str(&output::flag(false, " (no rule)", color));
    }
    text
}

fn to_row(view: &TunnelView, color: bool, now: DateTime<Utc>) -> TunnelRow {
    let status = view.status.as_ref();
    TunnelRow {
        id: view.config.id.clone(),
        name: view.config.name.clone(),
        interface: view.config.interface_name.clone(),
        port: view.config.listen_port,
        state: state(view, color),
        handshake: status.map_or_else(|| "-".into(), |s| handshake_age(s.last_handshake, now)),
        transfer: status.map_or_else(
            || "-".into(),
            |s| format!("{} / {}", bytes(s.transfer_rx), bytes(s.transfer_tx)),
        ),
        zone: view
            .zone_name
            .clone()
            .or_else(|| view.zone_id.clone())
            .unwrap_or_else(|| "-".into()),
    }
}

fn integration_summary(status: &IntegrationStatus, color: bool) -> String {
    let mut out = String::new();
    let state = match (status.configured, status.valid) {
        (false, _) => output::dim("not configured", color),
        (true, true) => output::flag(true, "connected", color),
        (true, false) => output::flag(false, "unreachable", color),
    };
    let _ = writeln!(out, "Integration: {state}");
    if status.degraded {
        let _ = writeln!(
            out,
            "             {}",
            output::flag(false, "degraded (API key rejected)", color)
        );
    }
    if let Some(site) = &status.site_id {
        let _ = writeln!(out, "Site:        {site}");
    }
    if let Some(version) = &status.app_version {
        let _ = writeln!(out, "Network:     {version}");
    }
    if let Some(err) = &status.error {
        let _ = writeln!(out, "Error:       {err}");
    }
    out
}

pub async fn handle(cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let pack = open_pack(cfg)?;
    let integration = pack.integration_status().await;
    let tunnels = pack.list_tunnels().await;

    let rendered = match global.output {
        OutputFormat::Table => {
            let color = output::should_color(global.color);
            let now = Utc::now();
            let mut text = integration_summary(&integration, color);
            if tunnels.is_empty() {
                text.push_str("\nNo tunnels configured");
            } else {
                text.push('\n');
                text.push_str(&output::render_list(
                    OutputFormat::Table,
                    &tunnels,
                    |t| to_row(t, color, now),
                    |t| t.config.id.clone(),
                )?);
            }
            text
        }
        OutputFormat::Plain => tunnels
            .iter()
            .map(|t| t.config.id.clone())
            .collect::<Vec<_>>()
            .join("\n"),
        format => output::render_single(
            format,
            &StatusOut {
                integration: &integration,
                tunnels: &tunnels,
            },
            |_| String::new(),
            |_| String::new(),
        )?,
    };
    output::print_output(&rendered, global.quiet);
    Ok(())
}

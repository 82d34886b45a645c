//! Clap derive structures for the `vpnpack` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// vpnpack -- WireGuard site-to-site tunnels and firewall upkeep for UniFi gateways
#[derive(Debug, Parser)]
#[command(
    name = "vpnpack",
    version,
    about = "Run and inspect the VPN Pack gateway daemon",
    long_about = "Manages WireGuard site-to-site tunnels on a UniFi gateway and keeps\n\
        their firewall rules, zones, and WAN port policies in place across\n\
        firewall regenerations.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Path to the TOML config file
    #[arg(
        long,
        env = "VPNPACK_CONFIG",
        default_value = vpnpack_config::DEFAULT_CONFIG_PATH,
        global = true
    )]
    pub config: PathBuf,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "VPNPACK_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Skip confirmation prompts
    #[arg(long, short = 'y', global = true)]
    pub yes: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    #[command(flatten)]
    Daemon(DaemonCommand),

    /// Inspect or initialize the config file
    #[command(alias = "cfg")]
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Commands that run against a loaded config.
#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground until SIGINT or SIGTERM
    Run,

    /// Remove every rule, interface, zone, and policy the daemon created
    Cleanup,

    /// Show integration state and tunnel status
    #[command(alias = "st")]
    Status,

    /// Generate a WireGuard keypair
    Keygen,

    /// Print the config the remote side of a tunnel should use
    PeerConfig(PeerConfigArgs),
}

#[derive(Debug, Args)]
pub struct PeerConfigArgs {
    /// Tunnel ID
    pub id: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Print the effective configuration (defaults, file, and environment)
    Show,

    /// Write a default config file if none exists
    Init,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

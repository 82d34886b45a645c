//! Command handlers.
//!
//! `config` and `completions` run before any config is loaded; everything
//! else gets a loaded [`Config`] and, when it touches daemon state, a
//! [`VpnPack`] built on the system backends.

pub mod cleanup;
pub mod config_cmd;
pub mod keygen;
pub mod peer_config;
pub mod run;
pub mod status;
pub mod util;

use vpnpack_config::Config;
use vpnpack_core::{Backends, VpnPack};

use crate::cli::{DaemonCommand, GlobalOpts};
use crate::error::CliError;

/// Build the daemon context with the key from the environment or key file
/// installed but not yet validated.
pub fn open_pack(cfg: &Config) -> Result<VpnPack, CliError> {
    let daemon = cfg.to_daemon_config();
    let backends = Backends::system(&daemon)?;
    let key = vpnpack_config::resolve_api_key(&daemon.paths)?;
    let pack = VpnPack::new(daemon, backends)?;
    pack.install_api_key(key.as_ref())?;
    Ok(pack)
}

pub async fn dispatch(
    cmd: DaemonCommand,
    cfg: &Config,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match cmd {
        DaemonCommand::Run => run::handle(cfg).await,
        DaemonCommand::Cleanup => cleanup::handle(cfg, global).await,
        DaemonCommand::Status => status::handle(cfg, global).await,
        DaemonCommand::Keygen => keygen::handle(global),
        DaemonCommand::PeerConfig(args) => peer_config::handle(&args, cfg, global).await,
    }
}

//! Uninstall cleanup.

use vpnpack_config::Config;

use crate::cli::GlobalOpts;
use crate::commands::{open_pack, util};
use crate::error::CliError;
use crate::output;

pub async fn handle(cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    if !util::confirm(
        "Remove all VPN Pack firewall rules, tunnel interfaces, zones, and policies?",
        "cleanup",
        global.yes,
    )? {
        return Ok(());
    }

    let pack = open_pack(cfg)?;
    pack.cleanup().await;

    output::print_output("Cleanup complete", global.quiet);
    Ok(())
}

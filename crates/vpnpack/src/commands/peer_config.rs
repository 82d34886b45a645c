//! Remote-side config for a tunnel.

use vpnpack_config::Config;

use crate::cli::{GlobalOpts, PeerConfigArgs};
use crate::commands::open_pack;
use crate::error::CliError;
use crate::output;

pub async fn handle(args: &PeerConfigArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let pack = open_pack(cfg)?;
    let text = pack.peer_config(&args.id).await?;
    let rendered = output::render_single(
        global.output,
        &serde_json::json!({ "id": args.id, "config": text }),
        |_| text.trim_end().to_owned(),
        |_| text.trim_end().to_owned(),
    )?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}

//! WireGuard keypair generation.

use secrecy::ExposeSecret;
use serde::Serialize;

use vpnpack_core::tunnel::generate_keypair;

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeypairOut {
    private_key: String,
    public_key: String,
}

pub fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let pair = generate_keypair();
    let out = KeypairOut {
        private_key: pair.private_key.expose_secret().to_owned(),
        public_key: pair.public_key,
    };
    let rendered = output::render_single(
        global.output,
        &out,
        |k| format!("Private key: {}\nPublic key:  {}", k.private_key, k.public_key),
        |k| format!("{}\n{}", k.private_key, k.public_key),
    )?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}

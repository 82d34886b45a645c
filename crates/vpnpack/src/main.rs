mod cli;
mod commands;
mod error;
mod logging;
mod output;

use clap::Parser;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        // Config commands must work even when the file is broken
        Command::Config(ref args) => commands::config_cmd::handle(args, &cli.global),

        Command::Completions(ref args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "vpnpack", &mut std::io::stdout());
            Ok(())
        }

        Command::Daemon(cmd) => {
            let cfg = vpnpack_config::load_config(&cli.global.config)?;
            let _guard = logging::init(&cfg.logging, cli.global.verbose);

            tracing::debug!(command = ?cmd, config = %cli.global.config.display(), "dispatching command");
            commands::dispatch(cmd, &cfg, &cli.global).await
        }
    }
}

//! Config subcommand handlers.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&global.config.display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = vpnpack_config::load_config(&global.config)?;
            let rendered = match global.output {
                OutputFormat::Table | OutputFormat::Plain => cfg.to_toml()?,
                OutputFormat::Json => serde_json::to_string_pretty(&cfg)?,
                OutputFormat::JsonCompact => serde_json::to_string(&cfg)?,
            };
            output::print_output(rendered.trim_end(), global.quiet);
            Ok(())
        }

        ConfigCommand::Init => {
            let path = &global.config;
            let message = if vpnpack_config::write_default(path)? {
                format!("Wrote default config to {}", path.display())
            } else {
                format!("Config already exists at {}", path.display())
            };
            output::print_output(&message, global.quiet);
            Ok(())
        }
    }
}

use clap::Parser;

use pollroom::cli::{self, Cli, Command, ConfigCommand};
use pollroom::{config, logging, server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let explicit = cli.config.as_deref();

    match cli.command {
        None | Some(Command::Start) => {
            let path = config::resolve_config_path(explicit);
            let cfg = config::load_config(&path)?;
            logging::init_tracing(&cfg.logging)?;

            let issues = config::validate_config(&cfg);
            if !issues.is_empty() {
                for issue in &issues {
                    tracing::error!(path = %issue.path, "{}", issue.message);
                }
                return Err(format!("invalid configuration in {}", path.display()).into());
            }

            tracing::info!(config = %path.display(), "starting pollroom");
            server::run(cfg).await?;
        }
        Some(Command::Config(ConfigCommand::Show)) => cli::handle_config_show(explicit)?,
        Some(Command::Config(ConfigCommand::Path)) => cli::handle_config_path(explicit),
        Some(Command::Config(ConfigCommand::Validate)) => {
            if !cli::handle_config_validate(explicit)? {
                std::process::exit(1);
            }
        }
        Some(Command::Version) => cli::handle_version(),
    }

    Ok(())
}

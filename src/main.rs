use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cli_interface::exit::{EXIT_FAILURE, EXIT_OK};
use cli_interface::{exit_code_for_error, exit_code_for_state, ui, Cli, Commands};
use common::credentials::Credentials;
use deploy_config::ConfigLoader;
use nim_deploy::DeploymentService;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.logging_options()) {
        eprintln!("{}", e);
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            ui::failure(format!("{:#}", e));
            e.downcast_ref::<common::Error>()
                .map(exit_code_for_error)
                .unwrap_or(EXIT_FAILURE)
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load()?;
    cli.apply_overrides(&mut config);
    let cwd = std::env::current_dir().context("Failed to determine the current directory")?;
    config.resolve_workdir(&cwd);
    debug!(?config, "Loaded configuration");

    let service = DeploymentService::new(config)?;

    match &cli.command {
        Commands::List => {
            ui::print_discovery(&service.list_local_models()?);
            Ok(EXIT_OK)
        }
        Commands::Images => {
            let repo = service.config().container.catalog_repo().to_string();
            let tags = service.image_tags().await?;
            ui::print_tags(&repo, &tags);
            Ok(EXIT_OK)
        }
        Commands::Stop => {
            let name = service.config().container.name.clone();
            if service.stop_active().await? {
                ui::success(format!("Stopped {}", name));
            } else {
                println!("{} is not running", name);
            }
            Ok(EXIT_OK)
        }
        Commands::Deploy {
            model_repo,
            quant_repo,
            tag,
        } => {
            let credentials = Credentials::new(
                cli_interface::acquire_registry_token()?,
                cli_interface::acquire_api_key()?,
            );
            let cancel = cancel_on_ctrl_c();
            let report = service
                .download_and_deploy(model_repo, quant_repo, tag, &credentials, &cancel)
                .await?;
            ui::print_report(&report);
            Ok(exit_code_for_state(report.state()))
        }
        Commands::Run { .. } => {
            let (identity, resumable) = match cli.command.run_identity()? {
                Some(identity) => {
                    let resumable = service
                        .list_local_models()?
                        .resumable
                        .iter()
                        .any(|set| set.identity == identity);
                    (identity, resumable)
                }
                None => {
                    let discovery = service.list_local_models()?;
                    match cli_interface::select_model(&discovery)? {
                        Some(entry) => (entry.identity, entry.resumable),
                        None => {
                            ui::print_discovery(&discovery);
                            return Ok(EXIT_OK);
                        }
                    }
                }
            };

            let registry_token = if resumable {
                Some(cli_interface::acquire_registry_token()?)
            } else {
                None
            };
            let api_key = cli_interface::acquire_api_key()?;

            let cancel = cancel_on_ctrl_c();
            let report = service
                .deploy_existing(identity, registry_token, &api_key, &cancel)
                .await;
            ui::print_report(&report);
            Ok(exit_code_for_state(report.state()))
        }
    }
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, stopping deployment");
                token.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });
    cancel
}

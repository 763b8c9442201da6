//! Command-line companion client.
//!
//! Connects to the configured server, prints its info, then streams team
//! chat and the state of any `--entity` ids until Ctrl-C.
//!
//! Run with: `cargo run -p companion-cli -- --host 1.2.3.4 --owner-id 7656... --token -123`

use std::process::ExitCode;

use clap::Parser;
use companion_config::{CliArgs, Config, default_config_dir};
use companion_net::{ChatEvent, ClientBuilder, CompanionClient, EntityEvent};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone().map(Ok).unwrap_or_else(default_config_dir) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to resolve config directory: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_dir.display());
            return ExitCode::FAILURE;
        }
    };
    config.apply_cli_overrides(&args);

    companion_log::init_logging(
        config.debug.log_dir.as_deref(),
        cfg!(debug_assertions),
        Some(&config),
    );

    let client = match ClientBuilder::from_config(&config).build() {
        Ok(client) => client,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(&client, &args.entities).await {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(client: &CompanionClient, entities: &[u32]) -> Result<(), companion_net::ClientError> {
    info!(identity = %client.identity(), "connecting");
    client.connect().await?;

    let server = client.get_info().await?;
    info!(
        "{} | map {} ({}) | players {}/{} (+{} queued)",
        server.name,
        server.map,
        server.map_size,
        server.players,
        server.max_players,
        server.queued_players,
    );

    client.on_chat_message(|event: ChatEvent| async move {
        let msg = event.message;
        info!(target: "chat", "{}: {}", msg.name, msg.message);
    });

    for &entity_id in entities {
        let subscribed = client
            .subscribe_entity(entity_id, |event: EntityEvent| async move {
                info!(
                    entity_id = event.entity_id,
                    kind = ?event.entity_type,
                    value = event.payload.value,
                    "entity changed"
                );
            })
            .await;
        if let Err(e) = subscribed {
            warn!(entity_id, "subscription failed: {e}");
        }
    }

    if tokio::signal::ctrl_c().await.is_err() {
        warn!("could not listen for Ctrl-C, running until killed");
        client.hang().await;
    }
    info!("shutting down");
    client.disconnect().await;
    Ok(())
}

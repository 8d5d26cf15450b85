//! `relay-worker` -- interactive image generation against a ComfyUI server.
//!
//! Reads commands from standard input:
//!
//! - `<actor_id> <prompt>` generates an image and writes it to `OUTPUT_DIR`
//! - `/status` reports backend health and in-flight generations
//! - `/reload` re-reads the workflow template
//!
//! # Environment variables
//!
//! Backend settings are documented on
//! [`ComfyUIConfig::from_env`](relay_comfyui::config::ComfyUIConfig::from_env).
//!
//! | Variable     | Required | Default    | Description                        |
//! |--------------|----------|------------|------------------------------------|
//! | `OUTPUT_DIR` | no       | `./output` | Directory for generated images     |
//! | `LOG_FORMAT` | no       | --         | `json` for JSON log lines          |

use std::path::PathBuf;
use std::sync::Arc;

use relay_comfyui::config::ComfyUIConfig;
use relay_comfyui::generator::ImageGenerator;
use relay_core::gate::ConcurrencyGate;
use relay_worker::session::Session;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_OUTPUT_DIR: &str = "./output";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_worker=info,relay_comfyui=info,relay_core=info".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    let config = ComfyUIConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let output_dir = PathBuf::from(
        std::env::var("OUTPUT_DIR").unwrap_or_else(|_| DEFAULT_OUTPUT_DIR.to_string()),
    );

    let gate = Arc::new(ConcurrencyGate::new(config.max_concurrent));
    let generator = ImageGenerator::from_config(&config, gate).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to initialise generator");
        std::process::exit(1);
    });

    tracing::info!(
        base_url = %config.base_url,
        ws_url = %config.ws_url,
        workflow = %config.workflow_path.display(),
        max_concurrent = config.max_concurrent,
        output_dir = %output_dir.display(),
        "Starting relay-worker",
    );

    match generator.api().system_stats().await {
        Ok(stats) => {
            tracing::info!(os = %stats.system.os, python = %stats.system.python_version, "ComfyUI reachable");
            for device in &stats.devices {
                tracing::info!(
                    name = %device.name,
                    device_type = %device.device_type,
                    vram_total = device.vram_total,
                    vram_free = device.vram_free,
                    "ComfyUI device",
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "ComfyUI not reachable at startup"),
    }

    let root = CancellationToken::new();
    let on_signal = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    Session::new(Arc::new(generator), output_dir, root)
        .run(stdin)
        .await;

    tracing::info!("relay-worker stopped");
}

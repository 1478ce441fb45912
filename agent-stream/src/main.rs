use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_stream::transport::{query::check_health, HttpQueryClient, SseConnector};
use agent_stream::{ClientSettings, CommandDispatcher, DispatcherOptions, DispatcherState};
use anyhow::Context;
use shared_types::Component;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const ENV_FILE_NAME: &str = ".env";

/// Nearest `.env` at or above `start`.
fn find_env_file(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(ENV_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

/// Seeds `AGENT_STREAM_*` variables from a `.env` file before settings load.
/// Variables already set in the process win.
fn load_env_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir()
        .map_err(|e| tracing::warn!(error = %e, "No working directory; skipping .env"))
        .ok()?;
    let Some(path) = find_env_file(&cwd) else {
        tracing::debug!(cwd = %cwd.display(), "No .env file found");
        return None;
    };
    match dotenvy::from_path(&path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "Loaded client environment");
            Some(path)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable .env file");
            None
        }
    }
}

fn describe(component: &Component) -> String {
    match component {
        Component::Table(table) => format!(
            "table {} ({} cols x {} rows)",
            table.id,
            table.data.columns.len(),
            table.data.rows.len()
        ),
        Component::Chart(chart) => format!(
            "chart {} ({} series, {} points)",
            chart.id,
            chart.data.series.len(),
            chart.data.point_count()
        ),
        Component::Map(map) => format!("map {} ({} features)", map.id, map.data.features.len()),
    }
}

fn print_state(state: &DispatcherState) {
    let doc = &state.ui_document;
    println!(
        "[{}] v{} children={} errors={}",
        state.connection.phase,
        doc.version,
        doc.len(),
        state.patch_errors.len()
    );
    for child in &doc.children {
        println!("  - {}", describe(child));
    }
    if let Some(message) = &state.last_message {
        println!("  message: {message}");
    }
    if let Some(error) = &state.last_error {
        println!("  error: {error}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    load_env_file();
    let settings = ClientSettings::load().context("Failed to load client settings")?;
    tracing::info!(base_url = %settings.base_url, "Starting agent stream client");

    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;

    match check_health(&http, &settings.health_url()).await {
        Ok(health) => tracing::info!(
            status = %health.status,
            agent_ready = health.agent_ready,
            connected_clients = health.connected_clients,
            "Backend health"
        ),
        Err(e) => tracing::warn!(error = %e, "Backend health check failed; connecting anyway"),
    }

    let mut dispatcher = CommandDispatcher::start(DispatcherOptions {
        endpoint: settings.stream_url(),
        config: settings.connection_config(),
        limits: settings.patch_limits(),
        max_frame_bytes: settings.max_frame_bytes,
        connector: Arc::new(SseConnector::new(http.clone(), settings.max_frame_bytes)),
        query_client: Arc::new(HttpQueryClient::new(http, settings.query_url())),
    })
    .await
    .context("Failed to start session")?;
    dispatcher.connect().context("Failed to connect")?;

    println!("Type a query, or /reconnect, /disconnect, /clear, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let result = match line.trim() {
                    "/quit" => break,
                    "/reconnect" => dispatcher.reconnect(),
                    "/disconnect" => dispatcher.disconnect(),
                    "/clear" => {
                        dispatcher.clear_errors();
                        Ok(())
                    }
                    text => dispatcher.send_message(text).map(|request_id| {
                        println!("sent {request_id}");
                    }),
                };
                if let Err(e) = result {
                    println!("error: {e}");
                }
            }
            update = dispatcher.next() => {
                match update {
                    Some(state) => print_state(&state),
                    None => {
                        tracing::error!("Background context stopped");
                        break;
                    }
                }
            }
        }
    }

    dispatcher.shutdown().await;
    Ok(())
}

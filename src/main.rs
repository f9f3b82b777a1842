mod backend;
mod config;
mod error;
mod relay;
use eyre::Result;
use tracing_subscriber::{Layer, layer::SubscriberExt};

/// Per-frame payload logging. Capped at `warn` unless `RUST_LOG` says otherwise.
pub const FRAMES_TARGET: &str = "telemetry_relay::frames";

pub fn build_logger() -> Result<()> {
    // Create an env filter that defaults to "trace" level if RUST_LOG is not set
    // But also specifically filters out noisy websocket and http logs
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = [
            "tungstenite=warn",
            "tokio_tungstenite=warn",
            "hyper=warn",
            "hyper_util=warn",
        ];
        directives
            .into_iter()
            .map(str::to_string)
            .chain(std::iter::once(format!("{FRAMES_TARGET}=warn")))
            .filter_map(|d| d.parse::<tracing_subscriber::filter::Directive>().ok())
            .fold(tracing_subscriber::EnvFilter::new("trace"), |filter, d| {
                filter.add_directive(d)
            })
    });

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(env_filter),
        ),
    )
    .map_err(|e| eyre::eyre!("Failed to initialize logger: {}", e))?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    build_logger()?;
    tracing::debug!("Debug logging is enabled");
    tracing::info!("Telemetry relay version: {}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(
        "Override with RUST_LOG environment variable if needed (e.g., RUST_LOG={FRAMES_TARGET}=trace)"
    );

    // Load configuration
    let config = config::AppConfig::load_or_default();
    tracing::info!("Configuration loaded successfully");
    tracing::debug!("Active configuration: {:?}", config);

    // Create and run the backend
    backend::setup_and_run_backend(config).await?;

    tracing::info!("Application shutdown complete");
    Ok(())
}

//! JT/T 808 platform server binary.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default endpoint
//! jt808-platform --bind 0.0.0.0:8888
//!
//! # Raise the connection limit and log verbosity
//! jt808-platform --bind 0.0.0.0:8888 --max-connections 500 --log-level debug
//! ```

use clap::Parser;
use jt808_platform::{Platform, PlatformConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// JT/T 808 vehicle telematics platform
#[derive(Parser, Debug)]
#[command(name = "jt808-platform")]
#[command(about = "JT/T 808 vehicle telematics platform server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8888")]
    bind: String,

    /// Maximum simultaneously registered terminals
    #[arg(long, default_value = "10")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("JT/T 808 platform starting");

    let config = PlatformConfig { bind_addr: args.bind, max_connections: args.max_connections };

    let mut platform = Platform::bind(config).await?;
    platform.on_multimedia_uploaded(|media| {
        tracing::info!(
            media_id = media.media_id,
            media_type = media.media_type,
            bytes = media.data.len(),
            "multimedia received"
        );
    });

    tracing::info!("platform listening on {}", platform.local_addr());
    platform.run()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    platform.stop().await;

    Ok(())
}

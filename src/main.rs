use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tollbooth::chart::chart;
use tollbooth::server::{self, AppState};
use tollbooth::sim::{self, LoadConfig};
use tollbooth::{ServiceConfig, TokenBucket};

#[derive(Parser)]
#[command(name = "tollbooth", about = "Token bucket rate limiter service")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a rate limited and an unlimited HTTP endpoint
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        #[command(flatten)]
        bucket: BucketArgs,
    },
    /// Replay synthetic traffic against a bucket and chart the result
    Simulate {
        #[command(flatten)]
        bucket: BucketArgs,

        /// Number of concurrent clients
        #[arg(long, default_value_t = 4)]
        clients: usize,

        /// Milliseconds between two requests of one client
        #[arg(long, default_value_t = 500)]
        request_interval_ms: u64,

        /// Mean request latency in milliseconds
        #[arg(long, default_value_t = 100)]
        latency_ms: u64,

        /// Latency jitter in milliseconds
        #[arg(long, default_value_t = 50)]
        jitter_ms: u64,

        /// How long to generate traffic, in seconds
        #[arg(long, default_value_t = 20)]
        duration_secs: u64,

        /// Where to write the HTML chart
        #[arg(short, long, default_value = "load.html")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct BucketArgs {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of tokens (burst size)
    #[arg(long)]
    capacity: Option<u64>,

    /// Tokens added per refill tick
    #[arg(long)]
    rate: Option<u64>,

    /// Milliseconds between refill ticks
    #[arg(long)]
    interval_ms: Option<u64>,
}

impl BucketArgs {
    fn resolve(&self) -> anyhow::Result<ServiceConfig> {
        let mut cfg = match &self.config {
            Some(path) => ServiceConfig::load(path)?,
            None => ServiceConfig::default(),
        };
        if let Some(capacity) = self.capacity {
            cfg.bucket.capacity = capacity;
        }
        if let Some(rate) = self.rate {
            cfg.bucket.rate = rate;
        }
        if let Some(interval_ms) = self.interval_ms {
            cfg.bucket.interval_ms = interval_ms;
        }
        cfg.bucket.validate()?;
        Ok(cfg)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tollbooth=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve { port, bucket } => {
            let mut cfg = bucket.resolve()?;
            if let Some(port) = port {
                cfg.port = port;
            }
            let limiter = Arc::new(TokenBucket::from_config(&cfg.bucket)?);
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port))
                .await
                .with_context(|| format!("Unable to bind port {}", cfg.port))?;

            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                port = cfg.port,
                capacity = cfg.bucket.capacity,
                rate = cfg.bucket.rate,
                interval_ms = cfg.bucket.interval_ms,
                "rate limiter service listening, try /limited and /unlimited"
            );

            server::serve(listener, AppState { limiter }, shutdown_signal()).await?;
            tracing::info!("server stopped");
        }
        Command::Simulate {
            bucket,
            clients,
            request_interval_ms,
            latency_ms,
            jitter_ms,
            duration_secs,
            output,
        } => {
            let cfg = bucket.resolve()?;
            let load = LoadConfig {
                clients,
                request_interval: Duration::from_millis(request_interval_ms),
                latency: Duration::from_millis(latency_ms),
                jitter: Duration::from_millis(jitter_ms),
                duration: Duration::from_secs(duration_secs),
            };
            let report = tokio::task::spawn_blocking(move || {
                let limiter = TokenBucket::from_config(&cfg.bucket)?;
                sim::run(&limiter, &load)
            })
            .await??;

            let title = format!(
                "capacity={} rate={} interval={}ms",
                cfg.bucket.capacity, cfg.bucket.rate, cfg.bucket.interval_ms
            );
            chart(&report, &title, &output)?;
            tracing::info!(output = %output.display(), "chart written");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Unable to listen for shutdown signal: {}", e);
    }
    tracing::info!("shutdown signal received");
}

//
// s3-workload - workload generator for S3-compatible object stores
//

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use s3_workload::config::Config;
use s3_workload::metrics::PrometheusSink;
use s3_workload::runner::Runner;
use s3_workload::s3_store::{S3Config, S3Store};

#[derive(Parser)]
#[command(name = "s3-workload", version, about = "Workload generator for S3-compatible object stores")]
struct Cli {
    /// YAML config file path
    #[arg(short = 'c', long = "config")]
    config: String,

    /// Verbose output (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    // Load environment: AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, etc.
    dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut cfg = Config::load(&cli.config)?;

    if cfg.access_key.is_empty() {
        if let Ok(val) = std::env::var("AWS_ACCESS_KEY_ID") {
            cfg.access_key = val;
        }
    }
    if cfg.secret_key.is_empty() {
        if let Ok(val) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            cfg.secret_key = val;
        }
    }

    if cfg.dry_run {
        info!(
            endpoint = %cfg.endpoint,
            bucket = %cfg.bucket,
            concurrency = cfg.concurrency,
            mix = ?cfg.mix,
            size = %cfg.size,
            keys = cfg.keys,
            pattern = %cfg.pattern,
            "dry run: configuration is valid"
        );
        return Ok(());
    }

    let store = Arc::new(
        S3Store::new(S3Config {
            endpoint: cfg.endpoint.clone(),
            region: cfg.region.clone(),
            bucket: cfg.bucket.clone(),
            access_key: cfg.access_key.clone(),
            secret_key: cfg.secret_key.clone(),
            path_style: cfg.path_style,
            skip_tls_verify: cfg.skip_tls_verify,
        })
        .await?,
    );

    let metrics = Arc::new(PrometheusSink::new());
    let runner = Arc::new(Runner::new(cfg, store, metrics.clone())?);

    // Wind down cleanly on Ctrl-C; a second signal kills the process.
    let signal_runner = runner.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping workload");
            signal_runner.stop();
        }
    });

    runner.run().await?;

    // Final scrape for operators collecting from logs rather than HTTP.
    println!("{}", metrics.gather_text());

    Ok(())
}

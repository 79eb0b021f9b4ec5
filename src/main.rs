//! Certdraw binary
//!
//! Runs the HTTP service or one-shot auditor commands against the store.

use certdraw::{
    api::ApiServer,
    config::EngineConfig,
    engine::DrawEngine,
    stats::ExportEncoding,
};
use clap::{Parser, Subcommand};
use std::{fs::File, io::BufWriter, path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

/// Certified draw engine CLI
#[derive(Parser)]
#[command(name = "certdraw")]
#[command(about = "Certified draw engine with commit-reveal seeding and audit trail")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the storage directory
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Use the in-process repository instead of RocksDB
    #[arg(long)]
    in_memory: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the background scheduler
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run the statistical test battery once and print the report
    Battery,

    /// Re-verify a finished round from its stored values
    Verify {
        /// Round to verify
        round_id: u64,
    },

    /// Check every audit entry against its integrity hash
    AuditCheck,

    /// Write raw samples for external statistical suites
    Export {
        #[arg(short, long, default_value_t = 100_000)]
        samples: usize,

        /// decimal, hex or binary
        #[arg(short, long, default_value = "decimal")]
        encoding: String,

        /// Output file; a JSON payload is printed when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_ref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_directory = dir;
    }
    if cli.in_memory {
        config.storage.in_memory = true;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.monitoring.log_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.api.host = host;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            let engine = Arc::new(DrawEngine::open(config)?);
            ApiServer::new(engine).run().await
        }
        Commands::Battery => {
            let engine = DrawEngine::open(config)?;
            let report = engine.battery().run_battery().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.overall_passed {
                tracing::warn!(failed = ?report.summary.failed, "Statistical battery reported failures");
            }
            Ok(())
        }
        Commands::Verify { round_id } => {
            let engine = DrawEngine::open(config)?;
            let verification = engine.verify_round(round_id).await?;
            println!("{}", serde_json::to_string_pretty(&verification)?);
            if !verification.certified {
                std::process::exit(2);
            }
            Ok(())
        }
        Commands::AuditCheck => {
            let engine = DrawEngine::open(config)?;
            let report = engine.audit().verify_integrity().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            report.certify()?;
            Ok(())
        }
        Commands::Export { samples, encoding, out } => {
            let encoding: ExportEncoding = encoding.parse()?;
            let engine = DrawEngine::open(config)?;
            match out {
                Some(path) => {
                    let mut writer = BufWriter::new(File::create(&path)?);
                    let digest = engine.exporter().write_to(samples, encoding, &mut writer).await?;
                    tracing::info!(path = %path.display(), samples, %encoding, sha256 = %digest, "Export written");
                }
                None => {
                    let payload = engine.exporter().export(samples, encoding).await?;
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                }
            }
            Ok(())
        }
    }
}

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use quilt_api::{ComposeTarget, CompositionEngine, EngineConfig, MemoryStore};
use quilt_core::ProfileType;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "quiltctl", version, about = "Quilt profile composition CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Yaml)]
    output: Output,

    /// Namespace to compose in
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    /// Fixture catalog (JSON or YAML) with profiles and resources
    #[arg(long = "fixtures", global = true, env = "QUILT_FIXTURES")]
    fixtures: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Yaml, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compose one stored resource into a manifest
    Compose {
        /// pod, container, service or deployment
        kind: String,
        id: i64,
    },
    /// Compose every stored resource and report inline error markers
    Lint,
    /// List stored profiles
    Profiles {
        /// Only profiles of this type, e.g. "pod_metadata_profile"
        #[arg(long = "type")]
        profile_type: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("QUILT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries manifests
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("QUILT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid QUILT_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_store(path: Option<&PathBuf>) -> Result<Arc<MemoryStore>> {
    let Some(path) = path else {
        bail!("no fixtures given; pass --fixtures FILE or set QUILT_FIXTURES");
    };
    Ok(Arc::new(MemoryStore::load(path)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let store = load_store(cli.fixtures.as_ref())?;
    let engine = CompositionEngine::new(store.clone(), EngineConfig::from_env());

    match cli.command {
        Commands::Compose { kind, id } => {
            info!(kind = %kind, id, ns = %cli.namespace, "compose invoked");
            let manifest = engine.compose(&kind, id, &cli.namespace).await?;
            match cli.output {
                Output::Yaml => print!("{}", manifest.to_yaml()?),
                Output::Json => println!("{}", manifest.to_json_pretty()?),
            }
            for path in manifest.error_markers() {
                eprintln!("warning: error marker at {}", path);
            }
        }
        Commands::Lint => {
            let resources = store.resources();
            info!(resources = resources.len(), "lint invoked");
            let mut markers = 0usize;
            let mut failures = 0usize;
            for r in &resources {
                let target = ComposeTarget::ById { kind: r.kind(), id: r.id(), namespace: r.namespace() };
                match engine.compose_with_cancel(target, &Default::default()).await {
                    Ok(m) => {
                        for path in m.error_markers() {
                            markers += 1;
                            println!("{}/{} ({}): {}", r.kind(), r.name(), r.id(), path);
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        error!(kind = %r.kind(), id = r.id(), error = %e, "lint: compose failed");
                        println!("{}/{} ({}): compose failed: {}", r.kind(), r.name(), r.id(), e);
                    }
                }
            }
            metrics::counter!("lint_markers_total", markers as u64);
            if markers > 0 || failures > 0 {
                bail!("lint: {} marker(s), {} failed composition(s) across {} resource(s)", markers, failures, resources.len());
            }
            eprintln!("lint: {} resource(s) clean", resources.len());
        }
        Commands::Profiles { profile_type } => {
            let wanted = profile_type
                .as_deref()
                .map(ProfileType::from_str)
                .transpose()
                .context("--type")?;
            let profiles: Vec<_> = store
                .profiles()
                .into_iter()
                .filter(|p| wanted.map_or(true, |t| p.profile_type == t))
                .filter(|p| p.namespace == cli.namespace)
                .collect();
            match cli.output {
                Output::Yaml => print!("{}", serde_yaml::to_string(&profiles)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&profiles)?),
            }
        }
    }
    Ok(())
}

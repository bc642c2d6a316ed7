use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::info;

use pipeform_api::{
    list_collection, sync_collection, CollectionSpec, ConfiguredResource, ResourceLifecycle,
};
use pipeform_core::ConfigMap;
use pipeform_reconcile::{diff_memberships, Assignment, MembershipDiff};
use pipeform_resthub::RestClient;
use pipeform_schema::ServiceCatalog;

#[derive(Parser, Debug)]
#[command(name = "pipeformctl", version, about = "Pipeform CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Directory holding services.json and service_schemas.json
    #[arg(long = "schemas", global = true, default_value = "schemas")]
    schemas: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ResourceKind {
    Connector,
    Destination,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum MemberCollection {
    Connectors,
    Groups,
    Users,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered services
    Services,
    /// Print the unified field model, or one service's fields
    Schema {
        /// Restrict to a single service id
        #[arg(long = "service")]
        service: Option<String>,
    },
    /// Fetch a resource upstream and print its shaped state
    Read {
        kind: ResourceKind,
        id: String,
    },
    /// Diff (and optionally apply) a declared team membership collection
    Members {
        team_id: String,
        collection: MemberCollection,
        /// JSON file with the declared entries: [{"key": ..., "role": ...}]
        file: PathBuf,
        /// Apply the plan instead of only printing it
        #[arg(long = "apply", action = ArgAction::SetTrue)]
        apply: bool,
    },
    /// Diff (and optionally apply) a trusted fingerprint set
    Fingerprints {
        kind: ResourceKind,
        id: String,
        /// JSON file with the declared hashes: ["sha256:...", ...]
        file: PathBuf,
        #[arg(long = "apply", action = ArgAction::SetTrue)]
        apply: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("PIPEFORM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PIPEFORM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PIPEFORM_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_assignments(file: &PathBuf) -> Result<Vec<Assignment>> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))
}

fn load_hashes(file: &PathBuf) -> Result<Vec<Assignment>> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let hashes: Vec<String> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
    Ok(hashes.into_iter().map(|h| Assignment::new(h, "")).collect())
}

fn print_plan(output: Output, plan: &MembershipDiff, applied: bool) -> Result<()> {
    match output {
        Output::Human => {
            if plan.is_empty() {
                println!("in sync; nothing to do");
                return Ok(());
            }
            for key in &plan.revoke {
                println!("- {}", key);
            }
            for a in &plan.update_role {
                println!("~ {} -> {}", a.key, a.role);
            }
            for a in &plan.add {
                if a.role.is_empty() {
                    println!("+ {}", a.key);
                } else {
                    println!("+ {} ({})", a.key, a.role);
                }
            }
            if !applied {
                println!("(plan only; re-run with --apply)");
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(plan)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Services => {
            let catalog = ServiceCatalog::load(&cli.schemas)?;
            match cli.output {
                Output::Human => {
                    for (id, label) in catalog.services() {
                        println!("{:<24} {}", id, label);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(catalog.services())?),
            }
        }
        Commands::Schema { service } => {
            let catalog = ServiceCatalog::load(&cli.schemas)?;
            let fields = match service.as_deref() {
                Some(id) => catalog
                    .service_fields(id)
                    .with_context(|| format!("unknown service {id}"))?,
                None => catalog.unified(),
            };
            match cli.output {
                Output::Human => {
                    for (name, spec) in fields {
                        let mut flags = Vec::new();
                        if spec.sensitive {
                            flags.push("sensitive");
                        }
                        if spec.read_only {
                            flags.push("readonly");
                        }
                        if spec.nullable {
                            flags.push("nullable");
                        }
                        println!("{:<32} {:<12} {}", name, format!("{:?}", spec.kind), flags.join(","));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(fields)?),
            }
        }
        Commands::Read { kind, id } => {
            let catalog = Arc::new(ServiceCatalog::load(&cli.schemas)?);
            let transport: Arc<dyn pipeform_resthub::Transport> = Arc::new(RestClient::from_env()?);
            let resource = match kind {
                ResourceKind::Connector => ConfiguredResource::connectors(transport, catalog),
                ResourceKind::Destination => ConfiguredResource::destinations(transport, catalog),
            };
            let mut prior = ConfigMap::new();
            prior.insert("id".to_string(), serde_json::Value::String(id.clone()));
            info!(kind = ?kind, id = %id, "read invoked");
            match resource.read(&prior).await? {
                // Shaped state is a JSON map either way; pretty-print both.
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => eprintln!("not found upstream"),
            }
        }
        Commands::Members {
            team_id,
            collection,
            file,
            apply,
        } => {
            let desired = load_assignments(&file)?;
            let spec = match collection {
                MemberCollection::Connectors => CollectionSpec::team_connectors(&team_id),
                MemberCollection::Groups => CollectionSpec::team_groups(&team_id),
                MemberCollection::Users => CollectionSpec::team_users(&team_id),
            };
            let transport = RestClient::from_env()?;
            info!(team = %team_id, collection = ?collection, apply, "members invoked");
            let plan = if apply {
                sync_collection(&transport, &spec, &desired).await?
            } else {
                let upstream: Vec<Assignment> = list_collection(&transport, &spec)
                    .await?
                    .into_iter()
                    .map(|r| Assignment::new(r.key, r.role))
                    .collect();
                diff_memberships(&desired, &upstream)
            };
            print_plan(cli.output, &plan, apply)?;
        }
        Commands::Fingerprints {
            kind,
            id,
            file,
            apply,
        } => {
            let desired = load_hashes(&file)?;
            let spec = match kind {
                ResourceKind::Connector => CollectionSpec::connector_fingerprints(&id),
                ResourceKind::Destination => CollectionSpec::destination_fingerprints(&id),
            };
            let transport = RestClient::from_env()?;
            info!(kind = ?kind, id = %id, apply, "fingerprints invoked");
            let plan = if apply {
                sync_collection(&transport, &spec, &desired).await?
            } else {
                let upstream: Vec<Assignment> = list_collection(&transport, &spec)
                    .await?
                    .into_iter()
                    .map(|r| Assignment::new(r.key, r.role))
                    .collect();
                diff_memberships(&desired, &upstream)
            };
            print_plan(cli.output, &plan, apply)?;
        }
    }

    Ok(())
}

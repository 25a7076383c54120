//! `kira` – command-line surface over the vault kernel.
//!
//! Exit codes: 0 success, 1 generic error, 2 validation failure, 5 I/O
//! failure, 6 configuration error.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use kira_bus_core::EventBus;
use kira_config::{ConfigError, KiraConfig};
use kira_host::{Entity, HostApi, HostError};
use kira_types::{exit_codes, EntityKind, Metadata};
use kira_vault::{Vault, VaultError};

#[derive(Parser)]
#[command(name = "kira", version, about = "Reactive personal-knowledge vault")]
struct Cli {
    /// Path to kira.yaml.
    #[arg(long, global = true, default_value = "kira.yaml")]
    config: PathBuf,

    /// Override the vault path from the config file.
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Initialize the vault directory structure.
    Init,
    /// Create an entity.
    Create {
        /// Entity kind (task, note, event, project, contact, meeting).
        #[arg(long)]
        kind: String,
        /// Entity title.
        #[arg(long)]
        title: Option<String>,
        /// Front-matter as a JSON object.
        #[arg(long)]
        data: Option<String>,
        /// Markdown body.
        #[arg(long, default_value = "")]
        content: String,
    },
    /// Read an entity.
    Get {
        /// Entity ID.
        id: String,
    },
    /// Update an entity.
    Update {
        /// Entity ID.
        id: String,
        /// Metadata updates as a JSON object.
        #[arg(long)]
        data: String,
        /// Replacement Markdown body.
        #[arg(long)]
        content: Option<String>,
    },
    /// Delete an entity.
    Delete {
        /// Entity ID.
        id: String,
    },
    /// List entities.
    List {
        /// Filter by kind.
        #[arg(long)]
        kind: Option<String>,
        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
        /// Results to skip.
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show link information for an entity.
    Links {
        /// Entity ID.
        id: String,
    },
    /// Run link-graph diagnostics (orphans, cycles, broken references).
    Validate,
}

//─────────────────────────────
//  Error classification
//─────────────────────────────

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return exit_codes::CONFIG;
    }
    if let Some(vault_err) = err.downcast_ref::<VaultError>() {
        return match vault_err {
            VaultError::Host(host) => host_exit_code(host),
            VaultError::LockTimeout { .. } | VaultError::LockIo { .. } => exit_codes::IO,
        };
    }
    if let Some(host_err) = err.downcast_ref::<HostError>() {
        return host_exit_code(host_err);
    }
    if err.downcast_ref::<kira_schemas::SchemaError>().is_some() {
        return exit_codes::IO;
    }
    exit_codes::ERROR
}

fn host_exit_code(err: &HostError) -> i32 {
    match err {
        HostError::Validation { .. } | HostError::FolderContract(_) | HostError::InvalidId(_) => {
            exit_codes::VALIDATION
        }
        HostError::Io(_) | HostError::Quarantine(_) => exit_codes::IO,
        HostError::NotFound(_) | HostError::AlreadyExists(_) => exit_codes::ERROR,
    }
}

//─────────────────────────────
//  Rendering
//─────────────────────────────

fn entity_json(entity: &Entity) -> Value {
    json!({
        "id": entity.id,
        "kind": entity.kind.as_str(),
        "title": entity.title(),
        "path": entity.path.as_ref().map(|p| p.display().to_string()),
        "metadata": Value::Object(entity.metadata.clone()),
    })
}

fn print_value(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(_) => println!("{value}"),
    }
}

fn parse_kind(raw: &str) -> anyhow::Result<EntityKind> {
    EntityKind::from_str(raw).map_err(|e| anyhow::anyhow!(e))
}

fn parse_data(raw: Option<&str>) -> anyhow::Result<Metadata> {
    let Some(raw) = raw else { return Ok(Metadata::new()) };
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("--data must be a JSON object, got: {other}"),
    }
}

//─────────────────────────────
//  Entry point
//─────────────────────────────

fn open_vault(cli: &Cli) -> anyhow::Result<Vault> {
    let mut config = match KiraConfig::load(&cli.config) {
        Ok(config) => config,
        // A missing config file is fine when --vault is given.
        Err(ConfigError::Io { .. }) if cli.vault.is_some() => KiraConfig::default(),
        Err(err) => return Err(err.into()),
    };
    if let Some(vault) = &cli.vault {
        config.vault.path = Some(vault.clone());
    }

    let vault_path = config.vault_path()?.to_path_buf();
    let tz = config.timezone()?;
    let bus = Arc::new(EventBus::new());
    let host = HostApi::new(vault_path, tz, bus)?;
    Ok(Vault::new(host))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let vault = open_vault(&cli)?;

    match cli.command {
        CliCommand::Init => {
            let schema_dir = vault.host().vault_path().join(".kira").join("schemas");
            let written = kira_schemas::write_default_schemas(&schema_dir)?;
            println!(
                "vault initialized at {} ({written} default schemas written)",
                vault.host().vault_path().display()
            );
        }
        CliCommand::Create { kind, title, data, content } => {
            let kind = parse_kind(&kind)?;
            let mut data = parse_data(data.as_deref())?;
            if let Some(title) = title {
                data.entry("title".to_string()).or_insert(Value::String(title));
            }
            let entity = vault.create(kind, data, &content).await?;
            print_value(&entity_json(&entity));
        }
        CliCommand::Get { id } => {
            let entity = vault.get(&id)?;
            let mut value = entity_json(&entity);
            value["content"] = Value::String(entity.content.clone());
            print_value(&value);
        }
        CliCommand::Update { id, data, content } => {
            let updates = parse_data(Some(&data))?;
            let entity = vault.update(&id, updates, content.as_deref()).await?;
            print_value(&entity_json(&entity));
        }
        CliCommand::Delete { id } => {
            vault.delete(&id).await?;
            println!("deleted {id}");
        }
        CliCommand::List { kind, limit, offset } => {
            let kind = kind.as_deref().map(parse_kind).transpose()?;
            let entities = vault.list(kind, limit, offset)?;
            let value = Value::Array(entities.iter().map(entity_json).collect());
            print_value(&value);
        }
        CliCommand::Links { id } => {
            let links = vault.links(&id)?;
            print_value(&serde_json::to_value(&links)?);
        }
        CliCommand::Validate => {
            let report = vault.host().with_link_graph(|graph| {
                let known = graph.entities().clone();
                json!({
                    "orphans": graph.find_orphans().into_iter().collect::<Vec<_>>(),
                    "cycles": graph.find_cycles("depends_on"),
                    "broken": graph
                        .find_broken(&known)
                        .into_iter()
                        .map(|l| json!({"source": l.source_id, "target": l.target_id, "type": l.link_type}))
                        .collect::<Vec<_>>(),
                })
            });
            print_value(&report);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

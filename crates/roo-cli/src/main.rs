use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use roo_api::{load_config, ResolveRequest, RulesOfOriginApi};
use roo_core::{Region, TreeId};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "roo")]
#[command(about = "Rules of origin resolution CLI")]
struct Cli {
    #[arg(long, default_value = "./rules_of_origin.sqlite3")]
    db: PathBuf,

    /// YAML resolver config; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Dataset {
        #[command(subcommand)]
        command: DatasetCommand,
    },
    Tree {
        #[command(subcommand)]
        command: TreeCommand,
    },
    Resolve(ResolveArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum DatasetCommand {
    Import(DatasetImportArgs),
}

#[derive(Debug, Args)]
struct DatasetImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TreeCommand {
    List(TreeListArgs),
    Prune(TreePruneArgs),
    Activate(TreeActivateArgs),
}

#[derive(Debug, Args)]
struct TreeListArgs {
    #[arg(long)]
    region: Option<String>,
}

#[derive(Debug, Args)]
struct TreePruneArgs {
    #[arg(long)]
    region: String,
}

#[derive(Debug, Args)]
struct TreeActivateArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    #[arg(long)]
    country: String,
    #[arg(long)]
    code: String,
    /// RFC 3339 timestamp; defaults to now.
    #[arg(long)]
    as_of: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let api = RulesOfOriginApi::new(cli.db, config);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Dataset { command } => run_dataset(command, &api),
        Command::Tree { command } => run_tree(command, &api),
        Command::Resolve(args) => run_resolve(args, &api),
    }
}

fn run_db(command: DbCommand, api: &RulesOfOriginApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::IntegrityCheck => emit_json(serde_json::to_value(api.integrity_check()?)?),
    }
}

fn run_dataset(command: DatasetCommand, api: &RulesOfOriginApi) -> Result<()> {
    match command {
        DatasetCommand::Import(args) => {
            let summary = api.import_dataset(&args.input)?;
            info!(
                tree_id = %summary.tree_id,
                region = %summary.region,
                rules = summary.rules,
                "dataset imported"
            );
            emit_json(serde_json::to_value(summary)?)
        }
    }
}

fn run_tree(command: TreeCommand, api: &RulesOfOriginApi) -> Result<()> {
    match command {
        TreeCommand::List(args) => {
            let region = args.region.as_deref().map(parse_region).transpose()?;
            let trees = api.list_trees(region)?;
            emit_json(serde_json::json!({ "trees": trees }))
        }
        TreeCommand::Prune(args) => {
            let result = api.prune_trees(parse_region(&args.region)?)?;
            emit_json(serde_json::to_value(result)?)
        }
        TreeCommand::Activate(args) => {
            let tree_id = TreeId::from_str(&args.id)
                .map_err(|err| anyhow!("invalid tree id `{}`: {err}", args.id))?;
            emit_json(serde_json::to_value(api.activate_tree(tree_id)?)?)
        }
    }
}

fn run_resolve(args: ResolveArgs, api: &RulesOfOriginApi) -> Result<()> {
    let as_of = args.as_of.as_deref().map(parse_rfc3339).transpose()?;
    let package = api.resolve(ResolveRequest {
        country_code: args.country,
        commodity_code: args.code,
        as_of,
    })?;
    emit_json(serde_json::to_value(package)?)
}

fn parse_region(raw: &str) -> Result<Region> {
    Region::parse(raw).ok_or_else(|| anyhow!("unsupported region `{raw}` (expected UK or EU)"))
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).with_context(|| format!("invalid RFC3339 timestamp `{raw}`"))
}

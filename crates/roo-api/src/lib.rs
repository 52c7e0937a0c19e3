use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use roo_core::{
    resolve_rules_of_origin, CitationStyle, CommodityCode, NomenclatureTree, Region,
    ResolveError, ResolveQuery, ResolverOptions, RulesOfOrigin, RulesSource, TreeId,
};
use roo_store_sqlite::{
    Dataset, ImportSummary, IntegrityReport, SchemaStatus, SqliteStore, TreeSummary,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::debug;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Resolver settings, usually loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    /// Region whose active nomenclature tree answers queries.
    pub region: Region,
    /// Country codes answered with another country's rules.
    pub country_aliases: BTreeMap<String, String>,
    pub citation_style: CitationStyle,
    pub strict_footnotes: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            region: Region::Uk,
            country_aliases: BTreeMap::from([("EU".to_string(), "FR".to_string())]),
            citation_style: CitationStyle::Plain,
            strict_footnotes: false,
        }
    }
}

impl ResolverConfig {
    /// # Errors
    /// Returns an error when the YAML is malformed or has unknown keys.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("failed to parse resolver config")
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Uppercased country code with aliases applied.
    #[must_use]
    pub fn canonical_country(&self, country_code: &str) -> String {
        let code = country_code.trim().to_ascii_uppercase();
        self.country_aliases.get(&code).cloned().unwrap_or(code)
    }

    #[must_use]
    pub fn options(&self) -> ResolverOptions {
        ResolverOptions {
            citation_style: self.citation_style,
            strict_footnotes: self.strict_footnotes,
        }
    }
}

/// Load the config at `path`, or the defaults when no path is given.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed.
pub fn load_config(path: Option<&Path>) -> Result<ResolverConfig> {
    path.map_or_else(|| Ok(ResolverConfig::default()), ResolverConfig::from_yaml_file)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolveRequest {
    pub country_code: String,
    pub commodity_code: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

/// Result of one resolution, with enough context to reproduce it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionPackage {
    pub resolution_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    /// Country code as supplied, before aliasing.
    pub requested_country_code: String,
    pub query: ResolveQuery,
    pub tree: NomenclatureTree,
    pub documents: RulesOfOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PruneResult {
    pub region: Region,
    pub deleted_trees: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivateResult {
    pub tree_id: TreeId,
    pub retired_tree_id: Option<TreeId>,
}

#[derive(Debug, Clone)]
pub struct RulesOfOriginApi {
    db_path: PathBuf,
    config: ResolverConfig,
}

impl RulesOfOriginApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: ResolverConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when an integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Import a JSON dataset file as the new active tree of its region.
    ///
    /// # Errors
    /// Returns an error when the file is unreadable, fails validation or
    /// cannot be written.
    pub fn import_dataset(&self, path: &Path) -> Result<ImportSummary> {
        let dataset = Dataset::from_json_file(path)?;
        let mut store = self.open_store()?;
        store.migrate()?;
        store.import_dataset(&dataset)
    }

    /// # Errors
    /// Returns an error when the trees cannot be listed.
    pub fn list_trees(&self, region: Option<Region>) -> Result<Vec<TreeSummary>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_trees(region)
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn prune_trees(&self, region: Region) -> Result<PruneResult> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let deleted_trees = store.prune_inactive_trees(region)?;
        Ok(PruneResult {
            region,
            deleted_trees,
        })
    }

    /// # Errors
    /// Returns an error when the tree is unknown or the swap fails.
    pub fn activate_tree(&self, tree_id: TreeId) -> Result<ActivateResult> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let retired_tree_id = store.activate_tree(tree_id)?;
        Ok(ActivateResult {
            tree_id,
            retired_tree_id,
        })
    }

    /// Resolve the rules of origin for a country and commodity code against
    /// the active tree of the configured region.
    ///
    /// # Errors
    /// Returns an error wrapping a [`ResolveError`] for invalid codes, unknown
    /// countries or commodities, a missing active tree and data-integrity
    /// failures, or an error when the store cannot be read.
    pub fn resolve(&self, request: ResolveRequest) -> Result<ResolutionPackage> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let commodity_code = CommodityCode::parse(&request.commodity_code)?;
        let country_code = self.config.canonical_country(&request.country_code);
        let region = self.config.region;
        let tree = store
            .active_tree(region)?
            .ok_or(ResolveError::NoActiveTree(region))?;

        let query = ResolveQuery {
            country_code,
            commodity_code,
            as_of: request.as_of.unwrap_or_else(OffsetDateTime::now_utc),
        };
        debug!(
            country = %query.country_code,
            commodity = %query.commodity_code,
            tree_id = %tree.id,
            "resolving rules of origin"
        );
        let documents = resolve_rules_of_origin(&store, &tree, &query, self.config.options())?;

        Ok(ResolutionPackage {
            resolution_id: compute_resolution_id(&tree, &query)?,
            generated_at: OffsetDateTime::now_utc(),
            requested_country_code: request.country_code,
            query,
            tree,
            documents,
        })
    }
}

/// SHA-256 over the tree, country, code and `as_of` of a resolution.
///
/// # Errors
/// Returns an error when `as_of` cannot be formatted.
pub fn compute_resolution_id(tree: &NomenclatureTree, query: &ResolveQuery) -> Result<String> {
    let as_of = query
        .as_of
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format as_of")?;
    let mut hasher = Sha256::new();
    for part in [
        tree.id.to_string(),
        query.country_code.clone(),
        query.commodity_code.to_string(),
        as_of,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

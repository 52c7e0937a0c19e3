//! `SQLite` storage for nomenclature trees and rules-of-origin documents.

mod dataset;

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use roo_core::{
    AncestorChain, AncestorEntry, CommodityCode, Country, DocumentId, Footnote, FootnoteId,
    HierarchyContextIds, HsRange, HsType, LinkedRule, NodeId, NodeKind,
    NomenclatureTree, Region, ResolveError, Rule, RuleId, RulesDocument, RulesSource, SubRule,
    TreeId, INTRODUCTORY_NOTES_IDENTIFIER,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

pub use dataset::{
    derive_links, Dataset, DatasetDocument, DatasetFootnote, DatasetNode, DatasetRule,
    DatasetSubRule, PreparedDataset, PreparedDocument,
};

pub const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS nomenclature_trees (
  tree_id TEXT PRIMARY KEY,
  region TEXT NOT NULL CHECK (region IN ('UK','EU')),
  start_date TEXT NOT NULL,
  end_date TEXT,
  staged INTEGER NOT NULL DEFAULT 0 CHECK (staged IN (0,1)),
  created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_nomenclature_trees_one_active
  ON nomenclature_trees(region) WHERE end_date IS NULL AND staged = 0;

CREATE TABLE IF NOT EXISTS hierarchy_nodes (
  node_id TEXT PRIMARY KEY,
  tree_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('section','chapter','heading','sub_heading','commodity')),
  code TEXT NOT NULL CHECK (length(code) = 10),
  description TEXT NOT NULL,
  parent_id TEXT,
  position INTEGER NOT NULL,
  FOREIGN KEY (tree_id) REFERENCES nomenclature_trees(tree_id) ON DELETE CASCADE,
  FOREIGN KEY (parent_id) REFERENCES hierarchy_nodes(node_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS countries (
  country_code TEXT PRIMARY KEY,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rules_documents (
  document_id TEXT PRIMARY KEY,
  tree_id TEXT NOT NULL,
  description TEXT NOT NULL,
  start_date TEXT NOT NULL,
  source_url TEXT,
  UNIQUE(tree_id, description),
  FOREIGN KEY (tree_id) REFERENCES nomenclature_trees(tree_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS rules_document_countries (
  document_id TEXT NOT NULL,
  country_code TEXT NOT NULL,
  PRIMARY KEY (document_id, country_code),
  FOREIGN KEY (document_id) REFERENCES rules_documents(document_id) ON DELETE CASCADE,
  FOREIGN KEY (country_code) REFERENCES countries(country_code)
);

CREATE TABLE IF NOT EXISTS rules (
  rule_id TEXT PRIMARY KEY,
  document_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  code TEXT NOT NULL,
  description TEXT NOT NULL,
  hs_type TEXT CHECK (hs_type IS NULL OR hs_type IN ('chapter','heading','subheading','commodity')),
  hs_from TEXT,
  hs_to TEXT,
  is_extract INTEGER NOT NULL CHECK (is_extract IN (0,1)),
  rule_text TEXT,
  alt_rule_text TEXT,
  FOREIGN KEY (document_id) REFERENCES rules_documents(document_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS subrules (
  rule_id TEXT NOT NULL,
  sub_order INTEGER NOT NULL,
  description TEXT,
  rule_text TEXT,
  alt_rule_text TEXT,
  PRIMARY KEY (rule_id, sub_order),
  FOREIGN KEY (rule_id) REFERENCES rules(rule_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS rule_links (
  rule_id TEXT NOT NULL,
  level TEXT NOT NULL CHECK (level IN ('chapter','heading','sub_heading','commodity')),
  node_id TEXT NOT NULL,
  PRIMARY KEY (rule_id, node_id),
  FOREIGN KEY (rule_id) REFERENCES rules(rule_id) ON DELETE CASCADE,
  FOREIGN KEY (node_id) REFERENCES hierarchy_nodes(node_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS footnotes (
  footnote_id TEXT PRIMARY KEY,
  document_id TEXT NOT NULL,
  identifier TEXT NOT NULL,
  number INTEGER NOT NULL,
  note TEXT NOT NULL,
  UNIQUE(document_id, identifier),
  FOREIGN KEY (document_id) REFERENCES rules_documents(document_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_hierarchy_nodes_tree_code ON hierarchy_nodes(tree_id, code);
CREATE INDEX IF NOT EXISTS idx_hierarchy_nodes_parent ON hierarchy_nodes(parent_id);
CREATE INDEX IF NOT EXISTS idx_rules_document ON rules(document_id, position);
CREATE INDEX IF NOT EXISTS idx_rule_links_node ON rule_links(node_id, level);
CREATE INDEX IF NOT EXISTS idx_rules_document_countries_country ON rules_document_countries(country_code);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Rules no hierarchy node links to; they can never be resolved.
    pub unlinked_rules: i64,
    /// Documents of active trees without a `COMM` footnote.
    pub documents_missing_introductory_notes: Vec<String>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub tree_id: TreeId,
    pub region: Region,
    pub retired_tree_id: Option<TreeId>,
    pub countries: usize,
    pub nodes: usize,
    pub documents: usize,
    pub rules: usize,
    pub links: usize,
    pub footnotes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeSummary {
    #[serde(flatten)]
    pub tree: NomenclatureTree,
    pub staged: bool,
    pub nodes: i64,
    pub documents: i64,
}

impl SqliteStore {
    /// Open a SQLite-backed rules store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            info!(version = 1, "applied schema migration");
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Import a dataset as a new nomenclature tree and make it the active
    /// tree of its region.
    ///
    /// The tree is staged, populated and activated inside one transaction;
    /// the previously active tree of the region receives an end date.
    ///
    /// # Errors
    /// Returns an error when the dataset fails validation (the underlying
    /// [`ResolveError`] stays downcastable) or any write fails, in which case
    /// nothing is imported.
    pub fn import_dataset(&mut self, dataset: &Dataset) -> Result<ImportSummary> {
        let known_countries = self.known_countries()?;
        let prepared = dataset
            .prepare(&known_countries)
            .context("dataset validation failed")?;
        let tree = &prepared.tree;

        let tx = self.conn.transaction().context("failed to start import transaction")?;
        tx.execute(
            "INSERT INTO nomenclature_trees(tree_id, region, start_date, end_date, staged, created_at)
             VALUES (?1, ?2, ?3, NULL, 1, ?4)",
            params![
                tree.id.to_string(),
                tree.region.as_str(),
                rfc3339(tree.start_date)?,
                now_rfc3339()?,
            ],
        )
        .context("failed to stage nomenclature tree")?;

        for country in &prepared.countries {
            tx.execute(
                "INSERT INTO countries(country_code, name) VALUES (?1, ?2)
                 ON CONFLICT(country_code) DO UPDATE SET name = excluded.name",
                params![country.country_code, country.name],
            )
            .with_context(|| format!("failed to upsert country {}", country.country_code))?;
        }

        for (position, node) in (0_i64..).zip(&prepared.nodes) {
            tx.execute(
                "INSERT INTO hierarchy_nodes(node_id, tree_id, kind, code, description, parent_id, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    node.id.to_string(),
                    node.tree_id.to_string(),
                    node.kind.as_str(),
                    node.code.as_str(),
                    node.description,
                    node.parent.map(|parent| parent.to_string()),
                    position,
                ],
            )
            .with_context(|| format!("failed to insert hierarchy node {}", node.code))?;
        }

        let mut summary = ImportSummary {
            tree_id: tree.id,
            region: tree.region,
            retired_tree_id: None,
            countries: prepared.countries.len(),
            nodes: prepared.nodes.len(),
            documents: prepared.documents.len(),
            rules: 0,
            links: 0,
            footnotes: 0,
        };
        let mut rule_position = 0_i64;
        for prepared_document in &prepared.documents {
            insert_document(&tx, prepared_document, &mut rule_position)?;
            summary.rules += prepared_document.rules.len();
            summary.links += prepared_document.links.len();
            summary.footnotes += prepared_document.footnotes.len();
        }

        summary.retired_tree_id = activate_in(&tx, tree.id, OffsetDateTime::now_utc())?;
        tx.commit().context("failed to commit dataset import")?;

        info!(
            tree_id = %summary.tree_id,
            region = %summary.region,
            nodes = summary.nodes,
            documents = summary.documents,
            rules = summary.rules,
            "imported dataset as active nomenclature tree"
        );
        Ok(summary)
    }

    /// Make `tree_id` the active tree of its region, ending the current one.
    ///
    /// # Errors
    /// Returns an error when the tree is unknown or the swap fails.
    pub fn activate_tree(&mut self, tree_id: TreeId) -> Result<Option<TreeId>> {
        let tx = self.conn.transaction().context("failed to start activation transaction")?;
        let retired = activate_in(&tx, tree_id, OffsetDateTime::now_utc())?;
        tx.commit().context("failed to commit tree activation")?;
        info!(tree_id = %tree_id, retired = ?retired.map(|id| id.to_string()), "activated nomenclature tree");
        Ok(retired)
    }

    /// List nomenclature trees, newest first, optionally for one region.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_trees(&self, region: Option<Region>) -> Result<Vec<TreeSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                t.tree_id, t.region, t.start_date, t.end_date, t.staged,
                (SELECT COUNT(*) FROM hierarchy_nodes n WHERE n.tree_id = t.tree_id),
                (SELECT COUNT(*) FROM rules_documents d WHERE d.tree_id = t.tree_id)
             FROM nomenclature_trees t
             WHERE ?1 IS NULL OR t.region = ?1
             ORDER BY t.start_date DESC, t.created_at DESC, t.tree_id ASC",
        )?;
        let mut rows = stmt.query(params![region.map(Region::as_str)])?;

        let mut trees = Vec::new();
        while let Some(row) = rows.next()? {
            let tree_id_raw: String = row.get(0)?;
            let region_raw: String = row.get(1)?;
            let start_date_raw: String = row.get(2)?;
            let end_date_raw: Option<String> = row.get(3)?;
            let staged: i64 = row.get(4)?;
            trees.push(TreeSummary {
                tree: NomenclatureTree {
                    id: parse_tree_id(&tree_id_raw)?,
                    region: parse_region(&region_raw)?,
                    start_date: parse_rfc3339(&start_date_raw)?,
                    end_date: end_date_raw.as_deref().map(parse_rfc3339).transpose()?,
                },
                staged: staged == 1,
                nodes: row.get(5)?,
                documents: row.get(6)?,
            });
        }
        Ok(trees)
    }

    /// Delete the ended and staged trees of `region` with everything they own.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn prune_inactive_trees(&mut self, region: Region) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start prune transaction")?;
        let deleted = tx
            .execute(
                "DELETE FROM nomenclature_trees
                 WHERE region = ?1 AND (end_date IS NOT NULL OR staged = 1)",
                params![region.as_str()],
            )
            .context("failed to delete inactive nomenclature trees")?;
        tx.commit().context("failed to commit prune")?;
        info!(region = %region, deleted, "pruned inactive nomenclature trees");
        Ok(deleted)
    }

    /// Run quick-check, foreign-key-check, schema status and rules data probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let (unlinked_rules, documents_missing_introductory_notes) =
            if schema_status.current_version >= 1 {
                (self.count_unlinked_rules()?, self.documents_missing_introductory_notes()?)
            } else {
                (0, Vec::new())
            };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            unlinked_rules,
            documents_missing_introductory_notes,
            schema_status,
        })
    }

    fn count_unlinked_rules(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM rules r
                 WHERE NOT EXISTS (SELECT 1 FROM rule_links l WHERE l.rule_id = r.rule_id)",
                [],
                |row| row.get(0),
            )
            .context("failed to count unlinked rules")
    }

    fn documents_missing_introductory_notes(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.description
             FROM rules_documents d
             JOIN nomenclature_trees t ON t.tree_id = d.tree_id
             WHERE t.end_date IS NULL AND t.staged = 0
               AND NOT EXISTS (
                 SELECT 1 FROM footnotes f
                 WHERE f.document_id = d.document_id AND f.identifier = ?1
               )
             ORDER BY d.description ASC",
        )?;
        let rows = stmt.query_map(params![INTRODUCTORY_NOTES_IDENTIFIER], |row| row.get(0))?;
        let mut descriptions = Vec::new();
        for row in rows {
            descriptions.push(row?);
        }
        Ok(descriptions)
    }

    fn known_countries(&self) -> Result<BTreeSet<String>> {
        if !table_exists(&self.conn, "countries")? {
            return Err(anyhow!("rules store is not migrated; run `db migrate` first"));
        }
        let mut stmt = self.conn.prepare("SELECT country_code FROM countries")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut codes = BTreeSet::new();
        for row in rows {
            codes.insert(row?);
        }
        Ok(codes)
    }

    fn query_active_tree(&self, region: Region) -> Result<Option<NomenclatureTree>> {
        let row = self
            .conn
            .query_row(
                "SELECT tree_id, start_date FROM nomenclature_trees
                 WHERE region = ?1 AND end_date IS NULL AND staged = 0",
                params![region.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("failed to read active nomenclature tree")?;

        row.map(|(tree_id, start_date)| {
            Ok(NomenclatureTree {
                id: parse_tree_id(&tree_id)?,
                region,
                start_date: parse_rfc3339(&start_date)?,
                end_date: None,
            })
        })
        .transpose()
    }

    fn query_country(&self, country_code: &str) -> Result<Option<Country>> {
        self.conn
            .query_row(
                "SELECT country_code, name FROM countries WHERE country_code = ?1",
                params![country_code],
                |row| {
                    Ok(Country {
                        country_code: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to read country {country_code}"))
    }

    fn query_ancestor_chain(
        &self,
        tree_id: TreeId,
        code: &CommodityCode,
    ) -> Result<Option<AncestorChain>> {
        let mut stmt = self.conn.prepare(
            "SELECT node_id, kind FROM hierarchy_nodes
             WHERE tree_id = ?1 AND code = ?2 AND kind != 'section'",
        )?;

        let mut leaf: Option<(NodeKind, String)> = None;
        for candidate in code.lookup_candidates() {
            let mut rows = stmt.query(params![tree_id.to_string(), candidate.as_str()])?;
            while let Some(row) = rows.next()? {
                let node_id: String = row.get(0)?;
                let kind = parse_node_kind(&row.get::<_, String>(1)?)?;
                if leaf.as_ref().map_or(true, |(best, _)| kind > *best) {
                    leaf = Some((kind, node_id));
                }
            }
            if leaf.is_some() {
                break;
            }
        }
        let Some((_, leaf_id)) = leaf else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "WITH RECURSIVE chain(node_id, kind, code, description, parent_id, depth) AS (
                SELECT node_id, kind, code, description, parent_id, 0
                FROM hierarchy_nodes WHERE node_id = ?1
                UNION ALL
                SELECT n.node_id, n.kind, n.code, n.description, n.parent_id, chain.depth + 1
                FROM hierarchy_nodes n JOIN chain ON n.node_id = chain.parent_id
                WHERE chain.depth < 32
             )
             SELECT node_id, kind, code, description FROM chain ORDER BY depth DESC",
        )?;
        let mut rows = stmt.query(params![leaf_id])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let code_raw: String = row.get(2)?;
            entries.push(AncestorEntry {
                id: parse_node_id(&row.get::<_, String>(0)?)?,
                kind: parse_node_kind(&row.get::<_, String>(1)?)?,
                code: CommodityCode::parse(&code_raw)
                    .with_context(|| format!("invalid stored node code {code_raw}"))?,
                description: row.get(3)?,
            });
        }
        Ok(Some(AncestorChain { entries }))
    }

    fn query_documents(&self, tree_id: TreeId, country_code: &str) -> Result<Vec<RulesDocument>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.document_id, d.description, d.start_date, d.source_url
             FROM rules_documents d
             JOIN rules_document_countries c ON c.document_id = d.document_id
             WHERE d.tree_id = ?1 AND c.country_code = ?2
             ORDER BY d.description ASC",
        )?;
        let mut rows = stmt.query(params![tree_id.to_string(), country_code])?;

        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            let document_id = parse_document_id(&row.get::<_, String>(0)?)?;
            let start_date_raw: String = row.get(2)?;
            documents.push(RulesDocument {
                id: document_id,
                tree_id,
                description: row.get(1)?,
                start_date: parse_rfc3339(&start_date_raw)?,
                country_codes: Vec::new(),
                source_url: row.get(3)?,
            });
        }

        for document in &mut documents {
            document.country_codes = self.query_document_countries(document.id)?;
        }
        Ok(documents)
    }

    fn query_document_countries(&self, document_id: DocumentId) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT country_code FROM rules_document_countries
             WHERE document_id = ?1 ORDER BY country_code ASC",
        )?;
        let rows = stmt.query_map(params![document_id.to_string()], |row| row.get(0))?;
        let mut codes = Vec::new();
        for row in rows {
            codes.push(row?);
        }
        Ok(codes)
    }

    fn query_linked_rules(
        &self,
        document_id: DocumentId,
        context: &HierarchyContextIds,
    ) -> Result<Vec<LinkedRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.rule_id, r.code, r.description, r.hs_type, r.hs_from, r.hs_to,
                    r.is_extract, r.rule_text, r.alt_rule_text
             FROM rule_links l
             JOIN rules r ON r.rule_id = l.rule_id
             WHERE r.document_id = ?1 AND l.node_id = ?2 AND l.level = ?3
             ORDER BY r.position ASC",
        )?;

        let mut linked = Vec::new();
        for (level, node_id) in context.levels() {
            let mut rows = stmt.query(params![
                document_id.to_string(),
                node_id.to_string(),
                level.as_str()
            ])?;
            while let Some(row) = rows.next()? {
                let is_extract: i64 = row.get(6)?;
                let rule = Rule {
                    id: parse_rule_id(&row.get::<_, String>(0)?)?,
                    document_id,
                    code: row.get(1)?,
                    description: row.get(2)?,
                    hs_range: range_from_columns(row.get(3)?, row.get(4)?, row.get(5)?)?,
                    is_extract: is_extract == 1,
                    rule_text: row.get(7)?,
                    alt_rule_text: row.get(8)?,
                    subrules: Vec::new(),
                };
                linked.push(LinkedRule { level, rule });
            }
        }

        for entry in &mut linked {
            entry.rule.subrules = self.query_subrules(entry.rule.id)?;
        }
        Ok(linked)
    }

    fn query_subrules(&self, rule_id: RuleId) -> Result<Vec<SubRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT sub_order, description, rule_text, alt_rule_text
             FROM subrules WHERE rule_id = ?1 ORDER BY sub_order ASC",
        )?;
        let rows = stmt.query_map(params![rule_id.to_string()], |row| {
            Ok(SubRule {
                order: row.get(0)?,
                description: row.get(1)?,
                rule_text: row.get(2)?,
                alt_rule_text: row.get(3)?,
            })
        })?;
        let mut subrules = Vec::new();
        for row in rows {
            subrules.push(row?);
        }
        Ok(subrules)
    }

    fn query_footnotes(&self, document_id: DocumentId) -> Result<Vec<Footnote>> {
        let mut stmt = self.conn.prepare(
            "SELECT footnote_id, identifier, number, note FROM footnotes
             WHERE document_id = ?1 ORDER BY number ASC, identifier ASC",
        )?;
        let mut rows = stmt.query(params![document_id.to_string()])?;
        let mut footnotes = Vec::new();
        while let Some(row) = rows.next()? {
            footnotes.push(Footnote {
                id: parse_footnote_id(&row.get::<_, String>(0)?)?,
                document_id,
                identifier: row.get(1)?,
                number: row.get(2)?,
                note: row.get(3)?,
            });
        }
        Ok(footnotes)
    }
}

impl RulesSource for SqliteStore {
    fn active_tree(&self, region: Region) -> Result<Option<NomenclatureTree>, ResolveError> {
        self.query_active_tree(region).map_err(source_error)
    }

    fn country(&self, country_code: &str) -> Result<Option<Country>, ResolveError> {
        self.query_country(country_code).map_err(source_error)
    }

    fn ancestor_chain(
        &self,
        tree_id: TreeId,
        code: &CommodityCode,
    ) -> Result<Option<AncestorChain>, ResolveError> {
        self.query_ancestor_chain(tree_id, code).map_err(source_error)
    }

    fn rules_documents(
        &self,
        tree_id: TreeId,
        country_code: &str,
    ) -> Result<Vec<RulesDocument>, ResolveError> {
        self.query_documents(tree_id, country_code).map_err(source_error)
    }

    fn linked_rules(
        &self,
        document_id: DocumentId,
        context: &HierarchyContextIds,
    ) -> Result<Vec<LinkedRule>, ResolveError> {
        self.query_linked_rules(document_id, context).map_err(source_error)
    }

    fn footnotes(&self, document_id: DocumentId) -> Result<Vec<Footnote>, ResolveError> {
        self.query_footnotes(document_id).map_err(source_error)
    }
}

fn insert_document(
    tx: &Transaction<'_>,
    prepared: &PreparedDocument,
    rule_position: &mut i64,
) -> Result<()> {
    let document = &prepared.document;
    tx.execute(
        "INSERT INTO rules_documents(document_id, tree_id, description, start_date, source_url)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            document.id.to_string(),
            document.tree_id.to_string(),
            document.description,
            rfc3339(document.start_date)?,
            document.source_url,
        ],
    )
    .with_context(|| format!("failed to insert rules document `{}`", document.description))?;

    for country_code in &document.country_codes {
        tx.execute(
            "INSERT OR IGNORE INTO rules_document_countries(document_id, country_code) VALUES (?1, ?2)",
            params![document.id.to_string(), country_code],
        )
        .with_context(|| format!("failed to attach country {country_code}"))?;
    }

    for rule in &prepared.rules {
        let range = rule.hs_range.as_ref();
        tx.execute(
            "INSERT INTO rules(
                rule_id, document_id, position, code, description, hs_type, hs_from, hs_to,
                is_extract, rule_text, alt_rule_text
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                rule.id.to_string(),
                rule.document_id.to_string(),
                *rule_position,
                rule.code,
                rule.description,
                range.map(|range| range.hs_type.as_str()),
                range.map(|range| range.hs_from.as_str()),
                range.and_then(|range| range.hs_to.as_deref()),
                i64::from(rule.is_extract),
                rule.rule_text,
                rule.alt_rule_text,
            ],
        )
        .with_context(|| format!("failed to insert rule `{}`", rule.code))?;
        *rule_position += 1;

        for subrule in &rule.subrules {
            tx.execute(
                "INSERT INTO subrules(rule_id, sub_order, description, rule_text, alt_rule_text)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    rule.id.to_string(),
                    subrule.order,
                    subrule.description,
                    subrule.rule_text,
                    subrule.alt_rule_text,
                ],
            )
            .with_context(|| format!("failed to insert subrule {} of `{}`", subrule.order, rule.code))?;
        }
    }

    for link in &prepared.links {
        tx.execute(
            "INSERT OR IGNORE INTO rule_links(rule_id, level, node_id) VALUES (?1, ?2, ?3)",
            params![link.rule_id.to_string(), link.level.as_str(), link.node_id.to_string()],
        )
        .context("failed to insert rule link")?;
    }

    for footnote in &prepared.footnotes {
        tx.execute(
            "INSERT INTO footnotes(footnote_id, document_id, identifier, number, note)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                footnote.id.to_string(),
                footnote.document_id.to_string(),
                footnote.identifier,
                footnote.number,
                footnote.note,
            ],
        )
        .with_context(|| format!("failed to insert footnote {}", footnote.identifier))?;
    }

    if !prepared
        .footnotes
        .iter()
        .any(Footnote::is_introductory_notes)
    {
        warn!(document = %document.description, "rules document has no introductory notes");
    }
    Ok(())
}

fn activate_in(tx: &Transaction<'_>, tree_id: TreeId, at: OffsetDateTime) -> Result<Option<TreeId>> {
    let region: String = tx
        .query_row(
            "SELECT region FROM nomenclature_trees WHERE tree_id = ?1",
            params![tree_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read nomenclature tree")?
        .ok_or_else(|| anyhow!("nomenclature tree not found: {tree_id}"))?;

    let retired: Option<String> = tx
        .query_row(
            "SELECT tree_id FROM nomenclature_trees
             WHERE region = ?1 AND end_date IS NULL AND staged = 0 AND tree_id != ?2",
            params![region, tree_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read active nomenclature tree")?;

    if let Some(retired) = &retired {
        tx.execute(
            "UPDATE nomenclature_trees SET end_date = ?1 WHERE tree_id = ?2",
            params![rfc3339(at)?, retired],
        )
        .context("failed to end previous nomenclature tree")?;
    }
    tx.execute(
        "UPDATE nomenclature_trees SET staged = 0, end_date = NULL WHERE tree_id = ?1",
        params![tree_id.to_string()],
    )
    .context("failed to activate nomenclature tree")?;

    retired.as_deref().map(parse_tree_id).transpose()
}

fn range_from_columns(
    hs_type: Option<String>,
    hs_from: Option<String>,
    hs_to: Option<String>,
) -> Result<Option<HsRange>> {
    let Some(hs_from) = hs_from else {
        return Ok(None);
    };
    let hs_type = match hs_type {
        Some(raw) => HsType::parse(&raw).ok_or_else(|| anyhow!("unknown hs_type: {raw}"))?,
        None => HsType::from_width(hs_from.len())
            .ok_or_else(|| anyhow!("unsupported hs_from width: {hs_from}"))?,
    };
    Ok(Some(HsRange {
        hs_type,
        hs_from,
        hs_to,
    }))
}

fn source_error(err: anyhow::Error) -> ResolveError {
    ResolveError::Source(format!("{err:#}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_region(raw: &str) -> Result<Region> {
    Region::parse(raw).ok_or_else(|| anyhow!("unknown region: {raw}"))
}

fn parse_node_kind(raw: &str) -> Result<NodeKind> {
    NodeKind::parse(raw).ok_or_else(|| anyhow!("unknown node kind: {raw}"))
}

fn parse_tree_id(raw: &str) -> Result<TreeId> {
    raw.parse().with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_node_id(raw: &str) -> Result<NodeId> {
    raw.parse().with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_document_id(raw: &str) -> Result<DocumentId> {
    raw.parse().with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_rule_id(raw: &str) -> Result<RuleId> {
    raw.parse().with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_footnote_id(raw: &str) -> Result<FootnoteId> {
    raw.parse().with_context(|| format!("invalid ULID: {raw}"))
}

#[cfg(test)]
mod tests {
    use roo_core::{resolve_rules_of_origin, HierarchyLevel, ResolveQuery, ResolverOptions};
    use time::macros::datetime;

    use super::*;
    use crate::dataset::tests::SAMPLE_DATASET;

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn sample() -> Result<Dataset> {
        serde_json::from_str(SAMPLE_DATASET).context("sample dataset should parse")
    }

    fn query(code: &str) -> Result<ResolveQuery> {
        Ok(ResolveQuery {
            country_code: "KA".to_string(),
            commodity_code: CommodityCode::parse(code)?,
            as_of: datetime!(2022-01-01 00:00 UTC),
        })
    }

    // Test IDs: STORE-001
    #[test]
    fn migrate_reports_schema_versions() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn import_requires_migrated_schema() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        assert!(store.import_dataset(&sample()?).is_err());
        Ok(())
    }

    // Test IDs: STORE-002
    #[test]
    fn imported_dataset_resolves_through_the_store() -> Result<()> {
        let mut store = migrated_store()?;
        let summary = store.import_dataset(&sample()?)?;
        assert_eq!(summary.nodes, 6);
        assert_eq!(summary.documents, 1);
        assert_eq!(summary.rules, 4);
        assert_eq!(summary.retired_tree_id, None);

        let tree = store
            .active_tree(Region::Uk)?
            .ok_or_else(|| anyhow!("expected an active tree"))?;
        assert_eq!(tree.id, summary.tree_id);

        let resolved = resolve_rules_of_origin(
            &store,
            &tree,
            &query("0101210000")?,
            ResolverOptions::default(),
        )?;
        let document = resolved
            .get("Rules for Kaland")
            .ok_or_else(|| anyhow!("expected rules for Kaland"))?;
        let codes: Vec<&str> = document.rules.iter().map(|rule| rule.rule.code.as_str()).collect();
        assert_eq!(codes, vec!["Chapter 01", "0101.21"]);
        assert_eq!(
            document.rules[0].rule_text.as_deref(),
            Some("Wholly obtained <sup>1)</sup>")
        );
        assert_eq!(
            document.rules[1].subrules[0].description.as_deref(),
            Some("Sub <sup>1)</sup>")
        );
        assert_eq!(document.footnotes.len(), 1);
        assert_eq!(
            document.footnotes[0].note,
            "See Introductory Note 3 (below)"
        );
        assert_eq!(document.introductory_notes.note, "Introductory notes");
        Ok(())
    }

    #[test]
    fn heading_lookup_uses_enclosing_node_and_extract_rules() -> Result<()> {
        let mut store = migrated_store()?;
        store.import_dataset(&sample()?)?;
        let tree = store
            .active_tree(Region::Uk)?
            .ok_or_else(|| anyhow!("expected an active tree"))?;

        let resolved =
            resolve_rules_of_origin(&store, &tree, &query("0102")?, ResolverOptions::default())?;
        let codes: Vec<&str> = resolved
            .get("Rules for Kaland")
            .map(|document| document.rules.iter().map(|rule| rule.rule.code.as_str()).collect())
            .unwrap_or_default();
        assert_eq!(codes, vec!["Chapter 01", "ex 0101", "explicit"]);

        let missing = resolve_rules_of_origin(&store, &tree, &query("0201")?, ResolverOptions::default());
        assert!(matches!(missing, Err(ResolveError::CommodityNotFound { .. })));
        Ok(())
    }

    // Test IDs: STORE-003
    #[test]
    fn reimport_swaps_active_tree_and_prune_removes_old_one() -> Result<()> {
        let mut store = migrated_store()?;
        let first = store.import_dataset(&sample()?)?;
        let second = store.import_dataset(&sample()?)?;
        assert_eq!(second.retired_tree_id, Some(first.tree_id));

        let trees = store.list_trees(Some(Region::Uk))?;
        assert_eq!(trees.len(), 2);
        let active: Vec<TreeId> = trees
            .iter()
            .filter(|summary| summary.tree.is_active() && !summary.staged)
            .map(|summary| summary.tree.id)
            .collect();
        assert_eq!(active, vec![second.tree_id]);

        assert_eq!(store.prune_inactive_trees(Region::Eu)?, 0);
        assert_eq!(store.prune_inactive_trees(Region::Uk)?, 1);
        let remaining = store.list_trees(None)?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].nodes, 6);
        assert_eq!(remaining[0].documents, 1);

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        Ok(())
    }

    #[test]
    fn activate_tree_restores_previous_version() -> Result<()> {
        let mut store = migrated_store()?;
        let first = store.import_dataset(&sample()?)?;
        let second = store.import_dataset(&sample()?)?;

        let retired = store.activate_tree(first.tree_id)?;
        assert_eq!(retired, Some(second.tree_id));
        let active = store.active_tree(Region::Uk)?.map(|tree| tree.id);
        assert_eq!(active, Some(first.tree_id));
        assert!(store.activate_tree(TreeId::new()).is_err());
        Ok(())
    }

    // Test IDs: STORE-004
    #[test]
    fn invalid_dataset_leaves_store_untouched() -> Result<()> {
        let mut store = migrated_store()?;
        let mut dataset = sample()?;
        dataset.documents[0].countries = vec!["ZZ".to_string()];

        let err = match store.import_dataset(&dataset) {
            Ok(summary) => panic!("expected validation failure, imported {summary:?}"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<ResolveError>(),
            Some(ResolveError::Validation(_))
        ));
        assert!(store.list_trees(None)?.is_empty());
        Ok(())
    }

    #[test]
    fn integrity_reports_documents_without_introductory_notes() -> Result<()> {
        let mut store = migrated_store()?;
        let mut dataset = sample()?;
        dataset.documents[0]
            .footnotes
            .retain(|footnote| footnote.identifier != INTRODUCTORY_NOTES_IDENTIFIER);
        store.import_dataset(&dataset)?;

        let report = store.integrity_check()?;
        assert_eq!(
            report.documents_missing_introductory_notes,
            vec!["Rules for Kaland".to_string()]
        );
        assert_eq!(report.unlinked_rules, 0);
        Ok(())
    }

    #[test]
    fn stored_rules_keep_ranges_and_levels() -> Result<()> {
        let mut store = migrated_store()?;
        store.import_dataset(&sample()?)?;
        let tree = store
            .active_tree(Region::Uk)?
            .ok_or_else(|| anyhow!("expected an active tree"))?;
        let chain = store
            .ancestor_chain(tree.id, &CommodityCode::parse("0101210000")?)?
            .ok_or_else(|| anyhow!("expected a chain"))?;
        let kinds: Vec<NodeKind> = chain.entries.iter().map(|entry| entry.kind).collect();
        assert_eq!(
            kinds,
            vec![
                NodeKind::Section,
                NodeKind::Chapter,
                NodeKind::Heading,
                NodeKind::SubHeading,
                NodeKind::Commodity
            ]
        );

        let documents = store.rules_documents(tree.id, "KA")?;
        let context = chain.context_ids()?;
        let linked = store.linked_rules(documents[0].id, &context)?;
        let levels: Vec<HierarchyLevel> = linked.iter().map(|entry| entry.level).collect();
        assert_eq!(
            levels,
            vec![
                HierarchyLevel::Chapter,
                HierarchyLevel::Heading,
                HierarchyLevel::SubHeading,
                HierarchyLevel::Commodity
            ]
        );
        assert_eq!(
            linked[1].rule.hs_range.as_ref().map(|range| range.hs_type),
            Some(HsType::Heading)
        );
        assert_eq!(documents[0].country_codes, vec!["KA".to_string()]);
        Ok(())
    }
}

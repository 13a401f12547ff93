use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use taxokernel_core::{
    evaluate_grade, ChecklistId, ConsensusOutcome, Grade, IdentificationId, Lineage, NewTaxon,
    ObservationMetadata, QualityAssessment, QualityFlags, Resolution, Taxon, TaxonColumn,
    TaxonMatcher, TaxonQuery, TaxonRank, TaxonomicStatus, TaxonomyError, TaxonomyStore, CONSENSUS_THRESHOLD,
};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS taxa (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  scientific_name TEXT NOT NULL CHECK (length(trim(scientific_name)) > 0),
  taxon_rank TEXT NOT NULL CHECK (taxon_rank IN (
    'KINGDOM','PHYLUM','SUBPHYLUM','CLASS','SUBCLASS','ORDER','FAMILY',
    'GENUS','SPECIES','SUBSPECIES','VARIETY','FORM','UNKNOWN'
  )),
  taxonomic_status TEXT NOT NULL CHECK (taxonomic_status IN ('ACCEPTED','SYNONYM','UNKNOWN')),
  accepted_scientific_name TEXT,
  kingdom TEXT,
  phylum TEXT,
  class TEXT,
  "order" TEXT,
  family TEXT,
  genus TEXT,
  species TEXT,
  subspecies TEXT,
  variety TEXT,
  form TEXT,
  created_at TEXT NOT NULL,
  CHECK (taxonomic_status <> 'SYNONYM' OR accepted_scientific_name IS NOT NULL)
);

CREATE TABLE IF NOT EXISTS checklists (
  checklist_id TEXT PRIMARY KEY,
  taxon_id INTEGER NOT NULL,
  scientific_name TEXT NOT NULL,
  user_id TEXT NOT NULL CHECK (length(trim(user_id)) > 0),
  latitude REAL CHECK (latitude IS NULL OR (latitude BETWEEN -90 AND 90)),
  longitude REAL CHECK (longitude IS NULL OR (longitude BETWEEN -180 AND 180)),
  observed_on TEXT,
  media_count INTEGER NOT NULL DEFAULT 0 CHECK (media_count >= 0),
  notes TEXT,
  agreement_count INTEGER NOT NULL DEFAULT 0 CHECK (agreement_count >= 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (taxon_id) REFERENCES taxa(id)
);

CREATE TABLE IF NOT EXISTS identifications (
  identification_id TEXT PRIMARY KEY,
  checklist_id TEXT NOT NULL,
  user_id TEXT NOT NULL CHECK (length(trim(user_id)) > 0),
  taxon_id INTEGER,
  identification_level TEXT,
  comment TEXT,
  is_first INTEGER NOT NULL DEFAULT 0 CHECK (is_first IN (0,1)),
  is_agreed INTEGER CHECK (is_agreed IS NULL OR is_agreed IN (0,1)),
  agrees_with_id TEXT,
  is_withdrawn INTEGER NOT NULL DEFAULT 0 CHECK (is_withdrawn IN (0,1)),
  created_at TEXT NOT NULL,
  CHECK (agrees_with_id IS NULL OR agrees_with_id <> identification_id),
  CHECK (is_agreed IS NULL OR agrees_with_id IS NOT NULL),
  CHECK (taxon_id IS NOT NULL OR is_agreed = 0),
  FOREIGN KEY (checklist_id) REFERENCES checklists(checklist_id),
  FOREIGN KEY (taxon_id) REFERENCES taxa(id),
  FOREIGN KEY (agrees_with_id) REFERENCES identifications(identification_id)
);

CREATE TABLE IF NOT EXISTS quality_assessments (
  checklist_id TEXT PRIMARY KEY,
  has_date INTEGER NOT NULL CHECK (has_date IN (0,1)),
  has_location INTEGER NOT NULL CHECK (has_location IN (0,1)),
  has_media INTEGER NOT NULL CHECK (has_media IN (0,1)),
  is_wild INTEGER NOT NULL CHECK (is_wild IN (0,1)),
  location_accurate INTEGER NOT NULL CHECK (location_accurate IN (0,1)),
  recent_evidence INTEGER NOT NULL CHECK (recent_evidence IN (0,1)),
  related_evidence INTEGER NOT NULL CHECK (related_evidence IN (0,1)),
  needs_id INTEGER NOT NULL CHECK (needs_id IN (0,1)),
  can_be_improved INTEGER CHECK (can_be_improved IS NULL OR can_be_improved IN (0,1)),
  community_id_level TEXT,
  grade TEXT NOT NULL CHECK (grade IN ('research grade','low quality ID','needs ID','casual')),
  agreement_count INTEGER NOT NULL CHECK (agreement_count >= 0),
  total_identifications INTEGER NOT NULL CHECK (total_identifications >= 0),
  updated_at TEXT NOT NULL,
  CHECK (community_id_level IS NULL OR agreement_count >= 2),
  FOREIGN KEY (checklist_id) REFERENCES checklists(checklist_id)
);

CREATE TABLE IF NOT EXISTS identification_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  checklist_id TEXT NOT NULL,
  taxon_id INTEGER NOT NULL,
  user_id TEXT NOT NULL,
  action_type TEXT NOT NULL CHECK (action_type IN ('consensus_change')),
  scientific_name TEXT NOT NULL,
  previous_name TEXT,
  reason TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (checklist_id) REFERENCES checklists(checklist_id),
  FOREIGN KEY (taxon_id) REFERENCES taxa(id)
);

CREATE TABLE IF NOT EXISTS location_verifications (
  checklist_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  verdict INTEGER NOT NULL CHECK (verdict IN (0,1)),
  comment TEXT,
  created_at TEXT NOT NULL,
  PRIMARY KEY (checklist_id, user_id),
  FOREIGN KEY (checklist_id) REFERENCES checklists(checklist_id)
);

CREATE TABLE IF NOT EXISTS checklist_comments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  checklist_id TEXT NOT NULL,
  user_id TEXT NOT NULL CHECK (length(trim(user_id)) > 0),
  body TEXT NOT NULL CHECK (length(trim(body)) > 0 AND length(body) <= 1000),
  created_at TEXT NOT NULL,
  FOREIGN KEY (checklist_id) REFERENCES checklists(checklist_id)
);

CREATE TABLE IF NOT EXISTS wild_status_votes (
  checklist_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  verdict INTEGER NOT NULL CHECK (verdict IN (0,1)),
  comment TEXT,
  created_at TEXT NOT NULL,
  PRIMARY KEY (checklist_id, user_id),
  FOREIGN KEY (checklist_id) REFERENCES checklists(checklist_id)
);

CREATE INDEX IF NOT EXISTS idx_taxa_scientific_name ON taxa(scientific_name);
CREATE INDEX IF NOT EXISTS idx_taxa_genus_species ON taxa(genus, species);
CREATE INDEX IF NOT EXISTS idx_taxa_accepted_name ON taxa(accepted_scientific_name);
CREATE INDEX IF NOT EXISTS idx_identifications_checklist ON identifications(checklist_id);
CREATE INDEX IF NOT EXISTS idx_identifications_agrees_with ON identifications(agrees_with_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_identifications_single_first
  ON identifications(checklist_id) WHERE is_first = 1;
CREATE UNIQUE INDEX IF NOT EXISTS idx_identifications_single_agreement
  ON identifications(checklist_id, user_id, agrees_with_id)
  WHERE is_agreed = 1 AND is_withdrawn = 0;
CREATE INDEX IF NOT EXISTS idx_history_checklist ON identification_history(checklist_id);
CREATE INDEX IF NOT EXISTS idx_comments_checklist ON checklist_comments(checklist_id);
CREATE INDEX IF NOT EXISTS idx_checklists_user ON checklists(user_id, created_at);
"#;

const TAXON_SELECT_SQL: &str = r#"SELECT
    id, scientific_name, taxon_rank, taxonomic_status, accepted_scientific_name,
    kingdom, phylum, class, "order", family, genus, species, subspecies, variety, form
 FROM taxa"#;

const IDENTIFICATION_SELECT_SQL: &str = r"SELECT
    i.identification_id, i.checklist_id, i.user_id, i.taxon_id, t.scientific_name,
    i.identification_level, i.comment, i.is_first, i.is_agreed, i.agrees_with_id,
    i.is_withdrawn, i.created_at,
    (SELECT COUNT(*) FROM identifications a
      WHERE a.agrees_with_id = i.identification_id AND a.is_agreed = 1 AND a.is_withdrawn = 0)
 FROM identifications i
 LEFT JOIN taxa t ON t.id = i.taxon_id";

const MAX_COMMENT_CHARS: usize = 1000;
const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 100;

const CONSENSUS_ACTION: &str = "consensus_change";
const CONSENSUS_REASON: &str = "community agreement reached";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
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
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checklist {
    pub checklist_id: ChecklistId,
    pub taxon_id: i64,
    pub scientific_name: String,
    pub user_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub observed_on: Option<String>,
    pub media_count: u32,
    pub notes: Option<String>,
    pub agreement_count: u32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identification {
    pub identification_id: IdentificationId,
    pub checklist_id: ChecklistId,
    pub user_id: String,
    pub taxon_id: Option<i64>,
    pub scientific_name: Option<String>,
    pub identification_level: Option<String>,
    pub comment: Option<String>,
    pub is_first: bool,
    /// `Some(true)` agreement, `Some(false)` disagreement, `None` assertion.
    pub is_agreed: Option<bool>,
    pub agrees_with_id: Option<IdentificationId>,
    pub is_withdrawn: bool,
    /// Live agreements targeting this identification.
    pub agreement_count: u32,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommunityVote {
    pub user_id: String,
    pub verdict: bool,
    pub comment: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub taxon_id: i64,
    pub user_id: String,
    pub action_type: String,
    pub scientific_name: String,
    pub previous_name: Option<String>,
    pub reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChecklistDetail {
    pub checklist: Checklist,
    pub identifications: Vec<Identification>,
    pub assessment: QualityAssessment,
    pub location_verifications: Vec<CommunityVote>,
    pub wild_status_votes: Vec<CommunityVote>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedChecklist {
    pub checklist_id: ChecklistId,
    pub identification_id: IdentificationId,
    pub assessment: QualityAssessment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddedIdentification {
    pub identification_id: IdentificationId,
    pub assessment: QualityAssessment,
}

/// Optional proposal attached to a disagreement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Disagreement {
    pub taxon_id: Option<i64>,
    pub identification_level: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub id: i64,
    pub checklist_id: ChecklistId,
    pub user_id: String,
    pub body: String,
    pub created_at: String,
}

/// Filter for [`SqliteStore::list_checklists`]. A zero `limit` means the default page size.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecklistFilter {
    pub user_id: Option<String>,
    pub grade: Option<Grade>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChecklistSummary {
    pub checklist: Checklist,
    pub grade: Grade,
    pub community_id_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoteKind {
    Location,
    WildStatus,
}

impl VoteKind {
    fn table(self) -> &'static str {
        match self {
            Self::Location => "location_verifications",
            Self::WildStatus => "wild_status_votes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LevelUpdate {
    Keep,
    Clear,
    Set(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GradeUpdate {
    Evaluate,
    ResetNeedsId,
}

impl SqliteStore {
    /// Open a SQLite-backed taxonomy store and configure required runtime pragmas.
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
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
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

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            if table_exists(&self.conn, "taxa")? {
                // Tables present without migration records.
                record_schema_version(&self.conn, 1)?;
            } else {
                self.apply_migration_1()?;
            }
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        tracing::info!(version = 1, "applied taxonomy schema migration");
        Ok(())
    }

    /// Insert one validated taxon row.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert is rejected.
    pub fn add_taxon(&mut self, taxon: &NewTaxon) -> Result<Taxon> {
        taxon.validate()?;
        insert_taxon_row(&self.conn, taxon)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_taxon(&self, taxon_id: i64) -> Result<Option<Taxon>> {
        load_taxon(&self.conn, taxon_id)
    }

    /// Create a checklist, its originating identification and its initial assessment in
    /// one transaction.
    ///
    /// # Errors
    /// Returns an error when metadata is invalid, the taxon does not exist, or any write
    /// fails. Nothing is persisted on error.
    pub fn create_checklist_with_identification(
        &mut self,
        taxon_id: i64,
        user_id: &str,
        metadata: &ObservationMetadata,
    ) -> Result<CreatedChecklist> {
        metadata.validate()?;
        require_user(user_id)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start checklist transaction")?;
        let created = insert_checklist(&tx, taxon_id, user_id, metadata)?;
        tx.commit().context("failed to commit checklist transaction")?;
        Ok(created)
    }

    /// Resolve a taxon and create the checklist for it in one transaction. Taxa the
    /// resolver inserts are rolled back together with the checklist when any step fails.
    ///
    /// # Errors
    /// Returns an error when metadata or `user_id` is invalid, `resolve` fails, or any
    /// write fails. Nothing is persisted on error.
    pub fn create_observation_with<F>(
        &mut self,
        user_id: &str,
        metadata: &ObservationMetadata,
        resolve: F,
    ) -> Result<(Resolution, CreatedChecklist)>
    where
        F: FnOnce(&mut dyn TaxonomyStore) -> Result<Resolution, TaxonomyError>,
    {
        metadata.validate()?;
        require_user(user_id)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start observation transaction")?;
        let resolution = resolve(&mut TxTaxonomy(&tx))?;
        let created = insert_checklist(&tx, resolution.taxon_id, user_id, metadata)?;
        tx.commit().context("failed to commit observation transaction")?;
        Ok((resolution, created))
    }

    /// Add an independent identification (a new assertion) to a checklist.
    ///
    /// # Errors
    /// Returns an error when the checklist or taxon does not exist or a write fails.
    pub fn add_identification(
        &mut self,
        checklist_id: ChecklistId,
        user_id: &str,
        taxon_id: i64,
        comment: Option<&str>,
    ) -> Result<AddedIdentification> {
        require_user(user_id)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start identification transaction")?;
        require_checklist(&tx, checklist_id)?;
        let taxon = require_taxon(&tx, taxon_id)?;
        let identification_id = IdentificationId::new();

        tx.execute(
            "INSERT INTO identifications(
                identification_id, checklist_id, user_id, taxon_id, identification_level,
                comment, is_first, is_agreed, agrees_with_id, is_withdrawn, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL, NULL, 0, ?7)",
            params![
                identification_id.to_string(),
                checklist_id.to_string(),
                user_id,
                taxon.id,
                taxon.taxon_rank.level_str(),
                comment,
                now_rfc3339()?,
            ],
        )
        .context("failed to insert identification")?;

        let assessment =
            refresh_assessment(&tx, checklist_id, LevelUpdate::Keep, GradeUpdate::Evaluate)?;
        tx.commit().context("failed to commit identification transaction")?;
        Ok(AddedIdentification { identification_id, assessment })
    }

    /// Record `user_id` agreeing with an assertion. Reaching consensus reassigns the
    /// checklist taxon and sets the community level.
    ///
    /// # Errors
    /// Returns [`TaxonomyError::DuplicateAgreement`] or
    /// [`TaxonomyError::ConsistencyViolation`] (inside `anyhow`) for rejected events, or
    /// an error when a write fails.
    pub fn record_agreement(
        &mut self,
        checklist_id: ChecklistId,
        identification_id: IdentificationId,
        user_id: &str,
    ) -> Result<QualityAssessment> {
        require_user(user_id)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start agreement transaction")?;
        let checklist = require_checklist(&tx, checklist_id)?;
        let target = require_live_assertion(&tx, checklist_id, identification_id)?;

        let already_agreed: bool = tx
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM identifications
                    WHERE agrees_with_id = ?1 AND user_id = ?2 AND is_agreed = 1 AND is_withdrawn = 0
                 )",
                params![identification_id.to_string(), user_id],
                |row| row.get(0),
            )
            .context("failed to check existing agreement")?;
        if already_agreed {
            return Err(TaxonomyError::DuplicateAgreement {
                user_id: user_id.to_string(),
                identification_id: identification_id.to_string(),
            }
            .into());
        }

        let now = now_rfc3339()?;
        tx.execute(
            "INSERT INTO identifications(
                identification_id, checklist_id, user_id, taxon_id, identification_level,
                comment, is_first, is_agreed, agrees_with_id, is_withdrawn, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0, 1, ?6, 0, ?7)",
            params![
                IdentificationId::new().to_string(),
                checklist_id.to_string(),
                user_id,
                target.taxon_id,
                target.identification_level,
                identification_id.to_string(),
                now,
            ],
        )
        .context("failed to insert agreement")?;

        let target_agreements = count_target_agreements(&tx, identification_id)?;
        let level = match ConsensusOutcome::from_agreements(target_agreements) {
            ConsensusOutcome::Reached => {
                let taxon_id = target
                    .taxon_id
                    .ok_or_else(|| anyhow!("assertion {identification_id} has no taxon"))?;
                let taxon = require_taxon(&tx, taxon_id)?;
                tx.execute(
                    "INSERT INTO identification_history(
                        checklist_id, taxon_id, user_id, action_type, scientific_name,
                        previous_name, reason, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        checklist_id.to_string(),
                        taxon.id,
                        user_id,
                        CONSENSUS_ACTION,
                        taxon.scientific_name,
                        checklist.scientific_name,
                        CONSENSUS_REASON,
                        now,
                    ],
                )
                .context("failed to append identification history")?;
                tx.execute(
                    "UPDATE checklists SET taxon_id = ?2, scientific_name = ?3, updated_at = ?4
                     WHERE checklist_id = ?1",
                    params![checklist_id.to_string(), taxon.id, taxon.scientific_name, now],
                )
                .context("failed to reassign checklist taxon")?;
                if checklist.taxon_id != taxon.id {
                    tracing::info!(
                        checklist_id = %checklist_id,
                        from = %checklist.scientific_name,
                        to = %taxon.scientific_name,
                        agreements = target_agreements,
                        "consensus reassigned checklist taxon"
                    );
                }
                ConsensusOutcome::Reached
                    .community_level(target.identification_level.as_deref().unwrap_or_default())
                    .map_or(LevelUpdate::Clear, LevelUpdate::Set)
            }
            // Another assertion may still hold consensus.
            ConsensusOutcome::BelowThreshold => LevelUpdate::Keep,
        };

        let assessment = refresh_assessment(&tx, checklist_id, level, GradeUpdate::Evaluate)?;
        tx.commit().context("failed to commit agreement transaction")?;
        Ok(assessment)
    }

    /// Record a disagreement with an assertion, optionally proposing another taxon. The
    /// checklist taxon is left unchanged.
    ///
    /// # Errors
    /// Returns [`TaxonomyError::ConsistencyViolation`] (inside `anyhow`) when the target is
    /// not a live assertion of the checklist, or an error when a write fails.
    pub fn record_disagreement(
        &mut self,
        checklist_id: ChecklistId,
        identification_id: IdentificationId,
        user_id: &str,
        proposal: &Disagreement,
    ) -> Result<QualityAssessment> {
        require_user(user_id)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start disagreement transaction")?;
        require_checklist(&tx, checklist_id)?;
        require_live_assertion(&tx, checklist_id, identification_id)?;

        let level = match proposal.taxon_id {
            Some(taxon_id) => {
                let taxon = require_taxon(&tx, taxon_id)?;
                Some(proposal.identification_level.clone().unwrap_or_else(|| taxon.taxon_rank.level_str()))
            }
            None => proposal.identification_level.clone(),
        };

        tx.execute(
            "INSERT INTO identifications(
                identification_id, checklist_id, user_id, taxon_id, identification_level,
                comment, is_first, is_agreed, agrees_with_id, is_withdrawn, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, 0, ?8)",
            params![
                IdentificationId::new().to_string(),
                checklist_id.to_string(),
                user_id,
                proposal.taxon_id,
                level,
                proposal.comment,
                identification_id.to_string(),
                now_rfc3339()?,
            ],
        )
        .context("failed to insert disagreement")?;

        let assessment =
            refresh_assessment(&tx, checklist_id, LevelUpdate::Keep, GradeUpdate::Evaluate)?;
        tx.commit().context("failed to commit disagreement transaction")?;
        Ok(assessment)
    }

    /// Withdraw the caller's own identification and drop every agreement edge pointing
    /// at it. The assessment falls back to `needs ID`.
    ///
    /// # Errors
    /// Returns [`TaxonomyError::ConsistencyViolation`] (inside `anyhow`) when the
    /// identification is missing, already withdrawn, or owned by someone else.
    pub fn withdraw(
        &mut self,
        checklist_id: ChecklistId,
        identification_id: IdentificationId,
        user_id: &str,
    ) -> Result<QualityAssessment> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start withdraw transaction")?;
        require_checklist(&tx, checklist_id)?;
        let identification = load_identification(&tx, checklist_id, identification_id)?
            .ok_or_else(|| violation(format!("identification {identification_id} not found")))?;
        if identification.user_id != user_id {
            return Err(violation(format!(
                "identification {identification_id} can only be withdrawn by its owner"
            )));
        }
        if identification.is_withdrawn {
            return Err(violation(format!("identification {identification_id} is already withdrawn")));
        }

        tx.execute(
            "UPDATE identifications SET is_withdrawn = 1 WHERE identification_id = ?1",
            params![identification_id.to_string()],
        )
        .context("failed to withdraw identification")?;
        let removed = tx
            .execute(
                "DELETE FROM identifications WHERE agrees_with_id = ?1",
                params![identification_id.to_string()],
            )
            .context("failed to delete dependent identifications")?;

        let assessment =
            refresh_assessment(&tx, checklist_id, LevelUpdate::Clear, GradeUpdate::ResetNeedsId)?;
        tx.commit().context("failed to commit withdraw transaction")?;

        tracing::info!(
            checklist_id = %checklist_id,
            identification_id = %identification_id,
            removed_edges = removed,
            "identification withdrawn"
        );
        Ok(assessment)
    }

    /// Remove `user_id`'s agreement with `identification_id`.
    ///
    /// # Errors
    /// Returns [`TaxonomyError::ConsistencyViolation`] (inside `anyhow`) when no such
    /// agreement exists.
    pub fn cancel_agreement(
        &mut self,
        checklist_id: ChecklistId,
        identification_id: IdentificationId,
        user_id: &str,
    ) -> Result<QualityAssessment> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start cancel agreement transaction")?;
        require_checklist(&tx, checklist_id)?;
        let (leading_before, _) = consensus_counts(&tx, checklist_id)?;

        let removed = tx
            .execute(
                "DELETE FROM identifications
                 WHERE checklist_id = ?1 AND agrees_with_id = ?2 AND user_id = ?3
                   AND is_agreed = 1 AND is_withdrawn = 0",
                params![checklist_id.to_string(), identification_id.to_string(), user_id],
            )
            .context("failed to delete agreement")?;
        if removed == 0 {
            return Err(violation(format!(
                "user {user_id} has no agreement with identification {identification_id}"
            )));
        }

        let (leading_after, _) = consensus_counts(&tx, checklist_id)?;
        let remaining = count_target_agreements(&tx, identification_id)?;
        let assessment = if leading_after < CONSENSUS_THRESHOLD
            && leading_before >= CONSENSUS_THRESHOLD
        {
            refresh_assessment(&tx, checklist_id, LevelUpdate::Clear, GradeUpdate::ResetNeedsId)?
        } else {
            let level = if remaining >= CONSENSUS_THRESHOLD {
                load_identification(&tx, checklist_id, identification_id)?
                    .and_then(|target| target.identification_level)
                    .map_or(LevelUpdate::Keep, LevelUpdate::Set)
            } else {
                LevelUpdate::Keep
            };
            refresh_assessment(&tx, checklist_id, level, GradeUpdate::Evaluate)?
        };
        tx.commit().context("failed to commit cancel agreement transaction")?;

        tracing::info!(
            checklist_id = %checklist_id,
            identification_id = %identification_id,
            remaining,
            "agreement cancelled"
        );
        Ok(assessment)
    }

    /// Record a location-accuracy verdict; the majority drives `location_accurate`.
    ///
    /// # Errors
    /// Returns an error when the checklist does not exist or a write fails.
    pub fn verify_location(
        &mut self,
        checklist_id: ChecklistId,
        user_id: &str,
        is_accurate: bool,
        comment: Option<&str>,
    ) -> Result<QualityAssessment> {
        self.record_vote(VoteKind::Location, checklist_id, user_id, is_accurate, comment)
    }

    /// Record a wild/captive verdict; the majority drives `is_wild`.
    ///
    /// # Errors
    /// Returns an error when the checklist does not exist or a write fails.
    pub fn vote_wild_status(
        &mut self,
        checklist_id: ChecklistId,
        user_id: &str,
        is_wild: bool,
        comment: Option<&str>,
    ) -> Result<QualityAssessment> {
        self.record_vote(VoteKind::WildStatus, checklist_id, user_id, is_wild, comment)
    }

    fn record_vote(
        &mut self,
        kind: VoteKind,
        checklist_id: ChecklistId,
        user_id: &str,
        verdict: bool,
        comment: Option<&str>,
    ) -> Result<QualityAssessment> {
        require_user(user_id)?;
        let table = kind.table();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start {table} transaction"))?;
        require_checklist(&tx, checklist_id)?;

        tx.execute(
            &format!(
                "INSERT INTO {table}(checklist_id, user_id, verdict, comment, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(checklist_id, user_id) DO UPDATE SET
                   verdict = excluded.verdict,
                   comment = excluded.comment,
                   created_at = excluded.created_at"
            ),
            params![checklist_id.to_string(), user_id, verdict, comment, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record {table} vote"))?;

        let (yes, no): (u32, u32) = tx
            .query_row(
                &format!(
                    "SELECT COALESCE(SUM(verdict = 1), 0), COALESCE(SUM(verdict = 0), 0)
                     FROM {table} WHERE checklist_id = ?1"
                ),
                params![checklist_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .with_context(|| format!("failed to tally {table}"))?;

        let mut assessment = ensure_assessment(&tx, checklist_id)?;
        let majority = yes >= no;
        match kind {
            VoteKind::Location => assessment.flags.location_accurate = majority,
            VoteKind::WildStatus => assessment.flags.is_wild = majority,
        }
        save_assessment(&tx, &assessment)?;
        let assessment =
            refresh_assessment(&tx, checklist_id, LevelUpdate::Keep, GradeUpdate::Evaluate)?;
        tx.commit().with_context(|| format!("failed to commit {table} transaction"))?;
        Ok(assessment)
    }

    /// Store the community's "can be improved" verdict and regrade.
    ///
    /// # Errors
    /// Returns an error when the checklist does not exist or a write fails.
    pub fn update_improvement_status(
        &mut self,
        checklist_id: ChecklistId,
        can_be_improved: bool,
    ) -> Result<QualityAssessment> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start improvement transaction")?;
        require_checklist(&tx, checklist_id)?;
        let mut assessment = ensure_assessment(&tx, checklist_id)?;
        assessment.can_be_improved = Some(can_be_improved);
        save_assessment(&tx, &assessment)?;
        let assessment =
            refresh_assessment(&tx, checklist_id, LevelUpdate::Keep, GradeUpdate::Evaluate)?;
        tx.commit().context("failed to commit improvement transaction")?;
        Ok(assessment)
    }

    /// Recount and regrade a checklist, creating its assessment if it is missing.
    ///
    /// # Errors
    /// Returns an error when the checklist does not exist or a write fails.
    pub fn assess_quality(&mut self, checklist_id: ChecklistId) -> Result<QualityAssessment> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start assessment transaction")?;
        require_checklist(&tx, checklist_id)?;
        let assessment =
            refresh_assessment(&tx, checklist_id, LevelUpdate::Keep, GradeUpdate::Evaluate)?;
        tx.commit().context("failed to commit assessment transaction")?;
        Ok(assessment)
    }

    /// Load a checklist with its identifications, assessment, votes and history.
    ///
    /// # Errors
    /// Returns an error when the checklist is missing or rows cannot be decoded.
    pub fn checklist_detail(&self, checklist_id: ChecklistId) -> Result<ChecklistDetail> {
        let checklist = require_checklist(&self.conn, checklist_id)?;
        let assessment = load_assessment(&self.conn, checklist_id)?
            .ok_or_else(|| anyhow!("checklist {checklist_id} has no quality assessment"))?;

        let mut stmt = self.conn.prepare(&format!(
            "{IDENTIFICATION_SELECT_SQL}
             WHERE i.checklist_id = ?1
             ORDER BY i.is_first DESC, i.created_at ASC, i.identification_id ASC"
        ))?;
        let mut rows = stmt.query(params![checklist_id.to_string()])?;
        let mut identifications = Vec::new();
        while let Some(row) = rows.next()? {
            identifications.push(read_identification(row)?);
        }

        let location_verifications = load_votes(&self.conn, VoteKind::Location, checklist_id)?;
        let wild_status_votes = load_votes(&self.conn, VoteKind::WildStatus, checklist_id)?;

        let mut stmt = self.conn.prepare(
            "SELECT taxon_id, user_id, action_type, scientific_name, previous_name, reason, created_at
             FROM identification_history
             WHERE checklist_id = ?1
             ORDER BY id ASC",
        )?;
        let history = stmt
            .query_map(params![checklist_id.to_string()], |row| {
                Ok(HistoryEntry {
                    taxon_id: row.get(0)?,
                    user_id: row.get(1)?,
                    action_type: row.get(2)?,
                    scientific_name: row.get(3)?,
                    previous_name: row.get(4)?,
                    reason: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read identification history")?;

        Ok(ChecklistDetail {
            checklist,
            identifications,
            assessment,
            location_verifications,
            wild_status_votes,
            history,
        })
    }

    /// Attach a free-text comment to a checklist. Comments never affect the assessment.
    ///
    /// # Errors
    /// Returns [`TaxonomyError::Validation`] (inside `anyhow`) for a blank user or body, or
    /// a body over 1000 characters; [`TaxonomyError::ConsistencyViolation`] when the
    /// checklist is missing.
    pub fn add_comment(
        &mut self,
        checklist_id: ChecklistId,
        user_id: &str,
        body: &str,
    ) -> Result<Comment> {
        require_user(user_id)?;
        if body.trim().is_empty() {
            return Err(TaxonomyError::Validation("comment MUST be non-empty".to_string()).into());
        }
        if body.chars().count() > MAX_COMMENT_CHARS {
            return Err(TaxonomyError::Validation(format!(
                "comment MUST be at most {MAX_COMMENT_CHARS} characters"
            ))
            .into());
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start comment transaction")?;
        require_checklist(&tx, checklist_id)?;
        let created_at = now_rfc3339()?;
        tx.execute(
            "INSERT INTO checklist_comments(checklist_id, user_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![checklist_id.to_string(), user_id, body, created_at],
        )
        .context("failed to insert comment")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit comment transaction")?;

        Ok(Comment {
            id,
            checklist_id,
            user_id: user_id.to_string(),
            body: body.to_string(),
            created_at,
        })
    }

    /// Comments on a checklist, oldest first.
    ///
    /// # Errors
    /// Returns an error when the checklist is missing or rows cannot be read.
    pub fn list_comments(&self, checklist_id: ChecklistId) -> Result<Vec<Comment>> {
        require_checklist(&self.conn, checklist_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, body, created_at FROM checklist_comments
             WHERE checklist_id = ?1 ORDER BY id ASC",
        )?;
        let comments = stmt
            .query_map(params![checklist_id.to_string()], |row| {
                Ok(Comment {
                    id: row.get(0)?,
                    checklist_id,
                    user_id: row.get(1)?,
                    body: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read comments")?;
        Ok(comments)
    }

    /// Newest checklists first, optionally narrowed to one observer or one grade.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_checklists(&self, filter: &ChecklistFilter) -> Result<Vec<ChecklistSummary>> {
        let mut sql = String::from(
            "SELECT c.checklist_id, q.grade, q.community_id_level
             FROM checklists c
             JOIN quality_assessments q ON q.checklist_id = c.checklist_id
             WHERE 1 = 1",
        );
        let mut values = Vec::new();
        if let Some(user_id) = &filter.user_id {
            sql.push_str(" AND c.user_id = ?");
            values.push(Value::Text(user_id.clone()));
        }
        if let Some(grade) = filter.grade {
            sql.push_str(" AND q.grade = ?");
            values.push(Value::Text(grade.as_str().to_string()));
        }
        let limit = match filter.limit {
            0 => DEFAULT_LIST_LIMIT,
            requested => requested.min(MAX_LIST_LIMIT),
        };
        sql.push_str(" ORDER BY c.created_at DESC, c.checklist_id DESC LIMIT ?");
        values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare checklist listing")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list checklists")?;

        let mut summaries = Vec::with_capacity(rows.len());
        for (checklist_raw, grade_raw, community_id_level) in rows {
            let checklist = require_checklist(&self.conn, parse_checklist_id(&checklist_raw)?)?;
            let grade =
                Grade::parse(&grade_raw).ok_or_else(|| anyhow!("unknown grade: {grade_raw}"))?;
            summaries.push(ChecklistSummary { checklist, grade, community_id_level });
        }
        Ok(summaries)
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
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
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

impl TaxonomyStore for SqliteStore {
    fn find_many(&self, query: &TaxonQuery, limit: usize) -> Result<Vec<Taxon>, TaxonomyError> {
        find_taxa(&self.conn, query, limit).map_err(into_taxonomy_error)
    }

    fn insert_taxon(&mut self, taxon: &NewTaxon) -> Result<Taxon, TaxonomyError> {
        self.add_taxon(taxon).map_err(into_taxonomy_error)
    }
}

/// Taxonomy view over an open transaction.
struct TxTaxonomy<'a>(&'a Connection);

impl TaxonomyStore for TxTaxonomy<'_> {
    fn find_many(&self, query: &TaxonQuery, limit: usize) -> Result<Vec<Taxon>, TaxonomyError> {
        find_taxa(self.0, query, limit).map_err(into_taxonomy_error)
    }

    fn insert_taxon(&mut self, taxon: &NewTaxon) -> Result<Taxon, TaxonomyError> {
        taxon.validate()?;
        insert_taxon_row(self.0, taxon).map_err(into_taxonomy_error)
    }
}

fn insert_checklist(
    conn: &Connection,
    taxon_id: i64,
    user_id: &str,
    metadata: &ObservationMetadata,
) -> Result<CreatedChecklist> {
    let taxon = require_taxon(conn, taxon_id)?;
    let now = now_rfc3339()?;
    let checklist_id = ChecklistId::new();
    let identification_id = IdentificationId::new();

    conn.execute(
        "INSERT INTO checklists(
            checklist_id, taxon_id, scientific_name, user_id, latitude, longitude,
            observed_on, media_count, notes, agreement_count, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?10)",
        params![
            checklist_id.to_string(),
            taxon.id,
            taxon.scientific_name,
            user_id,
            metadata.latitude,
            metadata.longitude,
            metadata.observed_on,
            metadata.media_count,
            metadata.notes,
            now,
        ],
    )
    .context("failed to insert checklist")?;

    conn.execute(
        "INSERT INTO identifications(
            identification_id, checklist_id, user_id, taxon_id, identification_level,
            comment, is_first, is_agreed, agrees_with_id, is_withdrawn, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, NULL, NULL, 0, ?7)",
        params![
            identification_id.to_string(),
            checklist_id.to_string(),
            user_id,
            taxon.id,
            taxon.taxon_rank.level_str(),
            metadata.comment,
            now,
        ],
    )
    .context("failed to insert first identification")?;

    let assessment =
        refresh_assessment(conn, checklist_id, LevelUpdate::Keep, GradeUpdate::Evaluate)?;
    tracing::info!(
        checklist_id = %checklist_id,
        taxon_id = taxon.id,
        grade = %assessment.grade,
        "created checklist"
    );
    Ok(CreatedChecklist { checklist_id, identification_id, assessment })
}

/// Recover a domain error carried inside `anyhow`, or wrap the failure as a store error.
#[must_use]
pub fn into_taxonomy_error(err: anyhow::Error) -> TaxonomyError {
    match err.downcast_ref::<TaxonomyError>() {
        Some(domain) => domain.clone(),
        None => TaxonomyError::Store(format!("{err:#}")),
    }
}

fn violation(message: String) -> anyhow::Error {
    TaxonomyError::ConsistencyViolation(message).into()
}

fn require_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(TaxonomyError::Validation("user_id MUST be non-empty".to_string()).into());
    }
    Ok(())
}

fn sql_column(column: TaxonColumn) -> &'static str {
    match column {
        TaxonColumn::Order => "\"order\"",
        other => other.as_str(),
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn find_taxa(conn: &Connection, query: &TaxonQuery, limit: usize) -> Result<Vec<Taxon>> {
    let mut sql = format!("{TAXON_SELECT_SQL} WHERE 1 = 1");
    let mut values = Vec::new();

    for criterion in &query.criteria {
        let column = sql_column(criterion.column);
        let (clause, value) = match &criterion.matcher {
            TaxonMatcher::Exact(value) => ("= ?", value.clone()),
            TaxonMatcher::ExactIgnoreCase(value) => ("= ? COLLATE NOCASE", value.clone()),
            TaxonMatcher::Prefix(value) => ("LIKE ? ESCAPE '\\'", format!("{}%", escape_like(value))),
            TaxonMatcher::Contains(value) => {
                ("LIKE ? ESCAPE '\\'", format!("%{}%", escape_like(value)))
            }
        };
        sql.push_str(&format!(" AND {column} {clause}"));
        values.push(Value::Text(value));
    }
    if let Some(rank) = query.rank {
        sql.push_str(" AND taxon_rank = ?");
        values.push(Value::Text(rank.as_str().to_string()));
    }
    if let Some(status) = query.status {
        sql.push_str(" AND taxonomic_status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    sql.push_str(" ORDER BY id ASC LIMIT ?");
    values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

    let mut stmt =
        conn.prepare(&sql).with_context(|| format!("failed to prepare taxon query {}", query.label))?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    let mut taxa = Vec::new();
    while let Some(row) = rows.next()? {
        taxa.push(read_taxon(row)?);
    }
    Ok(taxa)
}

fn insert_taxon_row(conn: &Connection, taxon: &NewTaxon) -> Result<Taxon> {
    let lineage = &taxon.lineage;
    conn.execute(
        r#"INSERT INTO taxa(
            scientific_name, taxon_rank, taxonomic_status, accepted_scientific_name,
            kingdom, phylum, class, "order", family, genus, species, subspecies, variety, form,
            created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"#,
        params![
            taxon.scientific_name,
            taxon.taxon_rank.as_str(),
            taxon.taxonomic_status.as_str(),
            taxon.accepted_scientific_name,
            lineage.kingdom,
            lineage.phylum,
            lineage.class,
            lineage.order,
            lineage.family,
            lineage.genus,
            lineage.species,
            lineage.subspecies,
            lineage.variety,
            lineage.form,
            now_rfc3339()?,
        ],
    )
    .with_context(|| format!("failed to insert taxon {}", taxon.scientific_name))?;
    Ok(taxon.clone().into_taxon(conn.last_insert_rowid()))
}

fn load_taxon(conn: &Connection, taxon_id: i64) -> Result<Option<Taxon>> {
    let mut stmt = conn.prepare(&format!("{TAXON_SELECT_SQL} WHERE id = ?1"))?;
    let mut rows = stmt.query(params![taxon_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_taxon(row)?)),
        None => Ok(None),
    }
}

fn require_taxon(conn: &Connection, taxon_id: i64) -> Result<Taxon> {
    load_taxon(conn, taxon_id)?.ok_or_else(|| {
        TaxonomyError::Validation(format!("taxon {taxon_id} does not exist")).into()
    })
}

fn read_taxon(row: &Row<'_>) -> Result<Taxon> {
    let rank_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    Ok(Taxon {
        id: row.get(0)?,
        scientific_name: row.get(1)?,
        taxon_rank: TaxonRank::parse(&rank_raw)
            .ok_or_else(|| anyhow!("unknown taxon_rank: {rank_raw}"))?,
        taxonomic_status: TaxonomicStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown taxonomic_status: {status_raw}"))?,
        accepted_scientific_name: row.get(4)?,
        lineage: Lineage {
            kingdom: row.get(5)?,
            phylum: row.get(6)?,
            class: row.get(7)?,
            order: row.get(8)?,
            family: row.get(9)?,
            genus: row.get(10)?,
            species: row.get(11)?,
            subspecies: row.get(12)?,
            variety: row.get(13)?,
            form: row.get(14)?,
        },
    })
}

fn load_checklist(conn: &Connection, checklist_id: ChecklistId) -> Result<Option<Checklist>> {
    conn.query_row(
        "SELECT checklist_id, taxon_id, scientific_name, user_id, latitude, longitude,
                observed_on, media_count, notes, agreement_count, created_at, updated_at
         FROM checklists WHERE checklist_id = ?1",
        params![checklist_id.to_string()],
        |row| {
            Ok(Checklist {
                checklist_id,
                taxon_id: row.get(1)?,
                scientific_name: row.get(2)?,
                user_id: row.get(3)?,
                latitude: row.get(4)?,
                longitude: row.get(5)?,
                observed_on: row.get(6)?,
                media_count: row.get(7)?,
                notes: row.get(8)?,
                agreement_count: row.get(9)?,
                created_at: row.get(10)?,
                updated_at: row.get(11)?,
            })
        },
    )
    .optional()
    .with_context(|| format!("failed to load checklist {checklist_id}"))
}

fn require_checklist(conn: &Connection, checklist_id: ChecklistId) -> Result<Checklist> {
    load_checklist(conn, checklist_id)?.ok_or_else(|| {
        TaxonomyError::ConsistencyViolation(format!("checklist {checklist_id} not found")).into()
    })
}

fn load_identification(
    conn: &Connection,
    checklist_id: ChecklistId,
    identification_id: IdentificationId,
) -> Result<Option<Identification>> {
    let mut stmt = conn.prepare(&format!(
        "{IDENTIFICATION_SELECT_SQL} WHERE i.checklist_id = ?1 AND i.identification_id = ?2"
    ))?;
    let mut rows = stmt.query(params![checklist_id.to_string(), identification_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_identification(row)?)),
        None => Ok(None),
    }
}

fn require_live_assertion(
    conn: &Connection,
    checklist_id: ChecklistId,
    identification_id: IdentificationId,
) -> Result<Identification> {
    let identification = load_identification(conn, checklist_id, identification_id)?
        .ok_or_else(|| {
            violation(format!(
                "identification {identification_id} does not belong to checklist {checklist_id}"
            ))
        })?;
    if identification.is_withdrawn {
        return Err(violation(format!("identification {identification_id} is withdrawn")));
    }
    if identification.is_agreed.is_some() || identification.taxon_id.is_none() {
        return Err(violation(format!(
            "identification {identification_id} is not an assertion"
        )));
    }
    Ok(identification)
}

fn read_identification(row: &Row<'_>) -> Result<Identification> {
    let identification_raw: String = row.get(0)?;
    let checklist_raw: String = row.get(1)?;
    let agrees_with_raw: Option<String> = row.get(9)?;
    Ok(Identification {
        identification_id: parse_identification_id(&identification_raw)?,
        checklist_id: parse_checklist_id(&checklist_raw)?,
        user_id: row.get(2)?,
        taxon_id: row.get(3)?,
        scientific_name: row.get(4)?,
        identification_level: row.get(5)?,
        comment: row.get(6)?,
        is_first: row.get(7)?,
        is_agreed: row.get(8)?,
        agrees_with_id: agrees_with_raw.as_deref().map(parse_identification_id).transpose()?,
        is_withdrawn: row.get(10)?,
        created_at: row.get(11)?,
        agreement_count: row.get(12)?,
    })
}

fn count_target_agreements(conn: &Connection, identification_id: IdentificationId) -> Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM identifications
         WHERE agrees_with_id = ?1 AND is_agreed = 1 AND is_withdrawn = 0",
        params![identification_id.to_string()],
        |row| row.get(0),
    )
    .context("failed to count agreements")
}

/// Agreements on the leading assertion and the number of live identifications.
fn consensus_counts(conn: &Connection, checklist_id: ChecklistId) -> Result<(u32, u32)> {
    let leading: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(agreements), 0) FROM (
                SELECT COUNT(*) AS agreements FROM identifications
                WHERE checklist_id = ?1 AND is_agreed = 1 AND is_withdrawn = 0
                GROUP BY agrees_with_id
             )",
            params![checklist_id.to_string()],
            |row| row.get(0),
        )
        .context("failed to count leading agreements")?;
    let total: u32 = conn
        .query_row(
            "SELECT COUNT(*) FROM identifications WHERE checklist_id = ?1 AND is_withdrawn = 0",
            params![checklist_id.to_string()],
            |row| row.get(0),
        )
        .context("failed to count identifications")?;
    Ok((leading, total))
}

fn load_assessment(conn: &Connection, checklist_id: ChecklistId) -> Result<Option<QualityAssessment>> {
    let row = conn
        .query_row(
            "SELECT has_date, has_location, has_media, is_wild, location_accurate,
                    recent_evidence, related_evidence, needs_id, can_be_improved,
                    community_id_level, grade, agreement_count, total_identifications
             FROM quality_assessments WHERE checklist_id = ?1",
            params![checklist_id.to_string()],
            |row| {
                let flags = QualityFlags {
                    has_date: row.get(0)?,
                    has_location: row.get(1)?,
                    has_media: row.get(2)?,
                    is_wild: row.get(3)?,
                    location_accurate: row.get(4)?,
                    recent_evidence: row.get(5)?,
                    related_evidence: row.get(6)?,
                };
                Ok((
                    flags,
                    row.get::<_, bool>(7)?,
                    row.get::<_, Option<bool>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, u32>(11)?,
                    row.get::<_, u32>(12)?,
                ))
            },
        )
        .optional()
        .with_context(|| format!("failed to load assessment for {checklist_id}"))?;

    let Some((flags, needs_id, can_be_improved, community_id_level, grade_raw, agreements, total)) =
        row
    else {
        return Ok(None);
    };
    Ok(Some(QualityAssessment {
        checklist_id,
        flags,
        needs_id,
        can_be_improved,
        community_id_level,
        grade: Grade::parse(&grade_raw).ok_or_else(|| anyhow!("unknown grade: {grade_raw}"))?,
        agreement_count: agreements,
        total_identifications: total,
    }))
}

fn ensure_assessment(conn: &Connection, checklist_id: ChecklistId) -> Result<QualityAssessment> {
    if let Some(existing) = load_assessment(conn, checklist_id)? {
        return Ok(existing);
    }
    let checklist = require_checklist(conn, checklist_id)?;
    let metadata = ObservationMetadata {
        latitude: checklist.latitude,
        longitude: checklist.longitude,
        observed_on: checklist.observed_on,
        media_count: checklist.media_count,
        notes: None,
        comment: None,
    };
    Ok(QualityAssessment {
        checklist_id,
        flags: metadata.initial_flags(),
        needs_id: true,
        can_be_improved: None,
        community_id_level: None,
        grade: Grade::NeedsId,
        agreement_count: 0,
        total_identifications: 0,
    })
}

fn save_assessment(conn: &Connection, assessment: &QualityAssessment) -> Result<()> {
    let flags = &assessment.flags;
    conn.execute(
        "INSERT INTO quality_assessments(
            checklist_id, has_date, has_location, has_media, is_wild, location_accurate,
            recent_evidence, related_evidence, needs_id, can_be_improved, community_id_level,
            grade, agreement_count, total_identifications, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        ON CONFLICT(checklist_id) DO UPDATE SET
            has_date = excluded.has_date,
            has_location = excluded.has_location,
            has_media = excluded.has_media,
            is_wild = excluded.is_wild,
            location_accurate = excluded.location_accurate,
            recent_evidence = excluded.recent_evidence,
            related_evidence = excluded.related_evidence,
            needs_id = excluded.needs_id,
            can_be_improved = excluded.can_be_improved,
            community_id_level = excluded.community_id_level,
            grade = excluded.grade,
            agreement_count = excluded.agreement_count,
            total_identifications = excluded.total_identifications,
            updated_at = excluded.updated_at",
        params![
            assessment.checklist_id.to_string(),
            flags.has_date,
            flags.has_location,
            flags.has_media,
            flags.is_wild,
            flags.location_accurate,
            flags.recent_evidence,
            flags.related_evidence,
            assessment.needs_id,
            assessment.can_be_improved,
            assessment.community_id_level,
            assessment.grade.as_str(),
            assessment.agreement_count,
            assessment.total_identifications,
            now_rfc3339()?,
        ],
    )
    .with_context(|| format!("failed to save assessment for {}", assessment.checklist_id))?;
    Ok(())
}

/// Recount, update the cached checklist count, regrade and persist the assessment.
fn refresh_assessment(
    conn: &Connection,
    checklist_id: ChecklistId,
    level: LevelUpdate,
    grade_update: GradeUpdate,
) -> Result<QualityAssessment> {
    let (agreement_count, total_identifications) = consensus_counts(conn, checklist_id)?;
    conn.execute(
        "UPDATE checklists SET agreement_count = ?2 WHERE checklist_id = ?1",
        params![checklist_id.to_string(), agreement_count],
    )
    .context("failed to update cached agreement count")?;

    let mut assessment = ensure_assessment(conn, checklist_id)?;
    let previous = assessment.grade;
    assessment.agreement_count = agreement_count;
    assessment.total_identifications = total_identifications;
    match level {
        LevelUpdate::Keep => {}
        LevelUpdate::Clear => assessment.community_id_level = None,
        LevelUpdate::Set(value) => assessment.community_id_level = Some(value),
    }
    if agreement_count < CONSENSUS_THRESHOLD {
        assessment.community_id_level = None;
    }
    assessment.grade = match grade_update {
        GradeUpdate::Evaluate => {
            evaluate_grade(&assessment.flags, agreement_count, total_identifications)
        }
        GradeUpdate::ResetNeedsId => Grade::NeedsId,
    };
    assessment.needs_id = assessment.grade == Grade::NeedsId;
    save_assessment(conn, &assessment)?;

    if previous != assessment.grade {
        tracing::debug!(
            checklist_id = %checklist_id,
            from = %previous,
            to = %assessment.grade,
            agreement_count,
            total_identifications,
            "grade changed"
        );
    }
    Ok(assessment)
}

fn load_votes(conn: &Connection, kind: VoteKind, checklist_id: ChecklistId) -> Result<Vec<CommunityVote>> {
    let table = kind.table();
    let mut stmt = conn.prepare(&format!(
        "SELECT user_id, verdict, comment, created_at FROM {table}
         WHERE checklist_id = ?1 ORDER BY created_at ASC, user_id ASC"
    ))?;
    let votes = stmt
        .query_map(params![checklist_id.to_string()], |row| {
            Ok(CommunityVote {
                user_id: row.get(0)?,
                verdict: row.get(1)?,
                comment: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to read {table}"))?;
    Ok(votes)
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

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }
    if table_exists(conn, "taxa")? {
        return Ok((1, true));
    }
    Ok((0, false))
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
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

/// # Errors
/// Returns an error when `raw` is not a ULID.
pub fn parse_checklist_id(raw: &str) -> Result<ChecklistId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(ChecklistId(parsed))
}

/// # Errors
/// Returns an error when `raw` is not a ULID.
pub fn parse_identification_id(raw: &str) -> Result<IdentificationId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(IdentificationId(parsed))
}

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use taxokernel_core::{
    detect_rank, evaluate_grade, parse_name, ChecklistId, Grade, IdentificationId, InferredRank,
    Lineage, NameTables, NewTaxon, ObservationMetadata, OfflineSearch, QualityAssessment,
    QualityFlags, Resolution, ResolveRequest, Taxon, TaxonRank, TaxonResolver, TaxonSearch,
    TaxonomicStatus,
};
use taxokernel_store_sqlite::{
    AddedIdentification, ChecklistDetail, ChecklistFilter, ChecklistSummary, Comment,
    CreatedChecklist, Disagreement, SchemaStatus, SqliteStore,
};

mod config;
mod search;

pub use config::{
    ApiConfig, DEFAULT_SOURCE_ENV, SEARCH_BASE_URL_ENV, SEARCH_ENABLED_ENV, SEARCH_LIMIT_ENV,
    SEARCH_TIMEOUT_MS_ENV,
};
pub use search::{GbifSuggestion, GbifTaxonSearch};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddTaxonRequest {
    pub scientific_name: String,
    pub taxon_rank: TaxonRank,
    pub taxonomic_status: TaxonomicStatus,
    pub accepted_scientific_name: Option<String>,
    #[serde(default)]
    pub lineage: Lineage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolveNameRequest {
    pub name: String,
    pub requested_rank: Option<TaxonRank>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateChecklistRequest {
    pub taxon_id: i64,
    pub user_id: String,
    #[serde(default)]
    pub metadata: ObservationMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateObservationRequest {
    pub name: String,
    pub requested_rank: Option<TaxonRank>,
    pub source: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub metadata: ObservationMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateObservationResult {
    pub resolution: Resolution,
    pub checklist: CreatedChecklist,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddIdentificationRequest {
    pub checklist_id: ChecklistId,
    pub user_id: String,
    pub taxon_id: i64,
    pub comment: Option<String>,
}

/// Target of an agree, withdraw or cancel-agreement event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentificationEvent {
    pub checklist_id: ChecklistId,
    pub identification_id: IdentificationId,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisagreeRequest {
    pub checklist_id: ChecklistId,
    pub identification_id: IdentificationId,
    pub user_id: String,
    #[serde(default)]
    pub proposal: Disagreement,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommunityVoteRequest {
    pub checklist_id: ChecklistId,
    pub user_id: String,
    pub verdict: bool,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddCommentRequest {
    pub checklist_id: ChecklistId,
    pub user_id: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct TaxonomyApi {
    db_path: PathBuf,
    config: ApiConfig,
    tables: NameTables,
}

impl TaxonomyApi {
    /// Build the facade with the built-in name tables.
    ///
    /// # Errors
    /// Returns an error when the built-in name tables fail to load.
    pub fn new(db_path: PathBuf, config: ApiConfig) -> Result<Self> {
        Ok(Self { db_path, config, tables: NameTables::builtin()? })
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    fn search_collaborator(&self) -> Box<dyn TaxonSearch> {
        if self.config.search_enabled {
            Box::new(GbifTaxonSearch::new(&self.config))
        } else {
            Box::new(OfflineSearch)
        }
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
                inferred_from_legacy: before.inferred_from_legacy,
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
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Add one taxon row to the local taxonomy.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_taxon(&self, input: AddTaxonRequest) -> Result<Taxon> {
        let mut store = self.open_migrated_store()?;
        store.add_taxon(&NewTaxon {
            scientific_name: input.scientific_name.trim().to_string(),
            taxon_rank: input.taxon_rank,
            taxonomic_status: input.taxonomic_status,
            accepted_scientific_name: input.accepted_scientific_name,
            lineage: input.lineage,
        })
    }

    /// Infer a rank for `name` without touching the database.
    ///
    /// # Errors
    /// Returns an error when the name is blank or malformed.
    pub fn detect_rank(&self, name: &str, requested_rank: Option<TaxonRank>) -> Result<InferredRank> {
        let parsed = parse_name(name, &self.tables)?;
        Ok(detect_rank(&parsed, requested_rank, &self.tables))
    }

    /// Resolve a free-text name to a taxon id.
    ///
    /// # Errors
    /// Returns an error carrying `TaxonomyError::InvalidNameFormat`, `TaxaNotFound` or
    /// `CollaboratorTimeout`, or a store failure.
    pub fn resolve(&self, input: ResolveNameRequest) -> Result<Resolution> {
        let mut store = self.open_migrated_store()?;
        let request = self.resolve_request(input);
        let search = self.search_collaborator();
        let resolution =
            TaxonResolver::new(&self.tables).resolve(&mut store, search.as_ref(), &request)?;
        Ok(resolution)
    }

    fn resolve_request(&self, input: ResolveNameRequest) -> ResolveRequest {
        ResolveRequest {
            name: input.name,
            requested_rank: input.requested_rank,
            source: input.source.unwrap_or_else(|| self.config.default_source.clone()),
        }
    }

    /// Create a checklist and its originating identification for a known taxon.
    ///
    /// # Errors
    /// Returns an error when metadata is invalid, the taxon is missing, or a write fails.
    pub fn create_checklist_with_identification(
        &self,
        input: CreateChecklistRequest,
    ) -> Result<CreatedChecklist> {
        let mut store = self.open_migrated_store()?;
        store.create_checklist_with_identification(input.taxon_id, &input.user_id, &input.metadata)
    }

    /// Resolve a name and create a checklist for it. Taxa created during resolution are
    /// only kept when the checklist is created too.
    ///
    /// # Errors
    /// Returns an error when the input is invalid, resolution fails or the checklist cannot
    /// be created.
    pub fn create_observation(&self, input: CreateObservationRequest) -> Result<CreateObservationResult> {
        let mut store = self.open_migrated_store()?;
        let request = self.resolve_request(ResolveNameRequest {
            name: input.name,
            requested_rank: input.requested_rank,
            source: input.source,
        });
        let search = self.search_collaborator();
        let resolver = TaxonResolver::new(&self.tables);
        let (resolution, checklist) =
            store.create_observation_with(&input.user_id, &input.metadata, |taxonomy| {
                resolver.resolve(taxonomy, search.as_ref(), &request)
            })?;
        tracing::info!(
            checklist_id = %checklist.checklist_id,
            taxon_id = resolution.taxon_id,
            matched_by = %resolution.matched_by,
            "observation created"
        );
        Ok(CreateObservationResult { resolution, checklist })
    }

    /// # Errors
    /// Returns an error when the checklist or taxon is missing or a write fails.
    pub fn add_identification(&self, input: AddIdentificationRequest) -> Result<AddedIdentification> {
        let mut store = self.open_migrated_store()?;
        store.add_identification(
            input.checklist_id,
            &input.user_id,
            input.taxon_id,
            input.comment.as_deref(),
        )
    }

    /// # Errors
    /// Returns an error carrying `TaxonomyError::DuplicateAgreement` or
    /// `ConsistencyViolation` for rejected events, or a store failure.
    pub fn record_agreement(&self, input: &IdentificationEvent) -> Result<QualityAssessment> {
        let mut store = self.open_migrated_store()?;
        store.record_agreement(input.checklist_id, input.identification_id, &input.user_id)
    }

    /// # Errors
    /// Returns an error carrying `TaxonomyError::ConsistencyViolation` for invalid targets,
    /// or a store failure.
    pub fn record_disagreement(&self, input: &DisagreeRequest) -> Result<QualityAssessment> {
        let mut store = self.open_migrated_store()?;
        store.record_disagreement(
            input.checklist_id,
            input.identification_id,
            &input.user_id,
            &input.proposal,
        )
    }

    /// # Errors
    /// Returns an error carrying `TaxonomyError::ConsistencyViolation` when the caller does
    /// not own the identification, or a store failure.
    pub fn withdraw(&self, input: &IdentificationEvent) -> Result<QualityAssessment> {
        let mut store = self.open_migrated_store()?;
        store.withdraw(input.checklist_id, input.identification_id, &input.user_id)
    }

    /// # Errors
    /// Returns an error carrying `TaxonomyError::ConsistencyViolation` when no agreement
    /// exists, or a store failure.
    pub fn cancel_agreement(&self, input: &IdentificationEvent) -> Result<QualityAssessment> {
        let mut store = self.open_migrated_store()?;
        store.cancel_agreement(input.checklist_id, input.identification_id, &input.user_id)
    }

    /// # Errors
    /// Returns an error when the checklist is missing or a write fails.
    pub fn verify_location(&self, input: &CommunityVoteRequest) -> Result<QualityAssessment> {
        let mut store = self.open_migrated_store()?;
        store.verify_location(
            input.checklist_id,
            &input.user_id,
            input.verdict,
            input.comment.as_deref(),
        )
    }

    /// # Errors
    /// Returns an error when the checklist is missing or a write fails.
    pub fn vote_wild_status(&self, input: &CommunityVoteRequest) -> Result<QualityAssessment> {
        let mut store = self.open_migrated_store()?;
        store.vote_wild_status(
            input.checklist_id,
            &input.user_id,
            input.verdict,
            input.comment.as_deref(),
        )
    }

    /// # Errors
    /// Returns an error when the checklist is missing or a write fails.
    pub fn update_improvement_status(
        &self,
        checklist_id: ChecklistId,
        can_be_improved: bool,
    ) -> Result<QualityAssessment> {
        let mut store = self.open_migrated_store()?;
        store.update_improvement_status(checklist_id, can_be_improved)
    }

    /// # Errors
    /// Returns an error when the checklist is missing or a write fails.
    pub fn assess_quality(&self, checklist_id: ChecklistId) -> Result<QualityAssessment> {
        let mut store = self.open_migrated_store()?;
        store.assess_quality(checklist_id)
    }

    /// # Errors
    /// Returns an error when the checklist is missing or rows cannot be decoded.
    pub fn checklist_detail(&self, checklist_id: ChecklistId) -> Result<ChecklistDetail> {
        let store = self.open_migrated_store()?;
        store.checklist_detail(checklist_id)
    }

    /// # Errors
    /// Returns an error carrying `TaxonomyError::Validation` for a blank or oversized
    /// comment, `ConsistencyViolation` for a missing checklist, or a store failure.
    pub fn add_comment(&self, input: &AddCommentRequest) -> Result<Comment> {
        let mut store = self.open_migrated_store()?;
        store.add_comment(input.checklist_id, &input.user_id, &input.body)
    }

    /// # Errors
    /// Returns an error when the checklist is missing or rows cannot be read.
    pub fn list_comments(&self, checklist_id: ChecklistId) -> Result<Vec<Comment>> {
        let store = self.open_migrated_store()?;
        store.list_comments(checklist_id)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_checklists(&self, filter: &ChecklistFilter) -> Result<Vec<ChecklistSummary>> {
        let store = self.open_migrated_store()?;
        store.list_checklists(filter)
    }

    #[must_use]
    pub fn evaluate(flags: &QualityFlags, agreement_count: u32, total_identifications: u32) -> Grade {
        evaluate_grade(flags, agreement_count, total_identifications)
    }
}

#[cfg(test)]
mod tests {
    use taxokernel_core::{TaxonColumn, TaxonQuery, TaxonomyError, TaxonomyStore};

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("taxokernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn offline_api(db_path: PathBuf) -> Result<TaxonomyApi> {
        TaxonomyApi::new(db_path, ApiConfig::default())
    }

    fn species_request(genus: &str, epithet: &str) -> AddTaxonRequest {
        AddTaxonRequest {
            scientific_name: format!("{genus} {epithet}"),
            taxon_rank: TaxonRank::Species,
            taxonomic_status: TaxonomicStatus::Accepted,
            accepted_scientific_name: None,
            lineage: Lineage {
                genus: Some(genus.to_string()),
                species: Some(epithet.to_string()),
                ..Lineage::default()
            },
        }
    }

    fn cleanup(db_path: &PathBuf) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    // Test IDs: TAPI-001
    #[test]
    fn observation_reaches_research_grade_through_agreements() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = offline_api(db_path.clone())?;
        let taxon = api.add_taxon(species_request("Mangifera", "indica"))?;

        let created = api.create_observation(CreateObservationRequest {
            name: "Mangifera indica L.".to_string(),
            requested_rank: None,
            source: None,
            user_id: "alice".to_string(),
            metadata: ObservationMetadata {
                latitude: Some(-6.6),
                longitude: Some(106.8),
                observed_on: Some("2026-04-02".to_string()),
                media_count: 1,
                notes: None,
                comment: Some("fruiting".to_string()),
            },
        })?;
        assert_eq!(created.resolution.taxon_id, taxon.id);
        assert_eq!(created.checklist.assessment.grade, Grade::NeedsId);

        let checklist_id = created.checklist.checklist_id;
        for user in ["bob", "carol"] {
            api.record_agreement(&IdentificationEvent {
                checklist_id,
                identification_id: created.checklist.identification_id,
                user_id: user.to_string(),
            })?;
        }
        let assessment = api.assess_quality(checklist_id)?;
        assert_eq!(assessment.grade, Grade::ResearchGrade);
        assert_eq!(assessment.community_id_level.as_deref(), Some("species"));

        let detail = api.checklist_detail(checklist_id)?;
        assert_eq!(detail.identifications.len(), 3);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn migrate_dry_run_reports_plan_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = offline_api(db_path.clone())?;

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn offline_miss_surfaces_taxa_not_found() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = offline_api(db_path.clone())?;

        let result = api.resolve(ResolveNameRequest {
            name: "Rafflesia arnoldii".to_string(),
            requested_rank: None,
            source: None,
        });
        let Err(err) = result else {
            cleanup(&db_path);
            return Err(anyhow::anyhow!("resolution of an unknown species succeeded"));
        };
        assert!(matches!(
            err.downcast_ref::<TaxonomyError>(),
            Some(TaxonomyError::TaxaNotFound { rank: Some(TaxonRank::Species), .. })
        ));

        let inferred = api.detect_rank("Malaxis Sol. ex Sw.", None)?;
        assert_eq!(inferred.rank, TaxonRank::Genus);
        assert_eq!(inferred.canonical_name, "Malaxis");

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn failed_observation_leaves_no_resolved_taxon_behind() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = offline_api(db_path.clone())?;
        let observation = |user_id: &str, latitude: f64| CreateObservationRequest {
            name: "Fungi".to_string(),
            requested_rank: None,
            source: None,
            user_id: user_id.to_string(),
            metadata: ObservationMetadata {
                latitude: Some(latitude),
                longitude: Some(106.8),
                ..ObservationMetadata::default()
            },
        };
        let fungi = TaxonQuery::new("fungi").exact(TaxonColumn::ScientificName, "Fungi");

        for rejected in [observation("  ", -6.6), observation("alice", 120.0)] {
            let Err(err) = api.create_observation(rejected) else {
                cleanup(&db_path);
                return Err(anyhow::anyhow!("invalid observation was accepted"));
            };
            assert!(matches!(
                err.downcast_ref::<TaxonomyError>(),
                Some(TaxonomyError::Validation(_))
            ));
        }
        assert!(SqliteStore::open(&db_path)?.find_first(&fungi)?.is_none());

        let created = api.create_observation(observation("alice", -6.6))?;
        let stored = SqliteStore::open(&db_path)?.find_first(&fungi)?;
        assert_eq!(stored.map(|taxon| taxon.id), Some(created.resolution.taxon_id));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn competing_assertions_comments_and_listing() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = offline_api(db_path.clone())?;
        let genus = api.add_taxon(AddTaxonRequest {
            scientific_name: "Pinus".to_string(),
            taxon_rank: TaxonRank::Genus,
            taxonomic_status: TaxonomicStatus::Accepted,
            accepted_scientific_name: None,
            lineage: Lineage { genus: Some("Pinus".to_string()), ..Lineage::default() },
        })?;
        let merkusii = api.add_taxon(species_request("Pinus", "merkusii"))?;
        let created = api.create_checklist_with_identification(CreateChecklistRequest {
            taxon_id: genus.id,
            user_id: "alice".to_string(),
            metadata: ObservationMetadata {
                latitude: Some(-0.95),
                longitude: Some(100.35),
                observed_on: Some("2026-02-14".to_string()),
                media_count: 1,
                notes: None,
                comment: None,
            },
        })?;
        let checklist_id = created.checklist_id;
        let proposal = api.add_identification(AddIdentificationRequest {
            checklist_id,
            user_id: "bob".to_string(),
            taxon_id: merkusii.id,
            comment: None,
        })?;
        let event = |identification_id: IdentificationId, user_id: &str| IdentificationEvent {
            checklist_id,
            identification_id,
            user_id: user_id.to_string(),
        };

        for user in ["carol", "dave"] {
            api.record_agreement(&event(proposal.identification_id, user))?;
        }
        let dissent = api.record_agreement(&event(created.identification_id, "erin"))?;
        assert_eq!(dissent.community_id_level.as_deref(), Some("species"));
        assert_eq!(dissent.agreement_count, 2);

        let cancelled = api.cancel_agreement(&event(created.identification_id, "erin"))?;
        assert_eq!(cancelled.grade, Grade::ResearchGrade);
        assert_eq!(api.assess_quality(checklist_id)?, cancelled);

        api.add_comment(&AddCommentRequest {
            checklist_id,
            user_id: "erin".to_string(),
            body: "two needles per bundle, I was wrong".to_string(),
        })?;
        assert_eq!(api.list_comments(checklist_id)?.len(), 1);

        let research =
            ChecklistFilter { grade: Some(Grade::ResearchGrade), ..ChecklistFilter::default() };
        let listed = api.list_checklists(&research)?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].checklist.scientific_name, "Pinus merkusii");

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn evaluate_is_the_pure_grade_function() {
        let flags = QualityFlags::all_set();
        assert_eq!(TaxonomyApi::evaluate(&flags, 1, 3), Grade::LowQualityId);
        assert_eq!(TaxonomyApi::evaluate(&flags, 2, 2), Grade::ResearchGrade);
    }
}

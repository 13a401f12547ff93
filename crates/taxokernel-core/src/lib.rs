use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

mod grade;
mod names;
mod rank;
mod resolver;

pub use grade::{evaluate_grade, ConsensusOutcome, QualityFlags};
pub use names::{parse_name, strip_author_candidates, InfraMarker, NameTables, ParsedName};
pub use rank::{detect_rank, looks_like_plant_species_with_author, InferredRank, RankRule};
pub use resolver::{
    OfflineSearch, Resolution, ResolveRequest, SearchHit, SynonymFallbackResolver, SynonymMatch,
    TaxonColumn, TaxonCriterion, TaxonMatcher, TaxonQuery, TaxonResolver, TaxonSearch,
    TaxonomyStore,
};

/// Placeholder name that resolves through get-or-create instead of the cascade.
pub const UNKNOWN_TAXON_NAME: &str = "Unknown";

/// Minimum number of independent agreements for community consensus.
pub const CONSENSUS_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TaxonomyError {
    #[error("invalid name format: {0}")]
    InvalidNameFormat(String),
    #[error("taxa not found for name `{name}`")]
    TaxaNotFound { name: String, rank: Option<TaxonRank> },
    #[error("ambiguous rank for name `{0}`")]
    AmbiguousRank(String),
    #[error("taxonomy search collaborator unavailable: {0}")]
    CollaboratorTimeout(String),
    #[error("user {user_id} already agreed with identification {identification_id}")]
    DuplicateAgreement { user_id: String, identification_id: String },
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid name tables: {0}")]
    InvalidNameTables(String),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChecklistId(pub Ulid);

impl ChecklistId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ChecklistId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ChecklistId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IdentificationId(pub Ulid);

impl IdentificationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for IdentificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for IdentificationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxonRank {
    Kingdom,
    Phylum,
    Subphylum,
    Class,
    Subclass,
    Order,
    Family,
    Genus,
    Species,
    Subspecies,
    Variety,
    Form,
    Unknown,
}

impl TaxonRank {
    pub const ALL: [Self; 13] = [
        Self::Kingdom,
        Self::Phylum,
        Self::Subphylum,
        Self::Class,
        Self::Subclass,
        Self::Order,
        Self::Family,
        Self::Genus,
        Self::Species,
        Self::Subspecies,
        Self::Variety,
        Self::Form,
        Self::Unknown,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kingdom => "KINGDOM",
            Self::Phylum => "PHYLUM",
            Self::Subphylum => "SUBPHYLUM",
            Self::Class => "CLASS",
            Self::Subclass => "SUBCLASS",
            Self::Order => "ORDER",
            Self::Family => "FAMILY",
            Self::Genus => "GENUS",
            Self::Species => "SPECIES",
            Self::Subspecies => "SUBSPECIES",
            Self::Variety => "VARIETY",
            Self::Form => "FORM",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Accepts any letter case, e.g. `species` or `SPECIES`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let upper = value.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|rank| rank.as_str() == upper)
    }

    /// Lowercase level string stored on identifications and community levels.
    #[must_use]
    pub fn level_str(self) -> String {
        self.as_str().to_ascii_lowercase()
    }

    /// Lineage column holding this rank's own name, if the taxonomy tracks one.
    #[must_use]
    pub fn lineage_column(self) -> Option<TaxonColumn> {
        match self {
            Self::Kingdom => Some(TaxonColumn::Kingdom),
            Self::Phylum => Some(TaxonColumn::Phylum),
            Self::Class => Some(TaxonColumn::Class),
            Self::Order => Some(TaxonColumn::Order),
            Self::Family => Some(TaxonColumn::Family),
            Self::Genus => Some(TaxonColumn::Genus),
            Self::Species => Some(TaxonColumn::Species),
            Self::Subspecies => Some(TaxonColumn::Subspecies),
            Self::Variety => Some(TaxonColumn::Variety),
            Self::Form => Some(TaxonColumn::Form),
            Self::Subphylum | Self::Subclass | Self::Unknown => None,
        }
    }

    #[must_use]
    pub fn is_infraspecific(self) -> bool {
        matches!(self, Self::Subspecies | Self::Variety | Self::Form)
    }
}

impl Display for TaxonRank {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxonomicStatus {
    Accepted,
    Synonym,
    Unknown,
}

impl TaxonomicStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::Synonym => "SYNONYM",
            Self::Unknown => "UNKNOWN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ACCEPTED" => Some(Self::Accepted),
            "SYNONYM" => Some(Self::Synonym),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum Grade {
    #[serde(rename = "research grade")]
    ResearchGrade,
    #[serde(rename = "low quality ID")]
    LowQualityId,
    #[serde(rename = "needs ID")]
    NeedsId,
    #[serde(rename = "casual")]
    Casual,
}

impl Grade {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResearchGrade => "research grade",
            Self::LowQualityId => "low quality ID",
            Self::NeedsId => "needs ID",
            Self::Casual => "casual",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "research grade" => Some(Self::ResearchGrade),
            "low quality ID" => Some(Self::LowQualityId),
            "needs ID" => Some(Self::NeedsId),
            "casual" => Some(Self::Casual),
            _ => None,
        }
    }
}

impl Display for Grade {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-rank classification path of a taxon.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lineage {
    pub kingdom: Option<String>,
    pub phylum: Option<String>,
    pub class: Option<String>,
    pub order: Option<String>,
    pub family: Option<String>,
    pub genus: Option<String>,
    pub species: Option<String>,
    pub subspecies: Option<String>,
    pub variety: Option<String>,
    pub form: Option<String>,
}

impl Lineage {
    #[must_use]
    pub fn get(&self, column: TaxonColumn) -> Option<&str> {
        let value = match column {
            TaxonColumn::Kingdom => &self.kingdom,
            TaxonColumn::Phylum => &self.phylum,
            TaxonColumn::Class => &self.class,
            TaxonColumn::Order => &self.order,
            TaxonColumn::Family => &self.family,
            TaxonColumn::Genus => &self.genus,
            TaxonColumn::Species => &self.species,
            TaxonColumn::Subspecies => &self.subspecies,
            TaxonColumn::Variety => &self.variety,
            TaxonColumn::Form => &self.form,
            TaxonColumn::ScientificName | TaxonColumn::AcceptedScientificName => return None,
        };
        value.as_deref()
    }

    pub fn set(&mut self, column: TaxonColumn, value: Option<String>) {
        let slot = match column {
            TaxonColumn::Kingdom => &mut self.kingdom,
            TaxonColumn::Phylum => &mut self.phylum,
            TaxonColumn::Class => &mut self.class,
            TaxonColumn::Order => &mut self.order,
            TaxonColumn::Family => &mut self.family,
            TaxonColumn::Genus => &mut self.genus,
            TaxonColumn::Species => &mut self.species,
            TaxonColumn::Subspecies => &mut self.subspecies,
            TaxonColumn::Variety => &mut self.variety,
            TaxonColumn::Form => &mut self.form,
            TaxonColumn::ScientificName | TaxonColumn::AcceptedScientificName => return,
        };
        *slot = value;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Taxon {
    pub id: i64,
    pub scientific_name: String,
    pub taxon_rank: TaxonRank,
    pub taxonomic_status: TaxonomicStatus,
    pub accepted_scientific_name: Option<String>,
    #[serde(default)]
    pub lineage: Lineage,
}

impl Taxon {
    /// Value of `column` on this row, used by in-memory stores and tests.
    #[must_use]
    pub fn column(&self, column: TaxonColumn) -> Option<&str> {
        match column {
            TaxonColumn::ScientificName => Some(&self.scientific_name),
            TaxonColumn::AcceptedScientificName => self.accepted_scientific_name.as_deref(),
            other => self.lineage.get(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTaxon {
    pub scientific_name: String,
    pub taxon_rank: TaxonRank,
    pub taxonomic_status: TaxonomicStatus,
    pub accepted_scientific_name: Option<String>,
    #[serde(default)]
    pub lineage: Lineage,
}

impl NewTaxon {
    /// Accepted taxon with no lineage beyond its own rank column.
    #[must_use]
    pub fn named(scientific_name: &str, taxon_rank: TaxonRank) -> Self {
        let mut lineage = Lineage::default();
        if let Some(column) = taxon_rank.lineage_column() {
            lineage.set(column, Some(scientific_name.to_string()));
        }
        Self {
            scientific_name: scientific_name.to_string(),
            taxon_rank,
            taxonomic_status: TaxonomicStatus::Accepted,
            accepted_scientific_name: None,
            lineage,
        }
    }

    /// Placeholder row for [`UNKNOWN_TAXON_NAME`], tagged with the caller's rank.
    #[must_use]
    pub fn unknown_placeholder(taxon_rank: TaxonRank) -> Self {
        Self {
            scientific_name: UNKNOWN_TAXON_NAME.to_string(),
            taxon_rank,
            taxonomic_status: TaxonomicStatus::Unknown,
            accepted_scientific_name: None,
            lineage: Lineage::default(),
        }
    }

    /// Check required fields before the row reaches a store.
    ///
    /// # Errors
    /// Returns [`TaxonomyError::Validation`] when the scientific name is blank.
    pub fn validate(&self) -> Result<(), TaxonomyError> {
        if self.scientific_name.trim().is_empty() {
            return Err(TaxonomyError::Validation(
                "scientific_name MUST be non-empty".to_string(),
            ));
        }
        if self.taxonomic_status == TaxonomicStatus::Synonym
            && self.accepted_scientific_name.as_deref().map_or(true, |name| name.trim().is_empty())
        {
            return Err(TaxonomyError::Validation(
                "synonym taxa MUST carry accepted_scientific_name".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn into_taxon(self, id: i64) -> Taxon {
        Taxon {
            id,
            scientific_name: self.scientific_name,
            taxon_rank: self.taxon_rank,
            taxonomic_status: self.taxonomic_status,
            accepted_scientific_name: self.accepted_scientific_name,
            lineage: self.lineage,
        }
    }
}

/// Observation metadata captured when a checklist is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObservationMetadata {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub observed_on: Option<String>,
    #[serde(default)]
    pub media_count: u32,
    pub notes: Option<String>,
    pub comment: Option<String>,
}

impl ObservationMetadata {
    /// # Errors
    /// Returns [`TaxonomyError::Validation`] when coordinates are out of range or
    /// only one of latitude/longitude is supplied.
    pub fn validate(&self) -> Result<(), TaxonomyError> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => {
                if !(-90.0..=90.0).contains(&lat) {
                    return Err(TaxonomyError::Validation(
                        "latitude MUST be in [-90, 90]".to_string(),
                    ));
                }
                if !(-180.0..=180.0).contains(&lon) {
                    return Err(TaxonomyError::Validation(
                        "longitude MUST be in [-180, 180]".to_string(),
                    ));
                }
            }
            (None, None) => {}
            _ => {
                return Err(TaxonomyError::Validation(
                    "latitude and longitude MUST be provided together".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Initial quality flags derived from the captured metadata.
    #[must_use]
    pub fn initial_flags(&self) -> QualityFlags {
        QualityFlags {
            has_date: self.observed_on.as_deref().is_some_and(|value| !value.trim().is_empty()),
            has_location: self.latitude.is_some() && self.longitude.is_some(),
            has_media: self.media_count > 0,
            is_wild: true,
            location_accurate: true,
            recent_evidence: true,
            related_evidence: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualityAssessment {
    pub checklist_id: ChecklistId,
    pub flags: QualityFlags,
    pub needs_id: bool,
    pub can_be_improved: Option<bool>,
    pub community_id_level: Option<String>,
    pub grade: Grade,
    pub agreement_count: u32,
    pub total_identifications: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_parse_is_case_insensitive_and_round_trips() {
        for rank in TaxonRank::ALL {
            assert_eq!(TaxonRank::parse(rank.as_str()), Some(rank));
            assert_eq!(TaxonRank::parse(&rank.level_str()), Some(rank));
        }
        assert_eq!(TaxonRank::parse("tribe"), None);
    }

    #[test]
    fn grade_serializes_with_display_labels() {
        let json = serde_json::to_string(&Grade::LowQualityId)
            .unwrap_or_else(|err| panic!("failed to serialize grade: {err}"));
        assert_eq!(json, "\"low quality ID\"");
        assert_eq!(Grade::parse("needs ID"), Some(Grade::NeedsId));
    }

    #[test]
    fn named_taxon_fills_own_lineage_column() {
        let taxon = NewTaxon::named("Plantae", TaxonRank::Kingdom);
        assert_eq!(taxon.lineage.kingdom.as_deref(), Some("Plantae"));
        assert!(taxon.validate().is_ok());

        let sub = NewTaxon::named("Crustacea", TaxonRank::Subphylum);
        assert_eq!(sub.lineage, Lineage::default());
    }

    #[test]
    fn synonym_without_accepted_name_is_rejected() {
        let mut taxon = NewTaxon::named("Pinus sumatrana", TaxonRank::Species);
        taxon.taxonomic_status = TaxonomicStatus::Synonym;
        assert!(matches!(taxon.validate(), Err(TaxonomyError::Validation(_))));
    }

    #[test]
    fn metadata_flags_follow_captured_fields() {
        let metadata = ObservationMetadata {
            latitude: Some(-6.2),
            longitude: Some(106.8),
            observed_on: Some("2026-03-01".to_string()),
            media_count: 0,
            notes: None,
            comment: None,
        };
        assert!(metadata.validate().is_ok());
        let flags = metadata.initial_flags();
        assert!(flags.has_date);
        assert!(flags.has_location);
        assert!(!flags.has_media);

        let half = ObservationMetadata { longitude: None, ..metadata };
        assert!(matches!(half.validate(), Err(TaxonomyError::Validation(_))));
    }
}

use serde::{Deserialize, Serialize};

use crate::{Grade, CONSENSUS_THRESHOLD};

/// Metadata completeness flags of one observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualityFlags {
    pub has_date: bool,
    pub has_location: bool,
    pub has_media: bool,
    pub is_wild: bool,
    pub location_accurate: bool,
    pub recent_evidence: bool,
    pub related_evidence: bool,
}

impl QualityFlags {
    #[must_use]
    pub fn all_set() -> Self {
        Self {
            has_date: true,
            has_location: true,
            has_media: true,
            is_wild: true,
            location_accurate: true,
            recent_evidence: true,
            related_evidence: true,
        }
    }

    /// Date, location and media are all present.
    #[must_use]
    pub fn basic(&self) -> bool {
        self.has_date && self.has_location && self.has_media
    }

    #[must_use]
    pub fn complete(&self) -> bool {
        self.basic()
            && self.is_wild
            && self.location_accurate
            && self.recent_evidence
            && self.related_evidence
    }
}

/// Grade an observation from its flags and identification counts.
///
/// Checked in priority order: research grade, low quality ID, needs ID, casual.
#[must_use]
pub fn evaluate_grade(flags: &QualityFlags, agreement_count: u32, total_identifications: u32) -> Grade {
    if flags.complete() && agreement_count >= CONSENSUS_THRESHOLD {
        return Grade::ResearchGrade;
    }
    if !flags.basic() {
        return Grade::Casual;
    }
    if total_identifications >= 2 && agreement_count == 1 {
        return Grade::LowQualityId;
    }

    // agreement / total < 2/3, kept in integers.
    let weak_majority = agreement_count >= CONSENSUS_THRESHOLD
        && u64::from(agreement_count) * 3 < u64::from(total_identifications) * 2;
    if total_identifications < 2 || agreement_count == 0 || weak_majority {
        return Grade::NeedsId;
    }
    Grade::Casual
}

/// Whether a recount reached community consensus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusOutcome {
    Reached,
    BelowThreshold,
}

impl ConsensusOutcome {
    #[must_use]
    pub fn from_agreements(agreement_count: u32) -> Self {
        if agreement_count >= CONSENSUS_THRESHOLD {
            Self::Reached
        } else {
            Self::BelowThreshold
        }
    }

    /// Community level to store: the agreed level once reached, otherwise cleared.
    #[must_use]
    pub fn community_level(self, identification_level: &str) -> Option<String> {
        match self {
            Self::Reached => Some(identification_level.to_string()),
            Self::BelowThreshold => None,
        }
    }
}

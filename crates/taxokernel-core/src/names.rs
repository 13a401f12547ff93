//! Tokenizing scientific names and separating author citations from the name proper.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::{TaxonColumn, TaxonRank, TaxonomyError};

const BUILTIN_TABLES_JSON: &str = include_str!("../data/name_tables.json");

const CONJUNCTIONS: [&str; 3] = ["&", "et", "ex"];

#[derive(Debug, Deserialize)]
struct NameTablesFile {
    special_taxa: BTreeMap<String, Vec<String>>,
    author_gazetteer: Vec<String>,
    typical_author_abbreviations: Vec<String>,
    common_plant_genera: Vec<String>,
    #[serde(default)]
    plant_author_signs: Vec<String>,
    #[serde(default)]
    name_particles: Vec<String>,
}

/// Static lookup data driving name parsing and rank heuristics.
///
/// Loaded from JSON so the tables can grow without touching the rules that use them.
#[derive(Debug, Clone)]
pub struct NameTables {
    special_taxa: BTreeMap<String, TaxonRank>,
    author_gazetteer: BTreeSet<String>,
    common_plant_genera: BTreeSet<String>,
    plant_author_signs: Vec<String>,
    name_particles: BTreeSet<String>,
    author_token: Regex,
    species_with_author: Regex,
    typical_author: Option<Regex>,
    parenthetical: Regex,
    strip_parenthetical: Regex,
    strip_trailing_abbreviation: Regex,
    strip_trailing_surname: Regex,
    strip_paired_authors: Regex,
}

impl NameTables {
    /// Tables bundled with the crate.
    ///
    /// # Errors
    /// Returns [`TaxonomyError::InvalidNameTables`] if the bundled data fails to load.
    pub fn builtin() -> Result<Self, TaxonomyError> {
        Self::from_json(BUILTIN_TABLES_JSON)
    }

    /// Build tables from a JSON document shaped like `data/name_tables.json`.
    ///
    /// # Errors
    /// Returns [`TaxonomyError::InvalidNameTables`] when the document cannot be decoded,
    /// names an unknown rank, or yields an invalid pattern.
    pub fn from_json(raw: &str) -> Result<Self, TaxonomyError> {
        let file: NameTablesFile = serde_json::from_str(raw)
            .map_err(|err| TaxonomyError::InvalidNameTables(err.to_string()))?;

        let mut special_taxa = BTreeMap::new();
        for (rank_raw, names) in file.special_taxa {
            let rank = TaxonRank::parse(&rank_raw).ok_or_else(|| {
                TaxonomyError::InvalidNameTables(format!("unknown rank in special_taxa: {rank_raw}"))
            })?;
            for name in names {
                special_taxa.insert(name, rank);
            }
        }

        let abbreviations = file
            .typical_author_abbreviations
            .iter()
            .map(|value| regex_lite::escape(value))
            .collect::<Vec<_>>()
            .join("|");
        let typical_author = if abbreviations.is_empty() {
            None
        } else {
            Some(compile(&format!(r"\s(?:{abbreviations})"))?)
        };

        Ok(Self {
            special_taxa,
            author_gazetteer: file.author_gazetteer.into_iter().collect(),
            common_plant_genera: file.common_plant_genera.into_iter().collect(),
            plant_author_signs: file.plant_author_signs,
            name_particles: file.name_particles.into_iter().collect(),
            author_token: compile(r"^[A-Z][a-z]*\.?$")?,
            species_with_author: compile(
                r"^[A-Z][a-z]+ [a-z]+ [A-Z][a-z.]+(\s+(&|et)\s+[a-zA-Z.]+)*$",
            )?,
            typical_author,
            parenthetical: compile(r"\([^)]+\)")?,
            strip_parenthetical: compile(r"\s+\([^)]+\).*$")?,
            strip_trailing_abbreviation: compile(r"\s+[A-Z][a-z]*\.?\s*$")?,
            strip_trailing_surname: compile(r"\s+[A-Z][a-z]+\.?\s*$")?,
            strip_paired_authors: compile(r"\s+[A-Z][a-z]*\.\s*&\s*[A-Z][a-z]*\.?\s*$")?,
        })
    }

    /// Rank of a well-known taxon looked up by exact name.
    #[must_use]
    pub fn special_rank(&self, name: &str) -> Option<TaxonRank> {
        self.special_taxa.get(name).copied()
    }

    #[must_use]
    pub fn is_gazetteer_author(&self, token: &str) -> bool {
        self.author_gazetteer.contains(token)
    }

    /// `Lindl.`, `Blume`, `L.` and gazetteer entries such as `Burm.f.`.
    #[must_use]
    pub fn is_author_token(&self, token: &str) -> bool {
        self.author_token.is_match(token) || self.is_gazetteer_author(token)
    }

    #[must_use]
    pub fn is_common_plant_genus(&self, genus: &str) -> bool {
        self.common_plant_genera.contains(genus)
    }

    #[must_use]
    pub fn has_plant_author_sign(&self, name: &str) -> bool {
        self.plant_author_signs.iter().any(|sign| name.contains(sign.as_str()))
    }

    /// Whole-name shape `Genus species Author [& Author]`.
    #[must_use]
    pub fn matches_species_with_author(&self, name: &str) -> bool {
        self.species_with_author.is_match(name)
    }

    #[must_use]
    pub fn has_typical_author_abbreviation(&self, name: &str) -> bool {
        self.typical_author.as_ref().is_some_and(|pattern| pattern.is_match(name))
    }

    #[must_use]
    pub fn has_parenthetical(&self, name: &str) -> bool {
        self.parenthetical.is_match(name)
    }

    fn is_citation_token(&self, token: &str) -> bool {
        self.is_author_token(token)
            || CONJUNCTIONS.contains(&token)
            || self.name_particles.contains(token)
    }
}

fn compile(pattern: &str) -> Result<Regex, TaxonomyError> {
    Regex::new(pattern)
        .map_err(|err| TaxonomyError::InvalidNameTables(format!("bad pattern {pattern}: {err}")))
}

/// Explicit infraspecific rank marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InfraMarker {
    Subspecies,
    Variety,
    Form,
}

impl InfraMarker {
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "subsp." | "ssp." | "subspecies" => Some(Self::Subspecies),
            "var." | "variety" => Some(Self::Variety),
            "f." | "forma" => Some(Self::Form),
            _ => None,
        }
    }

    /// Marker spelling used when rebuilding a scientific name.
    #[must_use]
    pub fn canonical(self) -> &'static str {
        match self {
            Self::Subspecies => "subsp.",
            Self::Variety => "var.",
            Self::Form => "f.",
        }
    }

    #[must_use]
    pub fn rank(self) -> TaxonRank {
        match self {
            Self::Subspecies => TaxonRank::Subspecies,
            Self::Variety => TaxonRank::Variety,
            Self::Form => TaxonRank::Form,
        }
    }

    #[must_use]
    pub fn column(self) -> TaxonColumn {
        match self {
            Self::Subspecies => TaxonColumn::Subspecies,
            Self::Variety => TaxonColumn::Variety,
            Self::Form => TaxonColumn::Form,
        }
    }
}

/// Structured view of a raw scientific name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedName {
    pub raw: String,
    /// Input with whitespace collapsed to single spaces.
    pub normalized: String,
    pub tokens: Vec<String>,
    /// Name with the author citation removed.
    pub base_name: String,
    pub author: Option<String>,
    pub genus: Option<String>,
    pub species: Option<String>,
    pub infra_marker: Option<InfraMarker>,
    pub infra_epithet: Option<String>,
    /// Base-name tokens after genus and species that are not the marker or its epithet.
    pub residual: Vec<String>,
}

impl ParsedName {
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// `Genus species` when both parts are present.
    #[must_use]
    pub fn binomial(&self) -> Option<String> {
        match (&self.genus, &self.species) {
            (Some(genus), Some(species)) => Some(format!("{genus} {species}")),
            _ => None,
        }
    }

    /// First two raw tokens, regardless of their shape.
    #[must_use]
    pub fn leading_pair(&self) -> Option<(&str, &str)> {
        match self.tokens.as_slice() {
            [first, second, ..] => Some((first.as_str(), second.as_str())),
            _ => None,
        }
    }
}

/// Split a raw name into its parts.
///
/// Author citations are found by, in order: a parenthetical group, a trailing author-shaped
/// or gazetteer token, then a `&`/`et`/`ex` conjunction preceded by an author token.
///
/// # Errors
/// Returns [`TaxonomyError::InvalidNameFormat`] for blank input or input whose first token
/// carries no letters.
pub fn parse_name(raw: &str, tables: &NameTables) -> Result<ParsedName, TaxonomyError> {
    let tokens = raw.split_whitespace().map(str::to_string).collect::<Vec<_>>();
    let Some(first) = tokens.first() else {
        return Err(TaxonomyError::InvalidNameFormat("name MUST be non-empty".to_string()));
    };
    if !first.chars().any(char::is_alphabetic) {
        return Err(TaxonomyError::InvalidNameFormat(format!(
            "name MUST start with a word: {raw}"
        )));
    }

    let normalized = tokens.join(" ");
    let citation = find_citation(&tokens, tables);
    let (base, author) = match &citation {
        Some(range) => {
            let base = tokens
                .iter()
                .enumerate()
                .filter(|(index, _)| !range.contains(index))
                .map(|(_, token)| token.clone())
                .collect::<Vec<_>>();
            (base, Some(tokens[range.clone()].join(" ")))
        }
        None => (tokens.clone(), None),
    };

    let genus = base.first().filter(|token| is_capitalized_word(token)).cloned();
    let species = base
        .get(1)
        .filter(|token| starts_lowercase(token) && InfraMarker::from_token(token).is_none())
        .cloned();

    let (infra_marker, infra_epithet, consumed) = find_infra(&base);
    let residual = base
        .iter()
        .enumerate()
        .skip(2)
        .filter(|(index, _)| !consumed.contains(index))
        .map(|(_, token)| token.clone())
        .collect::<Vec<_>>();

    Ok(ParsedName {
        raw: raw.to_string(),
        normalized,
        base_name: base.join(" "),
        tokens,
        author,
        genus,
        species,
        infra_marker,
        infra_epithet,
        residual,
    })
}

/// Name with a trailing author citation removed by pattern, or `None` if nothing was removed.
///
/// Strips a parenthetical tail, then up to two trailing capitalized tokens, then a
/// paired `X. & Y.` citation.
#[must_use]
pub fn strip_author_candidates(name: &str, tables: &NameTables) -> Option<String> {
    let stripped = tables.strip_parenthetical.replace(name, "");
    let stripped = tables.strip_trailing_abbreviation.replace(&stripped, "");
    let stripped = tables.strip_trailing_surname.replace(&stripped, "");
    let stripped = tables.strip_paired_authors.replace(&stripped, "");
    let stripped = stripped.trim();
    if stripped.is_empty() || stripped == name.trim() {
        None
    } else {
        Some(stripped.to_string())
    }
}

fn find_citation(tokens: &[String], tables: &NameTables) -> Option<Range<usize>> {
    let len = tokens.len();
    if len < 2 {
        return None;
    }

    if let Some(start) = tokens.iter().skip(1).position(|token| token.starts_with('(')) {
        return Some(start + 1..len);
    }

    let last = tokens[len - 1].as_str();
    let trailing_suffix = len > 2
        && tables.name_particles.contains(last)
        && tables.is_author_token(&tokens[len - 2]);
    if tables.is_author_token(last) || trailing_suffix {
        let mut start = len - 1;
        while start > 1 && tables.is_citation_token(&tokens[start - 1]) {
            start -= 1;
        }
        return Some(start..len);
    }

    let conjunction = tokens
        .iter()
        .enumerate()
        .skip(2)
        .find(|(_, token)| CONJUNCTIONS.contains(&token.as_str()))
        .map(|(index, _)| index)?;
    let mut start = conjunction;
    while start > 1 && tables.is_author_token(&tokens[start - 1]) {
        start -= 1;
    }
    if start == conjunction {
        return None;
    }
    let mut end = conjunction + 1;
    while end < len && tables.is_citation_token(&tokens[end]) {
        end += 1;
    }
    Some(start..end)
}

fn find_infra(base: &[String]) -> (Option<InfraMarker>, Option<String>, Vec<usize>) {
    for (index, token) in base.iter().enumerate().skip(2) {
        if let Some(marker) = InfraMarker::from_token(token) {
            let epithet = base.get(index + 1).filter(|next| starts_lowercase(next));
            // A bare `f.` followed by nothing name-like is an author suffix such as `Burm. f.`.
            if marker == InfraMarker::Form && token.eq_ignore_ascii_case("f.") && epithet.is_none()
            {
                continue;
            }
            return match epithet {
                Some(epithet) => (Some(marker), Some(epithet.clone()), vec![index, index + 1]),
                None => (Some(marker), None, vec![index]),
            };
        }
        if let Some(glued) = glued_form_epithet(token) {
            return (Some(InfraMarker::Form), Some(glued), vec![index]);
        }
    }

    if base.len() == 3 && starts_lowercase(&base[2]) && base[2].chars().all(is_epithet_char) {
        return (None, Some(base[2].clone()), vec![2]);
    }
    (None, None, Vec::new())
}

/// `f.alba` written without the separating space.
fn glued_form_epithet(token: &str) -> Option<String> {
    let lower = token.to_ascii_lowercase();
    let rest = lower.strip_prefix("f.")?;
    if rest.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        Some(token[2..].to_string())
    } else {
        None
    }
}

fn is_epithet_char(c: char) -> bool {
    c.is_lowercase() || c == '-'
}

pub(crate) fn is_capitalized_word(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() => {
            let rest = chars.collect::<Vec<_>>();
            !rest.is_empty() && rest.iter().all(|c| is_epithet_char(*c))
        }
        _ => false,
    }
}

pub(crate) fn starts_lowercase(token: &str) -> bool {
    token.chars().next().is_some_and(char::is_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> NameTables {
        NameTables::builtin().unwrap_or_else(|err| panic!("builtin tables failed to load: {err}"))
    }

    fn parse(raw: &str) -> ParsedName {
        parse_name(raw, &tables()).unwrap_or_else(|err| panic!("failed to parse {raw}: {err}"))
    }

    #[test]
    fn blank_and_symbol_only_names_are_rejected() {
        let tables = tables();
        assert!(matches!(parse_name("   ", &tables), Err(TaxonomyError::InvalidNameFormat(_))));
        assert!(matches!(parse_name("123 456", &tables), Err(TaxonomyError::InvalidNameFormat(_))));
    }

    #[test]
    fn whitespace_is_collapsed() {
        let parsed = parse("  Pinus \t merkusii  ");
        assert_eq!(parsed.normalized, "Pinus merkusii");
        assert_eq!(parsed.binomial().as_deref(), Some("Pinus merkusii"));
        assert_eq!(parsed.author, None);
    }

    #[test]
    fn multi_author_citation_is_stripped() {
        let parsed = parse("Pinus merkusii Jungh. & de Vriese");
        assert_eq!(parsed.base_name, "Pinus merkusii");
        assert_eq!(parsed.author.as_deref(), Some("Jungh. & de Vriese"));
        assert_eq!(parsed.genus.as_deref(), Some("Pinus"));
        assert_eq!(parsed.species.as_deref(), Some("merkusii"));
    }

    #[test]
    fn parenthetical_author_wins_over_trailing_tokens() {
        let parsed = parse("Ardea alba (Linnaeus, 1758) Smith");
        assert_eq!(parsed.base_name, "Ardea alba");
        assert_eq!(parsed.author.as_deref(), Some("(Linnaeus, 1758) Smith"));
    }

    #[test]
    fn genus_with_ex_citation_keeps_only_genus() {
        let parsed = parse("Malaxis Sol. ex Sw.");
        assert_eq!(parsed.base_name, "Malaxis");
        assert_eq!(parsed.genus.as_deref(), Some("Malaxis"));
        assert_eq!(parsed.species, None);
    }

    #[test]
    fn single_capitalized_word_is_not_an_author() {
        let parsed = parse("Mammalia");
        assert_eq!(parsed.base_name, "Mammalia");
        assert_eq!(parsed.author, None);
    }

    #[test]
    fn infra_markers_and_epithets_are_extracted() {
        let parsed = parse("Pinus merkusii subsp. sumatrana");
        assert_eq!(parsed.infra_marker, Some(InfraMarker::Subspecies));
        assert_eq!(parsed.infra_epithet.as_deref(), Some("sumatrana"));
        assert!(parsed.residual.is_empty());

        let variety = parse("Ficus benjamina var. nuda Miq.");
        assert_eq!(variety.author.as_deref(), Some("Miq."));
        assert_eq!(variety.infra_marker, Some(InfraMarker::Variety));
        assert_eq!(variety.infra_epithet.as_deref(), Some("nuda"));

        let glued = parse("Rosa canina f.alba");
        assert_eq!(glued.infra_marker, Some(InfraMarker::Form));
        assert_eq!(glued.infra_epithet.as_deref(), Some("alba"));
    }

    #[test]
    fn author_suffix_f_is_not_a_form_marker() {
        let parsed = parse("Syzygium cumini Burm. f.");
        assert_eq!(parsed.infra_marker, None);
        assert_eq!(parsed.base_name, "Syzygium cumini");
    }

    #[test]
    fn bare_trinomial_exposes_epithet_without_marker() {
        let parsed = parse("Canis lupus familiaris");
        assert_eq!(parsed.infra_marker, None);
        assert_eq!(parsed.infra_epithet.as_deref(), Some("familiaris"));
    }

    #[test]
    fn strip_author_candidates_follows_pattern_sequence() {
        let tables = tables();
        assert_eq!(
            strip_author_candidates("Pinus merkusii (Jungh.) Vriese", &tables).as_deref(),
            Some("Pinus merkusii")
        );
        assert_eq!(
            strip_author_candidates("Coelogyne pandurata Lindl.", &tables).as_deref(),
            Some("Coelogyne pandurata")
        );
        assert_eq!(strip_author_candidates("Pinus merkusii", &tables), None);
    }

    #[test]
    fn custom_tables_reject_unknown_ranks() {
        let raw = r#"{"special_taxa":{"TRIBE":["Bambuseae"]},"author_gazetteer":[],
            "typical_author_abbreviations":[],"common_plant_genera":[]}"#;
        assert!(matches!(NameTables::from_json(raw), Err(TaxonomyError::InvalidNameTables(_))));
    }
}

//! Resolution of parsed names to taxon ids: synonym fallback, rank strategies, rank
//! fallbacks, then the external search collaborator.

use serde::{Deserialize, Serialize};

use crate::names::{parse_name, strip_author_candidates, InfraMarker, NameTables, ParsedName};
use crate::rank::{detect_rank, looks_like_plant_species_with_author, InferredRank};
use crate::{NewTaxon, Taxon, TaxonRank, TaxonomicStatus, TaxonomyError, UNKNOWN_TAXON_NAME};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaxonColumn {
    ScientificName,
    AcceptedScientificName,
    Kingdom,
    Phylum,
    Class,
    Order,
    Family,
    Genus,
    Species,
    Subspecies,
    Variety,
    Form,
}

impl TaxonColumn {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScientificName => "scientific_name",
            Self::AcceptedScientificName => "accepted_scientific_name",
            Self::Kingdom => "kingdom",
            Self::Phylum => "phylum",
            Self::Class => "class",
            Self::Order => "order",
            Self::Family => "family",
            Self::Genus => "genus",
            Self::Species => "species",
            Self::Subspecies => "subspecies",
            Self::Variety => "variety",
            Self::Form => "form",
        }
    }
}

/// Column predicate. `Exact` is case-sensitive; the others ignore ASCII case, matching
/// SQLite `LIKE` semantics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaxonMatcher {
    Exact(String),
    ExactIgnoreCase(String),
    Prefix(String),
    Contains(String),
}

impl TaxonMatcher {
    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact(expected) => value == expected,
            Self::ExactIgnoreCase(expected) => value.eq_ignore_ascii_case(expected),
            Self::Prefix(prefix) => {
                value.to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase())
            }
            Self::Contains(needle) => {
                value.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaxonCriterion {
    pub column: TaxonColumn,
    pub matcher: TaxonMatcher,
}

/// Named conjunction of column predicates plus optional rank and status filters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaxonQuery {
    pub label: String,
    pub criteria: Vec<TaxonCriterion>,
    pub rank: Option<TaxonRank>,
    pub status: Option<TaxonomicStatus>,
}

impl TaxonQuery {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), criteria: Vec::new(), rank: None, status: None }
    }

    #[must_use]
    pub fn exact(self, column: TaxonColumn, value: &str) -> Self {
        self.criterion(column, TaxonMatcher::Exact(value.to_string()))
    }

    #[must_use]
    pub fn exact_ignore_case(self, column: TaxonColumn, value: &str) -> Self {
        self.criterion(column, TaxonMatcher::ExactIgnoreCase(value.to_string()))
    }

    #[must_use]
    pub fn prefix(self, column: TaxonColumn, value: &str) -> Self {
        self.criterion(column, TaxonMatcher::Prefix(value.to_string()))
    }

    #[must_use]
    pub fn contains(self, column: TaxonColumn, value: &str) -> Self {
        self.criterion(column, TaxonMatcher::Contains(value.to_string()))
    }

    #[must_use]
    pub fn with_rank(mut self, rank: TaxonRank) -> Self {
        self.rank = Some(rank);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: TaxonomicStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn criterion(mut self, column: TaxonColumn, matcher: TaxonMatcher) -> Self {
        self.criteria.push(TaxonCriterion { column, matcher });
        self
    }

    /// Evaluate the query against one row; used by in-memory stores.
    #[must_use]
    pub fn matches(&self, taxon: &Taxon) -> bool {
        if self.rank.is_some_and(|rank| rank != taxon.taxon_rank) {
            return false;
        }
        if self.status.is_some_and(|status| status != taxon.taxonomic_status) {
            return false;
        }
        self.criteria.iter().all(|criterion| {
            taxon.column(criterion.column).is_some_and(|value| criterion.matcher.matches(value))
        })
    }
}

/// Taxonomy lookups the resolver needs. Rows come back in ascending id order.
pub trait TaxonomyStore {
    /// # Errors
    /// Returns [`TaxonomyError::Store`] when the backing store fails.
    fn find_many(&self, query: &TaxonQuery, limit: usize) -> Result<Vec<Taxon>, TaxonomyError>;

    /// # Errors
    /// Returns [`TaxonomyError::Store`] when the backing store fails.
    fn find_first(&self, query: &TaxonQuery) -> Result<Option<Taxon>, TaxonomyError> {
        Ok(self.find_many(query, 1)?.into_iter().next())
    }

    /// # Errors
    /// Returns [`TaxonomyError::Validation`] for invalid rows or [`TaxonomyError::Store`]
    /// when the insert fails.
    fn insert_taxon(&mut self, taxon: &NewTaxon) -> Result<Taxon, TaxonomyError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchHit {
    pub id: i64,
    pub scientific_name: String,
    pub rank: TaxonRank,
}

/// Last-resort lookup consulted after every local strategy misses.
///
/// Implementations may persist what they find through `store` so the returned ids are local.
pub trait TaxonSearch {
    /// # Errors
    /// Returns [`TaxonomyError::CollaboratorTimeout`] when the collaborator cannot be reached.
    fn search(
        &self,
        store: &mut dyn TaxonomyStore,
        name: &str,
        rank_hint: Option<TaxonRank>,
        source: &str,
    ) -> Result<Vec<SearchHit>, TaxonomyError>;
}

/// Search collaborator that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineSearch;

impl TaxonSearch for OfflineSearch {
    fn search(
        &self,
        _store: &mut dyn TaxonomyStore,
        _name: &str,
        _rank_hint: Option<TaxonRank>,
        _source: &str,
    ) -> Result<Vec<SearchHit>, TaxonomyError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolveRequest {
    pub name: String,
    pub requested_rank: Option<TaxonRank>,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub taxon_id: i64,
    pub scientific_name: String,
    pub rank: TaxonRank,
    /// Name the lookup ran with, after author stripping.
    pub canonical_name: String,
    pub used_synonym: bool,
    /// Label of the strategy that produced the match.
    pub matched_by: String,
    /// Absent when the synonym fallback or the `Unknown` placeholder answered first.
    pub inferred: Option<InferredRank>,
}

impl Resolution {
    fn from_taxon(taxon: Taxon, matched_by: &str, inferred: Option<InferredRank>) -> Self {
        let canonical_name = inferred
            .as_ref()
            .map_or_else(|| taxon.scientific_name.clone(), |inferred| inferred.canonical_name.clone());
        Self {
            taxon_id: taxon.id,
            scientific_name: taxon.scientific_name,
            rank: taxon.taxon_rank,
            canonical_name,
            used_synonym: false,
            matched_by: matched_by.to_string(),
            inferred,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynonymMatch {
    pub taxon: Taxon,
    pub used_synonym: bool,
    pub step: &'static str,
}

/// Lookups tried before the rank cascade: exact name, reverse accepted-name, synonym
/// binomial, then author-stripped SPECIES names.
#[derive(Debug, Clone, Copy)]
pub struct SynonymFallbackResolver<'a> {
    tables: &'a NameTables,
}

impl<'a> SynonymFallbackResolver<'a> {
    #[must_use]
    pub fn new(tables: &'a NameTables) -> Self {
        Self { tables }
    }

    /// # Errors
    /// Propagates store failures.
    pub fn find(
        &self,
        store: &dyn TaxonomyStore,
        parsed: &ParsedName,
    ) -> Result<Option<SynonymMatch>, TaxonomyError> {
        let name = parsed.normalized.as_str();

        let exact = TaxonQuery::new("synonym.exact_name").exact(TaxonColumn::ScientificName, name);
        if let Some(taxon) = store.find_first(&exact)? {
            let used_synonym = taxon.taxonomic_status == TaxonomicStatus::Synonym;
            return Ok(Some(SynonymMatch { taxon, used_synonym, step: "synonym.exact_name" }));
        }

        let reverse = TaxonQuery::new("synonym.accepted_name")
            .exact(TaxonColumn::AcceptedScientificName, name);
        if let Some(taxon) = store.find_first(&reverse)? {
            return Ok(Some(SynonymMatch { taxon, used_synonym: true, step: "synonym.accepted_name" }));
        }

        if let Some((genus, species)) = parsed.leading_pair() {
            let binomial = TaxonQuery::new("synonym.binomial")
                .exact(TaxonColumn::Genus, genus)
                .exact(TaxonColumn::Species, species)
                .with_rank(TaxonRank::Species)
                .with_status(TaxonomicStatus::Synonym);
            if let Some(taxon) = store.find_first(&binomial)? {
                return Ok(Some(SynonymMatch { taxon, used_synonym: true, step: "synonym.binomial" }));
            }
        }

        if let Some(stripped) = strip_author_candidates(name, self.tables) {
            let candidates = [
                TaxonQuery::new("synonym.stripped_exact")
                    .exact(TaxonColumn::ScientificName, &stripped)
                    .with_rank(TaxonRank::Species),
                TaxonQuery::new("synonym.stripped_prefix")
                    .prefix(TaxonColumn::ScientificName, &stripped)
                    .with_rank(TaxonRank::Species),
            ];
            for query in candidates {
                if let Some(taxon) = store.find_first(&query)? {
                    let used_synonym = taxon.taxonomic_status == TaxonomicStatus::Synonym;
                    let step = if query.label.ends_with("exact") {
                        "synonym.stripped_exact"
                    } else {
                        "synonym.stripped_prefix"
                    };
                    return Ok(Some(SynonymMatch { taxon, used_synonym, step }));
                }
            }
        }

        Ok(None)
    }
}

/// Turns free-text names into taxon ids.
#[derive(Debug, Clone, Copy)]
pub struct TaxonResolver<'a> {
    tables: &'a NameTables,
}

impl<'a> TaxonResolver<'a> {
    #[must_use]
    pub fn new(tables: &'a NameTables) -> Self {
        Self { tables }
    }

    /// Resolve `request` to a taxon, creating rows only for the `Unknown` placeholder and
    /// unmatched KINGDOM/UNKNOWN names.
    ///
    /// # Errors
    /// - [`TaxonomyError::InvalidNameFormat`] for blank names or names missing the parts
    ///   their rank needs.
    /// - [`TaxonomyError::CollaboratorTimeout`] when the search collaborator fails.
    /// - [`TaxonomyError::TaxaNotFound`] when every strategy misses.
    pub fn resolve(
        &self,
        store: &mut dyn TaxonomyStore,
        search: &dyn TaxonSearch,
        request: &ResolveRequest,
    ) -> Result<Resolution, TaxonomyError> {
        let parsed = parse_name(&request.name, self.tables)?;

        if parsed.normalized.eq_ignore_ascii_case(UNKNOWN_TAXON_NAME) {
            return resolve_unknown_placeholder(store, request.requested_rank);
        }

        if let Some(found) = SynonymFallbackResolver::new(self.tables).find(&*store, &parsed)? {
            tracing::info!(
                name = %parsed.normalized,
                taxon_id = found.taxon.id,
                step = found.step,
                used_synonym = found.used_synonym,
                "resolved through synonym fallback"
            );
            let used_synonym = found.used_synonym;
            let mut resolution = Resolution::from_taxon(found.taxon, found.step, None);
            resolution.used_synonym = used_synonym;
            resolution.canonical_name.clone_from(&parsed.base_name);
            return Ok(resolution);
        }

        let inferred = detect_rank(&parsed, request.requested_rank, self.tables);
        for query in self.strategies(&parsed, &inferred)? {
            if let Some(taxon) = store.find_first(&query)? {
                tracing::debug!(name = %parsed.normalized, strategy = %query.label, "strategy hit");
                return Ok(Resolution::from_taxon(taxon, &query.label, Some(inferred)));
            }
        }

        for query in fallback_queries(&parsed, &inferred) {
            if let Some(taxon) = store.find_first(&query)? {
                tracing::info!(name = %parsed.normalized, strategy = %query.label, "fallback hit");
                return Ok(Resolution::from_taxon(taxon, &query.label, Some(inferred)));
            }
        }

        if let Some(new_taxon) = created_on_miss(&inferred) {
            let taxon = store.insert_taxon(&new_taxon)?;
            tracing::info!(
                name = %taxon.scientific_name,
                taxon_id = taxon.id,
                rank = %taxon.taxon_rank,
                "created taxon for unmatched name"
            );
            let label = format!("{}.created", inferred.rank.level_str());
            return Ok(Resolution::from_taxon(taxon, &label, Some(inferred)));
        }

        self.search_collaborator(store, search, request, &parsed, inferred)
    }

    /// Ordered lookups for the inferred rank, before any fallback.
    ///
    /// # Errors
    /// Returns [`TaxonomyError::InvalidNameFormat`] when the name lacks the parts the rank
    /// needs (genus and epithet for SPECIES, plus an infraspecific epithet below it).
    pub fn strategies(
        &self,
        parsed: &ParsedName,
        inferred: &InferredRank,
    ) -> Result<Vec<TaxonQuery>, TaxonomyError> {
        let rank = inferred.rank;
        let name = inferred.canonical_name.as_str();
        let queries = match rank {
            TaxonRank::Species => {
                let (genus, species) = binomial_parts(parsed, rank)?;
                let binomial = format!("{genus} {species}");
                vec![
                    TaxonQuery::new("species.genus_species_exact")
                        .exact(TaxonColumn::Genus, &genus)
                        .exact(TaxonColumn::Species, &species),
                    TaxonQuery::new("species.genus_exact_species_prefix")
                        .exact(TaxonColumn::Genus, &genus)
                        .prefix(TaxonColumn::Species, &species),
                    TaxonQuery::new("species.scientific_name_exact")
                        .exact(TaxonColumn::ScientificName, &parsed.normalized),
                    TaxonQuery::new("species.binomial_exact")
                        .exact(TaxonColumn::ScientificName, &binomial),
                    TaxonQuery::new("species.binomial_prefix")
                        .prefix(TaxonColumn::ScientificName, &binomial),
                ]
            }
            TaxonRank::Subspecies | TaxonRank::Variety | TaxonRank::Form => {
                infraspecific_queries(parsed, rank)?
            }
            TaxonRank::Genus => vec![
                TaxonQuery::new("genus.genus_exact").exact(TaxonColumn::Genus, name),
                TaxonQuery::new("genus.scientific_name_exact")
                    .exact(TaxonColumn::ScientificName, name),
            ],
            TaxonRank::Kingdom
            | TaxonRank::Phylum
            | TaxonRank::Class
            | TaxonRank::Order
            | TaxonRank::Family => {
                let column = rank.lineage_column().unwrap_or(TaxonColumn::ScientificName);
                vec![TaxonQuery::new(format!("{}.lineage_contains", rank.level_str()))
                    .contains(column, name)]
            }
            TaxonRank::Subphylum | TaxonRank::Subclass => {
                vec![TaxonQuery::new(format!("{}.scientific_name_contains", rank.level_str()))
                    .contains(TaxonColumn::ScientificName, name)]
            }
            TaxonRank::Unknown => vec![TaxonQuery::new("unknown.scientific_name_exact")
                .exact(TaxonColumn::ScientificName, name)],
        };

        Ok(queries.into_iter().map(|query| query.with_rank(rank)).collect())
    }

    fn search_collaborator(
        &self,
        store: &mut dyn TaxonomyStore,
        search: &dyn TaxonSearch,
        request: &ResolveRequest,
        parsed: &ParsedName,
        inferred: InferredRank,
    ) -> Result<Resolution, TaxonomyError> {
        let hint = if inferred.rank == TaxonRank::Subspecies
            && looks_like_plant_species_with_author(parsed, self.tables)
        {
            tracing::info!(name = %parsed.normalized, "searching subspecies-shaped plant name as species");
            TaxonRank::Species
        } else {
            inferred.rank
        };

        let hits = search.search(store, &parsed.normalized, Some(hint), &request.source)?;
        let chosen = hits.iter().find(|hit| hit.rank == hint).or_else(|| hits.first());
        let Some(hit) = chosen else {
            tracing::warn!(name = %request.name, rank = %inferred.rank, "taxa not found");
            return Err(TaxonomyError::TaxaNotFound {
                name: request.name.clone(),
                rank: Some(inferred.rank),
            });
        };

        let matched_by = if hit.rank == hint { "search.rank_match" } else { "search.first_hit" };
        tracing::info!(name = %parsed.normalized, taxon_id = hit.id, matched_by, "resolved through search collaborator");
        Ok(Resolution {
            taxon_id: hit.id,
            scientific_name: hit.scientific_name.clone(),
            rank: hit.rank,
            canonical_name: inferred.canonical_name.clone(),
            used_synonym: false,
            matched_by: matched_by.to_string(),
            inferred: Some(inferred),
        })
    }
}

fn resolve_unknown_placeholder(
    store: &mut dyn TaxonomyStore,
    requested_rank: Option<TaxonRank>,
) -> Result<Resolution, TaxonomyError> {
    let rank = requested_rank.unwrap_or(TaxonRank::Unknown);
    let query = TaxonQuery::new("unknown.placeholder")
        .exact(TaxonColumn::ScientificName, UNKNOWN_TAXON_NAME)
        .with_rank(rank);
    if let Some(taxon) = store.find_first(&query)? {
        return Ok(Resolution::from_taxon(taxon, "unknown.placeholder", None));
    }
    let taxon = store.insert_taxon(&NewTaxon::unknown_placeholder(rank))?;
    tracing::info!(taxon_id = taxon.id, rank = %rank, "created Unknown placeholder taxon");
    Ok(Resolution::from_taxon(taxon, "unknown.placeholder_created", None))
}

fn binomial_parts(parsed: &ParsedName, rank: TaxonRank) -> Result<(String, String), TaxonomyError> {
    if let (Some(genus), Some(species)) = (&parsed.genus, &parsed.species) {
        return Ok((genus.clone(), species.clone()));
    }
    let mut base = parsed.base_name.split_whitespace();
    match (base.next(), base.next()) {
        (Some(genus), Some(species)) => Ok((genus.to_string(), species.to_string())),
        _ => Err(TaxonomyError::InvalidNameFormat(format!(
            "{} names need a genus and an epithet: {}",
            rank.level_str(),
            parsed.normalized
        ))),
    }
}

fn infraspecific_queries(
    parsed: &ParsedName,
    rank: TaxonRank,
) -> Result<Vec<TaxonQuery>, TaxonomyError> {
    let (genus, species) = binomial_parts(parsed, rank)?;
    let marker = match rank {
        TaxonRank::Variety => InfraMarker::Variety,
        TaxonRank::Form => InfraMarker::Form,
        _ => InfraMarker::Subspecies,
    };
    let epithet = parsed
        .infra_epithet
        .clone()
        .or_else(|| {
            parsed
                .residual
                .iter()
                .find(|token| InfraMarker::from_token(token).is_none())
                .cloned()
        })
        .ok_or_else(|| {
            TaxonomyError::InvalidNameFormat(format!(
                "{} names need an infraspecific epithet: {}",
                rank.level_str(),
                parsed.normalized
            ))
        })?;

    let level = rank.level_str();
    let mut queries = vec![TaxonQuery::new(format!("{level}.structured"))
        .exact(TaxonColumn::Genus, &genus)
        .prefix(TaxonColumn::Species, &species)
        .contains(marker.column(), &epithet)];
    if rank == TaxonRank::Subspecies {
        queries.push(
            TaxonQuery::new("subspecies.trinomial_prefix")
                .prefix(TaxonColumn::ScientificName, &format!("{genus} {species} {epithet}")),
        );
    }
    queries.push(TaxonQuery::new(format!("{level}.marked_prefix")).prefix(
        TaxonColumn::ScientificName,
        &format!("{genus} {species} {} {epithet}", marker.canonical()),
    ));
    Ok(queries)
}

fn fallback_queries(parsed: &ParsedName, inferred: &InferredRank) -> Vec<TaxonQuery> {
    let name = inferred.canonical_name.as_str();
    match inferred.rank {
        TaxonRank::Species => {
            let base = parsed.base_name.as_str();
            let mut queries = vec![TaxonQuery::new("species.fallback_base_name_exact")
                .exact(TaxonColumn::ScientificName, base)
                .with_rank(TaxonRank::Species)];
            if let Some((genus, species)) = parsed.leading_pair() {
                queries.push(
                    TaxonQuery::new("species.fallback_ignore_case")
                        .exact_ignore_case(TaxonColumn::Genus, genus)
                        .exact_ignore_case(TaxonColumn::Species, species)
                        .with_rank(TaxonRank::Species),
                );
            }
            queries.push(
                TaxonQuery::new("species.fallback_base_name_prefix")
                    .prefix(TaxonColumn::ScientificName, base)
                    .with_rank(TaxonRank::Species),
            );
            queries
        }
        TaxonRank::Genus => [
            (TaxonRank::Class, TaxonColumn::Class),
            (TaxonRank::Order, TaxonColumn::Order),
            (TaxonRank::Family, TaxonColumn::Family),
        ]
        .into_iter()
        .map(|(rank, column)| {
            TaxonQuery::new(format!("genus.fallback_{}", rank.level_str()))
                .contains(column, name)
                .with_rank(rank)
        })
        .collect(),
        _ => Vec::new(),
    }
}

fn created_on_miss(inferred: &InferredRank) -> Option<NewTaxon> {
    match inferred.rank {
        TaxonRank::Kingdom => Some(NewTaxon::named(&inferred.canonical_name, TaxonRank::Kingdom)),
        TaxonRank::Unknown => {
            let mut taxon = NewTaxon::named(&inferred.canonical_name, TaxonRank::Unknown);
            taxon.taxonomic_status = TaxonomicStatus::Unknown;
            Some(taxon)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use proptest::prelude::*;

    use super::*;
    use crate::Lineage;

    #[derive(Default)]
    struct MemoryTaxonomy {
        rows: Vec<Taxon>,
    }

    impl MemoryTaxonomy {
        fn add(&mut self, taxon: NewTaxon) -> i64 {
            match self.insert_taxon(&taxon) {
                Ok(row) => row.id,
                Err(err) => panic!("fixture insert failed: {err}"),
            }
        }
    }

    impl TaxonomyStore for MemoryTaxonomy {
        fn find_many(&self, query: &TaxonQuery, limit: usize) -> Result<Vec<Taxon>, TaxonomyError> {
            Ok(self.rows.iter().filter(|row| query.matches(row)).take(limit).cloned().collect())
        }

        fn insert_taxon(&mut self, taxon: &NewTaxon) -> Result<Taxon, TaxonomyError> {
            taxon.validate()?;
            let id = i64::try_from(self.rows.len()).unwrap_or(i64::MAX) + 1;
            let row = taxon.clone().into_taxon(id);
            self.rows.push(row.clone());
            Ok(row)
        }
    }

    struct ScriptedSearch {
        hits: Vec<SearchHit>,
        fail: bool,
        hints: RefCell<Vec<Option<TaxonRank>>>,
    }

    impl ScriptedSearch {
        fn returning(hits: Vec<SearchHit>) -> Self {
            Self { hits, fail: false, hints: RefCell::new(Vec::new()) }
        }

        fn failing() -> Self {
            Self { hits: Vec::new(), fail: true, hints: RefCell::new(Vec::new()) }
        }
    }

    impl TaxonSearch for ScriptedSearch {
        fn search(
            &self,
            _store: &mut dyn TaxonomyStore,
            _name: &str,
            rank_hint: Option<TaxonRank>,
            _source: &str,
        ) -> Result<Vec<SearchHit>, TaxonomyError> {
            self.hints.borrow_mut().push(rank_hint);
            if self.fail {
                return Err(TaxonomyError::CollaboratorTimeout("connection reset".to_string()));
            }
            Ok(self.hits.clone())
        }
    }

    fn tables() -> NameTables {
        NameTables::builtin().unwrap_or_else(|err| panic!("builtin tables failed to load: {err}"))
    }

    fn species(genus: &str, epithet: &str) -> NewTaxon {
        let mut taxon = NewTaxon::named(&format!("{genus} {epithet}"), TaxonRank::Species);
        taxon.lineage.genus = Some(genus.to_string());
        taxon.lineage.species = Some(epithet.to_string());
        taxon
    }

    fn request(name: &str) -> ResolveRequest {
        ResolveRequest { name: name.to_string(), requested_rank: None, source: "test".to_string() }
    }

    fn resolve_with(
        store: &mut MemoryTaxonomy,
        search: &dyn TaxonSearch,
        request: &ResolveRequest,
    ) -> Result<Resolution, TaxonomyError> {
        let tables = tables();
        TaxonResolver::new(&tables).resolve(store, search, request)
    }

    #[test]
    fn author_citation_resolves_to_same_species_row() -> Result<(), TaxonomyError> {
        let mut store = MemoryTaxonomy::default();
        let id = store.add(species("Pinus", "merkusii"));

        let plain = resolve_with(&mut store, &OfflineSearch, &request("Pinus merkusii"))?;
        let cited =
            resolve_with(&mut store, &OfflineSearch, &request("Pinus merkusii Jungh. & de Vriese"))?;
        assert_eq!(plain.taxon_id, id);
        assert_eq!(cited.taxon_id, id);
        assert!(!cited.used_synonym);
        Ok(())
    }

    #[test]
    fn synonym_rows_are_used_as_is() -> Result<(), TaxonomyError> {
        let mut store = MemoryTaxonomy::default();
        let mut synonym = species("Pinus", "sumatrana");
        synonym.taxonomic_status = TaxonomicStatus::Synonym;
        synonym.accepted_scientific_name = Some("Pinus merkusii".to_string());
        let synonym_id = store.add(synonym);

        let by_name = resolve_with(&mut store, &OfflineSearch, &request("Pinus sumatrana"))?;
        assert_eq!(by_name.taxon_id, synonym_id);
        assert!(by_name.used_synonym);

        // The accepted name is absent locally, so the synonym row answers for it.
        let by_accepted = resolve_with(&mut store, &OfflineSearch, &request("Pinus merkusii"))?;
        assert_eq!(by_accepted.taxon_id, synonym_id);
        assert_eq!(by_accepted.matched_by, "synonym.accepted_name");
        Ok(())
    }

    #[test]
    fn unknown_placeholder_is_created_once_per_rank() -> Result<(), TaxonomyError> {
        let mut store = MemoryTaxonomy::default();
        let mut with_rank = request("Unknown");
        with_rank.requested_rank = Some(TaxonRank::Family);

        let first = resolve_with(&mut store, &OfflineSearch, &with_rank)?;
        let second = resolve_with(&mut store, &OfflineSearch, &with_rank)?;
        assert_eq!(first.taxon_id, second.taxon_id);
        assert_eq!(first.rank, TaxonRank::Family);

        let bare = resolve_with(&mut store, &OfflineSearch, &request("Unknown"))?;
        assert_ne!(bare.taxon_id, first.taxon_id);
        assert_eq!(bare.rank, TaxonRank::Unknown);
        assert_eq!(store.rows.len(), 2);
        Ok(())
    }

    #[test]
    fn unmatched_kingdom_is_created_then_reused() -> Result<(), TaxonomyError> {
        let mut store = MemoryTaxonomy::default();
        let created = resolve_with(&mut store, &OfflineSearch, &request("Plantae"))?;
        assert_eq!(created.matched_by, "kingdom.created");
        let again = resolve_with(&mut store, &OfflineSearch, &request("Plantae"))?;
        assert_eq!(again.taxon_id, created.taxon_id);
        assert_eq!(store.rows.len(), 1);
        Ok(())
    }

    #[test]
    fn genus_miss_falls_back_to_class_column() -> Result<(), TaxonomyError> {
        let mut store = MemoryTaxonomy::default();
        let class_id = store.add(NewTaxon {
            lineage: Lineage { class: Some("Sauropsida".to_string()), ..Lineage::default() },
            ..NewTaxon::named("Sauropsida", TaxonRank::Class)
        });

        let resolution = resolve_with(&mut store, &OfflineSearch, &request("Sauropsid"))?;
        assert_eq!(resolution.taxon_id, class_id);
        assert_eq!(resolution.matched_by, "genus.fallback_class");
        Ok(())
    }

    #[test]
    fn infraspecific_names_match_marked_scientific_names() -> Result<(), TaxonomyError> {
        let mut store = MemoryTaxonomy::default();
        let variety_id =
            store.add(NewTaxon::named("Ficus benjamina var. nuda (Miq.) Barrett", TaxonRank::Variety));

        let resolution = resolve_with(&mut store, &OfflineSearch, &request("Ficus benjamina var. nuda"))?;
        assert_eq!(resolution.taxon_id, variety_id);
        assert_eq!(resolution.matched_by, "variety.marked_prefix");
        Ok(())
    }

    #[test]
    fn species_rank_without_epithet_is_invalid() {
        let mut store = MemoryTaxonomy::default();
        let mut req = request("Pinus");
        req.requested_rank = Some(TaxonRank::Species);
        let result = resolve_with(&mut store, &OfflineSearch, &req);
        assert!(matches!(result, Err(TaxonomyError::InvalidNameFormat(_))));
    }

    #[test]
    fn search_prefers_rank_match_and_reports_misses() -> Result<(), TaxonomyError> {
        let mut store = MemoryTaxonomy::default();
        let search = ScriptedSearch::returning(vec![
            SearchHit { id: 40, scientific_name: "Nepenthes".to_string(), rank: TaxonRank::Genus },
            SearchHit {
                id: 41,
                scientific_name: "Nepenthes rafflesiana".to_string(),
                rank: TaxonRank::Species,
            },
        ]);
        let resolution = resolve_with(&mut store, &search, &request("Nepenthes rafflesiana"))?;
        assert_eq!(resolution.taxon_id, 41);
        assert_eq!(resolution.matched_by, "search.rank_match");

        let empty = ScriptedSearch::returning(Vec::new());
        let missing = resolve_with(&mut store, &empty, &request("Nepenthes ampullaria"));
        assert_eq!(
            missing,
            Err(TaxonomyError::TaxaNotFound {
                name: "Nepenthes ampullaria".to_string(),
                rank: Some(TaxonRank::Species),
            })
        );
        Ok(())
    }

    #[test]
    fn search_failure_is_not_a_miss() {
        let mut store = MemoryTaxonomy::default();
        let result = resolve_with(&mut store, &ScriptedSearch::failing(), &request("Durio zibethinus"));
        assert!(matches!(result, Err(TaxonomyError::CollaboratorTimeout(_))));
    }

    #[test]
    fn plant_trinomial_is_searched_as_species() {
        let mut store = MemoryTaxonomy::default();
        let search = ScriptedSearch::returning(Vec::new());
        let result = resolve_with(&mut store, &search, &request("Pinus merkusii sumatrana"));
        assert!(matches!(result, Err(TaxonomyError::TaxaNotFound { .. })));
        assert_eq!(search.hints.borrow().as_slice(), &[Some(TaxonRank::Species)]);
    }

    fn genus_strategy() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{3,10}".prop_filter("placeholder and table names are resolved specially", |name| {
            name != UNKNOWN_TAXON_NAME && tables().special_rank(name).is_none()
        })
    }

    fn epithet_strategy() -> impl Strategy<Value = String> {
        "[a-z]{4,12}"
            .prop_filter("infra markers are not epithets", |name| InfraMarker::from_token(name).is_none())
    }

    proptest! {
        #[test]
        fn property_exact_binomial_resolution_is_idempotent(
            genus in genus_strategy(),
            epithet in epithet_strategy(),
            author in prop::sample::select(vec!["", " L.", " Lindl.", " Blume", " (L.) Merr.", " Jungh. & de Vriese"]),
        ) {
            let mut store = MemoryTaxonomy::default();
            let id = store.add(species(&genus, &epithet));
            let plain = format!("{genus} {epithet}");
            let cited = format!("{plain}{author}");

            let first = resolve_with(&mut store, &OfflineSearch, &request(&plain));
            let second = resolve_with(&mut store, &OfflineSearch, &request(&plain));
            let with_author = resolve_with(&mut store, &OfflineSearch, &request(&cited));
            prop_assert_eq!(first.map(|r| r.taxon_id), Ok(id));
            prop_assert_eq!(second.map(|r| r.taxon_id), Ok(id));
            prop_assert_eq!(with_author.map(|r| r.taxon_id), Ok(id));
            prop_assert_eq!(store.rows.len(), 1);
        }
    }
}

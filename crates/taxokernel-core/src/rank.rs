//! Rule-based rank inference for names submitted without an explicit rank.

use serde::{Deserialize, Serialize};

use crate::names::{is_capitalized_word, NameTables, ParsedName};
use crate::TaxonRank;

/// Which rule produced an [`InferredRank`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RankRule {
    CallerSupplied,
    SpecialTaxon,
    InfraMarker,
    GenusWithAuthor,
    GenusWithComplexAuthor,
    SingleToken,
    Binomial,
    SpeciesWithAuthor,
    SubspeciesShape,
    MultiWordDefault,
}

impl RankRule {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CallerSupplied => "caller_supplied",
            Self::SpecialTaxon => "special_taxon",
            Self::InfraMarker => "infra_marker",
            Self::GenusWithAuthor => "genus_with_author",
            Self::GenusWithComplexAuthor => "genus_with_complex_author",
            Self::SingleToken => "single_token",
            Self::Binomial => "binomial",
            Self::SpeciesWithAuthor => "species_with_author",
            Self::SubspeciesShape => "subspecies_shape",
            Self::MultiWordDefault => "multi_word_default",
        }
    }
}

/// Rank chosen for a name plus the name the resolver should search with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InferredRank {
    pub rank: TaxonRank,
    pub canonical_name: String,
    pub rule: RankRule,
}

type RankCheck = fn(&ParsedName, &NameTables) -> Option<TaxonRank>;

/// Evaluated top to bottom; the first rule returning a rank wins.
const RULES: [(RankRule, RankCheck); 9] = [
    (RankRule::SpecialTaxon, special_taxon),
    (RankRule::InfraMarker, infra_marker),
    (RankRule::GenusWithAuthor, genus_with_author),
    (RankRule::GenusWithComplexAuthor, genus_with_complex_author),
    (RankRule::SingleToken, single_token),
    (RankRule::Binomial, binomial),
    (RankRule::SpeciesWithAuthor, species_with_author),
    (RankRule::SubspeciesShape, subspecies_shape),
    (RankRule::MultiWordDefault, multi_word_default),
];

/// Pick a rank for `parsed`. A caller-supplied rank always wins.
#[must_use]
pub fn detect_rank(
    parsed: &ParsedName,
    requested: Option<TaxonRank>,
    tables: &NameTables,
) -> InferredRank {
    if let Some(rank) = requested {
        return InferredRank {
            rank,
            canonical_name: canonical_for_rank(parsed, rank),
            rule: RankRule::CallerSupplied,
        };
    }

    for (rule, check) in RULES {
        if let Some(rank) = check(parsed, tables) {
            tracing::debug!(name = %parsed.normalized, rank = %rank, rule = rule.as_str(), "rank inferred");
            return InferredRank { rank, canonical_name: canonical_for_rule(parsed, rule), rule };
        }
    }

    InferredRank {
        rank: TaxonRank::Genus,
        canonical_name: parsed.normalized.clone(),
        rule: RankRule::SingleToken,
    }
}

/// Whether a name detected as SUBSPECIES is more likely a plant species with an author.
#[must_use]
pub fn looks_like_plant_species_with_author(parsed: &ParsedName, tables: &NameTables) -> bool {
    let tokens = &parsed.tokens;
    if tokens.len() < 3 {
        return false;
    }
    tables.is_common_plant_genus(&tokens[0])
        || starts_uppercase(&tokens[2])
        || tables.has_plant_author_sign(&parsed.normalized)
}

fn canonical_for_rank(parsed: &ParsedName, rank: TaxonRank) -> String {
    match rank {
        TaxonRank::Genus => first_token(parsed),
        _ if parsed.base_name.is_empty() => parsed.normalized.clone(),
        _ => parsed.base_name.clone(),
    }
}

fn canonical_for_rule(parsed: &ParsedName, rule: RankRule) -> String {
    match rule {
        RankRule::GenusWithAuthor | RankRule::GenusWithComplexAuthor => first_token(parsed),
        RankRule::InfraMarker | RankRule::SpeciesWithAuthor | RankRule::MultiWordDefault => {
            parsed.base_name.clone()
        }
        _ => parsed.normalized.clone(),
    }
}

fn first_token(parsed: &ParsedName) -> String {
    parsed.tokens.first().cloned().unwrap_or_default()
}

fn starts_uppercase(token: &str) -> bool {
    token.chars().next().is_some_and(char::is_uppercase)
}

fn special_taxon(parsed: &ParsedName, tables: &NameTables) -> Option<TaxonRank> {
    tables.special_rank(&parsed.normalized)
}

fn infra_marker(parsed: &ParsedName, _: &NameTables) -> Option<TaxonRank> {
    parsed.infra_marker.map(crate::InfraMarker::rank)
}

fn genus_with_author(parsed: &ParsedName, tables: &NameTables) -> Option<TaxonRank> {
    match parsed.tokens.as_slice() {
        [genus, author] if is_capitalized_word(genus) && tables.is_author_token(author) => {
            Some(TaxonRank::Genus)
        }
        _ => None,
    }
}

fn genus_with_complex_author(parsed: &ParsedName, _: &NameTables) -> Option<TaxonRank> {
    let tokens = &parsed.tokens;
    (tokens.len() >= 3 && tokens.iter().any(|token| token == "ex") && is_capitalized_word(&tokens[0]))
        .then_some(TaxonRank::Genus)
}

fn single_token(parsed: &ParsedName, _: &NameTables) -> Option<TaxonRank> {
    (parsed.tokens.len() == 1).then_some(TaxonRank::Genus)
}

fn binomial(parsed: &ParsedName, _: &NameTables) -> Option<TaxonRank> {
    (parsed.tokens.len() == 2).then_some(TaxonRank::Species)
}

fn species_with_author(parsed: &ParsedName, tables: &NameTables) -> Option<TaxonRank> {
    let tokens = &parsed.tokens;
    if tokens.len() < 3 {
        return None;
    }
    let name = parsed.normalized.as_str();
    let author_signs = tables.matches_species_with_author(name)
        || tables.has_typical_author_abbreviation(name)
        || tokens[2..].iter().any(|token| tables.is_gazetteer_author(token))
        || [" & ", " et ", " ex "].iter().any(|marker| name.contains(marker))
        || tables.has_parenthetical(name)
        || starts_uppercase(&tokens[2]);
    author_signs.then_some(TaxonRank::Species)
}

fn subspecies_shape(parsed: &ParsedName, tables: &NameTables) -> Option<TaxonRank> {
    let tokens = &parsed.tokens;
    if tokens.len() != 3 || tables.has_parenthetical(&parsed.normalized) {
        return None;
    }
    let third = &tokens[2];
    let unmarked = !third.chars().any(|c| c.is_uppercase() || c == '.');
    unmarked.then_some(TaxonRank::Subspecies)
}

fn multi_word_default(parsed: &ParsedName, _: &NameTables) -> Option<TaxonRank> {
    (parsed.tokens.len() >= 3).then_some(TaxonRank::Species)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::parse_name;

    fn tables() -> NameTables {
        NameTables::builtin().unwrap_or_else(|err| panic!("builtin tables failed to load: {err}"))
    }

    fn infer(raw: &str) -> InferredRank {
        let tables = tables();
        let parsed =
            parse_name(raw, &tables).unwrap_or_else(|err| panic!("failed to parse {raw}: {err}"));
        detect_rank(&parsed, None, &tables)
    }

    #[test]
    fn truth_table_matches_expected_ranks() {
        let cases = [
            ("Pinus", TaxonRank::Genus, "Pinus"),
            ("Pinus merkusii", TaxonRank::Species, "Pinus merkusii"),
            ("Pinus merkusii Jungh. & de Vriese", TaxonRank::Species, "Pinus merkusii"),
            ("Pinus merkusii subsp. sumatrana", TaxonRank::Subspecies, "Pinus merkusii subsp. sumatrana"),
            ("Coelogyne Lindl.", TaxonRank::Genus, "Coelogyne"),
            ("Malaxis Sol. ex Sw.", TaxonRank::Genus, "Malaxis"),
            ("Mammalia", TaxonRank::Class, "Mammalia"),
            ("Elasmobranchii", TaxonRank::Subclass, "Elasmobranchii"),
            ("Crustacea", TaxonRank::Subphylum, "Crustacea"),
            ("Plantae", TaxonRank::Kingdom, "Plantae"),
            ("Ficus benjamina var. nuda", TaxonRank::Variety, "Ficus benjamina var. nuda"),
            ("Rosa canina f. alba", TaxonRank::Form, "Rosa canina f. alba"),
            ("Canis lupus familiaris", TaxonRank::Subspecies, "Canis lupus familiaris"),
            ("Ardea alba (Linnaeus)", TaxonRank::Species, "Ardea alba"),
            ("Mangifera indica L.", TaxonRank::Species, "Mangifera indica"),
        ];

        for (raw, rank, canonical) in cases {
            let inferred = infer(raw);
            assert_eq!(inferred.rank, rank, "rank mismatch for {raw} ({:?})", inferred.rule);
            assert_eq!(inferred.canonical_name, canonical, "canonical mismatch for {raw}");
        }
    }

    #[test]
    fn caller_rank_always_wins() {
        let tables = tables();
        let parsed = parse_name("Mammalia", &tables)
            .unwrap_or_else(|err| panic!("failed to parse fixture: {err}"));
        let inferred = detect_rank(&parsed, Some(TaxonRank::Order), &tables);
        assert_eq!(inferred.rank, TaxonRank::Order);
        assert_eq!(inferred.rule, RankRule::CallerSupplied);

        let parsed = parse_name("Coelogyne Lindl.", &tables)
            .unwrap_or_else(|err| panic!("failed to parse fixture: {err}"));
        let inferred = detect_rank(&parsed, Some(TaxonRank::Genus), &tables);
        assert_eq!(inferred.canonical_name, "Coelogyne");
    }

    #[test]
    fn complex_author_rule_shadows_species_with_ex_citation() {
        // Rule order makes any capitalized name containing `ex` a genus.
        let inferred = infer("Dendrobium crumenatum Sw. ex Lindl.");
        assert_eq!(inferred.rank, TaxonRank::Genus);
        assert_eq!(inferred.rule, RankRule::GenusWithComplexAuthor);
    }

    #[test]
    fn plant_species_hint_uses_genus_table_and_author_shape() {
        let tables = tables();
        for (raw, expected) in [
            ("Pinus merkusii sumatrana", true),
            ("Canis lupus Linnaeus", true),
            ("Canis lupus familiaris", false),
            ("Canis lupus", false),
        ] {
            let parsed = parse_name(raw, &tables)
                .unwrap_or_else(|err| panic!("failed to parse {raw}: {err}"));
            assert_eq!(looks_like_plant_species_with_author(&parsed, &tables), expected, "{raw}");
        }
    }
}

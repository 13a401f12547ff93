use std::time::Duration;

use serde::Deserialize;
use taxokernel_core::{
    Lineage, NewTaxon, SearchHit, Taxon, TaxonColumn, TaxonQuery, TaxonRank, TaxonSearch,
    TaxonomicStatus, TaxonomyError, TaxonomyStore,
};

use crate::config::ApiConfig;

/// One entry of a GBIF `species/suggest` response.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct GbifSuggestion {
    pub key: Option<i64>,
    pub scientific_name: String,
    pub canonical_name: Option<String>,
    pub rank: Option<String>,
    pub status: Option<String>,
    pub accepted: Option<String>,
    pub kingdom: Option<String>,
    pub phylum: Option<String>,
    pub class: Option<String>,
    pub order: Option<String>,
    pub family: Option<String>,
    pub genus: Option<String>,
    pub species: Option<String>,
}

impl GbifSuggestion {
    /// Local row for this suggestion, named by its canonical (author-free) name.
    #[must_use]
    pub fn to_new_taxon(&self) -> NewTaxon {
        let name = self
            .canonical_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.scientific_name.clone());
        let rank = self.rank.as_deref().and_then(TaxonRank::parse).unwrap_or(TaxonRank::Unknown);
        let mut status = self
            .status
            .as_deref()
            .and_then(TaxonomicStatus::parse)
            .unwrap_or(TaxonomicStatus::Unknown);
        if status == TaxonomicStatus::Synonym && self.accepted.is_none() {
            status = TaxonomicStatus::Unknown;
        }

        // GBIF reports `species` as the full binomial; the lineage keeps the epithet.
        let epithet = self.species.as_deref().map(|binomial| {
            self.genus
                .as_deref()
                .and_then(|genus| binomial.strip_prefix(genus))
                .map_or(binomial, str::trim)
                .to_string()
        });

        let mut lineage = Lineage {
            kingdom: self.kingdom.clone(),
            phylum: self.phylum.clone(),
            class: self.class.clone(),
            order: self.order.clone(),
            family: self.family.clone(),
            genus: self.genus.clone(),
            species: epithet,
            ..Lineage::default()
        };
        if rank.is_infraspecific() {
            if let Some(column) = rank.lineage_column() {
                lineage.set(column, name.split_whitespace().last().map(str::to_string));
            }
        }

        NewTaxon {
            scientific_name: name,
            taxon_rank: rank,
            taxonomic_status: status,
            accepted_scientific_name: self.accepted.clone(),
            lineage,
        }
    }
}

/// Last-resort search: local substring match first, then the GBIF suggest endpoint.
pub struct GbifTaxonSearch {
    agent: ureq::Agent,
    base_url: String,
    limit: usize,
}

impl GbifTaxonSearch {
    #[must_use]
    pub fn new(config: &ApiConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.search_timeout_ms))
            .build();
        Self { agent, base_url: config.search_base_url.clone(), limit: config.search_limit }
    }

    fn fetch_suggestions(
        &self,
        name: &str,
        rank_hint: Option<TaxonRank>,
    ) -> Result<Vec<GbifSuggestion>, TaxonomyError> {
        let url = format!("{}/species/suggest", self.base_url);
        let mut request =
            self.agent.get(&url).query("q", name).query("limit", &self.limit.to_string());
        if let Some(rank) = rank_hint {
            request = request.query("rank", rank.as_str());
        }

        let response = request.call().map_err(|err| match err {
            ureq::Error::Status(code, _) => {
                TaxonomyError::CollaboratorTimeout(format!("{url} returned HTTP {code}"))
            }
            other => TaxonomyError::CollaboratorTimeout(format!("{url}: {other}")),
        })?;
        response.into_json::<Vec<GbifSuggestion>>().map_err(|err| {
            TaxonomyError::CollaboratorTimeout(format!("malformed {url} response: {err}"))
        })
    }
}

impl TaxonSearch for GbifTaxonSearch {
    fn search(
        &self,
        store: &mut dyn TaxonomyStore,
        name: &str,
        rank_hint: Option<TaxonRank>,
        source: &str,
    ) -> Result<Vec<SearchHit>, TaxonomyError> {
        let name = name.trim();
        if name.chars().count() < 2 {
            return Ok(Vec::new());
        }

        let local = TaxonQuery::new("search.local").contains(TaxonColumn::ScientificName, name);
        let rows = store.find_many(&local, self.limit)?;
        if !rows.is_empty() {
            tracing::debug!(name, hits = rows.len(), "search answered locally");
            return Ok(rows.into_iter().map(hit_for).collect());
        }

        tracing::info!(name, rank = ?rank_hint, source, "querying GBIF suggest");
        let suggestions = self.fetch_suggestions(name, rank_hint)?;
        let mut hits = Vec::with_capacity(suggestions.len());
        for suggestion in suggestions.iter().take(self.limit) {
            let taxon = upsert_by_name(store, &suggestion.to_new_taxon())?;
            hits.push(hit_for(taxon));
        }
        Ok(hits)
    }
}

fn hit_for(taxon: Taxon) -> SearchHit {
    SearchHit { id: taxon.id, scientific_name: taxon.scientific_name, rank: taxon.taxon_rank }
}

fn upsert_by_name(store: &mut dyn TaxonomyStore, taxon: &NewTaxon) -> Result<Taxon, TaxonomyError> {
    let existing = TaxonQuery::new("search.upsert")
        .exact(TaxonColumn::ScientificName, &taxon.scientific_name)
        .with_rank(taxon.taxon_rank);
    if let Some(found) = store.find_first(&existing)? {
        return Ok(found);
    }
    store.insert_taxon(taxon)
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::path::Path;
    use std::thread;

    use anyhow::{anyhow, Result};
    use taxokernel_store_sqlite::SqliteStore;

    use super::*;

    const SUGGEST_BODY: &str = r#"[
      {"key": 5284517, "scientificName": "Nepenthes rafflesiana Jack", "canonicalName": "Nepenthes rafflesiana",
       "rank": "SPECIES", "status": "ACCEPTED", "kingdom": "Plantae", "family": "Nepenthaceae",
       "genus": "Nepenthes", "species": "Nepenthes rafflesiana"},
      {"key": 3189407, "scientificName": "Nepenthes L.", "canonicalName": "Nepenthes",
       "rank": "GENUS", "status": "ACCEPTED", "kingdom": "Plantae", "family": "Nepenthaceae",
       "genus": "Nepenthes"}
    ]"#;

    /// Serve exactly one canned HTTP response and return the base URL.
    fn serve_once(status_line: &'static str, body: &'static str) -> Result<(String, thread::JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(&stream);
            let mut line = String::new();
            while reader.read_line(&mut line).is_ok_and(|read| read > 0) {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        });
        Ok((format!("http://{addr}"), handle))
    }

    fn search_against(base_url: String) -> GbifTaxonSearch {
        GbifTaxonSearch::new(&ApiConfig {
            search_enabled: true,
            search_base_url: base_url,
            search_timeout_ms: 2_000,
            ..ApiConfig::default()
        })
    }

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    #[test]
    fn suggestions_are_upserted_and_then_served_locally() -> Result<()> {
        let (base_url, server) = serve_once("200 OK", SUGGEST_BODY)?;
        let search = search_against(base_url);
        let mut store = migrated_store()?;

        let hits = search.search(&mut store, "Nepenthes raff", Some(TaxonRank::Species), "test")?;
        if server.join().is_err() {
            return Err(anyhow!("canned server panicked"));
        }
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].scientific_name, "Nepenthes rafflesiana");
        assert_eq!(hits[0].rank, TaxonRank::Species);

        let stored = store
            .get_taxon(hits[0].id)?
            .ok_or_else(|| anyhow!("suggested taxon was not stored"))?;
        assert_eq!(stored.lineage.genus.as_deref(), Some("Nepenthes"));
        assert_eq!(stored.lineage.species.as_deref(), Some("rafflesiana"));

        // The server is gone; the second lookup must not leave the store.
        let again = search.search(&mut store, "Nepenthes raff", Some(TaxonRank::Species), "test")?;
        assert_eq!(again.first().map(|hit| hit.id), Some(hits[0].id));
        Ok(())
    }

    #[test]
    fn error_status_is_a_collaborator_failure() -> Result<()> {
        let (base_url, server) = serve_once("503 Service Unavailable", "{}")?;
        let search = search_against(base_url);
        let mut store = migrated_store()?;

        let result = search.search(&mut store, "Durio zibethinus", None, "test");
        if server.join().is_err() {
            return Err(anyhow!("canned server panicked"));
        }
        assert!(matches!(result, Err(TaxonomyError::CollaboratorTimeout(_))));
        Ok(())
    }

    #[test]
    fn malformed_body_is_a_collaborator_failure() -> Result<()> {
        let (base_url, server) = serve_once("200 OK", r#"{"results": "not a list"}"#)?;
        let search = search_against(base_url);
        let mut store = migrated_store()?;

        let result = search.search(&mut store, "Durio zibethinus", None, "test");
        if server.join().is_err() {
            return Err(anyhow!("canned server panicked"));
        }
        let Err(TaxonomyError::CollaboratorTimeout(message)) = result else {
            return Err(anyhow!("malformed suggestion body was accepted"));
        };
        assert!(message.contains("malformed"), "unexpected message: {message}");
        Ok(())
    }

    #[test]
    fn unreachable_endpoint_is_a_collaborator_failure() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let base_url = format!("http://{}", listener.local_addr()?);
        drop(listener);

        let mut store = migrated_store()?;
        let result = search_against(base_url).search(&mut store, "Durio zibethinus", None, "test");
        assert!(matches!(result, Err(TaxonomyError::CollaboratorTimeout(_))));
        Ok(())
    }

    #[test]
    fn short_queries_return_nothing() -> Result<()> {
        let mut store = migrated_store()?;
        let search = search_against("http://127.0.0.1:9".to_string());
        assert!(search.search(&mut store, " P ", None, "test")?.is_empty());
        Ok(())
    }

    #[test]
    fn synonym_without_accepted_name_is_stored_as_unknown_status() {
        let suggestion = GbifSuggestion {
            scientific_name: "Pinus sumatrana Jungh.".to_string(),
            canonical_name: Some("Pinus sumatrana".to_string()),
            rank: Some("SPECIES".to_string()),
            status: Some("SYNONYM".to_string()),
            genus: Some("Pinus".to_string()),
            species: Some("Pinus sumatrana".to_string()),
            ..GbifSuggestion::default()
        };
        let taxon = suggestion.to_new_taxon();
        assert_eq!(taxon.scientific_name, "Pinus sumatrana");
        assert_eq!(taxon.taxonomic_status, TaxonomicStatus::Unknown);
        assert!(taxon.validate().is_ok());
    }
}

use serde::{Deserialize, Serialize};

pub const SEARCH_ENABLED_ENV: &str = "TAXOKERNEL_SEARCH_ENABLED";
pub const SEARCH_BASE_URL_ENV: &str = "TAXOKERNEL_SEARCH_BASE_URL";
pub const SEARCH_TIMEOUT_MS_ENV: &str = "TAXOKERNEL_SEARCH_TIMEOUT_MS";
pub const SEARCH_LIMIT_ENV: &str = "TAXOKERNEL_SEARCH_LIMIT";
pub const DEFAULT_SOURCE_ENV: &str = "TAXOKERNEL_DEFAULT_SOURCE";

const DEFAULT_BASE_URL: &str = "https://api.gbif.org/v1";
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SEARCH_LIMIT: usize = 10;
const DEFAULT_SOURCE: &str = "taxokernel";

/// Runtime settings for the api facade. The external search stays off unless enabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    pub search_enabled: bool,
    pub search_base_url: String,
    pub search_timeout_ms: u64,
    pub search_limit: usize,
    pub default_source: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            search_enabled: false,
            search_base_url: DEFAULT_BASE_URL.to_string(),
            search_timeout_ms: DEFAULT_TIMEOUT_MS,
            search_limit: DEFAULT_SEARCH_LIMIT,
            default_source: DEFAULT_SOURCE.to_string(),
        }
    }
}

impl ApiConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from any variable lookup; unset or malformed values keep defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            search_enabled: parse_bool(lookup(SEARCH_ENABLED_ENV), defaults.search_enabled),
            search_base_url: lookup(SEARCH_BASE_URL_ENV)
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.search_base_url),
            search_timeout_ms: lookup(SEARCH_TIMEOUT_MS_ENV)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map_or(defaults.search_timeout_ms, |v| v.clamp(100, 30_000)),
            search_limit: lookup(SEARCH_LIMIT_ENV)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .map_or(defaults.search_limit, |v| v.clamp(1, 100)),
            default_source: lookup(DEFAULT_SOURCE_ENV)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.default_source),
        }
    }
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| value.trim().to_ascii_lowercase())
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> ApiConfig {
        let vars = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<BTreeMap<_, _>>();
        ApiConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn unset_variables_keep_defaults() {
        assert_eq!(config_from(&[]), ApiConfig::default());
    }

    #[test]
    fn values_are_normalized_and_clamped() {
        let config = config_from(&[
            (SEARCH_ENABLED_ENV, " Yes "),
            (SEARCH_BASE_URL_ENV, "http://localhost:8080/v1/ "),
            (SEARCH_TIMEOUT_MS_ENV, "5"),
            (SEARCH_LIMIT_ENV, "5000"),
            (DEFAULT_SOURCE_ENV, "  "),
        ]);
        assert!(config.search_enabled);
        assert_eq!(config.search_base_url, "http://localhost:8080/v1");
        assert_eq!(config.search_timeout_ms, 100);
        assert_eq!(config.search_limit, 100);
        assert_eq!(config.default_source, DEFAULT_SOURCE);

        let malformed = config_from(&[(SEARCH_ENABLED_ENV, "maybe"), (SEARCH_TIMEOUT_MS_ENV, "soon")]);
        assert!(!malformed.search_enabled);
        assert_eq!(malformed.search_timeout_ms, DEFAULT_TIMEOUT_MS);
    }
}

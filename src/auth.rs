//! Provider-credential normalization
//!
//! Create requests may carry zero, one, or many `{provider, apiKey?, env?}`
//! entries. This module canonicalizes them: synthesizing a default entry from
//! the environment, validating shape, and deduplicating providers last-wins
//! while preserving first-appearance order.

use std::collections::HashMap;

use crate::error::{Result, ServerboxError};
use crate::types::ProviderAuth;

/// Environment keys consulted when no auth entries are supplied, in priority
/// order.
const DEFAULT_KEY_VARS: [&str; 2] = ["OPENCODE_ZEN_API_KEY", "OPENCODE_API_KEY"];

/// Validate and canonicalize provider-auth entries.
///
/// The environment is passed explicitly so the synthesis rule is testable
/// without process-global mutation.
pub fn normalize_provider_auth(
    input: Option<Vec<ProviderAuth>>,
    env: &HashMap<String, String>,
) -> Result<Vec<ProviderAuth>> {
    let entries = match input {
        Some(entries) => entries,
        None => {
            let key = DEFAULT_KEY_VARS
                .iter()
                .find_map(|var| env.get(*var).filter(|v| !v.is_empty()).cloned())
                .ok_or(ServerboxError::MissingAuth)?;
            vec![ProviderAuth {
                provider: "opencode".to_string(),
                api_key: Some(key),
                env: None,
            }]
        }
    };

    if entries.is_empty() {
        return Err(ServerboxError::MissingAuth);
    }

    for entry in &entries {
        if entry.provider.is_empty() {
            return Err(ServerboxError::InvalidConfig(
                "auth entry is missing a provider".to_string(),
            ));
        }
        let has_key = entry.api_key.as_ref().is_some_and(|k| !k.is_empty());
        let has_env = entry.env.as_ref().is_some_and(|e| !e.is_empty());
        if !has_key && !has_env {
            return Err(ServerboxError::InvalidConfig(format!(
                "auth entry for provider '{}' needs an apiKey or env",
                entry.provider
            )));
        }
    }

    // Last occurrence wins; first-appearance order is preserved.
    let mut order: Vec<String> = Vec::new();
    let mut by_provider: HashMap<String, ProviderAuth> = HashMap::new();
    for entry in entries {
        if !by_provider.contains_key(&entry.provider) {
            order.push(entry.provider.clone());
        }
        by_provider.insert(entry.provider.clone(), entry);
    }

    Ok(order
        .into_iter()
        .filter_map(|provider| by_provider.remove(&provider))
        .collect())
}

/// Map of provider name to API key, excluding entries without one.
pub fn build_auth_record(entries: &[ProviderAuth]) -> HashMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| {
            entry
                .api_key
                .as_ref()
                .map(|key| (entry.provider.clone(), key.clone()))
        })
        .collect()
}

/// Merge all `env` maps; later entries overwrite earlier ones on collision.
pub fn collect_provider_env(entries: &[ProviderAuth]) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    for entry in entries {
        if let Some(env) = &entry.env {
            for (key, value) in env {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

//! Storage migrations run every time a config file is opened.
//!
//! Each migration inspects the parsed document and rewrites it in place. They
//! run in a fixed order and must leave an already migrated document untouched.

use tracing::debug;

use super::{tokens_section_name, Document, INPUT_DEFAULT_PREFIX, TOKENS_SECTION_PREFIX};
use crate::auth::tokens::TOKEN_FIELDS;

/// One rewrite of the storage document.
pub trait Migration {
    fn name(&self) -> &'static str;

    /// Whether the document still holds data this migration rewrites.
    fn applicable(&self, doc: &Document) -> bool;

    fn apply(&self, doc: &mut Document);
}

/// Function ids used to be stored as `<fn>_funcx_id`.
pub struct RenameFuncxKeys;

const FUNCX_ID: &str = "_funcx_id";
const FUNCX_CHECKSUM: &str = "_funcx_id_checksum";

fn renamed_funcx_key(key: &str) -> Option<String> {
    if let Some(stem) = key.strip_suffix(FUNCX_CHECKSUM) {
        return Some(crate::naming::function_checksum_key(stem));
    }
    key.strip_suffix(FUNCX_ID)
        .map(crate::naming::function_id_key)
}

impl Migration for RenameFuncxKeys {
    fn name(&self) -> &'static str {
        "rename_funcx_keys"
    }

    fn applicable(&self, doc: &Document) -> bool {
        doc.iter()
            .filter(|(name, _)| !name.starts_with(TOKENS_SECTION_PREFIX))
            .any(|(_, values)| values.keys().any(|k| renamed_funcx_key(k).is_some()))
    }

    fn apply(&self, doc: &mut Document) {
        for (name, values) in doc.iter_mut() {
            if name.starts_with(TOKENS_SECTION_PREFIX) {
                continue;
            }
            let legacy: Vec<String> = values
                .keys()
                .filter(|k| renamed_funcx_key(k).is_some())
                .cloned()
                .collect();
            for key in legacy {
                let Some(value) = values.remove(&key) else {
                    continue;
                };
                if let Some(new_key) = renamed_funcx_key(&key) {
                    values.entry(new_key).or_insert(value);
                }
            }
        }
    }
}

/// Tokens used to live flattened in the general section next to `client_id`.
pub struct MoveTokensToTokenSection;

fn is_token_key(key: &str) -> bool {
    if key.starts_with(INPUT_DEFAULT_PREFIX) {
        return false;
    }
    key.rsplit_once("__")
        .is_some_and(|(scope, field)| !scope.is_empty() && TOKEN_FIELDS.contains(&field))
}

impl Migration for MoveTokensToTokenSection {
    fn name(&self) -> &'static str {
        "move_tokens_to_token_section"
    }

    fn applicable(&self, doc: &Document) -> bool {
        doc.iter().any(|(name, values)| {
            !name.starts_with(TOKENS_SECTION_PREFIX)
                && values.contains_key("client_id")
                && values.keys().any(|k| is_token_key(k))
        })
    }

    fn apply(&self, doc: &mut Document) {
        let general: Vec<String> = doc
            .keys()
            .filter(|name| !name.starts_with(TOKENS_SECTION_PREFIX))
            .cloned()
            .collect();

        for name in general {
            let Some(values) = doc.get_mut(&name) else {
                continue;
            };
            let Some(client_id) = values.get("client_id").cloned() else {
                continue;
            };
            let token_keys: Vec<String> =
                values.keys().filter(|k| is_token_key(k)).cloned().collect();
            if token_keys.is_empty() {
                continue;
            }

            let moved: Vec<(String, String)> = token_keys
                .into_iter()
                .filter_map(|k| values.remove(&k).map(|v| (k, v)))
                .collect();
            debug!(section = %name, count = moved.len(), "moving stored tokens");

            let tokens = doc.entry(tokens_section_name(&client_id)).or_default();
            for (key, value) in moved {
                tokens.entry(key).or_insert(value);
            }
        }
    }
}

/// Flow definitions are derived from code; only their checksum is kept.
pub struct DropLegacyFlowDefinition;

impl Migration for DropLegacyFlowDefinition {
    fn name(&self) -> &'static str {
        "drop_legacy_flow_definition"
    }

    fn applicable(&self, doc: &Document) -> bool {
        doc.values().any(|values| values.contains_key("flow_definition"))
    }

    fn apply(&self, doc: &mut Document) {
        for values in doc.values_mut() {
            values.remove("flow_definition");
        }
    }
}

/// Migrations in the order they run.
pub fn default_migrations() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(RenameFuncxKeys),
        Box::new(MoveTokensToTokenSection),
        Box::new(DropLegacyFlowDefinition),
    ]
}

/// Run every applicable migration, returning the names of those applied.
pub fn run_migrations(doc: &mut Document) -> Vec<&'static str> {
    let mut applied = Vec::new();
    for migration in default_migrations() {
        if migration.applicable(doc) {
            migration.apply(doc);
            applied.push(migration.name());
        }
    }
    applied
}

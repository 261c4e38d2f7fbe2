//! Token bundles, token responses and their flattened storage form.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::storage::Storage;
use crate::{Error, Result};

/// Per-scope fields kept in the tokens section as `<scope>__<field>`.
pub const TOKEN_FIELDS: &[&str] = &[
    "access_token",
    "refresh_token",
    "expires_at_seconds",
    "resource_server",
    "token_type",
];

const FIELD_SEPARATOR: &str = "__";

/// Seconds since the Unix epoch.
pub fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Credentials granted for one scope.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub scope: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// `None` means the token never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_server: Option<String>,
    pub token_type: String,
}

impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("scope", &self.scope)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at_seconds", &self.expires_at_seconds)
            .field("resource_server", &self.resource_server)
            .finish()
    }
}

impl TokenBundle {
    pub fn new(scope: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            access_token: access_token.into(),
            refresh_token: None,
            expires_at_seconds: None,
            resource_server: None,
            token_type: "Bearer".to_string(),
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn with_expires_at(mut self, seconds: u64) -> Self {
        self.expires_at_seconds = Some(seconds);
        self
    }

    pub fn with_resource_server(mut self, server: impl Into<String>) -> Self {
        self.resource_server = Some(server.into());
        self
    }

    /// Expired once `now >= expires_at`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at_seconds.is_some_and(|at| now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_seconds())
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("access_token", self.access_token.clone()),
            ("token_type", self.token_type.clone()),
        ];
        if let Some(token) = &self.refresh_token {
            fields.push(("refresh_token", token.clone()));
        }
        if let Some(at) = self.expires_at_seconds {
            fields.push(("expires_at_seconds", at.to_string()));
        }
        if let Some(server) = &self.resource_server {
            fields.push(("resource_server", server.clone()));
        }
        fields
    }
}

fn field_key(scope: &str, field: &str) -> String {
    format!("{scope}{FIELD_SEPARATOR}{field}")
}

/// Write `bundles` into `storage` (without saving).
pub fn store_bundles<'a>(
    storage: &dyn Storage,
    bundles: impl IntoIterator<Item = &'a TokenBundle>,
) -> Result<()> {
    for bundle in bundles {
        for field in TOKEN_FIELDS {
            storage.delete(&field_key(&bundle.scope, field))?;
        }
        for (field, value) in bundle.fields() {
            storage.set(&field_key(&bundle.scope, field), &value)?;
        }
    }
    Ok(())
}

/// Read every complete bundle stored in `storage`.
pub fn load_bundles(storage: &dyn Storage) -> Result<BTreeMap<String, TokenBundle>> {
    let mut scopes: Vec<String> = storage
        .keys()?
        .into_iter()
        .filter_map(|key| {
            key.rsplit_once(FIELD_SEPARATOR)
                .filter(|(_, field)| *field == "access_token")
                .map(|(scope, _)| scope.to_string())
        })
        .collect();
    scopes.dedup();

    let mut bundles = BTreeMap::new();
    for scope in scopes {
        let get = |field: &str| storage.get(&field_key(&scope, field));
        let Some(access_token) = get("access_token")? else {
            continue;
        };
        let bundle = TokenBundle {
            scope: scope.clone(),
            access_token,
            refresh_token: get("refresh_token")?,
            expires_at_seconds: get("expires_at_seconds")?.and_then(|v| v.parse().ok()),
            resource_server: get("resource_server")?,
            token_type: get("token_type")?.unwrap_or_else(|| "Bearer".to_string()),
        };
        bundles.insert(scope, bundle);
    }
    Ok(bundles)
}

/// Remove every stored token field (without saving).
pub fn clear_bundles(storage: &dyn Storage) -> Result<()> {
    for key in storage.keys()? {
        let is_token = key
            .rsplit_once(FIELD_SEPARATOR)
            .is_some_and(|(_, field)| TOKEN_FIELDS.contains(&field));
        if is_token {
            storage.delete(&key)?;
        }
    }
    Ok(())
}

/// A token endpoint response. Extra tokens for other resource servers arrive
/// in `other_tokens`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub resource_server: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub other_tokens: Vec<TokenResponse>,
}

impl TokenResponse {
    /// Pivot the response into one bundle per granted scope.
    ///
    /// A token may cover several space separated scopes. Two resource servers
    /// claiming the same scope is an error.
    pub fn into_bundles(self, now: u64) -> Result<BTreeMap<String, TokenBundle>> {
        let mut bundles: BTreeMap<String, TokenBundle> = BTreeMap::new();
        let mut pending = vec![self];

        while let Some(mut response) = pending.pop() {
            pending.extend(std::mem::take(&mut response.other_tokens));
            for scope in response.scope.split_whitespace() {
                let bundle = TokenBundle {
                    scope: scope.to_string(),
                    access_token: response.access_token.clone(),
                    refresh_token: response.refresh_token.clone(),
                    expires_at_seconds: response.expires_in.map(|secs| now + secs),
                    resource_server: response.resource_server.clone(),
                    token_type: response
                        .token_type
                        .clone()
                        .unwrap_or_else(|| "Bearer".to_string()),
                };
                if let Some(existing) = bundles.get(scope) {
                    if existing.resource_server != bundle.resource_server {
                        return Err(Error::auth(
                            format!(
                                "scope is claimed by resource servers {} and {}",
                                existing.resource_server.as_deref().unwrap_or("<unnamed>"),
                                bundle.resource_server.as_deref().unwrap_or("<unnamed>")
                            ),
                            [scope.to_string()],
                        ));
                    }
                }
                bundles.insert(scope.to_string(), bundle);
            }
        }
        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    #[test]
    fn test_expiry() {
        let bundle = TokenBundle::new("s", "t").with_expires_at(100);
        assert!(!bundle.is_expired_at(99));
        assert!(bundle.is_expired_at(100));
        assert!(!TokenBundle::new("s", "t").is_expired_at(u64::MAX));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let bundle = TokenBundle::new("s", "secret-access").with_refresh_token("secret-refresh");
        let debug = format!("{bundle:?}");
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
    }

    #[test]
    fn test_storage_round_trip() {
        let storage = MemoryStorage::new();
        let bundle = TokenBundle::new("https://auth.example.org/scopes/x/all", "tok")
            .with_refresh_token("ref")
            .with_expires_at(42)
            .with_resource_server("x");
        store_bundles(&storage, [&bundle]).unwrap();
        assert_eq!(
            storage
                .get("https://auth.example.org/scopes/x/all__expires_at_seconds")
                .unwrap()
                .as_deref(),
            Some("42")
        );

        let loaded = load_bundles(&storage).unwrap();
        assert_eq!(loaded.get(&bundle.scope), Some(&bundle));

        storage.set("flow_id", "keep").unwrap();
        clear_bundles(&storage).unwrap();
        assert!(load_bundles(&storage).unwrap().is_empty());
        assert_eq!(storage.get("flow_id").unwrap().as_deref(), Some("keep"));
    }

    #[test]
    fn test_response_pivot() {
        let response: TokenResponse = serde_json::from_value(json!({
            "access_token": "a",
            "scope": "openid profile",
            "resource_server": "auth",
            "expires_in": 10,
            "refresh_token": "r",
            "token_type": "Bearer",
            "other_tokens": [{
                "access_token": "b",
                "scope": "https://flows/scopes/run",
                "resource_server": "flows",
                "expires_in": 20
            }]
        }))
        .unwrap();

        let bundles = response.into_bundles(1000).unwrap();
        assert_eq!(bundles.len(), 3);
        assert_eq!(bundles["openid"].access_token, "a");
        assert_eq!(bundles["profile"].expires_at_seconds, Some(1010));
        assert_eq!(bundles["https://flows/scopes/run"].access_token, "b");
        assert_eq!(bundles["https://flows/scopes/run"].refresh_token, None);
    }

    #[test]
    fn test_duplicate_scope_claim_is_an_error() {
        let response: TokenResponse = serde_json::from_value(json!({
            "access_token": "a",
            "scope": "shared",
            "resource_server": "one",
            "other_tokens": [{"access_token": "b", "scope": "shared", "resource_server": "two"}]
        }))
        .unwrap();
        let err = response.into_bundles(0).unwrap_err();
        assert!(matches!(err, Error::Auth { ref scopes, .. } if scopes == &vec!["shared".to_string()]));
    }
}

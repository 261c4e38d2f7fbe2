//! Scope-driven login.
//!
//! The [`LoginManager`] tracks which scopes the client needs and which cached
//! tokens must be reacquired. [`LoginManager::ensure`] asks the configured
//! [`LoginBackend`] for exactly the missing scopes and nothing else, so a client
//! that already holds valid tokens never prompts.
//!
//! Backends:
//! - [`native::NativeLogin`]: interactive authorization-code login with PKCE
//! - [`callback::CallbackLogin`]: a caller-supplied closure
//! - [`confidential::ConfidentialLogin`]: client-credentials grant

pub mod callback;
pub mod confidential;
pub mod native;
pub mod tokens;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::storage::Storage;
use crate::{Error, Result};

pub use tokens::{now_seconds, TokenBundle, TokenResponse};

/// Default identity service.
pub const DEFAULT_AUTH_URL: &str = "https://auth.globus.org";

/// Redirect target that displays the authorization code to the user.
pub const NATIVE_REDIRECT_PATH: &str = "/v2/web/auth-code";

/// Credentials ready to attach to a request for one scope.
#[derive(Clone, PartialEq, Eq)]
pub struct Authorizer {
    pub scope: String,
    access_token: String,
    token_type: String,
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Authorizer {
    pub fn new(scope: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Value of the `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl From<&TokenBundle> for Authorizer {
    fn from(bundle: &TokenBundle) -> Self {
        Self {
            scope: bundle.scope.clone(),
            access_token: bundle.access_token.clone(),
            token_type: bundle.token_type.clone(),
        }
    }
}

/// How tokens are obtained for a set of scopes.
pub trait LoginBackend: Send {
    fn name(&self) -> &'static str;

    /// Obtain tokens for exactly `scopes`.
    fn login(&mut self, scopes: &[String]) -> Result<BTreeMap<String, TokenBundle>>;

    /// Renew an expired bundle without user interaction, if possible.
    fn refresh(&mut self, _bundle: &TokenBundle) -> Result<Option<TokenBundle>> {
        Ok(None)
    }

    /// Invalidate a bundle remotely.
    fn revoke(&mut self, _bundle: &TokenBundle) -> Result<()> {
        Ok(())
    }
}

/// Required scopes, pending scope changes and the token cache.
pub struct LoginManager {
    required: BTreeSet<String>,
    changes: BTreeSet<String>,
    bundles: BTreeMap<String, TokenBundle>,
    backend: Box<dyn LoginBackend>,
    storage: Option<Arc<dyn Storage>>,
}

/// A login manager shared by the managers of one client.
pub type SharedLogin = Arc<Mutex<LoginManager>>;

/// Lock a shared login manager.
pub fn lock(login: &SharedLogin) -> Result<MutexGuard<'_, LoginManager>> {
    login
        .lock()
        .map_err(|_| Error::Config("login manager lock poisoned".into()))
}

impl std::fmt::Debug for LoginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginManager")
            .field("backend", &self.backend.name())
            .field("required", &self.required)
            .field("changes", &self.changes)
            .field("cached", &self.bundles.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LoginManager {
    pub fn new(backend: impl LoginBackend + 'static) -> Self {
        Self::from_boxed(Box::new(backend))
    }

    pub fn from_boxed(backend: Box<dyn LoginBackend>) -> Self {
        Self {
            required: BTreeSet::new(),
            changes: BTreeSet::new(),
            bundles: BTreeMap::new(),
            backend,
            storage: None,
        }
    }

    /// Persist tokens in `storage`, loading any already stored there.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Result<Self> {
        self.attach_storage(storage)?;
        Ok(self)
    }

    pub fn attach_storage(&mut self, storage: Arc<dyn Storage>) -> Result<()> {
        let stored = tokens::load_bundles(storage.as_ref())?;
        debug!(count = stored.len(), "loaded stored tokens");
        for (scope, bundle) in stored {
            self.bundles.entry(scope).or_insert(bundle);
        }
        self.storage = Some(storage);
        Ok(())
    }

    pub fn has_storage(&self) -> bool {
        self.storage.is_some()
    }

    pub fn into_shared(self) -> SharedLogin {
        Arc::new(Mutex::new(self))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Grow the required set.
    pub fn add_required<I, S>(&mut self, scopes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for scope in scopes {
            let scope = scope.into();
            if self.required.insert(scope.clone()) {
                debug!(%scope, "scope required");
            }
        }
    }

    /// Drop `scope` from the required set and from pending changes.
    pub fn remove_required(&mut self, scope: &str) {
        if self.required.remove(scope) {
            debug!(%scope, "scope no longer required");
        }
        self.changes.remove(scope);
    }

    /// Record that cached tokens for `scopes` must be reacquired.
    pub fn add_scope_change<I, S>(&mut self, scopes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for scope in scopes {
            self.changes.insert(scope.into());
        }
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn changes(&self) -> &BTreeSet<String> {
        &self.changes
    }

    /// Cached authorizers by scope.
    pub fn get_authorizers(&self) -> BTreeMap<String, Authorizer> {
        self.bundles
            .iter()
            .map(|(scope, bundle)| (scope.clone(), Authorizer::from(bundle)))
            .collect()
    }

    /// The cached authorizer for `scope`.
    pub fn authorizer(&self, scope: &str) -> Result<Authorizer> {
        self.bundles
            .get(scope)
            .filter(|bundle| !bundle.is_expired())
            .map(Authorizer::from)
            .ok_or_else(|| Error::auth("no valid authorizer", [scope.to_string()]))
    }

    /// Store `bundles` in the cache (and storage) as if a login returned them.
    pub fn insert_bundles(&mut self, bundles: impl IntoIterator<Item = TokenBundle>) -> Result<()> {
        let bundles: Vec<TokenBundle> = bundles.into_iter().collect();
        for bundle in &bundles {
            self.bundles.insert(bundle.scope.clone(), bundle.clone());
        }
        self.persist(&bundles)
    }

    fn persist(&self, bundles: &[TokenBundle]) -> Result<()> {
        if let Some(storage) = &self.storage {
            tokens::store_bundles(storage.as_ref(), bundles)?;
            storage.save()?;
        }
        Ok(())
    }

    fn is_valid(&self, scope: &str, now: u64) -> bool {
        self.bundles
            .get(scope)
            .is_some_and(|bundle| !bundle.is_expired_at(now))
    }

    /// `(required - valid cached) ∪ changes`, sorted.
    pub fn missing(&self) -> Vec<String> {
        self.missing_at(now_seconds())
    }

    fn missing_at(&self, now: u64) -> Vec<String> {
        let mut missing: BTreeSet<String> = self
            .required
            .iter()
            .filter(|scope| !self.is_valid(scope, now))
            .cloned()
            .collect();
        missing.extend(self.changes.iter().cloned());
        missing.into_iter().collect()
    }

    fn refresh_expired(&mut self, now: u64) -> Result<()> {
        let expired: Vec<TokenBundle> = self
            .bundles
            .values()
            .filter(|b| b.is_expired_at(now) && !self.changes.contains(&b.scope))
            .cloned()
            .collect();

        let mut renewed = Vec::new();
        for bundle in expired {
            match self.backend.refresh(&bundle) {
                Ok(Some(fresh)) => {
                    debug!(scope = %bundle.scope, "refreshed expired token");
                    renewed.push(fresh);
                }
                Ok(None) => {}
                Err(e) => warn!(scope = %bundle.scope, error = %e, "token refresh failed"),
            }
        }
        if !renewed.is_empty() {
            self.insert_bundles(renewed)?;
        }
        Ok(())
    }

    /// Make sure every required scope has a valid token.
    ///
    /// Expired tokens are refreshed silently first. If anything is still
    /// missing, or a scope change is pending, the backend logs in for exactly
    /// those scopes. Pending changes are cleared afterwards.
    pub fn ensure(&mut self) -> Result<()> {
        let now = now_seconds();
        self.refresh_expired(now)?;

        let missing = self.missing_at(now);
        if !missing.is_empty() {
            info!(
                backend = self.backend.name(),
                scopes = ?missing,
                "logging in for missing scopes"
            );
            let granted = self.backend.login(&missing)?;
            self.insert_bundles(granted.into_values())?;
        }
        self.changes.clear();

        let mut still: BTreeSet<String> = missing
            .into_iter()
            .filter(|scope| !self.is_valid(scope, now))
            .collect();
        still.extend(
            self.required
                .iter()
                .filter(|scope| !self.is_valid(scope, now))
                .cloned(),
        );
        if !still.is_empty() {
            return Err(Error::auth("login did not grant every scope", still));
        }
        Ok(())
    }

    /// Revoke and forget every cached token.
    pub fn logout(&mut self) -> Result<()> {
        let bundles = std::mem::take(&mut self.bundles);
        for bundle in bundles.values() {
            if let Err(e) = self.backend.revoke(bundle) {
                warn!(scope = %bundle.scope, error = %e, "token revocation failed");
            }
        }
        if let Some(storage) = &self.storage {
            tokens::clear_bundles(storage.as_ref())?;
            storage.save()?;
        }
        info!(count = bundles.len(), "logged out");
        Ok(())
    }
}

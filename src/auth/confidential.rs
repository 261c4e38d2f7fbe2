//! Client-credentials login for confidential clients.
//!
//! Confidential clients act as themselves: no user interaction and no refresh
//! tokens. An expired token is replaced by granting the same scope again.

use std::collections::BTreeMap;

use reqwest::blocking::Client as HttpClient;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use super::native::token_response;
use super::tokens::{now_seconds, TokenBundle};
use super::{LoginBackend, DEFAULT_AUTH_URL};
use crate::Result;

pub struct ConfidentialLogin {
    client_id: String,
    client_secret: SecretString,
    auth_url: String,
    http: HttpClient,
}

impl std::fmt::Debug for ConfidentialLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfidentialLogin")
            .field("client_id", &self.client_id)
            .field("auth_url", &self.auth_url)
            .finish_non_exhaustive()
    }
}

impl ConfidentialLogin {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn with_auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn grant(&self, scopes: &[String]) -> Result<BTreeMap<String, TokenBundle>> {
        let scope = scopes.join(" ");
        let form = [("grant_type", "client_credentials"), ("scope", scope.as_str())];
        let response = self
            .http
            .post(format!("{}/v2/oauth2/token", self.auth_url))
            .basic_auth(&self.client_id, Some(self.client_secret.expose_secret()))
            .form(&form)
            .send()?;
        token_response(response, scopes)?.into_bundles(now_seconds())
    }
}

impl LoginBackend for ConfidentialLogin {
    fn name(&self) -> &'static str {
        "confidential"
    }

    fn login(&mut self, scopes: &[String]) -> Result<BTreeMap<String, TokenBundle>> {
        info!(client_id = %self.client_id, scopes = ?scopes, "client credentials grant");
        self.grant(scopes)
    }

    fn refresh(&mut self, bundle: &TokenBundle) -> Result<Option<TokenBundle>> {
        debug!(scope = %bundle.scope, "re-granting expired client token");
        let mut granted = self.grant(std::slice::from_ref(&bundle.scope))?;
        Ok(granted.remove(&bundle.scope))
    }
}

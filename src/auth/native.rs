//! Interactive native-app login (authorization code with PKCE).
//!
//! The user opens the authorization URL, consents, and pastes back the code the
//! identity service displays. Refresh tokens are requested so later runs can
//! renew tokens without prompting again.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use reqwest::Url;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::tokens::{now_seconds, TokenBundle, TokenResponse};
use super::{LoginBackend, DEFAULT_AUTH_URL, NATIVE_REDIRECT_PATH};
use crate::{Error, Result};

/// Obtains an authorization code from the user.
pub trait AuthCodePrompt: Send {
    fn authorization_code(&mut self, authorize_url: &str) -> Result<String>;
}

/// Prints the URL on stderr and reads the code from stdin.
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl AuthCodePrompt for StdinPrompt {
    fn authorization_code(&mut self, authorize_url: &str) -> Result<String> {
        let mut stderr = std::io::stderr();
        writeln!(stderr, "Please log in at:\n\n  {authorize_url}\n")?;
        write!(stderr, "Enter the authorization code: ")?;
        stderr.flush()?;

        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        let code = line.trim().to_string();
        if code.is_empty() {
            return Err(Error::auth("no authorization code entered", Vec::new()));
        }
        Ok(code)
    }
}

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 32];
        getrandom::fill(&mut bytes)
            .map_err(|e| Error::auth(format!("no randomness for PKCE: {e}"), Vec::new()))?;
        Ok(Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes)))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

/// Authorization-code login for a native (public) client.
pub struct NativeLogin {
    client_id: String,
    auth_url: String,
    http: HttpClient,
    prompt: Box<dyn AuthCodePrompt>,
    auto_login: bool,
}

impl std::fmt::Debug for NativeLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeLogin")
            .field("client_id", &self.client_id)
            .field("auth_url", &self.auth_url)
            .field("auto_login", &self.auto_login)
            .finish_non_exhaustive()
    }
}

impl NativeLogin {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            http: HttpClient::new(),
            prompt: Box::new(StdinPrompt),
            auto_login: true,
        }
    }

    pub fn with_auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_prompt(mut self, prompt: impl AuthCodePrompt + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    /// With auto-login off, a missing scope is an error instead of a prompt.
    pub fn with_auto_login(mut self, enabled: bool) -> Self {
        self.auto_login = enabled;
        self
    }

    fn redirect_uri(&self) -> String {
        format!("{}{NATIVE_REDIRECT_PATH}", self.auth_url)
    }

    fn token_url(&self) -> String {
        format!("{}/v2/oauth2/token", self.auth_url)
    }

    /// URL the user visits to grant `scopes`.
    pub fn authorize_url(&self, scopes: &[String], pkce: &Pkce) -> Result<String> {
        let base = format!("{}/v2/oauth2/authorize", self.auth_url);
        let scope = scopes.join(" ");
        let redirect = self.redirect_uri();
        let url = Url::parse_with_params(
            &base,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect.as_str()),
                ("scope", scope.as_str()),
                ("state", "_default"),
                ("response_type", "code"),
                ("code_challenge", pkce.challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("access_type", "offline"),
            ],
        )
        .map_err(|e| Error::Config(format!("invalid auth URL {base}: {e}")))?;
        Ok(url.to_string())
    }

    /// Trade an authorization code for tokens.
    pub fn exchange_code(
        &self,
        code: &str,
        pkce: &Pkce,
        scopes: &[String],
    ) -> Result<BTreeMap<String, TokenBundle>> {
        let redirect = self.redirect_uri();
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect.as_str()),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", pkce.verifier.as_str()),
        ];
        let response = self.http.post(self.token_url()).form(&form).send()?;
        token_response(response, scopes)?.into_bundles(now_seconds())
    }
}

/// Decode a token endpoint response, turning failures into auth errors.
pub(crate) fn token_response(
    response: reqwest::blocking::Response,
    scopes: &[String],
) -> Result<TokenResponse> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(Error::auth(
            format!("token request failed (HTTP {}): {body}", status.as_u16()),
            scopes.to_vec(),
        ));
    }
    Ok(response.json()?)
}

impl LoginBackend for NativeLogin {
    fn name(&self) -> &'static str {
        "native"
    }

    fn login(&mut self, scopes: &[String]) -> Result<BTreeMap<String, TokenBundle>> {
        if !self.auto_login {
            return Err(Error::auth("login required but automatic login is disabled", scopes.to_vec()));
        }

        let pkce = Pkce::generate()?;
        let url = self.authorize_url(scopes, &pkce)?;
        info!(scopes = ?scopes, "starting interactive login");
        let code = self.prompt.authorization_code(&url)?;
        self.exchange_code(&code, &pkce, scopes)
    }

    fn refresh(&mut self, bundle: &TokenBundle) -> Result<Option<TokenBundle>> {
        let Some(refresh_token) = bundle.refresh_token.as_deref() else {
            return Ok(None);
        };
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        let response = self.http.post(self.token_url()).form(&form).send()?;
        let scopes = [bundle.scope.clone()];
        let mut bundles = token_response(response, &scopes)?.into_bundles(now_seconds())?;
        debug!(scope = %bundle.scope, "refresh grant completed");

        Ok(bundles.remove(&bundle.scope).map(|mut fresh| {
            if fresh.refresh_token.is_none() {
                fresh.refresh_token = Some(refresh_token.to_string());
            }
            fresh
        }))
    }

    fn revoke(&mut self, bundle: &TokenBundle) -> Result<()> {
        let url = format!("{}/v2/oauth2/token/revoke", self.auth_url);
        let tokens = std::iter::once(bundle.access_token.as_str())
            .chain(bundle.refresh_token.as_deref());
        for token in tokens {
            let form = [("token", token), ("client_id", self.client_id.as_str())];
            self.http.post(&url).form(&form).send()?.error_for_status()?;
        }
        Ok(())
    }
}

//! Login through a caller-supplied closure.

use std::collections::BTreeMap;

use super::tokens::TokenBundle;
use super::LoginBackend;
use crate::{Error, Result};

/// Closure returning token bundles for the requested scopes.
pub type LoginCallback =
    Box<dyn FnMut(&[String]) -> Result<BTreeMap<String, TokenBundle>> + Send>;

/// Delegates every login to a closure, e.g. one backed by an existing session.
#[derive(Default)]
pub struct CallbackLogin {
    callback: Option<LoginCallback>,
}

impl std::fmt::Debug for CallbackLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLogin")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl CallbackLogin {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(&[String]) -> Result<BTreeMap<String, TokenBundle>> + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// A backend with no callback; any login attempt fails.
    pub fn unset() -> Self {
        Self::default()
    }
}

impl LoginBackend for CallbackLogin {
    fn name(&self) -> &'static str {
        "callback"
    }

    fn login(&mut self, scopes: &[String]) -> Result<BTreeMap<String, TokenBundle>> {
        match self.callback.as_mut() {
            Some(callback) => callback(scopes),
            None => Err(Error::auth("no login callback configured", scopes.to_vec())),
        }
    }
}

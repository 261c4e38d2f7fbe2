//! Blocking HTTP client for the function-execution service.

use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{classify_error, FunctionService};
use crate::auth::Authorizer;
use crate::tool::RemoteFunction;
use crate::Result;

pub const DEFAULT_COMPUTE_URL: &str = "https://compute.api.globus.org";

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    function_name: &'a str,
    function_code: &'a str,
    entry_point: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    function_uuid: String,
}

#[derive(Debug, Clone)]
pub struct ComputeClient {
    base_url: String,
    http: HttpClient,
}

impl ComputeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }
}

impl Default for ComputeClient {
    fn default() -> Self {
        Self::new(DEFAULT_COMPUTE_URL)
    }
}

impl FunctionService for ComputeClient {
    fn register(
        &self,
        auth: &Authorizer,
        function: &RemoteFunction,
        group: Option<&str>,
    ) -> Result<String> {
        let body = RegisterRequest {
            function_name: &function.name,
            function_code: &function.source,
            entry_point: &function.entry_point,
            description: function.description.as_deref(),
            group,
        };
        debug!(function = %function.name, ?group, "registering function");

        let response = self
            .http
            .post(format!("{}/v2/functions", self.base_url))
            .header(reqwest::header::AUTHORIZATION, auth.header_value())
            .json(&body)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(classify_error(status.as_u16(), &text, &auth.scope));
        }

        let registered: RegisterResponse = response.json()?;
        info!(function = %function.name, id = %registered.function_uuid, "registered function");
        Ok(registered.function_uuid)
    }
}

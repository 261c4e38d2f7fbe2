//! Blocking HTTP client for the flow service.

use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{classify_error, DeployedFlow, FlowEngine, FlowRequest, RunRequest};
use crate::auth::Authorizer;
use crate::run::RunRecord;
use crate::Result;

pub const DEFAULT_FLOWS_URL: &str = "https://flows.globus.org";

#[derive(Debug, Clone)]
pub struct FlowsClient {
    base_url: String,
    http: HttpClient,
}

impl FlowsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn send(&self, request: RequestBuilder, auth: &Authorizer) -> Result<Response> {
        let response = request
            .header(reqwest::header::AUTHORIZATION, auth.header_value())
            .send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(classify_error(status.as_u16(), &body, &auth.scope))
    }

    fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, auth: &Authorizer) -> Result<T> {
        Ok(self.send(request, auth)?.json()?)
    }
}

impl Default for FlowsClient {
    fn default() -> Self {
        Self::new(DEFAULT_FLOWS_URL)
    }
}

impl FlowEngine for FlowsClient {
    fn deploy(&self, auth: &Authorizer, request: &FlowRequest) -> Result<DeployedFlow> {
        debug!(title = %request.title, "deploying flow");
        self.send_json(self.http.post(self.url("/flows")).json(request), auth)
    }

    fn update(&self, auth: &Authorizer, flow_id: &str, request: &FlowRequest) -> Result<()> {
        debug!(%flow_id, "updating flow");
        self.send(
            self.http.put(self.url(&format!("/flows/{flow_id}"))).json(request),
            auth,
        )?;
        Ok(())
    }

    fn run(&self, auth: &Authorizer, flow_id: &str, request: &RunRequest) -> Result<RunRecord> {
        debug!(%flow_id, label = %request.label, "starting run");
        self.send_json(
            self.http
                .post(self.url(&format!("/flows/{flow_id}/run")))
                .json(request),
            auth,
        )
    }

    fn status(&self, auth: &Authorizer, flow_id: &str, run_id: &str) -> Result<RunRecord> {
        debug!(%flow_id, %run_id, "fetching run status");
        self.send_json(self.http.get(self.url(&format!("/runs/{run_id}"))), auth)
    }
}

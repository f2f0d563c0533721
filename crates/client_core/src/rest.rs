//! HTTP adapter for the hosted backend's REST and RPC endpoints.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{LevelType, NodeId, OwnerId, RowId},
    error::{ApiError, SourceError},
    protocol::{Page, PageRequest, Row, RowPatch, TreeNode},
    source::{check_level_scope, DataSource, HierarchySource},
};
use tracing::{debug, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct FacetValuesRequest<'a> {
    owner_id: &'a OwnerId,
    facet: &'a str,
}

#[derive(Serialize)]
struct ReportLevelRequest<'a> {
    owner_id: &'a OwnerId,
    level: LevelType,
    parent_id: Option<&'a NodeId>,
}

#[derive(Clone)]
pub struct RestBackend {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl RestBackend {
    pub fn new(base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid backend url '{base_url}'"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        self.base_url
            .join(path)
            .map_err(|err| SourceError::validation(None, format!("bad endpoint {path}: {err}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    async fn rpc<B, T>(&self, function: &str, body: &B) -> Result<T, SourceError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(&format!("rest/v1/rpc/{function}"))?;
        debug!(function, "rest: rpc call");
        let response = self
            .authorize(self.http.post(url).json(body))
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }
}

fn transport_error(err: reqwest::Error) -> SourceError {
    warn!(error = %err, "rest: request did not complete");
    SourceError::transient(err.to_string())
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, SourceError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| SourceError::transient(format!("malformed response: {err}")));
    }
    let body = response.text().await.unwrap_or_default();
    let api_error = serde_json::from_str::<ApiError>(&body)
        .unwrap_or_else(|_| ApiError::new(body.trim().to_string()));
    Err(status_error(status, &api_error))
}

fn status_error(status: StatusCode, api_error: &ApiError) -> SourceError {
    let message = if api_error.message.is_empty() {
        status.to_string()
    } else {
        api_error.message.clone()
    };
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => SourceError::Validation {
            field: api_error.field(),
            message,
        },
        StatusCode::NOT_FOUND => SourceError::NotFound(message),
        _ => SourceError::transient(format!("{status}: {message}")),
    }
}

#[async_trait]
impl DataSource for RestBackend {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError> {
        self.rpc("customer_page", request).await
    }

    async fn update_row(&self, row_id: &RowId, patch: &RowPatch) -> Result<Row, SourceError> {
        let mut url = self.endpoint("rest/v1/customers")?;
        url.query_pairs_mut()
            .append_pair("row_id", &format!("eq.{row_id}"));
        debug!(row_id = %row_id, fields = patch.len(), "rest: patching customer");
        let response = self
            .authorize(self.http.patch(url).json(patch))
            .header("Prefer", "return=representation")
            .send()
            .await
            .map_err(transport_error)?;
        let rows: Vec<Row> = decode(response).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SourceError::NotFound(format!("customer {row_id}")))
    }

    async fn list_facet_values(
        &self,
        owner_id: &OwnerId,
        facet: &str,
    ) -> Result<Vec<String>, SourceError> {
        self.rpc("customer_facet_values", &FacetValuesRequest { owner_id, facet })
            .await
    }
}

#[async_trait]
impl HierarchySource for RestBackend {
    async fn fetch_level(
        &self,
        owner_id: &OwnerId,
        level: LevelType,
        parent_id: Option<&NodeId>,
    ) -> Result<Vec<TreeNode>, SourceError> {
        check_level_scope(level, parent_id)?;
        self.rpc(
            "report_level",
            &ReportLevelRequest {
                owner_id,
                level,
                parent_id,
            },
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;

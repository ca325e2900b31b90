use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::ConnectionHandle,
    error::RemoteError,
    protocol::{
        AnalysisResponse, AnalyzeRequest, ConnectRequest, ConnectResponse, DatabaseInfo,
        DatabaseListResponse, EvidenceData, EvidenceRequest, EvidenceResponse,
        ListWorkUnitsRequest, ReportDescriptor, ReportRequest, UseDatabaseRequest,
        UseDatabaseResponse, WorkUnitPage,
    },
};
use tracing::{debug, warn};
use url::Url;

pub mod error;
pub mod pagination;
pub mod paging;
pub mod patch;
pub mod selection;
pub mod types;
pub mod workflow;

pub use error::{Operation, ValidationError, WorkflowError};
pub use workflow::{
    Artifact, AuditWorkflow, DatabaseSelection, OperationErrors, Overlay, Stage, WorkflowConfig,
    WorkflowEvent, WorkflowSnapshot,
};

/// One call per capability of the remote analysis service.
///
/// Implementations hold no workflow state and never retry; the workflow
/// decides what a failure means.
#[async_trait]
pub trait AuditService: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<ConnectResponse, RemoteError>;
    async fn list_databases(
        &self,
        connection: &ConnectionHandle,
    ) -> Result<Vec<String>, RemoteError>;
    async fn select_database(
        &self,
        connection: &ConnectionHandle,
        database: &str,
    ) -> Result<DatabaseInfo, RemoteError>;
    async fn list_work_units(
        &self,
        request: &ListWorkUnitsRequest,
    ) -> Result<WorkUnitPage, RemoteError>;
    async fn run_analysis(&self, request: &AnalyzeRequest)
        -> Result<AnalysisResponse, RemoteError>;
    async fn fetch_evidence(&self, request: &EvidenceRequest) -> Result<EvidenceData, RemoteError>;
    async fn generate_report(&self, request: &ReportRequest)
        -> Result<ReportDescriptor, RemoteError>;
    async fn dashboard_summary(&self) -> Result<Value, RemoteError>;
}

/// [`AuditService`] over the service's JSON HTTP API.
pub struct HttpAuditService {
    http: Client,
    base_url: Url,
}

impl HttpAuditService {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url.trim())
            .with_context(|| format!("invalid analysis service url '{base_url}'"))?;
        if base_url.cannot_be_a_base() {
            bail!("analysis service url '{base_url}' cannot carry a path");
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::transport(err.to_string()))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = error_message(status, &body);
        warn!(status = status.as_u16(), %message, "analysis service returned an error");
        return Err(RemoteError::new(status.as_u16(), message));
    }

    response
        .json::<T>()
        .await
        .map_err(|err| RemoteError::new(status.as_u16(), format!("invalid response body: {err}")))
}

/// Picks the most useful reason out of an error body: `detail`, then
/// `message`, then the whole JSON document or raw text.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        match value.get("detail") {
            Some(Value::String(detail)) => return detail.clone(),
            Some(Value::Null) | None => {}
            Some(other) => return other.to_string(),
        }
        if let Some(Value::String(message)) = value.get("message") {
            return message.clone();
        }
        return value.to_string();
    }

    let body = body.trim();
    if !body.is_empty() {
        return body.to_string();
    }

    format!(
        "Error {}: {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
}

#[async_trait]
impl AuditService for HttpAuditService {
    async fn connect(&self, request: &ConnectRequest) -> Result<ConnectResponse, RemoteError> {
        debug!(server = %request.server, kind = ?request.connection_type, "POST /api/connect");
        self.send(self.http.post(self.endpoint(&["api", "connect"])).json(request))
            .await
    }

    async fn list_databases(
        &self,
        connection: &ConnectionHandle,
    ) -> Result<Vec<String>, RemoteError> {
        let response: DatabaseListResponse = self
            .send(
                self.http
                    .get(self.endpoint(&["api", "databases"]))
                    .query(&[("connection_id", connection.as_str())]),
            )
            .await?;
        Ok(response.databases)
    }

    async fn select_database(
        &self,
        connection: &ConnectionHandle,
        database: &str,
    ) -> Result<DatabaseInfo, RemoteError> {
        let response: UseDatabaseResponse = self
            .send(
                self.http
                    .post(self.endpoint(&[
                        "api",
                        "connections",
                        connection.as_str(),
                        "use-database",
                    ]))
                    .json(&UseDatabaseRequest {
                        database: database.to_string(),
                    }),
            )
            .await?;
        Ok(response.database_info)
    }

    async fn list_work_units(
        &self,
        request: &ListWorkUnitsRequest,
    ) -> Result<WorkUnitPage, RemoteError> {
        let mut query = vec![
            ("connection_id", request.connection_id.to_string()),
            ("page", request.page.to_string()),
            ("limit", request.limit.to_string()),
        ];
        if let Some(schema) = &request.schema {
            query.push(("schema", schema.clone()));
        }
        if let Some(search) = &request.search {
            query.push(("search", search.clone()));
        }

        self.send(
            self.http
                .get(self.endpoint(&["api", "stored-procedures"]))
                .query(&query),
        )
        .await
    }

    async fn run_analysis(
        &self,
        request: &AnalyzeRequest,
    ) -> Result<AnalysisResponse, RemoteError> {
        self.send(self.http.post(self.endpoint(&["api", "analyze"])).json(request))
            .await
    }

    async fn fetch_evidence(&self, request: &EvidenceRequest) -> Result<EvidenceData, RemoteError> {
        let response: EvidenceResponse = self
            .send(self.http.post(self.endpoint(&["api", "evidence"])).json(request))
            .await?;
        Ok(response.evidence_data)
    }

    async fn generate_report(
        &self,
        request: &ReportRequest,
    ) -> Result<ReportDescriptor, RemoteError> {
        self.send(
            self.http
                .post(self.endpoint(&["api", "reports", "generate"]))
                .json(request),
        )
        .await
    }

    async fn dashboard_summary(&self) -> Result<Value, RemoteError> {
        self.send(self.http.get(self.endpoint(&["api", "dashboard", "summary"])))
            .await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

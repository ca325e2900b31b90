use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{
    AnalysisId, AnalysisMode, ConnectionHandle, ConnectionKind, FindingId, ReportFormat, ReportId,
    Severity, WorkUnitId,
};

pub const DEFAULT_SQL_SERVER_PORT: u16 = 1433;

#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub connection_type: ConnectionKind,
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub port: u16,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("connection_type", &self.connection_type)
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "total_sps")]
    pub unit_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub connection_id: ConnectionHandle,
    pub database_info: DatabaseInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseListResponse {
    #[serde(default)]
    pub databases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UseDatabaseRequest {
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UseDatabaseResponse {
    pub database_info: DatabaseInfo,
}

/// One stored procedure eligible for analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: WorkUnitId,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub line_count: u64,
    #[serde(default)]
    pub is_analyzed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListWorkUnitsRequest {
    pub connection_id: ConnectionHandle,
    pub page: u32,
    pub limit: u32,
    pub schema: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkUnitPage {
    #[serde(default, rename = "stored_procedures")]
    pub items: Vec<WorkUnit>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub connection_id: ConnectionHandle,
    pub sp_ids: Vec<WorkUnitId>,
    pub analysis_type: AnalysisMode,
    pub use_ai: bool,
    pub save_to_db: bool,
}

/// Per-severity counts exactly as reported by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeveritySummary {
    #[serde(default)]
    pub critical: u64,
    #[serde(default)]
    pub high: u64,
    #[serde(default)]
    pub medium: u64,
    #[serde(default)]
    pub low: u64,
    #[serde(default)]
    pub info: u64,
}

impl SeveritySummary {
    pub fn get(&self, severity: Severity) -> u64 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Info => self.info,
        }
    }

    pub fn increment(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Info => self.info += 1,
        }
    }

    pub fn total(&self) -> u64 {
        Severity::ALL.iter().map(|severity| self.get(*severity)).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub severity: Severity,
    #[serde(default)]
    pub category: String,
    /// Finding category as understood by the evidence extractor.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub finding_type: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sp_id: Option<WorkUnitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sp_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_data: Option<EvidenceData>,
}

impl Finding {
    pub fn code_snippet(&self) -> &str {
        self.location
            .as_ref()
            .and_then(|location| location.code_snippet.as_deref())
            .unwrap_or_default()
    }

    pub fn line(&self) -> Option<u64> {
        self.location.as_ref().and_then(|location| location.line)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub analysis_id: AnalysisId,
    #[serde(default)]
    pub analyzed_count: u64,
    #[serde(default)]
    pub findings_summary: SeveritySummary,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRequest {
    pub connection_id: ConnectionHandle,
    pub sp_id: WorkUnitId,
    pub finding_type: String,
    pub code_snippet: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityContext {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vulnerable_parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub password_columns_found: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exposed_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_passwords_exposed: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetrics {
    #[serde(default)]
    pub distinct: u64,
    #[serde(default)]
    pub non_null: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordCount {
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub total_records: u64,
    #[serde(default)]
    pub columns_affected: Vec<String>,
    #[serde(default)]
    pub sensitive_counts: BTreeMap<String, ColumnMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaskedSample {
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
}

/// Masked data substantiating a single finding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerability_context: Option<VulnerabilityContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_scenario: Option<String>,
    #[serde(default)]
    pub record_counts: Vec<RecordCount>,
    #[serde(default)]
    pub masked_samples: Vec<MaskedSample>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records_preview: Vec<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceResponse {
    pub evidence_data: EvidenceData,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRequest {
    pub analysis_id: AnalysisId,
    pub format: ReportFormat,
    pub include_code: bool,
    pub include_recommendations: bool,
    pub analysis_data: AnalysisResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDescriptor {
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub report_id: Option<ReportId>,
    #[serde(default, alias = "report_type", skip_serializing_if = "Option::is_none")]
    pub format: Option<ReportFormat>,
    #[serde(default)]
    pub file_path: String,
}

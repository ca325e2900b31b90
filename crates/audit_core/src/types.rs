use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{AnalysisId, AnalysisMode, ConnectionKind, FindingId, ReportFormat, ReportId, WorkUnitId},
    protocol::{
        AnalysisResponse, ConnectRequest, Finding, ReportDescriptor, SeveritySummary, WorkUnit,
        DEFAULT_SQL_SERVER_PORT,
    },
};
use tracing::warn;

use crate::error::ValidationError;

#[derive(Clone, Default)]
pub struct Credentials {
    pub kind: ConnectionKind,
    pub server: String,
    pub username: String,
    pub password: String,
    pub port: Option<u16>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("kind", &self.kind)
            .field("server", &self.server)
            .field("username", &self.username)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn into_request(self) -> Result<ConnectRequest, ValidationError> {
        let server = self.server.trim();
        if server.is_empty() {
            return Err(ValidationError::MissingServer);
        }

        let (username, password) = if self.kind.uses_password() {
            if self.username.is_empty() || self.password.is_empty() {
                return Err(ValidationError::MissingCredentials);
            }
            (Some(self.username), Some(self.password))
        } else {
            (None, None)
        };

        Ok(ConnectRequest {
            connection_type: self.kind,
            server: server.to_string(),
            username,
            password,
            port: self.port.unwrap_or(DEFAULT_SQL_SERVER_PORT),
        })
    }
}

/// Search and schema restriction applied to the stored procedure listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFilter {
    pub search: Option<String>,
    pub schema: Option<String>,
}

impl UnitFilter {
    pub fn search(term: impl Into<String>) -> Self {
        Self {
            search: Some(term.into()),
            schema: None,
        }
        .normalized()
    }

    /// Blank terms are dropped so they are never sent as empty query values.
    pub fn normalized(self) -> Self {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        }

        Self {
            search: clean(self.search),
            schema: clean(self.schema),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.search.is_none() && self.schema.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisOptions {
    pub mode: AnalysisMode,
    pub use_ai: bool,
    pub save_to_db: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            mode: AnalysisMode::Full,
            use_ai: true,
            save_to_db: true,
        }
    }
}

/// A fully collected stored procedure listing. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    units: Vec<WorkUnit>,
    ids: HashSet<WorkUnitId>,
    total: u64,
    filter: UnitFilter,
}

impl Listing {
    pub fn new(units: Vec<WorkUnit>, total: u64, filter: UnitFilter) -> Self {
        let mut ids = HashSet::with_capacity(units.len());
        let mut unique = Vec::with_capacity(units.len());
        for unit in units {
            if ids.insert(unit.id) {
                unique.push(unit);
            } else {
                warn!(unit_id = %unit.id, "dropping duplicate stored procedure from listing");
            }
        }

        Self {
            units: unique,
            ids,
            total,
            filter,
        }
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn contains(&self, id: WorkUnitId) -> bool {
        self.ids.contains(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = WorkUnitId> + '_ {
        self.units.iter().map(|unit| unit.id)
    }

    /// Total reported by the service for the filter that produced this listing.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn filter(&self) -> &UnitFilter {
        &self.filter
    }
}

/// Findings of one analysis run, stored as an arena indexed by finding id.
///
/// Each finding sits behind its own `Arc` so that patching one entry leaves
/// every sibling pointer-identical.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    run: u64,
    analysis_id: AnalysisId,
    analyzed_count: u64,
    summary: SeveritySummary,
    findings: Vec<Arc<Finding>>,
    index: HashMap<FindingId, usize>,
}

impl AnalysisResult {
    pub fn from_response(response: AnalysisResponse, run: u64) -> Self {
        let mut index = HashMap::with_capacity(response.findings.len());
        for (position, finding) in response.findings.iter().enumerate() {
            if index.contains_key(&finding.id) {
                warn!(finding_id = %finding.id, "duplicate finding id in analysis response");
                continue;
            }
            index.insert(finding.id.clone(), position);
        }

        Self {
            run,
            analysis_id: response.analysis_id,
            analyzed_count: response.analyzed_count,
            summary: response.findings_summary,
            findings: response.findings.into_iter().map(Arc::new).collect(),
            index,
        }
    }

    pub fn analysis_id(&self) -> &AnalysisId {
        &self.analysis_id
    }

    pub fn analyzed_count(&self) -> u64 {
        self.analyzed_count
    }

    /// Severity counts as reported by the service.
    pub fn summary(&self) -> &SeveritySummary {
        &self.summary
    }

    /// Severity counts tallied locally over every finding, regardless of paging.
    pub fn severity_tally(&self) -> SeveritySummary {
        let mut tally = SeveritySummary::default();
        for finding in &self.findings {
            tally.increment(finding.severity);
        }
        tally
    }

    /// Findings in the order the service returned them.
    pub fn findings(&self) -> &[Arc<Finding>] {
        &self.findings
    }

    pub fn finding(&self, id: &FindingId) -> Option<&Arc<Finding>> {
        self.position(id).map(|position| &self.findings[position])
    }

    pub fn position(&self, id: &FindingId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn evidence_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|finding| finding.evidence_data.is_some())
            .count()
    }

    pub fn to_payload(&self) -> AnalysisResponse {
        AnalysisResponse {
            analysis_id: self.analysis_id.clone(),
            analyzed_count: self.analyzed_count,
            findings_summary: self.summary,
            findings: self
                .findings
                .iter()
                .map(|finding| finding.as_ref().clone())
                .collect(),
        }
    }

    pub(crate) fn run(&self) -> u64 {
        self.run
    }

    pub(crate) fn with_finding(&self, position: usize, finding: Arc<Finding>) -> Self {
        let mut findings = self.findings.clone();
        findings[position] = finding;
        Self {
            run: self.run,
            analysis_id: self.analysis_id.clone(),
            analyzed_count: self.analyzed_count,
            summary: self.summary,
            findings,
            index: self.index.clone(),
        }
    }
}

/// A generated report together with the analysis snapshot it was built from.
#[derive(Debug, Clone)]
pub struct ReportArtifact {
    pub report_id: Option<ReportId>,
    pub format: ReportFormat,
    pub file_path: String,
    pub generated_at: DateTime<Utc>,
    analysis: Arc<AnalysisResult>,
}

impl ReportArtifact {
    pub fn new(
        descriptor: ReportDescriptor,
        requested: ReportFormat,
        analysis: Arc<AnalysisResult>,
    ) -> Self {
        Self {
            report_id: descriptor.report_id,
            format: descriptor.format.unwrap_or(requested),
            file_path: descriptor.file_path,
            generated_at: Utc::now(),
            analysis,
        }
    }

    pub fn analysis(&self) -> &Arc<AnalysisResult> {
        &self.analysis
    }

    /// File name component of the storage locator, for either separator style.
    pub fn file_name(&self) -> &str {
        self.file_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.file_path)
    }
}

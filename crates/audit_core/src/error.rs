use std::fmt;

use shared::{
    domain::{FindingId, WorkUnitId},
    error::RemoteError,
};
use thiserror::Error;

/// Workflow operations that can fail, used to scope published errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    ListDatabases,
    SelectDatabase,
    LoadUnits,
    Selection,
    RunAnalysis,
    FetchEvidence,
    GenerateReport,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::ListDatabases => "list_databases",
            Self::SelectDatabase => "select_database",
            Self::LoadUnits => "load_units",
            Self::Selection => "selection",
            Self::RunAnalysis => "run_analysis",
            Self::FetchEvidence => "fetch_evidence",
            Self::GenerateReport => "generate_report",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Precondition failures detected locally, before any request is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("a server address is required before connecting")]
    MissingServer,
    #[error("username and password are required for SQL authentication")]
    MissingCredentials,
    #[error("no active connection; connect first")]
    NotConnected,
    #[error("no database selected")]
    NoDatabaseSelected,
    #[error("no stored procedures loaded")]
    NoListing,
    #[error("stored procedure {0} is not part of the current listing")]
    UnknownWorkUnit(WorkUnitId),
    #[error("select at least one stored procedure to analyze")]
    EmptySelection,
    #[error("no analysis available")]
    NoAnalysis,
    #[error("finding {0} is not part of the current analysis")]
    UnknownFinding(FindingId),
    #[error("finding {0} has no associated stored procedure")]
    MissingWorkUnitReference(FindingId),
    #[error("finding {0} has no finding type")]
    MissingFindingType(FindingId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("analysis service error: {0}")]
    Remote(#[from] RemoteError),
    #[error("{0} response discarded: an upstream stage changed while it was in flight")]
    Superseded(Operation),
}

impl WorkflowError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// Human-readable reason published to the workflow's error slots.
    pub fn reason(&self) -> String {
        match self {
            Self::Remote(err) => err.message.clone(),
            other => other.to_string(),
        }
    }
}

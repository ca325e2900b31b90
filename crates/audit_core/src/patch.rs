use std::sync::Arc;

use shared::{domain::FindingId, protocol::EvidenceData};

use crate::types::AnalysisResult;

/// Returns a result in which only `finding_id` carries `evidence`.
///
/// Unknown ids hand back the same `Arc`; callers validate ids beforehand.
pub fn patch_evidence(
    result: &Arc<AnalysisResult>,
    finding_id: &FindingId,
    evidence: EvidenceData,
) -> Arc<AnalysisResult> {
    let Some(position) = result.position(finding_id) else {
        return Arc::clone(result);
    };

    let mut finding = result.findings()[position].as_ref().clone();
    finding.evidence_data = Some(evidence);
    Arc::new(result.with_finding(position, Arc::new(finding)))
}

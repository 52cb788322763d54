#![forbid(unsafe_code)]

//! Immutable value types for the prediction ledger: episodes, predictions,
//! invariant outcomes, halts, repair events, and the wire record model that
//! every persisted stream is made of.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("halt payload error: {0}")]
    HaltPayload(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EpisodeId(pub Ulid);

impl EpisodeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EpisodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EpisodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    PreConsume,
    PostWrite,
    HaltValidation,
    PreDecision,
    PostObservation,
    PreOutput,
    CapabilityGate,
}

impl GateStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreConsume => "pre_consume",
            Self::PostWrite => "post_write",
            Self::HaltValidation => "halt_validation",
            Self::PreDecision => "pre_decision",
            Self::PostObservation => "post_observation",
            Self::PreOutput => "pre_output",
            Self::CapabilityGate => "capability_gate",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pre_consume" => Some(Self::PreConsume),
            "post_write" => Some(Self::PostWrite),
            "halt_validation" => Some(Self::HaltValidation),
            "pre_decision" => Some(Self::PreDecision),
            "post_observation" => Some(Self::PostObservation),
            "pre_output" => Some(Self::PreOutput),
            "capability_gate" => Some(Self::CapabilityGate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Valid,
    Degraded,
    Invalid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Retryability {
    Retryable,
    Terminal,
}

impl Retryability {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Terminal => "terminal",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationLevel {
    ReadOnly,
    Standard,
    Privileged,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    Utterance,
    Silence,
}

/// One tagged fact supporting an invariant outcome or halt. The reference
/// names where the fact can be retrieved (a log line, a scope key, a file).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EvidenceItem {
    pub tag: String,
    pub reference: String,
}

impl EvidenceItem {
    #[must_use]
    pub fn new(tag: &str, reference: &str) -> Self {
        Self {
            tag: tag.to_string(),
            reference: reference.to_string(),
        }
    }
}

/// Capability scope for one turn: who is observing, at what authorization,
/// and which invariants they are permitted to have evaluated. `None` for
/// `evaluation_invariants` means no restriction.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ObserverFrame {
    pub role: String,
    pub authorization: AuthorizationLevel,
    #[serde(default)]
    pub evaluation_invariants: Option<Vec<String>>,
}

impl ObserverFrame {
    /// Default frame for a turn. Built per episode; there is no process-wide
    /// default observer.
    #[must_use]
    pub fn turn_default() -> Self {
        Self {
            role: "dialog_agent".to_string(),
            authorization: AuthorizationLevel::Standard,
            evaluation_invariants: None,
        }
    }

    #[must_use]
    pub fn permits(&self, invariant_id: &str) -> bool {
        match &self.evaluation_invariants {
            None => true,
            Some(allowed) => allowed.iter().any(|id| id == invariant_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub observation_id: Ulid,
    pub kind: ObservationKind,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    pub observed_at: DateTimeUtc,
}

impl Observation {
    #[must_use]
    pub fn utterance(text: &str, scope: Option<&str>, observed_at: DateTimeUtc) -> Self {
        Self {
            observation_id: Ulid::new(),
            kind: ObservationKind::Utterance,
            text: Some(text.to_string()),
            scope: scope.map(str::to_string),
            observed_at,
        }
    }

    #[must_use]
    pub fn silence(scope: Option<&str>, observed_at: DateTimeUtc) -> Self {
        Self {
            observation_id: Ulid::new(),
            kind: ObservationKind::Silence,
            text: None,
            scope: scope.map(str::to_string),
            observed_at,
        }
    }
}

/// Link from this turn back to a decision a prior episode made.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DecisionEffect {
    pub source_episode_id: EpisodeId,
    pub decision_summary: String,
    pub effect: String,
}

/// A single forward-looking statement plus, after comparison, its observed
/// outcome and correction lineage. Revision N+1 only exists if revision N
/// was appended and is reachable by walking the parent links back to the
/// same root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionRecord {
    pub prediction_id: String,
    pub scope_key: String,
    pub target_variable: String,
    pub expectation: f64,
    pub issued_at: DateTimeUtc,
    #[serde(default)]
    pub observed_value: Option<f64>,
    #[serde(default)]
    pub prediction_error: Option<f64>,
    #[serde(default)]
    pub absolute_error: Option<f64>,
    #[serde(default)]
    pub was_corrected: bool,
    #[serde(default)]
    pub correction_parent_prediction_id: Option<String>,
    #[serde(default)]
    pub correction_root_prediction_id: Option<String>,
    #[serde(default)]
    pub correction_revision: u32,
}

impl PredictionRecord {
    /// Builds an uncorrected forward prediction.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] when any identity field is empty.
    pub fn new(
        prediction_id: &str,
        scope_key: &str,
        target_variable: &str,
        expectation: f64,
        issued_at: DateTimeUtc,
    ) -> Result<Self, DomainError> {
        ensure_non_empty("prediction_id", prediction_id)?;
        ensure_non_empty("scope_key", scope_key)?;
        ensure_non_empty("target_variable", target_variable)?;

        Ok(Self {
            prediction_id: prediction_id.to_string(),
            scope_key: scope_key.to_string(),
            target_variable: target_variable.to_string(),
            expectation,
            issued_at,
            observed_value: None,
            prediction_error: None,
            absolute_error: None,
            was_corrected: false,
            correction_parent_prediction_id: None,
            correction_root_prediction_id: None,
            correction_revision: 0,
        })
    }

    /// The root of this record's correction chain: the recorded root if one
    /// exists, otherwise the record's own id.
    #[must_use]
    pub fn correction_root(&self) -> &str {
        self.correction_root_prediction_id
            .as_deref()
            .unwrap_or(&self.prediction_id)
    }
}

/// Standalone comparison artifact produced when an observed value is bound
/// to a prediction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionOutcome {
    pub prediction_id: String,
    pub scope_key: String,
    pub target_variable: String,
    pub error_metric: f64,
    pub absolute_error: f64,
    pub recorded_at: DateTimeUtc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CorrectionMetrics {
    pub comparisons: u64,
    pub total_absolute_error: f64,
    pub mean_absolute_error: f64,
}

impl CorrectionMetrics {
    pub fn record_comparison(&mut self, absolute_error: f64) {
        self.comparisons += 1;
        self.total_absolute_error += absolute_error;
        #[allow(clippy::cast_precision_loss)]
        {
            self.mean_absolute_error = self.total_absolute_error / self.comparisons as f64;
        }
    }
}

/// The current materialized view: latest prediction per scope key plus
/// aggregate correction metrics. Never hand-edited; only produced by the
/// projection fold.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectionState {
    pub current_predictions: BTreeMap<String, PredictionRecord>,
    pub correction_metrics: CorrectionMetrics,
    #[serde(default)]
    pub last_updated_at: Option<DateTimeUtc>,
}

impl ProjectionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of one invariant checker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvariantOutcome {
    pub invariant_id: String,
    pub passed: bool,
    pub flow: Flow,
    pub validity: Validity,
    pub code: String,
    pub evidence: Vec<EvidenceItem>,
    pub details: String,
    #[serde(default)]
    pub action_hints: Vec<String>,
}

impl InvariantOutcome {
    #[must_use]
    pub fn pass(invariant_id: &str, code: &str, details: &str) -> Self {
        Self {
            invariant_id: invariant_id.to_string(),
            passed: true,
            flow: Flow::Continue,
            validity: Validity::Valid,
            code: code.to_string(),
            evidence: Vec::new(),
            details: details.to_string(),
            action_hints: Vec::new(),
        }
    }

    #[must_use]
    pub fn stop(
        invariant_id: &str,
        code: &str,
        details: &str,
        evidence: Vec<EvidenceItem>,
    ) -> Self {
        Self {
            invariant_id: invariant_id.to_string(),
            passed: false,
            flow: Flow::Stop,
            validity: Validity::Invalid,
            code: code.to_string(),
            evidence,
            details: details.to_string(),
            action_hints: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: &str) -> Self {
        self.action_hints.push(hint.to_string());
        self
    }

    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(self.flow, Flow::Stop)
    }

    /// A stop outcome is explainable when it carries non-empty details and
    /// at least one evidence item whose reference is non-empty.
    #[must_use]
    pub fn is_explainable(&self) -> bool {
        !self.details.trim().is_empty()
            && !self.evidence.is_empty()
            && self
                .evidence
                .iter()
                .all(|item| !item.reference.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct HaltRecordWire {
    #[serde(default)]
    halt_id: Option<String>,
    // Legacy writers used `halt_ref`; it must agree with `halt_id`.
    #[serde(default)]
    halt_ref: Option<String>,
    stage: GateStage,
    invariant_id: String,
    reason: String,
    details: String,
    evidence: Vec<EvidenceItem>,
    retryability: Retryability,
    recorded_at: DateTimeUtc,
}

/// The durable, immutable explanation of a stop. Construction rejects empty
/// reason/details/evidence, and `halt_id` is content-derived so the same
/// violating context always yields the same id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "HaltRecordWire")]
pub struct HaltRecord {
    halt_id: String,
    stage: GateStage,
    invariant_id: String,
    reason: String,
    details: String,
    evidence: Vec<EvidenceItem>,
    retryability: Retryability,
    recorded_at: DateTimeUtc,
}

impl HaltRecord {
    /// Builds a validated halt record.
    ///
    /// # Errors
    /// Returns [`DomainError::HaltPayload`] when reason, details, or any
    /// evidence reference is empty, or when no evidence is supplied.
    pub fn new(
        stage: GateStage,
        invariant_id: &str,
        reason: &str,
        details: &str,
        evidence: Vec<EvidenceItem>,
        retryability: Retryability,
        recorded_at: DateTimeUtc,
    ) -> Result<Self, DomainError> {
        if invariant_id.trim().is_empty() {
            return Err(DomainError::HaltPayload(
                "invariant_id MUST be non-empty".to_string(),
            ));
        }
        if reason.trim().is_empty() {
            return Err(DomainError::HaltPayload(
                "reason MUST be non-empty".to_string(),
            ));
        }
        if details.trim().is_empty() {
            return Err(DomainError::HaltPayload(
                "details MUST be non-empty".to_string(),
            ));
        }
        if evidence.is_empty() {
            return Err(DomainError::HaltPayload(
                "evidence MUST contain at least one item".to_string(),
            ));
        }
        for item in &evidence {
            if item.reference.trim().is_empty() {
                return Err(DomainError::HaltPayload(format!(
                    "evidence item '{}' has an empty reference",
                    item.tag
                )));
            }
        }

        let halt_id = derive_halt_id(stage, invariant_id, reason, &evidence)?;

        Ok(Self {
            halt_id,
            stage,
            invariant_id: invariant_id.to_string(),
            reason: reason.to_string(),
            details: details.to_string(),
            evidence,
            retryability,
            recorded_at,
        })
    }

    #[must_use]
    pub fn halt_id(&self) -> &str {
        &self.halt_id
    }

    #[must_use]
    pub fn stage(&self) -> GateStage {
        self.stage
    }

    #[must_use]
    pub fn invariant_id(&self) -> &str {
        &self.invariant_id
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    #[must_use]
    pub fn details(&self) -> &str {
        &self.details
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceItem] {
        &self.evidence
    }

    #[must_use]
    pub fn retryability(&self) -> Retryability {
        self.retryability
    }

    #[must_use]
    pub fn recorded_at(&self) -> DateTimeUtc {
        self.recorded_at
    }
}

impl TryFrom<HaltRecordWire> for HaltRecord {
    type Error = DomainError;

    fn try_from(wire: HaltRecordWire) -> Result<Self, Self::Error> {
        let declared = match (wire.halt_id, wire.halt_ref) {
            (Some(canonical), Some(legacy)) if canonical != legacy => {
                return Err(DomainError::HaltPayload(
                    "halt_id and legacy halt_ref disagree".to_string(),
                ));
            }
            (Some(canonical), _) => canonical,
            (None, Some(legacy)) => legacy,
            (None, None) => {
                return Err(DomainError::HaltPayload(
                    "halt_id MUST be present".to_string(),
                ));
            }
        };

        let record = Self::new(
            wire.stage,
            &wire.invariant_id,
            &wire.reason,
            &wire.details,
            wire.evidence,
            wire.retryability,
            wire.recorded_at,
        )?;

        if record.halt_id != declared {
            return Err(DomainError::HaltPayload(
                "halt_id does not match content-derived identity".to_string(),
            ));
        }

        Ok(record)
    }
}

fn derive_halt_id(
    stage: GateStage,
    invariant_id: &str,
    reason: &str,
    evidence: &[EvidenceItem],
) -> Result<String, DomainError> {
    // Timestamps are excluded: identity is the violating context, not the
    // moment it was observed.
    let material = json!({
        "stage": stage.as_str(),
        "invariant_id": invariant_id,
        "reason": reason,
        "evidence": evidence,
    });
    hash_json(&material)
}

/// Addressing triple tying a repair event back to the prediction it amends.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LineageRef {
    pub scope_key: String,
    pub prediction_id: String,
    pub correction_root_prediction_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RepairDecision {
    Accepted,
    Rejected,
}

/// Repair-mode audit event: the would-be corrected record plus the raw
/// comparison, awaiting resolution. The repair id is assigned at
/// construction and is not reassignable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairProposal {
    repair_id: String,
    pub lineage: LineageRef,
    pub proposed_prediction: PredictionRecord,
    pub prediction_outcome: PredictionOutcome,
    pub proposed_at: DateTimeUtc,
}

impl RepairProposal {
    /// # Errors
    /// Returns [`DomainError::Validation`] when any lineage field is empty.
    pub fn new(
        lineage: LineageRef,
        proposed_prediction: PredictionRecord,
        prediction_outcome: PredictionOutcome,
        proposed_at: DateTimeUtc,
    ) -> Result<Self, DomainError> {
        ensure_non_empty("lineage.scope_key", &lineage.scope_key)?;
        ensure_non_empty("lineage.prediction_id", &lineage.prediction_id)?;
        ensure_non_empty(
            "lineage.correction_root_prediction_id",
            &lineage.correction_root_prediction_id,
        )?;

        Ok(Self {
            repair_id: Ulid::new().to_string(),
            lineage,
            proposed_prediction,
            prediction_outcome,
            proposed_at,
        })
    }

    #[must_use]
    pub fn repair_id(&self) -> &str {
        &self.repair_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairResolution {
    pub repair_id: String,
    pub lineage: LineageRef,
    pub decision: RepairDecision,
    #[serde(default)]
    pub accepted_prediction: Option<PredictionRecord>,
    pub resolved_at: DateTimeUtc,
}

impl RepairResolution {
    /// # Errors
    /// Returns [`DomainError::Validation`] when an accepted resolution lacks
    /// the accepted record, or a rejected one carries it.
    pub fn new(
        repair_id: &str,
        lineage: LineageRef,
        decision: RepairDecision,
        accepted_prediction: Option<PredictionRecord>,
        resolved_at: DateTimeUtc,
    ) -> Result<Self, DomainError> {
        ensure_non_empty("repair_id", repair_id)?;
        match (decision, &accepted_prediction) {
            (RepairDecision::Accepted, None) => {
                return Err(DomainError::Validation(
                    "accepted resolution MUST carry accepted_prediction".to_string(),
                ));
            }
            (RepairDecision::Rejected, Some(_)) => {
                return Err(DomainError::Validation(
                    "rejected resolution MUST NOT carry accepted_prediction".to_string(),
                ));
            }
            _ => {}
        }

        Ok(Self {
            repair_id: repair_id.to_string(),
            lineage,
            decision,
            accepted_prediction,
            resolved_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InterventionAction {
    None,
    Pause,
    Timeout,
    Escalate,
    Resume,
}

impl InterventionAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pause => "pause",
            Self::Timeout => "timeout",
            Self::Escalate => "escalate",
            Self::Resume => "resume",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "pause" => Some(Self::Pause),
            "timeout" => Some(Self::Timeout),
            "escalate" => Some(Self::Escalate),
            "resume" => Some(Self::Resume),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterventionDecision {
    pub action: InterventionAction,
    pub reason: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub override_source: Option<String>,
    #[serde(default)]
    pub override_provenance: Option<String>,
}

impl InterventionDecision {
    /// `resume` is only valid when both override fields are present and
    /// non-empty.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] for a resume without provenance.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.action == InterventionAction::Resume {
            let source_ok = self
                .override_source
                .as_deref()
                .is_some_and(|value| !value.trim().is_empty());
            let provenance_ok = self
                .override_provenance
                .as_deref()
                .is_some_and(|value| !value.trim().is_empty());
            if !source_ok || !provenance_ok {
                return Err(DomainError::Validation(
                    "resume requires override_source and override_provenance".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Explicit permission token for every side-effecting call. There is no
/// default value; an append or dispatch cannot be written without one.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CapabilityAdapterGate {
    invocation_id: Ulid,
    allowed: bool,
}

impl CapabilityAdapterGate {
    #[must_use]
    pub fn allow(invocation_id: Ulid) -> Self {
        Self {
            invocation_id,
            allowed: true,
        }
    }

    #[must_use]
    pub fn deny(invocation_id: Ulid) -> Self {
        Self {
            invocation_id,
            allowed: false,
        }
    }

    #[must_use]
    pub fn invocation_id(&self) -> Ulid {
        self.invocation_id
    }

    #[must_use]
    pub fn allowed(&self) -> bool {
        self.allowed
    }
}

/// Per-turn freshness requirement supplied by an external policy adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservationFreshnessPolicyContract {
    pub scope: String,
    #[serde(default)]
    pub observed_at: Option<DateTimeUtc>,
    pub stale_after_seconds: u64,
}

/// Closed set of structured trace entries an episode may carry. One variant
/// per artifact kind so consumers can exhaustively match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "artifact_kind", rename_all = "snake_case")]
pub enum EpisodeArtifact {
    HaltObservation {
        halt_id: String,
        stage: GateStage,
        invariant_id: String,
        reason: String,
    },
    TurnSummary {
        action: String,
        reason: String,
        #[serde(default)]
        phase: Option<String>,
        recorded_at: DateTimeUtc,
    },
    AskOutboxRequest {
        request_id: String,
        scope: String,
        title: String,
        question: String,
    },
    AskOutboxResponse {
        request_id: String,
        status: String,
    },
    FreshnessCheck {
        scope: String,
        signal: String,
        reason: String,
        #[serde(default)]
        last_observed_at: Option<DateTimeUtc>,
        stale_after_seconds: u64,
    },
    PredictionOutcome {
        outcome: PredictionOutcome,
    },
    SchemaInterpretation {
        schemas: Vec<String>,
        ambiguities: Vec<String>,
    },
    UtteranceClassification {
        label: String,
        #[serde(default)]
        confidence: Option<f64>,
    },
    InterventionNote {
        phase: String,
        action: String,
        reason: String,
    },
}

/// One conversational turn. Created once, owned by the turn that created it,
/// and mutated only by appending observations, artifacts, and effects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    pub episode_id: EpisodeId,
    pub ask: String,
    pub observations: Vec<Observation>,
    pub artifacts: Vec<EpisodeArtifact>,
    pub observer: ObserverFrame,
    pub effects: Vec<DecisionEffect>,
    pub started_at: DateTimeUtc,
}

impl Episode {
    /// # Errors
    /// Returns [`DomainError::Validation`] when the ask text is empty.
    pub fn new(
        ask: &str,
        observer: ObserverFrame,
        started_at: DateTimeUtc,
    ) -> Result<Self, DomainError> {
        ensure_non_empty("ask", ask)?;
        Ok(Self {
            episode_id: EpisodeId::new(),
            ask: ask.to_string(),
            observations: Vec::new(),
            artifacts: Vec::new(),
            observer,
            effects: Vec::new(),
            started_at,
        })
    }

    pub fn record_observation(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    pub fn append_artifact(&mut self, artifact: EpisodeArtifact) {
        self.artifacts.push(artifact);
    }

    pub fn link_effect(&mut self, effect: DecisionEffect) {
        self.effects.push(effect);
    }

    /// Most recent observation whose scope matches, or — when the contract
    /// names no scope on the observation side — the most recent observation
    /// of any scope.
    #[must_use]
    pub fn latest_observation_for_scope(&self, scope: &str) -> Option<&Observation> {
        self.observations
            .iter()
            .rev()
            .find(|observation| observation.scope.as_deref() == Some(scope))
    }
}

/// One line of the persisted ledger. The `event_kind` tag is the stable wire
/// discriminator; `prediction` is the legacy spelling of
/// `prediction_record`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_kind", rename_all = "snake_case")]
pub enum LedgerRecord {
    #[serde(alias = "prediction")]
    PredictionRecord {
        prediction: PredictionRecord,
        recorded_at: DateTimeUtc,
    },
    Halt {
        halt: HaltRecord,
    },
    RepairProposal {
        proposal: RepairProposal,
    },
    RepairResolution {
        resolution: RepairResolution,
    },
    AskOutboxRequest {
        request_id: String,
        scope: String,
        title: String,
        question: String,
        recorded_at: DateTimeUtc,
    },
    AskOutboxResponse {
        request_id: String,
        status: String,
        recorded_at: DateTimeUtc,
    },
}

impl LedgerRecord {
    #[must_use]
    pub fn prediction(prediction: PredictionRecord, recorded_at: DateTimeUtc) -> Self {
        Self::PredictionRecord {
            prediction,
            recorded_at,
        }
    }

    #[must_use]
    pub fn event_kind(&self) -> &'static str {
        match self {
            Self::PredictionRecord { .. } => "prediction_record",
            Self::Halt { .. } => "halt",
            Self::RepairProposal { .. } => "repair_proposal",
            Self::RepairResolution { .. } => "repair_resolution",
            Self::AskOutboxRequest { .. } => "ask_outbox_request",
            Self::AskOutboxResponse { .. } => "ask_outbox_response",
        }
    }

    #[must_use]
    pub fn recorded_at(&self) -> DateTimeUtc {
        match self {
            Self::PredictionRecord { recorded_at, .. }
            | Self::AskOutboxRequest { recorded_at, .. }
            | Self::AskOutboxResponse { recorded_at, .. } => *recorded_at,
            Self::Halt { halt } => halt.recorded_at(),
            Self::RepairProposal { proposal } => proposal.proposed_at,
            Self::RepairResolution { resolution } => resolution.resolved_at,
        }
    }

    /// Tolerant wire decoding: non-objects and unrecognized kinds return
    /// `None`, and a record that looks like a halt but fails full-field
    /// validation is treated as noise rather than a halt.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let kind = object.get("event_kind")?.as_str()?;
        match kind {
            "prediction_record" | "prediction" | "halt" | "repair_proposal"
            | "repair_resolution" | "ask_outbox_request" | "ask_outbox_response" => {
                serde_json::from_value(value.clone()).ok()
            }
            _ => None,
        }
    }
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns [`DomainError::Validation`] if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String, DomainError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| DomainError::Validation(format!("failed to serialize JSON: {err}")))?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`DomainError::Validation`] when the value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DomainError::Validation`] when parsing fails or the input is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<DateTimeUtc, DomainError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DomainError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DomainError::Validation`] when formatting fails.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String, DomainError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::Validation(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> DateTimeUtc {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_evidence() -> Vec<EvidenceItem> {
        vec![EvidenceItem::new("scope_key", "turn:1")]
    }

    fn fixture_halt() -> HaltRecord {
        must_ok(HaltRecord::new(
            GateStage::PreConsume,
            "prediction_availability.v1",
            "no_current_prediction",
            "scope turn:1 has no projected prediction",
            fixture_evidence(),
            Retryability::Retryable,
            must_utc("2026-03-01T09:00:00Z"),
        ))
    }

    #[test]
    fn halt_requires_details_and_evidence() {
        let empty_details = HaltRecord::new(
            GateStage::PreConsume,
            "prediction_availability.v1",
            "no_current_prediction",
            "   ",
            fixture_evidence(),
            Retryability::Retryable,
            must_utc("2026-03-01T09:00:00Z"),
        );
        assert!(empty_details.is_err());

        let empty_evidence = HaltRecord::new(
            GateStage::PreConsume,
            "prediction_availability.v1",
            "no_current_prediction",
            "details",
            Vec::new(),
            Retryability::Retryable,
            must_utc("2026-03-01T09:00:00Z"),
        );
        assert!(empty_evidence.is_err());

        let empty_reference = HaltRecord::new(
            GateStage::PreConsume,
            "prediction_availability.v1",
            "no_current_prediction",
            "details",
            vec![EvidenceItem::new("scope_key", "")],
            Retryability::Retryable,
            must_utc("2026-03-01T09:00:00Z"),
        );
        assert!(empty_reference.is_err());
    }

    #[test]
    fn halt_id_is_stable_across_timestamps() {
        let first = fixture_halt();
        let second = must_ok(HaltRecord::new(
            GateStage::PreConsume,
            "prediction_availability.v1",
            "no_current_prediction",
            "scope turn:1 has no projected prediction",
            fixture_evidence(),
            Retryability::Retryable,
            must_utc("2027-01-01T00:00:00Z"),
        ));
        assert_eq!(first.halt_id(), second.halt_id());
    }

    #[test]
    fn halt_wire_rejects_alias_disagreement() {
        let halt = fixture_halt();
        let mut value = must_ok(serde_json::to_value(&halt));
        let object = match value.as_object_mut() {
            Some(map) => map,
            None => panic!("halt serialized to non-object"),
        };
        object.insert("halt_ref".to_string(), Value::String("bogus".to_string()));

        let decoded: Result<HaltRecord, _> = serde_json::from_value(value);
        assert!(decoded.is_err());
    }

    #[test]
    fn halt_wire_accepts_matching_legacy_alias() {
        let halt = fixture_halt();
        let mut value = must_ok(serde_json::to_value(&halt));
        let object = match value.as_object_mut() {
            Some(map) => map,
            None => panic!("halt serialized to non-object"),
        };
        let id = object
            .get("halt_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        object.insert(
            "halt_ref".to_string(),
            Value::String(id.unwrap_or_default()),
        );

        let decoded: Result<HaltRecord, _> = serde_json::from_value(value);
        assert!(decoded.is_ok());
    }

    #[test]
    fn halt_wire_rejects_tampered_identity() {
        let halt = fixture_halt();
        let mut value = must_ok(serde_json::to_value(&halt));
        let object = match value.as_object_mut() {
            Some(map) => map,
            None => panic!("halt serialized to non-object"),
        };
        object.insert(
            "halt_id".to_string(),
            Value::String("deadbeef".to_string()),
        );

        let decoded: Result<HaltRecord, _> = serde_json::from_value(value);
        assert!(decoded.is_err());
    }

    #[test]
    fn resume_without_provenance_is_invalid() {
        let decision = InterventionDecision {
            action: InterventionAction::Resume,
            reason: "operator says go".to_string(),
            metadata: Value::Null,
            override_source: Some("operator".to_string()),
            override_provenance: None,
        };
        assert!(decision.validate().is_err());

        let complete = InterventionDecision {
            action: InterventionAction::Resume,
            reason: "operator says go".to_string(),
            metadata: Value::Null,
            override_source: Some("operator".to_string()),
            override_provenance: Some("ticket:4711".to_string()),
        };
        assert!(complete.validate().is_ok());
    }

    #[test]
    fn accepted_resolution_requires_record() {
        let lineage = LineageRef {
            scope_key: "turn:1".to_string(),
            prediction_id: "pred:1".to_string(),
            correction_root_prediction_id: "pred:1".to_string(),
        };
        let missing = RepairResolution::new(
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            lineage.clone(),
            RepairDecision::Accepted,
            None,
            must_utc("2026-03-01T09:00:00Z"),
        );
        assert!(missing.is_err());

        let prediction = must_ok(PredictionRecord::new(
            "pred:1.r1",
            "turn:1",
            "slot_confidence",
            0.75,
            must_utc("2026-03-01T09:00:00Z"),
        ));
        let rejected_with_record = RepairResolution::new(
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            lineage,
            RepairDecision::Rejected,
            Some(prediction),
            must_utc("2026-03-01T09:00:00Z"),
        );
        assert!(rejected_with_record.is_err());
    }

    #[test]
    fn ledger_record_tolerant_decoding() {
        let prediction = must_ok(PredictionRecord::new(
            "pred:1",
            "turn:1",
            "slot_confidence",
            0.75,
            must_utc("2026-03-01T09:00:00Z"),
        ));
        let record = LedgerRecord::prediction(prediction, must_utc("2026-03-01T09:00:01Z"));
        let value = must_ok(serde_json::to_value(&record));
        assert!(LedgerRecord::from_value(&value).is_some());

        // Legacy kind spelling decodes to the same variant.
        let mut legacy = value.clone();
        if let Some(map) = legacy.as_object_mut() {
            map.insert(
                "event_kind".to_string(),
                Value::String("prediction".to_string()),
            );
        }
        let decoded = LedgerRecord::from_value(&legacy);
        assert_eq!(decoded, Some(record));

        // Unrecognized kinds are dropped.
        let unknown = serde_json::json!({"event_kind": "mystery", "payload": 1});
        assert!(LedgerRecord::from_value(&unknown).is_none());

        // Non-objects are skipped.
        assert!(LedgerRecord::from_value(&Value::Null).is_none());

        // Halt-shaped records failing validation are noise, not halts.
        let pseudo_halt = serde_json::json!({
            "event_kind": "halt",
            "halt": {
                "halt_id": "x",
                "stage": "pre_consume",
                "invariant_id": "prediction_availability.v1",
                "reason": "no_current_prediction",
                "details": "",
                "evidence": [],
                "retryability": "retryable",
            }
        });
        assert!(LedgerRecord::from_value(&pseudo_halt).is_none());
    }

    #[test]
    fn observer_frame_allow_list_scopes_permission() {
        let open = ObserverFrame::turn_default();
        assert!(open.permits("prediction_availability.v1"));

        let restricted = ObserverFrame {
            role: "auditor".to_string(),
            authorization: AuthorizationLevel::ReadOnly,
            evaluation_invariants: Some(vec!["prediction_outcome_binding.v1".to_string()]),
        };
        assert!(!restricted.permits("prediction_availability.v1"));
        assert!(restricted.permits("prediction_outcome_binding.v1"));
    }

    #[test]
    fn correction_metrics_track_mean() {
        let mut metrics = CorrectionMetrics::default();
        metrics.record_comparison(0.25);
        metrics.record_comparison(0.75);
        assert_eq!(metrics.comparisons, 2);
        assert!((metrics.total_absolute_error - 1.0).abs() < f64::EPSILON);
        assert!((metrics.mean_absolute_error - 0.5).abs() < f64::EPSILON);
    }
}

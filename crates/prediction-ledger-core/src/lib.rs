#![forbid(unsafe_code)]

//! Pure evaluation core: the invariant registry, the gate evaluator that
//! turns a stop into a persistable halt, the projection fold shared by the
//! online and replay read paths, and the correction-lineage binder.

use std::collections::BTreeMap;

use anyhow::Result;
use prediction_ledger_domain::{
    CapabilityAdapterGate, DateTimeUtc, DomainError, EvidenceItem, GateStage, HaltRecord,
    InvariantOutcome, LedgerRecord, ObserverFrame, PredictionOutcome, PredictionRecord,
    ProjectionState, RepairDecision, Retryability,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("projection error: {0}")]
    Projection(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<DomainError> for CoreError {
    fn from(err: DomainError) -> Self {
        Self::Validation(err.to_string())
    }
}

pub const PREDICTION_AVAILABILITY: &str = "prediction_availability.v1";
pub const EVIDENCE_LINK_COMPLETENESS: &str = "evidence_link_completeness.v1";
pub const PREDICTION_OUTCOME_BINDING: &str = "prediction_outcome_binding.v1";
pub const EXPLAINABLE_HALT_PAYLOAD: &str = "explainable_halt_payload.v1";

/// Receipt handed back by a successful ledger append; the evidence reference
/// names where the written record can be retrieved.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppendReceipt {
    pub sequence: u64,
    pub evidence_reference: String,
}

/// Append-only persistence contract. Every append takes an explicit
/// capability gate; there is no gate-less variant.
pub trait LedgerStore {
    #[allow(clippy::missing_errors_doc)]
    fn append_record(
        &mut self,
        gate: &CapabilityAdapterGate,
        record: &LedgerRecord,
    ) -> Result<AppendReceipt>;

    #[allow(clippy::missing_errors_doc)]
    fn append_halt(
        &mut self,
        gate: &CapabilityAdapterGate,
        halt: &HaltRecord,
    ) -> Result<AppendReceipt>;

    #[allow(clippy::missing_errors_doc)]
    fn read_records(&self) -> Result<Vec<LedgerRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn read_halts(&self) -> Result<Vec<HaltRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn replay(&self) -> Result<ReplaySummary>;
}

/// A write that just occurred, as seen by the post-write checkers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub scope_key: String,
    pub evidence_reference: Option<String>,
}

/// An observed outcome awaiting binding to a prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeBindingRequest {
    pub prediction_id: String,
    pub scope_key: String,
    pub observed_value: f64,
}

/// Snapshot handed to the pure checkers. No I/O happens behind it.
#[derive(Debug, Clone, Default)]
pub struct CheckContext<'a> {
    pub projection: Option<&'a ProjectionState>,
    pub scope_key: Option<&'a str>,
    pub outcome: Option<&'a OutcomeBindingRequest>,
    pub write: Option<&'a WriteReceipt>,
    pub candidate_halt: Option<&'a InvariantOutcome>,
}

pub type InvariantCheck = fn(&CheckContext<'_>) -> InvariantOutcome;

#[derive(Clone)]
pub struct RegisteredInvariant {
    pub invariant_id: &'static str,
    pub stage: GateStage,
    pub retryability: Retryability,
    pub check: InvariantCheck,
}

impl std::fmt::Debug for RegisteredInvariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredInvariant")
            .field("invariant_id", &self.invariant_id)
            .field("stage", &self.stage)
            .field("retryability", &self.retryability)
            .finish_non_exhaustive()
    }
}

/// Checkers keyed by stable versioned id. Evolving a checker's semantics
/// requires a new id; an old id is never redefined.
#[derive(Debug, Clone)]
pub struct InvariantRegistry {
    invariants: Vec<RegisteredInvariant>,
}

impl InvariantRegistry {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            invariants: vec![
                RegisteredInvariant {
                    invariant_id: PREDICTION_AVAILABILITY,
                    stage: GateStage::PreConsume,
                    retryability: Retryability::Retryable,
                    check: check_prediction_availability,
                },
                RegisteredInvariant {
                    invariant_id: PREDICTION_OUTCOME_BINDING,
                    stage: GateStage::PreConsume,
                    retryability: Retryability::Terminal,
                    check: check_prediction_outcome_binding,
                },
                RegisteredInvariant {
                    invariant_id: EVIDENCE_LINK_COMPLETENESS,
                    stage: GateStage::PostWrite,
                    retryability: Retryability::Retryable,
                    check: check_evidence_link_completeness,
                },
                RegisteredInvariant {
                    invariant_id: EXPLAINABLE_HALT_PAYLOAD,
                    stage: GateStage::HaltValidation,
                    retryability: Retryability::Terminal,
                    check: check_explainable_halt_payload,
                },
            ],
        }
    }

    pub fn for_stage(&self, stage: GateStage) -> impl Iterator<Item = &RegisteredInvariant> {
        self.invariants
            .iter()
            .filter(move |invariant| invariant.stage == stage)
    }

    #[must_use]
    pub fn get(&self, invariant_id: &str) -> Option<&RegisteredInvariant> {
        self.invariants
            .iter()
            .find(|invariant| invariant.invariant_id == invariant_id)
    }
}

fn check_prediction_availability(ctx: &CheckContext<'_>) -> InvariantOutcome {
    let Some(projection) = ctx.projection else {
        return InvariantOutcome::stop(
            PREDICTION_AVAILABILITY,
            "no_projection_supplied",
            "gate run supplied no projection state to consume from",
            vec![EvidenceItem::new("projection", "projection_state:absent")],
        );
    };

    if let Some(scope_key) = ctx.scope_key {
        if projection.current_predictions.contains_key(scope_key) {
            InvariantOutcome::pass(
                PREDICTION_AVAILABILITY,
                "scope_projected",
                "addressed scope key is present in the current projection",
            )
        } else {
            InvariantOutcome::stop(
                PREDICTION_AVAILABILITY,
                "no_current_prediction",
                &format!("scope key '{scope_key}' has no entry in current_predictions"),
                vec![EvidenceItem::new("scope_key", scope_key)],
            )
            .with_hint("project a prediction for this scope before consuming it")
        }
    } else if projection.current_predictions.is_empty() {
        InvariantOutcome::stop(
            PREDICTION_AVAILABILITY,
            "no_current_prediction",
            "no scope key was addressed and the projection holds zero current predictions",
            vec![EvidenceItem::new(
                "current_predictions",
                "projection_state.current_predictions:len=0",
            )],
        )
        .with_hint("append at least one prediction before the consume gate")
    } else {
        InvariantOutcome::pass(
            PREDICTION_AVAILABILITY,
            "predictions_projected",
            "projection holds at least one current prediction",
        )
    }
}

fn check_prediction_outcome_binding(ctx: &CheckContext<'_>) -> InvariantOutcome {
    match ctx.outcome {
        None => InvariantOutcome::pass(
            PREDICTION_OUTCOME_BINDING,
            "no_outcome_supplied",
            "no outcome binding was supplied to this gate run",
        ),
        Some(outcome) if outcome.prediction_id.trim().is_empty() => InvariantOutcome::stop(
            PREDICTION_OUTCOME_BINDING,
            "unbound_outcome",
            "supplied outcome carries an empty prediction_id",
            vec![EvidenceItem::new("scope_key", &outcome.scope_key)],
        ),
        Some(outcome) => InvariantOutcome::pass(
            PREDICTION_OUTCOME_BINDING,
            "outcome_bound",
            &format!("outcome is bound to prediction '{}'", outcome.prediction_id),
        ),
    }
}

fn check_evidence_link_completeness(ctx: &CheckContext<'_>) -> InvariantOutcome {
    let Some(write) = ctx.write else {
        return InvariantOutcome::pass(
            EVIDENCE_LINK_COMPLETENESS,
            "no_write_occurred",
            "no write occurred in this gate run",
        );
    };

    let reference_ok = write
        .evidence_reference
        .as_deref()
        .is_some_and(|reference| !reference.trim().is_empty());
    if !reference_ok {
        return InvariantOutcome::stop(
            EVIDENCE_LINK_COMPLETENESS,
            "missing_evidence_reference",
            &format!(
                "write for scope key '{}' produced no retrievable evidence reference",
                write.scope_key
            ),
            vec![EvidenceItem::new("scope_key", &write.scope_key)],
        );
    }

    let visible = ctx
        .projection
        .is_some_and(|projection| projection.current_predictions.contains_key(&write.scope_key));
    if !visible {
        return InvariantOutcome::stop(
            EVIDENCE_LINK_COMPLETENESS,
            "write_not_visible_in_view",
            &format!(
                "written scope key '{}' is absent from the current projection",
                write.scope_key
            ),
            vec![EvidenceItem::new("scope_key", &write.scope_key)],
        );
    }

    InvariantOutcome::pass(
        EVIDENCE_LINK_COMPLETENESS,
        "write_evidenced",
        "write produced an evidence reference and is visible in the projection",
    )
}

fn check_explainable_halt_payload(ctx: &CheckContext<'_>) -> InvariantOutcome {
    let Some(candidate) = ctx.candidate_halt else {
        return InvariantOutcome::pass(
            EXPLAINABLE_HALT_PAYLOAD,
            "no_candidate_halt",
            "no candidate halt outcome was supplied",
        );
    };

    if candidate.is_explainable() {
        InvariantOutcome::pass(
            EXPLAINABLE_HALT_PAYLOAD,
            "halt_explainable",
            "candidate halt carries non-empty details and evidence",
        )
    } else {
        InvariantOutcome::stop(
            EXPLAINABLE_HALT_PAYLOAD,
            "unexplainable_halt",
            &format!(
                "candidate halt from '{}' lacks non-empty details or evidence",
                candidate.invariant_id
            ),
            vec![
                EvidenceItem::new("candidate_invariant", &candidate.invariant_id),
                EvidenceItem::new("candidate_code", &candidate.code),
            ],
        )
    }
}

/// Outcome of one gate evaluation run: either every checker that ran
/// continued, or the earliest stop became a persistable halt.
#[derive(Debug, Clone, PartialEq)]
pub enum GateEvaluation {
    Success {
        outcomes: Vec<InvariantOutcome>,
    },
    Halted {
        halt: HaltRecord,
        outcomes: Vec<InvariantOutcome>,
    },
}

impl GateEvaluation {
    #[must_use]
    pub fn halted(&self) -> Option<&HaltRecord> {
        match self {
            Self::Halted { halt, .. } => Some(halt),
            Self::Success { .. } => None,
        }
    }
}

/// Runs the registered checkers at `pre_consume`, then — when a write just
/// occurred — `post_write`, in strict order. The earliest stop wins; nothing
/// has been appended at that point, so there is nothing to roll back. A stop
/// is re-validated by the `explainable_halt_payload` meta-check before it
/// may become a halt; when the meta-check itself stops, the meta outcome is
/// the one that persists. The observer allow-list skips unnamed checkers
/// entirely (they appear nowhere in the outcome trail), except the
/// meta-check, which guards log integrity rather than turn semantics.
///
/// # Errors
/// Returns [`CoreError::Validation`] when the winning outcome cannot be
/// shaped into a valid halt record.
pub fn evaluate_turn_gates(
    registry: &InvariantRegistry,
    observer: &ObserverFrame,
    pre_consume: &CheckContext<'_>,
    post_write: Option<&CheckContext<'_>>,
    recorded_at: DateTimeUtc,
) -> Result<GateEvaluation, CoreError> {
    let mut outcomes = Vec::new();

    for invariant in registry.for_stage(GateStage::PreConsume) {
        if !observer.permits(invariant.invariant_id) {
            continue;
        }
        let outcome = (invariant.check)(pre_consume);
        let stopped = outcome.is_stop();
        outcomes.push(outcome);
        if stopped {
            return finish_halted(registry, invariant, outcomes, recorded_at);
        }
    }

    if let Some(post_ctx) = post_write {
        for invariant in registry.for_stage(GateStage::PostWrite) {
            if !observer.permits(invariant.invariant_id) {
                continue;
            }
            let outcome = (invariant.check)(post_ctx);
            let stopped = outcome.is_stop();
            outcomes.push(outcome);
            if stopped {
                return finish_halted(registry, invariant, outcomes, recorded_at);
            }
        }
    }

    Ok(GateEvaluation::Success { outcomes })
}

fn finish_halted(
    registry: &InvariantRegistry,
    stopped_by: &RegisteredInvariant,
    mut outcomes: Vec<InvariantOutcome>,
    recorded_at: DateTimeUtc,
) -> Result<GateEvaluation, CoreError> {
    let candidate = outcomes
        .last()
        .cloned()
        .ok_or_else(|| CoreError::Validation("halt path reached with no outcome".to_string()))?;

    let meta = registry.get(EXPLAINABLE_HALT_PAYLOAD).ok_or_else(|| {
        CoreError::Configuration("explainable_halt_payload.v1 is not registered".to_string())
    })?;
    let meta_ctx = CheckContext {
        candidate_halt: Some(&candidate),
        ..CheckContext::default()
    };
    let meta_outcome = (meta.check)(&meta_ctx);

    let halt = if meta_outcome.is_stop() {
        // The original stop could not explain itself; the meta violation is
        // what gets persisted.
        let halt = HaltRecord::new(
            GateStage::HaltValidation,
            EXPLAINABLE_HALT_PAYLOAD,
            &meta_outcome.code,
            &meta_outcome.details,
            meta_outcome.evidence.clone(),
            meta.retryability,
            recorded_at,
        )?;
        outcomes.push(meta_outcome);
        halt
    } else {
        outcomes.push(meta_outcome);
        HaltRecord::new(
            stopped_by.stage,
            stopped_by.invariant_id,
            &candidate.code,
            &candidate.details,
            candidate.evidence.clone(),
            stopped_by.retryability,
            recorded_at,
        )?
    };

    Ok(GateEvaluation::Halted { halt, outcomes })
}

/// Per-root correction-cost attribution: how much error a prediction's
/// correction chain has accumulated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CorrectionAttribution {
    pub corrections: u64,
    pub total_absolute_error: f64,
    pub mean_absolute_error: f64,
}

impl CorrectionAttribution {
    fn record(&mut self, absolute_error: f64) {
        self.corrections += 1;
        self.total_absolute_error += absolute_error;
        #[allow(clippy::cast_precision_loss)]
        {
            self.mean_absolute_error = self.total_absolute_error / self.corrections as f64;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsSnapshot {
    pub correction_attribution: BTreeMap<String, CorrectionAttribution>,
    pub outstanding_ask_requests: BTreeMap<String, String>,
    pub answered_ask_requests: u64,
    pub halts_observed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplaySummary {
    pub projection_state: ProjectionState,
    pub analytics: AnalyticsSnapshot,
    pub records_processed: u64,
}

/// Folds one record into the live projection. O(1) per event; the online
/// read path applies this as records are appended.
pub fn project_current(state: &mut ProjectionState, record: &LedgerRecord) {
    match record {
        LedgerRecord::PredictionRecord {
            prediction,
            recorded_at,
        } => {
            if prediction.was_corrected {
                if let Some(absolute_error) = prediction.absolute_error {
                    state.correction_metrics.record_comparison(absolute_error);
                }
            }
            state
                .current_predictions
                .insert(prediction.scope_key.clone(), prediction.clone());
            state.last_updated_at = Some(*recorded_at);
        }
        LedgerRecord::RepairResolution { resolution } => {
            if resolution.decision == RepairDecision::Accepted {
                if let Some(accepted) = &resolution.accepted_prediction {
                    if accepted.was_corrected {
                        if let Some(absolute_error) = accepted.absolute_error {
                            state.correction_metrics.record_comparison(absolute_error);
                        }
                    }
                    state
                        .current_predictions
                        .insert(accepted.scope_key.clone(), accepted.clone());
                    state.last_updated_at = Some(resolution.resolved_at);
                }
            }
        }
        // Proposals, halts, and outbox events carry audit/analytics weight
        // only; the materialized view is untouched.
        LedgerRecord::Halt { .. }
        | LedgerRecord::RepairProposal { .. }
        | LedgerRecord::AskOutboxRequest { .. }
        | LedgerRecord::AskOutboxResponse { .. } => {}
    }
}

fn project_analytics(analytics: &mut AnalyticsSnapshot, record: &LedgerRecord) {
    match record {
        LedgerRecord::PredictionRecord { prediction, .. } => {
            if prediction.was_corrected {
                if let Some(absolute_error) = prediction.absolute_error {
                    analytics
                        .correction_attribution
                        .entry(prediction.correction_root().to_string())
                        .or_default()
                        .record(absolute_error);
                }
            }
        }
        LedgerRecord::RepairResolution { resolution } => {
            if resolution.decision == RepairDecision::Accepted {
                if let Some(accepted) = &resolution.accepted_prediction {
                    if let Some(absolute_error) = accepted.absolute_error {
                        if accepted.was_corrected {
                            analytics
                                .correction_attribution
                                .entry(accepted.correction_root().to_string())
                                .or_default()
                                .record(absolute_error);
                        }
                    }
                }
            }
        }
        LedgerRecord::Halt { .. } => {
            analytics.halts_observed += 1;
        }
        LedgerRecord::AskOutboxRequest {
            request_id, scope, ..
        } => {
            analytics
                .outstanding_ask_requests
                .insert(request_id.clone(), scope.clone());
        }
        LedgerRecord::AskOutboxResponse { request_id, .. } => {
            if analytics.outstanding_ask_requests.remove(request_id).is_some() {
                analytics.answered_ask_requests += 1;
            }
        }
        LedgerRecord::RepairProposal { .. } => {}
    }
}

/// Rebuilds the projection and an analytics snapshot from scratch by
/// scanning every record in append order and applying the same fold the
/// online path uses. The fold reads no wall clock, so replaying the same
/// records always yields byte-identical serialized output.
pub fn replay_projection_analytics<I>(records: I) -> ReplaySummary
where
    I: IntoIterator<Item = LedgerRecord>,
{
    let mut summary = ReplaySummary::default();
    for record in records {
        project_current(&mut summary.projection_state, &record);
        project_analytics(&mut summary.analytics, &record);
        summary.records_processed += 1;
    }
    summary
}

/// A corrected record plus the standalone comparison artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundOutcome {
    pub corrected: PredictionRecord,
    pub outcome: PredictionOutcome,
}

/// Compares an observed value to a previously issued prediction and produces
/// the next revision in its correction chain. The corrected record gets the
/// deterministic id `"<root>.r<revision>"` so chains stay walkable without
/// consulting external state.
///
/// # Errors
/// Returns [`CoreError::Validation`] when the prediction carries an empty
/// id, which would make the chain unaddressable.
pub fn bind_prediction_outcome(
    prediction: &PredictionRecord,
    observed_value: f64,
    recorded_at: DateTimeUtc,
) -> Result<BoundOutcome, CoreError> {
    if prediction.prediction_id.trim().is_empty() {
        return Err(CoreError::Validation(
            "prediction_id MUST be non-empty to bind an outcome".to_string(),
        ));
    }

    let error = observed_value - prediction.expectation;
    let absolute_error = error.abs();
    let revision = prediction.correction_revision + 1;
    let root = prediction.correction_root().to_string();

    let corrected = PredictionRecord {
        prediction_id: format!("{root}.r{revision}"),
        scope_key: prediction.scope_key.clone(),
        target_variable: prediction.target_variable.clone(),
        expectation: prediction.expectation,
        issued_at: prediction.issued_at,
        observed_value: Some(observed_value),
        prediction_error: Some(error),
        absolute_error: Some(absolute_error),
        was_corrected: true,
        correction_parent_prediction_id: Some(prediction.prediction_id.clone()),
        correction_root_prediction_id: Some(root),
        correction_revision: revision,
    };

    let outcome = PredictionOutcome {
        prediction_id: prediction.prediction_id.clone(),
        scope_key: prediction.scope_key.clone(),
        target_variable: prediction.target_variable.clone(),
        error_metric: error,
        absolute_error,
        recorded_at,
    };

    Ok(BoundOutcome { corrected, outcome })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prediction_ledger_domain::{
        parse_rfc3339_utc, AuthorizationLevel, LineageRef, RepairProposal, RepairResolution,
    };

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> DateTimeUtc {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_prediction(id: &str, scope: &str) -> PredictionRecord {
        must_ok(PredictionRecord::new(
            id,
            scope,
            "slot_confidence",
            0.75,
            must_utc("2026-03-01T09:00:00Z"),
        ))
    }

    #[test]
    fn pre_consume_gate_halts_on_empty_projection() {
        let registry = InvariantRegistry::standard();
        let observer = ObserverFrame::turn_default();
        let projection = ProjectionState::new();
        let ctx = CheckContext {
            projection: Some(&projection),
            ..CheckContext::default()
        };

        let evaluation = must_ok(evaluate_turn_gates(
            &registry,
            &observer,
            &ctx,
            None,
            must_utc("2026-03-01T09:00:00Z"),
        ));

        let halt = match evaluation.halted() {
            Some(halt) => halt,
            None => panic!("expected a halt against an empty projection"),
        };
        assert_eq!(halt.invariant_id(), PREDICTION_AVAILABILITY);
        assert_eq!(halt.stage(), GateStage::PreConsume);
        assert!(!halt.evidence().is_empty());
    }

    #[test]
    fn pre_consume_gate_passes_when_scope_projected() {
        let registry = InvariantRegistry::standard();
        let observer = ObserverFrame::turn_default();
        let mut projection = ProjectionState::new();
        let prediction = fixture_prediction("pred:1", "turn:1");
        project_current(
            &mut projection,
            &LedgerRecord::prediction(prediction, must_utc("2026-03-01T09:00:01Z")),
        );

        let ctx = CheckContext {
            projection: Some(&projection),
            scope_key: Some("turn:1"),
            ..CheckContext::default()
        };
        let evaluation = must_ok(evaluate_turn_gates(
            &registry,
            &observer,
            &ctx,
            None,
            must_utc("2026-03-01T09:00:02Z"),
        ));
        assert!(evaluation.halted().is_none());
    }

    #[test]
    fn observer_allow_list_skips_checkers_silently() {
        let registry = InvariantRegistry::standard();
        let observer = ObserverFrame {
            role: "auditor".to_string(),
            authorization: AuthorizationLevel::ReadOnly,
            evaluation_invariants: Some(vec![PREDICTION_OUTCOME_BINDING.to_string()]),
        };
        // Empty projection would halt prediction_availability, but the
        // allow-list keeps that checker out of the run entirely.
        let projection = ProjectionState::new();
        let ctx = CheckContext {
            projection: Some(&projection),
            ..CheckContext::default()
        };

        let evaluation = must_ok(evaluate_turn_gates(
            &registry,
            &observer,
            &ctx,
            None,
            must_utc("2026-03-01T09:00:00Z"),
        ));
        match evaluation {
            GateEvaluation::Success { outcomes } => {
                assert_eq!(outcomes.len(), 1);
                assert_eq!(outcomes[0].invariant_id, PREDICTION_OUTCOME_BINDING);
            }
            GateEvaluation::Halted { .. } => panic!("skipped checker caused a halt"),
        }
    }

    #[test]
    fn unexplainable_stop_escalates_to_meta_violation() {
        let registry = InvariantRegistry::standard();
        let candidate = InvariantOutcome {
            invariant_id: "custom_check.v1".to_string(),
            passed: false,
            flow: prediction_ledger_domain::Flow::Stop,
            validity: prediction_ledger_domain::Validity::Invalid,
            code: "opaque_stop".to_string(),
            evidence: Vec::new(),
            details: String::new(),
            action_hints: Vec::new(),
        };
        let stopped_by = RegisteredInvariant {
            invariant_id: PREDICTION_AVAILABILITY,
            stage: GateStage::PreConsume,
            retryability: Retryability::Retryable,
            check: check_prediction_availability,
        };

        let evaluation = must_ok(finish_halted(
            &registry,
            &stopped_by,
            vec![candidate],
            must_utc("2026-03-01T09:00:00Z"),
        ));
        let halt = match evaluation.halted() {
            Some(halt) => halt,
            None => panic!("expected a meta-violation halt"),
        };
        assert_eq!(halt.invariant_id(), EXPLAINABLE_HALT_PAYLOAD);
        assert_eq!(halt.stage(), GateStage::HaltValidation);
    }

    #[test]
    fn post_write_gate_stops_without_evidence_reference() {
        let registry = InvariantRegistry::standard();
        let observer = ObserverFrame::turn_default();
        let mut projection = ProjectionState::new();
        project_current(
            &mut projection,
            &LedgerRecord::prediction(
                fixture_prediction("pred:1", "turn:1"),
                must_utc("2026-03-01T09:00:01Z"),
            ),
        );

        let pre_ctx = CheckContext {
            projection: Some(&projection),
            scope_key: Some("turn:1"),
            ..CheckContext::default()
        };
        let write = WriteReceipt {
            scope_key: "turn:1".to_string(),
            evidence_reference: None,
        };
        let post_ctx = CheckContext {
            projection: Some(&projection),
            write: Some(&write),
            ..CheckContext::default()
        };

        let evaluation = must_ok(evaluate_turn_gates(
            &registry,
            &observer,
            &pre_ctx,
            Some(&post_ctx),
            must_utc("2026-03-01T09:00:02Z"),
        ));
        let halt = match evaluation.halted() {
            Some(halt) => halt,
            None => panic!("expected an evidence-link halt"),
        };
        assert_eq!(halt.invariant_id(), EVIDENCE_LINK_COMPLETENESS);
    }

    #[test]
    fn bind_outcome_matches_documented_example() {
        let prediction = fixture_prediction("pred:1", "turn:1");
        let bound = must_ok(bind_prediction_outcome(
            &prediction,
            1.0,
            must_utc("2026-03-01T09:05:00Z"),
        ));

        assert!((bound.outcome.absolute_error - 0.25).abs() < f64::EPSILON);
        assert!(bound.corrected.was_corrected);
        assert_eq!(bound.corrected.correction_revision, 1);
        assert_eq!(
            bound.corrected.correction_root_prediction_id.as_deref(),
            Some("pred:1")
        );
        assert_eq!(
            bound.corrected.correction_parent_prediction_id.as_deref(),
            Some("pred:1")
        );
    }

    #[test]
    fn correction_chain_revisions_increment_from_root() {
        let prediction = fixture_prediction("pred:1", "turn:1");
        let first = must_ok(bind_prediction_outcome(
            &prediction,
            1.0,
            must_utc("2026-03-01T09:05:00Z"),
        ));
        let second = must_ok(bind_prediction_outcome(
            &first.corrected,
            0.5,
            must_utc("2026-03-01T09:10:00Z"),
        ));

        assert_eq!(second.corrected.correction_revision, 2);
        assert_eq!(
            second.corrected.correction_root_prediction_id.as_deref(),
            Some("pred:1")
        );
        assert_eq!(
            second.corrected.correction_parent_prediction_id.as_deref(),
            Some("pred:1.r1")
        );
    }

    #[test]
    fn repair_mode_replay_matches_direct_mode_projection() {
        let issued_at = must_utc("2026-03-01T09:00:00Z");
        let bound_at = must_utc("2026-03-01T09:05:00Z");
        let prediction = fixture_prediction("pred:1", "turn:1");
        let bound = must_ok(bind_prediction_outcome(&prediction, 1.0, bound_at));

        let direct_log = vec![
            LedgerRecord::prediction(prediction.clone(), issued_at),
            LedgerRecord::prediction(bound.corrected.clone(), bound_at),
        ];

        let lineage = LineageRef {
            scope_key: "turn:1".to_string(),
            prediction_id: prediction.prediction_id.clone(),
            correction_root_prediction_id: "pred:1".to_string(),
        };
        let proposal = must_ok(RepairProposal::new(
            lineage.clone(),
            bound.corrected.clone(),
            bound.outcome.clone(),
            bound_at,
        ));
        let resolution = must_ok(RepairResolution::new(
            proposal.repair_id(),
            lineage,
            RepairDecision::Accepted,
            Some(bound.corrected.clone()),
            bound_at,
        ));
        let repair_log = vec![
            LedgerRecord::prediction(prediction, issued_at),
            LedgerRecord::RepairProposal { proposal },
            LedgerRecord::RepairResolution { resolution },
        ];

        let direct = replay_projection_analytics(direct_log);
        let repaired = replay_projection_analytics(repair_log);

        assert_eq!(direct.projection_state, repaired.projection_state);
        assert_eq!(
            direct.analytics.correction_attribution,
            repaired.analytics.correction_attribution
        );
    }

    #[test]
    fn rejected_resolution_leaves_projection_unchanged() {
        let issued_at = must_utc("2026-03-01T09:00:00Z");
        let bound_at = must_utc("2026-03-01T09:05:00Z");
        let prediction = fixture_prediction("pred:1", "turn:1");
        let bound = must_ok(bind_prediction_outcome(&prediction, 1.0, bound_at));

        let lineage = LineageRef {
            scope_key: "turn:1".to_string(),
            prediction_id: prediction.prediction_id.clone(),
            correction_root_prediction_id: "pred:1".to_string(),
        };
        let proposal = must_ok(RepairProposal::new(
            lineage.clone(),
            bound.corrected,
            bound.outcome,
            bound_at,
        ));
        let resolution = must_ok(RepairResolution::new(
            proposal.repair_id(),
            lineage,
            RepairDecision::Rejected,
            None,
            bound_at,
        ));

        let baseline = replay_projection_analytics(vec![LedgerRecord::prediction(
            prediction.clone(),
            issued_at,
        )]);
        let with_rejection = replay_projection_analytics(vec![
            LedgerRecord::prediction(prediction, issued_at),
            LedgerRecord::RepairProposal { proposal },
            LedgerRecord::RepairResolution { resolution },
        ]);

        assert_eq!(
            baseline.projection_state,
            with_rejection.projection_state
        );
        assert_eq!(baseline.analytics.correction_attribution.len(), 0);
        assert_eq!(
            with_rejection.analytics.correction_attribution.len(),
            0
        );
    }

    #[test]
    fn replay_is_byte_deterministic() {
        let issued_at = must_utc("2026-03-01T09:00:00Z");
        let bound_at = must_utc("2026-03-01T09:05:00Z");
        let prediction = fixture_prediction("pred:1", "turn:1");
        let bound = must_ok(bind_prediction_outcome(&prediction, 1.0, bound_at));
        let log = vec![
            LedgerRecord::prediction(prediction, issued_at),
            LedgerRecord::prediction(bound.corrected, bound_at),
            LedgerRecord::AskOutboxRequest {
                request_id: "ask:1".to_string(),
                scope: "weather".to_string(),
                title: "stale weather".to_string(),
                question: "what is the weather now?".to_string(),
                recorded_at: bound_at,
            },
        ];

        let first = replay_projection_analytics(log.clone());
        let second = replay_projection_analytics(log);

        let first_bytes = must_ok(serde_json::to_vec(&first));
        let second_bytes = must_ok(serde_json::to_vec(&second));
        assert_eq!(first_bytes, second_bytes);
    }

    #[test]
    fn analytics_bill_corrections_to_chain_root() {
        let issued_at = must_utc("2026-03-01T09:00:00Z");
        let prediction = fixture_prediction("pred:1", "turn:1");
        let first = must_ok(bind_prediction_outcome(
            &prediction,
            1.0,
            must_utc("2026-03-01T09:05:00Z"),
        ));
        let second = must_ok(bind_prediction_outcome(
            &first.corrected,
            0.5,
            must_utc("2026-03-01T09:10:00Z"),
        ));

        let summary = replay_projection_analytics(vec![
            LedgerRecord::prediction(prediction, issued_at),
            LedgerRecord::prediction(first.corrected, must_utc("2026-03-01T09:05:00Z")),
            LedgerRecord::prediction(second.corrected, must_utc("2026-03-01T09:10:00Z")),
        ]);

        let attribution = match summary.analytics.correction_attribution.get("pred:1") {
            Some(value) => value,
            None => panic!("missing attribution for chain root"),
        };
        assert_eq!(attribution.corrections, 2);
        assert!((attribution.total_absolute_error - 0.5).abs() < 1e-9);
    }

    #[test]
    fn ask_request_linkage_tracks_outstanding_and_answered() {
        let at = must_utc("2026-03-01T09:00:00Z");
        let summary = replay_projection_analytics(vec![
            LedgerRecord::AskOutboxRequest {
                request_id: "ask:1".to_string(),
                scope: "weather".to_string(),
                title: "stale weather".to_string(),
                question: "current weather?".to_string(),
                recorded_at: at,
            },
            LedgerRecord::AskOutboxRequest {
                request_id: "ask:2".to_string(),
                scope: "location".to_string(),
                title: "missing location".to_string(),
                question: "where are you?".to_string(),
                recorded_at: at,
            },
            LedgerRecord::AskOutboxResponse {
                request_id: "ask:1".to_string(),
                status: "created".to_string(),
                recorded_at: at,
            },
        ]);

        assert_eq!(summary.analytics.answered_ask_requests, 1);
        assert_eq!(summary.analytics.outstanding_ask_requests.len(), 1);
        assert!(summary
            .analytics
            .outstanding_ask_requests
            .contains_key("ask:2"));
        assert_eq!(summary.records_processed, 3);
    }
}

#![forbid(unsafe_code)]

//! Turn orchestration for the prediction ledger: the mission loop that
//! sequences gates, appends, outcome reconciliation, and the four
//! human-intervention phases of one conversational turn, plus the
//! observation-freshness evaluator and the adapter seams it relies on.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use prediction_ledger_core::{
    bind_prediction_outcome, evaluate_turn_gates, AppendReceipt, CheckContext, GateEvaluation,
    InvariantRegistry, LedgerStore, OutcomeBindingRequest, WriteReceipt,
};
use prediction_ledger_domain::{
    ensure_non_empty, hash_bytes, hash_json, now_utc, CapabilityAdapterGate, DateTimeUtc,
    DecisionEffect, Episode, EpisodeArtifact, EvidenceItem, GateStage, HaltRecord,
    InterventionAction, InterventionDecision, LedgerRecord, LineageRef, Observation,
    ObservationFreshnessPolicyContract, ObservationKind, ObserverFrame, PredictionRecord,
    ProjectionState, RepairDecision, RepairProposal, RepairResolution, Retryability,
};
use prediction_ledger_store_ndjson::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use ulid::Ulid;

pub const ACTION_APPEND_RECORD: &str = "ledger.append_record";
pub const ACTION_DISPATCH_ASK: &str = "outbox.dispatch_request";
pub const POLICY_CODE_DISPATCH_DENIED: &str = "capability.dispatch_denied";

/// Sealed result type for the external schema/ambiguity classifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaSelection {
    pub schemas: Vec<String>,
    pub ambiguities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UtteranceClass {
    pub label: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InterventionPhase {
    Start,
    PostPreDecisionGate,
    PostObservationGate,
    PostPreOutputGate,
}

impl InterventionPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::PostPreDecisionGate => "post_pre_decision_gate",
            Self::PostObservationGate => "post_observation_gate",
            Self::PostPreOutputGate => "post_pre_output_gate",
        }
    }
}

/// Result of one observation-freshness evaluation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FreshnessSignal {
    Continue,
    Hold { request_id: String },
    AskRequest { request_id: String },
}

pub trait SchemaSelector {
    #[allow(clippy::missing_errors_doc)]
    fn select(&self, text: &str, capture_error: bool) -> Result<SchemaSelection>;
}

pub trait UtteranceClassifier {
    #[allow(clippy::missing_errors_doc)]
    fn classify(&self, text: &str) -> Result<UtteranceClass>;
}

pub trait AskOutboxAdapter {
    #[allow(clippy::missing_errors_doc)]
    fn create_request(&mut self, title: &str, question: &str, context: &Value) -> Result<String>;
}

pub trait FreshnessPolicyAdapter {
    #[allow(clippy::missing_errors_doc)]
    fn contract_for(
        &self,
        episode: &Episode,
        projection: &ProjectionState,
    ) -> Result<Option<ObservationFreshnessPolicyContract>>;

    #[allow(clippy::missing_errors_doc)]
    fn outstanding_request(&self, scope: &str) -> Result<Option<String>>;
}

/// Raw intervention hook. The loop normalizes whatever it returns into an
/// [`InterventionDecision`]; malformed payloads are typed errors.
pub trait InterventionHook {
    #[allow(clippy::missing_errors_doc)]
    fn intervene(&mut self, phase: InterventionPhase, episode: &Episode) -> Result<Value>;
}

pub trait RepairArbiter {
    #[allow(clippy::missing_errors_doc)]
    fn decide(&self, proposal: &RepairProposal) -> Result<RepairDecision>;
}

/// Supplies the explicit permission token for each side-effecting action.
pub trait CapabilityAdapter {
    fn gate_for(&mut self, action: &str) -> CapabilityAdapterGate;
}

#[derive(Debug, Clone, Default)]
pub struct AllowAllCapabilityAdapter;

impl CapabilityAdapter for AllowAllCapabilityAdapter {
    fn gate_for(&mut self, _action: &str) -> CapabilityAdapterGate {
        CapabilityAdapterGate::allow(Ulid::new())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcceptAllArbiter;

impl RepairArbiter for AcceptAllArbiter {
    fn decide(&self, _proposal: &RepairProposal) -> Result<RepairDecision> {
        Ok(RepairDecision::Accepted)
    }
}

/// Fixed-output selector for hosts and tests without a live classifier.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaSelector {
    pub selection: SchemaSelection,
}

impl SchemaSelector for StaticSchemaSelector {
    fn select(&self, _text: &str, _capture_error: bool) -> Result<SchemaSelection> {
        Ok(self.selection.clone())
    }
}

#[derive(Debug, Clone)]
pub struct StaticUtteranceClassifier {
    pub label: String,
}

impl UtteranceClassifier for StaticUtteranceClassifier {
    fn classify(&self, _text: &str) -> Result<UtteranceClass> {
        Ok(UtteranceClass {
            label: self.label.clone(),
            confidence: None,
        })
    }
}

/// Policy adapter that never demands a freshness check.
#[derive(Debug, Clone, Default)]
pub struct NoFreshnessPolicy;

impl FreshnessPolicyAdapter for NoFreshnessPolicy {
    fn contract_for(
        &self,
        _episode: &Episode,
        _projection: &ProjectionState,
    ) -> Result<Option<ObservationFreshnessPolicyContract>> {
        Ok(None)
    }

    fn outstanding_request(&self, _scope: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Rejects any dynamic classifier payload that does not conform to the
/// sealed [`SchemaSelection`] shape. No silent coercion.
///
/// # Errors
/// Returns a typed error when the value is not an object of string arrays.
pub fn normalize_schema_selection(value: &Value) -> Result<SchemaSelection> {
    let object = value
        .as_object()
        .ok_or_else(|| anyhow!("schema selection MUST be an object, got {value}"))?;
    let schemas = string_array(object.get("schemas"), "schemas")?;
    let ambiguities = string_array(object.get("ambiguities"), "ambiguities")?;
    Ok(SchemaSelection {
        schemas,
        ambiguities,
    })
}

fn string_array(raw: Option<&Value>, field: &str) -> Result<Vec<String>> {
    let Some(value) = raw else {
        return Ok(Vec::new());
    };
    let array = value
        .as_array()
        .ok_or_else(|| anyhow!("{field} MUST be an array of strings"))?;
    array
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("{field} entries MUST be strings"))
        })
        .collect()
}

/// Normalizes a raw hook return value into an [`InterventionDecision`].
/// Accepts `null` (no intervention), a bare action string, or an object with
/// `action`/`reason`/`metadata`/`override_source`/`override_provenance`.
///
/// # Errors
/// Returns a typed error for unknown actions or non-conforming payloads —
/// never a silent downgrade.
pub fn normalize_intervention(value: &Value) -> Result<InterventionDecision> {
    match value {
        Value::Null => Ok(InterventionDecision {
            action: InterventionAction::None,
            reason: "no intervention".to_string(),
            metadata: Value::Null,
            override_source: None,
            override_provenance: None,
        }),
        Value::String(action) => {
            let action = InterventionAction::parse(action)
                .ok_or_else(|| anyhow!("unknown intervention action '{action}'"))?;
            Ok(InterventionDecision {
                action,
                reason: "hook action".to_string(),
                metadata: Value::Null,
                override_source: None,
                override_provenance: None,
            })
        }
        Value::Object(object) => {
            let action_text = object
                .get("action")
                .map_or("none", |raw| raw.as_str().unwrap_or(""));
            let action = InterventionAction::parse(action_text)
                .ok_or_else(|| anyhow!("unknown intervention action '{action_text}'"))?;
            Ok(InterventionDecision {
                action,
                reason: object
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("hook action")
                    .to_string(),
                metadata: object.get("metadata").cloned().unwrap_or(Value::Null),
                override_source: object
                    .get("override_source")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                override_provenance: object
                    .get("override_provenance")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        }
        other => Err(anyhow!(
            "intervention hook returned a non-conforming value: {other}"
        )),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMode {
    Direct,
    RepairEvents,
}

impl Default for CorrectionMode {
    fn default() -> Self {
        Self::Direct
    }
}

fn default_stale_after_seconds() -> u64 {
    900
}

fn default_observer_role() -> String {
    "dialog_agent".to_string()
}

/// Mission-level configuration, loaded from YAML and normalized the same way
/// the ledger normalizes everything else: validate, canonicalize, hash.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MissionConfig {
    pub mission_name: String,
    #[serde(default)]
    pub correction_mode: CorrectionMode,
    #[serde(default = "default_stale_after_seconds")]
    pub default_stale_after_seconds: u64,
    #[serde(default = "default_observer_role")]
    pub observer_role: String,
    #[serde(default)]
    pub non_interactive: bool,
}

impl MissionConfig {
    #[must_use]
    pub fn default_v1() -> Self {
        Self {
            mission_name: "prediction_ledger.mission".to_string(),
            correction_mode: CorrectionMode::Direct,
            default_stale_after_seconds: default_stale_after_seconds(),
            observer_role: default_observer_role(),
            non_interactive: false,
        }
    }

    /// # Errors
    /// Returns an error when names are empty or the staleness threshold is
    /// zero.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty("mission_name", &self.mission_name)?;
        ensure_non_empty("observer_role", &self.observer_role)?;
        if self.default_stale_after_seconds == 0 {
            bail!("default_stale_after_seconds MUST be >= 1");
        }
        Ok(())
    }

    /// Per-episode observer frame; there is no process-wide default.
    #[must_use]
    pub fn observer_frame(&self) -> ObserverFrame {
        let mut frame = ObserverFrame::turn_default();
        frame.role = self.observer_role.clone();
        frame
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissionConfigEnvelope {
    pub source_format: String,
    pub source_yaml_hash: String,
    pub normalized_hash: String,
    pub config: MissionConfig,
    pub normalized_json: Value,
}

/// Load mission config YAML from disk and normalize it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_mission_config_from_path(path: &Path) -> Result<MissionConfigEnvelope> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read mission config at {}", path.display()))?;
    normalize_mission_config_yaml(&content)
}

/// Normalize mission config YAML into canonical JSON + hashes.
///
/// # Errors
/// Returns an error when YAML parsing, validation, or serialization fails.
pub fn normalize_mission_config_yaml(yaml: &str) -> Result<MissionConfigEnvelope> {
    let source_yaml_hash = hash_bytes(yaml.as_bytes());
    let mut config: MissionConfig = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid mission config YAML structure: {err}"))?;

    config.validate()?;
    config.mission_name = config.mission_name.trim().to_string();
    config.observer_role = config.observer_role.trim().to_string();
    config.validate()?;

    let normalized_json = serde_json::to_value(&config)?;
    let normalized_hash = hash_json(&normalized_json)?;

    Ok(MissionConfigEnvelope {
        source_format: "yaml".to_string(),
        source_yaml_hash,
        normalized_hash,
        config,
        normalized_json,
    })
}

/// An observed value addressed at one scope key's outstanding prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedOutcome {
    pub scope_key: String,
    pub observed_value: f64,
}

/// Caller-supplied inputs for one turn.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub ask: String,
    pub observer: Option<ObserverFrame>,
    pub forward_prediction: PredictionRecord,
    pub pending_predictions: Vec<PredictionRecord>,
    pub observation: Observation,
    pub decision_scope_key: Option<String>,
    pub observed_outcomes: Vec<ObservedOutcome>,
    pub prior_effects: Vec<DecisionEffect>,
    pub now: Option<DateTimeUtc>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TurnStatus {
    Completed,
    Halted,
    Paused,
    TimedOut,
    Escalated,
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub status: TurnStatus,
    pub episode: Episode,
    pub halts: Vec<HaltRecord>,
    pub freshness: Option<FreshnessSignal>,
    pub schema_selection: Option<SchemaSelection>,
    pub utterance_class: Option<UtteranceClass>,
    pub corrected_scopes: Vec<String>,
}

enum HookFlow {
    Continue,
    Abort(TurnStatus),
}

/// Orchestrates one conversational turn across the gate evaluator, the
/// append-only ledger, the correction binder, and the intervention hook.
pub struct MissionLoop<'a> {
    store: &'a mut dyn LedgerStore,
    capabilities: &'a mut dyn CapabilityAdapter,
    selector: &'a dyn SchemaSelector,
    classifier: &'a dyn UtteranceClassifier,
    outbox: &'a mut dyn AskOutboxAdapter,
    freshness: &'a dyn FreshnessPolicyAdapter,
    arbiter: &'a dyn RepairArbiter,
    hook: Option<&'a mut dyn InterventionHook>,
    config: MissionConfig,
    registry: InvariantRegistry,
    projection: ProjectionState,
}

impl<'a> MissionLoop<'a> {
    /// Builds a loop whose live projection is seeded by replaying the store,
    /// so a restarted process continues from exactly the state the log
    /// proves.
    ///
    /// # Errors
    /// Returns an error when the seed replay fails or the config is invalid.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a mut dyn LedgerStore,
        capabilities: &'a mut dyn CapabilityAdapter,
        selector: &'a dyn SchemaSelector,
        classifier: &'a dyn UtteranceClassifier,
        outbox: &'a mut dyn AskOutboxAdapter,
        freshness: &'a dyn FreshnessPolicyAdapter,
        arbiter: &'a dyn RepairArbiter,
        hook: Option<&'a mut dyn InterventionHook>,
        config: MissionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let projection = store.replay()?.projection_state;
        Ok(Self {
            store,
            capabilities,
            selector,
            classifier,
            outbox,
            freshness,
            arbiter,
            hook,
            config,
            registry: InvariantRegistry::standard(),
            projection,
        })
    }

    #[must_use]
    pub fn projection(&self) -> &ProjectionState {
        &self.projection
    }

    /// Runs one turn in the fixed order: forward prediction → pending
    /// predictions (each individually gated) → pre-decision gate →
    /// observation ingest (+ freshness policy) → outcome reconciliation →
    /// schema interpretation → utterance classification. The intervention
    /// hook fires at `start`, `post_pre_decision_gate`,
    /// `post_observation_gate`, and `post_pre_output_gate`.
    ///
    /// # Errors
    /// Programmer/policy errors — resume without provenance, malformed hook
    /// or selector payloads, capability denials — are raised. Halts are not
    /// errors; they end the turn with [`TurnStatus::Halted`].
    #[allow(clippy::too_many_lines)]
    pub fn run_turn(&mut self, input: TurnInput) -> Result<TurnReport> {
        let now = input.now.unwrap_or_else(now_utc);
        let observer = input
            .observer
            .clone()
            .unwrap_or_else(|| self.config.observer_frame());
        let mut episode = Episode::new(&input.ask, observer.clone(), now)?;
        for effect in input.prior_effects {
            episode.link_effect(effect);
        }
        tracing::info!(episode_id = %episode.episode_id, ask = %episode.ask, "turn started");

        let mut freshness_signal = None;
        let mut schema_selection = None;
        let mut utterance_class = None;
        let mut corrected_scopes = Vec::new();

        if let HookFlow::Abort(status) =
            self.run_hook_phase(&mut episode, InterventionPhase::Start, now)?
        {
            return Ok(aborted_report(episode, status));
        }

        // The turn's own forward statement, then any caller-supplied pending
        // predictions, each individually invariant-gated.
        if let Some(halt) = self.append_prediction_gated(
            &mut episode,
            &observer,
            input.forward_prediction.clone(),
            now,
        )? {
            return Ok(finish_halted(episode, halt, now));
        }
        for pending in &input.pending_predictions {
            if let Some(halt) =
                self.append_prediction_gated(&mut episode, &observer, pending.clone(), now)?
            {
                return Ok(finish_halted(episode, halt, now));
            }
        }

        // Pre-decision gate: the state this turn's decision consumes must be
        // projected before the agent may act on it.
        let evaluation = {
            let ctx = CheckContext {
                projection: Some(&self.projection),
                scope_key: input.decision_scope_key.as_deref(),
                ..CheckContext::default()
            };
            evaluate_turn_gates(&self.registry, &observer, &ctx, None, now)?
        };
        if let GateEvaluation::Halted { halt, .. } = evaluation {
            self.persist_halt(&mut episode, &halt)?;
            return Ok(finish_halted(episode, halt, now));
        }

        if let HookFlow::Abort(status) =
            self.run_hook_phase(&mut episode, InterventionPhase::PostPreDecisionGate, now)?
        {
            return Ok(aborted_report(episode, status));
        }

        episode.record_observation(input.observation.clone());
        if let Some(contract) = self.freshness.contract_for(&episode, &self.projection)? {
            let signal = self.evaluate_observation_freshness(&mut episode, &contract, now)?;
            freshness_signal = Some(signal);
        }

        if let HookFlow::Abort(status) =
            self.run_hook_phase(&mut episode, InterventionPhase::PostObservationGate, now)?
        {
            let mut report = aborted_report(episode, status);
            report.freshness = freshness_signal;
            return Ok(report);
        }

        // Reconcile every outstanding prediction this turn addresses.
        for outcome in &input.observed_outcomes {
            match self.reconcile_outcome(&mut episode, &observer, outcome, now)? {
                Some(halt) => {
                    let mut report = finish_halted(episode, halt, now);
                    report.freshness = freshness_signal;
                    report.corrected_scopes = corrected_scopes;
                    return Ok(report);
                }
                None => corrected_scopes.push(outcome.scope_key.clone()),
            }
        }

        // Delegated interpretation steps run only over actual utterances.
        if input.observation.kind == ObservationKind::Utterance {
            if let Some(text) = &input.observation.text {
                let selection = self
                    .selector
                    .select(text, false)
                    .context("schema selector failed")?;
                episode.append_artifact(EpisodeArtifact::SchemaInterpretation {
                    schemas: selection.schemas.clone(),
                    ambiguities: selection.ambiguities.clone(),
                });
                schema_selection = Some(selection);

                let class = self
                    .classifier
                    .classify(text)
                    .context("utterance classifier failed")?;
                episode.append_artifact(EpisodeArtifact::UtteranceClassification {
                    label: class.label.clone(),
                    confidence: class.confidence,
                });
                utterance_class = Some(class);
            }
        }

        if let HookFlow::Abort(status) =
            self.run_hook_phase(&mut episode, InterventionPhase::PostPreOutputGate, now)?
        {
            let mut report = aborted_report(episode, status);
            report.freshness = freshness_signal;
            report.schema_selection = schema_selection;
            report.utterance_class = utterance_class;
            report.corrected_scopes = corrected_scopes;
            return Ok(report);
        }

        episode.append_artifact(EpisodeArtifact::TurnSummary {
            action: "completed".to_string(),
            reason: "turn completed".to_string(),
            phase: None,
            recorded_at: now,
        });
        tracing::info!(episode_id = %episode.episode_id, "turn completed");
        Ok(TurnReport {
            status: TurnStatus::Completed,
            episode,
            halts: Vec::new(),
            freshness: freshness_signal,
            schema_selection,
            utterance_class,
            corrected_scopes,
        })
    }

    /// Freshness policy check: stale or missing observations recruit a human
    /// through the Ask-Outbox; an already outstanding request holds instead
    /// of re-issuing.
    ///
    /// # Errors
    /// Raises on capability denial of the dispatch or on adapter failure.
    pub fn evaluate_observation_freshness(
        &mut self,
        episode: &mut Episode,
        contract: &ObservationFreshnessPolicyContract,
        now: DateTimeUtc,
    ) -> Result<FreshnessSignal> {
        if let Some(existing) = self.freshness.outstanding_request(&contract.scope)? {
            episode.append_artifact(EpisodeArtifact::FreshnessCheck {
                scope: contract.scope.clone(),
                signal: "hold".to_string(),
                reason: "outstanding request for this scope".to_string(),
                last_observed_at: contract.observed_at,
                stale_after_seconds: contract.stale_after_seconds,
            });
            return Ok(FreshnessSignal::Hold {
                request_id: existing,
            });
        }

        let last_observed_at = episode
            .latest_observation_for_scope(&contract.scope)
            .map(|observation| observation.observed_at)
            .or(contract.observed_at);

        #[allow(clippy::cast_possible_wrap)]
        let stale = last_observed_at.map_or(true, |at| {
            (now - at).whole_seconds() > contract.stale_after_seconds as i64
        });

        if !stale {
            episode.append_artifact(EpisodeArtifact::FreshnessCheck {
                scope: contract.scope.clone(),
                signal: "continue".to_string(),
                reason: "observation within freshness threshold".to_string(),
                last_observed_at,
                stale_after_seconds: contract.stale_after_seconds,
            });
            return Ok(FreshnessSignal::Continue);
        }

        let reason = match last_observed_at {
            None => format!("no observation exists for scope '{}'", contract.scope),
            Some(_) => format!(
                "latest observation for scope '{}' is older than {}s",
                contract.scope, contract.stale_after_seconds
            ),
        };
        let title = format!("stale observation: {}", contract.scope);
        let question = format!(
            "please provide a current value for '{}' ({reason})",
            contract.scope
        );
        let request_id = self.dispatch_ask_request(
            episode,
            &contract.scope,
            &title,
            &question,
            "ask_request",
            &json!({
                "scope": contract.scope,
                "reason": reason,
                "last_observed_at": last_observed_at.map(prediction_ledger_domain::format_rfc3339).transpose()?,
                "stale_after_seconds": contract.stale_after_seconds,
            }),
            now,
        )?;
        episode.append_artifact(EpisodeArtifact::FreshnessCheck {
            scope: contract.scope.clone(),
            signal: "ask_request".to_string(),
            reason,
            last_observed_at,
            stale_after_seconds: contract.stale_after_seconds,
        });
        Ok(FreshnessSignal::AskRequest { request_id })
    }

    fn run_hook_phase(
        &mut self,
        episode: &mut Episode,
        phase: InterventionPhase,
        now: DateTimeUtc,
    ) -> Result<HookFlow> {
        let raw = match self.hook.as_mut() {
            None => return Ok(HookFlow::Continue),
            Some(hook) => hook.intervene(phase, episode)?,
        };
        let decision = normalize_intervention(&raw)?;
        // Resume without provenance is a programmer/policy error, raised
        // synchronously — the loop never silently continues past a human
        // checkpoint.
        decision.validate()?;

        match decision.action {
            InterventionAction::None => Ok(HookFlow::Continue),
            InterventionAction::Pause | InterventionAction::Timeout => {
                let status = if decision.action == InterventionAction::Pause {
                    TurnStatus::Paused
                } else {
                    TurnStatus::TimedOut
                };
                self.note_intervention(episode, phase, &decision);
                episode.append_artifact(EpisodeArtifact::TurnSummary {
                    action: decision.action.as_str().to_string(),
                    reason: decision.reason.clone(),
                    phase: Some(phase.as_str().to_string()),
                    recorded_at: now,
                });
                tracing::warn!(
                    phase = phase.as_str(),
                    action = decision.action.as_str(),
                    "turn aborted by intervention"
                );
                Ok(HookFlow::Abort(status))
            }
            InterventionAction::Escalate => {
                self.note_intervention(episode, phase, &decision);
                let title = format!("escalation: {}", episode.ask);
                let context = json!({
                    "episode_id": episode.episode_id.to_string(),
                    "phase": phase.as_str(),
                    "metadata": decision.metadata,
                });
                self.dispatch_ask_request(
                    episode,
                    "escalation",
                    &title,
                    &decision.reason,
                    "escalate",
                    &context,
                    now,
                )?;
                episode.append_artifact(EpisodeArtifact::TurnSummary {
                    action: "escalate".to_string(),
                    reason: decision.reason.clone(),
                    phase: Some(phase.as_str().to_string()),
                    recorded_at: now,
                });
                tracing::warn!(phase = phase.as_str(), "turn escalated to human");
                Ok(HookFlow::Abort(TurnStatus::Escalated))
            }
            InterventionAction::Resume => {
                self.note_intervention(episode, phase, &decision);
                episode.append_artifact(EpisodeArtifact::TurnSummary {
                    action: "resume".to_string(),
                    reason: decision.reason.clone(),
                    phase: Some(phase.as_str().to_string()),
                    recorded_at: now,
                });
                Ok(HookFlow::Continue)
            }
        }
    }

    fn note_intervention(
        &self,
        episode: &mut Episode,
        phase: InterventionPhase,
        decision: &InterventionDecision,
    ) {
        episode.append_artifact(EpisodeArtifact::InterventionNote {
            phase: phase.as_str().to_string(),
            action: decision.action.as_str().to_string(),
            reason: decision.reason.clone(),
        });
    }

    /// Appends one prediction under a capability gate, projects it, and runs
    /// the pre-consume → post-write gate pair over the result. Returns the
    /// halt when the attempt must stop; capability denials are persisted as
    /// halts and then raised.
    fn append_prediction_gated(
        &mut self,
        episode: &mut Episode,
        observer: &ObserverFrame,
        prediction: PredictionRecord,
        now: DateTimeUtc,
    ) -> Result<Option<HaltRecord>> {
        let scope_key = prediction.scope_key.clone();
        let record = LedgerRecord::prediction(prediction, now);
        let receipt = self.append_record_gated(episode, &record)?;
        self.gate_after_write(episode, observer, &scope_key, &receipt, now)
    }

    fn append_record_gated(
        &mut self,
        episode: &mut Episode,
        record: &LedgerRecord,
    ) -> Result<AppendReceipt> {
        let gate = self.capabilities.gate_for(ACTION_APPEND_RECORD);
        match self.store.append_record(&gate, record) {
            Ok(receipt) => {
                prediction_ledger_core::project_current(&mut self.projection, record);
                Ok(receipt)
            }
            Err(err) => {
                if let Some(StoreError::PolicyDenied { halt, .. }) =
                    err.downcast_ref::<StoreError>()
                {
                    let halt = halt.as_ref().clone();
                    self.persist_halt(episode, &halt)?;
                }
                Err(err)
            }
        }
    }

    fn gate_after_write(
        &mut self,
        episode: &mut Episode,
        observer: &ObserverFrame,
        scope_key: &str,
        receipt: &AppendReceipt,
        now: DateTimeUtc,
    ) -> Result<Option<HaltRecord>> {
        let evaluation = {
            let write = WriteReceipt {
                scope_key: scope_key.to_string(),
                evidence_reference: Some(receipt.evidence_reference.clone()),
            };
            let pre_ctx = CheckContext {
                projection: Some(&self.projection),
                ..CheckContext::default()
            };
            let post_ctx = CheckContext {
                projection: Some(&self.projection),
                write: Some(&write),
                ..CheckContext::default()
            };
            evaluate_turn_gates(&self.registry, observer, &pre_ctx, Some(&post_ctx), now)?
        };
        match evaluation {
            GateEvaluation::Success { .. } => Ok(None),
            GateEvaluation::Halted { halt, .. } => {
                self.persist_halt(episode, &halt)?;
                Ok(Some(halt))
            }
        }
    }

    fn reconcile_outcome(
        &mut self,
        episode: &mut Episode,
        observer: &ObserverFrame,
        outcome: &ObservedOutcome,
        now: DateTimeUtc,
    ) -> Result<Option<HaltRecord>> {
        let current = self
            .projection
            .current_predictions
            .get(&outcome.scope_key)
            .cloned();

        let evaluation = {
            let binding = OutcomeBindingRequest {
                prediction_id: current
                    .as_ref()
                    .map(|prediction| prediction.prediction_id.clone())
                    .unwrap_or_default(),
                scope_key: outcome.scope_key.clone(),
                observed_value: outcome.observed_value,
            };
            let ctx = CheckContext {
                projection: Some(&self.projection),
                scope_key: Some(&outcome.scope_key),
                outcome: Some(&binding),
                ..CheckContext::default()
            };
            evaluate_turn_gates(&self.registry, observer, &ctx, None, now)?
        };
        if let GateEvaluation::Halted { halt, .. } = evaluation {
            self.persist_halt(episode, &halt)?;
            return Ok(Some(halt));
        }

        let Some(current) = current else {
            bail!("consume gate passed without a current prediction for '{}'", outcome.scope_key);
        };
        let bound = bind_prediction_outcome(&current, outcome.observed_value, now)?;
        episode.append_artifact(EpisodeArtifact::PredictionOutcome {
            outcome: bound.outcome.clone(),
        });

        match self.config.correction_mode {
            CorrectionMode::Direct => {
                self.append_prediction_gated(episode, observer, bound.corrected, now)
            }
            CorrectionMode::RepairEvents => {
                let lineage = LineageRef {
                    scope_key: current.scope_key.clone(),
                    prediction_id: current.prediction_id.clone(),
                    correction_root_prediction_id: current.correction_root().to_string(),
                };
                let proposal = RepairProposal::new(
                    lineage.clone(),
                    bound.corrected.clone(),
                    bound.outcome,
                    now,
                )?;
                let decision = self.arbiter.decide(&proposal)?;
                let resolution = RepairResolution::new(
                    proposal.repair_id(),
                    lineage,
                    decision,
                    match decision {
                        RepairDecision::Accepted => Some(bound.corrected),
                        RepairDecision::Rejected => None,
                    },
                    now,
                )?;

                self.append_record_gated(episode, &LedgerRecord::RepairProposal { proposal })?;
                let receipt = self
                    .append_record_gated(episode, &LedgerRecord::RepairResolution { resolution })?;
                self.gate_after_write(episode, observer, &current.scope_key, &receipt, now)
            }
        }
    }

    /// Logs the `ask_outbox_request`, dispatches through the adapter, then
    /// logs the paired `ask_outbox_response` — in that order, regardless of
    /// the eventual status.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_ask_request(
        &mut self,
        episode: &mut Episode,
        scope: &str,
        title: &str,
        question: &str,
        status: &str,
        context: &Value,
        now: DateTimeUtc,
    ) -> Result<String> {
        let dispatch_gate = self.capabilities.gate_for(ACTION_DISPATCH_ASK);
        if !dispatch_gate.allowed() {
            let invocation_id = dispatch_gate.invocation_id().to_string();
            let halt = HaltRecord::new(
                GateStage::CapabilityGate,
                prediction_ledger_store_ndjson::CAPABILITY_GATE_INVARIANT,
                "dispatch_denied",
                &format!(
                    "capability gate denied ask-outbox dispatch for invocation {invocation_id}"
                ),
                vec![
                    EvidenceItem::new("invocation_id", &invocation_id),
                    EvidenceItem::new("policy_code", POLICY_CODE_DISPATCH_DENIED),
                ],
                Retryability::Terminal,
                now,
            )?;
            self.persist_halt(episode, &halt)?;
            bail!("capability gate denied ask-outbox dispatch ({POLICY_CODE_DISPATCH_DENIED})");
        }

        let request_id = format!("ask:{}", Ulid::new());
        self.append_record_gated(
            episode,
            &LedgerRecord::AskOutboxRequest {
                request_id: request_id.clone(),
                scope: scope.to_string(),
                title: title.to_string(),
                question: question.to_string(),
                recorded_at: now,
            },
        )?;
        episode.append_artifact(EpisodeArtifact::AskOutboxRequest {
            request_id: request_id.clone(),
            scope: scope.to_string(),
            title: title.to_string(),
            question: question.to_string(),
        });

        self.outbox
            .create_request(title, question, context)
            .context("ask-outbox adapter failed")?;

        self.append_record_gated(
            episode,
            &LedgerRecord::AskOutboxResponse {
                request_id: request_id.clone(),
                status: status.to_string(),
                recorded_at: now,
            },
        )?;
        episode.append_artifact(EpisodeArtifact::AskOutboxResponse {
            request_id: request_id.clone(),
            status: status.to_string(),
        });

        Ok(request_id)
    }

    /// Halts go to the halt log under a system audit gate; the prediction
    /// log never sees anything for the halted attempt.
    fn persist_halt(&mut self, episode: &mut Episode, halt: &HaltRecord) -> Result<()> {
        let audit_gate = CapabilityAdapterGate::allow(Ulid::new());
        self.store.append_halt(&audit_gate, halt)?;
        episode.append_artifact(EpisodeArtifact::HaltObservation {
            halt_id: halt.halt_id().to_string(),
            stage: halt.stage(),
            invariant_id: halt.invariant_id().to_string(),
            reason: halt.reason().to_string(),
        });
        tracing::warn!(
            halt_id = halt.halt_id(),
            invariant_id = halt.invariant_id(),
            stage = halt.stage().as_str(),
            "turn halted"
        );
        Ok(())
    }
}

fn aborted_report(episode: Episode, status: TurnStatus) -> TurnReport {
    TurnReport {
        status,
        episode,
        halts: Vec::new(),
        freshness: None,
        schema_selection: None,
        utterance_class: None,
        corrected_scopes: Vec::new(),
    }
}

fn finish_halted(mut episode: Episode, halt: HaltRecord, now: DateTimeUtc) -> TurnReport {
    episode.append_artifact(EpisodeArtifact::TurnSummary {
        action: "halted".to_string(),
        reason: format!("halted by {}", halt.invariant_id()),
        phase: None,
        recorded_at: now,
    });
    TurnReport {
        status: TurnStatus::Halted,
        episode,
        halts: vec![halt],
        freshness: None,
        schema_selection: None,
        utterance_class: None,
        corrected_scopes: Vec::new(),
    }
}

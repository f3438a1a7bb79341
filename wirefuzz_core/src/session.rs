//! Stateful fuzzing sessions.
//!
//! A [`SessionEngine`] owns one transport connection and drives one
//! [`Session`] through the protocol's state model: pick a transition, build
//! and encode the request, exchange it with the target, judge the response,
//! and advance. All mutable session state stays inside the engine.

use crate::codec::{BehaviorCounters, decode, encode};
use crate::config::{AnomalyPolicy, OracleErrorPolicy, WirefuzzConfig};
use crate::corpus::{Corpus, InMemoryCorpus};
use crate::feedback::{Feedback, UniqueResponseFeedback};
use crate::message::{FieldValue, MessageInstance};
use crate::mutator::{FieldSelection, MutationEngine};
use crate::oracle::{AcceptAllOracle, Finding, FindingKind, ResponseOracle, TransitionRef};
use crate::resolver::CommandResolver;
use crate::scheduler::{SelectionPolicy, TransitionScheduler, scheduler_for};
use crate::schema::{ProtocolDescriptor, StateModel, Transition};
use crate::seed::generate_seeds;
use crate::transform::apply_response_handlers;
use crate::transport::{Transport, TransportError};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on fields touched by one content mutation.
const MAX_FIELDS_PER_MUTATION: usize = 3;

/// Per-session knobs, usually derived from [`WirefuzzConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub session_id: usize,
    pub rng_seed: u64,
    pub max_iterations: u64,
    pub timeout: Duration,
    pub max_retries: u32,
    pub mutation_rate: f64,
    pub corrupt_size_rate: f64,
    pub selection: SelectionPolicy,
    pub on_oracle_error: OracleErrorPolicy,
    pub on_decode_error: AnomalyPolicy,
    pub on_violation: AnomalyPolicy,
}

impl SessionOptions {
    pub fn from_config(config: &WirefuzzConfig, session_id: usize) -> Self {
        Self {
            session_id,
            rng_seed: config.fuzzer.rng_seed.wrapping_add(session_id as u64),
            max_iterations: config.fuzzer.max_iterations,
            timeout: config.session.timeout(),
            max_retries: config.session.max_retries,
            mutation_rate: config.fuzzer.mutation_rate,
            corrupt_size_rate: config.fuzzer.corrupt_size_rate,
            selection: config.session.selection,
            on_oracle_error: config.session.on_oracle_error,
            on_decode_error: config.session.on_decode_error,
            on_violation: config.session.on_violation,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&WirefuzzConfig::default(), 0)
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum SessionEnd {
    /// Reached a state with no outgoing transitions.
    Terminal,
    /// Outgoing transitions exist but none could be selected.
    Deadlock,
    IterationLimit,
    Cancelled,
    /// A finding whose policy is `abort-session`.
    Aborted(FindingKind),
    /// A transition kept timing out.
    RetriesExhausted,
    TransportLost(String),
    /// The session task failed outside the engine (connect error, panic).
    Failed(String),
}

/// One request/response pair of the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub message_index: usize,
    pub transition: TransitionRef,
    pub request: Vec<u8>,
    /// `None` when no response arrived in time.
    pub response: Option<Vec<u8>>,
    pub advanced: bool,
}

/// Mutable context of one fuzzing run.
#[derive(Debug)]
pub struct Session {
    id: usize,
    descriptor: Arc<ProtocolDescriptor>,
    state_model: StateModel,
    current_state: String,
    counters: BehaviorCounters,
    transcript: Vec<Exchange>,
    last_response: Option<MessageInstance>,
    visited: BTreeSet<String>,
}

impl Session {
    pub fn new(id: usize, descriptor: Arc<ProtocolDescriptor>) -> Self {
        let state_model = descriptor
            .state_model()
            .cloned()
            .unwrap_or_else(StateModel::stateless);
        let current_state = state_model.initial_state.clone();
        Self {
            id,
            descriptor,
            visited: BTreeSet::from([current_state.clone()]),
            state_model,
            current_state,
            counters: BehaviorCounters::new(),
            transcript: Vec::new(),
            last_response: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn descriptor(&self) -> &Arc<ProtocolDescriptor> {
        &self.descriptor
    }

    pub fn state_model(&self) -> &StateModel {
        &self.state_model
    }

    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    pub fn counters(&self) -> &BehaviorCounters {
        &self.counters
    }

    pub fn transcript(&self) -> &[Exchange] {
        &self.transcript
    }

    pub fn last_response(&self) -> Option<&MessageInstance> {
        self.last_response.as_ref()
    }

    pub fn visited_states(&self) -> &BTreeSet<String> {
        &self.visited
    }

    /// Index the next outgoing message will carry.
    pub fn message_index(&self) -> usize {
        self.transcript.len()
    }

    /// Moves to `transition.to`. Refuses transitions that do not start at the
    /// current state.
    pub fn fire(&mut self, transition: &Transition) -> bool {
        if transition.from != self.current_state || !self.state_model.has_state(&transition.to) {
            return false;
        }
        self.current_state = transition.to.clone();
        self.visited.insert(self.current_state.clone());
        true
    }
}

/// Result of a single [`SessionEngine::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The transition fired and the session moved to `to`.
    Advanced { from: String, to: String },
    /// A response arrived or timed out but the state did not change.
    Stayed,
    /// No request went out (encode failure).
    Skipped,
    Ended(SessionEnd),
}

/// Summary of a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: usize,
    pub protocol: String,
    pub end: SessionEnd,
    pub final_state: String,
    pub iterations: u64,
    pub states_visited: BTreeSet<String>,
    pub findings: Vec<Finding>,
    pub transcript: Vec<Exchange>,
    pub corpus_size: usize,
}

impl SessionReport {
    /// Report for a session that never ran its state machine.
    pub fn failed(session_id: usize, protocol: &str, reason: String) -> Self {
        Self {
            session_id,
            protocol: protocol.to_string(),
            end: SessionEnd::Failed(reason),
            final_state: String::new(),
            iterations: 0,
            states_visited: BTreeSet::new(),
            findings: Vec::new(),
            transcript: Vec::new(),
            corpus_size: 0,
        }
    }

    pub fn bug_signals(&self) -> impl Iterator<Item = &Finding> + '_ {
        self.findings.iter().filter(|f| f.is_bug_signal())
    }
}

pub struct SessionEngine<T: Transport> {
    session: Session,
    options: SessionOptions,
    transport: T,
    oracle: Arc<dyn ResponseOracle>,
    scheduler: Box<dyn TransitionScheduler>,
    mutations: MutationEngine,
    resolver: CommandResolver,
    response_descriptor: Arc<ProtocolDescriptor>,
    response_resolver: CommandResolver,
    corpus: InMemoryCorpus,
    feedback: UniqueResponseFeedback,
    rng: ChaCha8Rng,
    findings: Vec<Finding>,
    iterations: u64,
    retries: u32,
    pending_retry: Option<Transition>,
}

impl<T: Transport> SessionEngine<T> {
    /// Creates an engine whose corpus starts with the protocol's seeds.
    pub fn new(descriptor: Arc<ProtocolDescriptor>, transport: T, options: SessionOptions) -> Self {
        let mut corpus = InMemoryCorpus::new();
        corpus.load_seeds(&generate_seeds(&descriptor));
        let response_descriptor = descriptor.response_descriptor();
        Self {
            resolver: CommandResolver::new(&descriptor),
            response_resolver: CommandResolver::new(&response_descriptor),
            response_descriptor,
            session: Session::new(options.session_id, descriptor),
            scheduler: scheduler_for(options.selection),
            rng: ChaCha8Rng::seed_from_u64(options.rng_seed),
            options,
            transport,
            oracle: Arc::new(AcceptAllOracle),
            mutations: MutationEngine::default(),
            corpus,
            feedback: UniqueResponseFeedback::new(),
            findings: Vec::new(),
            iterations: 0,
            retries: 0,
            pending_retry: None,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn ResponseOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_mutation_engine(mut self, mutations: MutationEngine) -> Self {
        self.mutations = mutations;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn TransitionScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Replaces the seed corpus.
    pub fn with_corpus(mut self, corpus: InMemoryCorpus) -> Self {
        self.corpus = corpus;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn corpus(&self) -> &InMemoryCorpus {
        &self.corpus
    }

    /// Runs until the state machine ends, the iteration budget is spent or
    /// `cancel` fires. Cancellation is checked only between transitions.
    pub async fn run(mut self, cancel: CancellationToken) -> SessionReport {
        info!(
            session = self.session.id,
            protocol = self.session.descriptor.name(),
            initial_state = %self.session.current_state,
            scheduler = self.scheduler.name(),
            "session started"
        );
        let end = loop {
            if cancel.is_cancelled() {
                break SessionEnd::Cancelled;
            }
            if self.iterations >= self.options.max_iterations {
                break SessionEnd::IterationLimit;
            }
            if let StepOutcome::Ended(end) = self.step().await {
                break end;
            }
        };
        if let Err(err) = self.transport.close().await {
            debug!(session = self.session.id, error = %err, "transport close failed");
        }
        info!(
            session = self.session.id,
            end = ?end,
            final_state = %self.session.current_state,
            iterations = self.iterations,
            findings = self.findings.len(),
            "session finished"
        );
        self.into_report(end)
    }

    fn into_report(self, end: SessionEnd) -> SessionReport {
        SessionReport {
            session_id: self.session.id,
            protocol: self.session.descriptor.name().to_string(),
            end,
            final_state: self.session.current_state,
            iterations: self.iterations,
            states_visited: self.session.visited,
            findings: self.findings,
            transcript: self.session.transcript,
            corpus_size: self.corpus.len(),
        }
    }

    /// Fires one transition from the current state.
    pub async fn step(&mut self) -> StepOutcome {
        let transition = match self.pending_retry.take() {
            Some(transition) => transition,
            None => match self.select_transition() {
                Ok(transition) => transition,
                Err(end) => return StepOutcome::Ended(end),
            },
        };
        self.iterations += 1;
        debug!(
            session = self.session.id,
            trigger = %transition.trigger,
            from = %transition.from,
            to = %transition.to,
            "firing transition"
        );

        let Some(request) = self.build_request(&transition) else {
            return StepOutcome::Skipped;
        };
        let bytes = match encode(&request, &mut self.session.counters) {
            Ok(bytes) => bytes,
            Err(err) => {
                let finding = self.finding(&transition, FindingKind::EncodeFailure, err.to_string());
                self.record(finding);
                return StepOutcome::Skipped;
            }
        };
        let message_index = self.session.message_index();

        if let Err(err) = self.transport.send(&bytes).await {
            let finding = self
                .finding(&transition, FindingKind::TransportFailure, err.to_string())
                .with_request(&bytes);
            self.record(finding);
            return StepOutcome::Ended(SessionEnd::TransportLost(err.to_string()));
        }

        let raw = match self.transport.receive(self.options.timeout).await {
            Ok(raw) => raw,
            Err(TransportError::Timeout(waited)) => {
                let finding = self
                    .finding(
                        &transition,
                        FindingKind::ResponseTimeout,
                        format!("no response within {waited:?}"),
                    )
                    .with_request(&bytes);
                self.record(finding);
                self.push_exchange(message_index, &transition, bytes, None, false);
                if self.retries < self.options.max_retries {
                    self.retries += 1;
                    self.pending_retry = Some(transition);
                    return StepOutcome::Stayed;
                }
                return StepOutcome::Ended(SessionEnd::RetriesExhausted);
            }
            Err(err) => {
                let finding = self
                    .finding(&transition, FindingKind::TransportFailure, err.to_string())
                    .with_request(&bytes);
                self.record(finding);
                self.push_exchange(message_index, &transition, bytes, None, false);
                return StepOutcome::Ended(SessionEnd::TransportLost(err.to_string()));
            }
        };
        self.retries = 0;

        let outcome = self.judge_response(&transition, request, &bytes, &raw);
        let advanced = matches!(outcome, StepOutcome::Advanced { .. });
        self.push_exchange(message_index, &transition, bytes, Some(raw), advanced);
        self.scheduler.report_outcome(&transition, advanced);
        outcome
    }

    fn select_transition(&mut self) -> Result<Transition, SessionEnd> {
        let state = self.session.current_state.as_str();
        let candidates: Vec<&Transition> = self.session.state_model.transitions_from(state).collect();
        if candidates.is_empty() {
            return Err(SessionEnd::Terminal);
        }
        let pick = self
            .scheduler
            .select(state, &candidates, &mut self.rng)
            .and_then(|idx| candidates.get(idx).copied());
        pick.cloned().ok_or(SessionEnd::Deadlock)
    }

    /// Template from the corpus (preferring entries already carrying the
    /// transition's message type), optionally mutated, then the command field
    /// and response-derived fields applied on top.
    fn build_request(&mut self, transition: &Transition) -> Option<MessageInstance> {
        let mut request = self.pick_template(transition);

        if self.rng.random_bool(self.options.mutation_rate) {
            let seed = self.rng.next_u64();
            let mutated = if self.rng.random_bool(self.options.corrupt_size_rate) {
                self.mutations.corrupt_size_fields(&request, &FieldSelection::All, seed)
            } else {
                let selection = FieldSelection::Random {
                    max: MAX_FIELDS_PER_MUTATION,
                };
                self.mutations.mutate(&request, &selection, seed)
            };
            match mutated {
                Ok(mutation) => {
                    debug!(
                        session = self.session.id,
                        strategy = mutation.strategy,
                        fields = ?mutation.mutated_fields,
                        "mutated template"
                    );
                    request = mutation.instance;
                }
                Err(err) => {
                    let finding = self.finding(transition, FindingKind::EncodeFailure, err.to_string());
                    self.record(finding);
                    return None;
                }
            }
        }

        if let Some(message_type) = &transition.message_type {
            if let Err(err) = self.resolver.apply(&mut request, message_type) {
                let mut finding = self.finding(transition, FindingKind::EncodeFailure, err.to_string());
                if let Some(field) = self.resolver.field_name() {
                    finding = finding.with_field(field);
                }
                self.record(finding);
                return None;
            }
        }

        if let Some(previous) = &self.session.last_response {
            let outcome = apply_response_handlers(
                self.session.descriptor.response_handlers(),
                previous,
                &mut request,
            );
            for (field, err) in outcome.errors {
                let finding = self
                    .finding(transition, FindingKind::TransformFailure, err.to_string())
                    .with_field(field);
                self.record(finding);
            }
        }
        Some(request)
    }

    fn pick_template(&mut self, transition: &Transition) -> MessageInstance {
        let wanted = transition
            .message_type
            .as_deref()
            .and_then(|message_type| self.resolver.value_of(message_type));
        let command_index = self.resolver.field_index();

        let matching: Vec<usize> = match (wanted, command_index) {
            (Some(value), Some(idx)) => self
                .corpus
                .entries()
                .filter(|(_, entry)| entry.instance.value_at(idx).and_then(FieldValue::as_integer) == Some(value))
                .map(|(id, _)| id)
                .collect(),
            _ => Vec::new(),
        };

        let chosen = if matching.is_empty() {
            self.corpus.random_select(&mut self.rng).map(|(_, entry)| entry)
        } else {
            let id = matching[self.rng.random_range(0..matching.len())];
            self.corpus.get(id)
        };
        match chosen {
            Some(entry) => entry.instance.clone(),
            None => MessageInstance::with_defaults(Arc::clone(&self.session.descriptor)),
        }
    }

    fn judge_response(
        &mut self,
        transition: &Transition,
        request: MessageInstance,
        request_bytes: &[u8],
        raw: &[u8],
    ) -> StepOutcome {
        let response = match decode(raw, &self.response_descriptor) {
            Ok(response) => response,
            Err(err) => {
                let mut finding = self
                    .finding(transition, FindingKind::DecodeAnomaly, err.to_string())
                    .with_request(request_bytes);
                if let Some(field) = &err.field {
                    finding = finding.with_field(field.clone());
                }
                self.record(finding);
                return match self.options.on_decode_error {
                    AnomalyPolicy::AbortSession => StepOutcome::Ended(SessionEnd::Aborted(FindingKind::DecodeAnomaly)),
                    AnomalyPolicy::Continue => StepOutcome::Stayed,
                };
            }
        };

        if self.feedback.is_interesting(raw) {
            let source = format!("session {} {}", self.session.id, transition.label());
            match self.feedback.report_interesting(request, raw, source, &mut self.corpus) {
                Ok(true) => debug!(
                    session = self.session.id,
                    corpus = self.corpus.len(),
                    feedback = self.feedback.name(),
                    "new response, request kept"
                ),
                Ok(false) => {}
                Err(err) => warn!(session = self.session.id, error = %err, "failed to store interesting request"),
            }
        }

        let expected_ok = match &transition.expected_response {
            None => true,
            Some(expected) => self.response_matches(&response, expected),
        };
        let oracle_verdict = self.oracle.validate_response(raw);
        self.session.last_response = Some(response);

        let oracle_ok = match oracle_verdict {
            Ok(true) => true,
            Ok(false) => {
                let finding = self
                    .finding(transition, FindingKind::OracleRejection, "validate_response returned false")
                    .with_request(request_bytes);
                self.record(finding);
                false
            }
            Err(err) => {
                let finding = self
                    .finding(transition, FindingKind::OracleFailure, err.to_string())
                    .with_request(request_bytes);
                self.record(finding);
                if self.options.on_oracle_error == OracleErrorPolicy::AbortSession {
                    return StepOutcome::Ended(SessionEnd::Aborted(FindingKind::OracleFailure));
                }
                false
            }
        };

        if !expected_ok {
            let expected = transition.expected_response.clone().unwrap_or_default();
            let actual = self
                .session
                .last_response
                .as_ref()
                .and_then(|r| self.response_resolver.message_type_of(r))
                .unwrap_or("<unknown>")
                .to_string();
            let mut finding = self
                .finding(
                    transition,
                    FindingKind::ProtocolViolation,
                    format!("expected response '{expected}', got '{actual}'"),
                )
                .with_request(request_bytes);
            if let Some(field) = self.response_resolver.field_name() {
                finding = finding.with_field(field);
            }
            self.record(finding);
            if self.options.on_violation == AnomalyPolicy::AbortSession {
                return StepOutcome::Ended(SessionEnd::Aborted(FindingKind::ProtocolViolation));
            }
        }

        if expected_ok && oracle_ok {
            let from = self.session.current_state.clone();
            if self.session.fire(transition) {
                return StepOutcome::Advanced {
                    from,
                    to: transition.to.clone(),
                };
            }
        }
        StepOutcome::Stayed
    }

    fn response_matches(&self, response: &MessageInstance, expected: &str) -> bool {
        let Some(idx) = self.response_resolver.field_index() else {
            return false;
        };
        let actual = response.value_at(idx).and_then(FieldValue::as_integer);
        actual.is_some() && actual == self.response_resolver.value_of(expected)
    }

    fn push_exchange(
        &mut self,
        message_index: usize,
        transition: &Transition,
        request: Vec<u8>,
        response: Option<Vec<u8>>,
        advanced: bool,
    ) {
        self.session.transcript.push(Exchange {
            message_index,
            transition: transition_ref(transition),
            request,
            response,
            advanced,
        });
    }

    fn finding(&self, transition: &Transition, kind: FindingKind, description: impl Into<String>) -> Finding {
        Finding::new(
            self.session.descriptor.name(),
            self.session.id,
            self.session.message_index(),
            kind,
            description,
        )
        .with_transition(&transition.from, &transition.to, &transition.trigger)
    }

    fn record(&mut self, finding: Finding) {
        warn!(
            session = finding.session_id,
            message_index = finding.message_index,
            kind = %finding.kind,
            field = ?finding.field,
            "{}",
            finding.description
        );
        self.findings.push(finding);
    }
}

fn transition_ref(transition: &Transition) -> TransitionRef {
    TransitionRef {
        from: transition.from.clone(),
        to: transition.to.clone(),
        trigger: transition.trigger.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::oracle::OracleError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Answers each request with the next scripted reply; `None` is a timeout.
    struct ScriptedTransport {
        replies: VecDeque<Option<Vec<u8>>>,
        sent: Vec<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Option<Vec<u8>>>) -> Self {
            Self {
                replies: replies.into(),
                sent: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.sent.push(bytes.to_vec());
            Ok(())
        }

        async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            match self.replies.pop_front() {
                Some(Some(reply)) => Ok(reply),
                Some(None) => Err(TransportError::Timeout(timeout)),
                None => Err(TransportError::Closed),
            }
        }
    }

    fn login_protocol() -> Arc<ProtocolDescriptor> {
        Arc::new(
            compile(&json!({
                "name": "login",
                "data_model": { "fields": [
                    { "name": "command", "type": "uint8", "values": { "1": "AUTH", "2": "DATA", "0x80": "OK", "0x81": "ERR" } },
                    { "name": "token", "type": "uint16", "mutable": false }
                ]},
                "state_model": {
                    "initial_state": "INIT",
                    "states": ["INIT", "AUTHED", "DONE"],
                    "transitions": [
                        { "from": "INIT", "to": "AUTHED", "trigger": "login", "message_type": "AUTH", "expected_response": "OK" },
                        { "from": "AUTHED", "to": "DONE", "trigger": "send", "message_type": "DATA", "expected_response": "OK" }
                    ]
                },
                "response_handlers": [
                    { "name": "session_token", "match": { "command": "OK" },
                      "set_fields": { "token": { "copy_from_response": "token",
                                                 "transforms": [ { "operation": "add_constant", "value": 1 } ] } } }
                ]
            }))
            .unwrap(),
        )
    }

    fn quiet_options() -> SessionOptions {
        SessionOptions {
            mutation_rate: 0.0,
            timeout: Duration::from_millis(5),
            ..SessionOptions::default()
        }
    }

    #[tokio::test]
    async fn walks_the_state_machine_and_threads_response_fields() {
        let proto = login_protocol();
        let transport = ScriptedTransport::new(vec![Some(vec![0x80, 0x12, 0x34]), Some(vec![0x80, 0, 0])]);
        let mut engine = SessionEngine::new(proto, transport, quiet_options());

        let first = engine.step().await;
        assert_eq!(
            first,
            StepOutcome::Advanced { from: "INIT".to_string(), to: "AUTHED".to_string() }
        );
        assert_eq!(engine.session().current_state(), "AUTHED");

        let second = engine.step().await;
        assert_eq!(
            second,
            StepOutcome::Advanced { from: "AUTHED".to_string(), to: "DONE".to_string() }
        );
        assert_eq!(engine.transport.sent[0][0], 1, "first request carries AUTH");
        assert_eq!(
            engine.transport.sent[1],
            vec![2, 0x12, 0x35],
            "token is copied from the previous response plus one"
        );
        assert_eq!(engine.step().await, StepOutcome::Ended(SessionEnd::Terminal));
    }

    #[tokio::test]
    async fn violation_is_recorded_and_state_holds() {
        let proto = login_protocol();
        let transport = ScriptedTransport::new(vec![Some(vec![0x81, 0, 0])]);
        let mut engine = SessionEngine::new(proto, transport, quiet_options());

        assert_eq!(engine.step().await, StepOutcome::Stayed);
        assert_eq!(engine.session().current_state(), "INIT");
        let finding = &engine.findings()[0];
        assert_eq!(finding.kind, FindingKind::ProtocolViolation);
        assert_eq!(finding.message_index, 0);
        assert_eq!(finding.transition.as_ref().map(|t| t.trigger.as_str()), Some("login"));
        assert!(!finding.request_hash.is_empty());
    }

    #[tokio::test]
    async fn timeouts_retry_then_end_the_session() {
        let proto = login_protocol();
        let transport = ScriptedTransport::new(vec![None, None, None]);
        let options = SessionOptions {
            max_retries: 2,
            ..quiet_options()
        };
        let report = SessionEngine::new(proto, transport, options)
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.end, SessionEnd::RetriesExhausted);
        assert_eq!(report.final_state, "INIT", "timeouts never advance the state");
        assert_eq!(report.transcript.len(), 3);
        assert!(report.findings.iter().all(|f| f.kind == FindingKind::ResponseTimeout));
    }

    #[tokio::test]
    async fn oracle_errors_follow_the_configured_policy() {
        let raising = |_: &[u8]| -> Result<bool, OracleError> { Err(OracleError::Raised("boom".to_string())) };

        let flag = SessionEngine::new(
            login_protocol(),
            ScriptedTransport::new(vec![Some(vec![0x80, 0, 0])]),
            quiet_options(),
        )
        .with_oracle(Arc::new(raising));
        let report = flag.run_for_test(1).await;
        assert_eq!(report.end, SessionEnd::IterationLimit);
        assert_eq!(report.bug_signals().count(), 1);
        assert_eq!(report.final_state, "INIT", "a raising oracle blocks the transition");

        let abort = SessionEngine::new(
            login_protocol(),
            ScriptedTransport::new(vec![Some(vec![0x80, 0, 0])]),
            SessionOptions {
                on_oracle_error: OracleErrorPolicy::AbortSession,
                ..quiet_options()
            },
        )
        .with_oracle(Arc::new(raising));
        let report = abort.run_for_test(5).await;
        assert_eq!(report.end, SessionEnd::Aborted(FindingKind::OracleFailure));
    }

    #[tokio::test]
    async fn decode_anomalies_do_not_advance() {
        let transport = ScriptedTransport::new(vec![Some(vec![0x80])]);
        let mut engine = SessionEngine::new(login_protocol(), transport, quiet_options());
        assert_eq!(engine.step().await, StepOutcome::Stayed);
        assert_eq!(engine.findings()[0].kind, FindingKind::DecodeAnomaly);
        assert_eq!(engine.session().current_state(), "INIT");
    }

    #[tokio::test]
    async fn cancellation_is_honoured_between_transitions() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = SessionEngine::new(login_protocol(), ScriptedTransport::new(vec![]), quiet_options())
            .run(cancel)
            .await;
        assert_eq!(report.end, SessionEnd::Cancelled);
        assert!(report.transcript.is_empty());
    }

    #[test]
    fn session_fires_only_from_the_current_state() {
        let proto = login_protocol();
        let mut session = Session::new(0, Arc::clone(&proto));
        let transitions = proto.state_model().unwrap().transitions.clone();

        assert!(!session.fire(&transitions[1]), "AUTHED->DONE cannot fire from INIT");
        assert_eq!(session.current_state(), "INIT");
        assert!(session.fire(&transitions[0]));
        assert_eq!(session.current_state(), "AUTHED");
    }

    #[tokio::test]
    async fn only_new_responses_grow_the_corpus() {
        let proto = login_protocol();
        let transport = ScriptedTransport::new(vec![
            Some(vec![0x81, 0, 0]),
            Some(vec![0x81, 0, 0]),
            Some(vec![0x81, 0, 1]),
        ]);
        let mut engine = SessionEngine::new(proto, transport, quiet_options());
        let seeded = engine.corpus().len();

        engine.step().await;
        assert_eq!(engine.corpus().len(), seeded + 1);
        engine.step().await;
        assert_eq!(engine.corpus().len(), seeded + 1, "a repeated response is not interesting");
        assert!(!engine.feedback.is_interesting(&[0x81, 0, 0]));
        engine.step().await;
        assert_eq!(engine.corpus().len(), seeded + 2);
        let newest = engine.corpus().get(seeded + 1).unwrap();
        assert!(newest.source.contains("login"), "source names the transition: {}", newest.source);
    }

    impl<T: Transport> SessionEngine<T> {
        async fn run_for_test(mut self, iterations: u64) -> SessionReport {
            self.options.max_iterations = iterations;
            self.run(CancellationToken::new()).await
        }
    }
}

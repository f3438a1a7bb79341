use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wirefuzz_core::codec::BehaviorCounters;
use wirefuzz_core::corpus::Corpus;
use wirefuzz_core::oracle::OracleError;
use wirefuzz_core::{
    Campaign, FieldValue, FindingKind, MessageInstance, ProtocolDescriptor, ResponseOracle, SessionEnd,
    Transport, TransportError, TransportFactory, WirefuzzConfig, compile, decode, encode, preview,
};

/// Replies to every request with the request itself.
struct EchoTransport {
    last: Option<Vec<u8>>,
}

#[async_trait]
impl Transport for EchoTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.last = Some(bytes.to_vec());
        Ok(())
    }

    async fn receive(&mut self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.last.take().ok_or(TransportError::Closed)
    }
}

struct EchoFactory {
    refuse_session: Option<usize>,
}

#[async_trait]
impl TransportFactory for EchoFactory {
    async fn connect(&self, session_id: usize) -> Result<Box<dyn Transport>, TransportError> {
        if self.refuse_session == Some(session_id) {
            return Err(TransportError::Connect {
                address: "127.0.0.1:1".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(EchoTransport { last: None }))
    }
}

fn hub_protocol() -> Arc<ProtocolDescriptor> {
    Arc::new(
        compile(&json!({
            "name": "hub",
            "data_model": { "fields": [
                { "name": "command", "type": "uint8", "values": { "1": "A", "2": "B", "3": "C", "9": "RESET" } },
                { "name": "body", "type": "bytes", "max_size": 16, "default": "hi" }
            ]},
            "state_model": {
                "initial_state": "INIT",
                "states": ["INIT", "A", "B", "C"],
                "transitions": [
                    { "from": "INIT", "to": "A", "trigger": "go_a", "message_type": "A", "expected_response": "A" },
                    { "from": "INIT", "to": "B", "trigger": "go_b", "message_type": "B", "expected_response": "B" },
                    { "from": "INIT", "to": "C", "trigger": "go_c", "message_type": "C", "expected_response": "C" },
                    { "from": "A", "to": "INIT", "trigger": "reset", "message_type": "RESET" },
                    { "from": "B", "to": "INIT", "trigger": "reset", "message_type": "RESET" },
                    { "from": "C", "to": "INIT", "trigger": "reset", "message_type": "RESET" }
                ]
            }
        }))
        .unwrap(),
    )
}

fn quiet_config(sessions: usize, iterations: u64) -> WirefuzzConfig {
    let mut config = WirefuzzConfig::default();
    config.fuzzer.sessions = sessions;
    config.fuzzer.concurrency = 2;
    config.fuzzer.max_iterations = iterations;
    config.fuzzer.mutation_rate = 0.0;
    config.session.timeout_ms = 10;
    config
}

#[tokio::test]
async fn every_session_explores_all_branches() {
    let factory = Arc::new(EchoFactory { refuse_session: None });
    let report = Campaign::new(hub_protocol(), quiet_config(3, 6), factory)
        .run(CancellationToken::new())
        .await;

    assert_eq!(report.sessions.len(), 3);
    let ids: Vec<usize> = report.sessions.iter().map(|s| s.session_id).collect();
    assert_eq!(ids, [0, 1, 2]);

    let all_states: BTreeSet<String> = ["INIT", "A", "B", "C"].iter().map(|s| s.to_string()).collect();
    for session in &report.sessions {
        assert_eq!(session.end, SessionEnd::IterationLimit);
        assert_eq!(session.iterations, 6);
        assert_eq!(session.states_visited, all_states, "session {}", session.session_id);
        assert!(session.findings.is_empty(), "echoed replies always match");
        assert!(session.transcript.iter().all(|x| x.advanced));
    }
    assert_eq!(report.failed_sessions(), 0);
}

#[tokio::test]
async fn refused_connection_fails_only_that_session() {
    let factory = Arc::new(EchoFactory { refuse_session: Some(1) });
    let report = Campaign::new(hub_protocol(), quiet_config(3, 4), factory)
        .run(CancellationToken::new())
        .await;

    assert_eq!(report.sessions.len(), 3);
    assert_eq!(report.failed_sessions(), 1);
    assert!(matches!(report.sessions[1].end, SessionEnd::Failed(ref reason) if reason.contains("refused")));
    assert_eq!(report.sessions[0].end, SessionEnd::IterationLimit);
    assert_eq!(report.sessions[2].end, SessionEnd::IterationLimit);
}

#[tokio::test]
async fn raising_oracle_is_reported_as_bug_signal() {
    let factory = Arc::new(EchoFactory { refuse_session: None });
    let oracle: Arc<dyn ResponseOracle> = Arc::new(|response: &[u8]| -> Result<bool, OracleError> {
        if response.first() == Some(&3) {
            return Err(OracleError::Raised("server state corrupted".to_string()));
        }
        Ok(true)
    });
    let report = Campaign::new(hub_protocol(), quiet_config(2, 6), factory)
        .with_oracle(oracle)
        .run(CancellationToken::new())
        .await;

    assert!(report.bug_signals() >= 2, "each session hits the C branch");
    assert!(report.findings().all(|f| f.kind == FindingKind::OracleFailure));
    assert!(report.findings_by_kind().contains_key(&FindingKind::OracleFailure.to_string()));
    for session in &report.sessions {
        assert!(!session.states_visited.contains("C"), "a raising oracle blocks the transition");
    }
}

#[tokio::test]
async fn every_session_starts_from_the_campaign_corpus() {
    let proto = hub_protocol();
    let factory = Arc::new(EchoFactory { refuse_session: Some(2) });
    let mut campaign = Campaign::new(Arc::clone(&proto), quiet_config(4, 6), factory);
    let mut extra = MessageInstance::with_defaults(Arc::clone(&proto));
    extra.set("body", FieldValue::Bytes(b"from disk".to_vec())).unwrap();
    campaign.corpus_mut().add(extra, "seed file".to_string()).unwrap();
    let starting = campaign.corpus_mut().len();

    let report = campaign.run(CancellationToken::new()).await;
    for session in &report.sessions {
        if session.session_id == 2 {
            assert_eq!(session.corpus_size, 0, "a session that never connected holds no corpus");
            continue;
        }
        assert!(
            session.corpus_size > starting,
            "session {} grew its own copy past {starting}, has {}",
            session.session_id,
            session.corpus_size
        );
    }
}

#[tokio::test]
async fn cancelled_campaign_reports_every_session() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let factory = Arc::new(EchoFactory { refuse_session: None });
    let report = Campaign::new(hub_protocol(), quiet_config(4, 100), factory)
        .run(cancel)
        .await;

    assert_eq!(report.sessions.len(), 4);
    assert!(report.sessions.iter().all(|s| s.end == SessionEnd::Cancelled));
}

#[test]
fn stcp_frame_round_trips() {
    let stcp = Arc::new(
        compile(&json!({
            "name": "stcp",
            "transport": "tcp",
            "data_model": { "fields": [
                { "name": "magic", "type": "bytes", "size": 4, "default": "STCP", "mutable": false },
                { "name": "length", "type": "uint32", "endian": "little", "is_size_field": true, "size_of": "payload" },
                { "name": "command", "type": "uint8", "values": { "1": "CONNECT", "2": "DATA", "3": "CLOSE" } },
                { "name": "payload", "type": "bytes", "max_size": 1024 }
            ]}
        }))
        .unwrap(),
    );

    let mut message = MessageInstance::with_defaults(Arc::clone(&stcp));
    message.set("command", FieldValue::Integer(2)).unwrap();
    message.set("payload", FieldValue::Bytes(b"hello world".to_vec())).unwrap();

    let mut counters = BehaviorCounters::new();
    let bytes = encode(&message, &mut counters).unwrap();
    assert_eq!(&bytes[..4], b"STCP");
    assert_eq!(&bytes[4..8], &[11, 0, 0, 0]);
    assert_eq!(bytes[8], 2);
    assert_eq!(&bytes[9..], b"hello world");

    let decoded = decode(&bytes, &stcp).unwrap();
    assert_eq!(decoded.get("length"), Some(&FieldValue::Integer(11)));
    assert_eq!(encode(&decoded, &mut counters).unwrap(), bytes);

    let entries = preview(&decoded, &counters).unwrap();
    assert_eq!(entries[1].hex, "0b000000");
    assert_eq!(entries[2].value, "2 (DATA)");

    let truncated = decode(&bytes[..6], &stcp).unwrap_err();
    assert_eq!(truncated.partial.get("magic"), Some(&FieldValue::Bytes(b"STCP".to_vec())));
}

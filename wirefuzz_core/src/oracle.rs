use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Severity of findings raised when the oracle itself fails.
const ORACLE_FAILURE_SEVERITY: u8 = 10;

/// Raised by an oracle to signal a logical failure distinct from a plain
/// rejection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("Oracle raised: {0}")]
    Raised(String),
}

/// A `ResponseOracle` judges response correctness beyond structural validity.
///
/// `Ok(false)` is a plain rejection. `Err(_)` is a separate, higher-severity
/// class of finding.
pub trait ResponseOracle: Send + Sync {
    fn validate_response(&self, response: &[u8]) -> Result<bool, OracleError>;
}

impl<F> ResponseOracle for F
where
    F: Fn(&[u8]) -> Result<bool, OracleError> + Send + Sync,
{
    fn validate_response(&self, response: &[u8]) -> Result<bool, OracleError> {
        self(response)
    }
}

/// Oracle used when a protocol supplies none: every response passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllOracle;

impl ResponseOracle for AcceptAllOracle {
    fn validate_response(&self, _response: &[u8]) -> Result<bool, OracleError> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    EncodeFailure,
    DecodeAnomaly,
    TransformFailure,
    ResponseTimeout,
    ProtocolViolation,
    OracleRejection,
    OracleFailure,
    TransportFailure,
}

impl FindingKind {
    pub fn severity(self) -> u8 {
        match self {
            FindingKind::OracleFailure => ORACLE_FAILURE_SEVERITY,
            FindingKind::DecodeAnomaly => 6,
            FindingKind::ProtocolViolation | FindingKind::OracleRejection => 5,
            FindingKind::ResponseTimeout | FindingKind::TransportFailure => 4,
            FindingKind::TransformFailure => 3,
            FindingKind::EncodeFailure => 2,
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FindingKind::EncodeFailure => "encode-failure",
            FindingKind::DecodeAnomaly => "decode-anomaly",
            FindingKind::TransformFailure => "transform-failure",
            FindingKind::ResponseTimeout => "response-timeout",
            FindingKind::ProtocolViolation => "protocol-violation",
            FindingKind::OracleRejection => "oracle-rejection",
            FindingKind::OracleFailure => "oracle-failure",
            FindingKind::TransportFailure => "transport-failure",
        };
        f.write_str(name)
    }
}

/// Transition identity carried by findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRef {
    pub from: String,
    pub to: String,
    pub trigger: String,
}

/// Anomaly recorded during a session, with enough context to reproduce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub protocol: String,
    pub session_id: usize,
    pub message_index: usize,
    pub transition: Option<TransitionRef>,
    pub field: Option<String>,
    pub kind: FindingKind,
    pub description: String,
    /// MD5 hex digest of the request bytes, empty when nothing was encoded.
    pub request_hash: String,
    pub request: Vec<u8>,
    pub severity: u8,
}

impl Finding {
    pub fn new(
        protocol: &str,
        session_id: usize,
        message_index: usize,
        kind: FindingKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            protocol: protocol.to_string(),
            session_id,
            message_index,
            transition: None,
            field: None,
            kind,
            description: description.into(),
            request_hash: String::new(),
            request: Vec::new(),
            severity: kind.severity(),
        }
    }

    pub fn with_transition(mut self, from: &str, to: &str, trigger: &str) -> Self {
        self.transition = Some(TransitionRef {
            from: from.to_string(),
            to: to.to_string(),
            trigger: trigger.to_string(),
        });
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_request(mut self, request: &[u8]) -> Self {
        self.request_hash = format!("{:x}", md5::compute(request));
        self.request = request.to_vec();
        self
    }

    /// Oracle failures are surfaced as bug signals of their own class.
    pub fn is_bug_signal(&self) -> bool {
        self.kind == FindingKind::OracleFailure
    }
}

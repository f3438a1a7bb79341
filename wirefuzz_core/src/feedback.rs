use crate::corpus::Corpus;
use crate::message::MessageInstance;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Corpus operation failed within feedback: {0}")]
    CorpusInteractionError(#[from] crate::corpus::CorpusError),
}

/// Decides which requests are worth keeping, judged by the response they drew.
pub trait Feedback: Send {
    fn name(&self) -> &'static str;
    fn is_interesting(&self, response: &[u8]) -> bool;
    /// Records `response` and stores `request` in `corpus` when it is new.
    /// Returns whether the request was added.
    fn report_interesting(
        &mut self,
        request: MessageInstance,
        response: &[u8],
        source: String,
        corpus: &mut dyn Corpus,
    ) -> Result<bool, FeedbackError>;
}

/// Keeps requests whose response bytes have not been seen before.
#[derive(Debug, Default)]
pub struct UniqueResponseFeedback {
    pub known_hashes: HashSet<[u8; 16]>,
}

impl UniqueResponseFeedback {
    pub fn new() -> Self {
        Self {
            known_hashes: HashSet::new(),
        }
    }
}

impl Feedback for UniqueResponseFeedback {
    fn name(&self) -> &'static str {
        "UniqueResponseFeedback"
    }

    fn is_interesting(&self, response: &[u8]) -> bool {
        let hash = md5::compute(response);
        !self.known_hashes.contains(&hash.0)
    }

    fn report_interesting(
        &mut self,
        request: MessageInstance,
        response: &[u8],
        source: String,
        corpus: &mut dyn Corpus,
    ) -> Result<bool, FeedbackError> {
        let hash = md5::compute(response);
        if self.known_hashes.insert(hash.0) {
            corpus.add(request, source)?;
            return Ok(true);
        }
        Ok(false)
    }
}

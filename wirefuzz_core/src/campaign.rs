use crate::config::WirefuzzConfig;
use crate::corpus::{Corpus, InMemoryCorpus};
use crate::mutator::MutationEngine;
use crate::oracle::{AcceptAllOracle, Finding, FindingKind, ResponseOracle};
use crate::schema::ProtocolDescriptor;
use crate::seed::generate_seeds;
use crate::session::{SessionEnd, SessionEngine, SessionOptions, SessionReport};
use crate::transport::TransportFactory;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

/// Aggregated outcome of all sessions of a campaign.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub protocol: String,
    /// Sorted by session id.
    pub sessions: Vec<SessionReport>,
}

impl CampaignReport {
    pub fn findings(&self) -> impl Iterator<Item = &Finding> + '_ {
        self.sessions.iter().flat_map(|s| s.findings.iter())
    }

    pub fn findings_by_kind(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for finding in self.findings() {
            *counts.entry(finding.kind.to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn bug_signals(&self) -> usize {
        self.findings().filter(|f| f.kind == FindingKind::OracleFailure).count()
    }

    pub fn failed_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| matches!(s.end, SessionEnd::Failed(_)))
            .count()
    }
}

/// Runs many independent sessions of one protocol under a concurrency cap.
///
/// Each session owns its transport, counters and RNG; only the compiled
/// descriptor, the oracle and the starting corpus are shared. A session that
/// fails to connect or panics is reported as failed without disturbing the
/// others.
pub struct Campaign {
    descriptor: Arc<ProtocolDescriptor>,
    config: WirefuzzConfig,
    factory: Arc<dyn TransportFactory>,
    oracle: Arc<dyn ResponseOracle>,
    mutations: MutationEngine,
    corpus: InMemoryCorpus,
}

impl Campaign {
    pub fn new(
        descriptor: Arc<ProtocolDescriptor>,
        config: WirefuzzConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let mut corpus = InMemoryCorpus::new();
        corpus.load_seeds(&generate_seeds(&descriptor));
        Self {
            descriptor,
            config,
            factory,
            oracle: Arc::new(AcceptAllOracle),
            mutations: MutationEngine::default(),
            corpus,
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

    /// Starting corpus copied into every session.
    pub fn corpus_mut(&mut self) -> &mut InMemoryCorpus {
        &mut self.corpus
    }

    pub async fn run(self, cancel: CancellationToken) -> CampaignReport {
        let protocol = self.descriptor.name().to_string();
        let sessions = self.config.fuzzer.sessions;
        let permits = Arc::new(Semaphore::new(self.config.fuzzer.concurrency.max(1)));
        info!(
            protocol = %protocol,
            sessions,
            concurrency = self.config.fuzzer.concurrency,
            strategies = ?self.mutations.strategy_names(),
            corpus = self.corpus.len(),
            "campaign started"
        );

        let corpus = Arc::new(self.corpus);

        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<usize> = (0..sessions).collect();
        for session_id in 0..sessions {
            let permits = Arc::clone(&permits);
            let descriptor = Arc::clone(&self.descriptor);
            let factory = Arc::clone(&self.factory);
            let oracle = Arc::clone(&self.oracle);
            let mutations = self.mutations.clone();
            let corpus = Arc::clone(&corpus);
            let options = SessionOptions::from_config(&self.config, session_id);
            let cancel = cancel.clone();
            let span = info_span!("session", id = session_id, protocol = %protocol);

            tasks.spawn(
                async move {
                    let name = descriptor.name().to_string();
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return SessionReport::failed(session_id, &name, "concurrency limiter closed".to_string());
                    };
                    if cancel.is_cancelled() {
                        let mut report = SessionReport::failed(session_id, &name, String::new());
                        report.end = SessionEnd::Cancelled;
                        return report;
                    }
                    let transport = match factory.connect(session_id).await {
                        Ok(transport) => transport,
                        Err(err) => {
                            error!(error = %err, "session could not connect");
                            return SessionReport::failed(session_id, &name, err.to_string());
                        }
                    };
                    let corpus = InMemoryCorpus::clone(&corpus);
                    SessionEngine::new(descriptor, transport, options)
                        .with_oracle(oracle)
                        .with_mutation_engine(mutations)
                        .with_corpus(corpus)
                        .run(cancel)
                        .await
                }
                .instrument(span),
            );
        }

        let mut reports = Vec::with_capacity(sessions);
        let mut task_errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    pending.remove(&report.session_id);
                    reports.push(report);
                }
                Err(join_error) => {
                    error!(error = %join_error, "session task failed");
                    task_errors.push(join_error.to_string());
                }
            }
        }
        // Sessions without a report are the ones whose task panicked.
        for session_id in pending {
            let reason = task_errors.pop().unwrap_or_else(|| "session task failed".to_string());
            reports.push(SessionReport::failed(session_id, &protocol, reason));
        }
        reports.sort_by_key(|r| r.session_id);

        let report = CampaignReport {
            protocol,
            sessions: reports,
        };
        info!(
            sessions = report.sessions.len(),
            findings = report.findings().count(),
            failed = report.failed_sessions(),
            "campaign finished"
        );
        report
    }
}

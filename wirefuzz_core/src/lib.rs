pub mod campaign;
pub mod codec;
pub mod compiler;
pub mod config;
pub mod corpus;
pub mod feedback;
pub mod layout;
pub mod message;
pub mod mutator;
pub mod oracle;
pub mod preview;
pub mod resolver;
pub mod scheduler;
pub mod schema;
pub mod seed;
pub mod session;
pub mod transform;
pub mod transport;

pub use campaign::{Campaign, CampaignReport};
pub use codec::{BehaviorCounters, DecodeError, EncodeError, decode, encode};
pub use compiler::{compile, compile_cached, compile_file};
pub use config::WirefuzzConfig;
pub use corpus::{Corpus, CorpusError, InMemoryCorpus};
pub use feedback::{Feedback, FeedbackError, UniqueResponseFeedback};
pub use message::{FieldValue, MessageInstance};
pub use mutator::{MutationEngine, Mutator};
pub use oracle::{AcceptAllOracle, Finding, FindingKind, ResponseOracle};
pub use preview::{PreviewEntry, preview};
pub use resolver::CommandResolver;
pub use scheduler::{SelectionPolicy, TransitionScheduler};
pub use schema::{ProtocolDescriptor, SchemaError};
pub use seed::{Seed, generate_seeds};
pub use session::{SessionEnd, SessionEngine, SessionOptions, SessionReport};
pub use transport::{Transport, TransportError, TransportFactory};

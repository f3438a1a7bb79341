use crate::codec::decode;
use crate::message::MessageInstance;
use crate::schema::ProtocolDescriptor;
use crate::seed::Seed;
use rand_core::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred while reading seed files from disk.
    #[error("Corpus I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

/// One stored message template.
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    pub instance: MessageInstance,
    /// Where the entry came from (seed origin, mutation, session).
    pub source: String,
}

/// A collection of message templates sessions draw from.
///
/// Entries are decoded [`MessageInstance`]s rather than raw bytes so that
/// mutation always starts from a structured value.
pub trait Corpus: Send + Sync {
    /// Adds an entry and returns its ID.
    fn add(&mut self, instance: MessageInstance, source: String) -> Result<usize, CorpusError>;

    fn get(&self, id: usize) -> Option<&CorpusEntry>;

    /// Selects an entry uniformly at random, or `None` when empty.
    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, &CorpusEntry)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Box<dyn Iterator<Item = (usize, &CorpusEntry)> + '_>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryCorpus {
    entries: Vec<CorpusEntry>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every seed that decoded. Flagged seeds carry no instance and are
    /// skipped. Returns the number of entries added.
    pub fn load_seeds(&mut self, seeds: &[Seed]) -> usize {
        let mut loaded = 0;
        for seed in seeds {
            if let Some(instance) = &seed.instance {
                self.entries.push(CorpusEntry {
                    instance: instance.clone(),
                    source: format!("seed: {}", seed.origin),
                });
                loaded += 1;
            }
        }
        loaded
    }

    /// Loads raw message files (or every file of a directory) and decodes
    /// them against `descriptor`. Files that do not decode are logged and
    /// skipped.
    pub fn load_seed_files(
        &mut self,
        descriptor: &Arc<ProtocolDescriptor>,
        seed_paths: &[PathBuf],
    ) -> Result<usize, CorpusError> {
        let mut loaded = 0;
        for path in seed_paths {
            if path.is_dir() {
                let dir = fs::read_dir(path).map_err(|e| {
                    CorpusError::Io(format!("Failed to read seed directory {:?}: {}", path, e))
                })?;
                let mut files = Vec::new();
                for entry in dir {
                    let entry = entry.map_err(|e| {
                        CorpusError::Io(format!("Error reading entry in {:?}: {}", path, e))
                    })?;
                    if entry.path().is_file() {
                        files.push(entry.path());
                    }
                }
                files.sort();
                for file in files {
                    loaded += usize::from(self.load_seed_file(descriptor, &file)?);
                }
            } else if path.is_file() {
                loaded += usize::from(self.load_seed_file(descriptor, path)?);
            } else {
                warn!(path = ?path, "seed path is neither a file nor a directory");
            }
        }
        Ok(loaded)
    }

    fn load_seed_file(&mut self, descriptor: &Arc<ProtocolDescriptor>, path: &Path) -> Result<bool, CorpusError> {
        let bytes = fs::read(path)
            .map_err(|e| CorpusError::Io(format!("Failed to read seed file {:?}: {}", path, e)))?;
        match decode(&bytes, descriptor) {
            Ok(instance) => {
                self.entries.push(CorpusEntry {
                    instance,
                    source: format!("seed file: {}", path.display()),
                });
                Ok(true)
            }
            Err(err) => {
                warn!(path = ?path, error = %err, "seed file does not decode; skipping");
                Ok(false)
            }
        }
    }
}

impl Corpus for InMemoryCorpus {
    fn add(&mut self, instance: MessageInstance, source: String) -> Result<usize, CorpusError> {
        let id = self.entries.len();
        self.entries.push(CorpusEntry { instance, source });
        Ok(id)
    }

    fn get(&self, id: usize) -> Option<&CorpusEntry> {
        self.entries.get(id)
    }

    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, &CorpusEntry)> {
        if self.entries.is_empty() {
            return None;
        }
        let index = rng.next_u64() as usize % self.entries.len();
        self.entries.get(index).map(|entry| (index, entry))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn entries(&self) -> Box<dyn Iterator<Item = (usize, &CorpusEntry)> + '_> {
        Box::new(self.entries.iter().enumerate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::seed::generate_seeds;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use serde_json::json;
    use tempfile::tempdir;

    fn proto() -> Arc<ProtocolDescriptor> {
        Arc::new(
            compile(&json!({
                "name": "p",
                "data_model": { "fields": [
                    { "name": "command", "type": "uint8", "values": { "1": "A", "2": "B" } },
                    { "name": "value", "type": "uint16" }
                ]}
            }))
            .unwrap(),
        )
    }

    #[test]
    fn in_memory_corpus_add_get_len_is_empty() {
        let proto = proto();
        let mut corpus = InMemoryCorpus::new();
        assert!(corpus.is_empty());

        let id = corpus
            .add(MessageInstance::with_defaults(proto), "manual".to_string())
            .unwrap();
        assert_eq!(id, 0);
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.get(0).map(|e| e.source.as_str()), Some("manual"));
        assert!(corpus.get(1).is_none());
    }

    #[test]
    fn in_memory_corpus_random_select_behavior() {
        let proto = proto();
        let mut corpus = InMemoryCorpus::new();
        let mut rng = ChaCha8Rng::from_seed([42; 32]);
        assert!(corpus.random_select(&mut rng).is_none());

        assert_eq!(corpus.load_seeds(&generate_seeds(&proto)), 3);
        let mut selected = std::collections::HashSet::new();
        for _ in 0..60 {
            let (id, _) = corpus.random_select(&mut rng).expect("corpus is not empty");
            selected.insert(id);
        }
        assert_eq!(selected.len(), 3, "every entry should be selected eventually");
    }

    #[test]
    fn seed_files_decode_into_entries() {
        let proto = proto();
        let dir = tempdir().unwrap();
        let seed_dir = dir.path().join("seeds");
        fs::create_dir(&seed_dir).unwrap();
        fs::write(seed_dir.join("a.bin"), [1, 0, 7]).unwrap();
        fs::write(seed_dir.join("b.bin"), [2]).unwrap();
        let single = dir.path().join("c.bin");
        fs::write(&single, [2, 1, 0]).unwrap();

        let mut corpus = InMemoryCorpus::new();
        let loaded = corpus
            .load_seed_files(&proto, &[seed_dir, single])
            .unwrap();
        assert_eq!(loaded, 2, "the truncated file is skipped");
        assert_eq!(
            corpus.get(1).and_then(|e| e.instance.get("value")).cloned(),
            Some(crate::message::FieldValue::Integer(0x0100))
        );
    }
}

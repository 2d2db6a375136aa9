use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use super::{unused_random_id, GenerationToken};
use crate::ports::{DeviceHandle, ReaderScanner};

/// Lower-cased name fragment of a YubiKey's own CCID reader
pub const YK_READER_NAME: &str = "yubico yubikey";

/// Listing entry for one reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderSummary {
    pub name: String,
}

#[derive(Clone)]
pub struct ReaderEntry {
    pub device: Arc<dyn DeviceHandle>,
}

#[derive(Default)]
struct ReaderState {
    token: Option<GenerationToken>,
    readers: BTreeMap<String, ReaderEntry>,
    summaries: BTreeMap<String, ReaderSummary>,
}

/// Enumerates external smartcard readers, NFC readers included
///
/// Readers are identified by a random id per generation; the key inside a
/// reader is only queried once a connection is opened.
pub struct ReaderEnumerator {
    scanner: Arc<dyn ReaderScanner>,
    state: Mutex<ReaderState>,
}

impl ReaderEnumerator {
    pub fn new(scanner: Arc<dyn ReaderScanner>) -> Self {
        Self {
            scanner,
            state: Mutex::new(ReaderState::default()),
        }
    }

    fn probe(&self) -> Vec<Arc<dyn DeviceHandle>> {
        let readers = self.scanner.list_readers().unwrap_or_else(|e| {
            warn!("Listing readers failed: {}", e);
            Vec::new()
        });
        readers
            .into_iter()
            .filter(|reader| {
                reader
                    .reader_name()
                    .is_some_and(|name| !name.to_lowercase().contains(YK_READER_NAME))
            })
            .collect()
    }

    fn token_of(readers: &[Arc<dyn DeviceHandle>]) -> GenerationToken {
        let names: BTreeSet<&str> = readers.iter().filter_map(|r| r.reader_name()).collect();
        GenerationToken::of(&names)
    }

    pub fn token(&self) -> GenerationToken {
        Self::token_of(&self.probe())
    }

    pub fn list(&self) -> BTreeMap<String, ReaderSummary> {
        let readers = self.probe();
        let token = Self::token_of(&readers);

        let mut state = self.state.lock();
        if state.token != Some(token) {
            state.readers.clear();
            state.summaries.clear();
            for device in readers {
                let name = device.reader_name().unwrap_or_default().to_string();
                let id = unused_random_id(&state.readers);
                state.summaries.insert(id.clone(), ReaderSummary { name });
                state.readers.insert(id, ReaderEntry { device });
            }
            info!("Reader set changed, {} reader(s)", state.readers.len());
            state.token = Some(token);
        }
        state.summaries.clone()
    }

    pub fn resolve(&self, id: &str) -> Option<ReaderEntry> {
        self.state.lock().readers.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::virtual_key::{VirtualBackend, VirtualKey};

    #[test]
    fn test_own_ccid_reader_is_excluded() {
        let backend = VirtualBackend::new();
        backend.plug_usb(VirtualKey::yubikey5(Some(1)));
        backend.add_reader("ACS ACR1252 PICC");
        let readers = ReaderEnumerator::new(Arc::new(backend.clone()));

        let listing = readers.list();
        assert_eq!(listing.len(), 1);
        let summary = listing.values().next().unwrap();
        assert_eq!(summary.name, "ACS ACR1252 PICC");
    }

    #[test]
    fn test_ids_stable_until_reader_set_changes() {
        let backend = VirtualBackend::new();
        backend.add_reader("Reader A");
        let readers = ReaderEnumerator::new(Arc::new(backend.clone()));

        let first = readers.list();
        assert_eq!(readers.list(), first);

        // inserting a card does not change the reader set
        backend.insert_card("Reader A", VirtualKey::yubikey5(Some(9)));
        assert_eq!(readers.list(), first);

        backend.add_reader("Reader B");
        let second = readers.list();
        assert_eq!(second.len(), 2);
        for id in first.keys() {
            assert!(!second.contains_key(id));
            assert!(readers.resolve(id).is_none());
        }
    }

    #[test]
    fn test_removed_reader_changes_token() {
        let backend = VirtualBackend::new();
        backend.add_reader("Reader A");
        let readers = ReaderEnumerator::new(Arc::new(backend.clone()));
        let before = readers.token();

        backend.remove_reader("Reader A");
        assert_ne!(readers.token(), before);
        assert!(readers.list().is_empty());
    }
}

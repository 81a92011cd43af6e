use super::error::IngestError;
use crate::store::SymbolStore;
use std::collections::HashSet;

/// Deduplicates symbol names against the master-data store
///
/// A name enters the cache only after the store confirmed it exists, so
/// cache membership always implies a persisted symbol. Failed lookups are
/// not cached and will hit the store again on the next call.
pub struct SymbolResolver {
    store: Box<dyn SymbolStore>,
    known: HashSet<String>,
}

impl SymbolResolver {
    pub fn new(store: Box<dyn SymbolStore>) -> Self {
        Self {
            store,
            known: HashSet::new(),
        }
    }

    pub async fn resolve(&mut self, name: &str) -> Result<String, IngestError> {
        if self.known.contains(name) {
            return Ok(name.to_string());
        }

        let symbol = self.store.get_or_create_symbol(name).await?;
        self.known.insert(symbol.name.clone());
        Ok(symbol.name)
    }

    /// Drop every cached name; the next resolve goes back to the store
    pub fn forget_all(&mut self) {
        self.known.clear();
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    pub fn cached_count(&self) -> usize {
        self.known.len()
    }
}

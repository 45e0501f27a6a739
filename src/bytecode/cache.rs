//! Cache of serialized chunks keyed by fingerprint
//!
//! Dumps are plain bytes, so one cache can be shared by runtimes on
//! different threads; each runtime undumps its own copy.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sha1::{Digest, Sha1};

use crate::error::{ScriptError, ScriptResult};
use crate::proto::FunctionProto;

/// Thread-safe store of precompiled chunks
pub struct BytecodeCache {
    chunks: Arc<RwLock<HashMap<String, Arc<[u8]>>>>,
}

fn poisoned() -> ScriptError {
    ScriptError::internal("bytecode cache lock poisoned")
}

impl BytecodeCache {
    pub fn new() -> Self {
        BytecodeCache {
            chunks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Dump `proto` and store it, returning its fingerprint
    pub fn insert(&self, proto: &FunctionProto) -> ScriptResult<String> {
        let bytes = super::dump(proto)?;
        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        let key = hex::encode(hasher.finalize());
        let mut chunks = self.chunks.write().map_err(|_| poisoned())?;
        chunks.insert(key.clone(), bytes.into());
        Ok(key)
    }

    /// Raw dump stored under `fingerprint`
    pub fn get_bytes(&self, fingerprint: &str) -> ScriptResult<Option<Arc<[u8]>>> {
        let chunks = self.chunks.read().map_err(|_| poisoned())?;
        Ok(chunks.get(fingerprint).cloned())
    }

    /// Undump the chunk stored under `fingerprint`
    pub fn get(&self, fingerprint: &str) -> ScriptResult<Option<FunctionProto>> {
        match self.get_bytes(fingerprint)? {
            Some(bytes) => super::undump(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, fingerprint: &str) -> ScriptResult<bool> {
        let chunks = self.chunks.read().map_err(|_| poisoned())?;
        Ok(chunks.contains_key(fingerprint))
    }

    pub fn len(&self) -> ScriptResult<usize> {
        let chunks = self.chunks.read().map_err(|_| poisoned())?;
        Ok(chunks.len())
    }

    pub fn clear(&self) -> ScriptResult<()> {
        let mut chunks = self.chunks.write().map_err(|_| poisoned())?;
        chunks.clear();
        Ok(())
    }
}

impl Default for BytecodeCache {
    fn default() -> Self {
        Self::new()
    }
}

// Clones share the same store
impl Clone for BytecodeCache {
    fn clone(&self) -> Self {
        BytecodeCache {
            chunks: Arc::clone(&self.chunks),
        }
    }
}

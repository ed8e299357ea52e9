use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::input::Embedding;

/// Identifier assigned to a registered LoRA adapter.
pub type LoraId = u64;

#[derive(Debug)]
struct AdapterEntry {
    id: LoraId,
    weights: Embedding,
    reader_count: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    adapters: HashMap<String, AdapterEntry>,
    next_id: LoraId,
}

/// Registry of LoRA adapters with multi-reader / exclusive-writer access.
///
/// Readers (`read_acquire` / `read_release`) never block each other. Writer
/// operations (`load` / `unload`) are serialized against one another and
/// wait until the affected adapter's reader count drops to zero, so weights
/// are never swapped out from under an in-flight stream.
#[derive(Debug, Default)]
pub struct LoraRegistry {
    state: Mutex<RegistryState>,
    /// Serializes writers against each other.
    writer_lock: AsyncMutex<()>,
    /// Signalled whenever an adapter's reader count reaches zero.
    drained: Notify,
}

impl LoraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().expect("lora registry lock poisoned")
    }

    /// Pin the named adapter for reading and return its id.
    ///
    /// Must be paired with exactly one [`Self::read_release`].
    pub fn read_acquire(&self, name: &str) -> Result<LoraId, EngineError> {
        let mut state = self.lock_state();
        let entry = state
            .adapters
            .get_mut(name)
            .ok_or_else(|| EngineError::AdapterNotFound {
                name: name.to_owned(),
            })?;
        entry.reader_count += 1;
        Ok(entry.id)
    }

    /// Drop one read pin on the named adapter.
    pub fn read_release(&self, name: &str) {
        let mut state = self.lock_state();
        let Some(entry) = state.adapters.get_mut(name) else {
            debug_assert!(false, "read_release of unknown adapter {name}");
            return;
        };
        debug_assert!(entry.reader_count > 0, "unpaired read_release for {name}");
        entry.reader_count = entry.reader_count.saturating_sub(1);
        if entry.reader_count == 0 {
            self.drained.notify_waiters();
        }
    }

    pub fn get_id(&self, name: &str) -> Option<LoraId> {
        self.lock_state().adapters.get(name).map(|e| e.id)
    }

    /// Current reader count for the named adapter (0 if unknown).
    pub fn reader_count(&self, name: &str) -> usize {
        self.lock_state()
            .adapters
            .get(name)
            .map_or(0, |e| e.reader_count)
    }

    /// Load (or replace) the named adapter's weights.
    ///
    /// Waits until no stream holds a read pin on the adapter. A replaced
    /// adapter keeps its id; a fresh name is assigned the next one.
    pub async fn load(&self, name: &str, weights: Embedding) -> LoraId {
        let _writer = self.writer_lock.lock().await;
        let mut notified = std::pin::pin!(self.drained.notified());
        loop {
            // Register interest before inspecting the reader count so a
            // release landing in between is not lost.
            notified.as_mut().enable();
            {
                let mut state = self.lock_state();
                let drained = state
                    .adapters
                    .get(name)
                    .is_none_or(|e| e.reader_count == 0);
                if drained {
                    let id = match state.adapters.get(name) {
                        Some(existing) => existing.id,
                        None => {
                            let id = state.next_id;
                            state.next_id += 1;
                            id
                        }
                    };
                    state.adapters.insert(
                        name.to_owned(),
                        AdapterEntry {
                            id,
                            weights,
                            reader_count: 0,
                        },
                    );
                    info!(adapter = name, lora_id = id, "lora adapter loaded");
                    return id;
                }
            }
            debug!(adapter = name, "load waiting for readers to drain");
            notified.as_mut().await;
            notified.set(self.drained.notified());
        }
    }

    /// Remove the named adapter once its readers have drained.
    pub async fn unload(&self, name: &str) -> Result<(), EngineError> {
        let _writer = self.writer_lock.lock().await;
        let mut notified = std::pin::pin!(self.drained.notified());
        loop {
            notified.as_mut().enable();
            {
                let mut state = self.lock_state();
                match state.adapters.get(name) {
                    None => {
                        return Err(EngineError::AdapterNotFound {
                            name: name.to_owned(),
                        });
                    }
                    Some(entry) if entry.reader_count == 0 => {
                        state.adapters.remove(name);
                        info!(adapter = name, "lora adapter unloaded");
                        return Ok(());
                    }
                    Some(_) => {}
                }
            }
            notified.as_mut().await;
            notified.set(self.drained.notified());
        }
    }

    /// Weights of the named adapter, if registered. Used by executors.
    pub fn weights(&self, name: &str) -> Option<Embedding> {
        self.lock_state()
            .adapters
            .get(name)
            .map(|e| Arc::clone(&e.weights))
    }
}

/// Scoped read pin on a LoRA adapter.
///
/// Acquired when a request names an adapter; the engine hands the release
/// to the stream's destructor list so the pin is dropped on every exit path.
#[derive(Debug)]
pub struct LoraHolder {
    registry: Arc<LoraRegistry>,
    name: String,
    lora_id: LoraId,
}

impl LoraHolder {
    pub fn acquire(registry: Arc<LoraRegistry>, name: &str) -> Result<Self, EngineError> {
        let lora_id = registry.read_acquire(name)?;
        Ok(Self {
            registry,
            name: name.to_owned(),
            lora_id,
        })
    }

    pub fn lora_id(&self) -> LoraId {
        self.lora_id
    }

    /// Release the read pin. Consumes the holder so the pair is enforced
    /// by the type system.
    pub fn release(self) {
        self.registry.read_release(&self.name);
    }
}

//! Decided-certificate storage.
//!
//! The engine consumes an abstract store; production nodes back it with a
//! persistent key-value database. [`InMemoryStore`] serves tests and light
//! setups. Implementations must serialize writes per identifier.

use crate::instance::InstanceState;
use dvq_messages::SignedMessage;
use dvq_types::{Height, MessageId, OperatorId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage unreachable: {0}")]
    Unreachable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// A persisted instance: the state snapshot plus its decided certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredInstance {
    pub state: InstanceState,
    pub decided_message: SignedMessage,
}

impl StoredInstance {
    pub fn height(&self) -> Height {
        self.state.height
    }
}

/// Abstract store for decided certificates and instance checkpoints.
pub trait QbftStore: Send + Sync {
    /// Persist a historical decided instance.
    fn save_instance(&self, instance: &StoredInstance) -> Result<(), StorageError>;

    /// Persist the highest decided instance for its identifier. For a given
    /// identifier at most one highest record exists.
    fn save_highest_instance(&self, instance: &StoredInstance) -> Result<(), StorageError>;

    /// The highest decided instance, if any.
    fn get_highest_instance(
        &self,
        identifier: &MessageId,
    ) -> Result<Option<StoredInstance>, StorageError>;

    /// Every persisted historical record in `[from, to]`, ascending by height.
    fn get_instances_in_range(
        &self,
        identifier: &MessageId,
        from: Height,
        to: Height,
    ) -> Result<Vec<StoredInstance>, StorageError>;

    /// Drop everything stored for an identifier.
    fn clean_all_instances(&self, identifier: &MessageId) -> Result<(), StorageError>;

    /// Checkpoint a running instance's state (taken after reaching Prepare).
    fn save_current_instance(
        &self,
        identifier: &MessageId,
        state: &InstanceState,
    ) -> Result<(), StorageError>;

    /// Record the latest round-change seen from a signer (legacy fork only).
    fn save_last_change_round(&self, msg: &SignedMessage) -> Result<(), StorageError>;

    /// The last round-change per signer for an identifier.
    fn get_last_change_round(
        &self,
        identifier: &MessageId,
    ) -> Result<Vec<SignedMessage>, StorageError>;

    /// Drop stored round-change messages for an identifier.
    fn clean_last_change_round(&self, identifier: &MessageId) -> Result<(), StorageError>;
}

#[derive(Default)]
struct StoreInner {
    history: HashMap<MessageId, BTreeMap<u64, StoredInstance>>,
    highest: HashMap<MessageId, StoredInstance>,
    current: HashMap<MessageId, InstanceState>,
    change_rounds: HashMap<MessageId, HashMap<OperatorId, SignedMessage>>,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryStore {
    pub fn new() -> InMemoryStore {
        InMemoryStore::default()
    }
}

impl QbftStore for InMemoryStore {
    fn save_instance(&self, instance: &StoredInstance) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner
            .history
            .entry(instance.state.identifier)
            .or_default()
            .insert(instance.height().0, instance.clone());
        Ok(())
    }

    fn save_highest_instance(&self, instance: &StoredInstance) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner
            .highest
            .insert(instance.state.identifier, instance.clone());
        Ok(())
    }

    fn get_highest_instance(
        &self,
        identifier: &MessageId,
    ) -> Result<Option<StoredInstance>, StorageError> {
        Ok(self.inner.lock().highest.get(identifier).cloned())
    }

    fn get_instances_in_range(
        &self,
        identifier: &MessageId,
        from: Height,
        to: Height,
    ) -> Result<Vec<StoredInstance>, StorageError> {
        let inner = self.inner.lock();
        let Some(history) = inner.history.get(identifier) else {
            return Ok(vec![]);
        };
        Ok(history
            .range(from.0..=to.0)
            .map(|(_, si)| si.clone())
            .collect())
    }

    fn clean_all_instances(&self, identifier: &MessageId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.history.remove(identifier);
        inner.highest.remove(identifier);
        inner.current.remove(identifier);
        Ok(())
    }

    fn save_current_instance(
        &self,
        identifier: &MessageId,
        state: &InstanceState,
    ) -> Result<(), StorageError> {
        self.inner.lock().current.insert(*identifier, state.clone());
        Ok(())
    }

    fn save_last_change_round(&self, msg: &SignedMessage) -> Result<(), StorageError> {
        let signer = *msg
            .signers
            .first()
            .ok_or_else(|| StorageError::Corrupt("round change without signer".into()))?;
        let mut inner = self.inner.lock();
        inner
            .change_rounds
            .entry(msg.message.identifier)
            .or_default()
            .insert(signer, msg.clone());
        Ok(())
    }

    fn get_last_change_round(
        &self,
        identifier: &MessageId,
    ) -> Result<Vec<SignedMessage>, StorageError> {
        let inner = self.inner.lock();
        let mut msgs: Vec<SignedMessage> = inner
            .change_rounds
            .get(identifier)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        msgs.sort_by_key(|m| m.signers.first().copied());
        Ok(msgs)
    }

    fn clean_last_change_round(&self, identifier: &MessageId) -> Result<(), StorageError> {
        self.inner.lock().change_rounds.remove(identifier);
        Ok(())
    }
}

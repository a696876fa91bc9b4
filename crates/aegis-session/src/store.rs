//! Session store: the single owner of settings, investigations and the
//! transient chat session.
//!
//! Only `settings`, `investigations` and `schemaVersion` reach storage. The
//! message log, streaming flags and current investigation live in memory and
//! start from their defaults on every load, so a restart can never leave the
//! panel stuck in a "busy" state.

use std::collections::HashSet;

use aegis_core::{
    AgentStatus, Investigation, InvestigationId, InvestigationStatus, Message, MessageId,
    ModelError, NewMessage, RunTicket, SessionSnapshot, Settings, SettingsPatch, Settlement,
    StatusEvent, StatusFeed, StorageArea, StorageError, StorageKeys, StorageMap, StreamingError,
    StreamingMachine, status_feed::DEFAULT_HISTORY_LEN,
};
use serde::de::Error as _;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

/// Storage key for [`Settings`].
pub const SETTINGS_KEY: &str = "settings";
/// Storage key for the investigation list.
pub const INVESTIGATIONS_KEY: &str = "investigations";
/// Storage key for the persisted schema version.
pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";
/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Session fields that never reach storage.
pub const TRANSIENT_KEYS: [&str; 4] = [
    "messages",
    "isStreaming",
    "agentStatus",
    "currentInvestigation",
];

/// Session store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Invalid value for `{key}`: {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{0}` is transient session state and cannot be persisted")]
    TransientKey(String),
    #[error("Investigation not found: {0}")]
    InvestigationNotFound(InvestigationId),
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Streaming(#[from] StreamingError),
}

impl StoreError {
    fn invalid(key: &str, source: serde_json::Error) -> Self {
        Self::InvalidValue {
            key: key.to_owned(),
            source,
        }
    }
}

/// Merge `patch` into `target`: objects merge key by key, anything else
/// replaces.
pub fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Investigation ids, and message ids across every investigation, must be
/// unique.
fn check_unique_ids(list: &[Investigation]) -> Result<(), serde_json::Error> {
    let mut investigations = HashSet::new();
    let mut messages = HashSet::new();
    for investigation in list {
        if !investigations.insert(investigation.id) {
            return Err(serde_json::Error::custom(format!(
                "duplicate investigation id {}",
                investigation.id
            )));
        }
        for message in &investigation.messages {
            if !messages.insert(message.id) {
                return Err(serde_json::Error::custom(format!(
                    "duplicate message id {}",
                    message.id
                )));
            }
        }
    }
    Ok(())
}

struct Inner {
    settings: Settings,
    investigations: Vec<Investigation>,
    messages: Vec<Message>,
    current_investigation: Option<InvestigationId>,
    machine: StreamingMachine,
}

impl Inner {
    fn investigation_mut(&mut self, id: InvestigationId) -> Result<&mut Investigation, StoreError> {
        self.investigations
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StoreError::InvestigationNotFound(id))
    }

    fn message_mut(&mut self, id: MessageId) -> Result<&mut Message, StoreError> {
        self.messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::MessageNotFound(id))
    }
}

/// State-owning session service.
///
/// Every mutation happens under one lock and persists before the lock is
/// released, so storage sees writes in mutation order. Writes are
/// last-writer-wins per key.
pub struct SessionStore<S: StorageArea> {
    storage: S,
    inner: Mutex<Inner>,
    feed: StatusFeed,
}

impl<S: StorageArea> SessionStore<S> {
    /// Load persisted state from `storage`; transient state starts fresh.
    ///
    /// # Errors
    /// Returns error if storage cannot be read or holds invalid settings or
    /// investigations.
    pub async fn load(storage: S) -> Result<Self, StoreError> {
        Self::load_with_history(storage, DEFAULT_HISTORY_LEN).await
    }

    /// Like [`load`](Self::load) with a custom status-feed history length.
    ///
    /// # Errors
    /// Returns error if storage cannot be read or holds invalid data.
    pub async fn load_with_history(storage: S, history: usize) -> Result<Self, StoreError> {
        let mut stored = storage
            .get(&StorageKeys::many([SETTINGS_KEY, INVESTIGATIONS_KEY]))
            .await?;

        let settings = match stored.remove(SETTINGS_KEY) {
            Some(value) => {
                serde_json::from_value(value).map_err(|e| StoreError::invalid(SETTINGS_KEY, e))?
            }
            None => Settings::default(),
        };
        let investigations: Vec<Investigation> = match stored.remove(INVESTIGATIONS_KEY) {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| StoreError::invalid(INVESTIGATIONS_KEY, e))?,
            None => Vec::new(),
        };

        tracing::info!(
            investigations = investigations.len(),
            "session store loaded; transient state reset to idle"
        );

        Ok(Self {
            storage,
            inner: Mutex::new(Inner {
                settings,
                investigations,
                messages: Vec::new(),
                current_investigation: None,
                machine: StreamingMachine::new(),
            }),
            feed: StatusFeed::with_history(history),
        })
    }

    /// Underlying storage area.
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Status feed for subscribers.
    pub const fn feed(&self) -> &StatusFeed {
        &self.feed
    }

    /// History-then-live stream of session changes.
    pub fn subscribe(&self) -> futures::stream::BoxStream<'static, StatusEvent> {
        self.feed.history_plus_stream()
    }

    async fn persist(
        &self,
        settings: &Settings,
        investigations: &[Investigation],
    ) -> Result<(), StoreError> {
        let mut items = StorageMap::new();
        items.insert(
            SETTINGS_KEY.to_owned(),
            serde_json::to_value(settings).map_err(StorageError::from)?,
        );
        items.insert(
            INVESTIGATIONS_KEY.to_owned(),
            serde_json::to_value(investigations).map_err(StorageError::from)?,
        );
        items.insert(SCHEMA_VERSION_KEY.to_owned(), SCHEMA_VERSION.into());

        self.storage.set(items).await.map_err(|e| {
            tracing::error!("failed to persist session state: {e}");
            StoreError::from(e)
        })
    }

    // -----------------------------------------------------------------------
    // Raw key-value access
    // -----------------------------------------------------------------------

    /// Read stored values. Unknown keys are absent, never an error.
    ///
    /// Waits for any write in progress, so a read never overtakes it.
    ///
    /// # Errors
    /// Returns error only if the storage area itself fails.
    pub async fn get(&self, keys: &StorageKeys) -> Result<StorageMap, StoreError> {
        if keys.is_empty() {
            return Ok(StorageMap::new());
        }
        let _inner = self.inner.lock().await;
        Ok(self.storage.get(keys).await?)
    }

    /// Shallow top-level write; `settings` merges field by field.
    ///
    /// Everything is merged and validated first, then written in one call.
    /// On failure neither storage nor the in-memory state changes.
    ///
    /// # Errors
    /// Returns error for transient keys, invalid `settings`/`investigations`
    /// values, or storage failures such as an exceeded quota.
    pub async fn set(&self, partial: StorageMap) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        let mut writes = StorageMap::new();
        let mut new_settings = None;
        let mut new_investigations = None;

        for (key, value) in partial {
            match key.as_str() {
                SETTINGS_KEY => {
                    let mut merged =
                        serde_json::to_value(&inner.settings).map_err(StorageError::from)?;
                    merge_json(&mut merged, value);
                    let settings: Settings = serde_json::from_value(merged)
                        .map_err(|e| StoreError::invalid(SETTINGS_KEY, e))?;
                    let value = serde_json::to_value(&settings).map_err(StorageError::from)?;
                    writes.insert(key, value);
                    new_settings = Some(settings);
                }
                INVESTIGATIONS_KEY => {
                    let list: Vec<Investigation> = serde_json::from_value(value.clone())
                        .map_err(|e| StoreError::invalid(INVESTIGATIONS_KEY, e))?;
                    check_unique_ids(&list)
                        .map_err(|e| StoreError::invalid(INVESTIGATIONS_KEY, e))?;
                    writes.insert(key, value);
                    new_investigations = Some(list);
                }
                k if TRANSIENT_KEYS.contains(&k) => {
                    tracing::warn!(key = k, "rejected write of transient session key");
                    return Err(StoreError::TransientKey(k.to_owned()));
                }
                _ => {
                    writes.insert(key, value);
                }
            }
        }

        if writes.is_empty() {
            return Ok(());
        }

        let keys: Vec<&String> = writes.keys().collect();
        tracing::debug!(?keys, "writing storage");
        self.storage.set(writes).await?;

        if let Some(settings) = new_settings {
            inner.settings = settings;
            self.feed.push(StatusEvent::SettingsUpdated);
        }
        if let Some(list) = new_investigations {
            inner.investigations = list;
            let current_gone = inner
                .current_investigation
                .is_some_and(|id| !inner.investigations.iter().any(|i| i.id == id));
            if current_gone {
                inner.current_investigation = None;
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub async fn settings(&self) -> Settings {
        self.inner.lock().await.settings.clone()
    }

    /// Merge a partial settings update.
    ///
    /// # Errors
    /// Returns error if the merged settings cannot be persisted.
    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<Settings, StoreError> {
        let value = serde_json::to_value(&patch).map_err(StorageError::from)?;
        let mut partial = StorageMap::new();
        partial.insert(SETTINGS_KEY.to_owned(), value);
        self.set(partial).await?;
        Ok(self.settings().await)
    }

    /// Overwrite settings wholesale. Used by the install/update lifecycle.
    ///
    /// # Errors
    /// Returns error if the settings cannot be persisted.
    pub async fn replace_settings(&self, settings: Settings) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        self.persist(&settings, &inner.investigations).await?;
        inner.settings = settings;
        self.feed.push(StatusEvent::SettingsUpdated);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transient message log
    // -----------------------------------------------------------------------

    async fn push_message(
        &self,
        inner: &mut Inner,
        new: NewMessage,
    ) -> Result<Message, StoreError> {
        self.persist(&inner.settings, &inner.investigations).await?;

        let message = Message::from_new(new);
        inner.messages.push(message.clone());
        self.feed.push(StatusEvent::MessageAdded {
            message: message.clone(),
        });
        Ok(message)
    }

    /// Append to the chat log with a fresh id (and timestamp if absent).
    ///
    /// # Errors
    /// Returns error if persisting the durable state fails; the log is then
    /// left unchanged.
    pub async fn add_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let mut inner = self.inner.lock().await;
        self.push_message(&mut inner, new).await
    }

    /// Append a chunk to a message that is still streaming.
    ///
    /// # Errors
    /// Returns error if the message is unknown or already final.
    pub async fn append_to_message(&self, id: MessageId, chunk: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let message = inner.message_mut(id)?;
        message.append(chunk)?;
        self.feed.push(StatusEvent::MessageUpdated {
            id,
            content: message.content().to_owned(),
            is_streaming: true,
        });
        Ok(())
    }

    /// Freeze a streaming message. Idempotent.
    ///
    /// # Errors
    /// Returns error if the message is unknown.
    pub async fn finish_message(&self, id: MessageId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let message = inner.message_mut(id)?;
        if message.is_streaming() {
            message.finish();
            self.feed.push(StatusEvent::MessageUpdated {
                id,
                content: message.content().to_owned(),
                is_streaming: false,
            });
        }
        Ok(())
    }

    /// Empty the chat log. Investigations are untouched.
    pub async fn clear_messages(&self) {
        self.inner.lock().await.messages.clear();
        self.feed.push(StatusEvent::MessagesCleared);
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    /// Transient session view for UI contexts.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            messages: inner.messages.clone(),
            is_streaming: inner.machine.is_streaming(),
            agent_status: inner.machine.status(),
            current_investigation: inner.current_investigation,
        }
    }

    // -----------------------------------------------------------------------
    // Investigations
    // -----------------------------------------------------------------------

    /// Start a new active investigation and make it current.
    ///
    /// # Errors
    /// Returns error if the updated list cannot be persisted.
    pub async fn create_investigation(
        &self,
        target: impl Into<String>,
    ) -> Result<Investigation, StoreError> {
        let mut inner = self.inner.lock().await;
        let investigation = Investigation::new(target);

        let mut list = inner.investigations.clone();
        list.push(investigation.clone());
        self.persist(&inner.settings, &list).await?;

        inner.investigations = list;
        inner.current_investigation = Some(investigation.id);

        tracing::info!(id = %investigation.id, "investigation created");
        self.feed.push(StatusEvent::InvestigationCreated {
            id: investigation.id,
            target: investigation.target.clone(),
        });
        Ok(investigation)
    }

    /// All investigations in creation order.
    pub async fn investigations(&self) -> Vec<Investigation> {
        self.inner.lock().await.investigations.clone()
    }

    pub async fn current_investigation(&self) -> Option<Investigation> {
        let inner = self.inner.lock().await;
        let id = inner.current_investigation?;
        inner.investigations.iter().find(|i| i.id == id).cloned()
    }

    /// Make an existing investigation current.
    ///
    /// # Errors
    /// Returns error if no investigation has that id.
    pub async fn select_investigation(
        &self,
        id: InvestigationId,
    ) -> Result<Investigation, StoreError> {
        let mut inner = self.inner.lock().await;
        let investigation = inner.investigation_mut(id)?.clone();
        inner.current_investigation = Some(id);
        Ok(investigation)
    }

    /// Move an investigation along its lifecycle.
    ///
    /// # Errors
    /// Returns error if the id is unknown, the transition is illegal, or
    /// persisting fails.
    pub async fn update_investigation_status(
        &self,
        id: InvestigationId,
        status: InvestigationStatus,
    ) -> Result<Investigation, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut list = inner.investigations.clone();
        let investigation = list
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StoreError::InvestigationNotFound(id))?;
        investigation.transition_to(status)?;
        let updated = investigation.clone();

        self.persist(&inner.settings, &list).await?;
        inner.investigations = list;

        self.feed.push(StatusEvent::InvestigationUpdated { id, status });
        Ok(updated)
    }

    /// Append to an investigation's own history.
    ///
    /// # Errors
    /// Returns error if the id is unknown or persisting fails.
    pub async fn add_investigation_message(
        &self,
        id: InvestigationId,
        new: NewMessage,
    ) -> Result<Message, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut list = inner.investigations.clone();
        let investigation = list
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StoreError::InvestigationNotFound(id))?;
        let message = Message::from_new(new);
        investigation.push_message(message.clone());

        self.persist(&inner.settings, &list).await?;
        inner.investigations = list;
        Ok(message)
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    pub async fn agent_status(&self) -> AgentStatus {
        self.inner.lock().await.machine.status()
    }

    pub async fn is_streaming(&self) -> bool {
        self.inner.lock().await.machine.is_streaming()
    }

    fn publish_status(&self, machine: &StreamingMachine) {
        self.feed.push(StatusEvent::StatusChanged {
            status: machine.status(),
            generation: machine.generation(),
        });
    }

    /// Log the user's message and start a run.
    ///
    /// # Errors
    /// Returns [`StreamingError::Busy`] while a run is in progress, without
    /// touching the log; or a storage error.
    pub async fn submit_request(
        &self,
        new: NewMessage,
    ) -> Result<(RunTicket, Message), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.machine.is_streaming() {
            tracing::warn!(status = %inner.machine.status(), "rejected submission while streaming");
            return Err(StreamingError::Busy(inner.machine.status()).into());
        }

        let message = self.push_message(&mut inner, new).await?;
        let ticket = inner.machine.submit()?;
        tracing::debug!(generation = %ticket.generation(), "run started");
        self.publish_status(&inner.machine);

        Ok((ticket, message))
    }

    /// Move the run to another busy phase. Stale tickets are ignored.
    ///
    /// # Errors
    /// Returns error if `phase` is `idle`.
    pub async fn report_phase(
        &self,
        ticket: RunTicket,
        phase: AgentStatus,
    ) -> Result<Settlement, StoreError> {
        let mut inner = self.inner.lock().await;
        let settlement = inner.machine.advance(ticket, phase)?;
        if settlement.is_applied() {
            self.publish_status(&inner.machine);
        } else {
            tracing::debug!(
                generation = %ticket.generation(),
                %phase,
                "dropped stale phase report"
            );
        }
        Ok(settlement)
    }

    /// Deliver the agent's reply. Returns `None` if the run was cancelled or
    /// superseded, in which case nothing is logged.
    ///
    /// # Errors
    /// Returns a storage error if logging the reply fails; the run still
    /// ends.
    pub async fn complete_request(
        &self,
        ticket: RunTicket,
        reply: impl Into<String>,
    ) -> Result<Option<Message>, StoreError> {
        self.settle_run(ticket, NewMessage::agent(reply)).await
    }

    /// End the run with a system message describing the failure.
    ///
    /// # Errors
    /// Returns a storage error if logging fails; the run still ends.
    pub async fn fail_request(
        &self,
        ticket: RunTicket,
        reason: impl Into<String>,
    ) -> Result<Option<Message>, StoreError> {
        self.settle_run(ticket, NewMessage::system(reason)).await
    }

    async fn settle_run(
        &self,
        ticket: RunTicket,
        new: NewMessage,
    ) -> Result<Option<Message>, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.machine.is_current(ticket) {
            tracing::debug!(generation = %ticket.generation(), "discarded stale result");
            return Ok(None);
        }

        let logged = self.push_message(&mut inner, new).await;
        inner.machine.complete(ticket);
        self.publish_status(&inner.machine);

        logged.map(Some)
    }

    /// Cancel the run in progress. No-op (returns `false`) when idle.
    ///
    /// Messages still streaming are frozen as they stand.
    pub async fn cancel_request(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.machine.cancel() {
            return false;
        }

        for message in inner.messages.iter_mut().filter(|m| m.is_streaming()) {
            message.finish();
            self.feed.push(StatusEvent::MessageUpdated {
                id: message.id,
                content: message.content().to_owned(),
                is_streaming: false,
            });
        }

        tracing::info!(generation = %inner.machine.generation(), "run cancelled");
        self.publish_status(&inner.machine);
        true
    }
}

#[cfg(test)]
mod tests {
    use aegis_core::{ApiKey, Role, Theme};
    use serde_json::json;

    use super::*;
    use crate::storage::MemoryStorage;

    async fn store() -> SessionStore<MemoryStorage> {
        SessionStore::load(MemoryStorage::new()).await.unwrap()
    }

    fn partial(value: Value) -> StorageMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_merge_json_nested() {
        let mut target = json!({ "a": { "x": 1, "y": 2 }, "b": 1 });
        merge_json(&mut target, json!({ "a": { "y": 3 }, "c": [1] }));
        assert_eq!(target, json!({ "a": { "x": 1, "y": 3 }, "b": 1, "c": [1] }));
    }

    #[tokio::test]
    async fn test_messages_keep_order_and_unique_ids() {
        let store = store().await;
        for i in 0..50 {
            store.add_message(NewMessage::user(format!("m{i}"))).await.unwrap();
        }

        let messages = store.messages().await;
        let contents: Vec<_> = messages.iter().map(Message::content).collect();
        let expected: Vec<_> = (0..50).map(|i| format!("m{i}")).collect();
        assert_eq!(contents, expected);

        let ids: HashSet<_> = messages.iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 50);
    }

    #[tokio::test]
    async fn test_add_message_persists_durable_subset() {
        let store = store().await;
        store.add_message(NewMessage::user("hello")).await.unwrap();

        let stored = store.storage().dump().unwrap();
        assert!(stored.contains_key(SETTINGS_KEY));
        assert!(stored.contains_key(INVESTIGATIONS_KEY));
        assert_eq!(stored[SCHEMA_VERSION_KEY], json!(SCHEMA_VERSION));
        assert!(!stored.contains_key("messages"));
    }

    #[tokio::test]
    async fn test_partial_settings_keep_api_keys() {
        let store = store().await;
        store
            .update_settings(SettingsPatch::api_key("gemini", ApiKey::new("g-key")))
            .await
            .unwrap();

        store
            .set(partial(json!({ "settings": { "theme": "light" } })))
            .await
            .unwrap();

        let got = store.get(&StorageKeys::from("settings")).await.unwrap();
        assert_eq!(got["settings"]["theme"], "light");
        assert_eq!(got["settings"]["apiKeys"]["gemini"], "g-key");
        assert_eq!(got["settings"]["stealth"]["userAgentRotation"], true);
        assert_eq!(store.settings().await.theme, Theme::Light);
    }

    #[tokio::test]
    async fn test_get_unknown_and_empty_keys() {
        let store = store().await;
        let got = store.get(&StorageKeys::from("nonexistent")).await.unwrap();
        assert!(!got.contains_key("nonexistent"));

        let none = store.get(&StorageKeys::many(Vec::<String>::new())).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_set_rejects_transient_keys_without_writing() {
        let store = store().await;
        let err = store
            .set(partial(json!({ "custom": 1, "isStreaming": true })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TransientKey(k) if k == "isStreaming"));
        assert!(store.storage().dump().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_rejects_colliding_ids() {
        let store = store().await;
        let inv = Investigation::new("John Doe");

        let twice = serde_json::to_value(vec![inv.clone(), inv.clone()]).unwrap();
        let err = store
            .set(partial(json!({ "investigations": twice })))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidValue { ref key, .. } if key == INVESTIGATIONS_KEY
        ));

        let mut first = inv.clone();
        let mut second = Investigation::new("Alice");
        let shared = Message::from_new(NewMessage::user("lead"));
        first.push_message(shared.clone());
        second.push_message(shared);
        let clash = serde_json::to_value(vec![first, second]).unwrap();
        let err = store
            .set(partial(json!({ "investigations": clash })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue { .. }));

        assert!(store.investigations().await.is_empty());
        assert!(store.storage().dump().unwrap().is_empty());

        store
            .set(partial(json!({ "investigations": [inv] })))
            .await
            .unwrap();
        assert_eq!(store.investigations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_set_rejects_invalid_settings() {
        let store = store().await;
        let err = store
            .set(partial(json!({ "settings": { "theme": "neon" } })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue { ref key, .. } if key == "settings"));
        assert_eq!(store.settings().await.theme, Theme::Dark);
    }

    #[tokio::test]
    async fn test_quota_failure_is_reported_and_nothing_changes() {
        let store = SessionStore::load(MemoryStorage::with_quota(Some(300))).await.unwrap();
        store
            .update_settings(SettingsPatch::theme(Theme::Light))
            .await
            .unwrap();

        let huge = "x".repeat(1024);
        let err = store
            .set(partial(json!({ "settings": { "theme": "dark" }, "blob": huge })))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::Storage(StorageError::QuotaExceeded { .. })
        ));
        assert_eq!(store.settings().await.theme, Theme::Light);
        let stored = store.storage().dump().unwrap();
        assert_eq!(stored["settings"]["theme"], "light");
        assert!(!stored.contains_key("blob"));
    }

    #[tokio::test]
    async fn test_create_investigation_becomes_current() {
        let store = store().await;
        let first = store.create_investigation("Alice").await.unwrap();
        let second = store.create_investigation("John Doe").await.unwrap();

        assert_eq!(second.status, InvestigationStatus::Active);
        assert!(second.messages.is_empty());
        assert_eq!(second.created_at, second.updated_at);
        assert_eq!(store.current_investigation().await.unwrap().id, second.id);

        let ids: Vec<_> = store.investigations().await.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_investigation_status_and_messages() {
        let store = store().await;
        let inv = store.create_investigation("target").await.unwrap();

        let paused = store
            .update_investigation_status(inv.id, InvestigationStatus::Paused)
            .await
            .unwrap();
        assert_eq!(paused.status, InvestigationStatus::Paused);

        let msg = store
            .add_investigation_message(inv.id, NewMessage::user("lead"))
            .await
            .unwrap();
        assert_eq!(msg.role, Role::User);

        store
            .update_investigation_status(inv.id, InvestigationStatus::Completed)
            .await
            .unwrap();
        let err = store
            .update_investigation_status(inv.id, InvestigationStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Model(ModelError::InvalidTransition { .. })));

        let stored = store.investigations().await;
        assert_eq!(stored[0].messages.len(), 1);
        assert_eq!(stored[0].status, InvestigationStatus::Completed);
        // session log is independent
        assert!(store.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_investigation() {
        let store = store().await;
        let id = uuid::Uuid::new_v4();
        let err = store.select_investigation(id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvestigationNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn test_clear_messages_keeps_investigations() {
        let store = store().await;
        store.create_investigation("x").await.unwrap();
        store.add_message(NewMessage::user("a")).await.unwrap();

        store.clear_messages().await;
        assert!(store.messages().await.is_empty());
        assert_eq!(store.investigations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_while_streaming_is_rejected() {
        let store = store().await;
        let (_ticket, _) = store.submit_request(NewMessage::user("first")).await.unwrap();
        assert!(store.is_streaming().await);

        let err = store.submit_request(NewMessage::user("second")).await.unwrap_err();
        assert!(matches!(err, StoreError::Streaming(StreamingError::Busy(_))));
        assert_eq!(store.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_logs_reply_and_goes_idle() {
        let store = store().await;
        let (ticket, _) = store.submit_request(NewMessage::user("q")).await.unwrap();
        store.report_phase(ticket, AgentStatus::Searching).await.unwrap();
        assert_eq!(store.agent_status().await, AgentStatus::Searching);

        let reply = store.complete_request(ticket, "answer").await.unwrap().unwrap();
        assert_eq!(reply.role, Role::Agent);
        assert_eq!(store.agent_status().await, AgentStatus::Idle);
        assert_eq!(store.messages().await.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_drops_late_result() {
        let store = store().await;
        let (ticket, _) = store.submit_request(NewMessage::user("q")).await.unwrap();
        store.report_phase(ticket, AgentStatus::Searching).await.unwrap();

        assert!(store.cancel_request().await);
        assert_eq!(store.agent_status().await, AgentStatus::Idle);

        assert_eq!(
            store.report_phase(ticket, AgentStatus::Verifying).await.unwrap(),
            Settlement::Stale
        );
        assert!(store.complete_request(ticket, "late").await.unwrap().is_none());
        assert_eq!(store.messages().await.len(), 1);
        assert_eq!(store.agent_status().await, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let store = store().await;
        assert!(!store.cancel_request().await);
        assert_eq!(store.agent_status().await, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_cancel_freezes_streaming_messages() {
        let store = store().await;
        let (_ticket, _) = store.submit_request(NewMessage::user("q")).await.unwrap();
        let partial_reply = store
            .add_message(NewMessage::agent("par").streaming())
            .await
            .unwrap();
        store.append_to_message(partial_reply.id, "tial").await.unwrap();

        store.cancel_request().await;

        let err = store.append_to_message(partial_reply.id, "!").await.unwrap_err();
        assert!(matches!(err, StoreError::Model(ModelError::MessageFrozen(_))));
        let messages = store.messages().await;
        assert_eq!(messages[1].content(), "partial");
        assert!(!messages[1].is_streaming());
    }

    #[tokio::test]
    async fn test_reload_resets_transient_state() {
        let store = store().await;
        store.create_investigation("John Doe").await.unwrap();
        store
            .update_settings(SettingsPatch::theme(Theme::Light))
            .await
            .unwrap();
        let (_ticket, _) = store.submit_request(NewMessage::user("q")).await.unwrap();
        let before = store.storage().dump().unwrap();

        let reloaded = SessionStore::load(MemoryStorage::with_items(before.clone()))
            .await
            .unwrap();

        assert_eq!(reloaded.investigations().await, store.investigations().await);
        assert_eq!(reloaded.settings().await, store.settings().await);
        assert_eq!(reloaded.snapshot().await, SessionSnapshot::default());
        assert_eq!(
            serde_json::to_vec(&reloaded.storage().dump().unwrap()).unwrap(),
            serde_json::to_vec(&before).unwrap()
        );
    }

    #[tokio::test]
    async fn test_load_rejects_corrupt_investigations() {
        let mut items = StorageMap::new();
        items.insert(INVESTIGATIONS_KEY.into(), json!("not a list"));
        let err = SessionStore::load(MemoryStorage::with_items(items))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StoreError::InvalidValue { ref key, .. } if key == INVESTIGATIONS_KEY
        ));
    }

    #[tokio::test]
    async fn test_feed_sees_status_changes() {
        use futures::StreamExt;

        let store = store().await;
        let mut statuses = store.feed().status_stream();
        let (ticket, _) = store.submit_request(NewMessage::user("q")).await.unwrap();
        store.complete_request(ticket, "a").await.unwrap();

        assert_eq!(statuses.next().await, Some(AgentStatus::Thinking));
        assert_eq!(statuses.next().await, Some(AgentStatus::Idle));
    }
}

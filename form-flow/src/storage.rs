use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    answers::StepAnswers,
    error::{FlowError, Result},
    plan::StepPlan,
};

/// Key-value storage that survives restarts. Values are JSON strings.
#[async_trait]
pub trait FlowStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Everything the controller persists, as one plain value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub draft_id: Option<String>,
    pub current_step: u32,
    pub completed_steps: BTreeSet<u32>,
    pub step_answers: StepAnswers,
    pub prefill_answers: StepAnswers,
    pub saved_at: Option<DateTime<Utc>>,
}

impl FlowSnapshot {
    pub fn empty(first_step: u32) -> Self {
        Self {
            draft_id: None,
            current_step: first_step,
            completed_steps: BTreeSet::new(),
            step_answers: StepAnswers::new(),
            prefill_answers: StepAnswers::new(),
            saved_at: None,
        }
    }
}

/// Storage keys for one form, all sharing a namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub application_id: String,
    pub completed_steps: String,
    pub current_step: String,
    pub step_answers: String,
    pub prefill_answers: String,
    pub saved_at: String,
}

impl StorageKeys {
    pub fn new(namespace: &str) -> Self {
        let key = |name: &str| format!("{namespace}.{name}");
        Self {
            application_id: key("application_id"),
            completed_steps: key("completed_steps"),
            current_step: key("current_step"),
            step_answers: key("step_answers"),
            prefill_answers: key("prefill_answers"),
            saved_at: key("saved_at"),
        }
    }

    pub fn all(&self) -> [&str; 6] {
        [
            &self.application_id,
            &self.completed_steps,
            &self.current_step,
            &self.step_answers,
            &self.prefill_answers,
            &self.saved_at,
        ]
    }
}

/// Reads a snapshot, substituting defaults for missing or unreadable values
/// and dropping anything outside the plan.
pub async fn load_snapshot(
    storage: &dyn FlowStorage,
    keys: &StorageKeys,
    plan: &StepPlan,
) -> Result<FlowSnapshot> {
    let mut snapshot = FlowSnapshot::empty(plan.first_step());

    snapshot.draft_id = read_value::<String>(storage, &keys.application_id)
        .await?
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    if let Some(step) = read_value::<u32>(storage, &keys.current_step).await? {
        snapshot.current_step = plan.clamp(step);
    }

    if let Some(completed) = read_value::<BTreeSet<u32>>(storage, &keys.completed_steps).await? {
        snapshot.completed_steps = completed
            .into_iter()
            .filter(|step| plan.contains(*step))
            .collect();
    }

    let reachable = plan.furthest_reachable(snapshot.current_step, &snapshot.completed_steps);
    if reachable != snapshot.current_step {
        warn!(
            stored = snapshot.current_step,
            reachable, "stored step is locked, moving back"
        );
        snapshot.current_step = reachable;
    }

    if let Some(mut answers) = read_value::<StepAnswers>(storage, &keys.step_answers).await? {
        answers.retain(|step, _| plan.contains(*step));
        snapshot.step_answers = answers;
    }

    if let Some(mut prefill) = read_value::<StepAnswers>(storage, &keys.prefill_answers).await? {
        prefill.retain(|step, _| plan.contains(*step));
        snapshot.prefill_answers = prefill;
    }

    snapshot.saved_at = read_value::<DateTime<Utc>>(storage, &keys.saved_at).await?;

    Ok(snapshot)
}

/// Writes every tracked key from `snapshot`.
pub async fn persist_snapshot(
    storage: &dyn FlowStorage,
    keys: &StorageKeys,
    snapshot: &FlowSnapshot,
) -> Result<()> {
    match &snapshot.draft_id {
        Some(id) => storage.set(&keys.application_id, serde_json::to_string(id)?).await?,
        None => storage.remove(&keys.application_id).await?,
    }
    storage
        .set(&keys.current_step, serde_json::to_string(&snapshot.current_step)?)
        .await?;
    storage
        .set(
            &keys.completed_steps,
            serde_json::to_string(&snapshot.completed_steps)?,
        )
        .await?;
    storage
        .set(&keys.step_answers, serde_json::to_string(&snapshot.step_answers)?)
        .await?;
    storage
        .set(
            &keys.prefill_answers,
            serde_json::to_string(&snapshot.prefill_answers)?,
        )
        .await?;
    if let Some(saved_at) = &snapshot.saved_at {
        storage
            .set(&keys.saved_at, serde_json::to_string(saved_at)?)
            .await?;
    }
    debug!(
        draft_id = ?snapshot.draft_id,
        current_step = snapshot.current_step,
        "flow state persisted"
    );
    Ok(())
}

/// Removes every tracked key.
pub async fn purge(storage: &dyn FlowStorage, keys: &StorageKeys) -> Result<()> {
    for key in keys.all() {
        storage.remove(key).await?;
    }
    Ok(())
}

async fn read_value<T: DeserializeOwned>(
    storage: &dyn FlowStorage,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = storage.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(key, error = %e, "ignoring unreadable stored value");
            Ok(None)
        }
    }
}

/// In-memory implementation of FlowStorage
#[derive(Clone, Default)]
pub struct InMemoryFlowStorage {
    entries: Arc<DashMap<String, String>>,
}

impl InMemoryFlowStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl FlowStorage for InMemoryFlowStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// FlowStorage backed by a single JSON object on disk.
///
/// The whole object is rewritten through a temporary file and renamed into
/// place on every change, so a crash leaves either the old or the new file.
pub struct JsonFileFlowStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileFlowStorage {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "storage file unreadable, starting empty");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(FlowError::Storage(format!("{}: {}", path.display(), e)));
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let raw = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| FlowError::Storage(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| FlowError::Storage(format!("{}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl FlowStorage for JsonFileFlowStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.flush(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.flush(&entries).await?;
        }
        Ok(())
    }
}

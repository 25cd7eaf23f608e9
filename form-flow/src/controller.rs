//! FlowController – owns the state of one in-progress application form and keeps it in step
//! with the Application API and persistent storage.
//!
//! Every mutating operation follows the same shape: check preconditions, make at most one remote
//! call without holding the state lock, build the next snapshot as a copy, write it through
//! [`persist_snapshot`], and only then make it current. Failures never touch local state,
//! including a failed storage write.
//!
//! ## Wiring
//! ```rust,ignore
//! let controller = FlowController::load(
//!     FlowConfig::default(),
//!     Arc::new(HttpApplicationApi::new(&ApiConfig::from_env()?)?),
//!     Arc::new(JsonFileFlowStorage::open("flow.json").await?),
//! )
//! .await?;
//!
//! controller
//!     .submit_step(1, json!({ "given_name": "Ann" }), SubmitOptions::default())
//!     .await?;
//! ```
//!
//! One controller per editing session. Clones share state, so hand clones to whatever needs to
//! drive the same form.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    answers::merge_prefill,
    api::{ApplicationApi, extract_draft_id, into_outcome},
    config::FlowConfig,
    error::{FlowError, Result},
    plan::StepPlan,
    resume::{draft_id_from_url, with_draft_id, without_draft_id},
    storage::{FlowSnapshot, FlowStorage, StorageKeys, load_snapshot, persist_snapshot, purge},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Keep `current_step` where it is after a successful submission.
    pub skip_navigation: bool,
}

impl SubmitOptions {
    pub fn stay() -> Self {
        Self {
            skip_navigation: true,
        }
    }
}

/// Result of a step submission that reached the server successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// The step was saved and marked completed.
    Completed { step: u32, current_step: u32 },
    /// A newer submission for the same step, or a reset, happened while this
    /// one was in flight; its response was discarded.
    Superseded { step: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftStatus {
    None,
    /// A create call is in flight; the placeholder is local only.
    Pending { placeholder: String },
    Ready(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowProgress {
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
    pub is_complete: bool,
}

struct FlowState {
    snapshot: FlowSnapshot,
    pending_draft: Option<String>,
    /// Bumped on every reset so in-flight work started earlier is dropped.
    epoch: u64,
    next_generation: u64,
    latest_generation: HashMap<u32, u64>,
}

impl FlowState {
    fn clear(&mut self, first_step: u32) {
        self.snapshot = FlowSnapshot::empty(first_step);
        self.pending_draft = None;
        self.epoch += 1;
        self.latest_generation.clear();
    }
}

struct Inner {
    config: FlowConfig,
    plan: StepPlan,
    keys: StorageKeys,
    api: Arc<dyn ApplicationApi>,
    storage: Arc<dyn FlowStorage>,
    state: Mutex<FlowState>,
    /// Serializes draft creation across concurrent callers.
    draft_gate: tokio::sync::Mutex<()>,
    /// Serializes storage writes so the newest snapshot lands last.
    persist_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct FlowController {
    inner: Arc<Inner>,
}

impl FlowController {
    /// Builds a controller from whatever `storage` holds for the configured namespace.
    pub async fn load(
        config: FlowConfig,
        api: Arc<dyn ApplicationApi>,
        storage: Arc<dyn FlowStorage>,
    ) -> Result<Self> {
        Self::load_with_resume(config, api, storage, None).await
    }

    /// Like [`FlowController::load`], using the draft id from the resume query
    /// parameter of `url` when present.
    pub async fn load_from_url(
        config: FlowConfig,
        api: Arc<dyn ApplicationApi>,
        storage: Arc<dyn FlowStorage>,
        url: &Url,
    ) -> Result<Self> {
        let resume = draft_id_from_url(url, &config.resume_query_param);
        Self::load_with_resume(config, api, storage, resume.as_deref()).await
    }

    /// A resume id takes precedence over the stored one and is written back
    /// immediately. Progress stored for a different draft is dropped.
    pub async fn load_with_resume(
        config: FlowConfig,
        api: Arc<dyn ApplicationApi>,
        storage: Arc<dyn FlowStorage>,
        resume_draft_id: Option<&str>,
    ) -> Result<Self> {
        config.validate()?;
        let plan = StepPlan::from_config(&config);
        let keys = StorageKeys::new(&config.storage_namespace);
        let mut snapshot = load_snapshot(storage.as_ref(), &keys, &plan).await?;

        let resume = resume_draft_id.map(str::trim).filter(|id| !id.is_empty());
        if let Some(resume_id) = resume {
            match snapshot.draft_id.as_deref() {
                Some(stored) if stored == resume_id => {}
                Some(stored) => {
                    info!(stored, resumed = resume_id, "resume link points at another draft");
                    snapshot = FlowSnapshot::empty(plan.first_step());
                    snapshot.draft_id = Some(resume_id.to_string());
                }
                None => snapshot.draft_id = Some(resume_id.to_string()),
            }
            snapshot.saved_at = Some(Utc::now());
            persist_snapshot(storage.as_ref(), &keys, &snapshot).await?;
        }

        info!(
            draft_id = ?snapshot.draft_id,
            current_step = snapshot.current_step,
            completed = snapshot.completed_steps.len(),
            "form flow loaded"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                plan,
                keys,
                api,
                storage,
                state: Mutex::new(FlowState {
                    snapshot,
                    pending_draft: None,
                    epoch: 0,
                    next_generation: 0,
                    latest_generation: HashMap::new(),
                }),
                draft_gate: tokio::sync::Mutex::new(()),
                persist_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.inner.config
    }

    pub fn plan(&self) -> &StepPlan {
        &self.inner.plan
    }

    pub fn draft_id(&self) -> Option<String> {
        self.state().snapshot.draft_id.clone()
    }

    pub fn draft_status(&self) -> DraftStatus {
        let state = self.state();
        match (&state.snapshot.draft_id, &state.pending_draft) {
            (Some(id), _) => DraftStatus::Ready(id.clone()),
            (None, Some(placeholder)) => DraftStatus::Pending {
                placeholder: placeholder.clone(),
            },
            (None, None) => DraftStatus::None,
        }
    }

    pub fn current_step(&self) -> u32 {
        self.state().snapshot.current_step
    }

    pub fn completed_steps(&self) -> BTreeSet<u32> {
        self.state().snapshot.completed_steps.clone()
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        self.state().snapshot.clone()
    }

    pub fn step_answer(&self, step: u32) -> Option<Value> {
        self.state().snapshot.step_answers.get(step).cloned()
    }

    pub fn prefill_answer(&self, step: u32) -> Option<Value> {
        self.state().snapshot.prefill_answers.get(step).cloned()
    }

    /// The user's answer with any prefill layered underneath it.
    pub fn merged_answer(&self, step: u32) -> Option<Value> {
        let state = self.state();
        let user = state.snapshot.step_answers.get(step);
        let prefill = state.snapshot.prefill_answers.get(step);
        match (user, prefill) {
            (Some(user), Some(prefill)) => Some(merge_prefill(user, prefill)),
            (Some(only), None) | (None, Some(only)) => Some(only.clone()),
            (None, None) => None,
        }
    }

    pub fn progress(&self) -> FlowProgress {
        let plan = &self.inner.plan;
        let state = self.state();
        let completed = state.snapshot.completed_steps.len();
        let total = plan.step_count();
        FlowProgress {
            total,
            completed,
            remaining: total.saturating_sub(completed),
            is_complete: plan.is_complete(&state.snapshot.completed_steps),
        }
    }

    pub fn can_access_step(&self, target: u32) -> bool {
        self.inner
            .plan
            .can_access(target, &self.state().snapshot.completed_steps)
    }

    /// `url` rewritten to carry the current draft id (or none). Apply it with
    /// a history replace so reloads land on the same draft.
    pub fn canonical_url(&self, url: &Url) -> Url {
        let param = &self.inner.config.resume_query_param;
        match self.draft_id() {
            Some(id) => with_draft_id(url, param, &id),
            None => without_draft_id(url, param),
        }
    }

    /// Returns the draft id, creating the draft on first use.
    ///
    /// Concurrent callers wait for the first one's create call and share its
    /// id; at most one create call is in flight per controller.
    pub async fn ensure_draft(&self, initial_payload: &Value) -> Result<String> {
        if let Some(id) = self.draft_id() {
            return Ok(id);
        }

        let _gate = self.inner.draft_gate.lock().await;
        let epoch = {
            let mut state = self.state();
            if let Some(id) = &state.snapshot.draft_id {
                return Ok(id.clone());
            }
            state.pending_draft = Some(format!("tmp-{}", Uuid::new_v4()));
            state.epoch
        };

        info!("creating application draft");
        let outcome = into_outcome(self.inner.api.create_draft(initial_payload).await);

        self.state().pending_draft = None;
        let data = outcome.map_err(|message| {
            warn!(%message, "draft creation failed");
            FlowError::DraftCreationFailed(message)
        })?;
        let draft_id = data.as_ref().and_then(extract_draft_id).ok_or_else(|| {
            warn!(?data, "create response carried no application id");
            FlowError::MissingDraftReference("create response carried no application id".to_string())
        })?;

        self.update(|state, snapshot| {
            if state.epoch != epoch {
                warn!(%draft_id, "flow reset while the draft was being created");
                return Err(FlowError::MissingDraftReference(
                    "flow was reset while the draft was being created".to_string(),
                ));
            }
            snapshot.draft_id = Some(draft_id.clone());
            Ok(())
        })
        .await?;

        info!(%draft_id, "application draft created");
        Ok(draft_id)
    }

    /// Moves to `target` if every required step before it is completed.
    /// Targets past either end are clamped.
    pub async fn go_to_step(&self, target: u32) -> Result<u32> {
        let plan = &self.inner.plan;
        self.update(|_, snapshot| {
            if !plan.can_access(target, &snapshot.completed_steps) {
                let missing = plan.missing_before(target, &snapshot.completed_steps);
                debug!(step = target, ?missing, "navigation blocked");
                return Err(FlowError::NavigationBlocked { target, missing });
            }
            snapshot.current_step = plan.clamp(target);
            Ok(snapshot.current_step)
        })
        .await
    }

    /// Moves one step back; earlier steps are always accessible.
    pub async fn go_back(&self) -> Result<u32> {
        let target = self.current_step().saturating_sub(1);
        self.go_to_step(target).await
    }

    /// Saves `payload` for `step` on the server, then records it locally.
    pub async fn submit_step(
        &self,
        step: u32,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<StepOutcome> {
        let plan = &self.inner.plan;
        if !plan.contains(step) {
            return Err(FlowError::UnknownStep(step));
        }

        let draft_id = self.ensure_draft(&payload).await?;

        let generation = {
            let mut state = self.state();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.latest_generation.insert(step, generation);
            generation
        };

        debug!(%draft_id, step, generation, "submitting step");
        let outcome = into_outcome(
            self.inner
                .api
                .update_step(&draft_id, step, &payload)
                .await,
        );
        if let Err(message) = outcome {
            warn!(%draft_id, step, %message, "step submission failed");
            return Err(FlowError::StepSubmissionFailed { step, message });
        }

        let applied = self
            .update(|state, snapshot| {
                let is_latest = state.latest_generation.get(&step) == Some(&generation)
                    && snapshot.draft_id.as_deref() == Some(draft_id.as_str());
                if !is_latest {
                    return Ok(None);
                }
                snapshot.step_answers.insert(step, payload);
                snapshot.completed_steps.insert(step);
                if !options.skip_navigation {
                    snapshot.current_step = plan.next_step(step);
                }
                Ok(Some(snapshot.current_step))
            })
            .await?;

        let Some(current_step) = applied else {
            info!(%draft_id, step, generation, "discarding superseded step response");
            return Ok(StepOutcome::Superseded { step });
        };
        info!(%draft_id, step, current_step, "step completed");
        Ok(StepOutcome::Completed { step, current_step })
    }

    /// Records extracted document data for `step`. Adopted as the step's
    /// answer when the user has not entered anything yet; returns whether it was.
    pub async fn apply_prefill(&self, step: u32, prefill: Value) -> Result<bool> {
        if !self.inner.plan.contains(step) {
            return Err(FlowError::UnknownStep(step));
        }
        let adopted = self
            .update(|_, snapshot| {
                let adopt = snapshot.step_answers.is_empty_for(step);
                if adopt {
                    snapshot.step_answers.insert(step, prefill.clone());
                }
                snapshot.prefill_answers.insert(step, prefill);
                Ok(adopt)
            })
            .await?;
        debug!(step, adopted, "prefill recorded");
        Ok(adopted)
    }

    /// Submits the finished application and clears local state on success.
    pub async fn submit_application(&self) -> Result<Value> {
        let plan = &self.inner.plan;
        let draft_id = {
            let state = self.state();
            let draft_id = state.snapshot.draft_id.clone().ok_or_else(|| {
                FlowError::MissingDraftReference("no application has been started".to_string())
            })?;
            let missing =
                plan.missing_before(plan.last_step().saturating_add(1), &state.snapshot.completed_steps);
            if !missing.is_empty() {
                return Err(FlowError::IncompleteApplication { missing });
            }
            draft_id
        };

        info!(%draft_id, "submitting application");
        let data = into_outcome(self.inner.api.submit(&draft_id).await).map_err(|message| {
            warn!(%draft_id, %message, "application submission failed");
            FlowError::ApplicationSubmissionFailed(message)
        })?;

        self.clear_and_purge().await?;
        info!(%draft_id, "application submitted");
        Ok(data.unwrap_or(Value::Null))
    }

    /// Current server copy of the draft.
    pub async fn fetch_application(&self) -> Result<Value> {
        let draft_id = self.draft_id().ok_or_else(|| {
            FlowError::MissingDraftReference("no application has been started".to_string())
        })?;
        let data = into_outcome(self.inner.api.get_by_id(&draft_id).await)
            .map_err(FlowError::FetchFailed)?;
        Ok(data.unwrap_or(Value::Null))
    }

    /// Discards the in-progress application locally and in storage.
    pub async fn reset_flow(&self) -> Result<()> {
        info!(draft_id = ?self.draft_id(), "resetting form flow");
        self.clear_and_purge().await
    }

    async fn clear_and_purge(&self) -> Result<()> {
        let _writer = self.inner.persist_lock.lock().await;
        self.state().clear(self.inner.plan.first_step());
        purge(self.inner.storage.as_ref(), &self.inner.keys).await
    }

    /// Applies `change` to a copy of the snapshot, writes the copy and only then
    /// makes it current. An unchanged copy is not written.
    async fn update<R>(
        &self,
        change: impl FnOnce(&FlowState, &mut FlowSnapshot) -> Result<R>,
    ) -> Result<R> {
        let _writer = self.inner.persist_lock.lock().await;
        let (result, mut candidate) = {
            let state = self.state();
            let mut candidate = state.snapshot.clone();
            let result = change(&*state, &mut candidate)?;
            if candidate == state.snapshot {
                return Ok(result);
            }
            (result, candidate)
        };
        candidate.saved_at = Some(Utc::now());
        persist_snapshot(self.inner.storage.as_ref(), &self.inner.keys, &candidate).await?;
        self.state().snapshot = candidate;
        Ok(result)
    }

    fn state(&self) -> MutexGuard<'_, FlowState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiOperation, InMemoryApplicationApi, ScriptedFailure};
    use crate::storage::InMemoryFlowStorage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory storage whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStorage {
        inner: InMemoryFlowStorage,
        writes_fail: AtomicBool,
    }

    #[async_trait]
    impl FlowStorage for FlakyStorage {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> Result<()> {
            if self.writes_fail.load(Ordering::SeqCst) {
                return Err(FlowError::Storage("disk full".into()));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key).await
        }
    }

    async fn controller_with(
        total_steps: u32,
    ) -> (FlowController, Arc<InMemoryApplicationApi>, InMemoryFlowStorage) {
        let api = Arc::new(InMemoryApplicationApi::new());
        let storage = InMemoryFlowStorage::new();
        let controller = FlowController::load(
            FlowConfig::with_total_steps(total_steps),
            api.clone(),
            Arc::new(storage.clone()),
        )
        .await
        .unwrap();
        (controller, api, storage)
    }

    #[tokio::test]
    async fn skip_navigation_keeps_current_step() {
        let (controller, _, _) = controller_with(4).await;
        let outcome = controller
            .submit_step(1, json!({ "name": "Ann" }), SubmitOptions::stay())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Completed {
                step: 1,
                current_step: 1
            }
        );
        assert!(controller.completed_steps().contains(&1));
    }

    #[tokio::test]
    async fn last_step_submission_stays_on_last_step() {
        let (controller, _, _) = controller_with(2).await;
        for step in 1..=2 {
            controller
                .submit_step(step, json!({ "step": step }), SubmitOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(controller.current_step(), 2);
        assert!(controller.progress().is_complete);
    }

    #[tokio::test]
    async fn unknown_step_is_rejected_before_any_call() {
        let (controller, api, _) = controller_with(4).await;
        let err = controller
            .submit_step(9, json!({}), SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::UnknownStep(9)));
        assert_eq!(api.call_count(ApiOperation::CreateDraft), 0);
        assert_eq!(api.call_count(ApiOperation::UpdateStep), 0);
    }

    #[tokio::test]
    async fn failed_draft_creation_is_retryable() {
        let (controller, api, _) = controller_with(4).await;
        api.fail_next(
            ApiOperation::CreateDraft,
            ScriptedFailure::Transport("connection reset".into()),
        );

        let err = controller.ensure_draft(&json!({})).await.unwrap_err();
        assert!(matches!(err, FlowError::DraftCreationFailed(_)));
        assert_eq!(controller.draft_status(), DraftStatus::None);

        let id = controller.ensure_draft(&json!({})).await.unwrap();
        assert_eq!(controller.draft_status(), DraftStatus::Ready(id));
        assert_eq!(api.call_count(ApiOperation::CreateDraft), 2);
    }

    #[tokio::test]
    async fn placeholder_is_visible_while_creating() {
        let (controller, api, _) = controller_with(4).await;
        let hold = api.pause_next(ApiOperation::CreateDraft);

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ensure_draft(&json!({})).await })
        };
        while api.call_count(ApiOperation::CreateDraft) == 0 {
            tokio::task::yield_now().await;
        }

        match controller.draft_status() {
            DraftStatus::Pending { placeholder } => assert!(placeholder.starts_with("tmp-")),
            other => panic!("expected pending draft, got {other:?}"),
        }

        hold.release();
        let id = pending.await.unwrap().unwrap();
        assert_eq!(controller.draft_status(), DraftStatus::Ready(id));
    }

    #[tokio::test]
    async fn go_back_moves_one_step() {
        let (controller, _, _) = controller_with(4).await;
        controller
            .submit_step(1, json!({ "a": 1 }), SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(controller.go_back().await.unwrap(), 1);
        assert_eq!(controller.go_back().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn prefill_is_adopted_only_for_untouched_steps() {
        let (controller, _, _) = controller_with(4).await;

        assert!(
            controller
                .apply_prefill(2, json!({ "passport_number": "N1234567" }))
                .await
                .unwrap()
        );
        assert_eq!(
            controller.step_answer(2),
            Some(json!({ "passport_number": "N1234567" }))
        );

        controller
            .submit_step(1, json!({ "email": "a@x.com" }), SubmitOptions::stay())
            .await
            .unwrap();
        assert!(
            !controller
                .apply_prefill(1, json!({ "email": "ocr@x.com", "phone": "0400" }))
                .await
                .unwrap()
        );
        assert_eq!(controller.step_answer(1), Some(json!({ "email": "a@x.com" })));
        assert_eq!(
            controller.merged_answer(1),
            Some(json!({ "email": "a@x.com", "phone": "0400" }))
        );
        assert!(controller.apply_prefill(12, json!({})).await.is_err());
    }

    #[tokio::test]
    async fn submit_application_requires_every_required_step() {
        let (controller, api, _) = controller_with(3).await;
        assert!(matches!(
            controller.submit_application().await,
            Err(FlowError::MissingDraftReference(_))
        ));

        controller
            .submit_step(1, json!({ "a": 1 }), SubmitOptions::default())
            .await
            .unwrap();
        match controller.submit_application().await {
            Err(FlowError::IncompleteApplication { missing }) => assert_eq!(missing, vec![2, 3]),
            other => panic!("expected incomplete application, got {other:?}"),
        }
        assert_eq!(api.call_count(ApiOperation::Submit), 0);
    }

    #[tokio::test]
    async fn successful_submission_clears_state() {
        let (controller, api, storage) = controller_with(2).await;
        for step in 1..=2 {
            controller
                .submit_step(step, json!({ "step": step }), SubmitOptions::default())
                .await
                .unwrap();
        }
        let draft_id = controller.draft_id().unwrap();

        let submitted = controller.submit_application().await.unwrap();
        assert_eq!(submitted["status"], "submitted");
        assert_eq!(controller.draft_id(), None);
        assert!(controller.completed_steps().is_empty());
        assert!(storage.is_empty());
        assert_eq!(api.draft(&draft_id).unwrap()["status"], "submitted");
    }

    #[tokio::test]
    async fn failed_submission_keeps_state() {
        let (controller, api, _) = controller_with(1).await;
        controller
            .submit_step(1, json!({ "a": 1 }), SubmitOptions::default())
            .await
            .unwrap();
        api.fail_next(
            ApiOperation::Submit,
            ScriptedFailure::Rejected("Passport copy not verified".into()),
        );

        let err = controller.submit_application().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Application submission failed: Passport copy not verified"
        );
        assert!(controller.draft_id().is_some());
        assert!(controller.completed_steps().contains(&1));
    }

    #[tokio::test]
    async fn fetch_returns_server_copy() {
        let (controller, _, _) = controller_with(3).await;
        assert!(matches!(
            controller.fetch_application().await,
            Err(FlowError::MissingDraftReference(_))
        ));
        controller
            .submit_step(1, json!({ "name": "Ann" }), SubmitOptions::default())
            .await
            .unwrap();
        let record = controller.fetch_application().await.unwrap();
        assert_eq!(record["steps"]["1"]["name"], "Ann");
    }

    #[tokio::test]
    async fn resume_link_takes_precedence_over_storage() {
        let api = Arc::new(InMemoryApplicationApi::new());
        let storage = InMemoryFlowStorage::new();
        let first = FlowController::load(
            FlowConfig::with_total_steps(4),
            api.clone(),
            Arc::new(storage.clone()),
        )
        .await
        .unwrap();
        first
            .submit_step(1, json!({ "name": "Ann" }), SubmitOptions::default())
            .await
            .unwrap();

        let link = Url::parse("https://portal.example.com/apply?applicationId=APP-0500").unwrap();
        let resumed = FlowController::load_from_url(
            FlowConfig::with_total_steps(4),
            api.clone(),
            Arc::new(storage.clone()),
            &link,
        )
        .await
        .unwrap();
        assert_eq!(resumed.draft_id().as_deref(), Some("APP-0500"));
        assert!(resumed.completed_steps().is_empty());
        assert_eq!(resumed.current_step(), 1);

        let reloaded = FlowController::load(
            FlowConfig::with_total_steps(4),
            api,
            Arc::new(storage),
        )
        .await
        .unwrap();
        assert_eq!(reloaded.draft_id().as_deref(), Some("APP-0500"));
    }

    #[tokio::test]
    async fn canonical_url_tracks_draft() {
        let (controller, _, _) = controller_with(3).await;
        let page = Url::parse("https://portal.example.com/apply?tab=docs").unwrap();
        assert_eq!(controller.canonical_url(&page), page);

        controller
            .submit_step(1, json!({ "name": "Ann" }), SubmitOptions::default())
            .await
            .unwrap();
        let id = controller.draft_id().unwrap();
        assert_eq!(
            controller.canonical_url(&page).as_str(),
            format!("https://portal.example.com/apply?tab=docs&applicationId={id}")
        );
    }

    #[tokio::test]
    async fn failed_storage_write_leaves_state_untouched() {
        let api = Arc::new(InMemoryApplicationApi::new());
        let storage = Arc::new(FlakyStorage::default());
        let controller = FlowController::load(
            FlowConfig::with_total_steps(4),
            api.clone(),
            storage.clone(),
        )
        .await
        .unwrap();
        controller.ensure_draft(&json!({})).await.unwrap();
        let before = controller.snapshot();

        storage.writes_fail.store(true, Ordering::SeqCst);
        let err = controller
            .submit_step(1, json!({ "name": "Ann" }), SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Storage(ref m) if m == "disk full"));
        assert_eq!(api.call_count(ApiOperation::UpdateStep), 1);
        assert_eq!(controller.snapshot(), before);

        assert!(matches!(
            controller.go_to_step(2).await,
            Err(FlowError::NavigationBlocked { .. })
        ));
        assert!(matches!(
            controller.apply_prefill(2, json!({ "passport_number": "N1234567" })).await,
            Err(FlowError::Storage(_))
        ));
        assert_eq!(controller.prefill_answer(2), None);
        assert_eq!(controller.current_step(), 1);

        storage.writes_fail.store(false, Ordering::SeqCst);
        controller
            .submit_step(1, json!({ "name": "Ann" }), SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(controller.go_to_step(2).await.unwrap(), 2);

        let reloaded = FlowController::load(FlowConfig::with_total_steps(4), api, storage)
            .await
            .unwrap();
        assert_eq!(reloaded.snapshot(), controller.snapshot());
    }
}

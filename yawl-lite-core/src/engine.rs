//! Engine façade: the top-level operations clients call.
//!
//! The engine is an explicit value owned by the caller. It serialises every
//! case-affecting operation on a per-case async mutex, runs the synchronous
//! runner transitions inside that lock, flushes the persistence unit (case
//! snapshot + event log) and only then dispatches announcements. Codelets
//! run inline under the case lock; service announcements go out after it is
//! released.

use crate::announce::{Announcement, HandlerRef, HandlerRegistry, Notice, WorkItemHandler};
use crate::announce::{route, Codelet, Route};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventRecord};
use crate::firing::{self, StepCtx};
use crate::marking::Place;
use crate::reachability::OrJoinCache;
use crate::runner::CaseState;
use crate::spec::model::Specification;
use crate::spec::verifier::{verify_or_err, VerifyError};
use crate::store::{CaseSnapshot, CaseStore};
use crate::types::{
    case_of_work_item, now_ms, CaseId, CompletionFlag, ElementId, RunnerStatus, SpecId,
    Timestamp, WorkItemId, WorkItemStatus,
};
use crate::workitem::{WorkItem, WorkItemRepository};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

// ─── Exception hooks (IX) ─────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPoint {
    PreCaseStart,
    PostCaseEnd,
    PreItemStart,
    PostItemComplete,
}

impl HookPoint {
    fn name(&self) -> &'static str {
        match self {
            HookPoint::PreCaseStart => "pre_case_start",
            HookPoint::PostCaseEnd => "post_case_end",
            HookPoint::PreItemStart => "pre_item_start",
            HookPoint::PostItemComplete => "post_item_complete",
        }
    }
}

/// Advisory constraint-check subscriber. The engine logs the response but
/// never requires it.
#[async_trait]
pub trait ExceptionObserver: Send + Sync {
    async fn check(
        &self,
        hook: HookPoint,
        case_id: &str,
        item: Option<&WorkItem>,
    ) -> Option<String>;
}

// ─── Queries ──────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct WorkItemFilter {
    pub case_id: Option<CaseId>,
    pub task: Option<ElementId>,
    pub status: Option<WorkItemStatus>,
}

/// Read-only view of one net instance's marking.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkingView {
    pub net_root: String,
    pub net_id: String,
    pub places: Vec<(Place, usize)>,
}

/// Administrator marking edit, gated behind the admin capability.
#[derive(Clone, Debug, PartialEq)]
pub enum MarkingEdit {
    AddToken { place: Place },
    RemoveToken { place: Place },
}

// ─── Engine ───────────────────────────────────────────────────

struct CaseSlot {
    state: CaseState,
    cache: OrJoinCache,
    spec: Arc<Specification>,
}

struct CaseCell {
    lock: Mutex<CaseSlot>,
}

pub struct Engine {
    store: Arc<dyn CaseStore>,
    specs: RwLock<HashMap<SpecId, Arc<Specification>>>,
    cases: RwLock<HashMap<CaseId, Arc<CaseCell>>>,
    repo: RwLock<WorkItemRepository>,
    registry: RwLock<HandlerRegistry>,
    observer: RwLock<Option<Arc<dyn ExceptionObserver>>>,
    admin_capability: bool,
}

impl Engine {
    pub fn new(store: Arc<dyn CaseStore>) -> Self {
        Self {
            store,
            specs: RwLock::new(HashMap::new()),
            cases: RwLock::new(HashMap::new()),
            repo: RwLock::new(WorkItemRepository::new()),
            registry: RwLock::new(HandlerRegistry::new()),
            observer: RwLock::new(None),
            admin_capability: false,
        }
    }

    /// Allow `admin_edit_marking`. Off by default.
    pub fn with_admin_capability(mut self) -> Self {
        self.admin_capability = true;
        self
    }

    pub async fn set_exception_observer(&self, observer: Arc<dyn ExceptionObserver>) {
        *self.observer.write().await = Some(observer);
    }

    // ─── Design time (IA) ─────────────────────────────────────

    /// Verify and load a specification. Returns the verification warnings;
    /// errors reject the load and nothing is stored.
    pub async fn load_specification(
        &self,
        spec: Specification,
    ) -> EngineResult<Vec<VerifyError>> {
        let known = self.registry.read().await.known_refs();
        let warnings = verify_or_err(&spec, &known)?;
        for warning in &warnings {
            tracing::warn!(spec = %spec.id, %warning, "specification verification warning");
        }
        self.store.save_specification(&spec).await?;
        self.specs
            .write()
            .await
            .insert(spec.id.clone(), Arc::new(spec));
        Ok(warnings)
    }

    /// Unload a specification. Running cases keep their own reference.
    pub async fn unload_specification(&self, spec_id: &str) -> EngineResult<()> {
        let removed = self.specs.write().await.remove(spec_id);
        if removed.is_none() {
            return Err(EngineError::not_found("specification", spec_id));
        }
        self.store.delete_specification(spec_id).await?;
        Ok(())
    }

    pub async fn list_specifications(&self) -> Vec<SpecId> {
        self.specs.read().await.keys().cloned().collect()
    }

    /// Register a handler and retry any Enabled work items that were blocked
    /// on it.
    pub async fn register_handler(
        &self,
        handler_ref: HandlerRef,
        handler: Arc<dyn WorkItemHandler>,
    ) -> EngineResult<()> {
        self.store.save_handler(&handler_ref).await?;
        let reference = handler_ref.reference.clone();
        self.registry.write().await.register(handler_ref, handler);
        self.retry_blocked(&reference).await;
        Ok(())
    }

    pub async fn unregister_handler(&self, reference: &str) -> EngineResult<()> {
        if !self.registry.write().await.unregister(reference) {
            return Err(EngineError::not_found("handler", reference));
        }
        self.store.delete_handler(reference).await?;
        Ok(())
    }

    pub async fn register_codelet(&self, name: impl Into<String>, codelet: Arc<dyn Codelet>) {
        self.registry.write().await.register_codelet(name, codelet);
    }

    pub async fn registered_handlers(&self) -> Vec<HandlerRef> {
        self.registry.read().await.descriptors()
    }

    /// Push Enabled items whose route now resolves to the new handler.
    async fn retry_blocked(&self, reference: &str) {
        let registry = self.registry.read().await;
        let repo = self.repo.read().await;
        let mut notices = Vec::new();
        for item in repo.iter() {
            if item.status != WorkItemStatus::Enabled {
                continue;
            }
            match route(item, &registry) {
                Route::Service { service_ref } if service_ref == reference => {
                    notices.push((service_ref, Notice::WorkItemEnabled(item.clone())));
                }
                Route::Worklist { worklist_ref } if worklist_ref == reference => {
                    notices.push((worklist_ref, Notice::WorkItemEnabled(item.clone())));
                }
                _ => {}
            }
        }
        drop(repo);
        drop(registry);
        for (target, notice) in notices {
            self.push_notice(&target, notice).await;
        }
    }

    // ─── Runtime (IB) ─────────────────────────────────────────

    pub async fn launch_case(
        &self,
        spec_id: &str,
        data: Value,
        completion_observer: Option<String>,
    ) -> EngineResult<CaseId> {
        let spec = self
            .specs
            .read()
            .await
            .get(spec_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("specification", spec_id))?;

        let case_id = Uuid::now_v7().to_string();
        self.advise(HookPoint::PreCaseStart, &case_id, None).await;

        let state = CaseState::launch(&spec, case_id.clone(), data, completion_observer);
        let cell = Arc::new(CaseCell {
            lock: Mutex::new(CaseSlot {
                state,
                cache: OrJoinCache::new(),
                spec,
            }),
        });
        self.cases
            .write()
            .await
            .insert(case_id.clone(), cell.clone());

        self.run_step(&cell, "engine", |state, spec, ctx| {
            ctx.events.push(EngineEvent::CaseStarted {
                case: state.case_id.clone(),
                spec: state.spec_id.clone(),
            });
            state.kick(spec, ctx)
        })
        .await?;

        tracing::info!(case = %case_id, spec = %spec_id, "case launched");
        Ok(case_id)
    }

    pub async fn start_work_item(
        &self,
        item_id: &str,
        handler_id: impl Into<String>,
    ) -> EngineResult<()> {
        let handler_id = handler_id.into();
        let case_id = case_of_work_item(item_id);
        let item = self.repo.read().await.get(item_id).cloned();
        self.advise(HookPoint::PreItemStart, &case_id, item.as_ref())
            .await;

        let cell = self.cell(&case_id).await?;
        let item_id = item_id.to_string();
        self.run_step(&cell, &handler_id.clone(), move |state, spec, ctx| {
            state.start_item(spec, ctx, &item_id, Some(handler_id))?;
            state.kick(spec, ctx)
        })
        .await
    }

    pub async fn complete_work_item(
        &self,
        item_id: &str,
        output: Value,
        flag: CompletionFlag,
    ) -> EngineResult<()> {
        let case_id = case_of_work_item(item_id);
        let cell = self.cell(&case_id).await?;
        let actor = self
            .repo
            .read()
            .await
            .get(item_id)
            .and_then(|i| i.handler.clone())
            .unwrap_or_else(|| "engine".to_string());

        let id = item_id.to_string();
        self.run_step(&cell, &actor, move |state, spec, ctx| {
            state.complete_item(spec, ctx, &id, output, flag)?;
            state.kick(spec, ctx)
        })
        .await?;

        let item = self.repo.read().await.get(item_id).cloned();
        self.advise(HookPoint::PostItemComplete, &case_id, item.as_ref())
            .await;
        Ok(())
    }

    pub async fn suspend_work_item(&self, item_id: &str) -> EngineResult<()> {
        let case_id = case_of_work_item(item_id);
        let cell = self.cell(&case_id).await?;
        let id = item_id.to_string();
        self.run_step(&cell, "engine", move |_state, _spec, ctx| {
            let item = ctx
                .repo
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("work item", id.clone()))?;
            match item.status {
                WorkItemStatus::Enabled | WorkItemStatus::Fired | WorkItemStatus::Executing => {
                    item.suspended_from = Some(item.status);
                    item.status = WorkItemStatus::Suspended;
                    ctx.events
                        .push(EngineEvent::WorkItemSuspended { item: id.clone() });
                    Ok(())
                }
                other => Err(EngineError::IllegalTransition {
                    work_item: id.clone(),
                    detail: format!("cannot suspend from {other:?}"),
                }),
            }
        })
        .await
    }

    pub async fn resume_work_item(&self, item_id: &str) -> EngineResult<()> {
        let case_id = case_of_work_item(item_id);
        let cell = self.cell(&case_id).await?;
        let id = item_id.to_string();
        self.run_step(&cell, "engine", move |_state, _spec, ctx| {
            let item = ctx
                .repo
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("work item", id.clone()))?;
            if item.status != WorkItemStatus::Suspended {
                return Err(EngineError::IllegalTransition {
                    work_item: id.clone(),
                    detail: format!("cannot resume from {:?}", item.status),
                });
            }
            item.status = item.suspended_from.take().unwrap_or(WorkItemStatus::Enabled);
            ctx.events
                .push(EngineEvent::WorkItemResumed { item: id.clone() });
            Ok(())
        })
        .await
    }

    pub async fn suspend_case(&self, case_id: &str) -> EngineResult<()> {
        let cell = self.cell(case_id).await?;
        self.run_step(&cell, "engine", |state, _spec, ctx| state.suspend(ctx))
            .await
    }

    pub async fn resume_case(&self, case_id: &str) -> EngineResult<()> {
        let cell = self.cell(case_id).await?;
        self.run_step(&cell, "engine", |state, spec, ctx| {
            state.resume(ctx)?;
            state.kick(spec, ctx)
        })
        .await
    }

    /// Irreversible. Subsequent operations on the case return `NotFound`.
    pub async fn cancel_case(&self, case_id: &str) -> EngineResult<()> {
        let cell = self.cell(case_id).await?;
        self.run_step(&cell, "engine", |state, _spec, ctx| {
            state.cancel(ctx);
            Ok(())
        })
        .await?;
        tracing::info!(case = %case_id, "case cancelled");
        Ok(())
    }

    /// Grow a dynamic multi-instance task by one child (the explicit policy
    /// hook for dynamic creation).
    pub async fn add_instance(&self, parent_item_id: &str) -> EngineResult<WorkItemId> {
        let case_id = case_of_work_item(parent_item_id);
        let cell = self.cell(&case_id).await?;
        let id = parent_item_id.to_string();
        self.run_step(&cell, "engine", move |state, spec, ctx| {
            state.add_instance(spec, ctx, &id)
        })
        .await
    }

    /// Fail work items whose task-level timer has expired. Timer expiry is
    /// a completion path: the runner handles the item like any other
    /// completion, with Failed as the outcome.
    pub async fn sweep_timers(&self) -> EngineResult<Vec<WorkItemId>> {
        let now = now_ms();
        let expired: Vec<(CaseId, WorkItemId)> = self
            .repo
            .read()
            .await
            .iter()
            .filter(|i| {
                matches!(
                    i.status,
                    WorkItemStatus::Enabled | WorkItemStatus::Fired | WorkItemStatus::Executing
                ) && i.timer_deadline.is_some_and(|d| d <= now)
            })
            .map(|i| (i.case_id.clone(), i.id.clone()))
            .collect();

        let mut failed = Vec::new();
        for (case_id, item_id) in expired {
            let Ok(cell) = self.cell(&case_id).await else {
                continue;
            };
            let id = item_id.clone();
            let result = self
                .run_step(&cell, "timer", move |_state, _spec, ctx| {
                    let Some(item) = ctx.repo.get_mut(&id) else {
                        return Ok(false);
                    };
                    if !matches!(
                        item.status,
                        WorkItemStatus::Enabled
                            | WorkItemStatus::Fired
                            | WorkItemStatus::Executing
                    ) {
                        return Ok(false);
                    }
                    item.status = WorkItemStatus::Failed;
                    ctx.events.push(EngineEvent::TimerExpired { item: id.clone() });
                    ctx.events.push(EngineEvent::WorkItemFailed {
                        item: id.clone(),
                        reason: "task timer expired".to_string(),
                    });
                    Ok(true)
                })
                .await?;
            if result {
                failed.push(item_id);
            }
        }
        Ok(failed)
    }

    // ─── Queries ──────────────────────────────────────────────

    pub async fn get_live_work_items(&self, filter: WorkItemFilter) -> Vec<WorkItem> {
        let repo = self.repo.read().await;
        repo.iter()
            .filter(|i| i.is_live())
            .filter(|i| filter.case_id.as_ref().is_none_or(|c| i.case_id == *c))
            .filter(|i| filter.task.as_ref().is_none_or(|t| i.task == *t))
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .cloned()
            .collect()
    }

    pub async fn get_work_item(&self, item_id: &str) -> EngineResult<WorkItem> {
        self.repo
            .read()
            .await
            .get(item_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("work item", item_id))
    }

    pub async fn get_case_data(&self, case_id: &str) -> EngineResult<Value> {
        let cell = self.cell(case_id).await?;
        let slot = cell.lock.lock().await;
        Ok(slot.state.data.clone())
    }

    pub async fn get_case_status(&self, case_id: &str) -> EngineResult<RunnerStatus> {
        let cell = self.cell(case_id).await?;
        let slot = cell.lock.lock().await;
        Ok(slot.state.status)
    }

    pub async fn list_cases(&self) -> Vec<CaseId> {
        self.cases.read().await.keys().cloned().collect()
    }

    /// Per-net-instance `place → token count` view of a case marking.
    pub async fn inspect_marking(&self, case_id: &str) -> EngineResult<Vec<MarkingView>> {
        let cell = self.cell(case_id).await?;
        let slot = cell.lock.lock().await;
        let mut views = Vec::new();
        let root = &slot.state.root;
        views.push(MarkingView {
            net_root: root.root.to_string(),
            net_id: root.net_id.clone(),
            places: root.cm.marking().counts().into_iter().collect(),
        });
        for sub in slot.state.subnets.values() {
            views.push(MarkingView {
                net_root: sub.inst.root.to_string(),
                net_id: sub.inst.net_id.clone(),
                places: sub.inst.cm.marking().counts().into_iter().collect(),
            });
        }
        Ok(views)
    }

    /// Administrator-only marking surgery on the root net, typically to
    /// free a deadlocked case. Never invoked by the runner.
    pub async fn admin_edit_marking(
        &self,
        case_id: &str,
        edits: Vec<MarkingEdit>,
    ) -> EngineResult<()> {
        if !self.admin_capability {
            return Err(EngineError::AdminRequired);
        }
        let cell = self.cell(case_id).await?;
        self.run_step(&cell, "admin", move |state, spec, ctx| {
            let root_ident = state.root.root.clone();
            let mut detail = Vec::new();
            for edit in &edits {
                match edit {
                    MarkingEdit::AddToken { place } => {
                        state.root.cm.add_location(&root_ident, place);
                        detail.push(format!("+{place}"));
                    }
                    MarkingEdit::RemoveToken { place } => {
                        state.root.cm.remove_all(place);
                        detail.push(format!("-{place}"));
                    }
                }
            }
            state.deadlock_reported = false;
            ctx.events.push(EngineEvent::MarkingEdited {
                case: state.case_id.clone(),
                detail: detail.join(", "),
            });
            state.kick(spec, ctx)
        })
        .await
    }

    // ─── Event log (IE) ───────────────────────────────────────

    pub async fn read_events(
        &self,
        case_id: &str,
        from_seq: u64,
    ) -> EngineResult<Vec<EventRecord>> {
        Ok(self.store.read_events(case_id, from_seq).await?)
    }

    // ─── Recovery ─────────────────────────────────────────────

    /// Restore all persisted non-terminal cases after a restart, re-run
    /// `kick`, and re-announce live Enabled items. Work-item ids are the
    /// idempotency key: handlers that already saw an item ignore the
    /// repeat.
    pub async fn recover(&self) -> EngineResult<Vec<CaseId>> {
        for spec_id in self.store.list_specifications().await? {
            if let Some(spec) = self.store.load_specification(&spec_id).await? {
                self.specs
                    .write()
                    .await
                    .insert(spec_id.clone(), Arc::new(spec));
            }
        }

        let mut recovered = Vec::new();
        for case_id in self.store.list_cases().await? {
            let Some(snapshot) = self.store.load_case(&case_id).await? else {
                continue;
            };
            let Some(spec) = self.specs.read().await.get(&snapshot.state.spec_id).cloned()
            else {
                tracing::warn!(case = %case_id, spec = %snapshot.state.spec_id,
                    "cannot recover case: specification not in store");
                continue;
            };

            {
                let mut repo = self.repo.write().await;
                for item in snapshot.items {
                    repo.insert(item);
                }
            }
            let cell = Arc::new(CaseCell {
                lock: Mutex::new(CaseSlot {
                    state: snapshot.state,
                    cache: OrJoinCache::new(),
                    spec,
                }),
            });
            self.cases.write().await.insert(case_id.clone(), cell);
            recovered.push(case_id);
        }

        for case_id in &recovered {
            let cell = self.cell(case_id).await?;
            self.run_step(&cell, "recovery", |state, spec, ctx| {
                state.kick(spec, ctx)?;
                let enabled: Vec<WorkItem> = ctx
                    .repo
                    .list_by_case(&state.case_id)
                    .into_iter()
                    .filter(|i| i.status == WorkItemStatus::Enabled)
                    .cloned()
                    .collect();
                for item in enabled {
                    firing::announce_enabled(&item, ctx);
                }
                Ok(())
            })
            .await?;
        }

        tracing::info!(cases = recovered.len(), "recovery complete");
        Ok(recovered)
    }

    // ─── Internals ────────────────────────────────────────────

    async fn cell(&self, case_id: &str) -> EngineResult<Arc<CaseCell>> {
        self.cases
            .read()
            .await
            .get(case_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("case", case_id))
    }

    /// One serialised case step: run the operation and the codelet loop
    /// under the case lock, flush the persistence unit and the event log,
    /// then dispatch push announcements with the lock released.
    async fn run_step<T>(
        &self,
        cell: &CaseCell,
        actor: &str,
        op: impl FnOnce(&mut CaseState, &Specification, &mut StepCtx<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut slot = cell.lock.lock().await;
        let spec = slot.spec.clone();
        let mut events: Vec<EngineEvent> = Vec::new();
        let mut announcements: Vec<Announcement> = Vec::new();

        let slot_ref = &mut *slot;
        let mut result;
        let snapshot_items: Vec<WorkItem>;
        {
            // The engine-wide repository and registry locks cover only the
            // synchronous transitions; both are released before the store
            // flush so steps of unrelated cases never wait on this case's
            // I/O.
            let mut repo_guard = self.repo.write().await;
            let registry_guard = self.registry.read().await;

            result = {
                let mut ctx = StepCtx {
                    repo: &mut repo_guard,
                    events: &mut events,
                    announcements: &mut announcements,
                    registry: &registry_guard,
                    cache: &mut slot_ref.cache,
                    actor: actor.to_string(),
                };
                let r = op(&mut slot_ref.state, &spec, &mut ctx);
                if matches!(&r, Ok(_) | Err(EngineError::DataValidation { .. })) {
                    if let Err(e) = drain_codelets(&mut slot_ref.state, &spec, &mut ctx) {
                        Err(e)
                    } else {
                        r
                    }
                } else {
                    r
                }
            };

            // A consistency violation quarantines the case rather than
            // leaving it half-stepped.
            if let Err(EngineError::InternalConsistency { detail, .. }) = &result {
                tracing::error!(case = %slot_ref.state.case_id, %detail, "case quarantined");
                slot_ref.state.status = RunnerStatus::Failed;
                events.push(EngineEvent::ConsistencyFailure {
                    case: slot_ref.state.case_id.clone(),
                    detail: detail.clone(),
                });
            }

            snapshot_items = if matches!(
                slot_ref.state.status,
                RunnerStatus::Completed | RunnerStatus::Cancelling
            ) {
                repo_guard.remove_for_case(&slot_ref.state.case_id);
                Vec::new()
            } else {
                repo_guard
                    .list_by_case(&slot_ref.state.case_id)
                    .into_iter()
                    .cloned()
                    .collect()
            };
        }

        // Persistence unit first, event log second, announcements last.
        // Only the case lock spans the flush.
        let case_id = slot_ref.state.case_id.clone();
        let destroyed = matches!(
            slot_ref.state.status,
            RunnerStatus::Completed | RunnerStatus::Cancelling
        );
        let persist: anyhow::Result<()> = async {
            if destroyed {
                self.store.delete_case(&case_id).await?;
            } else {
                self.store
                    .save_case(&CaseSnapshot {
                        state: slot_ref.state.clone(),
                        items: snapshot_items,
                    })
                    .await?;
            }
            let at: Timestamp = now_ms();
            for event in &events {
                self.store
                    .append_event(&event.case_id(), at, actor, event)
                    .await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = persist {
            result = Err(EngineError::Storage(e));
        }

        let completed = slot_ref.state.status == RunnerStatus::Completed;
        drop(slot);

        if destroyed {
            self.cases.write().await.remove(&case_id);
        }

        self.dispatch(announcements).await;

        if completed {
            self.advise(HookPoint::PostCaseEnd, &case_id, None).await;
        }
        result
    }

    async fn dispatch(&self, announcements: Vec<Announcement>) {
        for announcement in announcements {
            if let Announcement::Push { target, notice } = announcement {
                self.push_notice(&target, notice).await;
            }
        }
    }

    async fn push_notice(&self, target: &str, notice: Notice) {
        let handler = self.registry.read().await.handler(target).cloned();
        match handler {
            Some(handler) => {
                if let Err(error) = handler.notify(notice).await {
                    tracing::warn!(%target, %error, "announcement delivery failed");
                }
            }
            None => {
                tracing::warn!(%target, "announcement target is no longer registered");
            }
        }
    }

    async fn advise(&self, hook: HookPoint, case_id: &str, item: Option<&WorkItem>) {
        let observer = self.observer.read().await.clone();
        let Some(observer) = observer else { return };
        if let Some(advisory) = observer.check(hook, case_id, item).await {
            let event = EngineEvent::ExceptionAdvisory {
                case: case_id.to_string(),
                hook: hook.name().to_string(),
                advisory,
            };
            if let Err(error) = self
                .store
                .append_event(case_id, now_ms(), "exception-observer", &event)
                .await
            {
                tracing::warn!(%error, "failed to log exception advisory");
            }
        }
    }
}

/// Execute queued codelet announcements inline under the case lock. Each
/// completion re-kicks the runner, which may queue further codelets; the
/// cursor keeps going until the queue is dry.
fn drain_codelets(
    state: &mut CaseState,
    spec: &Specification,
    ctx: &mut StepCtx<'_>,
) -> EngineResult<()> {
    let mut idx = 0;
    while idx < ctx.announcements.len() {
        let announcement = ctx.announcements[idx].clone();
        idx += 1;
        let Announcement::RunCodelet { item, codelet } = announcement else {
            continue;
        };
        let Some(codelet_impl) = ctx.registry.codelet(&codelet).cloned() else {
            tracing::warn!(item = %item, codelet = %codelet,
                "codelet not registered; work item stays Enabled");
            continue;
        };

        let Some(work_item) = ctx.repo.get(&item) else {
            continue;
        };
        if !matches!(
            work_item.status,
            WorkItemStatus::Enabled | WorkItemStatus::Fired
        ) {
            continue;
        }

        state.start_item(spec, ctx, &item, Some(format!("codelet:{codelet}")))?;
        state.kick(spec, ctx)?;

        let Some(work_item) = ctx.repo.get(&item) else {
            continue;
        };
        if work_item.status != WorkItemStatus::Executing {
            // A multi-instance offer became the Parent item; its children
            // queued their own codelet runs.
            continue;
        }
        let input = work_item.input.clone();

        match codelet_impl.run(&input) {
            Ok(output) => {
                match state.complete_item(spec, ctx, &item, output, CompletionFlag::Normal) {
                    Ok(_) => {}
                    Err(EngineError::DataValidation { .. }) => continue,
                    Err(e) => return Err(e),
                }
                state.kick(spec, ctx)?;
            }
            Err(error) => {
                tracing::warn!(item = %item, codelet = %codelet, %error, "codelet failed");
                if let Some(item_mut) = ctx.repo.get_mut(&item) {
                    item_mut.status = WorkItemStatus::Failed;
                }
                ctx.events.push(EngineEvent::WorkItemFailed {
                    item: item.clone(),
                    reason: error.to_string(),
                });
            }
        }
    }
    Ok(())
}

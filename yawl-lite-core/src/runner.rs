//! Per-case runner: the classify → withdraw → fire loop, completion and
//! deadlock detection, suspend/resume/cancel, and composite sub-net
//! bookkeeping.
//!
//! Every method here runs synchronously under the case lock held by the
//! engine. Sub-net completion always walks parent before child, so the lock
//! order is parent → child by construction.

use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::firing::{
    self, complete_instance, fire_task, join_enabled, start_instance, CompleteOutcome,
    FireOutcome, NetInstance, StepCtx,
};
use crate::marking::{InternalPlace, Place};
use crate::spec::model::{NetSpec, Specification, TaskSpec};
use crate::types::{
    now_ms, work_item_id, CaseId, CompletionFlag, ElementId, IdentifierId, RunnerStatus, SpecId,
    Timestamp, WorkItemStatus,
};
use crate::workitem::WorkItem;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ─── Case state ───────────────────────────────────────────────

/// A running composite sub-net, keyed in `CaseState::subnets` by its root
/// identifier (the composite task's child identifier).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubNet {
    /// Root identifier of the net instance containing the composite task.
    pub parent_root: IdentifierId,
    pub parent_task: ElementId,
    pub inst: NetInstance,
}

/// Everything the engine persists per case: runner status, the case data
/// document, and the marking of the root net and live sub-nets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseState {
    pub case_id: CaseId,
    pub spec_id: SpecId,
    pub status: RunnerStatus,
    pub data: Value,
    pub root: NetInstance,
    pub subnets: BTreeMap<IdentifierId, SubNet>,
    pub completion_observer: Option<String>,
    pub created_at: Timestamp,
    /// Deadlock work items are emitted once per quiescent marking.
    pub deadlock_reported: bool,
}

struct LaunchReq {
    parent_root: IdentifierId,
    parent_task: ElementId,
    child: IdentifierId,
    subnet: String,
}

impl CaseState {
    /// Seed a fresh case: clone of the prototype net with the root
    /// identifier in the input condition.
    pub fn launch(
        spec: &Specification,
        case_id: CaseId,
        data: Value,
        completion_observer: Option<String>,
    ) -> Self {
        let root_net = spec.root();
        let root = NetInstance::new(root_net, IdentifierId::root(&case_id));
        Self {
            case_id,
            spec_id: spec.id.clone(),
            status: RunnerStatus::Normal,
            data,
            root,
            subnets: BTreeMap::new(),
            completion_observer,
            created_at: now_ms(),
            deadlock_reported: false,
        }
    }

    fn inst_mut(&mut self, net_root: &IdentifierId) -> Option<(&mut NetInstance, &mut Value)> {
        if *net_root == self.root.root {
            Some((&mut self.root, &mut self.data))
        } else {
            self.subnets
                .get_mut(net_root)
                .map(|sub| (&mut sub.inst, &mut self.data))
        }
    }

    // ─── Kick ─────────────────────────────────────────────────

    /// Re-entrant per-case step: classify every net instance, withdraw and
    /// enable offers, fire composite tasks, then detect completion or
    /// deadlock. Serialised by the engine's case lock.
    pub fn kick(&mut self, spec: &Specification, ctx: &mut StepCtx<'_>) -> EngineResult<()> {
        if !self.status.permits_firing() {
            return Ok(());
        }

        loop {
            let mut changed = false;
            let mut launches: Vec<LaunchReq> = Vec::new();

            {
                let net = net_of(spec, &self.root)?;
                changed |= classify_net(net, &mut self.root, &self.data, ctx, &mut launches)?;
            }
            let keys: Vec<IdentifierId> = self.subnets.keys().cloned().collect();
            for key in keys {
                let Some(sub) = self.subnets.get_mut(&key) else {
                    continue;
                };
                let net = spec
                    .net(&sub.inst.net_id)
                    .ok_or_else(|| EngineError::not_found("net", sub.inst.net_id.clone()))?;
                changed |= classify_net(net, &mut sub.inst, &self.data, ctx, &mut launches)?;
            }

            for req in launches {
                self.launch_subnet(spec, req, ctx)?;
                changed = true;
            }

            changed |= self.settle_subnets(spec, ctx)?;

            if !changed {
                break;
            }
        }

        let root_net = net_of(spec, &self.root)?;
        if self.root.completed(root_net) {
            self.complete_case(ctx);
            return Ok(());
        }

        self.detect_deadlock(spec, ctx);
        Ok(())
    }

    fn launch_subnet(
        &mut self,
        spec: &Specification,
        req: LaunchReq,
        ctx: &mut StepCtx<'_>,
    ) -> EngineResult<()> {
        let net = spec
            .net(&req.subnet)
            .ok_or_else(|| EngineError::not_found("net", req.subnet.clone()))?;
        let inst = NetInstance::new(net, req.child.clone());
        ctx.events.push(EngineEvent::SubNetLaunched {
            case: self.case_id.clone(),
            task: req.parent_task.clone(),
            sub_case: req.child.to_string(),
        });
        self.subnets.insert(
            req.child,
            SubNet {
                parent_root: req.parent_root,
                parent_task: req.parent_task,
                inst,
            },
        );
        Ok(())
    }

    /// Detect finished sub-nets and complete their composite parent items.
    /// Parent state is always touched from the parent side, never the other
    /// way around.
    fn settle_subnets(
        &mut self,
        spec: &Specification,
        ctx: &mut StepCtx<'_>,
    ) -> EngineResult<bool> {
        let mut finished: Vec<(IdentifierId, IdentifierId, ElementId)> = Vec::new();
        for (key, sub) in &self.subnets {
            let net = spec
                .net(&sub.inst.net_id)
                .ok_or_else(|| EngineError::not_found("net", sub.inst.net_id.clone()))?;
            if sub.inst.completed(net) {
                finished.push((key.clone(), sub.parent_root.clone(), sub.parent_task.clone()));
            }
        }

        for (key, parent_root, parent_task) in &finished {
            self.subnets.remove(key);
            ctx.events.push(EngineEvent::SubNetCompleted {
                case: self.case_id.clone(),
                task: parent_task.clone(),
                sub_case: key.to_string(),
            });

            let item_id = ctx
                .repo
                .list_by_case(&self.case_id)
                .into_iter()
                .find(|i| i.task == *parent_task && i.ident == *key)
                .map(|i| i.id.clone())
                .ok_or_else(|| EngineError::InternalConsistency {
                    case: self.case_id.clone(),
                    detail: format!("no composite work item for sub-net {key}"),
                })?;

            let case_id = self.case_id.clone();
            let (inst, data) = self
                .inst_mut(parent_root)
                .ok_or_else(|| EngineError::InternalConsistency {
                    case: case_id,
                    detail: format!("parent net instance {parent_root} vanished"),
                })?;
            let net = spec
                .net(&inst.net_id)
                .ok_or_else(|| EngineError::not_found("net", inst.net_id.clone()))?;
            let task = net
                .task(parent_task)
                .ok_or_else(|| EngineError::not_found("task", parent_task.clone()))?;

            // The child net's final data is already merged into the shared
            // case document; the composite completion carries it verbatim.
            let output = data.clone();
            complete_instance(
                net,
                inst,
                data,
                task,
                &item_id,
                output,
                CompletionFlag::Normal,
                ctx,
            )?;
        }
        Ok(!finished.is_empty())
    }

    // ─── Completion & deadlock ────────────────────────────────

    fn complete_case(&mut self, ctx: &mut StepCtx<'_>) {
        self.status = RunnerStatus::Completed;

        // Anything still live lost the race against the output condition.
        let leftovers: Vec<String> = ctx
            .repo
            .list_by_case(&self.case_id)
            .into_iter()
            .filter(|i| i.is_live())
            .map(|i| i.id.clone())
            .collect();
        for id in leftovers {
            if let Some(mut item) = ctx.repo.remove(&id) {
                item.status = WorkItemStatus::Withdrawn;
                ctx.events.push(EngineEvent::WorkItemWithdrawn {
                    item: item.id.clone(),
                });
                firing::push_cancellation(&item, ctx);
            }
        }

        ctx.events.push(EngineEvent::CaseCompleted {
            case: self.case_id.clone(),
        });
        if let Some(observer) = &self.completion_observer {
            if ctx.registry.handler(observer).is_some() {
                ctx.announcements.push(crate::announce::Announcement::Push {
                    target: observer.clone(),
                    notice: crate::announce::Notice::CaseCompleted {
                        case: self.case_id.clone(),
                        data: self.data.clone(),
                    },
                });
            } else {
                tracing::warn!(case = %self.case_id, observer = %observer,
                    "completion observer is not a registered handler");
            }
        }
    }

    /// The case is deadlocked iff nothing is enabled or busy anywhere while
    /// some condition still holds tokens with a non-empty downstream. Emits
    /// one synthetic Deadlocked work item per stuck task and leaves the case
    /// in Normal status for the administrator.
    fn detect_deadlock(&mut self, spec: &Specification, ctx: &mut StepCtx<'_>) {
        if self.deadlock_reported {
            return;
        }
        let instances: Vec<&NetInstance> = std::iter::once(&self.root)
            .chain(self.subnets.values().map(|s| &s.inst))
            .collect();

        let any_live = instances
            .iter()
            .any(|i| !i.enabled.is_empty() || !i.busy.is_empty());
        if any_live {
            return;
        }

        let mut stuck_tasks: Vec<ElementId> = Vec::new();
        let mut stuck_roots: Vec<IdentifierId> = Vec::new();
        for inst in &instances {
            let Ok(net) = net_of(spec, inst) else { continue };
            for cond in net.conditions() {
                if cond.flows_to.is_empty() {
                    continue;
                }
                if inst.cm.marking().marked(&Place::Condition(cond.id.clone())) {
                    for task in &cond.flows_to {
                        if !stuck_tasks.contains(task) {
                            stuck_tasks.push(task.clone());
                            stuck_roots.push(inst.root.clone());
                        }
                    }
                }
            }
        }
        if stuck_tasks.is_empty() {
            return;
        }

        for (task, net_root) in stuck_tasks.iter().zip(&stuck_roots) {
            let mut item = WorkItem::new(
                net_root.clone(),
                net_root.clone(),
                task,
                self.data.clone(),
                crate::types::ExecutionProfile::manual(),
                None,
            );
            item.status = WorkItemStatus::Deadlocked;
            // Observability only: push routes get told, codelets do not run.
            match crate::announce::route(&item, ctx.registry) {
                crate::announce::Route::Service { service_ref } => {
                    ctx.announcements.push(crate::announce::Announcement::Push {
                        target: service_ref,
                        notice: crate::announce::Notice::WorkItemEnabled(item.clone()),
                    });
                }
                crate::announce::Route::Worklist { worklist_ref } => {
                    ctx.announcements.push(crate::announce::Announcement::Push {
                        target: worklist_ref,
                        notice: crate::announce::Notice::WorkItemEnabled(item.clone()),
                    });
                }
                _ => {}
            }
            ctx.repo.insert(item);
        }

        tracing::error!(case = %self.case_id, tasks = ?stuck_tasks, "case deadlocked");
        ctx.events.push(EngineEvent::CaseDeadlocked {
            case: self.case_id.clone(),
            stuck_tasks,
        });
        self.deadlock_reported = true;
    }

    // ─── Work-item operations ─────────────────────────────────

    /// Start a work item: an offer fires the task (and starts it, for a
    /// single-instance task); a multi-instance child just starts.
    pub fn start_item(
        &mut self,
        spec: &Specification,
        ctx: &mut StepCtx<'_>,
        item_id: &str,
        handler: Option<String>,
    ) -> EngineResult<()> {
        if !self.status.permits_firing() {
            return Err(EngineError::IllegalCaseState {
                case: self.case_id.clone(),
                detail: format!("cannot start work items while {:?}", self.status),
            });
        }

        let item = ctx
            .repo
            .get(item_id)
            .ok_or_else(|| EngineError::not_found("work item", item_id))?
            .clone();

        let net_root = item.net_root.clone();
        let (inst, data) = self
            .inst_mut(&net_root)
            .ok_or_else(|| EngineError::not_found("net instance", net_root.to_string()))?;
        let net = spec
            .net(&inst.net_id)
            .ok_or_else(|| EngineError::not_found("net", inst.net_id.clone()))?;
        let task = net
            .task(&item.task)
            .ok_or_else(|| EngineError::not_found("task", item.task.clone()))?;

        let is_offer = item.parent.is_none() && !inst.task_busy(&task.id);
        match item.status {
            WorkItemStatus::Enabled if is_offer => {
                let data_snapshot = data.clone();
                match fire_task(net, inst, &data_snapshot, task, ctx)? {
                    FireOutcome::Fired => start_instance(inst, task, item_id, handler, ctx),
                    FireOutcome::FiredChildren(_) => {
                        // Children were announced; each is started on its
                        // own. The offer itself became the Parent item.
                        Ok(())
                    }
                    FireOutcome::LaunchSubNets(_) => unreachable!("offers are atomic tasks"),
                }
            }
            WorkItemStatus::Enabled | WorkItemStatus::Fired => {
                start_instance(inst, task, item_id, handler, ctx)
            }
            WorkItemStatus::Executing => Err(EngineError::AlreadyStarted(item_id.to_string())),
            other => Err(EngineError::IllegalTransition {
                work_item: item_id.to_string(),
                detail: format!("cannot start from {other:?}"),
            }),
        }
    }

    /// Complete an executing work item. Permitted while Normal or
    /// Suspending (an in-flight completion finishes its data writes); the
    /// follow-up kick is a no-op unless the case is Normal.
    pub fn complete_item(
        &mut self,
        spec: &Specification,
        ctx: &mut StepCtx<'_>,
        item_id: &str,
        output: Value,
        flag: CompletionFlag,
    ) -> EngineResult<CompleteOutcome> {
        if !matches!(
            self.status,
            RunnerStatus::Normal | RunnerStatus::Suspending
        ) {
            return Err(EngineError::IllegalCaseState {
                case: self.case_id.clone(),
                detail: format!("cannot complete work items while {:?}", self.status),
            });
        }

        let item = ctx
            .repo
            .get(item_id)
            .ok_or_else(|| EngineError::not_found("work item", item_id))?
            .clone();

        let net_root = item.net_root.clone();
        let (inst, data) = self
            .inst_mut(&net_root)
            .ok_or_else(|| EngineError::not_found("net instance", net_root.to_string()))?;
        let net = spec
            .net(&inst.net_id)
            .ok_or_else(|| EngineError::not_found("net", inst.net_id.clone()))?;
        let task = net
            .task(&item.task)
            .ok_or_else(|| EngineError::not_found("task", item.task.clone()))?;

        complete_instance(net, inst, data, task, item_id, output, flag, ctx)
    }

    /// Grow a dynamic multi-instance task by one child, up to `max`. This
    /// is the explicit policy hook; the runner never calls it.
    pub fn add_instance(
        &mut self,
        spec: &Specification,
        ctx: &mut StepCtx<'_>,
        parent_item_id: &str,
    ) -> EngineResult<crate::types::WorkItemId> {
        let parent = ctx
            .repo
            .get(parent_item_id)
            .ok_or_else(|| EngineError::not_found("work item", parent_item_id))?
            .clone();
        if parent.status != WorkItemStatus::Parent {
            return Err(EngineError::IllegalTransition {
                work_item: parent_item_id.to_string(),
                detail: "add_instance requires the multi-instance parent item".to_string(),
            });
        }

        let net_root = parent.net_root.clone();
        let (inst, data) = self
            .inst_mut(&net_root)
            .ok_or_else(|| EngineError::not_found("net instance", net_root.to_string()))?;
        let net = spec
            .net(&inst.net_id)
            .ok_or_else(|| EngineError::not_found("net", inst.net_id.clone()))?;
        let task = net
            .task(&parent.task)
            .ok_or_else(|| EngineError::not_found("task", parent.task.clone()))?;

        let Some(mi) = task.multi_instance else {
            return Err(EngineError::IllegalTransition {
                work_item: parent_item_id.to_string(),
                detail: "task is not multi-instance".to_string(),
            });
        };
        if mi.creation != crate::types::CreationMode::Dynamic {
            return Err(EngineError::IllegalTransition {
                work_item: parent_item_id.to_string(),
                detail: "task does not use dynamic instance creation".to_string(),
            });
        }

        let in_flight = inst
            .cm
            .marking()
            .count(&Place::internal(&task.id, InternalPlace::Active));
        let done = inst
            .cm
            .marking()
            .count(&Place::internal(&task.id, InternalPlace::Complete));
        if in_flight + done >= mi.max as usize {
            return Err(EngineError::IllegalTransition {
                work_item: parent_item_id.to_string(),
                detail: format!("instance limit max={} reached", mi.max),
            });
        }

        let profile = task.profile().cloned().ok_or_else(|| {
            EngineError::IllegalTransition {
                work_item: parent_item_id.to_string(),
                detail: "composite tasks cannot grow via add_instance".to_string(),
            }
        })?;
        let data_snapshot = data.clone();
        let child_id = firing::create_child_instance(
            inst,
            task,
            profile,
            &data_snapshot,
            parent_item_id,
            ctx,
        );
        ctx.events.push(EngineEvent::InstanceAdded {
            parent: parent_item_id.to_string(),
            item: child_id.clone(),
        });
        Ok(child_id)
    }

    // ─── Case-level transitions ───────────────────────────────

    pub fn suspend(&mut self, ctx: &mut StepCtx<'_>) -> EngineResult<()> {
        if self.status != RunnerStatus::Normal {
            return Err(EngineError::IllegalCaseState {
                case: self.case_id.clone(),
                detail: format!("cannot suspend from {:?}", self.status),
            });
        }
        // Normal → Suspending → Suspended. With the case lock held there
        // are no in-flight completes to wait out, so Suspending settles at
        // once.
        self.status = RunnerStatus::Suspended;
        ctx.events.push(EngineEvent::CaseSuspended {
            case: self.case_id.clone(),
        });
        Ok(())
    }

    pub fn resume(&mut self, ctx: &mut StepCtx<'_>) -> EngineResult<()> {
        if self.status != RunnerStatus::Suspended {
            return Err(EngineError::IllegalCaseState {
                case: self.case_id.clone(),
                detail: format!("cannot resume from {:?}", self.status),
            });
        }
        // Suspended → Resuming → Normal; the caller kicks immediately after.
        self.status = RunnerStatus::Normal;
        ctx.events.push(EngineEvent::CaseResumed {
            case: self.case_id.clone(),
        });
        Ok(())
    }

    /// Irreversible: cancel every live work item, purge every token, and
    /// mark the case Cancelling. The engine destroys the case afterwards.
    pub fn cancel(&mut self, ctx: &mut StepCtx<'_>) {
        self.status = RunnerStatus::Cancelling;

        let live: Vec<String> = ctx
            .repo
            .list_by_case(&self.case_id)
            .into_iter()
            .map(|i| i.id.clone())
            .collect();
        for id in live {
            if let Some(mut item) = ctx.repo.remove(&id) {
                if item.is_live() {
                    item.status = WorkItemStatus::CancelledByCase;
                    ctx.events.push(EngineEvent::WorkItemCancelled {
                        item: item.id.clone(),
                        reason: "case cancelled".to_string(),
                    });
                    firing::push_cancellation(&item, ctx);
                }
            }
        }

        let net_id = self.root.net_id.clone();
        let root_ident = self.root.root.clone();
        self.root = NetInstance::new_empty(net_id, root_ident);
        self.subnets.clear();

        ctx.events.push(EngineEvent::CaseCancelled {
            case: self.case_id.clone(),
        });
    }

}

// ─── Classification ───────────────────────────────────────────

/// One classification pass over a net instance: enable offers for newly
/// enabled tasks, fire composite tasks, withdraw offers whose join no
/// longer holds. Returns whether the marking or offer set changed.
fn classify_net(
    net: &NetSpec,
    inst: &mut NetInstance,
    data: &Value,
    ctx: &mut StepCtx<'_>,
    launches: &mut Vec<LaunchReq>,
) -> EngineResult<bool> {
    let mut changed = false;

    let task_ids: Vec<ElementId> = net.tasks().map(|t| t.id.clone()).collect();
    for task_id in task_ids {
        let task = net.task(&task_id).expect("listed task exists");
        let enabled = join_enabled(net, inst, ctx.cache, task);
        let busy = inst.task_busy(&task_id);

        if busy && !has_internal_tokens(inst, &task_id) {
            return Err(EngineError::InternalConsistency {
                case: inst.root.case_id(),
                detail: format!("task {task_id} flagged busy with empty internal places"),
            });
        }

        if enabled && !busy && !inst.enabled.contains(&task_id) {
            if task.is_composite() {
                let data_snapshot = data.clone();
                match fire_task(net, inst, &data_snapshot, task, ctx)? {
                    FireOutcome::LaunchSubNets(children) => {
                        for (child, subnet) in children {
                            launches.push(LaunchReq {
                                parent_root: inst.root.clone(),
                                parent_task: task_id.clone(),
                                child,
                                subnet,
                            });
                        }
                    }
                    _ => unreachable!("composite tasks launch sub-nets"),
                }
                changed = true;
            } else {
                offer_task(inst, task, data, ctx);
                changed = true;
            }
        } else if !enabled && !busy && inst.enabled.contains(&task_id) {
            withdraw_offer(inst, &task_id, ctx);
            changed = true;
        }
    }

    Ok(changed)
}

/// Create and announce the Enabled offer item for an atomic task.
fn offer_task(inst: &mut NetInstance, task: &TaskSpec, data: &Value, ctx: &mut StepCtx<'_>) {
    let profile = task
        .profile()
        .cloned()
        .expect("atomic tasks carry an execution profile");
    let item = WorkItem::new(
        inst.root.clone(),
        inst.root.clone(),
        &task.id,
        data.clone(),
        profile,
        task.timer_ms,
    );
    inst.enabled.insert(task.id.clone());
    ctx.events.push(EngineEvent::WorkItemEnabled {
        item: item.id.clone(),
        task: task.id.clone(),
    });
    firing::announce_enabled(&item, ctx);
    ctx.repo.insert(item);
}

/// Withdraw an offer whose join no longer holds: the token went elsewhere.
fn withdraw_offer(inst: &mut NetInstance, task_id: &str, ctx: &mut StepCtx<'_>) {
    inst.enabled.remove(task_id);
    let id = work_item_id(&inst.root, task_id);
    if let Some(mut item) = ctx.repo.remove(&id) {
        item.status = WorkItemStatus::Withdrawn;
        ctx.events.push(EngineEvent::WorkItemWithdrawn {
            item: item.id.clone(),
        });
        firing::push_cancellation(&item, ctx);
    }
}

fn has_internal_tokens(inst: &NetInstance, task: &str) -> bool {
    [
        InternalPlace::Entered,
        InternalPlace::Active,
        InternalPlace::Executing,
        InternalPlace::Complete,
    ]
    .iter()
    .any(|p| inst.cm.marking().marked(&Place::internal(task, *p)))
}

fn net_of<'s>(spec: &'s Specification, inst: &NetInstance) -> EngineResult<&'s NetSpec> {
    spec.net(&inst.net_id)
        .ok_or_else(|| EngineError::not_found("net", inst.net_id.clone()))
}

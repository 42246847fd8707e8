//! Task firing semantics: join evaluation, preset consumption, instance
//! creation, completion, and exit.
//!
//! These are the synchronous transitions of one net instance. The case
//! runner sequences them under the case lock; the engine persists state and
//! dispatches announcements around them.

use crate::announce::{route, Announcement, HandlerRegistry, Notice, Route};
use crate::data::{apply_output, OutputMapping, OutputSchema};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::marking::{CaseMarking, InternalPlace, Place};
use crate::reachability::OrJoinCache;
use crate::spec::model::{Decomposition, NetSpec, TaskSpec};
use crate::types::{
    now_ms, CompletionFlag, ElementId, IdentifierId, JoinCode, SplitCode, WorkItemStatus,
};
use crate::workitem::{WorkItem, WorkItemRepository};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

// ─── Net instance ─────────────────────────────────────────────

/// Runtime state of one net: the root net of a case or a composite sub-net.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetInstance {
    pub net_id: String,
    /// Root identifier of this instance: the case identifier for the root
    /// net, a child identifier for a sub-net.
    pub root: IdentifierId,
    pub cm: CaseMarking,
    /// Tasks currently holding a live offer work item.
    pub enabled: BTreeSet<ElementId>,
    /// Tasks with instances in flight (active internal place non-empty).
    pub busy: BTreeSet<ElementId>,
}

impl NetInstance {
    /// Seed a fresh instance: the root identifier sits in the input
    /// condition.
    pub fn new(net: &NetSpec, root: IdentifierId) -> Self {
        let mut cm = CaseMarking::with_root(root.clone());
        cm.add_location(&root, &Place::Condition(net.input_condition().clone()));
        Self {
            net_id: net.id.clone(),
            root,
            cm,
            enabled: BTreeSet::new(),
            busy: BTreeSet::new(),
        }
    }

    /// An instance with no tokens at all — the end state of a cancelled
    /// case.
    pub fn new_empty(net_id: String, root: IdentifierId) -> Self {
        Self {
            net_id,
            root: root.clone(),
            cm: CaseMarking::with_root(root),
            enabled: BTreeSet::new(),
            busy: BTreeSet::new(),
        }
    }

    /// The output condition holds the root identifier: this net is done.
    pub fn completed(&self, net: &NetSpec) -> bool {
        self.cm
            .marking()
            .idents(&Place::Condition(net.output_condition().clone()))
            .contains(&self.root)
    }

    pub fn task_busy(&self, task: &str) -> bool {
        self.busy.contains(task)
    }
}

// ─── Step context ─────────────────────────────────────────────

/// Mutable context threaded through one locked case step.
pub struct StepCtx<'a> {
    pub repo: &'a mut WorkItemRepository,
    pub events: &'a mut Vec<EngineEvent>,
    pub announcements: &'a mut Vec<Announcement>,
    pub registry: &'a HandlerRegistry,
    pub cache: &'a mut OrJoinCache,
    /// Who caused this step: a handler ref or "engine".
    pub actor: String,
}

// ─── Join evaluation ──────────────────────────────────────────

/// Is the task's join satisfied under the instance marking?
pub fn join_enabled(
    net: &NetSpec,
    inst: &NetInstance,
    cache: &mut OrJoinCache,
    task: &TaskSpec,
) -> bool {
    let preset = net.preset(&task.id);
    if preset.is_empty() {
        return false;
    }
    match task.join {
        JoinCode::And => preset
            .iter()
            .all(|c| inst.cm.marking().marked(&Place::Condition(c.clone()))),
        JoinCode::Xor => preset
            .iter()
            .any(|c| inst.cm.marking().marked(&Place::Condition(c.clone()))),
        JoinCode::Or => cache.decide(net, inst.cm.marking(), task),
    }
}

// ─── Firing ───────────────────────────────────────────────────

/// What `fire_task` asks the runner to do next.
#[derive(Debug)]
pub enum FireOutcome {
    /// Single-instance atomic task fired; its offer item is now Fired.
    Fired,
    /// Multi-instance task fired; children were created and announced.
    FiredChildren(Vec<crate::types::WorkItemId>),
    /// Composite task fired; the runner must instantiate one sub-net per
    /// child identifier.
    LaunchSubNets(Vec<(IdentifierId, String)>),
}

/// Consume the preset and create task instances. The caller establishes
/// that the join holds; re-firing a busy task is rejected here.
pub fn fire_task(
    net: &NetSpec,
    inst: &mut NetInstance,
    data: &Value,
    task: &TaskSpec,
    ctx: &mut StepCtx<'_>,
) -> EngineResult<FireOutcome> {
    if inst.task_busy(&task.id) {
        return Err(EngineError::IllegalTransition {
            work_item: crate::types::work_item_id(&inst.root, &task.id),
            detail: "task already has instances in flight".to_string(),
        });
    }

    consume_preset(net, inst, task);
    inst.enabled.remove(&task.id);
    inst.busy.insert(task.id.clone());

    match &task.decomposition {
        Decomposition::Composite { subnet } => {
            let count = task.multi_instance.map(|mi| mi.min).unwrap_or(1);
            let multi = task.multi_instance.is_some();

            if multi {
                // Umbrella item over the per-child composite items.
                let parent_id = crate::types::work_item_id(&inst.root, &task.id);
                let mut parent = WorkItem::new(
                    inst.root.clone(),
                    inst.root.clone(),
                    &task.id,
                    data.clone(),
                    crate::types::ExecutionProfile::manual(),
                    None,
                );
                parent.id = parent_id;
                parent.status = WorkItemStatus::Parent;
                ctx.repo.insert(parent);
            }

            let mut launches = Vec::new();
            for _ in 0..count {
                let child = inst
                    .cm
                    .spawn_child(&inst.root.clone())
                    .expect("net root exists in its own marking");
                inst.cm
                    .add_location(&child, &Place::internal(&task.id, InternalPlace::Active));
                inst.cm
                    .add_location(&child, &Place::internal(&task.id, InternalPlace::Executing));

                // The composite work item runs for as long as its sub-net
                // does. No announcement: nothing external holds it.
                let mut item = WorkItem::new(
                    child.clone(),
                    inst.root.clone(),
                    &task.id,
                    data.clone(),
                    crate::types::ExecutionProfile::manual(),
                    task.timer_ms,
                );
                if !multi {
                    item.id = crate::types::work_item_id(&inst.root, &task.id);
                }
                item.status = WorkItemStatus::Executing;
                item.started_at = Some(now_ms());
                ctx.repo.insert(item);

                launches.push((child, subnet.clone()));
            }
            Ok(FireOutcome::LaunchSubNets(launches))
        }
        Decomposition::Atomic { profile, .. } => match &task.multi_instance {
            None => {
                let root = inst.root.clone();
                inst.cm
                    .add_location(&root, &Place::internal(&task.id, InternalPlace::Entered));
                inst.cm
                    .add_location(&root, &Place::internal(&task.id, InternalPlace::Active));

                let offer_id = crate::types::work_item_id(&root, &task.id);
                if let Some(offer) = ctx.repo.get_mut(&offer_id) {
                    offer.status = WorkItemStatus::Fired;
                }
                Ok(FireOutcome::Fired)
            }
            Some(mi) => {
                let offer_id = crate::types::work_item_id(&inst.root, &task.id);
                if let Some(offer) = ctx.repo.get_mut(&offer_id) {
                    offer.status = WorkItemStatus::Parent;
                }

                let count = match mi.creation {
                    // Static and dynamic both begin at `min`; dynamic may
                    // grow later through the explicit add-instance hook.
                    crate::types::CreationMode::Static | crate::types::CreationMode::Dynamic => {
                        mi.min
                    }
                };

                let mut child_ids = Vec::new();
                for _ in 0..count {
                    let child_id =
                        create_child_instance(inst, task, profile.clone(), data, &offer_id, ctx);
                    child_ids.push(child_id);
                }
                Ok(FireOutcome::FiredChildren(child_ids))
            }
        },
    }
}

/// Create one multi-instance child: identifier into entered+active, Enabled
/// work item, announcement.
pub fn create_child_instance(
    inst: &mut NetInstance,
    task: &TaskSpec,
    profile: crate::types::ExecutionProfile,
    data: &Value,
    parent_item: &str,
    ctx: &mut StepCtx<'_>,
) -> crate::types::WorkItemId {
    let child = inst
        .cm
        .spawn_child(&inst.root.clone())
        .expect("net root exists in its own marking");
    inst.cm
        .add_location(&child, &Place::internal(&task.id, InternalPlace::Entered));
    inst.cm
        .add_location(&child, &Place::internal(&task.id, InternalPlace::Active));

    let mut item = WorkItem::new(
        child,
        inst.root.clone(),
        &task.id,
        data.clone(),
        profile,
        task.timer_ms,
    );
    item.parent = Some(parent_item.to_string());
    let item_id = item.id.clone();

    ctx.events.push(EngineEvent::WorkItemEnabled {
        item: item_id.clone(),
        task: task.id.clone(),
    });
    announce_enabled(&item, ctx);
    ctx.repo.insert(item);
    item_id
}

/// Token consumption per join code: AND from every preset condition,
/// XOR/OR from every preset condition that currently holds a token.
fn consume_preset(net: &NetSpec, inst: &mut NetInstance, task: &TaskSpec) {
    for cond in net.preset(&task.id) {
        let place = Place::Condition(cond.clone());
        match task.join {
            JoinCode::And => {
                inst.cm.remove_one(&place);
            }
            JoinCode::Xor | JoinCode::Or => {
                if inst.cm.marking().marked(&place) {
                    inst.cm.remove_one(&place);
                }
            }
        }
    }
}

/// Route an Enabled item and queue the resulting announcement. Blocked
/// routes leave the item Enabled and log the configuration problem.
pub fn announce_enabled(item: &WorkItem, ctx: &mut StepCtx<'_>) {
    match route(item, ctx.registry) {
        Route::Service { service_ref } => ctx.announcements.push(Announcement::Push {
            target: service_ref,
            notice: Notice::WorkItemEnabled(item.clone()),
        }),
        Route::Worklist { worklist_ref } => ctx.announcements.push(Announcement::Push {
            target: worklist_ref,
            notice: Notice::WorkItemEnabled(item.clone()),
        }),
        Route::Codelet { codelet } => ctx.announcements.push(Announcement::RunCodelet {
            item: item.id.clone(),
            codelet,
        }),
        Route::Blocked { reason } => {
            tracing::warn!(item = %item.id, %reason, "work item has no reachable handler");
            if let Some(service_ref) = &item.profile.service_ref {
                ctx.events.push(EngineEvent::HandlerUnavailable {
                    item: item.id.clone(),
                    service_ref: service_ref.clone(),
                });
            }
        }
    }
}

// ─── Starting ─────────────────────────────────────────────────

/// Move one instance identifier entered → executing; the item becomes
/// Executing via the instantaneous Fired state.
pub fn start_instance(
    inst: &mut NetInstance,
    task: &TaskSpec,
    item_id: &str,
    handler: Option<String>,
    ctx: &mut StepCtx<'_>,
) -> EngineResult<()> {
    let item = ctx
        .repo
        .get_mut(item_id)
        .ok_or_else(|| EngineError::not_found("work item", item_id))?;

    match item.status {
        WorkItemStatus::Enabled | WorkItemStatus::Fired => {}
        WorkItemStatus::Executing => return Err(EngineError::AlreadyStarted(item_id.to_string())),
        other => {
            return Err(EngineError::IllegalTransition {
                work_item: item_id.to_string(),
                detail: format!("cannot start from {other:?}"),
            })
        }
    }

    item.status = WorkItemStatus::Executing;
    item.started_at = Some(now_ms());
    item.handler = handler.clone();
    let ident = item.ident.clone();

    inst.cm.move_location(
        &ident,
        &Place::internal(&task.id, InternalPlace::Entered),
        &Place::internal(&task.id, InternalPlace::Executing),
    );

    ctx.events.push(EngineEvent::WorkItemStarted {
        item: item_id.to_string(),
        handler,
    });
    Ok(())
}

// ─── Completion & exit ────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// Instance recorded; the task still waits for more instances.
    Recorded,
    /// The exit test passed and the task exited.
    Exited,
}

/// Complete one executing instance: validate output, run mappings, migrate
/// the identifier, and run the exit test.
pub fn complete_instance(
    net: &NetSpec,
    inst: &mut NetInstance,
    data: &mut Value,
    task: &TaskSpec,
    item_id: &str,
    output: Value,
    flag: CompletionFlag,
    ctx: &mut StepCtx<'_>,
) -> EngineResult<CompleteOutcome> {
    let item = ctx
        .repo
        .get_mut(item_id)
        .ok_or_else(|| EngineError::not_found("work item", item_id))?;

    if item.status != WorkItemStatus::Executing {
        return Err(EngineError::IllegalTransition {
            work_item: item_id.to_string(),
            detail: format!("cannot complete from {:?}", item.status),
        });
    }

    // Force-complete is an administrative override: it skips the declared
    // schema but still runs the mappings.
    if flag == CompletionFlag::Normal {
        if let Err(reason) = output_schema(task).validate(&output) {
            item.status = WorkItemStatus::Failed;
            item.output = Some(output);
            ctx.events.push(EngineEvent::WorkItemFailed {
                item: item_id.to_string(),
                reason: reason.clone(),
            });
            return Err(EngineError::DataValidation {
                work_item: item_id.to_string(),
                reason,
            });
        }
    }

    apply_output(data, &output, output_mappings(task));

    item.status = match flag {
        CompletionFlag::Normal => WorkItemStatus::Complete,
        CompletionFlag::Force => WorkItemStatus::ForcedComplete,
    };
    item.completed_at = Some(now_ms());
    item.output = Some(output);
    let ident = item.ident.clone();
    let forced = flag == CompletionFlag::Force;

    inst.cm.move_location(
        &ident,
        &Place::internal(&task.id, InternalPlace::Executing),
        &Place::internal(&task.id, InternalPlace::Complete),
    );
    inst.cm
        .remove_location(&ident, &Place::internal(&task.id, InternalPlace::Active));

    ctx.events.push(EngineEvent::WorkItemCompleted {
        item: item_id.to_string(),
        forced,
    });

    if exit_enabled(inst, task) {
        exit_task(net, inst, data, task, ctx)?;
        Ok(CompleteOutcome::Exited)
    } else {
        Ok(CompleteOutcome::Recorded)
    }
}

/// `t_isExitEnabled`: enough instances reached the complete place, and —
/// under `wait_for_all` — none are still in flight.
pub fn exit_enabled(inst: &NetInstance, task: &TaskSpec) -> bool {
    let complete = inst
        .cm
        .marking()
        .count(&Place::internal(&task.id, InternalPlace::Complete));
    let threshold = task
        .multi_instance
        .map(|mi| mi.threshold as usize)
        .unwrap_or(1);
    if complete < threshold {
        return false;
    }
    if task.multi_instance.is_some_and(|mi| mi.wait_for_all) {
        let in_flight = inst
            .cm
            .marking()
            .count(&Place::internal(&task.id, InternalPlace::Active));
        if in_flight > 0 {
            return false;
        }
    }
    true
}

/// Exit: purge the cancellation region, produce the postset, destroy the
/// instance family.
pub fn exit_task(
    net: &NetSpec,
    inst: &mut NetInstance,
    data: &Value,
    task: &TaskSpec,
    ctx: &mut StepCtx<'_>,
) -> EngineResult<()> {
    // 1. Cancellation region.
    for element in task.cancellation_region.clone() {
        if let Some(victim) = net.task(&element) {
            cancel_task(inst, victim, "cancellation region", ctx);
        } else if net.condition(&element).is_some() {
            inst.cm.remove_all(&Place::Condition(element));
        }
    }

    // 2. Postset per split code.
    produce_postset(net, inst, data, task, ctx);

    // 3. Destroy instance identifiers and the work-item family.
    purge_instances(inst, &task.id, WorkItemStatus::Discarded, None, ctx);
    inst.busy.remove(&task.id);

    ctx.events.push(EngineEvent::TaskExited {
        case: inst.root.case_id(),
        task: task.id.clone(),
    });
    Ok(())
}

/// Cancel a task mid-flight: live work items → CancelledByCase, internal
/// places purged, announcements pushed to whoever held the items.
pub fn cancel_task(inst: &mut NetInstance, task: &TaskSpec, reason: &str, ctx: &mut StepCtx<'_>) {
    purge_instances(
        inst,
        &task.id,
        WorkItemStatus::CancelledByCase,
        Some(reason),
        ctx,
    );
    inst.busy.remove(&task.id);
    inst.enabled.remove(&task.id);
}

/// Remove every identifier from a task's internal places and destroy its
/// work-item family. Items still live take `live_status` on the way out;
/// `notice_reason` additionally pushes a cancellation notice.
fn purge_instances(
    inst: &mut NetInstance,
    task: &str,
    live_status: WorkItemStatus,
    notice_reason: Option<&str>,
    ctx: &mut StepCtx<'_>,
) {
    for place in [
        InternalPlace::Entered,
        InternalPlace::Active,
        InternalPlace::Executing,
        InternalPlace::Complete,
    ] {
        let place = Place::internal(task, place);
        let idents: Vec<IdentifierId> = inst.cm.marking().idents(&place).to_vec();
        for ident in idents {
            if ident == inst.root {
                inst.cm.remove_location(&ident, &place);
            } else {
                inst.cm.destroy(&ident);
            }
        }
    }

    let item_ids: Vec<String> = ctx
        .repo
        .list_by_case(&inst.root.case_id())
        .into_iter()
        .filter(|i| i.task == task && i.net_root == inst.root)
        .map(|i| i.id.clone())
        .collect();
    for id in item_ids {
        let Some(mut item) = ctx.repo.remove(&id) else {
            continue;
        };
        if item.is_live() {
            item.status = live_status;
            if let Some(reason) = notice_reason {
                ctx.events.push(EngineEvent::WorkItemCancelled {
                    item: item.id.clone(),
                    reason: reason.to_string(),
                });
                push_cancellation(&item, ctx);
            }
        }
    }
}

/// Tell whoever knows about an item that it is gone: the holder if it is a
/// registered handler, else the task's service, else the default worklist.
pub fn push_cancellation(item: &WorkItem, ctx: &mut StepCtx<'_>) {
    let candidates = [
        item.handler.clone(),
        item.profile.service_ref.clone(),
        ctx.registry.default_worklist().map(str::to_string),
    ];
    for target in candidates.into_iter().flatten() {
        if ctx.registry.handler(&target).is_some() {
            ctx.announcements.push(Announcement::Push {
                target,
                notice: Notice::WorkItemCancelled(item.clone()),
            });
            return;
        }
    }
}

/// Produce postset tokens for the net-instance root identifier.
fn produce_postset(
    net: &NetSpec,
    inst: &mut NetInstance,
    data: &Value,
    task: &TaskSpec,
    ctx: &mut StepCtx<'_>,
) {
    let root = inst.root.clone();
    let mut targets: Vec<ElementId> = Vec::new();

    match task.split {
        SplitCode::And => {
            targets.extend(task.flows.iter().map(|f| f.target.clone()));
        }
        SplitCode::Or => {
            for flow in task.flows.iter().filter(|f| !f.is_default) {
                if eval_flow(inst, task, flow, data, ctx) {
                    targets.push(flow.target.clone());
                }
            }
            if targets.is_empty() {
                if let Some(default) = task.flows.iter().find(|f| f.is_default) {
                    targets.push(default.target.clone());
                }
            }
        }
        SplitCode::Xor => {
            let mut flows: Vec<_> = task.flows.iter().filter(|f| !f.is_default).collect();
            flows.sort_by_key(|f| f.priority);
            let chosen = flows
                .into_iter()
                .find(|f| eval_flow(inst, task, f, data, ctx))
                .map(|f| f.target.clone())
                .or_else(|| {
                    task.flows
                        .iter()
                        .find(|f| f.is_default)
                        .map(|f| f.target.clone())
                });
            targets.extend(chosen);
        }
    }

    // Single-flow tasks may carry no predicate regardless of split code.
    if targets.is_empty() && task.flows.len() == 1 {
        targets.push(task.flows[0].target.clone());
    }

    for target in targets {
        if net.condition(&target).is_some() {
            inst.cm.add_location(&root, &Place::Condition(target));
        }
    }
}

fn eval_flow(
    inst: &NetInstance,
    task: &TaskSpec,
    flow: &crate::spec::model::FlowSpec,
    data: &Value,
    ctx: &mut StepCtx<'_>,
) -> bool {
    let Some(predicate) = &flow.predicate else {
        // A non-default flow without predicate is unconditional (AND-ish);
        // the verifier forbids this shape for OR/XOR splits with >1 flow.
        return true;
    };
    match predicate.eval(data) {
        Ok(holds) => holds,
        Err(err) => {
            ctx.events.push(EngineEvent::PredicateError {
                case: inst.root.case_id(),
                task: task.id.clone(),
                target: flow.target.clone(),
                reason: err.to_string(),
            });
            tracing::warn!(task = %task.id, target = %flow.target, error = %err,
                "predicate evaluation failed; treating as false");
            false
        }
    }
}

fn output_schema(task: &TaskSpec) -> &OutputSchema {
    static EMPTY: OutputSchema = OutputSchema { fields: Vec::new() };
    match &task.decomposition {
        Decomposition::Atomic { output_schema, .. } => output_schema,
        Decomposition::Composite { .. } => &EMPTY,
    }
}

fn output_mappings(task: &TaskSpec) -> &[OutputMapping] {
    match &task.decomposition {
        Decomposition::Atomic {
            output_mappings, ..
        } => output_mappings,
        Decomposition::Composite { .. } => &[],
    }
}

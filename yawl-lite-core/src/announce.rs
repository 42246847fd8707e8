//! Announcer, handler registry, and codelets.
//!
//! The announcer maps a newly enabled work item to its execution profile and
//! decides where it goes: a named service, an in-process codelet, or the
//! default human worklist. Codelets run inline under the case lock; service
//! and worklist announcements are dispatched by the engine after the state
//! they describe has been flushed.

use crate::types::{CaseId, Interaction, WorkItemId};
use crate::workitem::WorkItem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

// ─── Handler registry (C10) ───────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    DefaultWorklist,
    CustomService,
    Codelet,
}

/// Descriptor of a registered external handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandlerRef {
    /// Unique reference (URI or internal id). Tasks point here via
    /// `service_ref`.
    pub reference: String,
    pub display_name: String,
    pub kind: HandlerKind,
    /// Announcement endpoint description, opaque to the engine.
    pub endpoint: Option<String>,
}

/// Push announcement delivered to a registered handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Notice {
    WorkItemEnabled(WorkItem),
    WorkItemCancelled(WorkItem),
    CaseCompleted { case: CaseId, data: Value },
}

/// Receives push announcements. Implementations wrap whatever transport the
/// deployment uses; they may also pull live work items to re-sync.
#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    async fn notify(&self, notice: Notice) -> anyhow::Result<()>;
}

/// In-process handler executed synchronously on the runner's thread. Its
/// return value completes the work item directly, with no external
/// round-trip.
pub trait Codelet: Send + Sync {
    fn run(&self, input: &Value) -> anyhow::Result<Value>;
}

/// Registry of named services and inline codelets.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, (HandlerRef, Arc<dyn WorkItemHandler>)>,
    codelets: BTreeMap<String, Arc<dyn Codelet>>,
    default_worklist: Option<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A `DefaultWorklist` registration becomes the
    /// target for manual tasks without a service ref.
    pub fn register(&mut self, handler_ref: HandlerRef, handler: Arc<dyn WorkItemHandler>) {
        if handler_ref.kind == HandlerKind::DefaultWorklist {
            self.default_worklist = Some(handler_ref.reference.clone());
        }
        self.handlers
            .insert(handler_ref.reference.clone(), (handler_ref, handler));
    }

    pub fn unregister(&mut self, reference: &str) -> bool {
        if self.default_worklist.as_deref() == Some(reference) {
            self.default_worklist = None;
        }
        self.handlers.remove(reference).is_some()
    }

    pub fn register_codelet(&mut self, name: impl Into<String>, codelet: Arc<dyn Codelet>) {
        self.codelets.insert(name.into(), codelet);
    }

    pub fn handler(&self, reference: &str) -> Option<&Arc<dyn WorkItemHandler>> {
        self.handlers.get(reference).map(|(_, h)| h)
    }

    pub fn codelet(&self, name: &str) -> Option<&Arc<dyn Codelet>> {
        self.codelets.get(name)
    }

    pub fn default_worklist(&self) -> Option<&str> {
        self.default_worklist.as_deref()
    }

    pub fn descriptors(&self) -> Vec<HandlerRef> {
        self.handlers.values().map(|(r, _)| r.clone()).collect()
    }

    pub fn known_refs(&self) -> std::collections::BTreeSet<String> {
        self.handlers.keys().cloned().collect()
    }
}

// ─── Routing (C7) ─────────────────────────────────────────────

/// Where an enabled work item goes. `Blocked` keeps the item Enabled until
/// an administrator or a late handler registration intervenes.
#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    Service { service_ref: String },
    Codelet { codelet: String },
    Worklist { worklist_ref: String },
    Blocked { reason: String },
}

/// Announcement queued during a locked case step, dispatched afterwards.
#[derive(Clone, Debug, PartialEq)]
pub enum Announcement {
    /// Push a notice to a named handler.
    Push { target: String, notice: Notice },
    /// Execute a codelet inline and complete the item with its output.
    RunCodelet {
        item: WorkItemId,
        codelet: String,
    },
}

/// Resolve the execution profile of an item against the registry, in the
/// fixed policy order: service ref, codelet, manual worklist.
pub fn route(item: &WorkItem, registry: &HandlerRegistry) -> Route {
    if let Some(service_ref) = &item.profile.service_ref {
        return if registry.handler(service_ref).is_some() {
            Route::Service {
                service_ref: service_ref.clone(),
            }
        } else {
            Route::Blocked {
                reason: format!("service_ref `{service_ref}` is not registered"),
            }
        };
    }
    if let Some(codelet) = &item.profile.codelet {
        return if registry.codelet(codelet).is_some() {
            Route::Codelet {
                codelet: codelet.clone(),
            }
        } else {
            Route::Blocked {
                reason: format!("codelet `{codelet}` is not registered"),
            }
        };
    }
    if item.profile.interaction == Interaction::Manual {
        return match registry.default_worklist() {
            Some(worklist) => Route::Worklist {
                worklist_ref: worklist.to_string(),
            },
            None => Route::Blocked {
                reason: "no default worklist handler registered".to_string(),
            },
        };
    }
    Route::Blocked {
        reason: "automated task with neither service_ref nor codelet".to_string(),
    }
}

//! In-memory control plane for tests.
//!
//! [`FakeCloud`] keeps parents and their attachments in memory, records
//! every call in order, and can be scripted to model interference from
//! other actors: conflict streaks on an attach target, children removed
//! or hidden behind the reconciler's back, failing actions, and actions
//! that never finish.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::Mutex;

use crate::action::{Action, ActionReporter};
use crate::client::{CloudClient, CloudError, ParentResource};
use crate::resource::{ChildRef, ParentRef};

/// One recorded client call, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(ParentRef),
    Attach(ParentRef, ChildRef),
    Detach(ParentRef, ChildRef),
}

#[derive(Debug, Clone)]
struct FakeParent {
    name: String,
    attachments: Vec<ChildRef>,
}

#[derive(Debug, Default)]
struct FakeState {
    parents: HashMap<ParentRef, FakeParent>,
    calls: Vec<Call>,
    /// Remaining conflict rejections per attach target.
    conflicts: HashMap<(ParentRef, ChildRef), u32>,
    /// Children whose next operation yields a failing action.
    failing: HashMap<ChildRef, String>,
    /// Children whose next operation yields an action that never finishes.
    stalled: Vec<ChildRef>,
    /// One-shot error injected into the next operation touching a child.
    rejections: HashMap<ChildRef, CloudError>,
    /// Children removed by "another actor": the next detach returns
    /// NotFound and drops the attachment.
    removed_elsewhere: Vec<ChildRef>,
    /// Children hidden from the next get, as if attached after the read.
    hidden: Vec<ChildRef>,
    /// Reporters parked to keep stalled action channels open.
    parked: Vec<ActionReporter>,
}

/// Scriptable in-memory control plane.
#[derive(Debug, Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parent with initial attachments.
    pub async fn put_parent(&self, parent: ParentRef, name: &str, attachments: Vec<ChildRef>) {
        self.state.lock().await.parents.insert(
            parent,
            FakeParent {
                name: name.to_string(),
                attachments,
            },
        );
    }

    /// Remove a parent, as if deleted by another actor.
    pub async fn drop_parent(&self, parent: &ParentRef) {
        self.state.lock().await.parents.remove(parent);
    }

    /// Reject the next `n` attach calls for `child` with a conflict.
    pub async fn conflict_attach(&self, parent: ParentRef, child: ChildRef, n: u32) {
        self.state.lock().await.conflicts.insert((parent, child), n);
    }

    /// Make the next operation touching `child` return a failing action.
    pub async fn fail_action(&self, child: ChildRef, message: &str) {
        self.state
            .lock()
            .await
            .failing
            .insert(child, message.to_string());
    }

    /// Make the next operation touching `child` return an action that
    /// never reaches a terminal status.
    pub async fn stall_action(&self, child: ChildRef) {
        self.state.lock().await.stalled.push(child);
    }

    /// Reject the next operation touching `child` with `error`.
    pub async fn reject_once(&self, child: ChildRef, error: CloudError) {
        self.state.lock().await.rejections.insert(child, error);
    }

    /// Pretend another actor removed `child`: the next detach for it
    /// returns NotFound and the attachment disappears.
    pub async fn removed_elsewhere(&self, child: ChildRef) {
        self.state.lock().await.removed_elsewhere.push(child);
    }

    /// Hide `child` from the next get, as if it was attached after the
    /// reader's snapshot was taken.
    pub async fn hide_on_next_get(&self, child: ChildRef) {
        self.state.lock().await.hidden.push(child);
    }

    /// Calls observed so far, in order.
    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    /// Attach/detach calls observed so far, in order.
    pub async fn mutations(&self) -> Vec<Call> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| !matches!(call, Call::Get(_)))
            .cloned()
            .collect()
    }

    /// Current attachments of a parent.
    pub async fn attachments(&self, parent: &ParentRef) -> Vec<ChildRef> {
        self.state
            .lock()
            .await
            .parents
            .get(parent)
            .map(|entry| entry.attachments.clone())
            .unwrap_or_default()
    }

    /// Build the action for an accepted operation, honoring failure and
    /// stall scripts.
    async fn finish(
        state: &mut FakeState,
        command: &str,
        parent: ParentRef,
        child: &ChildRef,
    ) -> Action {
        let (action, reporter) = Action::new(command, parent);
        if let Some(message) = state.failing.remove(child) {
            reporter.fail(message).await;
        } else if let Some(pos) = state.stalled.iter().position(|c| c == child) {
            state.stalled.remove(pos);
            state.parked.push(reporter);
        } else {
            reporter.running(100).await;
            reporter.success().await;
        }
        action
    }

    async fn attach(&self, parent: &ParentRef, child: ChildRef) -> Result<Action, CloudError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::Attach(*parent, child.clone()));

        if let Some(error) = state.rejections.remove(&child) {
            return Err(error);
        }
        if let Some(left) = state.conflicts.get_mut(&(*parent, child.clone())) {
            if *left > 0 {
                *left -= 1;
                return Err(CloudError::Conflict(format!("{} is busy", parent)));
            }
        }

        let Some(entry) = state.parents.get_mut(parent) else {
            return Err(CloudError::NotFound(parent.to_string()));
        };
        if entry.attachments.contains(&child) {
            return Err(CloudError::AlreadyAttached(child.to_string()));
        }
        entry.attachments.push(child.clone());

        let command = format!("attach_{}", child.kind_name());
        Ok(Self::finish(&mut state, &command, *parent, &child).await)
    }

    async fn detach(&self, parent: &ParentRef, child: ChildRef) -> Result<Action, CloudError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::Detach(*parent, child.clone()));

        if let Some(error) = state.rejections.remove(&child) {
            return Err(error);
        }
        if let Some(pos) = state.removed_elsewhere.iter().position(|c| *c == child) {
            state.removed_elsewhere.remove(pos);
            if let Some(entry) = state.parents.get_mut(parent) {
                entry.attachments.retain(|c| *c != child);
            }
            return Err(CloudError::NotFound(child.to_string()));
        }

        let Some(entry) = state.parents.get_mut(parent) else {
            return Err(CloudError::NotFound(parent.to_string()));
        };
        let Some(pos) = entry.attachments.iter().position(|c| *c == child) else {
            return Err(CloudError::NotFound(child.to_string()));
        };
        entry.attachments.remove(pos);

        let command = format!("detach_{}", child.kind_name());
        Ok(Self::finish(&mut state, &command, *parent, &child).await)
    }
}

#[async_trait]
impl CloudClient for FakeCloud {
    async fn get_parent(
        &self,
        parent: &ParentRef,
    ) -> Result<Option<ParentResource>, CloudError> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::Get(*parent));

        let (name, mut attachments) = match state.parents.get(parent) {
            Some(entry) => (entry.name.clone(), entry.attachments.clone()),
            None => return Ok(None),
        };
        if !state.hidden.is_empty() {
            attachments.retain(|c| !state.hidden.contains(c));
            state.hidden.clear();
        }
        Ok(Some(ParentResource {
            parent: *parent,
            name,
            attachments,
        }))
    }

    async fn attach_server(&self, parent: &ParentRef, id: i64) -> Result<Action, CloudError> {
        self.attach(parent, ChildRef::Server { id }).await
    }

    async fn attach_label_selector(
        &self,
        parent: &ParentRef,
        selector: &str,
    ) -> Result<Action, CloudError> {
        self.attach(
            parent,
            ChildRef::LabelSelector {
                selector: selector.to_string(),
            },
        )
        .await
    }

    async fn attach_ip(&self, parent: &ParentRef, ip: IpAddr) -> Result<Action, CloudError> {
        self.attach(parent, ChildRef::Ip { ip }).await
    }

    async fn attach_subnet(
        &self,
        parent: &ParentRef,
        network_id: i64,
        ip_range: IpNet,
    ) -> Result<Action, CloudError> {
        self.attach(
            parent,
            ChildRef::Subnet {
                network_id,
                ip_range,
            },
        )
        .await
    }

    async fn attach_route(
        &self,
        parent: &ParentRef,
        destination: IpNet,
        gateway: IpAddr,
    ) -> Result<Action, CloudError> {
        self.attach(
            parent,
            ChildRef::Route {
                destination,
                gateway,
            },
        )
        .await
    }

    async fn detach_server(&self, parent: &ParentRef, id: i64) -> Result<Action, CloudError> {
        self.detach(parent, ChildRef::Server { id }).await
    }

    async fn detach_label_selector(
        &self,
        parent: &ParentRef,
        selector: &str,
    ) -> Result<Action, CloudError> {
        self.detach(
            parent,
            ChildRef::LabelSelector {
                selector: selector.to_string(),
            },
        )
        .await
    }

    async fn detach_ip(&self, parent: &ParentRef, ip: IpAddr) -> Result<Action, CloudError> {
        self.detach(parent, ChildRef::Ip { ip }).await
    }

    async fn detach_subnet(
        &self,
        parent: &ParentRef,
        network_id: i64,
        ip_range: IpNet,
    ) -> Result<Action, CloudError> {
        self.detach(
            parent,
            ChildRef::Subnet {
                network_id,
                ip_range,
            },
        )
        .await
    }

    async fn detach_route(
        &self,
        parent: &ParentRef,
        destination: IpNet,
        gateway: IpAddr,
    ) -> Result<Action, CloudError> {
        self.detach(
            parent,
            ChildRef::Route {
                destination,
                gateway,
            },
        )
        .await
    }
}

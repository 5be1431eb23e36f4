//! Attachment reconciliation: one read-diff-apply-wait-persist cycle.
//!
//! The reconciler compares the declared attachment set with what the
//! control plane reports and issues the minimal detach/attach operations
//! to converge, tolerating interference from other actors on the same
//! parent: "already attached" and "already removed" responses count as
//! success, conflicts and locks are retried, and the control plane itself
//! serializes overlapping cycles.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::{wait_for_all, Action, ActionError};
use crate::client::{CloudClient, CloudError, ParentResource};
use crate::config::ReconcilerConfig;
use crate::diff::diff;
use crate::resource::{AttachmentSet, ChildRef, DesiredState, ObservedState, ParentRef};
use crate::retry::{RetryError, RetryPolicy};
use crate::store::{StateStore, StoreError};

/// Terminal error of one reconciliation cycle.
///
/// Every variant names the operation, the parent, and where applicable
/// the child, so the failure is actionable without log correlation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reading the parent resource failed.
    #[error("read {parent}: {source}")]
    Read {
        parent: ParentRef,
        source: CloudError,
    },

    /// Attaching a child failed permanently or exhausted its retries.
    #[error("attach {child} to {parent}: {source}")]
    Attach {
        parent: ParentRef,
        child: ChildRef,
        source: CloudError,
    },

    /// Detaching a child failed permanently or exhausted its retries.
    #[error("detach {child} from {parent}: {source}")]
    Detach {
        parent: ParentRef,
        child: ChildRef,
        source: CloudError,
    },

    /// The child kind cannot be attached to this parent kind.
    #[error("{child} cannot be attached to {parent}")]
    UnsupportedChild { parent: ParentRef, child: ChildRef },

    /// An accepted action reported failure.
    #[error(transparent)]
    Action(#[from] ActionError),

    /// Recording observed state failed.
    #[error("recording state for {parent}: {source}")]
    Store {
        parent: ParentRef,
        source: StoreError,
    },

    /// The cycle was cancelled between operations.
    #[error("cancelled while reconciling {parent}")]
    Cancelled { parent: ParentRef },
}

/// Reconciles declared attachments for one parent resource at a time.
///
/// Holds no per-cycle state; one instance may serve many concurrent
/// cycles. Cycles racing on the same parent are serialized by the control
/// plane through conflict and lock errors, which the retry policy
/// absorbs; there is no client-side locking.
pub struct AttachmentReconciler<C> {
    client: Arc<C>,
    retry: RetryPolicy,
    store: Option<Arc<dyn StateStore>>,
}

impl<C: CloudClient> AttachmentReconciler<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
            store: None,
        }
    }

    /// Replace the default retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Apply the retry settings from a [`ReconcilerConfig`].
    pub fn with_config(self, config: &ReconcilerConfig) -> Self {
        self.with_retry(config.retry_policy())
    }

    /// Record checkpoints and observed state into `store`.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run one reconciliation cycle.
    ///
    /// Returns the refreshed observed state, or `Ok(None)` when the
    /// parent no longer exists. The parent's lifecycle is owned elsewhere,
    /// so that case is nothing to do. A failed cycle leaves whatever
    /// partial state its completed operations produced; running the same
    /// cycle again is the recovery path.
    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
        desired: &DesiredState,
    ) -> Result<Option<ObservedState>, ReconcileError> {
        let parent = desired.parent;

        // Reject impossible children before touching the control plane.
        for child in desired.attachments.iter() {
            if !child.attaches_to(parent.kind) {
                return Err(ReconcileError::UnsupportedChild {
                    parent,
                    child: child.clone(),
                });
            }
        }

        // Read
        let Some(resource) = self.get(&parent).await? else {
            info!("{} is gone, nothing to reconcile", parent);
            self.clear_record(&parent).await?;
            return Ok(None);
        };
        let observed: AttachmentSet = resource.attachments.into_iter().collect();

        // Diff
        let diff = diff(&desired.attachments, &observed);
        if diff.is_converged() {
            debug!(
                "{} already converged ({} attachment(s))",
                parent,
                observed.len()
            );
            let state = ObservedState::now(parent, observed);
            self.record(&state).await?;
            return Ok(Some(state));
        }
        info!(
            "reconciling {}: {} to remove, {} to add",
            parent,
            diff.to_remove.len(),
            diff.to_add.len()
        );

        // Apply removals strictly before additions: several parent kinds
        // reject an addition that collides with a member still pending
        // removal.
        let mut actions = Vec::new();
        for child in diff.to_remove.iter() {
            if cancel.is_cancelled() {
                return Err(ReconcileError::Cancelled { parent });
            }
            if let Some(action) = self.detach(&parent, child).await? {
                actions.push(action);
            }
        }
        for child in diff.to_add.iter() {
            if cancel.is_cancelled() {
                return Err(ReconcileError::Cancelled { parent });
            }
            if let Some(action) = self.attach(&parent, child).await? {
                actions.push(action);
            }
        }

        // Checkpoint the expected post-apply set before waiting, so an
        // interrupted cycle can be resumed or cleaned up instead of
        // orphaning what the accepted operations produce.
        self.record(&ObservedState::now(parent, desired.attachments.clone()))
            .await?;

        // Wait
        wait_for_all(cancel, actions).await?;

        // Persist: the pre-apply read is stale by now.
        let Some(resource) = self.get(&parent).await? else {
            warn!("{} vanished while reconciling", parent);
            self.clear_record(&parent).await?;
            return Ok(None);
        };
        let state = ObservedState::now(parent, resource.attachments.into_iter().collect());
        self.record(&state).await?;
        info!(
            "{} reconciled: {} attachment(s)",
            parent,
            state.attachments.len()
        );
        Ok(Some(state))
    }

    /// Converge the parent to an empty attachment set.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        parent: ParentRef,
    ) -> Result<Option<ObservedState>, ReconcileError> {
        self.reconcile(cancel, &DesiredState::empty(parent)).await
    }

    async fn get(&self, parent: &ParentRef) -> Result<Option<ParentResource>, ReconcileError> {
        self.client
            .get_parent(parent)
            .await
            .map_err(|source| ReconcileError::Read {
                parent: *parent,
                source,
            })
    }

    /// Detach one child through the retry policy.
    ///
    /// Returns `Ok(None)` when there is nothing to wait for: another
    /// actor already removed the child, or the attempt budget is zero.
    async fn detach(
        &self,
        parent: &ParentRef,
        child: &ChildRef,
    ) -> Result<Option<Action>, ReconcileError> {
        debug!("detaching {} from {}", child, parent);
        let outcome = self
            .retry
            .run(|| {
                let client = Arc::clone(&self.client);
                let parent = *parent;
                let child = child.clone();
                async move {
                    let call = match &child {
                        ChildRef::Server { id } => client.detach_server(&parent, *id).await,
                        ChildRef::LabelSelector { selector } => {
                            client.detach_label_selector(&parent, selector).await
                        }
                        ChildRef::Ip { ip } => client.detach_ip(&parent, *ip).await,
                        ChildRef::Subnet {
                            network_id,
                            ip_range,
                        } => client.detach_subnet(&parent, *network_id, *ip_range).await,
                        ChildRef::Route {
                            destination,
                            gateway,
                        } => client.detach_route(&parent, *destination, *gateway).await,
                    };
                    match call {
                        Ok(action) => Ok(Some(action)),
                        Err(e) if e.is_detached_already() => {
                            // Another actor got there first; that is the
                            // outcome we wanted.
                            warn!("{} was already detached from {}", child, parent);
                            Ok(None)
                        }
                        Err(e) if e.is_retryable() => Err(RetryError::Transient(e)),
                        Err(e) => Err(RetryError::Abort(e)),
                    }
                }
            })
            .await;
        match outcome {
            Ok(completed) => Ok(completed.flatten()),
            Err(source) => Err(ReconcileError::Detach {
                parent: *parent,
                child: child.clone(),
                source,
            }),
        }
    }

    /// Attach one child through the retry policy.
    ///
    /// Returns `Ok(None)` when there is nothing to wait for: the child is
    /// already attached, or the attempt budget is zero.
    async fn attach(
        &self,
        parent: &ParentRef,
        child: &ChildRef,
    ) -> Result<Option<Action>, ReconcileError> {
        debug!("attaching {} to {}", child, parent);
        let outcome = self
            .retry
            .run(|| {
                let client = Arc::clone(&self.client);
                let parent = *parent;
                let child = child.clone();
                async move {
                    let call = match &child {
                        ChildRef::Server { id } => client.attach_server(&parent, *id).await,
                        ChildRef::LabelSelector { selector } => {
                            client.attach_label_selector(&parent, selector).await
                        }
                        ChildRef::Ip { ip } => client.attach_ip(&parent, *ip).await,
                        ChildRef::Subnet {
                            network_id,
                            ip_range,
                        } => client.attach_subnet(&parent, *network_id, *ip_range).await,
                        ChildRef::Route {
                            destination,
                            gateway,
                        } => client.attach_route(&parent, *destination, *gateway).await,
                    };
                    match call {
                        Ok(action) => Ok(Some(action)),
                        Err(e) if e.is_attached_already() => {
                            debug!("{} is already attached to {}", child, parent);
                            Ok(None)
                        }
                        Err(e) if e.is_retryable() => Err(RetryError::Transient(e)),
                        Err(e) => Err(RetryError::Abort(e)),
                    }
                }
            })
            .await;
        match outcome {
            Ok(completed) => Ok(completed.flatten()),
            Err(source) => Err(ReconcileError::Attach {
                parent: *parent,
                child: child.clone(),
                source,
            }),
        }
    }

    async fn record(&self, state: &ObservedState) -> Result<(), ReconcileError> {
        if let Some(store) = &self.store {
            store
                .record(state)
                .await
                .map_err(|source| ReconcileError::Store {
                    parent: state.parent,
                    source,
                })?;
        }
        Ok(())
    }

    async fn clear_record(&self, parent: &ParentRef) -> Result<(), ReconcileError> {
        if let Some(store) = &self.store {
            store
                .clear(parent)
                .await
                .map_err(|source| ReconcileError::Store {
                    parent: *parent,
                    source,
                })?;
        }
        Ok(())
    }
}

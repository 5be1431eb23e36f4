//! Control-plane client interface.
//!
//! The remote API is consumed through [`CloudClient`]; implementations
//! wrap whatever transport the deployment uses. A client must be safe for
//! concurrent use by independent reconciliation cycles and must not cache
//! parent state between calls; contention on a parent is signalled by
//! the control plane through [`CloudError::Conflict`] and
//! [`CloudError::Locked`], never resolved client-side.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;

use crate::action::Action;
use crate::resource::{ChildRef, ParentRef};

/// Machine-readable error codes returned by the control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another operation on the same resource is in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The resource is locked by the control plane.
    #[error("locked: {0}")]
    Locked(String),

    /// The child is already attached to the parent.
    #[error("already attached: {0}")]
    AlreadyAttached(String),

    /// The child is already detached from the parent.
    #[error("already removed: {0}")]
    AlreadyRemoved(String),

    /// The request was rejected as invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Transient service-side failure.
    #[error("service error: {0}")]
    ServiceError(String),
}

impl CloudError {
    /// Transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CloudError::Conflict(_) | CloudError::Locked(_) | CloudError::ServiceError(_)
        )
    }

    /// Responses to a detach that mean the work is already done.
    pub fn is_detached_already(&self) -> bool {
        matches!(self, CloudError::AlreadyRemoved(_) | CloudError::NotFound(_))
    }

    /// Responses to an attach that mean the work is already done.
    pub fn is_attached_already(&self) -> bool {
        matches!(self, CloudError::AlreadyAttached(_))
    }
}

/// A parent resource as read from the control plane.
#[derive(Debug, Clone)]
pub struct ParentResource {
    pub parent: ParentRef,
    pub name: String,
    /// Attachments as listed by the control plane; callers collect them
    /// into an [`AttachmentSet`](crate::resource::AttachmentSet).
    pub attachments: Vec<ChildRef>,
}

/// Client for the remote control plane.
///
/// Every mutation is asynchronous on the remote side: the returned
/// [`Action`] completes (or fails) later and must be waited on.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Fetch a parent resource. `Ok(None)` means it does not exist.
    async fn get_parent(&self, parent: &ParentRef)
        -> Result<Option<ParentResource>, CloudError>;

    /// Attach a server by id.
    async fn attach_server(&self, parent: &ParentRef, id: i64) -> Result<Action, CloudError>;

    /// Attach all servers matching a label selector.
    async fn attach_label_selector(
        &self,
        parent: &ParentRef,
        selector: &str,
    ) -> Result<Action, CloudError>;

    /// Attach a public IP target.
    async fn attach_ip(&self, parent: &ParentRef, ip: IpAddr) -> Result<Action, CloudError>;

    /// Attach a subnet of a network.
    async fn attach_subnet(
        &self,
        parent: &ParentRef,
        network_id: i64,
        ip_range: IpNet,
    ) -> Result<Action, CloudError>;

    /// Attach a static route.
    async fn attach_route(
        &self,
        parent: &ParentRef,
        destination: IpNet,
        gateway: IpAddr,
    ) -> Result<Action, CloudError>;

    /// Detach a server by id.
    async fn detach_server(&self, parent: &ParentRef, id: i64) -> Result<Action, CloudError>;

    /// Detach a label selector.
    async fn detach_label_selector(
        &self,
        parent: &ParentRef,
        selector: &str,
    ) -> Result<Action, CloudError>;

    /// Detach a public IP target.
    async fn detach_ip(&self, parent: &ParentRef, ip: IpAddr) -> Result<Action, CloudError>;

    /// Detach a subnet.
    async fn detach_subnet(
        &self,
        parent: &ParentRef,
        network_id: i64,
        ip_range: IpNet,
    ) -> Result<Action, CloudError>;

    /// Detach a static route.
    async fn detach_route(
        &self,
        parent: &ParentRef,
        destination: IpNet,
        gateway: IpAddr,
    ) -> Result<Action, CloudError>;
}

//! Parent and child resource identities and attachment state.
//!
//! Child references are a tagged union: each variant is one attachable
//! kind, and equality is the variant plus its full payload. The tagged
//! serde representation means a declaration can only ever populate one
//! identity kind per reference.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Kind of parent resource that owns attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentKind {
    Firewall,
    LoadBalancer,
    Network,
}

impl ParentKind {
    /// Short name used in log and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentKind::Firewall => "firewall",
            ParentKind::LoadBalancer => "load balancer",
            ParentKind::Network => "network",
        }
    }
}

impl fmt::Display for ParentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a parent resource on the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub kind: ParentKind,
    pub id: i64,
}

impl ParentRef {
    pub fn new(kind: ParentKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn firewall(id: i64) -> Self {
        Self::new(ParentKind::Firewall, id)
    }

    pub fn load_balancer(id: i64) -> Self {
        Self::new(ParentKind::LoadBalancer, id)
    }

    pub fn network(id: i64) -> Self {
        Self::new(ParentKind::Network, id)
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// One attachable child, identified by kind plus payload.
///
/// Two references denote the same attachment iff the variant and every
/// payload field match exactly; no normalization happens beyond what the
/// control plane guarantees for the values it hands out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildRef {
    /// A server attached directly by id.
    Server { id: i64 },
    /// All servers matching a label selector expression.
    LabelSelector { selector: String },
    /// A public IP target.
    Ip { ip: IpAddr },
    /// A subnet of a network.
    Subnet { network_id: i64, ip_range: IpNet },
    /// A static route.
    Route { destination: IpNet, gateway: IpAddr },
}

impl ChildRef {
    /// Kind name, also used as the operation suffix in action commands.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ChildRef::Server { .. } => "server",
            ChildRef::LabelSelector { .. } => "label_selector",
            ChildRef::Ip { .. } => "ip",
            ChildRef::Subnet { .. } => "subnet",
            ChildRef::Route { .. } => "route",
        }
    }

    /// Whether this child kind can be attached to the given parent kind.
    pub fn attaches_to(&self, parent: ParentKind) -> bool {
        match parent {
            ParentKind::Firewall | ParentKind::LoadBalancer => matches!(
                self,
                ChildRef::Server { .. } | ChildRef::LabelSelector { .. } | ChildRef::Ip { .. }
            ),
            ParentKind::Network => matches!(
                self,
                ChildRef::Server { .. } | ChildRef::Subnet { .. } | ChildRef::Route { .. }
            ),
        }
    }
}

impl fmt::Display for ChildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildRef::Server { id } => write!(f, "server {}", id),
            ChildRef::LabelSelector { selector } => write!(f, "label selector {:?}", selector),
            ChildRef::Ip { ip } => write!(f, "ip {}", ip),
            ChildRef::Subnet {
                network_id,
                ip_range,
            } => write!(f, "subnet {} of network {}", ip_range, network_id),
            ChildRef::Route {
                destination,
                gateway,
            } => write!(f, "route {} via {}", destination, gateway),
        }
    }
}

/// Unordered set of child references, deduplicated by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentSet {
    members: HashSet<ChildRef>,
}

impl AttachmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a member. Returns false if an identical member was present.
    pub fn insert(&mut self, child: ChildRef) -> bool {
        self.members.insert(child)
    }

    pub fn contains(&self, child: &ChildRef) -> bool {
        self.members.contains(child)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildRef> {
        self.members.iter()
    }
}

impl FromIterator<ChildRef> for AttachmentSet {
    fn from_iter<I: IntoIterator<Item = ChildRef>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for AttachmentSet {
    type Item = ChildRef;
    type IntoIter = std::collections::hash_set::IntoIter<ChildRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.into_iter()
    }
}

impl<'a> IntoIterator for &'a AttachmentSet {
    type Item = &'a ChildRef;
    type IntoIter = std::collections::hash_set::Iter<'a, ChildRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}

/// Declared attachments for one parent, built fresh per reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredState {
    pub parent: ParentRef,
    pub attachments: AttachmentSet,
}

impl DesiredState {
    pub fn new(parent: ParentRef, attachments: AttachmentSet) -> Self {
        Self {
            parent,
            attachments,
        }
    }

    /// Desired state for a delete: nothing attached.
    pub fn empty(parent: ParentRef) -> Self {
        Self::new(parent, AttachmentSet::new())
    }
}

/// Attachments read from the control plane at one point in time.
///
/// Stale the moment it is read; concurrent operations may mutate the
/// parent at any time afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedState {
    pub parent: ParentRef,
    pub attachments: AttachmentSet,
    pub observed_at: DateTime<Utc>,
}

impl ObservedState {
    pub fn now(parent: ParentRef, attachments: AttachmentSet) -> Self {
        Self {
            parent,
            attachments,
            observed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn child_identity_is_tag_plus_payload() {
        assert_eq!(ChildRef::Server { id: 5 }, ChildRef::Server { id: 5 });
        assert_ne!(ChildRef::Server { id: 5 }, ChildRef::Server { id: 6 });
        assert_ne!(
            ChildRef::Server { id: 5 },
            ChildRef::LabelSelector {
                selector: "5".into()
            }
        );
    }

    #[test]
    fn attachment_set_dedups_by_identity() {
        let mut set = AttachmentSet::new();
        assert!(set.insert(ChildRef::Server { id: 1 }));
        assert!(!set.insert(ChildRef::Server { id: 1 }));
        assert!(set.insert(ChildRef::Server { id: 2 }));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn parent_kinds_accept_their_child_kinds() {
        let server = ChildRef::Server { id: 1 };
        let selector = ChildRef::LabelSelector {
            selector: "env=prod".into(),
        };
        let ip = ChildRef::Ip {
            ip: "203.0.113.7".parse().unwrap(),
        };
        let subnet = ChildRef::Subnet {
            network_id: 9,
            ip_range: "10.0.1.0/24".parse().unwrap(),
        };
        let route = ChildRef::Route {
            destination: "10.100.1.0/24".parse().unwrap(),
            gateway: "10.0.1.1".parse().unwrap(),
        };

        assert!(server.attaches_to(ParentKind::Firewall));
        assert!(selector.attaches_to(ParentKind::Firewall));
        assert!(ip.attaches_to(ParentKind::LoadBalancer));
        assert!(!subnet.attaches_to(ParentKind::Firewall));
        assert!(!route.attaches_to(ParentKind::LoadBalancer));

        assert!(server.attaches_to(ParentKind::Network));
        assert!(subnet.attaches_to(ParentKind::Network));
        assert!(route.attaches_to(ParentKind::Network));
        assert!(!ip.attaches_to(ParentKind::Network));
        assert!(!selector.attaches_to(ParentKind::Network));
    }

    #[test]
    fn child_serde_uses_one_identity_tag() {
        let subnet = ChildRef::Subnet {
            network_id: 9,
            ip_range: "10.0.1.0/24".parse().unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&subnet).unwrap(),
            json!({"type": "subnet", "network_id": 9, "ip_range": "10.0.1.0/24"})
        );

        let parsed: ChildRef =
            serde_json::from_value(json!({"type": "server", "id": 42})).unwrap();
        assert_eq!(parsed, ChildRef::Server { id: 42 });

        // A reference without its tag is not a valid declaration.
        assert!(serde_json::from_value::<ChildRef>(json!({"id": 42})).is_err());
    }
}

//! Minimal add/remove difference between desired and observed attachments.

use crate::resource::AttachmentSet;

/// Operations that converge an observed set toward a desired set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDiff {
    /// Members of the desired set missing from the observed set.
    pub to_add: AttachmentSet,
    /// Members of the observed set absent from the desired set.
    pub to_remove: AttachmentSet,
}

impl AttachmentDiff {
    /// True when the observed set already matches the desired set.
    pub fn is_converged(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Compute the minimal operations converging `observed` toward `desired`.
///
/// Pure set difference keyed by child identity; neither input is mutated
/// and the same inputs always produce the same contents. Order within the
/// returned sets carries no meaning.
pub fn diff(desired: &AttachmentSet, observed: &AttachmentSet) -> AttachmentDiff {
    let to_add = desired
        .iter()
        .filter(|child| !observed.contains(child))
        .cloned()
        .collect();
    let to_remove = observed
        .iter()
        .filter(|child| !desired.contains(child))
        .cloned()
        .collect();
    AttachmentDiff { to_add, to_remove }
}

//! # Attach List
//!
//! Every valid frame carries the list of places that reference it: one
//! [`AttachKind::Mapping`] node per view translation and at most one
//! [`AttachKind::Cache`] node for a durable page-cache reference. The list
//! answers "which views translate this frame", which is needed whenever all
//! translations of a frame have to be torn down (copy-on-write protection,
//! eviction, DMA migration).
//!
//! The list lives in the [`FrameEntry`](crate::frame::FrameEntry) and is only
//! touched under that frame's lock. Its length equals the owning slot's
//! reference count.

use crate::addresses::ViewId;
use crate::error::AtlError;
use alloc::vec::Vec;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttachKind {
    Mapping,
    Cache,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AttachNode {
    /// `None` for cache nodes.
    pub view: Option<ViewId>,
    /// Slot index within the page set.
    pub index: u32,
    pub kind: AttachKind,
    /// The translation allows writes. Only mapping nodes set it.
    pub writable: bool,
}

impl AttachNode {
    #[must_use]
    pub const fn mapping(view: ViewId, index: u32) -> Self {
        Self {
            view: Some(view),
            index,
            kind: AttachKind::Mapping,
            writable: false,
        }
    }

    #[must_use]
    pub const fn cache(index: u32) -> Self {
        Self {
            view: None,
            index,
            kind: AttachKind::Cache,
            writable: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct AttachList {
    nodes: Vec<AttachNode>,
}

impl AttachList {
    #[must_use]
    pub const fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Record a new reference. Newest nodes are visited first by [`iter`](Self::iter).
    pub fn add(&mut self, node: AttachNode) {
        debug_assert_eq!(node.view.is_some(), node.kind == AttachKind::Mapping);
        debug_assert!(
            node.kind == AttachKind::Mapping || !self.has_cache(),
            "second cache node"
        );
        self.nodes.push(node);
    }

    /// Remove the mapping node of `view` for slot `index`.
    ///
    /// # Errors
    /// [`AtlError::NotFound`] if the view holds no such node.
    pub fn delete(&mut self, view: ViewId, index: u32) -> Result<AttachNode, AtlError> {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.view == Some(view) && n.index == index)
            .ok_or(AtlError::NotFound { view, index })?;
        Ok(self.nodes.remove(pos))
    }

    /// Remove the cache node, if present.
    pub fn delete_cache(&mut self) -> Option<AttachNode> {
        let pos = self.nodes.iter().position(|n| n.kind == AttachKind::Cache)?;
        Some(self.nodes.remove(pos))
    }

    /// The mapping node of `view` for slot `index`.
    pub fn find_mut(&mut self, view: ViewId, index: u32) -> Option<&mut AttachNode> {
        self.nodes
            .iter_mut()
            .find(|n| n.view == Some(view) && n.index == index)
    }

    /// Mark every mapping read-only.
    pub fn clear_writable(&mut self) {
        for node in &mut self.nodes {
            node.writable = false;
        }
    }

    #[must_use]
    pub fn contains(&self, view: ViewId, index: u32) -> bool {
        self.nodes
            .iter()
            .any(|n| n.view == Some(view) && n.index == index)
    }

    #[must_use]
    pub fn has_cache(&self) -> bool {
        self.nodes.iter().any(|n| n.kind == AttachKind::Cache)
    }

    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.kind == AttachKind::Mapping)
            .count()
    }

    /// `(view, index)` of every mapping node.
    pub fn mappings(&self) -> impl Iterator<Item = (ViewId, u32)> + '_ {
        self.nodes.iter().filter_map(|n| n.view.map(|v| (v, n.index)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttachNode> {
        self.nodes.iter().rev()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Move every node out, leaving the list empty.
    pub fn take(&mut self) -> Self {
        core::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_mappings_and_cache() {
        let mut list = AttachList::new();
        list.add(AttachNode::cache(4));
        list.add(AttachNode::mapping(ViewId(1), 4));
        list.add(AttachNode::mapping(ViewId(2), 4));

        assert_eq!(list.len(), 3);
        assert_eq!(list.mapping_count(), 2);
        assert!(list.has_cache());
        assert_eq!(list.iter().next(), Some(&AttachNode::mapping(ViewId(2), 4)));

        assert_eq!(list.delete(ViewId(1), 4), Ok(AttachNode::mapping(ViewId(1), 4)));
        assert_eq!(list.delete_cache(), Some(AttachNode::cache(4)));
        assert_eq!(list.mappings().collect::<Vec<_>>(), [(ViewId(2), 4)]);
    }

    #[test]
    fn missing_node_is_reported() {
        let mut list = AttachList::new();
        list.add(AttachNode::mapping(ViewId(1), 0));
        assert_eq!(
            list.delete(ViewId(1), 1),
            Err(AtlError::NotFound {
                view: ViewId(1),
                index: 1
            })
        );
        assert_eq!(list.delete_cache(), None);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn take_empties_the_list() {
        let mut list = AttachList::new();
        list.add(AttachNode::mapping(ViewId(9), 2));
        let moved = list.take();
        assert!(list.is_empty());
        assert!(moved.contains(ViewId(9), 2));
    }

    #[test]
    fn writability_is_tracked_per_mapping() {
        let mut list = AttachList::new();
        list.add(AttachNode::mapping(ViewId(1), 0));
        list.add(AttachNode::mapping(ViewId(2), 0));
        list.find_mut(ViewId(2), 0).unwrap().writable = true;
        assert!(list.iter().any(|n| n.writable && n.view == Some(ViewId(2))));
        assert!(!list.find_mut(ViewId(1), 0).unwrap().writable);
        assert!(list.find_mut(ViewId(3), 0).is_none());

        list.clear_writable();
        assert!(list.iter().all(|n| !n.writable));
    }
}

//! # Scheduler nodes
//!
//! Groups and thread leaves live in one arena and refer to each other by
//! [`NodeId`]. Children of a group form a doubly linked sibling chain through
//! `prev`/`next` indices, so unlinking a node never searches.
//!
//! ```text
//!              root (group)
//!             /     \
//!      group A ◄──► group B          sibling chain
//!      /    \          |
//!  leaf t1 ◄► leaf t2  leaf t3
//! ```

use crate::thread::ThreadId;
use alloc::vec::Vec;
use core::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// The root group. It always exists.
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Group {
        first: Option<NodeId>,
        last: Option<NodeId>,
    },
    Leaf(ThreadId),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) parent: Option<NodeId>,
    pub(crate) prev: Option<NodeId>,
    pub(crate) next: Option<NodeId>,
    pub(crate) weight: u32,
    /// Runnable or running leaves below, this node included.
    pub(crate) nrun: u32,
    /// Leaves below that the tree walk may dispatch.
    pub(crate) nready: u32,
    /// Weighted CPU time received, in `SCALE / weight` units per tick.
    pub(crate) vtime: u64,
    /// `vtime` of the child picked last; floor for children becoming ready.
    pub(crate) vclock: u64,
    /// Creator reference plus one per child.
    pub(crate) refs: u32,
    pub(crate) kind: NodeKind,
}

impl Node {
    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[must_use]
    pub const fn weight(&self) -> u32 {
        self.weight
    }

    #[must_use]
    pub const fn nrun(&self) -> u32 {
        self.nrun
    }

    #[must_use]
    pub const fn nready(&self) -> u32 {
        self.nready
    }

    #[must_use]
    pub const fn vtime(&self) -> u64 {
        self.vtime
    }

    #[must_use]
    pub const fn refs(&self) -> u32 {
        self.refs
    }

    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    #[must_use]
    pub const fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::Group { .. })
    }
}

pub(crate) struct Arena {
    slots: Vec<Option<Node>>,
    free: Vec<u32>,
}

impl Arena {
    pub(crate) fn new(root_weight: u32) -> Self {
        Self {
            slots: alloc::vec![Some(Node {
                parent: None,
                prev: None,
                next: None,
                weight: root_weight,
                nrun: 0,
                nready: 0,
                vtime: 0,
                vclock: 0,
                refs: 1,
                kind: NodeKind::Group {
                    first: None,
                    last: None,
                },
            })],
            free: Vec::new(),
        }
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    /// A node known to exist.
    pub(crate) fn node(&self, id: NodeId) -> &Node {
        self.get(id)
            .unwrap_or_else(|| panic!("dangling scheduler {id}"))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("dangling scheduler {id}"))
    }

    /// Append a node to the child chain of `parent`, which must be a group.
    /// The new node starts with one reference.
    pub(crate) fn insert(&mut self, parent: NodeId, weight: u32, kind: NodeKind) -> NodeId {
        let NodeKind::Group { last, .. } = self.node(parent).kind else {
            panic!("{parent} is not a group");
        };
        let node = Node {
            parent: Some(parent),
            prev: last,
            next: None,
            weight,
            nrun: 0,
            nready: 0,
            vtime: self.node(parent).vclock,
            vclock: 0,
            refs: 1,
            kind,
        };
        #[allow(clippy::cast_possible_truncation)]
        let id = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(node);
                NodeId(index)
            }
            None => {
                self.slots.push(Some(node));
                NodeId((self.slots.len() - 1) as u32)
            }
        };

        match last {
            Some(prev) => self.node_mut(prev).next = Some(id),
            None => self.set_first(parent, Some(id)),
        }
        self.set_last(parent, Some(id));
        id
    }

    /// Unlink `id` from its parent's chain and free its slot.
    pub(crate) fn remove(&mut self, id: NodeId) -> Node {
        assert_ne!(id, NodeId::ROOT, "removing the root group");
        let node = self.slots[id.0 as usize]
            .take()
            .unwrap_or_else(|| panic!("dangling scheduler {id}"));
        debug_assert_eq!(node.nrun, 0);
        debug_assert_eq!(node.nready, 0);
        debug_assert!(
            !matches!(node.kind, NodeKind::Group { first: Some(_), .. }),
            "{id} still has children"
        );

        let parent = node.parent.unwrap_or_else(|| panic!("{id} has no parent"));
        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.set_first(parent, node.next),
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.set_last(parent, node.prev),
        }
        self.free.push(id.0);
        node
    }

    fn set_first(&mut self, group: NodeId, to: Option<NodeId>) {
        if let NodeKind::Group { first, .. } = &mut self.node_mut(group).kind {
            *first = to;
        }
    }

    fn set_last(&mut self, group: NodeId, to: Option<NodeId>) {
        if let NodeKind::Group { last, .. } = &mut self.node_mut(group).kind {
            *last = to;
        }
    }

    /// Children of `id` in chain order.
    pub(crate) fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let first = match self.node(id).kind {
            NodeKind::Group { first, .. } => first,
            NodeKind::Leaf(_) => None,
        };
        core::iter::successors(first, |&c| self.node(c).next)
    }

    /// `id` and every ancestor up to the root.
    pub(crate) fn path(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        core::iter::successors(Some(id), |&n| self.node(n).parent)
    }
}

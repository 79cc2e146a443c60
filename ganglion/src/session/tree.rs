//! Conversation tree
//!
//! Every message of a session is a node; branching adds a sibling path and
//! compaction collapses the root-anchored prefix of a path into one summary
//! node. The tree is kept acyclic and connected by construction, and
//! [`ConversationTree::validate`] checks both properties for trees received
//! over the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{Error, Result};
use crate::types::NodeId;

/// Content of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodePayload {
    /// Start of the conversation
    Root,
    User { text: String },
    Assistant { text: String },
    /// Fork point created by `create_branch`
    Branch { label: Option<String> },
    /// Replacement for a compacted chain of `compacted` nodes
    Summary { text: String, compacted: usize },
}

/// One node of the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub payload: NodePayload,
    /// Creation order within the tree
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

/// Tree of conversation nodes with a head cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTree {
    nodes: HashMap<NodeId, ConversationNode>,
    root: NodeId,
    head: NodeId,
    next_seq: u64,
}

impl ConversationTree {
    /// Tree holding only a root node
    pub fn new() -> Self {
        let root = NodeId::generate();
        let mut nodes = HashMap::new();
        nodes.insert(
            root.clone(),
            ConversationNode {
                id: root.clone(),
                parent: None,
                children: Vec::new(),
                payload: NodePayload::Root,
                seq: 0,
                created_at: Utc::now(),
            },
        );
        Self {
            nodes,
            head: root.clone(),
            root,
            next_seq: 1,
        }
    }

    pub fn root(&self) -> &NodeId {
        &self.root
    }

    /// Node new messages are appended under
    pub fn head(&self) -> &NodeId {
        &self.head
    }

    pub fn get(&self, id: &NodeId) -> Option<&ConversationNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in creation order
    pub fn nodes(&self) -> Vec<&ConversationNode> {
        let mut nodes: Vec<_> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.seq);
        nodes
    }

    /// Move the head cursor
    pub fn set_head(&mut self, id: &NodeId) -> Result<()> {
        self.require(id)?;
        self.head = id.clone();
        Ok(())
    }

    /// Append under the head and advance the head to the new node
    pub fn append(&mut self, payload: NodePayload) -> NodeId {
        let parent = self.head.clone();
        let id = self.insert_child(&parent, payload);
        self.head = id.clone();
        id
    }

    /// Append under an arbitrary node without moving the head
    pub fn append_to(&mut self, parent: &NodeId, payload: NodePayload) -> Result<NodeId> {
        self.require(parent)?;
        Ok(self.insert_child(parent, payload))
    }

    /// Fork the conversation at `from`: add a branch node under it and move
    /// the head there.
    pub fn create_branch(&mut self, from: &NodeId, label: Option<String>) -> Result<NodeId> {
        self.require(from)?;
        let id = self.insert_child(from, NodePayload::Branch { label });
        self.head = id.clone();
        Ok(id)
    }

    /// Ids from the root down to `id`, both included
    pub fn path_to(&self, id: &NodeId) -> Result<Vec<NodeId>> {
        self.require(id)?;
        let mut path = vec![id.clone()];
        let mut current = id;
        while let Some(parent) = self.nodes.get(current).and_then(|n| n.parent.as_ref()) {
            if path.len() > self.nodes.len() {
                return Err(Error::Protocol("cycle in conversation tree".into()));
            }
            path.push(parent.clone());
            current = parent;
        }
        path.reverse();
        Ok(path)
    }

    /// Replace the chain root..=`upto` with a single summary node.
    ///
    /// The summary becomes the new root. Children of `upto` and every
    /// off-chain child of the collapsed nodes are re-parented onto it, so no
    /// branch is lost. A head inside the chain moves to the summary.
    pub fn compact(&mut self, upto: &NodeId, summary: impl Into<String>) -> Result<NodeId> {
        let chain = self.path_to(upto)?;
        let on_chain: HashSet<&NodeId> = chain.iter().collect();

        let mut adopted = Vec::new();
        for id in &chain {
            if let Some(node) = self.nodes.get(id) {
                adopted.extend(
                    node.children
                        .iter()
                        .filter(|c| !on_chain.contains(c))
                        .cloned(),
                );
            }
        }
        adopted.sort_by_key(|c| self.nodes.get(c).map(|n| n.seq).unwrap_or(u64::MAX));

        let summary_id = NodeId::generate();
        let head_collapsed = on_chain.contains(&self.head);
        for id in &chain {
            self.nodes.remove(id);
        }
        for child in &adopted {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parent = Some(summary_id.clone());
            }
        }

        let seq = self.bump_seq();
        self.nodes.insert(
            summary_id.clone(),
            ConversationNode {
                id: summary_id.clone(),
                parent: None,
                children: adopted,
                payload: NodePayload::Summary {
                    text: summary.into(),
                    compacted: chain.len(),
                },
                seq,
                created_at: Utc::now(),
            },
        );
        self.root = summary_id.clone();
        if head_collapsed {
            self.head = summary_id.clone();
        }
        Ok(summary_id)
    }

    /// Check that the tree is rooted, acyclic and connected, and that
    /// parent/child links agree.
    pub fn validate(&self) -> Result<()> {
        let root = self
            .nodes
            .get(&self.root)
            .ok_or_else(|| Error::Protocol(format!("root {} missing", self.root)))?;
        if root.parent.is_some() {
            return Err(Error::Protocol("root has a parent".into()));
        }
        if !self.nodes.contains_key(&self.head) {
            return Err(Error::Protocol(format!("head {} missing", self.head)));
        }

        for node in self.nodes.values() {
            if let Some(parent) = &node.parent {
                let linked = self
                    .nodes
                    .get(parent)
                    .is_some_and(|p| p.children.contains(&node.id));
                if !linked {
                    return Err(Error::Protocol(format!(
                        "node {} not listed by parent {}",
                        node.id, parent
                    )));
                }
            } else if node.id != self.root {
                return Err(Error::Protocol(format!("second root {}", node.id)));
            }
            for child in &node.children {
                let back = self
                    .nodes
                    .get(child)
                    .is_some_and(|c| c.parent.as_ref() == Some(&node.id));
                if !back {
                    return Err(Error::Protocol(format!(
                        "child {} of {} does not point back",
                        child, node.id
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.root.clone()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                return Err(Error::Protocol(format!("node {} reached twice", id)));
            }
            if let Some(node) = self.nodes.get(&id) {
                queue.extend(node.children.iter().cloned());
            }
        }
        if seen.len() != self.nodes.len() {
            return Err(Error::Protocol(format!(
                "{} nodes unreachable from root",
                self.nodes.len() - seen.len()
            )));
        }
        Ok(())
    }

    fn insert_child(&mut self, parent: &NodeId, payload: NodePayload) -> NodeId {
        let id = NodeId::generate();
        let seq = self.bump_seq();
        self.nodes.insert(
            id.clone(),
            ConversationNode {
                id: id.clone(),
                parent: Some(parent.clone()),
                children: Vec::new(),
                payload,
                seq,
                created_at: Utc::now(),
            },
        );
        if let Some(parent) = self.nodes.get_mut(parent) {
            parent.children.push(id.clone());
        }
        id
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn require(&self, id: &NodeId) -> Result<()> {
        if self.nodes.contains_key(id) {
            Ok(())
        } else {
            Err(Error::not_found("node", id))
        }
    }
}

impl Default for ConversationTree {
    fn default() -> Self {
        Self::new()
    }
}

//! Node trait and the name-keyed registry that resolves checkpointed node
//! references back to callables.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use crate::capability::Capabilities;
use crate::core::ids::NodeRef;
use crate::core::invariants::validate_envelope;
use crate::core::types::{StateEnvelope, Transition};

/// One phase function of the graph.
///
/// `run` receives an owned snapshot of the envelope and returns its successor
/// inside the transition. Nodes must be safe to re-invoke with the same input:
/// an invocation interrupted before its checkpoint commit is simply run again.
pub trait Node: Send + Sync {
    fn run(&self, state: StateEnvelope, caps: &Capabilities) -> Result<Transition>;

    /// Structural checks on an `Advance` produced by this node, applied by the
    /// executor before the checkpoint is committed.
    fn validate_advance(&self, prev: &StateEnvelope, next: &NodeRef, state: &StateEnvelope) -> Vec<String> {
        let _ = (prev, next);
        validate_envelope(state)
    }
}

/// Lookup table from stable node names to node implementations, populated
/// once at startup.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<NodeRef, Arc<dyn Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: &NodeRef, node: Arc<dyn Node>) -> &mut Self {
        self.nodes.insert(name.clone(), node);
        self
    }

    pub fn resolve(&self, name: &NodeRef) -> Option<Arc<dyn Node>> {
        self.nodes.get(name).cloned()
    }

    pub fn contains(&self, name: &NodeRef) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &NodeRef> {
        self.nodes.keys()
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.nodes.keys()).finish()
    }
}

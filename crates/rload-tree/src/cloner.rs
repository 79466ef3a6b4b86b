//! ---
//! rload_section: "02-data-model"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Configuration tree model and structural cloning."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::collections::HashSet;

use tracing::debug;

use crate::node::{Category, ConfigNode, NodeId};
use crate::TreeError;

/// Counters describing what a clone left out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloneStats {
    /// Nodes copied into the clone.
    pub copied: usize,
    /// Nodes dropped because they, or an ancestor, were disabled.
    pub disabled: usize,
    /// Nodes dropped because they, or an ancestor, matched the excluded category.
    pub excluded: usize,
}

/// Structurally independent copy of a configuration subtree.
///
/// Owns every node and payload it holds; nothing is shared with the source tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ClonedTree {
    root: ConfigNode,
    stats: CloneStats,
}

impl ClonedTree {
    pub fn root(&self) -> &ConfigNode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut ConfigNode {
        &mut self.root
    }

    pub fn into_root(self) -> ConfigNode {
        self.root
    }

    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    pub fn stats(&self) -> CloneStats {
        self.stats
    }

    /// Append an execution-only node (e.g. a listener) beneath the root.
    pub fn attach_to_root(&mut self, node: ConfigNode) {
        self.stats.copied += node.node_count();
        self.root.children.push(node);
    }
}

/// Depth-first cloner that drops disabled nodes and, optionally, one category.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeCloner {
    exclude: Option<Category>,
}

impl TreeCloner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Omit every subtree rooted at a node of `category`.
    pub fn excluding(category: Category) -> Self {
        Self {
            exclude: Some(category),
        }
    }

    /// Cloner used for "start without timers".
    pub fn without_timers() -> Self {
        Self::excluding(Category::Timer)
    }

    pub fn excluded_category(&self) -> Option<Category> {
        self.exclude
    }

    pub fn clone_tree(&self, root: &ConfigNode) -> Result<ClonedTree, TreeError> {
        if !root.enabled {
            return Err(TreeError::RootDisabled(root.id));
        }
        if let Some(category) = self.exclude.filter(|category| root.is(*category)) {
            return Err(TreeError::RootExcluded {
                id: root.id,
                category,
            });
        }

        let mut seen = HashSet::new();
        let mut stats = CloneStats::default();
        let root = self
            .copy_node(root, &mut seen, &mut stats)?
            .ok_or(TreeError::RootDisabled(root.id))?;
        debug!(
            root = %root.id,
            copied = stats.copied,
            disabled = stats.disabled,
            excluded = stats.excluded,
            exclude = ?self.exclude,
            "configuration tree cloned"
        );
        Ok(ClonedTree { root, stats })
    }

    // Only `children` edges are followed; `NodeRef` properties are copied as plain values.
    fn copy_node(
        &self,
        root: &ConfigNode,
        seen: &mut HashSet<NodeId>,
        stats: &mut CloneStats,
    ) -> Result<Option<ConfigNode>, TreeError> {
        if !self.admit(root, seen, stats)? {
            return Ok(None);
        }
        let mut stack = vec![Frame::new(root)];
        while let Some(frame) = stack.last_mut() {
            let source = frame.source;
            if let Some(child) = source.children.get(frame.next) {
                frame.next += 1;
                if self.admit(child, seen, stats)? {
                    stack.push(Frame::new(child));
                }
                continue;
            }
            let Some(done) = stack.pop() else { break };
            stats.copied += 1;
            let copy = done.into_node();
            match stack.last_mut() {
                Some(parent) => parent.children.push(copy),
                None => return Ok(Some(copy)),
            }
        }
        Ok(None)
    }

    /// Whether `node` belongs in the clone. Dropped subtrees are counted.
    fn admit(
        &self,
        node: &ConfigNode,
        seen: &mut HashSet<NodeId>,
        stats: &mut CloneStats,
    ) -> Result<bool, TreeError> {
        if !node.enabled {
            stats.disabled += node.node_count();
            return Ok(false);
        }
        if self.exclude.is_some_and(|category| node.is(category)) {
            stats.excluded += node.node_count();
            return Ok(false);
        }
        if !seen.insert(node.id) {
            return Err(TreeError::DuplicateId(node.id));
        }
        Ok(true)
    }
}

/// A source node whose children are being copied.
struct Frame<'a> {
    source: &'a ConfigNode,
    next: usize,
    children: Vec<ConfigNode>,
}

impl<'a> Frame<'a> {
    fn new(source: &'a ConfigNode) -> Self {
        Self {
            source,
            next: 0,
            children: Vec::with_capacity(source.children.len()),
        }
    }

    fn into_node(self) -> ConfigNode {
        ConfigNode {
            id: self.source.id,
            name: self.source.name.clone(),
            category: self.source.category,
            enabled: true,
            element: self.source.element.clone(),
            children: self.children,
        }
    }
}

/// Clone `root`, omitting subtrees of `exclude` when given.
pub fn clone_tree(root: &ConfigNode, exclude: Option<Category>) -> Result<ClonedTree, TreeError> {
    let cloner = match exclude {
        Some(category) => TreeCloner::excluding(category),
        None => TreeCloner::new(),
    };
    cloner.clone_tree(root)
}

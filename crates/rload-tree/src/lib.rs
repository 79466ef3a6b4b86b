//! ---
//! rload_section: "02-data-model"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Configuration tree model and structural cloning."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
//! Configuration tree consumed by run execution, plus the structural cloner
//! producing isolated, execution-safe copies of it.

mod cloner;
mod node;

pub use cloner::{clone_tree, CloneStats, ClonedTree, TreeCloner};
pub use node::{Category, ConfigNode, Element, NodeId, PropertyValue};

/// Errors raised while producing a [`ClonedTree`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TreeError {
    /// The root itself is disabled so nothing would participate in a run.
    #[error("root node {0} is disabled; nothing to run")]
    RootDisabled(NodeId),
    /// The root belongs to the category being excluded.
    #[error("root node {id} belongs to excluded category {category}")]
    RootExcluded {
        /// Offending root.
        id: NodeId,
        /// Category that was excluded.
        category: Category,
    },
    /// Structural identities must be unique within one tree.
    #[error("node id {0} appears more than once in the tree")]
    DuplicateId(NodeId),
}

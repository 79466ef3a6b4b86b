//! ---
//! rload_section: "02-data-model"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Configuration tree model and structural cloning."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Structural identity of a node, unique within a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Allocate a process-unique identifier.
    pub fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role a node plays in a test plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    TestPlan,
    ThreadGroup,
    Controller,
    Sampler,
    Timer,
    Listener,
    Config,
    Assertion,
    PreProcessor,
    PostProcessor,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::TestPlan => "test_plan",
            Category::ThreadGroup => "thread_group",
            Category::Controller => "controller",
            Category::Sampler => "sampler",
            Category::Timer => "timer",
            Category::Listener => "listener",
            Category::Config => "config",
            Category::Assertion => "assertion",
            Category::PreProcessor => "pre_processor",
            Category::PostProcessor => "post_processor",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "test_plan" => Ok(Category::TestPlan),
            "thread_group" => Ok(Category::ThreadGroup),
            "controller" => Ok(Category::Controller),
            "sampler" => Ok(Category::Sampler),
            "timer" => Ok(Category::Timer),
            "listener" => Ok(Category::Listener),
            "config" => Ok(Category::Config),
            "assertion" => Ok(Category::Assertion),
            "pre_processor" => Ok(Category::PreProcessor),
            "post_processor" => Ok(Category::PostProcessor),
            other => Err(format!("unknown node category: {}", other)),
        }
    }
}

/// Value stored in an element property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<PropertyValue>),
    /// Cross reference to another node. Never traversed structurally.
    NodeRef(NodeId),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<NodeId> for PropertyValue {
    fn from(value: NodeId) -> Self {
        PropertyValue::NodeRef(value)
    }
}

/// Opaque configuration payload carried by a node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Element {
    /// Implementation kind, e.g. `http_sampler` or `constant_timer`.
    pub kind: String,
    #[serde(default)]
    pub properties: IndexMap<String, PropertyValue>,
}

impl Element {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            properties: IndexMap::new(),
        }
    }

    /// Builder style property assignment.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(PropertyValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.properties.get(key) {
            Some(PropertyValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        match self.properties.get(key) {
            Some(PropertyValue::Float(value)) => Some(*value),
            Some(PropertyValue::Int(value)) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.properties.get(key) {
            Some(PropertyValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    /// Node ids referenced by this payload, including those nested in lists.
    pub fn references(&self) -> Vec<NodeId> {
        fn collect(value: &PropertyValue, out: &mut Vec<NodeId>) {
            match value {
                PropertyValue::NodeRef(id) => out.push(*id),
                PropertyValue::List(items) => items.iter().for_each(|item| collect(item, out)),
                _ => {}
            }
        }
        let mut out = Vec::new();
        for value in self.properties.values() {
            collect(value, &mut out);
        }
        out
    }
}

fn default_enabled() -> bool {
    true
}

/// A node in the configuration tree.
///
/// Children are owned, so a tree is acyclic and every node has exactly one
/// parent by construction. Sibling order is execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigNode {
    pub id: NodeId,
    pub name: String,
    pub category: Category,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub element: Element,
    #[serde(default)]
    pub children: Vec<ConfigNode>,
}

impl ConfigNode {
    /// Create an enabled node whose element kind defaults to the category name.
    pub fn new(name: impl Into<String>, category: Category) -> Self {
        Self {
            id: NodeId::next(),
            name: name.into(),
            category,
            enabled: true,
            element: Element::new(category.as_str()),
            children: Vec::new(),
        }
    }

    pub fn with_element(mut self, element: Element) -> Self {
        self.element = element;
        self
    }

    pub fn with_child(mut self, child: ConfigNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = ConfigNode>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn push(&mut self, child: ConfigNode) {
        self.children.push(child);
    }

    pub fn is(&self, category: Category) -> bool {
        self.category == category
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ConfigNode::node_count).sum::<usize>()
    }

    /// Depth-first pre-order walk, passing each node with its depth.
    pub fn walk<F>(&self, visit: &mut F)
    where
        F: FnMut(&ConfigNode, usize),
    {
        fn inner<F: FnMut(&ConfigNode, usize)>(node: &ConfigNode, depth: usize, visit: &mut F) {
            visit(node, depth);
            for child in &node.children {
                inner(child, depth + 1, visit);
            }
        }
        inner(self, 0, visit);
    }

    pub fn find(&self, id: NodeId) -> Option<&ConfigNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    pub fn find_mut(&mut self, id: NodeId) -> Option<&mut ConfigNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(id))
    }

    pub fn count_category(&self, category: Category) -> usize {
        let mut count = 0;
        self.walk(&mut |node, _| {
            if node.category == category {
                count += 1;
            }
        });
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> ConfigNode {
        ConfigNode::new("plan", Category::TestPlan).with_child(
            ConfigNode::new("users", Category::ThreadGroup)
                .with_child(ConfigNode::new("home", Category::Sampler))
                .with_child(
                    ConfigNode::new("think", Category::Timer)
                        .with_element(Element::new("constant_timer").with("delay_ms", 10i64)),
                ),
        )
    }

    #[test]
    fn node_count_includes_root() {
        assert_eq!(sample_plan().node_count(), 4);
    }

    #[test]
    fn walk_is_preorder_with_depth() {
        let plan = sample_plan();
        let mut seen = Vec::new();
        plan.walk(&mut |node, depth| seen.push((node.name.clone(), depth)));
        assert_eq!(
            seen,
            vec![
                ("plan".to_owned(), 0),
                ("users".to_owned(), 1),
                ("home".to_owned(), 2),
                ("think".to_owned(), 2),
            ]
        );
    }

    #[test]
    fn find_locates_nested_nodes() {
        let plan = sample_plan();
        let timer_id = plan.children[0].children[1].id;
        let timer = plan.find(timer_id).expect("timer exists");
        assert_eq!(timer.element.int("delay_ms"), Some(10));
        assert!(plan.find(NodeId(u64::MAX)).is_none());
    }

    #[test]
    fn category_round_trips_through_strings() {
        for category in [Category::TestPlan, Category::PreProcessor, Category::Timer] {
            assert_eq!(category.as_str().parse::<Category>(), Ok(category));
        }
        assert!("bogus".parse::<Category>().is_err());
    }

    #[test]
    fn references_include_nested_lists() {
        let element = Element::new("module_controller")
            .with("target", NodeId(7))
            .with(
                "extra",
                PropertyValue::List(vec![PropertyValue::NodeRef(NodeId(9)), 3i64.into()]),
            );
        assert_eq!(element.references(), vec![NodeId(7), NodeId(9)]);
    }

    #[test]
    fn enabled_defaults_to_true_when_deserialising() {
        let node: ConfigNode = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "plan",
            "category": "test_plan"
        }))
        .expect("node parses");
        assert!(node.enabled);
        assert!(node.children.is_empty());
    }
}

//! Resolver tree.
//!
//! A trie over separator-inclusive topic tokens. Inner nodes are keyed by
//! token (literal, `+`, `#` or `/`); the mapping registered for a pattern
//! hangs off the node of its last token as a terminal entry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::Mapping;
use crate::topic::{self, MULTI_LEVEL_WILDCARD, SEPARATOR, SINGLE_LEVEL_WILDCARD};

/// Terminal entries use the empty key, which no topic token can produce.
const TERMINAL: &str = "";

/// Node of the resolver tree.
#[derive(Debug, Clone)]
pub enum TreeNode {
    Inner(InnerNode),
    Mapping(MappingNode),
}

#[derive(Debug, Clone, Default)]
pub struct InnerNode {
    level: String,
    children: HashMap<String, TreeNode>,
}

#[derive(Debug, Clone)]
pub struct MappingNode {
    mapping: Arc<Mapping>,
}

impl MappingNode {
    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }
}

impl InnerNode {
    fn new(level: &str) -> Self {
        Self {
            level: level.to_string(),
            children: HashMap::new(),
        }
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    fn child(&self, level: &str) -> Option<&InnerNode> {
        match self.children.get(level) {
            Some(TreeNode::Inner(inner)) => Some(inner),
            _ => None,
        }
    }

    fn terminal(&self) -> Option<&Arc<Mapping>> {
        match self.children.get(TERMINAL) {
            Some(TreeNode::Mapping(node)) => Some(&node.mapping),
            _ => None,
        }
    }
}

/// Per tenant resolver tree.
#[derive(Debug, Clone, Default)]
pub struct MappingTree {
    root: InnerNode,
    size: usize,
}

impl MappingTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from `mappings`, skipping the ones that conflict.
    ///
    /// Returns the tree and the excluded mappings.
    pub fn rebuild<I>(tenant: &str, mappings: I) -> (Self, Vec<Arc<Mapping>>)
    where
        I: IntoIterator<Item = Arc<Mapping>>,
    {
        let mut tree = Self::new();
        let mut excluded = Vec::new();
        for mapping in mappings {
            if let Err(e) = tree.add_mapping(mapping.clone()) {
                tracing::warn!(
                    "Tenant {} - Could not add mapping {} to resolver tree, ignoring mapping: {}",
                    tenant,
                    mapping.ident,
                    e
                );
                excluded.push(mapping);
            }
        }
        (tree, excluded)
    }

    /// Number of registered mappings.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Register a mapping under its normalized subscription pattern.
    ///
    /// Re-registering the same mapping id replaces it; a different mapping on
    /// the same pattern is a conflict.
    pub fn add_mapping(&mut self, mapping: Arc<Mapping>) -> Result<()> {
        let pattern = mapping.pattern();
        topic::check_pattern(&pattern)?;

        let mut node = &mut self.root;
        for token in topic::split_levels(&pattern, true) {
            let child = node
                .children
                .entry(token.clone())
                .or_insert_with(|| TreeNode::Inner(InnerNode::new(&token)));
            node = match child {
                TreeNode::Inner(inner) => inner,
                TreeNode::Mapping(_) => {
                    return Err(Error::Resolve(format!(
                        "Unexpected mapping node at level {} of {}",
                        token, pattern
                    )))
                }
            };
        }

        if let Some(existing) = node.terminal() {
            if existing.id != mapping.id {
                return Err(Error::Resolve(format!(
                    "Mapping {} conflicts with mapping {} on topic {}",
                    mapping.ident, existing.ident, pattern
                )));
            }
            self.size -= 1;
        }
        node.children
            .insert(TERMINAL.to_string(), TreeNode::Mapping(MappingNode { mapping }));
        self.size += 1;
        Ok(())
    }

    /// Remove a mapping. Emptied inner nodes are kept until the next rebuild.
    pub fn delete_mapping(&mut self, mapping: &Mapping) -> Result<()> {
        let pattern = mapping.pattern();
        let mut node = &mut self.root;
        for token in topic::split_levels(&pattern, true) {
            node = match node.children.get_mut(&token) {
                Some(TreeNode::Inner(inner)) => inner,
                _ => {
                    return Err(Error::Resolve(format!(
                        "Mapping {} not found on topic {}",
                        mapping.ident, pattern
                    )))
                }
            };
        }
        match node.terminal() {
            Some(existing) if existing.id == mapping.id => {
                node.children.remove(TERMINAL);
                self.size -= 1;
                Ok(())
            }
            _ => Err(Error::Resolve(format!(
                "Mapping {} not found on topic {}",
                mapping.ident, pattern
            ))),
        }
    }

    /// Resolve a concrete topic to every mapping whose pattern matches it.
    pub fn resolve(&self, topic: &str) -> Vec<Arc<Mapping>> {
        let levels = topic::split_levels(&topic::normalize(topic), true);
        self.resolve_topic_path(&levels)
    }

    /// Breadth first walk over separator-inclusive topic tokens.
    pub fn resolve_topic_path(&self, levels: &[String]) -> Vec<Arc<Mapping>> {
        let mut results = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back((&self.root, 0usize));

        while let Some((node, index)) = queue.pop_front() {
            if let Some(mapping) = node.child(MULTI_LEVEL_WILDCARD).and_then(InnerNode::terminal) {
                results.push(mapping.clone());
            }

            let Some(token) = levels.get(index) else {
                if let Some(mapping) = node.terminal() {
                    results.push(mapping.clone());
                }
                // "a/b/#" also matches "a/b"
                if let Some(mapping) = node
                    .child(SEPARATOR)
                    .and_then(|sep| sep.child(MULTI_LEVEL_WILDCARD))
                    .and_then(InnerNode::terminal)
                {
                    results.push(mapping.clone());
                }
                continue;
            };

            if let Some(child) = node.child(token) {
                queue.push_back((child, index + 1));
            }
            // a literal "+" token was already followed above
            if token != SEPARATOR && token != SINGLE_LEVEL_WILDCARD {
                if let Some(child) = node.child(SINGLE_LEVEL_WILDCARD) {
                    queue.push_back((child, index + 1));
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Api;

    fn mapping(id: &str, topic: &str) -> Arc<Mapping> {
        Arc::new(Mapping::inbound(format!("ident-{}", id), topic, Api::Measurement).with_id(id))
    }

    fn ids(mappings: &[Arc<Mapping>]) -> Vec<String> {
        let mut ids: Vec<String> = mappings.iter().map(|m| m.id.clone()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_resolve_returns_all_matching_mappings() {
        let mut tree = MappingTree::new();
        tree.add_mapping(mapping("1", "/device/+/east")).unwrap();
        tree.add_mapping(mapping("2", "/device/#")).unwrap();
        tree.add_mapping(mapping("3", "/device/+/west")).unwrap();

        assert_eq!(ids(&tree.resolve("/device/sensor1/east")), vec!["1", "2"]);
        assert_eq!(ids(&tree.resolve("/device/sensor1/west")), vec!["2", "3"]);
        assert_eq!(ids(&tree.resolve("/device")), vec!["2"]);
        assert!(tree.resolve("/other/sensor1/east").is_empty());
    }

    #[test]
    fn test_resolve_matches_topic_matcher() {
        let patterns = ["/a/+", "/a/#", "a/b", "#", "/a/+/c/", "/+/+"];
        let topics = ["/a/b", "/a", "a/b", "/a/b/c/", "/x/y", "/a/b/c", ""];
        let mut tree = MappingTree::new();
        for (i, pattern) in patterns.iter().enumerate() {
            tree.add_mapping(mapping(&i.to_string(), pattern)).unwrap();
        }
        for topic in topics {
            let mut expected: Vec<String> = patterns
                .iter()
                .enumerate()
                .filter(|(_, p)| topic::matches(p, topic))
                .map(|(i, _)| i.to_string())
                .collect();
            expected.sort();
            assert_eq!(ids(&tree.resolve(topic)), expected, "topic {:?}", topic);
        }
    }

    #[test]
    fn test_insert_then_delete_restores_resolution() {
        let mut tree = MappingTree::new();
        tree.add_mapping(mapping("1", "/device/+/east")).unwrap();
        tree.add_mapping(mapping("2", "/plant/#")).unwrap();

        let topics = ["/device/s1/east", "/plant/a/b", "/device/s1/west", "/plant"];
        let before: Vec<Vec<String>> = topics.iter().map(|t| ids(&tree.resolve(t))).collect();

        let extra = mapping("3", "/device/#");
        tree.add_mapping(extra.clone()).unwrap();
        assert_eq!(tree.len(), 3);
        tree.delete_mapping(&extra).unwrap();

        let after: Vec<Vec<String>> = topics.iter().map(|t| ids(&tree.resolve(t))).collect();
        assert_eq!(before, after);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_duplicate_pattern_conflicts() {
        let mut tree = MappingTree::new();
        tree.add_mapping(mapping("1", "/device/+")).unwrap();
        let err = tree.add_mapping(mapping("2", "//device/+")).unwrap_err();
        assert!(matches!(err, Error::Resolve(_)));

        // same id replaces
        tree.add_mapping(mapping("1", "/device/+")).unwrap();
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut tree = MappingTree::new();
        let err = tree.add_mapping(mapping("1", "/a/#/b")).unwrap_err();
        assert!(matches!(err, Error::InvalidTopic { .. }));
    }

    #[test]
    fn test_delete_unknown_mapping_fails() {
        let mut tree = MappingTree::new();
        tree.add_mapping(mapping("1", "/device/+")).unwrap();
        assert!(tree.delete_mapping(&mapping("2", "/device/+")).is_err());
        assert!(tree.delete_mapping(&mapping("1", "/other")).is_err());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_rebuild_skips_conflicts() {
        let mappings = vec![
            mapping("1", "/a/+"),
            mapping("2", "/a/+"),
            mapping("3", "/b/#"),
        ];
        let (tree, excluded) = MappingTree::rebuild("t1", mappings);
        assert_eq!(tree.len(), 2);
        assert_eq!(ids(&excluded), vec!["2"]);
        assert_eq!(ids(&tree.resolve("/b/c")), vec!["3"]);
    }
}

//! Construction-time resolution of a pipeline's children.
//!
//! Each child of a pipeline contributes one resolved entry: a plain node
//! becomes the singleton list `[node]`, a nested pipeline contributes its own
//! (already resolved) list. The structure mirrors the nesting, so the first
//! and last leaf under any child can be found without re-walking pipelines.

use std::sync::Arc;

use multiact_types::node::Node;

use super::compose::Step;

/// One entry of a pipeline's `resolved_list`.
#[derive(Debug, Clone)]
pub enum Resolved {
    Node(Arc<Node>),
    List(Vec<Resolved>),
}

/// Build the resolved list for `steps`. Never fails; no steps -> empty list.
pub fn resolve(steps: &[Step]) -> Vec<Resolved> {
    steps
        .iter()
        .map(|step| match step {
            Step::Node(node) => Resolved::List(vec![Resolved::Node(Arc::clone(node))]),
            Step::Pipeline(pipeline) => Resolved::List(pipeline.resolved_list().to_vec()),
        })
        .collect()
}

/// Unnest arbitrarily deep resolved entries into leaf nodes, in order.
pub fn flatten(resolved: &[Resolved]) -> Vec<Arc<Node>> {
    let mut out = Vec::new();
    flatten_into(resolved, &mut out);
    out
}

fn flatten_into(resolved: &[Resolved], out: &mut Vec<Arc<Node>>) {
    for entry in resolved {
        match entry {
            Resolved::Node(node) => out.push(Arc::clone(node)),
            Resolved::List(items) => flatten_into(items, out),
        }
    }
}

/// First leaf under `resolved`, i.e. `flatten(resolved)[0]`.
pub fn first_node(resolved: &[Resolved]) -> Option<&Arc<Node>> {
    resolved.iter().find_map(|entry| match entry {
        Resolved::Node(node) => Some(node),
        Resolved::List(items) => first_node(items),
    })
}

/// Last leaf under `resolved`, i.e. `flatten(resolved)[-1]`.
pub fn last_node(resolved: &[Resolved]) -> Option<&Arc<Node>> {
    resolved.iter().rev().find_map(|entry| match entry {
        Resolved::Node(node) => Some(node),
        Resolved::List(items) => last_node(items),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::compose::Pipeline;

    fn node(name: &str) -> Arc<Node> {
        Arc::new(Node::shell(name, "true").unwrap())
    }

    fn names(nodes: &[Arc<Node>]) -> Vec<&str> {
        nodes.iter().map(|n| n.name()).collect()
    }

    #[test]
    fn test_empty_steps_resolve_to_empty_list() {
        assert!(resolve(&[]).is_empty());
        assert!(flatten(&[]).is_empty());
        assert!(first_node(&[]).is_none());
        assert!(last_node(&[]).is_none());
    }

    #[test]
    fn test_plain_nodes_resolve_to_singletons() {
        let resolved = resolve(&[Step::from(node("a")), Step::from(node("b"))]);
        assert_eq!(resolved.len(), 2);
        for entry in &resolved {
            match entry {
                Resolved::List(items) => {
                    assert_eq!(items.len(), 1);
                    assert!(matches!(items[0], Resolved::Node(_)));
                }
                Resolved::Node(_) => panic!("expected singleton list"),
            }
        }
        assert_eq!(names(&flatten(&resolved)), vec!["a", "b"]);
    }

    #[test]
    fn test_nested_pipeline_contributes_its_resolved_list() {
        let inner = Pipeline::seq(vec![node("b").into(), node("c").into()]);
        let resolved = resolve(&[node("a").into(), inner.into(), node("d").into()]);

        assert_eq!(resolved.len(), 3);
        assert_eq!(names(&flatten(&resolved)), vec!["a", "b", "c", "d"]);
        assert_eq!(names(&flatten(&resolved[1..2])), vec!["b", "c"]);
        assert_eq!(first_node(&resolved[1..2]).unwrap().name(), "b");
        assert_eq!(last_node(&resolved[1..2]).unwrap().name(), "c");
    }

    #[test]
    fn test_first_and_last_skip_empty_lists() {
        let resolved = vec![
            Resolved::List(vec![]),
            Resolved::List(vec![Resolved::List(vec![Resolved::Node(node("x"))])]),
            Resolved::List(vec![Resolved::Node(node("y")), Resolved::List(vec![])]),
        ];
        assert_eq!(first_node(&resolved).unwrap().name(), "x");
        assert_eq!(last_node(&resolved).unwrap().name(), "y");
    }
}

use std::collections::{HashMap, HashSet};

use crate::errors::{OrchestrationError, Result};
use crate::model::{AgentId, PhaseId};

/// One node of the dependency graph, in registration order.
#[derive(Debug, Clone, Copy)]
pub struct Node<'a> {
    pub id: &'a AgentId,
    pub dependencies: &'a [AgentId],
    pub phase: Option<&'a PhaseId>,
}

/// Rejects dangling references, self-dependencies and cycles. Under `pipeline`, also
/// rejects agents with no phase and dependencies on agents in a later phase.
pub fn validate(nodes: &[Node<'_>], phase_order: &[PhaseId], pipeline: bool) -> Result<()> {
    let known: HashSet<&AgentId> = nodes.iter().map(|node| node.id).collect();
    if known.len() != nodes.len() {
        return Err(OrchestrationError::invalid_graph("duplicate agent id"));
    }

    for node in nodes {
        for dep in node.dependencies {
            if dep == node.id {
                return Err(OrchestrationError::invalid_graph(format!(
                    "agent {} depends on itself",
                    node.id
                )));
            }
            if !known.contains(dep) {
                return Err(OrchestrationError::invalid_graph(format!(
                    "agent {} depends on unknown agent {dep}",
                    node.id
                )));
            }
        }
    }

    if let Some(cycle) = detect_cycle(nodes) {
        let rendered: Vec<&str> = cycle.iter().map(|id| id.as_str()).collect();
        return Err(OrchestrationError::invalid_graph(format!(
            "dependency cycle: {}",
            rendered.join(" -> ")
        )));
    }

    if pipeline {
        validate_phase_order(nodes, phase_order)?;
    }
    Ok(())
}

fn validate_phase_order(nodes: &[Node<'_>], phase_order: &[PhaseId]) -> Result<()> {
    let position: HashMap<&PhaseId, usize> = phase_order
        .iter()
        .enumerate()
        .map(|(index, id)| (id, index))
        .collect();
    let mut agent_position = HashMap::new();
    for node in nodes {
        let Some(index) = node.phase.and_then(|phase| position.get(phase)) else {
            return Err(OrchestrationError::invalid_plan(format!(
                "agent {} has no phase under the pipeline strategy",
                node.id
            )));
        };
        agent_position.insert(node.id, *index);
    }
    for node in nodes {
        let own = agent_position[node.id];
        for dep in node.dependencies {
            if agent_position.get(dep).is_some_and(|dep_index| *dep_index > own) {
                return Err(OrchestrationError::invalid_graph(format!(
                    "agent {} depends on {dep}, which runs in a later phase",
                    node.id
                )));
            }
        }
    }
    Ok(())
}

/// Depth-first search for a cycle; returns the cycle path closed on its first node.
pub(crate) fn detect_cycle(nodes: &[Node<'_>]) -> Option<Vec<AgentId>> {
    let graph: HashMap<&AgentId, &[AgentId]> =
        nodes.iter().map(|node| (node.id, node.dependencies)).collect();
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();

    for node in nodes {
        if dfs_cycle(node.id, &graph, &mut visited, &mut on_stack, &mut path) {
            return Some(path);
        }
    }
    None
}

fn dfs_cycle<'a>(
    node: &'a AgentId,
    graph: &HashMap<&'a AgentId, &'a [AgentId]>,
    visited: &mut HashSet<&'a AgentId>,
    on_stack: &mut HashSet<&'a AgentId>,
    path: &mut Vec<AgentId>,
) -> bool {
    if on_stack.contains(node) {
        if let Some(start) = path.iter().position(|id| id == node) {
            path.drain(..start);
        }
        path.push(node.clone());
        return true;
    }
    if !visited.insert(node) {
        return false;
    }

    on_stack.insert(node);
    path.push(node.clone());

    if let Some(&deps) = graph.get(node) {
        for dep in deps {
            if dfs_cycle(dep, graph, visited, on_stack, path) {
                return true;
            }
        }
    }

    on_stack.remove(node);
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<AgentId> {
        names.iter().map(|name| AgentId::from(*name)).collect()
    }

    fn check(edges: Vec<(&str, Vec<&str>)>) -> Result<()> {
        let owned: Vec<(AgentId, Vec<AgentId>)> = edges
            .iter()
            .map(|(id, deps)| (AgentId::from(*id), ids(deps)))
            .collect();
        let nodes: Vec<Node<'_>> = owned
            .iter()
            .map(|(id, deps)| Node {
                id,
                dependencies: deps,
                phase: None,
            })
            .collect();
        validate(&nodes, &[], false)
    }

    #[test]
    fn no_cycle() {
        assert!(check(vec![
            ("a-1", vec!["b-1", "c-1"]),
            ("b-1", vec!["d-1"]),
            ("c-1", vec!["d-1"]),
            ("d-1", vec![]),
        ])
        .is_ok());
    }

    #[test]
    fn two_node_cycle_is_rejected() {
        let err = check(vec![("a-1", vec!["b-1"]), ("b-1", vec!["a-1"])]).unwrap_err();
        match err {
            OrchestrationError::InvalidDependencyGraph { reason } => {
                assert!(reason.contains("a-1 -> b-1 -> a-1"), "{reason}")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn longer_cycle_reports_only_the_loop() {
        let owned = [
            (AgentId::from("x-1"), ids(&["a-1"])),
            (AgentId::from("a-1"), ids(&["b-1"])),
            (AgentId::from("b-1"), ids(&["c-1"])),
            (AgentId::from("c-1"), ids(&["a-1"])),
        ];
        let nodes: Vec<Node<'_>> = owned
            .iter()
            .map(|(id, deps)| Node {
                id,
                dependencies: deps,
                phase: None,
            })
            .collect();
        let cycle = detect_cycle(&nodes).unwrap();
        assert_eq!(cycle, ids(&["a-1", "b-1", "c-1", "a-1"]));
    }

    #[test]
    fn self_dependency_is_rejected() {
        assert!(matches!(
            check(vec![("a-1", vec!["a-1"])]),
            Err(OrchestrationError::InvalidDependencyGraph { .. })
        ));
    }

    #[test]
    fn dangling_reference_is_rejected() {
        assert!(matches!(
            check(vec![("a-1", vec!["ghost-1"])]),
            Err(OrchestrationError::InvalidDependencyGraph { .. })
        ));
    }

    #[test]
    fn pipeline_rejects_dependency_on_later_phase() {
        let design = PhaseId::at(1);
        let build = PhaseId::at(2);
        let a = AgentId::from("architect-1");
        let e = AgentId::from("engineer-1");
        let a_deps = vec![e.clone()];
        let nodes = [
            Node {
                id: &a,
                dependencies: &a_deps,
                phase: Some(&design),
            },
            Node {
                id: &e,
                dependencies: &[],
                phase: Some(&build),
            },
        ];
        let phases = [design.clone(), build.clone()];
        assert!(matches!(
            validate(&nodes, &phases, true),
            Err(OrchestrationError::InvalidDependencyGraph { .. })
        ));
    }
}

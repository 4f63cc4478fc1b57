//! Workflow graph integrity checks.
//!
//! All checks run before any node executes; a failure is reported as
//! [`Error::GraphIntegrity`] naming the offending node or connection.

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{ConnectionKind, Workflow};
use crate::error::{Error, Result};
use crate::nodes::{InputPolicy, NodeRegistry};

/// Validate a workflow's structure.
///
/// Checks for:
/// - At least one node
/// - Unique, non-empty node IDs and unique names
/// - Non-empty node types
/// - Connections referencing existing nodes
/// - No cycles over main connections
/// - Loop connections that close a cycle
pub fn validate_workflow(workflow: &Workflow) -> Result<()> {
    if workflow.nodes.is_empty() {
        return Err(Error::GraphIntegrity(
            "Workflow must have at least one node".into(),
        ));
    }

    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for node in &workflow.nodes {
        if node.id.is_empty() {
            return Err(Error::GraphIntegrity("Node ID cannot be empty".into()));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(Error::GraphIntegrity(format!(
                "Duplicate node ID: {}",
                node.id
            )));
        }
        if !names.insert(node.display_name()) {
            return Err(Error::GraphIntegrity(format!(
                "Duplicate node name: {}",
                node.display_name()
            )));
        }
        if node.node_type.is_empty() {
            return Err(Error::GraphIntegrity(format!(
                "Node '{}' has empty type",
                node.id
            )));
        }
    }

    for (idx, conn) in workflow.connections.iter().enumerate() {
        for end in [&conn.from, &conn.to] {
            if !ids.contains(end.as_str()) {
                return Err(Error::GraphIntegrity(format!(
                    "Connection #{} ({} -> {}) references non-existent node '{}'",
                    idx, conn.from, conn.to, end
                )));
            }
        }
    }

    if let Some(node) = find_main_cycle(workflow) {
        return Err(Error::GraphIntegrity(format!(
            "Main connections form a cycle through node '{}'; use a loop connection to close intentional cycles",
            node
        )));
    }

    for conn in workflow
        .connections
        .iter()
        .filter(|c| c.kind == ConnectionKind::Loop)
    {
        if !reaches_over_main(workflow, &conn.to, &conn.from) {
            return Err(Error::GraphIntegrity(format!(
                "Loop connection {} -> {} does not close a cycle: '{}' cannot reach '{}'",
                conn.from, conn.to, conn.to, conn.from
            )));
        }
    }

    Ok(())
}

/// Validate a workflow against the node types available in `registry`.
///
/// Runs the structural checks, then checks node types exist and every
/// connection uses a declared output branch and input index.
pub fn validate_graph(workflow: &Workflow, registry: &NodeRegistry) -> Result<()> {
    validate_workflow(workflow)?;

    for node in &workflow.nodes {
        if !registry.has(&node.node_type) {
            return Err(Error::GraphIntegrity(format!(
                "Node '{}' has unknown type '{}'",
                node.id, node.node_type
            )));
        }
    }

    for conn in &workflow.connections {
        let (Some(from), Some(to)) = (workflow.get_node(&conn.from), workflow.get_node(&conn.to))
        else {
            continue;
        };
        let outputs = registry
            .descriptor(&from.node_type, &from.parameters)
            .map(|d| d.outputs())
            .unwrap_or(1);
        if conn.branch >= outputs {
            return Err(Error::GraphIntegrity(format!(
                "Connection {} -> {} uses branch {} but '{}' has {} output(s)",
                conn.from, conn.to, conn.branch, conn.from, outputs
            )));
        }
        let inputs = registry
            .descriptor(&to.node_type, &to.parameters)
            .map(|d| d.inputs)
            .unwrap_or(1);
        if conn.input >= inputs {
            return Err(Error::GraphIntegrity(format!(
                "Connection {} -> {} uses input {} but '{}' has {} input(s)",
                conn.from, conn.to, conn.input, conn.to, inputs
            )));
        }
    }

    Ok(())
}

/// Nodes reachable from `start_nodes` over any connection.
pub fn reachable_from(workflow: &Workflow, start_nodes: &[String]) -> HashSet<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for start in start_nodes {
        if seen.insert(start.clone()) {
            queue.push_back(start.as_str());
        }
    }

    while let Some(current) = queue.pop_front() {
        for conn in workflow.connections.iter().filter(|c| c.from == current) {
            if seen.insert(conn.to.clone()) {
                queue.push_back(conn.to.as_str());
            }
        }
    }

    seen
}

/// Fail when a reachable wait-for-all node has an input index whose every
/// feeding connection comes from an unreachable node. Such a node could
/// never become ready.
pub fn check_required_inputs_reachable(
    workflow: &Workflow,
    registry: &NodeRegistry,
    start_nodes: &[String],
) -> Result<HashSet<String>> {
    for start in start_nodes {
        if workflow.get_node(start).is_none() {
            return Err(Error::GraphIntegrity(format!(
                "Start node '{}' does not exist",
                start
            )));
        }
    }

    let reachable = reachable_from(workflow, start_nodes);

    for node in &workflow.nodes {
        if !reachable.contains(&node.id) || start_nodes.contains(&node.id) {
            continue;
        }
        let Some(descriptor) = registry.descriptor(&node.node_type, &node.parameters) else {
            continue;
        };
        if descriptor.input_policy != InputPolicy::WaitForAll {
            continue;
        }

        // Every declared input index must be fed; loop connections count as
        // feeding their index, main connections only from reachable nodes.
        let mut fed: HashMap<usize, bool> = (0..descriptor.inputs).map(|i| (i, false)).collect();
        let mut connected: HashSet<usize> = HashSet::new();
        for conn in workflow.connections.iter().filter(|c| c.to == node.id) {
            connected.insert(conn.input);
            let entry = fed.entry(conn.input).or_insert(false);
            *entry |= conn.kind == ConnectionKind::Loop || reachable.contains(&conn.from);
        }

        let mut starved: Vec<usize> = fed
            .into_iter()
            .filter_map(|(input, any_reachable)| (!any_reachable).then_some(input))
            .collect();
        starved.sort_unstable();
        if let Some(&input) = starved.first() {
            let reason = if connected.contains(&input) {
                "every node feeding it is unreachable from the start nodes"
            } else {
                "no connection feeds it"
            };
            return Err(Error::GraphIntegrity(format!(
                "Node '{}' waits for input {} but {}",
                node.id, input, reason
            )));
        }
    }

    Ok(reachable)
}

/// Kahn's algorithm over main connections; returns a node on a cycle.
fn find_main_cycle(workflow: &Workflow) -> Option<String> {
    let mut in_degree: HashMap<&str, usize> =
        workflow.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for conn in workflow
        .connections
        .iter()
        .filter(|c| c.kind == ConnectionKind::Main)
    {
        if let Some(d) = in_degree.get_mut(conn.to.as_str()) {
            *d += 1;
        }
    }

    let mut queue: VecDeque<&str> = workflow
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut visited = 0;

    while let Some(current) = queue.pop_front() {
        visited += 1;
        for conn in workflow
            .connections
            .iter()
            .filter(|c| c.kind == ConnectionKind::Main && c.from == current)
        {
            if let Some(d) = in_degree.get_mut(conn.to.as_str()) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(conn.to.as_str());
                }
            }
        }
    }

    if visited == workflow.nodes.len() {
        return None;
    }
    workflow
        .nodes
        .iter()
        .find(|n| in_degree.get(n.id.as_str()).copied().unwrap_or(0) > 0)
        .map(|n| n.id.clone())
}

/// Whether `to` is reachable from `from` following main connections.
fn reaches_over_main(workflow: &Workflow, from: &str, to: &str) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([from]);
    while let Some(current) = queue.pop_front() {
        if current == to {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        for conn in workflow
            .connections
            .iter()
            .filter(|c| c.kind == ConnectionKind::Main && c.from == current)
        {
            queue.push_back(conn.to.as_str());
        }
    }
    false
}

//! Data routing between node branches and node inputs.
//!
//! Routing is a pure function of the static connection list. The walker asks
//! where a branch's items go; what it does with them (readiness, loop
//! re-arming) is its own business.

use std::collections::{HashMap, HashSet};

use crate::workflow::{ConnectionKind, Workflow};

/// One destination of a branch's items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub to: String,
    pub input: usize,
    pub kind: ConnectionKind,
    /// Position of the connection in the workflow's connection list
    pub connection_index: usize,
}

/// Destinations of `source`'s `branch`, in connection declaration order.
pub fn route(workflow: &Workflow, source: &str, branch: usize) -> Vec<Route> {
    workflow
        .connections
        .iter()
        .enumerate()
        .filter(|(_, c)| c.from == source && c.branch == branch)
        .map(|(idx, c)| Route {
            to: c.to.clone(),
            input: c.input,
            kind: c.kind,
            connection_index: idx,
        })
        .collect()
}

/// Pre-indexed connections for one workflow.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    outgoing: HashMap<(String, usize), Vec<Route>>,
    /// Incoming main connection indices per target
    incoming_main: HashMap<String, Vec<(usize, String)>>,
    /// Nodes re-armed when a loop connection delivers to the key
    loop_bodies: HashMap<String, Vec<String>>,
}

impl RoutingTable {
    pub fn new(workflow: &Workflow) -> Self {
        let mut outgoing: HashMap<(String, usize), Vec<Route>> = HashMap::new();
        let mut incoming_main: HashMap<String, Vec<(usize, String)>> = HashMap::new();

        for (idx, conn) in workflow.connections.iter().enumerate() {
            outgoing
                .entry((conn.from.clone(), conn.branch))
                .or_default()
                .push(Route {
                    to: conn.to.clone(),
                    input: conn.input,
                    kind: conn.kind,
                    connection_index: idx,
                });
            if conn.kind == ConnectionKind::Main {
                incoming_main
                    .entry(conn.to.clone())
                    .or_default()
                    .push((idx, conn.from.clone()));
            }
        }

        let mut loop_bodies = HashMap::new();
        for conn in workflow
            .connections
            .iter()
            .filter(|c| c.kind == ConnectionKind::Loop)
        {
            if loop_bodies.contains_key(&conn.to) {
                continue;
            }
            loop_bodies.insert(conn.to.clone(), loop_body(workflow, &conn.to));
        }

        Self {
            outgoing,
            incoming_main,
            loop_bodies,
        }
    }

    /// Destinations of a branch.
    pub fn routes(&self, source: &str, branch: usize) -> &[Route] {
        self.outgoing
            .get(&(source.to_string(), branch))
            .map(|r| r.as_slice())
            .unwrap_or(&[])
    }

    /// Incoming main connections of `node_id` whose source is in `reachable`.
    /// These are the deliveries a wait-for-all node needs.
    pub fn required_connections(&self, node_id: &str, reachable: &HashSet<String>) -> Vec<usize> {
        self.incoming_main
            .get(node_id)
            .map(|conns| {
                conns
                    .iter()
                    .filter(|(_, from)| reachable.contains(from))
                    .map(|(idx, _)| *idx)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes on a cycle through `target`, target first.
    pub fn loop_body(&self, target: &str) -> &[String] {
        self.loop_bodies
            .get(target)
            .map(|b| b.as_slice())
            .unwrap_or(&[])
    }
}

/// Nodes reachable from `target` over main connections that can themselves
/// reach a loop connection back into `target`.
fn loop_body(workflow: &Workflow, target: &str) -> Vec<String> {
    let loop_sources: HashSet<&str> = workflow
        .connections
        .iter()
        .filter(|c| c.kind == ConnectionKind::Loop && c.to == target)
        .map(|c| c.from.as_str())
        .collect();

    let forward = main_closure(workflow, target, |c| (&c.from, &c.to));
    let mut backward: HashSet<String> = HashSet::new();
    for source in &loop_sources {
        backward.extend(main_closure(workflow, source, |c| (&c.to, &c.from)));
    }

    // Declaration order keeps re-arming deterministic.
    workflow
        .nodes
        .iter()
        .map(|n| n.id.clone())
        .filter(|id| forward.contains(id) && backward.contains(id))
        .collect()
}

fn main_closure<F>(workflow: &Workflow, start: &str, edge: F) -> HashSet<String>
where
    F: Fn(&crate::workflow::Connection) -> (&String, &String),
{
    let mut seen: HashSet<String> = HashSet::from([start.to_string()]);
    let mut stack = vec![start.to_string()];
    while let Some(current) = stack.pop() {
        for conn in workflow
            .connections
            .iter()
            .filter(|c| c.kind == ConnectionKind::Main)
        {
            let (from, to) = edge(conn);
            if *from == current && seen.insert(to.clone()) {
                stack.push(to.clone());
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow;

    fn branching() -> Workflow {
        parse_workflow(
            r#"
id: routes
nodes:
  - { id: a, type: if }
  - { id: b, type: noop }
  - { id: c, type: noop }
  - { id: d, type: merge }
connections:
  - { from: a, branch: 0, to: b }
  - { from: a, branch: 1, to: c }
  - { from: b, to: d, input: 0 }
  - { from: c, to: d, input: 1 }
  - { from: a, branch: 0, to: d, input: 0 }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_route_preserves_declaration_order() {
        let wf = branching();
        let routes = route(&wf, "a", 0);
        let targets: Vec<(&str, usize)> = routes
            .iter()
            .map(|r| (r.to.as_str(), r.connection_index))
            .collect();
        assert_eq!(targets, vec![("b", 0), ("d", 4)]);
        assert!(route(&wf, "a", 2).is_empty());
    }

    #[test]
    fn test_table_matches_pure_route() {
        let wf = branching();
        let table = RoutingTable::new(&wf);
        for (source, branch) in [("a", 0), ("a", 1), ("b", 0), ("d", 0)] {
            assert_eq!(table.routes(source, branch), route(&wf, source, branch).as_slice());
        }
    }

    #[test]
    fn test_required_connections_ignore_unreachable_sources() {
        let wf = branching();
        let table = RoutingTable::new(&wf);
        let all: HashSet<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert_eq!(table.required_connections("d", &all), vec![2, 3, 4]);

        let without_c: HashSet<String> = ["a", "b", "d"].iter().map(|s| s.to_string()).collect();
        assert_eq!(table.required_connections("d", &without_c), vec![2, 4]);
    }

    #[test]
    fn test_loop_body_excludes_exit_path() {
        let wf = parse_workflow(
            r#"
id: loop
nodes:
  - { id: start, type: manual_trigger }
  - { id: batches, type: split_in_batches }
  - { id: work, type: noop }
  - { id: tidy, type: noop }
  - { id: report, type: noop }
connections:
  - { from: start, to: batches }
  - { from: batches, branch: 0, to: work }
  - { from: work, to: tidy }
  - { from: tidy, to: batches, kind: loop }
  - { from: batches, branch: 1, to: report }
"#,
        )
        .unwrap();
        let table = RoutingTable::new(&wf);
        assert_eq!(table.loop_body("batches"), ["batches", "work", "tidy"]);
        assert!(table.loop_body("work").is_empty());
    }
}

//! DeadlockDetector (SPEC_FULL.md §4.8): builds a dependency graph over
//! non-terminal tasks and finds cycles via DFS with an explicit recursion
//! stack and path vector, so the exact cycle membership can be extracted
//! (not just "a cycle exists").

use std::collections::{HashMap, HashSet};

use crate::types::{Task, TaskState};

pub struct DeadlockDetector;

impl DeadlockDetector {
    /// Edges go task -> dependency, over every task not in Done or Failed.
    fn build_graph(tasks: &[Task]) -> HashMap<String, Vec<String>> {
        let mut graph = HashMap::new();
        for task in tasks {
            if matches!(task.state, TaskState::Done | TaskState::Failed) {
                continue;
            }
            graph.insert(task.id.clone(), task.dependencies.clone());
        }
        graph
    }

    /// Returns every cycle found, each as the ordered list of task ids that
    /// compose it (first id repeats at the end is not included; the list is
    /// already a closed loop in traversal order).
    pub fn detect_cycles(tasks: &[Task]) -> Vec<Vec<String>> {
        let graph = Self::build_graph(tasks);
        let mut visited: HashSet<String> = HashSet::new();
        let mut cycles = Vec::new();

        let mut nodes: Vec<&String> = graph.keys().collect();
        nodes.sort();
        for node in nodes {
            if !visited.contains(node) {
                let mut path = Vec::new();
                let mut on_stack = HashSet::new();
                Self::dfs(node, &graph, &mut visited, &mut on_stack, &mut path, &mut cycles);
            }
        }
        cycles
    }

    fn dfs(
        node: &str,
        graph: &HashMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(node.to_string());
        on_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(deps) = graph.get(node) {
            for dep in deps {
                if !graph.contains_key(dep) {
                    // Dependency outside the non-terminal graph (e.g. already Done); no edge to follow.
                    continue;
                }
                if on_stack.contains(dep) {
                    let start = path.iter().position(|n| n == dep).unwrap();
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(dep.clone());
                    cycles.push(cycle);
                } else if !visited.contains(dep) {
                    Self::dfs(dep, graph, visited, on_stack, path, cycles);
                }
            }
        }

        path.pop();
        on_stack.remove(node);
    }

    pub fn blocked_tasks(tasks: &[Task]) -> HashSet<String> {
        let mut blocked = HashSet::new();
        for cycle in Self::detect_cycles(tasks) {
            for id in cycle {
                blocked.insert(id);
            }
        }
        blocked
    }

    /// One "Remove dependency from X to Y" suggestion per cycle, where X is
    /// the last node on the recorded cycle path and Y is the node it
    /// closes back to (SPEC_FULL.md §4.8).
    pub fn suggest_resolution(cycles: &[Vec<String>]) -> Vec<String> {
        cycles
            .iter()
            .enumerate()
            .map(|(i, cycle)| {
                let x = cycle.last().cloned().unwrap_or_default();
                let y = cycle.first().cloned().unwrap_or_default();
                format!("Cycle {}: Remove dependency from {} to {}", i, x, y)
            })
            .collect()
    }
}

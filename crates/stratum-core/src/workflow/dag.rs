//! Step graph validation and cycle detection.
//!
//! Uses `petgraph` to model step dependencies as a directed graph with an
//! edge from each dependency to its dependent. Cycles are found with a
//! depth-first search that tracks the recursion stack, so every reported
//! cycle comes with its full path.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use stratum_types::workflow::{ValidationIssue, ValidationIssueKind, ValidationReport};

use super::context::WorkflowContext;
use super::step::Step;

/// Check `steps` without executing anything.
///
/// Reports empty and duplicate IDs, self-dependencies, unknown dependencies,
/// zero timeouts, handler-level rejections and every dependency cycle.
pub fn validate_steps<S: AsRef<Step>>(steps: &[S], ctx: &WorkflowContext) -> ValidationReport {
    let steps: Vec<&Step> = steps.iter().map(AsRef::as_ref).collect();
    let mut issues = Vec::new();
    let mut seen = HashSet::new();

    for step in &steps {
        if step.id().trim().is_empty() {
            issues.push(issue(
                ValidationIssueKind::EmptyId,
                None,
                "step ID must not be empty".to_string(),
            ));
        } else if !seen.insert(step.id()) {
            issues.push(issue(
                ValidationIssueKind::DuplicateId,
                Some(step.id()),
                format!("duplicate step ID '{}'", step.id()),
            ));
        }

        if step.step_timeout().is_some_and(|t| t.is_zero()) {
            issues.push(issue(
                ValidationIssueKind::InvalidTimeout,
                Some(step.id()),
                format!("step '{}' has a zero timeout", step.id()),
            ));
        }

        if let Err(reason) = step.handler().validate_dyn(ctx) {
            issues.push(issue(
                ValidationIssueKind::StepRejected,
                Some(step.id()),
                format!("step '{}' rejected: {reason}", step.id()),
            ));
        }
    }

    let (graph, unknown) = build_graph(&steps);
    for (step_id, dep) in unknown {
        if step_id == dep {
            issues.push(issue(
                ValidationIssueKind::SelfDependency,
                Some(step_id),
                format!("step '{step_id}' depends on itself"),
            ));
        } else {
            issues.push(issue(
                ValidationIssueKind::UnknownDependency,
                Some(step_id),
                format!("step '{step_id}' depends on unknown step '{dep}'"),
            ));
        }
    }

    let cycles = find_cycles(&graph);
    for cycle in &cycles {
        issues.push(issue(
            ValidationIssueKind::Cycle,
            cycle.first().map(String::as_str),
            format!("cycle detected: {}", cycle.join(" -> ")),
        ));
    }

    ValidationReport {
        valid: issues.is_empty(),
        step_count: steps.len(),
        issues,
        cycles,
    }
}

fn issue(kind: ValidationIssueKind, step_id: Option<&str>, message: String) -> ValidationIssue {
    ValidationIssue {
        kind,
        step_id: step_id.map(str::to_string),
        message,
    }
}

/// Build the dependency graph over the first occurrence of each ID.
///
/// Self-edges and edges to unknown IDs are left out and returned as
/// `(step_id, dependency)` pairs instead.
fn build_graph<'a>(steps: &[&'a Step]) -> (DiGraph<&'a str, ()>, Vec<(&'a str, &'a str)>) {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for step in steps {
        index
            .entry(step.id())
            .or_insert_with(|| graph.add_node(step.id()));
    }

    let mut unknown = Vec::new();
    for step in steps {
        let to = index[step.id()];
        for dep in step.dependencies() {
            match index.get(dep.as_str()) {
                Some(_) if dep == step.id() => unknown.push((step.id(), dep.as_str())),
                Some(&from) => {
                    graph.update_edge(from, to, ());
                }
                None => unknown.push((step.id(), dep.as_str())),
            }
        }
    }
    (graph, unknown)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Every back edge found by DFS, as a path with the first ID repeated last.
fn find_cycles(graph: &DiGraph<&str, ()>) -> Vec<Vec<String>> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut stack = Vec::new();
    let mut cycles = Vec::new();

    for node in graph.node_indices() {
        if marks[node.index()] == Mark::Unvisited {
            visit(graph, node, &mut marks, &mut stack, &mut cycles);
        }
    }
    cycles
}

fn visit(
    graph: &DiGraph<&str, ()>,
    node: NodeIndex,
    marks: &mut [Mark],
    stack: &mut Vec<NodeIndex>,
    cycles: &mut Vec<Vec<String>>,
) {
    marks[node.index()] = Mark::OnStack;
    stack.push(node);

    // petgraph yields neighbors newest-edge first; sort for stable reports.
    let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
    next.sort();

    for succ in next {
        match marks[succ.index()] {
            Mark::Unvisited => visit(graph, succ, marks, stack, cycles),
            Mark::OnStack => {
                if let Some(pos) = stack.iter().position(|&n| n == succ) {
                    let mut path: Vec<String> =
                        stack[pos..].iter().map(|&n| graph[n].to_string()).collect();
                    path.push(graph[succ].to_string());
                    cycles.push(path);
                }
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[node.index()] = Mark::Done;
}

/// Every step `step_id` depends on, directly or transitively.
pub fn transitive_dependencies<'a>(step_id: &str, steps: &'a [Step]) -> Vec<&'a str> {
    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id(), s)).collect();
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![step_id];

    while let Some(current) = stack.pop() {
        if let Some(step) = by_id.get(current) {
            for dep in step.dependencies() {
                if visited.insert(dep.as_str()) {
                    order.push(dep.as_str());
                    stack.push(dep.as_str());
                }
            }
        }
    }
    order
}

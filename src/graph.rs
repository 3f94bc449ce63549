//! Submission-time validation of phase dependency graphs.
//!
//! Acyclicity is checked exactly once, when a workflow run is submitted.
//! A failing submission is rejected wholesale and nothing is persisted.
//! Edges to phases of earlier runs (external dependencies) cannot introduce
//! cycles because they always point backward in insertion time; they are
//! only checked for existence, by the caller, against the store.

use std::collections::HashMap;

use crate::errors::SubmitError;
use crate::store::NewPhase;

/// Validate a submission's internal dependency graph.
///
/// Checks, in order: the submission is non-empty, phase names are unique,
/// every dependency references a sibling phase, and the graph is acyclic
/// (Kahn's algorithm).
pub fn validate(phases: &[NewPhase]) -> Result<(), SubmitError> {
    if phases.is_empty() {
        return Err(SubmitError::Empty);
    }

    let mut index_map: HashMap<&str, usize> = HashMap::new();
    for (i, phase) in phases.iter().enumerate() {
        if index_map.insert(phase.name.as_str(), i).is_some() {
            return Err(SubmitError::DuplicateName(phase.name.clone()));
        }
    }

    // dependents[i] lists the phases that wait on phase i.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); phases.len()];
    let mut in_degree: Vec<usize> = vec![0; phases.len()];

    for (to, phase) in phases.iter().enumerate() {
        for dep in &phase.depends_on {
            let from = *index_map
                .get(dep.as_str())
                .ok_or_else(|| SubmitError::UnknownDependency {
                    phase: phase.name.clone(),
                    dependency: dep.clone(),
                })?;
            dependents[from].push(to);
            in_degree[to] += 1;
        }
    }

    let mut queue: Vec<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut processed = 0;
    while let Some(node) = queue.pop() {
        processed += 1;
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    if processed != phases.len() {
        let cycle_phases: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| phases[i].name.clone())
            .collect();
        return Err(SubmitError::CycleDetected {
            phases: cycle_phases,
        });
    }

    Ok(())
}

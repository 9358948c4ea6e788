//! Dependency resolution and load ordering.
//!
//! Builds the adjacency map of a candidate batch plus the set of
//! already-registered plugins and runs Kahn's algorithm with deterministic
//! ascending-lexicographic tie-breaks, using a `BTreeSet` as the ready queue
//! (equivalent to a `BinaryHeap<Reverse<PluginId>>` but without the wrapper
//! boilerplate).

use std::collections::{BTreeSet, HashMap, HashSet};

use plugin_runtime_core::{PluginError, PluginErrorKind, PluginId, PluginMetadata, PluginResult};

/// The outcome of resolving one batch: a topological load order plus
/// non-fatal warnings (missing optional dependencies).
pub struct ResolveOutcome {
    pub order: Vec<PluginId>,
    pub warnings: Vec<String>,
}

/// Compute a topological load order for `batch` given the ids already
/// registered in the manager. Required dependencies missing from both the
/// batch and `already_loaded` fail with `DependencyMissing`; a cycle among
/// the batch fails with `DependencyMissing` naming the cycle. Missing
/// optional dependencies only produce a warning.
pub fn resolve_load_order(
    batch: &[PluginMetadata],
    already_loaded: &HashSet<PluginId>,
) -> PluginResult<ResolveOutcome> {
    let batch_ids: HashSet<PluginId> = batch.iter().map(|m| m.id.clone()).collect();
    let mut warnings = Vec::new();

    // edges[dep] = set of nodes that depend on `dep` and must load after it.
    let mut edges: HashMap<PluginId, Vec<PluginId>> = HashMap::new();
    let mut in_degree: HashMap<PluginId, usize> = batch_ids.iter().cloned().map(|id| (id, 0)).collect();

    for plugin in batch {
        for dep in &plugin.dependencies {
            if already_loaded.contains(dep) {
                continue;
            }
            if batch_ids.contains(dep) {
                edges.entry(dep.clone()).or_default().push(plugin.id.clone());
                *in_degree.get_mut(&plugin.id).unwrap() += 1;
            } else {
                return Err(PluginError::new(
                    PluginErrorKind::DependencyMissing,
                    format!("missing required dependency \"{dep}\" of \"{}\"", plugin.id),
                )
                .with_details(format!("required_by={}", plugin.id)));
            }
        }
        for dep in &plugin.optional_dependencies {
            if already_loaded.contains(dep) {
                continue;
            }
            if batch_ids.contains(dep) {
                edges.entry(dep.clone()).or_default().push(plugin.id.clone());
                *in_degree.get_mut(&plugin.id).unwrap() += 1;
            } else {
                warnings.push(format!(
                    "optional dependency \"{dep}\" of \"{}\" is not available; continuing without it",
                    plugin.id
                ));
            }
        }
    }

    let mut ready: BTreeSet<PluginId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| id.clone())
        .collect();

    let mut order = Vec::with_capacity(batch.len());
    while let Some(next) = ready.iter().next().cloned() {
        ready.remove(&next);
        order.push(next.clone());
        if let Some(dependents) = edges.get(&next) {
            for dependent in dependents {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent.clone());
                }
            }
        }
    }

    if order.len() != batch.len() {
        let cycle = find_cycle(&batch_ids, &edges, &in_degree);
        return Err(PluginError::new(
            PluginErrorKind::DependencyMissing,
            format!("dependency cycle detected: {}", cycle.join(" -> ")),
        ));
    }

    Ok(ResolveOutcome { order, warnings })
}

/// Find one concrete cycle among the nodes that never reached zero
/// in-degree, for a readable error message.
fn find_cycle(
    batch_ids: &HashSet<PluginId>,
    edges: &HashMap<PluginId, Vec<PluginId>>,
    in_degree: &HashMap<PluginId, usize>,
) -> Vec<PluginId> {
    let remaining: HashSet<&PluginId> = in_degree
        .iter()
        .filter(|(_, d)| **d > 0)
        .map(|(id, _)| id)
        .collect();

    // reverse adjacency restricted to `remaining`: node -> its dependencies
    let mut depends_on: HashMap<&PluginId, Vec<&PluginId>> = HashMap::new();
    for (dep, dependents) in edges {
        for dependent in dependents {
            if remaining.contains(dependent) && remaining.contains(dep) {
                depends_on.entry(dependent).or_default().push(dep);
            }
        }
    }

    let start = match remaining.iter().min() {
        Some(s) => *s,
        None => return vec!["<unknown>".to_string()],
    };

    let mut path = vec![start];
    let mut visited: HashSet<&PluginId> = HashSet::new();
    let mut current = start;
    loop {
        if !visited.insert(current) {
            // close the loop at the repeated node
            if let Some(pos) = path.iter().position(|id| *id == current) {
                path.truncate(pos + 1);
            }
            break;
        }
        let Some(next_candidates) = depends_on.get(current) else {
            break;
        };
        let Some(next) = next_candidates.iter().min().copied() else {
            break;
        };
        path.push(next);
        current = next;
    }
    let _ = batch_ids;
    path.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_runtime_core::Version;
    use std::collections::HashSet as StdHashSet;

    fn meta(id: &str, deps: &[&str]) -> PluginMetadata {
        PluginMetadata {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            version: Version::new(1, 0, 0),
            author: String::new(),
            license: String::new(),
            homepage: String::new(),
            category: String::new(),
            tags: Default::default(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            optional_dependencies: vec![],
            capabilities: Default::default(),
            priority: Default::default(),
            min_host_version: None,
            max_host_version: None,
            custom_data: None,
        }
    }

    #[test]
    fn orders_b_after_a_when_b_depends_on_a() {
        let batch = vec![meta("b", &["a"]), meta("a", &[])];
        let outcome = resolve_load_order(&batch, &StdHashSet::new()).unwrap();
        assert_eq!(outcome.order, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn missing_required_dependency_fails() {
        let batch = vec![meta("b", &["a"])];
        let err = resolve_load_order(&batch, &StdHashSet::new()).unwrap_err();
        assert_eq!(err.code, PluginErrorKind::DependencyMissing);
    }

    #[test]
    fn dependency_already_loaded_does_not_require_batch_presence() {
        let batch = vec![meta("b", &["a"])];
        let mut loaded = StdHashSet::new();
        loaded.insert("a".to_string());
        let outcome = resolve_load_order(&batch, &loaded).unwrap();
        assert_eq!(outcome.order, vec!["b".to_string()]);
    }

    #[test]
    fn cycle_is_detected_and_reported() {
        let batch = vec![meta("a", &["b"]), meta("b", &["a"])];
        let err = resolve_load_order(&batch, &StdHashSet::new()).unwrap_err();
        assert_eq!(err.code, PluginErrorKind::DependencyMissing);
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn missing_optional_dependency_only_warns() {
        let mut plugin = meta("a", &[]);
        plugin.optional_dependencies = vec!["ghost".to_string()];
        let outcome = resolve_load_order(&[plugin], &StdHashSet::new()).unwrap();
        assert_eq!(outcome.order, vec!["a".to_string()]);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn ties_break_ascending_lexicographically() {
        let batch = vec![meta("z", &[]), meta("a", &[]), meta("m", &[])];
        let outcome = resolve_load_order(&batch, &StdHashSet::new()).unwrap();
        assert_eq!(outcome.order, vec!["a".to_string(), "m".to_string(), "z".to_string()]);
    }
}

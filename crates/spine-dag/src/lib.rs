//! Topological leveling for the workflow runner (§4.7). A "level" is a batch
//! of step names that can run concurrently because every one of their
//! dependencies is already in an earlier level; the runner dispatches a
//! level at a time, waiting for the whole batch before advancing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DagError {
    #[error("cycle detected involving step {0:?}")]
    Cycle(Vec<String>),
    #[error("step {0:?} depends on unknown step {1:?}")]
    UnknownDependency(String, String),
}

/// Group `steps` (name -> its `depends_on` list) into levels via a
/// Kahn's-algorithm topological sort. Within a level, order is
/// lexicographic — deterministic, not insertion-order-dependent, so the same
/// DAG always levels the same way regardless of map iteration order.
pub fn levels(steps: &BTreeMap<String, Vec<String>>) -> Result<Vec<Vec<String>>, DagError> {
    for (name, deps) in steps {
        for dep in deps {
            if !steps.contains_key(dep) {
                return Err(DagError::UnknownDependency(name.clone(), dep.clone()));
            }
        }
    }

    let mut indegree: BTreeMap<&str, usize> = steps.keys().map(|n| (n.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, deps) in steps {
        *indegree.get_mut(name.as_str()).unwrap() += deps.len();
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut levels = Vec::new();
    let mut remaining: BTreeSet<&str> = steps.keys().map(String::as_str).collect();
    let mut ready: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&n, _)| n)
        .collect();

    while !ready.is_empty() {
        let mut level: Vec<&str> = ready.drain(..).collect();
        level.sort_unstable();
        for name in &level {
            remaining.remove(name);
        }
        let mut next_ready = Vec::new();
        for name in &level {
            if let Some(deps) = dependents.get(name) {
                for &dependent in deps {
                    let deg = indegree.get_mut(dependent).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        next_ready.push(dependent);
                    }
                }
            }
        }
        levels.push(level.into_iter().map(String::from).collect());
        ready.extend(next_ready);
    }

    if !remaining.is_empty() {
        return Err(DagError::Cycle(remaining.into_iter().map(String::from).collect()));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_map(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(name, deps)| (name.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn independent_steps_share_one_level() {
        let steps = step_map(&[("a", &[]), ("b", &[])]);
        assert_eq!(levels(&steps).unwrap(), vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn chain_levels_in_order() {
        let steps = step_map(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        assert_eq!(
            levels(&steps).unwrap(),
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
    }

    #[test]
    fn diamond_joins_at_final_level() {
        let steps = step_map(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let result = levels(&steps).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[1], vec!["b".to_string(), "c".to_string()]);
        assert_eq!(result[2], vec!["d".to_string()]);
    }

    #[test]
    fn cycle_is_rejected() {
        let steps = step_map(&[("a", &["b"]), ("b", &["a"])]);
        assert!(matches!(levels(&steps), Err(DagError::Cycle(_))));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let steps = step_map(&[("a", &["ghost"])]);
        assert_eq!(
            levels(&steps),
            Err(DagError::UnknownDependency("a".to_string(), "ghost".to_string()))
        );
    }
}

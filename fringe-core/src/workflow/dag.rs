//! Workflow graph validation and deterministic topological ordering.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{PipelineError, Result};

use super::StageSpec;

/// Validate the dependency graph and produce a deterministic
/// linearisation: Kahn's algorithm with lexicographic tie-breaking on
/// stage names, so test fixtures see a stable order.
pub fn topological_order(stages: &[StageSpec]) -> Result<Vec<usize>> {
    let mut index_by_name: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, spec) in stages.iter().enumerate() {
        if index_by_name.insert(spec.name.as_str(), i).is_some() {
            return Err(PipelineError::WorkflowInvalid(format!(
                "duplicate stage name `{}`",
                spec.name
            )));
        }
    }

    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for spec in stages {
        indegree.entry(spec.name.as_str()).or_insert(0);
        for dep in &spec.depends_on {
            if dep == &spec.name {
                return Err(PipelineError::WorkflowInvalid(format!(
                    "stage `{}` depends on itself",
                    spec.name
                )));
            }
            if !index_by_name.contains_key(dep.as_str()) {
                return Err(PipelineError::WorkflowInvalid(format!(
                    "stage `{}` depends on unknown stage `{dep}`",
                    spec.name
                )));
            }
            *indegree.entry(spec.name.as_str()).or_insert(0) += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(spec.name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(stages.len());
    while let Some(name) = ready.pop_first() {
        order.push(index_by_name[name]);
        for dependent in dependents.get(name).map(Vec::as_slice).unwrap_or(&[]) {
            let degree = indegree
                .get_mut(dependent)
                .ok_or_else(|| PipelineError::WorkflowInvalid(format!("unknown stage `{dependent}`")))?;
            *degree -= 1;
            if *degree == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != stages.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(name, _)| *name)
            .collect();
        return Err(PipelineError::WorkflowInvalid(format!(
            "dependency cycle involving stages: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::stage::{Context, Stage};
    use crate::workflow::StageSpec;

    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Stage for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, ctx: &Context) -> crate::error::Result<Context> {
            Ok(ctx.clone())
        }
    }

    fn spec(name: &'static str, deps: &[&str]) -> StageSpec {
        StageSpec::new(Arc::new(Named(name))).after(deps.iter().copied())
    }

    fn order_of(stages: &[StageSpec]) -> Vec<String> {
        topological_order(stages)
            .unwrap()
            .into_iter()
            .map(|i| stages[i].name.clone())
            .collect()
    }

    #[test]
    fn linear_chain_keeps_dependency_order() {
        let stages = vec![spec("image", &["apply"]), spec("apply", &["convert"]), spec("convert", &[])];
        assert_eq!(order_of(&stages), vec!["convert", "apply", "image"]);
    }

    #[test]
    fn ties_break_lexicographically() {
        let stages = vec![spec("b", &[]), spec("a", &[]), spec("c", &["b"])];
        assert_eq!(order_of(&stages), vec!["a", "b", "c"]);
    }

    #[test]
    fn self_dependency_is_invalid() {
        let stages = vec![spec("a", &["a"])];
        let err = topological_order(&stages).unwrap_err();
        assert!(matches!(err, PipelineError::WorkflowInvalid(_)));
    }

    #[test]
    fn unknown_dependency_is_invalid() {
        let stages = vec![spec("a", &["ghost"])];
        let err = topological_order(&stages).unwrap_err();
        assert!(matches!(err, PipelineError::WorkflowInvalid(_)));
    }

    #[test]
    fn cycles_are_invalid() {
        let stages = vec![spec("a", &["b"]), spec("b", &["a"])];
        let err = topological_order(&stages).unwrap_err();
        assert!(matches!(err, PipelineError::WorkflowInvalid(_)));
    }

    #[test]
    fn duplicate_names_are_invalid() {
        let stages = vec![spec("a", &[]), spec("a", &[])];
        let err = topological_order(&stages).unwrap_err();
        assert!(matches!(err, PipelineError::WorkflowInvalid(_)));
    }

    #[test]
    fn empty_workflow_orders_to_nothing() {
        assert!(topological_order(&[]).unwrap().is_empty());
    }
}

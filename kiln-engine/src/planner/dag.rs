// Job dependency graph
// Cycle detection over `needs` edges and a deterministic topological order.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::PlanError;
use crate::workflow::models::JobMap;

/// The `needs` DAG over logical job names.
#[derive(Debug, Clone)]
pub struct JobDag {
    /// Job name -> direct dependencies, in declaration order.
    edges: Vec<(String, Vec<String>)>,
}

impl JobDag {
    /// Build and validate the graph. Unknown targets and cycles are
    /// `PlanError`s; the run must fail before any job is created.
    pub fn build(jobs: &JobMap) -> Result<Self, PlanError> {
        let names: HashSet<&str> = jobs.names().collect();
        let mut edges = Vec::with_capacity(jobs.len());

        for (name, spec) in jobs.iter() {
            let needs = spec.needs.to_vec();
            for needed in &needs {
                if !names.contains(needed.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        job: name.to_string(),
                        needs: needed.clone(),
                    });
                }
            }
            edges.push((name.to_string(), needs));
        }

        let dag = Self { edges };
        dag.check_cycles()?;
        Ok(dag)
    }

    pub fn needs_of(&self, name: &str) -> &[String] {
        self.edges
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, needs)| needs.as_slice())
            .unwrap_or(&[])
    }

    /// Topological order (Kahn), breaking ties by declaration order.
    pub fn topological_order(&self) -> Vec<&str> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, needs) in &self.edges {
            in_degree.entry(name).or_insert(0);
            for needed in needs {
                dependents.entry(needed).or_default().push(name);
                *in_degree.entry(name).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = self
            .edges
            .iter()
            .filter(|(name, _)| in_degree.get(name.as_str()) == Some(&0))
            .map(|(name, _)| name.as_str())
            .collect();

        let mut order = Vec::with_capacity(self.edges.len());
        while let Some(name) = queue.pop_front() {
            order.push(name);
            if let Some(deps) = dependents.get(name) {
                for &dependent in deps {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        order
    }

    fn check_cycles(&self) -> Result<(), PlanError> {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();

        for (name, _) in &self.edges {
            if !visited.contains(name.as_str()) {
                if let Some(cycle) = self.dfs(name, &mut visited, &mut stack) {
                    return Err(PlanError::CyclicDependency {
                        cycle: cycle.join(" -> "),
                    });
                }
            }
        }
        Ok(())
    }

    fn dfs<'a>(
        &'a self,
        name: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<&'a str>> {
        visited.insert(name);
        stack.insert(name);

        for needed in self.needs_of(name) {
            if !visited.contains(needed.as_str()) {
                if let Some(mut cycle) = self.dfs(needed, visited, stack) {
                    cycle.insert(0, name);
                    return Some(cycle);
                }
            } else if stack.contains(needed.as_str()) {
                return Some(vec![name, needed.as_str()]);
            }
        }

        stack.remove(name);
        None
    }
}

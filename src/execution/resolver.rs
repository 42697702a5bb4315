//! Graph resolver - connects steps through the links they require and create

use crate::core::{InputDefinition, ParameterRegistry, RegistryError, Step, StepLink};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Configuration errors found while resolving the graph
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate step name: {0}")]
    DuplicateStepName(String),

    #[error("{link} is created by both {first} and {second}")]
    DuplicateProducer {
        link: StepLink,
        first: String,
        second: String,
    },

    #[error("parameter {name} is provided by both {first} and {second}")]
    DuplicateParameter {
        name: String,
        first: String,
        second: String,
    },

    #[error("step {step} consumes parameter {name} that no step provides")]
    UnknownParameter { step: String, name: String },

    #[error("dependency cycle between steps: {}", .steps.join(" -> "))]
    Cycle { steps: Vec<String> },
}

/// A required link no step in the graph creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRequirement {
    pub link: StepLink,
    /// Names of the steps requiring it, in declaration order
    pub required_by: Vec<String>,
}

/// A parameter some step declares through its `provides`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredParameter {
    pub name: String,
    pub producer: String,
    pub link: StepLink,
}

/// Resolved dependency graph
///
/// Step indices refer to declaration order; `order()` lists them in execution order.
pub struct StepGraph {
    steps: Vec<Arc<dyn Step>>,
    order: Vec<usize>,
    positions: Vec<usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    external: Vec<ExternalRequirement>,
    parameters: Vec<DeclaredParameter>,
}

impl StepGraph {
    /// Resolve `steps` into a deterministic execution order
    ///
    /// Ties between unconstrained steps go to the one declared first.
    pub fn resolve(steps: Vec<Arc<dyn Step>>) -> Result<Self, GraphError> {
        let mut names: HashMap<String, usize> = HashMap::new();
        for (index, step) in steps.iter().enumerate() {
            if names.insert(step.name().to_string(), index).is_some() {
                return Err(GraphError::DuplicateStepName(step.name().to_string()));
            }
        }

        let mut producers: HashMap<StepLink, usize> = HashMap::new();
        for (index, step) in steps.iter().enumerate() {
            for link in step.creates() {
                if let Some(&first) = producers.get(&link) {
                    return Err(GraphError::DuplicateProducer {
                        link,
                        first: steps[first].name().to_string(),
                        second: step.name().to_string(),
                    });
                }
                producers.insert(link, index);
            }
        }

        let mut declared: BTreeMap<String, (usize, StepLink)> = BTreeMap::new();
        for (index, step) in steps.iter().enumerate() {
            let Some(provides) = step.provides() else {
                continue;
            };
            for name in provides.parameters.names() {
                if let Some((first, _)) = declared.get(name) {
                    return Err(GraphError::DuplicateParameter {
                        name: name.to_string(),
                        first: steps[*first].name().to_string(),
                        second: step.name().to_string(),
                    });
                }
                declared.insert(name.to_string(), (index, provides.link.clone()));
            }
        }

        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
        let mut external: BTreeMap<StepLink, Vec<String>> = BTreeMap::new();
        for step in &steps {
            let mut requires = step.requires();
            let mut deps = BTreeSet::new();

            for name in step.consumes() {
                let (declarer, link) = declared.get(&name).ok_or_else(|| GraphError::UnknownParameter {
                    step: step.name().to_string(),
                    name: name.clone(),
                })?;
                deps.insert(*declarer);
                requires.push(link.clone());
            }

            for link in requires {
                match producers.get(&link) {
                    Some(&producer) => {
                        deps.insert(producer);
                    }
                    None => {
                        let required_by = external.entry(link).or_default();
                        if !required_by.iter().any(|n| n == step.name()) {
                            required_by.push(step.name().to_string());
                        }
                    }
                }
            }
            dependencies.push(deps.into_iter().collect());
        }

        let mut dependents = vec![Vec::new(); steps.len()];
        for (consumer, deps) in dependencies.iter().enumerate() {
            for &producer in deps {
                dependents[producer].push(consumer);
            }
        }

        let order = topological_order(&dependencies, &dependents);
        if order.len() < steps.len() {
            let done: BTreeSet<usize> = order.iter().copied().collect();
            let remaining: BTreeSet<usize> = (0..steps.len()).filter(|i| !done.contains(i)).collect();
            let cycle = find_cycle(&dependencies, &remaining);
            return Err(GraphError::Cycle {
                steps: cycle.into_iter().map(|i| steps[i].name().to_string()).collect(),
            });
        }

        let mut positions = vec![0; steps.len()];
        for (position, &index) in order.iter().enumerate() {
            positions[index] = position;
        }

        let parameters = declared
            .into_iter()
            .map(|(name, (producer, link))| DeclaredParameter {
                name,
                producer: steps[producer].name().to_string(),
                link,
            })
            .collect();

        let external = external
            .into_iter()
            .map(|(link, required_by)| ExternalRequirement { link, required_by })
            .collect();

        Ok(Self {
            steps,
            order,
            positions,
            dependencies,
            dependents,
            external,
            parameters,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> &Arc<dyn Step> {
        &self.steps[index]
    }

    /// Steps in declaration order
    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    /// Step indices in execution order
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Steps in execution order
    pub fn ordered_steps(&self) -> impl Iterator<Item = &Arc<dyn Step>> {
        self.order.iter().map(|&i| &self.steps[i])
    }

    /// Position of a step in the execution order
    pub fn position(&self, index: usize) -> usize {
        self.positions[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == name)
    }

    /// Steps `index` waits on
    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Steps waiting on `index`
    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Every step that directly or indirectly waits on `index`, in execution order
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = self.dependents[index].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.dependents[next].iter().copied());
            }
        }
        let mut result: Vec<usize> = seen.into_iter().collect();
        result.sort_by_key(|&i| self.positions[i]);
        result
    }

    /// Required links no step creates
    pub fn external_requirements(&self) -> &[ExternalRequirement] {
        &self.external
    }

    /// Declared parameters, sorted by name
    pub fn parameters(&self) -> &[DeclaredParameter] {
        &self.parameters
    }

    /// A fresh registry with one slot per declared parameter
    pub fn registry(&self) -> Result<ParameterRegistry, RegistryError> {
        let mut registry = ParameterRegistry::new();
        for parameter in &self.parameters {
            registry.declare(&parameter.name, &parameter.producer, parameter.link.clone())?;
        }
        Ok(registry)
    }

    /// `base` followed by every step's inputs in execution order
    pub fn inputs(&self, base: InputDefinition) -> InputDefinition {
        let mut inputs = base;
        for step in self.ordered_steps() {
            if let Some(step_inputs) = step.inputs() {
                inputs.extend(step_inputs);
            }
        }
        inputs
    }
}

impl std::fmt::Debug for StepGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let order: Vec<&str> = self.ordered_steps().map(|s| s.name()).collect();
        f.debug_struct("StepGraph")
            .field("order", &order)
            .field("external", &self.external)
            .finish()
    }
}

/// Kahn's algorithm, always taking the ready step declared first
fn topological_order(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(Reverse(next)) = ready.pop() {
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }
    order
}

/// Walk dependencies among `remaining` until a step repeats; returns the loop producer first
fn find_cycle(dependencies: &[Vec<usize>], remaining: &BTreeSet<usize>) -> Vec<usize> {
    let Some(&start) = remaining.iter().next() else {
        return Vec::new();
    };

    let mut path = Vec::new();
    let mut on_path: HashMap<usize, usize> = HashMap::new();
    let mut current = start;
    loop {
        if let Some(&at) = on_path.get(&current) {
            let mut cycle = path[at..].to_vec();
            cycle.reverse();
            return cycle;
        }
        on_path.insert(current, path.len());
        path.push(current);

        // every unresolved step still waits on another unresolved step
        match dependencies[current].iter().copied().find(|d| remaining.contains(d)) {
            Some(next) => current = next,
            None => return path,
        }
    }
}

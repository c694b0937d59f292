//! ModuleGraph — dependency DAG over a package's modules.
//!
//! Nodes are stored by index with a parallel name → index map; edges go from
//! a module to every module named by its inputs. Topological order uses
//! Kahn's algorithm with lexicographic tie-breaking so the order is a pure
//! function of names and edges, never of declaration order.

use std::collections::{BTreeSet, HashMap};

use substreams_core::ModuleDef;
use tracing::debug;

use crate::error::{GraphError, GraphResult};

#[derive(Debug, Clone)]
pub struct ModuleGraph {
    modules: Vec<ModuleDef>,
    index: HashMap<String, usize>,
    /// Direct dependencies per node, deduplicated, in declared order.
    parents: Vec<Vec<usize>>,
    order: Vec<usize>,
    /// Longest-path distance from a root, per node.
    stage: Vec<usize>,
}

impl ModuleGraph {
    /// Build the graph, rejecting unknown references and cycles.
    pub fn build(modules: Vec<ModuleDef>) -> GraphResult<Self> {
        let mut index = HashMap::with_capacity(modules.len());
        for (i, module) in modules.iter().enumerate() {
            if index.insert(module.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateModule(module.name.clone()));
            }
        }

        let mut parents = Vec::with_capacity(modules.len());
        for module in &modules {
            let mut deps: Vec<usize> = Vec::new();
            for dep in module.dependencies() {
                let &dep_idx = index.get(dep).ok_or_else(|| GraphError::UnknownModule {
                    module: module.name.clone(),
                    dependency: dep.to_string(),
                })?;
                if !deps.contains(&dep_idx) {
                    deps.push(dep_idx);
                }
            }
            parents.push(deps);
        }

        let order = topological_sort(&modules, &parents)?;

        let mut stage = vec![0usize; modules.len()];
        for &node in &order {
            stage[node] = parents[node]
                .iter()
                .map(|&p| stage[p] + 1)
                .max()
                .unwrap_or(0);
        }

        debug!(modules = modules.len(), "module graph built");
        Ok(Self {
            modules,
            index,
            parents,
            order,
            stage,
        })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn module(&self, name: &str) -> Option<&ModuleDef> {
        self.index.get(name).map(|&i| &self.modules[i])
    }

    fn idx(&self, name: &str) -> GraphResult<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::ModuleNotFound(name.to_string()))
    }

    /// All modules, dependencies first.
    pub fn topological_order(&self) -> Vec<&ModuleDef> {
        self.order.iter().map(|&i| &self.modules[i]).collect()
    }

    /// Direct dependencies of `name`, in declared order.
    pub fn parents(&self, name: &str) -> GraphResult<Vec<&ModuleDef>> {
        let idx = self.idx(name)?;
        Ok(self.parents[idx].iter().map(|&p| &self.modules[p]).collect())
    }

    /// Transitive dependencies of `name`, in topological order.
    pub fn ancestors(&self, name: &str) -> GraphResult<Vec<&ModuleDef>> {
        let idx = self.idx(name)?;
        let closure = self.closure(&[idx]);
        Ok(self
            .order
            .iter()
            .filter(|&&i| i != idx && closure[i])
            .map(|&i| &self.modules[i])
            .collect())
    }

    /// `names` plus everything they depend on, in topological order.
    pub fn modules_down_to(&self, names: &[&str]) -> GraphResult<Vec<&ModuleDef>> {
        let roots = names
            .iter()
            .map(|n| self.idx(n))
            .collect::<GraphResult<Vec<_>>>()?;
        let closure = self.closure(&roots);
        Ok(self
            .order
            .iter()
            .filter(|&&i| closure[i])
            .map(|&i| &self.modules[i])
            .collect())
    }

    /// Store modules within [`ModuleGraph::modules_down_to`].
    pub fn stores_down_to(&self, names: &[&str]) -> GraphResult<Vec<&ModuleDef>> {
        Ok(self
            .modules_down_to(names)?
            .into_iter()
            .filter(|m| m.is_store())
            .collect())
    }

    /// Modules grouped by longest-path distance; every input of a module
    /// lives in a strictly earlier stage. Each stage is in topological order.
    pub fn stages(&self) -> Vec<Vec<&ModuleDef>> {
        let depth = self.stage.iter().copied().max().map_or(0, |d| d + 1);
        let mut out: Vec<Vec<&ModuleDef>> = vec![Vec::new(); depth];
        for &i in &self.order {
            out[self.stage[i]].push(&self.modules[i]);
        }
        out
    }

    pub fn stage_of(&self, name: &str) -> GraphResult<usize> {
        Ok(self.stage[self.idx(name)?])
    }

    /// Marks every node reachable from `roots` through parent edges.
    fn closure(&self, roots: &[usize]) -> Vec<bool> {
        let mut seen = vec![false; self.modules.len()];
        let mut stack: Vec<usize> = roots.to_vec();
        while let Some(node) = stack.pop() {
            if seen[node] {
                continue;
            }
            seen[node] = true;
            stack.extend(self.parents[node].iter().copied());
        }
        seen
    }
}

fn topological_sort(modules: &[ModuleDef], parents: &[Vec<usize>]) -> GraphResult<Vec<usize>> {
    let n = modules.len();
    let mut in_degree: Vec<usize> = parents.iter().map(Vec::len).collect();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (child, deps) in parents.iter().enumerate() {
        for &p in deps {
            children[p].push(child);
        }
    }

    let mut ready: BTreeSet<(&str, usize)> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(|i| (modules[i].name.as_str(), i))
        .collect();
    let mut order = Vec::with_capacity(n);

    while let Some(next) = ready.pop_first() {
        let node = next.1;
        order.push(node);
        for &child in &children[node] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.insert((modules[child].name.as_str(), child));
            }
        }
    }

    if order.len() != n {
        let mut remaining: Vec<String> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| modules[i].name.clone())
            .collect();
        remaining.sort();
        return Err(GraphError::CyclicDependency(remaining));
    }
    Ok(order)
}

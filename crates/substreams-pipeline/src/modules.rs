//! The modules of a request: graph, hashes and binaries.

use substreams_core::{ModuleDef, ValidatedPackage};
use substreams_graph::{ModuleGraph, ModuleHashes};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug)]
pub struct RequestModules {
    graph: ModuleGraph,
    hashes: ModuleHashes,
    binaries: Vec<Vec<u8>>,
}

impl RequestModules {
    pub fn new(modules: Vec<ModuleDef>, binaries: Vec<Vec<u8>>) -> PipelineResult<Self> {
        let graph = ModuleGraph::build(modules)?;
        let refs: Vec<&[u8]> = binaries.iter().map(Vec::as_slice).collect();
        let hashes = ModuleHashes::compute(&graph, &refs)?;
        Ok(Self {
            graph,
            hashes,
            binaries,
        })
    }

    /// Modules of a validated package, after network and params overrides.
    pub fn from_package(package: &ValidatedPackage) -> PipelineResult<Self> {
        let binaries = package
            .raw()
            .binaries
            .iter()
            .map(|b| b.content.clone())
            .collect();
        Self::new(package.modules().to_vec(), binaries)
    }

    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    pub fn hashes(&self) -> &ModuleHashes {
        &self.hashes
    }

    pub fn module(&self, name: &str) -> PipelineResult<&ModuleDef> {
        self.graph
            .module(name)
            .ok_or_else(|| PipelineError::InvalidRequest(format!("unknown module {name:?}")))
    }

    pub fn hash_hex(&self, name: &str) -> PipelineResult<String> {
        Ok(self.hashes.get(name)?.to_hex())
    }

    pub fn binary(&self, index: usize) -> PipelineResult<&[u8]> {
        self.binaries
            .get(index)
            .map(Vec::as_slice)
            .ok_or_else(|| PipelineError::Internal(format!("binary {index} out of range")))
    }

    /// Check that every requested output module exists.
    pub fn check_outputs(&self, outputs: &[String]) -> PipelineResult<()> {
        if outputs.is_empty() {
            return Err(PipelineError::InvalidRequest("no output module requested".into()));
        }
        for name in outputs {
            self.module(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use substreams_core::{InputSpec, ModuleKind};

    use super::*;

    #[test]
    fn outputs_must_exist() {
        let modules = vec![ModuleDef {
            name: "a".into(),
            kind: ModuleKind::Map {
                output_type: "proto:x".into(),
            },
            initial_block: 0,
            binary_index: 0,
            entrypoint: "map_a".into(),
            inputs: vec![InputSpec::Clock],
        }];
        let set = RequestModules::new(modules, vec![Vec::new()]).unwrap();
        assert!(set.check_outputs(&["a".into()]).is_ok());
        assert!(set.check_outputs(&["b".into()]).is_err());
        assert!(set.check_outputs(&[]).is_err());
        assert_eq!(set.hash_hex("a").unwrap().len(), 40);
    }
}

//! Module content hashing.
//!
//! A module's hash covers its kind (with store policy and value type), start
//! block, binary content, entrypoint, its input identities sorted, and the
//! hashes of its ancestors in topological order. Hashes address every file
//! the engine persists for a module, so the encoding below is frozen.

use std::collections::HashMap;
use std::fmt;

use sha2::{Digest, Sha256};
use substreams_core::{ModuleDef, ModuleKind};

use crate::error::{GraphError, GraphResult};
use crate::graph::ModuleGraph;

pub const HASH_LEN: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHash([u8; HASH_LEN]);

impl ModuleHash {
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ModuleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ModuleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleHash({})", self.to_hex())
    }
}

/// Hashes for every module of a graph.
#[derive(Debug, Clone, Default)]
pub struct ModuleHashes {
    hashes: HashMap<String, ModuleHash>,
}

impl ModuleHashes {
    /// Hash every module of `graph`. `binaries[i]` is the content of binary `i`.
    pub fn compute(graph: &ModuleGraph, binaries: &[&[u8]]) -> GraphResult<Self> {
        let mut hasher = Hasher {
            graph,
            binaries,
            cache: HashMap::new(),
        };
        // Topological order guarantees ancestors are cached before descendants.
        for module in graph.topological_order() {
            hasher.hash(module)?;
        }
        Ok(Self {
            hashes: hasher.cache,
        })
    }

    pub fn get(&self, name: &str) -> GraphResult<ModuleHash> {
        self.hashes
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::ModuleNotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModuleHash)> {
        self.hashes.iter().map(|(k, v)| (k.as_str(), v))
    }
}

struct Hasher<'a> {
    graph: &'a ModuleGraph,
    binaries: &'a [&'a [u8]],
    cache: HashMap<String, ModuleHash>,
}

impl<'a> Hasher<'a> {
    fn hash(&mut self, module: &ModuleDef) -> GraphResult<ModuleHash> {
        if let Some(hash) = self.cache.get(&module.name) {
            return Ok(*hash);
        }

        let mut buf = Sha256::new();

        section(&mut buf, b"start_block");
        buf.update(module.initial_block.to_le_bytes());

        section(&mut buf, b"kind");
        field(&mut buf, module.kind.name().as_bytes());
        if let ModuleKind::Store { policy, value_type } = &module.kind {
            field(&mut buf, policy.as_str().as_bytes());
            field(&mut buf, value_type.to_string().as_bytes());
        }

        section(&mut buf, b"code");
        field(&mut buf, self.binary(module)?);
        field(&mut buf, module.entrypoint.as_bytes());

        section(&mut buf, b"inputs");
        let mut identities: Vec<String> = module.inputs.iter().map(|i| i.identity()).collect();
        identities.sort();
        for identity in &identities {
            field(&mut buf, identity.as_bytes());
        }

        section(&mut buf, b"ancestors");
        let ancestors: Vec<ModuleDef> =
            self.graph.ancestors(&module.name)?.into_iter().cloned().collect();
        for ancestor in &ancestors {
            let hash = self.hash(ancestor)?;
            buf.update(hash.as_bytes());
        }

        let full = buf.finalize();
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&full[..HASH_LEN]);
        let hash = ModuleHash(out);
        self.cache.insert(module.name.clone(), hash);
        Ok(hash)
    }

    fn binary(&self, module: &ModuleDef) -> GraphResult<&'a [u8]> {
        self.binaries
            .get(module.binary_index)
            .copied()
            .ok_or_else(|| GraphError::MissingBinary {
                module: module.name.clone(),
                index: module.binary_index,
            })
    }
}

fn section(buf: &mut Sha256, label: &[u8]) {
    buf.update([0xff]);
    buf.update(label);
}

/// Length-prefixed so adjacent fields can never alias.
fn field(buf: &mut Sha256, bytes: &[u8]) {
    buf.update((bytes.len() as u64).to_le_bytes());
    buf.update(bytes);
}

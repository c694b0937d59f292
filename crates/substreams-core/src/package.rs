//! Package loading and validation.
//!
//! A package file is a single length-delimited `pb::Package` record. Loading
//! decodes it, checks the size limits, validates every module and input
//! reference, then optionally applies per-network overrides and user params.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use prost::Message;
use regex::Regex;
use tracing::{debug, info};

use crate::error::{PackageError, PackageResult};
use crate::module::{InputSpec, ModuleDef, ModuleKind};
use crate::pb;

/// The only binary type the host knows how to run.
pub const WASM_BINARY_TYPE: &str = "wasm/rust-v1";

pub const MAX_BINARY_BYTES: usize = 100 * 1024 * 1024;
pub const MAX_MODULES: usize = 100;
pub const MAX_INPUTS_PER_MODULE: usize = 30;
pub const MAX_MODULE_NAME_LEN: usize = 256;
/// Largest value a single store key may hold.
pub const MAX_VALUE_BYTES: u64 = 10 * 1024 * 1024;

const MODULE_NAME_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9_]*(:[A-Za-z][A-Za-z0-9_]*)*$";

/// Check a module name against the naming rule and length limit.
pub fn validate_module_name(name: &str) -> PackageResult<()> {
    let pattern =
        Regex::new(MODULE_NAME_PATTERN).map_err(|e| PackageError::ManifestValidation(e.to_string()))?;
    if name.len() > MAX_MODULE_NAME_LEN || !pattern.is_match(name) {
        return Err(PackageError::ModuleNameInvalid(name.to_string()));
    }
    Ok(())
}

/// A decoded package whose modules passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedPackage {
    raw: pb::Package,
    modules: Vec<ModuleDef>,
}

impl ValidatedPackage {
    /// Read and validate a package file.
    pub fn from_file(path: &Path) -> PackageResult<Self> {
        let bytes = std::fs::read(path)?;
        info!(path = %path.display(), size = bytes.len(), "loading package");
        Self::decode(&bytes)
    }

    /// Decode a length-delimited package record and validate it.
    pub fn decode(bytes: &[u8]) -> PackageResult<Self> {
        let raw = pb::Package::decode_length_delimited(bytes)
            .map_err(|e| PackageError::Decode(e.to_string()))?;
        Self::new(raw)
    }

    /// Validate an in-memory package.
    pub fn new(raw: pb::Package) -> PackageResult<Self> {
        if raw.version < 1 {
            return Err(PackageError::ManifestValidation(format!(
                "package version must be >= 1, got {}",
                raw.version
            )));
        }
        for meta in &raw.package_meta {
            if !meta.version.is_empty() {
                semver::Version::parse(meta.version.trim_start_matches('v')).map_err(|e| {
                    PackageError::ManifestValidation(format!(
                        "package {:?}: version {:?} is not semver: {e}",
                        meta.name, meta.version
                    ))
                })?;
            }
        }

        let mut total_binary_bytes = 0usize;
        for binary in &raw.binaries {
            if binary.type_id != WASM_BINARY_TYPE {
                return Err(PackageError::UnsupportedBinaryType(binary.type_id.clone()));
            }
            total_binary_bytes += binary.content.len();
        }
        if total_binary_bytes > MAX_BINARY_BYTES {
            return Err(PackageError::PackageTooLarge(format!(
                "binaries total {total_binary_bytes} bytes, limit is {MAX_BINARY_BYTES}"
            )));
        }
        if raw.modules.len() > MAX_MODULES {
            return Err(PackageError::PackageTooLarge(format!(
                "{} modules, limit is {MAX_MODULES}",
                raw.modules.len()
            )));
        }

        let mut modules = Vec::with_capacity(raw.modules.len());
        let mut seen = HashSet::new();
        for module in &raw.modules {
            validate_module_name(&module.name)?;
            if !seen.insert(module.name.as_str()) {
                return Err(PackageError::ManifestValidation(format!(
                    "duplicate module name {:?}",
                    module.name
                )));
            }
            if module.inputs.len() > MAX_INPUTS_PER_MODULE {
                return Err(PackageError::PackageTooLarge(format!(
                    "module {:?} declares {} inputs, limit is {MAX_INPUTS_PER_MODULE}",
                    module.name,
                    module.inputs.len()
                )));
            }
            let def = ModuleDef::from_pb(module)?;
            if def.entrypoint.is_empty() {
                return Err(PackageError::ManifestValidation(format!(
                    "module {:?}: missing entrypoint",
                    def.name
                )));
            }
            if def.binary_index >= raw.binaries.len() {
                return Err(PackageError::ManifestValidation(format!(
                    "module {:?}: binary index {} out of range",
                    def.name, def.binary_index
                )));
            }
            modules.push(def);
        }

        check_references(&modules)?;

        if !raw.sink_module.is_empty() && !modules.iter().any(|m| m.name == raw.sink_module) {
            return Err(PackageError::ManifestValidation(format!(
                "sink module {:?} not found",
                raw.sink_module
            )));
        }

        debug!(modules = modules.len(), binaries = raw.binaries.len(), "package validated");
        Ok(Self { raw, modules })
    }

    pub fn raw(&self) -> &pb::Package {
        &self.raw
    }

    pub fn modules(&self) -> &[ModuleDef] {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<&ModuleDef> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Raw bytes of the binary at `index`.
    pub fn binary(&self, index: usize) -> Option<&[u8]> {
        self.raw.binaries.get(index).map(|b| b.content.as_slice())
    }

    /// Network selected by default when the request names none.
    pub fn default_network(&self) -> &str {
        &self.raw.network
    }

    /// Apply `network_params` overrides for `network` (or the package default).
    ///
    /// Initial blocks and params strings are replaced in place; this must run
    /// before module hashes are computed.
    pub fn apply_network(&mut self, network: Option<&str>) -> PackageResult<()> {
        let name = network.unwrap_or(&self.raw.network).to_string();
        if self.raw.network_params.is_empty() || name.is_empty() {
            return Ok(());
        }
        let Some(params) = self.raw.network_params.get(&name).cloned() else {
            return Err(PackageError::ManifestValidation(format!(
                "network {name:?} not found in package networks"
            )));
        };
        for (module, block) in &params.initial_blocks {
            let def = self.module_mut(module)?;
            def.initial_block = *block;
        }
        self.apply_params(&params.params)?;
        info!(network = %name, "applied network overrides");
        Ok(())
    }

    /// Replace the params input value of each named module.
    pub fn apply_params(&mut self, params: &BTreeMap<String, String>) -> PackageResult<()> {
        for (module, value) in params {
            let def = self.module_mut(module)?;
            let slot = def.inputs.iter_mut().find_map(|input| match input {
                InputSpec::Params { value } => Some(value),
                _ => None,
            });
            match slot {
                Some(slot) => *slot = value.clone(),
                None => {
                    return Err(PackageError::ManifestValidation(format!(
                        "module {module:?} has no params input"
                    )));
                }
            }
        }
        Ok(())
    }

    fn module_mut(&mut self, name: &str) -> PackageResult<&mut ModuleDef> {
        self.modules
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| PackageError::ManifestValidation(format!("unknown module {name:?}")))
    }
}

/// Every dependency must exist and be of a kind the input mode can read.
fn check_references(modules: &[ModuleDef]) -> PackageResult<()> {
    let kinds: BTreeMap<&str, &ModuleKind> =
        modules.iter().map(|m| (m.name.as_str(), &m.kind)).collect();

    for module in modules {
        if let ModuleKind::Index { output_type } = &module.kind {
            if output_type != pb::KEYS_TYPE {
                return Err(PackageError::ManifestValidation(format!(
                    "index module {:?} must output {}",
                    module.name,
                    pb::KEYS_TYPE
                )));
            }
            if module.inputs.iter().any(|i| matches!(i, InputSpec::Params { .. })) {
                return Err(PackageError::ManifestValidation(format!(
                    "index module {:?} cannot take params",
                    module.name
                )));
            }
        }

        for input in &module.inputs {
            let (dep, wants_store) = match input {
                InputSpec::Map { module } => (module, false),
                InputSpec::Store { module, .. } => (module, true),
                _ => continue,
            };
            let Some(kind) = kinds.get(dep.as_str()) else {
                return Err(PackageError::ManifestValidation(format!(
                    "module {:?}: input references unknown module {dep:?}",
                    module.name
                )));
            };
            if kind.is_store() != wants_store {
                return Err(PackageError::ManifestValidation(format!(
                    "module {:?}: input {dep:?} is a {} module",
                    module.name,
                    kind.name()
                )));
            }
        }
    }
    Ok(())
}

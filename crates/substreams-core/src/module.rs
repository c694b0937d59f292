//! Typed module model.
//!
//! `pb::Module` is the wire shape; everything past package validation works
//! with [`ModuleDef`], where kinds, inputs, policies and value types are
//! proper enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PackageError, PackageResult};
use crate::pb;

/// Update policy declared by a store module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    Set,
    SetIfNotExists,
    Add,
    Min,
    Max,
    Append,
}

impl UpdatePolicy {
    /// Stable numeric tag used in snapshot files.
    pub fn tag(self) -> u32 {
        match self {
            UpdatePolicy::Set => 1,
            UpdatePolicy::SetIfNotExists => 2,
            UpdatePolicy::Add => 3,
            UpdatePolicy::Min => 4,
            UpdatePolicy::Max => 5,
            UpdatePolicy::Append => 6,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            1 => UpdatePolicy::Set,
            2 => UpdatePolicy::SetIfNotExists,
            3 => UpdatePolicy::Add,
            4 => UpdatePolicy::Min,
            5 => UpdatePolicy::Max,
            6 => UpdatePolicy::Append,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpdatePolicy::Set => "set",
            UpdatePolicy::SetIfNotExists => "set_if_not_exists",
            UpdatePolicy::Add => "add",
            UpdatePolicy::Min => "min",
            UpdatePolicy::Max => "max",
            UpdatePolicy::Append => "append",
        }
    }

    /// Whether `value_type` is a legal pairing for this policy.
    pub fn accepts(self, value_type: &ValueType) -> bool {
        match self {
            UpdatePolicy::Set | UpdatePolicy::SetIfNotExists => true,
            UpdatePolicy::Add | UpdatePolicy::Min | UpdatePolicy::Max => value_type.is_numeric(),
            UpdatePolicy::Append => matches!(value_type, ValueType::Bytes | ValueType::String),
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value type declared by a store module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bytes,
    String,
    /// Protobuf message; the fully-qualified type name is kept for display.
    Proto(String),
    BigInt,
    BigDecimal,
    Int64,
    Float64,
}

impl ValueType {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ValueType::BigInt | ValueType::BigDecimal | ValueType::Int64 | ValueType::Float64
        )
    }

    /// Stable numeric tag used in snapshot files. Proto types share one tag.
    pub fn tag(&self) -> u32 {
        match self {
            ValueType::Bytes => 1,
            ValueType::String => 2,
            ValueType::Proto(_) => 3,
            ValueType::BigInt => 4,
            ValueType::BigDecimal => 5,
            ValueType::Int64 => 6,
            ValueType::Float64 => 7,
        }
    }
}

impl FromStr for ValueType {
    type Err = PackageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bytes" => ValueType::Bytes,
            "string" => ValueType::String,
            "bigint" => ValueType::BigInt,
            "bigdecimal" | "bigfloat" => ValueType::BigDecimal,
            "int64" => ValueType::Int64,
            "float64" => ValueType::Float64,
            other => match other.strip_prefix("proto:") {
                Some(name) if !name.is_empty() => ValueType::Proto(name.to_string()),
                _ => {
                    return Err(PackageError::ManifestValidation(format!(
                        "unknown store value type {other:?}"
                    )));
                }
            },
        })
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Bytes => f.write_str("bytes"),
            ValueType::String => f.write_str("string"),
            ValueType::Proto(name) => write!(f, "proto:{name}"),
            ValueType::BigInt => f.write_str("bigint"),
            ValueType::BigDecimal => f.write_str("bigdecimal"),
            ValueType::Int64 => f.write_str("int64"),
            ValueType::Float64 => f.write_str("float64"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleKind {
    Map { output_type: String },
    Store { policy: UpdatePolicy, value_type: ValueType },
    Index { output_type: String },
}

impl ModuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModuleKind::Map { .. } => "map",
            ModuleKind::Store { .. } => "store",
            ModuleKind::Index { .. } => "index",
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, ModuleKind::Store { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    Get,
    Deltas,
}

impl StoreMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreMode::Get => "get",
            StoreMode::Deltas => "deltas",
        }
    }
}

/// A declared module input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "input", rename_all = "snake_case")]
pub enum InputSpec {
    /// Raw block payload of the given type.
    Source { r#type: String },
    Clock,
    Map { module: String },
    Store { module: String, mode: StoreMode },
    Params { value: String },
}

impl InputSpec {
    /// Name of the module this input depends on, if any.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            InputSpec::Map { module } | InputSpec::Store { module, .. } => Some(module),
            _ => None,
        }
    }

    /// Identity string fed to the module hasher.
    pub fn identity(&self) -> String {
        match self {
            InputSpec::Source { r#type } => format!("source:{type}"),
            InputSpec::Clock => format!("source:{}", pb::CLOCK_TYPE),
            InputSpec::Map { module } => format!("map:{module}"),
            InputSpec::Store { module, mode } => format!("store:{module}:{}", mode.as_str()),
            InputSpec::Params { value } => format!("params:{value}"),
        }
    }
}

/// A validated module definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDef {
    pub name: String,
    pub kind: ModuleKind,
    pub initial_block: u64,
    pub binary_index: usize,
    pub entrypoint: String,
    pub inputs: Vec<InputSpec>,
}

impl ModuleDef {
    /// Convert a wire module, checking the shape of its kind and inputs.
    pub fn from_pb(module: &pb::Module) -> PackageResult<Self> {
        let kind = match &module.kind {
            Some(pb::module::Kind::KindMap(map)) => ModuleKind::Map {
                output_type: map.output_type.clone(),
            },
            Some(pb::module::Kind::KindBlockIndex(index)) => ModuleKind::Index {
                output_type: index.output_type.clone(),
            },
            Some(pb::module::Kind::KindStore(store)) => {
                let policy = match pb::module::UpdatePolicy::try_from(store.update_policy) {
                    Ok(pb::module::UpdatePolicy::Set) => UpdatePolicy::Set,
                    Ok(pb::module::UpdatePolicy::SetIfNotExists) => UpdatePolicy::SetIfNotExists,
                    Ok(pb::module::UpdatePolicy::Add) => UpdatePolicy::Add,
                    Ok(pb::module::UpdatePolicy::Min) => UpdatePolicy::Min,
                    Ok(pb::module::UpdatePolicy::Max) => UpdatePolicy::Max,
                    Ok(pb::module::UpdatePolicy::Append) => UpdatePolicy::Append,
                    _ => {
                        return Err(PackageError::ManifestValidation(format!(
                            "module {:?}: missing or unknown update policy",
                            module.name
                        )));
                    }
                };
                let value_type: ValueType = store.value_type.parse()?;
                if !policy.accepts(&value_type) {
                    return Err(PackageError::PolicyValueTypeMismatch {
                        module: module.name.clone(),
                        policy: policy.to_string(),
                        value_type: value_type.to_string(),
                    });
                }
                ModuleKind::Store { policy, value_type }
            }
            None => {
                return Err(PackageError::ManifestValidation(format!(
                    "module {:?}: kind not specified",
                    module.name
                )));
            }
        };

        let inputs = module
            .inputs
            .iter()
            .enumerate()
            .map(|(idx, input)| input_from_pb(&module.name, idx, input))
            .collect::<PackageResult<Vec<_>>>()?;

        Ok(Self {
            name: module.name.clone(),
            kind,
            initial_block: module.initial_block,
            binary_index: module.binary_index as usize,
            entrypoint: module.binary_entrypoint.clone(),
            inputs,
        })
    }

    pub fn is_store(&self) -> bool {
        self.kind.is_store()
    }

    /// Policy and value type if this is a store module.
    pub fn store_kind(&self) -> Option<(UpdatePolicy, &ValueType)> {
        match &self.kind {
            ModuleKind::Store { policy, value_type } => Some((*policy, value_type)),
            _ => None,
        }
    }

    /// Names of the modules this one reads from, in declared order.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(InputSpec::dependency)
    }
}

fn input_from_pb(module: &str, idx: usize, input: &pb::Input) -> PackageResult<InputSpec> {
    let invalid = |why: &str| {
        PackageError::ManifestValidation(format!("module {module:?}: invalid input [{idx}]: {why}"))
    };
    Ok(match &input.kind {
        Some(pb::input::Kind::Source(source)) if source.r#type == pb::CLOCK_TYPE => InputSpec::Clock,
        Some(pb::input::Kind::Source(source)) => {
            if source.r#type.is_empty() {
                return Err(invalid("empty source type"));
            }
            InputSpec::Source {
                r#type: source.r#type.clone(),
            }
        }
        Some(pb::input::Kind::Map(map)) => InputSpec::Map {
            module: map.module_name.clone(),
        },
        Some(pb::input::Kind::Store(store)) => {
            let mode = match pb::input::StoreMode::try_from(store.mode) {
                Ok(pb::input::StoreMode::Get) => StoreMode::Get,
                Ok(pb::input::StoreMode::Deltas) => StoreMode::Deltas,
                _ => return Err(invalid("store mode must be get or deltas")),
            };
            InputSpec::Store {
                module: store.module_name.clone(),
                mode,
            }
        }
        Some(pb::input::Kind::Params(params)) => InputSpec::Params {
            value: params.value.clone(),
        },
        None => return Err(invalid("empty input")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_module(policy: pb::module::UpdatePolicy, value_type: &str) -> pb::Module {
        pb::Module {
            name: "totals".into(),
            kind: Some(pb::module::Kind::KindStore(pb::module::KindStore {
                update_policy: policy as i32,
                value_type: value_type.into(),
            })),
            binary_entrypoint: "store_totals".into(),
            ..Default::default()
        }
    }

    #[test]
    fn policy_value_type_matrix() {
        assert!(UpdatePolicy::Set.accepts(&ValueType::Proto("a.B".into())));
        assert!(UpdatePolicy::Add.accepts(&ValueType::BigDecimal));
        assert!(!UpdatePolicy::Add.accepts(&ValueType::String));
        assert!(UpdatePolicy::Append.accepts(&ValueType::Bytes));
        assert!(!UpdatePolicy::Append.accepts(&ValueType::Int64));
        assert!(!UpdatePolicy::Max.accepts(&ValueType::Bytes));
    }

    #[test]
    fn store_kind_rejects_illegal_pairing() {
        let err = ModuleDef::from_pb(&store_module(pb::module::UpdatePolicy::Append, "int64"))
            .unwrap_err();
        assert!(matches!(err, PackageError::PolicyValueTypeMismatch { .. }));
    }

    #[test]
    fn store_kind_accepts_legal_pairing() {
        let def = ModuleDef::from_pb(&store_module(pb::module::UpdatePolicy::Add, "bigint")).unwrap();
        assert_eq!(def.store_kind(), Some((UpdatePolicy::Add, &ValueType::BigInt)));
    }

    #[test]
    fn clock_source_becomes_clock_input() {
        let mut module = store_module(pb::module::UpdatePolicy::Set, "string");
        module.inputs.push(pb::Input {
            kind: Some(pb::input::Kind::Source(pb::input::Source {
                r#type: pb::CLOCK_TYPE.into(),
            })),
        });
        let def = ModuleDef::from_pb(&module).unwrap();
        assert_eq!(def.inputs, vec![InputSpec::Clock]);
    }

    #[test]
    fn value_type_parsing() {
        assert_eq!("bigfloat".parse::<ValueType>().unwrap(), ValueType::BigDecimal);
        assert_eq!(
            "proto:sf.eth.Transfer".parse::<ValueType>().unwrap(),
            ValueType::Proto("sf.eth.Transfer".into())
        );
        assert!("proto:".parse::<ValueType>().is_err());
        assert!("uint8".parse::<ValueType>().is_err());
    }

    #[test]
    fn input_identity_strings() {
        let store = InputSpec::Store {
            module: "totals".into(),
            mode: StoreMode::Deltas,
        };
        assert_eq!(store.identity(), "store:totals:deltas");
        assert_eq!(InputSpec::Clock.identity(), "source:sf.substreams.v1.Clock");
    }
}

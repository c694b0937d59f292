//! Wire messages for packages, clocks and store deltas.
//!
//! These mirror the protobuf descriptors shipped with packages. They are
//! declared by hand with `prost` derives so no build script is needed.

use std::collections::BTreeMap;

/// Fully-qualified type of the clock source input.
pub const CLOCK_TYPE: &str = "sf.substreams.v1.Clock";

/// Required output type of index modules.
pub const KEYS_TYPE: &str = "proto:sf.substreams.index.v1.Keys";

#[derive(Clone, PartialEq, prost::Message)]
pub struct Package {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(message, repeated, tag = "2")]
    pub package_meta: Vec<PackageMetadata>,
    #[prost(message, repeated, tag = "3")]
    pub modules: Vec<Module>,
    #[prost(message, repeated, tag = "4")]
    pub binaries: Vec<Binary>,
    #[prost(message, repeated, tag = "5")]
    pub module_meta: Vec<ModuleMetadata>,
    /// Serialized `FileDescriptorProto`s for every referenced message type.
    #[prost(bytes = "vec", repeated, tag = "6")]
    pub proto_files: Vec<Vec<u8>>,
    #[prost(btree_map = "string, message", tag = "7")]
    pub network_params: BTreeMap<String, NetworkParams>,
    #[prost(message, optional, tag = "8")]
    pub sink_config: Option<SinkConfig>,
    #[prost(string, tag = "9")]
    pub sink_module: String,
    /// Default network the package targets.
    #[prost(string, tag = "10")]
    pub network: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PackageMetadata {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(string, tag = "3")]
    pub url: String,
    #[prost(string, tag = "4")]
    pub doc: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ModuleMetadata {
    #[prost(uint64, tag = "1")]
    pub package_index: u64,
    #[prost(string, tag = "2")]
    pub doc: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Binary {
    #[prost(string, tag = "1")]
    pub type_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub content: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SinkConfig {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NetworkParams {
    #[prost(btree_map = "string, uint64", tag = "1")]
    pub initial_blocks: BTreeMap<String, u64>,
    #[prost(btree_map = "string, string", tag = "2")]
    pub params: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Module {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(oneof = "module::Kind", tags = "2, 3, 10")]
    pub kind: Option<module::Kind>,
    #[prost(uint32, tag = "4")]
    pub binary_index: u32,
    #[prost(string, tag = "5")]
    pub binary_entrypoint: String,
    #[prost(message, repeated, tag = "6")]
    pub inputs: Vec<Input>,
    #[prost(message, optional, tag = "7")]
    pub output: Option<Output>,
    #[prost(uint64, tag = "8")]
    pub initial_block: u64,
}

pub mod module {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "2")]
        KindMap(KindMap),
        #[prost(message, tag = "3")]
        KindStore(KindStore),
        #[prost(message, tag = "10")]
        KindBlockIndex(KindBlockIndex),
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct KindMap {
        #[prost(string, tag = "1")]
        pub output_type: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct KindStore {
        #[prost(enumeration = "UpdatePolicy", tag = "1")]
        pub update_policy: i32,
        #[prost(string, tag = "2")]
        pub value_type: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct KindBlockIndex {
        #[prost(string, tag = "1")]
        pub output_type: String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum UpdatePolicy {
        Unset = 0,
        Set = 1,
        SetIfNotExists = 2,
        Add = 3,
        Min = 4,
        Max = 5,
        Append = 6,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Input {
    #[prost(oneof = "input::Kind", tags = "1, 2, 3, 4")]
    pub kind: Option<input::Kind>,
}

pub mod input {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Source(Source),
        #[prost(message, tag = "2")]
        Map(Map),
        #[prost(message, tag = "3")]
        Store(Store),
        #[prost(message, tag = "4")]
        Params(Params),
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Source {
        #[prost(string, tag = "1")]
        pub r#type: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Map {
        #[prost(string, tag = "1")]
        pub module_name: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Store {
        #[prost(string, tag = "1")]
        pub module_name: String,
        #[prost(enumeration = "StoreMode", tag = "2")]
        pub mode: i32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Params {
        #[prost(string, tag = "1")]
        pub value: String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum StoreMode {
        Unset = 0,
        Get = 1,
        Deltas = 2,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Output {
    #[prost(string, tag = "1")]
    pub r#type: String,
}

/// Clock handed to guests for `clock` inputs.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Clock {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(uint64, tag = "2")]
    pub number: u64,
    #[prost(int64, tag = "3")]
    pub timestamp_ns: i64,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct StoreDeltas {
    #[prost(message, repeated, tag = "1")]
    pub deltas: Vec<StoreDelta>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct StoreDelta {
    #[prost(enumeration = "store_delta::Operation", tag = "1")]
    pub operation: i32,
    #[prost(uint64, tag = "2")]
    pub ordinal: u64,
    #[prost(string, tag = "3")]
    pub key: String,
    #[prost(bytes = "vec", tag = "4")]
    pub old_value: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub new_value: Vec<u8>,
}

pub mod store_delta {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Operation {
        Unset = 0,
        Create = 1,
        Update = 2,
        Delete = 3,
        DeletePrefix = 4,
    }
}

/// Output of index modules.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Keys {
    #[prost(string, repeated, tag = "1")]
    pub keys: Vec<String>,
}

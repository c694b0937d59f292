use std::path::Path;

use serde_json::json;
use substreams_core::{InputSpec, ModuleDef, ModuleKind};
use substreams_pipeline::RequestModules;

use super::run::load_package;

pub fn info(path: &Path, network: Option<&str>, format: &str) -> anyhow::Result<()> {
    let modules = load_package(path, network, &[])?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&to_json(&modules)?)?),
        _ => print!("{}", to_text(&modules)?),
    }
    Ok(())
}

fn kind(def: &ModuleDef) -> String {
    match &def.kind {
        ModuleKind::Map { output_type } => format!("map -> {output_type}"),
        ModuleKind::Index { output_type } => format!("index -> {output_type}"),
        ModuleKind::Store { policy, value_type } => format!("store {policy} {value_type}"),
    }
}

fn input(spec: &InputSpec) -> String {
    match spec {
        InputSpec::Source { r#type } => format!("source {}", r#type),
        InputSpec::Clock => "clock".to_string(),
        InputSpec::Map { module } => format!("map {module}"),
        InputSpec::Store { module, mode } => format!("store {module} ({})", mode.as_str()),
        InputSpec::Params { value } => format!("params {value:?}"),
    }
}

fn to_text(modules: &RequestModules) -> anyhow::Result<String> {
    let mut out = String::new();
    for (depth, defs) in modules.graph().stages().iter().enumerate() {
        out.push_str(&format!("depth {depth}\n"));
        for def in defs {
            out.push_str(&format!(
                "  {} [{}] initial={} hash={}\n",
                def.name,
                kind(def),
                def.initial_block,
                modules.hash_hex(&def.name)?
            ));
            for spec in &def.inputs {
                out.push_str(&format!("    <- {}\n", input(spec)));
            }
        }
    }
    Ok(out)
}

fn to_json(modules: &RequestModules) -> anyhow::Result<serde_json::Value> {
    let mut list = Vec::new();
    for def in modules.graph().topological_order() {
        list.push(json!({
            "name": def.name,
            "kind": def.kind.name(),
            "description": kind(def),
            "initial_block": def.initial_block,
            "depth": modules.graph().stage_of(&def.name)?,
            "hash": modules.hash_hex(&def.name)?,
            "inputs": def.inputs.iter().map(input).collect::<Vec<_>>(),
        }));
    }
    Ok(json!({ "modules": list }))
}

#[cfg(test)]
mod tests {
    use substreams_core::{StoreMode, UpdatePolicy, ValueType};

    use super::*;

    fn modules() -> RequestModules {
        let defs = vec![
            ModuleDef {
                name: "map_a".into(),
                kind: ModuleKind::Map {
                    output_type: "proto:test.A".into(),
                },
                initial_block: 5,
                binary_index: 0,
                entrypoint: "map_a".into(),
                inputs: vec![InputSpec::Clock],
            },
            ModuleDef {
                name: "store_b".into(),
                kind: ModuleKind::Store {
                    policy: UpdatePolicy::Add,
                    value_type: ValueType::Int64,
                },
                initial_block: 5,
                binary_index: 0,
                entrypoint: "store_b".into(),
                inputs: vec![InputSpec::Map {
                    module: "map_a".into(),
                }],
            },
            ModuleDef {
                name: "map_c".into(),
                kind: ModuleKind::Map {
                    output_type: "proto:test.C".into(),
                },
                initial_block: 5,
                binary_index: 0,
                entrypoint: "map_c".into(),
                inputs: vec![InputSpec::Store {
                    module: "store_b".into(),
                    mode: StoreMode::Deltas,
                }],
            },
        ];
        RequestModules::new(defs, vec![Vec::new()]).unwrap()
    }

    #[test]
    fn text_lists_modules_by_depth() {
        let text = to_text(&modules()).unwrap();
        let depth1 = text.find("depth 1").unwrap();
        let depth2 = text.find("depth 2").unwrap();
        assert!(text.find("map_a [map").unwrap() < depth1);
        assert!(text.find("store_b [store").unwrap() < depth2);
        assert!(text.find("map_c [map").unwrap() > depth2);
        assert!(text.contains("<- store store_b (deltas)"));
    }

    #[test]
    fn json_carries_hashes() {
        let modules = modules();
        let value = to_json(&modules).unwrap();
        let list = value["modules"].as_array().unwrap();
        assert_eq!(list.len(), 3);
        let c = list.iter().find(|m| m["name"] == "map_c").unwrap();
        assert_eq!(c["hash"], modules.hash_hex("map_c").unwrap());
        assert_eq!(c["depth"], 2);
    }
}

//! JSON-lines rendering of responses. Payloads are hex-encoded.

use serde_json::{Value, json};
use substreams_core::BlockRange;
use substreams_pipeline::{MapOutput, PipelineError, Response, StoreDeltasOutput};
use substreams_store::{Delta, DeltaOp};

pub fn response_line(response: &Response) -> String {
    to_json(response).to_string()
}

/// Final record of a request that did not end gracefully.
pub fn error_line(err: &PipelineError) -> String {
    json!({
        "error": {
            "message": err.to_string(),
            "module": err.module(),
            "exit_code": err.exit_code(),
        }
    })
    .to_string()
}

fn ranges(ranges: &[BlockRange]) -> Vec<[u64; 2]> {
    ranges.iter().map(|r| [r.start, r.end]).collect()
}

fn output(o: &MapOutput) -> Value {
    json!({
        "name": o.name,
        "payload_hex": hex::encode(&o.payload),
        "logs": o.logs,
        "logs_truncated": o.logs_truncated,
    })
}

fn op(op: DeltaOp) -> &'static str {
    match op {
        DeltaOp::Create => "create",
        DeltaOp::Update => "update",
        DeltaOp::Delete => "delete",
        DeltaOp::DeletePrefix => "delete_prefix",
    }
}

fn delta(d: &Delta) -> Value {
    json!({
        "op": op(d.op),
        "ordinal": d.ordinal,
        "key": d.key,
        "old_value_hex": hex::encode(&d.old_value),
        "new_value_hex": hex::encode(&d.new_value),
    })
}

fn store_deltas(s: &StoreDeltasOutput) -> Value {
    json!({
        "name": s.name,
        "deltas": s.deltas.iter().map(delta).collect::<Vec<_>>(),
    })
}

pub fn to_json(response: &Response) -> Value {
    match response {
        Response::Session {
            trace_id,
            resolved_start_block,
            linear_handoff_block,
            max_parallel_workers,
        } => json!({
            "session": {
                "trace_id": trace_id,
                "resolved_start_block": resolved_start_block,
                "linear_handoff_block": linear_handoff_block,
                "max_parallel_workers": max_parallel_workers,
            }
        }),
        Response::Progress { modules, stages } => json!({
            "progress": {
                "modules": modules.iter().map(|m| json!({
                    "name": m.name,
                    "processed_ranges": ranges(&m.processed_ranges),
                    "bytes_read": m.bytes_read,
                    "bytes_written": m.bytes_written,
                    "execution_ms": m.execution_time.as_millis() as u64,
                })).collect::<Vec<_>>(),
                "stages": stages.iter().map(|s| json!({
                    "modules": s.modules,
                    "completed_ranges": ranges(&s.completed_ranges),
                })).collect::<Vec<_>>(),
            }
        }),
        Response::BlockScopedData(data) => json!({
            "data": {
                "block": data.clock.number,
                "id": data.clock.id,
                "timestamp_ns": data.clock.timestamp_ns,
                "cursor": data.cursor,
                "final_block_height": data.final_block_height,
                "outputs": data.outputs.iter().map(output).collect::<Vec<_>>(),
                "debug_store_deltas": data.debug_store_deltas.iter().map(store_deltas).collect::<Vec<_>>(),
            }
        }),
        Response::Undo(undo) => json!({
            "undo": {
                "block": undo.block.number,
                "id": undo.block.id,
                "last_valid_block": undo.last_valid_block.number,
                "last_valid_id": undo.last_valid_block.id,
                "cursor": undo.cursor,
                "outputs": undo.outputs.iter().map(output).collect::<Vec<_>>(),
            }
        }),
        Response::ModuleFailed(failure) => json!({
            "module_failed": {
                "module": failure.module,
                "reason": failure.reason,
                "logs": failure.logs,
                "logs_truncated": failure.logs_truncated,
            }
        }),
        Response::Completed { all_processed_ranges } => json!({
            "completed": { "processed_ranges": ranges(all_processed_ranges) }
        }),
    }
}

#[cfg(test)]
mod tests {
    use substreams_core::{BlockRef, Clock};
    use substreams_pipeline::{BlockScopedData, UndoSignal};

    use super::*;

    #[test]
    fn data_payloads_are_hex() {
        let response = Response::BlockScopedData(BlockScopedData {
            clock: Clock {
                id: "b7".into(),
                number: 7,
                timestamp_ns: 70,
            },
            cursor: "c1:00".into(),
            final_block_height: 5,
            outputs: vec![MapOutput {
                name: "map_a".into(),
                payload: vec![0xde, 0xad],
                logs: vec!["hi".into()],
                logs_truncated: false,
            }],
            debug_store_deltas: vec![StoreDeltasOutput {
                name: "store_b".into(),
                deltas: vec![Delta {
                    op: DeltaOp::Create,
                    ordinal: 1,
                    key: "k".into(),
                    old_value: Vec::new(),
                    new_value: b"1".to_vec(),
                }],
            }],
        });
        let value = to_json(&response);
        assert_eq!(value["data"]["block"], 7);
        assert_eq!(value["data"]["outputs"][0]["payload_hex"], "dead");
        assert_eq!(value["data"]["debug_store_deltas"][0]["deltas"][0]["op"], "create");
        assert_eq!(value["data"]["debug_store_deltas"][0]["deltas"][0]["new_value_hex"], "31");
    }

    #[test]
    fn undo_and_errors_render() {
        let undo = Response::Undo(UndoSignal {
            block: BlockRef::new(9, "b9"),
            last_valid_block: BlockRef::new(8, "b8"),
            cursor: "c1:01".into(),
            outputs: Vec::new(),
        });
        let value = to_json(&undo);
        assert_eq!(value["undo"]["last_valid_block"], 8);
        assert_eq!(value["undo"]["id"], "b9");

        let line = error_line(&PipelineError::NoRecentFinal);
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["error"]["exit_code"], 4);
        assert!(value["error"]["module"].is_null());
    }
}

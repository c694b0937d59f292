//! Store deltas: the ordered mutation log of one block.

use prost::Message;
use substreams_core::pb;
use substreams_core::pb::store_delta::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaOp {
    Create,
    Update,
    Delete,
    /// Marker for a `delete_prefix` call; the removed keys follow as `Delete`s.
    DeletePrefix,
}

impl DeltaOp {
    fn to_pb(self) -> Operation {
        match self {
            DeltaOp::Create => Operation::Create,
            DeltaOp::Update => Operation::Update,
            DeltaOp::Delete => Operation::Delete,
            DeltaOp::DeletePrefix => Operation::DeletePrefix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub op: DeltaOp,
    pub ordinal: u64,
    pub key: String,
    pub old_value: Vec<u8>,
    pub new_value: Vec<u8>,
}

impl Delta {
    /// Value of `key` before this mutation.
    pub fn before(&self) -> Option<&[u8]> {
        match self.op {
            DeltaOp::Create | DeltaOp::DeletePrefix => None,
            DeltaOp::Update | DeltaOp::Delete => Some(&self.old_value),
        }
    }

    /// Value of `key` after this mutation.
    pub fn after(&self) -> Option<&[u8]> {
        match self.op {
            DeltaOp::Delete | DeltaOp::DeletePrefix => None,
            DeltaOp::Create | DeltaOp::Update => Some(&self.new_value),
        }
    }

    pub fn is_marker(&self) -> bool {
        self.op == DeltaOp::DeletePrefix
    }

    pub fn to_pb(&self) -> pb::StoreDelta {
        pb::StoreDelta {
            operation: self.op.to_pb() as i32,
            ordinal: self.ordinal,
            key: self.key.clone(),
            old_value: self.old_value.clone(),
            new_value: self.new_value.clone(),
        }
    }
}

pub fn to_pb(deltas: &[Delta]) -> pb::StoreDeltas {
    pb::StoreDeltas {
        deltas: deltas.iter().map(Delta::to_pb).collect(),
    }
}

/// Serialized `StoreDeltas`, as handed to `store(deltas)` inputs.
pub fn encode(deltas: &[Delta]) -> Vec<u8> {
    to_pb(deltas).encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_operations_in_order() {
        let deltas = vec![
            Delta {
                op: DeltaOp::Create,
                ordinal: 1,
                key: "a".into(),
                old_value: vec![],
                new_value: b"1".to_vec(),
            },
            Delta {
                op: DeltaOp::Delete,
                ordinal: 2,
                key: "a".into(),
                old_value: b"1".to_vec(),
                new_value: vec![],
            },
        ];
        let decoded = pb::StoreDeltas::decode(encode(&deltas).as_slice()).unwrap();
        assert_eq!(decoded.deltas.len(), 2);
        assert_eq!(decoded.deltas[0].operation, Operation::Create as i32);
        assert_eq!(decoded.deltas[1].old_value, b"1");
        assert_eq!(deltas[1].before(), Some(&b"1"[..]));
        assert_eq!(deltas[1].after(), None);
    }
}

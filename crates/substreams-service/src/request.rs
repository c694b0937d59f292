//! A streaming request and what serving it did.

use sha2::{Digest, Sha256};
use substreams_orchestrator::BackfillReport;
use substreams_pipeline::{Mode, Termination};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    pub outputs: Vec<String>,
    pub start_block: i64,
    /// Exclusive; `0` streams without end.
    pub stop_block: u64,
    pub cursor: Option<String>,
    pub production: bool,
}

impl Request {
    pub fn mode(&self) -> Mode {
        Mode::from_production(self.production)
    }

    /// Short identifier for logs and the session message.
    pub fn trace_id(&self, nonce: u128) -> String {
        let mut hasher = Sha256::new();
        for output in &self.outputs {
            hasher.update(output.as_bytes());
            hasher.update([0]);
        }
        hasher.update(self.start_block.to_le_bytes());
        hasher.update(self.stop_block.to_le_bytes());
        hasher.update(self.cursor.as_deref().unwrap_or("").as_bytes());
        hasher.update(nonce.to_le_bytes());
        hex::encode(&hasher.finalize()[..8])
    }
}

#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub trace_id: String,
    pub resolved_start: u64,
    pub handoff: u64,
    pub backfill: BackfillReport,
    /// Blocks served from the exec-output cache before going live.
    pub replayed: u64,
    /// `None` when the stop block was reached during backfill.
    pub live: Option<Termination>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_differ_per_nonce() {
        let request = Request {
            outputs: vec!["a".into()],
            ..Request::default()
        };
        let first = request.trace_id(1);
        assert_eq!(first.len(), 16);
        assert_eq!(first, request.trace_id(1));
        assert_ne!(first, request.trace_id(2));
        assert_eq!(request.mode(), Mode::Development);
    }
}

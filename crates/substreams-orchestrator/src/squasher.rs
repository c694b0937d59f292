//! The squasher task: one blocking consumer that grows every store's full
//! snapshot as workers report their snapshots.

use std::collections::BTreeMap;

use substreams_core::BlockRange;
use substreams_storage::SnapshotKind;
use substreams_store::StoreSquasher;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::OrchestratorError;
use crate::scheduler::Event;

/// A snapshot a worker wrote, or one found on storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashInput {
    pub store: String,
    pub kind: SnapshotKind,
    pub range: BlockRange,
}

/// Start the task. Each input answers with `Event::Squashed` or, once,
/// `Event::SquashFailed`; the task ends when the sender is dropped.
pub(crate) fn spawn(
    squashers: BTreeMap<String, StoreSquasher>,
    events: mpsc::UnboundedSender<Event>,
) -> mpsc::UnboundedSender<SquashInput> {
    let (tx, rx) = mpsc::unbounded_channel();
    let task_events = events.clone();
    let task = tokio::task::spawn_blocking(move || run(squashers, rx, task_events));
    tokio::spawn(async move {
        if let Err(err) = task.await {
            error!(error = %err, "squasher task died");
            let _ = events.send(Event::SquashFailed(OrchestratorError::Worker(err.to_string())));
        }
    });
    tx
}

fn run(
    mut squashers: BTreeMap<String, StoreSquasher>,
    mut inputs: mpsc::UnboundedReceiver<SquashInput>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(input) = inputs.blocking_recv() {
        let Some(squasher) = squashers.get_mut(&input.store) else {
            let _ = events.send(Event::SquashFailed(OrchestratorError::UnknownStore(input.store)));
            return;
        };
        let result = match input.kind {
            SnapshotKind::Full => squasher.add_full(input.range.end),
            SnapshotKind::Partial => squasher.add_partial(input.range),
        };
        match result {
            Ok(full_until) => {
                debug!(store = %input.store, range = %input.range, full_until, "snapshot squashed");
                let _ = events.send(Event::Squashed {
                    store: input.store,
                    full_until,
                });
            }
            Err(source) => {
                let _ = events.send(Event::SquashFailed(OrchestratorError::Squash {
                    store: input.store,
                    source,
                }));
                return;
            }
        }
    }
}

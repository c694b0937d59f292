//! Request resolution: effective start block and linear handoff.

use substreams_core::Cursor;
use substreams_core::block::boundary_at_or_below;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Backfill everything up to the stop block (or the final head), then
    /// serve the requested range from cached outputs.
    Production,
    /// Start live processing at or before the requested start.
    #[default]
    Development,
}

impl Mode {
    pub fn from_production(production: bool) -> Self {
        if production {
            Mode::Production
        } else {
            Mode::Development
        }
    }
}

/// Block the request effectively starts at.
///
/// A cursor wins over `start_block`: `new` and `irreversible` cursors
/// resume after their block, `undo` cursors at it.
pub fn resolve_start_block(start_block: i64, cursor: Option<&str>) -> PipelineResult<u64> {
    if let Some(opaque) = cursor.filter(|c| !c.is_empty()) {
        let cursor = Cursor::parse(opaque)?;
        let start = cursor.next_block()?;
        debug!(step = %cursor.step, block = cursor.block.number, start, "start resolved from cursor");
        return Ok(start);
    }
    u64::try_from(start_block)
        .map_err(|_| PipelineError::InvalidRequest(format!("negative start block {start_block}")))
}

/// Check the stop block against the effective start. `0` means unbounded.
pub fn validate_range(start: u64, stop: u64) -> PipelineResult<()> {
    if stop != 0 && stop < start {
        return Err(PipelineError::InvalidRequest(format!(
            "stop block {stop} is before start block {start}"
        )));
    }
    Ok(())
}

/// Block where backfill hands over to live processing.
pub fn linear_handoff(mode: Mode, start: u64, stop: u64, recent_final: Option<u64>) -> PipelineResult<u64> {
    let handoff = match (mode, recent_final) {
        (Mode::Production, Some(fin)) if stop == 0 => fin,
        (Mode::Production, Some(fin)) => stop.min(fin),
        (Mode::Production, None) if stop == 0 => return Err(PipelineError::NoRecentFinal),
        // Nothing is known to be final: there is nothing to backfill.
        (Mode::Production, None) => start.min(stop),
        (Mode::Development, Some(fin)) => start.min(fin),
        (Mode::Development, None) => start,
    };
    Ok(handoff)
}

/// First block the live pipeline processes: the last snapshot boundary at
/// or below the handoff when stores are involved, the handoff otherwise.
pub fn live_start(handoff: u64, save_interval: u64, has_stores: bool) -> u64 {
    if has_stores {
        boundary_at_or_below(handoff, save_interval)
    } else {
        handoff
    }
}

#[cfg(test)]
mod tests {
    use substreams_core::{BlockRef, Step};

    use super::*;

    fn cursor(step: Step, number: u64) -> String {
        let block = BlockRef::new(number, format!("b{number}"));
        Cursor::new(step, block.clone(), BlockRef::new(number - 1, "lib"), block).encode()
    }

    #[test]
    fn start_from_cursor() {
        assert_eq!(resolve_start_block(100, Some(&cursor(Step::New, 99))).unwrap(), 100);
        assert_eq!(resolve_start_block(100, Some(&cursor(Step::Undo, 101))).unwrap(), 101);
        assert_eq!(
            resolve_start_block(0, Some(&cursor(Step::Irreversible, 41))).unwrap(),
            42
        );
    }

    #[test]
    fn cursor_at_the_last_block_is_rejected() {
        let err = resolve_start_block(0, Some(&cursor(Step::New, u64::MAX))).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidCursor(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn start_without_cursor() {
        assert_eq!(resolve_start_block(7, None).unwrap(), 7);
        assert_eq!(resolve_start_block(7, Some("")).unwrap(), 7);
        assert!(matches!(
            resolve_start_block(-1, None),
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(matches!(
            resolve_start_block(0, Some("garbage")),
            Err(PipelineError::InvalidCursor(_))
        ));
    }

    #[test]
    fn range_validation() {
        assert!(validate_range(10, 0).is_ok());
        assert!(validate_range(10, 10).is_ok());
        assert!(validate_range(10, 9).is_err());
    }

    #[test]
    fn handoff_by_mode() {
        assert_eq!(linear_handoff(Mode::Production, 0, 0, Some(10_000)).unwrap(), 10_000);
        assert_eq!(linear_handoff(Mode::Production, 0, 500, Some(10_000)).unwrap(), 500);
        assert!(matches!(
            linear_handoff(Mode::Production, 0, 0, None),
            Err(PipelineError::NoRecentFinal)
        ));
        assert_eq!(linear_handoff(Mode::Production, 20, 500, None).unwrap(), 20);
        assert_eq!(linear_handoff(Mode::Development, 5_000, 0, Some(1_000)).unwrap(), 1_000);
        assert_eq!(linear_handoff(Mode::Development, 5_000, 0, Some(9_000)).unwrap(), 5_000);
        assert_eq!(linear_handoff(Mode::Development, 5_000, 0, None).unwrap(), 5_000);
    }

    #[test]
    fn live_start_aligns_down_for_stores() {
        assert_eq!(live_start(1_234, 1_000, true), 1_000);
        assert_eq!(live_start(1_234, 1_000, false), 1_234);
        assert_eq!(live_start(2_000, 1_000, true), 2_000);
    }
}

//! Opaque stream cursors.
//!
//! The textual form is `c1:<step>:<block_num>:<block_id>:<lib_num>:<lib_id>:<head_num>:<head_id>`;
//! the opaque form handed to clients is `c1:` followed by the hex of that text.

use std::fmt;

use crate::block::{BlockRef, Step};
use crate::error::CursorError;

const PREFIX: &str = "c1:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub step: Step,
    pub block: BlockRef,
    pub lib: BlockRef,
    pub head: BlockRef,
}

impl Cursor {
    pub fn new(step: Step, block: BlockRef, lib: BlockRef, head: BlockRef) -> Self {
        Self {
            step,
            block,
            lib,
            head,
        }
    }

    /// Opaque string form.
    pub fn encode(&self) -> String {
        let text = format!(
            "{PREFIX}{}:{}:{}:{}:{}:{}:{}",
            self.step.as_str(),
            self.block.number,
            self.block.id,
            self.lib.number,
            self.lib.id,
            self.head.number,
            self.head.id,
        );
        format!("{PREFIX}{}", hex::encode(text))
    }

    /// Parse an opaque cursor. Anything not produced by [`Cursor::encode`] is rejected.
    pub fn parse(opaque: &str) -> Result<Self, CursorError> {
        let invalid = |why: &str| CursorError(format!("{why}: {opaque:?}"));

        let hex_part = opaque
            .strip_prefix(PREFIX)
            .ok_or_else(|| invalid("missing version prefix"))?;
        let bytes = hex::decode(hex_part).map_err(|_| invalid("not hex encoded"))?;
        let text = String::from_utf8(bytes).map_err(|_| invalid("not utf-8"))?;
        let body = text
            .strip_prefix(PREFIX)
            .ok_or_else(|| invalid("missing inner version prefix"))?;

        let parts: Vec<&str> = body.split(':').collect();
        if parts.len() != 7 {
            return Err(invalid("wrong number of fields"));
        }
        let step = parts[0].parse::<Step>().map_err(|_| invalid("invalid step"))?;
        let number = |s: &str| s.parse::<u64>().map_err(|_| invalid("invalid block number"));

        Ok(Self {
            step,
            block: BlockRef::new(number(parts[1])?, parts[2]),
            lib: BlockRef::new(number(parts[3])?, parts[4]),
            head: BlockRef::new(number(parts[5])?, parts[6]),
        })
    }

    /// First block a stream resumed from this cursor must deliver.
    ///
    /// After `new`/`irreversible` the block was fully delivered, so streaming
    /// resumes after it; after `undo` the block must be emitted again.
    pub fn next_block(&self) -> Result<u64, CursorError> {
        match self.step {
            Step::New | Step::Irreversible | Step::NewIrreversible => self
                .block
                .number
                .checked_add(1)
                .ok_or_else(|| CursorError(format!("no block follows {}", self.block.number))),
            Step::Undo => Ok(self.block.number),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(step: Step, num: u64) -> Cursor {
        Cursor::new(
            step,
            BlockRef::new(num, format!("{num:x}")),
            BlockRef::new(num.saturating_sub(10), "lib"),
            BlockRef::new(num + 2, "head"),
        )
    }

    #[test]
    fn encode_then_parse() {
        let c = cursor(Step::New, 99);
        assert_eq!(Cursor::parse(&c.encode()).unwrap(), c);
    }

    #[test]
    fn next_block_follows_step() {
        assert_eq!(cursor(Step::New, 99).next_block().unwrap(), 100);
        assert_eq!(cursor(Step::Irreversible, 99).next_block().unwrap(), 100);
        assert_eq!(cursor(Step::Undo, 101).next_block().unwrap(), 101);
    }

    #[test]
    fn last_possible_block_has_no_successor() {
        let top = BlockRef::new(u64::MAX, "top");
        let c = Cursor::new(Step::New, top.clone(), top.clone(), top);
        let parsed = Cursor::parse(&c.encode()).unwrap();
        assert!(parsed.next_block().is_err());
        let undo = Cursor::new(Step::Undo, parsed.block.clone(), parsed.lib.clone(), parsed.head.clone());
        assert_eq!(undo.next_block().unwrap(), u64::MAX);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Cursor::parse("").is_err());
        assert!(Cursor::parse("c1:zz").is_err());
        assert!(Cursor::parse(&format!("c1:{}", hex::encode("c1:new:1:a"))).is_err());
        assert!(Cursor::parse(&format!("c1:{}", hex::encode("c1:stalled:1:a:0:b:2:c"))).is_err());
    }
}

//! GuestLimiter — memory and table caps for wasm guests.
//!
//! Implements `wasmtime::ResourceLimiter`. Growth past a cap is denied, which
//! the guest observes as a failed `memory.grow` and usually turns into a trap.

use wasmtime::ResourceLimiter;

pub struct GuestLimiter {
    memory_limit: usize,
    table_limit: u32,
    memory_used: usize,
}

impl GuestLimiter {
    pub fn new(memory_limit: usize, table_limit: u32) -> Self {
        Self {
            memory_limit,
            table_limit,
            memory_used: 0,
        }
    }

    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }
}

impl ResourceLimiter for GuestLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.memory_limit {
            tracing::warn!(
                current,
                desired,
                limit = self.memory_limit,
                "guest memory growth denied"
            );
            return Ok(false);
        }
        self.memory_used = desired;
        Ok(true)
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.table_limit as usize {
            tracing::warn!(
                current,
                desired,
                limit = self.table_limit,
                "guest table growth denied"
            );
            Ok(false)
        } else {
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_growth_within_limit() {
        let mut limiter = GuestLimiter::new(1024, 100);
        assert!(limiter.memory_growing(0, 512, None).unwrap());
        assert_eq!(limiter.memory_used(), 512);
    }

    #[test]
    fn denied_growth_keeps_previous_usage() {
        let mut limiter = GuestLimiter::new(1024, 100);
        limiter.memory_growing(0, 256, None).unwrap();
        assert!(!limiter.memory_growing(256, 2048, None).unwrap());
        assert_eq!(limiter.memory_used(), 256);
    }

    #[test]
    fn table_limit() {
        let mut limiter = GuestLimiter::new(1024, 100);
        assert!(limiter.table_growing(0, 50, None).unwrap());
        assert!(!limiter.table_growing(0, 200, None).unwrap());
    }
}

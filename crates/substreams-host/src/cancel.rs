//! Cooperative cancellation shared by every call of a request.

use tokio::sync::watch;

/// Owner side: flips the request to canceled.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken(self.0.subscribe())
    }
}

/// Observer side, checked at every host call.
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), CancelToken(rx))
    }

    /// A token that is never canceled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        CancelToken(rx)
    }

    pub fn is_canceled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once canceled. Never resolves when the handle was dropped
    /// without canceling.
    pub async fn canceled(&mut self) {
        if self.0.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_seen_by_every_token() {
        let (handle, token) = CancelToken::new();
        let other = handle.token();
        assert!(!token.is_canceled());
        handle.cancel();
        assert!(token.is_canceled());
        assert!(other.is_canceled());
        assert!(!CancelToken::never().is_canceled());
    }

    #[tokio::test]
    async fn canceled_resolves() {
        let (handle, mut token) = CancelToken::new();
        let waiter = tokio::spawn(async move { token.canceled().await });
        handle.cancel();
        waiter.await.unwrap();
    }
}

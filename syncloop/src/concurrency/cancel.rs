use crate::concurrency::signal::{SignalRx, SignalTx, create_signal, raise, wait_raised};

/// Delivers a cancellation request to a single run worker.
#[derive(Debug, Clone)]
pub struct CancelTx(SignalTx);

impl CancelTx {
    /// Requests cancellation, returning `true` the first time.
    pub fn cancel(&self) -> bool {
        raise(&self.0)
    }

    pub fn subscribe(&self) -> CancelRx {
        CancelRx(self.0.subscribe())
    }
}

/// Observed by a run worker at every step boundary and during retry backoff.
#[derive(Debug, Clone)]
pub struct CancelRx(SignalRx);

impl CancelRx {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn wait_for_cancel(&mut self) {
        wait_raised(&mut self.0).await
    }
}

pub fn create_cancel_channel() -> (CancelTx, CancelRx) {
    let (tx, rx) = create_signal();
    (CancelTx(tx), CancelRx(rx))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn waiting_receiver_wakes_on_cancel() {
        let (tx, mut rx) = create_cancel_channel();
        assert!(!rx.is_cancelled());

        let waiter = tokio::spawn(async move {
            rx.wait_for_cancel().await;
            rx.is_cancelled()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tx.cancel());

        assert!(waiter.await.unwrap());
    }
}

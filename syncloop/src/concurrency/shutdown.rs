use crate::concurrency::signal::{SignalRx, SignalTx, create_signal, raise, wait_raised};

/// Sends the process wide shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(SignalTx);

impl ShutdownTx {
    pub fn wrap(tx: SignalTx) -> Self {
        Self(tx)
    }

    /// Raises the shutdown signal, returning `true` the first time.
    pub fn shutdown(&self) -> bool {
        raise(&self.0)
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Observes the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(SignalRx);

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until shutdown is requested.
    pub async fn wait_for_shutdown(&mut self) {
        wait_raised(&mut self.0).await
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = create_signal();
    (ShutdownTx::wrap(tx), ShutdownRx(rx))
}

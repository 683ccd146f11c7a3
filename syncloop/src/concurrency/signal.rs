//! Latching signal channel built on [`tokio::sync::watch`].

use tokio::sync::watch;

/// Transmitter side of a latching signal.
pub type SignalTx = watch::Sender<bool>;

/// Receiver side of a latching signal.
pub type SignalRx = watch::Receiver<bool>;

/// Creates a new signal channel in the lowered state.
pub fn create_signal() -> (SignalTx, SignalRx) {
    watch::channel(false)
}

/// Raises the signal. Returns `true` if it was not raised before.
pub fn raise(tx: &SignalTx) -> bool {
    tx.send_if_modified(|raised| {
        let was_raised = *raised;
        *raised = true;
        !was_raised
    })
}

/// Waits until the signal is raised.
///
/// Resolves immediately if it already is. If every transmitter is dropped without raising the
/// signal, this never resolves.
pub async fn wait_raised(rx: &mut SignalRx) {
    let raised = rx.wait_for(|raised| *raised).await.is_ok();
    if !raised {
        std::future::pending::<()>().await;
    }
}

//! Interrupt handling for benchmark runs
//!
//! # Design Principles (KISS)
//! - One broadcast channel per run; Ctrl+C sends on it
//! - The trial races its stages against the receiver and then runs cleanup
//! - Auxiliary tasks (telemetry sampler) get their own channel from
//!   `shutdown_channel` so they can be stopped independently

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shutdown signal type (unit type, just signals "shutdown now")
pub type ShutdownSignal = ();

/// Shutdown channel sender
pub type ShutdownSender = broadcast::Sender<ShutdownSignal>;

/// Shutdown channel receiver
pub type ShutdownReceiver = broadcast::Receiver<ShutdownSignal>;

/// Create a bare shutdown channel without any signal handler attached
pub fn shutdown_channel() -> (ShutdownSender, ShutdownReceiver) {
    broadcast::channel::<ShutdownSignal>(1)
}

/// True if a shutdown was signalled on `rx` and not yet observed
///
/// A lagged receiver counts as signalled: something was sent.
pub fn shutdown_requested(rx: &mut ShutdownReceiver) -> bool {
    match rx.try_recv() {
        Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => true,
        Err(broadcast::error::TryRecvError::Empty)
        | Err(broadcast::error::TryRecvError::Closed) => false,
    }
}

/// Setup shutdown handling with Ctrl+C signal
///
/// Creates a broadcast channel and spawns a task that sends on every Ctrl+C.
/// The sender is returned so callers can keep the channel open and
/// resubscribe for every trial.
///
/// # Example
/// ```ignore
/// let (shutdown_tx, _rx) = setup_shutdown();
/// run_trial(&host, &config, TrialKind::Baseline, shutdown_tx.subscribe()).await?;
/// ```
pub fn setup_shutdown() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = shutdown_channel();

    let tx_clone = tx.clone();
    tokio::spawn(async move {
        // Every press is forwarded; a later trial may be the one listening
        loop {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Ctrl+C received, aborting run and cleaning up");
                    let _ = tx_clone.send(());
                }
                Err(e) => {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                    break;
                }
            }
        }
    });

    (tx, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_channel_creation() {
        let (tx, mut rx) = shutdown_channel();

        tx.send(()).unwrap();

        let result = rx.recv().await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_shutdown_requested_latches_until_observed() {
        let (tx, mut rx) = shutdown_channel();
        assert!(!shutdown_requested(&mut rx));
        tx.send(()).unwrap();
        assert!(shutdown_requested(&mut rx));
        assert!(!shutdown_requested(&mut rx));
    }

    #[test]
    fn test_shutdown_requested_after_lag() {
        let (tx, mut rx) = shutdown_channel();
        tx.send(()).unwrap();
        tx.send(()).unwrap();
        assert!(shutdown_requested(&mut rx));
    }

    #[tokio::test]
    async fn test_resubscribe_sees_later_signal() {
        let (tx, _rx) = shutdown_channel();
        let mut late = tx.subscribe();
        tx.send(()).unwrap();
        assert!(late.recv().await.is_ok());
    }
}

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::scanner::Scanner;

/// Drive one reconciliation pass per interval until shutdown. Passes are
/// serialized; a tick that lands while one is still running is skipped with
/// a warning rather than queued.
pub async fn run_ticker(scanner: Arc<Scanner>, interval_minutes: u64) {
    let pass_gate = Arc::new(Mutex::new(()));
    let cancel = scanner.cancel_flag();
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_minutes * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        target: "sentinelle",
        event = "ticker_started",
        interval_minutes,
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(guard) = pass_gate.clone().try_lock_owned() else {
                    tracing::warn!(
                        target: "sentinelle",
                        event = "scan_pass_skipped",
                        msg = "previous pass still running",
                    );
                    continue;
                };
                let scanner = scanner.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(err) = scanner.run_pass().await {
                        tracing::error!(
                            target: "sentinelle",
                            event = "scan_pass_failed",
                            error = %err,
                        );
                    }
                });
            }
            shutdown = tokio::signal::ctrl_c() => {
                if let Err(err) = shutdown {
                    tracing::error!(
                        target: "sentinelle",
                        event = "signal_listener_failed",
                        error = %err,
                    );
                }
                break;
            }
        }
    }

    // Abort the in-flight pass at its next loop boundary, then wait for it
    // to release the gate so committed work is not cut mid-transaction.
    cancel.store(true, Ordering::SeqCst);
    let _ = pass_gate.lock().await;
    tracing::info!(target: "sentinelle", event = "ticker_stopped");
}

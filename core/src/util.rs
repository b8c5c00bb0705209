use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Next event from an optional broadcast subscription.
///
/// Pends forever while `rx` is `None`, which keeps a `select!` branch quiet
/// after the source went away. A closed channel clears `rx`.
pub(crate) async fn next_event<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> T {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(event) => return event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "collaborator events dropped; continuing with the newest");
            }
            Err(RecvError::Closed) => {
                *rx = None;
            }
        }
    }
}

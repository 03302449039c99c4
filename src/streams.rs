//! Channel and stream helpers: finite channels, draining, fan-in.

use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Turn a vector into a finite channel that closes after the last element.
///
/// The channel is pre-filled; no task is spawned and nothing blocks.
pub fn from_vec<T>(items: Vec<T>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(items.len().max(1));
    for item in items {
        // Capacity equals the item count, so try_send cannot fail.
        tx.try_send(item)
            .unwrap_or_else(|_| unreachable!("channel sized to fit all items"));
    }
    rx
}

/// Why a [`drain`] stopped before its stream ended.
#[derive(Debug, thiserror::Error)]
pub enum DrainError<E> {
    /// The cancellation token fired.
    #[error("drain cancelled")]
    Cancelled,

    /// A companion error channel yielded an error.
    #[error(transparent)]
    Stream(E),
}

/// Collect `stream` into a vector.
///
/// Aborts on the first error received from any of the companion `errors`
/// channels, or when `cancel` fires. The partial results collected so far
/// are always returned, together with the abort reason (`None` when the
/// stream ended normally).
pub async fn drain<S, E>(
    cancel: &CancellationToken,
    stream: S,
    errors: Vec<mpsc::Receiver<E>>,
) -> (Vec<S::Item>, Option<DrainError<E>>)
where
    S: Stream,
    E: Send + 'static,
{
    let (mut errors_rx, stop) = fan_in(errors);
    tokio::pin!(stream);

    let mut items = Vec::new();
    let abort = loop {
        // Biased: a pending cancellation or error always wins over more
        // data, so aborts are deterministic.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Some(DrainError::Cancelled),
            Some(err) = errors_rx.recv() => break Some(DrainError::Stream(err)),
            next = stream.next() => match next {
                Some(item) => items.push(item),
                None => break None,
            },
        }
    };

    stop.cancel();
    (items, abort)
}

/// Merge N receive-only channels into one.
///
/// The returned channel closes when every input has closed, or when the
/// returned token is cancelled (the idempotent stop). With no inputs the
/// output is closed from the start.
pub fn fan_in<T: Send + 'static>(
    inputs: Vec<mpsc::Receiver<T>>,
) -> (mpsc::Receiver<T>, CancellationToken) {
    let stop = CancellationToken::new();
    let (tx, rx) = mpsc::channel(inputs.len().max(1));

    for mut input in inputs {
        let tx = tx.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = stop.cancelled() => return,
                    item = input.recv() => match item {
                        Some(item) => item,
                        None => return,
                    },
                };
                tokio::select! {
                    _ = stop.cancelled() => return,
                    result = tx.send(item) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
            // Dropping `tx` here releases this input's handle; the output
            // closes once the last forwarder exits.
        });
    }
    drop(tx);

    (rx, stop)
}

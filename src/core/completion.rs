//! Waiting on an operation's completion.
//!
//! [`completion_pair`] returns an [`OpCallback`] to attach to an operation
//! and an [`OpWaiter`] that resolves when the callback fires. The waiter can
//! be awaited from async code or waited on from a plain thread.

use tokio::sync::oneshot;

use super::{error::Error, operation::OpCallback};

/// Receives the outcome of one operation.
#[derive(Debug)]
pub struct OpWaiter {
    rx: oneshot::Receiver<Result<(), Error>>,
}

/// Creates a completion callback and the waiter it resolves.
pub fn completion_pair() -> (OpCallback, OpWaiter) {
    let (tx, rx) = oneshot::channel();
    let callback: OpCallback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (callback, OpWaiter { rx })
}

impl OpWaiter {
    pub async fn wait(self) -> Result<(), Error> {
        self.rx.await.unwrap_or_else(|_| Err(dropped()))
    }

    /// Blocks the calling thread until the operation completes.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime.
    pub fn wait_blocking(self) -> Result<(), Error> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }

    /// Returns the outcome if the operation already completed.
    pub fn try_result(&mut self) -> Option<Result<(), Error>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped())),
        }
    }
}

fn dropped() -> Error {
    Error::pipeline("operation was dropped without being completed")
}

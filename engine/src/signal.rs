//! Cooperative cancellation.
//!
//! A `Canceller` owns the sending side; any number of `Signal`s observe it.
//! Long-running operations call `Signal::check` at their suspension points
//! and bail out with `Interrupted` once the signal is pulsed.

use tokio::sync::watch;

/// Returned by an operation that stopped because its signal was pulsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation interrupted")]
pub struct Interrupted;

/// The owning side of a cancellation signal.
#[derive(Debug)]
pub struct Canceller {
    sender: watch::Sender<bool>,
}

impl Canceller {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// A new observer of this canceller.
    #[must_use]
    pub fn signal(&self) -> Signal {
        Signal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Pulse the signal. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

/// An observer of a `Canceller`.
#[derive(Debug, Clone)]
pub struct Signal {
    receiver: watch::Receiver<bool>,
}

impl Signal {
    /// A signal that is never pulsed.
    #[must_use]
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self { receiver }
    }

    #[must_use]
    pub fn is_pulsed(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Fail with `Interrupted` if the signal has been pulsed.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_pulsed() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Resolve once the signal is pulsed. Never resolves for `Signal::never`.
    pub async fn pulsed(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|pulsed| *pulsed).await.is_err() {
            // The canceller is gone without pulsing.
            std::future::pending::<()>().await;
        }
    }
}

//! FIFO admission tickets.
//!
//! An `OrderQueue` hands out tickets in sequence. A ticket enters only after
//! every earlier ticket has entered and released its admission, or has been
//! dropped without entering. Callers hold the admission just long enough to
//! take the locks whose order matters, so operations reach those locks in
//! ticket order.

use std::collections::BTreeSet;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::signal::{Interrupted, Signal};

#[derive(Debug, Default)]
struct OrderState {
    next_ticket: u64,
    serving: u64,
    /// Tickets dropped before their turn.
    abandoned: BTreeSet<u64>,
}

impl OrderState {
    fn advance(&mut self) {
        self.serving += 1;
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
    }
}

/// A source of ordered tickets.
#[derive(Debug, Default)]
pub struct OrderQueue {
    state: Mutex<OrderState>,
    turn: Notify,
}

impl OrderQueue {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, OrderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue the next ticket.
    #[must_use]
    pub fn issue(self: &Arc<Self>) -> OrderToken {
        let mut state = self.state();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        OrderToken {
            ticket,
            queue: Arc::clone(self),
            entered: false,
        }
    }

    /// Tickets issued so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.state().next_ticket
    }
}

/// A ticket waiting for its turn.
#[derive(Debug)]
#[must_use = "an unentered token only holds up the queue until it is dropped"]
pub struct OrderToken {
    ticket: u64,
    queue: Arc<OrderQueue>,
    entered: bool,
}

impl OrderToken {
    #[must_use]
    pub const fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Wait until every earlier ticket is done.
    ///
    /// On interruption the ticket is abandoned and later tickets skip it.
    pub async fn enter(mut self, cancel: &Signal) -> Result<Admission, Interrupted> {
        loop {
            let mut notified = pin!(self.queue.turn.notified());
            notified.as_mut().enable();
            if self.queue.state().serving == self.ticket {
                self.entered = true;
                return Ok(Admission {
                    queue: Arc::clone(&self.queue),
                });
            }
            tokio::select! {
                () = notified => {}
                () = cancel.pulsed() => return Err(Interrupted),
            }
        }
    }
}

impl Drop for OrderToken {
    fn drop(&mut self) {
        if self.entered {
            return;
        }
        let mut state = self.queue.state();
        if state.serving == self.ticket {
            state.advance();
            drop(state);
            self.queue.turn.notify_waiters();
        } else {
            state.abandoned.insert(self.ticket);
        }
    }
}

/// The current turn. Dropping it lets the next ticket in.
#[derive(Debug)]
pub struct Admission {
    queue: Arc<OrderQueue>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.queue.state().advance();
        self.queue.turn.notify_waiters();
    }
}

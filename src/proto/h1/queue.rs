//! The pipelined exchange queue.

use std::collections::VecDeque;
use std::fmt;

use crate::exchange::ExchangeMachine;

/// The per-connection FIFO of pending exchanges.
///
/// The front is the responding exchange, the only one whose bytes may
/// leave the wire; the back is the requesting exchange, the one whose
/// request body is arriving. A new request always appends to the back, so
/// the requesting exchange is always at or after the responding one.
pub(crate) struct ExchangeQueue<Ctx> {
    list: VecDeque<ExchangeMachine<Ctx>>,
}

impl<Ctx> ExchangeQueue<Ctx> {
    pub(crate) fn new() -> ExchangeQueue<Ctx> {
        ExchangeQueue {
            list: VecDeque::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    /// Appends a new exchange. Returns true when it became the front, i.e.
    /// it should be started immediately.
    pub(crate) fn push(&mut self, machine: ExchangeMachine<Ctx>) -> bool {
        self.list.push_back(machine);
        self.list.len() == 1
    }

    /// The exchange currently allowed to write.
    pub(crate) fn responding_mut(&mut self) -> Option<&mut ExchangeMachine<Ctx>> {
        self.list.front_mut()
    }

    /// The exchange currently receiving its request body.
    pub(crate) fn requesting_mut(&mut self) -> Option<&mut ExchangeMachine<Ctx>> {
        self.list.back_mut()
    }

    /// Removes the responding exchange; the next one, if any, becomes the
    /// front.
    pub(crate) fn pop_responding(&mut self) -> Option<ExchangeMachine<Ctx>> {
        self.list.pop_front()
    }

    /// Disposes every queued exchange with a fresh cause each.
    pub(crate) fn dispose_all<F>(&mut self, cause: F)
    where
        F: Fn() -> crate::Error,
        Ctx: Send + Sync + 'static,
    {
        for machine in self.list.iter_mut() {
            machine.dispose(Some(cause()));
        }
        self.list.clear();
    }
}

impl<Ctx> fmt::Debug for ExchangeQueue<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeQueue")
            .field("len", &self.list.len())
            .finish()
    }
}

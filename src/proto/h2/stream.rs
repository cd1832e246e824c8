//! The per-connection stream table.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use http::HeaderMap;

use crate::exchange::ExchangeMachine;

use super::flow::FlowControl;
use super::frame::StreamId;

/// One open stream and its exchange.
pub(crate) struct StreamEntry<Ctx> {
    pub(crate) machine: ExchangeMachine<Ctx>,
    /// What we may still send to the peer.
    pub(crate) send_flow: FlowControl,
    /// What the peer may still send to us.
    pub(crate) recv_flow: FlowControl,
    /// A chunk (or part of one) waiting for send window.
    pub(crate) pending_data: Option<Bytes>,
    /// The stream end (with optional trailers) queued behind
    /// `pending_data`.
    pub(crate) pending_end: Option<Option<HeaderMap>>,
    /// We emitted the end of the stream.
    pub(crate) local_closed: bool,
    /// The peer ended its side.
    pub(crate) remote_closed: bool,
}

impl<Ctx> StreamEntry<Ctx> {
    pub(crate) fn new(
        machine: ExchangeMachine<Ctx>,
        send_window: u32,
        recv_window: u32,
    ) -> StreamEntry<Ctx> {
        StreamEntry {
            machine,
            send_flow: FlowControl::new(send_window),
            recv_flow: FlowControl::new(recv_window),
            pending_data: None,
            pending_end: None,
            local_closed: false,
            remote_closed: false,
        }
    }
}

impl<Ctx> fmt::Debug for StreamEntry<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEntry")
            .field("machine", &self.machine)
            .field("local_closed", &self.local_closed)
            .field("remote_closed", &self.remote_closed)
            .finish()
    }
}

/// All open streams, by id.
pub(crate) struct StreamTable<Ctx> {
    streams: HashMap<StreamId, StreamEntry<Ctx>>,
    /// Highest client-initiated id seen.
    pub(crate) max_client_id: StreamId,
}

impl<Ctx> StreamTable<Ctx> {
    pub(crate) fn new() -> StreamTable<Ctx> {
        StreamTable {
            streams: HashMap::new(),
            max_client_id: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn insert(&mut self, id: StreamId, entry: StreamEntry<Ctx>) {
        if id % 2 == 1 && id > self.max_client_id {
            self.max_client_id = id;
        }
        self.streams.insert(id, entry);
    }

    pub(crate) fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamEntry<Ctx>> {
        self.streams.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: StreamId) -> Option<StreamEntry<Ctx>> {
        self.streams.remove(&id)
    }

    /// Stream ids in ascending order, for a stable egress sweep.
    pub(crate) fn ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Grows or shrinks every stream's send window after the peer changed
    /// `SETTINGS_INITIAL_WINDOW_SIZE`.
    pub(crate) fn resize_send_windows(&mut self, delta: i64) {
        for entry in self.streams.values_mut() {
            entry.send_flow.resize(delta);
        }
    }

    /// Disposes every stream with a fresh cause each.
    pub(crate) fn dispose_all<F>(&mut self, cause: F)
    where
        F: Fn() -> crate::Error,
        Ctx: Send + Sync + 'static,
    {
        for entry in self.streams.values_mut() {
            entry.machine.dispose(Some(cause()));
        }
        self.streams.clear();
    }
}

impl<Ctx> fmt::Debug for StreamTable<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTable")
            .field("len", &self.streams.len())
            .field("max_client_id", &self.max_client_id)
            .finish()
    }
}

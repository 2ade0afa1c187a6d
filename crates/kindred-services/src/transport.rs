//! Transport collaborator and pending-write handles.
//!
//! The core never touches sockets. A [`Transport`] accepts framed items and
//! hands back a [`WriteHandle`] that resolves once the bytes have left (or
//! failed to leave) the process. Callers may await the handle, poll it, or
//! drop it for fire-and-forget.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use kindred_core::{PeerId, RawItem, ServiceType, WireError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("peer {0} not found")]
    PeerNotFound(PeerId),

    #[error("peer {peer} does not support service {service:#06x}")]
    ServiceNotSupported { peer: PeerId, service: ServiceType },

    #[error("connection closed")]
    Closed,

    #[error("transport: {0}")]
    Io(String),

    #[error("encode: {0}")]
    Encode(#[from] WireError),
}

/// Outcome of one write: the frame size on success.
pub type WriteResult = Result<usize, WriteError>;

/// Something that moves frames to one remote peer, in order.
pub trait Transport: Send + Sync {
    fn send(&self, item: RawItem) -> WriteHandle;

    /// Stop accepting frames. Writes already queued may still complete.
    fn close(&self) {}
}

// ── WriteHandle ──────────────────────────────────────────────────────────────

/// The pending result of a write.
#[derive(Debug)]
pub struct WriteHandle {
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Ready(Option<WriteResult>),
    Pending(oneshot::Receiver<WriteResult>),
}

/// The transport's side of a pending write.
#[derive(Debug)]
pub struct WriteCompleter(oneshot::Sender<WriteResult>);

impl WriteCompleter {
    pub fn complete(self, result: WriteResult) {
        // The caller may have dropped its handle.
        let _ = self.0.send(result);
    }
}

impl WriteHandle {
    pub fn pending() -> (WriteCompleter, WriteHandle) {
        let (tx, rx) = oneshot::channel();
        (
            WriteCompleter(tx),
            WriteHandle {
                state: HandleState::Pending(rx),
            },
        )
    }

    pub fn ready(result: WriteResult) -> Self {
        Self {
            state: HandleState::Ready(Some(result)),
        }
    }

    pub fn failed(error: WriteError) -> Self {
        Self::ready(Err(error))
    }

    /// True when the write was rejected before reaching the transport.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, HandleState::Ready(Some(Err(_))))
    }

    /// The result if it is already known. Yields it at most once.
    pub fn try_result(&mut self) -> Option<WriteResult> {
        match &mut self.state {
            HandleState::Ready(result) => result.take(),
            HandleState::Pending(rx) => match rx.try_recv() {
                Ok(result) => Some(result),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(Err(WriteError::Closed)),
            },
        }
    }

    pub async fn wait(self) -> WriteResult {
        self.await
    }
}

impl Future for WriteHandle {
    type Output = WriteResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WriteResult> {
        match &mut self.get_mut().state {
            HandleState::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(WriteError::Closed))),
            HandleState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.unwrap_or(Err(WriteError::Closed))),
        }
    }
}

// ── In-memory transport ──────────────────────────────────────────────────────

/// A transport over an unbounded channel. The write completes when the
/// receiving end takes the frame; dropping the receiver fails every
/// queued write.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<(Bytes, WriteCompleter)>,
}

/// Receiving end of a [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelReceiver {
    rx: mpsc::UnboundedReceiver<(Bytes, WriteCompleter)>,
}

impl ChannelTransport {
    pub fn new() -> (ChannelTransport, ChannelReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelTransport { tx }, ChannelReceiver { rx })
    }
}

impl Transport for ChannelTransport {
    fn send(&self, item: RawItem) -> WriteHandle {
        let (completer, handle) = WriteHandle::pending();
        if let Err(mpsc::error::SendError((_, completer))) = self.tx.send((item.into_frame(), completer)) {
            completer.complete(Err(WriteError::Closed));
        }
        handle
    }
}

impl ChannelReceiver {
    /// Next frame, in send order. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        let (frame, completer) = self.rx.recv().await?;
        completer.complete(Ok(frame.len()));
        Some(frame)
    }

    /// A frame already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        let (frame, completer) = self.rx.try_recv().ok()?;
        completer.complete(Ok(frame.len()));
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_core::codec::{Item, ItemBody, ItemWriter};
    use kindred_core::declared_fields;

    #[derive(Debug)]
    struct Hello {
        n: u32,
    }
    declared_fields!(Hello { n });

    impl Item for Hello {
        fn sub_type(&self) -> u8 {
            1
        }
        fn body(&self) -> ItemBody<'_> {
            ItemBody::Declared(self)
        }
    }

    fn raw() -> RawItem {
        ItemWriter::new().write(0x0020, &Hello { n: 1 }).unwrap()
    }

    #[tokio::test]
    async fn channel_write_completes_on_receive() {
        let (transport, mut rx) = ChannelTransport::new();
        let mut handle = transport.send(raw());
        assert!(handle.try_result().is_none());

        let frame = rx.recv().await.unwrap();
        assert_eq!(handle.await, Ok(frame.len()));
    }

    #[tokio::test]
    async fn dropped_receiver_fails_writes() {
        let (transport, rx) = ChannelTransport::new();
        let queued = transport.send(raw());
        drop(rx);
        assert_eq!(queued.await, Err(WriteError::Closed));
        assert_eq!(transport.send(raw()).await, Err(WriteError::Closed));
    }

    #[test]
    fn failed_handle_is_immediate() {
        let mut handle = WriteHandle::failed(WriteError::PeerNotFound(PeerId([1; 32])));
        assert!(handle.is_failed());
        assert!(matches!(handle.try_result(), Some(Err(WriteError::PeerNotFound(_)))));
        assert!(handle.try_result().is_none());
    }
}

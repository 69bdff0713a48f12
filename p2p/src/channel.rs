//! Router-facing channel surface: typed envelopes, peer error reports, and
//! the closable FIFO queues the router moves envelopes through.

use std::{
    any::Any,
    fmt,
    sync::Arc,
};

use prost::Message;
use tokio::sync::{mpsc, watch};

use crate::{
    error::{Error, Result},
    mconn::ChannelId,
    node::NodeId,
    shutdown::Shutdown,
};

/// A typed payload carried by an [`Envelope`].
///
/// Blanket-implemented for every prost message, so reactors hand the router
/// their protobuf types directly. The `Any` view is what lets the router
/// check an outbound message against the channel's declared type.
pub trait ChannelMessage: fmt::Debug + Send + Sync + 'static {
    fn encode_bytes(&self) -> Vec<u8>;
    fn type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

impl<M> ChannelMessage for M
where
    M: Message + Default + 'static,
{
    fn encode_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The router's uniform message container.
///
/// Outbound envelopes name either a unicast destination in `to` or set
/// `broadcast`; inbound envelopes carry the sender in `from`.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: Option<NodeId>,
    pub to: Option<NodeId>,
    pub broadcast: bool,
    pub channel_id: ChannelId,
    pub message: Arc<dyn ChannelMessage>,
}

impl Envelope {
    /// Unicast envelope addressed to one peer.
    pub fn to(peer_id: NodeId, message: impl ChannelMessage) -> Self {
        Self {
            from: None,
            to: Some(peer_id),
            broadcast: false,
            channel_id: 0,
            message: Arc::new(message),
        }
    }

    /// Envelope for every peer advertising the channel.
    pub fn broadcast(message: impl ChannelMessage) -> Self {
        Self {
            from: None,
            to: None,
            broadcast: true,
            channel_id: 0,
            message: Arc::new(message),
        }
    }

    pub(crate) fn inbound(from: NodeId, channel_id: ChannelId, message: Arc<dyn ChannelMessage>) -> Self {
        Self {
            from: Some(from),
            to: None,
            broadcast: false,
            channel_id,
            message,
        }
    }

    /// Downcast the payload to a concrete message type.
    pub fn message_as<M: ChannelMessage>(&self) -> Option<&M> {
        self.message.as_any().downcast_ref()
    }
}

/// A reactor's verdict on a peer, reported through a channel's error lane.
#[derive(Clone, Debug)]
pub struct PeerError {
    pub node_id: NodeId,
    pub err: Error,
    /// Fatal errors always disconnect; non-fatal ones only lower the
    /// peer's score while capacity allows.
    pub fatal: bool,
}

/// The handle a reactor receives from [`Router::open_channel`].
///
/// [`Router::open_channel`]: crate::router::Router::open_channel
pub struct Channel {
    pub id: ChannelId,
    /// Inbound envelopes from peers.
    pub rx: FifoQueueReceiver<Envelope>,
    /// Outbound envelopes to the router.
    pub tx: mpsc::Sender<Envelope>,
    /// Peer misbehavior reports.
    pub err_tx: mpsc::Sender<PeerError>,
    pub name: String,
}

/// Bounded FIFO hand-off with an explicit close that unblocks both ends.
pub(crate) struct FifoQueue<T> {
    tx: mpsc::Sender<T>,
    closed_tx: watch::Sender<bool>,
}

/// Consumer side of a [`FifoQueue`].
pub struct FifoQueueReceiver<T> {
    rx: mpsc::Receiver<T>,
    closed_rx: watch::Receiver<bool>,
}

pub(crate) fn fifo_queue<T>(capacity: usize) -> (Arc<FifoQueue<T>>, FifoQueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (closed_tx, closed_rx) = watch::channel(false);
    (
        Arc::new(FifoQueue { tx, closed_tx }),
        FifoQueueReceiver { rx, closed_rx },
    )
}

impl<T> FifoQueue<T> {
    /// Enqueue an item, waiting for space. `Ok(false)` means the queue was
    /// closed and the item dropped.
    pub async fn push(&self, item: T, done: &mut Shutdown) -> Result<bool> {
        let mut closed_rx = self.closed_tx.subscribe();
        tokio::select! {
            res = self.tx.send(item) => Ok(res.is_ok()),
            _ = closed_rx.wait_for(|closed| *closed) => Ok(false),
            _ = done.wait() => Err(Error::Canceled),
        }
    }

    /// Close the queue, releasing blocked producers and the consumer.
    /// Idempotent.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

impl<T> FifoQueueReceiver<T> {
    /// Dequeue the next item; `None` once the queue is closed or every
    /// producer is gone.
    pub async fn recv(&mut self) -> Option<T> {
        tokio::select! {
            maybe = self.rx.recv() => maybe,
            _ = self.closed_rx.wait_for(|closed| *closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;

    #[tokio::test]
    async fn queue_delivers_in_order() {
        let (queue, mut rx) = fifo_queue::<u32>(4);
        let (_sig, mut done) = shutdown::channel();

        for i in 0..4 {
            assert!(queue.push(i, &mut done).await.unwrap());
        }
        for i in 0..4 {
            assert_eq!(rx.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn close_unblocks_producer_and_consumer() {
        let (queue, mut rx) = fifo_queue::<u32>(1);
        let (_sig, mut done) = shutdown::channel();

        assert!(queue.push(1, &mut done).await.unwrap());

        // The queue is full; a second push blocks until close drops it.
        let producer = {
            let queue = queue.clone();
            let mut done = done.clone();
            tokio::spawn(async move { queue.push(2, &mut done).await })
        };
        tokio::task::yield_now().await;
        queue.close();

        assert_eq!(producer.await.unwrap().unwrap(), false);
        assert_eq!(rx.recv().await, None);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn done_cancels_blocked_push() {
        let (queue, _rx) = fifo_queue::<u32>(1);
        let (sig, mut done) = shutdown::channel();

        assert!(queue.push(1, &mut done).await.unwrap());
        let pending = {
            let queue = queue.clone();
            let mut done = done.clone();
            tokio::spawn(async move { queue.push(2, &mut done).await })
        };
        tokio::task::yield_now().await;
        sig.trigger();

        assert!(matches!(pending.await.unwrap(), Err(Error::Canceled)));
    }

    #[test]
    fn envelope_type_introspection() {
        use stele_proto::p2p::PacketMsg;

        let envelope = Envelope::broadcast(PacketMsg {
            channel_id: 1,
            eof: true,
            data: vec![1, 2, 3],
        });
        assert!(envelope.message_as::<PacketMsg>().is_some());
        assert!(envelope.message_as::<stele_proto::p2p::PacketPing>().is_none());
        assert!(envelope.message.type_name().contains("PacketMsg"));
    }
}

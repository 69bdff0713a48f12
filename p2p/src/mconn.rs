//! Multiplexed connection: logical channels over one encrypted stream.
//!
//! A connection runs two routines. The send routine drains per-channel
//! bounded queues with a fair scheduler (lowest `recently_sent / priority`
//! first), fragments messages into `PacketMsg`s, and owns the ping/pong and
//! flush-coalescing duties. The recv routine reads length-prefixed packets,
//! reassembles fragments per channel, and delivers complete messages
//! upstream. Either routine stops the whole connection on the first error.

use std::{
    collections::BTreeMap,
    convert::TryFrom,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::debug;

use stele_proto as proto;

use crate::{
    error::{Error, Result},
    framing,
    secret_connection::SecretConnection,
    shutdown::Shutdown,
};

/// Reactor channels are identified by one byte on the wire.
pub type ChannelId = u8;

/// Fairness batch: how many packets the scheduler emits per send signal.
pub const NUM_BATCH_PACKET_MSGS: usize = 10;

/// Proto framing margin on top of a packet's payload: length prefix, the
/// oneof tag, and the `PacketMsg` field tags and varints.
const PACKET_MSG_WIRE_OVERHEAD: usize = 24;

/// Period of the `recently_sent` decay tick.
const UPDATE_STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Static declaration of one logical channel.
#[derive(Clone, Debug)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    /// Scheduling weight; must be positive.
    pub priority: u64,
    pub send_queue_capacity: usize,
    pub recv_buffer_capacity: usize,
    /// Ceiling on one reassembled message.
    pub recv_message_capacity: usize,
    pub name: String,
}

impl ChannelDescriptor {
    pub fn new(id: ChannelId, name: impl Into<String>, priority: u64) -> Self {
        Self {
            id,
            priority,
            send_queue_capacity: 1,
            recv_buffer_capacity: 4096,
            recv_message_capacity: 8 * 1024 * 1024,
            name: name.into(),
        }
    }
}

/// Tunables of one multiplexed connection.
#[derive(Clone, Debug)]
pub struct MConnConfig {
    /// Coalescing delay between a queued packet and the flush that commits
    /// it to the socket.
    pub flush_throttle: Duration,
    pub ping_interval: Duration,
    /// The connection is dead if nothing at all is received for this long.
    pub pong_timeout: Duration,
    pub max_packet_msg_payload_size: usize,
    pub send_rate: u64,
    pub recv_rate: u64,
    /// How long `send` may wait for space in a channel queue.
    pub send_timeout: Duration,
}

impl Default for MConnConfig {
    fn default() -> Self {
        Self {
            flush_throttle: Duration::from_millis(100),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(45),
            max_packet_msg_payload_size: 1024,
            send_rate: 512_000,
            recv_rate: 512_000,
            send_timeout: Duration::from_secs(10),
        }
    }
}

impl MConnConfig {
    /// Upper bound for one serialized packet on the wire.
    fn max_packet_msg_size(&self) -> usize {
        self.max_packet_msg_payload_size + PACKET_MSG_WIRE_OVERHEAD
    }
}

/// Send-side state of one channel.
struct Channel {
    desc: ChannelDescriptor,
    queue: mpsc::Receiver<Vec<u8>>,
    sending: Option<Vec<u8>>,
    sent_pos: usize,
    recently_sent: u64,
}

impl Channel {
    /// Whether a message is mid-flight or can be dequeued now.
    fn is_send_pending(&mut self) -> bool {
        if self.sending.is_none() {
            match self.queue.try_recv() {
                Ok(bytes) => {
                    self.sending = Some(bytes);
                    self.sent_pos = 0;
                }
                Err(_) => return false,
            }
        }
        true
    }

    /// Produce the next fragment of the in-flight message. `eof` marks the
    /// last fragment and releases the in-flight slot.
    fn next_packet_msg(&mut self, max_payload: usize) -> proto::p2p::PacketMsg {
        let sending = self.sending.as_ref().expect("no message in flight");
        let remaining = sending.len() - self.sent_pos;
        let packet_size = remaining.min(max_payload);
        let data = sending[self.sent_pos..self.sent_pos + packet_size].to_vec();
        let eof = remaining <= max_payload;

        if eof {
            self.sending = None;
            self.sent_pos = 0;
        } else {
            self.sent_pos += packet_size;
        }

        proto::p2p::PacketMsg {
            channel_id: i32::from(self.desc.id),
            eof,
            data,
        }
    }

    fn update_stats(&mut self) {
        self.recently_sent = self.recently_sent * 8 / 10;
    }
}

/// Recv-side state of one channel.
struct RecvChannel {
    desc: ChannelDescriptor,
    recving: Vec<u8>,
}

impl RecvChannel {
    /// Accumulate a fragment, enforcing the per-message capacity. Returns
    /// the complete message once `eof` arrives.
    fn recv_packet_msg(&mut self, packet: proto::p2p::PacketMsg) -> Result<Option<Vec<u8>>> {
        let recv_cap = self.desc.recv_message_capacity;
        let received = self.recving.len() + packet.data.len();
        if recv_cap < received {
            return Err(Error::Protocol(format!(
                "received message exceeds available capacity: {} < {}",
                recv_cap, received
            )));
        }
        self.recving.extend_from_slice(&packet.data);
        if packet.eof {
            return Ok(Some(std::mem::take(&mut self.recving)));
        }
        Ok(None)
    }
}

/// Shared stop latch: `stop` is idempotent, and only the error that caused
/// the first stop is reported.
#[derive(Clone)]
struct StopHandle {
    stopped: Arc<StdMutex<bool>>,
    quit_tx: Arc<watch::Sender<bool>>,
    error_tx: Arc<watch::Sender<Option<Error>>>,
}

impl StopHandle {
    /// Returns whether the connection was already stopped.
    fn stop(&self) -> bool {
        let mut stopped = self.stopped.lock().expect("stop lock poisoned");
        if *stopped {
            return true;
        }
        *stopped = true;
        let _ = self.quit_tx.send(true);
        false
    }

    fn stop_for_error(&self, err: Error) {
        if !self.stop() {
            let _ = self.error_tx.send(Some(err));
        }
    }
}

type RoutineFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + Sync>>;

/// A multiplexed connection over a completed secret connection.
///
/// Constructed with its channel set and two upstream seams bound for the
/// connection's lifetime: complete inbound messages go to `on_receive`,
/// the fatal error (if any) is published on `on_error`.
pub struct MConnection {
    channel_queues: BTreeMap<ChannelId, mpsc::Sender<Vec<u8>>>,
    send_signal_tx: mpsc::Sender<()>,
    send_timeout: Duration,
    stop_handle: StopHandle,
    quit_rx: watch::Receiver<bool>,
    routines: Option<(RoutineFuture, RoutineFuture)>,
}

impl MConnection {
    pub fn new<Io>(
        conn: SecretConnection<Io>,
        descs: &[ChannelDescriptor],
        config: MConnConfig,
        on_receive: mpsc::Sender<(ChannelId, Vec<u8>)>,
        on_error: watch::Sender<Option<Error>>,
    ) -> Self
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (quit_tx, quit_rx) = watch::channel(false);
        let stop_handle = StopHandle {
            stopped: Arc::new(StdMutex::new(false)),
            quit_tx: Arc::new(quit_tx),
            error_tx: Arc::new(on_error),
        };

        let (pong_tx, pong_rx) = mpsc::channel(1);
        let (send_signal_tx, send_signal_rx) = mpsc::channel(1);
        let last_msg_recv = Arc::new(StdMutex::new(Instant::now()));

        let mut channel_queues = BTreeMap::new();
        let mut send_channels = BTreeMap::new();
        let mut recv_channels = BTreeMap::new();
        for desc in descs {
            debug_assert!(desc.priority > 0, "channel priority must be positive");
            let (tx, rx) = mpsc::channel(desc.send_queue_capacity.max(1));
            channel_queues.insert(desc.id, tx);
            send_channels.insert(
                desc.id,
                Channel {
                    desc: desc.clone(),
                    queue: rx,
                    sending: None,
                    sent_pos: 0,
                    recently_sent: 0,
                },
            );
            recv_channels.insert(
                desc.id,
                RecvChannel {
                    desc: desc.clone(),
                    recving: Vec::new(),
                },
            );
        }

        let (reader, writer) = tokio::io::split(conn);

        let send_routine = SendRoutine {
            writer: BufWriter::new(writer),
            channels: send_channels,
            config: config.clone(),
            pong_rx,
            send_signal_rx,
            send_signal_tx: send_signal_tx.clone(),
            last_msg_recv: last_msg_recv.clone(),
            quit_rx: quit_rx.clone(),
            stop_handle: stop_handle.clone(),
        };
        let recv_routine = RecvRoutine {
            reader,
            channels: recv_channels,
            max_packet_msg_size: config.max_packet_msg_size(),
            on_receive,
            pong_tx,
            last_msg_recv,
            quit_rx: quit_rx.clone(),
            stop_handle: stop_handle.clone(),
        };

        Self {
            channel_queues,
            send_signal_tx,
            send_timeout: config.send_timeout,
            stop_handle,
            quit_rx,
            routines: Some((Box::pin(send_routine.run()), Box::pin(recv_routine.run()))),
        }
    }

    /// Launch the send and recv routines. Must be called exactly once.
    pub fn start(&mut self, done: Shutdown) {
        let (send, recv) = self
            .routines
            .take()
            .expect("MConnection::start called twice");
        tokio::spawn(send);
        tokio::spawn(recv);

        // Map the external cancellation signal onto the stop latch.
        let stop_handle = self.stop_handle.clone();
        let mut quit_rx = self.quit_rx.clone();
        let mut done = done;
        tokio::spawn(async move {
            tokio::select! {
                _ = done.wait() => {
                    stop_handle.stop();
                }
                _ = quit_rx.wait_for(|quit| *quit) => {}
            }
        });
    }

    /// Queue `msg_bytes` on a channel. Returns `false` when the channel is
    /// unknown or closed, or when no queue space appears within the send
    /// timeout.
    pub async fn send(&self, ch_id: ChannelId, msg_bytes: Vec<u8>) -> bool {
        let queue = match self.channel_queues.get(&ch_id) {
            Some(queue) => queue,
            None => return false,
        };
        let sent = matches!(
            time::timeout(self.send_timeout, queue.send(msg_bytes)).await,
            Ok(Ok(()))
        );
        if sent {
            // Nudge the send routine; a pending signal already suffices.
            let _ = self.send_signal_tx.try_send(());
        }
        sent
    }

    /// Stop both routines and release the underlying stream. Idempotent.
    pub fn stop(&self) {
        self.stop_handle.stop();
    }
}

enum SendEvent {
    Flush,
    Stats,
    Ping,
    Pong,
    SendAvailable,
    LivenessCheck,
    Quit,
}

struct SendRoutine<Io> {
    writer: BufWriter<WriteHalf<SecretConnection<Io>>>,
    channels: BTreeMap<ChannelId, Channel>,
    config: MConnConfig,
    pong_rx: mpsc::Receiver<()>,
    send_signal_rx: mpsc::Receiver<()>,
    send_signal_tx: mpsc::Sender<()>,
    last_msg_recv: Arc<StdMutex<Instant>>,
    quit_rx: watch::Receiver<bool>,
    stop_handle: StopHandle,
}

impl<Io> SendRoutine<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let start = Instant::now();
        *self.last_msg_recv.lock().expect("liveness lock poisoned") = start;

        let mut ping_interval =
            time::interval_at(start + self.config.ping_interval, self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_interval =
            time::interval_at(start + UPDATE_STATS_INTERVAL, UPDATE_STATS_INTERVAL);
        stats_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness_interval =
            time::interval_at(start + self.config.pong_timeout, self.config.pong_timeout);
        liveness_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut flush_deadline: Option<Instant> = None;

        loop {
            let event = {
                let flush_wait = async {
                    match flush_deadline {
                        Some(deadline) => time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = flush_wait => SendEvent::Flush,
                    _ = stats_interval.tick() => SendEvent::Stats,
                    _ = ping_interval.tick() => SendEvent::Ping,
                    maybe = self.pong_rx.recv() => match maybe {
                        Some(()) => SendEvent::Pong,
                        None => SendEvent::Quit,
                    },
                    _ = liveness_interval.tick() => SendEvent::LivenessCheck,
                    maybe = self.send_signal_rx.recv() => match maybe {
                        Some(()) => SendEvent::SendAvailable,
                        None => SendEvent::Quit,
                    },
                    _ = self.quit_rx.wait_for(|quit| *quit) => SendEvent::Quit,
                }
            };

            let mut err: Option<Error> = None;
            match event {
                SendEvent::Flush => {
                    flush_deadline = None;
                    if let Err(e) = self.writer.flush().await {
                        err = Some(e.into());
                    }
                }
                SendEvent::Stats => {
                    for channel in self.channels.values_mut() {
                        channel.update_stats();
                    }
                }
                SendEvent::Ping => match self.send_ping().await {
                    Ok(()) => {
                        if let Err(e) = self.writer.flush().await {
                            err = Some(e.into());
                        }
                    }
                    Err(e) => err = Some(e),
                },
                SendEvent::Pong => match self.send_pong().await {
                    Ok(()) => {
                        if let Err(e) = self.writer.flush().await {
                            err = Some(e.into());
                        }
                    }
                    Err(e) => err = Some(e),
                },
                SendEvent::SendAvailable => {
                    match self.send_some_packet_msgs(&mut flush_deadline).await {
                        Ok(drained) => {
                            if !drained {
                                // More messages remain; run another batch.
                                let _ = self.send_signal_tx.try_send(());
                            }
                        }
                        Err(e) => err = Some(e),
                    }
                }
                SendEvent::LivenessCheck => {}
                SendEvent::Quit => break,
            }

            if err.is_none() {
                let last = *self.last_msg_recv.lock().expect("liveness lock poisoned");
                if last.elapsed() > self.config.pong_timeout {
                    err = Some(Error::Timeout("pong timeout"));
                }
            }

            if let Some(err) = err {
                self.stop_handle.stop_for_error(err);
                break;
            }
        }
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.write_packet(proto::p2p::packet::Sum::PacketPing(proto::p2p::PacketPing {}))
            .await
            .map(|_| ())
    }

    async fn send_pong(&mut self) -> Result<()> {
        self.write_packet(proto::p2p::packet::Sum::PacketPong(proto::p2p::PacketPong {}))
            .await
            .map(|_| ())
    }

    async fn write_packet(&mut self, sum: proto::p2p::packet::Sum) -> Result<usize> {
        let packet = proto::p2p::Packet { sum: Some(sum) };
        let bytes = framing::encode_msg(&packet);
        self.writer.write_all(&bytes).await?;
        Ok(bytes.len())
    }

    /// Emit up to `NUM_BATCH_PACKET_MSGS` packets. Returns `true` once no
    /// channel has anything pending.
    async fn send_some_packet_msgs(&mut self, flush_deadline: &mut Option<Instant>) -> Result<bool> {
        for _ in 0..NUM_BATCH_PACKET_MSGS {
            if self.send_packet_msg(flush_deadline).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Emit one packet from the pending channel with the lowest
    /// `recently_sent / priority` ratio. Returns `true` when nothing is
    /// pending.
    async fn send_packet_msg(&mut self, flush_deadline: &mut Option<Instant>) -> Result<bool> {
        let mut least: Option<(ChannelId, f64)> = None;
        for (id, channel) in self.channels.iter_mut() {
            if !channel.is_send_pending() {
                continue;
            }
            let ratio = channel.recently_sent as f64 / channel.desc.priority as f64;
            if least.map_or(true, |(_, best)| ratio < best) {
                least = Some((*id, ratio));
            }
        }

        let id = match least {
            Some((id, _)) => id,
            None => return Ok(true),
        };

        let max_payload = self.config.max_packet_msg_payload_size;
        let msg = self
            .channels
            .get_mut(&id)
            .expect("scheduled channel exists")
            .next_packet_msg(max_payload);
        let written = self
            .write_packet(proto::p2p::packet::Sum::PacketMsg(msg))
            .await?;
        self.channels
            .get_mut(&id)
            .expect("scheduled channel exists")
            .recently_sent += written as u64;

        // Arm the flush coalescer; an armed deadline is left in place.
        if flush_deadline.is_none() {
            *flush_deadline = Some(Instant::now() + self.config.flush_throttle);
        }
        Ok(false)
    }
}

struct RecvRoutine<Io> {
    reader: ReadHalf<SecretConnection<Io>>,
    channels: BTreeMap<ChannelId, RecvChannel>,
    max_packet_msg_size: usize,
    on_receive: mpsc::Sender<(ChannelId, Vec<u8>)>,
    pong_tx: mpsc::Sender<()>,
    last_msg_recv: Arc<StdMutex<Instant>>,
    quit_rx: watch::Receiver<bool>,
    stop_handle: StopHandle,
}

impl<Io> RecvRoutine<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        loop {
            let read = tokio::select! {
                _ = self.quit_rx.wait_for(|quit| *quit) => return,
                res = framing::read_msg::<proto::p2p::Packet, _>(
                    &mut self.reader,
                    self.max_packet_msg_size,
                ) => res,
            };
            let packet = match read {
                Ok(packet) => packet,
                Err(err) => {
                    self.stop_handle.stop_for_error(err);
                    return;
                }
            };

            *self.last_msg_recv.lock().expect("liveness lock poisoned") = Instant::now();

            match packet.sum {
                Some(proto::p2p::packet::Sum::PacketPing(_)) => {
                    if self.pong_tx.send(()).await.is_err() {
                        return;
                    }
                }
                Some(proto::p2p::packet::Sum::PacketPong(_)) => {
                    // Liveness is tracked by any receive; nothing else to do.
                }
                Some(proto::p2p::packet::Sum::PacketMsg(msg)) => {
                    let ch_id = match u8::try_from(msg.channel_id) {
                        Ok(id) => id,
                        Err(_) => {
                            self.stop_handle.stop_for_error(Error::Protocol(format!(
                                "unknown channel {}",
                                msg.channel_id
                            )));
                            return;
                        }
                    };
                    let channel = match self.channels.get_mut(&ch_id) {
                        Some(channel) => channel,
                        None => {
                            self.stop_handle.stop_for_error(Error::Protocol(format!(
                                "unknown channel {}",
                                ch_id
                            )));
                            return;
                        }
                    };
                    match channel.recv_packet_msg(msg) {
                        Ok(Some(msg_bytes)) => {
                            debug!(channel = ch_id, len = msg_bytes.len(), "received message");
                            if self.on_receive.send((ch_id, msg_bytes)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            self.stop_handle.stop_for_error(err);
                            return;
                        }
                    }
                }
                None => {
                    self.stop_handle
                        .stop_for_error(Error::protocol("unknown packet type"));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Channel) {
        let (tx, rx) = mpsc::channel(capacity);
        let channel = Channel {
            desc: ChannelDescriptor::new(0x20, "test", 1),
            queue: rx,
            sending: None,
            sent_pos: 0,
            recently_sent: 0,
        };
        (tx, channel)
    }

    #[tokio::test]
    async fn fragments_with_eof_on_last_packet() {
        let (tx, mut channel) = test_channel(1);
        tx.try_send(vec![0xaa; 2500]).unwrap();

        assert!(channel.is_send_pending());

        let first = channel.next_packet_msg(1000);
        assert_eq!((first.data.len(), first.eof), (1000, false));
        let second = channel.next_packet_msg(1000);
        assert_eq!((second.data.len(), second.eof), (1000, false));
        let third = channel.next_packet_msg(1000);
        assert_eq!((third.data.len(), third.eof), (500, true));

        assert!(channel.sending.is_none());
        assert!(!channel.is_send_pending());
    }

    #[tokio::test]
    async fn message_of_exactly_max_payload_is_one_packet() {
        let (tx, mut channel) = test_channel(1);
        tx.try_send(vec![1; 1000]).unwrap();
        assert!(channel.is_send_pending());

        let only = channel.next_packet_msg(1000);
        assert_eq!((only.data.len(), only.eof), (1000, true));
        assert!(!channel.is_send_pending());

        // One byte more costs a second packet.
        tx.try_send(vec![1; 1001]).unwrap();
        assert!(channel.is_send_pending());
        let first = channel.next_packet_msg(1000);
        assert_eq!((first.data.len(), first.eof), (1000, false));
        let second = channel.next_packet_msg(1000);
        assert_eq!((second.data.len(), second.eof), (1, true));
    }

    #[test]
    fn stats_decay() {
        let (_tx, mut channel) = {
            let (tx, rx) = mpsc::channel(1);
            (
                tx,
                Channel {
                    desc: ChannelDescriptor::new(1, "stats", 5),
                    queue: rx,
                    sending: None,
                    sent_pos: 0,
                    recently_sent: 1000,
                },
            )
        };
        channel.update_stats();
        assert_eq!(channel.recently_sent, 800);
        channel.update_stats();
        assert_eq!(channel.recently_sent, 640);
    }

    #[test]
    fn recv_capacity_violation_is_fatal() {
        let mut desc = ChannelDescriptor::new(0x20, "cap", 1);
        desc.recv_message_capacity = 10;
        let mut channel = RecvChannel {
            desc,
            recving: Vec::new(),
        };

        let ok = channel.recv_packet_msg(proto::p2p::PacketMsg {
            channel_id: 0x20,
            eof: false,
            data: vec![0; 6],
        });
        assert!(matches!(ok, Ok(None)));

        let err = channel.recv_packet_msg(proto::p2p::PacketMsg {
            channel_id: 0x20,
            eof: true,
            data: vec![0; 6],
        });
        assert!(matches!(err, Err(Error::Protocol(_))));
    }

    #[test]
    fn recv_reassembles_across_fragments() {
        let mut channel = RecvChannel {
            desc: ChannelDescriptor::new(0x20, "asm", 1),
            recving: Vec::new(),
        };
        assert!(matches!(
            channel.recv_packet_msg(proto::p2p::PacketMsg {
                channel_id: 0x20,
                eof: false,
                data: vec![1, 2],
            }),
            Ok(None)
        ));
        let complete = channel
            .recv_packet_msg(proto::p2p::PacketMsg {
                channel_id: 0x20,
                eof: true,
                data: vec![3, 4],
            })
            .unwrap();
        assert_eq!(complete, Some(vec![1, 2, 3, 4]));
        assert!(channel.recving.is_empty());
    }

    #[test]
    fn stop_latch_is_idempotent_and_first_error_wins() {
        let (quit_tx, quit_rx) = watch::channel(false);
        let (error_tx, error_rx) = watch::channel(None);
        let handle = StopHandle {
            stopped: Arc::new(StdMutex::new(false)),
            quit_tx: Arc::new(quit_tx),
            error_tx: Arc::new(error_tx),
        };

        handle.stop_for_error(Error::Timeout("pong timeout"));
        handle.stop_for_error(Error::protocol("later error"));
        handle.stop();

        assert!(*quit_rx.borrow());
        match &*error_rx.borrow() {
            Some(Error::Timeout(_)) => {}
            other => panic!("unexpected error slot: {:?}", other),
        };
    }
}

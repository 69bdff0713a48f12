//! MConn transport: TCP endpoints wrapped into authenticated multiplexed
//! connections.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
};

use ed25519_dalek as ed25519;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Mutex as TokioMutex},
};
use tracing::debug;

use crate::{
    error::{Error, Result},
    framing,
    mconn::{ChannelDescriptor, ChannelId, MConnConfig, MConnection},
    node::NodeInfo,
    secret_connection::{PublicKey, SecretConnection},
    shutdown::{self, Shutdown, ShutdownSignal},
};

/// Upper bound accepted for a peer's NodeInfo message.
const NODE_INFO_MAX_SIZE: usize = 10240;

/// Capacity of the per-connection inbound message hand-off. Small on
/// purpose: it is the backpressure point between the connection's recv
/// routine and the router.
const RECEIVE_QUEUE_CAPACITY: usize = 1;

/// Listens for, accepts, and dials TCP connections, wrapping each into an
/// [`MConnConnection`].
pub struct MConnTransport {
    mconn_config: MConnConfig,
    channel_descs: StdMutex<Vec<ChannelDescriptor>>,
    listener: StdMutex<Option<Arc<TcpListener>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl MConnTransport {
    pub fn new(mconn_config: MConnConfig) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            mconn_config,
            channel_descs: StdMutex::new(Vec::new()),
            listener: StdMutex::new(None),
            closed_tx,
            closed_rx,
        }
    }

    /// Register channels to announce and multiplex on every connection
    /// created from now on.
    pub fn add_channel_descriptors(&self, descs: Vec<ChannelDescriptor>) {
        self.channel_descs
            .lock()
            .expect("channel descriptor lock poisoned")
            .extend(descs);
    }

    /// Bind the TCP listener. Fails if the transport is already listening.
    pub async fn listen(&self, endpoint: &str) -> Result<()> {
        validate_endpoint(endpoint)?;
        {
            let listener = self.listener.lock().expect("listener lock poisoned");
            if listener.is_some() {
                return Err(Error::protocol("transport is already listening"));
            }
        }

        let bound = TcpListener::bind(endpoint).await?;
        debug!(endpoint, "transport listening");

        let mut listener = self.listener.lock().expect("listener lock poisoned");
        if listener.is_some() {
            return Err(Error::protocol("transport is already listening"));
        }
        *listener = Some(Arc::new(bound));
        Ok(())
    }

    /// Local address of the bound listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let listener = self.listener.lock().expect("listener lock poisoned");
        match listener.as_ref() {
            Some(listener) => Ok(listener.local_addr()?),
            None => Err(Error::protocol("transport is not listening")),
        }
    }

    /// Pull the next inbound connection off the listener. The returned
    /// connection has not handshaked yet.
    pub async fn accept(&self, done: &mut Shutdown) -> Result<MConnConnection> {
        if *self.closed_rx.borrow() {
            return Err(Error::Closed);
        }
        let listener = {
            let guard = self.listener.lock().expect("listener lock poisoned");
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| Error::protocol("transport is not listening"))?
        };

        let mut closed_rx = self.closed_rx.clone();
        let (stream, _addr) = tokio::select! {
            _ = done.wait() => return Err(Error::Canceled),
            _ = closed_rx.wait_for(|closed| *closed) => return Err(Error::Closed),
            res = listener.accept() => res?,
        };

        self.wrap(stream)
    }

    /// Open an outbound TCP connection. The returned connection has not
    /// handshaked yet.
    pub async fn dial(&self, endpoint: &str) -> Result<MConnConnection> {
        validate_endpoint(endpoint)?;
        if *self.closed_rx.borrow() {
            return Err(Error::Closed);
        }
        let stream = TcpStream::connect(endpoint).await?;
        self.wrap(stream)
    }

    /// Close the listener and release every pending accept. Idempotent.
    pub fn close(&self) -> Result<()> {
        let _ = self.closed_tx.send(true);
        self.listener
            .lock()
            .expect("listener lock poisoned")
            .take();
        Ok(())
    }

    fn wrap(&self, stream: TcpStream) -> Result<MConnConnection> {
        let descs = self
            .channel_descs
            .lock()
            .expect("channel descriptor lock poisoned")
            .clone();
        MConnConnection::new(stream, self.mconn_config.clone(), descs)
    }
}

/// `host:port`; IPv6 hosts must be bracketed.
fn validate_endpoint(endpoint: &str) -> Result<()> {
    if endpoint.is_empty() {
        return Err(Error::protocol("endpoint is empty"));
    }
    endpoint
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| Error::Protocol(format!("invalid endpoint {:?}", endpoint)))
}

enum ConnectionState {
    /// TCP established, secret connection not yet negotiated.
    Raw(TcpStream),
    /// Handshake complete; the MConnection owns the stream.
    Running(Arc<MConnection>),
    Closed,
}

/// One transport connection, before and after its handshake.
pub struct MConnConnection {
    remote_endpoint: String,
    mconn_config: MConnConfig,
    channel_descs: Vec<ChannelDescriptor>,
    state: StdMutex<ConnectionState>,
    receive_tx: mpsc::Sender<(ChannelId, Vec<u8>)>,
    receive_rx: TokioMutex<mpsc::Receiver<(ChannelId, Vec<u8>)>>,
    error_tx: StdMutex<Option<watch::Sender<Option<Error>>>>,
    error_rx: watch::Receiver<Option<Error>>,
    close_signal: ShutdownSignal,
    close_rx: Shutdown,
}

impl MConnConnection {
    fn new(
        stream: TcpStream,
        mconn_config: MConnConfig,
        channel_descs: Vec<ChannelDescriptor>,
    ) -> Result<Self> {
        let remote_endpoint = stream.peer_addr()?.to_string();
        let (receive_tx, receive_rx) = mpsc::channel(RECEIVE_QUEUE_CAPACITY);
        let (error_tx, error_rx) = watch::channel(None);
        let (close_signal, close_rx) = shutdown::channel();
        Ok(Self {
            remote_endpoint,
            mconn_config,
            channel_descs,
            state: StdMutex::new(ConnectionState::Raw(stream)),
            receive_tx,
            receive_rx: TokioMutex::new(receive_rx),
            error_tx: StdMutex::new(Some(error_tx)),
            error_rx,
            close_signal,
            close_rx,
        })
    }

    /// Run the full connection handshake: secret-connection key exchange
    /// and authentication, NodeInfo swap over the encrypted stream, then
    /// MConnection bring-up. Returns the peer's NodeInfo and the long-term
    /// public key it proved.
    pub async fn handshake(
        &self,
        done: &mut Shutdown,
        node_info: &NodeInfo,
        priv_key: &ed25519::SigningKey,
    ) -> Result<(NodeInfo, PublicKey)> {
        let stream = {
            let mut state = self.state.lock().expect("connection state lock poisoned");
            match std::mem::replace(&mut *state, ConnectionState::Closed) {
                ConnectionState::Raw(stream) => stream,
                other => {
                    *state = other;
                    return Err(Error::protocol("connection is already handshaked"));
                }
            }
        };

        let mut close_rx = self.close_rx.clone();
        let inner = self.handshake_inner(stream, node_info, priv_key);
        tokio::pin!(inner);
        tokio::select! {
            _ = done.wait() => {
                self.close();
                Err(Error::Canceled)
            }
            _ = close_rx.wait() => Err(Error::Closed),
            res = &mut inner => res,
        }
    }

    async fn handshake_inner(
        &self,
        stream: TcpStream,
        node_info: &NodeInfo,
        priv_key: &ed25519::SigningKey,
    ) -> Result<(NodeInfo, PublicKey)> {
        let mut secret_conn = SecretConnection::new(stream, priv_key.clone()).await?;
        let remote_pubkey = secret_conn.remote_pubkey();

        // Swap NodeInfo over the now-encrypted stream. Both sides write
        // eagerly, so write-then-read cannot deadlock.
        framing::write_msg(&mut secret_conn, &node_info.to_proto()).await?;
        let peer_info_msg: stele_proto::p2p::NodeInfo =
            framing::read_msg(&mut secret_conn, NODE_INFO_MAX_SIZE).await?;
        let peer_info = NodeInfo::from_proto(peer_info_msg)?;

        let error_tx = self
            .error_tx
            .lock()
            .expect("error slot lock poisoned")
            .take()
            .ok_or_else(|| Error::protocol("connection is already handshaked"))?;

        let mut mconn = MConnection::new(
            secret_conn,
            &self.channel_descs,
            self.mconn_config.clone(),
            self.receive_tx.clone(),
            error_tx,
        );
        // The MConnection observes this connection's own close signal;
        // router-level cancellation arrives via `close`.
        mconn.start(self.close_rx.clone());

        let mconn = Arc::new(mconn);
        {
            let mut state = self.state.lock().expect("connection state lock poisoned");
            if self.close_rx.is_triggered() {
                mconn.stop();
                return Err(Error::Closed);
            }
            *state = ConnectionState::Running(mconn.clone());
        }

        Ok((peer_info, remote_pubkey))
    }

    fn mconn(&self) -> Result<Arc<MConnection>> {
        let state = self.state.lock().expect("connection state lock poisoned");
        match &*state {
            ConnectionState::Running(mconn) => Ok(mconn.clone()),
            _ => Err(Error::Closed),
        }
    }

    /// Queue a message for the peer on the given channel.
    pub async fn send_message(
        &self,
        done: &mut Shutdown,
        ch_id: ChannelId,
        msg: Vec<u8>,
    ) -> Result<()> {
        let mconn = self.mconn()?;
        let mut error_rx = self.error_rx.clone();
        tokio::select! {
            res = error_rx.wait_for(|err| err.is_some()) => Err(take_error(res)),
            _ = done.wait() => Err(Error::Canceled),
            sent = mconn.send(ch_id, msg) => {
                if sent {
                    Ok(())
                } else {
                    Err(Error::Timeout("sending message timed out"))
                }
            }
        }
    }

    /// Wait for the next complete inbound message.
    pub async fn receive_message(&self, done: &mut Shutdown) -> Result<(ChannelId, Vec<u8>)> {
        let mut error_rx = self.error_rx.clone();
        let mut close_rx = self.close_rx.clone();
        let mut receive_rx = self.receive_rx.lock().await;
        tokio::select! {
            res = error_rx.wait_for(|err| err.is_some()) => Err(take_error(res)),
            _ = close_rx.wait() => Err(Error::Closed),
            _ = done.wait() => Err(Error::Canceled),
            maybe = receive_rx.recv() => maybe.ok_or(Error::Closed),
        }
    }

    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }

    /// Tear the connection down. Idempotent; unblocks every pending
    /// operation.
    pub fn close(&self) {
        self.close_signal.trigger();
        let mut state = self.state.lock().expect("connection state lock poisoned");
        match std::mem::replace(&mut *state, ConnectionState::Closed) {
            ConnectionState::Running(mconn) => mconn.stop(),
            // Dropping a raw stream closes the socket.
            ConnectionState::Raw(_) | ConnectionState::Closed => {}
        }
    }
}

fn take_error(
    res: std::result::Result<watch::Ref<'_, Option<Error>>, watch::error::RecvError>,
) -> Error {
    match res {
        Ok(err) => err.as_ref().cloned().unwrap_or(Error::Closed),
        Err(_) => Error::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_validation() {
        assert!(validate_endpoint("127.0.0.1:26656").is_ok());
        assert!(validate_endpoint("[::1]:26656").is_ok());
        assert!(validate_endpoint("").is_err());
        assert!(validate_endpoint("127.0.0.1").is_err());
        assert!(validate_endpoint("::1:26656").is_err());
        assert!(validate_endpoint("host.example.com:26656").is_err());
    }

    #[tokio::test]
    async fn listen_twice_fails() {
        let transport = MConnTransport::new(MConnConfig::default());
        transport.listen("127.0.0.1:0").await.unwrap();
        let err = transport.listen("127.0.0.1:0").await;
        assert!(err.is_err());
        transport.close().unwrap();
        // close is idempotent
        transport.close().unwrap();
    }

    #[tokio::test]
    async fn accept_unblocks_on_close() {
        let transport = Arc::new(MConnTransport::new(MConnConfig::default()));
        transport.listen("127.0.0.1:0").await.unwrap();

        let (_signal, mut done) = shutdown::channel();
        let accepting = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.accept(&mut done).await.map(|_| ()) })
        };

        tokio::task::yield_now().await;
        transport.close().unwrap();

        let res = accepting.await.unwrap();
        assert!(matches!(res, Err(Error::Closed)));
    }
}

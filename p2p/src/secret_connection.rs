//! `SecretConnection`: transport layer encryption for peer connections.
//!
//! The handshake exchanges ephemeral X25519 keys in the clear, derives the
//! directional frame keys via HKDF-SHA256, binds a challenge to the merlin
//! transcript of the exchange, and proves the long-term Ed25519 identity by
//! signing that challenge. The signature exchange and everything after it
//! travel encrypted under the freshly derived keys.

use std::{
    cmp,
    convert::{TryFrom, TryInto},
    io,
    pin::Pin,
    task::{Context, Poll},
};

use chacha20poly1305::{
    aead::{generic_array::GenericArray, AeadInPlace},
    ChaCha20Poly1305, KeyInit,
};
use ed25519_dalek::{self as ed25519, Signer, Verifier};
use merlin::Transcript;
use rand_core::OsRng;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use x25519_dalek::{EphemeralSecret, PublicKey as EphemeralPublic};

use stele_proto as proto;

pub use self::{kdf::Kdf, nonce::Nonce, public_key::PublicKey};
use crate::{
    error::{Error, Result},
    framing,
};

mod kdf;
mod nonce;
mod public_key;

/// Size of the MAC tag
pub const TAG_SIZE: usize = 16;

/// Maximum size of a message chunk carried by one frame
pub const DATA_MAX_SIZE: usize = 1024;

/// 4 + 1024 == 1028 total frame size
pub const DATA_LEN_SIZE: usize = 4;
pub const TOTAL_FRAME_SIZE: usize = DATA_MAX_SIZE + DATA_LEN_SIZE;

/// Wire size of one sealed frame.
pub const SEALED_FRAME_SIZE: usize = TOTAL_FRAME_SIZE + TAG_SIZE;

/// Upper bound accepted for the cleartext handshake messages.
const HANDSHAKE_MSG_MAX_SIZE: usize = 1024;

/// Handshake is a process of establishing the `SecretConnection` between
/// two peers.
struct Handshake<S> {
    state: S,
}

/// Handshake states

/// `AwaitingEphKey` means we're waiting for the remote ephemeral pubkey.
struct AwaitingEphKey {
    local_privkey: ed25519::SigningKey,
    local_eph_privkey: Option<EphemeralSecret>,
}

/// `AwaitingAuthSig` means we're waiting for the remote authenticated
/// signature.
struct AwaitingAuthSig {
    sc_mac: [u8; 32],
    recv_cipher: ChaCha20Poly1305,
    send_cipher: ChaCha20Poly1305,
    local_signature: ed25519::Signature,
}

impl Handshake<AwaitingEphKey> {
    /// Initiate a handshake.
    pub fn new(local_privkey: ed25519::SigningKey) -> (Self, EphemeralPublic) {
        // Generate an ephemeral key for perfect forward secrecy.
        let local_eph_privkey = EphemeralSecret::random_from_rng(OsRng);
        let local_eph_pubkey = EphemeralPublic::from(&local_eph_privkey);

        (
            Handshake {
                state: AwaitingEphKey {
                    local_privkey,
                    local_eph_privkey: Some(local_eph_privkey),
                },
            },
            local_eph_pubkey,
        )
    }

    /// Performs a Diffie-Hellman key agreement and creates a local
    /// signature. Transitions the handshake into the `AwaitingAuthSig`
    /// state.
    pub fn got_key(&mut self, remote_eph_pubkey: EphemeralPublic) -> Result<Handshake<AwaitingAuthSig>> {
        let local_eph_privkey = match self.state.local_eph_privkey.take() {
            Some(key) => key,
            None => return Err(Error::Crypto("ephemeral key already consumed")),
        };
        let local_eph_pubkey = EphemeralPublic::from(&local_eph_privkey);

        // Compute common shared secret.
        let shared_secret = local_eph_privkey.diffie_hellman(&remote_eph_pubkey);

        let mut transcript = Transcript::new(b"TENDERMINT_SECRET_CONNECTION_TRANSCRIPT_HASH");

        // Reject all-zero outputs from X25519, i.e. contributions from
        // low-order points (potential MitM).
        if shared_secret.as_bytes().ct_eq(&[0x00; 32]).unwrap_u8() == 1 {
            return Err(Error::Crypto("low-order point contribution to DH secret"));
        }

        // Sort by lexical order.
        let local_eph_pubkey_bytes = *local_eph_pubkey.as_bytes();
        let (low_eph_pubkey_bytes, high_eph_pubkey_bytes) =
            sort32(local_eph_pubkey_bytes, *remote_eph_pubkey.as_bytes());

        transcript.append_message(b"EPHEMERAL_LOWER_PUBLIC_KEY", &low_eph_pubkey_bytes);
        transcript.append_message(b"EPHEMERAL_UPPER_PUBLIC_KEY", &high_eph_pubkey_bytes);
        transcript.append_message(b"DH_SECRET", shared_secret.as_bytes());

        // Check whether the local ephemeral public key sorted first.
        let loc_is_least = local_eph_pubkey_bytes == low_eph_pubkey_bytes;

        let kdf = Kdf::derive_secrets_and_challenge(shared_secret.as_bytes(), loc_is_least);

        // The transcript challenge supersedes the HKDF challenge half for
        // signing.
        let mut sc_mac: [u8; 32] = [0; 32];
        transcript.challenge_bytes(b"SECRET_CONNECTION_MAC", &mut sc_mac);

        // Sign the challenge bytes for authentication.
        let local_signature = sign_challenge(&sc_mac, &self.state.local_privkey)?;

        Ok(Handshake {
            state: AwaitingAuthSig {
                sc_mac,
                recv_cipher: ChaCha20Poly1305::new(&kdf.recv_secret.into()),
                send_cipher: ChaCha20Poly1305::new(&kdf.send_secret.into()),
                local_signature,
            },
        })
    }
}

impl Handshake<AwaitingAuthSig> {
    /// Returns a verified pubkey of the remote peer.
    pub fn got_signature(&mut self, auth_sig_msg: proto::p2p::AuthSigMessage) -> Result<PublicKey> {
        let remote_pubkey = auth_sig_msg
            .pub_key
            .and_then(|pk| match pk.sum? {
                proto::crypto::public_key::Sum::Ed25519(ref bytes) => {
                    PublicKey::from_raw_ed25519(bytes)
                }
                proto::crypto::public_key::Sum::Secp256k1(_) => None,
            })
            .ok_or(Error::Crypto("expected an ed25519 public key"))?;

        let remote_sig = ed25519::Signature::try_from(auth_sig_msg.sig.as_slice())
            .map_err(|_| Error::Crypto("malformed challenge signature"))?;

        match remote_pubkey {
            PublicKey::Ed25519(ref pk) => pk
                .verify(&self.state.sc_mac, &remote_sig)
                .map_err(|_| Error::Crypto("challenge signature verification failed"))?,
        }

        // We've authorized.
        Ok(remote_pubkey)
    }
}

/// Encrypted connection between peers.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]; the frame layer is
/// transparent to callers. Splitting with [`tokio::io::split`] yields
/// halves that read and write concurrently, each half owning its own
/// nonce sequence.
pub struct SecretConnection<Io> {
    io_handler: Io,
    remote_pubkey: Option<PublicKey>,
    send_state: SendState,
    recv_state: RecvState,
}

struct SendState {
    cipher: ChaCha20Poly1305,
    nonce: Nonce,
    exhausted: bool,
    // sealed frame not yet fully written to the inner stream
    pending: Vec<u8>,
    pending_written: usize,
}

struct RecvState {
    cipher: ChaCha20Poly1305,
    nonce: Nonce,
    exhausted: bool,
    sealed: [u8; SEALED_FRAME_SIZE],
    filled: usize,
    // decrypted chunk not yet served to the caller
    buffer: Vec<u8>,
    read_pos: usize,
}

impl<Io> SecretConnection<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Performs a handshake and returns a new `SecretConnection`.
    pub async fn new(mut io_handler: Io, local_privkey: ed25519::SigningKey) -> Result<Self> {
        // Start a handshake process.
        let local_pubkey = PublicKey::from(&local_privkey);
        let (mut h, local_eph_pubkey) = Handshake::new(local_privkey);

        // Write the local ephemeral pubkey and receive one too.
        // Both sides transmit eagerly, so sequential write-then-read cannot
        // deadlock on these small messages.
        let remote_eph_pubkey = share_eph_pubkey(&mut io_handler, &local_eph_pubkey).await?;

        // Compute a local signature (also recv_cipher & send_cipher).
        let mut h = h.got_key(remote_eph_pubkey)?;

        let mut sc = SecretConnection {
            io_handler,
            remote_pubkey: None,
            send_state: SendState {
                cipher: h.state.send_cipher.clone(),
                nonce: Nonce::default(),
                exhausted: false,
                pending: Vec::new(),
                pending_written: 0,
            },
            recv_state: RecvState {
                cipher: h.state.recv_cipher.clone(),
                nonce: Nonce::default(),
                exhausted: false,
                sealed: [0u8; SEALED_FRAME_SIZE],
                filled: 0,
                buffer: Vec::new(),
                read_pos: 0,
            },
        };

        // Share each other's pubkey & challenge signature.
        // NOTE: the data must be encrypted/decrypted using the just-derived
        // ciphers, consuming nonce 0 of each direction.
        let auth_sig_msg = match local_pubkey {
            PublicKey::Ed25519(ref pk) => {
                share_auth_signature(&mut sc, pk, &h.state.local_signature).await?
            }
        };

        // Authenticate the remote pubkey.
        let remote_pubkey = h.got_signature(auth_sig_msg)?;

        // All good!
        sc.remote_pubkey = Some(remote_pubkey);
        Ok(sc)
    }

    /// Returns the remote pubkey. Panics if there's no key.
    pub fn remote_pubkey(&self) -> PublicKey {
        self.remote_pubkey.expect("remote_pubkey uninitialized")
    }
}

impl SendState {
    /// Seal one chunk into the pending slot as
    /// `u32_le(len) || chunk || zero padding`, encrypted and tagged.
    fn seal_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        debug_assert!(!chunk.is_empty(), "chunk is empty");
        debug_assert!(
            chunk.len() <= DATA_MAX_SIZE,
            "chunk is too big: {}! max: {}",
            chunk.len(),
            DATA_MAX_SIZE,
        );
        debug_assert!(self.pending_written >= self.pending.len());
        if self.exhausted {
            return Err(protocol_violation("send nonce exhausted"));
        }

        let mut sealed = vec![0u8; TOTAL_FRAME_SIZE];
        sealed[..DATA_LEN_SIZE].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
        sealed[DATA_LEN_SIZE..DATA_LEN_SIZE + chunk.len()].copy_from_slice(chunk);

        let tag = self
            .cipher
            .encrypt_in_place_detached(
                GenericArray::from_slice(self.nonce.to_bytes()),
                b"",
                &mut sealed[..],
            )
            .map_err(|_| protocol_violation("AEAD encryption failure"))?;
        sealed.extend_from_slice(tag.as_slice());

        if self.nonce.increment().is_err() {
            // The frame just sealed is the last one this key may carry.
            self.exhausted = true;
        }

        self.pending = sealed;
        self.pending_written = 0;
        Ok(())
    }
}

impl RecvState {
    /// Decrypt the filled sealed frame into the serve buffer.
    fn open_frame(&mut self) -> io::Result<()> {
        if self.exhausted {
            return Err(protocol_violation("recv nonce exhausted"));
        }

        let mut frame = [0u8; TOTAL_FRAME_SIZE];
        frame.copy_from_slice(&self.sealed[..TOTAL_FRAME_SIZE]);
        let tag = &self.sealed[TOTAL_FRAME_SIZE..];

        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(self.nonce.to_bytes()),
                b"",
                &mut frame,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| protocol_violation("AEAD decryption failure"))?;

        if self.nonce.increment().is_err() {
            self.exhausted = true;
        }

        let chunk_length = u32::from_le_bytes(
            frame[..DATA_LEN_SIZE]
                .try_into()
                .expect("4-byte length prefix"),
        ) as usize;
        if chunk_length > DATA_MAX_SIZE {
            return Err(protocol_violation("chunk length exceeds frame capacity"));
        }

        self.buffer.clear();
        self.buffer
            .extend_from_slice(&frame[DATA_LEN_SIZE..DATA_LEN_SIZE + chunk_length]);
        self.read_pos = 0;
        Ok(())
    }
}

impl<Io> SecretConnection<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Push any sealed-but-unwritten frame bytes into the inner stream.
    fn poll_drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.send_state.pending_written < self.send_state.pending.len() {
            let remaining = &self.send_state.pending[self.send_state.pending_written..];
            match Pin::new(&mut self.io_handler).poll_write(cx, remaining) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "inner stream refused sealed frame bytes",
                    )))
                }
                Poll::Ready(Ok(n)) => self.send_state.pending_written += n,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<Io> AsyncRead for SecretConnection<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    // CONTRACT: data smaller than DATA_MAX_SIZE is served atomically.
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            // Serve leftover decrypted bytes first.
            if this.recv_state.read_pos < this.recv_state.buffer.len() {
                let avail = &this.recv_state.buffer[this.recv_state.read_pos..];
                let n = cmp::min(avail.len(), buf.remaining());
                buf.put_slice(&avail[..n]);
                this.recv_state.read_pos += n;
                return Poll::Ready(Ok(()));
            }

            // Fill the next sealed frame off the inner stream.
            while this.recv_state.filled < SEALED_FRAME_SIZE {
                let mut frame_buf = ReadBuf::new(&mut this.recv_state.sealed[this.recv_state.filled..]);
                match Pin::new(&mut this.io_handler).poll_read(cx, &mut frame_buf) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(())) => {
                        let n = frame_buf.filled().len();
                        if n == 0 {
                            return if this.recv_state.filled == 0 {
                                // Clean EOF on a frame boundary.
                                Poll::Ready(Ok(()))
                            } else {
                                Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
                            };
                        }
                        this.recv_state.filled += n;
                    }
                }
            }
            this.recv_state.filled = 0;

            this.recv_state.open_frame()?;
            // An empty chunk (never produced by our writer) loops for the
            // next frame instead of signalling EOF.
        }
    }
}

impl<Io> AsyncWrite for SecretConnection<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    // CONTRACT: each call consumes at most DATA_MAX_SIZE bytes; write_all
    // drives longer messages across frames.
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        // Finish the frame sealed by a previous call before consuming new
        // bytes; once sealed, a frame's nonce is spent and it must ship.
        match this.poll_drain_pending(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk_len = cmp::min(buf.len(), DATA_MAX_SIZE);
        this.send_state.seal_chunk(&buf[..chunk_len])?;

        // Best effort: the chunk is committed either way, the next
        // write/flush drains whatever remains.
        match this.poll_drain_pending(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending | Poll::Ready(Ok(())) => Poll::Ready(Ok(chunk_len)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.poll_drain_pending(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.io_handler).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.poll_drain_pending(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.io_handler).poll_shutdown(cx)
    }
}

fn protocol_violation(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg)
}

/// Returns `remote_eph_pubkey`.
async fn share_eph_pubkey<Io>(
    io_handler: &mut Io,
    local_eph_pubkey: &EphemeralPublic,
) -> Result<EphemeralPublic>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let msg = proto::google::protobuf::BytesValue {
        value: local_eph_pubkey.as_bytes().to_vec(),
    };
    framing::write_msg(io_handler, &msg).await?;

    let response: proto::google::protobuf::BytesValue =
        framing::read_msg(io_handler, HANDSHAKE_MSG_MAX_SIZE).await?;
    let bytes: [u8; 32] = response
        .value
        .as_slice()
        .try_into()
        .map_err(|_| Error::Crypto("ephemeral key must be exactly 32 bytes"))?;
    Ok(EphemeralPublic::from(bytes))
}

/// Return is of the form lo, hi
fn sort32(first: [u8; 32], second: [u8; 32]) -> ([u8; 32], [u8; 32]) {
    if second > first {
        (first, second)
    } else {
        (second, first)
    }
}

/// Sign the challenge with the local private key
fn sign_challenge(
    challenge: &[u8; 32],
    local_privkey: &dyn Signer<ed25519::Signature>,
) -> Result<ed25519::Signature> {
    local_privkey
        .try_sign(challenge)
        .map_err(|_| Error::Crypto("failed to sign handshake challenge"))
}

async fn share_auth_signature<Io>(
    sc: &mut SecretConnection<Io>,
    pubkey: &ed25519::VerifyingKey,
    local_signature: &ed25519::Signature,
) -> Result<proto::p2p::AuthSigMessage>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let msg = proto::p2p::AuthSigMessage {
        pub_key: Some(proto::crypto::PublicKey {
            sum: Some(proto::crypto::public_key::Sum::Ed25519(
                pubkey.as_bytes().to_vec(),
            )),
        }),
        sig: local_signature.to_bytes().to_vec(),
    };

    framing::write_msg(sc, &msg).await?;
    framing::read_msg(sc, HANDSHAKE_MSG_MAX_SIZE).await
}

//! Client sessions
//!
//! A session owns one connection and runs exactly two tasks for its whole
//! life: a receive task (socket read half + read cipher cursor) and a send
//! task (outbound queue + socket write half + write cursor). Neither cursor is
//! ever touched by the other task.
//!
//! State flow: `Unauthenticated` -> handshake command -> key announcement
//! queued, `KeyExchanged` -> settle delay -> `Active` (encrypted both ways).
//! `Closed` can be entered from any state and is final.

pub mod manager;

pub use manager::SessionManager;

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::game::{MessageHandler, Principal};
use crate::network::codec::{encode_frame, read_frame, Protocol};
use crate::network::crypt::{CipherCursor, CipherKey, CipherStream};
use crate::network::Frame;

pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated = 0,
    KeyExchanged = 1,
    Active = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Unauthenticated,
            1 => SessionState::KeyExchanged,
            2 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

/// Per-session settings shared by every session of a server.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub protocol: Arc<Protocol>,
    pub settle_delay: Duration,
    pub send_poll: Duration,
    /// `None` leaves the outbound queue unbounded.
    pub outbound_limit: Option<usize>,
}

impl SessionOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            protocol: Arc::new(config.protocol()),
            settle_delay: config.settle_delay(),
            send_poll: config.send_poll(),
            outbound_limit: (config.outbound_queue_limit > 0).then_some(config.outbound_queue_limit),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Outbound queue entry. The write cipher is armed when `EnableCipher`
/// reaches the front, so every frame keeps the mode it was queued under.
#[derive(Debug)]
enum Outbound {
    Frame(Frame),
    EnableCipher,
}

/// I/O handed to the two tasks when the session starts.
struct SessionIo {
    reader: BoxedReader,
    writer: BoxedWriter,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

pub struct Session {
    id: SessionId,
    remote_addr: SocketAddr,
    key: CipherKey,
    options: SessionOptions,
    state: AtomicU8,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    /// Frames queued but not yet taken by the send task.
    pending: AtomicUsize,
    last_activity: Mutex<Instant>,
    principal: Mutex<Option<Principal>>,
    manager: Weak<SessionManager>,
    io: Mutex<Option<SessionIo>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Wraps an accepted TCP connection. Nothing runs until [`Session::start`].
    pub fn new(
        stream: TcpStream,
        remote_addr: SocketAddr,
        options: SessionOptions,
        manager: Weak<SessionManager>,
    ) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[session] set_nodelay failed addr={}: {}", remote_addr, e);
        }
        let (reader, writer) = stream.into_split();
        Self::with_io(reader, writer, remote_addr, options, manager)
    }

    /// Builds a session over arbitrary byte streams.
    pub fn with_io<R, W>(
        reader: R,
        writer: W,
        remote_addr: SocketAddr,
        options: SessionOptions,
        manager: Weak<SessionManager>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            key: CipherKey::generate(),
            options,
            state: AtomicU8::new(SessionState::Unauthenticated as u8),
            closed: AtomicBool::new(false),
            close_tx,
            outbound_tx,
            pending: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
            principal: Mutex::new(None),
            manager,
            io: Mutex::new(Some(SessionIo {
                reader: Box::new(reader),
                writer: Box::new(writer),
                outbound_rx,
            })),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames waiting in the outbound queue.
    pub fn pending_outbound(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Time since the last inbound frame (or since creation).
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    pub fn bind_principal(&self, principal: Principal) {
        *lock(&self.principal) = Some(principal);
    }

    pub fn unbind_principal(&self) -> Option<Principal> {
        lock(&self.principal).take()
    }

    pub fn principal(&self) -> Option<Principal> {
        lock(&self.principal).clone()
    }

    /// The bound principal, if it is a `T`.
    pub fn principal_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.principal()?.downcast::<T>().ok()
    }

    /// Spawns the receive and send tasks. Returns false if the session was
    /// already started or closed.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn MessageHandler>) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(io) = lock(&self.io).take() else {
            tracing::warn!("[session] id={} already started", self.id);
            return false;
        };

        let (read_cipher, write_cipher) = CipherStream::new(self.key.clone()).split();

        tokio::spawn(Arc::clone(self).receive_loop(io.reader, read_cipher, handler));
        tokio::spawn(Arc::clone(self).send_loop(io.writer, io.outbound_rx, write_cipher));

        tracing::debug!("[session] started id={} addr={}", self.id, self.remote_addr);
        true
    }

    /// Queues a frame. Never blocks; frames sent after close are dropped.
    pub fn send(&self, frame: Frame) {
        if self.is_closed() {
            return;
        }

        let depth = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(limit) = self.options.outbound_limit {
            if depth > limit {
                tracing::warn!(
                    "[session] outbound queue overflow id={} addr={} pending={} limit={}",
                    self.id,
                    self.remote_addr,
                    depth,
                    limit
                );
                self.close();
                return;
            }
        }

        if self.outbound_tx.send(Outbound::Frame(frame)).is_err() {
            self.release_pending();
        }
    }

    /// Saturating decrement; the send task may have zeroed the counter while
    /// closing.
    fn release_pending(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    /// Closes the session. Idempotent and callable from any task.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.store(SessionState::Closed as u8, Ordering::Release);
        self.close_tx.send_replace(true);

        // never started: release the socket here
        lock(&self.io).take();

        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(self);
        }
        tracing::info!("[session] closed id={} addr={}", self.id, self.remote_addr);
    }

    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: BoxedReader,
        mut cipher: CipherCursor,
        handler: Arc<dyn MessageHandler>,
    ) {
        let mut closed_rx = self.close_tx.subscribe();
        let protocol = Arc::clone(&self.options.protocol);

        loop {
            let encrypted = self.state() == SessionState::Active;
            let result = tokio::select! {
                _ = closed_rx.wait_for(|closed| *closed) => break,
                r = read_frame(&mut reader, encrypted.then_some(&mut cipher), &protocol) => r,
            };

            let frame = match result {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::debug!("[session] id={} connection closed by peer", self.id);
                    break;
                }
                Err(e) if e.is_truncation() => {
                    tracing::debug!("[session] id={} peer closed mid-frame", self.id);
                    break;
                }
                Err(e) => {
                    tracing::warn!("[session] id={} read error: {}", self.id, e);
                    break;
                }
            };

            tracing::trace!(
                "[session] id={} [packet_in] cmd={} len={} data={}",
                self.id,
                frame.command(),
                frame.len(),
                hex::encode(frame.payload())
            );

            if frame.command() == protocol.handshake_command() {
                if self.state() != SessionState::Unauthenticated {
                    tracing::warn!("[session] id={} repeated handshake ignored", self.id);
                    continue;
                }
                if !self.exchange_keys(&mut closed_rx).await {
                    break;
                }
                continue;
            }

            self.touch();
            let dispatched = std::panic::catch_unwind(AssertUnwindSafe(|| {
                handler.on_message(&self, frame)
            }));
            match dispatched {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("[session] id={} handler error: {:#}", self.id, e);
                }
                Err(_) => {
                    tracing::error!("[session] id={} handler panicked, closing", self.id);
                    break;
                }
            }
        }

        self.close();
        let notified = std::panic::catch_unwind(AssertUnwindSafe(|| handler.on_disconnect(&self)));
        if notified.is_err() {
            tracing::error!("[session] id={} disconnect handler panicked", self.id);
        }
    }

    /// Queues the plaintext key announcement, waits out the settle delay and
    /// switches encryption on. Returns false if the session closed meanwhile.
    ///
    /// Outbound encryption starts at the `EnableCipher` marker, after every
    /// frame queued before it. The peer never acknowledges the key; the delay
    /// only gives it time to read the announcement before encrypted frames
    /// arrive.
    async fn exchange_keys(&self, closed_rx: &mut watch::Receiver<bool>) -> bool {
        if !self.advance(SessionState::Unauthenticated, SessionState::KeyExchanged) {
            return false;
        }
        self.touch();
        self.send(Frame::new(
            self.options.protocol.handshake_command(),
            self.key.announcement(),
        ));
        tracing::debug!("[session] id={} key sent", self.id);

        tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => return false,
            _ = tokio::time::sleep(self.options.settle_delay) => {}
        }

        if !self.advance(SessionState::KeyExchanged, SessionState::Active) {
            return false;
        }
        if self.outbound_tx.send(Outbound::EnableCipher).is_err() {
            return false;
        }
        tracing::debug!("[session] id={} encryption active", self.id);
        true
    }

    async fn send_loop(
        self: Arc<Self>,
        mut writer: BoxedWriter,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        mut cipher: CipherCursor,
    ) {
        let mut closed_rx = self.close_tx.subscribe();
        let protocol = Arc::clone(&self.options.protocol);
        let mut buf = BytesMut::with_capacity(4096);
        let mut encrypted = false;

        loop {
            let next = tokio::select! {
                _ = closed_rx.wait_for(|closed| *closed) => break,
                r = tokio::time::timeout(self.options.send_poll, outbound_rx.recv()) => r,
            };
            let frame = match next {
                // idle wakeup
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(Outbound::EnableCipher)) => {
                    encrypted = true;
                    continue;
                }
                Ok(Some(Outbound::Frame(frame))) => frame,
            };
            self.release_pending();

            buf.clear();
            if let Err(e) = encode_frame(&frame, encrypted.then_some(&mut cipher), &protocol, &mut buf) {
                tracing::error!(
                    "[session] id={} dropping unencodable frame cmd={}: {}",
                    self.id,
                    frame.command(),
                    e
                );
                continue;
            }

            tracing::trace!(
                "[session] id={} [packet_out] cmd={} len={} encrypted={}",
                self.id,
                frame.command(),
                frame.len(),
                encrypted
            );

            let written = tokio::select! {
                _ = closed_rx.wait_for(|closed| *closed) => break,
                r = writer.write_all(&buf) => r,
            };
            if let Err(e) = written {
                tracing::debug!("[session] id={} write error: {}", self.id, e);
                break;
            }
        }

        outbound_rx.close();
        while outbound_rx.try_recv().is_ok() {}
        self.pending.store(0, Ordering::Release);

        let _ = tokio::time::timeout(Duration::from_secs(1), writer.shutdown()).await;
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ClientCodec;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};

    struct Recorder {
        frames: mpsc::UnboundedSender<Frame>,
        disconnects: Arc<AtomicUsize>,
        fail_on: Option<i8>,
        panic_on: Option<i8>,
    }

    impl MessageHandler for Recorder {
        fn on_message(&self, _session: &Arc<Session>, frame: Frame) -> anyhow::Result<()> {
            if Some(frame.command()) == self.panic_on {
                panic!("boom");
            }
            let fail = Some(frame.command()) == self.fail_on;
            let _ = self.frames.send(frame);
            if fail {
                anyhow::bail!("rejected");
            }
            Ok(())
        }

        fn on_disconnect(&self, _session: &Arc<Session>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        session: Arc<Session>,
        client_rd: ReadHalf<DuplexStream>,
        client_wr: WriteHalf<DuplexStream>,
        frames: mpsc::UnboundedReceiver<Frame>,
        disconnects: Arc<AtomicUsize>,
    }

    fn options() -> SessionOptions {
        SessionOptions {
            settle_delay: Duration::from_millis(10),
            send_poll: Duration::from_millis(20),
            ..SessionOptions::default()
        }
    }

    fn harness(options: SessionOptions, fail_on: Option<i8>, panic_on: Option<i8>) -> Harness {
        harness_with_pipe(256 * 1024, options, fail_on, panic_on)
    }

    fn harness_with_pipe(
        pipe: usize,
        options: SessionOptions,
        fail_on: Option<i8>,
        panic_on: Option<i8>,
    ) -> Harness {
        let (server_side, client_side) = duplex(pipe);
        let (srv_rd, srv_wr) = tokio::io::split(server_side);
        let (client_rd, client_wr) = tokio::io::split(client_side);
        let session = Session::with_io(
            srv_rd,
            srv_wr,
            "127.0.0.1:5000".parse().unwrap(),
            options,
            Weak::new(),
        );
        let (tx, frames) = mpsc::unbounded_channel();
        let disconnects = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(Recorder {
            frames: tx,
            disconnects: Arc::clone(&disconnects),
            fail_on,
            panic_on,
        });
        assert!(session.start(handler));
        Harness {
            session,
            client_rd,
            client_wr,
            frames,
            disconnects,
        }
    }

    async fn recv(frames: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("handler dropped")
    }

    async fn handshake(h: &mut Harness) -> ClientCodec {
        let mut client = ClientCodec::new(Protocol::default());
        let hello = client.encode(&client.handshake_frame()).unwrap();
        h.client_wr.write_all(&hello).await.unwrap();

        let announce = client.read(&mut h.client_rd).await.unwrap().unwrap();
        assert_eq!(announce.command(), -27);
        assert_eq!(announce.payload()[0], 4);
        client.accept_announcement(&announce).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.session.state(), SessionState::Active);
        client
    }

    #[tokio::test]
    async fn test_handshake_then_encrypted_dispatch() {
        let mut h = harness(options(), None, None);
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
        let mut client = handshake(&mut h).await;

        let ping = client.encode(&Frame::new(5, b"ping".to_vec())).unwrap();
        h.client_wr.write_all(&ping).await.unwrap();

        let frame = recv(&mut h.frames).await;
        assert_eq!(frame.command(), 5);
        assert_eq!(frame.payload(), b"ping");
        assert!(h.frames.try_recv().is_err(), "dispatched more than once");

        // server -> client is encrypted too
        h.session.send(Frame::new(7, b"pong".to_vec()));
        let reply = client.read(&mut h.client_rd).await.unwrap().unwrap();
        assert_eq!(reply.command(), 7);
        assert_eq!(reply.payload(), b"pong");
    }

    #[tokio::test]
    async fn test_backlog_queued_before_handshake_stays_plaintext() {
        // small pipe and a stalled peer keep the backlog queued past the
        // settle delay
        let mut h = harness_with_pipe(1024, options(), None, None);
        for _ in 0..8 {
            h.session.send(Frame::new(9, vec![0xA5; 4096]));
        }

        let mut client = ClientCodec::new(Protocol::default());
        let hello = client.encode(&client.handshake_frame()).unwrap();
        h.client_wr.write_all(&hello).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.session.state(), SessionState::Active);

        for _ in 0..8 {
            let frame = client.read(&mut h.client_rd).await.unwrap().unwrap();
            assert_eq!(frame.command(), 9);
            assert_eq!(frame.len(), 4096);
            assert!(frame.payload().iter().all(|&b| b == 0xA5));
        }

        let announce = client.read(&mut h.client_rd).await.unwrap().unwrap();
        assert_eq!(announce.command(), -27);
        assert_eq!(announce.len(), 5);
        client.accept_announcement(&announce).unwrap();

        // queued after the exchange: encrypted
        h.session.send(Frame::new(7, b"pong".to_vec()));
        let reply = client.read(&mut h.client_rd).await.unwrap().unwrap();
        assert_eq!(reply.command(), 7);
        assert_eq!(reply.payload(), b"pong");
    }

    #[tokio::test]
    async fn test_pending_counter_never_wraps() {
        let h = harness(options(), None, None);
        h.session.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.session.pending_outbound(), 0);

        // a send racing close releases its slot after the drain zeroed it
        h.session.release_pending();
        assert_eq!(h.session.pending_outbound(), 0);
    }

    #[tokio::test]
    async fn test_plaintext_frames_dispatch_before_handshake() {
        let mut h = harness(options(), None, None);
        let mut client = ClientCodec::new(Protocol::default());
        let wire = client.encode(&Frame::new(1, vec![9, 9])).unwrap();
        h.client_wr.write_all(&wire).await.unwrap();

        let frame = recv(&mut h.frames).await;
        assert_eq!(frame.payload(), &[9, 9]);
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_repeated_handshake_is_not_dispatched() {
        let mut h = harness(options(), None, None);
        let mut client = handshake(&mut h).await;

        let again = client.encode(&client.handshake_frame()).unwrap();
        h.client_wr.write_all(&again).await.unwrap();
        let ping = client.encode(&Frame::new(5, vec![1])).unwrap();
        h.client_wr.write_all(&ping).await.unwrap();

        assert_eq!(recv(&mut h.frames).await.command(), 5);
        assert_eq!(h.session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let mut h = harness(options(), None, None);
        let mut client = ClientCodec::new(Protocol::default());
        for i in 0..50u8 {
            h.session.send(Frame::new(3, vec![i]));
        }
        for i in 0..50u8 {
            let frame = client.read(&mut h.client_rd).await.unwrap().unwrap();
            assert_eq!(frame.payload(), &[i]);
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drops_sends() {
        let mut h = harness(options(), None, None);
        h.session.close();
        h.session.close();
        assert!(h.session.is_closed());
        assert_eq!(h.session.state(), SessionState::Closed);

        h.session.send(Frame::new(1, vec![1]));
        assert_eq!(h.session.pending_outbound(), 0);

        // peer sees EOF once the write half is shut down
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), h.client_rd.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_peer_disconnect_closes_session() {
        let h = harness(options(), None, None);
        drop(h.client_wr);
        drop(h.client_rd);
        for _ in 0..100 {
            if h.session.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.session.is_closed());
    }

    #[tokio::test]
    async fn test_truncated_frame_closes_session() {
        let mut h = harness(options(), None, None);
        // declares 10 bytes, sends 2, then hangs up
        h.client_wr.write_all(&[5, 0, 10, 1, 2]).await.unwrap();
        h.client_wr.shutdown().await.unwrap();
        for _ in 0..100 {
            if h.session.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.session.is_closed());
        assert!(h.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_error_keeps_session_open() {
        let mut h = harness(options(), Some(2), None);
        let mut client = ClientCodec::new(Protocol::default());
        for cmd in [2, 3] {
            let wire = client.encode(&Frame::empty(cmd)).unwrap();
            h.client_wr.write_all(&wire).await.unwrap();
        }
        assert_eq!(recv(&mut h.frames).await.command(), 2);
        assert_eq!(recv(&mut h.frames).await.command(), 3);
        assert!(!h.session.is_closed());
    }

    #[tokio::test]
    async fn test_handler_panic_closes_session() {
        let mut h = harness(options(), None, Some(4));
        let mut client = ClientCodec::new(Protocol::default());
        let wire = client.encode(&Frame::empty(4)).unwrap();
        h.client_wr.write_all(&wire).await.unwrap();
        for _ in 0..100 {
            if h.session.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.session.is_closed());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outbound_limit_disconnects_slow_peer() {
        let opts = SessionOptions {
            outbound_limit: Some(3),
            send_poll: Duration::from_secs(60),
            ..options()
        };
        // never started, so nothing drains the queue
        let (server_side, _client_side) = duplex(64);
        let (rd, wr) = tokio::io::split(server_side);
        let session = Session::with_io(rd, wr, "127.0.0.1:1".parse().unwrap(), opts, Weak::new());

        for _ in 0..3 {
            session.send(Frame::empty(1));
        }
        assert_eq!(session.pending_outbound(), 3);
        assert!(!session.is_closed());

        session.send(Frame::empty(1));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_start_twice_or_after_close() {
        let h = harness(options(), None, None);
        let (tx, _rx) = mpsc::unbounded_channel();
        let again = Arc::new(Recorder {
            frames: tx,
            disconnects: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
            panic_on: None,
        });
        assert!(!h.session.start(again.clone()));
        h.session.close();
        assert!(!h.session.start(again));
    }

    #[tokio::test]
    async fn test_principal_binding() {
        #[derive(Debug, PartialEq)]
        struct Account(u32);

        let h = harness(options(), None, None);
        assert!(h.session.principal().is_none());
        h.session.bind_principal(Arc::new(Account(7)));
        assert_eq!(*h.session.principal_as::<Account>().unwrap(), Account(7));
        assert!(h.session.principal_as::<String>().is_none());
        assert!(h.session.unbind_principal().is_some());
        assert!(h.session.principal().is_none());
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(SessionState::from_u8(0), SessionState::Unauthenticated);
        assert_eq!(SessionState::from_u8(2), SessionState::Active);
        assert_eq!(SessionState::from_u8(200), SessionState::Closed);
    }
}

//! C3: one multiplexed TCP session to one node (spec §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::handshake::{self, AuthStep};
use crate::protocol::packet::{self, DEFAULT_MAX_FRAME_LEN, HEADER_LEN};
use crate::protocol::{HelloFeature, Packet};
use crate::sasl::{self, Mechanism, scram::ScramClient};
use crate::stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    HelloNegotiating,
    Authenticating,
    BucketSelecting,
    Ready,
    Draining,
    Closed,
}

/// Parameters needed to stand up one Connection (a slice of `Opts`, spec §6).
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub bucket: Option<String>,
    pub connect_timeout: Duration,
    pub enable_tls: bool,
    pub enable_mutation_tokens: bool,
    pub max_frame_len: usize,
    pub user_agent: String,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11210,
            username: String::new(),
            password: String::new(),
            bucket: None,
            connect_timeout: Duration::from_secs(10),
            enable_tls: false,
            enable_mutation_tokens: true,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            user_agent: format!("couchbase-core/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Next-power-of-two ring size for the pending-request table (spec §9:
/// "An array indexed by opaque-modulo-size is preferred over a hash map").
const PENDING_TABLE_SIZE: usize = 4096;

struct PendingEntry {
    tx: oneshot::Sender<Result<Packet>>,
    #[allow(dead_code)]
    enqueued_at: Instant,
}

struct PendingTable {
    slots: Vec<Option<(u32, PendingEntry)>>,
}

impl PendingTable {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(PENDING_TABLE_SIZE);
        slots.resize_with(PENDING_TABLE_SIZE, || None);
        Self { slots }
    }

    fn slot(opaque: u32) -> usize {
        (opaque as usize) & (PENDING_TABLE_SIZE - 1)
    }

    /// Inserts at `opaque`'s slot. Fails if a still-outstanding entry
    /// already occupies it (the ring has wrapped around a pending op).
    fn insert(&mut self, opaque: u32, entry: PendingEntry) -> std::result::Result<(), PendingEntry> {
        let slot = &mut self.slots[Self::slot(opaque)];
        if slot.is_some() {
            return Err(entry);
        }
        *slot = Some((opaque, entry));
        Ok(())
    }

    fn remove(&mut self, opaque: u32) -> Option<PendingEntry> {
        let slot = &mut self.slots[Self::slot(opaque)];
        match slot {
            Some((stored_opaque, _)) if *stored_opaque == opaque => slot.take().map(|(_, e)| e),
            _ => None,
        }
    }

    fn drain_all(&mut self) -> Vec<PendingEntry> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.take())
            .map(|(_, e)| e)
            .collect()
    }
}

/// A multiplexed connection to one data node.
pub struct Connection {
    state: Arc<Mutex<ConnState>>,
    pending: Arc<Mutex<PendingTable>>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    next_opaque: AtomicU32,
    unordered_execution: bool,
    max_frame_len: usize,
    negotiated_features: HelloFeature,
}

impl Connection {
    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("connection state mutex poisoned")
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnState::Ready
    }

    pub fn is_broken(&self) -> bool {
        matches!(self.state(), ConnState::Draining | ConnState::Closed)
    }

    pub fn negotiated_features(&self) -> HelloFeature {
        self.negotiated_features
    }

    /// Runs the full handshake (spec §4.3) and returns a `Ready` connection
    /// with its reader/writer tasks already spawned.
    #[instrument(skip(config), fields(host = %config.host, port = config.port))]
    pub async fn connect(config: ConnectConfig) -> Result<Self> {
        let state = Arc::new(Mutex::new(ConnState::Connecting));

        let tcp = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        tcp.set_nodelay(true)?;

        let mut stream = Stream::tcp(tcp);
        if config.enable_tls {
            #[cfg(feature = "tls")]
            {
                stream = stream
                    .upgrade_to_tls(&config.host)
                    .await
                    .map_err(|e| Error::TlsFailure(e.to_string()))?;
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(Error::InvalidConfig(
                    "TLS was requested but this build was compiled without the `tls` feature".into(),
                ));
            }
        }

        *state.lock().expect("poisoned") = ConnState::HelloNegotiating;
        let mut handshake_opaque = 0u32;
        let mut next_opaque = || {
            handshake_opaque = handshake_opaque.wrapping_add(1);
            handshake_opaque
        };

        let requested = HelloFeature::supported_by_client()
            | if config.enable_tls { HelloFeature::TLS } else { HelloFeature::empty() }
            | if config.enable_mutation_tokens {
                HelloFeature::MUTATION_TOKENS
            } else {
                HelloFeature::empty()
            };
        let hello_req = handshake::hello_request(next_opaque(), &config.user_agent, requested);
        let hello_resp = roundtrip(&mut stream, hello_req, config.max_frame_len).await?;
        let negotiated_features = handshake::parse_hello_response(&hello_resp)?;

        *state.lock().expect("poisoned") = ConnState::Authenticating;
        let mechs_resp = roundtrip(
            &mut stream,
            handshake::sasl_list_mechs_request(next_opaque()),
            config.max_frame_len,
        )
        .await?;
        let server_mechs = handshake::parse_sasl_list_mechs_response(&mechs_resp)?;
        let mechanism = sasl::negotiate(&server_mechs, config.enable_tls)?;

        authenticate(&mut stream, mechanism, &config, &mut next_opaque).await?;

        if let Some(bucket) = &config.bucket {
            *state.lock().expect("poisoned") = ConnState::BucketSelecting;
            let resp = roundtrip(
                &mut stream,
                handshake::select_bucket_request(next_opaque(), bucket),
                config.max_frame_len,
            )
            .await?;
            handshake::parse_select_bucket_response(&resp, bucket)?;
        }

        *state.lock().expect("poisoned") = ConnState::Ready;

        let unordered_execution = negotiated_features.contains(HelloFeature::UNORDERED_EXECUTION);
        let pending = Arc::new(Mutex::new(PendingTable::new()));
        let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>(256);

        let (read_half, write_half) = split_stream(stream);

        tokio::spawn(reader_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&state),
            config.max_frame_len,
        ));
        tokio::spawn(writer_loop(write_half, writer_rx, Arc::clone(&state)));

        Ok(Self {
            state,
            pending,
            writer_tx,
            next_opaque: AtomicU32::new(handshake_opaque),
            unordered_execution,
            max_frame_len: config.max_frame_len,
            negotiated_features,
        })
    }

    /// Sends `packet` (opaque is assigned here) and awaits its response or
    /// `deadline`, whichever comes first (spec §4.3 `send`).
    #[instrument(skip(self, packet))]
    pub async fn send(&self, mut packet: Packet, deadline: Instant) -> Result<Packet> {
        if self.is_broken() {
            return Err(Error::ConnectionLost("connection is draining or closed".into()));
        }

        let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
        packet.opaque = opaque;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            pending
                .insert(
                    opaque,
                    PendingEntry {
                        tx,
                        enqueued_at: Instant::now(),
                    },
                )
                .map_err(|_| Error::ProtocolViolation("pending request table is saturated".into()))?;
        }

        let frame = packet::encode(&packet)?;
        if self.writer_tx.send(frame).await.is_err() {
            self.pending
                .lock()
                .expect("pending table poisoned")
                .remove(opaque);
            return Err(Error::ConnectionLost("writer task has stopped".into()));
        }

        let now = Instant::now();
        let timeout = deadline.saturating_duration_since(now);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost("connection closed while awaiting response".into())),
            Err(_) => {
                // Deadline hit first: remove our own entry so a late response
                // is discarded by the reader instead of delivered nowhere.
                self.pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(opaque);
                Err(Error::Timeout)
            }
        }
    }

    pub fn unordered_execution(&self) -> bool {
        self.unordered_execution
    }
}

async fn authenticate(
    stream: &mut Stream,
    mechanism: Mechanism,
    config: &ConnectConfig,
    next_opaque: &mut impl FnMut() -> u32,
) -> Result<()> {
    if mechanism == Mechanism::Plain {
        let initial = sasl::plain_initial_response(&config.username, &config.password);
        let resp = roundtrip(
            stream,
            handshake::sasl_auth_request(next_opaque(), mechanism.name(), &initial),
            config.max_frame_len,
        )
        .await?;
        return match handshake::parse_auth_response(&resp)? {
            AuthStep::Success(_) => Ok(()),
            AuthStep::Continue(_) => Err(Error::AuthFailure("PLAIN does not support continuation".into())),
        };
    }

    let mut scram = ScramClient::new(mechanism, &config.username, &config.password);
    let resp = roundtrip(
        stream,
        handshake::sasl_auth_request(next_opaque(), mechanism.name(), &scram.client_first_message()),
        config.max_frame_len,
    )
    .await?;
    let server_first = match handshake::parse_auth_response(&resp)? {
        AuthStep::Continue(data) => data,
        AuthStep::Success(_) => {
            return Err(Error::AuthFailure("server skipped the SCRAM challenge".into()));
        }
    };

    let client_final = scram.handle_server_first(&server_first)?;
    let resp = roundtrip(
        stream,
        handshake::sasl_step_request(next_opaque(), mechanism.name(), &client_final),
        config.max_frame_len,
    )
    .await?;
    match handshake::parse_auth_response(&resp)? {
        AuthStep::Success(server_final) => scram.handle_server_final(&server_final),
        AuthStep::Continue(_) => Err(Error::AuthFailure("SCRAM exchange took more rounds than expected".into())),
    }
}

/// Writes one request and reads one response, used only during the
/// sequential (pre-multiplexing) handshake phase.
async fn roundtrip(stream: &mut Stream, request: Packet, max_frame_len: usize) -> Result<Packet> {
    let frame = packet::encode(&request)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut buf = vec![0u8; HEADER_LEN];
    let mut filled = 0;
    loop {
        match packet::decode(&buf[..filled], max_frame_len)? {
            Some((packet, _consumed)) => return Ok(packet),
            None => {
                if buf.len() == filled {
                    buf.resize(buf.len() * 2, 0);
                }
                let n = stream.read(&mut buf[filled..]).await?;
                if n == 0 {
                    return Err(Error::ConnectionLost("server closed the connection during handshake".into()));
                }
                filled += n;
            }
        }
    }
}

enum ReadHalf {
    Tcp(tokio::net::tcp::OwnedReadHalf),
    #[cfg(feature = "tls")]
    Tls(tokio::io::ReadHalf<tokio_native_tls::TlsStream<TcpStream>>),
}

enum WriteHalf {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    #[cfg(feature = "tls")]
    Tls(tokio::io::WriteHalf<tokio_native_tls::TlsStream<TcpStream>>),
}

fn split_stream(stream: Stream) -> (ReadHalf, WriteHalf) {
    match stream {
        Stream::Tcp(buffered) => {
            let tcp = buffered.into_inner();
            let (r, w) = tcp.into_split();
            (ReadHalf::Tcp(r), WriteHalf::Tcp(w))
        }
        #[cfg(feature = "tls")]
        Stream::Tls(buffered) => {
            let tls = buffered.into_inner();
            let (r, w) = tokio::io::split(tls);
            (ReadHalf::Tls(r), WriteHalf::Tls(w))
        }
    }
}

/// Reader loop: decodes frames and demultiplexes by opaque (spec §4.3).
async fn reader_loop(
    mut read_half: ReadHalf,
    pending: Arc<Mutex<PendingTable>>,
    state: Arc<Mutex<ConnState>>,
    max_frame_len: usize,
) {
    let mut buf = Vec::with_capacity(64 * 1024);
    let mut filled = 0usize;

    loop {
        match packet::decode(&buf[..filled], max_frame_len) {
            Ok(Some((packet, consumed))) => {
                buf.drain(..consumed);
                filled -= consumed;
                deliver(&pending, packet);
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                fail_connection(&state, &pending, err.to_string());
                return;
            }
        }

        if buf.len() == filled {
            buf.resize((buf.len().max(HEADER_LEN)) * 2, 0);
        }
        let read = match &mut read_half {
            ReadHalf::Tcp(r) => r.read(&mut buf[filled..]).await,
            #[cfg(feature = "tls")]
            ReadHalf::Tls(r) => r.read(&mut buf[filled..]).await,
        };
        match read {
            Ok(0) => {
                fail_connection(&state, &pending, "peer closed the connection".to_string());
                return;
            }
            Ok(n) => filled += n,
            Err(err) => {
                fail_connection(&state, &pending, err.to_string());
                return;
            }
        }
    }
}

fn deliver(pending: &Arc<Mutex<PendingTable>>, packet: Packet) {
    let entry = pending.lock().expect("pending table poisoned").remove(packet.opaque);
    if let Some(entry) = entry {
        // A dropped receiver (caller already gave up) is not an error here.
        let _ = entry.tx.send(Ok(packet));
    }
    // Unsolicited/late response: discarded, per spec §4.3.
}

fn fail_connection(state: &Arc<Mutex<ConnState>>, pending: &Arc<Mutex<PendingTable>>, reason: String) {
    *state.lock().expect("poisoned") = ConnState::Draining;
    let entries = pending.lock().expect("pending table poisoned").drain_all();
    for entry in entries {
        let _ = entry.tx.send(Err(Error::ConnectionLost(reason.clone())));
    }
    *state.lock().expect("poisoned") = ConnState::Closed;
}

/// Writer loop: serializes outbound frames in arrival order onto the socket.
async fn writer_loop(mut write_half: WriteHalf, mut rx: mpsc::Receiver<Vec<u8>>, state: Arc<Mutex<ConnState>>) {
    while let Some(frame) = rx.recv().await {
        let result = async {
            match &mut write_half {
                WriteHalf::Tcp(w) => w.write_all(&frame).await?,
                #[cfg(feature = "tls")]
                WriteHalf::Tls(w) => w.write_all(&frame).await?,
            }
            Ok::<(), std::io::Error>(())
        }
        .await;

        if result.is_err() {
            *state.lock().expect("poisoned") = ConnState::Draining;
            return;
        }
    }
}

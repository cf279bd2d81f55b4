//! Platform server: accept and authenticate terminals, dispatch their
//! traffic, and drive downloads toward them.
//!
//! Three cooperating pieces:
//!
//! - the accept loop performs the register/authenticate handshake with a
//!   3-second first-frame deadline, then registers the client;
//! - the service loop scans every registered transport for frames,
//!   sleeping 10 ms when a pass produced nothing;
//! - an upgrade request temporarily marks its client "upgrading", which
//!   excludes it from the service loop until the transfer finishes, so
//!   the fragment acknowledgements are consumed by the upgrade driver.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use jt808_proto::{
    FrameSplitter, MultimediaUpload, Packager, Parser, PolygonArea, ProtocolError, SessionParams,
    TerminalParams, is_respond_only,
    location::{ext_id, parse_access_area_alarm},
    messages::{general_result, register_result},
    msg_id,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout},
};

use crate::error::PlatformError;

/// First-frame and authentication deadline for a new client.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for each upgrade-fragment acknowledgement.
const UPGRADE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a multimedia reassembly may sit without progress before the
/// platform asks for the missing fragments, and again before it gives up.
const MEDIA_RETRANSMIT_WAIT: Duration = Duration::from_secs(30);

/// Service loop idle sleep.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Accept-loop poll period, keeps shutdown responsive.
const ACCEPT_POLL: Duration = Duration::from_millis(250);

/// Platform-side configuration.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Listener endpoint, `ip:port`.
    pub bind_addr: String,
    /// Upper bound on simultaneously registered clients.
    pub max_connections: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:8888".to_owned(), max_connections: 10 }
    }
}

/// Callback handed every reassembled multimedia upload.
pub type MultimediaCallback = Box<dyn Fn(&MultimediaUpload) + Send + Sync>;

/// Reassembly state of a segmented `0x0801` upload.
struct MediaReassembly {
    media_id: u32,
    slot_size: usize,
    total: usize,
    received: Vec<bool>,
    buf: Vec<u8>,
    last_len: Option<usize>,
    /// Wait bound, armed at creation and refreshed by every accepted
    /// fragment. A lost tail fragment therefore still trips it.
    deadline: Instant,
    /// Whether a retransmit request was already issued for this upload.
    retransmit_requested: bool,
}

impl MediaReassembly {
    fn complete(&self) -> bool {
        self.last_len.is_some() && self.received.iter().all(|&got| got)
    }

    fn assembled(&self) -> Vec<u8> {
        let len = self.slot_size * (self.total - 1) + self.last_len.unwrap_or(0);
        self.buf[..len].to_vec()
    }

    fn missing(&self) -> Vec<u16> {
        self.received
            .iter()
            .enumerate()
            .filter(|&(_, got)| !got)
            .map(|(i, _)| (i + 1) as u16)
            .collect()
    }
}

/// One authenticated terminal connection.
struct ClientSession {
    params: SessionParams,
    stream: TcpStream,
    splitter: FrameSplitter,
    media: Option<MediaReassembly>,
}

type ClientHandle = Arc<tokio::sync::Mutex<ClientSession>>;

struct Shared {
    packager: Packager,
    parser: Parser,
    config: PlatformConfig,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    /// Client id → phone number, for by-phone lookup without touching the
    /// per-client lock.
    phones: Mutex<HashMap<u64, String>>,
    /// Clients currently owned by an upgrade driver.
    upgrading: Mutex<std::collections::HashSet<u64>>,
    multimedia_callback: Mutex<Option<MultimediaCallback>>,
    running: AtomicBool,
    next_client_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Encode a message from the session snapshot and advance the flow number.
fn encode_next(
    packager: &Packager,
    params: &mut SessionParams,
    msg_id: u16,
) -> Result<Vec<u8>, ProtocolError> {
    params.msg_head.msg_id = msg_id;
    let wire = packager.encode(params)?;
    params.msg_head.flow_num = params.msg_head.flow_num.wrapping_add(1);
    Ok(wire)
}

/// Read one complete frame from a client within `budget`.
async fn read_frame(
    stream: &mut TcpStream,
    splitter: &mut FrameSplitter,
    budget: Duration,
    operation: &'static str,
) -> Result<Vec<u8>, PlatformError> {
    let deadline = Instant::now() + budget;
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = splitter.next_frame() {
            return Ok(frame);
        }
        let Some(remaining) =
            deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
        else {
            return Err(PlatformError::Timeout { operation, elapsed: budget });
        };
        match timeout(remaining, stream.read(&mut buf)).await {
            Err(_) => return Err(PlatformError::Timeout { operation, elapsed: budget }),
            Ok(Ok(0)) => {
                return Err(PlatformError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client closed the connection",
                )));
            },
            Ok(Ok(n)) => splitter.extend(&buf[..n]),
            Ok(Err(error)) => return Err(PlatformError::Transport(error)),
        }
    }
}

/// Platform-side JT/T 808 server.
pub struct Platform {
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Platform {
    /// Bind the listener with the stock codec tables.
    pub async fn bind(config: PlatformConfig) -> Result<Self, PlatformError> {
        Self::bind_with_codec(Packager::new(), Parser::new(), config).await
    }

    /// Bind with custom codec tables (the vendor-message extension point).
    pub async fn bind_with_codec(
        packager: Packager,
        parser: Parser,
        config: PlatformConfig,
    ) -> Result<Self, PlatformError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "platform listening");

        let shared = Shared {
            packager,
            parser,
            config,
            clients: Mutex::new(HashMap::new()),
            phones: Mutex::new(HashMap::new()),
            upgrading: Mutex::new(std::collections::HashSet::new()),
            multimedia_callback: Mutex::new(None),
            running: AtomicBool::new(false),
            next_client_id: AtomicU64::new(1),
        };

        Ok(Self { shared: Arc::new(shared), listener: Some(listener), local_addr, tasks: Vec::new() })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Install the multimedia-received callback.
    pub fn on_multimedia_uploaded<F>(&self, callback: F)
    where
        F: Fn(&MultimediaUpload) + Send + Sync + 'static,
    {
        *lock(&self.shared.multimedia_callback) = Some(Box::new(callback));
    }

    /// Start the accept and service tasks. Must be called on a Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// - `PlatformError::Handshake` if the server was already started
    pub fn run(&mut self) -> Result<(), PlatformError> {
        let Some(listener) = self.listener.take() else {
            return Err(PlatformError::Handshake { reason: "server already running" });
        };
        self.shared.running.store(true, Ordering::Release);
        self.tasks.push(tokio::spawn(accept_loop(Arc::clone(&self.shared), listener)));
        self.tasks.push(tokio::spawn(service_loop(Arc::clone(&self.shared))));
        Ok(())
    }

    /// Stop the server and wait for its tasks.
    pub async fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        for task in self.tasks.drain(..) {
            if let Err(error) = task.await {
                tracing::debug!(%error, "platform task aborted");
            }
        }
        lock(&self.shared.clients).clear();
        lock(&self.shared.phones).clear();
    }

    /// Ids of the currently registered clients.
    #[must_use]
    pub fn client_ids(&self) -> Vec<u64> {
        lock(&self.shared.clients).keys().copied().collect()
    }

    /// Phone number a client registered with.
    #[must_use]
    pub fn client_phone(&self, client_id: u64) -> Option<String> {
        lock(&self.shared.phones).get(&client_id).cloned()
    }

    fn client(&self, client_id: u64) -> Result<ClientHandle, PlatformError> {
        lock(&self.shared.clients)
            .get(&client_id)
            .cloned()
            .ok_or(PlatformError::UnknownClient(client_id))
    }

    fn client_by_phone(&self, phone: &str) -> Result<u64, PlatformError> {
        lock(&self.shared.phones)
            .iter()
            .find(|(_, p)| p.as_str() == phone)
            .map(|(&id, _)| id)
            .ok_or_else(|| PlatformError::UnknownPhone(phone.to_owned()))
    }

    /// Stage outbound state and send one command to a client.
    async fn send_command(
        &self,
        client_id: u64,
        msg_id: u16,
        stage: impl FnOnce(&mut SessionParams),
    ) -> Result<(), PlatformError> {
        let client = self.client(client_id)?;
        let mut session = client.lock().await;
        stage(&mut session.params);
        let wire = encode_next(&self.shared.packager, &mut session.params, msg_id)?;
        session.stream.write_all(&wire).await?;
        Ok(())
    }

    /// Push terminal parameters to a client (`0x8103`).
    pub async fn set_terminal_params(
        &self,
        client_id: u64,
        items: TerminalParams,
    ) -> Result<(), PlatformError> {
        self.send_command(client_id, msg_id::SET_TERMINAL_PARAMS, |params| {
            params.terminal_params = items;
        })
        .await
    }

    /// Query every terminal parameter (`0x8104`).
    pub async fn query_terminal_params(&self, client_id: u64) -> Result<(), PlatformError> {
        self.send_command(client_id, msg_id::GET_TERMINAL_PARAMS, |_| {}).await
    }

    /// Query specific terminal parameters (`0x8106`).
    pub async fn query_specific_terminal_params(
        &self,
        client_id: u64,
        ids: Vec<u32>,
    ) -> Result<(), PlatformError> {
        self.send_command(client_id, msg_id::GET_SPECIFIC_TERMINAL_PARAMS, |params| {
            params.terminal_param_ids = ids;
        })
        .await
    }

    /// Query the current location (`0x8201`).
    pub async fn query_location(&self, client_id: u64) -> Result<(), PlatformError> {
        self.send_command(client_id, msg_id::GET_LOCATION, |_| {}).await
    }

    /// Push a polygon geofence to a client (`0x8604`).
    pub async fn set_polygon_area(
        &self,
        client_id: u64,
        area: PolygonArea,
    ) -> Result<(), PlatformError> {
        self.send_command(client_id, msg_id::SET_POLYGON_AREA, |params| {
            params.polygon_area = area;
        })
        .await
    }

    /// Delete polygon geofences on a client (`0x8605`).
    pub async fn delete_polygon_areas(
        &self,
        client_id: u64,
        ids: Vec<u32>,
    ) -> Result<(), PlatformError> {
        self.send_command(client_id, msg_id::DELETE_POLYGON_AREA, |params| {
            params.polygon_area_ids = ids;
        })
        .await
    }

    /// Order temporary location tracking (`0x8202`).
    pub async fn track_location(
        &self,
        client_id: u64,
        interval_secs: u16,
        duration_secs: u32,
    ) -> Result<(), PlatformError> {
        self.send_command(client_id, msg_id::TRACKING_CONTROL, |params| {
            params.tracking_control.interval = interval_secs;
            params.tracking_control.duration = duration_secs;
        })
        .await
    }

    /// Deliver an upgrade package to a client, segmenting as needed.
    ///
    /// The client is excluded from the service loop for the duration; each
    /// fragment waits up to five seconds for the terminal's general
    /// respond, and a `0x8003` fill-packet request arriving instead causes
    /// verbatim retransmission of the stored fragments.
    ///
    /// # Errors
    ///
    /// - `PlatformError::UnknownClient` for an unregistered id
    /// - `PlatformError::UpgradeRejected` when the terminal refuses
    /// - `PlatformError::Timeout` when an acknowledgement never arrives
    pub async fn upgrade_request(
        &self,
        client_id: u64,
        kind: u8,
        manufacturer_id: &[u8],
        version: &str,
        file: &[u8],
    ) -> Result<(), PlatformError> {
        let client = self.client(client_id)?;
        lock(&self.shared.upgrading).insert(client_id);
        let result =
            run_upgrade(&self.shared, &client, kind, manufacturer_id, version, file).await;
        lock(&self.shared.upgrading).remove(&client_id);
        result
    }

    /// [`Platform::upgrade_request`] keyed by terminal phone number.
    pub async fn upgrade_request_by_phone(
        &self,
        phone: &str,
        kind: u8,
        manufacturer_id: &[u8],
        version: &str,
        file: &[u8],
    ) -> Result<(), PlatformError> {
        let client_id = self.client_by_phone(phone)?;
        self.upgrade_request(client_id, kind, manufacturer_id, version, file).await
    }
}

/// Accept clients and drive each through the registration handshake.
async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    while shared.running.load(Ordering::Acquire) {
        let accepted = match timeout(ACCEPT_POLL, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok(accepted)) => accepted,
            Ok(Err(error)) => {
                tracing::error!(%error, "accept failed");
                continue;
            },
        };

        let (stream, peer) = accepted;
        if lock(&shared.clients).len() >= shared.config.max_connections {
            tracing::warn!(%peer, "connection limit reached, rejecting client");
            continue;
        }

        match handshake(&shared, stream).await {
            Ok(session) => {
                let client_id = shared.next_client_id.fetch_add(1, Ordering::AcqRel);
                let phone = session.params.parse.msg_head.phone.clone();
                tracing::info!(client_id, %phone, %peer, "terminal registered");
                lock(&shared.phones).insert(client_id, phone);
                lock(&shared.clients)
                    .insert(client_id, Arc::new(tokio::sync::Mutex::new(session)));
            },
            Err(error) => tracing::warn!(%peer, %error, "handshake failed"),
        }
    }
}

/// Register/authenticate a fresh connection.
///
/// Expects `0x0100` within three seconds, answers `0x8100` carrying a
/// random decimal auth code, then expects `0x0102` echoing that code and
/// answers a success `0x8001`.
async fn handshake(shared: &Shared, mut stream: TcpStream) -> Result<ClientSession, PlatformError> {
    if let Err(error) = stream.set_nodelay(true) {
        tracing::debug!(%error, "failed to set TCP_NODELAY");
    }
    let mut splitter = FrameSplitter::new();
    let mut params = SessionParams::default();

    let wire = read_frame(&mut stream, &mut splitter, HANDSHAKE_TIMEOUT, "register").await?;
    let msg = shared.parser.decode(&wire, &mut params)?;
    if msg != msg_id::TERMINAL_REGISTER {
        return Err(PlatformError::Handshake { reason: "first frame was not a register" });
    }

    let mut seed = [0u8; 4];
    getrandom::fill(&mut seed).map_err(|error| PlatformError::Rng(error.to_string()))?;
    let auth_code = u32::from_be_bytes(seed).to_string().into_bytes();

    params.auth_code = auth_code.clone();
    params.respond_result = register_result::SUCCESS;
    let wire = encode_next(&shared.packager, &mut params, msg_id::REGISTER_RESPOND)?;
    stream.write_all(&wire).await?;

    let wire = read_frame(&mut stream, &mut splitter, HANDSHAKE_TIMEOUT, "authenticate").await?;
    let msg = shared.parser.decode(&wire, &mut params)?;
    if msg != msg_id::TERMINAL_AUTHENTICATION {
        return Err(PlatformError::Handshake { reason: "expected authentication" });
    }
    if params.parse.auth_code != auth_code {
        return Err(PlatformError::AuthMismatch);
    }

    params.respond_result = general_result::SUCCESS;
    let wire = encode_next(&shared.packager, &mut params, msg_id::PLATFORM_GENERAL_RESPOND)?;
    stream.write_all(&wire).await?;

    Ok(ClientSession { params, stream, splitter, media: None })
}

/// Scan every registered transport for frames.
async fn service_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; 4096];
    while shared.running.load(Ordering::Acquire) {
        let handles: Vec<(u64, ClientHandle)> =
            lock(&shared.clients).iter().map(|(&id, handle)| (id, Arc::clone(handle))).collect();

        let mut produced = false;
        for (client_id, handle) in handles {
            if lock(&shared.upgrading).contains(&client_id) {
                continue;
            }
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };

            if let Err(error) = check_media_deadline(&shared, client_id, &mut session).await {
                tracing::warn!(client_id, %error, "client failed, dropping");
                drop(session);
                remove_client(&shared, client_id);
                continue;
            }

            match session.stream.try_read(&mut buf) {
                Ok(0) => {
                    tracing::info!(client_id, "terminal disconnected");
                    drop(session);
                    remove_client(&shared, client_id);
                },
                Ok(n) => {
                    produced = true;
                    let bytes = buf[..n].to_vec();
                    session.splitter.extend(&bytes);
                    while let Some(frame) = session.splitter.next_frame() {
                        if let Err(error) = handle_frame(&shared, client_id, &mut session, &frame).await
                        {
                            tracing::warn!(client_id, %error, "client failed, dropping");
                            drop(session);
                            remove_client(&shared, client_id);
                            break;
                        }
                    }
                },
                Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => {},
                Err(error) => {
                    tracing::warn!(client_id, %error, "read failed, dropping client");
                    drop(session);
                    remove_client(&shared, client_id);
                },
            }
        }

        if !produced {
            sleep(IDLE_SLEEP).await;
        }
    }
}

fn remove_client(shared: &Shared, client_id: u64) {
    lock(&shared.clients).remove(&client_id);
    lock(&shared.phones).remove(&client_id);
}

/// Police the multimedia-reassembly wait bound for one client.
///
/// A stalled upload (including one whose tail fragment never arrived)
/// first gets a `0x8800` listing the missing fragments so the terminal
/// retransmits them; if nothing arrives within the next wait period
/// either, the buffer is dropped.
async fn check_media_deadline(
    shared: &Shared,
    client_id: u64,
    session: &mut ClientSession,
) -> Result<(), PlatformError> {
    let Some(reassembly) = session.media.as_mut() else {
        return Ok(());
    };
    if Instant::now() < reassembly.deadline {
        return Ok(());
    }

    if reassembly.retransmit_requested {
        let media_id = reassembly.media_id;
        tracing::warn!(client_id, media_id, "abandoning stalled multimedia upload");
        session.media = None;
        return Ok(());
    }

    let missing = reassembly.missing();
    tracing::info!(client_id, ?missing, "media upload stalled, requesting missing fragments");
    reassembly.retransmit_requested = true;
    reassembly.deadline = Instant::now() + MEDIA_RETRANSMIT_WAIT;
    let media_id = reassembly.media_id;

    session.params.multimedia_ack.media_id = media_id;
    session.params.multimedia_ack.retransmit_ids = missing;
    let wire =
        encode_next(&shared.packager, &mut session.params, msg_id::MULTIMEDIA_UPLOAD_RESPOND)?;
    session.stream.write_all(&wire).await?;
    Ok(())
}

/// Dispatch one frame from a registered client.
///
/// Decode errors drop the frame; transport errors propagate and drop the
/// client.
async fn handle_frame(
    shared: &Shared,
    client_id: u64,
    session: &mut ClientSession,
    wire: &[u8],
) -> Result<(), PlatformError> {
    let msg = match shared.parser.decode(wire, &mut session.params) {
        Ok(msg) => msg,
        Err(error) => {
            tracing::warn!(client_id, %error, "dropping undecodable frame");
            return Ok(());
        },
    };

    match msg {
        msg_id::LOCATION_REPORT => log_location_report(client_id, &session.params),
        msg_id::GET_TERMINAL_PARAMS_RESPOND => log_terminal_params(client_id, &session.params),
        msg_id::MULTIMEDIA_UPLOAD => {
            handle_multimedia(shared, client_id, session).await?;
            return Ok(());
        },
        _ => {},
    }

    if !is_respond_only(msg) {
        session.params.respond_result = general_result::SUCCESS;
        let wire =
            encode_next(&shared.packager, &mut session.params, msg_id::PLATFORM_GENERAL_RESPOND)?;
        session.stream.write_all(&wire).await?;
    }
    Ok(())
}

/// Multimedia upload: direct or segmented with gap retransmission.
async fn handle_multimedia(
    shared: &Shared,
    client_id: u64,
    session: &mut ClientSession,
) -> Result<(), PlatformError> {
    let head = session.params.parse.msg_head.clone();
    let media = session.params.parse.multimedia.clone();

    if !head.attr.is_packet() || head.total_packets <= 1 {
        fire_multimedia_callback(shared, client_id, &media);
        session.params.multimedia_ack.media_id = media.media_id;
        session.params.multimedia_ack.retransmit_ids.clear();
        let wire =
            encode_next(&shared.packager, &mut session.params, msg_id::MULTIMEDIA_UPLOAD_RESPOND)?;
        session.stream.write_all(&wire).await?;
        return Ok(());
    }

    let total = usize::from(head.total_packets);
    let seq = usize::from(head.packet_seq);
    if seq == 0 || seq > total {
        tracing::warn!(client_id, seq, total, "media fragment sequence out of range");
        return Ok(());
    }

    let restart = session.media.as_ref().is_some_and(|r| {
        r.total != total || r.media_id != media.media_id
    });
    if restart {
        tracing::warn!(client_id, "new multimedia upload supersedes an unfinished one");
        session.media = None;
    }
    let reassembly = session.media.get_or_insert_with(|| MediaReassembly {
        media_id: media.media_id,
        slot_size: media.data.len(),
        total,
        received: vec![false; total],
        buf: vec![0; media.data.len() * total],
        last_len: None,
        deadline: Instant::now() + MEDIA_RETRANSMIT_WAIT,
        retransmit_requested: false,
    });

    let offset = (seq - 1) * reassembly.slot_size;
    if offset + media.data.len() <= reassembly.buf.len() {
        reassembly.buf[offset..offset + media.data.len()].copy_from_slice(&media.data);
        reassembly.received[seq - 1] = true;
        // Progress extends the wait bound.
        reassembly.deadline = Instant::now() + MEDIA_RETRANSMIT_WAIT;
        if seq == total {
            reassembly.last_len = Some(media.data.len());
        }
    } else {
        tracing::warn!(client_id, seq, "media fragment exceeds the reassembly buffer");
    }

    // Per-fragment acknowledgement.
    session.params.respond_result = general_result::SUCCESS;
    let wire =
        encode_next(&shared.packager, &mut session.params, msg_id::PLATFORM_GENERAL_RESPOND)?;
    session.stream.write_all(&wire).await?;

    let reassembly = match session.media.as_mut() {
        Some(reassembly) => reassembly,
        None => return Ok(()),
    };

    if reassembly.complete() {
        let data = reassembly.assembled();
        session.media = None;

        let mut assembled = media;
        assembled.data = data;
        fire_multimedia_callback(shared, client_id, &assembled);

        session.params.multimedia_ack.media_id = assembled.media_id;
        session.params.multimedia_ack.retransmit_ids.clear();
        let wire =
            encode_next(&shared.packager, &mut session.params, msg_id::MULTIMEDIA_UPLOAD_RESPOND)?;
        session.stream.write_all(&wire).await?;
    } else if seq == total && !reassembly.retransmit_requested {
        let missing = reassembly.missing();
        tracing::info!(client_id, ?missing, "requesting media fragment retransmission");
        reassembly.retransmit_requested = true;
        session.params.multimedia_ack.media_id = reassembly.media_id;
        session.params.multimedia_ack.retransmit_ids = missing;
        let wire =
            encode_next(&shared.packager, &mut session.params, msg_id::MULTIMEDIA_UPLOAD_RESPOND)?;
        session.stream.write_all(&wire).await?;
    }
    Ok(())
}

fn fire_multimedia_callback(shared: &Shared, client_id: u64, media: &MultimediaUpload) {
    tracing::info!(
        client_id,
        media_id = media.media_id,
        media_type = media.media_type,
        format = media.format,
        bytes = media.data.len(),
        "multimedia upload complete"
    );
    let callback = lock(&shared.multimedia_callback);
    if let Some(callback) = callback.as_ref() {
        callback(media);
    }
}

/// Surface a location report through the log, the way an operator console
/// would.
fn log_location_report(client_id: u64, params: &SessionParams) {
    let basic = &params.parse.location;
    tracing::info!(
        client_id,
        phone = %params.parse.msg_head.phone,
        latitude = f64::from(basic.latitude) * 1e-6,
        longitude = f64::from(basic.longitude) * 1e-6,
        altitude_m = basic.altitude,
        speed_kmh = f64::from(basic.speed) / 10.0,
        bearing = basic.bearing,
        positioning = basic.status.positioning(),
        in_out_area_alarm = basic.alarm.in_out_area(),
        time = %basic.time,
        "location report"
    );
    if let Some(body) = params.parse.location_extensions.get(&ext_id::ACCESS_AREA_ALARM) {
        if let Ok((kind, area_id, direction)) = parse_access_area_alarm(body) {
            tracing::info!(client_id, kind, area_id, direction, "access-area alarm detail");
        }
    }
}

fn log_terminal_params(client_id: u64, params: &SessionParams) {
    for (id, value) in &params.parse.terminal_params {
        tracing::info!(client_id, id = format_args!("{id:#010x}"), ?value, "terminal parameter");
    }
}

/// Drive one upgrade transfer while the service loop is excluded.
async fn run_upgrade(
    shared: &Shared,
    client: &ClientHandle,
    kind: u8,
    manufacturer_id: &[u8],
    version: &str,
    file: &[u8],
) -> Result<(), PlatformError> {
    let mut session = client.lock().await;
    session.params.upgrade.kind = kind;
    session.params.upgrade.manufacturer_id = manufacturer_id.to_vec();
    session.params.upgrade.version = version.to_owned();

    // Body limit minus the fixed 0x8108 prefix and the version string.
    let max_fragment = 1023 - 11 - version.len();

    if file.len() > max_fragment {
        let chunks: Vec<&[u8]> = file.chunks(max_fragment).collect();
        session.params.msg_head.attr.set_packet(true);
        session.params.msg_head.total_packets = chunks.len() as u16;
        tracing::info!(fragments = chunks.len(), bytes = file.len(), "segmented upgrade start");

        let mut sent_frames = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            session.params.msg_head.packet_seq = (index + 1) as u16;
            session.params.upgrade.data = chunk.to_vec();
            let wire =
                match encode_next(&shared.packager, &mut session.params, msg_id::TERMINAL_UPGRADE)
                {
                    Ok(wire) => wire,
                    Err(error) => {
                        reset_packet_fields(&mut session.params);
                        return Err(error.into());
                    },
                };
            sent_frames.push(wire.clone());

            if let Err(error) = session.stream.write_all(&wire).await {
                reset_packet_fields(&mut session.params);
                return Err(error.into());
            }
            if let Err(error) = await_upgrade_ack(shared, &mut session, &sent_frames).await {
                reset_packet_fields(&mut session.params);
                return Err(error);
            }
        }
        reset_packet_fields(&mut session.params);
    } else {
        session.params.upgrade.data = file.to_vec();
        let wire = encode_next(&shared.packager, &mut session.params, msg_id::TERMINAL_UPGRADE)?;
        session.stream.write_all(&wire).await?;
        let sent = vec![wire];
        await_upgrade_ack(shared, &mut session, &sent).await?;
    }

    tracing::info!("upgrade package delivered");
    Ok(())
}

fn reset_packet_fields(params: &mut SessionParams) {
    params.msg_head.attr.set_packet(false);
    params.msg_head.total_packets = 0;
    params.msg_head.packet_seq = 0;
}

/// Wait for the terminal's acknowledgement of an upgrade fragment.
///
/// A `0x8003` fill-packet request arriving instead triggers verbatim
/// retransmission of the stored fragments; unrelated traffic keeps being
/// acknowledged so the terminal does not stall mid-upgrade.
async fn await_upgrade_ack(
    shared: &Shared,
    session: &mut ClientSession,
    sent_frames: &[Vec<u8>],
) -> Result<(), PlatformError> {
    let deadline = Instant::now() + UPGRADE_ACK_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(PlatformError::Timeout {
                operation: "upgrade acknowledgement",
                elapsed: UPGRADE_ACK_TIMEOUT,
            })?;

        let wire =
            read_frame(&mut session.stream, &mut session.splitter, remaining, "upgrade ack").await?;
        let msg = match shared.parser.decode(&wire, &mut session.params) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(%error, "dropping undecodable frame during upgrade");
                continue;
            },
        };

        match msg {
            msg_id::TERMINAL_GENERAL_RESPOND
                if session.params.parse.respond_msg_id == msg_id::TERMINAL_UPGRADE =>
            {
                let result = session.params.parse.respond_result;
                if result == general_result::SUCCESS {
                    return Ok(());
                }
                return Err(PlatformError::UpgradeRejected { result });
            },
            msg_id::FILL_PACKET_REQUEST => {
                let requested = session.params.parse.fill_packet.packet_ids.clone();
                tracing::info!(?requested, "retransmitting upgrade fragments");
                for seq in requested {
                    match sent_frames.get(usize::from(seq).wrapping_sub(1)) {
                        Some(frame) => session.stream.write_all(frame).await?,
                        None => {
                            tracing::warn!(seq, "fill-packet request for an unsent fragment");
                        },
                    }
                }
            },
            other if !is_respond_only(other) => {
                // Keep unrelated traffic acknowledged mid-upgrade.
                session.params.respond_result = general_result::SUCCESS;
                let wire = encode_next(
                    &shared.packager,
                    &mut session.params,
                    msg_id::PLATFORM_GENERAL_RESPOND,
                )?;
                session.stream.write_all(&wire).await?;
            },
            _ => {},
        }
    }
}

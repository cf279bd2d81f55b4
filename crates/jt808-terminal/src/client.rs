//! Terminal session: connect, register, authenticate, then run the
//! periodic reporter and the command dispatcher side by side.
//!
//! # State machine
//!
//! ```text
//! ┌──────┐ new() ┌────────────┐ connect() ┌───────────┐
//! │ Init │──────>│ Configured │──────────>│ Connected │
//! └──────┘       └────────────┘           └───────────┘
//!     ▲                                        │ authenticate()
//!     │ stop() / peer close / I/O error        ▼
//! ┌─────────┐            run()           ┌───────────────┐
//! │ Running │<──────────────────────────│ Authenticated │
//! └─────────┘                            └───────────────┘
//! ```
//!
//! Any handshake failure closes the transport and drops back to `Init`.
//!
//! While running, two tasks cooperate: the sender drains the outbound
//! queues and drives the location-report and heartbeat timers on a 10 ms
//! quantum; the receiver reads frames, dispatches by message id and
//! enqueues the responses. Both observe a shared running flag, so
//! [`Terminal::stop`] or a transport failure winds the session down.

use std::{
    collections::BTreeSet,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use jt808_proto::{
    FillPacket, FrameSplitter, LatLon, LocationBasic, MultimediaUpload, Packager, Parser,
    PolygonArea, PolygonAreaSet, ProtocolError, RegisterInfo, SessionParams, TerminalParams,
    is_respond_only,
    location::{area_direction, area_kind, encode_access_area_alarm, ext_id},
    messages::{general_result, plate_color, register_result, upgrade_result},
    msg_id, params as term_params,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    task::JoinHandle,
    time::{sleep, timeout},
};

use crate::{
    error::TerminalError,
    geofence::{AreaStore, GeofenceEvent},
    queue::BoundedQueue,
};

/// Deadline for each register/authenticate respond.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sender task quantum.
const QUANTUM: Duration = Duration::from_millis(10);

/// Per-call read budget of the receiver task, keeps it cancellable.
const READ_BUDGET: Duration = Duration::from_millis(100);

/// Bound of the general outbound queue.
const GENERAL_QUEUE_CAP: usize = 100;

/// Bound of the externally generated location-report queue.
const LOCATION_QUEUE_CAP: usize = 10_000;

/// How long to wait for missing fragments after a fill-packet request.
const FILL_PACKET_WAIT: Duration = Duration::from_secs(30);

/// Immediate-report flag: alarm bits changed.
const FLAG_ALARM: u8 = 0b01;

/// Immediate-report flag: status bits changed.
const FLAG_STATE: u8 = 0b10;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Not configured or torn down.
    Init = 0,
    /// Configuration installed, no transport yet.
    Configured = 1,
    /// TCP connected, not yet authenticated.
    Connected = 2,
    /// Register/authenticate handshake complete.
    Authenticated = 3,
    /// Sender and receiver tasks are live.
    Running = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Configured,
            2 => Self::Connected,
            3 => Self::Authenticated,
            4 => Self::Running,
            _ => Self::Init,
        }
    }
}

/// Terminal-side configuration.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Platform endpoint, `ip:port`.
    pub remote_addr: String,
    /// Terminal phone number, up to twelve decimal digits.
    pub phone: String,
    /// Registration record sent in `0x0100`.
    pub register_info: RegisterInfo,
    /// Location report period.
    pub report_interval: Duration,
    /// Heartbeat period used when terminal parameter `0x0001` is absent.
    pub heartbeat_interval: Duration,
    /// Suppress the periodic encoder; the host calls
    /// [`Terminal::generate_location_report_now`] on its own schedule.
    pub external_generate: bool,
    /// Upper bound on an unescaped body fragment during segmentation.
    pub max_fragment: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            remote_addr: "127.0.0.1:8888".to_owned(),
            phone: "13395279527".to_owned(),
            register_info: RegisterInfo {
                province_id: 0x002C,
                city_id: 0x012C,
                manufacturer_id: b"SKOEM".to_vec(),
                model: b"SK9151".to_vec(),
                terminal_id: b"000001".to_vec(),
                plate_color: plate_color::BLUE,
                plate_number: "\u{7ca4}B99999".to_owned(),
            },
            report_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(60),
            external_generate: false,
            // 1023-byte body limit minus the fixed 0x0801 prefix.
            max_fragment: 1023 - 36,
        }
    }
}

/// Host callbacks, each a single slot set once.
#[derive(Default)]
struct Callbacks {
    params_updated: Option<Box<dyn Fn() + Send + Sync>>,
    area_updated: Option<Box<dyn Fn() + Send + Sync>>,
    upgrade: Option<Box<dyn Fn(u8, &[u8]) + Send + Sync>>,
}

/// Reassembly state of a segmented `0x8108` download.
struct UpgradeReassembly {
    kind: u8,
    slot_size: usize,
    total: usize,
    received: Vec<bool>,
    buf: Vec<u8>,
    last_len: Option<usize>,
    first_flow: u16,
    /// Wait bound, armed at creation and refreshed by every accepted
    /// fragment. A lost tail fragment therefore still trips it.
    deadline: Instant,
    /// Whether a fill-packet request was already issued for this download.
    fill_requested: bool,
}

impl UpgradeReassembly {
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

/// State shared between the host handle and the two session tasks.
struct Shared {
    config: TerminalConfig,
    packager: Packager,
    parser: Parser,
    params: Mutex<SessionParams>,
    areas: Mutex<AreaStore>,
    callbacks: Mutex<Callbacks>,
    general_queue: BoundedQueue<Vec<u8>>,
    location_queue: BoundedQueue<Vec<u8>>,
    running: AtomicBool,
    state: AtomicU8,
    report_now: AtomicU8,
    report_interval_ms: AtomicU64,
    external_generate: AtomicBool,
    /// Flow numbers of location frames that carried the in/out-area alarm
    /// bit, awaiting the platform's acknowledgement of any of them.
    alarmed_flows: Mutex<BTreeSet<u16>>,
    upgrade_buf: Mutex<Option<UpgradeReassembly>>,
    /// Frames of the most recent segmented multimedia upload, kept for
    /// `0x8800` retransmission requests.
    media_frames: Mutex<Vec<Vec<u8>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Encode a message from the current snapshot and advance the flow number.
///
/// The flow number increments exactly once per successfully encoded frame;
/// callers already hold the session mutex, so concurrent encoders still
/// observe a monotone counter.
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

/// Encode into the general queue, logging instead of propagating; a bad
/// respond must not take down the receiver.
fn enqueue_message(shared: &Shared, params: &mut SessionParams, msg_id: u16) {
    match encode_next(&shared.packager, params, msg_id) {
        Ok(wire) => {
            if shared.general_queue.push(wire) {
                tracing::warn!(msg_id, "general queue overflow, dropped oldest frame");
            }
        },
        Err(error) => tracing::warn!(msg_id, %error, "failed to encode queued message"),
    }
}

/// Terminal-side JT/T 808 agent.
pub struct Terminal {
    shared: Arc<Shared>,
    read: Option<(OwnedReadHalf, FrameSplitter)>,
    write: Option<OwnedWriteHalf>,
    tasks: Vec<JoinHandle<()>>,
}

impl Terminal {
    /// Create a configured terminal with the stock codec tables.
    #[must_use]
    pub fn new(config: TerminalConfig) -> Self {
        Self::with_codec(Packager::new(), Parser::new(), config)
    }

    /// Create a terminal with custom codec tables.
    ///
    /// This is the extension point for vendor messages: append or override
    /// handlers on the tables before handing them in.
    #[must_use]
    pub fn with_codec(packager: Packager, parser: Parser, config: TerminalConfig) -> Self {
        let mut params = SessionParams::with_phone(&config.phone);
        params.register_info = config.register_info.clone();

        let shared = Shared {
            report_interval_ms: AtomicU64::new(config.report_interval.as_millis() as u64),
            external_generate: AtomicBool::new(config.external_generate),
            config,
            packager,
            parser,
            params: Mutex::new(params),
            areas: Mutex::new(AreaStore::new()),
            callbacks: Mutex::new(Callbacks::default()),
            general_queue: BoundedQueue::new(GENERAL_QUEUE_CAP),
            location_queue: BoundedQueue::new(LOCATION_QUEUE_CAP),
            running: AtomicBool::new(false),
            state: AtomicU8::new(SessionState::Configured as u8),
            report_now: AtomicU8::new(0),
            alarmed_flows: Mutex::new(BTreeSet::new()),
            upgrade_buf: Mutex::new(None),
            media_frames: Mutex::new(Vec::new()),
        };

        Self { shared: Arc::new(shared), read: None, write: None, tasks: Vec::new() }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Whether the sender/receiver tasks are live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn set_state(&self, state: SessionState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    /// Install the terminal-parameter-updated callback.
    pub fn on_terminal_params_updated<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.shared.callbacks).params_updated = Some(Box::new(callback));
    }

    /// Install the polygon-area-updated callback.
    pub fn on_polygon_area_updated<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.shared.callbacks).area_updated = Some(Box::new(callback));
    }

    /// Install the upgrade callback, handed the reassembled package.
    pub fn on_upgrade<F>(&self, callback: F)
    where
        F: Fn(u8, &[u8]) + Send + Sync + 'static,
    {
        lock(&self.shared.callbacks).upgrade = Some(Box::new(callback));
    }

    /// Connect to the configured platform endpoint.
    ///
    /// # Errors
    ///
    /// - `TerminalError::InvalidState` unless `Init` or `Configured`
    /// - `TerminalError::Transport` on connect failure (state falls back
    ///   to `Init`)
    pub async fn connect(&mut self) -> Result<(), TerminalError> {
        let state = self.state();
        if !matches!(state, SessionState::Init | SessionState::Configured) {
            return Err(TerminalError::InvalidState { state, operation: "connect" });
        }

        match TcpStream::connect(&self.shared.config.remote_addr).await {
            Ok(stream) => {
                if let Err(error) = stream.set_nodelay(true) {
                    tracing::debug!(%error, "failed to set TCP_NODELAY");
                }
                let (read, write) = stream.into_split();
                self.read = Some((read, FrameSplitter::new()));
                self.write = Some(write);
                self.set_state(SessionState::Connected);
                tracing::info!(remote = %self.shared.config.remote_addr, "connected to platform");
                Ok(())
            },
            Err(error) => {
                self.set_state(SessionState::Init);
                Err(TerminalError::Transport(error))
            },
        }
    }

    /// Run the register/authenticate handshake.
    ///
    /// Sends `0x0100`, expects an accepting `0x8100` within five seconds,
    /// sends `0x0102` with the received auth code and expects a successful
    /// `0x8001` within five seconds. Any failure closes the transport and
    /// drops the session back to `Init`.
    pub async fn authenticate(&mut self) -> Result<(), TerminalError> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(TerminalError::InvalidState { state, operation: "authenticate" });
        }

        match self.run_handshake().await {
            Ok(()) => {
                self.set_state(SessionState::Authenticated);
                tracing::info!("registered and authenticated");
                Ok(())
            },
            Err(error) => {
                self.read = None;
                self.write = None;
                self.set_state(SessionState::Init);
                Err(error)
            },
        }
    }

    async fn run_handshake(&mut self) -> Result<(), TerminalError> {
        self.send_now(msg_id::TERMINAL_REGISTER).await?;

        let msg = self.read_and_decode("register", HANDSHAKE_TIMEOUT).await?;
        if msg != msg_id::REGISTER_RESPOND {
            return Err(TerminalError::UnexpectedRespond { msg_id: msg, operation: "register" });
        }
        {
            let params = lock(&self.shared.params);
            let result = params.parse.respond_result;
            let has_code = !params.parse.auth_code.is_empty();
            let accepted = result == register_result::SUCCESS
                || (result == register_result::TERMINAL_REGISTERED && has_code);
            if !accepted || !has_code {
                return Err(TerminalError::RegisterRejected { result });
            }
        }

        self.send_now(msg_id::TERMINAL_AUTHENTICATION).await?;

        let msg = self.read_and_decode("authenticate", HANDSHAKE_TIMEOUT).await?;
        if msg != msg_id::PLATFORM_GENERAL_RESPOND {
            return Err(TerminalError::UnexpectedRespond { msg_id: msg, operation: "authenticate" });
        }
        let params = lock(&self.shared.params);
        if params.parse.respond_msg_id != msg_id::TERMINAL_AUTHENTICATION
            || params.parse.respond_result != general_result::SUCCESS
        {
            return Err(TerminalError::AuthRejected { result: params.parse.respond_result });
        }
        Ok(())
    }

    /// Encode and transmit one message immediately (handshake path).
    async fn send_now(&mut self, msg_id: u16) -> Result<(), TerminalError> {
        let wire = {
            let mut params = lock(&self.shared.params);
            encode_next(&self.shared.packager, &mut params, msg_id)?
        };
        let write = self.write.as_mut().ok_or(TerminalError::InvalidState {
            state: SessionState::Init,
            operation: "send",
        })?;
        write.write_all(&wire).await?;
        Ok(())
    }

    /// Read one frame within `budget` and decode it into the session.
    async fn read_and_decode(
        &mut self,
        operation: &'static str,
        budget: Duration,
    ) -> Result<u16, TerminalError> {
        let deadline = Instant::now() + budget;
        let (read, splitter) = self.read.as_mut().ok_or(TerminalError::InvalidState {
            state: SessionState::Init,
            operation: "read",
        })?;

        let mut buf = [0u8; 4096];
        let wire = loop {
            if let Some(frame) = splitter.next_frame() {
                break frame;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
            else {
                return Err(TerminalError::Timeout { operation, elapsed: budget });
            };
            match timeout(remaining, read.read(&mut buf)).await {
                Err(_) => return Err(TerminalError::Timeout { operation, elapsed: budget }),
                Ok(Ok(0)) => {
                    return Err(TerminalError::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed during handshake",
                    )));
                },
                Ok(Ok(n)) => splitter.extend(&buf[..n]),
                Ok(Err(error)) => return Err(TerminalError::Transport(error)),
            }
        };

        let mut params = lock(&self.shared.params);
        Ok(self.shared.parser.decode(&wire, &mut params)?)
    }

    /// Start the sender and receiver tasks. Must be called on a Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// - `TerminalError::InvalidState` unless `Authenticated`
    pub fn run(&mut self) -> Result<(), TerminalError> {
        let state = self.state();
        if state != SessionState::Authenticated {
            return Err(TerminalError::InvalidState { state, operation: "run" });
        }
        let Some((read, splitter)) = self.read.take() else {
            return Err(TerminalError::InvalidState { state, operation: "run" });
        };
        let Some(write) = self.write.take() else {
            return Err(TerminalError::InvalidState { state, operation: "run" });
        };

        self.shared.running.store(true, Ordering::Release);
        self.set_state(SessionState::Running);
        self.tasks.push(tokio::spawn(sender_task(Arc::clone(&self.shared), write)));
        self.tasks.push(tokio::spawn(receiver_task(Arc::clone(&self.shared), read, splitter)));
        Ok(())
    }

    /// Stop the session and wait for both tasks to wind down.
    pub async fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        for task in self.tasks.drain(..) {
            if let Err(error) = task.await {
                tracing::debug!(%error, "session task aborted");
            }
        }
        self.read = None;
        self.write = None;
        self.set_state(SessionState::Init);
    }

    /// Enqueue a terminal logout (`0x0003`).
    pub fn logout(&self) {
        let mut params = lock(&self.shared.params);
        enqueue_message(&self.shared, &mut params, msg_id::TERMINAL_LOGOUT);
    }

    /// Install a fresh location fix and evaluate the geofences.
    ///
    /// Units are degrees, meters, km/h and compass degrees; the timestamp
    /// is twelve digits `YYMMDDhhmmss`. Crossing an alarmed area boundary
    /// sets the in/out-area alarm bit, installs the access-area extension
    /// and forces an immediate report.
    pub fn update_location(
        &self,
        latitude: f64,
        longitude: f64,
        altitude: f64,
        speed_kmh: f64,
        bearing: f64,
        timestamp: &str,
    ) {
        let mut params = lock(&self.shared.params);
        params.location.latitude = (latitude * 1e6).round() as u32;
        params.location.longitude = (longitude * 1e6).round() as u32;
        params.location.altitude = altitude.round() as u16;
        params.location.speed = (speed_kmh * 10.0).round() as u16;
        params.location.bearing = bearing.round() as u16;
        params.location.time = timestamp.to_owned();

        let events = lock(&self.shared.areas).evaluate(LatLon::new(latitude, longitude));
        for event in events {
            let (area_id, direction, alarm) = match event {
                GeofenceEvent::Entered { area_id, alarm_to_server } => {
                    (area_id, area_direction::ENTER, alarm_to_server)
                },
                GeofenceEvent::Left { area_id, alarm_to_server } => {
                    (area_id, area_direction::LEAVE, alarm_to_server)
                },
            };
            if !alarm {
                continue;
            }
            tracing::debug!(area_id, direction, "geofence boundary crossed");
            params.location.alarm.set_in_out_area(true);
            params.location_extensions.insert(
                ext_id::ACCESS_AREA_ALARM,
                encode_access_area_alarm(area_kind::POLYGON, area_id, direction),
            );
            self.shared.report_now.fetch_or(FLAG_ALARM, Ordering::AcqRel);
        }
    }

    /// Replace the whole location basic record.
    pub fn set_location(&self, basic: LocationBasic) {
        lock(&self.shared.params).location = basic;
    }

    /// Current location basic record.
    #[must_use]
    pub fn location(&self) -> LocationBasic {
        lock(&self.shared.params).location.clone()
    }

    /// Replace the alarm word and force an immediate report.
    pub fn set_alarm(&self, raw: u32) {
        lock(&self.shared.params).location.alarm = jt808_proto::AlarmFlags::from_raw(raw);
        self.shared.report_now.fetch_or(FLAG_ALARM, Ordering::AcqRel);
    }

    /// Set or clear the in/out-area alarm bit and force an immediate
    /// report.
    pub fn set_in_out_area_alarm(&self, on: bool) {
        lock(&self.shared.params).location.alarm.set_in_out_area(on);
        self.shared.report_now.fetch_or(FLAG_ALARM, Ordering::AcqRel);
    }

    /// Replace the status word and force an immediate report.
    pub fn set_status(&self, raw: u32) {
        lock(&self.shared.params).location.status = jt808_proto::StatusFlags::from_raw(raw);
        self.shared.report_now.fetch_or(FLAG_STATE, Ordering::AcqRel);
    }

    /// Install a location extension item.
    pub fn set_extension(&self, id: u8, value: Vec<u8>) {
        lock(&self.shared.params).location_extensions.insert(id, value);
    }

    /// Snapshot of the terminal parameter store.
    #[must_use]
    pub fn terminal_params(&self) -> TerminalParams {
        lock(&self.shared.params).terminal_params.clone()
    }

    /// Install one terminal parameter.
    pub fn set_terminal_param(&self, id: u32, value: Vec<u8>) {
        lock(&self.shared.params).terminal_params.insert(id, value);
    }

    /// Store the heartbeat interval parameter (`0x0001`).
    pub fn set_heartbeat_interval(&self, secs: u32) {
        let mut params = lock(&self.shared.params);
        term_params::set_heartbeat_interval(&mut params.terminal_params, secs);
    }

    /// Adjust the report interval, optionally handing report generation to
    /// the host.
    pub fn set_report_interval(&self, interval: Duration, external_generate: bool) {
        self.shared.report_interval_ms.store(interval.as_millis() as u64, Ordering::Release);
        self.shared.external_generate.store(external_generate, Ordering::Release);
    }

    /// Encode a location report from the current snapshot and queue it.
    ///
    /// This is the snapshot-at-tick path used with external generation.
    ///
    /// # Errors
    ///
    /// - `TerminalError::Codec` if the snapshot does not encode
    pub fn generate_location_report_now(&self) -> Result<(), TerminalError> {
        let mut params = lock(&self.shared.params);
        let flow = params.msg_head.flow_num;
        let alarmed = params.location.alarm.in_out_area();
        let wire = encode_next(&self.shared.packager, &mut params, msg_id::LOCATION_REPORT)?;
        drop(params);

        if alarmed {
            record_alarmed_flow(&self.shared, flow);
        }
        if self.shared.location_queue.push(wire) {
            tracing::warn!("location queue overflow, dropped oldest report");
        }
        Ok(())
    }

    /// Report an upgrade outcome (`0x0108`).
    pub fn upgrade_result_report(&self, result: u8) {
        let mut params = lock(&self.shared.params);
        params.upgrade.result = result;
        enqueue_message(&self.shared, &mut params, msg_id::UPGRADE_RESULT_REPORT);
    }

    /// Queue a multimedia upload (`0x0801`), segmenting when the payload
    /// exceeds the configured fragment bound.
    ///
    /// The encoded fragments are retained so a platform `0x8800` can ask
    /// for selective retransmission.
    ///
    /// # Errors
    ///
    /// - `TerminalError::Codec` if a fragment does not encode
    pub fn multimedia_upload(&self, media: MultimediaUpload) -> Result<(), TerminalError> {
        let max = self.shared.config.max_fragment;
        let mut params = lock(&self.shared.params);
        let mut frames = Vec::new();

        if media.data.len() > max {
            let chunks: Vec<&[u8]> = media.data.chunks(max).collect();
            params.msg_head.attr.set_packet(true);
            params.msg_head.total_packets = chunks.len() as u16;
            for (index, chunk) in chunks.iter().enumerate() {
                params.msg_head.packet_seq = (index + 1) as u16;
                params.multimedia = MultimediaUpload { data: chunk.to_vec(), ..media.clone() };
                let result = encode_next(&self.shared.packager, &mut params, msg_id::MULTIMEDIA_UPLOAD);
                match result {
                    Ok(wire) => frames.push(wire),
                    Err(error) => {
                        params.msg_head.attr.set_packet(false);
                        params.msg_head.total_packets = 0;
                        params.msg_head.packet_seq = 0;
                        return Err(error.into());
                    },
                }
            }
            params.msg_head.attr.set_packet(false);
            params.msg_head.total_packets = 0;
            params.msg_head.packet_seq = 0;
        } else {
            params.multimedia = media;
            frames.push(encode_next(&self.shared.packager, &mut params, msg_id::MULTIMEDIA_UPLOAD)?);
        }
        drop(params);

        for frame in &frames {
            if self.shared.general_queue.push(frame.clone()) {
                tracing::warn!("general queue overflow, dropped oldest frame");
            }
        }
        *lock(&self.shared.media_frames) = frames;
        Ok(())
    }

    /// Add a polygon area; fails when the id exists.
    pub fn add_polygon_area(&self, area: PolygonArea) -> bool {
        lock(&self.shared.areas).add(area)
    }

    /// Insert or replace a polygon area.
    pub fn update_polygon_area(&self, area: PolygonArea) {
        lock(&self.shared.areas).upsert(area);
    }

    /// Delete a polygon area by id.
    pub fn delete_polygon_area(&self, id: u32) -> bool {
        lock(&self.shared.areas).remove(id)
    }

    /// Delete the listed areas; an empty list deletes everything.
    pub fn delete_polygon_areas(&self, ids: &[u32]) {
        lock(&self.shared.areas).remove_many(ids);
    }

    /// Snapshot of the stored polygon areas.
    #[must_use]
    pub fn polygon_areas(&self) -> PolygonAreaSet {
        lock(&self.shared.areas).areas()
    }
}

/// Sender side of the running loop.
///
/// Every 10 ms quantum: drain the general queue, drain the externally
/// generated location queue, then drive the report and heartbeat timers.
/// Any transmitted frame resets the heartbeat timer; a transmitted
/// location report also resets the report timer and clears the
/// immediate-report flags.
async fn sender_task(shared: Arc<Shared>, mut write: OwnedWriteHalf) {
    let heartbeat = {
        let params = lock(&shared.params);
        term_params::heartbeat_interval(&params.terminal_params)
            .filter(|&secs| secs > 0)
            .map_or(shared.config.heartbeat_interval, |secs| Duration::from_secs(u64::from(secs)))
    };

    let mut next_report = Instant::now() + report_interval(&shared);
    let mut next_heartbeat = Instant::now() + heartbeat;
    let mut first_report = true;

    'session: while shared.running.load(Ordering::Acquire) {
        while let Some(frame) = shared.general_queue.pop() {
            if let Err(error) = write.write_all(&frame).await {
                tracing::warn!(%error, "transmit failed, terminating session");
                break 'session;
            }
            next_heartbeat = Instant::now() + heartbeat;
        }

        while let Some(frame) = shared.location_queue.pop() {
            if let Err(error) = write.write_all(&frame).await {
                tracing::warn!(%error, "transmit failed, terminating session");
                break 'session;
            }
            let now = Instant::now();
            next_report = now + report_interval(&shared);
            next_heartbeat = now + heartbeat;
            shared.report_now.store(0, Ordering::Release);
        }

        let now = Instant::now();
        let immediate = shared.report_now.load(Ordering::Acquire) != 0;
        let external = shared.external_generate.load(Ordering::Acquire);

        if !external && (now >= next_report || immediate) {
            let snapshot = {
                let mut params = lock(&shared.params);
                let positioned = params.location.status.positioning();
                if positioned || !first_report {
                    let flow = params.msg_head.flow_num;
                    let alarmed = params.location.alarm.in_out_area();
                    match encode_next(&shared.packager, &mut params, msg_id::LOCATION_REPORT) {
                        Ok(wire) => Some((wire, flow, alarmed)),
                        Err(error) => {
                            tracing::warn!(%error, "failed to encode location report");
                            None
                        },
                    }
                } else {
                    None
                }
            };

            if let Some((wire, flow, alarmed)) = snapshot {
                if let Err(error) = write.write_all(&wire).await {
                    tracing::warn!(%error, "transmit failed, terminating session");
                    break 'session;
                }
                if alarmed {
                    record_alarmed_flow(&shared, flow);
                }
                shared.report_now.store(0, Ordering::Release);
                first_report = false;
                let now = Instant::now();
                next_report = now + report_interval(&shared);
                next_heartbeat = now + heartbeat;
            } else if first_report && now >= next_heartbeat {
                // Waiting for the first fix: heartbeat instead of reporting.
                if send_heartbeat(&shared, &mut write).await.is_err() {
                    break 'session;
                }
                next_heartbeat = Instant::now() + heartbeat;
            }
        } else if now >= next_heartbeat {
            if send_heartbeat(&shared, &mut write).await.is_err() {
                break 'session;
            }
            next_heartbeat = Instant::now() + heartbeat;
        }

        check_upgrade_deadline(&shared);
        sleep(QUANTUM).await;
    }

    shared.running.store(false, Ordering::Release);
    shared.state.store(SessionState::Init as u8, Ordering::Release);
}

fn report_interval(shared: &Shared) -> Duration {
    Duration::from_millis(shared.report_interval_ms.load(Ordering::Acquire))
}

/// Remember a location frame that carried the in/out-area alarm bit.
///
/// Bounded: an unacknowledged backlog this deep means the platform is not
/// acking at all, so older entries are of no further use.
fn record_alarmed_flow(shared: &Shared, flow: u16) {
    let mut alarmed = lock(&shared.alarmed_flows);
    if alarmed.len() > 64 {
        alarmed.clear();
    }
    alarmed.insert(flow);
}

async fn send_heartbeat(shared: &Shared, write: &mut OwnedWriteHalf) -> Result<(), ()> {
    let wire = {
        let mut params = lock(&shared.params);
        match encode_next(&shared.packager, &mut params, msg_id::TERMINAL_HEARTBEAT) {
            Ok(wire) => wire,
            Err(error) => {
                tracing::warn!(%error, "failed to encode heartbeat");
                return Ok(());
            },
        }
    };
    write.write_all(&wire).await.map_err(|error| {
        tracing::warn!(%error, "transmit failed, terminating session");
    })
}

/// Outcome of an expired upgrade-reassembly wait.
enum UpgradeExpiry {
    /// No fill-packet request went out yet; ask for the missing fragments.
    RequestFill {
        first_flow: u16,
        missing: Vec<u16>,
    },
    /// Already asked once; give up and report the failure.
    Abandon {
        kind: u8,
    },
}

/// Police the segmented-upgrade wait bound.
///
/// A stalled download (including one whose tail fragment never arrived)
/// first gets a fill-packet request for whatever is missing; if the
/// retransmissions do not arrive within the next wait period either, the
/// buffer is dropped and a failure result report emitted.
fn check_upgrade_deadline(shared: &Shared) {
    let expiry = {
        let mut slot = lock(&shared.upgrade_buf);
        match slot.take() {
            Some(reassembly) if Instant::now() >= reassembly.deadline => {
                if reassembly.fill_requested {
                    Some(UpgradeExpiry::Abandon { kind: reassembly.kind })
                } else {
                    let mut reassembly = reassembly;
                    reassembly.fill_requested = true;
                    reassembly.deadline = Instant::now() + FILL_PACKET_WAIT;
                    let expiry = UpgradeExpiry::RequestFill {
                        first_flow: reassembly.first_flow,
                        missing: reassembly.missing(),
                    };
                    *slot = Some(reassembly);
                    Some(expiry)
                }
            },
            other => {
                *slot = other;
                None
            },
        }
    };

    match expiry {
        Some(UpgradeExpiry::RequestFill { first_flow, missing }) => {
            tracing::info!(?missing, "upgrade stalled, requesting missing fragments");
            let mut params = lock(&shared.params);
            params.fill_packet =
                FillPacket { first_packet_flow_num: first_flow, packet_ids: missing };
            enqueue_message(shared, &mut params, msg_id::FILL_PACKET_REQUEST);
        },
        Some(UpgradeExpiry::Abandon { kind }) => {
            tracing::warn!(
                "segmented upgrade abandoned: fragments still missing after fill-packet wait"
            );
            let mut params = lock(&shared.params);
            params.upgrade.kind = kind;
            params.upgrade.result = upgrade_result::FAILURE;
            enqueue_message(shared, &mut params, msg_id::UPGRADE_RESULT_REPORT);
        },
        None => {},
    }
}

/// Receiver side of the running loop: read, split, dispatch.
async fn receiver_task(shared: Arc<Shared>, mut read: OwnedReadHalf, mut splitter: FrameSplitter) {
    let mut buf = vec![0u8; 4096];
    while shared.running.load(Ordering::Acquire) {
        match timeout(READ_BUDGET, read.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                tracing::info!("platform closed the connection");
                break;
            },
            Ok(Ok(n)) => {
                splitter.extend(&buf[..n]);
                while let Some(frame) = splitter.next_frame() {
                    dispatch(&shared, &frame);
                }
            },
            Ok(Err(error)) => {
                tracing::warn!(%error, "read failed, terminating session");
                break;
            },
        }
    }
    shared.running.store(false, Ordering::Release);
    shared.state.store(SessionState::Init as u8, Ordering::Release);
}

/// Dispatch one inbound frame.
///
/// Decode errors drop the frame and keep the session alive. Responses are
/// encoded here and handed to the sender through the general queue;
/// callbacks fire after the session mutex is released.
fn dispatch(shared: &Shared, wire: &[u8]) {
    let mut fire_params_updated = false;
    let mut fire_area_updated = false;
    let mut fire_upgrade: Option<(u8, Vec<u8>)> = None;

    {
        let mut params = lock(&shared.params);
        let msg = match shared.parser.decode(wire, &mut params) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(%error, "dropping undecodable frame");
                return;
            },
        };

        match msg {
            msg_id::SET_TERMINAL_PARAMS => {
                let incoming = params.parse.terminal_params.clone();
                for (id, value) in incoming {
                    params.terminal_params.insert(id, value);
                }
                params.respond_result = general_result::SUCCESS;
                enqueue_message(shared, &mut params, msg_id::TERMINAL_GENERAL_RESPOND);
                fire_params_updated = true;
            },
            msg_id::GET_TERMINAL_PARAMS => {
                params.terminal_param_ids.clear();
                enqueue_message(shared, &mut params, msg_id::GET_TERMINAL_PARAMS_RESPOND);
            },
            msg_id::GET_SPECIFIC_TERMINAL_PARAMS => {
                params.terminal_param_ids = params.parse.terminal_param_ids.clone();
                enqueue_message(shared, &mut params, msg_id::GET_TERMINAL_PARAMS_RESPOND);
            },
            msg_id::SET_POLYGON_AREA => {
                let area = params.parse.polygon_area.clone();
                lock(&shared.areas).upsert(area);
                params.respond_result = general_result::SUCCESS;
                enqueue_message(shared, &mut params, msg_id::TERMINAL_GENERAL_RESPOND);
                fire_area_updated = true;
            },
            msg_id::DELETE_POLYGON_AREA => {
                let ids = params.parse.polygon_area_ids.clone();
                lock(&shared.areas).remove_many(&ids);
                params.respond_result = general_result::SUCCESS;
                enqueue_message(shared, &mut params, msg_id::TERMINAL_GENERAL_RESPOND);
                fire_area_updated = true;
            },
            msg_id::TERMINAL_UPGRADE => {
                fire_upgrade = handle_upgrade(shared, &mut params);
            },
            msg_id::GET_LOCATION => {
                enqueue_message(shared, &mut params, msg_id::GET_LOCATION_RESPOND);
            },
            msg_id::PLATFORM_GENERAL_RESPOND => {
                if params.parse.respond_msg_id == msg_id::LOCATION_REPORT {
                    let mut alarmed = lock(&shared.alarmed_flows);
                    if alarmed.remove(&params.parse.respond_flow_num) {
                        params.location.alarm.set_in_out_area(false);
                        alarmed.clear();
                        tracing::debug!("in/out-area alarm acknowledged by platform");
                    }
                }
            },
            msg_id::MULTIMEDIA_UPLOAD_RESPOND => {
                retransmit_media(shared, &params.parse.multimedia_ack.retransmit_ids.clone());
                params.respond_result = general_result::SUCCESS;
                enqueue_message(shared, &mut params, msg_id::TERMINAL_GENERAL_RESPOND);
            },
            msg_id::FILL_PACKET_REQUEST => {
                retransmit_media(shared, &params.parse.fill_packet.packet_ids.clone());
                params.respond_result = general_result::SUCCESS;
                enqueue_message(shared, &mut params, msg_id::TERMINAL_GENERAL_RESPOND);
            },
            other if !is_respond_only(other) => {
                params.respond_result = general_result::SUCCESS;
                enqueue_message(shared, &mut params, msg_id::TERMINAL_GENERAL_RESPOND);
            },
            _ => {},
        }
    }

    let callbacks = lock(&shared.callbacks);
    if fire_params_updated {
        if let Some(callback) = callbacks.params_updated.as_ref() {
            callback();
        }
    }
    if fire_area_updated {
        if let Some(callback) = callbacks.area_updated.as_ref() {
            callback();
        }
    }
    if let Some((kind, data)) = fire_upgrade {
        if let Some(callback) = callbacks.upgrade.as_ref() {
            callback(kind, &data);
        }
    }
}

/// Re-enqueue stored multimedia fragments the platform asked for again.
fn retransmit_media(shared: &Shared, packet_ids: &[u16]) {
    if packet_ids.is_empty() {
        return;
    }
    let frames = lock(&shared.media_frames);
    for &seq in packet_ids {
        match frames.get(usize::from(seq).wrapping_sub(1)) {
            Some(frame) => {
                if shared.general_queue.push(frame.clone()) {
                    tracing::warn!("general queue overflow, dropped oldest frame");
                }
            },
            None => tracing::warn!(seq, "retransmit requested for unknown media fragment"),
        }
    }
}

/// Handle a `0x8108` download, segmented or not.
///
/// Returns the reassembled package when the download completed, for the
/// upgrade callback.
fn handle_upgrade(shared: &Shared, params: &mut SessionParams) -> Option<(u8, Vec<u8>)> {
    let head = params.parse.msg_head.clone();
    let kind = params.parse.upgrade.kind;
    let data = params.parse.upgrade.data.clone();

    if !head.attr.is_packet() || head.total_packets <= 1 {
        params.respond_result = general_result::SUCCESS;
        enqueue_message(shared, params, msg_id::TERMINAL_GENERAL_RESPOND);
        params.upgrade.kind = kind;
        params.upgrade.result = upgrade_result::SUCCESS;
        enqueue_message(shared, params, msg_id::UPGRADE_RESULT_REPORT);
        return Some((kind, data));
    }

    let total = usize::from(head.total_packets);
    let seq = usize::from(head.packet_seq);
    if seq == 0 || seq > total {
        tracing::warn!(seq, total, "upgrade fragment sequence out of range");
        params.respond_result = general_result::BAD_MESSAGE;
        enqueue_message(shared, params, msg_id::TERMINAL_GENERAL_RESPOND);
        return None;
    }

    let mut finished = None;
    {
        let mut slot = lock(&shared.upgrade_buf);
        let restart = slot.as_ref().is_some_and(|r| r.total != total);
        if restart {
            tracing::warn!("new segmented upgrade supersedes an unfinished one");
            *slot = None;
        }
        let reassembly = slot.get_or_insert_with(|| UpgradeReassembly {
            kind,
            slot_size: data.len(),
            total,
            received: vec![false; total],
            buf: vec![0; data.len() * total],
            last_len: None,
            first_flow: head.flow_num.wrapping_sub((seq - 1) as u16),
            deadline: Instant::now() + FILL_PACKET_WAIT,
            fill_requested: false,
        });

        let offset = (seq - 1) * reassembly.slot_size;
        if offset + data.len() <= reassembly.buf.len() {
            reassembly.buf[offset..offset + data.len()].copy_from_slice(&data);
            reassembly.received[seq - 1] = true;
            // Progress extends the wait bound.
            reassembly.deadline = Instant::now() + FILL_PACKET_WAIT;
            if seq == total {
                reassembly.last_len = Some(data.len());
            }
        } else {
            tracing::warn!(seq, "upgrade fragment exceeds the reassembly buffer");
        }

        if reassembly.complete() {
            finished = slot.take().map(|r| (r.kind, r.assembled()));
        } else if seq == total && !reassembly.fill_requested {
            let missing = reassembly.missing();
            tracing::info!(?missing, "requesting retransmission of missing fragments");
            params.fill_packet = FillPacket {
                first_packet_flow_num: reassembly.first_flow,
                packet_ids: missing,
            };
            reassembly.fill_requested = true;
            enqueue_message(shared, params, msg_id::FILL_PACKET_REQUEST);
        }
    }

    params.respond_result = general_result::SUCCESS;
    enqueue_message(shared, params, msg_id::TERMINAL_GENERAL_RESPOND);

    if let Some((kind, _)) = finished {
        params.upgrade.kind = kind;
        params.upgrade.result = upgrade_result::SUCCESS;
        enqueue_message(shared, params, msg_id::UPGRADE_RESULT_REPORT);
    }
    finished
}

#[cfg(test)]
mod tests {
    use jt808_proto::AreaAttr;

    use super::*;

    fn make_terminal() -> Terminal {
        Terminal::new(TerminalConfig::default())
    }

    #[test]
    fn new_terminal_is_configured() {
        let terminal = make_terminal();
        assert_eq!(terminal.state(), SessionState::Configured);
        assert!(!terminal.is_running());
    }

    #[test]
    fn run_requires_authentication() {
        let mut terminal = make_terminal();
        assert!(matches!(
            terminal.run(),
            Err(TerminalError::InvalidState { state: SessionState::Configured, .. })
        ));
    }

    #[tokio::test]
    async fn authenticate_requires_connection() {
        let mut terminal = make_terminal();
        assert!(matches!(
            terminal.authenticate().await,
            Err(TerminalError::InvalidState { state: SessionState::Configured, .. })
        ));
    }

    #[test]
    fn update_location_converts_wire_units() {
        let terminal = make_terminal();
        terminal.update_location(22.570336, 113.937577, 54.0, 0.8, 90.0, "200702145429");

        let basic = terminal.location();
        assert_eq!(basic.latitude, 22_570_336);
        assert_eq!(basic.longitude, 113_937_577);
        assert_eq!(basic.altitude, 54);
        assert_eq!(basic.speed, 8); // 0.8 km/h -> 8 × 0.1 km/h
        assert_eq!(basic.bearing, 90);
        assert_eq!(basic.time, "200702145429");
    }

    #[test]
    fn geofence_crossing_raises_the_area_alarm() {
        let terminal = make_terminal();

        let center_lat = 22.570336;
        let center_lon = 113.937577;
        let mut attr = AreaAttr::default();
        attr.set_in_alarm_to_server(true);
        attr.set_out_alarm_to_server(true);
        let area = PolygonArea {
            id: 11,
            attr,
            vertices: vec![
                LatLon::new(center_lat - 0.001, center_lon - 0.001),
                LatLon::new(center_lat - 0.001, center_lon + 0.001),
                LatLon::new(center_lat + 0.001, center_lon + 0.001),
                LatLon::new(center_lat + 0.001, center_lon - 0.001),
            ],
            ..PolygonArea::default()
        };
        assert!(terminal.add_polygon_area(area));

        // Outside: nothing happens.
        terminal.update_location(22.6, 113.9, 0.0, 30.0, 0.0, "200702145429");
        assert!(!terminal.location().alarm.in_out_area());

        // Entering sets the bit and the extension.
        terminal.update_location(center_lat, center_lon, 0.0, 30.0, 0.0, "200702145430");
        let basic = terminal.location();
        assert!(basic.alarm.in_out_area());
        let params = lock(&terminal.shared.params);
        let extension = params.location_extensions.get(&ext_id::ACCESS_AREA_ALARM).unwrap();
        let (kind, id, direction) =
            jt808_proto::location::parse_access_area_alarm(extension).unwrap();
        assert_eq!(kind, area_kind::POLYGON);
        assert_eq!(id, 11);
        assert_eq!(direction, area_direction::ENTER);
        drop(params);

        // Leaving flips the direction.
        terminal.update_location(22.6, 113.9, 0.0, 30.0, 0.0, "200702145431");
        let params = lock(&terminal.shared.params);
        let extension = params.location_extensions.get(&ext_id::ACCESS_AREA_ALARM).unwrap();
        let (_, _, direction) = jt808_proto::location::parse_access_area_alarm(extension).unwrap();
        assert_eq!(direction, area_direction::LEAVE);
    }

    #[test]
    fn generate_now_queues_a_report_and_advances_flow() {
        let terminal = make_terminal();
        terminal.update_location(22.5, 113.9, 0.0, 60.0, 0.0, "200702145429");

        terminal.generate_location_report_now().unwrap();
        terminal.generate_location_report_now().unwrap();
        assert_eq!(terminal.shared.location_queue.len(), 2);

        let params = lock(&terminal.shared.params);
        assert_eq!(params.msg_head.flow_num, 2);
    }

    #[test]
    fn multimedia_upload_segments_large_payloads() {
        let terminal = make_terminal();
        let media = MultimediaUpload {
            media_id: 1,
            media_type: 0,
            format: 0,
            event: 0,
            channel_id: 1,
            location: vec![0; 28],
            data: vec![0x5A; 2500],
        };
        terminal.multimedia_upload(media).unwrap();

        // 2500 bytes at 987 per fragment is three frames.
        assert_eq!(terminal.shared.general_queue.len(), 3);
        assert_eq!(lock(&terminal.shared.media_frames).len(), 3);

        // The packet fields are restored afterwards.
        let params = lock(&terminal.shared.params);
        assert!(!params.msg_head.attr.is_packet());
    }

    #[test]
    fn set_status_raises_immediate_flag() {
        let terminal = make_terminal();
        assert_eq!(terminal.shared.report_now.load(Ordering::Acquire), 0);
        terminal.set_status(0b10);
        assert_eq!(terminal.shared.report_now.load(Ordering::Acquire) & FLAG_STATE, FLAG_STATE);
    }

    /// A download whose tail fragment never arrives must still hit the
    /// wait bound: one fill-packet request, then a failure report.
    #[test]
    fn stalled_upgrade_requests_fill_then_abandons() {
        let terminal = make_terminal();
        let expired = Instant::now() - Duration::from_secs(1);
        *lock(&terminal.shared.upgrade_buf) = Some(UpgradeReassembly {
            kind: 0x00,
            slot_size: 4,
            total: 3,
            received: vec![true, true, false],
            buf: vec![0; 12],
            last_len: None,
            first_flow: 7,
            deadline: expired,
            fill_requested: false,
        });

        check_upgrade_deadline(&terminal.shared);
        assert_eq!(terminal.shared.general_queue.len(), 1);
        {
            let params = lock(&terminal.shared.params);
            assert_eq!(params.fill_packet.first_packet_flow_num, 7);
            assert_eq!(params.fill_packet.packet_ids, vec![3]);
        }

        // Within the extended wait nothing further happens.
        check_upgrade_deadline(&terminal.shared);
        assert_eq!(terminal.shared.general_queue.len(), 1);

        // A second expiry abandons the download and reports failure.
        lock(&terminal.shared.upgrade_buf)
            .as_mut()
            .expect("reassembly should survive the fill request")
            .deadline = expired;
        check_upgrade_deadline(&terminal.shared);
        assert_eq!(terminal.shared.general_queue.len(), 2);
        assert!(lock(&terminal.shared.upgrade_buf).is_none());
        let params = lock(&terminal.shared.params);
        assert_eq!(params.upgrade.result, upgrade_result::FAILURE);
    }
}

//! Shore-side Iridium driver: many remote field modems multiplexed over one
//! RUDICS listening socket plus the SBD DirectIP mailbox pair.
//!
//! Per remote the driver runs a three-state call machine (idle, on call,
//! hangup). A call starts with the remote's `goby\r` greeting and is torn
//! down either by the bye handshake or by inactivity. While on call the
//! driver paces bytes against the configured bit rate, emitting zero-body
//! keepalives when a pace slot comes up empty so the remote's codec state
//! stays warm. All socket I/O runs on background tasks; their events are
//! drained inside `do_work`, which keeps every upcall on the host's thread.

pub mod common;
pub mod rudics;
pub mod sbd;

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, span, trace, warn, Level};
use uuid::Uuid;

use crate::driver::iridium::common::{
    parse_modem_message, serialize_modem_message, OnCall,
};
use crate::driver::iridium::rudics::{
    parse_rudics_packet, serialize_rudics_packet, ConnId, RudicsEvent, RudicsServer,
};
use crate::driver::iridium::sbd::{
    create_mt_message, send_mt_message, SbdMoMessage, SbdServer, IMEI_LEN, SBD_SESSION_TIMEOUT,
};
use crate::driver::transmission::{ModemTransmission, Rate, TransmissionType};
use crate::driver::{DriverEvents, RawLog};
use crate::ModemId;

/// Frame numbers wrap at the width of the wire header's frame field.
const FRAME_MASK: u32 = 0xffff;

#[derive(Clone, Debug, Deserialize)]
pub struct ImeiMapping {
    pub modem_id: ModemId,
    pub imei: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DriverConfig {
    pub modem_id: ModemId,
    pub max_frame_size: usize,
    pub target_bit_rate_bps: u32,
    /// Seconds without payload after which we offer the bye handshake.
    pub handshake_hangup_seconds: f64,
    /// Seconds without any traffic after which the call is dropped.
    pub hangup_seconds_after_empty: f64,
    pub rudics_server_port: u16,
    pub mo_sbd_server_port: u16,
    pub mt_sbd_server_address: String,
    pub mt_sbd_server_port: u16,
    #[serde(default)]
    pub modem_id_to_imei: Vec<ImeiMapping>,
    /// strftime pattern for the optional raw traffic log.
    #[serde(default)]
    pub raw_log: Option<String>,
}

impl DriverConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_size == 0 {
            anyhow::bail!("max_frame_size must be positive");
        }
        if self.target_bit_rate_bps == 0 {
            anyhow::bail!("target_bit_rate_bps must be positive");
        }
        for mapping in &self.modem_id_to_imei {
            if mapping.imei.len() != IMEI_LEN {
                anyhow::bail!(
                    "IMEI {:?} for modem id {} is not {} digits",
                    mapping.imei,
                    mapping.modem_id,
                    IMEI_LEN
                );
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RemoteNode {
    pub on_call: Option<OnCall>,
}

/// One-to-one mapping between modem ids and live RUDICS connections. An
/// entry exists exactly while the peer's `OnCall` state does.
#[derive(Default)]
struct ClientBimap {
    by_modem: FxHashMap<ModemId, ConnId>,
    by_conn: FxHashMap<ConnId, ModemId>,
}

impl ClientBimap {
    fn insert(&mut self, modem_id: ModemId, conn_id: ConnId) {
        self.by_modem.insert(modem_id, conn_id);
        self.by_conn.insert(conn_id, modem_id);
    }

    fn conn_for(&self, modem_id: ModemId) -> Option<ConnId> {
        self.by_modem.get(&modem_id).copied()
    }

    fn modem_for(&self, conn_id: ConnId) -> Option<ModemId> {
        self.by_conn.get(&conn_id).copied()
    }

    fn remove_by_conn(&mut self, conn_id: ConnId) -> Option<ModemId> {
        let modem_id = self.by_conn.remove(&conn_id)?;
        self.by_modem.remove(&modem_id);
        Some(modem_id)
    }

    fn len(&self) -> usize {
        self.by_conn.len()
    }
}

struct RudicsConnection {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    remote_endpoint: String,
    packet_failures: u32,
}

pub struct IridiumShoreDriver {
    cfg: DriverConfig,
    events: Box<dyn DriverEvents>,
    remotes: BTreeMap<ModemId, RemoteNode>,
    clients: ClientBimap,
    connections: FxHashMap<ConnId, RudicsConnection>,
    modem_id_to_imei: FxHashMap<ModemId, String>,
    pub(crate) rudics_tx: mpsc::UnboundedSender<RudicsEvent>,
    rudics_rx: mpsc::UnboundedReceiver<RudicsEvent>,
    pub(crate) sbd_tx: mpsc::UnboundedSender<SbdMoMessage>,
    sbd_rx: mpsc::UnboundedReceiver<SbdMoMessage>,
    rudics_server: Option<RudicsServer>,
    sbd_server: Option<SbdServer>,
    next_frame: u32,
    next_mt_client_id: u32,
    raw_log: Option<RawLog>,
    /// True while an event handler is on the stack; a MAC grant arriving
    /// then is deferred rather than processed recursively.
    in_upcall: bool,
    deferred_transmissions: VecDeque<ModemTransmission>,
}

impl IridiumShoreDriver {
    pub fn new(cfg: DriverConfig, events: Box<dyn DriverEvents>) -> anyhow::Result<IridiumShoreDriver> {
        cfg.validate()?;

        let raw_log = match &cfg.raw_log {
            Some(pattern) => Some(RawLog::create(pattern, Utc::now())?),
            None => None,
        };
        let modem_id_to_imei = cfg
            .modem_id_to_imei
            .iter()
            .map(|m| (m.modem_id, m.imei.clone()))
            .collect();

        let (rudics_tx, rudics_rx) = mpsc::unbounded_channel();
        let (sbd_tx, sbd_rx) = mpsc::unbounded_channel();
        Ok(IridiumShoreDriver {
            cfg,
            events,
            remotes: BTreeMap::new(),
            clients: ClientBimap::default(),
            connections: FxHashMap::default(),
            modem_id_to_imei,
            rudics_tx,
            rudics_rx,
            sbd_tx,
            sbd_rx,
            rudics_server: None,
            sbd_server: None,
            next_frame: 0,
            next_mt_client_id: 0,
            raw_log,
            in_upcall: false,
            deferred_transmissions: VecDeque::new(),
        })
    }

    /// Binds the RUDICS and SBD-MO listening sockets.
    pub async fn startup(&mut self) -> anyhow::Result<()> {
        debug!(modem_id = self.cfg.modem_id, "shore Iridium RUDICS/SBD driver starting up");
        self.rudics_server = Some(
            RudicsServer::bind(self.cfg.rudics_server_port, self.rudics_tx.clone()).await?,
        );
        self.sbd_server =
            Some(SbdServer::bind(self.cfg.mo_sbd_server_port, self.sbd_tx.clone()).await?);
        Ok(())
    }

    /// Drops every call and connection.
    pub fn shutdown(&mut self) {
        self.rudics_server = None;
        self.sbd_server = None;
        self.connections.clear();
        self.clients = ClientBimap::default();
        for remote in self.remotes.values_mut() {
            remote.on_call = None;
        }
    }

    pub fn remote(&self, modem_id: ModemId) -> Option<&RemoteNode> {
        self.remotes.get(&modem_id)
    }

    /// Port the RUDICS listener is bound to (useful with port 0 configs).
    pub fn rudics_port(&self) -> Option<u16> {
        self.rudics_server.as_ref().map(RudicsServer::local_port)
    }

    pub fn mo_sbd_port(&self) -> Option<u16> {
        self.sbd_server.as_ref().map(SbdServer::local_port)
    }

    pub fn clients_on_call(&self) -> usize {
        self.clients.len()
    }

    /// MAC grant: fill and send one transmission. A grant issued from inside
    /// one of our own upcalls is queued for the next `do_work` tick so that
    /// handlers never re-enter the driver beyond depth one.
    pub fn handle_initiate_transmission(&mut self, transmission: ModemTransmission) {
        if self.in_upcall {
            debug!("initiate-transmission issued from inside a handler, deferring to the next tick");
            self.deferred_transmissions.push_back(transmission);
            return;
        }
        self.process_transmission(transmission, Utc::now(), false);
    }

    /// Main loop tick; call at 10 Hz or faster.
    pub fn do_work(&mut self, now: DateTime<Utc>) {
        // grants deferred during this drain wait for the following tick
        let mut deferred = std::mem::take(&mut self.deferred_transmissions);
        while let Some(transmission) = deferred.pop_front() {
            self.process_transmission(transmission, now, false);
        }

        while let Ok(event) = self.rudics_rx.try_recv() {
            match event {
                RudicsEvent::Connected {
                    id,
                    remote_endpoint,
                    writer,
                } => {
                    debug!(id, %remote_endpoint, "RUDICS client connected");
                    self.connections.insert(
                        id,
                        RudicsConnection {
                            writer,
                            remote_endpoint,
                            packet_failures: 0,
                        },
                    );
                }
                RudicsEvent::Line { id, line } => self.handle_rudics_line(id, &line, now),
                RudicsEvent::Disconnected { id } => self.handle_rudics_disconnect(id),
            }
        }

        while let Ok(message) = self.sbd_rx.try_recv() {
            self.handle_sbd_mo(message, now);
        }

        self.tick_remotes(now);
    }

    /// Runs one upcall with the re-entrancy guard held.
    fn with_events<R>(&mut self, f: impl FnOnce(&mut dyn DriverEvents) -> R) -> R {
        self.in_upcall = true;
        let result = f(self.events.as_mut());
        self.in_upcall = false;
        result
    }

    fn process_transmission(
        &mut self,
        mut transmission: ModemTransmission,
        now: DateTime<Utc>,
        allow_empty: bool,
    ) {
        self.with_events(|events| events.modify_transmission(&mut transmission));

        transmission.frame_start = self.next_frame;
        if transmission.max_frame_bytes == 0
            || transmission.max_frame_bytes > self.cfg.max_frame_size
        {
            transmission.max_frame_bytes = self.cfg.max_frame_size;
        }

        self.with_events(|events| events.data_request(&mut transmission));
        self.next_frame = (self.next_frame + transmission.frames.len() as u32) & FRAME_MASK;

        if !transmission.is_empty() || allow_empty {
            self.send(&transmission, now);
        }
    }

    fn send(&mut self, transmission: &ModemTransmission, now: DateTime<Utc>) {
        let on_call = self
            .remotes
            .get(&transmission.dest)
            .is_some_and(|r| r.on_call.is_some());

        if transmission.rate == Rate::Rudics || on_call {
            let bytes = serialize_modem_message(transmission);
            let line = serialize_rudics_packet(&bytes);
            self.rudics_send(line.as_bytes(), transmission.dest);

            if let Some(call) = self
                .remotes
                .get_mut(&transmission.dest)
                .and_then(|r| r.on_call.as_mut())
            {
                call.record_tx(now, line.len(), !transmission.is_empty());
            }
        } else if transmission.rate == Rate::Sbd {
            let Some(imei) = self.modem_id_to_imei.get(&transmission.dest) else {
                warn!(
                    dest = transmission.dest,
                    "no IMEI configured for destination, dropping SBD message"
                );
                return;
            };

            // SBD bodies carry the same framing as a RUDICS line
            let bytes = serialize_modem_message(transmission);
            let packet = serialize_rudics_packet(&bytes).into_bytes();
            let message = create_mt_message(self.next_mt_client_id, imei, &packet);
            self.next_mt_client_id = self.next_mt_client_id.wrapping_add(1);

            let address = self.cfg.mt_sbd_server_address.clone();
            let port = self.cfg.mt_sbd_server_port;
            tokio::spawn(async move {
                if let Err(e) =
                    send_mt_message(&address, port, &message, SBD_SESSION_TIMEOUT).await
                {
                    warn!(error = %e, "could not send MT SBD message");
                }
            });
        }
    }

    fn rudics_send(&mut self, bytes: &[u8], dest: ModemId) {
        let Some(conn_id) = self.clients.conn_for(dest) else {
            warn!(dest, "failed to find RUDICS connection for modem id");
            return;
        };
        let Some(writer) = self.connections.get(&conn_id).map(|c| c.writer.clone()) else {
            warn!(dest, conn_id, "RUDICS connection handle is gone");
            return;
        };

        let raw = String::from_utf8_lossy(bytes).into_owned();
        trace!(dest, bytes = bytes.len(), "RUDICS sending line");
        if let Some(log) = &mut self.raw_log {
            log.tx(&raw);
        }
        self.with_events(|events| events.raw_outgoing(&raw));

        if writer.send(bytes.to_vec()).is_err() {
            debug!(dest, conn_id, "RUDICS writer task is gone");
        }
    }

    fn handle_rudics_line(&mut self, conn_id: ConnId, line: &[u8], now: DateTime<Utc>) {
        let raw = String::from_utf8_lossy(line).into_owned();
        if let Some(log) = &mut self.raw_log {
            log.rx(&raw);
        }
        self.with_events(|events| events.raw_incoming(&raw));

        // Iridium sometimes prepends a NUL to the first line of a call
        let trimmed = line.strip_prefix(b"\0").unwrap_or(line);

        if trimmed == b"goby\r" {
            let endpoint = self.endpoint_of(conn_id);
            debug!(conn_id, endpoint = %endpoint, "detected start of RUDICS call");
        } else if trimmed == b"bye\r" {
            match self.clients.modem_for(conn_id) {
                Some(modem_id) => {
                    debug!(conn_id, modem_id, "detected bye");
                    if let Some(call) = self
                        .remotes
                        .get_mut(&modem_id)
                        .and_then(|r| r.on_call.as_mut())
                    {
                        call.set_bye_received(true);
                    }
                }
                None => {
                    warn!(conn_id, "bye from a connection without a bound modem id");
                }
            }
        } else {
            let correlation_id = Uuid::new_v4();
            let packet_span = span!(Level::DEBUG, "rudics_packet", ?correlation_id);
            let _entered = packet_span.enter();

            let transmission = parse_rudics_packet(line).and_then(|p| parse_modem_message(&p));
            match transmission {
                Ok(transmission) => {
                    let src = transmission.src;
                    debug!(src, dest = transmission.dest, conn_id, "received RUDICS message");
                    if self.clients.conn_for(src).is_none() {
                        self.clients.insert(src, conn_id);
                        self.remotes.entry(src).or_default().on_call = Some(OnCall::new(now));
                    }
                    if let Some(call) = self
                        .remotes
                        .get_mut(&src)
                        .and_then(|r| r.on_call.as_mut())
                    {
                        call.set_last_rx(now);
                    }
                    self.receive(transmission, now);
                }
                Err(e) => {
                    debug!(conn_id, error = %e, "could not decode packet");
                    if let Some(connection) = self.connections.get_mut(&conn_id) {
                        connection.packet_failures += 1;
                    }
                }
            }
        }
    }

    fn receive(&mut self, transmission: ModemTransmission, now: DateTime<Utc>) {
        if transmission.msg_type == TransmissionType::Data
            && transmission.ack_requested
            && transmission.dest == self.cfg.modem_id
        {
            let ack = ModemTransmission {
                msg_type: TransmissionType::Ack,
                src: self.cfg.modem_id,
                dest: transmission.src,
                rate: transmission.rate,
                acked_frames: (transmission.frame_start
                    ..transmission.frame_start + transmission.frames.len() as u32)
                    .collect(),
                ..ModemTransmission::default()
            };
            self.send(&ack, now);
        }
        self.with_events(move |events| events.receive(transmission));
    }

    fn handle_rudics_disconnect(&mut self, conn_id: ConnId) {
        if let Some(connection) = self.connections.remove(&conn_id) {
            if connection.packet_failures > 0 {
                debug!(
                    conn_id,
                    failures = connection.packet_failures,
                    "connection closed after packet failures"
                );
            }
        }
        match self.clients.remove_by_conn(conn_id) {
            Some(modem_id) => {
                if let Some(remote) = self.remotes.get_mut(&modem_id) {
                    remote.on_call = None;
                }
                debug!(
                    conn_id,
                    modem_id,
                    remaining = self.clients.len(),
                    "RUDICS client disconnected"
                );
            }
            None => debug!(conn_id, "disconnect from a connection without a bound modem id"),
        }
    }

    /// Active hangup from our side.
    fn disconnect(&mut self, conn_id: ConnId) {
        // dropping the writer closes the socket; the reader task will follow
        self.connections.remove(&conn_id);
        if let Some(modem_id) = self.clients.remove_by_conn(conn_id) {
            if let Some(remote) = self.remotes.get_mut(&modem_id) {
                remote.on_call = None;
            }
        }
    }

    fn handle_sbd_mo(&mut self, message: SbdMoMessage, now: DateTime<Utc>) {
        debug!(
            endpoint = %message.remote_endpoint,
            imei = message.imei.as_deref().unwrap_or("unknown"),
            "received SBD MO message"
        );
        match parse_rudics_packet(&message.payload).and_then(|p| parse_modem_message(&p)) {
            Ok(transmission) => self.receive(transmission, now),
            Err(e) => debug!(error = %e, "could not decode SBD packet"),
        }
    }

    /// Pacing, bye and hangup timers for every remote on a call.
    fn tick_remotes(&mut self, now: DateTime<Utc>) {
        let ids: Vec<ModemId> = self
            .remotes
            .iter()
            .filter(|(_, remote)| remote.on_call.is_some())
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let pace_due = {
                let Some(call) = self.on_call(id) else { continue };
                let send_wait = seconds(
                    call.last_bytes_sent() as f64
                        / (f64::from(self.cfg.target_bit_rate_bps) / 8.0),
                );
                !call.bye_sent() && now >= call.last_tx() + send_wait
            };
            if pace_due {
                // slot is due: real payload if the queues have any, otherwise
                // a zero-body keepalive
                let slot = ModemTransmission {
                    src: self.cfg.modem_id,
                    dest: id,
                    rate: Rate::Rudics,
                    ..ModemTransmission::default()
                };
                self.process_transmission(slot, now, true);
            }

            let send_bye = {
                let Some(call) = self.on_call(id) else { continue };
                !call.bye_sent()
                    && now > call.last_data_tx() + seconds(self.cfg.handshake_hangup_seconds)
            };
            if send_bye {
                debug!(dest = id, "sending bye");
                self.rudics_send(b"bye\r", id);
                if let Some(call) = self
                    .remotes
                    .get_mut(&id)
                    .and_then(|r| r.on_call.as_mut())
                {
                    call.set_bye_sent(true);
                }
            }

            let hangup = {
                let Some(call) = self.on_call(id) else { continue };
                (call.bye_sent() && call.bye_received())
                    || now > call.last_rx_tx() + seconds(self.cfg.hangup_seconds_after_empty)
            };
            if hangup {
                debug!(dest = id, "hanging up by disconnecting");
                match self.clients.conn_for(id) {
                    Some(conn_id) => self.disconnect(conn_id),
                    None => {
                        warn!(dest = id, "no connection bound while hanging up");
                        if let Some(remote) = self.remotes.get_mut(&id) {
                            remote.on_call = None;
                        }
                    }
                }
            }
        }
    }

    fn on_call(&self, id: ModemId) -> Option<&OnCall> {
        self.remotes.get(&id).and_then(|r| r.on_call.as_ref())
    }

    fn endpoint_of(&self, conn_id: ConnId) -> String {
        self.connections
            .get(&conn_id)
            .map(|c| c.remote_endpoint.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn seconds(value: f64) -> Duration {
    Duration::milliseconds((value * 1000.0) as i64)
}

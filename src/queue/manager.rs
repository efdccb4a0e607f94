//! The multi-queue dispatcher.
//!
//! Outbound, the manager runs a priority contest across all queues each time
//! the driver asks for data, then fills the granted slot with as many user
//! frames as fit, stitching them into one physical packet. Inbound it takes
//! packets apart again, re-headers each user frame and hands it to the
//! subscriber of its schema id. Acknowledgment obligations are tracked per
//! (frame number, queue) so that a single physical ACK can pop messages from
//! several queues at once.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, trace, warn};

use crate::codec::header::{DcclHead, DCCL_CCL_ID, HEAD_BYTES};
use crate::codec::schema::{Record, MAX_DCCL_ID};
use crate::codec::Codec;
use crate::driver::transmission::{ModemTransmission, TransmissionType};
use crate::error::QueueError;
use crate::queue::queue::{Envelope, Queue, QueueConfig, QueueKey, QueueKind, QueuedMessage};
use crate::{ModemId, BROADCAST_ID};

/// Largest id a CCL queue may register under.
pub const MAX_CCL_QUEUE_ID: u32 = 31;

/// Cached on-demand data older than this is considered stale.
const ON_DEMAND_SKEW_MILLIS: i64 = 1000;

/// A non-last user frame's body length must fit the one-byte stitch prefix.
const MAX_STITCHED_BODY: usize = 255;

#[derive(Clone, Debug, PartialEq)]
pub enum OutboundPayload {
    /// A typed record for a DCCL queue, encoded on push.
    Record(Record),
    /// Pre-encoded bytes for a CCL queue (first byte is the CCL id).
    Raw(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutboundMessage {
    pub dest: ModemId,
    /// `None` takes the queue's configured default.
    pub ack_required: Option<bool>,
    pub payload: OutboundPayload,
}

impl OutboundMessage {
    pub fn record(dest: ModemId, record: Record) -> OutboundMessage {
        OutboundMessage {
            dest,
            ack_required: None,
            payload: OutboundPayload::Record(record),
        }
    }

    pub fn raw(dest: ModemId, data: Vec<u8>) -> OutboundMessage {
        OutboundMessage {
            dest,
            ack_required: None,
            payload: OutboundPayload::Raw(data),
        }
    }
}

/// Synchronous sink for everything the manager surfaces to the application.
#[cfg_attr(test, automock)]
pub trait QueueEvents {
    /// A decoded user frame arrived for a subscribed DCCL queue.
    fn on_receive(&mut self, key: QueueKey, head: &DcclHead, record: &Record);

    /// A frame arrived for a subscribed legacy CCL queue.
    fn on_receive_ccl(&mut self, key: QueueKey, data: &[u8]);

    /// A message was acknowledged and removed from its queue.
    fn on_ack(&mut self, key: QueueKey, message: &QueuedMessage);

    /// A message exceeded its TTL and was dropped.
    fn on_expire(&mut self, key: QueueKey, message: &QueuedMessage);

    /// An on-demand queue is empty or stale; produce fresh data for it.
    fn on_demand_request(&mut self, key: QueueKey, max_bytes: usize) -> Option<OutboundMessage>;
}

pub struct QueueManager {
    modem_id: ModemId,
    codec: Codec,
    queues: BTreeMap<QueueKey, Queue>,
    /// Whether any frame of the current packet requires an ACK.
    packet_ack: bool,
    /// frame number -> queues holding ACK-pending messages under that frame
    waiting_for_ack: BTreeMap<u32, Vec<QueueKey>>,
    events: Box<dyn QueueEvents>,
}

impl QueueManager {
    pub fn new(modem_id: ModemId, codec: Codec, events: Box<dyn QueueEvents>) -> QueueManager {
        QueueManager {
            modem_id,
            codec,
            queues: BTreeMap::new(),
            packet_ack: false,
            waiting_for_ack: BTreeMap::new(),
            events,
        }
    }

    pub fn modem_id(&self) -> ModemId {
        self.modem_id
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn add_queue(&mut self, cfg: QueueConfig) -> Result<(), QueueError> {
        let key = cfg.key();
        let max = match key.kind {
            QueueKind::Dccl => MAX_DCCL_ID,
            QueueKind::Ccl => MAX_CCL_QUEUE_ID,
        };
        if key.id > max {
            return Err(QueueError::IdTooLarge {
                kind: key.kind.name(),
                id: key.id,
                max,
            });
        }
        if self.queues.contains_key(&key) {
            return Err(QueueError::DuplicateKey {
                key: key.to_string(),
            });
        }
        debug!(%key, name = %cfg.name, "added queue");
        self.queues.insert(key, Queue::new(cfg));
        Ok(())
    }

    pub fn queue(&self, key: QueueKey) -> Option<&Queue> {
        self.queues.get(&key)
    }

    /// Enqueues a message for transmission. Messages addressed to our own
    /// modem id loop straight back through the receive path.
    pub fn push(
        &mut self,
        key: QueueKey,
        message: OutboundMessage,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let Some(queue) = self.queues.get(&key) else {
            return Err(QueueError::NoSuchQueue {
                key: key.to_string(),
            });
        };

        let mut ack_required = message
            .ack_required
            .unwrap_or(queue.cfg().ack_required);
        if message.dest == BROADCAST_ID {
            ack_required = false;
        }

        let (record, data) = match (key.kind, message.payload) {
            (QueueKind::Dccl, OutboundPayload::Record(record)) => {
                let head = DcclHead::new(key.id, self.modem_id, message.dest, now);
                let data = self.codec.encode(&head, &record)?;
                (record, data)
            }
            (QueueKind::Ccl, OutboundPayload::Raw(data)) => (Record::default(), data),
            (kind, _) => {
                return Err(QueueError::NoSuchQueue {
                    key: format!("{key} ({} queues take the other payload kind)", kind.name()),
                })
            }
        };

        if message.dest == self.modem_id {
            debug!(%key, "outgoing message is for us: using loopback, not the physical link");
            self.receive_frame(&data);
            return Ok(());
        }

        let envelope = Envelope {
            src: self.modem_id,
            dest: message.dest,
            time: now,
            ack_required,
        };
        self.queues
            .get_mut(&key)
            .expect("existence checked above")
            .push(record, data, envelope)
    }

    /// TTL sweep; call once per main-loop tick.
    pub fn do_work(&mut self, now: DateTime<Utc>) {
        let keys: Vec<QueueKey> = self.queues.keys().copied().collect();
        for key in keys {
            let expired = self
                .queues
                .get_mut(&key)
                .expect("key collected above")
                .expire(now);
            for message in &expired {
                self.events.on_expire(key, message);
            }
        }
    }

    /// Fills the driver's data request with as many user frames as fit.
    pub fn handle_modem_data_request(
        &mut self,
        request: &mut ModemTransmission,
        now: DateTime<Utc>,
    ) {
        let frame = request.frame_start;
        if frame == 0 || frame == 1 {
            self.clear_packet();
        }
        request.src = self.modem_id;
        request.ack_requested = self.packet_ack;

        let mut remaining = request.max_frame_bytes;
        let mut user_frames: Vec<QueuedMessage> = Vec::new();
        let mut ccl_packet: Option<Vec<u8>> = None;

        // stitching is byte-neutral: each non-final frame trades its CCL id
        // byte for a length byte, and the final frame's id byte becomes the
        // packet's shared leading id byte, so the packet length is exactly
        // the sum of the frame lengths
        loop {
            let Some(key) = self.find_next_sender(remaining, user_frames.len(), now) else {
                break;
            };
            let queue = self.queues.get_mut(&key).expect("winner exists");
            let Some(message) = queue.give_data(frame, remaining, now) else {
                break;
            };
            trace!(%key, frame, bytes = message.data.len(), "queue won the contest");

            if message.envelope.ack_required {
                self.packet_ack = true;
                let entries = self.waiting_for_ack.entry(frame).or_default();
                if !entries.contains(&key) {
                    entries.push(key);
                }
            }
            remaining -= message.data.len();

            if key.kind == QueueKind::Ccl {
                // legacy messages occupy the whole packet as-is
                ccl_packet = Some(message.data);
                break;
            }
            let body_len = message.data.len() - HEAD_BYTES;
            user_frames.push(message);

            if remaining <= HEAD_BYTES || body_len > MAX_STITCHED_BODY {
                break;
            }
        }

        request.ack_requested = self.packet_ack;
        if let Some(packet) = ccl_packet {
            request.frames = vec![packet];
            return;
        }
        if user_frames.is_empty() {
            debug!("no queue has data; returning a blank frame");
            request.frames.clear();
            return;
        }
        if request.dest == BROADCAST_ID {
            request.dest = user_frames[0].envelope.dest;
        }
        request.frames = vec![Self::stitch(&user_frames)];
    }

    /// Dispatches an inbound transmission: DATA unstitches into user frames,
    /// ACK pops pending messages.
    pub fn handle_modem_receive(&mut self, transmission: &ModemTransmission) {
        match transmission.msg_type {
            TransmissionType::Ack => self.handle_modem_ack(transmission),
            TransmissionType::Data => {
                for frame in &transmission.frames {
                    self.receive_frame(frame);
                }
            }
        }
    }

    pub fn handle_modem_ack(&mut self, transmission: &ModemTransmission) {
        if transmission.dest != self.modem_id {
            debug!(
                dest = transmission.dest,
                "ignoring ack addressed to another modem"
            );
            return;
        }
        for frame in &transmission.acked_frames {
            let Some(keys) = self.waiting_for_ack.remove(frame) else {
                debug!(frame, "got an ack we were not expecting");
                continue;
            };
            for key in keys {
                let acked = self
                    .queues
                    .get_mut(&key)
                    .map(|q| q.pop_on_ack(*frame))
                    .unwrap_or_default();
                for message in &acked {
                    self.events.on_ack(key, message);
                }
            }
        }
    }

    /// Runs the priority contest for one user-frame slot.
    fn find_next_sender(
        &mut self,
        max_bytes: usize,
        user_frame_index: usize,
        now: DateTime<Utc>,
    ) -> Option<QueueKey> {
        self.refresh_on_demand(max_bytes, now);

        trace!(max_bytes, user_frame_index, "starting priority contest");
        let mut winner: Option<(QueueKey, f64, Option<DateTime<Utc>>)> = None;
        for (key, queue) in &self.queues {
            // legacy CCL frames cannot share a packet
            if key.kind == QueueKind::Ccl && user_frame_index > 0 {
                continue;
            }
            let Some((priority, last_send)) = queue.priority_values(now, max_bytes) else {
                continue;
            };
            trace!(%key, priority, "queue entered the contest");
            let better = match &winner {
                None => true,
                Some((_, best, best_last)) => {
                    priority > *best || (priority == *best && last_send < *best_last)
                }
            };
            if better {
                winner = Some((*key, priority, last_send));
            }
        }

        if let Some((key, priority, _)) = &winner {
            trace!(%key, priority, "queue has highest priority");
        }
        winner.map(|(key, _, _)| key)
    }

    /// Asks the application to refill on-demand queues whose data is missing
    /// or stale.
    fn refresh_on_demand(&mut self, max_bytes: usize, now: DateTime<Utc>) {
        let skew = Duration::milliseconds(ON_DEMAND_SKEW_MILLIS);
        let stale: Vec<QueueKey> = self
            .queues
            .iter()
            .filter(|(_, q)| {
                q.cfg().on_demand
                    && (q.is_empty() || q.newest_msg_time().is_some_and(|t| t + skew < now))
            })
            .map(|(key, _)| *key)
            .collect();

        for key in stale {
            if let Some(message) = self.events.on_demand_request(key, max_bytes) {
                if let Err(e) = self.push(key, message, now) {
                    warn!(%key, error = %e, "failed to push on-demand message");
                }
            }
        }
    }

    /// Voids the previous packet: pending-ack messages return to the
    /// sendable pool of their queues.
    fn clear_packet(&mut self) {
        let mut keys: Vec<QueueKey> = self.waiting_for_ack.values().flatten().copied().collect();
        keys.dedup();
        for key in keys {
            if let Some(queue) = self.queues.get_mut(&key) {
                queue.clear_ack_queue();
            }
        }
        self.waiting_for_ack.clear();
        self.packet_ack = false;
    }

    /// Joins user frames into one physical packet:
    /// `ccl_id | head_0 | size_0 | body_0 | head_1 | ... | head_n | body_n`
    /// with the shared CCL id stripped from each sub-head and a body length
    /// byte after every non-final sub-head.
    fn stitch(user_frames: &[QueuedMessage]) -> Vec<u8> {
        let mut packet = vec![DCCL_CCL_ID];
        for (index, message) in user_frames.iter().enumerate() {
            let is_last = index == user_frames.len() - 1;

            let mut head =
                DcclHead::deser(&message.data).expect("queued frames carry a full head");
            head.multimessage = !is_last;
            head.broadcast = message.envelope.dest == BROADCAST_ID;

            let mut data = message.data.clone();
            head.overwrite(&mut data);

            packet.extend_from_slice(&data[1..HEAD_BYTES]);
            if !is_last {
                packet.push((data.len() - HEAD_BYTES) as u8);
            }
            packet.extend_from_slice(&data[HEAD_BYTES..]);
        }
        packet
    }

    /// Takes one physical packet apart and dispatches each user frame.
    fn receive_frame(&mut self, data: &[u8]) {
        if data.is_empty() {
            return; // zero-body keepalive
        }
        if data[0] != DCCL_CCL_ID {
            let key = QueueKey {
                kind: QueueKind::Ccl,
                id: u32::from(data[0]),
            };
            if self.queues.contains_key(&key) {
                self.events.on_receive_ccl(key, data);
            } else {
                debug!(ccl_id = data[0], "incoming frame is not for us (not DCCL or a known CCL id)");
            }
            return;
        }

        let mut rest = data[1..].to_vec();
        loop {
            let mut frame = Vec::with_capacity(1 + rest.len());
            frame.push(DCCL_CCL_ID);
            frame.extend_from_slice(&rest);

            let head = match DcclHead::deser(&frame) {
                Ok(head) => head,
                Err(e) => {
                    warn!(error = %e, "dropping unparsable remainder of packet");
                    return;
                }
            };

            let sub_frame;
            if head.multimessage {
                if frame.len() <= HEAD_BYTES {
                    warn!("multimessage frame ends before its length byte");
                    return;
                }
                let body_len = frame[HEAD_BYTES] as usize;
                if frame.len() < HEAD_BYTES + 1 + body_len {
                    warn!(body_len, "multimessage frame shorter than its declared body");
                    return;
                }
                let mut sub = frame[..HEAD_BYTES].to_vec();
                sub.extend_from_slice(&frame[HEAD_BYTES + 1..HEAD_BYTES + 1 + body_len]);
                rest = frame[HEAD_BYTES + 1 + body_len..].to_vec();
                sub_frame = sub;
            } else {
                sub_frame = frame;
                rest = Vec::new();
            }

            self.dispatch_dccl_frame(sub_frame, head.broadcast);

            if rest.is_empty() {
                return;
            }
        }
    }

    fn dispatch_dccl_frame(&mut self, mut sub_frame: Vec<u8>, broadcast: bool) {
        let mut head = DcclHead::deser(&sub_frame).expect("caller parsed this head already");
        head.multimessage = false;
        head.broadcast = false;
        head.overwrite(&mut sub_frame);

        let effective_dest = if broadcast { BROADCAST_ID } else { head.dest };
        if effective_dest != BROADCAST_ID && effective_dest != self.modem_id {
            debug!(dest = effective_dest, "ignoring user frame for another modem");
            return;
        }

        let key = QueueKey {
            kind: QueueKind::Dccl,
            id: head.dccl_id,
        };
        if !self.queues.contains_key(&key) {
            debug!(dccl_id = head.dccl_id, "no queue subscribed to this schema id");
            return;
        }

        match self.codec.decode(&sub_frame) {
            Ok((decoded_head, record)) => self.events.on_receive(key, &decoded_head, &record),
            Err(e) => warn!(error = %e, "dropping undecodable user frame"),
        }
    }
}

//! A single FIFO of encoded frames with priority, TTL and blackout policy.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::codec::schema::Record;
use crate::error::QueueError;
use crate::ModemId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Dccl,
    Ccl,
}

impl QueueKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::Dccl => "dccl",
            QueueKind::Ccl => "ccl",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub struct QueueKey {
    pub kind: QueueKind,
    pub id: u32,
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.name(), self.id)
    }
}

fn default_priority_base() -> f64 {
    1.0
}

#[derive(Clone, Debug, Deserialize)]
pub struct QueueConfig {
    pub kind: QueueKind,
    pub id: u32,
    pub name: String,
    /// Default for messages that don't specify their own ACK requirement.
    #[serde(default)]
    pub ack_required: bool,
    /// Minimum interval between successive sends; 0 disables.
    #[serde(default)]
    pub blackout_seconds: f64,
    /// 0 means unbounded.
    #[serde(default)]
    pub max_queue_size: usize,
    /// Send (and keep) the newest messages instead of the oldest.
    #[serde(default)]
    pub newest_first: bool,
    #[serde(default = "default_priority_base")]
    pub priority_base: f64,
    /// Seconds after which a newly arrived message reaches base priority.
    #[serde(default)]
    pub priority_time_constant_seconds: f64,
    /// Messages older than this are dropped; 0 disables.
    #[serde(default)]
    pub ttl_seconds: f64,
    /// The head of this queue is produced lazily by an application callback.
    #[serde(default)]
    pub on_demand: bool,
}

impl QueueConfig {
    pub fn key(&self) -> QueueKey {
        QueueKey {
            kind: self.kind,
            id: self.id,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.priority_base < 0.0 {
            anyhow::bail!("queue {} has a negative priority_base", self.key());
        }
        if self.blackout_seconds < 0.0 || self.ttl_seconds < 0.0 {
            anyhow::bail!("queue {} has a negative duration parameter", self.key());
        }
        Ok(())
    }
}

/// Envelope metadata travelling with each encoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub src: ModemId,
    pub dest: ModemId,
    pub time: DateTime<Utc>,
    pub ack_required: bool,
}

#[derive(Clone, Debug)]
pub struct QueuedMessage {
    pub(crate) seq: u64,
    pub record: Record,
    /// The encoded frame, head included.
    pub data: Vec<u8>,
    pub envelope: Envelope,
}

pub struct Queue {
    cfg: QueueConfig,
    messages: VecDeque<QueuedMessage>,
    /// frame number -> message seqs awaiting acknowledgment under that frame
    waiting_for_ack: BTreeMap<u32, Vec<u64>>,
    last_send_time: Option<DateTime<Utc>>,
    next_seq: u64,
}

impl Queue {
    pub fn new(cfg: QueueConfig) -> Queue {
        Queue {
            cfg,
            messages: VecDeque::new(),
            waiting_for_ack: BTreeMap::new(),
            last_send_time: None,
            next_seq: 0,
        }
    }

    pub fn cfg(&self) -> &QueueConfig {
        &self.cfg
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_send_time(&self) -> Option<DateTime<Utc>> {
        self.last_send_time
    }

    /// Envelope time of the most recently pushed message.
    pub fn newest_msg_time(&self) -> Option<DateTime<Utc>> {
        self.messages.back().map(|m| m.envelope.time)
    }

    pub fn ack_pending(&self) -> usize {
        self.waiting_for_ack.values().map(Vec::len).sum()
    }

    pub fn push(
        &mut self,
        record: Record,
        data: Vec<u8>,
        envelope: Envelope,
    ) -> Result<(), QueueError> {
        let at_capacity = self.cfg.max_queue_size > 0 && self.messages.len() >= self.cfg.max_queue_size;
        if at_capacity && !self.cfg.newest_first {
            return Err(QueueError::QueueFull {
                name: self.cfg.name.clone(),
                size: self.messages.len(),
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.push_back(QueuedMessage {
            seq,
            record,
            data,
            envelope,
        });
        trace!(queue = %self.cfg.name, seq, size = self.messages.len(), "pushed message");

        while self.cfg.max_queue_size > 0 && self.messages.len() > self.cfg.max_queue_size {
            if let Some(dropped) = self.messages.pop_front() {
                debug!(queue = %self.cfg.name, seq = dropped.seq, "dropping oldest message over capacity");
                self.forget_acks_for(dropped.seq);
            }
        }
        Ok(())
    }

    /// The message `give_data` would hand out next: newest or oldest end per
    /// policy, skipping messages already committed to a frame.
    fn next_message(&self) -> Option<&QueuedMessage> {
        let pending: Vec<u64> = self
            .waiting_for_ack
            .values()
            .flatten()
            .copied()
            .collect();
        let mut candidates: Box<dyn Iterator<Item = &QueuedMessage>> = if self.cfg.newest_first {
            Box::new(self.messages.iter().rev())
        } else {
            Box::new(self.messages.iter())
        };
        candidates.find(|m| !pending.contains(&m.seq))
    }

    /// Hands out the next message fitting in `max_bytes`. ACK-required
    /// messages stay queued with a `(frame, message)` tracking entry; others
    /// are popped immediately.
    pub fn give_data(
        &mut self,
        frame: u32,
        max_bytes: usize,
        now: DateTime<Utc>,
    ) -> Option<QueuedMessage> {
        let candidate = self.next_message()?;
        if candidate.data.len() > max_bytes {
            return None;
        }
        let seq = candidate.seq;
        let result = candidate.clone();

        self.last_send_time = Some(now);
        if result.envelope.ack_required {
            let entries = self.waiting_for_ack.entry(frame).or_default();
            if !entries.contains(&seq) {
                entries.push(seq);
            }
            trace!(queue = %self.cfg.name, frame, seq, "message awaiting ack");
        } else {
            self.messages.retain(|m| m.seq != seq);
            trace!(queue = %self.cfg.name, frame, seq, "message popped on send");
        }
        Some(result)
    }

    /// Removes and returns every message tracked under `frame`.
    pub fn pop_on_ack(&mut self, frame: u32) -> Vec<QueuedMessage> {
        let Some(seqs) = self.waiting_for_ack.remove(&frame) else {
            return Vec::new();
        };
        let mut acked = Vec::new();
        self.messages.retain(|m| {
            if seqs.contains(&m.seq) {
                acked.push(m.clone());
                false
            } else {
                true
            }
        });
        debug!(queue = %self.cfg.name, frame, count = acked.len(), "popped acknowledged messages");
        acked
    }

    /// Drops all ACK tracking (messages stay queued for resend). Called when
    /// a new packet begins and the previous packet's frames are void.
    pub fn clear_ack_queue(&mut self) {
        self.waiting_for_ack.clear();
    }

    /// Removes and returns every message older than the TTL.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<QueuedMessage> {
        if self.cfg.ttl_seconds <= 0.0 {
            return Vec::new();
        }
        let deadline = now - Duration::milliseconds((self.cfg.ttl_seconds * 1000.0) as i64);
        let mut expired = Vec::new();
        self.messages.retain(|m| {
            if m.envelope.time < deadline {
                expired.push(m.clone());
                false
            } else {
                true
            }
        });
        for m in &expired {
            debug!(queue = %self.cfg.name, seq = m.seq, "message expired");
            self.forget_acks_for(m.seq);
        }
        expired
    }

    pub fn flush(&mut self) {
        self.messages.clear();
        self.waiting_for_ack.clear();
    }

    /// Priority of this queue for the current contest, or `None` when it has
    /// nothing eligible to send.
    pub fn priority_values(
        &self,
        now: DateTime<Utc>,
        max_bytes: usize,
    ) -> Option<(f64, Option<DateTime<Utc>>)> {
        let candidate = self.next_message()?;
        if candidate.data.len() > max_bytes {
            return None;
        }

        if self.cfg.blackout_seconds > 0.0 {
            if let Some(last_send) = self.last_send_time {
                let blackout = Duration::milliseconds((self.cfg.blackout_seconds * 1000.0) as i64);
                if now - last_send < blackout {
                    trace!(queue = %self.cfg.name, "in blackout");
                    return None;
                }
            }
        }

        let newest = self.newest_msg_time().expect("queue has a candidate");
        let priority = if self.cfg.priority_time_constant_seconds > 0.0 {
            let age_seconds = (now - newest).num_milliseconds() as f64 / 1000.0;
            self.cfg.priority_base * (1.0 + age_seconds / self.cfg.priority_time_constant_seconds)
        } else {
            self.cfg.priority_base
        };
        Some((priority, self.last_send_time))
    }

    fn forget_acks_for(&mut self, seq: u64) {
        for entries in self.waiting_for_ack.values_mut() {
            entries.retain(|s| *s != seq);
        }
        self.waiting_for_ack.retain(|_, entries| !entries.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn cfg(name: &str) -> QueueConfig {
        QueueConfig {
            kind: QueueKind::Dccl,
            id: 1,
            name: name.to_string(),
            ack_required: false,
            blackout_seconds: 0.0,
            max_queue_size: 0,
            newest_first: false,
            priority_base: 1.0,
            priority_time_constant_seconds: 0.0,
            ttl_seconds: 0.0,
            on_demand: false,
        }
    }

    fn msg(queue: &mut Queue, dest: ModemId, ack: bool, time: DateTime<Utc>, len: usize) {
        queue
            .push(
                Record::new(0),
                vec![0u8; len],
                Envelope {
                    src: 1,
                    dest,
                    time,
                    ack_required: ack,
                },
            )
            .unwrap();
    }

    fn t0() -> DateTime<Utc> {
        "2026-08-02T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_drop_newest_when_full() {
        let mut queue = Queue::new(QueueConfig {
            max_queue_size: 2,
            ..cfg("full")
        });
        msg(&mut queue, 2, false, t0(), 8);
        msg(&mut queue, 2, false, t0(), 8);
        let err = queue.push(
            Record::new(0),
            vec![0u8; 8],
            Envelope {
                src: 1,
                dest: 2,
                time: t0(),
                ack_required: false,
            },
        );
        assert!(matches!(err, Err(QueueError::QueueFull { .. })));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_newest_first_drops_oldest() {
        let mut queue = Queue::new(QueueConfig {
            max_queue_size: 2,
            newest_first: true,
            ..cfg("lifo")
        });
        for len in [1usize, 2, 3] {
            msg(&mut queue, 2, false, t0(), len);
        }
        assert_eq!(queue.len(), 2);
        // oldest (len 1) dropped; newest (len 3) handed out first
        let given = queue.give_data(0, 64, t0()).unwrap();
        assert_eq!(given.data.len(), 3);
    }

    #[test]
    fn test_give_data_pops_without_ack() {
        let mut queue = Queue::new(cfg("plain"));
        msg(&mut queue, 2, false, t0(), 8);
        let given = queue.give_data(0, 64, t0()).unwrap();
        assert_eq!(given.data.len(), 8);
        assert!(queue.is_empty());
        assert_eq!(queue.ack_pending(), 0);
    }

    #[test]
    fn test_ack_retention_and_pop() {
        let mut queue = Queue::new(cfg("acked"));
        msg(&mut queue, 2, true, t0(), 8);

        queue.give_data(3, 64, t0()).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.ack_pending(), 1);

        // wrong frame is a no-op
        assert!(queue.pop_on_ack(4).is_empty());
        assert_eq!(queue.len(), 1);

        let acked = queue.pop_on_ack(3);
        assert_eq!(acked.len(), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.ack_pending(), 0);
    }

    #[test]
    fn test_pending_ack_message_not_resent() {
        let mut queue = Queue::new(cfg("acked"));
        msg(&mut queue, 2, true, t0(), 8);
        queue.give_data(0, 64, t0()).unwrap();

        // the only message is committed to frame 0, nothing left to give
        assert!(queue.give_data(1, 64, t0()).is_none());
        assert!(queue.priority_values(t0(), 64).is_none());

        // after the packet is cleared it becomes sendable again
        queue.clear_ack_queue();
        assert!(queue.give_data(1, 64, t0()).is_some());
    }

    #[test]
    fn test_give_data_respects_max_bytes() {
        let mut queue = Queue::new(cfg("big"));
        msg(&mut queue, 2, false, t0(), 100);
        assert!(queue.give_data(0, 64, t0()).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_expire() {
        let mut queue = Queue::new(QueueConfig {
            ttl_seconds: 60.0,
            ..cfg("ttl")
        });
        msg(&mut queue, 2, true, t0(), 8);
        queue.give_data(0, 64, t0()).unwrap();
        msg(&mut queue, 2, false, t0() + Duration::seconds(90), 9);

        let expired = queue.expire(t0() + Duration::seconds(91));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].data.len(), 8);
        assert_eq!(queue.len(), 1);
        // the expired message's ack entry went with it
        assert_eq!(queue.ack_pending(), 0);
    }

    #[test]
    fn test_expire_disabled() {
        let mut queue = Queue::new(cfg("no_ttl"));
        msg(&mut queue, 2, false, t0(), 8);
        assert!(queue.expire(t0() + Duration::days(10)).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[rstest]
    #[case::base_only(0.0, 0, 2.5)]
    #[case::aged(10.0, 20, 7.5)] // 2.5 * (1 + 20/10)
    fn test_priority_math(
        #[case] time_constant: f64,
        #[case] age_seconds: i64,
        #[case] expected: f64,
    ) {
        let mut queue = Queue::new(QueueConfig {
            priority_base: 2.5,
            priority_time_constant_seconds: time_constant,
            ..cfg("prio")
        });
        msg(&mut queue, 2, false, t0(), 8);
        let (priority, _) = queue
            .priority_values(t0() + Duration::seconds(age_seconds), 64)
            .unwrap();
        assert!((priority - expected).abs() < 1e-9);
    }

    #[test]
    fn test_blackout() {
        let mut queue = Queue::new(QueueConfig {
            blackout_seconds: 10.0,
            ..cfg("dark")
        });
        msg(&mut queue, 2, false, t0(), 8);
        msg(&mut queue, 2, false, t0(), 8);
        queue.give_data(0, 64, t0()).unwrap();

        assert!(queue.priority_values(t0() + Duration::seconds(5), 64).is_none());
        assert!(queue.priority_values(t0() + Duration::seconds(11), 64).is_some());
    }

    #[test]
    fn test_empty_queue_has_no_priority() {
        let queue = Queue::new(cfg("empty"));
        assert!(queue.priority_values(t0(), 64).is_none());
    }
}

//! Glue between the driver and the queue layer.
//!
//! The driver publishes its signals through one `DriverEvents` sink and the
//! queue manager consumes them; the host owns both and wires them once at
//! construction. Everything runs on the host's thread, so a shared
//! `Rc<RefCell<_>>` handle is all the "signal slot" there is.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::Utc;

use crate::driver::transmission::ModemTransmission;
use crate::driver::DriverEvents;
use crate::queue::QueueManager;

pub type SharedQueueManager = Rc<RefCell<QueueManager>>;

pub fn shared(manager: QueueManager) -> SharedQueueManager {
    Rc::new(RefCell::new(manager))
}

/// A driver event sink backed by the shared queue manager; pass the result
/// of [`events_sink`] into the driver's constructor.
pub fn events_sink(manager: &SharedQueueManager) -> Box<dyn DriverEvents> {
    Box::new(manager.clone())
}

impl DriverEvents for SharedQueueManager {
    fn data_request(&mut self, transmission: &mut ModemTransmission) {
        self.borrow_mut()
            .handle_modem_data_request(transmission, Utc::now());
    }

    fn receive(&mut self, transmission: ModemTransmission) {
        self.borrow_mut()
            .handle_modem_receive(&transmission);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::field_codec::CodecRegistry;
    use crate::codec::schema::{FieldSchema, FieldValue, MessageSchema, Record, WireType};
    use crate::codec::Codec;
    use crate::driver::iridium::rudics::{parse_rudics_packet, serialize_rudics_packet, RudicsEvent};
    use crate::driver::iridium::common::{parse_modem_message, serialize_modem_message};
    use crate::driver::iridium::{DriverConfig, IridiumShoreDriver};
    use crate::driver::transmission::{Rate, TransmissionType};
    use crate::queue::{OutboundMessage, QueueConfig, QueueEvents, QueueKey, QueueKind, QueuedMessage};
    use crate::codec::header::DcclHead;
    use chrono::{DateTime, Utc};
    use tokio::sync::mpsc;

    struct DropEvents;
    impl QueueEvents for DropEvents {
        fn on_receive(&mut self, _: QueueKey, _: &DcclHead, _: &Record) {}
        fn on_receive_ccl(&mut self, _: QueueKey, _: &[u8]) {}
        fn on_ack(&mut self, _: QueueKey, _: &QueuedMessage) {}
        fn on_expire(&mut self, _: QueueKey, _: &QueuedMessage) {}
        fn on_demand_request(&mut self, _: QueueKey, _: usize) -> Option<OutboundMessage> {
            None
        }
    }

    fn t0() -> DateTime<Utc> {
        "2026-08-02T12:00:00Z".parse().unwrap()
    }

    /// Full outbound path: queue manager wired to the driver, a remote on a
    /// call, a queued message, one MAC grant.
    #[test]
    fn test_driver_to_queue_wiring() {
        const SHORE_ID: u32 = 1;
        const REMOTE_ID: u32 = 5;

        let mut codec = Codec::new(CodecRegistry::new(), 64);
        codec
            .load(MessageSchema {
                id: 4,
                name: "depth_report".to_string(),
                fields: vec![FieldSchema {
                    name: "depth".to_string(),
                    required: true,
                    codec: None,
                    wire_type: WireType::Numeric {
                        min: Some(0.0),
                        max: Some(100.0),
                        precision: 0,
                    },
                }],
            })
            .unwrap();

        let mut manager = QueueManager::new(SHORE_ID, codec, Box::new(DropEvents));
        manager
            .add_queue(QueueConfig {
                kind: QueueKind::Dccl,
                id: 4,
                name: "depth".to_string(),
                ack_required: false,
                blackout_seconds: 0.0,
                max_queue_size: 0,
                newest_first: false,
                priority_base: 1.0,
                priority_time_constant_seconds: 0.0,
                ttl_seconds: 0.0,
                on_demand: false,
            })
            .unwrap();

        let manager = shared(manager);
        let mut record = Record::new(1);
        record.set(0, FieldValue::Double(55.0));
        manager
            .borrow_mut()
            .push(
                QueueKey {
                    kind: QueueKind::Dccl,
                    id: 4,
                },
                OutboundMessage::record(REMOTE_ID, record),
                t0(),
            )
            .unwrap();

        let mut driver = IridiumShoreDriver::new(
            DriverConfig {
                modem_id: SHORE_ID,
                max_frame_size: 64,
                target_bit_rate_bps: 2400,
                handshake_hangup_seconds: 30.0,
                hangup_seconds_after_empty: 60.0,
                rudics_server_port: 0,
                mo_sbd_server_port: 0,
                mt_sbd_server_address: "127.0.0.1".to_string(),
                mt_sbd_server_port: 10800,
                modem_id_to_imei: Vec::new(),
                raw_log: None,
            },
            events_sink(&manager),
        )
        .unwrap();

        // bring the remote on call: connection + one inbound data line
        let (conn_writer, mut wire_rx) = mpsc::unbounded_channel();
        driver
            .rudics_tx
            .send(RudicsEvent::Connected {
                id: 0,
                remote_endpoint: "10.0.0.9:41000".to_string(),
                writer: conn_writer,
            })
            .unwrap();
        let hello = crate::driver::transmission::ModemTransmission {
            src: REMOTE_ID,
            dest: SHORE_ID,
            rate: Rate::Rudics,
            frames: vec![Vec::new()],
            ..Default::default()
        };
        driver
            .rudics_tx
            .send(RudicsEvent::Line {
                id: 0,
                line: serialize_rudics_packet(&serialize_modem_message(&hello)).into_bytes(),
            })
            .unwrap();
        driver.do_work(t0());

        // the pacing slot fires the data request, which drains the queue
        let mut sent = None;
        while let Ok(line) = wire_rx.try_recv() {
            let parsed = parse_modem_message(&parse_rudics_packet(&line).unwrap()).unwrap();
            if !parsed.is_empty() {
                sent = Some(parsed);
            }
        }
        let sent = sent.expect("queued frame went out on the wire");
        assert_eq!(sent.msg_type, TransmissionType::Data);
        assert_eq!(sent.frames.len(), 1);

        let head = DcclHead::deser(&sent.frames[0]).unwrap();
        assert_eq!(head.dccl_id, 4);
        assert_eq!(head.dest, REMOTE_ID);
        assert!(manager
            .borrow()
            .queue(QueueKey {
                kind: QueueKind::Dccl,
                id: 4
            })
            .unwrap()
            .is_empty());
    }
}

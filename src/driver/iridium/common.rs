//! State and wire header shared by the Iridium driver family.

use chrono::{DateTime, Utc};

use crate::driver::transmission::{ModemTransmission, Rate, TransmissionType};
use crate::error::CodecError;
use crate::util::bitset::Bitset;
use crate::ModemId;

/// Call bookkeeping for one remote peer. Exists only while the peer is on a
/// RUDICS call (between the `goby` greeting and hangup).
#[derive(Clone, Debug)]
pub struct OnCall {
    /// Last write of any kind, including keepalives; drives byte pacing.
    last_tx: DateTime<Utc>,
    /// Last write that carried payload; drives the bye timer.
    last_data_tx: DateTime<Utc>,
    last_rx: Option<DateTime<Utc>>,
    bye_sent: bool,
    bye_received: bool,
    total_bytes_sent: usize,
    last_bytes_sent: usize,
}

impl OnCall {
    pub fn new(now: DateTime<Utc>) -> OnCall {
        OnCall {
            last_tx: now,
            last_data_tx: now,
            last_rx: None,
            bye_sent: false,
            bye_received: false,
            total_bytes_sent: 0,
            last_bytes_sent: 0,
        }
    }

    pub fn last_tx(&self) -> DateTime<Utc> {
        self.last_tx
    }

    pub fn last_data_tx(&self) -> DateTime<Utc> {
        self.last_data_tx
    }

    pub fn last_rx(&self) -> Option<DateTime<Utc>> {
        self.last_rx
    }

    /// Most recent of data transmission and reception; drives idle hangup.
    pub fn last_rx_tx(&self) -> DateTime<Utc> {
        match self.last_rx {
            Some(rx) => rx.max(self.last_data_tx),
            None => self.last_data_tx,
        }
    }

    pub fn bye_sent(&self) -> bool {
        self.bye_sent
    }

    pub fn bye_received(&self) -> bool {
        self.bye_received
    }

    pub fn set_bye_sent(&mut self, sent: bool) {
        self.bye_sent = sent;
    }

    pub fn set_bye_received(&mut self, received: bool) {
        self.bye_received = received;
    }

    pub fn set_last_rx(&mut self, now: DateTime<Utc>) {
        self.last_rx = Some(now);
    }

    pub fn record_tx(&mut self, now: DateTime<Utc>, bytes: usize, carried_payload: bool) {
        self.last_tx = now;
        self.last_bytes_sent = bytes;
        self.total_bytes_sent += bytes;
        if carried_payload {
            self.last_data_tx = now;
        }
    }

    pub fn last_bytes_sent(&self) -> usize {
        self.last_bytes_sent
    }

    pub fn total_bytes_sent(&self) -> usize {
        self.total_bytes_sent
    }
}

const MAX_HEADER_MODEM_ID: u64 = 30;
const MAX_HEADER_FRAME: u64 = 65535;

/// Width of an arithmetic wire integer over `[0, max]` with the reserved
/// absent value.
fn width_for_max(max: u64) -> usize {
    (((max + 2) as f64).log2()).ceil() as usize
}

/// The bit-packed header preceding the payload in every RUDICS / SBD packet.
/// Fields use the codec's arithmetic scheme (wire 0 = absent, +1 offset).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IridiumHeader {
    pub src: ModemId,
    pub dest: ModemId,
    pub rate: Option<Rate>,
    pub msg_type: TransmissionType,
    pub ack_requested: Option<bool>,
    pub frame_start: Option<u32>,
    pub acked_frame: Option<u32>,
}

impl IridiumHeader {
    pub const SERIALIZED_LEN: usize = 7;

    pub fn from_transmission(transmission: &ModemTransmission) -> IridiumHeader {
        IridiumHeader {
            src: transmission.src,
            dest: transmission.dest,
            rate: Some(transmission.rate),
            msg_type: transmission.msg_type,
            ack_requested: Some(transmission.ack_requested),
            frame_start: Some(transmission.frame_start),
            acked_frame: transmission.acked_frames.first().copied(),
        }
    }

    pub fn into_transmission(self, payload: &[u8]) -> ModemTransmission {
        ModemTransmission {
            msg_type: self.msg_type,
            src: self.src,
            dest: self.dest,
            rate: self.rate.unwrap_or(Rate::Rudics),
            ack_requested: self.ack_requested.unwrap_or(false),
            frame_start: self.frame_start.unwrap_or(0),
            max_frame_bytes: 0,
            acked_frames: self.acked_frame.into_iter().collect(),
            frames: if payload.is_empty() {
                Vec::new()
            } else {
                vec![payload.to_vec()]
            },
        }
    }

    pub fn ser(&self) -> [u8; Self::SERIALIZED_LEN] {
        fn put(bits: &mut Bitset, value: Option<u64>, max: u64) {
            let width = width_for_max(max);
            match value {
                Some(v) if v <= max => bits.push_back_unsigned(v + 1, width),
                _ => bits.append(Bitset::zeros(width)),
            }
        }

        let mut bits = Bitset::new();
        put(&mut bits, Some(u64::from(self.src)), MAX_HEADER_MODEM_ID);
        put(&mut bits, Some(u64::from(self.dest)), MAX_HEADER_MODEM_ID);
        put(&mut bits, self.rate.map(|r| r as u64), 1);
        put(&mut bits, Some(self.msg_type as u64), 1);
        put(&mut bits, self.ack_requested.map(u64::from), 1);
        put(&mut bits, self.frame_start.map(u64::from), MAX_HEADER_FRAME);
        put(&mut bits, self.acked_frame.map(u64::from), MAX_HEADER_FRAME);
        bits.append(Bitset::zeros(Self::SERIALIZED_LEN * 8 - bits.len()));

        let mut result = [0u8; Self::SERIALIZED_LEN];
        result.copy_from_slice(&bits.to_bytes());
        result
    }

    pub fn deser(bytes: &[u8]) -> Result<IridiumHeader, CodecError> {
        if bytes.len() < Self::SERIALIZED_LEN {
            return Err(CodecError::BadPacket(format!(
                "iridium packet of {} bytes is shorter than the {} byte header",
                bytes.len(),
                Self::SERIALIZED_LEN
            )));
        }
        let mut bits = Bitset::from_bytes(bytes, Self::SERIALIZED_LEN * 8)
            .expect("length checked above");
        let mut take = |max: u64| -> Option<u64> {
            let wire = bits
                .take_front(width_for_max(max))
                .expect("within checked 56 bits")
                .to_unsigned();
            wire.checked_sub(1)
        };

        let src = take(MAX_HEADER_MODEM_ID).unwrap_or(0) as ModemId;
        let dest = take(MAX_HEADER_MODEM_ID).unwrap_or(0) as ModemId;
        let rate = take(1).and_then(Rate::from_wire);
        let msg_type = match take(1) {
            Some(0) | None => TransmissionType::Data,
            Some(1) => TransmissionType::Ack,
            Some(other) => {
                return Err(CodecError::BadPacket(format!(
                    "unknown transmission type {other}"
                )))
            }
        };
        let ack_requested = take(1).map(|v| v == 1);
        let frame_start = take(MAX_HEADER_FRAME).map(|v| v as u32);
        let acked_frame = take(MAX_HEADER_FRAME).map(|v| v as u32);

        Ok(IridiumHeader {
            src,
            dest,
            rate,
            msg_type,
            ack_requested,
            frame_start,
            acked_frame,
        })
    }
}

/// Header + payload, as carried inside a rudics packet or SBD body.
pub fn serialize_modem_message(transmission: &ModemTransmission) -> Vec<u8> {
    let mut bytes = IridiumHeader::from_transmission(transmission).ser().to_vec();
    if let Some(frame) = transmission.frames.first() {
        bytes.extend_from_slice(frame);
    }
    bytes
}

/// Inverse of [`serialize_modem_message`].
pub fn parse_modem_message(bytes: &[u8]) -> Result<ModemTransmission, CodecError> {
    let header = IridiumHeader::deser(bytes)?;
    Ok(header.into_transmission(&bytes[IridiumHeader::SERIALIZED_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::ids(30, 5)]
    #[case::frames(65535, 17)]
    #[case::flag(1, 2)]
    fn test_width_for_max(#[case] max: u64, #[case] expected: usize) {
        assert_eq!(width_for_max(max), expected);
    }

    #[rstest]
    #[case::data(TransmissionType::Data, Some(Rate::Rudics), Some(true), Some(12), None)]
    #[case::ack(TransmissionType::Ack, Some(Rate::Sbd), Some(false), None, Some(12))]
    #[case::bare(TransmissionType::Data, None, None, None, None)]
    fn test_header_roundtrip(
        #[case] msg_type: TransmissionType,
        #[case] rate: Option<Rate>,
        #[case] ack_requested: Option<bool>,
        #[case] frame_start: Option<u32>,
        #[case] acked_frame: Option<u32>,
    ) {
        let header = IridiumHeader {
            src: 5,
            dest: 30,
            rate,
            msg_type,
            ack_requested,
            frame_start,
            acked_frame,
        };
        let bytes = header.ser();
        assert_eq!(IridiumHeader::deser(&bytes).unwrap(), header);
    }

    #[test]
    fn test_modem_message_roundtrip() {
        let transmission = ModemTransmission {
            msg_type: TransmissionType::Data,
            src: 2,
            dest: 1,
            rate: Rate::Rudics,
            ack_requested: true,
            frame_start: 9,
            max_frame_bytes: 0,
            acked_frames: Vec::new(),
            frames: vec![vec![0x20, 1, 2, 3]],
        };
        let bytes = serialize_modem_message(&transmission);
        assert_eq!(bytes.len(), IridiumHeader::SERIALIZED_LEN + 4);
        let parsed = parse_modem_message(&bytes).unwrap();
        assert_eq!(parsed, transmission);
    }

    #[test]
    fn test_zero_body_message_roundtrip() {
        let keepalive = ModemTransmission {
            src: 1,
            dest: 2,
            frame_start: 3,
            ..ModemTransmission::default()
        };
        let bytes = serialize_modem_message(&keepalive);
        assert_eq!(bytes.len(), IridiumHeader::SERIALIZED_LEN);
        let parsed = parse_modem_message(&bytes).unwrap();
        assert!(parsed.frames.is_empty());
        assert_eq!(parsed.src, 1);
        assert_eq!(parsed.dest, 2);
    }

    #[test]
    fn test_header_too_short() {
        assert!(matches!(
            IridiumHeader::deser(&[1, 2, 3]),
            Err(CodecError::BadPacket(_))
        ));
    }

    #[test]
    fn test_on_call_bookkeeping() {
        let t0: DateTime<Utc> = "2026-08-02T12:00:00Z".parse().unwrap();
        let mut on_call = OnCall::new(t0);
        assert_eq!(on_call.last_rx_tx(), t0);

        let t1 = t0 + chrono::Duration::seconds(5);
        on_call.record_tx(t1, 100, true);
        assert_eq!(on_call.last_tx(), t1);
        assert_eq!(on_call.last_data_tx(), t1);
        assert_eq!(on_call.last_bytes_sent(), 100);

        // a keepalive advances pacing but not the data timer
        let t2 = t1 + chrono::Duration::seconds(5);
        on_call.record_tx(t2, 20, false);
        assert_eq!(on_call.last_tx(), t2);
        assert_eq!(on_call.last_data_tx(), t1);
        assert_eq!(on_call.total_bytes_sent(), 120);

        let t3 = t2 + chrono::Duration::seconds(5);
        on_call.set_last_rx(t3);
        assert_eq!(on_call.last_rx_tx(), t3);
    }
}

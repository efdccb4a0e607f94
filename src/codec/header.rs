//! The fixed head that starts every frame of this stack.
//!
//! Byte 0 carries the CCL id so that legacy single-byte-identified messages
//! can share the link; [`DCCL_CCL_ID`] is the value reserved for this codec.
//! Bytes 1..7 are bit-packed:
//!
//! ```ascii
//! 0:  schema id (9 bits)
//! 9:  time of day, seconds since UTC midnight (17 bits)
//! 26: source modem id (5 bits)
//! 31: destination modem id (5 bits)
//! 36: multimessage flag (1 bit)
//! 37: broadcast flag (1 bit)
//! 38: zero padding to 48 bits
//! ```

use chrono::{DateTime, Timelike, Utc};

use crate::error::CodecError;
use crate::util::bitset::Bitset;
use crate::ModemId;

/// CCL id byte reserved for frames of this codec.
pub const DCCL_CCL_ID: u8 = 0x20;

/// Total head length including the CCL id byte.
pub const HEAD_BYTES: usize = 7;

const HEAD_BITS: usize = 48;
const ID_BITS: usize = 9;
const TIME_BITS: usize = 17;
const MODEM_ID_BITS: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DcclHead {
    pub ccl_id: u8,
    pub dccl_id: u32,
    /// Seconds since UTC midnight, [0, 86400).
    pub time_of_day_secs: u32,
    pub src: ModemId,
    pub dest: ModemId,
    pub multimessage: bool,
    pub broadcast: bool,
}

impl DcclHead {
    pub fn new(dccl_id: u32, src: ModemId, dest: ModemId, time: DateTime<Utc>) -> DcclHead {
        DcclHead {
            ccl_id: DCCL_CCL_ID,
            dccl_id,
            time_of_day_secs: time.time().num_seconds_from_midnight(),
            src,
            dest,
            multimessage: false,
            broadcast: false,
        }
    }

    pub fn ser(&self) -> [u8; HEAD_BYTES] {
        let mut bits = Bitset::new();
        bits.push_back_unsigned(u64::from(self.dccl_id), ID_BITS);
        bits.push_back_unsigned(u64::from(self.time_of_day_secs), TIME_BITS);
        bits.push_back_unsigned(u64::from(self.src), MODEM_ID_BITS);
        bits.push_back_unsigned(u64::from(self.dest), MODEM_ID_BITS);
        bits.push_back(self.multimessage);
        bits.push_back(self.broadcast);
        bits.append(Bitset::zeros(HEAD_BITS - bits.len()));

        let mut result = [0u8; HEAD_BYTES];
        result[0] = self.ccl_id;
        result[1..].copy_from_slice(&bits.to_bytes());
        result
    }

    pub fn deser(bytes: &[u8]) -> Result<DcclHead, CodecError> {
        if bytes.len() < HEAD_BYTES {
            return Err(CodecError::BadPacket(format!(
                "frame of {} bytes is shorter than the {} byte head",
                bytes.len(),
                HEAD_BYTES
            )));
        }

        let mut bits = Bitset::from_bytes(&bytes[1..HEAD_BYTES], HEAD_BITS)
            .expect("head length checked above");

        let mut take = |n: usize| bits.take_front(n).expect("within checked 48 bits").to_unsigned();
        Ok(DcclHead {
            ccl_id: bytes[0],
            dccl_id: take(ID_BITS) as u32,
            time_of_day_secs: take(TIME_BITS) as u32,
            src: take(MODEM_ID_BITS) as ModemId,
            dest: take(MODEM_ID_BITS) as ModemId,
            multimessage: take(1) == 1,
            broadcast: take(1) == 1,
        })
    }

    /// Rewrites the head in place at the front of an encoded frame.
    pub fn overwrite(&self, frame: &mut [u8]) {
        frame[..HEAD_BYTES].copy_from_slice(&self.ser());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zeroes(0, 0, 0, 0, false, false)]
    #[case::plain(4, 3661, 1, 2, false, false)]
    #[case::max_id(511, 86399, 31, 31, true, true)]
    #[case::broadcast(17, 43200, 5, 0, false, true)]
    fn test_roundtrip(
        #[case] dccl_id: u32,
        #[case] tod: u32,
        #[case] src: ModemId,
        #[case] dest: ModemId,
        #[case] multimessage: bool,
        #[case] broadcast: bool,
    ) {
        let head = DcclHead {
            ccl_id: DCCL_CCL_ID,
            dccl_id,
            time_of_day_secs: tod,
            src,
            dest,
            multimessage,
            broadcast,
        };
        let bytes = head.ser();
        assert_eq!(bytes.len(), HEAD_BYTES);
        assert_eq!(bytes[0], DCCL_CCL_ID);
        assert_eq!(DcclHead::deser(&bytes).unwrap(), head);
    }

    #[test]
    fn test_deser_too_short() {
        assert!(matches!(
            DcclHead::deser(&[DCCL_CCL_ID, 0, 0]),
            Err(CodecError::BadPacket(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let head = DcclHead::new(9, 2, 3, Utc::now());
        let mut bytes = head.ser().to_vec();
        bytes.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(DcclHead::deser(&bytes).unwrap(), head);
    }
}

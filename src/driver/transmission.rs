//! The neutral transmission record passed between MAC, driver and queue
//! layers.

use crate::{ModemId, BROADCAST_ID};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmissionType {
    Data,
    Ack,
}

/// Link service class. The wire values matter: SBD is 0, RUDICS is 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rate {
    Sbd = 0,
    Rudics = 1,
}

impl Rate {
    pub fn from_wire(value: u64) -> Option<Rate> {
        match value {
            0 => Some(Rate::Sbd),
            1 => Some(Rate::Rudics),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModemTransmission {
    pub msg_type: TransmissionType,
    pub src: ModemId,
    pub dest: ModemId,
    pub rate: Rate,
    /// Sender requests a per-frame acknowledgment.
    pub ack_requested: bool,
    /// Number of the first frame in this transmission.
    pub frame_start: u32,
    /// Capacity granted to the queue layer for each frame.
    pub max_frame_bytes: usize,
    pub acked_frames: Vec<u32>,
    pub frames: Vec<Vec<u8>>,
}

impl Default for ModemTransmission {
    fn default() -> ModemTransmission {
        ModemTransmission {
            msg_type: TransmissionType::Data,
            src: BROADCAST_ID,
            dest: BROADCAST_ID,
            rate: Rate::Rudics,
            ack_requested: false,
            frame_start: 0,
            max_frame_bytes: 0,
            acked_frames: Vec::new(),
            frames: Vec::new(),
        }
    }
}

impl ModemTransmission {
    /// True when there is no payload at all (a keepalive, or an ACK).
    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(Vec::is_empty)
    }
}

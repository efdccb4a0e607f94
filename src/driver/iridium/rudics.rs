//! RUDICS: a plain TCP session through the Iridium ground station.
//!
//! The wire is line-delimited ASCII (`\r` terminated). Control lines are the
//! bare words `goby` (call start) and `bye` (hangup request); everything else
//! is a hex-encoded binary packet:
//!
//! ```ascii
//! 0: start of frame, 0x7e
//! 1: payload length, u16 BE
//! 3: payload
//! *: CRC-16/XMODEM over the payload, u16 BE
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crc::Crc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::error::CodecError;
use crate::util::hex::{hex_decode, hex_encode};

const START_OF_FRAME: u8 = 0x7e;
const CRC16: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// Frames `payload` into one wire line, trailing `\r` included.
pub fn serialize_rudics_packet(payload: &[u8]) -> String {
    let mut raw = Vec::with_capacity(payload.len() + 5);
    raw.push(START_OF_FRAME);
    raw.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    raw.extend_from_slice(payload);
    raw.extend_from_slice(&CRC16.checksum(payload).to_be_bytes());

    let mut line = hex_encode(&raw);
    line.push('\r');
    line
}

/// Inverse of [`serialize_rudics_packet`]. Tolerates a leading NUL byte
/// (an Iridium transmission artifact) and a trailing `\r`.
pub fn parse_rudics_packet(line: &[u8]) -> Result<Vec<u8>, CodecError> {
    let line = line.strip_prefix(b"\0").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let text = std::str::from_utf8(line)
        .map_err(|_| CodecError::BadPacket("rudics line is not ASCII".to_string()))?;
    let raw = hex_decode(text)
        .ok_or_else(|| CodecError::BadPacket("rudics line is not valid hex".to_string()))?;

    if raw.len() < 5 {
        return Err(CodecError::BadPacket(format!(
            "rudics packet of {} bytes is shorter than its framing",
            raw.len()
        )));
    }
    if raw[0] != START_OF_FRAME {
        return Err(CodecError::BadPacket(format!(
            "rudics packet starts with {:#04x}, not {:#04x}",
            raw[0], START_OF_FRAME
        )));
    }
    let declared_len = u16::from_be_bytes([raw[1], raw[2]]) as usize;
    if raw.len() != declared_len + 5 {
        return Err(CodecError::BadPacket(format!(
            "rudics packet declares {} payload bytes but carries {}",
            declared_len,
            raw.len() - 5
        )));
    }
    let payload = &raw[3..3 + declared_len];
    let declared_crc = u16::from_be_bytes([raw[3 + declared_len], raw[4 + declared_len]]);
    let actual_crc = CRC16.checksum(payload);
    if declared_crc != actual_crc {
        return Err(CodecError::BadPacket(format!(
            "rudics packet CRC {declared_crc:#06x} does not match computed {actual_crc:#06x}"
        )));
    }
    Ok(payload.to_vec())
}

pub type ConnId = u64;

/// Everything the connection tasks report back to the driver's `do_work`.
#[derive(Debug)]
pub enum RudicsEvent {
    Connected {
        id: ConnId,
        remote_endpoint: String,
        writer: mpsc::UnboundedSender<Vec<u8>>,
    },
    /// One `\r`-terminated line, terminator included.
    Line { id: ConnId, line: Vec<u8> },
    Disconnected { id: ConnId },
}

/// Listening socket for inbound RUDICS calls. Each accepted connection gets
/// a reader and a writer task; everything they observe funnels into one
/// event channel that the driver drains on its own thread.
pub struct RudicsServer {
    local_port: u16,
    accept_task: tokio::task::JoinHandle<()>,
}

impl RudicsServer {
    pub async fn bind(
        port: u16,
        events: mpsc::UnboundedSender<RudicsEvent>,
    ) -> anyhow::Result<RudicsServer> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();
        debug!(port = local_port, "RUDICS server listening");

        let next_id = Arc::new(AtomicU64::new(0));
        let accept_task = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "RUDICS accept failed");
                        continue;
                    }
                };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                debug!(id, %peer, "RUDICS connection accepted");

                let (read_half, write_half) = socket.into_split();
                let (write_tx, write_rx) = mpsc::unbounded_channel();

                if events
                    .send(RudicsEvent::Connected {
                        id,
                        remote_endpoint: peer.to_string(),
                        writer: write_tx,
                    })
                    .is_err()
                {
                    return; // driver is gone
                }
                tokio::spawn(read_lines(id, read_half, events.clone()));
                tokio::spawn(write_lines(id, write_half, write_rx));
            }
        });

        Ok(RudicsServer {
            local_port,
            accept_task,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Drop for RudicsServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn read_lines(
    id: ConnId,
    read_half: OwnedReadHalf,
    events: mpsc::UnboundedSender<RudicsEvent>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\r', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                trace!(id, bytes = line.len(), "RUDICS line received");
                if events.send(RudicsEvent::Line { id, line }).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(id, error = %e, "RUDICS read failed");
                break;
            }
        }
    }
    let _ = events.send(RudicsEvent::Disconnected { id });
}

async fn write_lines(
    id: ConnId,
    mut write_half: OwnedWriteHalf,
    mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = write_rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            debug!(id, error = %e, "RUDICS write failed");
            return;
        }
    }
    // sender dropped: the driver hung up on this connection
    let _ = write_half.shutdown().await;
}

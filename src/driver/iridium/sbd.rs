//! Iridium Short Burst Data over DirectIP.
//!
//! Both directions share the same envelope: a 3-byte pre-header
//! `{protocol = 1, overall_length u16 BE}` followed by IEI-tagged segments
//! `{iei u8, length u16 BE, bytes}`. Mobile-originated sessions arrive on our
//! listening socket (header IEI 0x01, payload IEI 0x02); mobile-terminated
//! messages are pushed to the gateway (header IEI 0x41, payload IEI 0x42)
//! which answers with a confirmation.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::error::CodecError;

pub const PROTOCOL_VERSION: u8 = 1;
const PRE_HEADER_SIZE: usize = 3;

const IEI_MO_HEADER: u8 = 0x01;
const IEI_MO_PAYLOAD: u8 = 0x02;
const IEI_MT_HEADER: u8 = 0x41;
const IEI_MT_PAYLOAD: u8 = 0x42;
const IEI_MT_CONFIRMATION: u8 = 0x44;

const MT_HEADER_LEN: u16 = 21;
const DISP_FLAG_FLUSH_MT_QUEUE: u16 = 0x0001;
pub const IMEI_LEN: usize = 15;

/// How long a gateway or field unit gets to finish one exchange.
pub const SBD_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// A complete mobile-originated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbdMoMessage {
    pub imei: Option<String>,
    pub payload: Vec<u8>,
    pub remote_endpoint: String,
}

/// Splits the segment area of a DirectIP message (pre-header already
/// consumed). Unknown IEIs are skipped by their declared length.
fn parse_mo_segments(mut buf: &[u8], remote_endpoint: &str) -> Result<SbdMoMessage, CodecError> {
    let mut imei = None;
    let mut payload = None;

    while buf.remaining() >= 3 {
        let iei = buf.get_u8();
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(CodecError::BadPacket(format!(
                "SBD segment {iei:#04x} declares {len} bytes but only {} remain",
                buf.remaining()
            )));
        }
        let segment = &buf[..len];
        match iei {
            IEI_MO_HEADER => {
                // cdr reference (4), imei (15), status (1), momsn (2), mtmsn (2), time (4)
                if len >= 4 + IMEI_LEN {
                    imei = Some(String::from_utf8_lossy(&segment[4..4 + IMEI_LEN]).into_owned());
                }
            }
            IEI_MO_PAYLOAD => payload = Some(segment.to_vec()),
            other => trace!(iei = other, len, "skipping unknown SBD segment"),
        }
        buf.advance(len);
    }

    let payload = payload.ok_or_else(|| {
        CodecError::BadPacket("SBD MO message carries no payload segment".to_string())
    })?;
    Ok(SbdMoMessage {
        imei,
        payload,
        remote_endpoint: remote_endpoint.to_string(),
    })
}

/// Reads one complete DirectIP message off a socket.
async fn read_directip_message(socket: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut pre_header = [0u8; PRE_HEADER_SIZE];
    socket.read_exact(&mut pre_header).await?;
    if pre_header[0] != PROTOCOL_VERSION {
        anyhow::bail!("unsupported DirectIP protocol revision {}", pre_header[0]);
    }
    let overall_len = u16::from_be_bytes([pre_header[1], pre_header[2]]) as usize;
    let mut body = vec![0u8; overall_len];
    socket.read_exact(&mut body).await?;
    Ok(body)
}

/// Listening socket for mobile-originated sessions. Complete messages funnel
/// into one channel drained by the driver; connections that don't finish
/// within [`SBD_SESSION_TIMEOUT`] are dropped.
pub struct SbdServer {
    local_port: u16,
    accept_task: tokio::task::JoinHandle<()>,
}

impl SbdServer {
    pub async fn bind(
        port: u16,
        messages: mpsc::UnboundedSender<SbdMoMessage>,
    ) -> anyhow::Result<SbdServer> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();
        debug!(port = local_port, "SBD MO server listening");

        let accept_task = tokio::spawn(async move {
            loop {
                let (mut socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "SBD accept failed");
                        continue;
                    }
                };
                let messages = messages.clone();
                tokio::spawn(async move {
                    match timeout(SBD_SESSION_TIMEOUT, read_directip_message(&mut socket)).await {
                        Ok(Ok(body)) => match parse_mo_segments(&body, &peer.to_string()) {
                            Ok(message) => {
                                let _ = messages.send(message);
                            }
                            Err(e) => debug!(%peer, error = %e, "could not decode SBD MO message"),
                        },
                        Ok(Err(e)) => debug!(%peer, error = %e, "SBD MO read failed"),
                        Err(_) => debug!(%peer, "removing SBD connection that has timed out"),
                    }
                });
            }
        });

        Ok(SbdServer {
            local_port,
            accept_task,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Drop for SbdServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Frames one mobile-terminated message, pre-header included.
pub fn create_mt_message(client_id: u32, imei: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(imei.len(), IMEI_LEN, "IMEI must be {IMEI_LEN} digits");

    let mut imei_bytes = [0u8; IMEI_LEN];
    let imei_len = imei.len().min(IMEI_LEN);
    imei_bytes[..imei_len].copy_from_slice(&imei.as_bytes()[..imei_len]);

    let mut segments = BytesMut::new();
    segments.put_u8(IEI_MT_HEADER);
    segments.put_u16(MT_HEADER_LEN);
    segments.put_u32(client_id);
    segments.put_slice(&imei_bytes);
    segments.put_u16(DISP_FLAG_FLUSH_MT_QUEUE);

    segments.put_u8(IEI_MT_PAYLOAD);
    segments.put_u16(payload.len() as u16);
    segments.put_slice(payload);

    let mut message = BytesMut::with_capacity(PRE_HEADER_SIZE + segments.len());
    message.put_u8(PROTOCOL_VERSION);
    message.put_u16(segments.len() as u16);
    message.put_slice(&segments);
    message.to_vec()
}

/// Connects to the DirectIP gateway, pushes one MT message and waits for the
/// confirmation. Failures are logged, never propagated past the caller.
pub async fn send_mt_message(
    address: &str,
    port: u16,
    message: &[u8],
    session_timeout: Duration,
) -> anyhow::Result<()> {
    let mut socket = timeout(session_timeout, TcpStream::connect((address, port))).await??;
    socket.write_all(message).await?;

    match timeout(session_timeout, read_directip_message(&mut socket)).await {
        Ok(Ok(body)) => {
            if body.first() == Some(&IEI_MT_CONFIRMATION) {
                debug!("SBD MT confirmation received");
            } else {
                debug!(iei = ?body.first(), "SBD gateway answered with an unexpected segment");
            }
        }
        Ok(Err(e)) => warn!(error = %e, "SBD MT confirmation read failed"),
        Err(_) => warn!("timeout waiting for confirmation from the DirectIP gateway"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMEI: &str = "300234010123450";

    #[test]
    fn test_mt_message_layout() {
        let message = create_mt_message(7, IMEI, &[0xaa, 0xbb, 0xcc]);

        // pre-header
        assert_eq!(message[0], PROTOCOL_VERSION);
        let overall = u16::from_be_bytes([message[1], message[2]]) as usize;
        assert_eq!(overall, message.len() - PRE_HEADER_SIZE);

        // MT header segment
        assert_eq!(message[3], IEI_MT_HEADER);
        assert_eq!(u16::from_be_bytes([message[4], message[5]]), MT_HEADER_LEN);
        assert_eq!(u32::from_be_bytes([message[6], message[7], message[8], message[9]]), 7);
        assert_eq!(&message[10..25], IMEI.as_bytes());
        assert_eq!(
            u16::from_be_bytes([message[25], message[26]]),
            DISP_FLAG_FLUSH_MT_QUEUE
        );

        // payload segment
        assert_eq!(message[27], IEI_MT_PAYLOAD);
        assert_eq!(u16::from_be_bytes([message[28], message[29]]), 3);
        assert_eq!(&message[30..], &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_mo_segments_roundtrip() {
        let mut body = BytesMut::new();
        body.put_u8(IEI_MO_HEADER);
        body.put_u16(28);
        body.put_u32(42); // cdr reference
        body.put_slice(IMEI.as_bytes());
        body.put_u8(0); // session status
        body.put_u16(1); // momsn
        body.put_u16(0); // mtmsn
        body.put_u32(0); // session time
        body.put_u8(IEI_MO_PAYLOAD);
        body.put_u16(4);
        body.put_slice(&[9, 8, 7, 6]);

        let message = parse_mo_segments(&body, "1.2.3.4:5").unwrap();
        assert_eq!(message.imei.as_deref(), Some(IMEI));
        assert_eq!(message.payload, vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_mo_unknown_segment_skipped() {
        let mut body = BytesMut::new();
        body.put_u8(0x77);
        body.put_u16(2);
        body.put_slice(&[0, 0]);
        body.put_u8(IEI_MO_PAYLOAD);
        body.put_u16(1);
        body.put_u8(5);

        let message = parse_mo_segments(&body, "1.2.3.4:5").unwrap();
        assert_eq!(message.imei, None);
        assert_eq!(message.payload, vec![5]);
    }

    #[test]
    fn test_mo_missing_payload_rejected() {
        let mut body = BytesMut::new();
        body.put_u8(IEI_MO_HEADER);
        body.put_u16(0);
        assert!(matches!(
            parse_mo_segments(&body, "1.2.3.4:5"),
            Err(CodecError::BadPacket(_))
        ));
    }

    #[test]
    fn test_mo_truncated_segment_rejected() {
        let mut body = BytesMut::new();
        body.put_u8(IEI_MO_PAYLOAD);
        body.put_u16(10);
        body.put_u8(1);
        assert!(matches!(
            parse_mo_segments(&body, "1.2.3.4:5"),
            Err(CodecError::BadPacket(_))
        ));
    }

    #[tokio::test]
    async fn test_mo_server_end_to_end() {
        let (messages_tx, mut messages_rx) = mpsc::unbounded_channel();
        let server = SbdServer::bind(0, messages_tx).await.unwrap();

        let mut body = BytesMut::new();
        body.put_u8(IEI_MO_PAYLOAD);
        body.put_u16(3);
        body.put_slice(&[1, 2, 3]);
        let mut wire = BytesMut::new();
        wire.put_u8(PROTOCOL_VERSION);
        wire.put_u16(body.len() as u16);
        wire.put_slice(&body);

        let mut client = TcpStream::connect(("127.0.0.1", server.local_port()))
            .await
            .unwrap();
        client.write_all(&wire).await.unwrap();

        let message = messages_rx.recv().await.unwrap();
        assert_eq!(message.payload, vec![1, 2, 3]);
    }

    /// MT round trip against a fake gateway that never confirms: the send
    /// must tolerate the timeout without failing.
    #[tokio::test]
    async fn test_mt_send_with_silent_gateway() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let gateway = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            // read until the client gives up; never answer
            let mut buf = [0u8; 256];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                }
            }
            received
        });

        let message = create_mt_message(1, IMEI, &[1, 2, 3]);
        send_mt_message("127.0.0.1", port, &message, Duration::from_millis(100))
            .await
            .unwrap();

        // dropping our socket lets the gateway task finish
        let received = gateway.await.unwrap();
        assert_eq!(received, message);
    }
}

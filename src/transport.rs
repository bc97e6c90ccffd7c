//! Inbound transport boundary.
//!
//! The MQTT client lives outside this crate. Whatever holds the subscription pushes
//! [`InboundMessage`]s into an mpsc channel; the collector drains it. The bundled bridge
//! reads the line format printed by `mosquitto_sub -F '%t %x'`:
//!
//! ```text
//! msh/EU/2/e/LongFast/!a1b2c3d4 0a2b0d...
//! ```
//!
//! one message per line, topic and hex payload separated by whitespace. Blank lines and
//! lines starting with `#` are skipped.

use log::{debug, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::logutil::truncate_for_log;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Unix seconds at which the transport handed the message over.
    pub received_at: i64,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CaptureLineError {
    #[error("line has no payload after the topic")]
    MissingPayload,
    #[error("payload is not valid hex: {0}")]
    BadHex(#[from] hex::FromHexError),
}

/// Parse one capture line. `Ok(None)` for blank and comment lines.
pub fn parse_capture_line(line: &str) -> Result<Option<(String, Vec<u8>)>, CaptureLineError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (topic, rest) = line
        .split_once(char::is_whitespace)
        .ok_or(CaptureLineError::MissingPayload)?;
    let hex_payload = rest.trim();
    if hex_payload.is_empty() {
        return Err(CaptureLineError::MissingPayload);
    }
    Ok(Some((topic.to_string(), hex::decode(hex_payload)?)))
}

/// Read capture lines until EOF, forwarding each message. Malformed lines are logged and
/// skipped. Returns the number of messages forwarded; stops early if the receiver closed.
pub async fn pump_lines<R>(reader: R, tx: mpsc::Sender<InboundMessage>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0usize;
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        match parse_capture_line(&line) {
            Ok(Some((topic, payload))) => {
                if tx.send(InboundMessage::new(topic, payload)).await.is_err() {
                    debug!("inbound channel closed; stopping capture reader");
                    break;
                }
                forwarded += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(
                "capture line {} skipped ({}): {}",
                line_no,
                e,
                truncate_for_log(&line, 120)
            ),
        }
    }
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_topic_and_hex() {
        assert_eq!(
            parse_capture_line("msh/EU/2/e/LongFast/!1 0a0b\n"),
            Ok(Some(("msh/EU/2/e/LongFast/!1".to_string(), vec![0x0a, 0x0b])))
        );
        assert_eq!(parse_capture_line("   "), Ok(None));
        assert_eq!(parse_capture_line("# comment"), Ok(None));
        assert_eq!(
            parse_capture_line("msh/only-topic"),
            Err(CaptureLineError::MissingPayload)
        );
        assert!(matches!(
            parse_capture_line("msh/x zz"),
            Err(CaptureLineError::BadHex(_))
        ));
    }

    #[tokio::test]
    async fn pump_skips_bad_lines() {
        let input = b"msh/a 01\nbroken\n\nmsh/b 0203\n" as &[u8];
        let (tx, mut rx) = mpsc::channel(8);
        let n = pump_lines(input, tx).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(rx.recv().await.unwrap().payload, vec![1]);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.topic, "msh/b");
        assert_eq!(second.payload, vec![2, 3]);
        assert!(rx.recv().await.is_none());
    }
}

//! Reply framing and decoding.
//!
//! Bytes are buffered until a full `0x8D 0x8A` terminated record is present.
//! A bad record is reported as [`ProtocolError::Malformed`] and skipped up to
//! its terminator, so later replies still decode.

use std::collections::VecDeque;

use super::command::{Command, ReplyKind, HIGH_BIT, REPLY_TERMINATOR};
use crate::error::ProtocolError;
use crate::types::{CommandId, Pressures};

/// Longest reply accepted, terminator excluded.
pub const MAX_RECORD_LEN: usize = 128;

/// A decoded reply paired with the command that asked for it.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Telemetry {
        command_id: CommandId,
        frequency_raw: f64,
        pressures: Pressures,
    },
    Ack {
        command_id: CommandId,
    },
    Nack {
        command_id: CommandId,
        reason: String,
    },
    Status {
        command_id: CommandId,
        fields: Vec<String>,
    },
}

impl Frame {
    pub fn command_id(&self) -> CommandId {
        match self {
            Frame::Telemetry { command_id, .. }
            | Frame::Ack { command_id }
            | Frame::Nack { command_id, .. }
            | Frame::Status { command_id, .. } => *command_id,
        }
    }
}

/// Incremental decoder for one connection. Call [`FrameDecoder::reset`] (or
/// build a new one) when the connection is replaced.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    pending: VecDeque<(CommandId, Command)>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command whose reply is expected next (after any earlier ones).
    pub fn expect_reply(&mut self, id: CommandId, command: Command) {
        self.pending.push_back((id, command));
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        if let Some(end) = find_terminator(&self.buffer) {
            let record: Vec<u8> = self.buffer.drain(..end + REPLY_TERMINATOR.len()).collect();
            return Some(self.interpret(&record[..end]));
        }

        if self.buffer.len() > MAX_RECORD_LEN + 1 {
            // Keep a trailing half terminator so the next chunk can complete it.
            let keep = usize::from(self.buffer.last() == Some(&REPLY_TERMINATOR[0]));
            let dropped = self.buffer.len() - keep;
            self.buffer.drain(..dropped);
            return Some(Err(ProtocolError::Malformed {
                command_id: None,
                detail: format!("{} bytes without a terminator discarded", dropped),
            }));
        }

        None
    }

    /// Push a chunk and drain every frame it completes.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Result<Frame, ProtocolError>> {
        self.push(bytes);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Drop buffered bytes and forget outstanding commands.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending.clear();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn interpret(&mut self, record: &[u8]) -> Result<Frame, ProtocolError> {
        let Some((command_id, command)) = self.pending.pop_front() else {
            return Err(ProtocolError::Malformed {
                command_id: None,
                detail: "reply with no outstanding command".to_string(),
            });
        };
        let malformed = |detail: String| ProtocolError::Malformed {
            command_id: Some(command_id),
            detail,
        };

        if record.len() > MAX_RECORD_LEN {
            return Err(malformed(format!(
                "record of {} bytes exceeds {}",
                record.len(),
                MAX_RECORD_LEN
            )));
        }

        let text = decode_text(record).map_err(malformed)?;
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(malformed(format!("empty reply to {}", command)));
        }

        match command.reply_kind() {
            ReplyKind::Telemetry => {
                if tokens.len() != 5 {
                    return Err(malformed(format!(
                        "status reply has {} fields, expected 5",
                        tokens.len()
                    )));
                }
                let frequency_raw = tokens[1]
                    .parse::<f64>()
                    .map_err(|_| malformed(format!("spin rate '{}' is not a number", tokens[1])))?;
                let pressure = |idx: usize| {
                    tokens[idx].parse::<u32>().map_err(|_| {
                        malformed(format!("pressure '{}' is not a number", tokens[idx]))
                    })
                };
                Ok(Frame::Telemetry {
                    command_id,
                    frequency_raw,
                    pressures: Pressures {
                        drive_mbar: pressure(2)?,
                        bearing_mbar: pressure(3)?,
                        sense_mbar: pressure(4)?,
                    },
                })
            }
            ReplyKind::Status => Ok(Frame::Status {
                command_id,
                fields: tokens.iter().map(|t| t.to_string()).collect(),
            }),
            ReplyKind::Ack => {
                if tokens == ["OK"] {
                    Ok(Frame::Ack { command_id })
                } else {
                    Ok(Frame::Nack {
                        command_id,
                        reason: tokens.join(" "),
                    })
                }
            }
        }
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == REPLY_TERMINATOR)
}

fn decode_text(record: &[u8]) -> Result<String, String> {
    record
        .iter()
        .map(|&b| {
            if b & HIGH_BIT == 0 {
                return Err(format!("byte 0x{:02x} lacks the high bit", b));
            }
            let c = b & !HIGH_BIT;
            if (0x20..=0x7E).contains(&c) {
                Ok(c as char)
            } else {
                Err(format!("control byte 0x{:02x} inside reply", b))
            }
        })
        .collect()
}

/// Encode a reply as the controller would send it.
pub fn encode_reply(text: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = text.bytes().map(|b| b | HIGH_BIT).collect();
    bytes.extend_from_slice(&REPLY_TERMINATOR);
    bytes
}

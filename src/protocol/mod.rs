//! # Bruker MAS wire protocol
//!
//! The controller speaks 7-bit ASCII with the high bit of every byte set.
//! Commands end with `0x8D` and replies end with `0x8D 0x8A`. The protocol is
//! strictly request/response, so replies carry no id: the decoder pairs each
//! reply with the oldest command still waiting for one.

pub mod codec;
pub mod command;

pub use codec::{encode_reply, Frame, FrameDecoder, MAX_RECORD_LEN};
pub use command::{
    encode, Command, ReplyKind, COMMAND_TERMINATOR, HIGH_BIT, REPLY_TERMINATOR,
};

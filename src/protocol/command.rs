//! Controller command set and encoder.

use std::fmt;

/// High bit set on every byte exchanged with the controller.
pub const HIGH_BIT: u8 = 0x80;

/// `'\r'` with the high bit set; ends every command.
pub const COMMAND_TERMINATOR: u8 = b'\r' | HIGH_BIT;

/// `"\r\n"` with the high bit set; ends every reply.
pub const REPLY_TERMINATOR: [u8; 2] = [b'\r' | HIGH_BIT, b'\n' | HIGH_BIT];

/// Commands this engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `AS`: spin rate and the three pressures
    AllStatus,
    /// `VD`: spin rate set point
    ReadSpinSet,
    /// `MA`: link test, answered with `OK`
    LinkTest,
    /// `GM`: put the controller in manual (pressure) mode
    ManualMode,
    /// `GA`: put the controller in its own automatic mode
    AutoMode,
    /// `DP n`: drive pressure in mbar
    SetDrivePressure(u16),
    /// `BP n`: bearing pressure in mbar
    SetBearingPressure(u16),
    /// `DS n`: spin set point in Hz
    SetSpinRate(u32),
}

/// Shape of the reply a command produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `tag spin drive bearing sense`
    Telemetry,
    /// Free-form value list
    Status,
    /// `OK` or a refusal
    Ack,
}

impl Command {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Command::AllStatus => "AS",
            Command::ReadSpinSet => "VD",
            Command::LinkTest => "MA",
            Command::ManualMode => "GM",
            Command::AutoMode => "GA",
            Command::SetDrivePressure(_) => "DP",
            Command::SetBearingPressure(_) => "BP",
            Command::SetSpinRate(_) => "DS",
        }
    }

    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            Command::AllStatus => ReplyKind::Telemetry,
            Command::ReadSpinSet => ReplyKind::Status,
            _ => ReplyKind::Ack,
        }
    }

    fn argument(&self) -> Option<u32> {
        match *self {
            Command::SetDrivePressure(mbar) | Command::SetBearingPressure(mbar) => {
                Some(u32::from(mbar))
            }
            Command::SetSpinRate(hz) => Some(hz),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.argument() {
            Some(arg) => write!(f, "{} {}", self.mnemonic(), arg),
            None => f.write_str(self.mnemonic()),
        }
    }
}

/// Encode a command for the wire.
pub fn encode(command: &Command) -> Vec<u8> {
    let text = command.to_string();
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend(text.bytes().map(|b| b | HIGH_BIT));
    bytes.push(COMMAND_TERMINATOR);
    bytes
}

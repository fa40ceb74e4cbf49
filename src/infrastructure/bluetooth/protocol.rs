//! Powered Up Remote Protocol
//!
//! Identifiers, outbound commands and notification decoding for the LEGO
//! Wireless Protocol as spoken by the two-handle Powered Up remote.
//!
//! Every frame starts with the same header:
//!
//! ```text
//! [0] : Frame length (including this byte)
//! [1] : Hub id (always 0x00)
//! [2] : Message type
//! [3] : Port id
//! [4..] : Payload
//! ```

use crate::domain::buttons::{ButtonFrame, Paddle, PaddleFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

/// LEGO Hub Service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x00001623_1212_efde_1623_785feabcd123);

/// LEGO Hub Characteristic UUID - commands are written and notifications received here
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x00001624_1212_efde_1623_785feabcd123);

/// Product identifier of the remote inside the manufacturer payload
pub const REMOTE_PRODUCT_ID: u8 = 0x42;

/// Offset of the product identifier within the manufacturer payload
/// (after the 2-byte company identifier has been stripped)
pub const PRODUCT_ID_OFFSET: usize = 1;

/// Bluetooth SIG company identifier of LEGO System A/S
pub const LEGO_COMPANY_ID: u16 = 0x0397;

/// Client characteristic configuration handle used to switch notifications on
pub const CCCD_HANDLE: u16 = 0x0C;

/// Port of the left paddle
pub const LEFT_PORT: u8 = 0x00;
/// Port of the right paddle
pub const RIGHT_PORT: u8 = 0x01;
/// Port of the RGB status light
pub const LIGHT_PORT: u8 = 0x34;
/// Port reporting the center (green) button
pub const CENTER_PORT: u8 = 0x02;

/// Message types
mod message {
    pub const HUB_ACTION: u8 = 0x08;
    pub const PORT_INPUT_FORMAT_SETUP: u8 = 0x41;
    pub const PORT_VALUE: u8 = 0x45;
    pub const PORT_OUTPUT_COMMAND: u8 = 0x81;
}

/// Combined-mode paddle values
mod combined {
    pub const RELEASED: u8 = 0x00;
    pub const PLUS: u8 = 0x01;
    pub const MID: u8 = 0x7F;
    pub const MINUS: u8 = 0xFF;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("field {index} out of range: {value}")]
    FieldOutOfRange { index: usize, value: i16 },
}

/// Colors of the remote status light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Color {
    Off = 0x00,
    Pink = 0x01,
    Purple = 0x02,
    Blue = 0x03,
    LightBlue = 0x04,
    LightGreen = 0x05,
    Green = 0x06,
    Yellow = 0x07,
    Orange = 0x08,
    Red = 0x09,
    White = 0x0A,
}

impl Color {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for Color {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Off,
            0x01 => Self::Pink,
            0x02 => Self::Purple,
            0x03 => Self::Blue,
            0x04 => Self::LightBlue,
            0x05 => Self::LightGreen,
            0x06 => Self::Green,
            0x07 => Self::Yellow,
            0x08 => Self::Orange,
            0x09 => Self::Red,
            0x0A => Self::White,
            other => return Err(other),
        })
    }
}

/// Paddle input mode requested by the notify-enable command.
///
/// Older firmware reports one combined value per paddle, newer firmware
/// reports three independent flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonMode {
    #[default]
    Combined,
    Separate,
}

impl ButtonMode {
    pub fn code(&self) -> u8 {
        match self {
            Self::Combined => 0x00,
            Self::Separate => 0x04,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Combined),
            0x04 => Some(Self::Separate),
            _ => None,
        }
    }
}

/// Where a command has to be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// The value handle of the hub characteristic
    Characteristic,
    /// A fixed attribute handle
    Handle(u16),
}

/// Outbound commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Set the status light
    SetColor(Color),
    /// Ask a paddle port to push value changes
    EnablePortNotifications { port: u8, mode: ButtonMode },
    /// Switch GATT notifications on through the CCCD
    EnableNotifications,
}

impl Command {
    /// Exact wire bytes of this command
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SetColor(color) => vec![
                0x08,
                0x00,
                message::PORT_OUTPUT_COMMAND,
                LIGHT_PORT,
                0x11, // execute immediately, request feedback
                0x51, // write direct mode data
                0x00,
                color.code(),
            ],
            Self::EnablePortNotifications { port, mode } => vec![
                0x0A,
                0x00,
                message::PORT_INPUT_FORMAT_SETUP,
                *port,
                mode.code(),
                0x01, // delta interval, little-endian u32
                0x00,
                0x00,
                0x00,
                0x01, // notifications on
            ],
            Self::EnableNotifications => vec![0x01, 0x00],
        }
    }

    pub fn target(&self) -> WriteTarget {
        match self {
            Self::EnableNotifications => WriteTarget::Handle(CCCD_HANDLE),
            _ => WriteTarget::Characteristic,
        }
    }

    /// Recognize a previously encoded command.
    pub fn decode(data: &[u8]) -> Option<Self> {
        match *data {
            [0x08, 0x00, message::PORT_OUTPUT_COMMAND, LIGHT_PORT, 0x11, 0x51, 0x00, color] => {
                Color::try_from(color).ok().map(Self::SetColor)
            }
            [0x0A, 0x00, message::PORT_INPUT_FORMAT_SETUP, port, mode, 0x01, 0x00, 0x00, 0x00, 0x01] => {
                ButtonMode::from_code(mode).map(|mode| Self::EnablePortNotifications { port, mode })
            }
            [0x01, 0x00] => Some(Self::EnableNotifications),
            _ => None,
        }
    }
}

/// Pack logical fields into one byte each.
///
/// Fields may be given either as signed bytes (-128..=127) or as raw opcodes
/// (0..=255); opcodes above 0x7F end up as their two's-complement byte.
pub fn pack_fields(fields: &[i16]) -> Result<Vec<u8>, CodecError> {
    fields
        .iter()
        .enumerate()
        .map(|(index, &value)| match value {
            -128..=-1 => Ok(value as i8 as u8),
            0..=255 => Ok(value as u8),
            _ => Err(CodecError::FieldOutOfRange { index, value }),
        })
        .collect()
}

/// Decode a notification into a button frame.
///
/// Returns `None` for anything that is not a button report: other hub
/// messages, truncated frames, unknown values.
pub fn decode_notification(data: &[u8]) -> Option<ButtonFrame> {
    let len = *data.first()? as usize;
    let Some(frame) = data.get(..len) else {
        trace!("Truncated notification: {:02X?}", data);
        return None;
    };

    match *frame {
        [0x05, _, message::PORT_VALUE, port, value] => decode_combined(port, value),
        [0x05, _, message::HUB_ACTION, CENTER_PORT, state] => decode_center(state),
        [0x07, _, message::PORT_VALUE, port, plus, mid, minus] => {
            let paddle = paddle_for_port(port)?;
            Some(ButtonFrame::Paddle {
                paddle,
                flags: PaddleFlags {
                    plus: plus != 0,
                    mid: mid != 0,
                    minus: minus != 0,
                },
            })
        }
        _ => {
            trace!("Ignoring notification: {:02X?}", frame);
            None
        }
    }
}

fn paddle_for_port(port: u8) -> Option<Paddle> {
    match port {
        LEFT_PORT => Some(Paddle::Left),
        RIGHT_PORT => Some(Paddle::Right),
        _ => None,
    }
}

fn decode_combined(port: u8, value: u8) -> Option<ButtonFrame> {
    let paddle = paddle_for_port(port)?;
    let flags = match value {
        combined::PLUS => PaddleFlags::PLUS,
        combined::MID => PaddleFlags::MID,
        combined::MINUS => PaddleFlags::MINUS,
        combined::RELEASED => PaddleFlags::RELEASED,
        _ => return None,
    };
    Some(ButtonFrame::Paddle { paddle, flags })
}

fn decode_center(state: u8) -> Option<ButtonFrame> {
    match state {
        0x00 => Some(ButtonFrame::Center { pressed: false }),
        0x01 => Some(ButtonFrame::Center { pressed: true }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_strings() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "00001623-1212-efde-1623-785feabcd123"
        );
        assert_eq!(
            CHARACTERISTIC_UUID.to_string(),
            "00001624-1212-efde-1623-785feabcd123"
        );
    }

    #[test]
    fn test_color_command_bytes() {
        let bytes = Command::SetColor(Color::LightGreen).encode();
        assert_eq!(bytes, [0x08, 0x00, 0x81, 0x34, 0x11, 0x51, 0x00, 0x05]);
        assert_eq!(Command::decode(&bytes), Some(Command::SetColor(Color::LightGreen)));
        assert_eq!(Command::SetColor(Color::White).target(), WriteTarget::Characteristic);
    }

    #[test]
    fn test_port_notification_bytes() {
        let left = Command::EnablePortNotifications {
            port: LEFT_PORT,
            mode: ButtonMode::Combined,
        };
        assert_eq!(
            left.encode(),
            [0x0A, 0x00, 0x41, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01]
        );

        let right = Command::EnablePortNotifications {
            port: RIGHT_PORT,
            mode: ButtonMode::Separate,
        };
        assert_eq!(
            right.encode(),
            [0x0A, 0x00, 0x41, 0x01, 0x04, 0x01, 0x00, 0x00, 0x00, 0x01]
        );
        assert_eq!(Command::decode(&right.encode()), Some(right));
    }

    #[test]
    fn test_cccd_command() {
        assert_eq!(Command::EnableNotifications.encode(), [0x01, 0x00]);
        assert_eq!(
            Command::EnableNotifications.target(),
            WriteTarget::Handle(0x0C)
        );
    }

    #[test]
    fn test_pack_fields_keeps_exact_bytes() {
        assert_eq!(
            pack_fields(&[0x08, 0x81, 0xFF, -1, -128, 127]).unwrap(),
            [0x08, 0x81, 0xFF, 0xFF, 0x80, 0x7F]
        );
        assert_eq!(
            pack_fields(&[0x00, 256]),
            Err(CodecError::FieldOutOfRange {
                index: 1,
                value: 256
            })
        );
        assert!(pack_fields(&[-129]).is_err());
    }

    #[test]
    fn test_decode_combined_frames() {
        let cases = [
            ([0x05, 0x00, 0x45, 0x00, 0x01], Paddle::Left, PaddleFlags::PLUS),
            ([0x05, 0x00, 0x45, 0x00, 0x7F], Paddle::Left, PaddleFlags::MID),
            ([0x05, 0x00, 0x45, 0x00, 0xFF], Paddle::Left, PaddleFlags::MINUS),
            ([0x05, 0x00, 0x45, 0x00, 0x00], Paddle::Left, PaddleFlags::RELEASED),
            ([0x05, 0x00, 0x45, 0x01, 0x01], Paddle::Right, PaddleFlags::PLUS),
            ([0x05, 0x00, 0x45, 0x01, 0xFF], Paddle::Right, PaddleFlags::MINUS),
        ];
        for (bytes, paddle, flags) in cases {
            assert_eq!(
                decode_notification(&bytes),
                Some(ButtonFrame::Paddle { paddle, flags }),
                "frame {:02X?}",
                bytes
            );
        }
    }

    #[test]
    fn test_decode_center_frames() {
        assert_eq!(
            decode_notification(&[0x05, 0x00, 0x08, 0x02, 0x01]),
            Some(ButtonFrame::Center { pressed: true })
        );
        assert_eq!(
            decode_notification(&[0x05, 0x00, 0x08, 0x02, 0x00]),
            Some(ButtonFrame::Center { pressed: false })
        );
    }

    #[test]
    fn test_decode_separate_frames() {
        assert_eq!(
            decode_notification(&[0x07, 0x00, 0x45, 0x01, 0x00, 0x01, 0x01]),
            Some(ButtonFrame::Paddle {
                paddle: Paddle::Right,
                flags: PaddleFlags {
                    plus: false,
                    mid: true,
                    minus: true,
                },
            })
        );
    }

    #[test]
    fn test_decode_ignores_noise() {
        assert_eq!(decode_notification(&[]), None);
        // Length byte claims more than was received
        assert_eq!(decode_notification(&[0x07, 0x00, 0x45, 0x00, 0x01]), None);
        // Unknown combined value
        assert_eq!(decode_notification(&[0x05, 0x00, 0x45, 0x00, 0x10]), None);
        // Unknown port
        assert_eq!(decode_notification(&[0x05, 0x00, 0x45, 0x05, 0x01]), None);
        // Hub attached I/O message
        assert_eq!(
            decode_notification(&[0x0F, 0x00, 0x04, 0x00, 0x01, 0x37, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x10]),
            None
        );
    }
}

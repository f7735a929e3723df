//! Message catalogue for the BEAST binary protocol.

use bytes::Bytes;
use serde::{
    Deserialize,
    Serialize,
};

/// The kind of one deframed message.
///
/// - [Original doc][1]
///
/// [1]: https://wiki.jetvision.de/wiki/Mode-S_Beast:Data_Output_Formats
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Mode A/C reply
    ModeAc,
    /// 56-bit Mode S frame (DF0..DF11)
    ModeSShort,
    /// 112-bit Mode S frame (DF16..DF24)
    ModeSLong,
    /// Radarcape status report
    Status,
}

impl MessageType {
    /// Classify a wire type byte. Anything outside `0x31..=0x34` is not a
    /// message boundary.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x31 => Some(Self::ModeAc),
            0x32 => Some(Self::ModeSShort),
            0x33 => Some(Self::ModeSLong),
            0x34 => Some(Self::Status),
            _ => None,
        }
    }

    /// Number of payload bytes after unescaping, not counting the 6-byte
    /// timestamp and the signal byte that precede every payload.
    pub fn data_size(&self) -> usize {
        match self {
            Self::ModeAc => 2,
            Self::ModeSShort => 7,
            Self::ModeSLong => 14,
            Self::Status => 14,
        }
    }
}

/// Which clock produced a message timestamp.
///
/// The radarcape switches to GPS-derived timestamps once its receiver has a
/// fix; it reports this through the status message, so the engine stamps
/// every delivered message with the clock that was active at the time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimestampKind {
    /// Legacy 12 MHz counter since device power-up
    #[default]
    TwelveMhz,
    /// GPS-derived: seconds since midnight UTC and nanoseconds of second
    Gps,
}

/// One decoded message record as handed to the notifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub timestamp_kind: TimestampKind,
    /// 48-bit timestamp, assembled big-endian from the wire
    pub timestamp: u64,
    /// logarithmic field-strength indicator
    pub signal: u8,
    /// payload of exactly [`MessageType::data_size`] bytes
    pub data: Bytes,
}

impl Message {
    /// Mode-S downlink format of the payload, for the Mode S message kinds.
    pub fn df(&self) -> Option<u8> {
        match self.message_type {
            MessageType::ModeSShort | MessageType::ModeSLong => Some((self.data[0] >> 3) & 0x1f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{
        Message,
        MessageType,
        TimestampKind,
    };

    #[test]
    fn it_classifies_type_bytes() {
        assert_eq!(MessageType::from_byte(0x31), Some(MessageType::ModeAc));
        assert_eq!(MessageType::from_byte(0x32), Some(MessageType::ModeSShort));
        assert_eq!(MessageType::from_byte(0x33), Some(MessageType::ModeSLong));
        assert_eq!(MessageType::from_byte(0x34), Some(MessageType::Status));
        assert_eq!(MessageType::from_byte(0x1a), None);
        assert_eq!(MessageType::from_byte(0x35), None);
        assert_eq!(MessageType::from_byte(0x00), None);
    }

    #[test]
    fn it_knows_payload_sizes() {
        assert_eq!(MessageType::ModeAc.data_size(), 2);
        assert_eq!(MessageType::ModeSShort.data_size(), 7);
        assert_eq!(MessageType::ModeSLong.data_size(), 14);
        assert_eq!(MessageType::Status.data_size(), 14);
    }

    #[test]
    fn it_decodes_the_downlink_format() {
        let message = Message {
            message_type: MessageType::ModeSShort,
            timestamp_kind: TimestampKind::TwelveMhz,
            timestamp: 0,
            signal: 0,
            // DF11 all-call reply: first byte 0x5d
            data: Bytes::from_static(&[0x5d, 0x4c, 0xa2, 0xd6, 0x2c, 0xd2, 0x5c]),
        };
        assert_eq!(message.df(), Some(11));

        let status = Message {
            message_type: MessageType::Status,
            data: Bytes::from_static(&[0; 14]),
            ..message
        };
        assert_eq!(status.df(), None);
    }
}

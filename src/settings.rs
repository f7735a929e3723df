//! Receiver settings and their wire encoding.
//!
//! Both receiver variants are configured through "dipswitch" commands: one
//! letter per option, lowercase for off and uppercase for on. The radarcape
//! reports the same options back as a bitmask in its status message. The
//! `g`/`G` dipswitch is shared: on a radarcape it selects GPS timestamps,
//! on a beast it masks DF0/DF4/DF5.

use std::str::FromStr;

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::filter::Filter;

/// A single dipswitch option: on, off, or left at its default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Opt(Option<bool>);

impl Opt {
    pub const ON: Self = Self(Some(true));
    pub const OFF: Self = Self(Some(false));
    pub const DONT_CARE: Self = Self(None);

    /// Resolve against the option's default.
    pub fn get(&self, default: bool) -> bool {
        self.0.unwrap_or(default)
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// Merge two option values. A set value wins over don't-care; two set
    /// values OR together.
    fn or(self, other: Self) -> Self {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Self(Some(a || b)),
            (Some(a), None) => Self(Some(a)),
            (None, b) => Self(b),
        }
    }
}

impl From<bool> for Opt {
    fn from(value: bool) -> Self {
        Self(Some(value))
    }
}

/// The variable receiver settings.
///
/// Anything the user leaves at [`Opt::DONT_CARE`] falls back to a default
/// when the configuration message is built: binary format and RTS handshake
/// on (the input engine depends on both), everything else off.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `c`/`C`: binary output format rather than AVR
    pub binary_format: Opt,
    /// `d`/`D`: deliver DF11/DF17/DF18 only
    pub filter_11_17_18: Opt,
    /// `e`/`E`: AVR output includes MLAT timestamps (unused in binary mode)
    pub avrmlat: Opt,
    /// `f`/`F`: no CRC checks
    pub crc_disable: Opt,
    /// `g`/`G` on a radarcape: GPS timestamps
    pub gps_timestamps: Opt,
    /// `h`/`H`: RTS/CTS handshaking
    pub rts_handshake: Opt,
    /// `i`/`I`: no forward error correction
    pub fec_disable: Opt,
    /// `j`/`J`: decode Mode A/C
    pub modeac_enable: Opt,
    /// `g`/`G` on a beast: don't deliver DF0/DF4/DF5
    pub filter_0_4_5: Opt,
    /// set by the engine from the detected receiver type
    pub radarcape: Opt,
}

const DIPSWITCH_COUNT: usize = 8;

impl Settings {
    /// Merge with another settings value, option by option.
    pub fn merge(self, other: Self) -> Self {
        Self {
            binary_format: self.binary_format.or(other.binary_format),
            filter_11_17_18: self.filter_11_17_18.or(other.filter_11_17_18),
            avrmlat: self.avrmlat.or(other.avrmlat),
            crc_disable: self.crc_disable.or(other.crc_disable),
            gps_timestamps: self.gps_timestamps.or(other.gps_timestamps),
            rts_handshake: self.rts_handshake.or(other.rts_handshake),
            fec_disable: self.fec_disable.or(other.fec_disable),
            modeac_enable: self.modeac_enable.or(other.modeac_enable),
            filter_0_4_5: self.filter_0_4_5.or(other.filter_0_4_5),
            radarcape: self.radarcape.or(other.radarcape),
        }
    }

    /// Resolve every don't-care to its default.
    pub fn apply_defaults(self) -> Self {
        Self {
            binary_format: self.binary_format.get(true).into(),
            filter_11_17_18: self.filter_11_17_18.get(false).into(),
            avrmlat: self.avrmlat.get(false).into(),
            crc_disable: self.crc_disable.get(false).into(),
            gps_timestamps: self.gps_timestamps.get(false).into(),
            rts_handshake: self.rts_handshake.get(true).into(),
            fec_disable: self.fec_disable.get(false).into(),
            modeac_enable: self.modeac_enable.get(false).into(),
            filter_0_4_5: self.filter_0_4_5.get(false).into(),
            radarcape: self.radarcape.get(false).into(),
        }
    }

    /// Decode the settings bitmask from a radarcape status payload.
    pub fn from_status_byte(byte: u8) -> Self {
        Self {
            binary_format: (byte & 0x01 != 0).into(),
            filter_11_17_18: (byte & 0x02 != 0).into(),
            avrmlat: (byte & 0x04 != 0).into(),
            crc_disable: (byte & 0x08 != 0).into(),
            gps_timestamps: (byte & 0x10 != 0).into(),
            rts_handshake: (byte & 0x20 != 0).into(),
            fec_disable: (byte & 0x40 != 0).into(),
            modeac_enable: (byte & 0x80 != 0).into(),
            filter_0_4_5: Opt::DONT_CARE,
            // only the radarcape reports status
            radarcape: Opt::ON,
        }
    }

    /// Build the device configuration message: one `1A 31 <letter>`
    /// dipswitch command per option.
    pub fn to_message(&self) -> Bytes {
        let mut message = BytesMut::with_capacity(DIPSWITCH_COUNT * 3);
        let mut dipswitch = |option: Opt, default: bool, off: u8, on: u8| {
            message.put_u8(0x1a);
            message.put_u8(0x31);
            message.put_u8(if option.get(default) { on } else { off });
        };

        dipswitch(self.binary_format, true, b'c', b'C');
        dipswitch(self.filter_11_17_18, false, b'd', b'D');
        dipswitch(self.avrmlat, false, b'e', b'E');
        dipswitch(self.crc_disable, false, b'f', b'F');
        // the shared dipswitch: gps timestamps on a radarcape, the DF0/4/5
        // mask on a beast
        let shared = if self.radarcape.get(false) {
            self.gps_timestamps
        }
        else {
            self.filter_0_4_5
        };
        dipswitch(shared, false, b'g', b'G');
        dipswitch(self.rts_handshake, true, b'h', b'H');
        dipswitch(self.fec_disable, false, b'i', b'I');
        dipswitch(self.modeac_enable, false, b'j', b'J');

        message.freeze()
    }
}

impl From<&Filter> for Settings {
    /// Derive the receiver-side settings implied by a downstream filter.
    fn from(filter: &Filter) -> Self {
        let only_11_17_18 = filter
            .receive_df
            .iter()
            .enumerate()
            .all(|(df, receive)| !receive || df == 11 || df == 17 || df == 18);

        Self {
            filter_11_17_18: only_11_17_18.into(),
            crc_disable: filter.receive_bad_crc.into(),
            gps_timestamps: filter.receive_gps_timestamps.into(),
            fec_disable: (!filter.receive_fec).into(),
            modeac_enable: filter.receive_modeac.into(),
            filter_0_4_5: (!filter.receive_df[0] && !filter.receive_df[4] && !filter.receive_df[5])
                .into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown dipswitch letter: {0:?}")]
pub struct ParseSettingsError(char);

impl FromStr for Settings {
    type Err = ParseSettingsError;

    /// Parse a dipswitch-letter string, e.g. `"CdJ"`. Besides the device
    /// letters this accepts `b`/`B` for the DF0/4/5 mask (split out from the
    /// shared `g`/`G` switch) and `r`/`R` for the receiver variant.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut settings = Settings::default();
        for ch in s.chars() {
            let (option, value) = match ch {
                'c' | 'C' => (&mut settings.binary_format, ch == 'C'),
                'd' | 'D' => (&mut settings.filter_11_17_18, ch == 'D'),
                'e' | 'E' => (&mut settings.avrmlat, ch == 'E'),
                'f' | 'F' => (&mut settings.crc_disable, ch == 'F'),
                'g' | 'G' => (&mut settings.gps_timestamps, ch == 'G'),
                'h' | 'H' => (&mut settings.rts_handshake, ch == 'H'),
                'i' | 'I' => (&mut settings.fec_disable, ch == 'I'),
                'j' | 'J' => (&mut settings.modeac_enable, ch == 'J'),
                'b' | 'B' => (&mut settings.filter_0_4_5, ch == 'B'),
                'r' | 'R' => (&mut settings.radarcape, ch == 'R'),
                _ => return Err(ParseSettingsError(ch)),
            };
            *option = value.into();
        }
        Ok(settings)
    }
}

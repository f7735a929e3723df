//! Downstream message filters.

use serde::{
    Deserialize,
    Serialize,
};

/// What a downstream consumer wants to receive.
///
/// The engine derives receiver settings from the active filter (see
/// [`Settings::from`][crate::Settings]), so narrowing the filter lets the
/// device drop traffic before it ever reaches the serial line. The default
/// filter receives nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    /// Mode S downlink formats to receive, indexed by DF number
    pub receive_df: [bool; 32],
    pub receive_modeac: bool,
    pub receive_bad_crc: bool,
    pub receive_fec: bool,
    pub receive_status: bool,
    pub receive_gps_timestamps: bool,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            receive_df: [false; 32],
            receive_modeac: false,
            receive_bad_crc: false,
            receive_fec: false,
            receive_status: false,
            receive_gps_timestamps: false,
        }
    }
}

impl Filter {
    /// The union of two filters: everything either side wants to receive.
    pub fn combine(&self, other: &Self) -> Self {
        let mut receive_df = [false; 32];
        for (df, receive) in receive_df.iter_mut().enumerate() {
            *receive = self.receive_df[df] || other.receive_df[df];
        }

        Self {
            receive_df,
            receive_modeac: self.receive_modeac || other.receive_modeac,
            receive_bad_crc: self.receive_bad_crc || other.receive_bad_crc,
            receive_fec: self.receive_fec || other.receive_fec,
            receive_status: self.receive_status || other.receive_status,
            receive_gps_timestamps: self.receive_gps_timestamps
                || other.receive_gps_timestamps,
        }
    }
}

//! # Serial input for Mode-S Beast and Radarcape receivers
//!
//! This crate talks to a serial-attached [Mode-S Beast][1] (or the
//! compatible Radarcape) receiver. It deframes the escaped binary stream the
//! device emits, negotiates the device settings over the same line, hunts
//! for the correct baud rate when none is configured, and works out which of
//! the two receiver variants is attached.
//!
//! The entry point is [`SerialInput`]: configure it with an [`InputConfig`],
//! register a message notifier, and [`start`][SerialInput::start] it. The
//! engine runs as a single tokio task that owns the port and all timers;
//! the returned [`InputHandle`] is used to update the filter or settings
//! and to shut the engine down. Port errors are handled internally with a
//! close/backoff/reconnect cycle, so the notifier simply sees a gap in
//! messages while the line is down.
//!
//! For receivers reachable over TCP (readsb-style BEAST output) the
//! [`deframe::Reader`] stream adapter applies the same deframing to any
//! [`AsyncRead`][tokio::io::AsyncRead].
//!
//! [1]: https://wiki.jetvision.de/wiki/Mode-S_Beast:Data_Output_Formats

pub mod deframe;
pub mod filter;
pub mod input;
pub mod message;
pub mod port;
pub mod settings;

pub use crate::{
    filter::Filter,
    input::{
        InputConfig,
        InputHandle,
        ReceiverType,
        SerialInput,
    },
    message::{
        Message,
        MessageType,
        TimestampKind,
    },
    settings::Settings,
};

/// Errors surfaced to the embedding application.
///
/// Port-level I/O errors never show up here; the engine recovers from those
/// by reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("device path must not be empty")]
    InvalidPath,
    #[error("serial input task died unexpectedly")]
    InputTaskDead,
}

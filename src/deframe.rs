//! Deframing of the escaped BEAST byte stream.
//!
//! Messages are framed as `1A <type> <data...>` where any literal `1A` in
//! the data is doubled. The data is, after unescaping, a 6-byte big-endian
//! timestamp, a signal byte, and a payload whose length is fixed by the
//! type byte. [`Deframer`] is a pure state machine over bytes: it holds no
//! I/O and may be fed the stream in arbitrary chunks, which makes the
//! escape-at-chunk-boundary case an explicit parser state and keeps the
//! emitted frames independent of chunking.
//!
//! Sync quality lives in [`SyncTracker`]: runs of structurally valid frames
//! count as good sync, framing violations as bad sync. The serial engine
//! uses these counters to decide when a probed baud rate is good and when a
//! chosen one has stopped working.

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};
use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::io::{
    AsyncRead,
    ReadBuf,
};

use crate::message::{
    Message,
    MessageType,
    TimestampKind,
};

/// the escape / frame marker byte
pub const ESCAPE: u8 = 0x1a;

/// timestamp plus signal byte, preceding every payload
const METADATA_SIZE: usize = 7;

/// consecutive good frames needed before a probed baud rate is considered
/// correct
pub const AUTOBAUD_GOOD_SYNCS_NEEDED: u32 = 50;

/// consecutive sync failures, without a good patch in between, after which
/// the chosen baud rate itself is suspect and autobauding restarts
pub const AUTOBAUD_RESTART_AFTER_BAD_SYNCS: u32 = 50;

/// while hunting for sync, report a sync failure every this many bytes so a
/// dead or misbauded line doesn't look merely quiet
pub const MAX_BYTES_WITHOUT_SYNC: u32 = 30;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ParserState {
    /// lost sync; wait for a data-like byte before trusting a `1A` again
    Resync,
    /// scan for the next `1A` frame marker
    #[default]
    Find1A,
    /// classify the byte after a hunted-down marker; failure resumes the hunt
    TestType,
    /// between messages; the next byte must be a `1A` marker
    Read1A,
    /// classify the byte after an expected marker; failure is a sync loss
    ReadType,
    /// accumulate unescaped data bytes
    ReadData,
    /// a `1A` was the last byte of the previous chunk; the escape resolves
    /// with the next byte
    ReadEscaped1A,
}

/// Counters tracking how well frame boundaries are holding up.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncTracker {
    good_sync: u32,
    bad_sync: u32,
    bytes_since_sync: u32,
}

impl SyncTracker {
    /// Record a structurally valid frame. Returns true when the run of good
    /// frames has reached [`AUTOBAUD_GOOD_SYNCS_NEEDED`].
    fn frame_ok(&mut self) -> bool {
        self.good_sync = (self.good_sync + 1).min(AUTOBAUD_GOOD_SYNCS_NEEDED);
        if self.good_sync == AUTOBAUD_GOOD_SYNCS_NEEDED {
            self.bad_sync = 0;
            self.bytes_since_sync = 0;
            true
        }
        else {
            false
        }
    }

    /// Record a framing violation. Returns true when the loss is sustained
    /// enough that the chosen baud rate itself is suspect.
    fn lost_sync(&mut self) -> bool {
        if self.good_sync < 5 {
            self.bad_sync += 1;
        }
        else {
            // a decent run of good frames forgives earlier failures
            self.bad_sync = 0;
        }
        self.good_sync = 0;
        self.bytes_since_sync = 0;

        self.bad_sync > AUTOBAUD_RESTART_AFTER_BAD_SYNCS
    }

    /// Record a byte scanned without finding sync. Returns true when the
    /// hunt has gone on long enough to count as another sync failure.
    fn unsynced_byte(&mut self) -> bool {
        self.bytes_since_sync += 1;
        self.bytes_since_sync > MAX_BYTES_WITHOUT_SYNC
    }

    pub fn good_sync(&self) -> u32 {
        self.good_sync
    }

    pub fn bad_sync(&self) -> u32 {
        self.bad_sync
    }
}

/// One deframed message, still undecoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    /// 6 timestamp bytes and the signal byte
    pub metadata: [u8; METADATA_SIZE],
    /// unescaped payload of exactly `message_type.data_size()` bytes
    pub data: Bytes,
}

impl Frame {
    /// The 48-bit timestamp, assembled big-endian.
    pub fn timestamp(&self) -> u64 {
        self.metadata[..6]
            .iter()
            .fold(0, |timestamp, byte| (timestamp << 8) | u64::from(*byte))
    }

    pub fn signal(&self) -> u8 {
        self.metadata[6]
    }

    pub fn into_message(self, timestamp_kind: TimestampKind) -> Message {
        Message {
            message_type: self.message_type,
            timestamp_kind,
            timestamp: self.timestamp(),
            signal: self.signal(),
            data: self.data,
        }
    }
}

/// What the deframer tells its caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Frame {
        frame: Frame,
        /// whether the good-sync run had reached
        /// [`AUTOBAUD_GOOD_SYNCS_NEEDED`] when this frame completed
        sync_established: bool,
    },
    SyncLost {
        /// set when the loss is sustained enough to warrant probing other
        /// baud rates again
        restart_autobaud: bool,
    },
}

/// The deframing state machine.
#[derive(Debug, Default)]
pub struct Deframer {
    state: ParserState,
    /// only meaningful from `ReadData` on; set when a type byte is accepted
    message_type: Option<MessageType>,
    metadata: [u8; METADATA_SIZE],
    metadata_len: usize,
    data: BytesMut,
}

impl Deframer {
    /// Consume one chunk of the stream, updating `tracker` and emitting an
    /// [`Event`] per completed frame or sync loss. State carries over
    /// between calls, so feeding the same bytes in different chunkings
    /// emits the same events.
    pub fn feed(
        &mut self,
        tracker: &mut SyncTracker,
        buffer: &[u8],
        emit: &mut impl FnMut(Event),
    ) {
        let mut pos = 0;

        while pos < buffer.len() {
            match self.state {
                ParserState::Resync => {
                    // wait for <not-1A> <1A> <typebyte>: right after a sync
                    // loss a lone 1A could be either half of an escape
                    while pos < buffer.len() {
                        if buffer[pos] != ESCAPE {
                            self.state = ParserState::Find1A;
                            break;
                        }
                        if tracker.unsynced_byte() {
                            self.lost_sync(tracker, emit);
                            break;
                        }
                        pos += 1;
                    }
                }

                ParserState::Find1A => {
                    while pos < buffer.len() {
                        if buffer[pos] == ESCAPE {
                            pos += 1;
                            self.state = ParserState::TestType;
                            break;
                        }
                        if tracker.unsynced_byte() {
                            self.lost_sync(tracker, emit);
                            break;
                        }
                        pos += 1;
                    }
                }

                ParserState::TestType => {
                    // still hunting: an implausible type byte just resumes
                    // the scan, it doesn't count as losing sync
                    match MessageType::from_byte(buffer[pos]) {
                        Some(message_type) => {
                            pos += 1;
                            self.begin_frame(message_type);
                        }
                        None => self.state = ParserState::Find1A,
                    }
                }

                ParserState::Read1A => {
                    if buffer[pos] == ESCAPE {
                        pos += 1;
                        self.state = ParserState::ReadType;
                    }
                    else {
                        self.lost_sync(tracker, emit);
                    }
                }

                ParserState::ReadType => {
                    match MessageType::from_byte(buffer[pos]) {
                        Some(message_type) => {
                            pos += 1;
                            self.begin_frame(message_type);
                        }
                        // we believed we were framed, so this is a loss
                        None => self.lost_sync(tracker, emit),
                    }
                }

                ParserState::ReadData => {
                    while pos < buffer.len() && !self.frame_complete() {
                        let byte = buffer[pos];
                        pos += 1;

                        if byte == ESCAPE {
                            if pos == buffer.len() {
                                // the second half of the escape is in the
                                // next chunk
                                self.state = ParserState::ReadEscaped1A;
                                break;
                            }
                            if buffer[pos] != ESCAPE {
                                self.lost_sync(tracker, emit);
                                break;
                            }
                            // doubled escape; consume the second byte
                            pos += 1;
                        }

                        self.push_byte(byte);
                    }

                    if self.frame_complete() {
                        self.dispatch(tracker, emit);
                        self.state = ParserState::Read1A;
                    }
                }

                ParserState::ReadEscaped1A => {
                    if buffer[pos] != ESCAPE {
                        self.lost_sync(tracker, emit);
                    }
                    else {
                        pos += 1;
                        self.push_byte(ESCAPE);
                        if self.frame_complete() {
                            self.dispatch(tracker, emit);
                            self.state = ParserState::Read1A;
                        }
                        else {
                            self.state = ParserState::ReadData;
                        }
                    }
                }
            }
        }
    }

    fn begin_frame(&mut self, message_type: MessageType) {
        self.message_type = Some(message_type);
        self.metadata_len = 0;
        self.data.clear();
        self.state = ParserState::ReadData;
    }

    fn push_byte(&mut self, byte: u8) {
        if self.metadata_len < METADATA_SIZE {
            self.metadata[self.metadata_len] = byte;
            self.metadata_len += 1;
        }
        else {
            self.data.put_u8(byte);
        }
    }

    fn frame_complete(&self) -> bool {
        let Some(message_type) = self.message_type
        else {
            return false;
        };
        self.metadata_len == METADATA_SIZE && self.data.len() == message_type.data_size()
    }

    fn dispatch(&mut self, tracker: &mut SyncTracker, emit: &mut impl FnMut(Event)) {
        let sync_established = tracker.frame_ok();
        let Some(message_type) = self.message_type.take()
        else {
            return;
        };

        let frame = Frame {
            message_type,
            metadata: self.metadata,
            data: self.data.split().freeze(),
        };
        tracing::trace!(?message_type, len = frame.data.len(), "deframed message");
        emit(Event::Frame {
            frame,
            sync_established,
        });
    }

    fn lost_sync(&mut self, tracker: &mut SyncTracker, emit: &mut impl FnMut(Event)) {
        let restart_autobaud = tracker.lost_sync();
        tracing::trace!(
            bad_sync = tracker.bad_sync(),
            restart_autobaud,
            "lost frame sync"
        );
        self.state = ParserState::Resync;
        emit(Event::SyncLost { restart_autobaud });
    }
}

/// this can be larger for more efficient reads, although the underlying
/// reader is probably buffered
const STREAM_BUFFER_SIZE: usize = 512;

pin_project! {
    /// Deframes a BEAST byte stream from any [`AsyncRead`], e.g. a readsb
    /// TCP connection. Yields the frames and silently resynchronizes over
    /// garbage, exactly like the serial engine does.
    #[derive(Debug)]
    pub struct Reader<R> {
        #[pin]
        reader: R,
        deframer: Deframer,
        tracker: SyncTracker,
        buffer: Box<[u8]>,
        pending: VecDeque<Frame>,
    }
}

impl<R> Reader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            deframer: Deframer::default(),
            tracker: SyncTracker::default(),
            buffer: vec![0; STREAM_BUFFER_SIZE].into_boxed_slice(),
            pending: VecDeque::new(),
        }
    }
}

impl<R: AsyncRead> Stream for Reader<R> {
    type Item = Result<Frame, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let this = self.as_mut().project();

            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }

            let mut read_buf = ReadBuf::new(this.buffer);
            match this.reader.poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => return Poll::Ready(Some(Err(error))),
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        return Poll::Ready(None);
                    }

                    let pending = &mut *this.pending;
                    this.deframer.feed(this.tracker, filled, &mut |event| {
                        if let Event::Frame { frame, .. } = event {
                            pending.push_back(frame);
                        }
                    });
                }
            }
        }
    }
}

//! The serial input engine.
//!
//! [`SerialInput`] owns the port, the deframer and every timer, and runs as
//! a single tokio task, so no callback ever races another. The task is
//! driven by whichever of these wakes first: a command from the
//! [`InputHandle`], a chunk (or error) from the port, or one of three
//! deadlines — autobaud probing, receiver autodetection, reconnect backoff.
//!
//! Error handling is a funnel: every port fault, read or write, ends up in
//! `handle_error`, which closes the port, resets the autobaud hunt and
//! schedules a reconnect. The engine never gives up on its own; it stops
//! only when the handle is closed or dropped.

use std::{
    io,
    mem,
    time::Duration,
};

use bytes::Bytes;
use serde::{
    Deserialize,
    Serialize,
};
use tokio::{
    sync::mpsc,
    time::{
        self,
        Instant,
    },
};
use tokio_util::sync::CancellationToken;

use crate::{
    Error,
    deframe::{
        Deframer,
        Event,
        Frame,
        SyncTracker,
    },
    filter::Filter,
    message::{
        Message,
        MessageType,
        TimestampKind,
    },
    port::{
        Connection,
        Connector,
        SerialConnector,
    },
    settings::{
        Opt,
        Settings,
    },
};

/// the standard baud rates to try, in their preferred order
pub const AUTOBAUD_STANDARD_RATES: [u32; 5] = [3_000_000, 1_000_000, 921_600, 230_400, 115_200];

/// the initial interval to wait for good sync before changing baud rates
pub const AUTOBAUD_BASE_INTERVAL: Duration = Duration::from_millis(1000);

/// the maximum interval between changing baud rates
pub const AUTOBAUD_MAX_INTERVAL: Duration = Duration::from_millis(16000);

/// how long to wait before trying to reopen the serial port after an error
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(15);

/// how long to wait for a radarcape status message before concluding that
/// the receiver is a plain beast
pub const RADARCAPE_DETECT_INTERVAL: Duration = Duration::from_secs(5);

const COMMAND_QUEUE_SIZE: usize = 8;

/// The receiver variant at the other end of the line.
///
/// `Unknown` doubles as "autodetect": only a radarcape emits status frames,
/// so seeing one locks the type to [`Radarcape`][Self::Radarcape], and a
/// whole detection window without one locks in [`Beast`][Self::Beast]. The
/// type never changes again within a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiverType {
    #[default]
    Unknown,
    Beast,
    Radarcape,
}

/// Construction options for a [`SerialInput`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// path to the serial device
    pub path: String,
    /// the fixed receiver type, or [`ReceiverType::Unknown`] to autodetect
    /// on every connection
    pub receiver_type: ReceiverType,
    /// fixed input settings, merged with the filter-derived ones
    pub settings: Settings,
    /// a fixed baud rate, or 0 to autobaud across
    /// [`AUTOBAUD_STANDARD_RATES`]
    pub baud_rate: u32,
}

/// Callback receiving every delivered [`Message`].
pub type MessageNotifier = Box<dyn FnMut(Message) + Send>;

enum Command {
    SetFilter(Filter),
    ChangeSettings(Settings),
}

/// Handle to a running [`SerialInput`]. Cheap to clone; the engine stops
/// when [`close`][Self::close] is called or every handle is dropped.
#[derive(Clone, Debug)]
pub struct InputHandle {
    command_sender: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

impl InputHandle {
    /// Replace the downstream filter. If it actually changed and the port
    /// is open, the device settings are renegotiated.
    pub async fn set_filter(&self, filter: Filter) -> Result<(), Error> {
        self.command_sender
            .send(Command::SetFilter(filter))
            .await
            .map_err(|_| Error::InputTaskDead)
    }

    /// Replace the fixed settings. If they actually changed and the port is
    /// open, the device settings are renegotiated.
    pub async fn change_settings(&self, settings: Settings) -> Result<(), Error> {
        self.command_sender
            .send(Command::ChangeSettings(settings))
            .await
            .map_err(|_| Error::InputTaskDead)
    }

    /// Stop the engine: all timers are cancelled and the port is closed.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// The serial input engine. See the [module docs][self].
pub struct SerialInput<C: Connector = SerialConnector> {
    connector: C,
    path: String,
    fixed_receiver_type: ReceiverType,
    receiver_type: ReceiverType,
    fixed_settings: Settings,
    filter: Filter,
    notifier: Option<MessageNotifier>,

    commands: mpsc::Receiver<Command>,
    command_sender: mpsc::Sender<Command>,
    shutdown: CancellationToken,

    connection: Option<C::Connection>,
    deframer: Deframer,
    tracker: SyncTracker,
    events: Vec<Event>,

    /// true while we are still hunting for the correct baud rate
    autobauding: bool,
    /// the rates to try; a single entry if a fixed rate is configured
    autobaud_rates: Vec<u32>,
    baud_index: usize,
    /// doubles (up to a limit) every time all rates have been tried
    autobaud_interval: Duration,

    autobaud_deadline: Option<Instant>,
    detect_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,

    receiving_gps_timestamps: bool,
}

impl SerialInput {
    /// Create an engine for a real serial device. Fails fast on an invalid
    /// configuration; actual port errors are handled by reconnecting once
    /// the engine runs.
    pub fn new(config: InputConfig) -> Result<Self, Error> {
        Self::with_connector(SerialConnector, config)
    }
}

impl<C: Connector> SerialInput<C> {
    /// Create an engine on a custom port implementation.
    pub fn with_connector(connector: C, config: InputConfig) -> Result<Self, Error> {
        if config.path.is_empty() {
            return Err(Error::InvalidPath);
        }

        let (autobauding, autobaud_rates) = if config.baud_rate == 0 {
            (true, AUTOBAUD_STANDARD_RATES.to_vec())
        }
        else {
            (false, vec![config.baud_rate])
        };

        let (command_sender, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);

        Ok(Self {
            connector,
            path: config.path,
            fixed_receiver_type: config.receiver_type,
            receiver_type: config.receiver_type,
            fixed_settings: config.settings,
            filter: Filter::default(),
            notifier: None,
            commands,
            command_sender,
            shutdown: CancellationToken::new(),
            connection: None,
            deframer: Deframer::default(),
            tracker: SyncTracker::default(),
            events: Vec::new(),
            autobauding,
            autobaud_rates,
            baud_index: 0,
            autobaud_interval: AUTOBAUD_BASE_INTERVAL,
            autobaud_deadline: None,
            detect_deadline: None,
            reconnect_deadline: None,
            receiving_gps_timestamps: false,
        })
    }

    /// Register the callback that receives delivered messages. Replaces any
    /// previously registered notifier.
    pub fn set_message_notifier(&mut self, notifier: impl FnMut(Message) + Send + 'static) {
        self.notifier = Some(Box::new(notifier));
    }

    /// Spawn the engine task and begin operating the device.
    pub fn start(self) -> InputHandle {
        let handle = InputHandle {
            command_sender: self.command_sender.clone(),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(self.run());
        handle
    }

    async fn run(mut self) {
        tracing::debug!(path = %self.path, "serial input started");

        self.connect().await;

        loop {
            let wake = tokio::select! {
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                command = self.commands.recv() => Wake::Command(command),
                chunk = next_chunk(&mut self.connection) => Wake::Chunk(chunk),
                _ = deadline(self.autobaud_deadline) => Wake::AutobaudExpired,
                _ = deadline(self.detect_deadline) => Wake::DetectExpired,
                _ = deadline(self.reconnect_deadline) => Wake::ReconnectExpired,
            };

            match wake {
                Wake::Shutdown | Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Chunk(Some(Ok(chunk))) => self.handle_chunk(chunk).await,
                Wake::Chunk(Some(Err(error))) => self.handle_error(error).await,
                Wake::Chunk(None) => {
                    let error =
                        io::Error::new(io::ErrorKind::UnexpectedEof, "serial connection closed");
                    self.handle_error(error).await;
                }
                Wake::AutobaudExpired => self.advance_autobaud().await,
                Wake::DetectExpired => self.autodetect_expired().await,
                Wake::ReconnectExpired => {
                    self.reconnect_deadline = None;
                    self.connect().await;
                }
            }
        }

        // closing the connection cancels any in-flight read or write
        self.connection = None;
        tracing::debug!(path = %self.path, "serial input stopped");
    }

    /// Open the port at the current cursor rate and bring the connection
    /// up: per-connection receiver detection, settings negotiation, and the
    /// autobaud timer when more than one rate is in play.
    async fn connect(&mut self) {
        let baud_rate = self.autobaud_rates[self.baud_index];
        tracing::debug!(
            path = %self.path,
            baud_rate,
            autobauding = self.autobauding,
            "opening serial port"
        );

        match self.connector.connect(&self.path, baud_rate).await {
            Ok(connection) => {
                self.connection = Some(connection);

                // every connection runs its own receiver detection
                self.receiver_type = self.fixed_receiver_type;
                self.receiving_gps_timestamps = false;
                self.detect_deadline = (self.receiver_type == ReceiverType::Unknown)
                    .then(|| Instant::now() + RADARCAPE_DETECT_INTERVAL);

                if let Err(error) = self.send_settings().await {
                    self.handle_error(error).await;
                    return;
                }

                if self.autobaud_rates.len() > 1 {
                    self.autobaud_deadline = Some(Instant::now() + self.autobaud_interval);
                }
            }
            Err(error) => self.handle_error(error).await,
        }
    }

    /// The negotiated settings: fixed settings merged with the
    /// filter-derived ones, with the engine-controlled options forced.
    fn effective_settings(&self) -> Settings {
        let mut settings = self.fixed_settings.merge(Settings::from(&self.filter));
        settings.radarcape = (self.receiver_type == ReceiverType::Radarcape).into();
        settings.binary_format = Opt::ON;
        settings
    }

    async fn send_settings(&mut self) -> io::Result<()> {
        let message = self.effective_settings().to_message();
        let Some(connection) = &mut self.connection
        else {
            return Ok(());
        };

        tracing::debug!(
            path = %self.path,
            receiver_type = ?self.receiver_type,
            "sending settings message"
        );
        connection.send(message).await
    }

    /// All port faults end up here: close, back off, reconnect. A
    /// cancelled operation is not a fault and returns silently.
    async fn handle_error(&mut self, error: io::Error) {
        if error.kind() == io::ErrorKind::Interrupted {
            return;
        }

        tracing::warn!(path = %self.path, %error, "serial input error, will reconnect");

        self.autobaud_deadline = None;
        self.detect_deadline = None;
        self.connection = None;

        // restart the baud hunt from the top on the next connection
        if self.autobaud_rates.len() > 1 {
            self.autobauding = true;
        }
        self.autobaud_interval = AUTOBAUD_BASE_INTERVAL;
        self.baud_index = 0;

        self.reconnect_deadline = Some(Instant::now() + RECONNECT_INTERVAL);
    }

    /// Move the autobaud cursor to the next rate and reopen. Called on
    /// timer expiry and on sustained sync loss.
    async fn advance_autobaud(&mut self) {
        self.autobaud_deadline = None;
        if !self.autobauding {
            return;
        }

        self.baud_index += 1;
        if self.baud_index >= self.autobaud_rates.len() {
            // every rate tried; slow down and start over
            self.baud_index = 0;
            self.autobaud_interval = (self.autobaud_interval * 2).min(AUTOBAUD_MAX_INTERVAL);
        }

        self.connection = None;
        self.connect().await;
    }

    /// The detection window passed without a status message; only a beast
    /// stays quiet that long.
    async fn autodetect_expired(&mut self) {
        self.detect_deadline = None;
        self.receiver_type = ReceiverType::Beast;
        tracing::debug!(path = %self.path, "no status message seen, assuming beast receiver");

        if let Err(error) = self.send_settings().await {
            self.handle_error(error).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetFilter(filter) => {
                if filter == self.filter {
                    return;
                }
                self.filter = filter;
            }
            Command::ChangeSettings(settings) => {
                if settings == self.fixed_settings {
                    return;
                }
                self.fixed_settings = settings;
            }
        }

        if self.connection.is_some() {
            if let Err(error) = self.send_settings().await {
                self.handle_error(error).await;
            }
        }
    }

    async fn handle_chunk(&mut self, chunk: Bytes) {
        let mut events = mem::take(&mut self.events);
        self.deframer
            .feed(&mut self.tracker, &chunk, &mut |event| events.push(event));

        for event in events.drain(..) {
            match event {
                Event::Frame {
                    frame,
                    sync_established,
                } => self.dispatch_frame(frame, sync_established).await,
                Event::SyncLost { restart_autobaud } => {
                    if restart_autobaud && !self.autobauding && self.autobaud_rates.len() > 1 {
                        // the chosen rate stopped working; hunt again
                        tracing::debug!(path = %self.path, "sustained sync loss, restarting autobaud");
                        self.autobauding = true;
                        self.advance_autobaud().await;
                    }
                }
            }
        }

        self.events = events;
    }

    async fn dispatch_frame(&mut self, frame: Frame, sync_established: bool) {
        if sync_established && self.autobauding {
            // this rate works; keep it
            tracing::debug!(
                path = %self.path,
                baud_rate = self.autobaud_rates[self.baud_index],
                "autobaud locked"
            );
            self.autobauding = false;
            self.autobaud_deadline = None;
        }

        // while we are not convinced of the rate, don't process messages
        if self.autobauding {
            return;
        }

        if frame.message_type == MessageType::Status {
            let status = Settings::from_status_byte(frame.data[0]);
            self.receiving_gps_timestamps = status.gps_timestamps.get(false);

            if self.receiver_type == ReceiverType::Unknown {
                // only a radarcape sends status messages
                self.receiver_type = ReceiverType::Radarcape;
                self.detect_deadline = None;
                tracing::debug!(path = %self.path, "status message seen, radarcape receiver");

                // renegotiate: the shared g/G dipswitch changes meaning
                if let Err(error) = self.send_settings().await {
                    self.handle_error(error).await;
                    return;
                }
            }
        }

        // until the receiver type is settled we can't interpret messages
        if self.receiver_type == ReceiverType::Unknown {
            return;
        }

        let timestamp_kind = if self.receiving_gps_timestamps {
            TimestampKind::Gps
        }
        else {
            TimestampKind::TwelveMhz
        };

        if let Some(notifier) = &mut self.notifier {
            notifier(frame.into_message(timestamp_kind));
        }
    }
}

enum Wake {
    Shutdown,
    Command(Option<Command>),
    Chunk(Option<io::Result<Bytes>>),
    AutobaudExpired,
    DetectExpired,
    ReconnectExpired,
}

async fn next_chunk<C: Connection>(connection: &mut Option<C>) -> Option<io::Result<Bytes>> {
    match connection {
        Some(connection) => connection.next_chunk().await,
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::Arc,
        time::Duration,
    };

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::{
        sync::mpsc,
        time,
    };

    use crate::{
        Error,
        deframe::ESCAPE,
        filter::Filter,
        input::{
            AUTOBAUD_BASE_INTERVAL,
            InputConfig,
            InputHandle,
            RADARCAPE_DETECT_INTERVAL,
            RECONNECT_INTERVAL,
            ReceiverType,
            SerialInput,
        },
        message::{
            Message,
            MessageType,
            TimestampKind,
        },
        port::{
            Connection,
            Connector,
        },
        settings::{
            Opt,
            Settings,
        },
    };

    const METADATA: [u8; 7] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x60];

    fn wire_frame(type_byte: u8, metadata: &[u8; 7], payload: &[u8]) -> Vec<u8> {
        let mut out = vec![ESCAPE, type_byte];
        for byte in metadata.iter().chain(payload) {
            out.push(*byte);
            if *byte == ESCAPE {
                out.push(ESCAPE);
            }
        }
        out
    }

    fn mode_s_short(timestamp_low: u8) -> Vec<u8> {
        let metadata = [0x01, 0x02, 0x03, 0x04, 0x05, timestamp_low, 0x60];
        wire_frame(0x32, &metadata, &[0x5d, 0x4c, 0xa2, 0xd6, 0x2c, 0xd2, 0x5c])
    }

    /// a status frame whose settings byte carries the given bits
    fn status_frame(status_byte: u8) -> Vec<u8> {
        let mut payload = [0; 14];
        payload[0] = status_byte;
        wire_frame(0x34, &METADATA, &payload)
    }

    #[derive(Default)]
    struct ScriptState {
        connects: Vec<u32>,
        writes: Vec<Bytes>,
        fail_connects: usize,
        feed: Option<mpsc::Sender<io::Result<Bytes>>>,
    }

    #[derive(Clone, Default)]
    struct ScriptedConnector {
        state: Arc<Mutex<ScriptState>>,
    }

    struct ScriptedConnection {
        chunks: mpsc::Receiver<io::Result<Bytes>>,
        state: Arc<Mutex<ScriptState>>,
    }

    impl Connector for ScriptedConnector {
        type Connection = ScriptedConnection;

        async fn connect(&mut self, _path: &str, baud_rate: u32) -> io::Result<ScriptedConnection> {
            let mut state = self.state.lock();
            state.connects.push(baud_rate);

            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
            }

            let (sender, chunks) = mpsc::channel(64);
            state.feed = Some(sender);
            Ok(ScriptedConnection {
                chunks,
                state: self.state.clone(),
            })
        }
    }

    impl Connection for ScriptedConnection {
        async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
            self.chunks.recv().await
        }

        async fn send(&mut self, message: Bytes) -> io::Result<()> {
            self.state.lock().writes.push(message);
            Ok(())
        }
    }

    struct TestInput {
        connector: ScriptedConnector,
        handle: InputHandle,
        messages: Arc<Mutex<Vec<Message>>>,
    }

    impl TestInput {
        fn start(config: InputConfig) -> Self {
            let connector = ScriptedConnector::default();
            let messages: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));

            let mut input = SerialInput::with_connector(connector.clone(), config).unwrap();
            let recorded = messages.clone();
            input.set_message_notifier(move |message| recorded.lock().push(message));
            let handle = input.start();

            Self {
                connector,
                handle,
                messages,
            }
        }

        async fn feed(&self, bytes: Vec<u8>) {
            let feed = self.connector.state.lock().feed.clone().unwrap();
            feed.send(Ok(Bytes::from(bytes))).await.unwrap();
            settle().await;
        }

        async fn feed_error(&self, error: io::Error) {
            let feed = self.connector.state.lock().feed.clone().unwrap();
            feed.send(Err(error)).await.unwrap();
            settle().await;
        }

        fn connects(&self) -> Vec<u32> {
            self.connector.state.lock().connects.clone()
        }

        fn write_count(&self) -> usize {
            self.connector.state.lock().writes.len()
        }

        fn dipswitch_letters(&self, write: usize) -> Vec<u8> {
            let state = self.connector.state.lock();
            state.writes[write].chunks(3).map(|command| command[2]).collect()
        }

        fn message_count(&self) -> usize {
            self.messages.lock().len()
        }
    }

    /// let the engine task drain everything that is ready, without letting
    /// the paused clock move
    async fn settle() {
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
    }

    fn fixed_beast_config() -> InputConfig {
        InputConfig {
            path: "/dev/ttyUSB1".into(),
            receiver_type: ReceiverType::Beast,
            settings: Settings::default(),
            baud_rate: 3_000_000,
        }
    }

    #[test]
    fn it_rejects_an_empty_path() {
        let result = SerialInput::new(InputConfig::default());
        assert!(matches!(result, Err(Error::InvalidPath)));
    }

    #[test]
    fn it_deserializes_a_minimal_config() {
        let config: InputConfig = serde_json::from_str(r#"{"path": "/dev/ttyACM0"}"#).unwrap();
        assert_eq!(config.path, "/dev/ttyACM0");
        assert_eq!(config.receiver_type, ReceiverType::Unknown);
        assert_eq!(config.baud_rate, 0);
        assert_eq!(config.settings, Settings::default());
    }

    #[tokio::test(start_paused = true)]
    async fn it_sends_settings_on_connect() {
        let input = TestInput::start(fixed_beast_config());
        settle().await;

        assert_eq!(input.connects(), vec![3_000_000]);
        assert_eq!(input.write_count(), 1);
        // the default (receive-nothing) filter asks the device to narrow
        // down to DF11/17/18, mask DF0/4/5, and skip FEC
        assert_eq!(input.dipswitch_letters(0), b"CDefGHIj");
    }

    #[tokio::test(start_paused = true)]
    async fn it_delivers_messages_once_autobaud_locks() {
        let mut config = fixed_beast_config();
        config.baud_rate = 0;
        let input = TestInput::start(config);
        settle().await;

        // 49 good frames are not enough to trust the rate
        let mut bytes = Vec::new();
        for n in 0..49 {
            bytes.extend(mode_s_short(n));
        }
        input.feed(bytes).await;
        assert_eq!(input.message_count(), 0);

        // the 50th locks the rate and is the first one delivered
        input.feed(mode_s_short(49)).await;
        assert_eq!(input.message_count(), 1);
        assert_eq!(input.messages.lock()[0].timestamp & 0xff, 49);

        input.feed(mode_s_short(50)).await;
        input.feed(mode_s_short(51)).await;
        assert_eq!(input.message_count(), 3);

        // the autobaud timer is gone: time passing doesn't reopen the port
        time::advance(AUTOBAUD_BASE_INTERVAL * 4).await;
        settle().await;
        assert_eq!(input.connects().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn it_advances_the_autobaud_cursor() {
        let mut config = fixed_beast_config();
        config.baud_rate = 0;
        let input = TestInput::start(config);
        settle().await;
        assert_eq!(input.connects(), vec![3_000_000]);

        // nothing arrives, so the cursor walks the whole list
        for _ in 0..5 {
            time::advance(AUTOBAUD_BASE_INTERVAL).await;
            settle().await;
        }
        assert_eq!(
            input.connects(),
            vec![3_000_000, 1_000_000, 921_600, 230_400, 115_200, 3_000_000]
        );

        // after the wrap the interval has doubled
        time::advance(AUTOBAUD_BASE_INTERVAL).await;
        settle().await;
        assert_eq!(input.connects().len(), 6);
        time::advance(AUTOBAUD_BASE_INTERVAL).await;
        settle().await;
        assert_eq!(input.connects().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn it_restarts_autobaud_on_sustained_sync_loss() {
        let mut config = fixed_beast_config();
        config.baud_rate = 0;
        let input = TestInput::start(config);
        settle().await;

        let mut bytes = Vec::new();
        for n in 0..50 {
            bytes.extend(mode_s_short(n));
        }
        input.feed(bytes).await;
        assert_eq!(input.message_count(), 1);
        assert_eq!(input.connects().len(), 1);

        // a line full of garbage racks up bad syncs until the engine stops
        // trusting the locked rate and moves the cursor on
        input.feed(vec![0x00; 2000]).await;
        assert_eq!(input.connects(), vec![3_000_000, 1_000_000]);
        assert_eq!(input.message_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn it_drops_messages_while_the_receiver_is_unknown() {
        let mut config = fixed_beast_config();
        config.receiver_type = ReceiverType::Unknown;
        let input = TestInput::start(config);
        settle().await;
        assert_eq!(input.write_count(), 1);

        input.feed(mode_s_short(1)).await;
        assert_eq!(input.message_count(), 0);

        // the quiet detection window concludes beast and renegotiates
        time::advance(RADARCAPE_DETECT_INTERVAL).await;
        settle().await;
        assert_eq!(input.write_count(), 2);

        input.feed(mode_s_short(2)).await;
        assert_eq!(input.message_count(), 1);
        assert_eq!(input.messages.lock()[0].timestamp & 0xff, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn it_detects_a_radarcape_from_a_status_message() {
        let mut config = fixed_beast_config();
        config.receiver_type = ReceiverType::Unknown;
        let input = TestInput::start(config);
        settle().await;
        assert_eq!(input.dipswitch_letters(0), b"CDefGHIj");

        // status byte: binary format + gps timestamps
        input.feed(status_frame(0x11)).await;
        assert_eq!(input.write_count(), 2);
        // now that radarcape is known, the g/G switch no longer carries the
        // DF0/4/5 mask but the (unset) gps timestamp option
        assert_eq!(input.dipswitch_letters(1), b"CDefgHIj");

        // the status frame itself is delivered, stamped with the gps clock
        assert_eq!(input.message_count(), 1);
        let message = input.messages.lock()[0].clone();
        assert_eq!(message.message_type, MessageType::Status);
        assert_eq!(message.timestamp_kind, TimestampKind::Gps);

        // the detect timer is cancelled: its expiry must not renegotiate
        time::advance(RADARCAPE_DETECT_INTERVAL).await;
        settle().await;
        assert_eq!(input.write_count(), 2);

        input.feed(mode_s_short(7)).await;
        assert_eq!(input.message_count(), 2);
        assert_eq!(
            input.messages.lock()[1].timestamp_kind,
            TimestampKind::Gps
        );
    }

    #[tokio::test(start_paused = true)]
    async fn it_renegotiates_only_when_the_filter_changes() {
        let input = TestInput::start(fixed_beast_config());
        settle().await;
        assert_eq!(input.write_count(), 1);

        // the default filter is already active
        input.handle.set_filter(Filter::default()).await.unwrap();
        settle().await;
        assert_eq!(input.write_count(), 1);

        let mut filter = Filter::default();
        filter.receive_df[4] = true;
        filter.receive_modeac = true;
        input.handle.set_filter(filter).await.unwrap();
        settle().await;
        assert_eq!(input.write_count(), 2);
        assert_eq!(input.dipswitch_letters(1), b"CdefgHIJ");

        // setting the same filter again is a no-op on the wire
        input.handle.set_filter(filter).await.unwrap();
        settle().await;
        assert_eq!(input.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn it_renegotiates_on_changed_settings() {
        let input = TestInput::start(fixed_beast_config());
        settle().await;
        assert_eq!(input.write_count(), 1);

        input
            .handle
            .change_settings(Settings::default())
            .await
            .unwrap();
        settle().await;
        assert_eq!(input.write_count(), 1);

        let settings = Settings {
            modeac_enable: Opt::ON,
            ..Default::default()
        };
        input.handle.change_settings(settings).await.unwrap();
        settle().await;
        assert_eq!(input.write_count(), 2);
        assert_eq!(input.dipswitch_letters(1), b"CDefGHIJ");
    }

    #[tokio::test(start_paused = true)]
    async fn it_reconnects_after_a_port_error() {
        let mut config = fixed_beast_config();
        config.baud_rate = 0;
        let input = TestInput::start(config);
        settle().await;

        // advance to the second candidate rate first
        time::advance(AUTOBAUD_BASE_INTERVAL).await;
        settle().await;
        assert_eq!(input.connects(), vec![3_000_000, 1_000_000]);

        input
            .feed_error(io::Error::new(io::ErrorKind::PermissionDenied, "unplugged"))
            .await;
        assert_eq!(input.connects().len(), 2);

        // nothing happens until the backoff elapses, then the hunt restarts
        // from the top of the list
        time::advance(RECONNECT_INTERVAL - Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(input.connects().len(), 2);
        time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(input.connects(), vec![3_000_000, 1_000_000, 3_000_000]);
        assert_eq!(input.write_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn it_keeps_reconnecting_while_the_device_is_gone() {
        let input = TestInput::start(fixed_beast_config());
        settle().await;
        assert_eq!(input.connects().len(), 1);

        input.connector.state.lock().fail_connects = 2;
        input
            .feed_error(io::Error::new(io::ErrorKind::PermissionDenied, "unplugged"))
            .await;

        for expected in [2, 3, 4] {
            time::advance(RECONNECT_INTERVAL).await;
            settle().await;
            assert_eq!(input.connects().len(), expected);
        }

        // the fourth attempt succeeds and negotiates settings again
        assert_eq!(input.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn it_stops_on_close() {
        let input = TestInput::start(fixed_beast_config());
        settle().await;

        input.handle.close();
        settle().await;

        // the engine is gone; commands fail fast
        assert!(
            input
                .handle
                .set_filter(Filter::default())
                .await
                .is_err()
        );
    }
}

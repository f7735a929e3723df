//! The serial-port seam.
//!
//! The engine only ever sees a [`Connection`]: a stream of read chunks plus
//! a sink for device-bound messages. The production implementation opens
//! real ports through the `serialport` crate; since those reads and writes
//! block, each connection runs a reader thread and a writer thread that
//! bridge the port onto tokio channels. Dropping the connection closes the
//! channels and both threads wind down on their own.

use std::{
    io::{
        self,
        Read,
        Write,
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::mpsc;

/// the number of bytes to try to read at a time from the serial port
pub const READ_BUFFER_SIZE: usize = 4096;

const CHUNK_QUEUE_SIZE: usize = 16;
const WRITE_QUEUE_SIZE: usize = 16;

/// blocking reads wake up this often so the reader thread notices a dropped
/// connection
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One open serial connection.
pub trait Connection: Send + 'static {
    /// The next chunk read from the device, or the error that ended the
    /// connection. `None` means the connection is gone entirely.
    fn next_chunk(&mut self) -> impl Future<Output = Option<io::Result<Bytes>>> + Send;

    /// Queue a message for the device. Sending is fire-and-forget: a write
    /// failure surfaces through [`Connection::next_chunk`] instead, so all
    /// port faults reach the engine on one path.
    fn send(&mut self, message: Bytes) -> impl Future<Output = io::Result<()>> + Send;
}

/// Opens [`Connection`]s. The engine reopens through this on every
/// reconnect and autobaud step.
pub trait Connector: Send + 'static {
    type Connection: Connection;

    fn connect(
        &mut self,
        path: &str,
        baud_rate: u32,
    ) -> impl Future<Output = io::Result<Self::Connection>> + Send;
}

/// Opens real serial ports. Line parameters are fixed at 8N1 with RTS/CTS
/// hardware flow control; only the baud rate varies.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    type Connection = SerialConnection;

    async fn connect(&mut self, path: &str, baud_rate: u32) -> io::Result<SerialConnection> {
        let path = path.to_owned();
        tokio::task::spawn_blocking(move || SerialConnection::open(&path, baud_rate))
            .await
            .map_err(io::Error::other)?
    }
}

#[derive(Debug)]
pub struct SerialConnection {
    chunks: mpsc::Receiver<io::Result<Bytes>>,
    writes: mpsc::Sender<Bytes>,
}

impl SerialConnection {
    fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::Hardware)
            .timeout(READ_POLL_INTERVAL)
            .open()
            .map_err(io::Error::from)?;
        let write_port = port.try_clone().map_err(io::Error::from)?;

        tracing::debug!(path, baud_rate, "serial port opened");

        let (chunk_sender, chunks) = mpsc::channel(CHUNK_QUEUE_SIZE);
        let (writes, write_receiver) = mpsc::channel(WRITE_QUEUE_SIZE);

        thread::spawn({
            let chunk_sender = chunk_sender.clone();
            let path = path.to_owned();
            move || reader_thread(&path, port, chunk_sender)
        });
        thread::spawn({
            let path = path.to_owned();
            move || writer_thread(&path, write_port, write_receiver, chunk_sender)
        });

        Ok(Self { chunks, writes })
    }
}

impl Connection for SerialConnection {
    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.chunks.recv().await
    }

    async fn send(&mut self, message: Bytes) -> io::Result<()> {
        self.writes
            .send(message)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "serial writer thread gone"))
    }
}

fn reader_thread(
    path: &str,
    mut port: Box<dyn serialport::SerialPort>,
    chunk_sender: mpsc::Sender<io::Result<Bytes>>,
) {
    let _guard = tracing::debug_span!("serial reader", path).entered();

    let mut buffer = [0; READ_BUFFER_SIZE];
    loop {
        if chunk_sender.is_closed() {
            break;
        }

        match port.read(&mut buffer) {
            Ok(0) => {
                // end of file: the device went away
                let _ = chunk_sender.blocking_send(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial port returned end of file",
                )));
                break;
            }
            Ok(n) => {
                if chunk_sender
                    .blocking_send(Ok(Bytes::copy_from_slice(&buffer[..n])))
                    .is_err()
                {
                    break;
                }
            }
            // the poll tick; go around and check for shutdown
            Err(error) if error.kind() == io::ErrorKind::TimedOut => continue,
            Err(error) => {
                let _ = chunk_sender.blocking_send(Err(error));
                break;
            }
        }
    }

    tracing::debug!("serial reader thread exiting");
}

fn writer_thread(
    path: &str,
    mut port: Box<dyn serialport::SerialPort>,
    mut writes: mpsc::Receiver<Bytes>,
    chunk_sender: mpsc::Sender<io::Result<Bytes>>,
) {
    let _guard = tracing::debug_span!("serial writer", path).entered();

    while let Some(message) = writes.blocking_recv() {
        if let Err(error) = port.write_all(&message).and_then(|()| port.flush()) {
            // surface the fault on the read path so the engine reconnects
            let _ = chunk_sender.blocking_send(Err(error));
            break;
        }
    }

    tracing::debug!("serial writer thread exiting");
}

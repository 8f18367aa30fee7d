use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error, info, trace, warn};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_serial::SerialPortBuilderExt;
pub use tokio_serial::{DataBits, FlowControl, Parity, SerialStream, StopBits};

use super::encoding::hex_dump;
use crate::error::{ModemError, Result};

/// Size of a single read from the device.
const READ_BUFFER_SIZE: usize = 1024;

/// serial port settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
    pub timeout: Duration,
}

impl PortSettings {
    /// 9600 8N1 without flow control, the framing GSM modems expect.
    pub fn new(port_name: impl Into<String>) -> Self {
        PortSettings {
            port_name: port_name.into(),
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            timeout: Duration::from_millis(500),
        }
    }

    /// Overrides the baud rate.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

/// open serial port
pub async fn open_port(settings: &PortSettings) -> Result<SerialStream> {
    match tokio_serial::new(&settings.port_name, settings.baud_rate)
        .data_bits(settings.data_bits)
        .parity(settings.parity)
        .stop_bits(settings.stop_bits)
        .flow_control(settings.flow_control)
        .timeout(settings.timeout)
        .open_native_async()
    {
        Ok(stream) => {
            info!("Opened serial port: {}", settings.port_name);
            Ok(stream)
        }
        Err(e) => {
            error!("Failed to open serial port {}: {}", settings.port_name, e);
            Err(ModemError::port_open(&settings.port_name, e.to_string()))
        }
    }
}

/// serial link state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// serial port is ready
    Ready,
    /// serial port was closed by us
    Closed,
    /// serial port failed and will not recover
    Error,
}

impl LinkState {
    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Ready)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Ready => write!(f, "ready"),
            LinkState::Closed => write!(f, "closed"),
            LinkState::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of the open session's parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialSession {
    pub device_path: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub data_bits: DataBits,
    pub is_open: bool,
}

/// An open serial channel.
///
/// One task reads the device and broadcasts every chunk to all current
/// subscribers in arrival order. Another task owns the write half and drains
/// an ordered queue, so [`SerialLink::write`] never waits on the device.
/// When the reader stops (EOF, I/O error or [`SerialLink::close`]) every
/// subscription sees end of stream.
pub struct SerialLink {
    settings: PortSettings,
    // Never polled; only used to hand out fresh receivers.
    template: broadcast::Receiver<Vec<u8>>,
    writes: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<watch::Sender<LinkState>>,
    listeners: Arc<AtomicUsize>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SerialLink {
    /// Opens the device described by `settings`.
    pub async fn open(settings: PortSettings, capacity: usize) -> Result<Self> {
        let stream = open_port(&settings).await?;
        Ok(Self::spawn(stream, settings, capacity))
    }

    /// Starts the read and write tasks over an already open transport.
    pub fn spawn<T>(port: T, settings: PortSettings, capacity: usize) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut rec, mut send) = io::split(port);
        let (chunk_tx, template) = broadcast::channel(capacity);
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (state, _) = watch::channel(LinkState::Ready);
        let state = Arc::new(state);

        let read_state = state.clone();
        let name = settings.port_name.clone();
        let reader = tokio::spawn(async move {
            debug!("Read task started on {name}");
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match rec.read(&mut buffer[..]).await {
                    Ok(0) => {
                        warn!("Serial port {name} reached end of stream");
                        read_state.send_replace(LinkState::Error);
                        break;
                    }
                    Ok(n) => {
                        trace!("{name} rx [{}]", hex_dump(&buffer[..n]));
                        // Err only means nobody is subscribed right now.
                        let _ = chunk_tx.send(buffer[..n].to_vec());
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Serial port {name} read error: {e}");
                        read_state.send_replace(LinkState::Error);
                        break;
                    }
                }
            }
        });

        let write_state = state.clone();
        let name = settings.port_name.clone();
        let stop_reader = reader.abort_handle();
        let writer = tokio::spawn(async move {
            debug!("Write task started on {name}");
            while let Some(data) = write_rx.recv().await {
                trace!("{name} tx [{}]", hex_dump(&data));
                let result = match send.write_all(&data).await {
                    Ok(()) => send.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    error!("Serial port {name} write error: {e}");
                    // A dead write side ends the session for readers too.
                    write_state.send_replace(LinkState::Error);
                    stop_reader.abort();
                    break;
                }
            }
        });

        SerialLink {
            settings,
            template,
            writes: write_tx,
            state,
            listeners: Arc::new(AtomicUsize::new(0)),
            reader,
            writer,
        }
    }

    /// Queues `data` for the device. Returns once queued, not once written.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let state = self.state();
        if !state.is_open() {
            return Err(ModemError::port_write(format!(
                "{} is {state}",
                self.settings.port_name
            )));
        }
        self.writes
            .send(data.into())
            .map_err(|_| ModemError::port_write(format!("{} writer stopped", self.settings.port_name)))
    }

    /// Subscribes to chunks arriving from now on.
    pub fn subscribe(&self) -> Subscription {
        let count = self.listeners.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Listener attached to {} ({count} active)", self.settings.port_name);
        Subscription {
            rx: self.template.resubscribe(),
            listeners: self.listeners.clone(),
        }
    }

    /// Number of live subscriptions.
    pub fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Resolves once the link leaves [`LinkState::Ready`].
    pub async fn closed(&self) -> LinkState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| !s.is_open()).await {
            Ok(state) => *state,
            Err(_) => LinkState::Closed,
        }
    }

    pub fn settings(&self) -> &PortSettings {
        &self.settings
    }

    pub fn session(&self) -> SerialSession {
        SerialSession {
            device_path: self.settings.port_name.clone(),
            baud_rate: self.settings.baud_rate,
            parity: self.settings.parity,
            stop_bits: self.settings.stop_bits,
            data_bits: self.settings.data_bits,
            is_open: self.is_open(),
        }
    }

    /// Stops both tasks; every subscription then sees end of stream.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        if self.is_open() {
            self.state.send_replace(LinkState::Closed);
        }
        info!("Closed serial port: {}", self.settings.port_name);
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// A live listener on a [`SerialLink`]. Dropping it detaches the listener.
pub struct Subscription {
    rx: broadcast::Receiver<Vec<u8>>,
    listeners: Arc<AtomicUsize>,
}

impl Subscription {
    /// Next chunk, or `None` once the link has stopped reading.
    ///
    /// Chunks dropped because this listener fell behind are logged and
    /// skipped.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.recv().await {
                Ok(chunk) => return Some(chunk),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Listener lagged, {skipped} chunks dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let left = self.listeners.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("Listener released ({left} active)");
    }
}

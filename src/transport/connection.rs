//! Duplex connection to the remote debugger.
//!
//! Three tasks cooperate per attached connection:
//!
//! - the **reader** performs the handshake, then decodes frames and queues
//!   them for dispatch;
//! - the **dispatch** task drains the inbound queue and calls the single
//!   [`NetListener`] strictly in arrival order, interleaved with closures
//!   submitted through [`Connection::run_in_dispatch`];
//! - the **writer** drains the outbound queue one message at a time. It is
//!   spawned by the reader only after the handshake succeeded, so nothing
//!   written by callers can race the greeting.
//!
//! Any read or write failure fires the shared [`ShutdownSignal`] in
//! immediate mode. [`Connection::close`] fires it in lameduck mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handshake::{Handshake, RemoteInfo};
use super::message::{Message, MessageCodec, WireItem, DEFAULT_MAX_FRAME_BYTES};
use super::shutdown::{ShutdownMode, ShutdownSignal};
use crate::config::DebuggerConfig;
use crate::{AppError, Result};

/// Receiver of everything the remote sends. All callbacks run on the
/// connection's dispatch task.
pub trait NetListener: Send + Sync {
    /// One inbound message, in arrival order.
    fn message_received(&self, message: Message);

    /// The inbound stream ended. Always the last inbound item, delivered once.
    fn eos_received(&self);

    /// The connection shut down. Called once, from the shutdown fan-out.
    fn connection_closed(&self);
}

/// Connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// `host:port` used by [`Connection::connect`].
    pub address: String,
    /// Greeting variant.
    pub handshake: Handshake,
    /// Bounded wait for queued writes on a graceful close.
    pub lameduck_delay: Duration,
    /// Inbound payload limit.
    pub max_frame_bytes: usize,
}

impl ConnectionOptions {
    /// Options derived from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &DebuggerConfig) -> Self {
        Self {
            address: config.address(),
            handshake: config.handshake.into(),
            lameduck_delay: config.lameduck_delay(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9222".into(),
            handshake: Handshake::Chrome,
            lameduck_delay: Duration::from_millis(1000),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

type DispatchTask = Box<dyn FnOnce() + Send>;

enum Inbound {
    Message(Message),
    Eos,
    Task(DispatchTask),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Detached,
    Attached,
    Closed,
}

struct Shared {
    options: ConnectionOptions,
    listener: OnceLock<Arc<dyn NetListener>>,
    state: Mutex<LinkState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    shutdown: ShutdownSignal,
    runtime: OnceLock<Handle>,
    writer_started: AtomicBool,
    writer_finished: CancellationToken,
    remote_info: OnceLock<RemoteInfo>,
}

/// Handle to one duplex connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Detached connection with the given options.
    #[must_use]
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                listener: OnceLock::new(),
                state: Mutex::new(LinkState::Detached),
                outbound: Mutex::new(None),
                inbound: Mutex::new(None),
                shutdown: ShutdownSignal::new(),
                runtime: OnceLock::new(),
                writer_started: AtomicBool::new(false),
                writer_finished: CancellationToken::new(),
                remote_info: OnceLock::new(),
            }),
        }
    }

    /// Register the single inbound listener. Must happen before start.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if a listener is already registered.
    pub fn set_listener(&self, listener: Arc<dyn NetListener>) -> Result<()> {
        self.shared
            .listener
            .set(listener)
            .map_err(|_| AppError::State("Cannot change NetListener".into()))
    }

    /// Open a TCP stream to the configured address and attach to it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the connect fails, or the errors of
    /// [`Connection::start`].
    pub async fn connect(&self) -> Result<()> {
        let address = &self.shared.options.address;
        let stream = TcpStream::connect(address)
            .await
            .map_err(|err| AppError::Transport(format!("failed to connect to {address}: {err}")))?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!(%err, "failed to disable nagle on debugger socket");
        }
        info!(%address, "connected to remote debugger");
        self.start(stream)
    }

    /// Attach to `stream` and spawn the reader and dispatch tasks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if no listener is registered, the
    /// connection was already started or closed, or no tokio runtime is
    /// running.
    pub fn start<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let listener = self
            .shared
            .listener
            .get()
            .cloned()
            .ok_or_else(|| AppError::State("NetListener is not set".into()))?;
        let runtime = Handle::try_current()
            .map_err(|err| AppError::State(format!("no tokio runtime: {err}")))?;

        {
            let mut state = lock(&self.shared.state)?;
            match *state {
                LinkState::Detached => *state = LinkState::Attached,
                LinkState::Attached => {
                    return Err(AppError::State("Connection already attached".into()))
                }
                LinkState::Closed => return Err(AppError::State("Connection closed".into())),
            }
        }
        let _ = self.shared.runtime.set(runtime.clone());

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        *lock(&self.shared.outbound)? = Some(outbound_tx);
        *lock(&self.shared.inbound)? = Some(inbound_tx);

        let weak = Arc::downgrade(&self.shared);
        let closed_listener = Arc::clone(&listener);
        self.shared.shutdown.on_fire(move |mode| {
            if let Some(shared) = weak.upgrade() {
                shared.begin_shutdown(mode);
            }
            closed_listener.connection_closed();
        });

        let (read_half, write_half) = tokio::io::split(stream);
        runtime.spawn(run_dispatch(inbound_rx, listener));
        runtime.spawn(run_reader(
            Arc::clone(&self.shared),
            read_half,
            write_half,
            outbound_rx,
        ));
        debug!("connection attached");
        Ok(())
    }

    /// Queue `message` for the writer task. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if the connection is not attached or
    /// already closed. No bytes are written in that case.
    pub fn send(&self, message: Message) -> Result<()> {
        self.ensure_attached()?;
        let outbound = lock(&self.shared.outbound)?;
        let sender = outbound
            .as_ref()
            .ok_or_else(|| AppError::State("Connection closed".into()))?;
        sender
            .send(message)
            .map_err(|_| AppError::State("Connection closed".into()))
    }

    /// Run `task` on the dispatch task, after everything queued so far.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if the connection is not attached or the
    /// inbound queue was already closed by end of stream.
    pub fn run_in_dispatch(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        if matches!(self.state(), LinkState::Detached) {
            return Err(AppError::State("Connection not attached".into()));
        }
        let inbound = lock(&self.shared.inbound)?;
        let sender = inbound
            .as_ref()
            .ok_or_else(|| AppError::State("Connection is closed".into()))?;
        sender
            .send(Inbound::Task(Box::new(task)))
            .map_err(|_| AppError::State("Connection is closed".into()))
    }

    /// Close gracefully: queued writes get the lameduck delay to drain.
    pub fn close(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            if *state == LinkState::Detached {
                *state = LinkState::Closed;
            }
        }
        if self.shared.shutdown.fire(ShutdownMode::Lameduck) {
            info!("connection closing (lameduck)");
        }
    }

    /// Whether the connection is attached and not yet shut down.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state() == LinkState::Attached
    }

    /// Versions announced by a standalone V8 remote during the handshake.
    #[must_use]
    pub fn remote_info(&self) -> Option<RemoteInfo> {
        self.shared.remote_info.get().cloned()
    }

    /// Resolves once every connection task has been told to stop.
    pub async fn closed(&self) {
        self.shared.shutdown.hard_stop_token().cancelled().await;
    }

    fn state(&self) -> LinkState {
        self.shared
            .state
            .lock()
            .map_or(LinkState::Closed, |state| *state)
    }

    fn ensure_attached(&self) -> Result<()> {
        match self.state() {
            LinkState::Attached => Ok(()),
            LinkState::Detached => Err(AppError::State("Connection not attached".into())),
            LinkState::Closed => Err(AppError::State("Connection closed".into())),
        }
    }
}

impl Shared {
    fn begin_shutdown(self: &Arc<Self>, mode: ShutdownMode) {
        if let Ok(mut state) = self.state.lock() {
            *state = LinkState::Closed;
        }
        // Dropping the sender lets the writer drain what is queued and exit.
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }

        let runtime = self.runtime.get();
        match (mode, runtime) {
            (ShutdownMode::Lameduck, Some(runtime))
                if self.writer_started.load(Ordering::SeqCst) =>
            {
                let shared = Arc::clone(self);
                let delay = self.options.lameduck_delay;
                runtime.spawn(async move {
                    let finished = shared.writer_finished.clone();
                    if tokio::time::timeout(delay, finished.cancelled())
                        .await
                        .is_err()
                    {
                        warn!(?delay, "lameduck delay expired, stopping connection");
                    }
                    shared.shutdown.stop_now();
                });
            }
            _ => self.shutdown.stop_now(),
        }
    }

    fn enqueue(&self, item: Inbound) {
        if let Ok(inbound) = self.inbound.lock() {
            if let Some(sender) = inbound.as_ref() {
                let _ = sender.send(item);
            }
        }
    }

    /// Queue the end-of-stream marker and refuse anything queued after it.
    fn finish_inbound(&self) {
        let sender = self.inbound.lock().ok().and_then(|mut inbound| inbound.take());
        if let Some(sender) = sender {
            let _ = sender.send(Inbound::Eos);
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn run_reader<R, W>(
    shared: Arc<Shared>,
    read_half: R,
    mut write_half: W,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let cancel = shared.shutdown.hard_stop_token();
    let handshake = shared.options.handshake;
    let mut input = FramedRead::new(
        read_half,
        MessageCodec::new(handshake.initial_mode(), shared.options.max_frame_bytes),
    );

    match handshake.perform(&mut input, &mut write_half, &cancel).await {
        Ok(remote_info) => {
            if let Some(remote_info) = remote_info {
                let _ = shared.remote_info.set(remote_info);
            }
            shared.writer_started.store(true, Ordering::SeqCst);
            tokio::spawn(run_writer(Arc::clone(&shared), write_half, outbound_rx));
        }
        Err(err) => {
            error!(%err, "handshake failed");
            shared.shutdown.fire(ShutdownMode::Immediate);
            shared.finish_inbound();
            return;
        }
    }

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("reader: hard stop received");
                break;
            }

            next = input.next() => match next {
                Some(Ok(WireItem::Frame(message))) => shared.enqueue(Inbound::Message(message)),
                Some(Ok(WireItem::Line(line))) => {
                    warn!(%line, "reader: stray line outside of a frame, skipping");
                }
                Some(Err(err)) => {
                    error!(%err, "reader: inbound stream failed");
                    shared.shutdown.fire(ShutdownMode::Immediate);
                    break;
                }
                None => {
                    info!("reader: remote closed the stream");
                    shared.shutdown.fire(ShutdownMode::Immediate);
                    break;
                }
            },
        }
    }

    shared.finish_inbound();
}

async fn run_writer<W>(
    shared: Arc<Shared>,
    write_half: W,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let cancel = shared.shutdown.hard_stop_token();
    let mut output = FramedWrite::new(
        write_half,
        MessageCodec::frames(shared.options.max_frame_bytes),
    );

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("writer: hard stop received");
                break;
            }

            next = outbound_rx.recv() => match next {
                None => {
                    debug!("writer: outbound queue closed");
                    break;
                }
                Some(message) => {
                    if let Err(err) = output.send(message).await {
                        error!(%err, "writer: write failed");
                        shared.shutdown.fire(ShutdownMode::Immediate);
                        break;
                    }
                }
            },
        }
    }

    shared.writer_finished.cancel();
}

async fn run_dispatch(
    mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    listener: Arc<dyn NetListener>,
) {
    while let Some(item) = inbound_rx.recv().await {
        match item {
            Inbound::Message(message) => listener.message_received(message),
            Inbound::Eos => listener.eos_received(),
            Inbound::Task(task) => task(),
        }
    }
    debug!("dispatch: inbound queue drained");
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| AppError::State("connection state lock poisoned".into()))
}

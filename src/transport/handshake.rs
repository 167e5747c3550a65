//! Connection handshake performed before framed message exchange.
//!
//! Two variants exist:
//!
//! 1. **Chrome**: the client writes `ChromeDevToolsHandshake\r\n` and then
//!    reads one line, which must be the identical literal. End of stream,
//!    any other line, or cancellation fails the handshake.
//! 2. **Standalone V8**: the remote speaks first with one framed message
//!    whose headers carry `Protocol-Version`, `V8-Version` and optionally
//!    `Embedding-Host`.
//!
//! The handshake reads through the same [`FramedRead`] that later carries
//! frames, so bytes the remote sends right after its greeting stay buffered.
//! The writer task must not start until [`Handshake::perform`] returns.

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::message::{CodecMode, MessageCodec, WireItem};
use crate::config::HandshakeKind;
use crate::{AppError, Result};

/// Greeting literal exchanged by the Chrome variant, without terminator.
pub const CHROME_GREETING: &str = "ChromeDevToolsHandshake";

/// Header carrying the remote protocol version.
pub const PROTOCOL_VERSION_HEADER: &str = "Protocol-Version";
/// Header carrying the remote V8 version.
pub const V8_VERSION_HEADER: &str = "V8-Version";
/// Optional header naming the embedding host process.
pub const EMBEDDING_HOST_HEADER: &str = "Embedding-Host";

/// Version information announced by a standalone V8 remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    /// Wire protocol version.
    pub protocol_version: String,
    /// V8 engine version.
    pub v8_version: String,
    /// Embedding application, when announced.
    pub embedding_host: Option<String>,
}

/// Handshake variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Literal greeting line in both directions.
    Chrome,
    /// One framed message carrying version headers.
    StandaloneV8,
}

impl From<HandshakeKind> for Handshake {
    fn from(kind: HandshakeKind) -> Self {
        match kind {
            HandshakeKind::Chrome => Self::Chrome,
            HandshakeKind::StandaloneV8 => Self::StandaloneV8,
        }
    }
}

impl Handshake {
    /// Codec mode the inbound stream must start in for this variant.
    #[must_use]
    pub fn initial_mode(self) -> CodecMode {
        match self {
            Self::Chrome => CodecMode::Lines,
            Self::StandaloneV8 => CodecMode::Frames,
        }
    }

    /// Run the handshake. On success the codec is in frame mode.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` when the stream ends, the remote sends
    /// something unexpected, a write fails, or `cancel` fires first.
    pub async fn perform<R, W>(
        self,
        input: &mut FramedRead<R, MessageCodec>,
        output: &mut W,
        cancel: &CancellationToken,
    ) -> Result<Option<RemoteInfo>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let outcome = match self {
            Self::Chrome => chrome(input, output, cancel).await.map(|()| None),
            Self::StandaloneV8 => standalone_v8(input, cancel).await.map(Some),
        };
        input.decoder_mut().enter_frames();
        outcome
    }
}

async fn chrome<R, W>(
    input: &mut FramedRead<R, MessageCodec>,
    output: &mut W,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let greeting = format!("{CHROME_GREETING}\r\n");
    output
        .write_all(greeting.as_bytes())
        .await
        .map_err(|err| AppError::Transport(format!("handshake write failed: {err}")))?;
    output
        .flush()
        .await
        .map_err(|err| AppError::Transport(format!("handshake write failed: {err}")))?;
    debug!("handshake: greeting sent");

    let next = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            return Err(AppError::Transport("handshake interrupted".into()));
        }
        next = input.next() => next,
    };

    match next {
        None => Err(AppError::Transport("connection closed during handshake".into())),
        Some(Err(err)) => Err(err),
        Some(Ok(WireItem::Line(line))) if line == CHROME_GREETING => {
            info!("handshake: greeting acknowledged");
            Ok(())
        }
        Some(Ok(WireItem::Line(line))) => {
            Err(AppError::Transport(format!("unexpected handshake: {line}")))
        }
        Some(Ok(WireItem::Frame(_))) => Err(AppError::Transport(
            "unexpected frame during handshake".into(),
        )),
    }
}

async fn standalone_v8<R>(
    input: &mut FramedRead<R, MessageCodec>,
    cancel: &CancellationToken,
) -> Result<RemoteInfo>
where
    R: AsyncRead + Unpin,
{
    let next = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            return Err(AppError::Transport("handshake interrupted".into()));
        }
        next = input.next() => next,
    };

    let message = match next {
        None => return Err(AppError::Transport("end of stream during handshake".into())),
        Some(Err(err)) => {
            return Err(AppError::Transport(format!(
                "unrecognized handshake message from remote: {err}"
            )))
        }
        Some(Ok(WireItem::Frame(message))) => message,
        Some(Ok(WireItem::Line(line))) => {
            return Err(AppError::Transport(format!("unexpected handshake: {line}")));
        }
    };

    let protocol_version = message
        .header(PROTOCOL_VERSION_HEADER)
        .ok_or_else(|| AppError::Transport("absent protocol version".into()))?
        .trim()
        .to_owned();
    let v8_version = message
        .header(V8_VERSION_HEADER)
        .ok_or_else(|| AppError::Transport("absent V8 VM version".into()))?
        .trim()
        .to_owned();
    let embedding_host = message
        .header(EMBEDDING_HOST_HEADER)
        .map(|host| host.trim().to_owned());

    info!(%protocol_version, %v8_version, "handshake: remote announced versions");
    Ok(RemoteInfo {
        protocol_version,
        v8_version,
        embedding_host,
    })
}

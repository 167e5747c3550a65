//! V8 half of the command processor.

use std::sync::Weak;

use tracing::{debug, warn};

use super::SessionCore;
use crate::dispatch::{ProcessorHandler, Routed};
use crate::protocol::v8::{CommandResponse, Incoming, V8Request};
use crate::transport::{Connection, Message};
use crate::Result;

/// Writes V8 requests to the connection and routes responses by
/// `request_seq`. Events go to the owning session.
pub(crate) struct V8CommandHandler {
    connection: Connection,
    session: Weak<SessionCore>,
}

impl V8CommandHandler {
    pub(crate) fn new(connection: Connection, session: Weak<SessionCore>) -> Self {
        Self {
            connection,
            session,
        }
    }
}

impl ProcessorHandler for V8CommandHandler {
    type Outgoing = V8Request;
    type Incoming = Incoming;
    type Response = CommandResponse;

    fn set_seq(&self, message: &mut V8Request, seq: u64) {
        message.seq = seq;
    }

    fn command_name(&self, message: &V8Request) -> String {
        message.command.to_owned()
    }

    fn send(&self, message: V8Request) -> Result<()> {
        let content = message.to_json()?;
        self.connection.send(Message::with_content(content))
    }

    fn route(&self, incoming: Incoming) -> Routed<CommandResponse, Incoming> {
        match incoming {
            Incoming::Response(response) => match response.request_seq() {
                Ok(seq) => Routed::Response {
                    seq,
                    outcome: Ok(response),
                },
                Err(err) => {
                    warn!(%err, "response without usable request_seq");
                    Routed::NonSeq(Incoming::Response(response))
                }
            },
            event @ Incoming::Event(_) => Routed::NonSeq(event),
        }
    }

    fn accept_non_seq(&self, incoming: Incoming) {
        match incoming {
            Incoming::Event(event) => {
                if let Some(core) = self.session.upgrade() {
                    core.handle_event(&event);
                }
            }
            Incoming::Response(response) => {
                debug!(command = ?response.command(), "dropping uncorrelated response");
            }
        }
    }
}

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::{CommandId, ParamId};
use crate::network::RequestBroker;
use crate::params::ParameterStore;
use super::frame::{decode_table, encode_table, Frame, FrameKind, Operation, STATUS_FAILED, STATUS_OK};

/// Receives every frame decoded from the link
pub trait FrameDispatcher: Send + Sync + 'static {
    /// Handles one inbound frame, returning the reply to write, if any.
    ///
    /// Replies to our own requests must be handed to
    /// [`RequestBroker::deliver_response`].
    fn on_frame(&self, frame: Frame, broker: &RequestBroker) -> Option<Frame>;

    /// Called on the server when the client stopped answering probes
    fn on_liveness_lost(&self) {}
}

/// Handler for commands other than keepalive; returns whether it succeeded
pub type CommandHandler = Arc<dyn Fn(CommandId) -> bool + Send + Sync>;

/// Dispatcher serving a parameter table to the peer
pub struct ParameterDispatcher<S> {
    store: Arc<S>,
    safe_state: Vec<(ParamId, i32)>,
    commands: Option<CommandHandler>,
}

impl<S: ParameterStore> ParameterDispatcher<S> {
    /// Creates a dispatcher answering from `store`
    pub fn new(store: Arc<S>) -> Self {
        ParameterDispatcher {
            store,
            safe_state: Vec::new(),
            commands: None,
        }
    }

    /// Values forced when the peer goes silent, e.g. motor outputs off
    pub fn with_safe_state(mut self, safe_state: Vec<(ParamId, i32)>) -> Self {
        self.safe_state = safe_state;
        self
    }

    /// Handler for commands other than keepalive
    pub fn with_command_handler(mut self, handler: CommandHandler) -> Self {
        self.commands = Some(handler);
        self
    }

    fn answer(&self, request: &Frame) -> Option<Frame> {
        let id = ParamId(request.operand());
        let payload = match Operation::try_from(request.operation()) {
            Ok(Operation::Get) => match self.store.get(id) {
                Some(value) => value.to_le_bytes().to_vec(),
                None => {
                    debug!(%id, "get of unknown parameter");
                    Vec::new()
                }
            },
            Ok(Operation::Set) => match request.value().and_then(|value| self.store.set(id, value)) {
                Ok(()) => vec![STATUS_OK],
                Err(e) => {
                    debug!(%id, error = %e, "set refused");
                    vec![STATUS_FAILED]
                }
            },
            Ok(Operation::GetAll) => match encode_table(&self.store.table()) {
                Ok(table) => table.to_vec(),
                Err(e) => {
                    warn!(error = %e, "parameter table does not fit a frame");
                    Vec::new()
                }
            },
            Ok(Operation::SetAll) => {
                let mut refused = 0;
                for (index, value) in decode_table(request.payload()).into_iter().enumerate() {
                    if let Err(e) = self.store.set(ParamId(index as u8), value) {
                        debug!(index, error = %e, "table slot refused");
                        refused += 1;
                    }
                }
                vec![status(refused == 0)]
            }
            Err(e) => {
                warn!(error = %e, "request with unknown operation");
                vec![STATUS_FAILED]
            }
        };
        match request.reply(payload) {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(error = %e, "reply not built");
                None
            }
        }
    }

    fn apply_push(&self, frame: &Frame) {
        if frame.operation() != Operation::Set as u8 {
            debug!(%frame, "unsolicited data ignored");
            return;
        }
        let id = ParamId(frame.operand());
        match frame.value().and_then(|value| self.store.set(id, value)) {
            Ok(()) => debug!(%id, "pushed value applied"),
            Err(e) => warn!(%id, error = %e, "pushed value refused"),
        }
    }

    fn run_command(&self, frame: &Frame) -> Option<Frame> {
        let command = CommandId(frame.operation());
        let ok = match (command, &self.commands) {
            (CommandId::KEEPALIVE, _) => true,
            (_, Some(handler)) => handler(command),
            (_, None) => {
                debug!(%command, "no handler for command");
                false
            }
        };
        frame.reply(vec![status(ok)]).ok()
    }
}

impl<S: ParameterStore> FrameDispatcher for ParameterDispatcher<S> {
    fn on_frame(&self, frame: Frame, broker: &RequestBroker) -> Option<Frame> {
        if broker.deliver_response(&frame) {
            return None;
        }
        match frame.kind() {
            FrameKind::Request => self.answer(&frame),
            FrameKind::Data => {
                self.apply_push(&frame);
                None
            }
            FrameKind::Command if frame.is_command_reply() => {
                debug!(%frame, "late command reply dropped");
                None
            }
            FrameKind::Command => self.run_command(&frame),
        }
    }

    fn on_liveness_lost(&self) {
        for &(id, value) in &self.safe_state {
            if let Err(e) = self.store.set(id, value) {
                warn!(%id, error = %e, "safe state not applied");
            }
        }
        if !self.safe_state.is_empty() {
            info!(count = self.safe_state.len(), "safe state applied");
        }
    }
}

fn status(ok: bool) -> u8 {
    if ok {
        STATUS_OK
    } else {
        STATUS_FAILED
    }
}

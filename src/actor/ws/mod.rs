//! Browser sessions - handshake validation and per-target multicast
//!
//! The hub is plain state owned by the coordinator; socket I/O lives in
//! `server`, which forwards every connection, frame and disconnect as a
//! [`HubEvent`].
//!
//! # Architecture
//!
//! ```text
//! browser ──ws──► server task ──[HubEvent]──► Coordinator ──► SocketHub
//!    ▲                                                          │
//!    └──────────────── text frames (per-session channel) ◄──────┘
//! ```
//!
//! A session is either bound to an existing, enabled target or in the
//! terminal `ClientError` state. Errored sessions keep their connection
//! (the diagnostic has been sent) but never receive another message.

mod protocol;
mod server;

pub use protocol::{
    ClientMessage, Handshake, HandshakeError, PROTOCOL_VERSION, ProtocolError, ServerMessage,
    WireStatus, decode_client_message, parse_handshake, reconnect_delay, reconnect_schedule,
};
pub use server::{HubEvent, SessionId, WsServer};

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use crate::core::CompilationMode;

/// Text frames queued for one connection.
pub type SessionTx = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Bound { target: String },
    ClientError { message: String },
}

#[derive(Debug)]
pub struct Session {
    pub state: SessionState,
    /// Compiled timestamp of the code running in the tab.
    pub compiled_timestamp: u64,
    /// Mode of the code running in the tab, once known.
    pub mode: Option<CompilationMode>,
    pub idle: bool,
    pub focused: bool,
    tx: SessionTx,
}

impl Session {
    pub fn target(&self) -> Option<&str> {
        match &self.state {
            SessionState::Bound { target } => Some(target),
            SessionState::ClientError { .. } => None,
        }
    }

    /// Any server message means the tab has work to do again.
    fn send(&mut self, json: String) {
        self.idle = false;
        self.tx.send(json).ok();
    }
}

/// What a client message means for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    ChangedMode {
        target: String,
        mode: CompilationMode,
    },
    Focused {
        target: String,
    },
    Idle,
    /// The session was put into `ClientError`.
    Errored,
}

/// Hot swap payload for one target, decided per session by [`SocketHub::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<'a> {
    pub timestamp: u64,
    pub mode: CompilationMode,
    /// Injected code, `None` when the build cannot be swapped in.
    pub code: Option<&'a str>,
    /// The target just recovered from an error; force a reload.
    pub recovered: bool,
}

pub struct SocketHub {
    /// Every target name and whether it is enabled
    targets: BTreeMap<String, bool>,
    sessions: BTreeMap<SessionId, Session>,
}

impl SocketHub {
    pub fn new<I: IntoIterator<Item = (String, bool)>>(targets: I) -> Self {
        Self {
            targets: targets.into_iter().collect(),
            sessions: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn has_sessions(&self, target: &str) -> bool {
        self.bound(target).next().is_some()
    }

    /// No bound session is waiting for its tab to settle.
    pub fn all_idle(&self) -> bool {
        self.sessions
            .values()
            .filter(|s| s.target().is_some())
            .all(|s| s.idle)
    }

    /// Validate a new connection's handshake and register the session.
    ///
    /// On failure the session is registered as `ClientError` and the
    /// diagnostic is sent right away.
    pub fn connect(
        &mut self,
        id: SessionId,
        request_target: &str,
        tx: SessionTx,
    ) -> Result<Handshake, HandshakeError> {
        match self.validate(request_target) {
            Ok(handshake) => {
                crate::debug!("ws"; "session {} bound to {}", id, handshake.target_name);
                self.sessions.insert(
                    id,
                    Session {
                        state: SessionState::Bound {
                            target: handshake.target_name.clone(),
                        },
                        compiled_timestamp: handshake.compiled_timestamp,
                        mode: None,
                        idle: false,
                        focused: false,
                        tx,
                    },
                );
                Ok(handshake)
            }
            Err(e) => {
                crate::log!("ws"; "rejected session {}: {}", id, e);
                tx.send(ServerMessage::client_error(e.to_string()).to_json())
                    .ok();
                self.sessions.insert(
                    id,
                    Session {
                        state: SessionState::ClientError {
                            message: e.to_string(),
                        },
                        compiled_timestamp: 0,
                        mode: None,
                        idle: true,
                        focused: false,
                        tx,
                    },
                );
                Err(e)
            }
        }
    }

    fn validate(&self, request_target: &str) -> Result<Handshake, HandshakeError> {
        let handshake = parse_handshake(request_target)?;
        if handshake.version != PROTOCOL_VERSION {
            return Err(HandshakeError::VersionMismatch {
                client: handshake.version,
                server: PROTOCOL_VERSION.to_string(),
            });
        }
        match self.targets.get(&handshake.target_name) {
            None => Err(HandshakeError::UnknownTarget {
                given: handshake.target_name,
                known: self.targets.keys().cloned().collect(),
            }),
            Some(false) => Err(HandshakeError::DisabledTarget(handshake.target_name)),
            Some(true) => Ok(handshake),
        }
    }

    /// Apply one text frame from a session.
    pub fn receive(&mut self, id: SessionId, text: &str) -> Option<SessionUpdate> {
        let target = self.sessions.get(&id)?.target()?.to_string();

        let message = match decode_client_message(text) {
            Ok(message) => message,
            Err(e) => {
                self.fail(id, e.to_string());
                return Some(SessionUpdate::Errored);
            }
        };

        match message {
            ClientMessage::ChangedCompilationMode { compilation_mode } => {
                Some(SessionUpdate::ChangedMode {
                    target,
                    mode: compilation_mode,
                })
            }
            ClientMessage::FocusedTab => {
                for (other, session) in &mut self.sessions {
                    session.focused = *other == id;
                }
                Some(SessionUpdate::Focused { target })
            }
            ClientMessage::ReachedIdleState { reason } => {
                crate::debug!("ws"; "session {} idle: {}", id, reason);
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.idle = true;
                }
                Some(SessionUpdate::Idle)
            }
        }
    }

    pub fn disconnect(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    /// Put a session into the terminal `ClientError` state.
    pub fn fail(&mut self, id: SessionId, message: String) {
        if let Some(session) = self.sessions.get_mut(&id) {
            crate::log!("ws"; "session {}: {}", id, message);
            session
                .tx
                .send(ServerMessage::client_error(message.clone()).to_json())
                .ok();
            session.state = SessionState::ClientError { message };
            session.idle = true;
        }
    }

    /// Send to one bound session.
    pub fn send_to(&mut self, id: SessionId, message: &ServerMessage) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if session.target().is_none() {
            return false;
        }
        session.send(message.to_json());
        true
    }

    /// Record the mode of the code a session is running.
    pub fn set_session_mode(&mut self, id: SessionId, mode: CompilationMode) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.mode = Some(mode);
        }
    }

    /// Send the same message to every session bound to `target`.
    pub fn publish(&mut self, target: &str, message: &ServerMessage) -> usize {
        let json = message.to_json();
        let mut sent = 0;
        for session in self.bound_mut(target) {
            session.send(json.clone());
            sent += 1;
        }
        sent
    }

    /// Hand a fresh build to every session bound to `target`.
    ///
    /// Tabs already running `timestamp` are told they are up to date; tabs
    /// that can swap get the code; everything else reloads.
    pub fn deliver(&mut self, target: &str, delivery: &Delivery<'_>) -> usize {
        let mut sent = 0;
        for session in self.bound_mut(target) {
            let message = if session.compiled_timestamp == delivery.timestamp {
                ServerMessage::status(WireStatus::AlreadyUpToDate {
                    compilation_mode: delivery.mode,
                })
            } else if delivery.recovered {
                ServerMessage::reload("the target recovered from an error")
            } else {
                match delivery.code {
                    Some(code) if session.mode == Some(delivery.mode) => {
                        session.compiled_timestamp = delivery.timestamp;
                        ServerMessage::SuccessfullyCompiled {
                            code: code.to_string(),
                            elm_compiled_timestamp: delivery.timestamp,
                            compilation_mode: delivery.mode,
                        }
                    }
                    Some(_) => ServerMessage::reload(format!(
                        "compilation mode changed to {}",
                        delivery.mode
                    )),
                    None => ServerMessage::reload("a new build is ready"),
                }
            };
            session.send(message.to_json());
            sent += 1;
        }
        sent
    }

    /// Drop every session (configuration reload, shutdown).
    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    fn bound<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a Session> + 'a {
        self.sessions
            .values()
            .filter(move |s| s.target() == Some(target))
    }

    fn bound_mut<'a>(&'a mut self, target: &'a str) -> impl Iterator<Item = &'a mut Session> + 'a {
        self.sessions
            .values_mut()
            .filter(move |s| s.target() == Some(target))
    }
}

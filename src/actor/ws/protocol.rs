//! Session wire protocol.
//!
//! The browser connects to `ws://host:port/elm-watch?<handshake>` and both
//! sides exchange `{"tag": ...}` JSON objects:
//!
//! ```text
//! client ──► server   ChangedCompilationMode | FocusedTab | ReachedIdleState
//! server ──► client   StatusChanged | SuccessfullyCompiled | ReloadPage
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::core::CompilationMode;

/// Version the client must announce in its handshake.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Handshake
// ============================================================================

const PARAM_VERSION: &str = "elmWatchVersion";
const PARAM_TARGET: &str = "targetName";
const PARAM_TIMESTAMP: &str = "elmCompiledTimestamp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: String,
    pub target_name: String,
    pub compiled_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("the WebSocket URL could not be parsed: {0}")]
    BadUrl(String),

    #[error("the WebSocket URL is missing the `{0}` parameter")]
    Missing(&'static str),

    #[error("the WebSocket URL has the `{0}` parameter more than once")]
    Duplicate(String),

    #[error("the WebSocket URL has an unknown parameter `{0}`")]
    Unknown(String),

    #[error("`elmCompiledTimestamp` must be an integer, got `{0}`")]
    BadTimestamp(String),

    #[error(
        "this page was compiled by elm-watch {client}, but the server runs {server}; reload the page or restart the server"
    )]
    VersionMismatch { client: String, server: String },

    #[error("unknown target `{given}`; known targets: {}", .known.join(", "))]
    UnknownTarget { given: String, known: Vec<String> },

    #[error("target `{0}` exists but is not enabled; restart with it selected to use it")]
    DisabledTarget(String),
}

/// Decode the handshake from a request target such as `/elm-watch?targetName=Main&...`.
///
/// Every parameter must be present exactly once and nothing else is allowed.
pub fn parse_handshake(request_target: &str) -> Result<Handshake, HandshakeError> {
    let url = Url::parse(&format!("ws://localhost{request_target}"))
        .map_err(|e| HandshakeError::BadUrl(e.to_string()))?;

    let mut version = None;
    let mut target_name = None;
    let mut timestamp = None;

    for (key, value) in url.query_pairs() {
        let slot = match key.as_ref() {
            PARAM_VERSION => &mut version,
            PARAM_TARGET => &mut target_name,
            PARAM_TIMESTAMP => &mut timestamp,
            other => return Err(HandshakeError::Unknown(other.to_string())),
        };
        if slot.replace(value.into_owned()).is_some() {
            return Err(HandshakeError::Duplicate(key.into_owned()));
        }
    }

    let version = version.ok_or(HandshakeError::Missing(PARAM_VERSION))?;
    let target_name = target_name.ok_or(HandshakeError::Missing(PARAM_TARGET))?;
    let raw_timestamp = timestamp.ok_or(HandshakeError::Missing(PARAM_TIMESTAMP))?;
    let compiled_timestamp = raw_timestamp
        .parse()
        .map_err(|_| HandshakeError::BadTimestamp(raw_timestamp.clone()))?;

    Ok(Handshake {
        version,
        target_name,
        compiled_timestamp,
    })
}

// ============================================================================
// Messages
// ============================================================================

/// Build status as seen by a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tag")]
pub enum WireStatus {
    #[serde(rename_all = "camelCase")]
    Busy { compilation_mode: CompilationMode },
    #[serde(rename_all = "camelCase")]
    AlreadyUpToDate { compilation_mode: CompilationMode },
    #[serde(rename_all = "camelCase")]
    CompileError {
        compilation_mode: CompilationMode,
        details: String,
    },
    PostprocessError { details: String },
    ElmWatchError { details: String },
    ClientError { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tag")]
pub enum ServerMessage {
    StatusChanged { status: WireStatus },
    #[serde(rename_all = "camelCase")]
    SuccessfullyCompiled {
        code: String,
        elm_compiled_timestamp: u64,
        compilation_mode: CompilationMode,
    },
    ReloadPage { reason: String },
}

impl ServerMessage {
    pub fn status(status: WireStatus) -> Self {
        Self::StatusChanged { status }
    }

    pub fn client_error(message: impl Into<String>) -> Self {
        Self::status(WireStatus::ClientError {
            message: message.into(),
        })
    }

    pub fn reload(reason: impl Into<String>) -> Self {
        Self::ReloadPage {
            reason: reason.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "tag")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    ChangedCompilationMode { compilation_mode: CompilationMode },
    FocusedTab,
    ReachedIdleState { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("the browser sent an unexpected message: {error}\n\n{text}")]
    Decode { error: String, text: String },
}

pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Decode {
        error: e.to_string(),
        text: text.to_string(),
    })
}

// ============================================================================
// Reconnect backoff
// ============================================================================

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Delay before reconnect attempt `attempt` (0-based): 1s, 2s, 4s, ... capped at 30s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    RECONNECT_BASE
        .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .map_or(RECONNECT_CAP, |delay| delay.min(RECONNECT_CAP))
}

/// Every distinct delay up to and including the cap, shipped to the client.
pub fn reconnect_schedule() -> Vec<Duration> {
    let mut schedule = Vec::new();
    for attempt in 0.. {
        let delay = reconnect_delay(attempt);
        schedule.push(delay);
        if delay == RECONNECT_CAP {
            break;
        }
    }
    schedule
}

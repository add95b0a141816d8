//! Event sources and the coordinator that owns all build state.
//!
//! ```text
//! FsWatcher ──► Orchestrator ◄── WsServer
//!                    │
//!                    ▼
//!               ProcessPool
//! ```
//!
//! # Module Structure
//!
//! - `fs` - File system watcher with debouncing
//! - `ws` - WebSocket server and browser sessions
//! - `coordinator` - The event loop tying everything together

pub mod coordinator;
pub mod fs;
pub mod ws;

//! # maestro-core
//!
//! Core session logic for the Maestro editor-integration server.
//!
//! This crate provides:
//! - The deterministic orchestrator state machine for one session
//! - The protocol server that binds sessions and routes messages
//! - The append-only, secret-redacted session store
//! - Offline replay of recorded sessions
//! - Workspace path-safety checks shared by every file-touching component

mod config;
mod orchestrator;
mod replay;
mod server;
mod session_store;
pub mod paths;
pub mod testing;

pub use config::MaestroConfig;
pub use orchestrator::{AgentText, Orchestrator, OutputRecord, RunRequest, State, VERIFY_COMMAND};
pub use replay::{read_events, replay_session, ReplaySummary};
pub use server::{RunnerFactory, Server};
pub use session_store::{content_hash, session_dir, SessionStore, SESSION_DIR};

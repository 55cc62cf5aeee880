#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! deskbridge: the connection bridge of a desktop client.
//!
//! The desktop UI talks to backends that are either a locally spawned server
//! or remote servers reached through SSH tunnels opened by a sidecar process.
//! This crate sits between the two:
//!
//! - `storage`: debounced, single-flight persistence of small UI state
//! - `tunnel`: opens and closes tunnels, owns the connection directory
//! - `directory`: origin → tunnel key and credential table
//! - `prompt`: relays authentication prompts from the sidecar to the user
//! - `fetch`: attaches the right credential to every outbound request
//! - `host`: the JSON-lines protocol spoken with the sidecar
//! - `sidecar`: building and spawning the sidecar command
//! - `terminal`: CLI rendering of prompts
//! - `config`: configuration loading
//!
//! ## Control flow
//!
//! ```text
//! connect(cmd) ─▶ TunnelManager ─▶ Host ──prompt events──▶ prompt relay ──▶ view
//!                      ▲             │                         │
//!                      │             ◀────────prompt_reply─────┘
//!                      └─ ConnectReply ─▶ ConnectionDirectory ─▶ FetchRouter
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod fetch;
pub mod host;
pub mod origin;
pub mod prompt;
pub mod sidecar;
pub mod storage;
pub mod terminal;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use directory::{ConnectionDirectory, DirectoryReader, TunnelEntry};
pub use error::{BridgeError, FetchError, StoreError};
pub use fetch::{FetchRouter, RoutedResponse};
pub use host::{ConnectReply, Host, ProcessHost, PromptEvent};
pub use origin::Origin;
pub use prompt::{spawn_relay, ActivePrompt, PromptKind, PromptView, RelayHandle};
pub use storage::{FlushReport, LifecycleEvent, Namespace, Storage};
pub use tunnel::{ConnectAttempts, Teardown, TunnelConnection, TunnelManager};

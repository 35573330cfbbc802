//! Real-time transport for the fleet client.
//!
//! - [`mux::Multiplexer`] shares one socket between many event subscriptions
//!   and replays them after a reconnect.
//! - [`logs::LogConsumer`] turns a streamed log body into a bounded tail of
//!   lines plus a complete history for export.
//! - [`exec::ExecSession`] drives an interactive remote process.
//!
//! Each component runs as its own task and is controlled through a handle;
//! dropping the handle shuts the component down.

pub mod backoff;
pub mod config;
pub mod error;
pub mod exec;
pub mod logs;
pub mod mux;
pub mod socket;

pub use backoff::Backoff;
pub use config::{ExecConfig, LogConfig, MuxConfig};
pub use error::{ApplicationError, LinkError, ProtocolError, Result, TransportError};
pub use socket::{ConnectionState, Connector, WsConnector, ws_base_url};

#![warn(missing_docs)]

//! levelcache transport subsystem: reconnecting TCP connector, RPC session multiplexer,
//! and the connection manager that owns one connector/session pair per client.

pub mod connector;
pub mod error;
pub mod frame;
pub mod manager;
pub mod server;
pub mod session;

pub use connector::{Connection, Connector, ConnectorConfig, ConnectorEvent};
pub use error::{Result, TransportError};
pub use manager::{ClientEvent, ConnectionManager, ManagerConfig};
pub use session::{Credentials, Manifest, RpcSession, SessionConfig, SessionHandle};

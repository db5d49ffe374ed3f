/// Socket.IO server core
///
/// Architecture:
/// - Protocol: Engine.IO v4 / Socket.IO v5 packet encoding and decoding
/// - Transport: WebSocket adapter feeding the dispatcher
/// - Registry and Rooms: who is connected where, and who is in which room
/// - Dispatcher: one ordered worker per connection invoking namespace handlers
/// - Fan-out: delivery to a session, a room, a namespace or everyone
/// - Server: namespace table and lifecycle wiring

pub mod ack;
pub mod connection;
pub mod dispatcher;
pub mod fanout;
pub mod metrics;
pub mod namespace;
pub mod payload;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod socket;
pub mod transport;

pub use connection::{Connection, Outbound, Sid};
pub use dispatcher::{DispatchHandle, Dispatcher, Inbound};
pub use fanout::{Emission, Target};
pub use metrics::SocketMetrics;
pub use namespace::{ConnectionRefused, DisconnectReason, EventKind, HandlerFailure, Namespace};
pub use payload::Payload;
pub use server::{Server, ServerBuilder, ServerStats};
pub use socket::{Operator, Socket};

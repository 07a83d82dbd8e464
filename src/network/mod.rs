//! Network transports for the PCM stream

pub mod forwarder;
pub mod protocol;
pub mod session;
pub mod sink;

pub use forwarder::{Connector, Forwarder, ForwarderState, ForwarderStats, RetryPolicy, TcpConnector};
pub use protocol::StreamHeader;
pub use session::{AudioSession, SessionEnd, SessionState, SessionStats};
pub use sink::{ChannelSink, ChunkSink, WriterSink};

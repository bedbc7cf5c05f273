//! Session Management Module
//!
//! Everything that lives on top of an authenticated transport:
//! - Terminal and command channels driven once per tick (`multiplexer`)
//! - The stdin/stdout/stderr contract and its queue adapters (`stream`)
//! - The registry of live sessions and their ordered teardown (`registry`)
//! - Port discovery on command output (`port_watch`)

pub mod multiplexer;
pub mod port_watch;
mod registry;
pub mod stream;
pub mod types;

pub use multiplexer::{ChannelMultiplexer, MuxChannel};
pub use port_watch::{DiscoveredPort, PortWatcher};
pub use registry::{ConnectionRegistry, SessionRecord, SessionSummary, SessionTable};
pub use stream::{
    ChannelStreams, Input, InputSource, InputWriter, OutputReader, OutputSink, StreamHandles, ETX,
};
pub use types::{ChannelId, ChannelKind, ChannelState, ForwardInfo, OpenStep, SessionId, SessionInfo};

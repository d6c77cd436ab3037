pub mod duplex;
pub mod multiplexer;
pub mod virtual_stream;

pub use duplex::{relay_duplex, RelayStats};
pub use multiplexer::{ExchangeStreams, IncomingRequest, Multiplexer, StreamKey};
pub use virtual_stream::{InboundEvent, InboundStream, StreamState, StreamWriter};

pub mod auth;
pub mod reconnect;
pub mod registry;
pub mod stream;
pub mod transport;
pub mod tunnel;

pub use auth::{issue_token, JwtVerifier, StaticTokenVerifier, TokenVerifier};
pub use registry::{RouteInfo, TunnelRegistry};
pub use stream::{relay_duplex, InboundEvent, InboundStream, Multiplexer, StreamWriter};
pub use tunnel::{IncomingExchange, Responder, TunnelClient, TunnelConnection, TunnelServer};

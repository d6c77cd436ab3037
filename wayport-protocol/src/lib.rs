//! `Wayport` wire protocol
//!
//! This crate defines the event vocabulary exchanged between the gateway and
//! tunnel clients over one control connection, and the binary codec that
//! frames those events.

pub mod codec;
pub mod constants;
pub mod frame;
pub mod validation;

pub use codec::TunnelCodec;
pub use frame::{
    Direction, Frame, HandshakeFrame, HandshakeStatus, HeaderList, RequestHead, RequestId,
    ResponseHead,
};

//! Protocol frame definitions
//!
//! One control connection carries many exchanges. Every stream event names the
//! request id it belongs to so the receiving side can demultiplex without
//! relying on arrival order across exchanges.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Process-unique identifier of one exchange (random 128-bit value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random request id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ordered header entries; a repeated name appears once per value.
pub type HeaderList = Vec<(String, Bytes)>;

/// Initial handshake sent by the tunnel client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeFrame {
    pub version: u8,
    pub token: String,
    /// Public host this client serves
    pub host: String,
    /// Optional path prefix; `None` registers a catch-all for the host
    pub path_prefix: Option<String>,
}

/// Request line and headers of a tunneled request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestHead {
    pub method: String,
    /// Origin-form target including the query string
    pub path: String,
    pub headers: HeaderList,
}

/// Status line and headers of a tunneled response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseHead {
    /// `None` signals a protocol upgrade: no status line, switch to duplex relay
    pub status_code: Option<u16>,
    pub status_message: Option<String>,
    pub headers: HeaderList,
    pub http_version: String,
}

impl ResponseHead {
    pub fn is_upgrade(&self) -> bool {
        self.status_code.is_none()
    }
}

/// Wire protocol frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    // Control frames
    /// Initial handshake from client to gateway
    Handshake(Box<HandshakeFrame>),

    /// Handshake acknowledgment from gateway
    HandshakeAck {
        session_id: Uuid,
        status: HandshakeStatus,
    },

    // Request direction (gateway -> client)
    /// Opens the request stream; carries request line and headers only
    Request {
        request_id: RequestId,
        head: Box<RequestHead>,
    },

    RequestPipe {
        request_id: RequestId,
        chunk: Bytes,
    },

    /// Several body chunks appended in one event
    RequestPipes {
        request_id: RequestId,
        chunks: Vec<Bytes>,
    },

    RequestPipeEnd {
        request_id: RequestId,
    },

    RequestPipeError {
        request_id: RequestId,
        message: String,
    },

    // Response direction (client -> gateway, both ways once upgraded)
    /// The client could not complete the request against its local service
    RequestError {
        request_id: RequestId,
        message: String,
    },

    Response {
        request_id: RequestId,
        head: Box<ResponseHead>,
    },

    ResponsePipe {
        request_id: RequestId,
        chunk: Bytes,
    },

    ResponsePipes {
        request_id: RequestId,
        chunks: Vec<Bytes>,
    },

    ResponsePipeEnd {
        request_id: RequestId,
        chunk: Option<Bytes>,
    },

    ResponsePipeError {
        request_id: RequestId,
        message: String,
    },

    // Keepalive
    Ping {
        timestamp: u64,
    },

    Pong {
        timestamp: u64,
    },
}

/// Which virtual stream of an exchange a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Request body, always gateway -> client
    Request,
    /// Response body; carries bytes both ways after an upgrade
    Response,
}

impl Direction {
    pub fn pipe(self, request_id: RequestId, chunk: Bytes) -> Frame {
        match self {
            Direction::Request => Frame::RequestPipe { request_id, chunk },
            Direction::Response => Frame::ResponsePipe { request_id, chunk },
        }
    }

    pub fn pipes(self, request_id: RequestId, chunks: Vec<Bytes>) -> Frame {
        match self {
            Direction::Request => Frame::RequestPipes { request_id, chunks },
            Direction::Response => Frame::ResponsePipes { request_id, chunks },
        }
    }

    pub fn end(self, request_id: RequestId) -> Frame {
        match self {
            Direction::Request => Frame::RequestPipeEnd { request_id },
            Direction::Response => Frame::ResponsePipeEnd {
                request_id,
                chunk: None,
            },
        }
    }

    pub fn error(self, request_id: RequestId, message: String) -> Frame {
        match self {
            Direction::Request => Frame::RequestPipeError {
                request_id,
                message,
            },
            Direction::Response => Frame::ResponsePipeError {
                request_id,
                message,
            },
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => f.write_str("request"),
            Direction::Response => f.write_str("response"),
        }
    }
}

impl Frame {
    /// Event name as used in logs
    pub fn event_name(&self) -> &'static str {
        match self {
            Frame::Handshake(_) => "handshake",
            Frame::HandshakeAck { .. } => "handshake-ack",
            Frame::Request { .. } => "request",
            Frame::RequestPipe { .. } => "request-pipe",
            Frame::RequestPipes { .. } => "request-pipes",
            Frame::RequestPipeEnd { .. } => "request-pipe-end",
            Frame::RequestPipeError { .. } => "request-pipe-error",
            Frame::RequestError { .. } => "request-error",
            Frame::Response { .. } => "response",
            Frame::ResponsePipe { .. } => "response-pipe",
            Frame::ResponsePipes { .. } => "response-pipes",
            Frame::ResponsePipeEnd { .. } => "response-pipe-end",
            Frame::ResponsePipeError { .. } => "response-pipe-error",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
        }
    }

    /// Request id of a stream event, `None` for control frames
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Frame::Request { request_id, .. }
            | Frame::RequestPipe { request_id, .. }
            | Frame::RequestPipes { request_id, .. }
            | Frame::RequestPipeEnd { request_id }
            | Frame::RequestPipeError { request_id, .. }
            | Frame::RequestError { request_id, .. }
            | Frame::Response { request_id, .. }
            | Frame::ResponsePipe { request_id, .. }
            | Frame::ResponsePipes { request_id, .. }
            | Frame::ResponsePipeEnd { request_id, .. }
            | Frame::ResponsePipeError { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// The virtual stream a stream event is addressed to.
    ///
    /// `request-error` correlates with the response stream: it is the
    /// client's answer when no response head can be produced.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Frame::Request { .. }
            | Frame::RequestPipe { .. }
            | Frame::RequestPipes { .. }
            | Frame::RequestPipeEnd { .. }
            | Frame::RequestPipeError { .. } => Some(Direction::Request),
            Frame::RequestError { .. }
            | Frame::Response { .. }
            | Frame::ResponsePipe { .. }
            | Frame::ResponsePipes { .. }
            | Frame::ResponsePipeEnd { .. }
            | Frame::ResponsePipeError { .. } => Some(Direction::Response),
            _ => None,
        }
    }

    /// Whether this event ends its stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Frame::RequestPipeEnd { .. }
                | Frame::RequestPipeError { .. }
                | Frame::RequestError { .. }
                | Frame::ResponsePipeEnd { .. }
                | Frame::ResponsePipeError { .. }
        )
    }
}

/// Handshake status codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HandshakeStatus {
    Success,
    InvalidToken,
    UnsupportedVersion,
    /// Another live connection already owns the (host, path-prefix) route
    RouteTaken,
    /// Host or path prefix is malformed
    InvalidRoute,
}

//! Frame validation for security hardening

use crate::frame::{Frame, HeaderList};

/// Validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Token too long: {len} bytes exceeds limit of {limit} bytes")]
    TokenTooLong { len: usize, limit: usize },

    #[error("Host too long: {len} bytes exceeds limit of {limit} bytes")]
    HostTooLong { len: usize, limit: usize },

    #[error("Path prefix too long: {len} bytes exceeds limit of {limit} bytes")]
    PathPrefixTooLong { len: usize, limit: usize },

    #[error("Too many headers: {count} exceeds limit of {limit}")]
    TooManyHeaders { count: usize, limit: usize },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Validation limits
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    pub max_token_len: usize,
    pub max_host_len: usize,
    pub max_path_prefix_len: usize,
    pub max_headers: usize,
    pub max_payload_bytes: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_token_len: 4096,
            max_host_len: 253,
            max_path_prefix_len: 2048,
            max_headers: 256,
            max_payload_bytes: 16 * 1024 * 1024,
        }
    }
}

fn check_headers(headers: &HeaderList, limits: &ValidationLimits) -> Result<(), ValidationError> {
    if headers.len() > limits.max_headers {
        return Err(ValidationError::TooManyHeaders {
            count: headers.len(),
            limit: limits.max_headers,
        });
    }
    Ok(())
}

fn check_payload(size: usize, limits: &ValidationLimits) -> Result<(), ValidationError> {
    if size > limits.max_payload_bytes {
        return Err(ValidationError::PayloadTooLarge {
            size,
            limit: limits.max_payload_bytes,
        });
    }
    Ok(())
}

/// Validate a decoded frame against limits
pub fn validate_frame(frame: &Frame, limits: &ValidationLimits) -> Result<(), ValidationError> {
    match frame {
        Frame::Handshake(handshake) => {
            if handshake.token.len() > limits.max_token_len {
                return Err(ValidationError::TokenTooLong {
                    len: handshake.token.len(),
                    limit: limits.max_token_len,
                });
            }
            if handshake.host.len() > limits.max_host_len {
                return Err(ValidationError::HostTooLong {
                    len: handshake.host.len(),
                    limit: limits.max_host_len,
                });
            }
            if let Some(prefix) = &handshake.path_prefix {
                if prefix.len() > limits.max_path_prefix_len {
                    return Err(ValidationError::PathPrefixTooLong {
                        len: prefix.len(),
                        limit: limits.max_path_prefix_len,
                    });
                }
            }
        }
        Frame::Request { head, .. } => check_headers(&head.headers, limits)?,
        Frame::Response { head, .. } => check_headers(&head.headers, limits)?,
        Frame::RequestPipe { chunk, .. } | Frame::ResponsePipe { chunk, .. } => {
            check_payload(chunk.len(), limits)?;
        }
        Frame::RequestPipes { chunks, .. } | Frame::ResponsePipes { chunks, .. } => {
            check_payload(chunks.iter().map(bytes::Bytes::len).sum(), limits)?;
        }
        Frame::ResponsePipeEnd {
            chunk: Some(chunk), ..
        } => check_payload(chunk.len(), limits)?,
        _ => {}
    }
    Ok(())
}

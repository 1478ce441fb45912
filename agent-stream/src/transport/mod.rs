//! Network seams: the streaming connection and the query side-channel.
//!
//! Both are traits so the connection actor and dispatcher can be driven by
//! in-memory fakes in tests.

pub mod query;
pub mod sse;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub use query::{HttpQueryClient, QueryClient, QueryError};
pub use sse::{SseConnector, SseDecoder, SseEvent, DEFAULT_MAX_FRAME_BYTES};

/// Stream of raw frame payloads (the SSE `data` field of each event).
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Stream endpoint returned HTTP {0}")]
    Status(u16),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),
}

/// Opens one brand-new streaming transport per call.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<FrameStream, TransportError>;
}

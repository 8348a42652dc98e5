//! Inbound request handle
//!
//! Handlers receive an [`InboundRequest`] and reply through it. The handle
//! enforces the response contract: at most one terminal frame (`simple`,
//! `end`, `reject` or `error`) ever leaves a request, no matter how the
//! handler and the dispatch loop race. Streamed `content` frames may only
//! flow between `open_stream` and the terminal frame.

use crate::error::RpcResult;
use async_trait::async_trait;
use nixie_core::envelope::{Fields, RequestId, Response};
use nixie_core::identity::ServiceIdentity;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Sink for response frames, keyed by the caller's identity
///
/// Implemented by the service; split out as a trait so the handle can be
/// unit tested against a recording stub.
#[async_trait]
pub trait ResponsePublisher: Send + Sync {
    /// Publish one response frame to the caller's channel
    async fn publish_response(
        &self,
        target: &ServiceIdentity,
        request_id: &RequestId,
        response: Response,
    ) -> RpcResult<()>;
}

#[derive(Debug)]
struct InboundShared {
    source: ServiceIdentity,
    request_id: RequestId,
    request_type: String,
    fields: Fields,
    /// Cleared exactly once, by whichever terminal frame wins.
    alive: AtomicBool,
    streaming: AtomicBool,
}

/// Handle to one received request
///
/// Cheap to clone; clones share the terminal-frame latch.
#[derive(Clone)]
pub struct InboundRequest {
    publisher: Arc<dyn ResponsePublisher>,
    shared: Arc<InboundShared>,
}

impl std::fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("source", &self.shared.source)
            .field("request_id", &self.shared.request_id)
            .field("request_type", &self.shared.request_type)
            .finish()
    }
}

impl InboundRequest {
    /// Create a handle for a decoded request
    pub fn new(
        publisher: Arc<dyn ResponsePublisher>,
        source: ServiceIdentity,
        request_id: RequestId,
        request_type: String,
        fields: Fields,
    ) -> Self {
        Self {
            publisher,
            shared: Arc::new(InboundShared {
                source,
                request_id,
                request_type,
                fields,
                alive: AtomicBool::new(true),
                streaming: AtomicBool::new(false),
            }),
        }
    }

    /// The caller's identity
    pub fn source(&self) -> &ServiceIdentity {
        &self.shared.source
    }

    /// The operation name carried by the request
    pub fn request_type(&self) -> &str {
        &self.shared.request_type
    }

    /// The correlation token
    pub fn request_id(&self) -> &RequestId {
        &self.shared.request_id
    }

    /// Operation-specific fields of the request
    pub fn fields(&self) -> &Fields {
        &self.shared.fields
    }

    /// Whether a terminal frame has already been sent
    pub fn is_finalized(&self) -> bool {
        !self.shared.alive.load(Ordering::SeqCst)
    }

    /// Whether the reply was opened as a stream
    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::SeqCst)
    }

    /// Claim the right to send the terminal frame
    ///
    /// Returns true for exactly one caller. The latch flips before the frame
    /// is published, so a racing second terminal sees it closed even while
    /// the first publish is still in flight.
    fn finalize(&self) -> bool {
        self.shared.alive.swap(false, Ordering::SeqCst)
    }

    async fn publish(&self, response: Response) -> RpcResult<()> {
        self.publisher
            .publish_response(&self.shared.source, &self.shared.request_id, response)
            .await
    }

    /// Switch the reply to streaming mode
    ///
    /// Sends the `stream` acknowledgement frame. No-op if the request is
    /// already finalized or already streaming.
    pub async fn open_stream(&self) -> RpcResult<()> {
        if self.is_finalized() {
            return Ok(());
        }
        if self.shared.streaming.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.publish(Response::Stream).await
    }

    /// Send a payload
    ///
    /// In streaming mode this is one `content` frame and the request stays
    /// open; otherwise it is the single `simple` reply and finalizes the
    /// request. Silently dropped after the terminal frame.
    pub async fn send(&self, content: Value) -> RpcResult<()> {
        if self.is_streaming() {
            if self.is_finalized() {
                tracing::debug!(request_id = %self.shared.request_id, "content frame after terminal, dropped");
                return Ok(());
            }
            return self.publish(Response::Content { content }).await;
        }

        if !self.finalize() {
            tracing::debug!(request_id = %self.shared.request_id, "simple reply after terminal, dropped");
            return Ok(());
        }
        self.publish(Response::Simple { content }).await
    }

    /// Send the `end` terminal frame (empty reply or stream close)
    pub async fn end(&self) -> RpcResult<()> {
        if !self.finalize() {
            return Ok(());
        }
        self.publish(Response::End).await
    }

    /// Send a typed application rejection; terminal
    pub async fn reject(
        &self,
        rejection_type: impl Into<String>,
        args: Vec<Value>,
        kwargs: Fields,
    ) -> RpcResult<()> {
        if !self.finalize() {
            return Ok(());
        }
        self.publish(Response::Reject {
            rejection_type: rejection_type.into(),
            args,
            kwargs,
        })
        .await
    }

    /// Send the opaque `error` terminal frame
    pub async fn error(&self) -> RpcResult<()> {
        if !self.finalize() {
            return Ok(());
        }
        self.publish(Response::Error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nixie_core::identity::ServiceName;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct RecordingPublisher {
        frames: Mutex<Vec<Response>>,
    }

    #[async_trait]
    impl ResponsePublisher for RecordingPublisher {
        async fn publish_response(
            &self,
            _target: &ServiceIdentity,
            _request_id: &RequestId,
            response: Response,
        ) -> RpcResult<()> {
            self.frames.lock().push(response);
            Ok(())
        }
    }

    fn request(publisher: Arc<RecordingPublisher>) -> InboundRequest {
        InboundRequest::new(
            publisher,
            ServiceIdentity::new(ServiceName::new("caller").unwrap(), 0),
            RequestId::new("r1"),
            "lookup".into(),
            Fields::new(),
        )
    }

    #[tokio::test]
    async fn test_simple_reply_finalizes() {
        let publisher = Arc::new(RecordingPublisher::default());
        let req = request(publisher.clone());

        req.send(json!(42)).await.unwrap();
        assert!(req.is_finalized());

        // Anything after the terminal frame is dropped.
        req.send(json!(43)).await.unwrap();
        req.end().await.unwrap();
        req.error().await.unwrap();

        let frames = publisher.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], Response::Simple { content: json!(42) });
    }

    #[tokio::test]
    async fn test_stream_then_contents_then_end() {
        let publisher = Arc::new(RecordingPublisher::default());
        let req = request(publisher.clone());

        req.open_stream().await.unwrap();
        req.send(json!("a")).await.unwrap();
        req.send(json!("b")).await.unwrap();
        req.end().await.unwrap();

        let frames = publisher.frames.lock();
        assert_eq!(
            *frames,
            vec![
                Response::Stream,
                Response::Content { content: json!("a") },
                Response::Content { content: json!("b") },
                Response::End,
            ]
        );
    }

    #[tokio::test]
    async fn test_open_stream_is_idempotent() {
        let publisher = Arc::new(RecordingPublisher::default());
        let req = request(publisher.clone());

        req.open_stream().await.unwrap();
        req.open_stream().await.unwrap();
        assert_eq!(publisher.frames.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_is_terminal() {
        let publisher = Arc::new(RecordingPublisher::default());
        let req = request(publisher.clone());

        req.reject("invalid-name", vec![json!("x")], Fields::new())
            .await
            .unwrap();
        req.end().await.unwrap();

        let frames = publisher.frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Response::Reject { .. }));
    }

    #[tokio::test]
    async fn test_clones_share_the_latch() {
        let publisher = Arc::new(RecordingPublisher::default());
        let req = request(publisher.clone());
        let other = req.clone();

        req.end().await.unwrap();
        other.error().await.unwrap();

        assert_eq!(publisher.frames.lock().len(), 1);
        assert!(other.is_finalized());
    }
}

//! Request/response adapter.
//!
//! Sits between the resolved handler and the per-request channel pair:
//!
//! - **build**: construct the guest-visible request from the host's
//!   metadata snapshot, attaching a lazy body stream only for bodied
//!   methods;
//! - **invoke**: call the handler under a wall-clock timeout, passing the
//!   request and an [`Invocation`] handle (request id, set-response
//!   capability, abort signal, opaque upgrade passthrough);
//! - **finalize**: normalize whatever came back into one response — head
//!   announced exactly once, body drained chunk-by-chunk with
//!   backpressure, stream closed exactly once on every exit path.
//!
//! Everything the handler can do wrong (throw, return a non-object, time
//! out, omit fields) is contained here and becomes a 500 for this request
//! only. Failures of the bridge itself (double finalize, write after
//! close) propagate as protocol errors and are fatal to the worker.

use std::any::Any;
use std::time::Duration;

use bytes::Bytes;

use funcbridge_proto::{HeaderMap, RequestId, RequestMetadata, ResponseHead};
use funcbridge_stream::{
    AbortSignal, BodyStream, RequestChannel, ResponseOutlet, StreamError,
};

use crate::error::BridgeError;
use crate::module::{Body, BodyChunkStream, HandlerFault, ResponseValue, ReturnValue};
use crate::resolver::ResolvedHandler;

/// The request value handed to the handler.
///
/// Explicit parameters, no ambient globals: the request id is a field
/// here, not a process-wide getter.
#[derive(Debug)]
pub struct GuestRequest {
    id: RequestId,
    method: String,
    uri: String,
    headers: HeaderMap,
    body: Option<BodyStream>,
}

impl GuestRequest {
    fn new(id: RequestId, metadata: &RequestMetadata, body: Option<BodyStream>) -> Self {
        Self {
            id,
            method: metadata.method().to_string(),
            uri: metadata.uri().to_string(),
            headers: metadata.headers().clone(),
            body,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Whether a body stream is attached. Bodyless methods never have one.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Pull the next request-body chunk; `Ok(None)` is end of body.
    /// Bodyless requests are permanently at end of body.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        match &mut self.body {
            Some(body) => body.pull().await,
            None => Ok(None),
        }
    }

    /// Take ownership of the body stream, if any. Single traversal only —
    /// the stream is not restartable.
    pub fn take_body(&mut self) -> Option<BodyStream> {
        self.body.take()
    }
}

/// Opaque handle enabling protocol upgrades (bidirectional sockets) in
/// server modes. The adapter passes it through untouched; its meaning is
/// whatever the deployment's transport layer assigns it.
pub struct UpgradeHandle(Box<dyn Any + Send + Sync>);

impl UpgradeHandle {
    pub fn new(inner: Box<dyn Any + Send + Sync>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Box<dyn Any + Send + Sync> {
        self.0
    }
}

/// Per-invocation handle given to the handler alongside the request.
///
/// Carries the set-response calling convention: a handler may announce its
/// response head and stream body chunks through here instead of returning
/// a [`ResponseValue`], finishing with [`ReturnValue::Announced`].
pub struct Invocation {
    id: RequestId,
    outlet: ResponseOutlet,
    abort: AbortSignal,
    upgrade: Option<UpgradeHandle>,
}

impl Invocation {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Announce the response head. Announcing twice for the same request
    /// is a protocol error.
    pub fn set_response(&self, mut head: ResponseHead) -> Result<(), StreamError> {
        head.apply_runtime_headers(self.id);
        self.outlet.announce(head)
    }

    /// Stream one response-body chunk; suspends until the host accepts it.
    pub async fn write_chunk(&self, chunk: Bytes) -> Result<(), StreamError> {
        self.outlet.write_chunk(chunk).await
    }

    /// Take the opaque upgrade handle, when the deployment mode provides
    /// one.
    pub fn take_upgrade(&mut self) -> Option<UpgradeHandle> {
        self.upgrade.take()
    }
}

/// Serve one request end to end through `channel`.
///
/// Returns `Ok(())` for everything that was contained at the request
/// boundary (including handler failures that became 500s). An `Err` means
/// the failure belongs to a wider scope: protocol violations are fatal to
/// the worker, cancellations and transport failures end this request
/// without a response.
pub async fn serve_request(
    resolved: &ResolvedHandler,
    channel: RequestChannel,
    handler_timeout: Duration,
    upgrade: Option<UpgradeHandle>,
) -> Result<(), BridgeError> {
    let (id, metadata, body, outlet, abort) = channel.into_parts();
    tracing::debug!(request_id = %id, method = metadata.method(), uri = metadata.uri(), "request accepted");

    let result = drive(resolved, id, &metadata, body, &outlet, abort, handler_timeout, upgrade).await;

    // The response stream is a scoped resource: released on every exit
    // path, including cancellation and thrown errors. Close is idempotent.
    if let Err(close_err) = outlet.close().await {
        if close_err != StreamError::Disconnected {
            tracing::warn!(request_id = %id, error = %close_err, "response close failed");
        }
    }

    match &result {
        Ok(()) => tracing::debug!(request_id = %id, "request completed"),
        Err(BridgeError::Cancelled) => {
            tracing::debug!(request_id = %id, "request cancelled");
        }
        Err(err) => tracing::warn!(request_id = %id, error = %err, "request failed"),
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    resolved: &ResolvedHandler,
    id: RequestId,
    metadata: &RequestMetadata,
    body: Option<BodyStream>,
    outlet: &ResponseOutlet,
    abort: AbortSignal,
    handler_timeout: Duration,
    upgrade: Option<UpgradeHandle>,
) -> Result<(), BridgeError> {
    let request = GuestRequest::new(id, metadata, body);
    let invocation = Invocation {
        id,
        outlet: outlet.clone(),
        abort,
        upgrade,
    };

    let outcome =
        match tokio::time::timeout(handler_timeout, resolved.handler().call(request, invocation))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(request_id = %id, timeout = ?handler_timeout, "handler timed out");
                return respond_failure(outlet, id, "handler execution timed out", None).await;
            }
        };

    match outcome {
        Ok(ReturnValue::Response(value)) => finalize_value(outlet, id, value).await,
        Ok(ReturnValue::Announced) => {
            if outlet.is_announced() {
                Ok(())
            } else {
                // The handler claimed the set-response convention but
                // never announced anything.
                respond_failure(outlet, id, "handler completed without a response", None).await
            }
        }
        Ok(ReturnValue::Malformed(type_name)) => {
            let message = format!("handler returned a non-object value: {type_name}");
            respond_failure(outlet, id, &message, None).await
        }
        Err(fault) => respond_failure(outlet, id, &fault.message, fault.stack.as_deref()).await,
    }
}

/// Finalize the return-value calling convention: apply defaults, announce
/// the head, drain the body.
async fn finalize_value(
    outlet: &ResponseOutlet,
    id: RequestId,
    value: ResponseValue,
) -> Result<(), BridgeError> {
    let mut head = ResponseHead::new(value.status.unwrap_or(0));
    for (name, header_value) in value.headers {
        head.set_header(name, header_value);
    }
    head.apply_runtime_headers(id);
    if let Err(invalid) = head.normalize() {
        return respond_failure(outlet, id, &invalid.to_string(), None).await;
    }

    // A second finalize for the same request surfaces here as
    // HeadAlreadySent and escalates as a protocol error.
    outlet.announce(head).map_err(BridgeError::from)?;

    match value.body {
        Body::Empty => Ok(()),
        Body::Bytes(bytes) => {
            if bytes.is_empty() {
                return Ok(());
            }
            outlet.write_chunk(bytes).await.map_err(BridgeError::from)
        }
        Body::Stream(stream) => drain_stream(outlet, id, stream).await,
    }
}

/// Push every chunk of a handler-produced stream to the host in order.
///
/// Zero-length chunks are skipped — the end marker is emitted exactly once
/// by the caller's close, no matter how many empties the handler yields.
async fn drain_stream(
    outlet: &ResponseOutlet,
    id: RequestId,
    mut stream: BodyChunkStream,
) -> Result<(), BridgeError> {
    while let Some(item) = next_item(&mut stream).await {
        match item {
            Ok(chunk) if chunk.is_empty() => continue,
            Ok(chunk) => outlet.write_chunk(chunk).await.map_err(BridgeError::from)?,
            Err(fault) => {
                // The head is already on the wire; the body is truncated
                // by the close that follows. Request-scoped, not fatal.
                tracing::warn!(request_id = %id, error = %fault, "handler body stream failed mid-drain");
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn next_item(stream: &mut BodyChunkStream) -> Option<Result<Bytes, HandlerFault>> {
    std::future::poll_fn(|cx| stream.as_mut().poll_next(cx)).await
}

/// The per-request failure path: a well-formed 500 carrying the
/// diagnostic, never a crash and never a control-channel escalation.
async fn respond_failure(
    outlet: &ResponseOutlet,
    id: RequestId,
    message: &str,
    stack: Option<&str>,
) -> Result<(), BridgeError> {
    let mut head = ResponseHead::new(500);
    head.set_header("content-type", "text/plain; charset=utf-8");
    head.apply_runtime_headers(id);
    // Unreachable for a freshly-built 500, but normalize keeps the single
    // validation path.
    head.normalize()
        .map_err(|e| BridgeError::Protocol(e.to_string()))?;

    match outlet.announce(head) {
        Ok(()) => {}
        Err(StreamError::HeadAlreadySent) => {
            // The failure happened after the head went out. Nothing valid
            // can replace it; the close truncates the body.
            tracing::warn!(request_id = %id, message, "handler failed after response head was sent");
            return Ok(());
        }
        Err(other) => return Err(other.into()),
    }

    let diagnostic = match stack {
        Some(stack) => format!("Internal Server Error: {message}\n{stack}"),
        None => format!("Internal Server Error: {message}"),
    };
    match outlet.write_chunk(Bytes::from(diagnostic)).await {
        Ok(()) => Ok(()),
        // The caller vanished while we were reporting its failure; there
        // is nobody left to answer.
        Err(StreamError::Aborted) => Err(BridgeError::Cancelled),
        Err(other) => Err(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{handler_fn, ReturnValue};
    use crate::resolver::resolve;
    use crate::module::Module;
    use funcbridge_proto::REQUEST_ID_HEADER;
    use funcbridge_stream::request_pair;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn resolved(handler: std::sync::Arc<dyn crate::module::Handler>) -> ResolvedHandler {
        resolve(&Module::new().with_function("fetch", handler)).unwrap()
    }

    fn channel_for(method: &str) -> (funcbridge_stream::HostChannel, RequestChannel, RequestId) {
        let id = RequestId::allocate();
        let metadata = RequestMetadata::new(method, "/test", HeaderMap::new());
        let (host, guest) = request_pair(id, metadata, 1);
        (host, guest, id)
    }

    async fn collect_body(host: &mut funcbridge_stream::HostChannel) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = host.next_response_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    // Handler futures hold `&Invocation` across await points and are spawned
    // onto a multi-threaded runtime, so both handles must stay Send + Sync.
    #[test]
    fn invocation_handles_are_shareable_across_await_points() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Invocation>();
        assert_send_sync::<UpgradeHandle>();
    }

    #[tokio::test]
    async fn return_value_defaults_are_applied() {
        let handler = resolved(handler_fn(|_req, _inv| async {
            Ok(ReturnValue::Response(ResponseValue::default()))
        }));
        let (mut host, guest, id) = channel_for("GET");

        let serving = tokio::spawn(async move {
            serve_request(&handler, guest, TIMEOUT, None).await
        });

        let head = host.response_head().await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.header(REQUEST_ID_HEADER), Some(id.to_string().as_str()));
        assert!(collect_body(&mut host).await.is_empty());
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn thrown_fault_becomes_a_500_with_the_message() {
        let handler = resolved(handler_fn(|_req, _inv| async {
            Err(HandlerFault::new("boom"))
        }));
        let (mut host, guest, _) = channel_for("GET");

        let serving =
            tokio::spawn(async move { serve_request(&handler, guest, TIMEOUT, None).await });

        let head = host.response_head().await.unwrap();
        assert_eq!(head.status, 500);
        let body = String::from_utf8(collect_body(&mut host).await).unwrap();
        assert!(body.contains("boom"), "diagnostic body was: {body}");
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fault_stack_is_included_in_the_diagnostic() {
        let handler = resolved(handler_fn(|_req, _inv| async {
            Err(HandlerFault::with_stack("boom", "at user.js:3:1"))
        }));
        let (mut host, guest, _) = channel_for("GET");

        let serving =
            tokio::spawn(async move { serve_request(&handler, guest, TIMEOUT, None).await });

        host.response_head().await.unwrap();
        let body = String::from_utf8(collect_body(&mut host).await).unwrap();
        assert!(body.contains("at user.js:3:1"));
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn non_object_return_becomes_a_500() {
        let handler = resolved(handler_fn(|_req, _inv| async {
            Ok(ReturnValue::Malformed("string".into()))
        }));
        let (mut host, guest, _) = channel_for("GET");

        let serving =
            tokio::spawn(async move { serve_request(&handler, guest, TIMEOUT, None).await });

        assert_eq!(host.response_head().await.unwrap().status, 500);
        let body = String::from_utf8(collect_body(&mut host).await).unwrap();
        assert!(body.contains("non-object"));
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_status_becomes_a_500() {
        let handler = resolved(handler_fn(|_req, _inv| async {
            Ok(ReturnValue::Response(
                ResponseValue::default().with_status(9999),
            ))
        }));
        let (mut host, guest, _) = channel_for("GET");

        let serving =
            tokio::spawn(async move { serve_request(&handler, guest, TIMEOUT, None).await });

        assert_eq!(host.response_head().await.unwrap().status, 500);
        let body = String::from_utf8(collect_body(&mut host).await).unwrap();
        assert!(body.contains("invalid response status"));
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_timeout_becomes_a_500() {
        let handler = resolved(handler_fn(|_req, _inv| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ReturnValue::Announced)
        }));
        let (mut host, guest, _) = channel_for("GET");

        let serving = tokio::spawn(async move {
            serve_request(&handler, guest, Duration::from_millis(50), None).await
        });

        let head = host.response_head().await.unwrap();
        assert_eq!(head.status, 500);
        let body = String::from_utf8(collect_body(&mut host).await).unwrap();
        assert!(body.contains("timed out"));
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn set_response_convention_is_honored() {
        let handler = resolved(handler_fn(|_req, inv| async move {
            let mut head = ResponseHead::new(202);
            head.set_header("x-mode", "announced");
            inv.set_response(head).map_err(|e| HandlerFault::new(e.to_string()))?;
            inv.write_chunk(Bytes::from_static(b"accepted"))
                .await
                .map_err(|e| HandlerFault::new(e.to_string()))?;
            Ok(ReturnValue::Announced)
        }));
        let (mut host, guest, _) = channel_for("GET");

        let serving =
            tokio::spawn(async move { serve_request(&handler, guest, TIMEOUT, None).await });

        let head = host.response_head().await.unwrap();
        assert_eq!(head.status, 202);
        assert_eq!(head.header("x-mode"), Some("announced"));
        assert_eq!(collect_body(&mut host).await, b"accepted");
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn announced_without_announcement_is_a_500() {
        let handler = resolved(handler_fn(|_req, _inv| async { Ok(ReturnValue::Announced) }));
        let (mut host, guest, _) = channel_for("GET");

        let serving =
            tokio::spawn(async move { serve_request(&handler, guest, TIMEOUT, None).await });

        assert_eq!(host.response_head().await.unwrap().status, 500);
        let body = String::from_utf8(collect_body(&mut host).await).unwrap();
        assert!(body.contains("without a response"));
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn double_finalize_is_a_protocol_error() {
        // set_response followed by a returned response value: the second
        // finalize must be rejected, not silently overwrite the first.
        let handler = resolved(handler_fn(|_req, inv| async move {
            inv.set_response(ResponseHead::new(200))
                .map_err(|e| HandlerFault::new(e.to_string()))?;
            Ok(ReturnValue::Response(
                ResponseValue::default().with_status(201),
            ))
        }));
        let (mut host, guest, _) = channel_for("GET");

        let serving =
            tokio::spawn(async move { serve_request(&handler, guest, TIMEOUT, None).await });

        assert_eq!(host.response_head().await.unwrap().status, 200);
        let err = serving.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn get_requests_see_no_body_regardless_of_host_data() {
        let handler = resolved(handler_fn(|mut req, _inv| async move {
            assert!(!req.has_body());
            assert_eq!(req.read_chunk().await.unwrap(), None);
            Ok(ReturnValue::Response(ResponseValue::default()))
        }));
        let (mut host, guest, _) = channel_for("GET");

        host.push_request_chunk(Bytes::from_static(b"should be dropped"))
            .await
            .unwrap();

        let serving =
            tokio::spawn(async move { serve_request(&handler, guest, TIMEOUT, None).await });
        assert_eq!(host.response_head().await.unwrap().status, 200);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn echo_reads_until_end_and_streams_back() {
        let handler = resolved(handler_fn(|mut req, _inv| async move {
            let mut collected = Vec::new();
            while let Some(chunk) = req
                .read_chunk()
                .await
                .map_err(|e| HandlerFault::new(e.to_string()))?
            {
                collected.extend_from_slice(&chunk);
            }
            Ok(ReturnValue::Response(
                ResponseValue::default().with_body(collected),
            ))
        }));
        let (mut host, guest, _) = channel_for("POST");

        let serving =
            tokio::spawn(async move { serve_request(&handler, guest, TIMEOUT, None).await });

        host.push_request_chunk(Bytes::from_static(b"ab")).await.unwrap();
        host.push_request_chunk(Bytes::from_static(b"cd")).await.unwrap();
        // The final empty chunk is the end-of-body marker.
        host.push_request_chunk(Bytes::new()).await.unwrap();

        assert_eq!(host.response_head().await.unwrap().status, 200);
        assert_eq!(collect_body(&mut host).await, b"abcd");
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn streamed_body_skips_empty_chunks_and_closes_once() {
        use futures_util::stream;

        let handler = resolved(handler_fn(|_req, _inv| async {
            let chunks: Vec<Result<Bytes, HandlerFault>> = vec![
                Ok(Bytes::from_static(b"a")),
                Ok(Bytes::new()),
                Ok(Bytes::from_static(b"b")),
                Ok(Bytes::new()),
            ];
            Ok(ReturnValue::Response(
                ResponseValue::default().with_body_stream(Box::pin(stream::iter(chunks))),
            ))
        }));
        let (mut host, guest, _) = channel_for("GET");

        let serving =
            tokio::spawn(async move { serve_request(&handler, guest, TIMEOUT, None).await });

        host.response_head().await.unwrap();
        assert_eq!(collect_body(&mut host).await, b"ab");
        // End is latched; a further pull is the strict error, proving
        // close was signaled exactly once.
        assert_eq!(
            host.next_response_chunk().await.unwrap_err(),
            StreamError::PullAfterEnd
        );
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn abort_mid_response_is_a_clean_cancellation() {
        let handler = resolved(handler_fn(|_req, inv| async move {
            inv.set_response(ResponseHead::new(200))
                .map_err(|e| HandlerFault::new(e.to_string()))?;
            // Keep writing until the abort lands.
            loop {
                if let Err(e) = inv.write_chunk(Bytes::from_static(b"data")).await {
                    return Err(HandlerFault::new(e.to_string()));
                }
            }
        }));
        let (mut host, guest, _) = channel_for("GET");

        let serving =
            tokio::spawn(async move { serve_request(&handler, guest, TIMEOUT, None).await });

        host.response_head().await.unwrap();
        host.next_response_chunk().await.unwrap();
        host.abort();

        // The handler observed the abort and the adapter released the
        // stream; the outcome is request-scoped, never fatal.
        let result = serving.await.unwrap();
        if let Err(err) = result {
            assert!(!err.is_fatal(), "abort must not be fatal: {err}");
        }
    }
}

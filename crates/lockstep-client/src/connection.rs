//! Session layer over a full-duplex WebSocket.
//!
//! A [`Connection`] owns the split socket and a pending-request map keyed by
//! correlation id.  Outgoing requests are serialized with the next id and
//! resolved by the matching `success`/`error` frame, subject to a deadline;
//! server-initiated broadcasts and everything else route to the attached
//! [`ConnectionDelegate`].  Frames that arrive before the delegate is
//! attached are buffered and replayed in arrival order — losing an early
//! broadcast would desynchronize the room model.

use crate::clock::LocalTime;
use crate::deadline::expiring;
use crate::transport::WsStream;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lockstep_protocol::{
    ClientRequest, ErrorPayload, RequestEnvelope, ServerFrame, SuccessMessage,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::{debug, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public vocabulary
// ---------------------------------------------------------------------------

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The socket failed or terminated without a clean close.
    Error,
    /// Clean close initiated by the server.
    Kicked,
    /// Clean close after our own `disconnect`.
    ClientLeft,
}

/// Send/receive timestamps of one request/response pair, both in the local
/// monotonic domain.  Raw material for the clock-offset estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub sent_at: LocalTime,
    pub received_at: LocalTime,
}

/// A successful response together with its timing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedResponse {
    pub message: SuccessMessage,
    pub metadata: ResponseMetadata,
}

/// Terminal failures of a single request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("server: {} ({})", .0.error, .0.message)]
    Response(ErrorPayload),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed before the response arrived")]
    Closed,
    #[error("response shape did not match the request: {0}")]
    Shape(String),
    #[error("websocket send failed: {0}")]
    Send(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("request serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Incoming-frame trouble that does not terminate the session.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("frame did not parse: {0}")]
    MalformedFrame(String),
    #[error("non-text frame received")]
    NonTextFrame,
}

/// Capability set handed to [`Connection::set_delegate`].
pub trait ConnectionDelegate: Send + Sync {
    fn broadcast_received(&self, broadcast: lockstep_protocol::Broadcast);
    /// A success or error frame whose `request_id` matched nothing pending.
    fn unassignable_response_received(&self, frame: ServerFrame);
    /// Delivered exactly once, on either side closing the channel.
    fn connection_closed(&self, reason: CloseReason);
    fn protocol_violation(&self, violation: ProtocolViolation);
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct PendingRequest {
    kind: &'static str,
    sent_at: LocalTime,
    resolver: oneshot::Sender<Result<EnrichedResponse, RequestError>>,
}

/// `None` after close: inserting into a closed map fails fast, and taking the
/// map on close drops every resolver, rejecting the outstanding requests.
type PendingMap = Option<HashMap<u64, PendingRequest>>;

enum DelegateEvent {
    Broadcast(lockstep_protocol::Broadcast),
    Unassignable(ServerFrame),
    Violation(ProtocolViolation),
    Closed(CloseReason),
}

enum DelegateSlot {
    /// No delegate yet; events queue in arrival order.
    Buffering(Vec<DelegateEvent>),
    Attached(Arc<dyn ConnectionDelegate>),
    /// Session over and close delivered; the delegate reference is released.
    Closed,
}

struct Shared {
    pending: Mutex<PendingMap>,
    delegate: Mutex<DelegateSlot>,
    close_intended: AtomicBool,
}

type Writer = Arc<tokio::sync::Mutex<SplitSink<WsStream, Message>>>;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct Connection {
    shared: Arc<Shared>,
    writer: Writer,
    next_request_id: AtomicU64,
    request_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(ws: WsStream, request_timeout: Duration) -> Arc<Self> {
        let (sink, stream) = ws.split();
        let shared = Arc::new(Shared {
            pending: Mutex::new(Some(HashMap::new())),
            delegate: Mutex::new(DelegateSlot::Buffering(Vec::new())),
            close_intended: AtomicBool::new(false),
        });
        let writer: Writer = Arc::new(tokio::sync::Mutex::new(sink));

        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&shared),
            Arc::clone(&writer),
        ));

        Arc::new(Self {
            shared,
            writer,
            next_request_id: AtomicU64::new(0),
            request_timeout,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Attach the delegate.  Events buffered since the socket opened are
    /// replayed first, in arrival order; a second attachment is refused.
    pub fn set_delegate(&self, delegate: Arc<dyn ConnectionDelegate>) {
        let mut slot = self.shared.delegate.lock().unwrap();
        match std::mem::replace(&mut *slot, DelegateSlot::Attached(Arc::clone(&delegate))) {
            DelegateSlot::Buffering(events) => {
                // Replay while holding the slot so the reader cannot
                // interleave a live event ahead of a buffered one.
                let mut closed = false;
                for event in events {
                    closed = closed || matches!(event, DelegateEvent::Closed(_));
                    dispatch(&delegate, event);
                }
                if closed {
                    *slot = DelegateSlot::Closed;
                }
            }
            previous @ DelegateSlot::Attached(_) => {
                warn!("delegate already attached; ignoring");
                *slot = previous;
            }
            DelegateSlot::Closed => {
                warn!("connection already closed; ignoring delegate");
                *slot = DelegateSlot::Closed;
            }
        }
    }

    /// Issue `request` and await the correlated response.
    ///
    /// The pending entry is registered before the frame is shipped, so a
    /// response racing the send cannot slip past.  Exactly one terminal
    /// outcome occurs: the matching response, a server error, the deadline,
    /// or connection close.
    pub async fn perform_request(
        &self,
        request: ClientRequest,
    ) -> Result<EnrichedResponse, RequestError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        let frame = serde_json::to_string(&RequestEnvelope {
            request_id,
            request,
        })?;

        let (resolver, response) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            let Some(map) = pending.as_mut() else {
                return Err(RequestError::Closed);
            };
            map.insert(
                request_id,
                PendingRequest {
                    kind,
                    sent_at: LocalTime::now(),
                    resolver,
                },
            );
        }

        debug!(request_id, kind, "sending request");
        let sent = self.writer.lock().await.send(Message::Text(frame.into())).await;
        if let Err(e) = sent {
            remove_pending(&self.shared, request_id);
            return Err(RequestError::Send(e));
        }

        match expiring(response, self.request_timeout, || {
            remove_pending(&self.shared, request_id);
        })
        .await
        {
            Ok(Ok(outcome)) => outcome,
            // Resolver dropped without an answer: the session closed.
            Ok(Err(_)) => Err(RequestError::Closed),
            Err(elapsed) => {
                debug!(request_id, kind, "request deadline elapsed");
                Err(RequestError::Timeout(elapsed.0))
            }
        }
    }

    /// Close the channel with a normal-closure status.  The resulting close
    /// reports [`CloseReason::ClientLeft`].
    pub async fn disconnect(&self) {
        self.shared.close_intended.store(true, Ordering::SeqCst);
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));
        if let Err(e) = self.writer.lock().await.send(close).await {
            debug!(error = %e, "close frame send failed");
        }
    }

    /// Requests currently awaiting a response.
    pub fn pending_request_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, HashMap::len)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Incoming side
// ---------------------------------------------------------------------------

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>, writer: Writer) {
    let mut clean_close = false;
    let mut socket_error = false;

    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => handle_frame(&shared, &text, LocalTime::now()),
            Ok(Message::Binary(_)) => {
                deliver(&shared, DelegateEvent::Violation(ProtocolViolation::NonTextFrame));
            }
            Ok(Message::Ping(payload)) => {
                let _ = writer.lock().await.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) => {
                clean_close = true;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "websocket error");
                socket_error = true;
                break;
            }
        }
    }

    let reason = if socket_error || !clean_close {
        CloseReason::Error
    } else if shared.close_intended.load(Ordering::SeqCst) {
        CloseReason::ClientLeft
    } else {
        CloseReason::Kicked
    };

    // Reject everything still outstanding by dropping the resolvers.
    drop(shared.pending.lock().unwrap().take());
    finish(&shared, reason);
}

/// Route one text frame.  Malformed frames must never kill the session.
fn handle_frame(shared: &Arc<Shared>, text: &str, received_at: LocalTime) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Success {
            request_id,
            message,
        }) => match take_pending(shared, request_id) {
            Some(pending) => {
                debug!(request_id, kind = pending.kind, "response");
                let _ = pending.resolver.send(Ok(EnrichedResponse {
                    message,
                    metadata: ResponseMetadata {
                        sent_at: pending.sent_at,
                        received_at,
                    },
                }));
            }
            None => deliver(
                shared,
                DelegateEvent::Unassignable(ServerFrame::Success {
                    request_id,
                    message,
                }),
            ),
        },
        Ok(ServerFrame::Error {
            request_id,
            message,
        }) => match request_id.and_then(|id| take_pending(shared, id)) {
            Some(pending) => {
                debug!(request_id, kind = pending.kind, code = %message.error, "error response");
                let _ = pending.resolver.send(Err(RequestError::Response(message)));
            }
            None => deliver(
                shared,
                DelegateEvent::Unassignable(ServerFrame::Error {
                    request_id,
                    message,
                }),
            ),
        },
        Ok(ServerFrame::Broadcast { message }) => {
            deliver(shared, DelegateEvent::Broadcast(message));
        }
        Err(parse_error) => {
            // The frame may still carry a correlation id; a matched request is
            // rejected with a shape error rather than left to its deadline.
            if let Some(id) = probe_request_id(text) {
                if let Some(pending) = take_pending(shared, id) {
                    let _ = pending
                        .resolver
                        .send(Err(RequestError::Shape(parse_error.to_string())));
                    return;
                }
            }
            deliver(
                shared,
                DelegateEvent::Violation(ProtocolViolation::MalformedFrame(
                    parse_error.to_string(),
                )),
            );
        }
    }
}

/// Lenient second parse used only to salvage the correlation id from a frame
/// that failed full deserialization.
#[derive(Deserialize)]
struct IdProbe {
    request_id: u64,
}

fn probe_request_id(text: &str) -> Option<u64> {
    serde_json::from_str::<IdProbe>(text)
        .ok()
        .map(|probe| probe.request_id)
}

fn take_pending(shared: &Shared, request_id: u64) -> Option<PendingRequest> {
    shared
        .pending
        .lock()
        .unwrap()
        .as_mut()
        .and_then(|map| map.remove(&request_id))
}

fn remove_pending(shared: &Shared, request_id: u64) {
    let _ = take_pending(shared, request_id);
}

fn deliver(shared: &Shared, event: DelegateEvent) {
    let mut slot = shared.delegate.lock().unwrap();
    match &mut *slot {
        DelegateSlot::Buffering(events) => events.push(event),
        DelegateSlot::Attached(delegate) => {
            let delegate = Arc::clone(delegate);
            // The slot stays locked through dispatch; see set_delegate.
            dispatch(&delegate, event);
        }
        DelegateSlot::Closed => {}
    }
}

/// Deliver the close exactly once and release the delegate reference.
fn finish(shared: &Shared, reason: CloseReason) {
    let mut slot = shared.delegate.lock().unwrap();
    match std::mem::replace(&mut *slot, DelegateSlot::Closed) {
        DelegateSlot::Buffering(mut events) => {
            // Nobody attached yet; keep buffering so a late delegate still
            // observes the full history ending in the close.
            events.push(DelegateEvent::Closed(reason));
            *slot = DelegateSlot::Buffering(events);
        }
        DelegateSlot::Attached(delegate) => {
            drop(slot);
            dispatch(&delegate, DelegateEvent::Closed(reason));
        }
        DelegateSlot::Closed => {}
    }
}

fn dispatch(delegate: &Arc<dyn ConnectionDelegate>, event: DelegateEvent) {
    match event {
        DelegateEvent::Broadcast(broadcast) => delegate.broadcast_received(broadcast),
        DelegateEvent::Unassignable(frame) => delegate.unassignable_response_received(frame),
        DelegateEvent::Violation(violation) => delegate.protocol_violation(violation),
        DelegateEvent::Closed(reason) => delegate.connection_closed(reason),
    }
}

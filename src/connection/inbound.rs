//! Server-side connection state machine (design §4.4, inbound
//! specializations).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::{CHUNK_SIZE, HIGH_WATERMARK, LOW_WATERMARK, MAX_REQUEST_BODY};
use crate::duplex::Duplex;
use crate::error::ProxyResult;
use crate::http::message::{PayloadKind, Response};
use crate::http::parser::{ParseOutcome, RequestParser};
use crate::http::{serializer, Request};
use crate::payload::Payload;

/// Result handed back through the per-request promise: either a response
/// plus the payload it will stream from, or a typed failure the connection
/// turns into a canned status.
pub type RequestReply = ProxyResult<(Response, Arc<Payload>)>;

/// The owning proxy registers one of these per listener; `handle_request`
/// is fired once per parsed request header and must not block — the
/// answer arrives later via `promise`.
pub trait RequestHandler: Send + Sync {
    fn handle_request(&self, req: Request, request_body: Arc<Payload>, promise: oneshot::Sender<RequestReply>);
}

struct InFlight {
    request: Request,
    request_body: Arc<Payload>,
    reply_rx: oneshot::Receiver<RequestReply>,
    reply_taken: bool,
    response: Option<Response>,
    response_body: Option<Arc<Payload>>,
    response_written: bool,
}

pub struct InboundConnection<S> {
    duplex: Duplex<S>,
    handler: Arc<dyn RequestHandler>,
    parser: RequestParser,
    current: Option<InFlight>,
    peer_eof: bool,
}

impl<S> InboundConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(socket: S, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            duplex: Duplex::with_watermarks(socket, LOW_WATERMARK, HIGH_WATERMARK, LOW_WATERMARK, HIGH_WATERMARK),
            handler,
            parser: RequestParser::new(),
            current: None,
            peer_eof: false,
        }
    }

    /// Drives the connection until the peer disconnects or a non-keep-alive
    /// exchange finishes writing.
    pub async fn run(mut self) {
        loop {
            if let Err(e) = self.drive_once().await {
                warn!(error = %e, "inbound connection teardown");
                return;
            }
            if self.duplex.can_close() {
                debug!("inbound connection closed");
                return;
            }
        }
    }

    async fn drive_once(&mut self) -> ProxyResult<()> {
        self.process_buffered()?;

        if let Some(inflight) = self.current.as_mut() {
            if !inflight.reply_taken {
                tokio::select! {
                    biased;
                    reply = &mut inflight.reply_rx, if !inflight.reply_taken => {
                        inflight.reply_taken = true;
                        self.apply_reply(reply.unwrap_or(Err(crate::error::ProxyError::Cancelled)));
                    }
                    outcome = self.duplex.pump() => {
                        self.on_pump(outcome?);
                    }
                }
            } else {
                self.duplex.pump().await.map(|o| self.on_pump(o))?;
            }
        } else {
            self.duplex.pump().await.map(|o| self.on_pump(o))?;
        }
        self.process_buffered()
    }

    fn on_pump(&mut self, outcome: crate::duplex::PumpOutcome) {
        if outcome.peer_closed {
            self.peer_eof = true;
        }
    }

    /// Parses whatever is currently sitting in the input buffer, advances
    /// any in-flight request body, and drains any ready response bytes into
    /// the output buffer. Pure bookkeeping — no I/O of its own.
    fn process_buffered(&mut self) -> ProxyResult<()> {
        loop {
            let mut progressed = false;

            if self.current.is_none() {
                match self.parser.feed(&mut self.duplex.input)? {
                    ParseOutcome::Done(req) => {
                        self.start_request(req);
                        progressed = true;
                    }
                    ParseOutcome::Pending => {
                        if self.peer_eof && self.duplex.input.is_empty() {
                            self.duplex.close_after_read = true;
                        }
                    }
                }
            }

            let mut response_done = false;
            if let Some(inflight) = self.current.as_mut() {
                if !inflight.request_body.is_completed() && !inflight.request_body.is_error() {
                    inflight.request_body.parse(&mut self.duplex.input)?;
                    if self.peer_eof && !inflight.request_body.is_completed() && !inflight.request_body.is_error() {
                        match inflight.request_body.kind() {
                            PayloadKind::Eof | PayloadKind::Tunnel => {
                                inflight.request_body.complete();
                                progressed = true;
                            }
                            _ => inflight.request_body.mark_error(),
                        }
                    }
                }

                if let (Some(response), Some(body)) = (&inflight.response, &inflight.response_body) {
                    if !inflight.response_written {
                        let emit_kind = response.payload_kind();
                        let mut out = Vec::new();
                        let made = body.write_http(&mut out, CHUNK_SIZE, emit_kind);
                        if !out.is_empty() {
                            progressed = true;
                        }
                        if body.is_written() {
                            inflight.response_written = true;
                            response_done = true;
                            progressed = true;
                        } else if made {
                            progressed = true;
                        }
                        if !out.is_empty() {
                            self.duplex.output.push(&out);
                        }
                    }
                }
            }
            if response_done {
                self.on_response_written();
            }

            if !progressed {
                break;
            }
        }
        Ok(())
    }

    fn start_request(&mut self, req: Request) {
        if let Some(n) = req.content_length {
            if n > MAX_REQUEST_BODY {
                self.reject_oversized_body(req);
                return;
            }
        }
        let kind = req.payload_kind();
        let keep_alive = req.keep_alive;
        let request_body = Arc::new(Payload::new(kind));
        let (tx, rx) = oneshot::channel();
        self.handler.handle_request(req.clone(), request_body.clone(), tx);
        self.current = Some(InFlight {
            request: req,
            request_body,
            reply_rx: rx,
            reply_taken: false,
            response: None,
            response_body: None,
            response_written: false,
        });
        let _ = keep_alive;
    }

    /// A request body announcing more than `MAX_REQUEST_BODY` bytes is
    /// rejected without ever being read off the socket, so the connection
    /// cannot be kept alive afterward.
    fn reject_oversized_body(&mut self, req: Request) {
        let resp = Response::canned(req.proto, 400, "Bad Request", false);
        let head = serializer::serialize_response(&resp);
        self.duplex.output.push(&head);
        self.duplex.close_after_write = true;
    }

    fn apply_reply(&mut self, reply: RequestReply) {
        let Some(inflight) = self.current.as_mut() else { return };
        let (response, body) = match reply {
            Ok(pair) => pair,
            Err(e) => {
                let (code, reason) = e.canned_status();
                let keep_alive = code != 400 && inflight.request.keep_alive;
                let resp = Response::canned(inflight.request.proto, code, reason, keep_alive);
                let empty = Arc::new(Payload::new(PayloadKind::Empty));
                (resp, empty)
            }
        };
        let head = serializer::serialize_response(&response);
        self.duplex.output.push(&head);
        if !response.keep_alive {
            self.duplex.close_after_write = true;
        }
        inflight.response = Some(response);
        inflight.response_body = Some(body);
    }

    fn on_response_written(&mut self) {
        let Some(inflight) = self.current.take() else { return };
        if !inflight.response.as_ref().map(|r| r.keep_alive).unwrap_or(false) {
            self.duplex.close_after_write = true;
        } else if self.peer_eof && self.duplex.input.is_empty() {
            self.duplex.close_after_write = true;
        }
    }
}

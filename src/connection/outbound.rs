//! Client-side connection state machine (design §4.4, outbound
//! specializations): one in-flight request plus a FIFO of queued ones.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::actor::Alarm;
use crate::connection::{HIGH_WATERMARK, LOW_WATERMARK};
use crate::connection::inbound::RequestReply;
use crate::duplex::Duplex;
use crate::error::{ProxyError, ProxyResult};
use crate::http::message::{Method, PayloadKind};
use crate::http::parser::{ParseOutcome, ResponseParser};
use crate::http::{serializer, Request};
use crate::payload::Payload;

pub struct QueuedQuery {
    pub request: Request,
    pub request_body: Arc<Payload>,
    pub deadline: Instant,
    pub promise: oneshot::Sender<RequestReply>,
}

struct InFlightQuery {
    request_body: Arc<Payload>,
    request_body_written: bool,
    promise: Option<oneshot::Sender<RequestReply>>,
    cached_keep_alive: bool,
    force_no_payload_in_answer: bool,
    is_tunnel: bool,
    response_parser: ResponseParser,
    response_body: Option<Arc<Payload>>,
}

pub struct OutboundConnection<S> {
    duplex: Duplex<S>,
    queue: VecDeque<QueuedQuery>,
    inflight: Option<InFlightQuery>,
    alarm: Alarm,
    peer_eof: bool,
    stopped: bool,
    mailbox: Option<mpsc::UnboundedReceiver<QueuedQuery>>,
    ready: Option<Arc<AtomicBool>>,
}

/// A handle to a connection task running `OutboundConnection::run` in the
/// background: a mailbox sender plus a shared readiness flag, the pieces a
/// `SingleClient`/`MultiClient` needs without owning the socket directly.
#[derive(Clone)]
pub struct OutboundHandle {
    tx: mpsc::UnboundedSender<QueuedQuery>,
    ready: Arc<AtomicBool>,
}

impl OutboundHandle {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn send_query(
        &self,
        request: Request,
        request_body: Arc<Payload>,
        deadline: Instant,
        promise: oneshot::Sender<RequestReply>,
    ) -> Result<(), ()> {
        self.tx
            .send(QueuedQuery {
                request,
                request_body,
                deadline,
                promise,
            })
            .map_err(|_| ())
    }
}

/// Spawns a connection task and returns a handle to it plus its
/// `JoinHandle`, so the owner can detect disconnection via
/// `JoinHandle::is_finished()`.
pub fn spawn_outbound<S>(socket: S) -> (OutboundHandle, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let ready = Arc::new(AtomicBool::new(true));
    let mut conn = OutboundConnection::new(socket);
    conn.mailbox = Some(rx);
    conn.ready = Some(ready.clone());
    let join = tokio::spawn(async move { conn.run().await });
    (OutboundHandle { tx, ready }, join)
}

impl<S> OutboundConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(socket: S) -> Self {
        Self {
            duplex: Duplex::with_watermarks(socket, LOW_WATERMARK, HIGH_WATERMARK, LOW_WATERMARK, HIGH_WATERMARK),
            queue: VecDeque::new(),
            inflight: None,
            alarm: Alarm::idle(),
            peer_eof: false,
            stopped: false,
            mailbox: None,
            ready: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.stopped
    }

    pub fn has_inflight(&self) -> bool {
        self.inflight.is_some()
    }

    /// §4.4 `send_query`: if a query is already in flight, queue it;
    /// otherwise start it immediately.
    pub fn send_query(
        &mut self,
        request: Request,
        request_body: Arc<Payload>,
        deadline: Instant,
        promise: oneshot::Sender<RequestReply>,
    ) {
        if self.inflight.is_some() {
            self.queue.push_back(QueuedQuery {
                request,
                request_body,
                deadline,
                promise,
            });
            return;
        }
        self.start_query(request, request_body, deadline, promise);
    }

    fn start_query(
        &mut self,
        request: Request,
        request_body: Arc<Payload>,
        deadline: Instant,
        promise: oneshot::Sender<RequestReply>,
    ) {
        let cached_keep_alive = request.keep_alive;
        let force_no_payload_in_answer = request.method == Method::Head;
        let is_tunnel = request.method == Method::Connect;
        let head = serializer::serialize_request(&request);
        self.duplex.output.push(&head);
        self.alarm.arm_at(deadline);
        self.inflight = Some(InFlightQuery {
            request_body,
            request_body_written: false,
            promise: Some(promise),
            cached_keep_alive,
            force_no_payload_in_answer,
            is_tunnel,
            response_parser: ResponseParser::new(force_no_payload_in_answer, is_tunnel, cached_keep_alive),
            response_body: None,
        });
    }

    async fn recv_mailbox(&mut self) -> Option<QueuedQuery> {
        match self.mailbox.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.alarm.wait(), if self.alarm.is_armed() => {
                    self.on_alarm();
                }
                query = self.recv_mailbox() => {
                    match query {
                        Some(q) => self.send_query(q.request, q.request_body, q.deadline, q.promise),
                        None => { self.stopped = true; }
                    }
                }
                outcome = self.duplex.pump() => {
                    match outcome {
                        Ok(o) => {
                            if o.peer_closed {
                                self.peer_eof = true;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "outbound connection I/O error");
                            self.fail_inflight(ProxyError::Transport(e.to_string()));
                            if let Some(ready) = &self.ready {
                                ready.store(false, Ordering::Release);
                            }
                            return;
                        }
                    }
                }
            }
            if let Err(e) = self.process_buffered() {
                warn!(error = %e, "outbound connection parse error");
                if let Some(ready) = &self.ready {
                    ready.store(false, Ordering::Release);
                }
                return;
            }
            if self.stopped || self.duplex.can_close() {
                debug!("outbound connection closed");
                if let Some(ready) = &self.ready {
                    ready.store(false, Ordering::Release);
                }
                return;
            }
        }
    }

    fn process_buffered(&mut self) -> ProxyResult<()> {
        loop {
            let mut progressed = false;
            let mut should_finish = false;

            if let Some(inflight) = self.inflight.as_mut() {
                if !inflight.request_body_written {
                    let mut out = Vec::new();
                    let kind = inflight.request_body.kind();
                    let made = inflight.request_body.write_http(&mut out, 64 * 1024, kind);
                    if !out.is_empty() {
                        self.duplex.output.push(&out);
                        progressed = true;
                    }
                    if inflight.request_body.is_written() {
                        inflight.request_body_written = true;
                    } else if made {
                        progressed = true;
                    }
                }

                if inflight.promise.is_some() {
                    match inflight.response_parser.feed(&mut self.duplex.input)? {
                        ParseOutcome::Done(None) => {
                            progressed = true;
                        }
                        ParseOutcome::Done(Some(response)) => {
                            let close_after_read = !response.keep_alive || !inflight.cached_keep_alive;
                            self.duplex.close_after_read = close_after_read;
                            let body_kind = response.payload_kind();
                            let low = if inflight.is_tunnel { 1 } else { crate::payload::DEFAULT_LOW_WATERMARK };
                            let response_body = Arc::new(Payload::with_watermarks(
                                body_kind,
                                low,
                                crate::payload::DEFAULT_HIGH_WATERMARK,
                                crate::payload::DEFAULT_CHUNK_SIZE,
                            ));
                            if body_kind == PayloadKind::Empty {
                                response_body.complete();
                            }
                            inflight.response_body = Some(response_body.clone());
                            self.alarm.disarm();
                            if let Some(p) = inflight.promise.take() {
                                let _ = p.send(Ok((response, response_body)));
                            }
                            progressed = true;
                        }
                        ParseOutcome::Pending => {}
                    }
                } else if let Some(body) = inflight.response_body.clone() {
                    if !body.is_completed() && !body.is_error() {
                        body.parse(&mut self.duplex.input)?;
                        if self.peer_eof && !body.is_completed() && !body.is_error() {
                            match body.kind() {
                                PayloadKind::Eof | PayloadKind::Tunnel => body.complete(),
                                _ => body.mark_error(),
                            }
                        }
                        progressed = true;
                    }
                    if body.is_completed() || body.is_error() {
                        should_finish = true;
                        progressed = true;
                    }
                }
            } else if !self.queue.is_empty() && !self.peer_eof {
                let next = self.queue.pop_front().unwrap();
                self.start_query(next.request, next.request_body, next.deadline, next.promise);
                progressed = true;
            }

            if should_finish {
                self.finish_inflight();
            }

            if !progressed {
                break;
            }
        }
        Ok(())
    }

    fn finish_inflight(&mut self) {
        self.inflight = None;
        if self.duplex.close_after_read {
            self.stopped = true;
            self.fail_queue(ProxyError::Cancelled);
        }
    }

    fn on_alarm(&mut self) {
        self.fail_inflight(ProxyError::Timeout);
        self.stopped = true;
    }

    fn fail_inflight(&mut self, err: ProxyError) {
        if let Some(mut inflight) = self.inflight.take() {
            if let Some(p) = inflight.promise.take() {
                let _ = p.send(Err(err.clone()));
            }
            if let Some(body) = inflight.response_body {
                body.mark_error();
            }
        }
        self.fail_queue(err);
    }

    fn fail_queue(&mut self, err: ProxyError) {
        while let Some(q) = self.queue.pop_front() {
            let _ = q.promise.send(Err(err.clone()));
        }
    }
}

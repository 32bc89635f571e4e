use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource, ToolCallRecord};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use session_policy::{DownstreamFilter, PolicyEnforcer};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::continuation::ContinuationTracker;
use crate::correlator::CallCorrelator;
use crate::error::MalformedEvent;
use crate::event::{items, types, RelayEvent};
use crate::registry::{ResultDirection, ToolError, ToolRegistry};
use crate::transport::{Duplex, FrameSink, FrameStream, UpstreamConnector, UpstreamRequest};

const COMPONENT: &str = "rt-relay";

/// Frames buffered per writer before senders wait.
const WRITER_QUEUE: usize = 256;

/// RFC 6455 limit for a close reason.
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Identity of one client connection.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub remote_addr: SocketAddr,
    pub client_request_id: Option<String>,
}

impl SessionContext {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            remote_addr,
            client_request_id: None,
        }
    }

    pub fn with_client_request_id(mut self, id: Option<String>) -> Self {
        self.client_request_id = id;
        self
    }

    fn audit_source(&self) -> AuditSource {
        AuditSource::for_session(COMPONENT, self.session_id, self.remote_addr)
    }
}

/// Process-wide collaborators, shared read-only by every session.
#[derive(Clone)]
pub struct SessionServices {
    pub enforcer: Arc<PolicyEnforcer>,
    pub filter: Arc<DownstreamFilter>,
    pub tools: Arc<ToolRegistry>,
    pub audit: AuditSink,
}

/// One client proxied to one upstream realtime connection.
pub struct RelaySession {
    ctx: Arc<SessionContext>,
    services: SessionServices,
    state: watch::Sender<SessionState>,
}

impl RelaySession {
    pub fn new(ctx: SessionContext, services: SessionServices) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            ctx: Arc::new(ctx),
            services,
            state,
        }
    }

    pub fn id(&self) -> Uuid {
        self.ctx.session_id
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Drive the session to completion. Returns once both connections have
    /// been closed and every tool task has finished.
    pub async fn run(self, client: Duplex, connector: &dyn UpstreamConnector) {
        let session_id = self.ctx.session_id;
        let Duplex {
            sink: client_sink,
            stream: client_stream,
        } = client;
        let (client_out, client_writer) = spawn_writer(client_sink, "client", session_id);

        // ------------------------------------------------------------------
        // Connecting
        // ------------------------------------------------------------------
        let request = UpstreamRequest {
            session_id,
            client_request_id: self.ctx.client_request_id.clone(),
        };
        let upstream = match connector.connect(&request).await {
            Ok(upstream) => upstream,
            Err(err) => {
                warn!(%session_id, %err, "upstream connection failed");
                self.audit(
                    AuditEventType::UpstreamRejected,
                    json!({
                        "error": err.to_string(),
                        "auth_failure": err.is_auth_failure(),
                    }),
                )
                .await;
                let reason = format!("upstream connection failed: {err}");
                self.fail(client_out, client_writer, &reason).await;
                return;
            }
        };

        let Duplex {
            sink: mut upstream_sink,
            stream: upstream_stream,
        } = upstream;
        let initial = self.services.enforcer.initial_update();
        if let Err(err) = upstream_sink.send(json_frame(&initial)).await {
            warn!(%session_id, %err, "initial session.update failed");
            let _ = upstream_sink.close().await;
            let reason = format!("upstream session setup failed: {err}");
            self.fail(client_out, client_writer, &reason).await;
            return;
        }
        let (upstream_out, upstream_writer) = spawn_writer(upstream_sink, "upstream", session_id);

        // ------------------------------------------------------------------
        // Active
        // ------------------------------------------------------------------
        self.state.send_replace(SessionState::Active);
        info!(%session_id, remote_addr = %self.ctx.remote_addr, "session active");
        self.audit(
            AuditEventType::SessionOpened,
            json!({ "client_request_id": self.ctx.client_request_id }),
        )
        .await;

        let cancel = CancellationToken::new();
        let pump = Arc::new(Pump {
            ctx: Arc::clone(&self.ctx),
            services: self.services.clone(),
            cancel: cancel.clone(),
        });

        let client_task = tokio::spawn(client_pump(
            client_stream,
            upstream_out.clone(),
            Arc::clone(&pump),
        ));
        let upstream_task = tokio::spawn(upstream_pump(
            upstream_stream,
            client_out.clone(),
            upstream_out.clone(),
            Arc::clone(&pump),
        ));

        // ------------------------------------------------------------------
        // Closing
        // ------------------------------------------------------------------
        cancel.cancelled().await;
        self.state.send_replace(SessionState::Closing);
        debug!(%session_id, "session closing");

        for (name, task) in [("client", client_task), ("upstream", upstream_task)] {
            if let Err(err) = task.await {
                error!(%session_id, pump = name, %err, "pump task failed");
            }
        }

        drop(pump);
        drop(client_out);
        drop(upstream_out);
        let _ = tokio::join!(client_writer, upstream_writer);

        self.state.send_replace(SessionState::Closed);
        info!(%session_id, "session closed");
        self.audit(AuditEventType::SessionClosed, json!({})).await;
    }

    /// `Connecting -> Closed`: tell the client why and shut its writer.
    async fn fail(&self, client_out: Outbound, client_writer: JoinHandle<()>, reason: &str) {
        client_out
            .close_with(close_frame(CloseCode::Error, reason))
            .await;
        drop(client_out);
        let _ = client_writer.await;
        self.state.send_replace(SessionState::Closed);
    }

    async fn audit(&self, event_type: AuditEventType, details: Value) {
        self.services
            .audit
            .log(AuditEntry::new(event_type, self.ctx.audit_source(), details))
            .await;
    }
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

enum WriterCommand {
    Send(Message),
    /// Close frame to use once the queue shuts. The first one wins.
    CloseWith(CloseFrame),
}

/// Enqueue side of a connection's writer task.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::Sender<WriterCommand>,
}

impl Outbound {
    /// `false` once the writer is gone.
    async fn send(&self, msg: Message) -> bool {
        self.tx.send(WriterCommand::Send(msg)).await.is_ok()
    }

    async fn close_with(&self, frame: CloseFrame) {
        let _ = self.tx.send(WriterCommand::CloseWith(frame)).await;
    }
}

/// The only task that writes to `sink`. Sends exactly one close frame after
/// every [`Outbound`] clone has been dropped.
fn spawn_writer(
    mut sink: FrameSink,
    peer: &'static str,
    session_id: Uuid,
) -> (Outbound, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(WRITER_QUEUE);

    let handle = tokio::spawn(async move {
        let mut close = None;
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriterCommand::Send(msg) => {
                    if let Err(err) = sink.send(msg).await {
                        debug!(%session_id, peer, %err, "write failed, writer stopping");
                        return;
                    }
                }
                WriterCommand::CloseWith(frame) => {
                    close.get_or_insert(frame);
                }
            }
        }

        let frame = close.unwrap_or_else(|| close_frame(CloseCode::Normal, ""));
        if let Err(err) = sink.send(Message::Close(Some(frame))).await {
            debug!(%session_id, peer, %err, "close frame not delivered");
        }
        let _ = sink.close().await;
    });

    (Outbound { tx }, handle)
}

fn close_frame(code: CloseCode, reason: &str) -> CloseFrame {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    CloseFrame {
        code,
        reason: reason[..end].to_string().into(),
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

struct Pump {
    ctx: Arc<SessionContext>,
    services: SessionServices,
    cancel: CancellationToken,
}

/// Where a tool result (or error) for one call goes.
#[derive(Debug, Clone)]
struct Delivery {
    call_id: String,
    tool_name: Option<String>,
    previous_item_id: Option<String>,
    /// Response that asked for the call, when upstream said.
    response_id: Option<String>,
    direction: ResultDirection,
}

impl Delivery {
    fn server_bound(&self) -> bool {
        self.direction == ResultDirection::ToServer
    }

    fn record(&self) -> ToolCallRecord {
        ToolCallRecord {
            call_id: self.call_id.clone(),
            tool_name: self.tool_name.clone(),
            direction: self.direction.as_str().to_string(),
        }
    }
}

/// Reported back to the upstream pump once a server-bound output has been
/// handled.
#[derive(Debug)]
struct OutputSettled {
    response_id: Option<String>,
    written: bool,
}

/// Everything the upstream pump owns.
struct UpstreamState {
    correlator: CallCorrelator,
    continuations: ContinuationTracker,
    tasks: JoinSet<Option<OutputSettled>>,
}

impl UpstreamState {
    fn new() -> Self {
        Self {
            correlator: CallCorrelator::new(),
            continuations: ContinuationTracker::new(),
            tasks: JoinSet::new(),
        }
    }
}

async fn client_pump(mut stream: FrameStream, upstream: Outbound, pump: Arc<Pump>) {
    let _cancel_on_exit = pump.cancel.clone().drop_guard();
    let session_id = pump.ctx.session_id;

    loop {
        let msg = tokio::select! {
            _ = pump.cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => {
                    debug!(%session_id, %err, "client read error");
                    break;
                }
                None => break,
            },
        };

        match msg {
            Message::Text(text) => {
                let outgoing = match pump.client_event(&text).await {
                    Route::Forward => Message::Text(text),
                    Route::Rewrite(event) => json_frame(&event),
                    Route::Drop => continue,
                    Route::Stop => break,
                };
                if !pump.send_unless_cancelled(&upstream, outgoing).await {
                    break;
                }
            }
            Message::Binary(_) => pump.dropped("client", None, &MalformedEvent::Binary).await,
            Message::Close(frame) => {
                debug!(%session_id, "client sent close");
                if let Some(frame) = frame {
                    upstream.close_with(frame).await;
                }
                break;
            }
            // Ping/pong are answered by the websocket layer.
            _ => {}
        }
    }
}

async fn upstream_pump(
    mut stream: FrameStream,
    client: Outbound,
    upstream: Outbound,
    pump: Arc<Pump>,
) {
    let _cancel_on_exit = pump.cancel.clone().drop_guard();
    let session_id = pump.ctx.session_id;
    let mut state = UpstreamState::new();

    loop {
        tokio::select! {
            _ = pump.cancel.cancelled() => break,
            Some(joined) = state.tasks.join_next(), if !state.tasks.is_empty() => match joined {
                Ok(Some(settled)) => {
                    if !pump.settle(settled, &mut state.continuations, &upstream).await {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => error!(%session_id, %err, "tool task failed"),
            },
            next = stream.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    let route = pump
                        .upstream_event(&text, &mut state, &client, &upstream)
                        .await;
                    let outgoing = match route {
                        Route::Forward => Message::Text(text),
                        Route::Rewrite(event) => json_frame(&event),
                        Route::Drop => continue,
                        Route::Stop => break,
                    };
                    if !pump.send_unless_cancelled(&client, outgoing).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    pump.dropped("upstream", None, &MalformedEvent::Binary).await
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(%session_id, ?frame, "upstream sent close");
                    if let Some(frame) = frame {
                        client.close_with(frame).await;
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%session_id, %err, "upstream read error");
                    break;
                }
                None => break,
            },
        }
    }

    // Tool tokens are children of the session token; fire them before waiting.
    pump.cancel.cancel();
    let tasks = &mut state.tasks;
    if !tasks.is_empty() {
        info!(%session_id, outstanding = tasks.len(), "waiting for in-flight tool calls");
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(%session_id, %err, "tool task failed");
        }
    }
    if state.continuations.waiting() > 0 {
        debug!(
            %session_id,
            responses = state.continuations.waiting(),
            "session closed before tool outputs were continued"
        );
    }
}

/// What a pump does with one inbound text frame.
enum Route {
    /// Send the original frame text unchanged.
    Forward,
    Rewrite(Value),
    Drop,
    /// A writer is gone; end the session.
    Stop,
}

/// Outcome of a send made while handling the event itself: the event is
/// consumed either way, and a failed send ends the session.
impl From<bool> for Route {
    fn from(sent: bool) -> Self {
        if sent {
            Route::Drop
        } else {
            Route::Stop
        }
    }
}

impl Pump {
    /// Client -> upstream.
    async fn client_event(&self, text: &str) -> Route {
        let event = match RelayEvent::parse(text) {
            Ok(event) => event,
            Err(err) => {
                self.dropped("client", None, &err).await;
                return Route::Drop;
            }
        };

        if event.kind != types::SESSION_UPDATE {
            return Route::Forward;
        }

        let enforced = self.services.enforcer.enforce(event.body);
        if !enforced.discarded.is_empty() {
            info!(
                session_id = %self.ctx.session_id,
                discarded = ?enforced.discarded,
                "client session.update overridden by policy"
            );
            self.audit(
                AuditEventType::PolicyEnforced,
                json!({ "discarded": enforced.discarded }),
                None,
            )
            .await;
        }
        Route::Rewrite(enforced.event)
    }

    /// Upstream -> client. Tool-call events are consumed here and results
    /// are sent from spawned tool tasks.
    async fn upstream_event(
        self: &Arc<Self>,
        text: &str,
        state: &mut UpstreamState,
        client: &Outbound,
        upstream: &Outbound,
    ) -> Route {
        let event = match RelayEvent::parse(text) {
            Ok(event) => event,
            Err(err) => {
                self.dropped("upstream", None, &err).await;
                return Route::Drop;
            }
        };

        // Tool-call plumbing is never shown to the client.
        match event.kind.as_str() {
            types::OUTPUT_ITEM_ADDED | types::CONVERSATION_ITEM_CREATED => {
                if let Some(item) = event.item_of_type(items::FUNCTION_CALL) {
                    match item.get("call_id").and_then(Value::as_str) {
                        Some(call_id) => state.correlator.on_call_started(
                            call_id,
                            item.get("name").and_then(Value::as_str),
                            event.str_field("previous_item_id"),
                        ),
                        None => warn!(
                            session_id = %self.ctx.session_id,
                            event_type = %event.kind,
                            "function_call item without call_id"
                        ),
                    }
                    return Route::Drop;
                }
                if event.item_type() == Some(items::FUNCTION_CALL_OUTPUT) {
                    return Route::Drop;
                }
            }
            types::ARGUMENTS_DELTA => {
                match event.require_str("call_id") {
                    Ok(call_id) => {
                        state.correlator.on_argument_fragment(
                            call_id,
                            event.str_field("name"),
                            event.str_field("delta").unwrap_or_default(),
                        );
                    }
                    Err(err) => self.dropped("upstream", Some(&event.kind), &err).await,
                }
                return Route::Drop;
            }
            types::ARGUMENTS_DONE => {
                return self
                    .dispatch(&event, state, client, upstream)
                    .await
                    .into();
            }
            types::OUTPUT_ITEM_DONE if event.item_type() == Some(items::FUNCTION_CALL) => {
                return Route::Drop;
            }
            // Continuation bookkeeping runs even when the client never sees
            // the event.
            types::RESPONSE_DONE => {
                let response_id = event
                    .body
                    .get("response")
                    .and_then(|r| r.get("id"))
                    .and_then(Value::as_str);
                if let Some(id) = response_id {
                    if state.continuations.response_done(id)
                        && !self.request_continuation(Some(id), upstream).await
                    {
                        return Route::Stop;
                    }
                }
            }
            _ => {}
        }

        if self.services.filter.is_blocked(&event.kind) {
            debug!(
                session_id = %self.ctx.session_id,
                event_type = %event.kind,
                "upstream event blocked"
            );
            self.audit(
                AuditEventType::EventDropped,
                json!({ "direction": "upstream", "event_type": event.kind, "reason": "blocked" }),
                None,
            )
            .await;
            return Route::Drop;
        }

        match event.kind.as_str() {
            types::SESSION_CREATED | types::SESSION_UPDATED => {
                let mut body = event.body;
                self.services.enforcer.redact_echo(&mut body);
                Route::Rewrite(body)
            }
            types::RESPONSE_DONE => {
                let mut body = event.body;
                if strip_function_calls(&mut body) {
                    Route::Rewrite(body)
                } else {
                    Route::Forward
                }
            }
            _ => Route::Forward,
        }
    }

    /// Handle `response.function_call_arguments.done`.
    async fn dispatch(
        self: &Arc<Self>,
        event: &RelayEvent,
        state: &mut UpstreamState,
        client: &Outbound,
        upstream: &Outbound,
    ) -> bool {
        let call_id = match event.require_str("call_id") {
            Ok(call_id) => call_id,
            Err(err) => {
                self.dropped("upstream", Some(&event.kind), &err).await;
                return true;
            }
        };
        let response_id = event.str_field("response_id").map(str::to_string);
        let continuations = &mut state.continuations;

        let call = match state.correlator.on_arguments_complete(
            call_id,
            event.str_field("arguments"),
            event.str_field("name"),
        ) {
            Ok(call) => call,
            Err(unknown) => {
                let direction = unknown
                    .previous_tool
                    .as_deref()
                    .and_then(|name| self.services.tools.direction_of(name))
                    .unwrap_or(ResultDirection::ToServer);
                let delivery = Delivery {
                    call_id: call_id.to_string(),
                    tool_name: unknown.previous_tool.clone(),
                    previous_item_id: None,
                    response_id,
                    direction,
                };
                return self
                    .reject(&delivery, "unknown_call", &unknown, continuations, client, upstream)
                    .await;
            }
        };

        let mut delivery = Delivery {
            call_id: call.call_id,
            tool_name: call.tool_name,
            previous_item_id: call.previous_item_id,
            response_id,
            direction: ResultDirection::ToServer,
        };

        let Some(name) = delivery.tool_name.clone() else {
            return self
                .reject(
                    &delivery,
                    "unknown_tool",
                    "function call carries no tool name",
                    continuations,
                    client,
                    upstream,
                )
                .await;
        };
        let tool = match self.services.tools.lookup(&name) {
            Ok(tool) => Arc::clone(tool),
            Err(err) => {
                return self
                    .reject(&delivery, "unknown_tool", &err, continuations, client, upstream)
                    .await;
            }
        };
        delivery.direction = tool.direction;

        if !self.services.enforcer.allows_tool(&name) {
            let message = format!("tool '{name}' is not enabled for this session");
            return self
                .reject(&delivery, "tool_not_enabled", &message, continuations, client, upstream)
                .await;
        }

        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(err) => {
                return self
                    .reject(&delivery, err.code(), &err, continuations, client, upstream)
                    .await;
            }
        };

        info!(
            session_id = %self.ctx.session_id,
            call_id = %delivery.call_id,
            tool = %name,
            direction = delivery.direction.as_str(),
            response_id = delivery.response_id.as_deref(),
            "tool call dispatched"
        );
        self.audit(
            AuditEventType::ToolDispatched,
            json!({ "response_id": delivery.response_id }),
            Some(delivery.record()),
        )
        .await;

        if delivery.server_bound() {
            if let Some(id) = &delivery.response_id {
                continuations.expect_output(id);
            }
        }

        let token = self.cancel.child_token();
        let pump = Arc::clone(self);
        let client = client.clone();
        let upstream = upstream.clone();
        state.tasks.spawn(async move {
            let outcome = tool.invoke(args, token.clone()).await;
            let written = if token.is_cancelled() {
                debug!(
                    session_id = %pump.ctx.session_id,
                    call_id = %delivery.call_id,
                    "session closing, tool result discarded"
                );
                false
            } else {
                match outcome.result {
                    Ok(payload) => {
                        debug!(
                            session_id = %pump.ctx.session_id,
                            call_id = %delivery.call_id,
                            "tool call succeeded"
                        );
                        pump.audit(
                            AuditEventType::ToolSucceeded,
                            json!({}),
                            Some(delivery.record()),
                        )
                        .await;
                        pump.deliver(&delivery, &payload, &client, &upstream).await
                    }
                    Err(err) => {
                        pump.deliver_error(&delivery, err.code(), &err, &client, &upstream)
                            .await
                    }
                }
            };
            delivery.server_bound().then(|| OutputSettled {
                response_id: delivery.response_id,
                written,
            })
        });
        true
    }

    /// Report a call that never reaches its tool. Server-bound errors count
    /// toward their response's continuation like any other output.
    async fn reject(
        &self,
        delivery: &Delivery,
        code: &str,
        message: impl Display,
        continuations: &mut ContinuationTracker,
        client: &Outbound,
        upstream: &Outbound,
    ) -> bool {
        if delivery.server_bound() {
            if let Some(id) = &delivery.response_id {
                continuations.expect_output(id);
            }
        }
        let written = self
            .deliver_error(delivery, code, message, client, upstream)
            .await;
        if !written {
            return false;
        }
        if !delivery.server_bound() {
            return true;
        }
        let settled = OutputSettled {
            response_id: delivery.response_id.clone(),
            written,
        };
        self.settle(settled, continuations, upstream).await
    }

    /// Account for one server-bound output and continue the response if it
    /// was the last thing it waited on. Without a response id the model is
    /// continued right after the output.
    async fn settle(
        &self,
        settled: OutputSettled,
        continuations: &mut ContinuationTracker,
        upstream: &Outbound,
    ) -> bool {
        let due = match settled.response_id.as_deref() {
            Some(id) if settled.written => continuations.output_written(id),
            Some(id) => continuations.output_abandoned(id),
            None => settled.written,
        };
        !due || self
            .request_continuation(settled.response_id.as_deref(), upstream)
            .await
    }

    async fn request_continuation(&self, response_id: Option<&str>, upstream: &Outbound) -> bool {
        debug!(
            session_id = %self.ctx.session_id,
            response_id,
            "tool outputs written, continuing response"
        );
        let create = json!({ "type": types::RESPONSE_CREATE });
        self.send_unless_cancelled(upstream, json_frame(&create)).await
    }

    /// Route a result by direction. ToServer results go upstream as function
    /// output; the continuation is requested separately. ToClient results
    /// only reach the client.
    async fn deliver(
        &self,
        delivery: &Delivery,
        payload: &Value,
        client: &Outbound,
        upstream: &Outbound,
    ) -> bool {
        let output = result_text(payload);
        let (out, message) = match delivery.direction {
            ResultDirection::ToServer => (
                upstream,
                json!({
                    "type": types::CONVERSATION_ITEM_CREATE,
                    "item": {
                        "type": items::FUNCTION_CALL_OUTPUT,
                        "call_id": delivery.call_id,
                        "output": output,
                    }
                }),
            ),
            ResultDirection::ToClient => (
                client,
                json!({
                    "type": types::TOOL_RESPONSE,
                    "previous_item_id": delivery.previous_item_id,
                    "tool_name": delivery.tool_name,
                    "tool_result": output,
                }),
            ),
        };
        self.send_unless_cancelled(out, json_frame(&message)).await
    }

    async fn deliver_error(
        &self,
        delivery: &Delivery,
        code: &str,
        message: impl Display,
        client: &Outbound,
        upstream: &Outbound,
    ) -> bool {
        let message = message.to_string();
        warn!(
            session_id = %self.ctx.session_id,
            call_id = %delivery.call_id,
            tool = delivery.tool_name.as_deref().unwrap_or("<none>"),
            direction = delivery.direction.as_str(),
            code,
            %message,
            "tool call failed"
        );
        self.audit(
            AuditEventType::ToolFailed,
            json!({ "code": code, "message": message }),
            Some(delivery.record()),
        )
        .await;

        let payload = json!({ "error": { "code": code, "message": message } });
        self.deliver(delivery, &payload, client, upstream).await
    }

    /// Enqueue a frame, giving up if the session starts closing first.
    async fn send_unless_cancelled(&self, out: &Outbound, msg: Message) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = out.send(msg) => sent,
        }
    }
    async fn dropped(&self, from: &'static str, event_type: Option<&str>, reason: impl Display) {
        warn!(
            session_id = %self.ctx.session_id,
            from,
            event_type = event_type.unwrap_or("<unknown>"),
            %reason,
            "malformed event dropped"
        );
        self.audit(
            AuditEventType::EventDropped,
            json!({ "direction": from, "event_type": event_type, "reason": reason.to_string() }),
            None,
        )
        .await;
    }

    async fn audit(
        &self,
        event_type: AuditEventType,
        details: Value,
        tool_call: Option<ToolCallRecord>,
    ) {
        let mut entry = AuditEntry::new(event_type, self.ctx.audit_source(), details);
        if let Some(record) = tool_call {
            entry = entry.with_tool_call(record);
        }
        self.services.audit.log(entry).await;
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

fn parse_arguments(raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn json_frame(value: &Value) -> Message {
    Message::Text(value.to_string().into())
}

/// A string payload is sent as is; anything else as its JSON text.
fn result_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Remove `function_call` entries from `response.output`. Returns `true`
/// if anything was removed.
fn strip_function_calls(body: &mut Value) -> bool {
    let Some(output) = body
        .get_mut("response")
        .and_then(|r| r.get_mut("output"))
        .and_then(Value::as_array_mut)
    else {
        return false;
    };
    let before = output.len();
    output.retain(|item| item.get("type").and_then(Value::as_str) != Some(items::FUNCTION_CALL));
    output.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn idle_pump() -> Pump {
        Pump {
            ctx: Arc::new(SessionContext::new(SocketAddr::from(([127, 0, 0, 1], 9)))),
            services: SessionServices {
                enforcer: Arc::new(PolicyEnforcer::new(Default::default(), Vec::new())),
                filter: Arc::new(DownstreamFilter::allow_all()),
                tools: Arc::new(ToolRegistry::new()),
                audit: AuditSink::disabled(),
            },
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn send_to_stalled_writer_gives_up_on_cancel() {
        let pump = idle_pump();
        let (tx, _rx) = mpsc::channel(1);
        let out = Outbound { tx };
        assert!(pump.send_unless_cancelled(&out, json_frame(&json!("a"))).await);

        // The queue is full and nothing drains it.
        let stalled = tokio::time::timeout(
            Duration::from_millis(50),
            pump.send_unless_cancelled(&out, json_frame(&json!("b"))),
        )
        .await;
        assert!(stalled.is_err());

        pump.cancel.cancel();
        let sent = tokio::time::timeout(
            Duration::from_secs(1),
            pump.send_unless_cancelled(&out, json_frame(&json!("c"))),
        )
        .await
        .expect("send still waiting after cancel");
        assert!(!sent);
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        assert_eq!(parse_arguments("  ").unwrap(), json!({}));
        assert_eq!(parse_arguments(r#"{"k":5}"#).unwrap(), json!({"k": 5}));
        let err = parse_arguments(r#"{"query":"#).unwrap_err();
        assert_eq!(err.code(), "invalid_arguments");
    }

    #[test]
    fn result_text_unwraps_strings() {
        assert_eq!(result_text(&json!("plain")), "plain");
        assert_eq!(result_text(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn response_done_loses_function_calls() {
        let mut body = json!({
            "type": "response.done",
            "response": {
                "output": [
                    {"type": "message", "id": "m1"},
                    {"type": "function_call", "call_id": "c1"}
                ]
            }
        });
        assert!(strip_function_calls(&mut body));
        assert_eq!(body["response"]["output"], json!([{"type": "message", "id": "m1"}]));
        assert!(!strip_function_calls(&mut body));
    }

    #[test]
    fn close_reason_is_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let frame = close_frame(CloseCode::Error, &reason);
        assert!(frame.reason.len() <= MAX_CLOSE_REASON);
        assert_eq!(frame.reason.len() % 2, 0);
    }
}

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use crate::rpc::dispatch::{self, EventHandler, Flow};
use crate::rpc::{LinesRequest, LinesResponse, StreamStatus};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;

/// Invoked with the full `(score, sport)` batch of every pushed message.
pub type BatchCallback = Arc<dyn Fn(Vec<(f64, String)>) + Send + Sync>;

/// Completions driving the client stream. Reads and writes carry their
/// stream half back so the next operation can be issued with it.
enum CallEvent {
    Start(Result<WsStream, WsError>),
    Read(WsReader, Option<Result<Message, WsError>>),
    Write(WsWriter, Result<(), WsError>),
    Complete(StreamStatus),
}

/// Streaming score subscriber.
///
/// [`call`] queues subscription updates; the first one opens the stream.
/// Queued requests are transmitted strictly in FIFO order, one outstanding
/// at a time, at the next write opportunity; the server's
/// apply-only-if-different logic decides whether an update is significant.
/// A failed stream leaves the client terminally closed; reconnecting is the
/// caller's responsibility.
///
/// [`call`]: RpcClient::call
pub struct RpcClient {
    completions: mpsc::UnboundedSender<CallEvent>,
    calls: Arc<Mutex<VecDeque<LinesRequest>>>,
    started: AtomicBool,
    cancel: watch::Sender<bool>,
    url: String,
    processor: Option<JoinHandle<()>>,
}

impl RpcClient {
    /// Build a client for `addr` (`host:port`). The processing task starts
    /// immediately; the stream itself is opened by the first [`call`].
    ///
    /// [`call`]: RpcClient::call
    pub fn new(addr: &str, callback: BatchCallback) -> Self {
        let (completions, mut events) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(false);
        let calls = Arc::new(Mutex::new(VecDeque::new()));

        let mut handler = CallHandler {
            completions: completions.clone(),
            calls: Arc::clone(&calls),
            callback,
            cancel: cancel.clone(),
            reader: None,
            writer: None,
            outstanding: false,
        };

        let mut cancelled = cancel.subscribe();
        let processor = tokio::spawn(async move {
            tokio::select! {
                _ = dispatch::run(&mut handler, &mut events) => {}
                _ = cancelled.changed() => {}
            }
            // Drain whatever was already posted so no completion dangles.
            while events.try_recv().is_ok() {}
            debug!("client processor stopped");
        });

        RpcClient {
            completions,
            calls,
            started: AtomicBool::new(false),
            cancel,
            url: format!("ws://{addr}"),
            processor: Some(processor),
        }
    }

    /// Queue a subscription update for `(period, sports)`.
    pub fn call(&self, period: u64, sports: Vec<String>) {
        self.calls.lock().unwrap().push_back(LinesRequest {
            polling_period: period,
            sports,
        });

        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let url = self.url.clone();
            let mut cancelled = self.cancel.subscribe();
            dispatch::issue(&self.completions, async move {
                tokio::select! {
                    _ = cancelled.changed() => CallEvent::Complete(StreamStatus::Cancelled),
                    connected = tokio_tungstenite::connect_async(url) => {
                        CallEvent::Start(connected.map(|(ws, _)| ws))
                    }
                }
            });
        }
    }

    /// Abort every in-flight stream operation.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Cancel, then wait for the processing task to drain and exit.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(processor) = self.processor.take() {
            let _ = processor.await;
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

/// Client side of one stream. Strictly sequential: exactly one read or
/// write is outstanding at any moment, so the idle stream halves are parked
/// here between operations.
struct CallHandler {
    completions: mpsc::UnboundedSender<CallEvent>,
    calls: Arc<Mutex<VecDeque<LinesRequest>>>,
    callback: BatchCallback,
    cancel: watch::Sender<bool>,
    reader: Option<WsReader>,
    writer: Option<WsWriter>,
    outstanding: bool,
}

impl CallHandler {
    /// Take the next queued request, unless one is still outstanding.
    fn next_request(&mut self) -> Option<LinesRequest> {
        if self.outstanding {
            return None;
        }
        let next = self.calls.lock().unwrap().pop_front();
        if next.is_some() {
            self.outstanding = true;
        }
        next
    }

    fn issue_read(&self, mut reader: WsReader) {
        let mut cancelled = self.cancel.subscribe();
        dispatch::issue(&self.completions, async move {
            tokio::select! {
                _ = cancelled.changed() => CallEvent::Read(reader, None),
                frame = reader.next() => CallEvent::Read(reader, frame),
            }
        });
    }

    fn issue_write(&mut self, req: LinesRequest) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let mut cancelled = self.cancel.subscribe();
        dispatch::issue(&self.completions, async move {
            let frame = serde_json::to_string(&req).expect("request serializes");
            tokio::select! {
                _ = cancelled.changed() => {
                    CallEvent::Write(writer, Err(WsError::ConnectionClosed))
                }
                sent = writer.send(Message::Text(frame)) => CallEvent::Write(writer, sent),
            }
        });
    }

    /// After the next read: write a queued request if one exists, otherwise
    /// keep reading.
    fn advance(&mut self, reader: WsReader) {
        match self.next_request() {
            Some(req) => {
                self.reader = Some(reader);
                self.issue_write(req);
            }
            None => self.issue_read(reader),
        }
    }

    /// Send the close frame, then post the terminal completion.
    fn request_complete(&mut self, status: StreamStatus) -> Flow {
        if let Some(mut writer) = self.writer.take() {
            let completions = self.completions.clone();
            tokio::spawn(async move {
                let _ = writer.send(Message::Close(None)).await;
                let _ = completions.send(CallEvent::Complete(status));
            });
        } else {
            let _ = self.completions.send(CallEvent::Complete(status));
        }
        Flow::Continue
    }

    fn failure_status(&self) -> StreamStatus {
        if *self.cancel.borrow() {
            StreamStatus::Cancelled
        } else {
            StreamStatus::Error
        }
    }
}

#[async_trait]
impl EventHandler for CallHandler {
    type Event = CallEvent;

    async fn on_event(&mut self, event: CallEvent) -> Flow {
        match event {
            CallEvent::Start(Ok(ws)) => {
                debug!("stream started");
                let (writer, reader) = ws.split();
                self.writer = Some(writer);
                self.advance(reader);
                Flow::Continue
            }
            CallEvent::Start(Err(e)) => {
                warn!(error = %e, "connect failed");
                self.request_complete(StreamStatus::Error)
            }
            CallEvent::Read(reader, Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<LinesResponse>(&text) {
                    Ok(response) => {
                        debug!(lines = response.lines.len(), "batch received");
                        let batch: Vec<(f64, String)> = response
                            .lines
                            .into_iter()
                            .map(|line| (line.score, line.sport))
                            .collect();
                        (self.callback)(batch);
                        self.advance(reader);
                    }
                    Err(e) => {
                        warn!(error = %e, "unparseable batch ignored");
                        self.issue_read(reader);
                    }
                }
                Flow::Continue
            }
            CallEvent::Read(_, Some(Ok(Message::Close(_)))) => {
                debug!("server finished the stream");
                self.request_complete(StreamStatus::Ok)
            }
            CallEvent::Read(_, None) => {
                debug!("stream ended");
                let status = self.failure_status();
                self.request_complete(status)
            }
            CallEvent::Read(reader, Some(Ok(_))) => {
                self.issue_read(reader);
                Flow::Continue
            }
            CallEvent::Read(_, Some(Err(e))) => {
                warn!(error = %e, "read failed");
                let status = self.failure_status();
                self.request_complete(status)
            }
            CallEvent::Write(writer, Ok(())) => {
                debug!("subscription request written");
                self.outstanding = false;
                self.writer = Some(writer);
                if let Some(reader) = self.reader.take() {
                    self.issue_read(reader);
                }
                Flow::Continue
            }
            CallEvent::Write(_, Err(e)) => {
                warn!(error = %e, "write failed");
                let status = self.failure_status();
                self.request_complete(status)
            }
            CallEvent::Complete(status) => {
                match status {
                    StreamStatus::Ok => debug!("call completed"),
                    StreamStatus::Cancelled => debug!("call cancelled"),
                    StreamStatus::Error => error!("call failed"),
                }
                Flow::Finished
            }
        }
    }
}

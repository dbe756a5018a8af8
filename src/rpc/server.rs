use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::error::LinesError;
use crate::lines::provider::ScoreSource;
use crate::rpc::dispatch::{self, EventHandler, Flow};
use crate::rpc::{Line, LinesRequest, LinesResponse, StreamStatus};

type WsStream = WebSocketStream<TcpStream>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;

/// Completions driving one server-side stream.
///
/// Read completions carry the reader back so the handler can issue the next
/// read without sharing the stream half across tasks.
enum StreamEvent {
    Connect(Result<WsStream, WsError>),
    Read(WsReader, Option<Result<Message, WsError>>),
    Write(Result<(), WsError>),
    Finish(StreamStatus),
}

/// What the client currently wants, shared between the read handler and the
/// emission loop.
struct Subscription {
    current: RwLock<LinesRequest>,
    changed: AtomicBool,
    notify: Notify,
}

/// Streaming score server.
///
/// Serves one stream at a time: a finished stream makes room for the next
/// connection. Scores are pulled from the injected [`ScoreSource`] by a
/// per-stream emission loop whose cadence follows the subscribed period.
pub struct RpcServer {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

impl RpcServer {
    pub async fn start(addr: &str, source: Arc<dyn ScoreSource>) -> Result<Self, LinesError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "rpc server listening");

        let (stop, stopped) = watch::channel(false);
        let accept = tokio::spawn(accept_loop(listener, source, stopped));

        Ok(RpcServer {
            local_addr,
            stop,
            accept,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, finish the active stream, and wait for the accept
    /// loop to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.accept.await;
        debug!("rpc server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    source: Arc<dyn ScoreSource>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "stream accepted");
                    serve_stream(stream, Arc::clone(&source), stopped.clone()).await;
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
    debug!("accept loop stopped");
}

/// Drive one stream's state machine to completion.
async fn serve_stream(stream: TcpStream, source: Arc<dyn ScoreSource>, mut stopped: watch::Receiver<bool>) {
    let (completions, mut events) = mpsc::unbounded_channel();
    let mut handler = StreamHandler::new(completions.clone(), source);

    dispatch::issue(&completions, async move {
        StreamEvent::Connect(tokio_tungstenite::accept_async(stream).await)
    });

    tokio::select! {
        _ = dispatch::run(&mut handler, &mut events) => {}
        _ = stopped.changed() => {}
    }
    handler.shutdown().await;
}

/// Server side of one stream.
///
/// The read path lives here; the write path lives in [`emission_loop`],
/// which owns the sink and posts its write completions back through the
/// same dispatch channel.
struct StreamHandler {
    completions: mpsc::UnboundedSender<StreamEvent>,
    source: Arc<dyn ScoreSource>,
    subscription: Arc<Subscription>,
    last_req: LinesRequest,
    /// Wakes pending reads and the emission loop on teardown.
    cancel: watch::Sender<bool>,
    emitter: Option<JoinHandle<()>>,
}

impl StreamHandler {
    fn new(completions: mpsc::UnboundedSender<StreamEvent>, source: Arc<dyn ScoreSource>) -> Self {
        let (cancel, _) = watch::channel(false);
        StreamHandler {
            completions,
            source,
            subscription: Arc::new(Subscription {
                current: RwLock::new(LinesRequest::default()),
                changed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            last_req: LinesRequest::default(),
            cancel,
            emitter: None,
        }
    }

    fn issue_read(&self, mut reader: WsReader) {
        let mut cancelled = self.cancel.subscribe();
        dispatch::issue(&self.completions, async move {
            tokio::select! {
                _ = cancelled.changed() => StreamEvent::Read(reader, None),
                frame = reader.next() => StreamEvent::Read(reader, frame),
            }
        });
    }

    fn request_finish(&self, status: StreamStatus) -> Flow {
        let _ = self.completions.send(StreamEvent::Finish(status));
        Flow::Continue
    }

    /// Replace the stored subscription when the request differs from the
    /// last accepted one, and signal the emission loop.
    fn apply_request(&mut self, req: LinesRequest) {
        if req == self.last_req {
            return;
        }
        self.last_req = req.clone();
        *self.subscription.current.write().unwrap() = req;
        self.subscription.changed.store(true, Ordering::Release);
        self.subscription.notify.notify_one();
    }

    /// Tear the stream down; safe to call more than once.
    async fn shutdown(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(emitter) = self.emitter.take() {
            let _ = emitter.await;
        }
    }
}

#[async_trait]
impl EventHandler for StreamHandler {
    type Event = StreamEvent;

    async fn on_event(&mut self, event: StreamEvent) -> Flow {
        match event {
            StreamEvent::Connect(Ok(ws)) => {
                debug!("stream connected");
                let (writer, reader) = ws.split();
                self.emitter = Some(tokio::spawn(emission_loop(
                    writer,
                    Arc::clone(&self.subscription),
                    Arc::clone(&self.source),
                    self.completions.clone(),
                    self.cancel.subscribe(),
                )));
                self.issue_read(reader);
                Flow::Continue
            }
            StreamEvent::Connect(Err(e)) => {
                warn!(error = %e, "handshake failed");
                self.request_finish(StreamStatus::Error)
            }
            StreamEvent::Read(reader, Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<LinesRequest>(&text) {
                    Ok(req) => {
                        debug!(
                            period = req.polling_period,
                            sports = req.sports.len(),
                            "subscription request"
                        );
                        self.apply_request(req);
                    }
                    // Transient: a malformed request never ends the stream.
                    Err(e) => warn!(error = %e, "unparseable request ignored"),
                }
                self.issue_read(reader);
                Flow::Continue
            }
            StreamEvent::Read(_, Some(Ok(Message::Close(_)))) | StreamEvent::Read(_, None) => {
                debug!("client closed the stream");
                self.request_finish(StreamStatus::Cancelled)
            }
            StreamEvent::Read(reader, Some(Ok(_))) => {
                // Ping/pong/binary frames carry no subscription data.
                self.issue_read(reader);
                Flow::Continue
            }
            StreamEvent::Read(_, Some(Err(e))) => {
                warn!(error = %e, "read failed");
                self.request_finish(StreamStatus::Cancelled)
            }
            StreamEvent::Write(Ok(())) => {
                debug!("emission batch written");
                Flow::Continue
            }
            StreamEvent::Write(Err(e)) => {
                warn!(error = %e, "write failed");
                self.request_finish(StreamStatus::Error)
            }
            StreamEvent::Finish(status) => {
                self.shutdown().await;
                match status {
                    StreamStatus::Ok | StreamStatus::Cancelled => {
                        debug!(?status, "stream finished")
                    }
                    StreamStatus::Error => error!("stream finished with an error"),
                }
                Flow::Finished
            }
        }
    }
}

/// Periodic push loop for one stream.
///
/// Sleeps the subscribed period between batches. A re-subscription is picked
/// up at the next tick; that tick reads absolute values (`changed == true`)
/// instead of deltas, so a fresh subscriber sees the current score first.
async fn emission_loop(
    mut writer: WsWriter,
    subscription: Arc<Subscription>,
    source: Arc<dyn ScoreSource>,
    completions: mpsc::UnboundedSender<StreamEvent>,
    mut cancelled: watch::Receiver<bool>,
) {
    // Nothing to emit until the first subscription arrives.
    tokio::select! {
        _ = cancelled.changed() => {
            let _ = writer.send(Message::Close(None)).await;
            return;
        }
        _ = subscription.notify.notified() => {}
    }

    let mut period = Duration::ZERO;
    let mut sports: Vec<String> = Vec::new();
    loop {
        let changed = subscription
            .changed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if changed {
            let current = subscription.current.read().unwrap().clone();
            period = Duration::from_secs(current.polling_period);
            sports = current.sports;
        }

        tokio::select! {
            _ = cancelled.changed() => break,
            _ = tokio::time::sleep(period) => {}
        }

        let scores = source.fetch_delta(&sports, changed).await;
        debug!(lines = scores.len(), changed, "emission tick");

        let response = LinesResponse {
            lines: scores
                .into_iter()
                .map(|(sport, score)| Line { sport, score })
                .collect(),
        };
        let frame = serde_json::to_string(&response).expect("response serializes");

        match writer.send(Message::Text(frame)).await {
            Ok(()) => {
                let _ = completions.send(StreamEvent::Write(Ok(())));
            }
            Err(e) => {
                let _ = completions.send(StreamEvent::Write(Err(e)));
                return;
            }
        }
    }

    // Cancelled: tell the peer we are done before dropping the sink.
    let _ = writer.send(Message::Close(None)).await;
}

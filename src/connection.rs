use crate::config::{token_of, AuthSlot, RealtimeConfig};
use crate::dispatch::{spawn_dispatcher, TaggedFrame};
use crate::error::RealtimeError;
use crate::frame::{decode_message, ServerMessage, SseDecoder, CONNECT_EVENT};
use crate::retry::RetryScheduler;
use crate::subscription::SubscriptionRegistry;
use crate::sync::{SyncDebounce, TopicSync};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use url::Url;

const CMD_CHANNEL_CAPACITY: usize = 32;
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Stand-in deadline for disabled timer branches in the select loop.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

type ByteStream = BoxStream<'static, reqwest::Result<Bytes>>;

/// Lifecycle of the streaming connection. `Streaming` is the only state in
/// which a client id is held; everything else is rebuilt on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

#[derive(Default)]
struct ConnState {
    state: ConnectionState,
    client_id: Option<String>,
    attempt: u32,
}

/// Connection state shared between the connection task, the dispatcher and
/// the client handle. Guarded by its own mutex, held only for reads and
/// single-field writes so callbacks never run under it.
#[derive(Default)]
pub(crate) struct ConnectionStateCell {
    inner: Mutex<ConnState>,
}

impl ConnectionStateCell {
    fn transition(&self, next: ConnectionState) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != next {
            tracing::debug!(from = ?inner.state, to = ?next, "connection state");
            inner.state = next;
        }
        if next != ConnectionState::Streaming {
            inner.client_id = None;
        }
    }

    fn enter_streaming(&self, client_id: String) {
        let mut inner = self.inner.lock().unwrap();
        tracing::debug!(from = ?inner.state, client_id = %client_id, "connection state: Streaming");
        inner.state = ConnectionState::Streaming;
        inner.client_id = Some(client_id);
        inner.attempt = 0;
    }

    fn record_attempt(&self, attempt: u32) {
        self.inner.lock().unwrap().attempt = attempt;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    /// Client id of the live stream; `None` unless currently `Streaming`.
    pub fn streaming_client_id(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            ConnectionState::Streaming => inner.client_id.clone(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    TopicsChanged,
    Shutdown,
}

/// Handle to one connection epoch: a background task owning the stream
/// lifecycle plus its dispatcher. The task runs until explicit shutdown or
/// until the registry stays empty past the grace period; the client then
/// spawns a fresh epoch on the next subscribe.
pub(crate) struct ConnectionManager {
    pub(crate) epoch: u64,
    cmd_tx: mpsc::Sender<Command>,
    state: Arc<ConnectionStateCell>,
    _task: JoinHandle<()>,
    _dispatcher: JoinHandle<()>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        epoch: u64,
        endpoint: Url,
        http: reqwest::Client,
        auth: AuthSlot,
        config: RealtimeConfig,
        registry: Arc<SubscriptionRegistry>,
        on_exit: impl FnOnce() + Send + 'static,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let state = Arc::new(ConnectionStateCell::default());

        let dispatcher = spawn_dispatcher(registry.clone(), state.clone(), frame_rx);
        let sync = TopicSync::new(http.clone(), endpoint.clone(), auth.clone());

        let task = tokio::spawn({
            let state = state.clone();
            async move {
                connection_task(
                    endpoint, http, auth, config, registry, &state, sync, frame_tx, cmd_rx,
                )
                .await;
                state.transition(ConnectionState::Closed);
                on_exit();
            }
        });

        Self {
            epoch,
            cmd_tx,
            state,
            _task: task,
            _dispatcher: dispatcher,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<Command> {
        self.cmd_tx.clone()
    }

    /// Fire-and-forget topics-changed nudge; safe from sync contexts. A full
    /// channel already holds a pending nudge, so dropping this one is fine.
    pub fn nudge(&self) {
        let _ = self.cmd_tx.try_send(Command::TopicsChanged);
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    pub fn try_shutdown(&self) {
        let _ = self.cmd_tx.try_send(Command::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state.state() == ConnectionState::Closed
    }
}

enum StreamExit {
    Fault(RealtimeError),
    Shutdown,
    /// Registry stayed empty past the grace period.
    Drained,
}

#[allow(clippy::too_many_arguments)]
async fn connection_task(
    endpoint: Url,
    http: reqwest::Client,
    auth: AuthSlot,
    config: RealtimeConfig,
    registry: Arc<SubscriptionRegistry>,
    state: &ConnectionStateCell,
    sync: TopicSync,
    frame_tx: mpsc::Sender<TaggedFrame>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    let retry = RetryScheduler::new(config.base_delay, config.max_delay);
    let mut attempt: u32 = 0;

    loop {
        state.transition(ConnectionState::Connecting);

        let opened = tokio::select! {
            res = open_stream(&http, &endpoint, &auth, config.connect_timeout) => res,
            _ = wait_for_shutdown(&mut cmd_rx) => return,
        };

        let fault = match opened {
            Ok((client_id, stream, decoder)) => {
                // Activate delivery before any event from the new stream is
                // dispatched; otherwise the server would push topics this
                // client never declared under its fresh id.
                match sync.push(&client_id, &registry.snapshot()).await {
                    Ok(()) => {
                        attempt = 0;
                        state.enter_streaming(client_id.clone());
                        let exit = stream_loop(
                            stream, decoder, client_id, &config, &registry, state, &sync,
                            &frame_tx, &mut cmd_rx,
                        )
                        .await;
                        match exit {
                            StreamExit::Fault(err) => err,
                            StreamExit::Shutdown | StreamExit::Drained => return,
                        }
                    }
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };

        state.transition(ConnectionState::Reconnecting);
        tracing::warn!(error = %fault, "realtime connection fault");
        registry.broadcast_error(fault);

        let delay = retry.next_delay(attempt);
        attempt = attempt.saturating_add(1);
        state.record_attempt(attempt);
        tracing::debug!(?delay, attempt, "reconnect scheduled");

        let timer = sleep_until(Instant::now() + delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::TopicsChanged) => {
                        // Nothing left to reconnect for.
                        if registry.is_empty() {
                            return;
                        }
                    }
                    Some(Command::Shutdown) | None => return,
                },
            }
        }
    }
}

async fn wait_for_shutdown(cmd_rx: &mut mpsc::Receiver<Command>) {
    loop {
        match cmd_rx.recv().await {
            Some(Command::Shutdown) | None => return,
            // The initial sync snapshots the registry after connect, so
            // topic churn during the handshake needs no action here.
            Some(Command::TopicsChanged) => {}
        }
    }
}

/// Open the streaming GET and wait for the server's connect frame carrying
/// the freshly assigned client id.
async fn open_stream(
    http: &reqwest::Client,
    endpoint: &Url,
    auth: &AuthSlot,
    timeout: Duration,
) -> Result<(String, ByteStream, SseDecoder), RealtimeError> {
    let connect = async {
        let mut request = http
            .get(endpoint.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(token) = token_of(auth) {
            request = request.header(AUTHORIZATION, token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RealtimeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut stream: ByteStream = response.bytes_stream().boxed();
        let mut decoder = SseDecoder::new();
        loop {
            if let Some(frame) = decoder.next_frame() {
                return match decode_message(&frame)? {
                    ServerMessage::Connect { client_id } => Ok((client_id, stream, decoder)),
                    ServerMessage::Change(event) => Err(RealtimeError::Protocol(format!(
                        "expected connect frame, got event for topic {:?}",
                        event.topic
                    ))),
                };
            }
            match stream.next().await {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(err)) => return Err(err.into()),
                None => {
                    return Err(RealtimeError::Protocol(
                        "stream ended before connect frame".into(),
                    ))
                }
            }
        }
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(RealtimeError::Transport(format!(
            "connect timed out after {timeout:?}"
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_loop(
    mut stream: ByteStream,
    mut decoder: SseDecoder,
    mut client_id: String,
    config: &RealtimeConfig,
    registry: &SubscriptionRegistry,
    state: &ConnectionStateCell,
    sync: &TopicSync,
    frame_tx: &mpsc::Sender<TaggedFrame>,
    cmd_rx: &mut mpsc::Receiver<Command>,
) -> StreamExit {
    let mut debounce = SyncDebounce::new(config.sync_debounce);
    let mut idle_deadline = registry
        .is_empty()
        .then(|| Instant::now() + config.idle_grace);

    loop {
        // Forward everything already framed before blocking again.
        while let Some(frame) = decoder.next_frame() {
            if frame.event == CONNECT_EVENT {
                match decode_message(&frame) {
                    Ok(ServerMessage::Connect {
                        client_id: reassigned,
                    }) => {
                        if reassigned != client_id {
                            tracing::debug!(old = %client_id, new = %reassigned, "server reassigned client id");
                            state.enter_streaming(reassigned.clone());
                            if let Err(err) = sync.push(&reassigned, &registry.snapshot()).await {
                                return StreamExit::Fault(err);
                            }
                            client_id = reassigned;
                        }
                    }
                    Ok(ServerMessage::Change(_)) => {}
                    Err(err) => return StreamExit::Fault(err),
                }
            } else {
                let tagged = TaggedFrame {
                    client_id: client_id.clone(),
                    frame,
                };
                if frame_tx.send(tagged).await.is_err() {
                    // Dispatcher is gone, the client is being torn down.
                    return StreamExit::Shutdown;
                }
            }
        }

        let sync_at = debounce
            .deadline()
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        let idle_at = idle_deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE);

        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(err)) => return StreamExit::Fault(err.into()),
                None => return StreamExit::Fault(RealtimeError::Transport(
                    "event stream closed by server".into(),
                )),
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::TopicsChanged) => {
                    debounce.arm();
                    idle_deadline = registry
                        .is_empty()
                        .then(|| Instant::now() + config.idle_grace);
                }
                Some(Command::Shutdown) | None => return StreamExit::Shutdown,
            },
            _ = sleep_until(sync_at), if debounce.is_armed() => {
                debounce.clear();
                if let Err(err) = sync.push(&client_id, &registry.snapshot()).await {
                    return StreamExit::Fault(err);
                }
            }
            _ = sleep_until(idle_at), if idle_deadline.is_some() => {
                if registry.is_empty() {
                    tracing::debug!("no subscriptions left, closing realtime stream");
                    return StreamExit::Drained;
                }
                idle_deadline = None;
            }
        }
    }
}

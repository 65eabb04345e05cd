use crate::error::{Error, Operation, Result};
use crate::signaling::protocol::{IncomingMessage, OutgoingMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use url::Url;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Открывает текстовый дуплекс к сигнальному серверу
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, local_id: &str) -> Result<(FrameSink, FrameStream)>;
}

/// WebSocket dialer для `{base}/{local_id}`
pub struct WsDialer {
    base: Url,
}

impl WsDialer {
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base)?;
        if !matches!(base.scheme(), "ws" | "wss") {
            return Err(Error::InvalidConfig(format!("not a WebSocket URL: {base}")));
        }
        Ok(Self { base })
    }

    pub fn endpoint(&self, local_id: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), local_id)
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, local_id: &str) -> Result<(FrameSink, FrameStream)> {
        let endpoint = self.endpoint(local_id);
        debug!("Connecting to signaling server: {}", endpoint);
        let (ws, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| Error::TransportUnavailable(format!("{endpoint}: {e}")))?;
        info!("Connected to signaling server");

        let (write, read) = ws.split();
        let sink = write
            .sink_map_err(Error::from)
            .with(|text: String| async move { Ok::<_, Error>(Message::Text(text)) });

        let stream = futures::stream::unfold(read, |mut read| async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => return Some((Ok(text), read)),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => return Some((Ok(text), read)),
                        Err(_) => warn!("Ignoring non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!("WebSocket closed by server: {:?}", frame);
                        return None;
                    }
                    // ping/pong обрабатывает tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Some((Err(Error::from(e)), read)),
                    None => return None,
                }
            }
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Лимиты переподключения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportState {
    Connecting,
    Open,
    Closed,
}

/// Сырые события задач соединения
#[derive(Debug)]
pub enum TransportEvent {
    Opened {
        epoch: u64,
        outbound: mpsc::UnboundedSender<String>,
    },
    OpenFailed {
        epoch: u64,
        error: Error,
    },
    Frame {
        epoch: u64,
        text: String,
    },
    Closed {
        epoch: u64,
        reason: Option<String>,
    },
    ReconnectDue {
        epoch: u64,
    },
}

impl TransportEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            TransportEvent::Opened { epoch, .. }
            | TransportEvent::OpenFailed { epoch, .. }
            | TransportEvent::Frame { epoch, .. }
            | TransportEvent::Closed { epoch, .. }
            | TransportEvent::ReconnectDue { epoch } => *epoch,
        }
    }
}

pub type TransportHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// На что владелец должен отреагировать
#[derive(Debug)]
pub enum TransportNotice {
    Opened { reconnected: bool },
    Message(IncomingMessage),
    Reconnecting { attempt: u32, delay: Duration },
    /// Соединение закрыто окончательно
    Abandoned { error: Error },
}

pub struct SignalingConnection {
    id: u64,
    local_id: String,
    dialer: Arc<dyn Dialer>,
    handler: TransportHandler,
    policy: ReconnectPolicy,
    open_timeout: Duration,
    state: TransportState,
    epoch: u64,
    ever_opened: bool,
    retry_count: u32,
    next_retry_at: Option<DateTime<Utc>>,
    pending: VecDeque<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl SignalingConnection {
    /// Начинает dial; результат придёт событием `Opened` или `OpenFailed`
    pub fn open(
        local_id: &str,
        dialer: Arc<dyn Dialer>,
        handler: TransportHandler,
        policy: ReconnectPolicy,
        open_timeout: Duration,
    ) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let mut conn = Self {
            id,
            local_id: local_id.to_string(),
            dialer,
            handler,
            policy,
            open_timeout,
            state: TransportState::Connecting,
            epoch: 0,
            ever_opened: false,
            retry_count: 0,
            next_retry_at: None,
            pending: VecDeque::new(),
            outbound: None,
            task: None,
            timer: None,
        };
        conn.dial();
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransportState::Open
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    /// Сообщения в ожидании открытия
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    pub fn send(&mut self, message: &OutgoingMessage) {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(conn = self.id, "failed to encode {}: {e}", message.kind());
                return;
            }
        };
        match self.state {
            TransportState::Closed => {
                debug!(conn = self.id, "dropping {} on closed transport", message.kind());
            }
            TransportState::Connecting => {
                debug!(conn = self.id, "queueing {} until open", message.kind());
                self.pending.push_back(text);
            }
            TransportState::Open => {
                let delivered = self
                    .outbound
                    .as_ref()
                    .is_some_and(|out| out.send(text).is_ok());
                if delivered {
                    debug!(conn = self.id, "sent {}", message.kind());
                } else {
                    debug!(conn = self.id, "writer gone, {} lost", message.kind());
                }
            }
        }
    }

    /// Дописывает отправленное и закрывает; отменяет запланированный reconnect
    pub fn close(&mut self) {
        if self.state == TransportState::Closed {
            return;
        }
        let was_open = self.state == TransportState::Open;
        self.state = TransportState::Closed;
        self.pending.clear();
        self.next_retry_at = None;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // writer дописывает очередь и закрывает сокет сам
        self.outbound = None;
        if let Some(task) = self.task.take() {
            if !was_open {
                task.abort();
            }
        }
        info!(conn = self.id, "signaling connection closed");
    }

    pub fn handle_event(&mut self, event: TransportEvent) -> Option<TransportNotice> {
        if self.state == TransportState::Closed || event.epoch() != self.epoch {
            debug!(conn = self.id, epoch = event.epoch(), "stale transport event dropped");
            return None;
        }
        match event {
            TransportEvent::Opened { outbound, .. } => {
                let reconnected = self.ever_opened;
                self.ever_opened = true;
                self.state = TransportState::Open;
                self.retry_count = 0;
                self.next_retry_at = None;
                if reconnected {
                    // адресованы прошлой серверной сессии
                    if !self.pending.is_empty() {
                        debug!(conn = self.id, dropped = self.pending.len(), "discarding messages queued while reconnecting");
                    }
                    self.pending.clear();
                }
                for text in self.pending.drain(..) {
                    let _ = outbound.send(text);
                }
                self.outbound = Some(outbound);
                info!(conn = self.id, epoch = self.epoch, reconnected, "signaling connection open");
                Some(TransportNotice::Opened { reconnected })
            }
            TransportEvent::OpenFailed { error, .. } => {
                self.task = None;
                if !self.ever_opened {
                    warn!(conn = self.id, "initial signaling connect failed: {error}");
                    self.state = TransportState::Closed;
                    self.pending.clear();
                    return Some(TransportNotice::Abandoned { error });
                }
                warn!(conn = self.id, "signaling reconnect failed: {error}");
                if !error.is_retryable() {
                    self.state = TransportState::Closed;
                    self.pending.clear();
                    self.next_retry_at = None;
                    return Some(TransportNotice::Abandoned { error });
                }
                Some(self.schedule_reconnect(error.to_string()))
            }
            TransportEvent::Frame { text, .. } => match IncomingMessage::parse(&text) {
                Ok(message) => {
                    debug!(conn = self.id, "received {}", message.kind());
                    Some(TransportNotice::Message(message))
                }
                Err(e) => {
                    warn!(conn = self.id, "{e}");
                    None
                }
            },
            TransportEvent::Closed { reason, .. } => {
                self.task = None;
                self.outbound = None;
                let reason = reason.unwrap_or_else(|| "connection closed by server".into());
                warn!(conn = self.id, "signaling connection lost: {reason}");
                Some(self.schedule_reconnect(reason))
            }
            TransportEvent::ReconnectDue { .. } => {
                self.timer = None;
                info!(conn = self.id, attempt = self.retry_count, "reconnecting to signaling server");
                self.dial();
                None
            }
        }
    }

    fn schedule_reconnect(&mut self, reason: String) -> TransportNotice {
        if self.retry_count >= self.policy.max_attempts {
            self.state = TransportState::Closed;
            self.pending.clear();
            self.next_retry_at = None;
            return TransportNotice::Abandoned {
                error: Error::TransportUnavailable(format!(
                    "gave up after {} reconnect attempts: {reason}",
                    self.retry_count
                )),
            };
        }
        self.retry_count += 1;
        self.state = TransportState::Connecting;
        let delay = self.policy.delay;
        let offset = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.next_retry_at = Some(Utc::now() + offset);

        let handler = self.handler.clone();
        let epoch = self.epoch;
        if let Some(old) = self.timer.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handler(TransportEvent::ReconnectDue { epoch });
        })) {
            old.abort();
        }
        TransportNotice::Reconnecting {
            attempt: self.retry_count,
            delay,
        }
    }

    fn dial(&mut self) {
        self.epoch = NEXT_EPOCH.fetch_add(1, Ordering::Relaxed);
        self.state = TransportState::Connecting;
        self.outbound = None;
        if let Some(old) = self.task.take() {
            old.abort();
        }
        let epoch = self.epoch;
        let dialer = self.dialer.clone();
        let handler = self.handler.clone();
        let local_id = self.local_id.clone();
        let limit = self.open_timeout;
        debug!(conn = self.id, epoch, "dialing signaling service");

        self.task = Some(tokio::spawn(async move {
            let (sink, stream) = match tokio::time::timeout(limit, dialer.dial(&local_id)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(error)) => {
                    handler(TransportEvent::OpenFailed { epoch, error });
                    return;
                }
                Err(_) => {
                    handler(TransportEvent::OpenFailed {
                        epoch,
                        error: Error::Timeout(Operation::TransportOpen, limit),
                    });
                    return;
                }
            };
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            handler(TransportEvent::Opened {
                epoch,
                outbound: out_tx,
            });
            pump(epoch, sink, stream, out_rx, handler).await;
        }));
    }
}

impl Drop for SignalingConnection {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Кадры по порядку в handler, исходящая очередь в sink
async fn pump(
    epoch: u64,
    mut sink: FrameSink,
    mut stream: FrameStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    handler: TransportHandler,
) {
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(text)) => handler(TransportEvent::Frame { epoch, text }),
                Some(Err(e)) => {
                    handler(TransportEvent::Closed { epoch, reason: Some(e.to_string()) });
                    return;
                }
                None => {
                    handler(TransportEvent::Closed { epoch, reason: None });
                    return;
                }
            },
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(text).await {
                        handler(TransportEvent::Closed { epoch, reason: Some(e.to_string()) });
                        return;
                    }
                }
                None => {
                    // владелец закрыл соединение
                    if let Err(e) = sink.close().await {
                        debug!("closing signaling sink: {e}");
                    }
                    return;
                }
            },
        }
    }
}

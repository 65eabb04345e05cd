use crate::error::{Error, Result};
use crate::media::LocalTrack;
use crate::peer::ice::CandidateSummary;
use crate::peer::types::{IceCandidate, LinkState, NegotiationRole, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Сигналы peer link для сессии
#[derive(Debug, Clone)]
pub enum PeerSignal {
    /// Локальное описание установлено, можно отправлять
    LocalDescription(SessionDescription),
    LocalCandidate(IceCandidate),
    GatheringComplete,
    StateChanged(LinkState),
    /// Шаг переговоров упал, link больше не годен
    Failed(String),
}

/// Колбэк, через который backend шлёт сигналы
pub type PeerHandler = Arc<dyn Fn(PeerSignal) + Send + Sync>;

/// Операции над peer connection для драйвера
#[async_trait]
pub trait PeerBackend: Send + Sync {
    async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Один backend на каждый peer link
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, handler: PeerHandler) -> Result<Arc<dyn PeerBackend>>;
}

#[derive(Debug)]
enum PeerOp {
    CreateOffer,
    AcceptOffer(SessionDescription),
    AcceptAnswer(SessionDescription),
    AddCandidate(IceCandidate),
}

type BackendSlot = Arc<Mutex<Option<Arc<dyn PeerBackend>>>>;

/// Одна эпоха переговоров с собеседником
pub struct PeerLink {
    id: u64,
    role: NegotiationRole,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    offer_requested: bool,
    local_sent: bool,
    pending_candidates: Vec<IceCandidate>,
    remote_seen: HashSet<IceCandidate>,
    remote_buffered: Vec<IceCandidate>,
    connection_state: LinkState,
    gathered: CandidateSummary,
    ops: mpsc::UnboundedSender<PeerOp>,
    driver: JoinHandle<()>,
    backend: BackendSlot,
}

impl PeerLink {
    /// Новый link; backend создаётся и получает треки до первой операции
    pub fn spawn<F>(
        role: NegotiationRole,
        factory: Arc<dyn PeerFactory>,
        tracks: Vec<LocalTrack>,
        make_handler: F,
    ) -> Self
    where
        F: FnOnce(u64) -> PeerHandler,
    {
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let handler = make_handler(id);
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let backend: BackendSlot = Arc::new(Mutex::new(None));
        let driver = tokio::spawn(drive(factory, tracks, handler, backend.clone(), ops_rx));
        debug!(link = id, %role, "peer link spawned");

        Self {
            id,
            role,
            local_description: None,
            remote_description: None,
            offer_requested: false,
            local_sent: false,
            pending_candidates: Vec::new(),
            remote_seen: HashSet::new(),
            remote_buffered: Vec::new(),
            connection_state: LinkState::New,
            gathered: CandidateSummary::default(),
            ops: ops_tx,
            driver,
            backend,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn connection_state(&self) -> LinkState {
        self.connection_state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    /// Уникальные удалённые кандидаты, применённые или в буфере
    pub fn remote_candidate_count(&self) -> usize {
        self.remote_seen.len()
    }

    pub fn gathered(&self) -> &CandidateSummary {
        &self.gathered
    }

    pub fn create_offer(&mut self) -> Result<()> {
        if self.role != NegotiationRole::Offerer {
            return Err(Error::Protocol("answerer cannot create an offer".into()));
        }
        if self.offer_requested {
            return Err(Error::Protocol("offer already requested on this link".into()));
        }
        self.offer_requested = true;
        self.submit(PeerOp::CreateOffer)
    }

    pub fn accept_offer(&mut self, offer: SessionDescription) -> Result<()> {
        if self.role != NegotiationRole::Answerer {
            return Err(Error::Protocol("offerer received an offer".into()));
        }
        if offer.kind != SdpKind::Offer {
            return Err(Error::Protocol("expected an offer description".into()));
        }
        self.set_remote(offer.clone())?;
        self.submit(PeerOp::AcceptOffer(offer))?;
        self.drain_remote_buffer()
    }

    pub fn accept_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.role != NegotiationRole::Offerer {
            return Err(Error::Protocol("answerer received an answer".into()));
        }
        if answer.kind != SdpKind::Answer {
            return Err(Error::Protocol("expected an answer description".into()));
        }
        if self.local_description.is_none() {
            return Err(Error::Protocol("answer arrived before the offer was sent".into()));
        }
        self.set_remote(answer.clone())?;
        self.submit(PeerOp::AcceptAnswer(answer))?;
        self.drain_remote_buffer()
    }

    /// `false` для дубликата
    pub fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<bool> {
        if !self.remote_seen.insert(candidate.clone()) {
            debug!(link = self.id, "duplicate remote candidate ignored");
            return Ok(false);
        }
        if self.remote_description.is_some() {
            self.submit(PeerOp::AddCandidate(candidate))?;
        } else {
            // кандидат пришёл раньше remote description
            self.remote_buffered.push(candidate);
        }
        Ok(true)
    }

    pub fn on_local_description(&mut self, desc: SessionDescription) -> Result<()> {
        if self.local_description.is_some() {
            return Err(Error::Protocol("local description already set".into()));
        }
        self.local_description = Some(desc);
        Ok(())
    }

    pub fn mark_local_sent(&mut self) {
        self.local_sent = true;
    }

    pub fn push_local_candidate(&mut self, candidate: IceCandidate) {
        self.gathered.record(&candidate);
        self.pending_candidates.push(candidate);
    }

    /// Кандидаты к отправке, в порядке обнаружения
    pub fn take_flushable(&mut self, transport_open: bool) -> Vec<IceCandidate> {
        if !(transport_open && self.local_sent) {
            return Vec::new();
        }
        std::mem::take(&mut self.pending_candidates)
    }

    /// `true`, если состояние действительно сменилось
    pub fn set_connection_state(&mut self, state: LinkState) -> bool {
        if self.connection_state == state {
            return false;
        }
        debug!(link = self.id, from = ?self.connection_state, to = ?state, "peer link state");
        self.connection_state = state;
        true
    }

    pub fn close(self) {
        drop(self);
    }

    fn set_remote(&mut self, desc: SessionDescription) -> Result<()> {
        if self.remote_description.is_some() {
            return Err(Error::Protocol("remote description already set".into()));
        }
        self.remote_description = Some(desc);
        Ok(())
    }

    fn drain_remote_buffer(&mut self) -> Result<()> {
        for candidate in std::mem::take(&mut self.remote_buffered) {
            self.submit(PeerOp::AddCandidate(candidate))?;
        }
        Ok(())
    }

    fn submit(&self, op: PeerOp) -> Result<()> {
        self.ops
            .send(op)
            .map_err(|_| Error::NegotiationFailed("peer link driver stopped".into()))
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.driver.abort();
        let backend = self.backend.lock().ok().and_then(|mut slot| slot.take());
        if let Some(backend) = backend {
            let id = self.id;
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    if let Err(e) = backend.close().await {
                        warn!(link = id, "closing peer backend: {e}");
                    }
                });
            }
        }
        debug!(link = self.id, "peer link discarded");
    }
}

async fn drive(
    factory: Arc<dyn PeerFactory>,
    tracks: Vec<LocalTrack>,
    handler: PeerHandler,
    slot: BackendSlot,
    mut ops: mpsc::UnboundedReceiver<PeerOp>,
) {
    let backend = match factory.create(handler.clone()).await {
        Ok(b) => b,
        Err(e) => {
            handler(PeerSignal::Failed(format!("creating peer connection: {e}")));
            return;
        }
    };
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(backend.clone());
    }

    if let Err(e) = backend.attach_tracks(&tracks).await {
        handler(PeerSignal::Failed(format!("attaching local tracks: {e}")));
        return;
    }

    while let Some(op) = ops.recv().await {
        if let Err(e) = apply(backend.as_ref(), op, &handler).await {
            handler(PeerSignal::Failed(e.to_string()));
            return;
        }
    }
}

async fn apply(backend: &dyn PeerBackend, op: PeerOp, handler: &PeerHandler) -> Result<()> {
    match op {
        PeerOp::CreateOffer => {
            let offer = backend.create_offer().await?;
            backend.set_local_description(offer.clone()).await?;
            handler(PeerSignal::LocalDescription(offer));
        }
        PeerOp::AcceptOffer(offer) => {
            backend.set_remote_description(offer).await?;
            let answer = backend.create_answer().await?;
            backend.set_local_description(answer.clone()).await?;
            handler(PeerSignal::LocalDescription(answer));
        }
        PeerOp::AcceptAnswer(answer) => {
            backend.set_remote_description(answer).await?;
        }
        PeerOp::AddCandidate(candidate) => {
            backend.add_ice_candidate(candidate).await?;
        }
    }
    Ok(())
}

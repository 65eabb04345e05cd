use crate::config::ClientConfig;
use crate::error::{Error, Operation, Result};
use crate::session::machine::{Backends, Command, Event, Session};
use crate::session::state::{Phase, SessionStatus};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Клонируемый фасад актора сессии; актор останавливается вместе с последним клоном
#[derive(Clone)]
pub struct SessionHandle {
    local_id: String,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Запускает актор на текущем tokio runtime
    pub fn spawn(local_id: impl Into<String>, config: ClientConfig, backends: Backends) -> Self {
        let local_id = local_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(local_id.clone(), config, backends, tx.downgrade());
        let (status_tx, status_rx) = watch::channel(session.status());
        tokio::spawn(run(session, rx, status_tx));
        Self {
            local_id,
            events: tx,
            status: status_rx,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Пустой номер означает новую комнату
    pub fn join(&self, room_id: &str) -> Result<()> {
        self.command(Command::Join {
            room_id: room_id.to_string(),
        })
    }

    pub fn leave(&self) -> Result<()> {
        self.command(Command::Leave)
    }

    pub fn force_reset(&self, reason: &str) -> Result<()> {
        self.command(Command::ForceReset {
            reason: reason.to_string(),
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub async fn wait_for<F>(&self, mut predicate: F, limit: Duration) -> Result<SessionStatus>
    where
        F: FnMut(&SessionStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let outcome = match tokio::time::timeout(limit, rx.wait_for(|s| predicate(s))).await {
            Ok(Ok(status)) => Ok(status.clone()),
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => Err(Error::Timeout(Operation::SessionWait, limit)),
        };
        outcome
    }

    pub async fn wait_for_phase(&self, phase: Phase, limit: Duration) -> Result<SessionStatus> {
        self.wait_for(|s| s.phase == phase, limit).await
    }

    fn command(&self, command: Command) -> Result<()> {
        self.events
            .send(Event::Command(command))
            .map_err(|_| Error::SessionClosed)
    }
}

async fn run(
    mut session: Session,
    mut events: mpsc::UnboundedReceiver<Event>,
    status: watch::Sender<SessionStatus>,
) {
    while let Some(event) = events.recv().await {
        session.handle(event);
        publish(&status, session.status());
    }
    session.shutdown();
    publish(&status, session.status());
    debug!("session actor stopped");
}

fn publish(status: &watch::Sender<SessionStatus>, snapshot: SessionStatus) {
    status.send_if_modified(|current| {
        if *current == snapshot {
            return false;
        }
        *current = snapshot;
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackMediaSource;
    use crate::peer::connection::RtcPeerFactory;
    use crate::signaling::transport::{Dialer, FrameSink, FrameStream};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Unreachable;

    #[async_trait]
    impl Dialer for Unreachable {
        async fn dial(&self, _local_id: &str) -> Result<(FrameSink, FrameStream)> {
            Err(Error::TransportUnavailable("no route".into()))
        }
    }

    fn spawn(permission: bool) -> SessionHandle {
        let backends = Backends {
            dialer: Arc::new(Unreachable),
            media: Arc::new(TrackMediaSource::default().with_permission(permission)),
            peers: Arc::new(RtcPeerFactory::new(Vec::new())),
        };
        SessionHandle::spawn("alice", ClientConfig::default(), backends)
    }

    #[tokio::test]
    async fn test_failed_attempt_allows_a_fresh_join() {
        let session = spawn(false);
        assert_eq!(session.status().phase, Phase::Idle);
        session.leave().unwrap();

        session.join("abcd").unwrap();
        let failed = session.wait_for_phase(Phase::Failed, Duration::from_secs(2)).await.unwrap();
        assert!(failed.status_message.contains("permission"));
        assert_eq!(failed.room_id.as_deref(), Some("ABCD"));

        session.join("abcd").unwrap();
        let again = session
            .wait_for(|s| s.attempt == 2 && s.phase == Phase::Failed, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(again.is_released());
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_attempt() {
        let session = spawn(true);
        session.join("ABCD").unwrap();
        let failed = session.wait_for_phase(Phase::Failed, Duration::from_secs(2)).await.unwrap();
        assert!(failed.status_message.contains("no route"));
        assert!(!failed.media_held);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let session = spawn(true);
        let err = session
            .wait_for_phase(Phase::Connected, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(Operation::SessionWait, _)));
    }
}

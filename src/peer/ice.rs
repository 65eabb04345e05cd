use crate::error::{Error, Operation, Result};
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::{
    api::APIBuilder,
    ice_transport::{ice_gatherer_state::RTCIceGathererState, ice_server::RTCIceServer},
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

/// Счётчики собранных локальных кандидатов по типам
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

impl CandidateSummary {
    pub fn record(&mut self, candidate: &IceCandidate) {
        if candidate.candidate.contains("typ host") {
            self.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            self.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            self.relay += 1;
        }
    }

    pub fn log(&self) {
        info!(
            "Candidate analysis: {} host, {} srflx, {} relay",
            self.host, self.srflx, self.relay
        );
        if self.relay == 0 {
            warn!("No TURN relay candidates found! Connection through NAT may fail.");
        }
    }
}

/// Проверяет, выдаёт ли сервер кандидата своего типа (srflx для STUN, relay для TURN)
pub async fn check_ice_server_availability(config: &ServerConfig, limit: Duration) -> Result<bool> {
    let url = add_ice_url_scheme(config);
    debug!("Processed URL: '{}' -> '{}'", config.url, url);

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        }],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);
    let result = check_via_ice_gathering(&peer_connection, &config.r#type, limit).await;
    if let Err(e) = peer_connection.close().await {
        debug!("closing probe peer connection: {e}");
    }
    result
}

async fn check_via_ice_gathering(
    peer_connection: &Arc<RTCPeerConnection>,
    server_type: &str,
    limit: Duration,
) -> Result<bool> {
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {:?}", state);
        let _ = state_tx.send(state);
        Box::pin(async {})
    }));

    let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel();
    let wanted = if server_type == "turn" { "relay" } else { "srflx" };
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = candidate_tx.clone();
        Box::pin(async move {
            let Some(c) = candidate else {
                debug!("Received null candidate (gathering complete)");
                return;
            };
            match c.to_json() {
                Ok(json) if json.candidate.contains(wanted) => {
                    debug!("Found {} candidate: {}", wanted, json.candidate);
                    let _ = tx.send(());
                }
                Ok(json) => debug!("Candidate type mismatch: {}", json.candidate),
                Err(e) => debug!("Failed to get candidate JSON: {:?}", e),
            }
        })
    }));

    // data channel нужен только чтобы запустить сбор кандидатов
    peer_connection.create_data_channel("probe", None).await?;
    let offer = peer_connection.create_offer(None).await?;
    peer_connection.set_local_description(offer).await?;

    let gathering_done = async {
        while let Some(state) = state_rx.recv().await {
            if state == RTCIceGathererState::Complete {
                break;
            }
        }
    };

    let outcome = timeout(limit, async {
        let found = tokio::select! {
            found = candidate_rx.recv() => found.is_some(),
            _ = gathering_done => false,
        };
        // кандидат мог прийти одновременно с Complete
        found || candidate_rx.try_recv().is_ok()
    })
    .await;

    match outcome {
        Ok(found) => Ok(found),
        Err(_) => Err(Error::Timeout(Operation::IceCheck, limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_summary_counts_types() {
        let candidates = vec![
            IceCandidate::new("candidate:1 1 udp 2122260223 192.168.1.5 54321 typ host"),
            IceCandidate::new("candidate:2 1 udp 1686052607 203.0.113.7 54321 typ srflx raddr 192.168.1.5"),
            IceCandidate::new("candidate:3 1 udp 41885439 198.51.100.2 3478 typ relay raddr 203.0.113.7"),
            IceCandidate::new("candidate:4 1 tcp 1518280447 192.168.1.5 9 typ host tcptype active"),
        ];
        let mut summary = CandidateSummary::default();
        for candidate in &candidates {
            summary.record(candidate);
        }
        assert_eq!(
            summary,
            CandidateSummary {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }
}

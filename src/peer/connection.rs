use crate::config::DEFAULT_ICE_SERVERS;
use crate::error::{Error, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::LocalTrack;
use crate::peer::negotiation::{PeerBackend, PeerFactory, PeerHandler, PeerSignal};
use crate::peer::types::{IceCandidate, LinkState, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Создаёт peer link поверх webrtc-rs
pub struct RtcPeerFactory {
    ice_servers: Vec<ServerConfig>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, handler: PeerHandler) -> Result<Arc<dyn PeerBackend>> {
        let pc = new_peer(&self.ice_servers, handler).await?;
        Ok(Arc::new(RtcPeer { pc }))
    }
}

/// создаём Peer с аудио/видео кодеками и подписками на события
async fn new_peer(servers: &[ServerConfig], handler: PeerHandler) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(rtc_config(servers)).await?);

    let on_candidate = handler.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let handler = on_candidate.clone();
        Box::pin(async move {
            let Some(c) = cand else {
                // cand == None означает конец сбора
                debug!("ICE candidate gathering completed (null candidate received)");
                handler(PeerSignal::GatheringComplete);
                return;
            };
            match c.to_json() {
                Ok(init) => {
                    let candidate = IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    };
                    dump_candidate("LOCAL", &candidate);
                    handler(PeerSignal::LocalCandidate(candidate));
                }
                Err(e) => warn!("Failed to serialize local candidate: {:?}", e),
            }
        })
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    // слабая ссылка, чтобы обработчик не держал соединение живым
    let weak_pc = Arc::downgrade(&pc);
    let on_state = handler;
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection state changed to: {:?}", st);
        if st == RTCPeerConnectionState::Failed {
            if let Some(pc) = weak_pc.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        match LinkState::from_rtc(st) {
            Some(state) => on_state(PeerSignal::StateChanged(state)),
            None => debug!("Peer connection state: {:?} - ignoring", st),
        }
        Box::pin(async {})
    }));

    Ok(pc)
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = if servers.is_empty() {
        get_user_ice_servers(&DEFAULT_ICE_SERVERS)
    } else {
        get_user_ice_servers(servers)
    };

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    fn description(desc: &RTCSessionDescription) -> Result<SessionDescription> {
        SessionDescription::from_rtc(desc)
            .ok_or_else(|| Error::NegotiationFailed(format!("unexpected SDP type {}", desc.sdp_type)))
    }
}

#[async_trait]
impl PeerBackend for RtcPeer {
    async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<()> {
        for track in tracks {
            let sender = self.pc.add_track(track.as_track_local()).await?;
            debug!("Attached local {:?} track {}", track.kind(), track.id());
            // RTCP нужно вычитывать, иначе не работают interceptors
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Self::description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Self::description(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(desc.to_rtc()?)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("remote description rejected: {e}")))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("remote candidate rejected: {e}")))
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

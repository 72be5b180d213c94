//! webrtc-rs backed peer connection

use super::devices::{LocalTrack, TrackKind};
use super::peer::{
    Connectivity, NegotiationError, PeerConnection, PeerEvent, PeerFactory, PeerLink, RemoteTrack,
};
use crate::config::CallConfig;
use crate::signaling::{Candidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

fn webrtc_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::WebRTC(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, config: &CallConfig) -> Result<PeerLink, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.rtc_ice_servers(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            bundle_policy: if config.max_bundle {
                RTCBundlePolicy::MaxBundle
            } else {
                RTCBundlePolicy::Balanced
            },
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(webrtc_err)?);

        let (event_tx, events) = mpsc::unbounded_channel();
        setup_peer_connection_handlers(&pc, event_tx);

        Ok(PeerLink {
            connection: Arc::new(RtcPeer::new(pc)),
            events,
        })
    }
}

fn setup_peer_connection_handlers(
    pc: &Arc<RTCPeerConnection>,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
) {
    let tx = event_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(Candidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!("Cannot serialize local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let tx = event_tx.clone();
    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        tracing::info!("ICE connection state: {}", s);
        let connectivity = match s {
            RTCIceConnectionState::Checking => Some(Connectivity::Checking),
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                Some(Connectivity::Connected)
            }
            RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed => {
                Some(Connectivity::Lost)
            }
            _ => None,
        };
        if let Some(connectivity) = connectivity {
            let _ = tx.send(PeerEvent::Connectivity(connectivity));
        }
        Box::pin(async {})
    }));

    let tx = event_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {}", s);
        let connectivity = match s {
            RTCPeerConnectionState::Failed => Some(Connectivity::Failed),
            RTCPeerConnectionState::Closed => Some(Connectivity::Closed),
            _ => None,
        };
        if let Some(connectivity) = connectivity {
            let _ = tx.send(PeerEvent::Connectivity(connectivity));
        }
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        tracing::info!("Received {:?} track {}", kind, track.id());
        let _ = event_tx.send(PeerEvent::Track(RemoteTrack {
            id: track.id(),
            kind,
            stream_id: track.stream_id(),
            source: Some(Arc::clone(&track)),
        }));
        Box::pin(async {})
    }));
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<Uuid, (TrackKind, Arc<RTCRtpSender>)>>,
    receivers_added: AtomicBool,
}

impl RtcPeer {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            pc,
            senders: Mutex::new(HashMap::new()),
            receivers_added: AtomicBool::new(false),
        }
    }

    /// Receive-only transceivers for every kind not being sent, so the
    /// first offer already carries both audio and video
    async fn ensure_receivers(&self) -> Result<(), NegotiationError> {
        if self.receivers_added.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let sending: Vec<TrackKind> = self.senders.lock().values().map(|(kind, _)| *kind).collect();
        for (kind, codec_type) in [
            (TrackKind::Audio, RTPCodecType::Audio),
            (TrackKind::Video, RTPCodecType::Video),
        ] {
            if sending.contains(&kind) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    codec_type,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(webrtc_err)?;
        }
        Ok(())
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
        let result = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        };
        result.map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(
        &self,
        ice_restart: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        let options = if ice_restart {
            Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            })
        } else {
            self.ensure_receivers().await?;
            None
        };

        let offer = self.pc.create_offer(options).await.map_err(webrtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(webrtc_err)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let sender = self
            .pc
            .add_track(track.rtp() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;
        self.senders.lock().insert(track.id(), (track.kind(), sender));
        Ok(())
    }

    async fn replace_track(
        &self,
        current: &LocalTrack,
        replacement: &LocalTrack,
    ) -> Result<(), NegotiationError> {
        let sender = self
            .senders
            .lock()
            .get(&current.id())
            .map(|(_, sender)| Arc::clone(sender))
            .ok_or_else(|| NegotiationError::WebRTC("no sender carries this track".to_string()))?;

        sender
            .replace_track(Some(replacement.rtp() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(webrtc_err)?;

        let mut senders = self.senders.lock();
        senders.remove(&current.id());
        senders.insert(replacement.id(), (replacement.kind(), sender));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.senders.lock().clear();
        self.pc.close().await.map_err(webrtc_err)
    }
}

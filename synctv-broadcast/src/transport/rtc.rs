//! `webrtc-rs` backed transport
//!
//! Each transport owns one `RTCPeerConnection` with a video (VP8) and an
//! audio (Opus) sender attached up front, so composed tracks can be swapped
//! with `replace_track` without renegotiating.

use super::{
    IceCandidate, PeerTransport, SdpKind, SessionDescription, TransportEvent, TransportEventSender,
    TransportFactory, TransportState,
};
use crate::capture::{MediaTrack, SourceKind, TrackKind, TrackSettings};
use crate::config::IceConfig;
use crate::error::{Error, Result};
use crate::types::PeerId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Builds peer connections sharing one codec/interceptor setup
pub struct WebRtcTransportFactory {
    api: API,
    configuration: RTCConfiguration,
}

impl WebRtcTransportFactory {
    pub fn new(ice: &IceConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let configuration = RTCConfiguration {
            ice_servers: ice
                .servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        Ok(Self { api, configuration })
    }

    /// Open a peer connection with both senders attached
    pub async fn open(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: TransportEventSender,
    ) -> Result<WebRtcTransport> {
        let connection = Arc::new(
            self.api
                .new_peer_connection(self.configuration.clone())
                .await?,
        );

        let stream_id = format!("broadcast-{local}");
        let mut local_tracks = HashMap::new();
        let mut senders = HashMap::new();
        for (kind, mime_type) in [(TrackKind::Video, MIME_TYPE_VP8), (TrackKind::Audio, MIME_TYPE_OPUS)] {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                format!("{kind}-{local}"),
                stream_id.clone(),
            ));
            let sender = connection
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            local_tracks.insert(kind, track);
            senders.insert(kind, sender);
        }

        register_handlers(&connection, remote, events);

        debug!(local = %local, remote = %remote, "Created WebRTC peer connection");

        Ok(WebRtcTransport {
            connection,
            local_tracks,
            senders,
            attached: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        Ok(Arc::new(self.open(local, remote, events).await?))
    }
}

fn register_handlers(connection: &RTCPeerConnection, remote: &PeerId, events: TransportEventSender) {
    connection.on_ice_candidate({
        let events = events.clone();
        Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
                }
            }
            Box::pin(async {})
        })
    });

    connection.on_peer_connection_state_change({
        let events = events.clone();
        let remote = remote.clone();
        Box::new(move |state: RTCPeerConnectionState| {
            debug!(remote = %remote, state = %state, "Peer connection state changed");
            let _ = events.send(TransportEvent::StateChanged(TransportState::from(state)));
            Box::pin(async {})
        })
    });

    connection.on_track(Box::new(move |track, _receiver, _transceiver| {
        let received = MediaTrack::new(
            TrackKind::from(track.kind()),
            SourceKind::Remote,
            track.id(),
            TrackSettings::default(),
        );
        let _ = events.send(TransportEvent::RemoteTrack(received));
        Box::pin(async {})
    }));
}

/// One `RTCPeerConnection`
pub struct WebRtcTransport {
    connection: Arc<RTCPeerConnection>,
    local_tracks: HashMap<TrackKind, Arc<TrackLocalStaticSample>>,
    senders: HashMap<TrackKind, Arc<RTCRtpSender>>,
    /// Composed track currently bound to each sender
    attached: Mutex<HashMap<TrackKind, MediaTrack>>,
}

impl WebRtcTransport {
    /// Local sample track of `kind`, for feeding encoded media
    #[must_use]
    pub fn local_track(&self, kind: TrackKind) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.get(&kind).cloned()
    }

    /// Composed track currently bound to the `kind` sender
    #[must_use]
    pub fn attached(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.attached.lock().get(&kind).cloned()
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    converted.map_err(|e| Error::NegotiationFailed(e.to_string()))
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| Error::NegotiationFailed(e.to_string()))?;
        self.connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| Error::NegotiationFailed(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| Error::NegotiationFailed(e.to_string()))?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| Error::NegotiationFailed(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc(description)?;
        self.connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::NegotiationFailed(e.to_string()))
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| Error::NegotiationFailed(e.to_string()))
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<MediaTrack>) -> Result<()> {
        let Some(sender) = self.senders.get(&kind) else {
            return Err(Error::Transport(format!("no {kind} sender")));
        };
        let local = track.as_ref().and_then(|_| self.local_tracks.get(&kind)).map(|t| {
            Arc::clone(t) as Arc<dyn TrackLocal + Send + Sync>
        });
        sender.replace_track(local).await?;

        let mut attached = self.attached.lock();
        match track {
            Some(track) => {
                attached.insert(kind, track);
            }
            None => {
                attached.remove(&kind);
            }
        }
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        match self.connection.connection_state() {
            RTCPeerConnectionState::Connected => Ok(()),
            state => Err(Error::TransportLost(format!("peer connection is {state}"))),
        }
    }

    async fn close(&self) -> Result<()> {
        self.attached.lock().clear();
        self.connection.close().await?;
        Ok(())
    }
}

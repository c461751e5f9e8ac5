//! Simulated platform — an in-process peer connection and capture devices.
//!
//! `SimulatedPeerConnection` follows the JSEP signaling-state rules, produces
//! real SDP and trickles host candidates, and reports `connected` once both
//! descriptions are applied and a remote candidate has been accepted. It
//! shares nothing with the remote side, so two processes talking through the
//! WebSocket relay can complete a call with it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ice::{self, IceServerConfig};
use super::media::{LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaError, TrackKind, TrackSource};
use super::peer::{
    ConnectionState, IceCandidateInit, OfferOptions, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent,
    RemoteTrack, SdpType, SenderId, SessionDescription, SignalingState,
};
use super::sdp::{self, MediaLine, SdpSummary, SessionParams};

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Delay applied to every asynchronous peer operation.
    pub op_delay: Duration,
    /// Delay between `connecting` and `connected`.
    pub connect_delay: Duration,
    /// Host addresses advertised as candidates.
    pub host_addrs: Vec<IpAddr>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            op_delay: Duration::ZERO,
            connect_delay: Duration::from_millis(20),
            host_addrs: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        }
    }
}

struct SimSender {
    kind: TrackKind,
    mid: String,
    track: Option<LocalTrack>,
}

struct SimState {
    signaling: SignalingState,
    connection: ConnectionState,
    senders: Vec<SimSender>,
    session: Option<SessionParams>,
    stream_id: String,
    local: Option<SessionDescription>,
    remote: Option<SdpSummary>,
    gathering_started: bool,
    remote_candidates: Vec<String>,
    closed: bool,
}

#[derive(Default)]
struct SimStats {
    offers_created: AtomicUsize,
    closes: AtomicUsize,
    replacements: AtomicUsize,
}

pub struct SimulatedPeerConnection {
    config: SimConfig,
    state: Arc<Mutex<SimState>>,
    stats: SimStats,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl SimulatedPeerConnection {
    pub fn new(config: SimConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            state: Arc::new(Mutex::new(SimState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                senders: Vec::new(),
                session: None,
                stream_id: format!("stream-{}", uuid::Uuid::new_v4().simple()),
                local: None,
                remote: None,
                gathering_started: false,
                remote_candidates: Vec::new(),
                closed: false,
            })),
            stats: SimStats::default(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    async fn op_delay(&self) {
        if !self.config.op_delay.is_zero() {
            tokio::time::sleep(self.config.op_delay).await;
        }
    }

    fn check_open(&self) -> Result<MutexGuard<'_, SimState>, PeerError> {
        let state = lock(&self.state);
        if state.closed {
            return Err(PeerError::Closed);
        }
        Ok(state)
    }

    fn media_lines(state: &SimState, mids_from: Option<&SdpSummary>) -> Vec<MediaLine> {
        let track_line = |sender: &SimSender, mid: String| MediaLine {
            kind: sender.kind,
            mid,
            msid: sender
                .track
                .as_ref()
                .map(|t| (state.stream_id.clone(), t.id().to_string())),
            display_surface: sender
                .track
                .as_ref()
                .and_then(|t| t.display_surface().map(str::to_string)),
        };
        match mids_from {
            // Answer: mirror the offer's sections, attaching our sender of the same kind.
            Some(remote) => remote
                .sections
                .iter()
                .map(|section| match state.senders.iter().find(|s| s.mid == section.mid && s.kind == section.kind) {
                    Some(sender) => track_line(sender, section.mid.clone()),
                    None => MediaLine {
                        kind: section.kind,
                        mid: section.mid.clone(),
                        msid: None,
                        display_surface: None,
                    },
                })
                .collect(),
            None => state.senders.iter().map(|s| track_line(s, s.mid.clone())).collect(),
        }
    }

    fn start_gathering(&self, state: &mut SimState) {
        if state.gathering_started {
            return;
        }
        state.gathering_started = true;
        let Some(first_mid) = state.senders.first().map(|s| s.mid.clone()) else {
            return;
        };
        let base_port = 40000 + (uuid::Uuid::new_v4().as_u128() % 20000) as u16;
        let addrs: Vec<SocketAddr> = self
            .config
            .host_addrs
            .iter()
            .enumerate()
            .map(|(i, ip)| SocketAddr::new(*ip, base_port + i as u16 * 2))
            .collect();
        let candidates = ice::gather_host_candidates(&addrs);
        let tx = self.events_tx.clone();
        let shared = self.state.clone();
        tokio::spawn(async move {
            for candidate in candidates {
                if lock(&shared).closed {
                    return;
                }
                let init = IceCandidateInit::new(candidate.to_sdp_line(), Some(first_mid.clone()), Some(0));
                let _ = tx.send(PeerEvent::IceCandidate(Some(init)));
                tokio::task::yield_now().await;
            }
            if !lock(&shared).closed {
                let _ = tx.send(PeerEvent::IceCandidate(None));
            }
        });
    }

    /// Move towards `connected` once both descriptions and a remote candidate exist.
    fn try_connect(&self, state: &mut SimState) {
        if state.connection != ConnectionState::New
            || state.signaling != SignalingState::Stable
            || state.local.is_none()
            || state.remote.is_none()
            || state.remote_candidates.is_empty()
        {
            return;
        }
        state.connection = ConnectionState::Connecting;
        let _ = self.events_tx.send(PeerEvent::ConnectionState(ConnectionState::Connecting));

        let tracks: Vec<RemoteTrack> = state
            .remote
            .iter()
            .flat_map(|r| r.sections.iter())
            .filter_map(|s| {
                s.track_id.as_ref().map(|id| RemoteTrack {
                    id: id.clone(),
                    kind: s.kind,
                    mid: s.mid.clone(),
                    display_surface: s.display_surface.clone(),
                })
            })
            .collect();
        let tx = self.events_tx.clone();
        let shared = self.state.clone();
        let delay = self.config.connect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = lock(&shared);
                if state.closed || state.connection != ConnectionState::Connecting {
                    return;
                }
                state.connection = ConnectionState::Connected;
            }
            let _ = tx.send(PeerEvent::ConnectionState(ConnectionState::Connected));
            for track in tracks {
                let _ = tx.send(PeerEvent::Track(track));
            }
        });
    }

    // ---- Diagnostics ----

    #[cfg(test)]
    pub fn offers_created(&self) -> usize {
        self.stats.offers_created.load(Ordering::SeqCst)
    }

    /// Number of times the connection was actually closed (0 or 1).
    #[cfg(test)]
    pub fn closes(&self) -> usize {
        self.stats.closes.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn replacements(&self) -> usize {
        self.stats.replacements.load(Ordering::SeqCst)
    }

    /// Remote candidates applied, in application order.
    #[cfg(test)]
    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.state).remote_candidates.clone()
    }

    #[cfg(test)]
    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.state).connection
    }

    /// Track currently on the sender with the given kind.
    #[cfg(test)]
    pub fn sender_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        lock(&self.state)
            .senders
            .iter()
            .find(|s| s.kind == kind)
            .and_then(|s| s.track.clone())
    }

    /// Simulate the network dropping: the transport reports `state`.
    #[cfg(test)]
    pub fn drop_transport(&self, state: ConnectionState) {
        {
            let mut s = lock(&self.state);
            if s.closed {
                return;
            }
            s.connection = state;
        }
        tracing::debug!("Simulated transport -> {}", state);
        let _ = self.events_tx.send(PeerEvent::ConnectionState(state));
    }
}

#[async_trait]
impl PeerConnection for SimulatedPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    fn add_sender(&self, kind: TrackKind, track: Option<&LocalTrack>) -> Result<SenderId, PeerError> {
        let mut state = self.check_open()?;
        let id = state.senders.len();
        state.senders.push(SimSender {
            kind,
            mid: id.to_string(),
            track: track.cloned(),
        });
        Ok(SenderId(id))
    }

    fn sender_mid(&self, sender: SenderId) -> Option<String> {
        lock(&self.state).senders.get(sender.0).map(|s| s.mid.clone())
    }

    async fn replace_track(&self, sender: SenderId, track: Option<LocalTrack>) -> Result<(), PeerError> {
        self.op_delay().await;
        let mut state = self.check_open()?;
        let slot = state.senders.get_mut(sender.0).ok_or(PeerError::UnknownSender(sender))?;
        if let Some(t) = &track {
            if t.kind() != slot.kind {
                return Err(PeerError::InvalidDescription(format!(
                    "cannot put a {:?} track on a {:?} sender",
                    t.kind(),
                    slot.kind
                )));
            }
        }
        slot.track = track;
        self.stats.replacements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, PeerError> {
        self.op_delay().await;
        let mut state = self.check_open()?;
        if !matches!(state.signaling, SignalingState::Stable | SignalingState::HaveLocalOffer) {
            return Err(PeerError::InvalidState(state.signaling));
        }
        // Receive-only slots for kinds we asked to receive but send nothing on.
        for (wanted, kind) in [
            (options.offer_to_receive_audio, TrackKind::Audio),
            (options.offer_to_receive_video, TrackKind::Video),
        ] {
            if wanted && !state.senders.iter().any(|s| s.kind == kind) {
                let mid = state.senders.len().to_string();
                state.senders.push(SimSender { kind, mid, track: None });
            }
        }
        if state.session.is_none() {
            state.session =
                Some(SessionParams::generate("actpass").map_err(|e| PeerError::Unavailable(e.to_string()))?);
        }
        let lines = Self::media_lines(&state, None);
        let Some(params) = state.session.as_ref() else {
            return Err(PeerError::Unavailable("no session parameters".into()));
        };
        let sdp = sdp::build_description(params, &lines).map_err(|e| PeerError::InvalidDescription(e.to_string()))?;
        self.stats.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.op_delay().await;
        let mut state = self.check_open()?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(PeerError::InvalidState(state.signaling));
        }
        if state.session.is_none() {
            state.session =
                Some(SessionParams::generate("active").map_err(|e| PeerError::Unavailable(e.to_string()))?);
        }
        let remote = state.remote.clone().ok_or(PeerError::NoRemoteDescription)?;
        let lines = Self::media_lines(&state, Some(&remote));
        let Some(params) = state.session.as_ref() else {
            return Err(PeerError::Unavailable("no session parameters".into()));
        };
        let sdp = sdp::build_description(params, &lines).map_err(|e| PeerError::InvalidDescription(e.to_string()))?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.op_delay().await;
        sdp::parse_description(&desc.sdp).map_err(|e| PeerError::InvalidDescription(format!("{:#}", e)))?;
        let mut state = self.check_open()?;
        state.signaling = match (desc.kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (_, current) => return Err(PeerError::InvalidState(current)),
        };
        state.local = Some(desc);
        self.start_gathering(&mut state);
        self.try_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.op_delay().await;
        let summary =
            sdp::parse_description(&desc.sdp).map_err(|e| PeerError::InvalidDescription(format!("{:#}", e)))?;
        let mut state = self.check_open()?;
        state.signaling = match (desc.kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                // Adopt the offer's mids for senders of matching kind.
                for section in &summary.sections {
                    if let Some(sender) = state.senders.iter_mut().find(|s| s.kind == section.kind) {
                        sender.mid = section.mid.clone();
                    }
                }
                SignalingState::HaveRemoteOffer
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (_, current) => return Err(PeerError::InvalidState(current)),
        };
        tracing::debug!(
            "Applied remote {:?} (ice-ufrag {}, {} media sections)",
            desc.kind,
            summary.ice_ufrag,
            summary.sections.len()
        );
        state.remote = Some(summary);
        self.try_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        self.op_delay().await;
        let mut state = self.check_open()?;
        if state.remote.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        if candidate.is_end_of_candidates() {
            return Ok(());
        }
        ice::parse_candidate(&candidate.candidate).map_err(|e| PeerError::InvalidCandidate(format!("{:#}", e)))?;
        state.remote_candidates.push(candidate.candidate);
        self.try_connect(&mut state);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        state.signaling = SignalingState::Closed;
        state.connection = ConnectionState::Closed;
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Simulated peer connection closed");
    }
}

/// Factory that keeps every connection it built, for inspection.
#[derive(Default)]
pub struct SimulatedPeerFactory {
    config: SimConfig,
    created: Mutex<Vec<Arc<SimulatedPeerConnection>>>,
    unavailable: Option<String>,
}

impl SimulatedPeerFactory {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// A factory whose `create` always fails.
    #[cfg(test)]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn last(&self) -> Option<Arc<SimulatedPeerConnection>> {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).last().cloned()
    }

    #[cfg(test)]
    pub fn created(&self) -> usize {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl PeerConnectionFactory for SimulatedPeerFactory {
    fn create(&self, ice_servers: &[IceServerConfig]) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if let Some(reason) = &self.unavailable {
            return Err(PeerError::Unavailable(reason.clone()));
        }
        for server in ice_servers {
            server.validate().map_err(|e| PeerError::Unavailable(format!("{:#}", e)))?;
        }
        tracing::debug!("Creating simulated peer connection ({} ICE servers)", ice_servers.len());
        let pc = Arc::new(SimulatedPeerConnection::new(self.config.clone()));
        self.created.lock().unwrap_or_else(|e| e.into_inner()).push(pc.clone());
        Ok(pc)
    }
}

// ---- Devices ----

/// Outcome of asking for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAvailability {
    Available,
    Missing,
    Denied,
    Busy,
    Unsupported,
}

impl DeviceAvailability {
    fn check(self) -> Result<(), MediaError> {
        match self {
            DeviceAvailability::Available => Ok(()),
            DeviceAvailability::Missing => Err(MediaError::NotFound),
            DeviceAvailability::Denied => Err(MediaError::PermissionDenied),
            DeviceAvailability::Busy => Err(MediaError::InUse),
            DeviceAvailability::Unsupported => Err(MediaError::NotSupported),
        }
    }
}

pub struct SimulatedDevices {
    camera: DeviceAvailability,
    microphone: DeviceAvailability,
    screen: DeviceAvailability,
    display_surface: String,
    capture_delay: Duration,
    issued: Mutex<Vec<LocalTrack>>,
}

impl Default for SimulatedDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevices {
    pub fn new() -> Self {
        Self {
            camera: DeviceAvailability::Available,
            microphone: DeviceAvailability::Available,
            screen: DeviceAvailability::Available,
            display_surface: "monitor".to_string(),
            capture_delay: Duration::ZERO,
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn with_camera(mut self, availability: DeviceAvailability) -> Self {
        self.camera = availability;
        self
    }

    #[cfg(test)]
    pub fn with_microphone(mut self, availability: DeviceAvailability) -> Self {
        self.microphone = availability;
        self
    }

    #[cfg(test)]
    pub fn with_screen(mut self, availability: DeviceAvailability) -> Self {
        self.screen = availability;
        self
    }

    #[cfg(test)]
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// Every track handed out so far.
    #[cfg(test)]
    pub fn issued(&self) -> Vec<LocalTrack> {
        self.issued.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    #[cfg(test)]
    pub fn issued_of(&self, source: TrackSource) -> Vec<LocalTrack> {
        self.issued().into_iter().filter(|t| t.source() == source).collect()
    }

    fn issue(&self, tracks: Vec<LocalTrack>) -> LocalStream {
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tracks.iter().cloned());
        LocalStream::new(tracks)
    }
}

#[async_trait]
impl MediaDevices for SimulatedDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        if !self.capture_delay.is_zero() {
            tokio::time::sleep(self.capture_delay).await;
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaError::Unknown("no media kinds requested".into()));
        }
        if constraints.video {
            self.camera.check()?;
        }
        if constraints.audio {
            self.microphone.check()?;
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackSource::Microphone, "Simulated microphone"));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackSource::Camera, "Simulated camera"));
        }
        Ok(self.issue(tracks))
    }

    async fn get_display_media(&self) -> Result<LocalStream, MediaError> {
        if !self.capture_delay.is_zero() {
            tokio::time::sleep(self.capture_delay).await;
        }
        self.screen.check()?;
        let track = if self.display_surface.is_empty() {
            LocalTrack::new(TrackSource::Screen, "Simulated screen")
        } else {
            LocalTrack::screen("Simulated screen", self.display_surface.clone())
        };
        Ok(self.issue(vec![track]))
    }
}

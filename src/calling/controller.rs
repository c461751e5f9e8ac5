//! Call lifecycle controller — the single source of truth for whether a call
//! is still going.
//!
//! `run()` sequences media acquisition, room join and the role-specific
//! wait, then multiplexes relay events, peer-connection events and the
//! connection deadline until the call reaches a terminal status. Hang-up,
//! mute and screen-share are driven from other tasks through clones of the
//! same controller.
//!
//! Teardown happens exactly once: `end_call` is guarded by the `ending` flag,
//! and every step of setup re-checks that flag after it resumes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::ice::IceServerConfig;
use super::media::{self, LocalStream, LocalTrack, MediaDevices, MediaError};
use super::negotiator::{NegotiationError, Negotiator};
use super::peer::{ConnectionState, PeerConnectionFactory, PeerEvent};
use super::remote::{RemoteLayout, RemoteView};
use super::signaling::{RelayEvent, SignalMessage, SignalingRelay};
use super::{CallStatus, EndReason, FailureReason, Participant, Role, RoomId};
use crate::config::Config;

/// Tuning knobs for one call.
#[derive(Debug, Clone)]
pub struct CallSettings {
    /// Measured from entering `JoiningRoom`.
    pub connection_timeout: Duration,
    pub end_grace: Duration,
    pub hangup_notify_timeout: Duration,
    pub allow_media_less: bool,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CallSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connection_timeout: config.call.connection_timeout(),
            end_grace: config.call.end_grace(),
            hangup_notify_timeout: config.call.hangup_notify_timeout(),
            allow_media_less: config.call.allow_media_less,
            ice_servers: config.ice_servers.clone(),
        }
    }
}

/// The collaborators a call runs against.
#[derive(Clone)]
pub struct CallDeps {
    pub relay: Arc<dyn SignalingRelay>,
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

/// How a call finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub status: CallStatus,
    pub reason: Option<EndReason>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScreenShareError {
    #[error("screen sharing is only available while connected")]
    NotConnected,
    #[error("screen sharing is already active")]
    AlreadySharing,
    #[error("screen capture failed: {0}")]
    Capture(MediaError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

#[derive(Default)]
struct LocalMedia {
    microphone: Option<LocalTrack>,
    camera: Option<LocalTrack>,
    screen: Option<LocalTrack>,
}

struct Inner {
    participant: Participant,
    room: RoomId,
    settings: CallSettings,
    deps: CallDeps,
    status_tx: watch::Sender<CallStatus>,
    remote_tx: watch::Sender<RemoteLayout>,
    /// Set by the first teardown; every later trigger is a no-op.
    ending: AtomicBool,
    /// We hold a room subscription that must be released.
    joined: AtomicBool,
    connected_once: AtomicBool,
    /// A screen capture is being started or is active.
    screen_busy: AtomicBool,
    negotiator: Mutex<Option<Arc<Negotiator>>>,
    media: Mutex<LocalMedia>,
    remote: Mutex<RemoteView>,
    end_reason: Mutex<Option<EndReason>>,
}

#[derive(Clone)]
pub struct CallController {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Setup stopped early; the call is already torn down.
struct Abandoned;

impl CallController {
    pub fn new(participant: Participant, room: RoomId, settings: CallSettings, deps: CallDeps) -> Self {
        let (status_tx, _) = watch::channel(CallStatus::Idle);
        let (remote_tx, _) = watch::channel(RemoteLayout::default());
        Self {
            inner: Arc::new(Inner {
                participant,
                room,
                settings,
                deps,
                status_tx,
                remote_tx,
                ending: AtomicBool::new(false),
                joined: AtomicBool::new(false),
                connected_once: AtomicBool::new(false),
                screen_busy: AtomicBool::new(false),
                negotiator: Mutex::new(None),
                media: Mutex::new(LocalMedia::default()),
                remote: Mutex::new(RemoteView::new()),
                end_reason: Mutex::new(None),
            }),
        }
    }

    // ---- Observation ----

    #[cfg(test)]
    pub fn participant(&self) -> &Participant {
        &self.inner.participant
    }

    pub fn status(&self) -> CallStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn remote_layout(&self) -> RemoteLayout {
        self.inner.remote_tx.borrow().clone()
    }

    pub fn subscribe_remote(&self) -> watch::Receiver<RemoteLayout> {
        self.inner.remote_tx.subscribe()
    }

    pub fn is_sharing_screen(&self) -> bool {
        lock(&self.inner.media).screen.is_some()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        lock(&self.inner.end_reason).clone()
    }

    fn negotiator(&self) -> Option<Arc<Negotiator>> {
        lock(&self.inner.negotiator).clone()
    }

    fn is_ending(&self) -> bool {
        self.inner.ending.load(Ordering::SeqCst)
    }

    // ---- Status transitions ----

    /// Move to `next`. Terminal states are final, and `Ending` only gives way
    /// to a terminal state.
    fn transition(&self, next: CallStatus) -> bool {
        let mut from = None;
        let changed = self.inner.status_tx.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            if *current == CallStatus::Ending && !next.is_terminal() {
                return false;
            }
            from = Some(std::mem::replace(current, next.clone()));
            true
        });
        if let Some(from) = from {
            tracing::info!("Call {} [{}]: {:?} -> {:?}", self.inner.room, self.inner.participant.role, from, next);
        }
        changed
    }

    /// Declare the call connected, once, from any pre-connect state.
    fn mark_connected(&self, trigger: &str) {
        let changed = self.inner.status_tx.send_if_modified(|current| {
            if current.is_pre_connect() {
                *current = CallStatus::Connected;
                true
            } else {
                false
            }
        });
        if changed {
            self.inner.connected_once.store(true, Ordering::SeqCst);
            tracing::info!("Call {} connected ({})", self.inner.room, trigger);
        }
    }

    /// Mark an invitation as pending. Only valid before the call starts.
    pub fn mark_ringing(&self) -> bool {
        if self.status() != CallStatus::Idle {
            return false;
        }
        self.transition(CallStatus::Ringing)
    }

    // ---- Run ----

    /// Drive the call to completion and return how it ended.
    pub async fn run(&self) -> CallOutcome {
        let mut status_rx = self.subscribe();
        if let Ok((relay_rx, peer_rx, deadline)) = self.setup().await {
            self.event_loop(relay_rx, peer_rx, deadline, &mut status_rx).await;
        }

        // A concurrent teardown may still be finishing.
        while !status_rx.borrow_and_update().is_terminal() {
            if status_rx.changed().await.is_err() {
                break;
            }
        }
        if !self.inner.settings.end_grace.is_zero() {
            tokio::time::sleep(self.inner.settings.end_grace).await;
        }
        CallOutcome {
            status: self.status(),
            reason: self.end_reason(),
        }
    }

    #[allow(clippy::type_complexity)]
    async fn setup(
        &self,
    ) -> Result<
        (
            mpsc::UnboundedReceiver<RelayEvent>,
            mpsc::UnboundedReceiver<PeerEvent>,
            Instant,
        ),
        Abandoned,
    > {
        let inner = &self.inner;
        let participant = &inner.participant;
        if !self.transition(CallStatus::RequestingMedia) {
            return Err(Abandoned);
        }

        // Media first: without it there is nothing to negotiate.
        let stream = match media::acquire_call_media(inner.deps.devices.as_ref()).await {
            Ok(acquired) => {
                if acquired.audio_only {
                    tracing::warn!("Camera unavailable, continuing audio-only");
                }
                Some(acquired.stream)
            }
            Err(e) if inner.settings.allow_media_less => {
                tracing::warn!("No local media ({}), joining without camera or microphone", e);
                None
            }
            Err(e) => {
                tracing::warn!("Media acquisition failed: {}", e);
                self.end_call(EndReason::SetupFailed(FailureReason::Media(e))).await;
                return Err(Abandoned);
            }
        };
        {
            let mut media = lock(&inner.media);
            media.microphone = stream.as_ref().and_then(LocalStream::audio);
            media.camera = stream.as_ref().and_then(LocalStream::video);
        }
        if self.is_ending() {
            // Hang-up won the race against capture.
            if let Some(stream) = &stream {
                stream.stop();
            }
            return Err(Abandoned);
        }

        let pc = match inner.deps.peers.create(&inner.settings.ice_servers) {
            Ok(pc) => pc,
            Err(e) => {
                self.end_call(EndReason::SetupFailed(FailureReason::PeerUnavailable(e.to_string())))
                    .await;
                return Err(Abandoned);
            }
        };
        let Some(peer_rx) = pc.take_events() else {
            pc.close();
            self.end_call(EndReason::SetupFailed(FailureReason::PeerUnavailable(
                "peer events already taken".into(),
            )))
            .await;
            return Err(Abandoned);
        };
        let negotiator = Arc::new(Negotiator::new(
            participant.role,
            inner.room.clone(),
            participant.user_id.clone(),
            pc,
            inner.deps.relay.clone(),
        ));
        *lock(&inner.negotiator) = Some(negotiator.clone());
        if self.is_ending() {
            negotiator.close();
            return Err(Abandoned);
        }
        if let Err(e) = negotiator.attach_local_media(stream.as_ref()) {
            self.end_call(EndReason::SetupFailed(FailureReason::PeerUnavailable(e.to_string())))
                .await;
            return Err(Abandoned);
        }

        if !self.transition(CallStatus::JoiningRoom) {
            return Err(Abandoned);
        }
        let deadline = Instant::now() + inner.settings.connection_timeout;
        let joined = tokio::time::timeout_at(deadline, inner.deps.relay.join(&inner.room, &participant.user_id)).await;
        let relay_rx = match joined {
            Ok(Ok(rx)) => rx,
            Ok(Err(e)) => {
                tracing::warn!("Joining room {} failed: {}", inner.room, e);
                self.end_call(EndReason::SetupFailed(FailureReason::RelayUnavailable(e.to_string())))
                    .await;
                return Err(Abandoned);
            }
            Err(_) => {
                self.end_call(EndReason::ConnectionTimeout).await;
                return Err(Abandoned);
            }
        };
        inner.joined.store(true, Ordering::SeqCst);
        if self.is_ending() {
            if inner.joined.swap(false, Ordering::SeqCst) {
                let _ = inner.deps.relay.leave(&inner.room, &participant.user_id).await;
            }
            return Err(Abandoned);
        }

        let waiting = match participant.role {
            Role::Initiator => CallStatus::AwaitingPeer,
            Role::Responder => CallStatus::AwaitingOffer,
        };
        if !self.transition(waiting) {
            return Err(Abandoned);
        }
        Ok((relay_rx, peer_rx, deadline))
    }

    async fn event_loop(
        &self,
        mut relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
        deadline: Instant,
        status_rx: &mut watch::Receiver<CallStatus>,
    ) {
        let mut peer_open = true;
        loop {
            if self.is_ending() || status_rx.borrow_and_update().is_terminal() {
                break;
            }
            let connected = self.inner.connected_once.load(Ordering::SeqCst);
            tokio::select! {
                event = relay_rx.recv() => match event {
                    Some(event) => self.on_relay_event(event).await,
                    None => {
                        tracing::warn!("Relay subscription for room {} closed", self.inner.room);
                        self.end_call(EndReason::RelayClosed).await;
                    }
                },
                event = peer_rx.recv(), if peer_open => match event {
                    Some(event) => self.on_peer_event(event).await,
                    None => peer_open = false,
                },
                _ = tokio::time::sleep_until(deadline), if !connected => {
                    tracing::warn!(
                        "Call {} not connected after {:?}",
                        self.inner.room,
                        self.inner.settings.connection_timeout
                    );
                    self.end_call(EndReason::ConnectionTimeout).await;
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn on_relay_event(&self, event: RelayEvent) {
        let Some(negotiator) = self.negotiator() else {
            return;
        };
        tracing::debug!("Relay event from {}: {}", event.from, event.message.name());
        match event.message {
            SignalMessage::PeerJoined { user_id } => {
                if negotiator.role() != Role::Initiator {
                    tracing::debug!("{} joined; waiting for their offer", user_id);
                    return;
                }
                if self.status() != CallStatus::AwaitingPeer {
                    tracing::debug!("Ignoring peer-joined from {} in {:?}", user_id, self.status());
                    return;
                }
                tracing::info!("{} joined room {}, starting negotiation", user_id, self.inner.room);
                self.transition(CallStatus::Negotiating);
                match negotiator.create_offer().await {
                    Ok(true) => {}
                    Ok(false) => tracing::debug!("Offer not created"),
                    Err(e) => tracing::warn!("Creating offer failed: {}", e),
                }
            }
            SignalMessage::Offer { sdp, video_source } => {
                if let Some(tag) = &video_source {
                    lock(&self.inner.remote).apply_tag(tag);
                }
                if self.status() == CallStatus::AwaitingOffer {
                    self.transition(CallStatus::Negotiating);
                }
                if let Err(e) = negotiator.handle_remote_offer(sdp).await {
                    // A stall, not a crash: the connection deadline catches it.
                    tracing::warn!("Handling remote offer failed: {}", e);
                }
                self.publish_layout();
            }
            SignalMessage::Answer { sdp, video_source } => {
                if let Some(tag) = &video_source {
                    lock(&self.inner.remote).apply_tag(tag);
                }
                if let Err(e) = negotiator.handle_remote_answer(sdp).await {
                    tracing::warn!("Handling remote answer failed: {}", e);
                }
                self.publish_layout();
            }
            SignalMessage::IceCandidate { candidate } => {
                if let Err(e) = negotiator.handle_remote_candidate(candidate).await {
                    tracing::warn!("Remote candidate rejected: {}", e);
                }
            }
            SignalMessage::VideoSource(tag) => {
                lock(&self.inner.remote).apply_tag(&tag);
                self.publish_layout();
            }
            SignalMessage::CallEnded { user_id } => {
                tracing::info!("{} ended the call", user_id);
                self.end_call(EndReason::RemoteHangUp).await;
            }
            SignalMessage::PeerLeft { user_id } => {
                if self.inner.connected_once.load(Ordering::SeqCst) {
                    tracing::info!("{} left the room", user_id);
                    self.end_call(EndReason::RemoteHangUp).await;
                } else {
                    tracing::debug!("{} left before the call connected", user_id);
                }
            }
        }
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Some(negotiator) = self.negotiator() {
                    if let Err(e) = negotiator.emit_local_candidate(candidate).await {
                        tracing::warn!("Sending local candidate failed: {}", e);
                    }
                }
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!("Peer connection state: {}", state);
                match state {
                    ConnectionState::Connected => self.mark_connected("transport connected"),
                    s if s.is_terminal() => self.end_call(EndReason::Transport(s)).await,
                    _ => {}
                }
            }
            PeerEvent::Track(track) => {
                tracing::info!("Remote {:?} track {} on mid {}", track.kind, track.id, track.mid);
                let first = {
                    let mut remote = lock(&self.inner.remote);
                    let first = !remote.has_media();
                    remote.add_track(track);
                    first
                };
                if first {
                    self.mark_connected("first remote track");
                }
                self.publish_layout();
            }
        }
    }

    fn publish_layout(&self) {
        let layout = lock(&self.inner.remote).layout();
        self.inner.remote_tx.send_if_modified(|current| {
            if *current == layout {
                return false;
            }
            *current = layout;
            true
        });
    }

    // ---- Teardown ----

    /// End the call locally. Safe to call any number of times, from any task.
    pub async fn hang_up(&self) {
        self.end_call(EndReason::LocalHangUp).await;
    }

    async fn end_call(&self, reason: EndReason) {
        let inner = &self.inner;
        if inner.ending.swap(true, Ordering::SeqCst) {
            tracing::debug!("Teardown already running, ignoring {}", reason);
            return;
        }
        tracing::info!("Ending call {} ({})", inner.room, reason);
        *lock(&inner.end_reason) = Some(reason.clone());
        self.transition(CallStatus::Ending);

        let user = &inner.participant.user_id;
        if inner.joined.load(Ordering::SeqCst) {
            let notify = inner.deps.relay.publish(
                &inner.room,
                user,
                SignalMessage::CallEnded { user_id: user.clone() },
            );
            match tokio::time::timeout(inner.settings.hangup_notify_timeout, notify).await {
                Ok(Ok(())) => tracing::debug!("Call-ended sent"),
                Ok(Err(e)) => tracing::warn!("Failed to notify peer of hang-up: {}", e),
                Err(_) => tracing::warn!("Timed out notifying peer of hang-up"),
            }
        }

        let tracks = {
            let mut media = lock(&inner.media);
            [media.microphone.take(), media.camera.take(), media.screen.take()]
        };
        for track in tracks.iter().flatten() {
            track.stop();
        }
        inner.screen_busy.store(false, Ordering::SeqCst);

        let negotiator = lock(&inner.negotiator).take();
        if let Some(negotiator) = negotiator {
            negotiator.close();
        }

        if inner.joined.swap(false, Ordering::SeqCst) {
            if let Err(e) = inner.deps.relay.leave(&inner.room, user).await {
                tracing::debug!("Leaving room {} failed: {}", inner.room, e);
            }
        }

        let was_connected = inner.connected_once.load(Ordering::SeqCst);
        self.transition(reason.final_status(was_connected));
    }

    // ---- Local controls ----

    /// Mute or unmute the microphone. Returns whether a microphone exists.
    pub fn set_microphone_enabled(&self, enabled: bool) -> bool {
        match &lock(&self.inner.media).microphone {
            Some(track) => {
                track.set_enabled(enabled);
                tracing::info!("Microphone {}", if enabled { "unmuted" } else { "muted" });
                true
            }
            None => false,
        }
    }

    /// Turn the camera on or off. Returns whether a camera exists.
    pub fn set_camera_enabled(&self, enabled: bool) -> bool {
        match &lock(&self.inner.media).camera {
            Some(track) => {
                track.set_enabled(enabled);
                tracing::info!("Camera {}", if enabled { "on" } else { "off" });
                true
            }
            None => false,
        }
    }

    // ---- Screen share ----

    /// Replace the outbound camera video with a screen capture.
    ///
    /// A capture failure leaves the call untouched.
    pub async fn start_screen_share(&self) -> Result<(), ScreenShareError> {
        if self.status() != CallStatus::Connected {
            return Err(ScreenShareError::NotConnected);
        }
        let Some(negotiator) = self.negotiator() else {
            return Err(ScreenShareError::NotConnected);
        };
        if self.inner.screen_busy.swap(true, Ordering::SeqCst) {
            return Err(ScreenShareError::AlreadySharing);
        }

        let track = match self.inner.deps.devices.get_display_media().await {
            Ok(stream) => match stream.video() {
                Some(track) => track,
                None => {
                    stream.stop();
                    self.inner.screen_busy.store(false, Ordering::SeqCst);
                    return Err(ScreenShareError::Capture(MediaError::Unknown(
                        "screen capture returned no video".into(),
                    )));
                }
            },
            Err(e) => {
                tracing::warn!("Screen capture failed: {}", e);
                self.inner.screen_busy.store(false, Ordering::SeqCst);
                return Err(ScreenShareError::Capture(e));
            }
        };
        if self.is_ending() {
            track.stop();
            return Err(ScreenShareError::NotConnected);
        }

        if let Err(e) = negotiator.replace_outbound_video(Some(track.clone())).await {
            track.stop();
            self.inner.screen_busy.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        lock(&self.inner.media).screen = Some(track.clone());
        tracing::info!("Screen sharing started ({})", track.label());

        // The platform's own "stop sharing" control ends the track.
        let controller = self.clone();
        tokio::spawn(async move {
            track.ended().await;
            let current = lock(&controller.inner.media).screen.clone();
            if current.is_some_and(|t| t.same_track(&track)) {
                tracing::info!("Screen capture ended outside the call");
                if let Err(e) = controller.stop_screen_share().await {
                    tracing::warn!("Reverting from screen share failed: {}", e);
                }
            }
        });
        Ok(())
    }

    /// Stop sharing and go back to the camera, or to no video for an
    /// audio-only participant. No-op when not sharing.
    pub async fn stop_screen_share(&self) -> Result<(), ScreenShareError> {
        let (screen, camera) = {
            let mut media = lock(&self.inner.media);
            (media.screen.take(), media.camera.clone())
        };
        let Some(screen) = screen else {
            return Ok(());
        };
        screen.stop();
        self.inner.screen_busy.store(false, Ordering::SeqCst);

        let Some(negotiator) = self.negotiator() else {
            return Ok(());
        };
        let fallback = camera.filter(LocalTrack::is_live);
        tracing::info!(
            "Screen sharing stopped, sending {}",
            if fallback.is_some() { "camera" } else { "no video" }
        );
        match negotiator.replace_outbound_video(fallback).await {
            Ok(_) => Ok(()),
            Err(NegotiationError::Closed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::media::TrackSource;
    use crate::calling::sim::{DeviceAvailability, SimConfig, SimulatedDevices, SimulatedPeerFactory};
    use crate::calling::signaling::VideoSource;
    use crate::calling::testing::RecordingRelay;
    use crate::calling::{AccountRole, UserId};
    use crate::relay::hub::RelayHub;
    use crate::relay::local::LocalRelay;
    use tokio::task::JoinHandle;

    fn settings() -> CallSettings {
        CallSettings {
            connection_timeout: Duration::from_secs(5),
            end_grace: Duration::ZERO,
            hangup_notify_timeout: Duration::from_millis(200),
            allow_media_less: false,
            ice_servers: vec![IceServerConfig::default()],
        }
    }

    struct Side {
        controller: CallController,
        devices: Arc<SimulatedDevices>,
        peers: Arc<SimulatedPeerFactory>,
        task: JoinHandle<CallOutcome>,
    }

    fn start(relay: Arc<dyn SignalingRelay>, who: Participant, devices: SimulatedDevices, settings: CallSettings) -> Side {
        let devices = Arc::new(devices);
        let peers = Arc::new(SimulatedPeerFactory::new(SimConfig::default()));
        let controller = CallController::new(
            who,
            "room-1".into(),
            settings,
            CallDeps {
                relay,
                devices: devices.clone(),
                peers: peers.clone(),
            },
        );
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run().await })
        };
        Side {
            controller,
            devices,
            peers,
            task,
        }
    }

    fn tutor() -> Participant {
        Participant::new("t-1".into(), "Tutor", AccountRole::Admin)
    }

    fn student() -> Participant {
        Participant::new("s-1".into(), "Student", AccountRole::Student)
    }

    async fn wait_for_status(controller: &CallController, want: impl Fn(&CallStatus) -> bool) -> CallStatus {
        let mut rx = controller.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if want(&current) {
                    return current;
                }
                if rx.changed().await.is_err() {
                    return controller.status();
                }
            }
        })
        .await
        .expect("timed out waiting for call status")
    }

    async fn wait_for_layout(controller: &CallController, want: impl Fn(&RemoteLayout) -> bool) -> RemoteLayout {
        let mut rx = controller.subscribe_remote();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if want(&current) {
                    return current;
                }
                rx.changed().await.expect("controller dropped");
            }
        })
        .await
        .expect("timed out waiting for remote layout")
    }

    async fn connected_pair() -> (Arc<RelayHub>, Side, Side) {
        let hub = Arc::new(RelayHub::new());
        let relay = Arc::new(LocalRelay::new(hub.clone()));
        let t = start(relay.clone(), tutor(), SimulatedDevices::new(), settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::AwaitingPeer).await;
        let s = start(relay, student(), SimulatedDevices::new(), settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::Connected).await;
        wait_for_status(&s.controller, |s| *s == CallStatus::Connected).await;
        (hub, t, s)
    }

    #[tokio::test]
    async fn test_initiator_alone_sends_no_offer() {
        let relay = RecordingRelay::new();
        let t = start(relay.clone(), tutor(), SimulatedDevices::new(), settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::AwaitingPeer).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.count("offer"), 0);
        t.controller.hang_up().await;
        assert_eq!(t.task.await.unwrap().status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_full_call_connects_with_one_offer_and_one_answer() {
        let (hub, t, s) = connected_pair().await;

        let t_pc = t.peers.last().unwrap();
        let s_pc = s.peers.last().unwrap();
        assert_eq!(t_pc.offers_created(), 1);
        assert_eq!(s_pc.offers_created(), 0);
        assert_eq!(hub.members(&"room-1".into()).len(), 2);

        // Both sides see the other's camera.
        let layout = wait_for_layout(&s.controller, |l| l.primary.is_some()).await;
        assert_eq!(layout.primary.unwrap().source, VideoSource::Camera);
        assert!(layout.has_audio);

        t.controller.hang_up().await;
        let t_out = t.task.await.unwrap();
        let s_out = s.task.await.unwrap();
        assert_eq!(t_out.status, CallStatus::Ended);
        assert_eq!(t_out.reason, Some(EndReason::LocalHangUp));
        assert_eq!(s_out.status, CallStatus::Ended);
        assert_eq!(s_out.reason, Some(EndReason::RemoteHangUp));
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_never_joins() {
        let relay = RecordingRelay::new();
        let devices = SimulatedDevices::new()
            .with_camera(DeviceAvailability::Denied)
            .with_microphone(DeviceAvailability::Denied);
        let t = start(relay.clone(), tutor(), devices, settings());
        let outcome = t.task.await.unwrap();
        assert_eq!(
            outcome.status,
            CallStatus::Failed(FailureReason::Media(MediaError::PermissionDenied))
        );
        assert_eq!(relay.joins(), 0);
        assert_eq!(t.peers.created(), 0);
        assert!(outcome.status.to_string().contains("permission"));
    }

    #[tokio::test]
    async fn test_missing_camera_falls_back_to_audio_only() {
        let relay = RecordingRelay::new();
        let devices = SimulatedDevices::new().with_camera(DeviceAvailability::Missing);
        let t = start(relay.clone(), tutor(), devices, settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::AwaitingPeer).await;
        assert_eq!(relay.joins(), 1);
        assert!(t.controller.set_microphone_enabled(false));
        assert!(!t.controller.set_camera_enabled(false));
        t.controller.hang_up().await;
        t.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_media_less_join_when_allowed() {
        let relay = RecordingRelay::new();
        let devices = SimulatedDevices::new()
            .with_camera(DeviceAvailability::Missing)
            .with_microphone(DeviceAvailability::Missing);
        let t = start(
            relay.clone(),
            student(),
            devices,
            CallSettings {
                allow_media_less: true,
                ..settings()
            },
        );
        wait_for_status(&t.controller, |s| *s == CallStatus::AwaitingOffer).await;
        assert_eq!(relay.joins(), 1);
        t.controller.hang_up().await;
        t.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hang_up_is_idempotent() {
        let relay = RecordingRelay::new();
        let t = start(relay.clone(), tutor(), SimulatedDevices::new(), settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::AwaitingPeer).await;

        // Local clicks racing a remote call-ended.
        relay.inject("s-1", SignalMessage::CallEnded { user_id: "s-1".into() });
        tokio::join!(
            t.controller.hang_up(),
            t.controller.hang_up(),
            t.controller.hang_up()
        );
        let outcome = t.task.await.unwrap();
        t.controller.hang_up().await;

        assert_eq!(outcome.status, CallStatus::Ended);
        assert_eq!(relay.count("call-ended"), 1);
        assert_eq!(relay.leaves(), 1);
        assert_eq!(t.peers.last().unwrap().closes(), 1);
        for track in t.devices.issued() {
            assert_eq!(track.stop_count(), 1, "{:?} stopped once", track.source());
        }
    }

    #[tokio::test]
    async fn test_failed_hangup_notification_does_not_block_teardown() {
        let relay = RecordingRelay::new();
        let t = start(relay.clone(), tutor(), SimulatedDevices::new(), settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::AwaitingPeer).await;
        relay.fail_publishes(true);
        t.controller.hang_up().await;
        assert_eq!(t.task.await.unwrap().status, CallStatus::Ended);
        assert_eq!(relay.count("call-ended"), 1);
        assert!(t.devices.issued().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn test_connection_timeout_fails_the_call() {
        let relay = RecordingRelay::new();
        let t = start(
            relay.clone(),
            student(),
            SimulatedDevices::new(),
            CallSettings {
                connection_timeout: Duration::from_millis(100),
                ..settings()
            },
        );
        let outcome = t.task.await.unwrap();
        assert_eq!(outcome.status, CallStatus::Failed(FailureReason::ConnectionTimeout));
        assert_eq!(outcome.reason, Some(EndReason::ConnectionTimeout));
        assert_eq!(relay.leaves(), 1);
    }

    #[tokio::test]
    async fn test_relay_loss_before_connect_fails() {
        let relay = RecordingRelay::new();
        let t = start(relay.clone(), student(), SimulatedDevices::new(), settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::AwaitingOffer).await;
        relay.disconnect();
        let outcome = t.task.await.unwrap();
        assert!(matches!(
            outcome.status,
            CallStatus::Failed(FailureReason::RelayUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_hang_up_during_media_acquisition() {
        let relay = RecordingRelay::new();
        let devices = SimulatedDevices::new().with_capture_delay(Duration::from_millis(100));
        let t = start(relay.clone(), tutor(), devices, settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::RequestingMedia).await;
        t.controller.hang_up().await;

        let outcome = t.task.await.unwrap();
        assert_eq!(outcome.status, CallStatus::Ended);
        assert_eq!(relay.joins(), 0);
        assert_eq!(t.peers.created(), 0);
        // Tracks that arrived after the hang-up are released too.
        assert!(t.devices.issued().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn test_transport_failure_after_connect_ends_call() {
        let (_hub, t, s) = connected_pair().await;
        t.peers.last().unwrap().drop_transport(ConnectionState::Failed);
        let t_out = t.task.await.unwrap();
        assert_eq!(t_out.status, CallStatus::Ended);
        assert_eq!(t_out.reason, Some(EndReason::Transport(ConnectionState::Failed)));
        // The other side hears call-ended and tears down on its own.
        assert_eq!(s.task.await.unwrap().status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_transport_loss_before_connect_fails() {
        let relay = RecordingRelay::new();
        let t = start(relay.clone(), student(), SimulatedDevices::new(), settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::AwaitingOffer).await;
        t.peers.last().unwrap().drop_transport(ConnectionState::Disconnected);
        let outcome = t.task.await.unwrap();
        assert_eq!(outcome.status, CallStatus::Failed(FailureReason::TransportFailed));
        assert_eq!(outcome.reason, Some(EndReason::Transport(ConnectionState::Disconnected)));
        assert_eq!(relay.leaves(), 1);
    }

    #[tokio::test]
    async fn test_screen_share_classified_and_reverted() {
        let (_hub, t, s) = connected_pair().await;
        wait_for_layout(&s.controller, |l| l.primary.is_some()).await;

        tokio_test::assert_ok!(t.controller.start_screen_share().await);
        assert!(t.controller.is_sharing_screen());
        let t_pc = t.peers.last().unwrap();
        assert_eq!(t_pc.sender_track(crate::calling::media::TrackKind::Video).unwrap().source(), TrackSource::Screen);
        assert_eq!(t_pc.offers_created(), 1);

        let layout = wait_for_layout(&s.controller, |l| {
            l.primary.as_ref().is_some_and(|v| v.source == VideoSource::Screen)
        })
        .await;
        assert!(layout.secondary.is_none());

        tokio_test::assert_ok!(t.controller.stop_screen_share().await);
        assert!(!t.controller.is_sharing_screen());
        let layout = wait_for_layout(&s.controller, |l| {
            l.primary.as_ref().is_some_and(|v| v.source == VideoSource::Camera)
        })
        .await;
        assert!(layout.secondary.is_none());
        assert_eq!(t_pc.offers_created(), 1, "no renegotiation");
        assert!(t.devices.issued_of(TrackSource::Screen).iter().all(|t| !t.is_live()));
        assert!(t.devices.issued_of(TrackSource::Camera)[0].is_live());

        t.controller.hang_up().await;
        t.task.await.unwrap();
        s.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_platform_stop_reverts_to_camera() {
        let (_hub, t, s) = connected_pair().await;
        t.controller.start_screen_share().await.unwrap();
        let screen = t.devices.issued_of(TrackSource::Screen).pop().unwrap();
        screen.end_from_platform();

        let t_pc = t.peers.last().unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while t.controller.is_sharing_screen()
                || t_pc
                    .sender_track(crate::calling::media::TrackKind::Video)
                    .map(|t| t.source())
                    != Some(TrackSource::Camera)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("camera restored");

        t.controller.hang_up().await;
        t.task.await.unwrap();
        s.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_audio_only_stop_share_sends_no_video() {
        let hub = Arc::new(RelayHub::new());
        let relay = Arc::new(LocalRelay::new(hub));
        let t = start(
            relay.clone(),
            tutor(),
            SimulatedDevices::new().with_camera(DeviceAvailability::Busy),
            settings(),
        );
        wait_for_status(&t.controller, |s| *s == CallStatus::AwaitingPeer).await;
        let s = start(relay, student(), SimulatedDevices::new(), settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::Connected).await;

        t.controller.start_screen_share().await.unwrap();
        t.controller.stop_screen_share().await.unwrap();
        let t_pc = t.peers.last().unwrap();
        assert!(t_pc.sender_track(crate::calling::media::TrackKind::Video).is_none());
        assert_eq!(t.controller.status(), CallStatus::Connected);

        t.controller.hang_up().await;
        t.task.await.unwrap();
        s.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_screen_share_capture_failure_changes_nothing() {
        let hub = Arc::new(RelayHub::new());
        let relay = Arc::new(LocalRelay::new(hub));
        let t = start(
            relay.clone(),
            tutor(),
            SimulatedDevices::new().with_screen(DeviceAvailability::Denied),
            settings(),
        );
        wait_for_status(&t.controller, |s| *s == CallStatus::AwaitingPeer).await;
        let s = start(relay, student(), SimulatedDevices::new(), settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::Connected).await;

        let err = t.controller.start_screen_share().await.unwrap_err();
        assert!(matches!(err, ScreenShareError::Capture(MediaError::PermissionDenied)));
        assert!(!t.controller.is_sharing_screen());
        assert_eq!(t.controller.status(), CallStatus::Connected);

        t.controller.hang_up().await;
        t.task.await.unwrap();
        s.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_screen_share_requires_connection() {
        let relay = RecordingRelay::new();
        let t = start(relay, tutor(), SimulatedDevices::new(), settings());
        wait_for_status(&t.controller, |s| *s == CallStatus::AwaitingPeer).await;
        assert!(matches!(
            t.controller.start_screen_share().await,
            Err(ScreenShareError::NotConnected)
        ));
        t.controller.hang_up().await;
        t.task.await.unwrap();
    }

    #[test]
    fn test_ringing_only_from_idle() {
        let relay: Arc<dyn SignalingRelay> = RecordingRelay::new();
        let controller = CallController::new(
            tutor(),
            "room-1".into(),
            settings(),
            CallDeps {
                relay,
                devices: Arc::new(SimulatedDevices::new()),
                peers: Arc::new(SimulatedPeerFactory::default()),
            },
        );
        assert!(controller.mark_ringing());
        assert_eq!(controller.status(), CallStatus::Ringing);
        assert!(!controller.mark_ringing());
        assert_eq!(controller.participant().user_id, UserId::from("t-1"));
    }
}

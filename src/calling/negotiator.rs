//! Session negotiator — one peer connection per call attempt.
//!
//! Drives the offer/answer exchange for its role, trickles local ICE
//! candidates to the relay, buffers remote candidates until a remote
//! description exists, and swaps the outbound video in place for screen
//! sharing.
//!
//! Every asynchronous step re-checks the `closed` flag when it resumes, so
//! `close()` may run concurrently with an in-flight step: the step's result
//! is dropped instead of being applied to a released connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::media::{LocalStream, LocalTrack, TrackKind, TrackSource};
use super::peer::{
    IceCandidateInit, OfferOptions, PeerConnection, PeerError, SenderId, SessionDescription, SignalingState,
};
use super::signaling::{RelayError, SignalMessage, SignalingRelay, VideoSource, VideoSourceTag};
use super::{Role, RoomId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("only the {0} may perform this step")]
    WrongRole(Role),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("signaling relay: {0}")]
    Relay(#[from] RelayError),
    #[error("no video sender is attached")]
    NoVideoSender,
    #[error("negotiator is closed")]
    Closed,
}

#[derive(Default)]
struct NegotiationState {
    /// SDP of the offer being answered, so a redelivered copy is answered once.
    answered_offer: Option<String>,
    /// Remote candidates received before the remote description, in arrival order.
    pending_candidates: VecDeque<IceCandidateInit>,
    /// Set once the queue has been drained after the remote description.
    remote_ready: bool,
    audio_sender: Option<SenderId>,
    video_sender: Option<SenderId>,
    outbound_video: Option<LocalTrack>,
    local_tracks: Vec<LocalTrack>,
}

pub struct Negotiator {
    role: Role,
    room: RoomId,
    user: UserId,
    pc: Arc<dyn PeerConnection>,
    relay: Arc<dyn SignalingRelay>,
    closed: AtomicBool,
    offer_in_flight: AtomicBool,
    state: Mutex<NegotiationState>,
}

impl Negotiator {
    pub fn new(
        role: Role,
        room: RoomId,
        user: UserId,
        pc: Arc<dyn PeerConnection>,
        relay: Arc<dyn SignalingRelay>,
    ) -> Self {
        Self {
            role,
            room,
            user,
            pc,
            relay,
            closed: AtomicBool::new(false),
            offer_in_flight: AtomicBool::new(false),
            state: Mutex::new(NegotiationState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NegotiationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state()
    }

    /// Remote candidates still waiting for a remote description.
    #[cfg(test)]
    pub fn pending_candidates(&self) -> usize {
        self.lock().pending_candidates.len()
    }

    /// Map the result of a peer step that resumed after an await.
    ///
    /// `Ok(None)` means the negotiator was closed meanwhile and the caller
    /// must stop without touching any more state.
    fn resume<T>(&self, step: &str, result: Result<T, PeerError>) -> Result<Option<T>, NegotiationError> {
        if self.is_closed() {
            tracing::debug!("Negotiator closed during {}, dropping result", step);
            return Ok(None);
        }
        result.map(Some).map_err(NegotiationError::from)
    }

    // ---- Local media ----

    /// Bind local tracks to one sender slot per kind.
    ///
    /// Both slots are always created so that offers request audio and video
    /// even when a device is missing; an empty slot simply sends nothing.
    pub fn attach_local_media(&self, stream: Option<&LocalStream>) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        let audio = stream.and_then(|s| s.audio());
        let video = stream.and_then(|s| s.video());

        let audio_sender = self.pc.add_sender(TrackKind::Audio, audio.as_ref())?;
        let video_sender = self.pc.add_sender(TrackKind::Video, video.as_ref())?;

        let mut state = self.lock();
        state.audio_sender = Some(audio_sender);
        state.video_sender = Some(video_sender);
        state.outbound_video = video;
        state.local_tracks = stream.map(|s| s.tracks().to_vec()).unwrap_or_default();
        tracing::info!(
            "Attached local media: audio={}, video={}",
            state.local_tracks.iter().any(|t| t.kind() == TrackKind::Audio),
            state.outbound_video.is_some()
        );
        Ok(())
    }

    /// Purpose of the video currently on the video sender, keyed by its mid.
    fn video_source_tag(&self) -> Option<VideoSourceTag> {
        let (sender, track) = {
            let state = self.lock();
            (state.video_sender?, state.outbound_video.clone())
        };
        let mid = self.pc.sender_mid(sender)?;
        Some(VideoSourceTag {
            mid,
            source: track.map(|t| match t.source() {
                TrackSource::Screen => VideoSource::Screen,
                _ => VideoSource::Camera,
            }),
        })
    }

    // ---- Offer / answer ----

    /// Create, apply and publish an offer.
    ///
    /// Returns `Ok(false)` without doing anything when a round is already
    /// outstanding (signaling state not stable, or another offer is being
    /// built) or when the negotiator is closed.
    pub async fn create_offer(&self) -> Result<bool, NegotiationError> {
        if self.role != Role::Initiator {
            return Err(NegotiationError::WrongRole(Role::Initiator));
        }
        if self.is_closed() {
            return Ok(false);
        }
        let phase = self.pc.signaling_state();
        if phase != SignalingState::Stable {
            tracing::debug!("Offer skipped: signaling state is {}", phase);
            return Ok(false);
        }
        if self.offer_in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!("Offer skipped: another offer is in flight");
            return Ok(false);
        }

        let result = self.offer_round().await;
        self.offer_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn offer_round(&self) -> Result<bool, NegotiationError> {
        tracing::info!("Creating offer for room {}", self.room);
        let offer = self.pc.create_offer(OfferOptions::default()).await;
        let Some(offer) = self.resume("create_offer", offer)? else {
            return Ok(false);
        };

        let applied = self.pc.set_local_description(offer.clone()).await;
        if self.resume("set_local_description(offer)", applied)?.is_none() {
            return Ok(false);
        }
        let message = SignalMessage::Offer {
            sdp: offer.sdp,
            video_source: self.video_source_tag(),
        };
        self.relay.publish(&self.room, &self.user, message).await?;
        tracing::info!("Offer sent");
        Ok(true)
    }

    /// Apply the initiator's offer and reply with an answer.
    pub async fn handle_remote_offer(&self, sdp: String) -> Result<(), NegotiationError> {
        if self.role != Role::Responder {
            return Err(NegotiationError::WrongRole(Role::Responder));
        }
        if self.is_closed() {
            return Ok(());
        }
        {
            let mut state = self.lock();
            if state.answered_offer.as_deref() == Some(sdp.as_str()) {
                tracing::debug!("Ignoring redelivered offer");
                return Ok(());
            }
            state.answered_offer = Some(sdp.clone());
        }
        tracing::info!("Applying remote offer ({} bytes)", sdp.len());

        let offer = SessionDescription::offer(sdp);
        let applied = self.pc.set_remote_description(offer).await;
        if applied.is_err() {
            // Rejected offers may be sent again.
            self.lock().answered_offer = None;
        }
        if self.resume("set_remote_description(offer)", applied)?.is_none() {
            return Ok(());
        }

        if !self.flush_pending_candidates().await {
            return Ok(());
        }

        let answer = self.pc.create_answer().await;
        let Some(answer) = self.resume("create_answer", answer)? else {
            return Ok(());
        };
        let applied = self.pc.set_local_description(answer.clone()).await;
        if self.resume("set_local_description(answer)", applied)?.is_none() {
            return Ok(());
        }

        let message = SignalMessage::Answer {
            sdp: answer.sdp,
            video_source: self.video_source_tag(),
        };
        self.relay.publish(&self.room, &self.user, message).await?;
        tracing::info!("Answer sent");
        Ok(())
    }

    /// Apply the responder's answer.
    pub async fn handle_remote_answer(&self, sdp: String) -> Result<(), NegotiationError> {
        if self.role != Role::Initiator {
            return Err(NegotiationError::WrongRole(Role::Initiator));
        }
        if self.is_closed() {
            return Ok(());
        }
        let phase = self.pc.signaling_state();
        if phase != SignalingState::HaveLocalOffer {
            // Redelivered answer for a round that already completed.
            tracing::debug!("Ignoring answer in signaling state {}", phase);
            return Ok(());
        }
        tracing::info!("Applying remote answer ({} bytes)", sdp.len());

        let answer = SessionDescription::answer(sdp);
        let applied = self.pc.set_remote_description(answer).await;
        if self.resume("set_remote_description(answer)", applied)?.is_none() {
            return Ok(());
        }
        self.flush_pending_candidates().await;
        Ok(())
    }

    // ---- ICE ----

    /// Apply a remote candidate, or queue it until a remote description exists.
    pub async fn handle_remote_candidate(&self, candidate: IceCandidateInit) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Ok(());
        }
        if candidate.is_end_of_candidates() {
            tracing::debug!("Ignoring end-of-candidates marker");
            return Ok(());
        }
        {
            let mut state = self.lock();
            if !state.remote_ready {
                state.pending_candidates.push_back(candidate);
                tracing::debug!("Queued remote candidate ({} pending)", state.pending_candidates.len());
                return Ok(());
            }
        }
        let applied = self.pc.add_ice_candidate(candidate).await;
        self.resume("add_ice_candidate", applied)?;
        Ok(())
    }

    /// Drain the candidate queue in arrival order.
    ///
    /// Candidates arriving while the flush is running land at the back of the
    /// queue; `remote_ready` is only set under the same lock that observed the
    /// queue empty, so nothing can overtake a queued candidate. Returns
    /// `false` if the negotiator was closed mid-flush.
    async fn flush_pending_candidates(&self) -> bool {
        let mut flushed = 0usize;
        loop {
            let next = {
                let mut state = self.lock();
                match state.pending_candidates.pop_front() {
                    Some(c) => c,
                    None => {
                        state.remote_ready = true;
                        break;
                    }
                }
            };
            if self.is_closed() {
                return false;
            }
            if let Err(e) = self.pc.add_ice_candidate(next).await {
                if self.is_closed() {
                    return false;
                }
                tracing::warn!("Queued remote candidate rejected: {}", e);
            }
            flushed += 1;
        }
        if flushed > 0 {
            tracing::debug!("Flushed {} queued remote candidates", flushed);
        }
        !self.is_closed()
    }

    /// Trickle a locally gathered candidate to the other participant.
    pub async fn emit_local_candidate(&self, candidate: Option<IceCandidateInit>) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Ok(());
        }
        let Some(candidate) = candidate else {
            tracing::debug!("Local ICE gathering complete");
            return Ok(());
        };
        tracing::debug!("Sending local candidate: {}", candidate.candidate);
        self.relay
            .publish(&self.room, &self.user, SignalMessage::IceCandidate { candidate })
            .await?;
        Ok(())
    }

    // ---- Track replacement ----

    /// Swap the outbound video in place, without a new offer/answer round.
    ///
    /// `None` sends no video. Returns `Ok(false)` when `track` is already the
    /// one being sent.
    pub async fn replace_outbound_video(&self, track: Option<LocalTrack>) -> Result<bool, NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        let sender = {
            let state = self.lock();
            let unchanged = match (&state.outbound_video, &track) {
                (None, None) => true,
                (Some(current), Some(next)) => current.same_track(next),
                _ => false,
            };
            if unchanged {
                tracing::debug!("Outbound video unchanged, skipping replace");
                return Ok(false);
            }
            state.video_sender.ok_or(NegotiationError::NoVideoSender)?
        };

        let replaced = self.pc.replace_track(sender, track.clone()).await;
        if self.resume("replace_track", replaced)?.is_none() {
            return Err(NegotiationError::Closed);
        }
        tracing::info!(
            "Outbound video now {}",
            track.as_ref().map(|t| format!("{:?} ({})", t.source(), t.label())).unwrap_or_else(|| "off".into())
        );
        self.lock().outbound_video = track;

        if let Some(tag) = self.video_source_tag() {
            if let Err(e) = self
                .relay
                .publish(&self.room, &self.user, SignalMessage::VideoSource(tag))
                .await
            {
                tracing::warn!("Failed to announce video source: {}", e);
            }
        }
        Ok(true)
    }

    // ---- Teardown ----

    /// Release the connection and every local capture. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (discarded, tracks, outbound) = {
            let mut state = self.lock();
            let discarded = state.pending_candidates.len();
            state.pending_candidates.clear();
            (discarded, std::mem::take(&mut state.local_tracks), state.outbound_video.take())
        };
        for track in tracks.iter().chain(outbound.iter()) {
            track.stop();
        }
        self.pc.close();
        tracing::info!("Negotiator closed ({} queued candidates discarded)", discarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::sdp::{build_description, MediaLine, SessionParams};
    use crate::calling::sim::{SimConfig, SimulatedPeerConnection};
    use crate::calling::testing::RecordingRelay;

    fn candidate(n: u16) -> IceCandidateInit {
        IceCandidateInit::new(
            format!("candidate:{} 1 UDP 2130706431 10.0.0.{} {} typ host", n, n, 40000 + n),
            Some("0".into()),
            Some(0),
        )
    }

    fn remote_sdp() -> String {
        let params = SessionParams::generate("actpass").unwrap();
        let lines = vec![
            MediaLine {
                kind: TrackKind::Audio,
                mid: "0".into(),
                msid: Some(("remote".into(), "remote-mic".into())),
                display_surface: None,
            },
            MediaLine {
                kind: TrackKind::Video,
                mid: "1".into(),
                msid: Some(("remote".into(), "remote-cam".into())),
                display_surface: None,
            },
        ];
        build_description(&params, &lines).unwrap()
    }

    fn stream() -> LocalStream {
        LocalStream::new(vec![
            LocalTrack::new(TrackSource::Microphone, "mic"),
            LocalTrack::new(TrackSource::Camera, "cam"),
        ])
    }

    fn negotiator(role: Role) -> (Negotiator, Arc<SimulatedPeerConnection>, Arc<RecordingRelay>) {
        let pc = Arc::new(SimulatedPeerConnection::new(SimConfig::default()));
        let relay = RecordingRelay::new();
        let n = Negotiator::new(role, "room-1".into(), "me".into(), pc.clone(), relay.clone());
        (n, pc, relay)
    }

    #[tokio::test]
    async fn test_candidates_queued_until_remote_description() {
        let (n, pc, relay) = negotiator(Role::Responder);
        n.attach_local_media(Some(&stream())).unwrap();

        for i in 1..=3 {
            n.handle_remote_candidate(candidate(i)).await.unwrap();
        }
        assert_eq!(n.pending_candidates(), 3);
        assert!(pc.applied_candidates().is_empty());

        n.handle_remote_offer(remote_sdp()).await.unwrap();
        assert_eq!(n.pending_candidates(), 0);
        n.handle_remote_candidate(candidate(4)).await.unwrap();

        let applied = pc.applied_candidates();
        let expected: Vec<String> = (1..=4).map(|i| candidate(i).candidate).collect();
        assert_eq!(applied, expected);
        assert_eq!(relay.count("answer"), 1);
    }

    #[tokio::test]
    async fn test_end_of_candidates_is_ignored() {
        let (n, pc, _relay) = negotiator(Role::Responder);
        n.attach_local_media(Some(&stream())).unwrap();
        n.handle_remote_candidate(IceCandidateInit::new("", None, None)).await.unwrap();
        assert_eq!(n.pending_candidates(), 0);
        n.handle_remote_offer(remote_sdp()).await.unwrap();
        assert!(pc.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_no_second_offer_while_one_is_pending() {
        let (n, pc, relay) = negotiator(Role::Initiator);
        n.attach_local_media(Some(&stream())).unwrap();
        assert!(n.create_offer().await.unwrap());
        assert_eq!(n.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(!n.create_offer().await.unwrap());
        assert_eq!(pc.offers_created(), 1);
        assert_eq!(relay.count("offer"), 1);

        let (a, b) = tokio::join!(n.create_offer(), n.create_offer());
        assert!(!a.unwrap() && !b.unwrap());
        assert_eq!(pc.offers_created(), 1);
    }

    #[tokio::test]
    async fn test_racing_offer_triggers_create_one_offer() {
        let (n, pc, relay) = negotiator(Role::Initiator);
        n.attach_local_media(Some(&stream())).unwrap();
        let (a, b) = tokio::join!(n.create_offer(), n.create_offer());
        assert!(a.unwrap() ^ b.unwrap());
        assert_eq!(pc.offers_created(), 1);
        assert_eq!(relay.count("offer"), 1);
    }

    #[tokio::test]
    async fn test_offer_carries_camera_source() {
        let (n, _pc, relay) = negotiator(Role::Initiator);
        n.attach_local_media(Some(&stream())).unwrap();
        n.create_offer().await.unwrap();
        match relay.published().first() {
            Some(SignalMessage::Offer { video_source, .. }) => {
                let tag = video_source.clone().unwrap();
                assert_eq!(tag.mid, "1");
                assert_eq!(tag.source, Some(VideoSource::Camera));
            }
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_roles_are_enforced() {
        let (n, _pc, _relay) = negotiator(Role::Responder);
        assert!(matches!(
            n.create_offer().await,
            Err(NegotiationError::WrongRole(Role::Initiator))
        ));
        let (n, _pc, _relay) = negotiator(Role::Initiator);
        assert!(matches!(
            n.handle_remote_offer(remote_sdp()).await,
            Err(NegotiationError::WrongRole(Role::Responder))
        ));
    }

    #[tokio::test]
    async fn test_malformed_offer_is_reported_not_fatal() {
        let (n, _pc, relay) = negotiator(Role::Responder);
        n.attach_local_media(Some(&stream())).unwrap();
        let err = n.handle_remote_offer("not sdp".into()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Peer(PeerError::InvalidDescription(_))));
        assert_eq!(relay.count("answer"), 0);
        // A valid offer afterwards still works.
        n.handle_remote_offer(remote_sdp()).await.unwrap();
        assert_eq!(relay.count("answer"), 1);
    }

    #[tokio::test]
    async fn test_redelivered_offer_answered_once() {
        let (n, _pc, relay) = negotiator(Role::Responder);
        n.attach_local_media(Some(&stream())).unwrap();
        let sdp = remote_sdp();

        n.handle_remote_offer(sdp.clone()).await.unwrap();
        n.handle_remote_offer(sdp.clone()).await.unwrap();
        assert_eq!(relay.count("answer"), 1);
        assert_eq!(n.signaling_state(), SignalingState::Stable);

        // Two copies racing each other.
        let (n, _pc, relay) = negotiator(Role::Responder);
        n.attach_local_media(Some(&stream())).unwrap();
        let (a, b) = tokio::join!(n.handle_remote_offer(sdp.clone()), n.handle_remote_offer(sdp));
        a.unwrap();
        b.unwrap();
        assert_eq!(relay.count("answer"), 1);
    }

    #[tokio::test]
    async fn test_replace_with_current_track_is_noop() {
        let (n, pc, relay) = negotiator(Role::Initiator);
        let s = stream();
        n.attach_local_media(Some(&s)).unwrap();
        let camera = s.video().unwrap();

        assert!(!n.replace_outbound_video(Some(camera.clone())).await.unwrap());
        assert_eq!(pc.replacements(), 0);
        assert_eq!(relay.count("video-source"), 0);

        let screen = LocalTrack::screen("screen", "monitor");
        assert!(n.replace_outbound_video(Some(screen.clone())).await.unwrap());
        assert!(!n.replace_outbound_video(Some(screen)).await.unwrap());
        assert!(n.replace_outbound_video(Some(camera)).await.unwrap());
        assert_eq!(pc.replacements(), 2);
        assert_eq!(pc.offers_created(), 0);
        assert_eq!(relay.count("video-source"), 2);
    }

    #[tokio::test]
    async fn test_close_discards_queue_and_is_idempotent() {
        let (n, pc, relay) = negotiator(Role::Responder);
        let s = stream();
        n.attach_local_media(Some(&s)).unwrap();
        n.handle_remote_candidate(candidate(1)).await.unwrap();
        n.handle_remote_candidate(candidate(2)).await.unwrap();

        n.close();
        n.close();
        assert_eq!(n.pending_candidates(), 0);
        assert_eq!(pc.closes(), 1);
        assert!(s.tracks().iter().all(|t| !t.is_live() && t.stop_count() == 1));

        // Steps arriving after close are no-ops.
        n.handle_remote_offer(remote_sdp()).await.unwrap();
        n.handle_remote_candidate(candidate(3)).await.unwrap();
        assert!(pc.applied_candidates().is_empty());
        assert_eq!(relay.count("answer"), 0);
    }

    #[tokio::test]
    async fn test_close_during_offer_drops_result() {
        let pc = Arc::new(SimulatedPeerConnection::new(SimConfig {
            op_delay: std::time::Duration::from_millis(30),
            ..SimConfig::default()
        }));
        let relay = RecordingRelay::new();
        let n = Arc::new(Negotiator::new(
            Role::Initiator,
            "room-1".into(),
            "me".into(),
            pc.clone(),
            relay.clone(),
        ));
        n.attach_local_media(Some(&stream())).unwrap();

        let task = {
            let n = n.clone();
            tokio::spawn(async move { n.create_offer().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        n.close();
        assert!(!task.await.unwrap().unwrap());
        assert_eq!(relay.count("offer"), 0);
        assert_eq!(pc.signaling_state(), SignalingState::Closed);
    }
}

#![forbid(unsafe_code)]

// Peer module - client-side negotiation state for the audio mesh

use crate::signaling::protocol::{ClientMessage, ServerMessage};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Where one peer link stands in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Known peer, no negotiation started.
    Idle,
    /// We sent an offer and are waiting for the answer.
    OfferSent,
    /// Offer out, trickle candidates already arriving.
    AnswerPending,
    /// Descriptions exchanged on both sides.
    Connected,
    /// Torn down, locally or after a failure.
    Closed,
}

/// Driver for the actual media engine. The table decides WHEN to negotiate;
/// the negotiator knows HOW, so the same session logic runs against a real
/// WebRTC stack or a fake in tests.
#[allow(async_fn_in_trait)]
pub trait MediaNegotiator {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn create_offer(&mut self, peer: &str) -> Result<Value, Self::Error>;
    async fn accept_offer(&mut self, peer: &str, offer: Value) -> Result<Value, Self::Error>;
    async fn accept_answer(&mut self, peer: &str, answer: Value) -> Result<(), Self::Error>;
    async fn add_ice_candidate(&mut self, peer: &str, candidate: Value) -> Result<(), Self::Error>;
    async fn close(&mut self, peer: &str);
}

struct PeerSession {
    phase: PeerPhase,
    remote_description_set: bool,
    pending_candidates: Vec<Value>,
}

impl PeerSession {
    fn new(phase: PeerPhase) -> Self {
        Self {
            phase,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }
}

/// One audio-mesh endpoint's view of its peers, keyed by connection ID.
///
/// Negotiation follows the joiner-waits convention: members already in the
/// room offer to the newcomer when the join is announced, the newcomer only
/// answers. Both sides can never offer to each other at once, so there is
/// no glare to resolve.
///
/// Candidates that arrive before the remote description are queued per peer
/// and applied in arrival order once the description lands.
pub struct PeerTable<N: MediaNegotiator> {
    negotiator: N,
    own_meeting_id: String,
    peers: HashMap<String, PeerSession>,
    identities: HashMap<String, String>,
}

impl<N: MediaNegotiator> PeerTable<N> {
    pub fn new(negotiator: N, own_meeting_id: impl Into<String>) -> Self {
        Self {
            negotiator,
            own_meeting_id: own_meeting_id.into(),
            peers: HashMap::new(),
            identities: HashMap::new(),
        }
    }

    /// Feed one server event through the session logic. Returns the
    /// signaling messages to send back over the relay.
    pub async fn handle_event(&mut self, event: ServerMessage) -> Vec<ClientMessage> {
        match event {
            ServerMessage::RoomJoined { participants, .. } => {
                // We are the newcomer: remember who is here and wait for
                // their offers
                for participant in participants {
                    if participant.meeting_id != self.own_meeting_id {
                        self.identities.insert(participant.meeting_id, participant.connection_id);
                    }
                }
                Vec::new()
            }

            ServerMessage::ParticipantJoined { participant } => {
                if participant.meeting_id == self.own_meeting_id {
                    return Vec::new();
                }
                let peer = participant.connection_id.clone();
                self.identities.insert(participant.meeting_id, peer.clone());

                match self.negotiator.create_offer(&peer).await {
                    Ok(offer) => {
                        self.peers.insert(peer.clone(), PeerSession::new(PeerPhase::OfferSent));
                        vec![ClientMessage::WebrtcOffer {
                            target_connection_id: peer,
                            offer,
                        }]
                    }
                    Err(e) => {
                        warn!("Offer to {} failed: {}", peer, e);
                        self.fail_peer(&peer).await;
                        Vec::new()
                    }
                }
            }

            ServerMessage::WebrtcOffer { from, from_meeting_id, offer } => {
                self.identities.insert(from_meeting_id, from.clone());
                match self.negotiator.accept_offer(&from, offer).await {
                    Ok(answer) => {
                        let session = self
                            .peers
                            .entry(from.clone())
                            .or_insert_with(|| PeerSession::new(PeerPhase::Idle));
                        session.phase = PeerPhase::Connected;
                        session.remote_description_set = true;
                        let queued: Vec<Value> = session.pending_candidates.drain(..).collect();
                        self.apply_candidates(&from, queued).await;
                        vec![ClientMessage::WebrtcAnswer {
                            target_connection_id: from,
                            answer,
                        }]
                    }
                    Err(e) => {
                        warn!("Answering {} failed: {}", from, e);
                        self.fail_peer(&from).await;
                        Vec::new()
                    }
                }
            }

            ServerMessage::WebrtcAnswer { from, answer, .. } => {
                match self.peers.get(&from) {
                    Some(session)
                        if matches!(session.phase, PeerPhase::OfferSent | PeerPhase::AnswerPending) => {}
                    Some(session) => {
                        debug!("Answer from {} in phase {:?}, ignoring", from, session.phase);
                        return Vec::new();
                    }
                    None => {
                        debug!("Answer from {} without an offered session, ignoring", from);
                        return Vec::new();
                    }
                }
                match self.negotiator.accept_answer(&from, answer).await {
                    Ok(()) => {
                        let queued: Vec<Value> = match self.peers.get_mut(&from) {
                            Some(session) => {
                                session.phase = PeerPhase::Connected;
                                session.remote_description_set = true;
                                session.pending_candidates.drain(..).collect()
                            }
                            None => Vec::new(),
                        };
                        self.apply_candidates(&from, queued).await;
                    }
                    Err(e) => {
                        warn!("Answer from {} failed to apply: {}", from, e);
                        self.fail_peer(&from).await;
                    }
                }
                Vec::new()
            }

            ServerMessage::WebrtcIceCandidate { from, candidate, .. } => {
                let Some(session) = self.peers.get_mut(&from) else {
                    debug!("Candidate from {} without a session, dropping", from);
                    return Vec::new();
                };
                if session.remote_description_set {
                    self.apply_candidates(&from, vec![candidate]).await;
                } else {
                    if session.phase == PeerPhase::OfferSent {
                        session.phase = PeerPhase::AnswerPending;
                    }
                    session.pending_candidates.push(candidate);
                }
                Vec::new()
            }

            ServerMessage::ParticipantLeft { meeting_id, .. } => {
                self.drop_identity(&meeting_id).await;
                Vec::new()
            }

            ServerMessage::ParticipantRemoved { meeting_id, .. } => {
                if meeting_id == self.own_meeting_id {
                    // We were evicted; every link goes down with us
                    self.close_all().await;
                } else {
                    self.drop_identity(&meeting_id).await;
                }
                Vec::new()
            }

            // Presence and control traffic carries no negotiation state
            ServerMessage::ParticipantCount { .. }
            | ServerMessage::UserSpeaking { .. }
            | ServerMessage::ParticipantMuted { .. }
            | ServerMessage::MonitorStarted { .. }
            | ServerMessage::Error { .. } => Vec::new(),
        }
    }

    /// Tear down every peer link and forget the roster.
    pub async fn close_all(&mut self) {
        let peers: Vec<String> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.negotiator.close(&peer).await;
        }
        self.peers.clear();
        self.identities.clear();
    }

    pub fn phase(&self, connection_id: &str) -> Option<PeerPhase> {
        self.peers.get(connection_id).map(|s| s.phase)
    }

    /// Peers with an active (non-closed) session.
    pub fn peer_count(&self) -> usize {
        self.peers.values().filter(|s| s.phase != PeerPhase::Closed).count()
    }

    async fn apply_candidates(&mut self, peer: &str, candidates: Vec<Value>) {
        for candidate in candidates {
            if let Err(e) = self.negotiator.add_ice_candidate(peer, candidate).await {
                debug!("Candidate for {} rejected: {}", peer, e);
            }
        }
    }

    /// A failed exchange leaves the session in the table as Closed so a
    /// stray answer or candidate from that peer is ignored, not re-queued.
    async fn fail_peer(&mut self, peer: &str) {
        self.negotiator.close(peer).await;
        let session = self
            .peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerSession::new(PeerPhase::Closed));
        session.phase = PeerPhase::Closed;
        session.pending_candidates.clear();
    }

    async fn drop_identity(&mut self, meeting_id: &str) {
        let Some(peer) = self.identities.remove(meeting_id) else {
            return;
        };
        if self.peers.remove(&peer).is_some() {
            self.negotiator.close(&peer).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::ParticipantInfo;
    use serde_json::json;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("negotiation failed")]
    struct FakeError;

    /// Records every call; optionally fails one operation by name.
    #[derive(Default)]
    struct FakeNegotiator {
        calls: Vec<String>,
        fail_on: Option<&'static str>,
    }

    impl FakeNegotiator {
        fn failing(op: &'static str) -> Self {
            Self { calls: Vec::new(), fail_on: Some(op) }
        }

        fn check(&mut self, op: &'static str, peer: &str) -> Result<(), FakeError> {
            self.calls.push(format!("{op}:{peer}"));
            if self.fail_on == Some(op) {
                Err(FakeError)
            } else {
                Ok(())
            }
        }
    }

    impl MediaNegotiator for FakeNegotiator {
        type Error = FakeError;

        async fn create_offer(&mut self, peer: &str) -> Result<Value, FakeError> {
            self.check("create_offer", peer)?;
            Ok(json!({"type": "offer", "sdp": format!("offer-for-{peer}")}))
        }

        async fn accept_offer(&mut self, peer: &str, _offer: Value) -> Result<Value, FakeError> {
            self.check("accept_offer", peer)?;
            Ok(json!({"type": "answer", "sdp": format!("answer-for-{peer}")}))
        }

        async fn accept_answer(&mut self, peer: &str, _answer: Value) -> Result<(), FakeError> {
            self.check("accept_answer", peer)
        }

        async fn add_ice_candidate(&mut self, peer: &str, candidate: Value) -> Result<(), FakeError> {
            self.calls.push(format!(
                "add_ice_candidate:{peer}:{}",
                candidate["label"].as_str().unwrap_or("?")
            ));
            Ok(())
        }

        async fn close(&mut self, peer: &str) {
            self.calls.push(format!("close:{peer}"));
        }
    }

    fn info(meeting_id: &str, connection_id: &str) -> ParticipantInfo {
        ParticipantInfo {
            meeting_id: meeting_id.to_string(),
            name: format!("name-{meeting_id}"),
            connection_id: connection_id.to_string(),
            muted: false,
        }
    }

    fn table() -> PeerTable<FakeNegotiator> {
        PeerTable::new(FakeNegotiator::default(), "SC-SELF0000")
    }

    #[tokio::test]
    async fn test_newcomer_waits_for_offers() {
        let mut table = table();
        let outbound = table
            .handle_event(ServerMessage::RoomJoined {
                room_number: 1,
                participants: vec![
                    info("SC-SELF0000", "conn-self"),
                    info("SC-AAAA0001", "conn-a"),
                    info("SC-BBBB0002", "conn-b"),
                ],
            })
            .await;
        assert!(outbound.is_empty());
        assert_eq!(table.peer_count(), 0);
        assert!(table.negotiator.calls.is_empty());
    }

    #[tokio::test]
    async fn test_existing_member_offers_to_the_newcomer() {
        let mut table = table();
        let outbound = table
            .handle_event(ServerMessage::ParticipantJoined {
                participant: info("SC-AAAA0001", "conn-a"),
            })
            .await;

        assert_eq!(outbound.len(), 1);
        match &outbound[0] {
            ClientMessage::WebrtcOffer { target_connection_id, offer } => {
                assert_eq!(target_connection_id, "conn-a");
                assert_eq!(offer["sdp"], "offer-for-conn-a");
            }
            other => panic!("expected an offer, got {other:?}"),
        }
        assert_eq!(table.phase("conn-a"), Some(PeerPhase::OfferSent));
    }

    #[tokio::test]
    async fn test_incoming_offer_is_answered() {
        let mut table = table();
        let outbound = table
            .handle_event(ServerMessage::WebrtcOffer {
                from: "conn-a".to_string(),
                from_meeting_id: "SC-AAAA0001".to_string(),
                offer: json!({"type": "offer", "sdp": "v=0"}),
            })
            .await;

        assert_eq!(outbound.len(), 1);
        match &outbound[0] {
            ClientMessage::WebrtcAnswer { target_connection_id, answer } => {
                assert_eq!(target_connection_id, "conn-a");
                assert_eq!(answer["sdp"], "answer-for-conn-a");
            }
            other => panic!("expected an answer, got {other:?}"),
        }
        assert_eq!(table.phase("conn-a"), Some(PeerPhase::Connected));
    }

    #[tokio::test]
    async fn test_answer_completes_an_offered_session() {
        let mut table = table();
        table
            .handle_event(ServerMessage::ParticipantJoined {
                participant: info("SC-AAAA0001", "conn-a"),
            })
            .await;

        let outbound = table
            .handle_event(ServerMessage::WebrtcAnswer {
                from: "conn-a".to_string(),
                from_meeting_id: "SC-AAAA0001".to_string(),
                answer: json!({"type": "answer", "sdp": "v=0"}),
            })
            .await;
        assert!(outbound.is_empty());
        assert_eq!(table.phase("conn-a"), Some(PeerPhase::Connected));
        assert!(table.negotiator.calls.contains(&"accept_answer:conn-a".to_string()));
    }

    #[tokio::test]
    async fn test_candidates_queue_until_the_answer_lands() {
        let mut table = table();
        table
            .handle_event(ServerMessage::ParticipantJoined {
                participant: info("SC-AAAA0001", "conn-a"),
            })
            .await;

        for label in ["first", "second"] {
            table
                .handle_event(ServerMessage::WebrtcIceCandidate {
                    from: "conn-a".to_string(),
                    from_meeting_id: "SC-AAAA0001".to_string(),
                    candidate: json!({"label": label}),
                })
                .await;
        }
        assert_eq!(table.phase("conn-a"), Some(PeerPhase::AnswerPending));
        assert!(!table.negotiator.calls.iter().any(|c| c.starts_with("add_ice_candidate")));

        table
            .handle_event(ServerMessage::WebrtcAnswer {
                from: "conn-a".to_string(),
                from_meeting_id: "SC-AAAA0001".to_string(),
                answer: json!({"type": "answer", "sdp": "v=0"}),
            })
            .await;

        // Queued candidates applied in arrival order
        let applied: Vec<&String> = table
            .negotiator
            .calls
            .iter()
            .filter(|c| c.starts_with("add_ice_candidate"))
            .collect();
        assert_eq!(applied, vec!["add_ice_candidate:conn-a:first", "add_ice_candidate:conn-a:second"]);
    }

    #[tokio::test]
    async fn test_candidate_after_connection_applies_immediately() {
        let mut table = table();
        table
            .handle_event(ServerMessage::WebrtcOffer {
                from: "conn-a".to_string(),
                from_meeting_id: "SC-AAAA0001".to_string(),
                offer: json!({"type": "offer", "sdp": "v=0"}),
            })
            .await;

        table
            .handle_event(ServerMessage::WebrtcIceCandidate {
                from: "conn-a".to_string(),
                from_meeting_id: "SC-AAAA0001".to_string(),
                candidate: json!({"label": "late"}),
            })
            .await;
        assert!(table
            .negotiator
            .calls
            .contains(&"add_ice_candidate:conn-a:late".to_string()));
    }

    #[tokio::test]
    async fn test_answer_without_a_session_is_ignored() {
        let mut table = table();
        let outbound = table
            .handle_event(ServerMessage::WebrtcAnswer {
                from: "conn-ghost".to_string(),
                from_meeting_id: "SC-GHOST001".to_string(),
                answer: json!({"type": "answer"}),
            })
            .await;
        assert!(outbound.is_empty());
        assert!(table.negotiator.calls.is_empty());
    }

    #[tokio::test]
    async fn test_failed_offer_closes_the_peer() {
        let mut table = PeerTable::new(FakeNegotiator::failing("create_offer"), "SC-SELF0000");
        let outbound = table
            .handle_event(ServerMessage::ParticipantJoined {
                participant: info("SC-AAAA0001", "conn-a"),
            })
            .await;

        assert!(outbound.is_empty());
        assert_eq!(table.phase("conn-a"), Some(PeerPhase::Closed));
        assert!(table.negotiator.calls.contains(&"close:conn-a".to_string()));
        assert_eq!(table.peer_count(), 0);

        // A late answer from the failed peer stays ignored
        let outbound = table
            .handle_event(ServerMessage::WebrtcAnswer {
                from: "conn-a".to_string(),
                from_meeting_id: "SC-AAAA0001".to_string(),
                answer: json!({"type": "answer"}),
            })
            .await;
        assert!(outbound.is_empty());
        assert_eq!(table.phase("conn-a"), Some(PeerPhase::Closed));
    }

    #[tokio::test]
    async fn test_departure_tears_down_the_link() {
        let mut table = table();
        table
            .handle_event(ServerMessage::ParticipantJoined {
                participant: info("SC-AAAA0001", "conn-a"),
            })
            .await;
        assert_eq!(table.peer_count(), 1);

        table
            .handle_event(ServerMessage::ParticipantLeft {
                meeting_id: "SC-AAAA0001".to_string(),
                name: "name-SC-AAAA0001".to_string(),
            })
            .await;
        assert_eq!(table.peer_count(), 0);
        assert!(table.negotiator.calls.contains(&"close:conn-a".to_string()));

        // Double departure closes nothing twice
        let closes_before = table.negotiator.calls.iter().filter(|c| c.starts_with("close")).count();
        table
            .handle_event(ServerMessage::ParticipantLeft {
                meeting_id: "SC-AAAA0001".to_string(),
                name: "name-SC-AAAA0001".to_string(),
            })
            .await;
        let closes_after = table.negotiator.calls.iter().filter(|c| c.starts_with("close")).count();
        assert_eq!(closes_before, closes_after);
    }

    #[tokio::test]
    async fn test_own_removal_closes_every_link() {
        let mut table = table();
        for (meeting_id, conn) in [("SC-AAAA0001", "conn-a"), ("SC-BBBB0002", "conn-b")] {
            table
                .handle_event(ServerMessage::ParticipantJoined {
                    participant: info(meeting_id, conn),
                })
                .await;
        }
        assert_eq!(table.peer_count(), 2);

        table
            .handle_event(ServerMessage::ParticipantRemoved {
                meeting_id: "SC-SELF0000".to_string(),
                by: "Ops".to_string(),
            })
            .await;
        assert_eq!(table.peer_count(), 0);
        assert!(table.negotiator.calls.contains(&"close:conn-a".to_string()));
        assert!(table.negotiator.calls.contains(&"close:conn-b".to_string()));
    }
}

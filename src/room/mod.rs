#![forbid(unsafe_code)]

// Room module - fixed room set, participant tracking, presence broadcasts

use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{ParticipantInfo, ServerMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Room not found")]
    RoomNotFound,
    #[error("Room is full")]
    RoomFull,
    #[error("Meeting ID already active in another room")]
    MeetingIdInUse,
    #[error("Participant not found")]
    ParticipantNotFound,
}

/// Participant in a room. `connection_id` and `sender` are routing handles
/// into the live connection; the gateway owns the connection's lifecycle.
#[derive(Clone)]
pub struct Participant {
    pub user_id: String,
    pub meeting_id: String,
    pub name: String,
    pub connection_id: String,
    pub muted: bool,
    pub joined_at: DateTime<Utc>,
    pub sender: mpsc::Sender<Arc<String>>,
}

impl Participant {
    fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            meeting_id: self.meeting_id.clone(),
            name: self.name.clone(),
            connection_id: self.connection_id.clone(),
            muted: self.muted,
        }
    }
}

/// A join request, carried into the registry as one unit so the roster entry
/// is written atomically under the room lock.
pub struct PendingParticipant {
    pub user_id: String,
    pub meeting_id: String,
    pub name: String,
    pub connection_id: String,
    pub sender: mpsc::Sender<Arc<String>>,
}

/// Room state. Participants keep join order; monitors receive every room
/// broadcast but never appear in the roster or count toward capacity.
pub struct Room {
    pub number: u8,
    pub name: String,
    pub capacity: usize,
    pub active: bool,
    participants: Vec<Participant>,
    monitors: HashMap<String, mpsc::Sender<Arc<String>>>,
}

impl Room {
    fn new(number: u8, capacity: usize) -> Self {
        Self {
            number,
            name: format!("Room {number}"),
            capacity,
            active: true,
            participants: Vec::new(),
            monitors: HashMap::new(),
        }
    }

    /// Send a message to every participant and monitor.
    fn broadcast_all(&self, message: &ServerMessage) {
        let Some(json) = encode(message) else { return };
        for participant in &self.participants {
            deliver(self.number, &participant.meeting_id, &participant.sender, &json);
        }
        self.deliver_to_monitors(&json);
    }

    /// Send a message to everyone except one participant. Monitors always
    /// receive the copy.
    fn broadcast_except(&self, excluded_meeting_id: &str, message: &ServerMessage) {
        let Some(json) = encode(message) else { return };
        for participant in &self.participants {
            if participant.meeting_id != excluded_meeting_id {
                deliver(self.number, &participant.meeting_id, &participant.sender, &json);
            }
        }
        self.deliver_to_monitors(&json);
    }

    /// Send a message to a single participant.
    fn send_to(&self, meeting_id: &str, message: &ServerMessage) {
        let Some(json) = encode(message) else { return };
        if let Some(participant) = self.participants.iter().find(|p| p.meeting_id == meeting_id) {
            deliver(self.number, &participant.meeting_id, &participant.sender, &json);
        }
    }

    fn deliver_to_monitors(&self, json: &Arc<String>) {
        for (connection_id, sender) in &self.monitors {
            deliver(self.number, connection_id, sender, json);
        }
    }

    fn roster(&self) -> Vec<ParticipantInfo> {
        self.participants.iter().map(Participant::info).collect()
    }
}

/// Serialize once per broadcast; every recipient shares the allocation.
fn encode(message: &ServerMessage) -> Option<Arc<String>> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize broadcast message: {}", e);
            None
        }
    }
}

/// Non-blocking delivery into a bounded per-client channel. A full or closed
/// channel costs only that recipient its copy.
fn deliver(room_number: u8, target: &str, sender: &mpsc::Sender<Arc<String>>, json: &Arc<String>) {
    match sender.try_send(json.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for {} in room {}, dropping message", target, room_number);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for {} in room {} (disconnected)", target, room_number);
        }
    }
}

/// Room occupancy snapshot for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_number: u8,
    pub name: String,
    pub capacity: usize,
    pub participants: Vec<ParticipantInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_number: u8,
    pub name: String,
    pub participant_count: usize,
    pub capacity: usize,
    pub is_full: bool,
}

/// Registry over the fixed room set.
///
/// The room map is built once at startup and never changes, so there is no
/// outer map lock: each room has its own tokio::sync::RwLock scoping its
/// mutations, and a registry-wide occupancy index (meeting ID -> room)
/// enforces global uniqueness. The index is a std::sync::RwLock taken only
/// inside a room lock and never held across an await; lock order is always
/// room first, then index.
///
/// Presence broadcasts are sent while still holding the room write lock that
/// applied the mutation, so members observe membership events in mutation
/// order.
pub struct RoomRegistry {
    rooms: HashMap<u8, Arc<TokioRwLock<Room>>>,
    occupancy: StdRwLock<HashMap<String, u8>>,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(room_count: u8, capacity: usize, metrics: ServerMetrics) -> Self {
        let mut rooms = HashMap::new();
        for number in 1..=room_count {
            rooms.insert(number, Arc::new(TokioRwLock::new(Room::new(number, capacity))));
        }
        info!("{} rooms initialized, capacity {} each", room_count, capacity);
        Self {
            rooms,
            occupancy: StdRwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Add a participant to a room.
    ///
    /// Every failure is checked before any state is touched, so a rejected
    /// join leaves both the roster and the occupancy index exactly as they
    /// were. On success the joiner receives its roster reply and the room
    /// its broadcasts under the same write lock that applied the mutation.
    pub async fn join(
        &self,
        room_number: u8,
        pending: PendingParticipant,
    ) -> Result<Vec<ParticipantInfo>, RegistryError> {
        let room_lock = self.rooms.get(&room_number).ok_or(RegistryError::RoomNotFound)?;
        let mut room = room_lock.write().await;
        if !room.active {
            return Err(RegistryError::RoomNotFound);
        }
        if room.participants.len() >= room.capacity {
            return Err(RegistryError::RoomFull);
        }

        {
            let mut occupancy = self.occupancy.write().unwrap_or_else(|e| e.into_inner());
            if occupancy.contains_key(&pending.meeting_id) {
                return Err(RegistryError::MeetingIdInUse);
            }
            occupancy.insert(pending.meeting_id.clone(), room_number);
        }

        let participant = Participant {
            user_id: pending.user_id,
            meeting_id: pending.meeting_id,
            name: pending.name,
            connection_id: pending.connection_id,
            muted: false,
            joined_at: Utc::now(),
            sender: pending.sender,
        };
        let joined = participant.info();
        room.participants.push(participant);
        self.metrics.inc_joins();
        info!("{} ({}) joined room {}", joined.name, joined.meeting_id, room_number);

        let roster = room.roster();
        room.send_to(&joined.meeting_id, &ServerMessage::RoomJoined {
            room_number,
            participants: roster.clone(),
        });
        let excluded_meeting_id = joined.meeting_id.clone();
        room.broadcast_except(&excluded_meeting_id, &ServerMessage::ParticipantJoined {
            participant: joined,
        });
        room.broadcast_all(&ServerMessage::ParticipantCount {
            room_number,
            count: room.participants.len(),
        });

        Ok(roster)
    }

    /// Remove a participant. Idempotent: an unknown room or an absent
    /// participant is a no-op, and the departure broadcasts fire only when a
    /// removal actually happened. The return value tells the caller whether
    /// it did, which is what keeps the departure broadcast exactly-once when
    /// an explicit leave races the disconnect cleanup.
    pub async fn leave(&self, room_number: u8, meeting_id: &str) -> bool {
        let Some(room_lock) = self.rooms.get(&room_number) else {
            return false;
        };
        let mut room = room_lock.write().await;
        let Some(index) = room.participants.iter().position(|p| p.meeting_id == meeting_id) else {
            return false;
        };
        let participant = room.participants.remove(index);
        self.forget_occupancy(meeting_id);
        self.metrics.inc_leaves();
        info!("{} ({}) left room {}", participant.name, participant.meeting_id, room_number);

        room.broadcast_all(&ServerMessage::ParticipantLeft {
            meeting_id: participant.meeting_id.clone(),
            name: participant.name.clone(),
        });
        room.broadcast_all(&ServerMessage::ParticipantCount {
            room_number,
            count: room.participants.len(),
        });
        true
    }

    /// Remove a participant from every room it appears in. Global uniqueness
    /// makes more than one hit an anomaly; the scan tolerates it anyway and
    /// reports the rooms affected.
    pub async fn leave_everywhere(&self, meeting_id: &str) -> Vec<u8> {
        let mut numbers: Vec<u8> = self.rooms.keys().copied().collect();
        numbers.sort_unstable();

        let mut affected = Vec::new();
        for number in numbers {
            if self.leave(number, meeting_id).await {
                affected.push(number);
            }
        }
        if affected.len() > 1 {
            warn!("Meeting ID {} was present in {} rooms", meeting_id, affected.len());
        }
        affected
    }

    /// Flip a participant's mute flag and tell the whole room who did it.
    pub async fn set_muted(
        &self,
        room_number: u8,
        meeting_id: &str,
        muted: bool,
        by: &str,
    ) -> Result<(), RegistryError> {
        let room_lock = self.rooms.get(&room_number).ok_or(RegistryError::RoomNotFound)?;
        let mut room = room_lock.write().await;
        let participant = room
            .participants
            .iter_mut()
            .find(|p| p.meeting_id == meeting_id)
            .ok_or(RegistryError::ParticipantNotFound)?;
        participant.muted = muted;

        info!("{} {} in room {} by {}", meeting_id, if muted { "muted" } else { "unmuted" }, room_number, by);
        room.broadcast_all(&ServerMessage::ParticipantMuted {
            meeting_id: meeting_id.to_string(),
            muted,
            by: by.to_string(),
        });
        Ok(())
    }

    /// Admin-initiated removal. Same idempotent mechanics as `leave`, except
    /// the removal notice reaches the removed participant as well as the
    /// remaining members.
    pub async fn remove(&self, room_number: u8, meeting_id: &str, by: &str) -> bool {
        let Some(room_lock) = self.rooms.get(&room_number) else {
            return false;
        };
        let mut room = room_lock.write().await;
        let Some(index) = room.participants.iter().position(|p| p.meeting_id == meeting_id)
        else {
            return false;
        };
        let participant = room.participants.remove(index);
        self.forget_occupancy(meeting_id);
        self.metrics.inc_leaves();
        info!("{} ({}) removed from room {} by {}", participant.name, meeting_id, room_number, by);

        let notice = ServerMessage::ParticipantRemoved {
            meeting_id: participant.meeting_id.clone(),
            by: by.to_string(),
        };
        // The removed participant must learn of its own removal
        if let Some(json) = encode(&notice) {
            deliver(room_number, &participant.meeting_id, &participant.sender, &json);
        }
        room.broadcast_all(&notice);
        room.broadcast_all(&ServerMessage::ParticipantCount {
            room_number,
            count: room.participants.len(),
        });
        true
    }

    /// Transient speaking indicator; fan-out only, never registry state.
    pub async fn broadcast_speaking(
        &self,
        room_number: u8,
        meeting_id: &str,
        name: &str,
        speaking: bool,
    ) {
        let Some(room_lock) = self.rooms.get(&room_number) else {
            return;
        };
        let room = room_lock.read().await;
        room.broadcast_except(meeting_id, &ServerMessage::UserSpeaking {
            meeting_id: meeting_id.to_string(),
            name: name.to_string(),
            speaking,
        });
    }

    /// Subscribe a connection as a silent room observer.
    pub async fn add_monitor(
        &self,
        room_number: u8,
        connection_id: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> Result<(), RegistryError> {
        let room_lock = self.rooms.get(&room_number).ok_or(RegistryError::RoomNotFound)?;
        let mut room = room_lock.write().await;
        room.monitors.insert(connection_id.to_string(), sender);
        debug!("Monitor {} watching room {}", connection_id, room_number);
        Ok(())
    }

    pub async fn remove_monitor(&self, room_number: u8, connection_id: &str) {
        let Some(room_lock) = self.rooms.get(&room_number) else {
            return;
        };
        let mut room = room_lock.write().await;
        if room.monitors.remove(connection_id).is_some() {
            debug!("Monitor {} stopped watching room {}", connection_id, room_number);
        }
    }

    pub async fn get(&self, room_number: u8) -> Option<RoomSnapshot> {
        let room_lock = self.rooms.get(&room_number)?;
        let room = room_lock.read().await;
        if !room.active {
            return None;
        }
        Some(RoomSnapshot {
            room_number: room.number,
            name: room.name.clone(),
            capacity: room.capacity,
            participants: room.roster(),
        })
    }

    pub async fn list(&self) -> Vec<RoomSnapshot> {
        let mut numbers: Vec<u8> = self.rooms.keys().copied().collect();
        numbers.sort_unstable();

        let mut snapshots = Vec::with_capacity(numbers.len());
        for number in numbers {
            if let Some(snapshot) = self.get(number).await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    pub async fn stats(&self) -> Vec<RoomStats> {
        let mut numbers: Vec<u8> = self.rooms.keys().copied().collect();
        numbers.sort_unstable();

        let mut stats = Vec::with_capacity(numbers.len());
        for number in numbers {
            let Some(room_lock) = self.rooms.get(&number) else {
                continue;
            };
            let room = room_lock.read().await;
            stats.push(RoomStats {
                room_number: room.number,
                name: room.name.clone(),
                participant_count: room.participants.len(),
                capacity: room.capacity,
                is_full: room.participants.len() >= room.capacity,
            });
        }
        stats
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub async fn total_participant_count(&self) -> usize {
        let mut total = 0;
        for room_lock in self.rooms.values() {
            total += room_lock.read().await.participants.len();
        }
        total
    }

    fn forget_occupancy(&self, meeting_id: &str) {
        let mut occupancy = self.occupancy.write().unwrap_or_else(|e| e.into_inner());
        occupancy.remove(meeting_id);
    }

    #[cfg(test)]
    fn occupancy_len(&self) -> usize {
        self.occupancy.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

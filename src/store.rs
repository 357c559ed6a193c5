#![forbid(unsafe_code)]

// Store module - PostgreSQL mirror of pool and room state

use crate::identity::MeetingIdentity;
use crate::room::RoomSnapshot;
use crate::signaling::protocol::ParticipantInfo;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;

// The registry and the identity pool are authoritative; the database is a
// mirror for restarts and offline admin queries. Every write here is
// best-effort: a failed mirror write is logged and the in-memory operation
// stands.

/// Load the identity pool as persisted by a previous run.
pub async fn load_identities(pool: &PgPool) -> anyhow::Result<Vec<MeetingIdentity>> {
    let rows = sqlx::query_as::<_, (String, bool, Option<String>, Option<DateTime<Utc>>)>(
        "SELECT token, assigned, owner_id, assigned_at FROM meeting_ids",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(token, assigned, owner_id, assigned_at)| MeetingIdentity {
            token,
            assigned,
            owner_id,
            assigned_at,
        })
        .collect())
}

/// Persist freshly minted identity tokens. Tokens already present are left
/// untouched, so replays after a partial failure are harmless.
pub async fn save_new_identities(db: Option<&PgPool>, tokens: &[String]) {
    let Some(pool) = db else { return };
    if tokens.is_empty() {
        return;
    }

    let result = sqlx::query(
        "INSERT INTO meeting_ids (token)
         SELECT unnest($1::text[])
         ON CONFLICT (token) DO NOTHING",
    )
    .bind(tokens)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!("Failed to persist {} new meeting IDs: {}", tokens.len(), e);
    }
}

/// Mirror one identity's assignment state.
pub async fn save_identity(db: Option<&PgPool>, identity: &MeetingIdentity) {
    let Some(pool) = db else { return };

    let result = sqlx::query(
        "INSERT INTO meeting_ids (token, assigned, owner_id, assigned_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (token) DO UPDATE
         SET assigned = $2, owner_id = $3, assigned_at = $4",
    )
    .bind(&identity.token)
    .bind(identity.assigned)
    .bind(&identity.owner_id)
    .bind(identity.assigned_at)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!("Failed to persist meeting ID {}: {}", identity.token, e);
    }
}

pub async fn release_identity(db: Option<&PgPool>, token: &str) {
    let Some(pool) = db else { return };

    let result = sqlx::query(
        "UPDATE meeting_ids
         SET assigned = FALSE, owner_id = NULL, assigned_at = NULL
         WHERE token = $1",
    )
    .bind(token)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!("Failed to persist release of meeting ID {}: {}", token, e);
    }
}

/// Mirror the fixed room set so offline queries see current names and
/// capacities.
pub async fn ensure_rooms(db: Option<&PgPool>, rooms: &[RoomSnapshot]) {
    let Some(pool) = db else { return };

    for room in rooms {
        let result = sqlx::query(
            "INSERT INTO rooms (room_number, name, capacity)
             VALUES ($1, $2, $3)
             ON CONFLICT (room_number) DO UPDATE
             SET name = $2, capacity = $3",
        )
        .bind(room.room_number as i16)
        .bind(&room.name)
        .bind(room.capacity as i32)
        .execute(pool)
        .await;

        if let Err(e) = result {
            warn!("Failed to persist room {}: {}", room.room_number, e);
        }
    }
}

/// Purge participant rows on startup. Live membership never survives a
/// restart, only the identity pool does.
pub async fn clear_participants(db: Option<&PgPool>) {
    let Some(pool) = db else { return };

    match sqlx::query("DELETE FROM room_participants").execute(pool).await {
        Ok(result) if result.rows_affected() > 0 => {
            warn!("Cleared {} stale participant rows from a previous run", result.rows_affected());
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to clear stale participant rows: {}", e),
    }
}

pub async fn record_join(
    db: Option<&PgPool>,
    room_number: u8,
    user_id: &str,
    participant: &ParticipantInfo,
) {
    let Some(pool) = db else { return };

    let result = sqlx::query(
        "INSERT INTO room_participants (meeting_id, room_number, user_id, name, connection_id, muted)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (meeting_id) DO UPDATE
         SET room_number = $2, user_id = $3, name = $4, connection_id = $5, muted = $6, joined_at = now()",
    )
    .bind(&participant.meeting_id)
    .bind(room_number as i16)
    .bind(user_id)
    .bind(&participant.name)
    .bind(&participant.connection_id)
    .bind(participant.muted)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!("Failed to persist join of {}: {}", participant.meeting_id, e);
    }
}

pub async fn record_leave(db: Option<&PgPool>, meeting_id: &str) {
    let Some(pool) = db else { return };

    let result = sqlx::query("DELETE FROM room_participants WHERE meeting_id = $1")
        .bind(meeting_id)
        .execute(pool)
        .await;

    if let Err(e) = result {
        warn!("Failed to persist departure of {}: {}", meeting_id, e);
    }
}

pub async fn record_muted(db: Option<&PgPool>, meeting_id: &str, muted: bool) {
    let Some(pool) = db else { return };

    let result = sqlx::query("UPDATE room_participants SET muted = $2 WHERE meeting_id = $1")
        .bind(meeting_id)
        .bind(muted)
        .execute(pool)
        .await;

    if let Err(e) = result {
        warn!("Failed to persist mute state of {}: {}", meeting_id, e);
    }
}

/// Account gate for authentication: `None` means the user row is missing.
pub async fn user_active(pool: &PgPool, user_id: &str) -> Result<Option<bool>, sqlx::Error> {
    sqlx::query_scalar::<_, bool>("SELECT is_active FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without a pool every mirror write degrades to a no-op
    #[tokio::test]
    async fn test_mirror_writes_are_noops_without_a_pool() {
        save_new_identities(None, &["SC-AAAA0001".to_string()]).await;
        release_identity(None, "SC-AAAA0001").await;
        clear_participants(None).await;
        record_leave(None, "SC-AAAA0001").await;
        record_muted(None, "SC-AAAA0001", true).await;
    }
}

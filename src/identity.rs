#![forbid(unsafe_code)]

// Identity pool - fixed set of meeting ID tokens with exactly-once assignment

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// All pool tokens share this prefix.
pub const MEETING_ID_PREFIX: &str = "SC-";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Meeting ID not found")]
    NotFound,
    #[error("Meeting ID already assigned")]
    AlreadyAssigned,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeetingIdentity {
    pub token: String,
    pub assigned: bool,
    pub owner_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
}

impl MeetingIdentity {
    fn unassigned(token: String) -> Self {
        Self {
            token,
            assigned: false,
            owner_id: None,
            assigned_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub assigned: usize,
    pub available: usize,
}

/// In-memory authoritative pool of meeting identities.
///
/// One pool-wide lock scopes every mutation, so an assign either observes a
/// token free and takes it, or observes it held and fails. Tokens are never
/// regenerated or invalidated once provisioned.
pub struct IdentityPool {
    entries: StdRwLock<HashMap<String, MeetingIdentity>>,
}

impl IdentityPool {
    pub fn new() -> Self {
        Self {
            entries: StdRwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the pool from persisted rows at startup.
    pub fn from_entries(entries: Vec<MeetingIdentity>) -> Self {
        let map: HashMap<String, MeetingIdentity> = entries
            .into_iter()
            .map(|e| (e.token.clone(), e))
            .collect();
        info!("Loaded {} meeting identities", map.len());
        Self {
            entries: StdRwLock::new(map),
        }
    }

    /// Top the pool up to at least `target` tokens. Existing tokens are left
    /// untouched; only the shortfall is generated, retrying on the (rare)
    /// collision with an existing token. Returns the newly minted tokens and
    /// the resulting pool size.
    pub fn provision(&self, target: usize) -> (Vec<String>, usize) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        let shortfall = target.saturating_sub(entries.len());
        let mut minted = Vec::with_capacity(shortfall);
        for _ in 0..shortfall {
            let token = loop {
                let candidate = generate_token();
                if !entries.contains_key(&candidate) {
                    break candidate;
                }
            };
            entries.insert(token.clone(), MeetingIdentity::unassigned(token.clone()));
            minted.push(token);
        }

        if !minted.is_empty() {
            info!("Provisioned {} meeting identities ({} total)", minted.len(), entries.len());
        }
        (minted, entries.len())
    }

    /// Atomically claim a free token for `owner_id`. Exactly one of any set
    /// of concurrent callers succeeds; the rest see `AlreadyAssigned`.
    pub fn assign(&self, token: &str, owner_id: &str) -> Result<MeetingIdentity, IdentityError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(token).ok_or(IdentityError::NotFound)?;
        if entry.assigned {
            return Err(IdentityError::AlreadyAssigned);
        }
        entry.assigned = true;
        entry.owner_id = Some(owner_id.to_string());
        entry.assigned_at = Some(Utc::now());
        debug!("Assigned meeting ID {} to {}", token, owner_id);
        Ok(entry.clone())
    }

    /// Claim any free token for `owner_id`, picking and assigning under one
    /// lock so two callers can never race onto the same token.
    pub fn assign_any(&self, owner_id: &str) -> Option<MeetingIdentity> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let token = entries
            .values()
            .find(|e| !e.assigned)
            .map(|e| e.token.clone())?;
        let entry = entries.get_mut(&token)?;
        entry.assigned = true;
        entry.owner_id = Some(owner_id.to_string());
        entry.assigned_at = Some(Utc::now());
        debug!("Assigned meeting ID {} to {}", token, owner_id);
        Some(entry.clone())
    }

    /// Free a token regardless of who holds it. Releasing an already-free
    /// token is a no-op (`Ok(None)`); only an unknown token is an error.
    pub fn release(&self, token: &str) -> Result<Option<MeetingIdentity>, IdentityError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(token).ok_or(IdentityError::NotFound)?;
        if !entry.assigned {
            return Ok(None);
        }
        entry.assigned = false;
        entry.owner_id = None;
        entry.assigned_at = None;
        debug!("Released meeting ID {}", token);
        Ok(Some(entry.clone()))
    }

    /// Read-only existence/assignment check.
    pub fn validate(&self, token: &str) -> Option<bool> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(token).map(|e| e.assigned)
    }

    pub fn stats(&self) -> PoolStats {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let total = entries.len();
        let assigned = entries.values().filter(|e| e.assigned).count();
        PoolStats {
            total,
            assigned,
            available: total - assigned,
        }
    }
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::new()
    }
}

/// `SC-` followed by the first 8 hex digits of a v4 UUID, uppercased.
fn generate_token() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("{}{}", MEETING_ID_PREFIX, raw[..8].to_uppercase())
}

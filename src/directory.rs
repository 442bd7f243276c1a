use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::error::GatewayError;
use crate::wire::RoomId;

// ---------------------------------------------------------------------------
// RoomRecord
// ---------------------------------------------------------------------------

/// Advisory room metadata. Whether a room can actually be joined is decided
/// by the SFU; this record exists for listing and for holding the admin
/// secret that gates destroy/kick.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub room_id: RoomId,
    pub description: String,
    pub is_private: bool,
    pub permanent: bool,
    secret: String,
    pub created_at: DateTime<Utc>,
}

/// Serialisable listing entry. The secret never leaves the record.
#[derive(Debug, Clone, Serialize)]
pub struct RoomListing {
    pub room_id: RoomId,
    pub description: String,
    pub is_private: bool,
}

/// Generate a room admin secret: `rs_` followed by 32 random hex characters.
/// Returned exactly once, in the create response.
fn generate_secret() -> String {
    let mut rng = rand::thread_rng();
    let mut hex = String::with_capacity(32);
    for _ in 0..16 {
        let byte: u8 = rng.gen();
        hex.push_str(&format!("{:02x}", byte));
    }
    format!("rs_{}", hex)
}

// ---------------------------------------------------------------------------
// RoomDirectory
// ---------------------------------------------------------------------------

/// In-memory room directory. Pure bookkeeping, no negotiation logic.
#[derive(Default)]
pub struct RoomDirectory {
    inner: RwLock<HashMap<RoomId, RoomRecord>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record and return the generated admin secret.
    pub fn create(
        &self,
        room_id: RoomId,
        description: &str,
        is_private: bool,
        permanent: bool,
    ) -> Result<String, GatewayError> {
        let mut map = self.inner.write().unwrap();
        if map.contains_key(&room_id) {
            return Err(GatewayError::DuplicateRoom(room_id));
        }
        let secret = generate_secret();
        map.insert(
            room_id,
            RoomRecord {
                room_id,
                description: description.to_string(),
                is_private,
                permanent,
                secret: secret.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(secret)
    }

    pub fn exists(&self, room_id: RoomId) -> bool {
        self.inner.read().unwrap().contains_key(&room_id)
    }

    /// Check an administrative secret against the room's record.
    pub fn authorize(&self, room_id: RoomId, secret: &str) -> Result<(), GatewayError> {
        let map = self.inner.read().unwrap();
        let record = map
            .get(&room_id)
            .ok_or(GatewayError::RoomNotFound(room_id))?;
        if record.secret != secret {
            return Err(GatewayError::Unauthorized);
        }
        Ok(())
    }

    /// Remove the record. Callers authorize first.
    pub fn destroy(&self, room_id: RoomId) -> Option<RoomRecord> {
        self.inner.write().unwrap().remove(&room_id)
    }

    /// All non-destroyed rooms.
    pub fn list(&self) -> Vec<RoomListing> {
        let map = self.inner.read().unwrap();
        let mut rooms: Vec<RoomListing> = map
            .values()
            .map(|r| RoomListing {
                room_id: r.room_id,
                description: r.description.clone(),
                is_private: r.is_private,
            })
            .collect();
        rooms.sort_by_key(|r| r.room_id);
        rooms
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

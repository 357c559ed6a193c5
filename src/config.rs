#![forbid(unsafe_code)]

// Server configuration - environment-driven knobs and static ICE descriptors

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_ROOM_COUNT: u8 = 4;
const DEFAULT_ROOM_CAPACITY: usize = 25;
const DEFAULT_MEETING_ID_POOL: usize = 2000;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Public STUN endpoints used when STUN_URLS is not set.
const DEFAULT_STUN_URLS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// ICE server entry sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Server configuration loaded once at startup.
///
/// The ICE list is assembled here and never changes at runtime: the relay
/// hands out descriptors, it does not mint credentials.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub jwt_secret: Option<String>,
    pub room_count: u8,
    pub room_capacity: usize,
    pub meeting_id_pool: usize,
    pub max_connections: usize,
    pub ice_servers: Vec<IceServer>,
    pub database_url: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port = env_parse("PORT", DEFAULT_PORT);

        let jwt_secret = std::env::var("JWT_SECRET").ok();
        if jwt_secret.is_none() {
            warn!("JWT_SECRET not set - all connection attempts will be rejected");
        }

        let mut room_count = env_parse("ROOM_COUNT", DEFAULT_ROOM_COUNT);
        if room_count == 0 {
            warn!("ROOM_COUNT=0 would leave nothing to join, using default {DEFAULT_ROOM_COUNT}");
            room_count = DEFAULT_ROOM_COUNT;
        }

        let mut room_capacity = env_parse("ROOM_CAPACITY", DEFAULT_ROOM_CAPACITY);
        if room_capacity == 0 {
            warn!("ROOM_CAPACITY=0 would reject all joins, using default {DEFAULT_ROOM_CAPACITY}");
            room_capacity = DEFAULT_ROOM_CAPACITY;
        }

        let meeting_id_pool = env_parse("MEETING_ID_POOL", DEFAULT_MEETING_ID_POOL);

        let mut max_connections = env_parse("MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {DEFAULT_MAX_CONNECTIONS}");
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let stun_urls: Vec<String> = match std::env::var("STUN_URLS") {
            Ok(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
        };

        let turn = std::env::var("TURN_SERVER_URL").ok().filter(|u| !u.is_empty()).map(|url| {
            let username = std::env::var("TURN_USERNAME").unwrap_or_default();
            let credential = std::env::var("TURN_PASSWORD").unwrap_or_default();
            (url, username, credential)
        });
        if let Some((url, _, _)) = &turn {
            info!("TURN configured: {}", url);
        }

        let ice_servers = assemble_ice_servers(stun_urls, turn);

        let database_url = std::env::var("DATABASE_URL").ok();

        Self {
            port,
            jwt_secret,
            room_count,
            room_capacity,
            meeting_id_pool,
            max_connections,
            ice_servers,
            database_url,
        }
    }
}

/// One entry carrying every STUN URL, plus an optional TURN entry with
/// static credentials.
fn assemble_ice_servers(
    stun_urls: Vec<String>,
    turn: Option<(String, String, String)>,
) -> Vec<IceServer> {
    let mut servers = Vec::with_capacity(2);
    if !stun_urls.is_empty() {
        servers.push(IceServer {
            urls: stun_urls,
            username: None,
            credential: None,
        });
    }
    if let Some((url, username, credential)) = turn {
        servers.push(IceServer {
            urls: vec![url],
            username: Some(username),
            credential: Some(credential),
        });
    }
    servers
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

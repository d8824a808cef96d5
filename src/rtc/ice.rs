//! ICE server resolution.

use crate::backend::Backend;
use log::warn;
use std::sync::Arc;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Public STUN server used when the API returns nothing usable. Calls over
/// symmetric NAT will fail without TURN, but STUN alone still connects the
/// common home-network case.
pub const FALLBACK_STUN: &str = "stun:stun.l.google.com:19302";

fn fallback() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![FALLBACK_STUN.to_string()],
        ..Default::default()
    }]
}

/// Fetches ICE servers from the backend, falling back to public STUN when
/// the request fails or returns an empty list.
pub async fn resolve_ice_servers(backend: &Arc<dyn Backend>) -> Vec<RTCIceServer> {
    let entries = match backend.fetch_ice_servers().await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(target: "Rtc", "ICE server fetch failed, using STUN fallback: {e}");
            return fallback();
        }
    };
    if entries.is_empty() {
        warn!(target: "Rtc", "ICE server list empty, using STUN fallback");
        return fallback();
    }

    entries
        .into_iter()
        .map(|entry| RTCIceServer {
            urls: entry.urls,
            username: entry.username.unwrap_or_default(),
            credential: entry.credential.unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::backend::IceServerEntry;

    #[tokio::test]
    async fn test_empty_list_falls_back_to_stun() {
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::new("u1", "User One"));
        let servers = resolve_ice_servers(&backend).await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec![FALLBACK_STUN.to_string()]);
    }

    #[tokio::test]
    async fn test_backend_entries_are_mapped() {
        let mock = MockBackend::new("u1", "User One");
        mock.ice_servers.lock().unwrap().push(IceServerEntry {
            urls: vec!["turn:turn.example.com:3478".to_string()],
            username: Some("alice".to_string()),
            credential: Some("secret".to_string()),
        });
        let backend: Arc<dyn Backend> = Arc::new(mock);
        let servers = resolve_ice_servers(&backend).await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username, "alice");
        assert_eq!(servers[0].credential, "secret");
    }
}

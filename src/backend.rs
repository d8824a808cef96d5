//! REST backend for call lifecycle bookkeeping.
//!
//! The hub only relays; authoritative call records, ICE server credentials
//! and ratings live behind a plain HTTP API. The [`Backend`] trait keeps
//! the call manager testable without a server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Authoritative call record as returned by the API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    #[serde(alias = "CallId")]
    pub call_id: String,
    #[serde(alias = "CallerId")]
    pub caller_id: String,
    #[serde(alias = "CallerName")]
    pub caller_name: String,
    #[serde(alias = "CalleeId")]
    pub callee_id: String,
    #[serde(alias = "CalleeName")]
    pub callee_name: String,
}

/// One ICE server entry from the API, in the shape the browser API uses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerEntry {
    #[serde(alias = "Urls")]
    pub urls: Vec<String>,
    #[serde(default, alias = "Username")]
    pub username: Option<String>,
    #[serde(default, alias = "Credential")]
    pub credential: Option<String>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Creates a call to the given user and returns the authoritative
    /// record.
    async fn initiate_call(&self, callee_id: &str) -> Result<CallRecord, anyhow::Error>;

    /// Accepts or declines a pending invitation. Returns the full record
    /// on accept; decline returns `None`.
    async fn respond_call(
        &self,
        call_id: &str,
        accept: bool,
    ) -> Result<Option<CallRecord>, anyhow::Error>;

    /// Fetches the ICE servers (STUN/TURN) to use for the next call.
    async fn fetch_ice_servers(&self) -> Result<Vec<IceServerEntry>, anyhow::Error>;

    /// Submits a 1-5 post-call rating.
    async fn submit_rating(&self, call_id: &str, rating: u8) -> Result<(), anyhow::Error>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitiateRequest<'a> {
    callee_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RespondRequest<'a> {
    call_id: &'a str,
    accept: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RatingRequest<'a> {
    call_id: &'a str,
    rating: u8,
}

/// Blocking `ureq` backend, driven through `spawn_blocking`.
pub struct UreqBackend {
    base_url: String,
    token: String,
}

impl UreqBackend {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    async fn post_json<T: serde::de::DeserializeOwned + Send + 'static>(
        &self,
        path: &str,
        body: Vec<u8>,
    ) -> Result<T, anyhow::Error> {
        let url = format!("{}{}", self.base_url, path);
        let token = self.token.clone();
        tokio::task::spawn_blocking(move || -> Result<T, anyhow::Error> {
            let response = ureq::post(&url)
                .header("Authorization", &format!("Bearer {token}"))
                .header("Content-Type", "application/json")
                .send(&body[..])?;
            let raw = response.into_body().read_to_vec()?;
            Ok(serde_json::from_slice(&raw)?)
        })
        .await?
    }

    async fn get_json<T: serde::de::DeserializeOwned + Send + 'static>(
        &self,
        path: &str,
    ) -> Result<T, anyhow::Error> {
        let url = format!("{}{}", self.base_url, path);
        let token = self.token.clone();
        tokio::task::spawn_blocking(move || -> Result<T, anyhow::Error> {
            let response = ureq::get(&url)
                .header("Authorization", &format!("Bearer {token}"))
                .call()?;
            let raw = response.into_body().read_to_vec()?;
            Ok(serde_json::from_slice(&raw)?)
        })
        .await?
    }
}

#[async_trait]
impl Backend for UreqBackend {
    async fn initiate_call(&self, callee_id: &str) -> Result<CallRecord, anyhow::Error> {
        let body = serde_json::to_vec(&InitiateRequest { callee_id })?;
        self.post_json("/api/calls/initiate", body).await
    }

    async fn respond_call(
        &self,
        call_id: &str,
        accept: bool,
    ) -> Result<Option<CallRecord>, anyhow::Error> {
        let body = serde_json::to_vec(&RespondRequest { call_id, accept })?;
        if accept {
            let record = self.post_json("/api/calls/respond", body).await?;
            Ok(Some(record))
        } else {
            let url = format!("{}/api/calls/respond", self.base_url);
            let token = self.token.clone();
            tokio::task::spawn_blocking(move || -> Result<(), anyhow::Error> {
                ureq::post(&url)
                    .header("Authorization", &format!("Bearer {token}"))
                    .header("Content-Type", "application/json")
                    .send(&body[..])?;
                Ok(())
            })
            .await??;
            Ok(None)
        }
    }

    async fn fetch_ice_servers(&self) -> Result<Vec<IceServerEntry>, anyhow::Error> {
        self.get_json("/api/calls/ice-servers").await
    }

    async fn submit_rating(&self, call_id: &str, rating: u8) -> Result<(), anyhow::Error> {
        let body = serde_json::to_vec(&RatingRequest { call_id, rating })?;
        let url = format!("{}/api/calls/rating", self.base_url);
        let token = self.token.clone();
        tokio::task::spawn_blocking(move || -> Result<(), anyhow::Error> {
            ureq::post(&url)
                .header("Authorization", &format!("Bearer {token}"))
                .header("Content-Type", "application/json")
                .send(&body[..])?;
            Ok(())
        })
        .await?
    }
}

/// In-memory backend for tests.
pub mod mock {
    use super::{Backend, CallRecord, IceServerEntry};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    pub struct MockBackend {
        local_user_id: String,
        local_display_name: String,
        next_call_id: AtomicU64,
        pub initiated: Mutex<Vec<String>>,
        pub responses: Mutex<Vec<(String, bool)>>,
        pub ratings: Mutex<Vec<(String, u8)>>,
        pub ice_servers: Mutex<Vec<IceServerEntry>>,
        /// When set, `respond_call` fails with this message.
        pub fail_respond: Mutex<Option<String>>,
    }

    impl MockBackend {
        pub fn new(local_user_id: &str, local_display_name: &str) -> Self {
            Self {
                local_user_id: local_user_id.to_string(),
                local_display_name: local_display_name.to_string(),
                next_call_id: AtomicU64::new(1),
                initiated: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
                ratings: Mutex::new(Vec::new()),
                ice_servers: Mutex::new(Vec::new()),
                fail_respond: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        async fn initiate_call(&self, callee_id: &str) -> Result<CallRecord, anyhow::Error> {
            self.initiated.lock().unwrap().push(callee_id.to_string());
            let id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
            Ok(CallRecord {
                call_id: format!("call-{id}"),
                caller_id: self.local_user_id.clone(),
                caller_name: self.local_display_name.clone(),
                callee_id: callee_id.to_string(),
                callee_name: format!("User {callee_id}"),
            })
        }

        async fn respond_call(
            &self,
            call_id: &str,
            accept: bool,
        ) -> Result<Option<CallRecord>, anyhow::Error> {
            if let Some(message) = self.fail_respond.lock().unwrap().clone() {
                return Err(anyhow::anyhow!(message));
            }
            self.responses
                .lock()
                .unwrap()
                .push((call_id.to_string(), accept));
            if accept {
                Ok(Some(CallRecord {
                    call_id: call_id.to_string(),
                    caller_id: "remote-user".to_string(),
                    caller_name: "Remote User".to_string(),
                    callee_id: self.local_user_id.clone(),
                    callee_name: self.local_display_name.clone(),
                }))
            } else {
                Ok(None)
            }
        }

        async fn fetch_ice_servers(&self) -> Result<Vec<IceServerEntry>, anyhow::Error> {
            Ok(self.ice_servers.lock().unwrap().clone())
        }

        async fn submit_rating(&self, call_id: &str, rating: u8) -> Result<(), anyhow::Error> {
            self.ratings
                .lock()
                .unwrap()
                .push((call_id.to_string(), rating));
            Ok(())
        }
    }
}

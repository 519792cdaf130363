//! Cookie-bound server-side sessions.
//!
//! The cookie carries only an opaque id. The payload lives in the
//! [`SessionCache`] under `sess:<id>` and is written once when a session is
//! established; reads never extend its TTL.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{
        header::{InvalidHeaderValue, COOKIE},
        request::Parts,
        HeaderMap, HeaderValue, StatusCode,
    },
};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{cache::SessionCache, config::SessionConfig, state::AppState};

pub const SESSION_PREFIX: &str = "sess:";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionData {
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i32>,
}

/// Pending change to the client's cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieChange {
    Set(String),
    Clear,
}

/// Session state of one request.
#[derive(Debug, Default)]
pub struct Session {
    id: Option<String>,
    data: SessionData,
    cookie: Option<CookieChange>,
}

impl Session {
    pub fn user_id(&self) -> Option<i32> {
        self.data.user_id
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn cookie_change(&self) -> Option<&CookieChange> {
        self.cookie.as_ref()
    }
}

/// Per-request handles passed explicitly into every auth operation.
#[derive(Debug, Default)]
pub struct RequestContext {
    pub session: Session,
}

#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<dyn SessionCache>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn SessionCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn key(id: &str) -> String {
        format!("{SESSION_PREFIX}{id}")
    }

    /// Loads the session named by the cookie. Unknown or expired ids are
    /// treated as anonymous.
    pub async fn load(&self, id: Option<String>) -> anyhow::Result<Session> {
        let Some(id) = id else {
            return Ok(Session::default());
        };
        let Some(raw) = self.cache.get(&Self::key(&id)).await? else {
            debug!("session cookie without live session");
            return Ok(Session::default());
        };
        let data: SessionData = match serde_json::from_str(&raw) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "discarding unreadable session payload");
                SessionData::default()
            }
        };
        Ok(Session {
            id: Some(id),
            data,
            cookie: None,
        })
    }

    /// Like [`load`](Self::load), but a cache failure yields an anonymous
    /// session that still carries the cookie's id so it can be destroyed.
    pub async fn load_or_detached(&self, id: Option<String>) -> Session {
        match self.load(id.clone()).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "session load failed; continuing without session data");
                Session {
                    id,
                    ..Session::default()
                }
            }
        }
    }

    /// Binds `user_id` to a fresh session id. Any previous session of the
    /// request is removed first.
    pub async fn establish(&self, session: &mut Session, user_id: i32) -> anyhow::Result<()> {
        if let Some(old) = session.id.take() {
            self.cache.del(&Self::key(&old)).await?;
        }
        let id = generate_session_id();
        let data = SessionData {
            user_id: Some(user_id),
        };
        let raw = serde_json::to_string(&data).context("encode session")?;
        self.cache.set(&Self::key(&id), &raw, self.ttl).await?;

        session.id = Some(id.clone());
        session.data = data;
        session.cookie = Some(CookieChange::Set(id));
        Ok(())
    }

    /// Deletes the session entry. The in-request state is reset only when
    /// the delete succeeded.
    pub async fn destroy(&self, session: &mut Session) -> anyhow::Result<()> {
        if let Some(id) = session.id.as_deref() {
            self.cache.del(&Self::key(id)).await?;
        }
        session.id = None;
        session.data = SessionData::default();
        session.cookie = Some(CookieChange::Clear);
        Ok(())
    }
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

/// Read the session id from the `Cookie` header.
pub fn extract_session_id(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (key, val) = pair.trim().split_once('=')?;
            (key.trim() == cookie_name).then(|| val.trim().to_string())
        })
        .find(|val| !val.is_empty())
}

/// Render a pending cookie change as a `Set-Cookie` value.
pub fn set_cookie_header(
    cfg: &SessionConfig,
    change: &CookieChange,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let (value, max_age) = match change {
        CookieChange::Set(id) => (id.as_str(), cfg.ttl_secs),
        CookieChange::Clear => ("", 0),
    };
    let mut cookie = format!(
        "{}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}",
        cfg.cookie_name
    );
    if cfg.secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

#[async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let id = extract_session_id(&parts.headers, &state.config.session.cookie_name);
        let session = state.sessions.load(id).await.map_err(|e| {
            error!(error = %e, "session load failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "session store unavailable".to_string(),
            )
        })?;
        Ok(RequestContext { session })
    }
}

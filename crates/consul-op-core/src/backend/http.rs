//! Consul HTTP API backend.
//!
//! Locks follow the algorithm of the official Consul API client: a session
//! with a TTL is created and renewed in the background, the lock key is
//! watched with blocking queries, and ownership is taken with
//! `PUT /v1/kv/{key}?acquire={session}`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, DropGuard};
use url::{Host, Url};

use super::{
    Backend, CatalogService, Connector, KvPair, LockHandle, LockOutcome, ServiceRegistration,
};
use crate::{agent_url::agent_base_url, Error, OperatorConfig, Result};

/// Flags value marking a KV entry as a lock.
pub const LOCK_FLAG_VALUE: u64 = 0x2ddc_cbc0_58a5_0c18;

/// TTL of the session backing a lock.
pub const LOCK_SESSION_TTL: Duration = Duration::from_secs(15);

/// Time a released lock stays unacquirable by other sessions.
pub const LOCK_DELAY: Duration = Duration::from_secs(15);

/// Maximum time a blocking query waits for the lock key to change.
pub const LOCK_WAIT_TIME: Duration = Duration::from_secs(15);

/// Pause before retrying when an acquire is refused while the key is free
/// (a lock-delay is in effect).
pub const LOCK_RETRY_TIME: Duration = Duration::from_secs(5);

/// Durations driving the session-backed lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTiming {
    /// Session TTL; the session is renewed every half of it.
    pub session_ttl: Duration,
    pub lock_delay: Duration,
    /// Longest wait of one blocking query on the lock key.
    pub wait_time: Duration,
    /// Pause after a refused acquire on a free key.
    pub retry_time: Duration,
}

impl Default for LockTiming {
    fn default() -> Self {
        Self {
            session_ttl: LOCK_SESSION_TTL,
            lock_delay: LOCK_DELAY,
            wait_time: LOCK_WAIT_TIME,
            retry_time: LOCK_RETRY_TIME,
        }
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN_HEADER: &str = "X-Consul-Token";
const INDEX_HEADER: &str = "X-Consul-Index";

/// Thin typed wrapper over the Consul HTTP endpoints.
#[derive(Debug)]
struct ConsulClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    modify_index: u64,
    #[serde(default)]
    flags: u64,
    #[serde(default)]
    session: Option<String>,
}

impl KvEntry {
    fn into_pair(self) -> std::result::Result<KvPair, base64::DecodeError> {
        let value = match self.value {
            Some(encoded) => STANDARD.decode(encoded)?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: self.key,
            value,
            modify_index: self.modify_index,
            flags: self.flags,
            session: self.session.filter(|s| !s.is_empty()),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    lock_delay: String,
    behavior: &'static str,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

fn consul_index(response: &Response) -> u64 {
    response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Consul duration syntax: whole seconds as `15s`, anything finer in `ms`.
fn duration_param(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

async fn ensure_success(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::backend(context, format!("{status}: {}", body.trim())))
}

impl ConsulClient {
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                Error::ConnectionFailed(format!(
                    "agent address '{}' cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn kv_url(&self, key: &str) -> Result<Url> {
        self.endpoint(["v1", "kv"].into_iter().chain(key.trim_start_matches('/').split('/')))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder, context: &str) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| Error::backend(context, e))
    }

    async fn call(&self, request: RequestBuilder, context: &str) -> Result<Response> {
        let response = self.execute(request, context).await?;
        ensure_success(response, context).await
    }

    async fn call_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
        context: &str,
    ) -> Result<T> {
        self.call(request, context)
            .await?
            .json()
            .await
            .map_err(|e| Error::backend(context, format!("invalid response: {e}")))
    }

    async fn leader(&self) -> Result<String> {
        let url = self.endpoint(["v1", "status", "leader"])?;
        self.call_json(self.request(Method::GET, url), "status leader")
            .await
    }

    /// Read a key; with `blocking` (index, max wait) this is a blocking query.
    async fn kv_get(
        &self,
        key: &str,
        blocking: Option<(u64, Duration)>,
    ) -> Result<(Option<KvPair>, u64)> {
        let context = format!("kv get '{key}'");
        let mut request = self.request(Method::GET, self.kv_url(key)?);
        if let Some((index, wait)) = blocking {
            request = request.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}ms", wait.as_millis())),
            ]);
        }

        let response = self.execute(request, &context).await?;
        let index = consul_index(&response);
        if response.status() == StatusCode::NOT_FOUND {
            return Ok((None, index));
        }

        let entries: Vec<KvEntry> = ensure_success(response, &context)
            .await?
            .json()
            .await
            .map_err(|e| Error::backend(&context, format!("invalid response: {e}")))?;
        let pair = entries
            .into_iter()
            .next()
            .map(KvEntry::into_pair)
            .transpose()
            .map_err(|e| Error::backend(&context, format!("invalid base64 value: {e}")))?;
        Ok((pair, index))
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()> {
        let request = self.request(Method::PUT, self.kv_url(key)?).body(value.to_vec());
        self.call(request, &format!("kv put '{key}'")).await?;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<()> {
        let request = self.request(Method::DELETE, self.kv_url(key)?);
        self.call(request, &format!("kv delete '{key}'")).await?;
        Ok(())
    }

    /// `?acquire=` / `?release=` write; returns whether the backend applied it.
    async fn kv_lock_op(&self, key: &str, op: &str, session: &str) -> Result<bool> {
        let request = self
            .request(Method::PUT, self.kv_url(key)?)
            .query(&[(op, session.to_string()), ("flags", LOCK_FLAG_VALUE.to_string())]);
        self.call_json(request, &format!("kv {op} '{key}'")).await
    }

    async fn session_create(&self, name: &str, timing: &LockTiming) -> Result<String> {
        let url = self.endpoint(["v1", "session", "create"])?;
        let body = SessionRequest {
            name,
            ttl: duration_param(timing.session_ttl),
            lock_delay: duration_param(timing.lock_delay),
            behavior: "release",
        };
        let created: SessionCreated = self
            .call_json(self.request(Method::PUT, url).json(&body), "session create")
            .await?;
        Ok(created.id)
    }

    /// `Ok(false)` when the session no longer exists.
    async fn session_renew(&self, id: &str) -> Result<bool> {
        let context = format!("session renew '{id}'");
        let url = self.endpoint(["v1", "session", "renew", id])?;
        let response = self.execute(self.request(Method::PUT, url), &context).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response, &context).await?;
        Ok(true)
    }

    async fn session_destroy(&self, id: &str) -> Result<()> {
        let url = self.endpoint(["v1", "session", "destroy", id])?;
        self.call(self.request(Method::PUT, url), &format!("session destroy '{id}'"))
            .await?;
        Ok(())
    }
}

/// Backend speaking the Consul HTTP API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Arc<ConsulClient>,
    timing: LockTiming,
}

impl HttpBackend {
    /// Build a backend for `agent` without contacting it.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionFailed` if the address is malformed or the HTTP
    /// client cannot be built
    pub fn new(agent: &str, token: Option<String>) -> Result<Self> {
        let base_url = agent_base_url(agent)?;
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        // Local agents are never reached through a proxy.
        if is_loopback(&base_url) {
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|e| Error::ConnectionFailed(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client: Arc::new(ConsulClient {
                http,
                base_url,
                token,
            }),
            timing: LockTiming::default(),
        })
    }

    /// Override the lock durations for handles built from now on.
    #[must_use]
    pub fn with_lock_timing(mut self, timing: LockTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn lock_timing(&self) -> LockTiming {
        self.timing
    }

    /// Address of the current Raft leader, as reported by the agent.
    pub async fn leader(&self) -> Result<String> {
        self.client.leader().await
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>> {
        tracing::debug!("GET kv '{key}'");
        self.client.kv_get(key, None).await.map(|(pair, _)| pair)
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()> {
        tracing::debug!("PUT kv '{key}' ({} bytes)", value.len());
        self.client.kv_put(key, value).await
    }

    async fn kv_delete(&self, key: &str) -> Result<()> {
        tracing::debug!("DELETE kv '{key}'");
        self.client.kv_delete(key).await
    }

    fn lock_handle(&self, key: &str) -> Result<Arc<dyn LockHandle>> {
        if key.trim_matches('/').is_empty() {
            return Err(Error::InvalidConfig("lock name cannot be empty".into()));
        }
        Ok(Arc::new(HttpLock {
            key: key.to_string(),
            client: Arc::clone(&self.client),
            timing: self.timing,
            acquiring: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
        }))
    }

    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        let url = self.client.endpoint(["v1", "agent", "service", "register"])?;
        let request = self.client.request(Method::PUT, url).json(registration);
        self.client
            .call(request, &format!("register service '{}'", registration.id))
            .await?;
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let url = self
            .client
            .endpoint(["v1", "agent", "service", "deregister", service_id])?;
        self.client
            .call(
                self.client.request(Method::PUT, url),
                &format!("deregister service '{service_id}'"),
            )
            .await?;
        Ok(())
    }

    async fn catalog_service(&self, name: &str) -> Result<Vec<CatalogService>> {
        let url = self.client.endpoint(["v1", "catalog", "service", name])?;
        self.client
            .call_json(
                self.client.request(Method::GET, url),
                &format!("catalog service '{name}'"),
            )
            .await
    }

    async fn catalog_services(&self) -> Result<HashMap<String, Vec<String>>> {
        let url = self.client.endpoint(["v1", "catalog", "services"])?;
        let services: HashMap<String, Option<Vec<String>>> = self
            .client
            .call_json(self.client.request(Method::GET, url), "catalog services")
            .await?;
        Ok(services
            .into_iter()
            .map(|(name, tags)| (name, tags.unwrap_or_default()))
            .collect())
    }
}

/// Session currently backing a held lock. Dropping it stops renewal, so an
/// abandoned session expires after its TTL and Consul releases the key.
#[derive(Debug)]
struct HeldSession {
    id: String,
    /// Set by this session's own renewal task once Consul forgets it.
    lost: Arc<AtomicBool>,
    _renewal: DropGuard,
}

impl HeldSession {
    fn is_live(&self) -> bool {
        !self.lost.load(Ordering::SeqCst)
    }
}

/// Session-backed lock on one key.
#[derive(Debug)]
struct HttpLock {
    key: String,
    client: Arc<ConsulClient>,
    timing: LockTiming,
    /// Serializes `lock` calls on this handle.
    acquiring: tokio::sync::Mutex<()>,
    /// `Some` while held. Never locked across an await.
    session: Mutex<Option<HeldSession>>,
}

impl HttpLock {
    fn context(&self) -> String {
        format!("acquire lock '{}'", self.key)
    }

    fn session(&self) -> MutexGuard<'_, Option<HeldSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wrap a fresh session and renew it every half TTL until dropped.
    fn start_session(&self, id: String) -> HeldSession {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let lost = Arc::new(AtomicBool::new(false));
        let client = Arc::clone(&self.client);
        let interval = self.timing.session_ttl / 2;
        let session = id.clone();
        let key = self.key.clone();
        let flag = Arc::clone(&lost);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stopped.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                match client.session_renew(&session).await {
                    Ok(true) => tracing::debug!("Renewed session {session} for lock '{key}'"),
                    Ok(false) => {
                        tracing::warn!("Session {session} for lock '{key}' expired, lock lost");
                        flag.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => tracing::warn!("Failed to renew session {session}: {e}"),
                }
            }
        });

        HeldSession {
            id,
            lost,
            _renewal: stop.drop_guard(),
        }
    }

    async fn destroy_session(&self, session: HeldSession) {
        let HeldSession {
            id,
            _renewal: renewal,
            ..
        } = session;
        drop(renewal);
        if let Err(e) = self.client.session_destroy(&id).await {
            tracing::warn!("Failed to destroy session {id}: {e}");
        }
    }

    /// Acquire loop, run with a live session.
    async fn acquire_with_session(
        &self,
        session: &str,
        cancel: &CancellationToken,
    ) -> Result<LockOutcome> {
        let context = self.context();
        let mut wait_index = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(LockOutcome::Cancelled);
            }

            let (pair, index) = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(LockOutcome::Cancelled),
                lookup = self
                    .client
                    .kv_get(&self.key, Some((wait_index, self.timing.wait_time))) => lookup?,
            };

            if let Some(pair) = &pair {
                if pair.flags != LOCK_FLAG_VALUE {
                    return Err(Error::backend(
                        &context,
                        "existing key does not match lock use",
                    ));
                }
                match pair.session.as_deref() {
                    Some(holder) if holder == session => return Ok(LockOutcome::Held),
                    Some(_) => {
                        wait_index = if index < wait_index { 0 } else { index };
                        continue;
                    }
                    None => {}
                }
            }

            let acquired = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(LockOutcome::Cancelled),
                acquired = self.client.kv_lock_op(&self.key, "acquire", session) => acquired?,
            };
            if acquired {
                return Ok(LockOutcome::Held);
            }

            // Refused: either someone else won the race, or a lock-delay is
            // in effect on a free key.
            let (pair, index) = self.client.kv_get(&self.key, None).await?;
            if pair.is_some_and(|p| p.session.is_some()) {
                wait_index = index;
                continue;
            }

            wait_index = 0;
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(LockOutcome::Cancelled),
                () = tokio::time::sleep(self.timing.retry_time) => {}
            }
        }
    }
}

#[async_trait]
impl LockHandle for HttpLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn lock(&self, cancel: &CancellationToken) -> Result<LockOutcome> {
        let _acquiring = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(LockOutcome::Cancelled),
            guard = self.acquiring.lock() => guard,
        };

        let stale = {
            let mut slot = self.session();
            if slot.as_ref().is_some_and(HeldSession::is_live) {
                return Err(Error::backend(self.context(), "lock is already held"));
            }
            slot.take()
        };
        // Session lost while held: clean up before starting over.
        if let Some(stale) = stale {
            self.destroy_session(stale).await;
        }
        if cancel.is_cancelled() {
            return Ok(LockOutcome::Cancelled);
        }

        let id = self
            .client
            .session_create(&format!("consul-op lock {}", self.key), &self.timing)
            .await?;
        let session = self.start_session(id);

        match self.acquire_with_session(&session.id, cancel).await {
            Ok(LockOutcome::Held) => {
                tracing::debug!("Lock '{}' held with session {}", self.key, session.id);
                *self.session() = Some(session);
                Ok(LockOutcome::Held)
            }
            other => {
                self.destroy_session(session).await;
                other
            }
        }
    }

    async fn unlock(&self) -> Result<()> {
        let session = self.session().take().ok_or_else(|| {
            Error::backend(format!("release lock '{}'", self.key), "lock not held")
        })?;

        let released = self
            .client
            .kv_lock_op(&self.key, "release", &session.id)
            .await;
        self.destroy_session(session).await;

        if !released? {
            tracing::warn!("Release of lock '{}' was not applied by the backend", self.key);
        }
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.session().as_ref().is_some_and(HeldSession::is_live)
    }
}

/// Connector building an [`HttpBackend`] from the operator's agent address.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    probe: bool,
    timing: LockTiming,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self {
            probe: true,
            timing: LockTiming::default(),
        }
    }
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the reachability check against `/v1/status/leader`.
    pub fn without_probe(mut self) -> Self {
        self.probe = false;
        self
    }

    /// Lock durations for every backend this connector builds.
    pub fn with_lock_timing(mut self, timing: LockTiming) -> Self {
        self.timing = timing;
        self
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, config: &OperatorConfig) -> Result<Arc<dyn Backend>> {
        let backend =
            HttpBackend::new(&config.agent, config.token.clone())?.with_lock_timing(self.timing);

        if self.probe {
            let leader = backend.leader().await.map_err(|e| {
                Error::ConnectionFailed(format!("agent {} unreachable: {e}", config.agent))
            })?;
            if leader.is_empty() {
                return Err(Error::ConnectionFailed(format!(
                    "agent {} reports no cluster leader",
                    config.agent
                )));
            }
            tracing::debug!("Agent {} reports leader {leader}", config.agent);
        }

        Ok(Arc::new(backend))
    }
}

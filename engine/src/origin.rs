//! The authoritative backend.
//!
//! [`Origin`] is the seam between the engine and the network. [`HttpOrigin`]
//! speaks the REST contract (`/api/{collection}[/{id}]`, `{success, data,
//! error}` envelope). [`MemoryOrigin`] keeps everything in process and can be
//! told to fail, which makes it the origin of choice for tests and demos.

use crate::{error::Result, lifecycle::Session, record::format_timestamp, Error, Timestamp};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Per-request metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// User the change is attributed to
    pub actor: Option<String>,
    /// Lets the origin recognize a redelivered create
    pub idempotency_key: Option<String>,
}

impl RequestContext {
    pub fn new(actor: Option<String>) -> Self {
        Self {
            actor,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Operations the engine needs from the backend.
///
/// Records cross this boundary in wire shape: flat JSON objects with `id`
/// and `updatedAt`.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Full snapshot of a collection.
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Value>>;

    /// Create a record; returns the stored record with its server id.
    async fn create(&self, collection: &str, payload: &Value, ctx: &RequestContext)
        -> Result<Value>;

    /// Update a record; returns the stored record.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Value,
        ctx: &RequestContext,
    ) -> Result<Value>;

    /// Delete a record. Deleting a record the origin no longer has succeeds.
    async fn delete(&self, collection: &str, id: &str, ctx: &RequestContext) -> Result<()>;

    /// Attach or clear credentials.
    fn authenticate(&self, _session: Option<&Session>) {}
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// REST client for a remote origin.
pub struct HttpOrigin {
    client: Client,
    base_url: Url,
    session: RwLock<Option<Session>>,
}

impl HttpOrigin {
    /// Create a client for the origin at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidPayload(format!("invalid origin url '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidPayload(format!(
                "origin url '{base_url}' cannot have paths"
            )));
        }
        Ok(Self {
            client,
            base_url,
            session: RwLock::new(None),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url, ctx: &RequestContext) -> RequestBuilder {
        let session = self.session.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut request = self.client.request(method, url);

        if let Some(session) = &session {
            request = request.bearer_auth(&session.token);
        }
        let actor = ctx
            .actor
            .clone()
            .or_else(|| session.map(|s| s.user_id));
        if let Some(actor) = actor {
            request = request.header("X-Actor-Id", actor);
        }
        if let Some(key) = &ctx.idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<(StatusCode, Option<Envelope>)> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        let envelope = serde_json::from_str::<Envelope>(&body).ok();

        if !status.is_success() {
            let message = envelope
                .as_ref()
                .and_then(|e| e.error.clone())
                .or_else(|| (!body.is_empty()).then(|| body.clone()))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            return Err(Error::OriginRejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok((status, envelope))
    }

    async fn send_for_data(&self, request: RequestBuilder) -> Result<Value> {
        let (status, envelope) = self.send(request).await?;
        let envelope =
            envelope.ok_or_else(|| Error::MalformedResponse("body is not an envelope".into()))?;
        if !envelope.success {
            return Err(Error::OriginRejected {
                status: status.as_u16(),
                message: envelope.error.unwrap_or_else(|| "request failed".into()),
            });
        }
        envelope
            .data
            .ok_or_else(|| Error::MalformedResponse("envelope has no data".into()))
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Value>> {
        let url = self.url(&[collection]);
        debug!(%url, "fetching snapshot");
        match self
            .send_for_data(self.request(Method::GET, url, &RequestContext::default()))
            .await?
        {
            Value::Array(records) => Ok(records),
            other => Err(Error::MalformedResponse(format!(
                "expected a list of {collection}, got {other}"
            ))),
        }
    }

    async fn create(
        &self,
        collection: &str,
        payload: &Value,
        ctx: &RequestContext,
    ) -> Result<Value> {
        let url = self.url(&[collection]);
        self.send_for_data(self.request(Method::POST, url, ctx).json(payload))
            .await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Value,
        ctx: &RequestContext,
    ) -> Result<Value> {
        let url = self.url(&[collection, id]);
        self.send_for_data(self.request(Method::PUT, url, ctx).json(patch))
            .await
    }

    async fn delete(&self, collection: &str, id: &str, ctx: &RequestContext) -> Result<()> {
        let url = self.url(&[collection, id]);
        match self.send(self.request(Method::DELETE, url, ctx)).await {
            Ok((status, Some(envelope))) if !envelope.success => Err(Error::OriginRejected {
                status: status.as_u16(),
                message: envelope.error.unwrap_or_else(|| "delete failed".into()),
            }),
            Ok(_) => Ok(()),
            Err(Error::OriginRejected { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn authenticate(&self, session: Option<&Session>) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = session.cloned();
    }
}

/// Kind of call received by a [`MemoryOrigin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    FetchAll,
    Create,
    Update,
    Delete,
}

/// A call received by a [`MemoryOrigin`], failed or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginCall {
    pub kind: CallKind,
    pub collection: String,
    pub id: Option<String>,
    pub actor: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<String, Value>>,
    queued_ids: HashMap<String, VecDeque<String>>,
    next_id: u64,
    now: Option<Timestamp>,
    reachable: bool,
    failures: VecDeque<Error>,
    latency: Duration,
    calls: Vec<OriginCall>,
    idempotency: HashMap<(String, String), String>,
    invite_collections: HashSet<String>,
    session: Option<Session>,
}

/// An origin held in memory.
///
/// Records get ids `{collection}-{n}` unless ids were queued with
/// [`queue_id`](Self::queue_id), and `updatedAt` is stamped from
/// [`set_now`](Self::set_now) when pinned, the system clock otherwise.
pub struct MemoryOrigin {
    state: Mutex<MemoryState>,
}

impl Default for MemoryOrigin {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOrigin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                reachable: true,
                ..MemoryState::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a record as-is. The record must carry an `id`.
    pub fn seed(&self, collection: &str, record: Value) {
        let id = match record.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => return,
        };
        self.state()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, record);
    }

    /// Delete a record behind the engine's back.
    pub fn remove(&self, collection: &str, id: &str) -> Option<Value> {
        self.state()
            .collections
            .get_mut(collection)
            .and_then(|records| records.remove(id))
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.state()
            .collections
            .get(collection)
            .and_then(|records| records.get(id).cloned())
    }

    /// Every record of a collection, ordered by id.
    pub fn snapshot(&self, collection: &str) -> Vec<Value> {
        self.state()
            .collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<OriginCall> {
        self.state().calls.clone()
    }

    /// Calls of one kind received so far.
    pub fn calls_of(&self, kind: CallKind) -> Vec<OriginCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Use `id` for the next record created in `collection`.
    pub fn queue_id(&self, collection: &str, id: impl Into<String>) {
        self.state()
            .queued_ids
            .entry(collection.to_string())
            .or_default()
            .push_back(id.into());
    }

    /// Pin the `updatedAt` stamped on writes.
    pub fn set_now(&self, now: Timestamp) {
        self.state().now = Some(now);
    }

    /// Simulate losing (or regaining) the network.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Fail the next call with `error`. Failures queue up.
    pub fn fail_next(&self, error: Error) {
        self.state().failures.push_back(error);
    }

    /// Delay every call.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Creates in `collection` mint an `inviteToken`.
    pub fn mint_invites_for(&self, collection: &str) {
        self.state().invite_collections.insert(collection.to_string());
    }

    /// Credentials last attached by the engine.
    pub fn session(&self) -> Option<Session> {
        self.state().session.clone()
    }

    async fn begin(
        &self,
        kind: CallKind,
        collection: &str,
        id: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<()> {
        let latency = {
            let mut state = self.state();
            state.calls.push(OriginCall {
                kind,
                collection: collection.to_string(),
                id: id.map(str::to_string),
                actor: ctx.actor.clone(),
                idempotency_key: ctx.idempotency_key.clone(),
            });
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if !state.reachable {
            return Err(Error::Network("origin unreachable".into()));
        }
        match state.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl MemoryState {
    fn stamp(&self) -> Value {
        Value::String(format_timestamp(self.now.unwrap_or_else(chrono::Utc::now)))
    }

    fn mint_id(&mut self, collection: &str) -> String {
        if let Some(id) = self
            .queued_ids
            .get_mut(collection)
            .and_then(VecDeque::pop_front)
        {
            return id;
        }
        self.next_id += 1;
        format!("{collection}-{}", self.next_id)
    }
}

#[async_trait]
impl Origin for MemoryOrigin {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Value>> {
        self.begin(CallKind::FetchAll, collection, None, &RequestContext::default())
            .await?;
        Ok(self.snapshot(collection))
    }

    async fn create(
        &self,
        collection: &str,
        payload: &Value,
        ctx: &RequestContext,
    ) -> Result<Value> {
        self.begin(CallKind::Create, collection, None, ctx).await?;
        let Value::Object(fields) = payload else {
            return Err(Error::OriginRejected {
                status: 400,
                message: "body must be an object".into(),
            });
        };

        let mut state = self.state();
        if let Some(key) = &ctx.idempotency_key {
            let existing = state
                .idempotency
                .get(&(collection.to_string(), key.clone()))
                .cloned();
            if let Some(record) = existing.and_then(|id| {
                state
                    .collections
                    .get(collection)
                    .and_then(|records| records.get(&id).cloned())
            }) {
                return Ok(record);
            }
        }

        let id = state.mint_id(collection);
        let mut record: Map<String, Value> = fields.clone();
        record.insert("id".into(), Value::String(id.clone()));
        record.insert("updatedAt".into(), state.stamp());
        if state.invite_collections.contains(collection) {
            record.insert(
                "inviteToken".into(),
                Value::String(Uuid::new_v4().simple().to_string()),
            );
        }
        let record = Value::Object(record);

        if let Some(key) = &ctx.idempotency_key {
            state
                .idempotency
                .insert((collection.to_string(), key.clone()), id.clone());
        }
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Value,
        ctx: &RequestContext,
    ) -> Result<Value> {
        self.begin(CallKind::Update, collection, Some(id), ctx).await?;

        let mut state = self.state();
        let stamp = state.stamp();
        let record = state
            .collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| Error::OriginRejected {
                status: 404,
                message: format!("{collection}/{id} not found"),
            })?;

        if let (Value::Object(fields), Value::Object(changes)) = (&mut *record, patch) {
            for (key, value) in changes {
                if key != "id" && key != "updatedAt" {
                    fields.insert(key.clone(), value.clone());
                }
            }
            fields.insert("updatedAt".into(), stamp);
        }
        Ok(record.clone())
    }

    async fn delete(&self, collection: &str, id: &str, ctx: &RequestContext) -> Result<()> {
        self.begin(CallKind::Delete, collection, Some(id), ctx).await?;
        self.remove(collection, id);
        Ok(())
    }

    fn authenticate(&self, session: Option<&Session>) {
        self.state().session = session.cloned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn http_urls_are_segment_encoded() {
        let origin = HttpOrigin::new("https://pos.example.com").unwrap();
        assert_eq!(
            origin.url(&["clients"]).as_str(),
            "https://pos.example.com/api/clients"
        );
        assert_eq!(
            origin.url(&["clients", "a/b c"]).as_str(),
            "https://pos.example.com/api/clients/a%2Fb%20c"
        );

        let nested = HttpOrigin::new("https://pos.example.com/tenant/").unwrap();
        assert_eq!(
            nested.url(&["taxes"]).as_str(),
            "https://pos.example.com/tenant/api/taxes"
        );
    }

    #[test]
    fn http_origin_rejects_bad_urls() {
        assert!(HttpOrigin::new("not a url").is_err());
        assert!(HttpOrigin::new("mailto:ops@example.com").is_err());
    }

    #[test]
    fn envelope_parsing() {
        let ok: Envelope = serde_json::from_str(r#"{"success":true,"data":[1]}"#).unwrap();
        assert!(ok.success);
        assert_eq!(ok.data, Some(json!([1])));

        let failed: Envelope =
            serde_json::from_str(r#"{"success":false,"error":"nope"}"#).unwrap();
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn memory_origin_create_uses_queued_ids() {
        let origin = MemoryOrigin::new();
        origin.queue_id("clients", "c-101");
        origin.set_now(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let record = origin
            .create("clients", &json!({"name": "Ana"}), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(
            record,
            json!({"id": "c-101", "name": "Ana", "updatedAt": "2024-01-01T00:00:00Z"})
        );

        let next = origin
            .create("clients", &json!({"name": "Bea"}), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(next["id"], "clients-1");
        assert_eq!(origin.snapshot("clients").len(), 2);
    }

    #[tokio::test]
    async fn memory_origin_create_is_idempotent() {
        let origin = MemoryOrigin::new();
        let ctx = RequestContext::default().with_idempotency_key("tmp-1");

        let first = origin
            .create("clients", &json!({"name": "Ana"}), &ctx)
            .await
            .unwrap();
        let again = origin
            .create("clients", &json!({"name": "Ana"}), &ctx)
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(origin.snapshot("clients").len(), 1);
    }

    #[tokio::test]
    async fn memory_origin_failures() {
        let origin = MemoryOrigin::new();
        origin.fail_next(Error::OriginRejected {
            status: 500,
            message: "boom".into(),
        });

        assert!(matches!(
            origin.fetch_all("clients").await,
            Err(Error::OriginRejected { status: 500, .. })
        ));
        assert!(origin.fetch_all("clients").await.unwrap().is_empty());

        origin.set_reachable(false);
        assert!(matches!(
            origin.fetch_all("clients").await,
            Err(Error::Network(_))
        ));
        assert_eq!(origin.calls_of(CallKind::FetchAll).len(), 3);
    }

    #[tokio::test]
    async fn memory_origin_update_and_delete() {
        let origin = MemoryOrigin::new();
        origin.seed(
            "products",
            json!({"id": "p-1", "name": "Tea", "price": 2.0, "updatedAt": "2024-01-01T00:00:00Z"}),
        );
        origin.set_now(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        let ctx = RequestContext::new(Some("u-1".into()));

        let updated = origin
            .update("products", "p-1", &json!({"price": 2.5}), &ctx)
            .await
            .unwrap();
        assert_eq!(updated["price"], 2.5);
        assert_eq!(updated["updatedAt"], "2024-02-01T00:00:00Z");

        let missing = origin
            .update("products", "p-9", &json!({"price": 1}), &ctx)
            .await;
        assert!(matches!(
            missing,
            Err(Error::OriginRejected { status: 404, .. })
        ));

        origin.delete("products", "p-1", &ctx).await.unwrap();
        origin.delete("products", "p-1", &ctx).await.unwrap();
        assert!(origin.get("products", "p-1").is_none());
        assert_eq!(origin.calls()[0].actor.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn memory_origin_mints_invites() {
        let origin = MemoryOrigin::new();
        origin.mint_invites_for("users");

        let user = origin
            .create(
                "users",
                &json!({"name": "Ana", "email": "ana@example.com"}),
                &RequestContext::default(),
            )
            .await
            .unwrap();
        assert!(user["inviteToken"].as_str().is_some_and(|t| t.len() == 32));
    }
}

//! Managed push backend: PostgREST queries plus a Phoenix realtime channel.

mod realtime;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{SecondsFormat, TimeDelta, Utc};
use hookwatch_core::{
    ConnectionState, Event, EventFilter, RealtimeChannel, Session, SessionFilter, SessionSummary,
    SubscriberSet, Subscription,
};
use reqwest::{
    Url,
    header::{AUTHORIZATION, HeaderMap, HeaderValue, SERVER},
};
use secrecy::{ExposeSecret, SecretString};

pub use realtime::{
    EVENTS_TABLE, HEARTBEAT_INTERVAL, ManagedChannel, REALTIME_TOPIC, SESSIONS_TABLE,
};

use crate::{
    config::{BackendMode, ENV_CLOUD_KEY, ManagedSettings, derive_socket_url, endpoint},
    error::{BackendError, Result},
    http::HttpClient,
    status::ClientStatus,
    traits::{
        BackendClient, BackendMetadata, Capabilities, ConnectionInfo, EventListener,
        SessionListener, StatusListener,
    },
};

/// Protocol version requested from the realtime service.
const REALTIME_VSN: &str = "1.0.0";

fn secret_header(value: &str) -> Result<HeaderValue> {
    let mut header = HeaderValue::from_str(value).map_err(|_| {
        BackendError::Validation(format!(
            "{ENV_CLOUD_KEY} contains characters not allowed in a header"
        ))
    })?;
    header.set_sensitive(true);
    Ok(header)
}

fn auth_headers(key: &SecretString) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert("apikey", secret_header(key.expose_secret())?);
    headers.insert(
        AUTHORIZATION,
        secret_header(&format!("Bearer {}", key.expose_secret()))?,
    );
    Ok(headers)
}

/// Realtime websocket URL, carrying the key as the service expects.
///
/// # Errors
/// Returns a validation error if the base URL cannot be turned into a socket
/// URL.
pub fn realtime_url(base: &Url, key: &SecretString) -> Result<Url> {
    let mut url = derive_socket_url(base, "realtime/v1/websocket")?;
    url.query_pairs_mut()
        .append_pair("apikey", key.expose_secret())
        .append_pair("vsn", REALTIME_VSN);
    Ok(url)
}

/// `in.(...)` list with each value quoted.
fn in_list<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    let quoted: Vec<String> = values
        .into_iter()
        .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

/// Characters with meaning inside a PostgREST logic tree are dropped.
fn ilike_pattern(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .filter(|c| !matches!(c, '*' | ',' | '(' | ')' | '%'))
        .collect();
    format!("*{cleaned}*")
}

fn rfc3339(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Query string for the `events` table.
pub(crate) fn event_query(filter: &EventFilter) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("select", "*".to_string()),
        ("order", "timestamp.desc".to_string()),
    ];
    if let Some(limit) = filter.limit {
        query.push(("limit", limit.to_string()));
    }
    if let Some(offset) = filter.offset {
        query.push(("offset", offset.to_string()));
    }
    if !filter.session_ids.is_empty() {
        query.push((
            "session_id",
            in_list(filter.session_ids.iter().map(String::as_str)),
        ));
    }
    if !filter.event_types.is_empty() {
        query.push(("type", in_list(filter.event_types.iter().map(|t| t.as_str()))));
    }
    if let Some(range) = filter.date_range {
        query.push(("timestamp", format!("gte.{}", rfc3339(range.start))));
        query.push(("timestamp", format!("lte.{}", rfc3339(range.end))));
    }
    if let Some(search) = filter.search() {
        let pattern = ilike_pattern(search);
        query.push((
            "or",
            format!("(tool_name.ilike.{pattern},type.ilike.{pattern})"),
        ));
    }
    query
}

/// Query string for the `sessions` table.
pub(crate) fn session_query(filter: &SessionFilter) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("select", "*".to_string()),
        ("order", "start_time.desc".to_string()),
    ];
    if let Some(minutes) = filter.time_range_minutes {
        let since = Utc::now() - TimeDelta::minutes(i64::from(minutes));
        query.push(("start_time", format!("gte.{}", rfc3339(since))));
    }
    if !filter.include_ended {
        query.push(("end_time", "is.null".to_string()));
    }
    query
}

/// Client for the managed push service.
pub struct ManagedBackend {
    settings: ManagedSettings,
    rest: String,
    http: HttpClient,
    status: Arc<ClientStatus>,
    events: SubscriberSet<Event>,
    sessions: SubscriberSet<Session>,
    channel: Arc<ManagedChannel>,
}

impl ManagedBackend {
    /// Create a client. No I/O happens until `connect`.
    ///
    /// # Errors
    /// Returns a validation error if the key cannot be sent as a header or
    /// the URL cannot be turned into a realtime URL.
    pub fn new(settings: ManagedSettings) -> Result<Self> {
        Self::with_heartbeat(settings, HEARTBEAT_INTERVAL)
    }

    pub(crate) fn with_heartbeat(settings: ManagedSettings, heartbeat: Duration) -> Result<Self> {
        let http = HttpClient::new(settings.tuning.timeout, auth_headers(&settings.api_key)?)?;
        let rest = endpoint(&settings.url, "rest/v1");
        let status = Arc::new(ClientStatus::new());
        let events = SubscriberSet::new();
        let sessions = SubscriberSet::new();
        let channel = ManagedChannel::new(
            realtime_url(&settings.url, &settings.api_key)?,
            settings.tuning.timeout,
            heartbeat,
            Arc::clone(&status),
            events.clone(),
            sessions.clone(),
        );
        Ok(Self {
            settings,
            rest,
            http,
            status,
            events,
            sessions,
            channel,
        })
    }

    fn table(&self, path: &str) -> String {
        format!("{}/{}", self.rest, path)
    }

    fn probe_url(&self) -> String {
        format!("{}?select=id&limit=1", self.table(EVENTS_TABLE))
    }
}

#[async_trait]
impl BackendClient for ManagedBackend {
    fn kind(&self) -> BackendMode {
        BackendMode::Managed
    }

    async fn connect(&self) -> Result<()> {
        let _gate = self.status.connect_gate.lock().await;
        if self.status.get() == ConnectionState::Connected && self.channel.is_joined() {
            return Ok(());
        }

        self.status.set(ConnectionState::Connecting);
        if let Err(e) = self.http.probe(&self.probe_url()).await {
            self.status.set(ConnectionState::Error);
            return Err(e);
        }
        self.channel.open().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.channel.teardown();
        self.status.set(ConnectionState::Disconnected);
        Ok(())
    }

    fn connection_status(&self) -> ConnectionState {
        self.status.get()
    }

    fn on_connection_status_change(&self, listener: StatusListener) -> Subscription {
        self.status.subscribe(listener)
    }

    async fn get_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        self.http
            .get_json(&self.table(EVENTS_TABLE), &event_query(filter))
            .await
    }

    async fn get_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        self.http
            .get_json(&self.table(SESSIONS_TABLE), &session_query(filter))
            .await
    }

    async fn get_session_summaries(&self, session_ids: &[String]) -> Result<Vec<SessionSummary>> {
        if session_ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "session_ids": session_ids });
        self.http
            .post_json(&self.table("rpc/get_session_summaries"), &body)
            .await
    }

    fn subscribe_to_events(&self, listener: EventListener) -> Subscription {
        self.events.subscribe(move |event| listener(event))
    }

    fn subscribe_to_sessions(&self, listener: SessionListener) -> Subscription {
        self.sessions.subscribe(move |session| listener(session))
    }

    async fn health_check(&self) -> bool {
        match self.http.probe(&self.probe_url()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("health check failed: {e}");
                false
            }
        }
    }

    async fn get_metadata(&self) -> BackendMetadata {
        let endpoint = self.settings.url.to_string();
        match self.http.probe(&self.probe_url()).await {
            Ok(response) => {
                let version = response
                    .headers()
                    .get(SERVER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.split_once('/'))
                    .map_or_else(|| "unknown".to_string(), |(_, version)| version.to_string());
                let realtime_endpoint =
                    derive_socket_url(&self.settings.url, "realtime/v1/websocket")
                        .ok()
                        .map(|url| url.to_string());
                BackendMetadata {
                    kind: BackendMode::Managed,
                    version,
                    capabilities: Capabilities {
                        realtime: true,
                        sockets: false,
                        analytics: true,
                        export: true,
                    },
                    connection_info: ConnectionInfo {
                        endpoint,
                        realtime_endpoint,
                        reachable: true,
                        status: self.status.get(),
                    },
                }
            }
            Err(e) => {
                tracing::warn!("backend metadata unavailable: {e}");
                BackendMetadata::degraded(BackendMode::Managed, endpoint, self.status.get())
            }
        }
    }

    fn live_channel(&self) -> Arc<dyn RealtimeChannel> {
        Arc::clone(&self.channel) as Arc<dyn RealtimeChannel>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, ResolvedConfig, TuningOverrides};
    use axum::{
        Json, Router,
        extract::{
            Query, State, WebSocketUpgrade,
            ws::{Message, WebSocket},
        },
        response::IntoResponse,
        routing::get,
    };
    use hookwatch_core::{ChannelStatus, EventType, SystemMessage};
    use httpmock::{Method::GET, Method::POST, MockServer};
    use serde_json::{Value, json};
    use std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use tokio::sync::mpsc;

    const KEY: &str = "test-key";

    fn settings(base: &str) -> ManagedSettings {
        let overrides = TuningOverrides {
            timeout: Some(Duration::from_secs(2)),
            ..TuningOverrides::default()
        };
        match BackendConfig::managed(base, KEY).resolve(&overrides).unwrap() {
            ResolvedConfig::Managed(settings) => settings,
            ResolvedConfig::Local(_) => unreachable!(),
        }
    }

    fn backend(base: &str) -> ManagedBackend {
        ManagedBackend::new(settings(base)).unwrap()
    }

    #[test]
    fn realtime_url_carries_key_and_version() {
        let url = realtime_url(
            &Url::parse("https://project.example.com").unwrap(),
            &SecretString::from(KEY.to_string()),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://project.example.com/realtime/v1/websocket?apikey=test-key&vsn=1.0.0"
        );
    }

    #[test]
    fn search_patterns_cannot_escape_the_logic_tree() {
        assert_eq!(ilike_pattern("a,b(c)*"), "*abc*");
        assert_eq!(in_list(["a", "b\"c"]), r#"in.("a","b\"c")"#);
    }

    #[tokio::test]
    async fn events_query_uses_postgrest_filters_and_auth() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/rest/v1/events")
                    .header("apikey", KEY)
                    .header("authorization", "Bearer test-key")
                    .query_param("select", "*")
                    .query_param("order", "timestamp.desc")
                    .query_param("limit", "10")
                    .query_param("session_id", r#"in.("s1","s2")"#)
                    .query_param("type", r#"in.("Stop")"#)
                    .query_param("or", "(tool_name.ilike.*bash*,type.ilike.*bash*)");
                then.status(200).json_body(json!([{
                    "id": "e1", "session_id": "s1", "type": "Stop", "timestamp": "2025-01-01T00:00:00Z"
                }]));
            })
            .await;

        let filter = EventFilter {
            limit: Some(10),
            session_ids: vec!["s1".into(), "s2".into()],
            event_types: vec![EventType::Stop],
            search_query: Some("bash".into()),
            ..EventFilter::default()
        };
        let events = backend(&server.base_url()).get_events(&filter).await.unwrap();

        mock.assert_async().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Stop);
    }

    #[tokio::test]
    async fn sessions_exclude_ended_rows_by_default() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/rest/v1/sessions")
                    .query_param("order", "start_time.desc")
                    .query_param("end_time", "is.null")
                    .query_param_exists("start_time");
                then.status(200).json_body(json!([]));
            })
            .await;

        let filter = SessionFilter {
            time_range_minutes: Some(30),
            include_ended: false,
        };
        let sessions = backend(&server.base_url()).get_sessions(&filter).await.unwrap();

        mock.assert_async().await;
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn summaries_go_through_the_rpc_endpoint() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/rest/v1/rpc/get_session_summaries")
                    .json_body(json!({ "session_ids": ["s1", "s2"] }));
                then.status(200).json_body(json!([
                    { "session_id": "s1", "total_events": 3, "error_count": 1 },
                    { "session_id": "s2" }
                ]));
            })
            .await;

        let backend = backend(&server.base_url());
        assert!(backend.get_session_summaries(&[]).await.unwrap().is_empty());
        assert_eq!(mock.hits_async().await, 0);

        let summaries = backend
            .get_session_summaries(&["s1".to_string(), "s2".to_string()])
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(summaries[0].error_count, 1);
        assert_eq!(summaries[1].total_events, 0);
    }

    #[tokio::test]
    async fn metadata_reads_the_server_version() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/rest/v1/events");
                then.status(200)
                    .header("server", "postgrest/12.2.3")
                    .json_body(json!([]));
            })
            .await;

        let metadata = backend(&server.base_url()).get_metadata().await;
        assert_eq!(metadata.kind, BackendMode::Managed);
        assert_eq!(metadata.version, "12.2.3");
        assert!(metadata.capabilities.realtime);
        assert!(!metadata.capabilities.sockets);
        let realtime = metadata.connection_info.realtime_endpoint.unwrap();
        assert!(realtime.ends_with("/realtime/v1/websocket"));
        assert!(!realtime.contains(KEY));
    }

    #[tokio::test]
    async fn rejected_key_fails_the_probe() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/rest/v1/events");
                then.status(401).json_body(json!({ "message": "Invalid API key" }));
            })
            .await;

        let backend = backend(&server.base_url());
        assert!(!backend.health_check().await);
        let err = backend.connect().await.unwrap_err();
        assert!(matches!(err, BackendError::Connection(ref m) if m.contains("401")));
        assert_eq!(backend.connection_status(), ConnectionState::Error);
    }

    #[derive(Clone, Default)]
    struct Realtime {
        reject: bool,
        keys: Arc<Mutex<Vec<String>>>,
        heartbeats: Arc<AtomicUsize>,
    }

    fn push(topic: &str, event: &str, payload: Value) -> Message {
        Message::Text(
            json!({ "topic": topic, "event": event, "payload": payload, "ref": null })
                .to_string()
                .into(),
        )
    }

    async fn realtime_socket(
        ws: WebSocketUpgrade,
        Query(params): Query<HashMap<String, String>>,
        State(state): State<Realtime>,
    ) -> impl IntoResponse {
        if let Some(key) = params.get("apikey") {
            state.keys.lock().unwrap().push(key.clone());
        }
        ws.on_upgrade(move |socket| serve_phoenix(socket, state))
    }

    async fn serve_phoenix(mut socket: WebSocket, state: Realtime) {
        while let Some(Ok(message)) = socket.recv().await {
            let Message::Text(text) = message else {
                continue;
            };
            let request: Value = serde_json::from_str(text.as_str()).unwrap();
            let topic = request["topic"].as_str().unwrap_or_default().to_string();
            match request["event"].as_str() {
                Some("phx_join") => {
                    let payload = if state.reject {
                        json!({ "status": "error", "response": { "reason": "denied by policy" } })
                    } else {
                        json!({ "status": "ok", "response": {} })
                    };
                    let reply = json!({
                        "topic": topic, "event": "phx_reply", "payload": payload, "ref": request["ref"]
                    });
                    let _ = socket.send(Message::Text(reply.to_string().into())).await;
                    if state.reject {
                        continue;
                    }
                    let frames = [
                        push(&topic, "system", json!({
                            "extension": "postgres_changes", "status": "ok",
                            "message": "Subscribed to PostgreSQL", "channel": "public"
                        })),
                        push(&topic, "postgres_changes", json!({ "data": {
                            "table": "events", "type": "INSERT",
                            "record": { "id": "", "session_id": "s1", "type": "Stop", "timestamp": "2025-01-01T00:00:00Z" }
                        }})),
                        push(&topic, "postgres_changes", json!({ "data": {
                            "table": "events", "type": "INSERT",
                            "record": { "id": "e1", "session_id": "s1", "type": "PreToolUse", "timestamp": "2025-01-01T00:00:00Z" }
                        }})),
                        push(&topic, "postgres_changes", json!({ "data": {
                            "table": "sessions", "type": "UPDATE",
                            "record": { "id": "s1", "project_path": "/p", "start_time": "2025-01-01T00:00:00Z", "status": "completed" }
                        }})),
                    ];
                    for frame in frames {
                        let _ = socket.send(frame).await;
                    }
                }
                Some("heartbeat") => {
                    state.heartbeats.fetch_add(1, Ordering::SeqCst);
                    let reply = json!({
                        "topic": "phoenix", "event": "phx_reply",
                        "payload": { "status": "ok", "response": {} }, "ref": request["ref"]
                    });
                    let _ = socket.send(Message::Text(reply.to_string().into())).await;
                }
                _ => {}
            }
        }
    }

    async fn spawn_realtime(state: Realtime) -> SocketAddr {
        let app = Router::new()
            .route("/rest/v1/events", get(|| async { Json(json!([])) }))
            .route("/realtime/v1/websocket", get(realtime_socket))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn joined_channel_routes_changes_by_table() {
        let state = Realtime::default();
        let addr = spawn_realtime(state.clone()).await;
        let backend = backend(&format!("http://{addr}"));

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let _events = backend.subscribe_to_events(Box::new(move |e| {
            let _ = event_tx.send(e.id.clone());
        }));
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let _sessions = backend.subscribe_to_sessions(Box::new(move |s| {
            let _ = session_tx.send(s.id.clone());
        }));
        let (system_tx, mut system_rx) = mpsc::unbounded_channel::<SystemMessage>();
        let _system = backend
            .live_channel()
            .on_system(Arc::new(move |m| {
                let _ = system_tx.send(m.clone());
            }));

        backend.connect().await.unwrap();
        assert_eq!(backend.connection_status(), ConnectionState::Connected);
        assert_eq!(*state.keys.lock().unwrap(), vec![KEY.to_string()]);

        let wait = Duration::from_secs(5);
        let system = tokio::time::timeout(wait, system_rx.recv()).await.unwrap().unwrap();
        assert_eq!(system.message, "Subscribed to PostgreSQL");
        assert!(!system.is_extension_failure());

        let event = tokio::time::timeout(wait, event_rx.recv()).await.unwrap();
        assert_eq!(event.as_deref(), Some("e1"));
        let session = tokio::time::timeout(wait, session_rx.recv()).await.unwrap();
        assert_eq!(session.as_deref(), Some("s1"));

        backend.disconnect().await.unwrap();
        assert_eq!(backend.connection_status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn rejected_join_reports_the_reason() {
        let addr = spawn_realtime(Realtime {
            reject: true,
            ..Realtime::default()
        })
        .await;
        let backend = backend(&format!("http://{addr}"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = backend.live_channel();
        channel.subscribe(Arc::new(move |status, message| {
            let _ = tx.send((status, message.map(str::to_string)));
        }));

        let (status, message) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ChannelStatus::ChannelError);
        assert!(message.unwrap().contains("denied by policy"));
        assert_eq!(backend.connection_status(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn joined_channel_sends_heartbeats() {
        let state = Realtime::default();
        let addr = spawn_realtime(state.clone()).await;
        let backend =
            ManagedBackend::with_heartbeat(settings(&format!("http://{addr}")), Duration::from_millis(50))
                .unwrap();

        backend.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(state.heartbeats.load(Ordering::SeqCst) >= 2);
        assert_eq!(backend.connection_status(), ConnectionState::Connected);
    }
}

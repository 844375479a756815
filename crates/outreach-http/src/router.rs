use std::{future::Future, sync::Arc};

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info, warn};

use outreach_core::{
    access::AccessGate, audit::AuditLogger, config::Config, connection::SessionManager,
    dispatcher::CampaignDispatcher,
};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub session: SessionManager,
    pub dispatcher: CampaignDispatcher,
    pub gate: AccessGate,
    pub audit: Arc<AuditLogger>,
}

impl AppState {
    pub fn new(cfg: Arc<Config>, session: SessionManager, dispatcher: CampaignDispatcher) -> Self {
        Self {
            gate: AccessGate::new(cfg.api_tokens.clone()),
            audit: Arc::new(AuditLogger::new(
                cfg.audit_log_path.clone(),
                cfg.audit_log_json,
            )),
            cfg,
            session,
            dispatcher,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let operator = Router::new()
        .route("/status", get(handlers::status::get_status))
        .route("/connect", post(handlers::session::connect))
        .route("/disconnect", post(handlers::session::disconnect))
        .route("/send", post(handlers::campaign::send))
        .route("/cancel", post(handlers::campaign::cancel))
        .route("/events", get(handlers::events::subscribe))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::require_token,
        ));

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .merge(operator)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(state.cfg.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = state.cfg.listen_addr();
    if state.gate.is_open() {
        warn!("OUTREACH_API_TOKENS is empty; the operator surface is unauthenticated");
    }

    let app = build_router(state);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind http surface to {addr}"))?;
    info!(addr = %addr, "http surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server error")
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        path::PathBuf,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use base64::Engine as _;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use outreach_core::{
        domain::{Address, ConnectionState, CredentialBundle, CredentialHandle},
        status::StatusBroadcaster,
        store::{MemorySessionStore, SessionStore},
        transport::{MediaPayload, Transport, TransportEvent, TransportEvents},
        Error, Result,
    };

    use super::*;

    #[derive(Default)]
    struct StubTransport {
        events: Mutex<Option<TransportEvents>>,
        sent: Mutex<Vec<String>>,
    }

    impl StubTransport {
        fn emit(&self, event: TransportEvent) {
            if let Some(events) = self.events.lock().unwrap().as_ref() {
                events.emit(event);
            }
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn connect(&self, _: Option<CredentialBundle>, events: TransportEvents) -> Result<()> {
            *self.events.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn send_text(&self, to: &Address, _: &str) -> Result<()> {
            self.sent.lock().unwrap().push(to.to_string());
            Ok(())
        }

        async fn send_media(&self, to: &Address, _: MediaPayload<'_>) -> Result<()> {
            self.sent.lock().unwrap().push(to.to_string());
            Ok(())
        }

        async fn logout(&self) -> Result<()> {
            Ok(())
        }
    }

    fn tmp_file(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        PathBuf::from(format!("/tmp/{prefix}-{}-{ts}.log", std::process::id()))
    }

    fn config(tokens: &str) -> Arc<Config> {
        let audit = tmp_file("outreach-http-audit");
        let vars: HashMap<&str, String> = HashMap::from([
            ("OUTREACH_BRIDGE_CMD", "bridge".to_string()),
            ("OUTREACH_API_TOKENS", tokens.to_string()),
            ("AUDIT_LOG_PATH", audit.display().to_string()),
            ("AUDIT_LOG_JSON", "true".to_string()),
            ("OUTREACH_ATTACHMENT_PAUSE_MS", "0".to_string()),
        ]);
        Arc::new(Config::from_lookup(|k| vars.get(k).cloned()).unwrap())
    }

    /// Keeps everything in memory but refuses to wipe.
    struct StickyStore(MemorySessionStore);

    impl SessionStore for StickyStore {
        fn load(&self) -> Result<Option<CredentialBundle>> {
            self.0.load()
        }

        fn save(&self, bundle: &CredentialBundle) -> Result<CredentialHandle> {
            self.0.save(bundle)
        }

        fn wipe(&self) -> Result<()> {
            Err(Error::Store("permission denied".into()))
        }

        fn handle(&self) -> Result<Option<CredentialHandle>> {
            self.0.handle()
        }
    }

    fn app(tokens: &str) -> (Router, Arc<AppState>, Arc<StubTransport>) {
        app_with_store(tokens, Arc::new(MemorySessionStore::new()))
    }

    fn app_with_store(
        tokens: &str,
        store: Arc<dyn SessionStore>,
    ) -> (Router, Arc<AppState>, Arc<StubTransport>) {
        let cfg = config(tokens);
        let transport = Arc::new(StubTransport::default());
        let session = SessionManager::new(
            transport.clone(),
            store,
            StatusBroadcaster::new(64),
            cfg.reconnect,
        );
        let dispatcher = CampaignDispatcher::new(
            transport.clone(),
            &session,
            cfg.pacing,
            cfg.address_domain.clone(),
        );
        let state = Arc::new(AppState::new(cfg, session, dispatcher));
        (build_router(state.clone()), state, transport)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn call(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = router.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn authenticate(router: &Router, state: &AppState, transport: &StubTransport) {
        let (status, body) = call(router, post("/connect", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);
        transport.emit(TransportEvent::Authenticated);
        state
            .session
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Authenticated)
            .await
            .unwrap();
    }

    async fn next_frame<S>(ws: &mut S) -> Value
    where
        S: futures::Stream<
                Item = std::result::Result<
                    tokio_tungstenite::tungstenite::Message,
                    tokio_tungstenite::tungstenite::Error,
                >,
            > + Unpin,
    {
        use futures::StreamExt;
        use tokio_tungstenite::tungstenite::Message;
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn events_socket_sends_snapshot_then_connection_changes() {
        let (router, state, _) = app("ab+c/d=");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let refused = tokio_tungstenite::connect_async(format!("ws://{addr}/events")).await;
        assert!(refused.is_err());

        let (mut ws, _) = tokio_tungstenite::connect_async(format!(
            "ws://{addr}/events?access_token=ab%2Bc%2Fd%3D"
        ))
        .await
        .unwrap();

        let first = next_frame(&mut ws).await;
        assert_eq!(first["type"], "snapshot");
        assert_eq!(first["connection"], "idle");

        state.session.pair().await.unwrap();
        let next = next_frame(&mut ws).await;
        assert_eq!(next["type"], "connection");
        assert_eq!(next["state"], "awaiting_pairing");
    }

    #[tokio::test]
    async fn health_is_open_but_operator_routes_need_a_token() {
        let (router, _, _) = app("s3cret");
        let res = router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let (status, _) = call(&router, Request::get("/status").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::get("/status")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "idle");
        assert!(body["pairingCode"].is_null());
        assert!(body["campaign"].is_null());
    }

    #[tokio::test]
    async fn connect_reports_pairing_code_on_status() {
        let (router, state, transport) = app("");
        let (_, body) = call(&router, post("/connect", json!({}))).await;
        assert_eq!(body["accepted"], true);

        let (_, mut rx) = state.session.status().subscribe();
        transport.emit(TransportEvent::PairingCode("2@qr".into()));
        rx.recv().await.unwrap();

        let (_, body) = call(&router, Request::get("/status").body(Body::empty()).unwrap()).await;
        assert_eq!(body["state"], "awaiting_pairing");
        assert_eq!(body["pairingCode"], "2@qr");

        let (status, body) = call(&router, post("/connect", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], false);
    }

    #[tokio::test]
    async fn send_is_rejected_until_authenticated() {
        let (router, _, transport) = app("");
        let (status, body) = call(
            &router,
            post("/send", json!({"recipients": ["15550100"], "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["accepted"], false);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_send_bodies_are_bad_requests() {
        let (router, state, transport) = app("");
        authenticate(&router, &state, &transport).await;

        for body in [
            json!({"message": "hi"}),
            json!({"recipients": [], "message": "hi"}),
            json!({"recipients": ["1"], "message": "  "}),
            json!({"recipients": ["1"], "mediaList": [{"data": "%%%"}]}),
        ] {
            let (status, _) = call(&router, post("/send", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
        assert!(!state.dispatcher.is_running());
    }

    #[tokio::test]
    async fn second_campaign_conflicts_and_cancel_stops_the_first() {
        let (router, state, transport) = app("");
        authenticate(&router, &state, &transport).await;

        let media = base64::engine::general_purpose::STANDARD.encode(b"%PDF");
        let (status, body) = call(
            &router,
            post(
                "/send",
                json!({
                    "recipients": ["+1 555 0100", "15550101"],
                    "message": "hello",
                    "mediaList": [{"data": format!("data:application/pdf;base64,{media}")}]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);
        let id = body["campaignId"].as_str().unwrap().to_string();

        let (status, _) = call(&router, post("/send", json!({"recipients": ["1"], "message": "x"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = call(&router, post("/cancel", json!({}))).await;
        assert_eq!(body["accepted"], true);
        assert_eq!(body["campaignId"], id);

        while state.dispatcher.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let (_, body) = call(&router, Request::get("/status").body(Body::empty()).unwrap()).await;
        assert_eq!(body["campaign"]["id"], id);
        assert_eq!(body["campaign"]["phase"], "aborted");
        assert_eq!(body["campaign"]["processed"], 2);
    }

    #[tokio::test]
    async fn disconnect_always_lands_disconnected() {
        let (router, state, transport) = app("");
        authenticate(&router, &state, &transport).await;

        let (status, body) = call(&router, post("/disconnect", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);
        assert_eq!(state.session.state(), ConnectionState::Disconnected);

        let audit = std::fs::read_to_string(state.audit.path()).unwrap();
        assert!(audit.contains("\"event\":\"connect\""));
        assert!(audit.contains("\"event\":\"disconnect\""));
        let _ = std::fs::remove_file(state.audit.path());
    }

    #[tokio::test]
    async fn disconnect_with_a_failed_wipe_reports_server_error() {
        let (router, state, transport) =
            app_with_store("", Arc::new(StickyStore(MemorySessionStore::new())));
        authenticate(&router, &state, &transport).await;

        let (status, body) = call(&router, post("/disconnect", json!({}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["accepted"], false);
        assert!(body["message"].as_str().unwrap().contains("permission denied"));
        assert_eq!(state.session.state(), ConnectionState::Disconnected);
        let _ = std::fs::remove_file(state.audit.path());
    }
}

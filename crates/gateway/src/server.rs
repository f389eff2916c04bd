use std::{future::IntoFuture, net::SocketAddr, sync::Arc};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::{State, rejection::JsonRejection},
        http::StatusCode,
        response::{Html, IntoResponse, Json, Response},
        routing::{get, post},
    },
    firstcontact_channels::Outbound,
    firstcontact_config::{FirstContactConfig, Settings, SettingsError, SettingsPatch, SettingsStore},
    firstcontact_whatsapp::{
        ContactLedger, OnboardingDispatcher, PairError, ReconnectBackoff,
        SessionManager, SledCredentialStore, open_database,
    },
    serde::Serialize,
    serde_json::json,
    tokio::sync::mpsc,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{error, info, warn},
};

use crate::{
    auth::{self, Admin},
    pairing,
    state::AppState,
    transport,
};

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the HTTP router (shared between production startup and tests).
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/qr", get(qr_handler))
        .route("/settings", get(get_settings_handler).post(update_settings_handler))
        .route("/logout", post(logout_handler))
        .route("/pair", post(pair_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Wire the session stack and serve HTTP until failure or Ctrl-C.
pub async fn start_gateway(config: FirstContactConfig) -> anyhow::Result<()> {
    let resolved_auth = auth::resolve_auth(std::env::var("FIRSTCONTACT_TOKEN").ok());
    if resolved_auth.is_open() {
        warn!("FIRSTCONTACT_TOKEN not set, admin endpoints are unauthenticated");
    }

    let data_dir = config
        .session
        .data_dir
        .clone()
        .unwrap_or_else(firstcontact_config::data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    let db = open_database(&data_dir).context("failed to open session database")?;
    let credentials = Arc::new(SledCredentialStore::open(&db)?);
    let ledger = Arc::new(if config.session.persist_ledger {
        ContactLedger::persistent(&db)?
    } else {
        ContactLedger::in_memory()
    });
    let settings = Arc::new(SettingsStore::load(firstcontact_config::settings_path())?);

    let transport = transport::build_transport(&config.transport, &data_dir)?;
    let backoff = ReconnectBackoff::from_millis(
        config.session.reconnect_base_ms,
        config.session.reconnect_max_ms,
    );
    let (manager, supervisor) =
        SessionManager::new(transport, credentials, Arc::clone(&ledger), backoff);

    let dispatcher = OnboardingDispatcher::new(
        Arc::clone(&ledger),
        Arc::clone(&settings),
        config.onboarding.steps.clone(),
        Arc::clone(&manager) as Arc<dyn Outbound>,
    );
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(dispatcher.run(inbound_rx));

    let state = AppState::new(Arc::clone(&manager), Arc::clone(&settings), resolved_auth);
    let app = build_app(state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.bind, config.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // Startup banner.
    let lines = [
        format!("firstcontact v{}", env!("CARGO_PKG_VERSION")),
        format!("listening on {addr}"),
        transport::describe(&config.transport, &data_dir),
        format!("data: {}", data_dir.display()),
        format!(
            "onboarding: {} step(s), ledger {}",
            config.onboarding.steps.len(),
            if config.session.persist_ledger {
                "persistent"
            } else {
                "in-memory"
            }
        ),
    ];
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    tokio::select! {
        served = axum::serve(listener, app).into_future() => {
            served.context("http server failed")?;
        },
        supervised = supervisor.run(inbound_tx) => {
            supervised.context("session supervisor stopped")?;
        },
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        },
    }
    db.flush_async().await.context("failed to flush session database")?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": state.version,
    }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pairing_pending = state.manager.pairing_artifact().await.is_some();
    Json(json!({
        "state": state.manager.state(),
        "pairingPending": pairing_pending,
        "greeted": state.manager.ledger().len(),
    }))
}

async fn qr_handler(State(state): State<AppState>) -> Response {
    let artifact = state.manager.pairing_artifact().await;
    match pairing::render_page(artifact.as_ref()) {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            error!(error = %e, "failed to render pairing code");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to render pairing code").into_response()
        },
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SettingsView {
    allow_groups: bool,
    blocked_numbers: Vec<String>,
}

impl From<Settings> for SettingsView {
    fn from(settings: Settings) -> Self {
        Self {
            allow_groups: settings.allow_groups,
            blocked_numbers: settings.blocked_numbers.into_iter().collect(),
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn get_settings_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(SettingsView::from(state.settings.get()))
}

async fn update_settings_handler(
    _admin: Admin,
    State(state): State<AppState>,
    payload: Result<Json<SettingsPatch>, JsonRejection>,
) -> Response {
    let patch = match payload {
        Ok(Json(patch)) => patch,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let settings = Arc::clone(&state.settings);
    let updated = match tokio::task::spawn_blocking(move || settings.update(patch)).await {
        Ok(updated) => updated,
        Err(e) => {
            error!(error = %e, "settings update task failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist settings");
        },
    };
    match updated {
        Ok(settings) => Json(SettingsView::from(settings)).into_response(),
        Err(e @ SettingsError::InvalidNumber(_)) => {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        },
        Err(e) => {
            error!(error = %e, "failed to persist settings");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist settings")
        },
    }
}

async fn logout_handler(_admin: Admin, State(state): State<AppState>) -> Response {
    match state.manager.logout().await {
        Ok(()) => (StatusCode::OK, "logged out").into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("logout failed: {e}"),
        )
            .into_response(),
    }
}

async fn pair_handler(_admin: Admin, State(state): State<AppState>) -> Response {
    match state.manager.pair() {
        Ok(()) => (StatusCode::ACCEPTED, "pairing started").into_response(),
        Err(e @ PairError::AlreadyActive(_)) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e @ PairError::SupervisorStopped) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        },
    }
}

//! HTTP admin surface.
//!
//! Read-only views of server state plus a password-check endpoint for
//! external services. Diagnostics endpoints only exist in admin mode.

use std::sync::Arc;

use axum::extract::{Form, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use magpie_xmpp::auth::{PasswordError, PasswordProvider};
use magpie_xmpp::util::jid_to_user;
use magpie_xmpp::xep::DiagExtension;
use magpie_xmpp::{Server, Storage};

/// Shared state for the admin routes.
#[derive(Clone)]
pub struct AdminState {
    /// The XMPP server core.
    pub server: Arc<Server>,
    /// Diagnostics extension, for probe management.
    pub diag: Arc<DiagExtension>,
    /// Password provider backing the auth endpoint.
    pub passwords: Arc<dyn PasswordProvider>,
    /// Whether diagnostics endpoints are exposed.
    pub admin_mode: bool,
}

/// Build the admin router.
pub fn router(state: AdminState, auth_path: Option<&str>) -> Router {
    let mut router = Router::new()
        .route("/clients/", get(clients))
        .route("/requests/", get(requests))
        .route("/stats/:key", get(stats))
        .route("/speed/", get(speed))
        .route("/diagnostics/nodes/", get(diag_list))
        .route(
            "/diagnostics/nodes/:jid",
            get(diag_get).post(diag_refresh).delete(diag_delete),
        );
    if let Some(path) = auth_path {
        router = router.route(&format!("/{}", path.trim_matches('/')), axum::routing::post(auth));
    }
    router
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

async fn clients(State(state): State<AdminState>) -> Response {
    let mut body = String::from("<clients>");
    for session in state.server.sessions().list() {
        let address = session
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        body.push_str(&format!(
            "<client jid=\"{}\" address=\"{}\"/>",
            escape_xml(&session.full_jid),
            escape_xml(&address)
        ));
    }
    body.push_str("</clients>");
    xml_response(body)
}

async fn requests(State(state): State<AdminState>) -> Response {
    match state.server.storage().pending_subscription_requests().await {
        Ok(pending) => {
            let mut body = String::from("<requests>");
            for contact in pending {
                body.push_str(&format!(
                    "<request owner=\"{}\" from=\"{}\"/>",
                    escape_xml(&contact.owner),
                    escape_xml(&contact.jid)
                ));
            }
            body.push_str("</requests>");
            xml_response(body)
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn stats(State(state): State<AdminState>, Path(key): Path<String>) -> Response {
    match state.server.metrics().get(&key) {
        Some(value) => value.to_string().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn speed() -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        vec![b'0'; 1024 * 1024],
    )
        .into_response()
}

fn probe_xml(probe: &magpie_xmpp::xep::ProbeRecord) -> String {
    format!(
        "<node jid=\"{}\" rtt=\"{}\" seen=\"{}\"/>",
        escape_xml(&probe.jid),
        probe
            .last_rtt_ms
            .map(|rtt| rtt.to_string())
            .unwrap_or_default(),
        probe
            .last_seen
            .map(|seen| seen.to_rfc3339())
            .unwrap_or_default()
    )
}

async fn diag_list(State(state): State<AdminState>) -> Response {
    if !state.admin_mode {
        return StatusCode::NOT_FOUND.into_response();
    }
    let mut body = String::from("<nodes>");
    for probe in state.diag.list() {
        body.push_str(&probe_xml(&probe));
    }
    body.push_str("</nodes>");
    xml_response(body)
}

async fn diag_get(State(state): State<AdminState>, Path(jid): Path<String>) -> Response {
    if !state.admin_mode {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.diag.get(&jid) {
        Some(probe) => xml_response(probe_xml(&probe)),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn diag_refresh(State(state): State<AdminState>, Path(jid): Path<String>) -> Response {
    if !state.admin_mode {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.diag.refresh(&state.server, &jid).await;
    StatusCode::OK.into_response()
}

async fn diag_delete(State(state): State<AdminState>, Path(jid): Path<String>) -> Response {
    if !state.admin_mode {
        return StatusCode::NOT_FOUND.into_response();
    }
    if state.diag.remove(&jid) {
        StatusCode::OK.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// Auth form fields.
#[derive(Debug, Deserialize)]
struct AuthForm {
    username: String,
    password: String,
}

async fn auth(State(state): State<AdminState>, Form(form): Form<AuthForm>) -> Response {
    // the field may carry a bare JID or just the user part
    let username = if form.username.contains('@') {
        jid_to_user(&form.username).to_string()
    } else {
        form.username.clone()
    };
    match state
        .passwords
        .check(&username, state.server.domain(), &form.password)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(PasswordError::Authorization) => StatusCode::NOT_FOUND.into_response(),
        Err(PasswordError::Temporary) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping() {
        assert_eq!(escape_xml("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}

//! Demo chat server for chatgate.
//!
//! Serves one HTML page and one JSON endpoint standing in for a chat
//! application, plus the security routes, all behind the chatgate layers.

pub mod config;

use axum::{
    extract::State,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use chatgate::{routes, ConfigError, GuardState, SessionHandle};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

pub use config::{ServerConfig, ServiceConfig};

/// Path of the demo chat endpoint.
pub const CHAT_PATH: &str = "/api/chat";

/// Full application router.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the security layers cannot be built.
pub fn app(state: GuardState) -> Result<Router, ConfigError> {
    let router = Router::new()
        .route("/", get(index))
        .route(CHAT_PATH, post(chat))
        .merge(routes::router())
        .with_state(state.clone());

    Ok(chatgate::protect(router, &state)?.layer(TraceLayer::new_for_http()))
}

/// Chat message sent by the page.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// User message.
    pub message: String,
}

/// Reply to a chat message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatReply {
    /// Assistant reply.
    pub reply: String,
    /// Messages exchanged in this session so far.
    pub turns: u64,
}

const TURNS_KEY: &str = "chat_turns";

/// `POST /api/chat`
///
/// Echoes the message and counts turns in the session.
async fn chat(session: SessionHandle, Json(request): Json<ChatRequest>) -> Json<ChatReply> {
    let turns = {
        let mut session = session.lock();
        let turns = session.get::<u64>(TURNS_KEY).unwrap_or(0) + 1;
        session.insert_value(TURNS_KEY, turns.into());
        turns
    };
    tracing::debug!(turns, "Chat message received");
    Json(ChatReply {
        reply: format!("You said: {}", request.message.trim()),
        turns,
    })
}

/// `GET /`
///
/// The token is hex, so it can be embedded without escaping.
async fn index(State(state): State<GuardState>, session: SessionHandle) -> Html<String> {
    let token = state.csrf().get_or_create(&mut session.lock());
    let csrf = &state.config().csrf;
    let (header, rotated_header) = (&csrf.header_name, &csrf.response_header);
    Html(format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="csrf-token" content="{token}">
<title>chatgate</title>
<style>
body {{ font-family: sans-serif; max-width: 40rem; margin: 2rem auto; }}
#log p {{ margin: 0.25rem 0; }}
</style>
</head>
<body>
<div id="log"></div>
<form id="chat" method="post" action="{CHAT_PATH}">
<input type="hidden" name="csrf_token" value="{token}">
<input name="message" autocomplete="off">
<button type="submit">Send</button>
</form>
<script>
document.getElementById("chat").addEventListener("submit", async (event) => {{
  event.preventDefault();
  const meta = document.querySelector('meta[name="csrf-token"]');
  const input = event.target.elements.message;
  const res = await fetch("{CHAT_PATH}", {{
    method: "POST",
    headers: {{ "Content-Type": "application/json", "{header}": meta.content }},
    body: JSON.stringify({{ message: input.value }}),
  }});
  const rotated = res.headers.get("{rotated_header}");
  if (rotated) meta.content = rotated;
  const line = document.createElement("p");
  line.textContent = res.ok ? (await res.json()).reply : "Request rejected";
  document.getElementById("log").appendChild(line);
  input.value = "";
}});
</script>
</body>
</html>
"#
    ))
}

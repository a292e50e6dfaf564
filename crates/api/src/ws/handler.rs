use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;

use super::session::{self, Intake};
use crate::state::AppState;

/// `GET /ws/host` — practitioner channel. Authentication happens inside
/// the socket, on the first control frame.
pub async fn host_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::run(socket, state, Intake::Host))
}

/// `GET /ws/patient` — patient channel; joins an existing room with the
/// credentials the host shared out-of-band.
pub async fn patient_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::run(socket, state, Intake::Patient))
}

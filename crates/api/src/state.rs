use std::sync::Arc;
use std::time::Duration;

use consulta_config::Settings;
use consulta_services::{AuthService, RoomRegistry};

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub auth: Arc<AuthService>,
    pub rooms: Arc<RoomRegistry>,
}

impl AppState {
    /// Builds the shared state and starts the room GC sweeper.
    pub fn new(settings: Settings) -> Self {
        let auth = Arc::new(AuthService::new(settings.jwt.clone()));
        let rooms = Arc::new(RoomRegistry::new(Duration::from_millis(
            settings.live.room_ttl_ms,
        )));
        // Detached: the sweeper runs for the process lifetime.
        let _ = rooms.spawn_sweeper(Duration::from_millis(settings.live.sweep_interval_ms));

        Self {
            settings,
            auth,
            rooms,
        }
    }
}

pub mod auth;
pub mod live;

pub use auth::AuthService;
pub use live::registry::RoomRegistry;

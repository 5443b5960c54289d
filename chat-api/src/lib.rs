pub mod auth;
pub mod error;
pub mod handlers;
pub mod reconciler;
pub mod server;
pub mod sessions;
pub mod websocket;

pub use reconciler::run as run_reconciler;
pub use server::{run, ApiState};
pub use sessions::SessionRegistry;

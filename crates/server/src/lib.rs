pub mod config;
pub mod routes;
pub mod state;
mod ws;

pub use routes::build_app;
pub use state::AppState;

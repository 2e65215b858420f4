mod app;
mod background;
pub mod config;
pub mod core;
pub mod events;
pub mod logging;
pub mod sync;
pub mod traffic;

pub use app::App;

// Always expose testing module (integration tests need it)
pub mod testing;

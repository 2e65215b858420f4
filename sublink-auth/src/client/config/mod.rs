mod settings;

pub use settings::{Settings, DEVELOPMENT_BASE_URL, PRODUCTION_BASE_URL};

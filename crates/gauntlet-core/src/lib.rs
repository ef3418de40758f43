pub mod config;
pub mod error;
pub mod event;
pub mod sanitize;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FailureCategory, FailureKind, GauntletError, NodeFailure, Result};
pub use event::EventBus;
pub use types::*;

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use context::WorkflowContext;
pub use error::{ErrorKind, Result, TrellisError};
pub use event::{EventBus, WorkflowEvent};
pub use types::*;

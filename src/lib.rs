pub mod backend;
pub mod compress;
pub mod config;
pub mod draft;
pub mod error;
pub mod evict;
pub mod history;
pub mod legacy;
pub mod model;
pub mod poller;
pub mod queue;
pub mod rate_limit;
pub mod store;
pub mod templates;
pub mod util;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, UpstreamError};
pub use store::Store;

use std::sync::Arc;

use crate::config::Config;
use crate::rate_limit::PublicRateLimiter;
use crate::sandbox::{Capabilities, ExecutionHost};
use crate::store::EndpointStore;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub store: Arc<dyn EndpointStore>,
    pub config: Config,
    pub host: ExecutionHost,
    /// Granted to dispatched endpoints and `/api/execute`.
    pub capabilities: Arc<Capabilities>,
    /// Granted to `/api/public/execute`.
    pub public_capabilities: Arc<Capabilities>,
    pub public_limiter: PublicRateLimiter,
}

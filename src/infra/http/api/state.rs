use std::sync::Arc;
use std::time::Duration;

use crate::application::compile::CompileService;

use super::rate_limit::ApiRateLimiter;

#[derive(Clone)]
pub struct ApiState {
    pub compile: Arc<CompileService>,
    pub rate_limiter: Arc<ApiRateLimiter>,
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl ApiState {
    pub fn retention_seconds(&self) -> u64 {
        self.retention.as_secs()
    }
}

use std::sync::Arc;

use mangatrack_config::Settings;
use mangatrack_core::audit::AuditLogger;
use mangatrack_core::library::MetadataRetry;
use mangatrack_core::outbox::Reconciler;
use mangatrack_core::progress::ProgressEngine;
use mangatrack_core::queue::QueueService;
use mangatrack_core::ratelimit::FixedWindowLimiter;
use mangatrack_core::security::CsrfPolicy;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub queue: Arc<dyn QueueService>,
    pub reconciler: Arc<Reconciler>,
    pub progress: Arc<ProgressEngine>,
    pub metadata_retry: Arc<MetadataRetry>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub csrf: Arc<CsrfPolicy>,
    pub audit: AuditLogger,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("environment", &self.settings.environment)
            .finish_non_exhaustive()
    }
}

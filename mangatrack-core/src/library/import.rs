//! Library import: payload validation (including the SSRF guard on
//! user-supplied URLs) and the worker that materialises accepted rows.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::error::CoreError;
use crate::progress::ProgressEngine;
use crate::queue::{
    EnqueueOptions, ImportEntry, ImportJobPayload, JobId, JobPayload, JobPriority, QueueName,
    QueueService, SeriesResolutionJob,
};
use crate::Result;

use super::metadata::LibraryStore;

/// Entries accepted per import request, post-validation.
pub const MAX_IMPORT_ENTRIES: usize = 500;
const MAX_TITLE_LENGTH: usize = 512;

/// Unvalidated wire shape of one import row.
#[derive(Clone, Debug, Deserialize)]
pub struct RawImportEntry {
    pub title: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub last_read_chapter: Option<f64>,
}

/// Whether a user-supplied URL is safe to fetch from the backend: http(s)
/// only, and never a loopback/private/link-local destination. Host names
/// are checked syntactically; resolution-time re-checks belong to the
/// fetch path.
pub fn is_safe_public_url(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    match url.host() {
        None => false,
        Some(Host::Domain(domain)) => {
            let lower = domain.to_ascii_lowercase();
            lower != "localhost"
                && !lower.ends_with(".localhost")
                && !lower.ends_with(".local")
                && !lower.ends_with(".internal")
        }
        Some(Host::Ipv4(ip)) => is_public_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_public_ip(IpAddr::V6(ip)),
    }
}

fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00)
        }
    }
}

/// Validate an import payload: cap the batch, check each row, and drop
/// in-batch duplicates (keyed on the source URL when present, else the
/// title).
pub fn validate_import(raw: Vec<RawImportEntry>) -> Result<Vec<ImportEntry>> {
    let mut seen = HashSet::new();
    let mut accepted = Vec::new();

    for entry in raw {
        let title = entry.title.trim().to_string();
        if title.is_empty() {
            return Err(CoreError::Validation("import entry title is empty".into()));
        }
        if title.len() > MAX_TITLE_LENGTH {
            return Err(CoreError::Validation(format!(
                "import entry title exceeds {MAX_TITLE_LENGTH} characters"
            )));
        }
        if let Some(url) = entry.source_url.as_deref() {
            if !is_safe_public_url(url) {
                return Err(CoreError::Validation(format!(
                    "import entry url is not a reachable public address: {url}"
                )));
            }
        }

        let key = entry
            .source_url
            .clone()
            .unwrap_or_else(|| title.to_ascii_lowercase());
        if !seen.insert(key) {
            continue;
        }

        accepted.push(ImportEntry {
            title,
            source_url: entry.source_url,
            external_id: entry.external_id,
            source_name: entry.source_name,
            last_read_chapter: entry.last_read_chapter.unwrap_or(0.0).max(0.0),
        });
        if accepted.len() > MAX_IMPORT_ENTRIES {
            return Err(CoreError::Validation(format!(
                "import exceeds {MAX_IMPORT_ENTRIES} entries"
            )));
        }
    }
    Ok(accepted)
}

/// Materialises accepted import rows: creates pending entries (skipping
/// rows the user already tracks), queues resolution for each, and grants
/// the one-time migration bonus.
pub struct ImportWorker {
    queue: Arc<dyn QueueService>,
    library: Arc<dyn LibraryStore>,
    progress: Arc<ProgressEngine>,
    worker_id: String,
    idle_backoff: Duration,
}

impl fmt::Debug for ImportWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportWorker")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl ImportWorker {
    pub fn new(
        queue: Arc<dyn QueueService>,
        library: Arc<dyn LibraryStore>,
        progress: Arc<ProgressEngine>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            library,
            progress,
            worker_id: worker_id.into(),
            idle_backoff: Duration::from_secs(2),
        }
    }

    pub async fn tick(&self) -> Result<bool> {
        let Some(job) = self.queue.dequeue(QueueName::Import, &self.worker_id).await? else {
            return Ok(false);
        };
        let JobPayload::Import(import) = &job.payload else {
            self.queue
                .fail(QueueName::Import, &job.id, "unexpected payload kind", false)
                .await?;
            return Ok(true);
        };

        match self.process(import).await {
            Ok(created) => {
                info!(
                    job = %job.id,
                    user = %import.user_id,
                    entries = import.entries.len(),
                    created,
                    "library import applied"
                );
                self.queue.complete(QueueName::Import, &job.id).await?;
            }
            Err(err) => {
                self.queue
                    .fail(QueueName::Import, &job.id, &err.to_string(), err.is_retryable())
                    .await?;
            }
        }
        Ok(true)
    }

    async fn process(&self, import: &ImportJobPayload) -> Result<usize> {
        let mut created = 0usize;
        let mut imported_chapters = 0i64;

        for entry in &import.entries {
            match self.library.create_pending_entry(import.user_id, entry).await? {
                Some(entry_id) => {
                    created += 1;
                    imported_chapters += entry.last_read_chapter.max(0.0) as i64;
                    self.queue
                        .enqueue(
                            JobId::series_resolution(entry_id),
                            JobPayload::SeriesResolution(SeriesResolutionJob {
                                entry_id,
                                user_id: import.user_id,
                            }),
                            EnqueueOptions {
                                priority: Some(JobPriority::P2),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                None => {
                    debug!(user = %import.user_id, title = %entry.title, "import row already tracked, skipped");
                }
            }
        }

        if imported_chapters > 0 {
            match self
                .progress
                .grant_migration_bonus(import.user_id, imported_chapters)
                .await
            {
                Ok(0) => {}
                Ok(amount) => {
                    debug!(user = %import.user_id, amount, "migration bonus granted");
                }
                Err(err) => {
                    // The bonus is best-effort; the import itself stands.
                    warn!(user = %import.user_id, error = %err, "migration bonus failed");
                }
            }
        }
        Ok(created)
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(worker = %self.worker_id, "import worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.tick().await {
                Ok(true) => {}
                _ => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_backoff) => {}
                    }
                }
            }
        }
        info!(worker = %self.worker_id, "import worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(title: &str, url: Option<&str>) -> RawImportEntry {
        RawImportEntry {
            title: title.to_string(),
            source_url: url.map(str::to_owned),
            external_id: None,
            source_name: None,
            last_read_chapter: None,
        }
    }

    #[test]
    fn ssrf_guard_rejects_internal_targets() {
        assert!(is_safe_public_url("https://mangadex.example/title/1"));
        assert!(is_safe_public_url("http://203.0.113.9/feed"));

        assert!(!is_safe_public_url("http://localhost/admin"));
        assert!(!is_safe_public_url("http://api.localhost/admin"));
        assert!(!is_safe_public_url("http://127.0.0.1:8080/"));
        assert!(!is_safe_public_url("http://10.0.0.4/"));
        assert!(!is_safe_public_url("http://192.168.1.1/"));
        assert!(!is_safe_public_url("http://169.254.169.254/latest/meta-data"));
        assert!(!is_safe_public_url("http://[::1]/"));
        assert!(!is_safe_public_url("http://metadata.internal/"));
        assert!(!is_safe_public_url("file:///etc/passwd"));
        assert!(!is_safe_public_url("not a url"));
    }

    #[test]
    fn batch_duplicates_are_dropped_not_rejected() {
        let entries = validate_import(vec![
            raw("One Piece", Some("https://site.example/op")),
            raw("One Piece again", Some("https://site.example/op")),
            raw("Berserk", None),
            raw("berserk", None),
        ])
        .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn empty_title_and_bad_url_are_validation_errors() {
        assert!(matches!(
            validate_import(vec![raw("   ", None)]),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            validate_import(vec![raw("x", Some("http://127.0.0.1/"))]),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn oversized_batches_are_rejected() {
        let entries: Vec<RawImportEntry> = (0..MAX_IMPORT_ENTRIES + 1)
            .map(|index| raw(&format!("series {index}"), None))
            .collect();
        assert!(matches!(
            validate_import(entries),
            Err(CoreError::Validation(_))
        ));
    }
}

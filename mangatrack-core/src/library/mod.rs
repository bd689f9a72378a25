//! Library maintenance operations outside the hot sync path: metadata
//! retry and bulk import.

pub mod import;
pub mod metadata;

pub use import::{
    is_safe_public_url, validate_import, ImportWorker, RawImportEntry, MAX_IMPORT_ENTRIES,
};
pub use metadata::{
    LibraryStore, MetadataRetry, MetadataRetryConfig, MetadataState, PostgresLibraryStore,
    RetryOutcome, METADATA_SOURCE_USER_OVERRIDE,
};

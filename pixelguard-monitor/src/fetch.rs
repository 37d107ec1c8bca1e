//! Source fetching.
//!
//! The monitor treats a locator as opaque; a [`SourceFetcher`] decides what it
//! means. [`FileFetcher`] reads local paths and uses the file's modification
//! time and size as its cache tag.

use std::io;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use pixelguard_config::SourceConfig;

use crate::FetchError;

/// Outcome of one poll attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// The cache tag still matches; the body was not transferred.
    NotModified,
    Content {
        body: String,
        /// ETag/Last-Modified equivalent, when the source exposes one.
        cache_tag: Option<String>,
    },
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetches the current content of `source`. `cache_tag` is the tag of the last
    /// accepted fetch, so the fetcher can answer [`Fetched::NotModified`].
    async fn fetch(
        &self,
        source: &SourceConfig,
        cache_tag: Option<&str>,
    ) -> Result<Fetched, FetchError>;
}

/// Fetches sources whose locator is a filesystem path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileFetcher;

#[async_trait]
impl SourceFetcher for FileFetcher {
    async fn fetch(
        &self,
        source: &SourceConfig,
        cache_tag: Option<&str>,
    ) -> Result<Fetched, FetchError> {
        let path = source
            .locator
            .strip_prefix("file://")
            .unwrap_or(&source.locator);
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(source.locator.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Err(FetchError::Rejected(format!(
                "{} is not a regular file",
                source.locator
            )));
        }

        let tag = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| format!("{}.{:09}-{}", d.as_secs(), d.subsec_nanos(), metadata.len()));
        if tag.is_some() && tag.as_deref() == cache_tag {
            return Ok(Fetched::NotModified);
        }

        let bytes = tokio::fs::read(path).await?;
        let body = String::from_utf8(bytes)
            .map_err(|_| FetchError::Rejected(format!("{} is not valid UTF-8", source.locator)))?;
        Ok(Fetched::Content {
            body,
            cache_tag: tag,
        })
    }
}

use std::collections::HashMap;
use std::convert::Infallible;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::config::RetriesSettings;
use crate::error::LindiError;
use crate::private;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchErrorKind {
    #[error("cannot parse url `{0}`")]
    CannotParseUrl(String),
    #[error("http status {status} fetching `{url}`")]
    HttpStatus { url: String, status: u16 },
    #[error("error executing range request")]
    Request(#[from] reqwest::Error),
    #[error("i/o error reading `{url}`")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("reference size mismatch for `{url}`: expected {expected} bytes, got {actual}")]
    SizeMismatch { url: String, expected: u64, actual: u64 },
    #[error("fetch was cancelled")]
    Cancelled,
}

pub type FetchError = LindiError<FetchErrorKind>;

impl<E> From<E> for FetchError
where
    E: Into<FetchErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl From<Infallible> for FetchErrorKind {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

fn is_transient(kind: &FetchErrorKind) -> bool {
    match kind {
        FetchErrorKind::Request(e) => !e.is_builder(),
        FetchErrorKind::HttpStatus { status, .. } => {
            *status == 429 || (500..600).contains(status)
        }
        FetchErrorKind::Io { source, .. } => matches!(
            source.kind(),
            std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
        ),
        _ => false,
    }
}

/// Fetches a byte range from a location. Implementations exist per URL
/// scheme; they are created lazily and memoized by the [`UrlResolver`].
#[async_trait]
pub trait ChunkFetcher: std::fmt::Debug + private::Sealed + Send + Sync {
    async fn fetch(&self, url: &str, range: Range<u64>) -> FetchResult<Bytes>;
}

/// The process wide HTTP client, created on first use so that connection
/// pools are shared by every store in the process.
fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent(concat!("lindi/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default()
    })
}

#[derive(Debug, Default)]
pub struct HttpFetcher;

impl private::Sealed for HttpFetcher {}

#[async_trait]
impl ChunkFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, range: Range<u64>) -> FetchResult<Bytes> {
        let expected = range.end - range.start;
        let parsed = url::Url::parse(url)
            .map_err(|_| FetchErrorKind::CannotParseUrl(url.to_string()))?;
        let response = http_client()
            .get(parsed)
            .header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", range.start, range.end - 1),
            )
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchErrorKind::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }
        let body = response.bytes().await?;
        if status == reqwest::StatusCode::OK && body.len() as u64 > expected {
            // the server ignored the Range header and sent the whole file
            let start = range.start as usize;
            let end = range.end as usize;
            if body.len() >= end {
                return Ok(body.slice(start..end));
            }
        }
        if body.len() as u64 != expected {
            return Err(FetchErrorKind::SizeMismatch {
                url: url.to_string(),
                expected,
                actual: body.len() as u64,
            }
            .into());
        }
        Ok(body)
    }
}

/// Reads ranges of local files, for `file://` URLs and bare paths. Relative
/// paths resolve against the directory holding the manifest.
#[derive(Debug, Default)]
pub struct LocalFsFetcher {
    base_dir: Option<PathBuf>,
}

impl LocalFsFetcher {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self { base_dir }
    }

    fn resolve_path(&self, url: &str) -> PathBuf {
        let raw = url.strip_prefix("file://").unwrap_or(url);
        let path = PathBuf::from(raw);
        match (&self.base_dir, path.is_relative()) {
            (Some(base), true) => base.join(path),
            _ => path,
        }
    }
}

impl private::Sealed for LocalFsFetcher {}

#[async_trait]
impl ChunkFetcher for LocalFsFetcher {
    async fn fetch(&self, url: &str, range: Range<u64>) -> FetchResult<Bytes> {
        let path = self.resolve_path(url);
        let io_err = |source| FetchErrorKind::Io { url: url.to_string(), source };
        let mut file = tokio::fs::File::open(&path).await.map_err(io_err)?;
        let len = file.metadata().await.map_err(io_err)?.len();
        if len < range.end {
            return Err(FetchErrorKind::SizeMismatch {
                url: url.to_string(),
                expected: range.end - range.start,
                actual: len.saturating_sub(range.start),
            }
            .into());
        }
        file.seek(std::io::SeekFrom::Start(range.start)).await.map_err(io_err)?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf).await.map_err(io_err)?;
        Ok(buf.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Scheme {
    Http,
    LocalFs,
}

fn scheme_for(url: &str) -> Scheme {
    if url.starts_with("http://") || url.starts_with("https://") {
        Scheme::Http
    } else {
        Scheme::LocalFs
    }
}

/// Resolves `(url, offset, size)` references to bytes, with bounded retries
/// and per-scheme fetcher memoization.
#[derive(Debug)]
pub struct UrlResolver {
    retries: RetriesSettings,
    base_dir: Option<PathBuf>,
    fetchers: RwLock<HashMap<Scheme, Arc<dyn ChunkFetcher>>>,
}

impl UrlResolver {
    pub fn new(retries: RetriesSettings, base_dir: Option<PathBuf>) -> Self {
        Self { retries, base_dir, fetchers: RwLock::new(HashMap::new()) }
    }

    #[cfg(test)]
    pub(crate) fn with_fetcher(
        retries: RetriesSettings,
        fetcher: Arc<dyn ChunkFetcher>,
    ) -> Self {
        let mut fetchers = HashMap::new();
        fetchers.insert(Scheme::Http, Arc::clone(&fetcher));
        fetchers.insert(Scheme::LocalFs, fetcher);
        Self { retries, base_dir: None, fetchers: RwLock::new(fetchers) }
    }

    async fn get_fetcher(&self, url: &str) -> Arc<dyn ChunkFetcher> {
        let scheme = scheme_for(url);
        // optimistically lock for reads; fetcher creation is rare
        let fetchers = self.fetchers.read().await;
        if let Some(fetcher) = fetchers.get(&scheme).cloned() {
            return fetcher;
        }
        drop(fetchers);
        let mut fetchers = self.fetchers.write().await;
        // somebody else may have created the fetcher between the locks
        if let Some(fetcher) = fetchers.get(&scheme).cloned() {
            return fetcher;
        }
        let fetcher: Arc<dyn ChunkFetcher> = match scheme {
            Scheme::Http => Arc::new(HttpFetcher),
            Scheme::LocalFs => Arc::new(LocalFsFetcher::new(self.base_dir.clone())),
        };
        fetchers.insert(scheme, Arc::clone(&fetcher));
        fetcher
    }

    /// Fetch `size` bytes at `offset` from `url`, retrying transient failures
    /// with exponential backoff. A mismatched response length is a corrupt
    /// reference and is not retried.
    #[instrument(skip(self, cancel))]
    pub async fn fetch(
        &self,
        url: &str,
        offset: u64,
        size: u64,
        cancel: Option<&CancellationToken>,
    ) -> FetchResult<Bytes> {
        let fetcher = self.get_fetcher(url).await;
        let range = offset..offset + size;
        let max_tries = u32::from(self.retries.max_tries().get());
        let mut attempt = 1u32;
        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(FetchErrorKind::Cancelled.into());
                }
            }
            match fetcher.fetch(url, range.clone()).await {
                Ok(bytes) => {
                    if bytes.len() as u64 != size {
                        return Err(FetchErrorKind::SizeMismatch {
                            url: url.to_string(),
                            expected: size,
                            actual: bytes.len() as u64,
                        }
                        .into());
                    }
                    trace!(url, offset, size, attempt, "range fetched");
                    return Ok(bytes);
                }
                Err(err) if attempt < max_tries && is_transient(err.kind()) => {
                    let backoff = backoff_duration(&self.retries, attempt);
                    warn!(url, attempt, ?backoff, error = %err.kind(), "transient fetch failure, retrying");
                    attempt += 1;
                    match cancel {
                        Some(token) => {
                            tokio::select! {
                                _ = token.cancelled() => {
                                    debug!(url, "fetch cancelled while backing off");
                                    return Err(FetchErrorKind::Cancelled.into());
                                }
                                _ = tokio::time::sleep(backoff) => {}
                            }
                        }
                        None => tokio::time::sleep(backoff).await,
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Download a whole remote file (no Range header), with the same transient
/// retry policy as range fetches. Used for small remote JSON manifests.
pub async fn fetch_whole_url(url: &str, retries: &RetriesSettings) -> FetchResult<Bytes> {
    let max_tries = u32::from(retries.max_tries().get());
    let mut attempt = 1u32;
    loop {
        let result: FetchResult<Bytes> = async {
            let response = http_client().get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchErrorKind::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                }
                .into());
            }
            Ok(response.bytes().await?)
        }
        .await;
        match result {
            Ok(bytes) => return Ok(bytes),
            Err(err) if attempt < max_tries && is_transient(err.kind()) => {
                let backoff = backoff_duration(retries, attempt);
                warn!(url, attempt, ?backoff, error = %err.kind(), "transient download failure, retrying");
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_duration(retries: &RetriesSettings, attempt: u32) -> Duration {
    let initial = u64::from(retries.initial_backoff_ms());
    let cap = u64::from(retries.max_backoff_ms());
    let ms = initial.saturating_mul(1u64 << (attempt - 1).min(32)).min(cap);
    Duration::from_millis(ms)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Write as _;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let retries = RetriesSettings::default();
        assert_eq!(backoff_duration(&retries, 1), Duration::from_millis(500));
        assert_eq!(backoff_duration(&retries, 2), Duration::from_millis(1000));
        assert_eq!(backoff_duration(&retries, 5), Duration::from_millis(8000));
        // capped at 30s
        assert_eq!(backoff_duration(&retries, 12), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_local_fs_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::File::create(&path).unwrap().write_all(b"0123456789").unwrap();

        let resolver = UrlResolver::new(RetriesSettings::default(), None);
        let bytes =
            resolver.fetch(path.to_str().unwrap(), 2, 4, None).await.unwrap();
        assert_eq!(bytes.as_ref(), b"2345");

        // relative path resolution against a base directory
        let resolver = UrlResolver::new(
            RetriesSettings::default(),
            Some(dir.path().to_path_buf()),
        );
        let bytes = resolver.fetch("data.bin", 0, 10, None).await.unwrap();
        assert_eq!(bytes.as_ref(), b"0123456789");
    }

    #[tokio::test]
    async fn test_local_fs_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::File::create(&path).unwrap().write_all(b"abc").unwrap();

        let resolver = UrlResolver::new(RetriesSettings::default(), None);
        let err = resolver
            .fetch(path.to_str().unwrap(), 0, 100, None)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), FetchErrorKind::SizeMismatch { .. }));
    }

    #[derive(Debug)]
    struct FlakyFetcher {
        calls: std::sync::atomic::AtomicU32,
        succeed_on: Option<u32>,
    }

    impl private::Sealed for FlakyFetcher {}

    #[async_trait]
    impl ChunkFetcher for FlakyFetcher {
        async fn fetch(&self, url: &str, range: Range<u64>) -> FetchResult<Bytes> {
            let call =
                self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if Some(call) == self.succeed_on {
                Ok(Bytes::from(vec![7u8; (range.end - range.start) as usize]))
            } else {
                Err(FetchErrorKind::HttpStatus { url: url.to_string(), status: 503 }
                    .into())
            }
        }
    }

    fn fast_retries() -> RetriesSettings {
        RetriesSettings {
            max_tries: std::num::NonZeroU16::new(6),
            initial_backoff_ms: Some(1),
            max_backoff_ms: Some(2),
        }
    }

    #[tokio::test]
    async fn test_retries_exhaust_after_max_tries() {
        let fetcher = Arc::new(FlakyFetcher {
            calls: std::sync::atomic::AtomicU32::new(0),
            succeed_on: None,
        });
        let resolver = UrlResolver::with_fetcher(fast_retries(), fetcher.clone());
        let err = resolver.fetch("https://x/y", 0, 4, None).await.unwrap_err();
        assert!(matches!(err.kind(), FetchErrorKind::HttpStatus { status: 503, .. }));
        assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_retries_stop_on_success() {
        let fetcher = Arc::new(FlakyFetcher {
            calls: std::sync::atomic::AtomicU32::new(0),
            succeed_on: Some(3),
        });
        let resolver = UrlResolver::with_fetcher(fast_retries(), fetcher.clone());
        let bytes = resolver.fetch("https://x/y", 10, 4, None).await.unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let resolver = UrlResolver::new(RetriesSettings::default(), None);
        let err = resolver.fetch("nope.bin", 0, 1, Some(&token)).await.unwrap_err();
        assert!(matches!(err.kind(), FetchErrorKind::Cancelled));
    }
}

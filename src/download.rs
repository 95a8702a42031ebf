//! Bounded, resumable download of staged order items.
//!
//! Each payload is written next to a `<path>.size` sidecar holding its
//! expected byte count. A payload counts as present only when both files exist
//! and agree, which is what lets a rerun skip finished work.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::HeaderMap;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::error::{DownloadFailure, Error, Result};
use crate::gateway::TransportError;
use crate::order::{DownloadMetaMap, DownloadStatus};
use crate::util::{display_name, ensure_parent, http_client, jitter, sidecar_path};

/// An opened download stream.
pub struct Fetched {
    /// Declared `Content-Length`, if any.
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

/// Opens a streamed GET for a download URL.
pub trait ByteSource: Send + Sync {
    fn open(&self, url: &str) -> std::result::Result<Fetched, TransportError>;
}

/// [`ByteSource`] over a blocking `reqwest` client without a request timeout.
#[derive(Debug, Clone)]
pub struct HttpSource {
    http: HttpClient,
}

impl HttpSource {
    pub fn new(verify: bool) -> Result<Self> {
        let http = http_client(None, verify, HeaderMap::new())?;
        Ok(Self { http })
    }
}

impl ByteSource for HttpSource {
    fn open(&self, url: &str) -> std::result::Result<Fetched, TransportError> {
        let resp = self.http.get(url).send()?.error_for_status()?;
        Ok(Fetched {
            content_length: resp.content_length(),
            body: Box::new(resp),
        })
    }
}

/// One URL to fetch into one local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchJob {
    pub download_id: String,
    pub url: String,
    pub local_path: PathBuf,
}

/// True when `path` and its sidecar both exist and agree on a non-zero size.
pub fn available_locally(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(text) = std::fs::read_to_string(sidecar_path(path)) else {
        return false;
    };
    match text.trim().parse::<u64>() {
        Ok(expected) => expected > 0 && meta.len() == expected,
        Err(_) => false,
    }
}

/// Worker pool of fixed width that downloads [`FetchJob`]s.
pub struct Fetcher {
    source: Arc<dyn ByteSource>,
    workers: usize,
    retry_max: usize,
    retry_sleep: Duration,
    start_jitter: Duration,
    progress: bool,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("workers", &self.workers)
            .field("retry_max", &self.retry_max)
            .field("retry_sleep", &self.retry_sleep)
            .field("start_jitter", &self.start_jitter)
            .field("progress", &self.progress)
            .finish()
    }
}

impl Fetcher {
    pub fn new(source: Arc<dyn ByteSource>) -> Self {
        Self {
            source,
            workers: 10,
            retry_max: 3,
            retry_sleep: Duration::from_secs(5),
            start_jitter: Duration::from_secs(3),
            progress: true,
        }
    }

    /// Maximum number of concurrent downloads.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Retries after the first attempt.
    pub fn with_retry_max(mut self, retry_max: usize) -> Self {
        self.retry_max = retry_max;
        self
    }

    pub fn with_retry_sleep(mut self, retry_sleep: Duration) -> Self {
        self.retry_sleep = retry_sleep;
        self
    }

    /// Ceiling of the random delay before each attempt.
    pub fn with_start_jitter(mut self, start_jitter: Duration) -> Self {
        self.start_jitter = start_jitter;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs every job and blocks until all have settled.
    ///
    /// Each finished job records its url, local path and status in `meta`.
    /// Jobs that exhaust their retries do not stop their siblings; they are
    /// reported together as [`Error::DownloadsFailed`] at the end.
    pub fn fetch_all(
        &self,
        jobs: Vec<FetchJob>,
        meta: &Mutex<DownloadMetaMap>,
        cancel: &CancelToken,
    ) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let total = jobs.len();
        info!("downloading {} file(s) with {} worker(s)", total, self.workers.min(total));

        let queue = Mutex::new(jobs.into_iter().collect::<VecDeque<_>>());
        let failures = Mutex::new(Vec::new());
        let finished = AtomicUsize::new(0);
        let bars = self.progress.then(MultiProgress::new);

        thread::scope(|s| {
            for _ in 0..self.workers.min(total) {
                s.spawn(|| {
                    loop {
                        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                        let Some(job) = next else { break };

                        let result = self.fetch_one(&job, cancel, bars.as_ref());

                        let mut map = meta.lock().unwrap_or_else(PoisonError::into_inner);
                        let entry = map.entry(job.download_id.clone()).or_default();
                        entry.url = Some(job.url.clone());
                        entry.local_path = Some(job.local_path.clone());
                        match result {
                            Ok(()) => entry.status = DownloadStatus::Complete,
                            Err(failure) => {
                                entry.status = DownloadStatus::Pending;
                                error!("{}", failure);
                                failures
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .push(failure);
                            }
                        }
                        drop(map);

                        let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                        info!("download finished by {}/{} file(s)", done, total);
                    }
                });
            }
        });

        let failures = failures.into_inner().unwrap_or_else(PoisonError::into_inner);
        if failures.is_empty() {
            info!("all {} download(s) finished", total);
            return Ok(());
        }

        let snapshot = meta.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Err(Error::DownloadsFailed {
            failures,
            meta: Box::new(snapshot),
        })
    }

    fn fetch_one(
        &self,
        job: &FetchJob,
        cancel: &CancelToken,
        bars: Option<&MultiProgress>,
    ) -> std::result::Result<(), DownloadFailure> {
        let name = display_name(&job.local_path);
        if available_locally(&job.local_path) {
            info!("{} - {} is locally available", name, job.local_path.display());
            return Ok(());
        }

        let mut attempts = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(self.failure(job, attempts, "cancelled".to_string()));
            }
            attempts += 1;
            thread::sleep(jitter(self.start_jitter));
            debug!("{} - downloading {} (attempt {})", name, job.url, attempts);

            match self.attempt(job, bars) {
                Ok(size) => {
                    info!("{} - downloaded {} byte(s)", name, size);
                    return Ok(());
                }
                Err(err) => {
                    remove_partial(&job.local_path);
                    if attempts > self.retry_max {
                        return Err(self.failure(job, attempts, err.to_string()));
                    }
                    warn!(
                        "{} - {}, trying again ({} retries left)",
                        name,
                        err,
                        self.retry_max + 1 - attempts
                    );
                    thread::sleep(self.retry_sleep);
                }
            }
        }
    }

    fn attempt(&self, job: &FetchJob, bars: Option<&MultiProgress>) -> Result<u64> {
        let path = &job.local_path;
        let fetched = self.source.open(&job.url).map_err(|e| Error::Transport {
            url: job.url.clone(),
            message: e.to_string(),
        })?;

        let expected = match fetched.content_length {
            Some(n) if n > 0 => n,
            _ => {
                return Err(Error::Integrity {
                    path: path.clone(),
                    reason: "content length is missing or zero".to_string(),
                });
            }
        };

        remove_partial(path);
        ensure_parent(path)?;
        let mut out = BufWriter::new(File::create(path)?);

        let pb = bars.map(|bars| {
            let pb = bars.add(ProgressBar::new(expected));
            if let Ok(style) = ProgressStyle::with_template(
                "{msg} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_bar} {eta}",
            ) {
                pb.set_style(style.progress_chars("=>-"));
            }
            pb.set_message(display_name(path));
            pb
        });

        let copied = match &pb {
            Some(pb) => std::io::copy(&mut pb.wrap_read(fetched.body), &mut out),
            None => {
                let mut body = fetched.body;
                std::io::copy(&mut body, &mut out)
            }
        };
        if let Some(pb) = &pb {
            pb.finish_and_clear();
        }
        copied?;
        out.flush()?;
        drop(out);

        let actual = std::fs::metadata(path)?.len();
        if actual != expected {
            return Err(Error::Integrity {
                path: path.clone(),
                reason: format!("expected {} byte(s), got {}", expected, actual),
            });
        }

        std::fs::write(sidecar_path(path), expected.to_string())?;
        Ok(expected)
    }

    fn failure(&self, job: &FetchJob, attempts: usize, reason: String) -> DownloadFailure {
        DownloadFailure {
            download_id: job.download_id.clone(),
            url: job.url.clone(),
            path: job.local_path.clone(),
            attempts,
            reason,
        }
    }
}

fn remove_partial(path: &Path) {
    if path.is_file() {
        debug!("removing {}", path.display());
        if let Err(e) = std::fs::remove_file(path) {
            warn!("failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    /// Serves in-memory payloads and counts opens and concurrency.
    ///
    /// A fetch stays in flight from `open` until its body is dropped.
    #[derive(Default)]
    pub(crate) struct MemorySource {
        pub(crate) files: HashMap<String, (Option<u64>, Vec<u8>)>,
        pub(crate) opens: AtomicUsize,
        pub(crate) in_flight: Arc<AtomicUsize>,
        pub(crate) max_in_flight: AtomicUsize,
        pub(crate) hold: Duration,
    }

    impl MemorySource {
        pub(crate) fn with_file(mut self, url: &str, body: &[u8]) -> Self {
            self.files
                .insert(url.to_string(), (Some(body.len() as u64), body.to_vec()));
            self
        }

        pub(crate) fn with_declared(mut self, url: &str, declared: Option<u64>, body: &[u8]) -> Self {
            self.files.insert(url.to_string(), (declared, body.to_vec()));
            self
        }

        pub(crate) fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    struct TrackedBody {
        inner: Cursor<Vec<u8>>,
        in_flight: Arc<AtomicUsize>,
        hold: Option<Duration>,
    }

    impl Read for TrackedBody {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if let Some(hold) = self.hold.take() {
                thread::sleep(hold);
            }
            self.inner.read(buf)
        }
    }

    impl Drop for TrackedBody {
        fn drop(&mut self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ByteSource for MemorySource {
        fn open(&self, url: &str) -> std::result::Result<Fetched, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let Some((declared, body)) = self.files.get(url) else {
                return Err(TransportError::Connect(format!("no route to {}", url)));
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            Ok(Fetched {
                content_length: *declared,
                body: Box::new(TrackedBody {
                    inner: Cursor::new(body.clone()),
                    in_flight: Arc::clone(&self.in_flight),
                    hold: Some(self.hold),
                }),
            })
        }
    }

    pub(crate) fn quiet(source: Arc<dyn ByteSource>) -> Fetcher {
        Fetcher::new(source)
            .with_retry_sleep(Duration::ZERO)
            .with_start_jitter(Duration::ZERO)
            .with_progress(false)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MemorySource, quiet};
    use super::*;

    fn job(id: &str, url: &str, path: PathBuf) -> FetchJob {
        FetchJob {
            download_id: id.to_string(),
            url: url.to_string(),
            local_path: path,
        }
    }

    #[test]
    fn writes_payload_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenes/LC08_A.tar");
        let source = Arc::new(MemorySource::default().with_file("https://dds/a", b"landsat-bytes"));
        let meta = Mutex::new(DownloadMetaMap::new());

        quiet(source.clone())
            .fetch_all(vec![job("11", "https://dds/a", path.clone())], &meta, &CancelToken::new())
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"landsat-bytes");
        assert_eq!(std::fs::read_to_string(sidecar_path(&path)).unwrap(), "13");
        assert!(available_locally(&path));

        let map = meta.into_inner().unwrap();
        let entry = &map["11"];
        assert_eq!(entry.status, DownloadStatus::Complete);
        assert_eq!(entry.url.as_deref(), Some("https://dds/a"));
        assert_eq!(entry.local_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn second_run_makes_no_network_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LC08_A.tar");
        let source = Arc::new(MemorySource::default().with_file("https://dds/a", b"0123456789"));
        let fetcher = quiet(source.clone());
        let meta = Mutex::new(DownloadMetaMap::new());
        let jobs = vec![job("11", "https://dds/a", path)];

        fetcher.fetch_all(jobs.clone(), &meta, &CancelToken::new()).unwrap();
        assert_eq!(source.opens(), 1);

        fetcher.fetch_all(jobs, &meta, &CancelToken::new()).unwrap();
        assert_eq!(source.opens(), 1);
    }

    #[test]
    fn same_path_twice_with_one_worker_downloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LC08_A.tar");
        let source = Arc::new(MemorySource::default().with_file("https://dds/a", b"payload"));
        let meta = Mutex::new(DownloadMetaMap::new());

        quiet(source.clone())
            .with_workers(1)
            .fetch_all(
                vec![
                    job("11", "https://dds/a", path.clone()),
                    job("12", "https://dds/a", path.clone()),
                ],
                &meta,
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(source.opens(), 1);
        let map = meta.into_inner().unwrap();
        assert_eq!(map["12"].status, DownloadStatus::Complete);
    }

    #[test]
    fn presence_requires_matching_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LC08_A.tar");
        assert!(!available_locally(&path));

        std::fs::write(&path, b"12345").unwrap();
        assert!(!available_locally(&path));

        std::fs::write(sidecar_path(&path), "6").unwrap();
        assert!(!available_locally(&path));

        std::fs::write(sidecar_path(&path), "5\n").unwrap();
        assert!(available_locally(&path));

        std::fs::remove_file(&path).unwrap();
        assert!(!available_locally(&path));
    }

    #[test]
    fn stale_payload_without_sidecar_is_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LC08_A.tar");
        std::fs::write(&path, b"partial").unwrap();
        let source = Arc::new(MemorySource::default().with_file("https://dds/a", b"complete payload"));
        let meta = Mutex::new(DownloadMetaMap::new());

        quiet(source.clone())
            .fetch_all(vec![job("11", "https://dds/a", path.clone())], &meta, &CancelToken::new())
            .unwrap();

        assert_eq!(source.opens(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"complete payload");
    }

    #[test]
    fn size_mismatch_is_retried_then_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LC08_A.tar");
        let source = Arc::new(MemorySource::default().with_declared("https://dds/a", Some(100), b"short"));
        let meta = Mutex::new(DownloadMetaMap::new());

        let err = quiet(source.clone())
            .with_retry_max(2)
            .fetch_all(vec![job("11", "https://dds/a", path.clone())], &meta, &CancelToken::new())
            .unwrap_err();

        assert_eq!(source.opens(), 3);
        assert!(!path.exists());
        assert!(!sidecar_path(&path).exists());
        match err {
            Error::DownloadsFailed { failures, meta } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].attempts, 3);
                assert!(failures[0].reason.contains("expected 100 byte(s), got 5"));
                assert_eq!(meta["11"].status, DownloadStatus::Pending);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_length_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LC08_A.tar");
        let source = Arc::new(MemorySource::default().with_declared("https://dds/a", None, b"data"));
        let meta = Mutex::new(DownloadMetaMap::new());

        let err = quiet(source.clone())
            .with_retry_max(1)
            .fetch_all(vec![job("11", "https://dds/a", path.clone())], &meta, &CancelToken::new())
            .unwrap_err();

        assert_eq!(source.opens(), 2);
        assert!(matches!(err, Error::DownloadsFailed { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn failing_job_does_not_stop_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(
            MemorySource::default()
                .with_file("https://dds/a", b"aaaa")
                .with_file("https://dds/c", b"cccccc"),
        );
        let meta = Mutex::new(DownloadMetaMap::new());

        let err = quiet(source.clone())
            .with_workers(2)
            .with_retry_max(1)
            .fetch_all(
                vec![
                    job("1", "https://dds/a", dir.path().join("a.tar")),
                    job("2", "https://dds/missing", dir.path().join("b.tar")),
                    job("3", "https://dds/c", dir.path().join("c.tar")),
                ],
                &meta,
                &CancelToken::new(),
            )
            .unwrap_err();

        match err {
            Error::DownloadsFailed { failures, meta } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].download_id, "2");
                assert_eq!(meta["1"].status, DownloadStatus::Complete);
                assert_eq!(meta["3"].status, DownloadStatus::Complete);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(available_locally(&dir.path().join("a.tar")));
        assert!(available_locally(&dir.path().join("c.tar")));
    }

    #[test]
    fn concurrency_never_exceeds_pool_width() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MemorySource {
            hold: Duration::from_millis(20),
            ..MemorySource::default()
        };
        let mut jobs = Vec::new();
        for i in 0..8 {
            let url = format!("https://dds/{}", i);
            source = source.with_file(&url, b"scene");
            jobs.push(job(&i.to_string(), &url, dir.path().join(format!("{}.tar", i))));
        }
        let source = Arc::new(source);
        let meta = Mutex::new(DownloadMetaMap::new());

        quiet(source.clone())
            .with_workers(3)
            .fetch_all(jobs, &meta, &CancelToken::new())
            .unwrap();

        assert_eq!(source.opens(), 8);
        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(source.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(meta.into_inner().unwrap().len(), 8);
    }

    #[test]
    fn cancelled_jobs_are_not_attempted() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource::default().with_file("https://dds/a", b"aaaa"));
        let meta = Mutex::new(DownloadMetaMap::new());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = quiet(source.clone())
            .fetch_all(vec![job("1", "https://dds/a", dir.path().join("a.tar"))], &meta, &cancel)
            .unwrap_err();

        assert_eq!(source.opens(), 0);
        match err {
            Error::DownloadsFailed { failures, .. } => assert_eq!(failures[0].reason, "cancelled"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

//! Bulk ordering: scene list, download options, order submission, polling,
//! download and order cleanup.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::download::{FetchJob, Fetcher};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::util::{de_id, de_opt_id};

/// Order label used when the caller does not pick one.
pub const DEFAULT_LABEL: &str = "m2m-api_download";

/// A `scene-search` hit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneRecord {
    #[serde(deserialize_with = "de_id")]
    pub entity_id: String,
    pub display_id: String,
    #[serde(default)]
    pub cloud_cover: Option<Value>,
    #[serde(default)]
    pub temporal_coverage: Option<TemporalCoverage>,
    /// Everything else the service returned for the scene.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl SceneRecord {
    /// Cloud cover in percent; M2M sends it as a number or a numeric string.
    pub fn cloud_cover_percent(&self) -> Option<f64> {
        match self.cloud_cover.as_ref()? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporalCoverage {
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSearchResults {
    #[serde(default)]
    pub results: Vec<SceneRecord>,
    #[serde(default)]
    pub total_hits: Option<u64>,
    #[serde(default)]
    pub records_returned: Option<u64>,
    #[serde(default)]
    pub next_record: Option<Value>,
}

/// A deliverable offered for a scene by `download-options`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOption {
    /// Product id.
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub entity_id: String,
    #[serde(default)]
    pub display_id: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub download_system: Option<String>,
    #[serde(default)]
    pub available: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DownloadOption {
    /// Looks a field up by its wire name.
    pub fn field(&self, name: &str) -> Option<Value> {
        let text = |s: &Option<String>| s.clone().map(Value::String);
        match name {
            "id" | "productId" => Some(Value::String(self.id.clone())),
            "entityId" => Some(Value::String(self.entity_id.clone())),
            "displayId" => text(&self.display_id),
            "productName" => text(&self.product_name),
            "downloadSystem" => text(&self.download_system),
            "available" => self.available.map(Value::Bool),
            other => self.extra.get(other).cloned(),
        }
    }
}

/// Condition on a [`DownloadOption`] field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptionPredicate {
    Equals { field: String, value: Value },
    Truthy { field: String },
}

impl OptionPredicate {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        OptionPredicate::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn truthy(field: impl Into<String>) -> Self {
        OptionPredicate::Truthy {
            field: field.into(),
        }
    }

    pub fn matches(&self, option: &DownloadOption) -> bool {
        match self {
            OptionPredicate::Equals { field, value } => option.field(field).as_ref() == Some(value),
            OptionPredicate::Truthy { field } => option.field(field).is_some_and(|v| truthy(&v)),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Conjunction of predicates an option must satisfy to be ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionFilter(pub Vec<OptionPredicate>);

impl Default for OptionFilter {
    /// Available products delivered through the data distribution system.
    fn default() -> Self {
        OptionFilter(vec![
            OptionPredicate::equals("downloadSystem", "dds"),
            OptionPredicate::truthy("available"),
        ])
    }
}

impl OptionFilter {
    pub fn matches(&self, option: &DownloadOption) -> bool {
        self.0.iter().all(|p| p.matches(option))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    Pending,
    Complete,
}

/// Everything known about one download of an order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadMeta {
    pub display_id: Option<String>,
    pub entity_id: Option<String>,
    pub product_name: Option<String>,
    /// Label the download was found under.
    pub label: Option<String>,
    pub url: Option<String>,
    pub local_path: Option<PathBuf>,
    pub status: DownloadStatus,
}

/// Download metadata keyed by `downloadId`.
pub type DownloadMetaMap = BTreeMap<String, DownloadMeta>;

/// Knobs for one retrieval.
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub label: String,
    pub filter: OptionFilter,
    /// Directory receiving `<displayId>.tar` payloads.
    pub output_dir: PathBuf,
    pub poll_interval: Duration,
    pub max_poll_rounds: usize,
    pub cancel: CancelToken,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            label: DEFAULT_LABEL.to_string(),
            filter: OptionFilter::default(),
            output_dir: PathBuf::from("./ingest"),
            poll_interval: Duration::from_secs(30),
            max_poll_rounds: 720,
            cancel: CancelToken::new(),
        }
    }
}

impl RetrieveOptions {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_filter(mut self, filter: OptionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_poll_rounds(mut self, rounds: usize) -> Self {
        self.max_poll_rounds = rounds;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Lifecycle of one order, reported in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Init,
    OptionsResolved,
    Requested,
    Available,
    Polling,
    Fulfilled,
    Failed,
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderState::Init => "init",
            OrderState::OptionsResolved => "options-resolved",
            OrderState::Requested => "requested",
            OrderState::Available => "available",
            OrderState::Polling => "polling",
            OrderState::Fulfilled => "fulfilled",
            OrderState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequestResults {
    #[serde(default)]
    available_downloads: Vec<StagedDownload>,
    #[serde(default)]
    preparing_downloads: Vec<Value>,
    #[serde(default)]
    duplicate_products: Value,
    #[serde(default)]
    failed: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StagedDownload {
    #[serde(deserialize_with = "de_id")]
    download_id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    entity_id: Option<String>,
    #[serde(default)]
    display_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResults {
    #[serde(default)]
    available: Vec<StagedDownload>,
    #[serde(default)]
    requested: Vec<StagedDownload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRecord {
    #[serde(deserialize_with = "de_id")]
    download_id: String,
    #[serde(default)]
    display_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    entity_id: Option<String>,
    #[serde(default)]
    product_name: Option<String>,
}

/// Labels found in a `duplicateProducts` field, in first-seen order.
///
/// The field comes either as an array (of labels or `{label}` objects) or as
/// an object keyed by product id.
fn duplicate_labels(value: &Value) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        _ => Vec::new(),
    };
    for item in items {
        let label = match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => o.get("label").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        if let Some(label) = label {
            if !label.is_empty() && !labels.contains(&label) {
                labels.push(label);
            }
        }
    }
    labels
}

/// Drives one order from scene list to downloaded files.
pub(crate) struct OrderEngine<'a> {
    gateway: &'a Gateway,
    fetcher: &'a Fetcher,
}

impl<'a> OrderEngine<'a> {
    pub(crate) fn new(gateway: &'a Gateway, fetcher: &'a Fetcher) -> Self {
        Self { gateway, fetcher }
    }

    /// Orders and downloads every eligible product of `scenes`.
    ///
    /// Orders placed under any label are removed afterwards, whether or not
    /// the retrieval succeeded.
    pub(crate) fn retrieve(
        &self,
        dataset: &str,
        scenes: &[SceneRecord],
        opts: &RetrieveOptions,
    ) -> Result<DownloadMetaMap> {
        let mut labels = vec![opts.label.clone()];
        let mut ordered = false;
        let meta = Mutex::new(DownloadMetaMap::new());

        let result = self.fulfill(dataset, scenes, opts, &mut labels, &mut ordered, &meta);

        if ordered {
            self.remove_orders(&labels);
        }

        match result {
            Ok(()) => {
                info!(label = %opts.label, "order {}", OrderState::Fulfilled);
                Ok(meta.into_inner().unwrap_or_else(PoisonError::into_inner))
            }
            Err(err) => {
                warn!(label = %opts.label, "order {}: {}", OrderState::Failed, err);
                Err(err)
            }
        }
    }

    fn fulfill(
        &self,
        dataset: &str,
        scenes: &[SceneRecord],
        opts: &RetrieveOptions,
        labels: &mut Vec<String>,
        ordered: &mut bool,
        meta: &Mutex<DownloadMetaMap>,
    ) -> Result<()> {
        let label = opts.label.as_str();
        let entity_ids: Vec<&str> = scenes.iter().map(|s| s.entity_id.as_str()).collect();
        info!(label, "order {}: {} scene(s) of {}", OrderState::Init, entity_ids.len(), dataset);
        if entity_ids.is_empty() {
            return Ok(());
        }

        self.call_without_data(
            "scene-list-add",
            &json!({"listId": label, "datasetName": dataset, "entityIds": entity_ids}),
        )?;

        let options: Vec<DownloadOption> = self
            .gateway
            .execute("download-options", &json!({"datasetName": dataset, "listId": label}))?;
        let selected: Vec<&DownloadOption> =
            options.iter().filter(|o| opts.filter.matches(o)).collect();
        info!(
            label,
            "order {}: {} of {} download option(s) selected",
            OrderState::OptionsResolved,
            selected.len(),
            options.len()
        );
        if selected.is_empty() {
            return Ok(());
        }

        let downloads: Vec<Value> = selected
            .iter()
            .map(|o| json!({"entityId": o.entity_id, "productId": o.id}))
            .collect();
        *ordered = true;
        let results: DownloadRequestResults = self
            .gateway
            .execute("download-request", &json!({"downloads": downloads, "label": label}))?;

        for duplicate in duplicate_labels(&results.duplicate_products) {
            if !labels.contains(&duplicate) {
                info!(label, "products already ordered under label {}", duplicate);
                labels.push(duplicate);
            }
        }
        let requested = downloads.len().saturating_sub(results.failed.len());
        info!(
            label,
            "order {}: {} available, {} preparing, {} failed, label(s) {:?}",
            OrderState::Requested,
            results.available_downloads.len(),
            results.preparing_downloads.len(),
            results.failed.len(),
            labels
        );

        self.merge_searches(labels, meta)?;

        let mut resolved = BTreeSet::new();
        let mut failures = Vec::new();
        if results.preparing_downloads.is_empty() {
            info!(label, "order {}", OrderState::Available);
            let jobs = {
                let mut map = meta.lock().unwrap_or_else(PoisonError::into_inner);
                let mut jobs = Vec::new();
                for item in results.available_downloads {
                    let id = item.download_id.clone();
                    if let Some(job) = stage(item, &mut map, opts) {
                        resolved.insert(id);
                        jobs.push(job);
                    }
                }
                jobs
            };
            match self.fetcher.fetch_all(jobs, meta, &opts.cancel) {
                Ok(()) => {}
                Err(Error::DownloadsFailed { failures: f, .. }) => failures.extend(f),
                Err(err) => return Err(err),
            }
        }

        // Products already ordered under other labels only get a url from
        // download-retrieve, so those labels are polled at least once.
        let mut must_poll = labels.len() > 1;
        if must_poll || resolved.len() < requested {
            info!(label, "order {}: waiting for {} download(s)", OrderState::Polling, requested);
        }
        let mut rounds = 0usize;
        while must_poll || resolved.len() < requested {
            must_poll = false;
            if opts.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if rounds >= opts.max_poll_rounds {
                return Err(Error::PollLimit { rounds });
            }
            rounds += 1;

            let jobs = self.poll_round(labels, meta, &mut resolved, opts)?;
            info!(label, "poll round {}: {}/{} download(s) ready", rounds, resolved.len(), requested);
            match self.fetcher.fetch_all(jobs, meta, &opts.cancel) {
                Ok(()) => {}
                Err(Error::DownloadsFailed { failures: f, .. }) => failures.extend(f),
                Err(err) => return Err(err),
            }

            if resolved.len() < requested {
                thread::sleep(opts.poll_interval);
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        let snapshot = meta.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Err(Error::DownloadsFailed {
            failures,
            meta: Box::new(snapshot),
        })
    }

    /// One pass of `download-retrieve` over every label.
    ///
    /// Items seen for the first time are marked complete and returned as jobs.
    pub(crate) fn poll_round(
        &self,
        labels: &[String],
        meta: &Mutex<DownloadMetaMap>,
        resolved: &mut BTreeSet<String>,
        opts: &RetrieveOptions,
    ) -> Result<Vec<FetchJob>> {
        let mut jobs = Vec::new();
        for label in labels {
            let retrieved: RetrieveResults = self
                .gateway
                .execute("download-retrieve", &json!({"label": label}))?;
            debug!(
                label = %label,
                available = retrieved.available.len(),
                requested = retrieved.requested.len(),
                "download-retrieve"
            );

            let mut map = meta.lock().unwrap_or_else(PoisonError::into_inner);
            for item in retrieved.available {
                if resolved.contains(&item.download_id) {
                    continue;
                }
                let id = item.download_id.clone();
                if let Some(job) = stage(item, &mut map, opts) {
                    resolved.insert(id);
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    fn merge_searches(&self, labels: &[String], meta: &Mutex<DownloadMetaMap>) -> Result<()> {
        for label in labels {
            let records: Vec<DownloadRecord> =
                match self.gateway.execute("download-search", &json!({"label": label})) {
                    Ok(records) => records,
                    Err(Error::EmptyResponse { .. }) => Vec::new(),
                    Err(err) => return Err(err),
                };
            debug!(label = %label, "download-search returned {} record(s)", records.len());

            let mut map = meta.lock().unwrap_or_else(PoisonError::into_inner);
            for record in records {
                let entry = map.entry(record.download_id).or_default();
                if entry.label.is_none() {
                    entry.label = Some(label.clone());
                }
                entry.display_id = entry.display_id.take().or(record.display_id);
                entry.entity_id = entry.entity_id.take().or(record.entity_id);
                entry.product_name = entry.product_name.take().or(record.product_name);
            }
        }
        Ok(())
    }

    fn remove_orders(&self, labels: &[String]) {
        for label in labels {
            match self.call_without_data("download-order-remove", &json!({"label": label})) {
                Ok(()) => info!(label = %label, "order removed"),
                Err(err) => warn!(label = %label, "failed to remove order: {}", err),
            }
        }
    }

    /// Endpoints that may answer with `data: null` on success.
    fn call_without_data(&self, endpoint: &str, payload: &Value) -> Result<()> {
        match self.gateway.execute_value(endpoint, payload) {
            Ok(_) | Err(Error::EmptyResponse { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Attaches url, local path and completion to an available item's entry.
fn stage(item: StagedDownload, map: &mut DownloadMetaMap, opts: &RetrieveOptions) -> Option<FetchJob> {
    let Some(url) = item.url.filter(|u| !u.is_empty()) else {
        debug!("download {} has no url yet", item.download_id);
        return None;
    };

    let entry = map.entry(item.download_id.clone()).or_default();
    if entry.display_id.is_none() {
        entry.display_id = item.display_id;
    }
    if entry.entity_id.is_none() {
        entry.entity_id = item.entity_id;
    }
    let stem = entry
        .display_id
        .clone()
        .or_else(|| entry.entity_id.clone())
        .unwrap_or_else(|| item.download_id.clone());

    // Several products of one scene share a display id.
    let mut local_path = opts.output_dir.join(format!("{}.tar", stem));
    let claimed = map
        .iter()
        .any(|(id, m)| *id != item.download_id && m.local_path.as_ref() == Some(&local_path));
    if claimed {
        local_path = opts
            .output_dir
            .join(format!("{}_{}.tar", stem, item.download_id));
    }

    let entry = map.entry(item.download_id.clone()).or_default();
    entry.url = Some(url.clone());
    entry.local_path = Some(local_path.clone());
    entry.status = DownloadStatus::Complete;

    Some(FetchJob {
        download_id: item.download_id,
        url,
        local_path,
    })
}

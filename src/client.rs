use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::info;

use crate::config::load_config;
use crate::download::{ByteSource, Fetcher, HttpSource};
use crate::error::{Error, Result};
use crate::filter::{DatasetFilterField, SearchCriteria, compile_dataset_search, compile_scene_search};
use crate::gateway::{Gateway, HttpTransport, Transport};
use crate::order::{DownloadMetaMap, OrderEngine, RetrieveOptions, SceneRecord, SceneSearchResults};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base M2M JSON API URL, typically `https://m2m.cr.usgs.gov/api/api/json/stable`.
    pub url: String,
    /// EarthExplorer username.
    pub username: String,
    /// Application token generated in the ERS profile.
    pub token: String,
    /// Whether to verify TLS certificates.
    pub verify: bool,
}

/// A dataset returned by `dataset-search`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub dataset_alias: String,
    #[serde(default)]
    pub collection_name: Option<String>,
    #[serde(default)]
    pub abstract_text: Option<String>,
}

/// Blocking M2M client: session, search and bulk retrieval.
#[derive(Debug)]
pub struct Client {
    gateway: Gateway,
    fetcher: Fetcher,
    /// Aliases of the datasets visible to the session, loaded once.
    datasets: OnceLock<Vec<String>>,
}

impl Client {
    /// Creates a client from environment variables and/or `.m2mrc`, and logs in.
    ///
    /// This is equivalent to `Client::new(None, None, None, None)`.
    pub fn from_env() -> Result<Self> {
        Self::new(None, None, None, None)
    }

    /// Creates a client and logs in with an application token.
    ///
    /// Each value is taken from (in order of precedence):
    /// - the explicit argument
    /// - environment variables `M2M_URL` / `M2M_USERNAME` / `M2M_TOKEN`
    /// - config file from `M2M_RC` or `.m2mrc`
    pub fn new(
        url: Option<String>,
        username: Option<String>,
        token: Option<String>,
        verify: Option<bool>,
    ) -> Result<Self> {
        let cfg = load_config(url, username, token, verify)?;

        let transport = HttpTransport::new(Duration::from_secs(60), cfg.verify)?;
        let source = HttpSource::new(cfg.verify)?;

        let mut client = Self::with_parts(
            Gateway::new(cfg.url, Box::new(transport)),
            Fetcher::new(Arc::new(source)),
        );
        client.login_token(&cfg.username, &cfg.token)?;
        client.dataset_names()?;
        Ok(client)
    }

    /// Assembles a client from custom parts; no login is performed.
    pub fn with_parts(gateway: Gateway, fetcher: Fetcher) -> Self {
        Self {
            gateway,
            fetcher,
            datasets: OnceLock::new(),
        }
    }

    /// Assembles a client over arbitrary transports; no login is performed.
    pub fn with_transport(
        url: impl Into<String>,
        transport: Box<dyn Transport>,
        source: Arc<dyn ByteSource>,
    ) -> Self {
        Self::with_parts(Gateway::new(url, transport), Fetcher::new(source))
    }

    pub fn with_retry_max(mut self, retry_max: usize) -> Self {
        self.gateway = self.gateway.with_retry_max(retry_max);
        self
    }

    pub fn with_sleep_max(mut self, sleep_max: Duration) -> Self {
        self.gateway = self.gateway.with_sleep_max(sleep_max);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.fetcher = self.fetcher.with_workers(workers);
        self
    }

    pub fn with_download_retries(mut self, retries: usize, sleep: Duration) -> Self {
        self.fetcher = self.fetcher.with_retry_max(retries).with_retry_sleep(sleep);
        self
    }

    pub fn with_start_jitter(mut self, start_jitter: Duration) -> Self {
        self.fetcher = self.fetcher.with_start_jitter(start_jitter);
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.fetcher = self.fetcher.with_progress(progress);
        self
    }

    /// Starts a session with an application token (`login-token`).
    pub fn login_token(&mut self, username: &str, token: &str) -> Result<()> {
        self.gateway.clear_token();
        let key: String = self
            .gateway
            .execute("login-token", &json!({"username": username, "token": token}))?;
        self.gateway.set_token(key);
        self.datasets = OnceLock::new();
        info!(username, "logged in");
        Ok(())
    }

    /// Starts a session with a password (`login`).
    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.gateway.clear_token();
        let key: String = self
            .gateway
            .execute("login", &json!({"username": username, "password": password}))?;
        self.gateway.set_token(key);
        self.datasets = OnceLock::new();
        info!(username, "logged in");
        Ok(())
    }

    /// Ends the session. The service must answer with no data.
    pub fn logout(&mut self) -> Result<()> {
        let data = self.gateway.execute_value("logout", &json!({}))?;
        if !data.is_null() {
            return Err(Error::Decode {
                endpoint: "logout".to_string(),
                reason: format!("not able to logout: {}", data),
            });
        }
        self.gateway.clear_token();
        info!("logged out");
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.gateway.is_logged_in()
    }

    /// Datasets matching the dataset name, acquisition dates and area of `criteria`.
    pub fn search_datasets(&self, criteria: &SearchCriteria) -> Result<Vec<Dataset>> {
        let params = compile_dataset_search(criteria)?;
        self.gateway.execute("dataset-search", &params)
    }

    /// Aliases of every dataset the session may search.
    pub fn dataset_names(&self) -> Result<&[String]> {
        if let Some(names) = self.datasets.get() {
            return Ok(names.as_slice());
        }
        let all: Vec<Dataset> = self.gateway.execute("dataset-search", &json!({}))?;
        let names = all.into_iter().map(|d| d.dataset_alias).collect();
        Ok(self.datasets.get_or_init(|| names).as_slice())
    }

    /// Permissions granted to the logged-in user.
    pub fn permissions(&self) -> Result<Vec<String>> {
        self.gateway.execute("permissions", &json!({}))
    }

    /// Searchable attribute fields of a dataset.
    pub fn dataset_filters(&self, dataset: &str) -> Result<Vec<DatasetFilterField>> {
        self.gateway
            .execute("dataset-filters", &json!({"datasetName": dataset}))
    }

    /// Runs `scene-search`; the dataset's filter catalog is fetched when
    /// `criteria` carries attribute predicates.
    ///
    /// Fails with [`Error::UnknownDataset`] before any search when the dataset
    /// is not one of [`Client::dataset_names`].
    pub fn search_scenes(&self, criteria: &SearchCriteria) -> Result<SceneSearchResults> {
        if let Some(dataset) = &criteria.dataset {
            let available = self.dataset_names()?;
            if !available.contains(dataset) {
                return Err(Error::UnknownDataset {
                    dataset: dataset.clone(),
                    available: available.to_vec(),
                });
            }
        }
        let catalog = match (&criteria.dataset, criteria.needs_catalog()) {
            (Some(dataset), true) => self.dataset_filters(dataset)?,
            _ => Vec::new(),
        };
        let params = compile_scene_search(criteria, catalog.as_slice())?;
        let results: SceneSearchResults = self.gateway.execute("scene-search", &params)?;
        info!(
            "scene-search returned {} of {} hit(s)",
            results.results.len(),
            results.total_hits.unwrap_or_default()
        );
        Ok(results)
    }

    /// Orders every eligible product of `scenes` and downloads it.
    ///
    /// Returns download metadata keyed by download id. Orders are removed
    /// from the service before returning, whatever the outcome.
    pub fn retrieve_scenes(
        &self,
        dataset: &str,
        scenes: &[SceneRecord],
        options: &RetrieveOptions,
    ) -> Result<DownloadMetaMap> {
        OrderEngine::new(&self.gateway, &self.fetcher).retrieve(dataset, scenes, options)
    }

    /// Posts a raw request and returns the envelope's `data`.
    pub fn send_request(&self, endpoint: &str, payload: &Value) -> Result<Value> {
        self.gateway.execute_value(endpoint, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::testing::MemorySource;
    use crate::filter::{MetadataFilter, Predicate};
    use crate::gateway::testing::ScriptedTransport;

    fn client(transport: &ScriptedTransport) -> Client {
        Client::with_transport(
            "https://m2m.test/api",
            Box::new(transport.clone()),
            Arc::new(MemorySource::default()),
        )
    }

    #[test]
    fn login_and_logout_manage_the_session_key() {
        let transport = ScriptedTransport::default();
        transport.push_data(json!("api-key"));
        transport.push_reply(200, json!({"data": null, "errorCode": null, "errorMessage": null}));

        let mut c = client(&transport);
        c.login_token("jdoe", "secret").unwrap();
        assert!(c.is_logged_in());
        c.logout().unwrap();
        assert!(!c.is_logged_in());

        let seen = transport.seen();
        assert_eq!(seen[0].body, json!({"username": "jdoe", "token": "secret"}));
        assert_eq!(seen[0].token, None);
        assert_eq!(seen[1].token.as_deref(), Some("api-key"));
    }

    #[test]
    fn logout_with_data_is_an_error() {
        let transport = ScriptedTransport::default();
        transport.push_data(json!(true));

        let err = client(&transport).logout().unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    fn push_datasets(transport: &ScriptedTransport) {
        transport.push_data(json!([
            {"datasetAlias": "landsat_ot_c2_l1", "collectionName": "Landsat 8-9 OLI/TIRS C2 L1"},
            {"datasetAlias": "landsat_ot_c2_l2", "collectionName": "Landsat 8-9 OLI/TIRS C2 L2"}
        ]));
    }

    #[test]
    fn scene_search_fetches_catalog_for_predicates() {
        let transport = ScriptedTransport::default();
        push_datasets(&transport);
        transport.push_data(json!([
            {"id": "5e81f14f8faf8048", "fieldLabel": "Sensor Identifier"},
            {"id": "5e81f14fff5055a3", "fieldLabel": "Collection Category"}
        ]));
        transport.push_data(json!({
            "results": [
                {"entityId": "LC80440342020214LGN00", "displayId": "LC08_L1TP_044034_20200801_20200807_02_T1", "cloudCover": "4.25",
                 "temporalCoverage": {"startDate": "2020-08-01 00:00:00", "endDate": "2020-08-01 00:00:00"}}
            ],
            "totalHits": 1,
            "recordsReturned": 1
        }));

        let criteria = SearchCriteria::new("landsat_ot_c2_l1")
            .with_metadata(MetadataFilter::And(vec![
                Predicate::value("Sensor Identifier", "OLI_TIRS"),
                Predicate::value("Collection Category", "T1"),
            ]))
            .with_max_results(3);
        let results = client(&transport).search_scenes(&criteria).unwrap();

        assert_eq!(results.results.len(), 1);
        assert_eq!(results.results[0].cloud_cover_percent(), Some(4.25));
        let seen = transport.seen();
        assert!(seen[0].url.ends_with("dataset-search"));
        assert!(seen[1].url.ends_with("dataset-filters"));
        assert!(seen[2].url.ends_with("scene-search"));
        assert_eq!(
            seen[2].body["sceneFilter"]["metadataFilter"]["childFilters"][1]["filterId"],
            "5e81f14fff5055a3"
        );
    }

    #[test]
    fn scene_search_without_predicates_skips_catalog() {
        let transport = ScriptedTransport::default();
        push_datasets(&transport);
        transport.push_data(json!({"results": [], "totalHits": 0}));

        client(&transport)
            .search_scenes(&SearchCriteria::new("landsat_ot_c2_l1"))
            .unwrap();

        let seen = transport.seen();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].url.ends_with("dataset-search"));
        assert!(seen[1].url.ends_with("scene-search"));
    }

    #[test]
    fn unknown_dataset_is_rejected_before_searching() {
        let transport = ScriptedTransport::default();
        push_datasets(&transport);

        let c = client(&transport);
        let criteria = SearchCriteria::new("landsat_8_c1").with_metadata(MetadataFilter::And(vec![
            Predicate::value("Sensor Identifier", "OLI_TIRS"),
        ]));
        for _ in 0..2 {
            let err = c.search_scenes(&criteria).unwrap_err();
            match err {
                Error::UnknownDataset { dataset, available } => {
                    assert_eq!(dataset, "landsat_8_c1");
                    assert_eq!(available, vec!["landsat_ot_c2_l1", "landsat_ot_c2_l2"]);
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        let seen = transport.seen();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].url.ends_with("dataset-search"));
        assert_eq!(seen[0].body, json!({}));
    }
}

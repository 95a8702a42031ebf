//! Translation of search criteria into the M2M filter grammar.
//!
//! Compilation is pure apart from reading a GeoJSON file for
//! [`Spatial::GeometryFile`]. Absent criteria never produce keys, so the
//! service applies its own defaults for anything the caller left out.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::util::de_id;

/// Acquisition start used when the caller gives none.
pub const DEFAULT_START_DATE: &str = "2000-01-01";

/// Wire-format filter document, ready to be posted.
pub type FilterDocument = Value;

/// Caller search criteria. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    pub dataset: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub spatial: Option<Spatial>,
    pub cloud_cover: CloudCover,
    pub metadata: Option<MetadataFilter>,
    pub max_results: Option<u32>,
}

impl SearchCriteria {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: Some(dataset.into()),
            ..Self::default()
        }
    }

    pub fn with_dates(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn with_spatial(mut self, spatial: Spatial) -> Self {
        self.spatial = Some(spatial);
        self
    }

    pub fn with_cloud_cover(mut self, cloud_cover: CloudCover) -> Self {
        self.cloud_cover = cloud_cover;
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataFilter) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// True when at least one attribute predicate needs a field catalog.
    pub fn needs_catalog(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| !m.predicates().is_empty())
    }
}

/// Spatial restriction. Being an enum, at most one variant reaches the document.
#[derive(Debug, Clone, PartialEq)]
pub enum Spatial {
    BoundingBox {
        west: f64,
        east: f64,
        south: f64,
        north: f64,
    },
    Geometry(GeoJson),
    /// A GeoJSON file holding a geometry, a `Feature` or a `FeatureCollection`.
    GeometryFile(PathBuf),
}

impl Spatial {
    /// Bounding box in `(west, east, south, north)` order.
    pub fn bbox(west: f64, east: f64, south: f64, north: f64) -> Self {
        Spatial::BoundingBox {
            west,
            east,
            south,
            north,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoJson {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: Value,
}

/// Cloud-cover bounds in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudCover {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_unknown: Option<bool>,
}

impl CloudCover {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none() && self.include_unknown.is_none()
    }
}

/// Conjunction or disjunction of attribute predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataFilter {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl MetadataFilter {
    pub fn predicates(&self) -> &[Predicate] {
        match self {
            MetadataFilter::And(p) | MetadataFilter::Or(p) => p,
        }
    }

    fn filter_type(&self) -> &'static str {
        match self {
            MetadataFilter::And(_) => "and",
            MetadataFilter::Or(_) => "or",
        }
    }
}

/// Attribute predicate, keyed by the field label shown in EarthExplorer.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Value { field: String, value: String },
    Between { field: String, first: Value, second: Value },
}

impl Predicate {
    pub fn value(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Value {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn between(field: impl Into<String>, first: impl Into<Value>, second: impl Into<Value>) -> Self {
        Predicate::Between {
            field: field.into(),
            first: first.into(),
            second: second.into(),
        }
    }

    fn field(&self) -> &str {
        match self {
            Predicate::Value { field, .. } | Predicate::Between { field, .. } => field,
        }
    }
}

/// Resolves attribute labels to the dataset's internal filter ids.
pub trait FieldCatalog {
    fn field_id(&self, label: &str) -> Option<String>;
}

/// One entry of the `dataset-filters` response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetFilterField {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub field_label: String,
    #[serde(default)]
    pub search_sql: Option<String>,
}

impl FieldCatalog for [DatasetFilterField] {
    fn field_id(&self, label: &str) -> Option<String> {
        self.iter()
            .find(|f| f.field_label == label)
            .map(|f| f.id.clone())
    }
}

impl FieldCatalog for HashMap<String, String> {
    fn field_id(&self, label: &str) -> Option<String> {
        self.get(label).cloned()
    }
}

impl FieldCatalog for BTreeMap<String, String> {
    fn field_id(&self, label: &str) -> Option<String> {
        self.get(label).cloned()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SceneSearchDocument<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    dataset_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_results: Option<u32>,
    scene_filter: SceneFilter,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SceneFilter {
    acquisition_filter: DateRange,
    #[serde(skip_serializing_if = "Option::is_none")]
    spatial_filter: Option<SpatialFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_cover_filter: Option<CloudCover>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata_filter: Option<MetadataFilterDoc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetSearchDocument<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    dataset_name: Option<&'a str>,
    acquisition_filter: DateRange,
    #[serde(skip_serializing_if = "Option::is_none")]
    spatial_filter: Option<SpatialFilter>,
}

#[derive(Serialize)]
struct DateRange {
    start: String,
    end: String,
}

#[derive(Serialize)]
struct Coordinate {
    latitude: f64,
    longitude: f64,
}

#[derive(Serialize)]
#[serde(tag = "filterType")]
enum SpatialFilter {
    #[serde(rename = "mbr", rename_all = "camelCase")]
    Mbr {
        lower_left: Coordinate,
        upper_right: Coordinate,
    },
    #[serde(rename = "geojson", rename_all = "camelCase")]
    GeoJson { geo_json: GeoJson },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataFilterDoc {
    filter_type: &'static str,
    child_filters: Vec<ChildFilter>,
}

#[derive(Serialize)]
#[serde(tag = "filterType", rename_all = "lowercase")]
enum ChildFilter {
    #[serde(rename_all = "camelCase")]
    Value {
        filter_id: String,
        value: String,
        operand: &'static str,
    },
    #[serde(rename_all = "camelCase")]
    Between {
        filter_id: String,
        first_value: Value,
        second_value: Value,
    },
}

/// Compiles a `scene-search` request body.
///
/// Attribute predicates are resolved through `catalog`; an unknown label is an
/// [`Error::UnknownField`].
pub fn compile_scene_search<C>(criteria: &SearchCriteria, catalog: &C) -> Result<FilterDocument>
where
    C: FieldCatalog + ?Sized,
{
    compile_scene_search_on(criteria, catalog, chrono::Local::now().date_naive())
}

pub(crate) fn compile_scene_search_on<C>(
    criteria: &SearchCriteria,
    catalog: &C,
    today: NaiveDate,
) -> Result<FilterDocument>
where
    C: FieldCatalog + ?Sized,
{
    let doc = SceneSearchDocument {
        dataset_name: criteria.dataset.as_deref(),
        max_results: criteria.max_results,
        scene_filter: SceneFilter {
            acquisition_filter: date_range(criteria, today),
            spatial_filter: spatial_filter(criteria.spatial.as_ref())?,
            cloud_cover_filter: Some(criteria.cloud_cover).filter(|c| !c.is_empty()),
            metadata_filter: metadata_filter(criteria.metadata.as_ref(), catalog)?,
        },
    };
    Ok(serde_json::to_value(doc)?)
}

/// Compiles a `dataset-search` request body.
pub fn compile_dataset_search(criteria: &SearchCriteria) -> Result<FilterDocument> {
    compile_dataset_search_on(criteria, chrono::Local::now().date_naive())
}

pub(crate) fn compile_dataset_search_on(
    criteria: &SearchCriteria,
    today: NaiveDate,
) -> Result<FilterDocument> {
    let doc = DatasetSearchDocument {
        dataset_name: criteria.dataset.as_deref(),
        acquisition_filter: date_range(criteria, today),
        spatial_filter: spatial_filter(criteria.spatial.as_ref())?,
    };
    Ok(serde_json::to_value(doc)?)
}

fn date_range(criteria: &SearchCriteria, today: NaiveDate) -> DateRange {
    let start = criteria
        .start_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| DEFAULT_START_DATE.to_string());
    let end = criteria.end_date.unwrap_or(today);
    DateRange {
        start,
        end: end.format("%Y-%m-%d").to_string(),
    }
}

fn spatial_filter(spatial: Option<&Spatial>) -> Result<Option<SpatialFilter>> {
    let filter = match spatial {
        None => return Ok(None),
        Some(Spatial::BoundingBox {
            west,
            east,
            south,
            north,
        }) => {
            if ![west, east, south, north].iter().all(|c| c.is_finite()) {
                return Err(Error::InvalidCriteria {
                    reason: format!(
                        "bounding box coordinates must be finite: west {}, east {}, south {}, north {}",
                        west, east, south, north
                    ),
                });
            }
            SpatialFilter::Mbr {
                lower_left: Coordinate {
                    latitude: *south,
                    longitude: *west,
                },
                upper_right: Coordinate {
                    latitude: *north,
                    longitude: *east,
                },
            }
        }
        Some(Spatial::Geometry(geo_json)) => SpatialFilter::GeoJson {
            geo_json: geo_json.clone(),
        },
        Some(Spatial::GeometryFile(path)) => SpatialFilter::GeoJson {
            geo_json: load_geometry(path)?,
        },
    };
    Ok(Some(filter))
}

fn metadata_filter<C>(
    metadata: Option<&MetadataFilter>,
    catalog: &C,
) -> Result<Option<MetadataFilterDoc>>
where
    C: FieldCatalog + ?Sized,
{
    let Some(metadata) = metadata else {
        return Ok(None);
    };
    if metadata.predicates().is_empty() {
        return Ok(None);
    }

    let mut child_filters = Vec::with_capacity(metadata.predicates().len());
    for predicate in metadata.predicates() {
        let filter_id = catalog
            .field_id(predicate.field())
            .ok_or_else(|| Error::UnknownField {
                field: predicate.field().to_string(),
            })?;
        child_filters.push(match predicate {
            Predicate::Value { value, .. } => ChildFilter::Value {
                filter_id,
                value: value.clone(),
                operand: "=",
            },
            Predicate::Between { field, first, second } if first.is_null() || second.is_null() => {
                return Err(Error::InvalidCriteria {
                    reason: format!("range on `{}` needs two bounds", field),
                });
            }
            Predicate::Between { first, second, .. } => ChildFilter::Between {
                filter_id,
                first_value: first.clone(),
                second_value: second.clone(),
            },
        });
    }

    Ok(Some(MetadataFilterDoc {
        filter_type: metadata.filter_type(),
        child_filters,
    }))
}

/// Reads a GeoJSON file and returns its (first) geometry.
pub fn load_geometry(path: &Path) -> Result<GeoJson> {
    let geometry_error = |reason: String| Error::Geometry {
        path: path.to_path_buf(),
        reason,
    };

    let text = std::fs::read_to_string(path).map_err(|e| geometry_error(e.to_string()))?;
    let doc: Value = serde_json::from_str(&text).map_err(|e| geometry_error(e.to_string()))?;

    let geometry = match doc.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => doc
            .get("features")
            .and_then(|f| f.get(0))
            .and_then(|f| f.get("geometry"))
            .ok_or_else(|| geometry_error("feature collection has no geometry".into()))?,
        Some("Feature") => doc
            .get("geometry")
            .ok_or_else(|| geometry_error("feature has no geometry".into()))?,
        Some(_) => &doc,
        None => return Err(geometry_error("missing `type`".into())),
    };

    serde_json::from_value(geometry.clone()).map_err(|e| geometry_error(e.to_string()))
}

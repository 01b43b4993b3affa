use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use common::Buffer2;
use glam::DVec2;
use tempfile::TempDir;

use super::*;
use crate::coords::pixels_to_lonlat;
use crate::raster::Crs;
use crate::testing::{gaussian_field, write_geotiff, TestGeoref};

/// Star centers sitting on CLAHE tile centers of a 128×128 image.
const STARS: [(f64, f64); 5] = [(16.0, 16.0), (80.0, 16.0), (48.0, 48.0), (16.0, 112.0), (112.0, 80.0)];
const SIZE: usize = 128;
const CHUNK: usize = 4096;

// =============================================================================
// Fixtures
// =============================================================================

fn georef() -> TestGeoref {
    TestGeoref::wgs84(19.0, 47.0)
}

fn star_field(stars: &[(f64, f64)]) -> Buffer2<f32> {
    let spots: Vec<_> = stars.iter().map(|&(x, y)| (x, y, 2.0, 1.0)).collect();
    gaussian_field(SIZE, SIZE, 0.0, &spots)
}

fn geotiff_bytes(dir: &Path, name: &str, image: &Buffer2<f32>) -> Vec<u8> {
    let path = dir.join(name);
    write_geotiff(&path, image, Some(georef()));
    std::fs::read(&path).unwrap()
}

/// The star pattern as WGS84 request points.
fn pattern_request() -> SearchRunRequest {
    let pixels: Vec<DVec2> = STARS.iter().map(|&(x, y)| DVec2::new(x, y)).collect();
    let lonlat = pixels_to_lonlat(&pixels, &georef().transform(), Some(Crs::WGS84)).unwrap();
    let mut request = SearchRunRequest::new(lonlat.into_iter().map(LinePoint::from).collect());
    request.pattern_name = "five".into();
    request
}

fn dataset_file(id: &str, original: bool, mbtiles: bool) -> DatasetFile {
    DatasetFile {
        id: id.into(),
        original_filename: format!("{id}.tif"),
        mime_type: "image/tiff".into(),
        status: DatasetFileStatus::Ready,
        size: None,
        width: Some(SIZE as u32),
        height: Some(SIZE as u32),
        download_url: original.then(|| format!("https://cdn.example/{id}")),
        mbtiles_key: mbtiles.then(|| format!("tiles/{id}.mbtiles")),
        mbtiles_download_url: None,
        mbtiles_size: None,
    }
}

enum MockAsset {
    Bytes(Vec<u8>),
    Fail(CatalogError),
}

struct MockCatalog {
    dataset: DatasetDetail,
    assets: HashMap<(String, AssetKind), MockAsset>,
    fail_persist: bool,
    fetches: AtomicUsize,
    opened: Mutex<Vec<(String, AssetKind, AccessRoute, Option<String>)>>,
    persisted: Mutex<Vec<SearchRunResponse>>,
}

impl MockCatalog {
    fn new(files: Vec<DatasetFile>) -> Self {
        Self {
            dataset: DatasetDetail {
                id: "ds-1".into(),
                name: "Night sky".into(),
                files,
            },
            assets: HashMap::new(),
            fail_persist: false,
            fetches: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
            persisted: Mutex::new(Vec::new()),
        }
    }

    fn with_asset(mut self, file_id: &str, kind: AssetKind, asset: MockAsset) -> Self {
        self.assets.insert((file_id.to_string(), kind), asset);
        self
    }
}

impl DatasetCatalog for MockCatalog {
    async fn fetch_dataset(
        &self,
        dataset_id: &str,
        authorization: Option<&str>,
    ) -> Result<(DatasetDetail, AccessRoute), CatalogError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if dataset_id != self.dataset.id {
            return Err(CatalogError::Status {
                status: 404,
                body: String::new(),
            });
        }
        let route = if authorization.is_some() {
            AccessRoute::Admin
        } else {
            AccessRoute::Public
        };
        Ok((self.dataset.clone(), route))
    }

    async fn open_asset(
        &self,
        route: AccessRoute,
        _dataset_id: &str,
        file_id: &str,
        kind: AssetKind,
        authorization: Option<&str>,
    ) -> Result<AssetStream, CatalogError> {
        self.opened.lock().unwrap().push((
            file_id.to_string(),
            kind,
            route,
            authorization.map(str::to_string),
        ));
        match self.assets.get(&(file_id.to_string(), kind)) {
            Some(MockAsset::Bytes(data)) => {
                let chunks: Vec<Result<Bytes, CatalogError>> = data
                    .chunks(CHUNK)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(Box::pin(tokio_stream::iter(chunks)))
            }
            Some(MockAsset::Fail(e)) => Err(e.clone()),
            None => Err(CatalogError::Status {
                status: 404,
                body: String::new(),
            }),
        }
    }

    async fn persist_run(
        &self,
        run: &SearchRunResponse,
        _authorization: Option<&str>,
    ) -> Result<(), CatalogError> {
        if self.fail_persist {
            return Err(CatalogError::Unavailable {
                reason: "down".into(),
            });
        }
        self.persisted.lock().unwrap().push(run.clone());
        Ok(())
    }
}

fn config(results: &TempDir) -> ServiceConfig {
    ServiceConfig {
        results_dir: results.path().to_path_buf(),
        ransac_seed: Some(7),
        ..Default::default()
    }
}

fn item<'a>(response: &'a SearchRunResponse, file_id: &str) -> &'a SearchResultItem {
    response
        .results
        .iter()
        .find(|i| i.dataset_file_id == file_id)
        .unwrap()
}

// =============================================================================
// Full runs
// =============================================================================

#[tokio::test]
async fn test_failures_are_isolated_per_file() {
    let fixtures = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    let good = geotiff_bytes(fixtures.path(), "a.tif", &star_field(&STARS));
    let limit = good.len() as u64 + 1024;

    let catalog = MockCatalog::new(vec![
        dataset_file("a", true, false),
        dataset_file("b", true, false),
        dataset_file("c", true, false),
    ])
    .with_asset("a", AssetKind::Original, MockAsset::Bytes(good))
    .with_asset(
        "b",
        AssetKind::Original,
        MockAsset::Fail(CatalogError::Status {
            status: 502,
            body: String::new(),
        }),
    )
    .with_asset("c", AssetKind::Original, MockAsset::Bytes(vec![0; limit as usize + 10]));

    let search = PatternSearch::new(
        catalog,
        ServiceConfig {
            max_download_bytes: Some(limit),
            ..config(&results)
        },
    );
    let response = search
        .run("ds-1", pattern_request(), Some("Bearer t"), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(response.results.len(), 3);
    assert_eq!(response.total_files, 3);
    assert_eq!(response.success_count, 1);
    assert_eq!(response.used_file_ids, vec!["a".to_string()]);
    assert!(!response.cancelled);
    assert_eq!(response.dataset_name, "Night sky");
    assert_eq!(response.pattern_name, "five");

    let a = item(&response, "a");
    assert!(a.success, "{a:?}");
    assert_eq!(a.status, FileOutcome::Succeeded);
    assert_eq!(a.asset_kind, "original");
    assert!(a.score_above_threshold);
    assert!((a.score - 1.0).abs() < 1e-12);
    let transform = a.transform.unwrap();
    assert!((transform.scale() - 1.0).abs() < 1e-2);
    assert_eq!(a.matched_points_image.as_ref().unwrap().len(), 5);
    assert_eq!(
        a.message.as_deref(),
        Some("MBTiles variant unavailable, original file was used.")
    );

    let preview = a.preview_path.as_deref().unwrap();
    assert_eq!(preview, format!("{}/previews/a_match.png", response.run_id));
    assert_eq!(a.preview_url.as_deref(), Some(format!("/results/{preview}").as_str()));
    assert!(results.path().join(preview).is_file());
    let stars = a.stars_path.as_deref().unwrap();
    assert_eq!(stars, format!("{}/stars/a_stars.png", response.run_id));
    assert!(results.path().join(stars).is_file());

    let geojson = a.geojson.as_ref().unwrap();
    let line = geojson["features"][0]["geometry"]["coordinates"].as_array().unwrap();
    assert_eq!(line.len(), 5);
    let lon = line[0][0].as_f64().unwrap();
    let lat = line[0][1].as_f64().unwrap();
    assert!((lon - 19.0165).abs() < 1e-3, "lon {lon}");
    assert!((lat - 46.9835).abs() < 1e-3, "lat {lat}");

    let b = item(&response, "b");
    assert!(!b.success);
    assert_eq!(b.status, FileOutcome::FailedAssetError);
    assert_eq!(b.message.as_deref(), Some("Dataset server request failed (502)."));

    let c = item(&response, "c");
    assert_eq!(c.status, FileOutcome::FailedAssetError);
    assert_eq!(
        c.message.as_deref(),
        Some("Downloaded asset exceeded configured size limit.")
    );

    let catalog = search.catalog();
    let opened = catalog.opened.lock().unwrap();
    assert!(opened
        .iter()
        .all(|(_, _, route, auth)| *route == AccessRoute::Admin && auth.as_deref() == Some("Bearer t")));
    let persisted = catalog.persisted.lock().unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].run_id, response.run_id);
}

#[tokio::test]
async fn test_below_threshold_keeps_transform() {
    let fixtures = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    // Last pattern star missing, one unrelated star added.
    let mut field = STARS[..4].to_vec();
    field.push((112.0, 112.0));
    let bytes = geotiff_bytes(fixtures.path(), "p.tif", &star_field(&field));

    let catalog = MockCatalog::new(vec![dataset_file("p", true, false)]).with_asset(
        "p",
        AssetKind::Original,
        MockAsset::Bytes(bytes),
    );
    let search = PatternSearch::new(catalog, config(&results));
    let mut request = pattern_request();
    request.score_threshold = 1.0;
    request.asset_preference = AssetPreference::Original;

    let response = search
        .run("ds-1", request, None, &CancelSignal::never())
        .await
        .unwrap();
    let p = item(&response, "p");
    assert_eq!(p.status, FileOutcome::FailedBelowThreshold, "{p:?}");
    assert!(!p.success);
    assert!(!p.score_above_threshold);
    assert!((p.score - 0.8).abs() < 1e-12);
    assert!(p.transform.is_some());
    assert!(p.preview_path.is_none());
    assert!(p.geojson.is_none());
    assert!(p.stars_path.is_some());
    assert_eq!(
        p.message.as_deref(),
        Some("Pattern verification did not meet the success criteria.")
    );
    assert_eq!(response.success_count, 0);
}

#[tokio::test]
async fn test_empty_field_has_no_transform() {
    let fixtures = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    let flat = Buffer2::new(SIZE, SIZE, vec![0.3; SIZE * SIZE]);
    let bytes = geotiff_bytes(fixtures.path(), "e.tif", &flat);

    let catalog = MockCatalog::new(vec![dataset_file("e", true, false)]).with_asset(
        "e",
        AssetKind::Original,
        MockAsset::Bytes(bytes),
    );
    let search = PatternSearch::new(catalog, config(&results));
    let mut request = pattern_request();
    request.generate_previews = false;

    let response = search
        .run("ds-1", request, None, &CancelSignal::never())
        .await
        .unwrap();
    let e = item(&response, "e");
    assert_eq!(e.status, FileOutcome::FailedNoTransform);
    assert_eq!(e.score, 0.0);
    assert!(e.transform.is_none());
    assert!(e.matched_points_image.is_none());
    assert!(e.stars_path.is_none());
    assert_eq!(response.used_file_ids, vec!["e".to_string()]);
}

#[tokio::test]
async fn test_starless_field_writes_no_star_overview() {
    let fixtures = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    let flat = Buffer2::new(SIZE, SIZE, vec![0.3; SIZE * SIZE]);
    let bytes = geotiff_bytes(fixtures.path(), "e.tif", &flat);

    let catalog = MockCatalog::new(vec![dataset_file("e", true, false)]).with_asset(
        "e",
        AssetKind::Original,
        MockAsset::Bytes(bytes),
    );
    let search = PatternSearch::new(catalog, config(&results));
    let mut request = pattern_request();
    request.generate_previews = true;

    let response = search
        .run("ds-1", request, None, &CancelSignal::never())
        .await
        .unwrap();
    let e = item(&response, "e");
    assert_eq!(e.status, FileOutcome::FailedNoTransform);
    assert!(e.stars_path.is_none());
    assert!(e.stars_url.is_none());
    assert!(e.preview_path.is_none());
    assert!(e.geojson.is_none());

    let run_dir = results.path().join(&response.run_id);
    assert!(!run_dir.join("stars").join("e_stars.png").exists());
}

#[tokio::test]
async fn test_undecodable_raster_is_a_detection_error() {
    let results = TempDir::new().unwrap();
    let catalog = MockCatalog::new(vec![dataset_file("x", true, false), dataset_file("y", false, false)])
        .with_asset("x", AssetKind::Original, MockAsset::Bytes(b"not a tiff".to_vec()));
    let search = PatternSearch::new(catalog, config(&results));

    let response = search
        .run("ds-1", pattern_request(), None, &CancelSignal::never())
        .await
        .unwrap();

    let x = item(&response, "x");
    assert_eq!(x.status, FileOutcome::FailedDetectionError);
    assert_eq!(x.asset_kind, "original");
    assert!(x.message.is_some());

    let y = item(&response, "y");
    assert_eq!(y.status, FileOutcome::FailedAssetError);
    assert_eq!(y.asset_kind, UNAVAILABLE_ASSET);
    assert_eq!(
        y.message.as_deref(),
        Some("No downloadable assets available for dataset file y.")
    );
    assert_eq!(response.used_file_ids, vec!["x".to_string()]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_mbtiles_are_converted_before_search() {
    use std::os::unix::fs::PermissionsExt;

    let fixtures = TempDir::new().unwrap();
    let results = TempDir::new().unwrap();
    let bytes = geotiff_bytes(fixtures.path(), "m.tif", &star_field(&STARS));

    // Stand-in for gdal_translate: copies the input (8th argument) to the output.
    let tool = fixtures.path().join("fake_gdal.sh");
    std::fs::write(&tool, "#!/bin/sh\ncp \"$8\" \"$9\"\n").unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

    let catalog = MockCatalog::new(vec![dataset_file("m", true, true)]).with_asset(
        "m",
        AssetKind::Mbtiles,
        MockAsset::Bytes(bytes),
    );
    let search = PatternSearch::new(
        catalog,
        ServiceConfig {
            gdal_binary: tool,
            ..config(&results)
        },
    );
    let mut request = pattern_request();
    request.asset_preference = AssetPreference::Mbtiles;

    let response = search
        .run("ds-1", request, None, &CancelSignal::never())
        .await
        .unwrap();
    let m = item(&response, "m");
    assert_eq!(m.status, FileOutcome::Succeeded, "{m:?}");
    assert_eq!(m.asset_kind, "mbtiles");
    assert!(m.message.is_none());
    assert_eq!(
        m.preview_path.as_deref(),
        Some(format!("{}/previews/m_match.png", response.run_id).as_str())
    );
}

#[tokio::test]
async fn test_missing_converter_is_a_conversion_error() {
    let results = TempDir::new().unwrap();
    let catalog = MockCatalog::new(vec![dataset_file("m", false, true)]).with_asset(
        "m",
        AssetKind::Mbtiles,
        MockAsset::Bytes(vec![1, 2, 3]),
    );
    let search = PatternSearch::new(
        catalog,
        ServiceConfig {
            gdal_binary: results.path().join("missing-gdal"),
            ..config(&results)
        },
    );

    let response = search
        .run("ds-1", pattern_request(), None, &CancelSignal::never())
        .await
        .unwrap();
    let m = item(&response, "m");
    assert_eq!(m.status, FileOutcome::FailedConversionError);
    assert!(m.message.as_deref().unwrap().contains("command not found"));
    assert!(response.used_file_ids.is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start_skips_every_file() {
    let results = TempDir::new().unwrap();
    let catalog = MockCatalog::new(vec![dataset_file("a", true, false), dataset_file("b", true, false)]);
    let search = PatternSearch::new(catalog, config(&results));
    let (handle, signal) = cancel_pair();
    handle.cancel();

    let response = search.run("ds-1", pattern_request(), None, &signal).await.unwrap();

    assert!(response.cancelled);
    assert_eq!(response.results.len(), 2);
    assert!(response
        .results
        .iter()
        .all(|i| i.status == FileOutcome::Skipped && !i.success));
    assert!(response.used_file_ids.is_empty());
    assert_eq!(response.success_count, 0);
    assert!(search.catalog().opened.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_persist_failure_does_not_fail_run() {
    let results = TempDir::new().unwrap();
    let mut catalog = MockCatalog::new(vec![dataset_file("y", false, false)]);
    catalog.fail_persist = true;
    let search = PatternSearch::new(catalog, config(&results));

    let response = search
        .run("ds-1", pattern_request(), None, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
}

// =============================================================================
// Run-level errors
// =============================================================================

#[tokio::test]
async fn test_two_points_rejected_before_any_file() {
    let results = TempDir::new().unwrap();
    let search = PatternSearch::new(MockCatalog::new(vec![dataset_file("a", true, false)]), config(&results));
    let mut request = pattern_request();
    request.line_points.truncate(2);

    let err = search
        .run("ds-1", request, None, &CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SearchError::Validation(ValidationError::TooFewPoints { found: 2 })
    ));
    assert_eq!(search.catalog().fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_inverted_sigma_range_rejected() {
    let results = TempDir::new().unwrap();
    let search = PatternSearch::new(MockCatalog::new(vec![dataset_file("a", true, false)]), config(&results));
    let mut request = pattern_request();
    request.star_params = Some(StarParams {
        min_sigma: 3.0,
        max_sigma: 2.0,
        ..Default::default()
    });

    let err = search
        .run("ds-1", request, None, &CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SearchError::Validation(ValidationError::SigmaRange { .. })
    ));
    assert_eq!(
        err.to_string(),
        "starParams.max_sigma must be greater or equal to min_sigma."
    );
}

#[tokio::test]
async fn test_file_selection_errors() {
    let results = TempDir::new().unwrap();
    let mut processing = dataset_file("p", true, false);
    processing.status = DatasetFileStatus::Processing;
    let search = PatternSearch::new(
        MockCatalog::new(vec![dataset_file("a", true, false), processing]),
        config(&results),
    );

    let mut request = pattern_request();
    request.dataset_file_ids = Some(vec!["a".into(), "zzz".into()]);
    let err = search
        .run("ds-1", request.clone(), None, &CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(&err, SearchError::FileNotFound(ids) if ids == &["zzz".to_string()]));
    assert_eq!(err.to_string(), "Dataset file(s) not found: zzz");

    request.dataset_file_ids = Some(vec!["p".into()]);
    let err = search
        .run("ds-1", request, None, &CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::FileNotReady(_)));

    let err = search
        .run("missing", pattern_request(), None, &CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::Catalog(CatalogError::Status { status: 404, .. })));
}

#[tokio::test]
async fn test_no_ready_files() {
    let results = TempDir::new().unwrap();
    let mut failed = dataset_file("f", true, false);
    failed.status = DatasetFileStatus::Failed;
    let search = PatternSearch::new(MockCatalog::new(vec![failed]), config(&results));

    let err = search
        .run("ds-1", pattern_request(), None, &CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::NoFilesAvailable));
}

#[test]
fn test_explicit_ids_keep_request_order() {
    let dataset = DatasetDetail {
        id: "d".into(),
        name: "d".into(),
        files: vec![dataset_file("a", true, false), dataset_file("b", true, false)],
    };
    let ids = vec!["b".to_string(), "a".to_string()];
    let files = select_files(&dataset, Some(ids.as_slice())).unwrap();
    assert_eq!(files[0].id, "b");
    assert_eq!(files[1].id, "a");

    let all = select_files(&dataset, Some(&[] as &[String])).unwrap();
    assert_eq!(all.len(), 2);
}

// =============================================================================
// Request JSON
// =============================================================================

#[test]
fn test_request_defaults_from_json() {
    let request: SearchRunRequest = serde_json::from_str(
        r#"{"linePoints":[{"x":1,"y":2},{"x":3,"y":4},{"x":5,"y":1}],
            "starParams":{"minSigma":1.5},"assetPreference":"original","coordinateSpace":"pixel"}"#,
    )
    .unwrap();

    assert_eq!(request.pattern_name, "pattern");
    assert_eq!(request.verify_tol_px, 3.0);
    assert_eq!(request.score_threshold, 0.05);
    assert!(request.generate_previews);
    assert_eq!(request.asset_preference, AssetPreference::Original);
    assert_eq!(request.coordinate_space, crate::coords::CoordinateSpace::Pixel);
    let params = request.star_params.as_ref().unwrap();
    assert_eq!(params.min_sigma, 1.5);
    assert_eq!(params.max_sigma, 4.0);
    assert!(request.validate().is_ok());
    assert_eq!(request.detection_params().tolerance_px, 3.0);
}

#[test]
fn test_request_range_checks() {
    let base = pattern_request();

    let mut r = base.clone();
    r.pattern_name = "x".repeat(121);
    assert!(matches!(r.validate(), Err(ValidationError::PatternNameTooLong { len: 121, .. })));

    let mut r = base.clone();
    r.verify_tol_px = 0.05;
    assert!(matches!(r.validate(), Err(ValidationError::VerifyTolerance(_))));

    let mut r = base.clone();
    r.score_threshold = 1.5;
    assert!(matches!(r.validate(), Err(ValidationError::ScoreThreshold(_))));

    let mut r = base;
    r.star_params = Some(StarParams {
        num_sigma: 0,
        ..Default::default()
    });
    assert!(matches!(r.validate(), Err(ValidationError::StarParams(_))));
}

#[test]
fn test_response_is_camel_case() {
    let item = SearchResultItem::failed(
        &dataset_file("a", true, false),
        "original",
        FileOutcome::FailedAssetError,
        "nope".into(),
    );
    let value = serde_json::to_value(&item).unwrap();
    assert_eq!(value["datasetFileId"], "a");
    assert_eq!(value["scoreAboveThreshold"], false);
    assert_eq!(value["status"], "failedAssetError");
    assert!(value["previewUrl"].is_null());
}

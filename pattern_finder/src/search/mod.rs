//! Multi-file pattern search over a catalog dataset.
//!
//! # Flow
//!
//! A run validates the request, resolves the dataset and its target files,
//! then handles each file in order:
//!
//! 1. pick the asset variant ([`resolve_asset`]),
//! 2. stream it into the run's temporary directory,
//! 3. convert MBTiles to GeoTIFF,
//! 4. project, detect and match on the blocking pool ([`search_in_raster`]),
//! 5. evaluate against the score threshold and write artifacts.
//!
//! A failure in any step is recorded on that file's item and the run moves
//! on. Only request validation, catalog lookup and file selection abort the
//! whole run. Cancellation returns the partial response with
//! `cancelled = true`.

#[cfg(test)]
mod tests;

mod asset;
mod cancel;
mod catalog;
mod convert;
mod download;
mod error;
mod geojson;
mod models;
mod pipeline;

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use common::file_utils::file_stem;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::matching::{PatternMatcher, RansacConfig};
use crate::star_detection::StarDetector;

pub use asset::{download_file_name, resolve_asset, AssetKind, UNAVAILABLE_ASSET};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use catalog::{AccessRoute, AssetStream, DatasetCatalog, HttpCatalog};
pub use convert::{convert_mbtiles, MIN_CONVERSION_TIMEOUT};
pub use download::download_to_file;
pub use error::{AssetError, CatalogError, ConversionError, DetectionError, SearchError, ValidationError};
pub use geojson::match_feature_collection;
pub use models::{
    AssetPreference, DatasetDetail, DatasetFile, DatasetFileStatus, FileOutcome, LinePoint,
    SearchResultItem, SearchRunRequest, SearchRunResponse, StarParams,
};
pub use pipeline::{render_artifacts, search_in_raster, ArtifactTargets, RasterSearch, WrittenArtifacts};

const VERIFICATION_FAILED: &str = "Pattern verification did not meet the success criteria.";
const SKIPPED_MESSAGE: &str = "Search cancelled before this file was processed.";
const RESULTS_URL_PREFIX: &str = "/results";

/// Runs searches against one catalog.
pub struct PatternSearch<C> {
    catalog: C,
    config: ServiceConfig,
}

/// State shared by every file of a run.
struct RunContext<'a> {
    dataset_id: &'a str,
    route: AccessRoute,
    authorization: Option<&'a str>,
    request: &'a SearchRunRequest,
    detector: StarDetector,
    matcher: PatternMatcher,
    temp_dir: TempDir,
    run_dir: PathBuf,
    cancel: &'a CancelSignal,
}

struct FileReport {
    item: SearchResultItem,
    /// The asset reached the analysis stage.
    attempted: bool,
}

/// Raster ready for analysis, plus what the item needs to say about it.
struct Acquired {
    path: PathBuf,
    kind: AssetKind,
    fallback: bool,
}

impl<C: DatasetCatalog> PatternSearch<C> {
    pub fn new(catalog: C, config: ServiceConfig) -> Self {
        Self { catalog, config }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Search every selected file of `dataset_id` for the request's pattern.
    pub async fn run(
        &self,
        dataset_id: &str,
        request: SearchRunRequest,
        authorization: Option<&str>,
        cancel: &CancelSignal,
    ) -> Result<SearchRunResponse, SearchError> {
        request.validate()?;
        let detector = StarDetector::new(request.detection_params()).map_err(ValidationError::from)?;
        let matcher = PatternMatcher::new(RansacConfig {
            tolerance: detector.params().tolerance_px,
            ..Default::default()
        });

        let (dataset, route) = self.catalog.fetch_dataset(dataset_id, authorization).await?;
        let files = select_files(&dataset, request.dataset_file_ids.as_deref())?;

        let run_id = Uuid::new_v4().simple().to_string();
        let span = tracing::info_span!("search_run", run_id = %run_id, dataset_id = %dataset.id);
        let started = Instant::now();

        let run_dir = self.config.results_dir.join(&run_id);
        for sub in ["previews", "stars"] {
            let dir = run_dir.join(sub);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| SearchError::RunDirectory { path: dir, source })?;
        }
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("pattern_{run_id}_"))
            .tempdir()
            .map_err(|source| SearchError::RunDirectory {
                path: std::env::temp_dir(),
                source,
            })?;

        let ctx = RunContext {
            dataset_id: &dataset.id,
            route,
            authorization,
            request: &request,
            detector,
            matcher,
            temp_dir,
            run_dir,
            cancel,
        };

        let (results, used_file_ids) = self.process_files(&ctx, &files).instrument(span.clone()).await;
        drop(ctx);

        let cancelled = cancel.is_cancelled();
        let success_count = results.iter().filter(|item| item.success).count();
        let response = SearchRunResponse {
            run_id,
            dataset_id: dataset.id.clone(),
            dataset_name: dataset.name.clone(),
            pattern_name: request.pattern_name.clone(),
            line_points: request.line_points.clone(),
            star_params: request.star_params.clone(),
            verify_tol_px: request.verify_tol_px,
            score_threshold: request.score_threshold,
            asset_preference: request.asset_preference,
            coordinate_space: request.coordinate_space,
            requested_file_ids: request.dataset_file_ids.clone(),
            used_file_ids,
            results,
            success_count,
            total_files: files.len(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            created_at: Utc::now(),
            cancelled,
        };

        span.in_scope(|| {
            tracing::info!(
                success_count,
                total_files = response.total_files,
                cancelled,
                duration_ms = response.duration_ms,
                "Search run finished"
            )
        });

        if let Err(e) = self.catalog.persist_run(&response, authorization).await {
            tracing::warn!(run_id = %response.run_id, error = %e, "Failed to persist pattern search run");
        }
        Ok(response)
    }

    async fn process_files(
        &self,
        ctx: &RunContext<'_>,
        files: &[DatasetFile],
    ) -> (Vec<SearchResultItem>, Vec<String>) {
        let mut seeds = match self.config.ransac_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_os_rng(),
        };

        let mut results = Vec::with_capacity(files.len());
        let mut used_file_ids = Vec::new();
        for file in files {
            let rng = ChaCha8Rng::seed_from_u64(seeds.random());
            if ctx.cancel.is_cancelled() {
                results.push(SearchResultItem::failed(
                    file,
                    UNAVAILABLE_ASSET,
                    FileOutcome::Skipped,
                    SKIPPED_MESSAGE.to_string(),
                ));
                continue;
            }

            let span = tracing::info_span!("search_file", file_id = %file.id);
            let report = self
                .process_file(ctx, file, rng, span.clone())
                .instrument(span)
                .await;
            if report.attempted {
                used_file_ids.push(file.id.clone());
            }
            tracing::info!(
                file_id = %file.id,
                status = ?report.item.status,
                score = report.item.score,
                "File processed"
            );
            results.push(report.item);
        }
        (results, used_file_ids)
    }

    async fn process_file(
        &self,
        ctx: &RunContext<'_>,
        file: &DatasetFile,
        mut rng: ChaCha8Rng,
        span: Span,
    ) -> FileReport {
        let acquired = match self.acquire(ctx, file).await {
            Ok(acquired) => acquired,
            Err(item) => {
                return FileReport {
                    item,
                    attempted: false,
                }
            }
        };
        let kind = acquired.kind.as_str();

        let request = ctx.request;
        let points = request.pattern_points();
        let space = request.coordinate_space;
        let name = request.pattern_name.clone();
        let detector = ctx.detector.clone();
        let matcher = ctx.matcher.clone();
        let path = acquired.path.clone();
        let worker_span = span.clone();
        let analysis = tokio::task::spawn_blocking(move || {
            search_in_raster(&path, &points, space, &name, &detector, &matcher, &mut rng, &worker_span)
        })
        .await
        .unwrap_or_else(|join_err| Err(DetectionError::Worker(join_err.to_string())));

        let search = match analysis {
            Ok(search) => search,
            Err(e) => {
                tracing::error!(error = %e, asset_kind = kind, "Pattern search failed");
                return FileReport {
                    item: SearchResultItem::failed(file, kind, FileOutcome::FailedDetectionError, e.to_string()),
                    attempted: true,
                };
            }
        };

        let item = self.evaluate(ctx, file, &acquired, search, span).await;
        FileReport {
            item,
            attempted: true,
        }
    }

    /// Resolve, download and (for MBTiles) convert. Errors come back as the
    /// finished item.
    async fn acquire(&self, ctx: &RunContext<'_>, file: &DatasetFile) -> Result<Acquired, SearchResultItem> {
        let Some((kind, fallback)) = resolve_asset(ctx.request.asset_preference, file) else {
            let e = AssetError::Unavailable {
                file_id: file.id.clone(),
            };
            tracing::warn!(error = %e, "No asset to download");
            return Err(SearchResultItem::failed(
                file,
                UNAVAILABLE_ASSET,
                FileOutcome::FailedAssetError,
                e.to_string(),
            ));
        };
        let label = kind.as_str();

        let destination = ctx.temp_dir.path().join(download_file_name(file, kind));
        let downloaded = match self
            .catalog
            .open_asset(ctx.route, ctx.dataset_id, &file.id, kind, ctx.authorization)
            .await
        {
            Ok(stream) => {
                download_to_file(stream, &destination, self.config.max_download_bytes, ctx.cancel).await
            }
            Err(e) => Err(AssetError::from(e)),
        };

        match downloaded {
            Ok(bytes) => tracing::info!(
                asset_kind = label,
                bytes,
                path = %destination.display(),
                "Downloaded dataset asset"
            ),
            Err(AssetError::Cancelled) => {
                return Err(SearchResultItem::failed(
                    file,
                    label,
                    FileOutcome::Skipped,
                    SKIPPED_MESSAGE.to_string(),
                ))
            }
            Err(e) => {
                tracing::warn!(asset_kind = label, error = %e, "Asset download failed");
                return Err(SearchResultItem::failed(
                    file,
                    label,
                    FileOutcome::FailedAssetError,
                    e.to_string(),
                ));
            }
        }

        let path = match kind {
            AssetKind::Original => destination,
            AssetKind::Mbtiles => {
                match convert_mbtiles(
                    &self.config.gdal_binary,
                    &destination,
                    self.config.gdal_timeout,
                    ctx.cancel,
                )
                .await
                {
                    Ok(path) => path,
                    Err(ConversionError::Cancelled) => {
                        return Err(SearchResultItem::failed(
                            file,
                            label,
                            FileOutcome::Skipped,
                            SKIPPED_MESSAGE.to_string(),
                        ))
                    }
                    Err(e) => {
                        return Err(SearchResultItem::failed(
                            file,
                            label,
                            FileOutcome::FailedConversionError,
                            e.to_string(),
                        ))
                    }
                }
            }
        };

        Ok(Acquired { path, kind, fallback })
    }

    async fn evaluate(
        &self,
        ctx: &RunContext<'_>,
        file: &DatasetFile,
        acquired: &Acquired,
        search: RasterSearch,
        span: Span,
    ) -> SearchResultItem {
        let request = ctx.request;
        let result = &search.result;
        let score_above_threshold = result.score >= request.score_threshold;
        let success = result.transform.is_some() && score_above_threshold;
        let status = if success {
            FileOutcome::Succeeded
        } else if result.transform.is_none() {
            FileOutcome::FailedNoTransform
        } else {
            FileOutcome::FailedBelowThreshold
        };

        let mut item = SearchResultItem {
            dataset_file_id: file.id.clone(),
            dataset_file_name: file.original_filename.clone(),
            asset_kind: acquired.kind.as_str().to_string(),
            status,
            success,
            score: result.score,
            score_above_threshold,
            transform: result.transform,
            matched_points_image: result
                .matched_points
                .as_ref()
                .map(|points| points.iter().map(|p| [p.x, p.y]).collect()),
            preview_path: None,
            preview_url: None,
            stars_path: None,
            stars_url: None,
            geojson: None,
            message: None,
        };

        if request.generate_previews {
            if success {
                item.geojson = search.geojson();
                if item.geojson.is_none() {
                    tracing::warn!("Failed to generate match geojson");
                }
            }

            let stem = file_stem(&acquired.path);
            let targets = ArtifactTargets {
                preview: success.then(|| ctx.run_dir.join("previews").join(format!("{stem}_match.png"))),
                stars: (!search.result.stars.is_empty())
                    .then(|| ctx.run_dir.join("stars").join(format!("{stem}_stars.png"))),
            };
            let written = tokio::task::spawn_blocking(move || render_artifacts(&search, &targets, &span))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Artifact worker failed");
                    WrittenArtifacts::default()
                });

            if let Some(path) = written.preview {
                let (rel, url) = self.artifact_location(&path);
                item.preview_path = Some(rel);
                item.preview_url = url;
            }
            if let Some(path) = written.stars {
                let (rel, url) = self.artifact_location(&path);
                item.stars_path = Some(rel);
                item.stars_url = url;
            }
        }

        let mut messages = Vec::new();
        if acquired.fallback {
            messages.push(acquired.kind.fallback_message());
        }
        if !success {
            messages.push(VERIFICATION_FAILED);
        }
        if !messages.is_empty() {
            item.message = Some(messages.join(" "));
        }
        item
    }

    /// Path relative to the results root with its public URL, or the full
    /// path and no URL when it lies elsewhere.
    fn artifact_location(&self, path: &Path) -> (String, Option<String>) {
        match path.strip_prefix(&self.config.results_dir) {
            Ok(rel) => {
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let url = format!("{RESULTS_URL_PREFIX}/{rel}");
                (rel, Some(url))
            }
            Err(_) => (path.display().to_string(), None),
        }
    }
}

/// Files to search, in request order or dataset order.
fn select_files(dataset: &DatasetDetail, requested: Option<&[String]>) -> Result<Vec<DatasetFile>, SearchError> {
    let files = match requested.filter(|ids| !ids.is_empty()) {
        Some(ids) => {
            let find = |id: &String| dataset.files.iter().find(|f| &f.id == id);

            let missing: Vec<String> = ids.iter().filter(|id| find(*id).is_none()).cloned().collect();
            if !missing.is_empty() {
                return Err(SearchError::FileNotFound(missing));
            }
            let not_ready: Vec<String> = ids
                .iter()
                .filter(|id| find(*id).is_some_and(|f| f.status != DatasetFileStatus::Ready))
                .cloned()
                .collect();
            if !not_ready.is_empty() {
                return Err(SearchError::FileNotReady(not_ready));
            }
            ids.iter().filter_map(find).cloned().collect()
        }
        None => dataset
            .files
            .iter()
            .filter(|f| f.status == DatasetFileStatus::Ready)
            .cloned()
            .collect::<Vec<_>>(),
    };

    if files.is_empty() {
        return Err(SearchError::NoFilesAvailable);
    }
    Ok(files)
}

//! Eiendomstekst - listing text generation server for Norwegian real estate.

mod address;
mod cache;
mod config;
mod describer;
mod error;
mod export;
mod gallery;
mod llm;
mod market;
mod pipeline;
mod schema;
mod writer;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use cache::DescriptionCache;
use config::{ProfileStore, Settings, TargetProfile};
use describer::{Describer, ImageInliner};
use error::ApiError;
use export::{ExportFormat, Report};
use gallery::{Gallery, Platform};
use llm::{ChatBackend, OpenAiClient};
use market::MarketInput;
use pipeline::{AnalysisStore, AnalyzeRequest, EventSink, Pipeline, PipelineEvent};
use schema::{
    Analysis, ImageAnalysis, ImageRequest, PropertyType, PropertyTypeResult, RoomType, TargetGroup,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use writer::Writer;

/// Events buffered per stream before the pipeline waits on the client.
const EVENT_BUFFER: usize = 64;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    client: reqwest::Client,
    profiles: ProfileStore,
    describer: Arc<Describer>,
    writer: Arc<Writer>,
    analyses: AnalysisStore,
    pipeline: Arc<Pipeline>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "eiendomstekst=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("eiendomstekst/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(60))
        .build()?;

    // Load target-group profiles from filesystem
    let profiles = ProfileStore::load_from_dir(&settings.profile_dir)?;
    info!("Loaded {} target-group profiles", profiles.all().len());

    let model = OpenAiClient::new(client.clone(), &settings);
    info!("Chat model client initialized ({})", model.model());
    let backend: Arc<dyn ChatBackend> = Arc::new(model);

    let inliner = settings.inline_images.then(|| ImageInliner::new(client.clone()));
    let describer = Arc::new(Describer::new(
        backend.clone(),
        DescriptionCache::new(),
        profiles.clone(),
        inliner,
    ));
    let writer = Arc::new(Writer::new(backend, profiles.clone()));
    let analyses = AnalysisStore::new();
    let pipeline = Arc::new(Pipeline::new(
        client.clone(),
        describer.clone(),
        writer.clone(),
        analyses.clone(),
        settings.image_batch_size,
        settings.max_images,
    ));

    let state = AppState {
        client,
        profiles,
        describer,
        writer,
        analyses,
        pipeline,
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/target-groups", get(list_target_groups))
        .route("/gallery", post(scrape_gallery))
        .route("/address/normalize", post(normalize_address))
        .route("/analyze", post(analyze))
        .route("/analyze/image", post(analyze_image))
        .route("/analyze/images", post(analyze_images))
        .route("/analyze/property-type", post(detect_property_type))
        .route("/analyze/intro", post(generate_intro))
        .route("/analyze/market", post(market_data))
        .route("/analyze/location", post(location_data))
        .route("/analyze/competitors", post(competitor_data))
        .route("/analyses/:id", get(get_analysis).patch(patch_analysis))
        .route("/analyses/:id/export/:format", get(export_analysis))
        .route("/export/:format", post(export_body))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024)) // 10MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "OK"
}

async fn list_target_groups(State(state): State<AppState>) -> Json<Vec<TargetProfile>> {
    Json(state.profiles.all())
}

#[derive(Deserialize)]
struct GalleryRequest {
    url: String,
}

#[derive(Serialize)]
struct GalleryResponse {
    #[serde(flatten)]
    gallery: Gallery,
    address: Option<address::NormalizedAddress>,
}

/// Scrape a gallery page for photos and the listing address.
async fn scrape_gallery(
    State(state): State<AppState>,
    Json(request): Json<GalleryRequest>,
) -> Result<Json<GalleryResponse>, ApiError> {
    check_url(&request.url)?;
    let gallery = gallery::fetch_gallery(&state.client, &request.url)
        .await
        .map_err(ApiError::upstream)?;

    let address = gallery
        .raw_address
        .as_deref()
        .map(|raw| address::normalize(raw, gallery.platform));

    Ok(Json(GalleryResponse { gallery, address }))
}

#[derive(Deserialize)]
struct NormalizeRequest {
    raw: String,
    #[serde(default)]
    url: Option<String>,
}

async fn normalize_address(
    Json(request): Json<NormalizeRequest>,
) -> Json<address::NormalizedAddress> {
    let platform = request
        .url
        .as_deref()
        .map(Platform::detect)
        .unwrap_or_default();
    Json(address::normalize(&request.raw, platform))
}

#[derive(Deserialize)]
struct ImageAnalyzeRequest {
    #[serde(flatten)]
    image: ImageRequest,
    #[serde(default)]
    target_group: TargetGroup,
}

/// Describe a single photo.
async fn analyze_image(
    State(state): State<AppState>,
    Json(request): Json<ImageAnalyzeRequest>,
) -> Result<Json<ImageAnalysis>, ApiError> {
    check_url(&request.image.url)?;
    let analysis = state
        .describer
        .describe(&request.image, request.target_group)
        .await
        .map_err(ApiError::upstream)?;
    Ok(Json(analysis))
}

#[derive(Deserialize)]
struct ImagesAnalyzeRequest {
    images: Vec<ImageRequest>,
    #[serde(default)]
    target_group: TargetGroup,
}

/// Describe many photos, streaming one result line per photo.
async fn analyze_images(
    State(state): State<AppState>,
    Json(request): Json<ImagesAnalyzeRequest>,
) -> Result<Response, ApiError> {
    if request.images.is_empty() {
        return Err(ApiError::BadRequest("No images given".to_string()));
    }
    check_images(&request.images)?;

    let (sink, rx) = EventSink::channel(EVENT_BUFFER);
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        pipeline
            .run_images(request.images, request.target_group, &sink)
            .await;
    });

    Ok(ndjson(rx))
}

#[derive(Deserialize)]
struct PropertyTypeRequest {
    images: Vec<ImageAnalysis>,
    #[serde(default)]
    raw_address: Option<String>,
}

async fn detect_property_type(
    State(state): State<AppState>,
    Json(request): Json<PropertyTypeRequest>,
) -> Result<Json<PropertyTypeResult>, ApiError> {
    let result = state
        .writer
        .detect_property_type(&request.images, request.raw_address.as_deref())
        .await
        .map_err(ApiError::upstream)?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct IntroRequest {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    property_type: Option<PropertyType>,
    #[serde(default)]
    images: Vec<ImageAnalysis>,
    #[serde(default)]
    target_group: TargetGroup,
}

#[derive(Serialize)]
struct IntroResponse {
    intro: String,
}

async fn generate_intro(
    State(state): State<AppState>,
    Json(request): Json<IntroRequest>,
) -> Result<Json<IntroResponse>, ApiError> {
    let intro = state
        .writer
        .generate_intro(
            request.address.as_deref(),
            request.property_type,
            &request.images,
            request.target_group,
        )
        .await
        .map_err(ApiError::upstream)?;
    Ok(Json(IntroResponse { intro }))
}

async fn market_data(Json(input): Json<MarketInput>) -> Json<market::MarketData> {
    Json(market::market_data(&input))
}

async fn location_data(Json(input): Json<MarketInput>) -> Json<market::LocationData> {
    Json(market::location_data(&input))
}

async fn competitor_data(Json(input): Json<MarketInput>) -> Json<market::CompetitorData> {
    Json(market::competitor_data(&input))
}

/// Run the full pipeline, streaming progress as NDJSON.
async fn analyze(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Response, ApiError> {
    match (&request.gallery_url, request.images.is_empty()) {
        (None, true) => {
            return Err(ApiError::BadRequest(
                "Either gallery_url or images is required".to_string(),
            ))
        }
        (Some(url), _) => check_url(url)?,
        _ => {}
    }
    check_images(&request.images)?;

    let (sink, rx) = EventSink::channel(EVENT_BUFFER);
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        pipeline.run(request, &sink).await;
    });

    Ok(ndjson(rx))
}

/// Get a finished analysis by ID.
async fn get_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Analysis>, ApiError> {
    state
        .analyses
        .get(&id)
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

#[derive(Deserialize)]
struct AnalysisPatch {
    #[serde(default)]
    intro: Option<String>,
    #[serde(default)]
    images: Vec<ImagePatch>,
}

#[derive(Deserialize)]
struct ImagePatch {
    index: usize,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    room_type: Option<RoomType>,
}

/// Apply manual edits to the intro or individual photo texts.
async fn patch_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<AnalysisPatch>,
) -> Result<Json<Analysis>, ApiError> {
    let current = state.analyses.get(&id).ok_or_else(|| not_found(&id))?;
    if let Some(bad) = patch.images.iter().find(|p| p.index >= current.images.len()) {
        return Err(ApiError::BadRequest(format!(
            "Image index {} out of range (analysis has {} images)",
            bad.index,
            current.images.len()
        )));
    }

    let updated = state
        .analyses
        .update(&id, |analysis| apply_patch(analysis, patch))
        .ok_or_else(|| not_found(&id))?;
    info!("Analysis {} edited", id);
    Ok(Json(updated))
}

fn apply_patch(analysis: &mut Analysis, patch: AnalysisPatch) {
    if let Some(intro) = patch.intro {
        analysis.intro = Some(intro.trim().to_string());
    }
    for edit in patch.images {
        let Some(image) = analysis.images.get_mut(edit.index) else {
            continue;
        };
        if let Some(description) = edit.description {
            image.description = description.trim().to_string();
            // A hand-written text turns a failed photo into a usable one
            image.error = None;
        }
        if let Some(room_type) = edit.room_type {
            image.room_type = room_type;
        }
    }
}

/// Download a stored analysis as Word or PDF.
async fn export_analysis(
    State(state): State<AppState>,
    Path((id, format)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let format = parse_format(&format)?;
    let analysis = state.analyses.get(&id).ok_or_else(|| not_found(&id))?;
    document_response(&analysis, format)
}

/// Render an analysis supplied in the request body.
async fn export_body(
    Path(format): Path<String>,
    Json(analysis): Json<Analysis>,
) -> Result<Response, ApiError> {
    let format = parse_format(&format)?;
    document_response(&analysis, format)
}

// ============================================================================
// Helpers
// ============================================================================

fn ndjson(rx: mpsc::Receiver<PipelineEvent>) -> Response {
    let lines = ReceiverStream::new(rx).map(|event| {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        Ok::<_, serde_json::Error>(line)
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

fn document_response(analysis: &Analysis, format: ExportFormat) -> Result<Response, ApiError> {
    let report = Report::from_analysis(analysis);
    let bytes = export::render(&report, format).map_err(ApiError::internal)?;
    info!(
        "Exported {} as {} ({} bytes)",
        analysis.id,
        format.extension(),
        bytes.len()
    );

    let disposition = format!(
        "attachment; filename=\"{}.{}\"",
        report.file_stem(),
        format.extension()
    );
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

fn parse_format(format: &str) -> Result<ExportFormat, ApiError> {
    ExportFormat::parse(format)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown export format: {}. Use docx or pdf", format)))
}

fn check_url(raw: &str) -> Result<(), ApiError> {
    match url::Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        _ => Err(ApiError::BadRequest(format!("Invalid URL: {}", raw))),
    }
}

fn check_images(images: &[ImageRequest]) -> Result<(), ApiError> {
    images.iter().try_for_each(|image| check_url(&image.url))
}

fn not_found(id: &str) -> ApiError {
    ApiError::NotFound(format!("Analysis not found: {}", id))
}

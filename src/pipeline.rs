//! Multi-stage listing analysis with streamed progress events.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::address::{self, NormalizedAddress};
use crate::describer::Describer;
use crate::gallery::{self, Platform};
use crate::market::{self, CompetitorData, LocationData, MarketData, MarketInput};
use crate::schema::{Analysis, ImageAnalysis, ImageRequest, PropertyTypeResult, TargetGroup};
use crate::writer::Writer;

/// Request body for a full analysis run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub gallery_url: Option<String>,
    /// Explicit photos. When set, these replace the scraped gallery images.
    #[serde(default)]
    pub images: Vec<ImageRequest>,
    /// Overrides the address scraped from the gallery page.
    #[serde(default)]
    pub raw_address: Option<String>,
    #[serde(default)]
    pub target_group: TargetGroup,
    #[serde(default)]
    pub area_m2: Option<f64>,
    #[serde(default)]
    pub max_images: Option<usize>,
}

/// One line of the NDJSON progress stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started {
        analysis_id: String,
        gallery_url: Option<String>,
        image_count: usize,
        address: Option<NormalizedAddress>,
    },
    Image {
        index: usize,
        result: ImageAnalysis,
    },
    ImageFailed {
        index: usize,
        url: String,
        error: String,
    },
    PropertyType {
        result: PropertyTypeResult,
    },
    Intro {
        text: String,
    },
    Market {
        data: MarketData,
    },
    Location {
        data: LocationData,
    },
    Competitors {
        data: CompetitorData,
    },
    StageFailed {
        stage: String,
        error: String,
    },
    /// End of an image-only run.
    Done {
        succeeded: usize,
        failed: usize,
    },
    Completed {
        analysis: Box<Analysis>,
    },
    Error {
        message: String,
    },
}

/// Sending half of the progress stream. A disconnected client does not stop
/// the run; the finished analysis is still stored.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<PipelineEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    pub async fn emit(&self, event: PipelineEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Progress stream closed by client");
        }
    }
}

/// Finished analyses, kept in memory for retrieval, edits and export.
#[derive(Debug, Clone, Default)]
pub struct AnalysisStore {
    inner: Arc<RwLock<HashMap<String, Analysis>>>,
}

impl AnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, analysis: Analysis) {
        self.inner
            .write()
            .unwrap()
            .insert(analysis.id.clone(), analysis);
    }

    pub fn get(&self, id: &str) -> Option<Analysis> {
        self.inner.read().unwrap().get(id).cloned()
    }

    /// Apply `f` to a stored analysis and return the updated copy.
    pub fn update<F>(&self, id: &str, f: F) -> Option<Analysis>
    where
        F: FnOnce(&mut Analysis),
    {
        let mut store = self.inner.write().unwrap();
        let analysis = store.get_mut(id)?;
        f(analysis);
        Some(analysis.clone())
    }
}

/// Pipeline orchestrator.
pub struct Pipeline {
    client: reqwest::Client,
    describer: Arc<Describer>,
    writer: Arc<Writer>,
    store: AnalysisStore,
    batch_size: usize,
    max_images: usize,
}

impl Pipeline {
    pub fn new(
        client: reqwest::Client,
        describer: Arc<Describer>,
        writer: Arc<Writer>,
        store: AnalysisStore,
        batch_size: usize,
        max_images: usize,
    ) -> Self {
        Self {
            client,
            describer,
            writer,
            store,
            batch_size: batch_size.max(1),
            max_images: max_images.max(1),
        }
    }

    /// Run every stage, emitting events as results arrive. Returns the stored
    /// analysis, or `None` when the run could not produce one.
    pub async fn run(&self, request: AnalyzeRequest, sink: &EventSink) -> Option<Analysis> {
        let (images, raw_address, platform) = match self.acquire(&request).await {
            Ok(acquired) => acquired,
            Err(message) => {
                warn!("Analysis aborted: {}", message);
                sink.emit(PipelineEvent::Error { message }).await;
                return None;
            }
        };

        let address = raw_address
            .as_deref()
            .map(|raw| address::normalize(raw, platform));

        let mut analysis = Analysis::new(request.gallery_url.clone(), request.target_group);
        analysis.raw_address = raw_address;
        analysis.address = address.clone();
        analysis.area_m2 = request.area_m2;

        info!(
            "Analysis {} started: {} images, target group {:?}",
            analysis.id,
            images.len(),
            request.target_group
        );
        sink.emit(PipelineEvent::Started {
            analysis_id: analysis.id.clone(),
            gallery_url: analysis.gallery_url.clone(),
            image_count: images.len(),
            address,
        })
        .await;

        analysis.images = self
            .describe_images(&images, request.target_group, sink)
            .await;

        let succeeded: Vec<ImageAnalysis> =
            analysis.images.iter().filter(|i| i.is_ok()).cloned().collect();
        if succeeded.is_empty() {
            error!("Analysis {}: every image failed", analysis.id);
            sink.emit(PipelineEvent::Error {
                message: "All image analyses failed".to_string(),
            })
            .await;
            return None;
        }

        match self
            .writer
            .detect_property_type(&succeeded, analysis.raw_address.as_deref())
            .await
        {
            Ok(result) => {
                analysis.property_type = Some(result.clone());
                sink.emit(PipelineEvent::PropertyType { result }).await;
            }
            Err(e) => stage_failed(sink, "property_type", e).await,
        }

        let property_type = analysis.property_type.as_ref().map(|p| p.property_type);
        match self
            .writer
            .generate_intro(
                analysis.display_address().as_deref(),
                property_type,
                &succeeded,
                request.target_group,
            )
            .await
        {
            Ok(text) => {
                analysis.intro = Some(text.clone());
                sink.emit(PipelineEvent::Intro { text }).await;
            }
            Err(e) => stage_failed(sink, "intro", e).await,
        }

        let input = market_input(&analysis);
        let market = market::market_data(&input);
        analysis.market = Some(market.clone());
        sink.emit(PipelineEvent::Market { data: market }).await;

        let location = market::location_data(&input);
        analysis.location = Some(location.clone());
        sink.emit(PipelineEvent::Location { data: location }).await;

        let competitors = market::competitor_data(&input);
        analysis.competitors = Some(competitors.clone());
        sink.emit(PipelineEvent::Competitors { data: competitors }).await;

        self.store.insert(analysis.clone());
        info!(
            "Analysis {} complete: {}/{} images described, {} descriptions cached",
            analysis.id,
            succeeded.len(),
            analysis.images.len(),
            self.describer.cache().len()
        );
        sink.emit(PipelineEvent::Completed {
            analysis: Box::new(analysis.clone()),
        })
        .await;

        Some(analysis)
    }

    /// Image-only run: describe the given photos and finish with `done`.
    pub async fn run_images(&self, images: Vec<ImageRequest>, group: TargetGroup, sink: &EventSink) -> Vec<ImageAnalysis> {
        let images: Vec<ImageRequest> = images.into_iter().take(self.max_images).collect();
        let results = self.describe_images(&images, group, sink).await;
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        sink.emit(PipelineEvent::Done {
            succeeded,
            failed: results.len() - succeeded,
        })
        .await;
        results
    }

    /// Consecutive batches of `batch_size`, each described concurrently.
    async fn describe_images(
        &self,
        images: &[ImageRequest],
        group: TargetGroup,
        sink: &EventSink,
    ) -> Vec<ImageAnalysis> {
        let mut results = Vec::with_capacity(images.len());

        for (batch_index, batch) in images.chunks(self.batch_size).enumerate() {
            debug!("Describing batch {} ({} images)", batch_index, batch.len());
            let batch_results = self.describer.describe_batch(batch, group).await;

            for (offset, result) in batch_results.into_iter().enumerate() {
                let index = batch_index * self.batch_size + offset;
                let event = match &result.error {
                    Some(error) => PipelineEvent::ImageFailed {
                        index,
                        url: result.url.clone(),
                        error: error.clone(),
                    },
                    None => PipelineEvent::Image {
                        index,
                        result: result.clone(),
                    },
                };
                sink.emit(event).await;
                results.push(result);
            }
        }

        results
    }

    /// Resolve the photo list, raw address and platform for a request.
    async fn acquire(
        &self,
        request: &AnalyzeRequest,
    ) -> Result<(Vec<ImageRequest>, Option<String>, Platform), String> {
        let limit = request
            .max_images
            .unwrap_or(self.max_images)
            .clamp(1, self.max_images);

        let (mut images, raw_address, platform) = match &request.gallery_url {
            Some(url) => {
                let gallery = gallery::fetch_gallery(&self.client, url)
                    .await
                    .map_err(|e| format!("Could not fetch gallery: {:#}", e))?;
                let images = if request.images.is_empty() {
                    gallery
                        .images
                        .into_iter()
                        .map(|url| ImageRequest { url, room_type: None })
                        .collect()
                } else {
                    request.images.clone()
                };
                (
                    images,
                    request.raw_address.clone().or(gallery.raw_address),
                    gallery.platform,
                )
            }
            None => (
                request.images.clone(),
                request.raw_address.clone(),
                Platform::Generic,
            ),
        };

        if request.gallery_url.is_none() && images.is_empty() {
            return Err("Either gallery_url or images is required".to_string());
        }
        if images.is_empty() {
            return Err("No images found on gallery page".to_string());
        }

        images.truncate(limit);
        Ok((images, raw_address, platform))
    }
}

async fn stage_failed(sink: &EventSink, stage: &str, error: anyhow::Error) {
    warn!("Stage {} failed: {:#}", stage, error);
    sink.emit(PipelineEvent::StageFailed {
        stage: stage.to_string(),
        error: format!("{:#}", error),
    })
    .await;
}

/// Inputs for the synthesized sections, taken from an analysis.
pub fn market_input(analysis: &Analysis) -> MarketInput {
    MarketInput {
        address: analysis.address.clone(),
        raw_address: analysis
            .raw_address
            .clone()
            .or_else(|| analysis.gallery_url.clone()),
        property_type: analysis.property_type.as_ref().map(|p| p.property_type),
        area_m2: analysis.area_m2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DescriptionCache;
    use crate::config::ProfileStore;
    use crate::llm::{ChatBackend, Message};
    use crate::schema::{PropertyType, RoomType};
    use async_trait::async_trait;

    /// Routes replies by prompt content, like a tiny fake model.
    struct FakeModel {
        fail_intro: bool,
    }

    #[async_trait]
    impl ChatBackend for FakeModel {
        async fn complete(&self, messages: Vec<Message>, _json_mode: bool) -> anyhow::Result<String> {
            let prompt = messages.iter().map(|m| m.text()).collect::<Vec<_>>().join("\n");
            if prompt.contains("Klassifiser bildet") || prompt.contains("Bildet viser rommet") {
                let last_url = messages
                    .iter()
                    .flat_map(|m| match &m.content {
                        crate::llm::MessageContent::Parts(parts) => parts.clone(),
                        crate::llm::MessageContent::Text(_) => Vec::new(),
                    })
                    .find_map(|p| match p {
                        crate::llm::ContentPart::ImageUrl { image_url } => Some(image_url.url),
                        crate::llm::ContentPart::Text { .. } => None,
                    })
                    .unwrap_or_default();
                if last_url.contains("broken") {
                    anyhow::bail!("vision call failed");
                }
                let room = if last_url.contains("kitchen") { "kitchen" } else { "garden" };
                return Ok(format!(
                    r#"{{"room_type": "{}", "description": "Fint rom."}}"#,
                    room
                ));
            }
            if prompt.contains("avgjøre boligtypen") {
                return Ok(r#"{"property_type": "detached_house", "confidence": 0.9, "reasoning": "Hage"}"#.to_string());
            }
            if self.fail_intro {
                anyhow::bail!("intro model offline");
            }
            Ok("Velkommen hjem.".to_string())
        }
    }

    fn pipeline(fail_intro: bool, batch_size: usize) -> (Pipeline, AnalysisStore) {
        let backend: Arc<dyn ChatBackend> = Arc::new(FakeModel { fail_intro });
        let profiles = ProfileStore::builtin();
        let describer = Arc::new(Describer::new(
            backend.clone(),
            DescriptionCache::new(),
            profiles.clone(),
            None,
        ));
        let writer = Arc::new(Writer::new(backend, profiles));
        let store = AnalysisStore::new();
        let pipeline = Pipeline::new(
            reqwest::Client::new(),
            describer,
            writer,
            store.clone(),
            batch_size,
            30,
        );
        (pipeline, store)
    }

    fn images(urls: &[&str]) -> Vec<ImageRequest> {
        urls.iter()
            .map(|u| ImageRequest {
                url: u.to_string(),
                room_type: None,
            })
            .collect()
    }

    async fn collect(mut rx: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn event_types(events: &[PipelineEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_full_run_event_order() {
        let (pipeline, store) = pipeline(false, 2);
        let (sink, rx) = EventSink::channel(64);

        let request = AnalyzeRequest {
            images: images(&[
                "https://cdn.example.no/kitchen.jpg",
                "https://cdn.example.no/broken.jpg",
                "https://cdn.example.no/garden.jpg",
            ]),
            raw_address: Some("Storgata 12, 0155 Oslo".to_string()),
            target_group: TargetGroup::Family,
            ..Default::default()
        };

        let analysis = pipeline.run(request, &sink).await.unwrap();
        drop(sink);
        let events = collect(rx).await;

        assert_eq!(
            event_types(&events),
            vec![
                "started",
                "image",
                "image_failed",
                "image",
                "property_type",
                "intro",
                "market",
                "location",
                "competitors",
                "completed",
            ]
        );

        match &events[2] {
            PipelineEvent::ImageFailed { index, url, .. } => {
                assert_eq!(*index, 1);
                assert!(url.contains("broken"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(analysis.images.len(), 3);
        assert_eq!(analysis.images[0].room_type, RoomType::Kitchen);
        assert_eq!(
            analysis.property_type.as_ref().map(|p| p.property_type),
            Some(PropertyType::DetachedHouse)
        );
        assert_eq!(analysis.intro.as_deref(), Some("Velkommen hjem."));
        assert_eq!(
            analysis.address.as_ref().map(|a| a.formatted.as_str()),
            Some("Storgata 12, 0155 Oslo")
        );
        assert_eq!(analysis.market.as_ref().map(|m| m.region.as_str()), Some("Oslo"));
        assert!(store.get(&analysis.id).is_some());
    }

    #[tokio::test]
    async fn test_stage_failure_does_not_stop_pipeline() {
        let (pipeline, _store) = pipeline(true, 5);
        let (sink, rx) = EventSink::channel(64);

        let request = AnalyzeRequest {
            images: images(&["https://cdn.example.no/kitchen.jpg"]),
            ..Default::default()
        };
        let analysis = pipeline.run(request, &sink).await.unwrap();
        drop(sink);
        let events = collect(rx).await;

        assert!(analysis.intro.is_none());
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageFailed { stage, .. } if stage == "intro"
        )));
        assert!(matches!(events.last(), Some(PipelineEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_all_images_failing_is_an_error() {
        let (pipeline, _store) = pipeline(false, 5);
        let (sink, rx) = EventSink::channel(64);

        let request = AnalyzeRequest {
            images: images(&["https://cdn.example.no/broken-1.jpg", "https://cdn.example.no/broken-2.jpg"]),
            ..Default::default()
        };
        assert!(pipeline.run(request, &sink).await.is_none());
        drop(sink);

        let events = collect(rx).await;
        assert_eq!(
            event_types(&events),
            vec!["started", "image_failed", "image_failed", "error"]
        );
    }

    #[tokio::test]
    async fn test_request_without_source_is_rejected() {
        let (pipeline, _store) = pipeline(false, 5);
        let (sink, rx) = EventSink::channel(8);

        assert!(pipeline.run(AnalyzeRequest::default(), &sink).await.is_none());
        drop(sink);

        let events = collect(rx).await;
        assert_eq!(event_types(&events), vec!["error"]);
    }

    #[tokio::test]
    async fn test_max_images_truncates() {
        let (pipeline, _store) = pipeline(false, 2);
        let (sink, _rx) = EventSink::channel(64);

        let request = AnalyzeRequest {
            images: images(&[
                "https://cdn.example.no/kitchen-1.jpg",
                "https://cdn.example.no/kitchen-2.jpg",
                "https://cdn.example.no/kitchen-3.jpg",
            ]),
            max_images: Some(2),
            ..Default::default()
        };
        let analysis = pipeline.run(request, &sink).await.unwrap();
        assert_eq!(analysis.images.len(), 2);
    }

    #[tokio::test]
    async fn test_run_images_reports_done() {
        let (pipeline, _store) = pipeline(false, 2);
        let (sink, rx) = EventSink::channel(64);

        let results = pipeline
            .run_images(
                images(&["https://cdn.example.no/kitchen.jpg", "https://cdn.example.no/broken.jpg"]),
                TargetGroup::Standard,
                &sink,
            )
            .await;
        drop(sink);
        assert_eq!(results.len(), 2);

        let events = collect(rx).await;
        match events.last() {
            Some(PipelineEvent::Done { succeeded, failed }) => {
                assert_eq!((*succeeded, *failed), (1, 1));
            }
            other => panic!("unexpected last event {:?}", other),
        }
    }

    #[test]
    fn test_store_update() {
        let store = AnalysisStore::new();
        let analysis = Analysis::new(None, TargetGroup::Standard);
        let id = analysis.id.clone();
        store.insert(analysis);

        let updated = store
            .update(&id, |a| a.intro = Some("Ny tekst".to_string()))
            .unwrap();
        assert_eq!(updated.intro.as_deref(), Some("Ny tekst"));
        assert!(store.update("missing", |_| {}).is_none());
    }
}

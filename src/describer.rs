//! Per-photo room classification and description.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::future::join_all;
use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat};
use reqwest::Client;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CachedDescription, DescriptionCache};
use crate::config::ProfileStore;
use crate::llm::{parse_llm_json, ChatBackend, Message};
use crate::schema::{ImageAnalysis, ImageRequest, RoomType, TargetGroup};

/// Photos smaller than this on either side are treated as thumbnails or icons.
const MIN_IMAGE_SIDE: u32 = 200;
/// Longest side sent to the model.
const MAX_IMAGE_SIDE: u32 = 1024;
const JPEG_QUALITY: u8 = 80;

/// Describes photos one model call at a time, memoized in a [`DescriptionCache`].
pub struct Describer {
    backend: Arc<dyn ChatBackend>,
    cache: DescriptionCache,
    profiles: ProfileStore,
    inliner: Option<ImageInliner>,
}

impl Describer {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        cache: DescriptionCache,
        profiles: ProfileStore,
        inliner: Option<ImageInliner>,
    ) -> Self {
        Self {
            backend,
            cache,
            profiles,
            inliner,
        }
    }

    pub fn cache(&self) -> &DescriptionCache {
        &self.cache
    }

    /// Classify (unless the room type is given) and describe one photo.
    pub async fn describe(&self, request: &ImageRequest, group: TargetGroup) -> Result<ImageAnalysis> {
        let key = DescriptionCache::key(&request.url, request.room_type, group);
        if let Some(hit) = self.cache.get(&key) {
            debug!("Cache hit for {}", request.url);
            return Ok(ImageAnalysis {
                url: request.url.clone(),
                room_type: hit.room_type,
                description: hit.description,
                cached: true,
                error: None,
            });
        }

        let image_ref = match &self.inliner {
            Some(inliner) => inliner.data_url(&request.url).await?,
            None => request.url.clone(),
        };

        let messages = vec![
            Message::system(self.system_prompt(group)),
            Message::user_with_image(user_prompt(request.room_type), image_ref),
        ];

        let response = self.backend.complete(messages, true).await?;
        let reply: DescriptionReply =
            parse_llm_json(&response).context("Failed to parse image description")?;

        let room_type = request.room_type.unwrap_or_else(|| {
            reply
                .room_type
                .as_deref()
                .map(RoomType::parse)
                .unwrap_or(RoomType::Other)
        });
        let description = limit_sentences(&reply.description, 2);
        if description.is_empty() {
            anyhow::bail!("Model returned an empty description for {}", request.url);
        }

        self.cache.insert(
            key,
            CachedDescription {
                room_type,
                description: description.clone(),
            },
        );

        Ok(ImageAnalysis {
            url: request.url.clone(),
            room_type,
            description,
            cached: false,
            error: None,
        })
    }

    /// Describe a batch concurrently. Results keep input order; failures become
    /// [`ImageAnalysis::failed`] entries instead of aborting the batch.
    pub async fn describe_batch(&self, batch: &[ImageRequest], group: TargetGroup) -> Vec<ImageAnalysis> {
        let results = join_all(batch.iter().map(|req| self.describe(req, group))).await;

        batch
            .iter()
            .zip(results)
            .map(|(req, result)| match result {
                Ok(analysis) => analysis,
                Err(e) => {
                    warn!("Image analysis failed for {}: {:#}", req.url, e);
                    ImageAnalysis::failed(&req.url, format!("{:#}", e))
                }
            })
            .collect()
    }

    fn system_prompt(&self, group: TargetGroup) -> String {
        let profile = self.profiles.get(group);
        let focus = if profile.focus.is_empty() {
            String::new()
        } else {
            format!("\nLegg særlig vekt på: {}.", profile.focus.join(", "))
        };

        format!(
            "Du er en erfaren norsk eiendomsmegler og tekstforfatter. Du får ett bilde fra en boligannonse og skriver korte, salgsfremmende og korrekte bildetekster på norsk bokmål. Beskriv bare det som faktisk synes i bildet. Ikke nevn personer, merkevarer eller bildekvalitet.\n\nMålgruppe: {}. {}{}",
            profile.label, profile.tone, focus
        )
    }
}

fn user_prompt(room_type: Option<RoomType>) -> String {
    match room_type {
        Some(room) => format!(
            "Bildet viser rommet: {}. Skriv 1-2 setninger som beskriver rommet.\n\nSvar KUN med JSON: {{\"room_type\": \"{}\", \"description\": \"...\"}}",
            room.label(),
            room.as_str()
        ),
        None => {
            let options = RoomType::ALL
                .iter()
                .map(|r| format!("{} ({})", r.as_str(), r.label()))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "Klassifiser bildet som nøyaktig én romtype fra listen: {}.\nSkriv deretter 1-2 setninger som beskriver rommet.\n\nSvar KUN med JSON: {{\"room_type\": \"<romtype>\", \"description\": \"...\"}}",
                options
            )
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct DescriptionReply {
    #[serde(default)]
    room_type: Option<String>,
    #[serde(default)]
    description: String,
}

/// Keep at most `max` sentences. A terminator only ends a sentence when the
/// next word starts with a capital letter, so "ca. 20 kvm" stays intact.
pub fn limit_sentences(text: &str, max: usize) -> String {
    let text = text.trim().trim_matches('"').trim();
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut found = 0;

    for (i, &(idx, c)) in chars.iter().enumerate() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let rest = &chars[i + 1..];
        let ends_sentence = match rest.iter().find(|(_, ch)| !ch.is_whitespace()) {
            None => true,
            Some((_, next)) => {
                rest.first().map(|(_, ch)| ch.is_whitespace()).unwrap_or(false)
                    && (next.is_uppercase() || *next == '"' || *next == '«')
            }
        };
        if ends_sentence {
            found += 1;
            if found == max {
                return text[..idx + c.len_utf8()].to_string();
            }
        }
    }

    text.to_string()
}

/// Downloads photos and re-encodes them as size-capped JPEG data URLs.
#[derive(Clone)]
pub struct ImageInliner {
    client: Client,
}

impl ImageInliner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn data_url(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to download image {}", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Image download returned {} for {}", status, url);
        }

        let bytes = response.bytes().await.context("Failed to read image body")?;
        let jpeg = prepare_image(&bytes)?;
        info!(
            "Inlined image {} ({} bytes -> {} bytes)",
            url,
            bytes.len(),
            jpeg.len()
        );

        Ok(format!("data:image/jpeg;base64,{}", BASE64.encode(&jpeg)))
    }
}

/// Reject tiny images, downscale large ones and re-encode as JPEG.
pub fn prepare_image(bytes: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes).context("Unsupported or corrupt image")?;

    if img.width() < MIN_IMAGE_SIDE || img.height() < MIN_IMAGE_SIDE {
        anyhow::bail!(
            "Image too small ({}x{}), minimum is {}x{}",
            img.width(),
            img.height(),
            MIN_IMAGE_SIDE,
            MIN_IMAGE_SIDE
        );
    }

    let img = if img.width() > MAX_IMAGE_SIDE || img.height() > MAX_IMAGE_SIDE {
        img.resize(MAX_IMAGE_SIDE, MAX_IMAGE_SIDE, FilterType::Triangle)
    } else {
        img
    };

    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut out = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Jpeg(JPEG_QUALITY))
        .context("Failed to encode JPEG")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ContentPart, MessageContent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replies with a fixed JSON body; counts calls and records prompts.
    struct ScriptedBackend {
        reply: String,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(&self, messages: Vec<Message>, _json_mode: bool) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = messages.iter().map(|m| m.text()).collect::<Vec<_>>().join("\n");
            let image_urls: Vec<String> = messages
                .iter()
                .flat_map(|m| match &m.content {
                    MessageContent::Parts(parts) => parts.clone(),
                    MessageContent::Text(_) => Vec::new(),
                })
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { image_url } => Some(image_url.url),
                    ContentPart::Text { .. } => None,
                })
                .collect();
            if image_urls.iter().any(|url| url.contains("broken.jpg")) {
                anyhow::bail!("upstream exploded");
            }
            self.prompts.lock().unwrap().push(text);
            Ok(self.reply.clone())
        }
    }

    fn describer(backend: Arc<ScriptedBackend>) -> Describer {
        Describer::new(backend, DescriptionCache::new(), ProfileStore::builtin(), None)
    }

    fn request(url: &str, room_type: Option<RoomType>) -> ImageRequest {
        ImageRequest {
            url: url.to_string(),
            room_type,
        }
    }

    #[tokio::test]
    async fn test_describe_classifies_and_caches() {
        let backend = Arc::new(ScriptedBackend::new(
            r#"{"room_type": "kitchen", "description": "Lyst kjøkken med god benkeplass. Integrerte hvitevarer. Vinduer mot hagen."}"#,
        ));
        let describer = describer(backend.clone());
        let req = request("https://cdn.example.no/1.jpg", None);

        let first = describer.describe(&req, TargetGroup::Standard).await.unwrap();
        assert_eq!(first.room_type, RoomType::Kitchen);
        assert_eq!(
            first.description,
            "Lyst kjøkken med god benkeplass. Integrerte hvitevarer."
        );
        assert!(!first.cached);

        let second = describer.describe(&req, TargetGroup::Standard).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.description, first.description);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        // A different audience is a different cache entry.
        describer.describe(&req, TargetGroup::Senior).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_requested_room_type_wins() {
        let backend = Arc::new(ScriptedBackend::new(
            r#"{"room_type": "bedroom", "description": "Romslig stue med peis."}"#,
        ));
        let describer = describer(backend.clone());

        let result = describer
            .describe(&request("https://cdn.example.no/2.jpg", Some(RoomType::LivingRoom)), TargetGroup::Family)
            .await
            .unwrap();
        assert_eq!(result.room_type, RoomType::LivingRoom);

        let prompts = backend.prompts.lock().unwrap();
        assert!(prompts[0].contains("Bildet viser rommet: Stue"));
        assert!(prompts[0].contains("Barnefamilie"));
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_isolates_failures() {
        let backend = Arc::new(ScriptedBackend::new(
            r#"{"room_type": "bathroom", "description": "Flislagt bad."}"#,
        ));
        let describer = describer(backend.clone());
        let batch = vec![
            request("https://cdn.example.no/a.jpg", None),
            request("https://cdn.example.no/broken.jpg", None),
            request("https://cdn.example.no/c.jpg", None),
        ];

        let results = describer.describe_batch(&batch, TargetGroup::Standard).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(!results[1].is_ok());
        assert_eq!(results[1].url, "https://cdn.example.no/broken.jpg");
        assert!(results[1].error.as_deref().unwrap().contains("upstream exploded"));
        assert_eq!(results[2].url, "https://cdn.example.no/c.jpg");
        assert!(results[2].is_ok());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_description_is_error() {
        let backend = Arc::new(ScriptedBackend::new(r#"{"room_type": "kitchen", "description": "  "}"#));
        let describer = describer(backend);
        let result = describer
            .describe(&request("https://cdn.example.no/3.jpg", None), TargetGroup::Standard)
            .await;
        assert!(result.is_err());
        assert!(describer.cache().is_empty());
    }

    #[test]
    fn test_limit_sentences() {
        assert_eq!(limit_sentences("En. To. Tre.", 2), "En. To.");
        assert_eq!(
            limit_sentences("Stue på ca. 30 kvm med utgang til terrasse. Peis.", 1),
            "Stue på ca. 30 kvm med utgang til terrasse."
        );
        assert_eq!(limit_sentences("\"Kun én setning\"", 2), "Kun én setning");
        assert_eq!(limit_sentences("Hva med dette? Ja!", 2), "Hva med dette? Ja!");
    }

    #[test]
    fn test_prepare_image_downscales() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::new(2048, 1024));
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png).unwrap();

        let jpeg = prepare_image(&png).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1024, 512));
    }

    #[test]
    fn test_prepare_image_rejects_thumbnails() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::new(120, 400));
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png).unwrap();

        let err = prepare_image(&png).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }
}

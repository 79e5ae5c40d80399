//! Listing-level text: property type detection and the intro paragraph.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ProfileStore;
use crate::llm::{parse_llm_json, ChatBackend, Message};
use crate::schema::{ImageAnalysis, PropertyType, PropertyTypeResult, RoomType, TargetGroup};

pub struct Writer {
    backend: Arc<dyn ChatBackend>,
    profiles: ProfileStore,
}

impl Writer {
    pub fn new(backend: Arc<dyn ChatBackend>, profiles: ProfileStore) -> Self {
        Self { backend, profiles }
    }

    /// Decide the property type from the photo descriptions. An unparseable
    /// model reply falls back to a room-mix heuristic; transport errors propagate.
    pub async fn detect_property_type(
        &self,
        images: &[ImageAnalysis],
        raw_address: Option<&str>,
    ) -> Result<PropertyTypeResult> {
        let system = "Du er en norsk eiendomsmegler. Ut fra bildetekstene til en boligannonse skal du avgjøre boligtypen.";
        let user = format!(
            "Adresse/tittel: {}\n\nBildetekster:\n{}\n\nVelg én boligtype: apartment, detached_house, semi_detached, townhouse, cabin, farm, plot, other.\nSvar KUN med JSON: {{\"property_type\": \"...\", \"confidence\": 0.0-1.0, \"reasoning\": \"kort begrunnelse\"}}",
            raw_address.unwrap_or("ukjent"),
            image_digest(images)
        );

        let response = self
            .backend
            .complete(vec![Message::system(system), Message::user(user)], true)
            .await?;

        match parse_llm_json::<PropertyTypeReply>(&response) {
            Ok(reply) => {
                let result = PropertyTypeResult {
                    property_type: PropertyType::parse(&reply.property_type),
                    confidence: reply.confidence.clamp(0.0, 1.0),
                    reasoning: reply.reasoning,
                };
                debug!("Detected property type: {:?}", result.property_type);
                Ok(result)
            }
            Err(e) => {
                warn!("Property type reply unusable, using room heuristic: {:#}", e);
                Ok(heuristic_property_type(images))
            }
        }
    }

    /// 3-5 sentence Norwegian intro in the tone of the target group.
    pub async fn generate_intro(
        &self,
        address: Option<&str>,
        property_type: Option<PropertyType>,
        images: &[ImageAnalysis],
        group: TargetGroup,
    ) -> Result<String> {
        let profile = self.profiles.get(group);
        let system = format!(
            "Du er en prisbelønt norsk tekstforfatter for eiendomsmeglere. Skriv på norsk bokmål, uten overdrivelser og uten å finne på detaljer som ikke står i underlaget.\n\nMålgruppe: {}. {}",
            profile.label, profile.tone
        );
        let user = format!(
            "Skriv en innledende annonsetekst på 3-5 setninger.\n\nAdresse: {}\nBoligtype: {}\n\nBildetekster:\n{}\n\nSvar kun med selve teksten.",
            address.unwrap_or("ikke oppgitt"),
            property_type.map(|p| p.label()).unwrap_or("ukjent"),
            image_digest(images)
        );

        let response = self
            .backend
            .complete(vec![Message::system(system), Message::user(user)], false)
            .await
            .context("Intro generation failed")?;

        let intro = response.trim().trim_matches('"').trim().to_string();
        if intro.is_empty() {
            anyhow::bail!("Model returned an empty intro");
        }
        Ok(intro)
    }
}

#[derive(Debug, serde::Deserialize)]
struct PropertyTypeReply {
    property_type: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

fn default_confidence() -> f64 {
    0.5
}

/// One line per successful photo: "- Kjøkken: ...".
fn image_digest(images: &[ImageAnalysis]) -> String {
    images
        .iter()
        .filter(|i| i.is_ok())
        .map(|i| format!("- {}: {}", i.room_type.label(), i.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Guess from which rooms were photographed.
pub fn heuristic_property_type(images: &[ImageAnalysis]) -> PropertyTypeResult {
    let has = |room: RoomType| images.iter().any(|i| i.is_ok() && i.room_type == room);
    let bedrooms = images
        .iter()
        .filter(|i| i.is_ok() && i.room_type == RoomType::Bedroom)
        .count();

    let (property_type, reasoning) = if has(RoomType::Garden) && (has(RoomType::Garage) || bedrooms >= 3) {
        (PropertyType::DetachedHouse, "Hage kombinert med garasje eller mange soverom")
    } else if has(RoomType::Garden) || has(RoomType::Terrace) {
        (PropertyType::Townhouse, "Egen uteplass uten tydelige tegn på frittliggende hus")
    } else if has(RoomType::Balcony) || !has(RoomType::Exterior) {
        (PropertyType::Apartment, "Balkong eller kun innendørsbilder")
    } else {
        (PropertyType::Other, "Uklart ut fra bildene")
    };

    PropertyTypeResult {
        property_type,
        confidence: 0.4,
        reasoning: reasoning.to_string(),
    }
}

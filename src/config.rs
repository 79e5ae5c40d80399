//! Service configuration.
//!
//! Runtime settings come from the environment (after `.env` is loaded).
//! Target-group prompt profiles are loaded from JSON files in the profile
//! directory, falling back to the built-in set.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::schema::TargetGroup;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";

/// Runtime settings read from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub bind_addr: String,
    pub image_batch_size: usize,
    pub max_images: usize,
    pub inline_images: bool,
    pub profile_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let openai_api_key = lookup("OPENAI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .context("OPENAI_API_KEY environment variable not set")?;

        let parse_usize = |key: &str, default: usize| -> Result<usize> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("{} must be a positive integer, got '{}'", key, v)),
                None => Ok(default),
            }
        };

        let inline_images = match lookup("INLINE_IMAGES") {
            Some(v) => !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "no" | "off"),
            None => true,
        };

        Ok(Self {
            openai_api_key,
            openai_base_url: lookup("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            openai_model: lookup("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            image_batch_size: parse_usize("IMAGE_BATCH_SIZE", 5)?.max(1),
            max_images: parse_usize("MAX_IMAGES", 30)?.max(1),
            inline_images,
            profile_dir: lookup("PROFILE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("configs")),
        })
    }
}

/// Tone guidance for one target group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetProfile {
    pub target_group: TargetGroup,
    pub label: String,
    /// Style instructions appended to generation prompts.
    pub tone: String,
    /// Features to emphasize when present in the photos.
    #[serde(default)]
    pub focus: Vec<String>,
}

/// In-memory store of target-group profiles.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    profiles: Arc<RwLock<HashMap<TargetGroup, TargetProfile>>>,
}

impl ProfileStore {
    /// Load profiles from `*.json` files in `dir`. Groups without a file keep
    /// their built-in profile; a missing directory means built-ins only.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let store = Self::builtin();

        if !dir.exists() {
            warn!("Profile directory {:?} not found, using built-in profiles", dir);
            return Ok(store);
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();

            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read profile: {:?}", path))?;

                let profile: TargetProfile = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse profile: {:?}", path))?;

                info!("Loaded profile: {:?} from {:?}", profile.target_group, path);
                store.insert(profile);
            }
        }

        Ok(store)
    }

    pub fn builtin() -> Self {
        let map = builtin_profiles()
            .into_iter()
            .map(|p| (p.target_group, p))
            .collect();
        Self {
            profiles: Arc::new(RwLock::new(map)),
        }
    }

    /// Profile for a group. Every group has one, built-in or loaded.
    pub fn get(&self, group: TargetGroup) -> TargetProfile {
        self.profiles
            .read()
            .unwrap()
            .get(&group)
            .cloned()
            .unwrap_or_else(|| builtin_profile(group))
    }

    pub fn insert(&self, profile: TargetProfile) {
        self.profiles
            .write()
            .unwrap()
            .insert(profile.target_group, profile);
    }

    /// All profiles in `TargetGroup::ALL` order.
    pub fn all(&self) -> Vec<TargetProfile> {
        TargetGroup::ALL.iter().map(|g| self.get(*g)).collect()
    }
}

fn builtin_profiles() -> Vec<TargetProfile> {
    TargetGroup::ALL.iter().map(|g| builtin_profile(*g)).collect()
}

fn builtin_profile(group: TargetGroup) -> TargetProfile {
    let (label, tone, focus): (&str, &str, &[&str]) = match group {
        TargetGroup::Standard => (
            "Standard",
            "Skriv nøkternt, varmt og profesjonelt for et bredt publikum.",
            &["lys", "planløsning", "standard"],
        ),
        TargetGroup::Family => (
            "Barnefamilie",
            "Skriv til barnefamilier. Fremhev plass, soverom, trygge uteområder og hverdagspraktiske løsninger.",
            &["soverom", "hage", "oppbevaring", "skole og barnehage"],
        ),
        TargetGroup::FirstTimeBuyer => (
            "Førstegangskjøper",
            "Skriv til førstegangskjøpere. Fremhev lettstelt standard, god planløsning og nærhet til kollektivtransport.",
            &["lettstelt", "kollektivtransport", "innflytningsklar"],
        ),
        TargetGroup::Investor => (
            "Investor",
            "Skriv saklig til investorer. Fremhev utleiepotensial, vedlikeholdsstand og etterspørsel i området.",
            &["utleie", "vedlikehold", "beliggenhet"],
        ),
        TargetGroup::Senior => (
            "Senior",
            "Skriv rolig og tydelig til seniorer. Fremhev tilgjengelighet, ett-plans løsninger, heis og nærhet til tjenester.",
            &["tilgjengelighet", "heis", "nærbutikk", "lege"],
        ),
    };

    TargetProfile {
        target_group: group,
        label: label.to_string(),
        tone: tone.to_string(),
        focus: focus.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_lookup(lookup_from(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(settings.openai_base_url, DEFAULT_BASE_URL);
        assert_eq!(settings.openai_model, DEFAULT_MODEL);
        assert_eq!(settings.image_batch_size, 5);
        assert_eq!(settings.max_images, 30);
        assert!(settings.inline_images);
    }

    #[test]
    fn test_settings_overrides() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("IMAGE_BATCH_SIZE", "0"),
            ("INLINE_IMAGES", "false"),
            ("OPENAI_MODEL", "gpt-4o-mini"),
        ]))
        .unwrap();
        assert_eq!(settings.image_batch_size, 1);
        assert!(!settings.inline_images);
        assert_eq!(settings.openai_model, "gpt-4o-mini");
    }

    #[test]
    fn test_settings_require_api_key() {
        assert!(Settings::from_lookup(lookup_from(&[])).is_err());
        assert!(Settings::from_lookup(lookup_from(&[
            ("OPENAI_API_KEY", "sk"),
            ("MAX_IMAGES", "many"),
        ]))
        .is_err());
    }

    #[test]
    fn test_builtin_profiles_cover_all_groups() {
        let store = ProfileStore::builtin();
        let all = store.all();
        assert_eq!(all.len(), TargetGroup::ALL.len());
        assert_eq!(store.get(TargetGroup::Family).label, "Barnefamilie");
    }

    #[test]
    fn test_missing_profile_dir_uses_builtins() {
        let store = ProfileStore::load_from_dir(Path::new("does/not/exist")).unwrap();
        assert_eq!(store.get(TargetGroup::Investor).label, "Investor");
    }

    #[test]
    fn test_load_profile_override() {
        let dir = std::env::temp_dir().join(format!("profiles_{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("senior.json"),
            r#"{"target_group": "senior", "label": "Godt voksne", "tone": "Kort og klart."}"#,
        )
        .unwrap();

        let store = ProfileStore::load_from_dir(&dir).unwrap();
        let senior = store.get(TargetGroup::Senior);
        assert_eq!(senior.label, "Godt voksne");
        assert!(senior.focus.is_empty());
        assert_eq!(store.get(TargetGroup::Family).label, "Barnefamilie");

        std::fs::remove_dir_all(&dir).ok();
    }
}

//! Domain types shared by the pipeline, the HTTP layer and the exporters.

use crate::address::NormalizedAddress;
use crate::market::{CompetitorData, LocationData, MarketData};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current UTC time as an RFC 3339 string.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Fixed set of room categories a photo can be classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    LivingRoom,
    Kitchen,
    Bedroom,
    Bathroom,
    Hallway,
    DiningRoom,
    Office,
    Laundry,
    Storage,
    Basement,
    Attic,
    Balcony,
    Terrace,
    Garden,
    Exterior,
    View,
    Garage,
    FloorPlan,
    Other,
}

impl RoomType {
    pub const ALL: [RoomType; 19] = [
        RoomType::LivingRoom,
        RoomType::Kitchen,
        RoomType::Bedroom,
        RoomType::Bathroom,
        RoomType::Hallway,
        RoomType::DiningRoom,
        RoomType::Office,
        RoomType::Laundry,
        RoomType::Storage,
        RoomType::Basement,
        RoomType::Attic,
        RoomType::Balcony,
        RoomType::Terrace,
        RoomType::Garden,
        RoomType::Exterior,
        RoomType::View,
        RoomType::Garage,
        RoomType::FloorPlan,
        RoomType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoomType::LivingRoom => "living_room",
            RoomType::Kitchen => "kitchen",
            RoomType::Bedroom => "bedroom",
            RoomType::Bathroom => "bathroom",
            RoomType::Hallway => "hallway",
            RoomType::DiningRoom => "dining_room",
            RoomType::Office => "office",
            RoomType::Laundry => "laundry",
            RoomType::Storage => "storage",
            RoomType::Basement => "basement",
            RoomType::Attic => "attic",
            RoomType::Balcony => "balcony",
            RoomType::Terrace => "terrace",
            RoomType::Garden => "garden",
            RoomType::Exterior => "exterior",
            RoomType::View => "view",
            RoomType::Garage => "garage",
            RoomType::FloorPlan => "floor_plan",
            RoomType::Other => "other",
        }
    }

    /// Norwegian label used in generated text and exports.
    pub fn label(&self) -> &'static str {
        match self {
            RoomType::LivingRoom => "Stue",
            RoomType::Kitchen => "Kjøkken",
            RoomType::Bedroom => "Soverom",
            RoomType::Bathroom => "Bad",
            RoomType::Hallway => "Gang/entré",
            RoomType::DiningRoom => "Spisestue",
            RoomType::Office => "Kontor",
            RoomType::Laundry => "Vaskerom",
            RoomType::Storage => "Bod",
            RoomType::Basement => "Kjeller",
            RoomType::Attic => "Loft",
            RoomType::Balcony => "Balkong",
            RoomType::Terrace => "Terrasse",
            RoomType::Garden => "Hage",
            RoomType::Exterior => "Fasade",
            RoomType::View => "Utsikt",
            RoomType::Garage => "Garasje",
            RoomType::FloorPlan => "Plantegning",
            RoomType::Other => "Annet",
        }
    }

    /// Lenient parse of model output or user input. Unknown values map to `Other`.
    pub fn parse(s: &str) -> RoomType {
        let key = s
            .trim()
            .to_lowercase()
            .replace(['-', ' ', '/'], "_");

        if let Some(room) = RoomType::ALL.iter().find(|r| r.as_str() == key) {
            return *room;
        }
        if let Some(room) = RoomType::ALL
            .iter()
            .find(|r| r.label().to_lowercase().replace(['-', ' ', '/'], "_") == key)
        {
            return *room;
        }

        match key.as_str() {
            "livingroom" | "lounge" | "family_room" | "tv_stue" | "tv_room" | "kjøkken_og_stue" => {
                RoomType::LivingRoom
            }
            "kjokken" | "kitchenette" => RoomType::Kitchen,
            "soverom_1" | "soverom_2" | "master_bedroom" | "sovealkove" => RoomType::Bedroom,
            "bad" | "baderom" | "bad_wc" | "wc" | "toilet" | "toalett" | "bathroom_wc" => {
                RoomType::Bathroom
            }
            "gang" | "entre" | "entré" | "entrance" | "hall" | "vindfang" => RoomType::Hallway,
            "spisestue" | "dining" | "spiseplass" => RoomType::DiningRoom,
            "hjemmekontor" | "study" | "arbeidsrom" => RoomType::Office,
            "vaskerom" | "utility_room" | "laundry_room" => RoomType::Laundry,
            "bod" | "closet" | "walk_in_closet" | "garderobe" => RoomType::Storage,
            "kjeller" | "cellar" | "underetasje" => RoomType::Basement,
            "loft" | "loftstue" => RoomType::Attic,
            "veranda" | "altan" => RoomType::Balcony,
            "patio" | "deck" | "platting" | "uteplass" => RoomType::Terrace,
            "hage" | "yard" | "backyard" | "lawn" => RoomType::Garden,
            "fasade" | "facade" | "outside" | "house_exterior" | "eksteriør" => RoomType::Exterior,
            "utsikt" | "scenery" | "surroundings" | "omgivelser" | "nabolag" => RoomType::View,
            "carport" | "parkering" | "parking" => RoomType::Garage,
            "plantegning" | "floorplan" | "plan" | "plan_drawing" => RoomType::FloorPlan,
            _ => RoomType::Other,
        }
    }
}

/// Marketing audience that conditions the tone of generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetGroup {
    #[default]
    Standard,
    Family,
    FirstTimeBuyer,
    Investor,
    Senior,
}

impl TargetGroup {
    pub const ALL: [TargetGroup; 5] = [
        TargetGroup::Standard,
        TargetGroup::Family,
        TargetGroup::FirstTimeBuyer,
        TargetGroup::Investor,
        TargetGroup::Senior,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetGroup::Standard => "standard",
            TargetGroup::Family => "family",
            TargetGroup::FirstTimeBuyer => "first_time_buyer",
            TargetGroup::Investor => "investor",
            TargetGroup::Senior => "senior",
        }
    }
}

/// Broad property category for the whole listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Apartment,
    DetachedHouse,
    SemiDetached,
    Townhouse,
    Cabin,
    Farm,
    Plot,
    Other,
}

impl PropertyType {
    pub fn label(&self) -> &'static str {
        match self {
            PropertyType::Apartment => "Leilighet",
            PropertyType::DetachedHouse => "Enebolig",
            PropertyType::SemiDetached => "Tomannsbolig",
            PropertyType::Townhouse => "Rekkehus",
            PropertyType::Cabin => "Hytte",
            PropertyType::Farm => "Gårdsbruk",
            PropertyType::Plot => "Tomt",
            PropertyType::Other => "Annet",
        }
    }

    pub fn parse(s: &str) -> PropertyType {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "apartment" | "leilighet" | "flat" | "condo" | "selveierleilighet" => {
                PropertyType::Apartment
            }
            "detached_house" | "enebolig" | "house" | "villa" => PropertyType::DetachedHouse,
            "semi_detached" | "tomannsbolig" | "duplex" => PropertyType::SemiDetached,
            "townhouse" | "rekkehus" | "kjedehus" | "terraced_house" => PropertyType::Townhouse,
            "cabin" | "hytte" | "fritidsbolig" | "holiday_home" => PropertyType::Cabin,
            "farm" | "gårdsbruk" | "gardsbruk" | "småbruk" => PropertyType::Farm,
            "plot" | "tomt" | "land" => PropertyType::Plot,
            _ => PropertyType::Other,
        }
    }
}

/// One photo to analyze, optionally with a room type already chosen by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub url: String,
    #[serde(default)]
    pub room_type: Option<RoomType>,
}

/// Per-photo result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub url: String,
    pub room_type: RoomType,
    pub description: String,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImageAnalysis {
    pub fn failed(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            room_type: RoomType::Other,
            description: String::new(),
            cached: false,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyTypeResult {
    pub property_type: PropertyType,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Everything gathered for one listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gallery_url: Option<String>,
    pub target_group: TargetGroup,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<NormalizedAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_m2: Option<f64>,
    pub images: Vec<ImageAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_type: Option<PropertyTypeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intro: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market: Option<MarketData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub competitors: Option<CompetitorData>,
}

impl Analysis {
    pub fn new(gallery_url: Option<String>, target_group: TargetGroup) -> Self {
        Self {
            id: format!("ana_{}", Uuid::new_v4().simple()),
            created_at: now_iso8601(),
            gallery_url,
            target_group,
            raw_address: None,
            address: None,
            area_m2: None,
            images: Vec::new(),
            property_type: None,
            intro: None,
            market: None,
            location: None,
            competitors: None,
        }
    }

    /// Best human-readable address for headings and prompts.
    pub fn display_address(&self) -> Option<String> {
        self.address
            .as_ref()
            .map(|a| a.formatted.clone())
            .filter(|s| !s.is_empty())
            .or_else(|| self.raw_address.clone())
    }
}

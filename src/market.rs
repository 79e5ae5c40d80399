//! Market, location and competitor sections.
//!
//! These are placeholder figures, not lookups against real data sources. The
//! RNG is seeded from the address so a listing always gets the same numbers.

use chrono::{Datelike, NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::address::NormalizedAddress;
use crate::schema::PropertyType;

/// Walking speed used for amenity travel times.
const WALK_METERS_PER_MINUTE: u32 = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// `YYYY-MM`
    pub month: String,
    pub price_per_m2: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub region: String,
    pub area_m2: f64,
    pub price_per_m2: u32,
    pub estimated_price_low: u64,
    pub estimated_price_high: u64,
    pub trend_12m_percent: f64,
    pub avg_days_on_market: u32,
    pub price_history: Vec<PricePoint>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmenityKind {
    School,
    Kindergarten,
    Grocery,
    PublicTransport,
    Pharmacy,
    Park,
    Gym,
    Doctor,
}

impl AmenityKind {
    const ALL: [AmenityKind; 8] = [
        AmenityKind::School,
        AmenityKind::Kindergarten,
        AmenityKind::Grocery,
        AmenityKind::PublicTransport,
        AmenityKind::Pharmacy,
        AmenityKind::Park,
        AmenityKind::Gym,
        AmenityKind::Doctor,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            AmenityKind::School => "Skole",
            AmenityKind::Kindergarten => "Barnehage",
            AmenityKind::Grocery => "Dagligvare",
            AmenityKind::PublicTransport => "Kollektivtransport",
            AmenityKind::Pharmacy => "Apotek",
            AmenityKind::Park => "Park/friområde",
            AmenityKind::Gym => "Treningssenter",
            AmenityKind::Doctor => "Lege",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amenity {
    pub kind: AmenityKind,
    pub name: String,
    pub distance_m: u32,
    pub walk_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationData {
    pub amenities: Vec<Amenity>,
    /// 0-100, higher is more walkable.
    pub walk_score: u8,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competitor {
    pub address: String,
    pub property_type: PropertyType,
    pub area_m2: f64,
    pub asking_price: u64,
    pub price_per_m2: u32,
    pub days_listed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorData {
    pub listings: Vec<Competitor>,
    pub average_price_per_m2: u32,
    /// "under", "over" or "på nivå med" the competitors.
    pub subject_position: String,
    pub summary: String,
}

/// What the generators need to know about the listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketInput {
    #[serde(default)]
    pub address: Option<NormalizedAddress>,
    /// Used as the seed when no normalized address is available.
    #[serde(default)]
    pub raw_address: Option<String>,
    #[serde(default)]
    pub property_type: Option<PropertyType>,
    #[serde(default)]
    pub area_m2: Option<f64>,
}

impl MarketInput {
    fn seed_key(&self) -> String {
        self.address
            .as_ref()
            .map(|a| a.formatted.clone())
            .filter(|s| !s.is_empty())
            .or_else(|| self.raw_address.clone())
            .unwrap_or_default()
            .to_lowercase()
    }

    fn postal_code(&self) -> Option<&str> {
        self.address.as_ref().and_then(|a| a.postal_code.as_deref())
    }

    fn city(&self) -> Option<&str> {
        self.address.as_ref().and_then(|a| a.city.as_deref())
    }

    fn property_type(&self) -> PropertyType {
        self.property_type.unwrap_or(PropertyType::Other)
    }

    fn area(&self) -> f64 {
        self.area_m2
            .filter(|a| *a > 0.0)
            .unwrap_or_else(|| default_area(self.property_type()))
    }
}

pub fn market_data(input: &MarketInput) -> MarketData {
    market_data_at(input, Utc::now().date_naive())
}

/// Market section relative to `today` (the last price point is today's month).
pub fn market_data_at(input: &MarketInput, today: NaiveDate) -> MarketData {
    let mut rng = seeded_rng("market", &input.seed_key());
    let (region, baseline) = region_baseline(input.postal_code());
    let area = input.area();

    let price_per_m2 = subject_price_per_m2(input);
    let estimate = area * price_per_m2 as f64;
    let estimated_price_low = round_to(estimate * 0.93, 10_000.0) as u64;
    let estimated_price_high = round_to(estimate * 1.07, 10_000.0) as u64;

    let trend_12m_percent = (rng.gen_range(-3.0..8.0_f64) * 10.0).round() / 10.0;
    let avg_days_on_market = rng.gen_range(10..60);

    // Walk backwards from today's price along the yearly trend.
    let monthly = trend_12m_percent / 100.0 / 12.0;
    let mut price_history = Vec::with_capacity(6);
    let mut price = price_per_m2 as f64;
    for months_back in 0..6 {
        price_history.push(PricePoint {
            month: month_label(today, months_back),
            price_per_m2: round_to(price, 100.0) as u32,
        });
        let noise = rng.gen_range(-0.004..0.004);
        price /= 1.0 + monthly + noise;
    }
    price_history.reverse();

    let direction = if trend_12m_percent >= 0.0 { "steget" } else { "falt" };
    let summary = format!(
        "Estimert kvadratmeterpris for {} i {} er {} kr/m² (regionsnitt {} kr/m²). Prisene har {} {:.1} % siste 12 måneder, og tilsvarende boliger ligger i snitt {} dager ute før salg. Antatt verdi for {:.0} m² er {} - {} kr.",
        input.property_type().label().to_lowercase(),
        region,
        format_nok(price_per_m2 as u64),
        format_nok(baseline as u64),
        direction,
        trend_12m_percent.abs(),
        avg_days_on_market,
        area,
        format_nok(estimated_price_low),
        format_nok(estimated_price_high),
    );

    MarketData {
        region: region.to_string(),
        area_m2: area,
        price_per_m2,
        estimated_price_low,
        estimated_price_high,
        trend_12m_percent,
        avg_days_on_market,
        price_history,
        summary,
    }
}

pub fn location_data(input: &MarketInput) -> LocationData {
    let mut rng = seeded_rng("location", &input.seed_key());
    let place = input.city().unwrap_or("Nærområdet");

    let mut kinds = AmenityKind::ALL.to_vec();
    kinds.shuffle(&mut rng);
    let count = rng.gen_range(5..=8);

    let mut amenities: Vec<Amenity> = kinds
        .into_iter()
        .take(count)
        .map(|kind| {
            let distance_m = round_to(rng.gen_range(150.0..2500.0), 10.0) as u32;
            Amenity {
                kind,
                name: amenity_name(kind, place, &mut rng),
                distance_m,
                walk_minutes: distance_m.div_ceil(WALK_METERS_PER_MINUTE),
            }
        })
        .collect();
    amenities.sort_by_key(|a| a.distance_m);

    let avg_distance =
        amenities.iter().map(|a| a.distance_m).sum::<u32>() / amenities.len().max(1) as u32;
    let walk_score = (100 - (avg_distance / 30).min(100) as i32).clamp(0, 100) as u8;

    let closest = amenities
        .iter()
        .take(3)
        .map(|a| format!("{} ({} min)", a.kind.label().to_lowercase(), a.walk_minutes))
        .collect::<Vec<_>>()
        .join(", ");
    let summary = format!(
        "Boligen ligger {} med gangavstand til {}. Gåvennlighet: {}/100.",
        if walk_score >= 60 { "sentralt" } else { "rolig til" },
        closest,
        walk_score
    );

    LocationData {
        amenities,
        walk_score,
        summary,
    }
}

pub fn competitor_data(input: &MarketInput) -> CompetitorData {
    let mut rng = seeded_rng("competitors", &input.seed_key());
    let subject_ppm = subject_price_per_m2(input) as f64;
    let area = input.area();
    let property_type = input.property_type();

    let mut streets = COMPETITOR_STREETS.to_vec();
    streets.shuffle(&mut rng);
    let count = rng.gen_range(3..=5);

    let postal_part = match (input.postal_code(), input.city()) {
        (Some(postal), Some(city)) => format!(", {} {}", postal, city),
        (None, Some(city)) => format!(", {}", city),
        _ => String::new(),
    };

    let listings: Vec<Competitor> = streets
        .into_iter()
        .take(count)
        .map(|street| {
            let competitor_area = (area * rng.gen_range(0.8..1.2)).round();
            let price_per_m2 = round_to(subject_ppm * rng.gen_range(0.88..1.12), 100.0) as u32;
            Competitor {
                address: format!("{} {}{}", street, rng.gen_range(1..60), postal_part),
                property_type,
                area_m2: competitor_area,
                asking_price: round_to(competitor_area * price_per_m2 as f64, 10_000.0) as u64,
                price_per_m2,
                days_listed: rng.gen_range(5..90),
            }
        })
        .collect();

    let average_price_per_m2 =
        (listings.iter().map(|c| c.price_per_m2 as u64).sum::<u64>() / listings.len() as u64) as u32;

    let ratio = subject_ppm / average_price_per_m2 as f64;
    let subject_position = if ratio < 0.97 {
        "under"
    } else if ratio > 1.03 {
        "over"
    } else {
        "på nivå med"
    };

    let summary = format!(
        "Vi har funnet {} sammenlignbare boliger i området med snittpris {} kr/m². Denne boligen er priset {} konkurrentene.",
        listings.len(),
        format_nok(average_price_per_m2 as u64),
        subject_position
    );

    CompetitorData {
        listings,
        average_price_per_m2,
        subject_position: subject_position.to_string(),
        summary,
    }
}

const COMPETITOR_STREETS: &[&str] = &[
    "Storgata",
    "Kirkeveien",
    "Skolegata",
    "Parkveien",
    "Bjørkeveien",
    "Solbakken",
    "Granåsen",
    "Løvenskiolds gate",
    "Eikelia",
    "Furulund",
];

/// Price per m² for the listing itself, shared by market and competitor sections.
fn subject_price_per_m2(input: &MarketInput) -> u32 {
    let mut rng = seeded_rng("subject", &input.seed_key());
    let (_, baseline) = region_baseline(input.postal_code());
    let factor = type_factor(input.property_type());
    round_to(baseline as f64 * factor * rng.gen_range(0.9..1.1), 100.0) as u32
}

fn seeded_rng(salt: &str, key: &str) -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    StdRng::seed_from_u64(u64::from_le_bytes(seed))
}

/// Regional average price per m² by postal-code prefix.
fn region_baseline(postal_code: Option<&str>) -> (&'static str, u32) {
    match postal_code {
        Some(p) if p.starts_with('0') => ("Oslo", 92_000),
        Some(p) if p.starts_with("13") => ("Bærum", 75_000),
        Some(p) if p.starts_with("40") || p.starts_with("41") => ("Stavanger", 52_000),
        Some(p) if p.starts_with('5') => ("Bergen", 55_000),
        Some(p) if p.starts_with("70") || p.starts_with("71") => ("Trondheim", 54_000),
        _ => ("Norge", 42_000),
    }
}

fn type_factor(property_type: PropertyType) -> f64 {
    match property_type {
        PropertyType::Apartment => 1.0,
        PropertyType::DetachedHouse => 0.85,
        PropertyType::SemiDetached => 0.88,
        PropertyType::Townhouse => 0.9,
        PropertyType::Cabin => 0.7,
        PropertyType::Farm => 0.5,
        PropertyType::Plot => 0.3,
        PropertyType::Other => 0.9,
    }
}

fn default_area(property_type: PropertyType) -> f64 {
    match property_type {
        PropertyType::Apartment => 70.0,
        PropertyType::DetachedHouse => 160.0,
        PropertyType::SemiDetached => 130.0,
        PropertyType::Townhouse => 110.0,
        PropertyType::Cabin => 80.0,
        PropertyType::Farm => 200.0,
        PropertyType::Plot => 800.0,
        PropertyType::Other => 90.0,
    }
}

fn amenity_name(kind: AmenityKind, place: &str, rng: &mut StdRng) -> String {
    let pick = |options: &[&str], rng: &mut StdRng| {
        options
            .choose(rng)
            .map(|s| s.to_string())
            .unwrap_or_default()
    };
    match kind {
        AmenityKind::School => format!("{} skole", place),
        AmenityKind::Kindergarten => format!("{} barnehage", place),
        AmenityKind::Grocery => pick(&["Rema 1000", "Kiwi", "Coop Extra", "Meny", "Joker"], rng),
        AmenityKind::PublicTransport => pick(
            &["Bussholdeplass", "Trikkeholdeplass", "T-banestasjon", "Togstasjon"],
            rng,
        ),
        AmenityKind::Pharmacy => pick(&["Apotek 1", "Vitusapotek", "Boots apotek"], rng),
        AmenityKind::Park => format!("{} park", place),
        AmenityKind::Gym => pick(&["SATS", "EVO", "Fresh Fitness", "3T"], rng),
        AmenityKind::Doctor => format!("{} legesenter", place),
    }
}

fn month_label(today: NaiveDate, months_back: u32) -> String {
    let total = today.year() * 12 + today.month0() as i32 - months_back as i32;
    format!("{:04}-{:02}", total.div_euclid(12), total.rem_euclid(12) + 1)
}

fn round_to(value: f64, step: f64) -> f64 {
    (value / step).round() * step
}

/// Norwegian thousands grouping: 4500000 -> "4 500 000".
pub fn format_nok(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

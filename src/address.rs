//! Address cleanup for scraped listing titles.
//!
//! Pure functions, no async. Each hosting platform has a chain of regex
//! substitutions that strip its branding; what remains goes through a generic
//! Norwegian street / postal-code parser and gets a 0-100 confidence score.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gallery::Platform;

/// Result of address normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAddress {
    pub raw: String,
    pub cleaned: String,
    pub street: Option<String>,
    pub house_number: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub formatted: String,
    pub confidence: u8,
    pub platform: Platform,
}

/// A single substitution step in a platform cleanup chain.
struct Rule {
    regex: Regex,
    replacement: &'static str,
}

fn rule(pattern: &str, replacement: &'static str) -> Rule {
    Rule {
        regex: Regex::new(pattern).expect("static address pattern"),
        replacement,
    }
}

static PHOLIO_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"(?i)\s*[|\-–—]\s*pholio(?:\.no)?\s*$", ""),
        rule(r"(?i)^\s*pholio(?:\.no)?\s*[|\-–—:]\s*", ""),
        rule(r"(?i)^\s*(?:bildegalleri|galleri|bilder)(?:\s+(?:fra|av|for))?\s*[:|\-–—]?\s*", ""),
    ]
});

static NOTAR_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"(?i)\s*[|\-–—]\s*notar(?:\s+eiendom)?(?:\.no)?\s*$", ""),
        rule(r"(?i)^\s*notar(?:\s+eiendom)?(?:\.no)?\s*[|\-–—:]\s*", ""),
        rule(r"(?i)^\s*til\s+salgs\s*[:|\-–—]?\s*", ""),
    ]
});

static FINN_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"(?i)\s*[|\-–—]\s*finn(?:\.no)?(?:\s+eiendom)?\s*$", ""),
        rule(r"(?i)^\s*finn(?:\.no)?(?:\s+eiendom)?\s*[|\-–—:]\s*", ""),
        rule(r"(?i)\s*[|\-–—,]?\s*finnkode:?\s*\d+", ""),
        rule(r"(?i)^\s*bolig\s+til\s+salgs\s*[:|\-–—]?\s*", ""),
    ]
});

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static pattern"));

static POSTAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?P<postal>\d{4})\s+(?P<city>\p{L}[\p{L}\-]*(?:\s+(?:i\s+)?\p{Lu}[\p{L}\-]*)*)")
        .expect("static pattern")
});

// "12B" and "12 B" carry a letter; a spaced lowercase letter is the next word ("12 i Oslo").
static STREET_NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<street>[\p{L}.'\-]+)\s+(?P<number>\d{1,4}(?:[A-Za-z]|\s[A-Z])?)\b")
        .expect("static pattern")
});

static STREET_ONLY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b\p{L}+(?:gata|gate|veien|vei|vegen|veg|allé|alle|plass)\b")
        .expect("static pattern")
});

static DIGIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d").expect("static pattern"));

const STREET_SUFFIXES: &[&str] = &[
    "gata", "gate", "veien", "vei", "vegen", "veg", "allé", "alle", "plass", "bakken", "stien",
    "sti", "lia", "torget", "torg", "brygge", "kaia", "haugen", "åsen", "tunet", "ringen",
    "svingen", "jordet", "løkka", "berget", "dalen", "toppen", "terrassen", "kroken", "lunden",
    "moen", "holmen", "vika", "grenda", "skogen", "marka", "bråten", "hagen", "vollen", "myra",
    "parken", "tun",
];

const NOISE_WORDS: &[&str] = &["bilder", "galleri", "visning", "finnkode", "solgt", "til salgs"];

const STOP_WORDS: &[&str] = &[
    "solgt", "selges", "nyhet", "bilder", "galleri", "visning", "til", "salgs", "flott", "pen",
    "lekker", "velkommen", "leilighet", "enebolig", "rekkehus", "hytte", "tomannsbolig",
    "prisantydning", "pris", "totalpris", "fellesgjeld", "kr", "kvm", "m",
];

/// Strip platform branding, then parse the remaining text as a Norwegian address.
pub fn normalize(raw: &str, platform: Platform) -> NormalizedAddress {
    let (stripped, platform_rule_applied) = apply_platform_rules(raw, platform);
    let cleaned = tidy(&stripped);

    if cleaned.is_empty() {
        return NormalizedAddress {
            raw: raw.to_string(),
            cleaned,
            street: None,
            house_number: None,
            postal_code: None,
            city: None,
            formatted: String::new(),
            confidence: 0,
            platform,
        };
    }

    let parsed = parse_norwegian(&cleaned);
    let confidence = score(&cleaned, &parsed, platform_rule_applied);
    let formatted = format_address(&parsed);

    debug!(
        "Normalized address '{}' -> '{}' (confidence {})",
        raw, formatted, confidence
    );

    NormalizedAddress {
        raw: raw.to_string(),
        cleaned,
        street: parsed.street,
        house_number: parsed.house_number,
        postal_code: parsed.postal_code,
        city: parsed.city,
        formatted,
        confidence,
        platform,
    }
}

fn apply_platform_rules(raw: &str, platform: Platform) -> (String, bool) {
    let rules: &[Rule] = match platform {
        Platform::Pholio => &PHOLIO_RULES,
        Platform::Notar => &NOTAR_RULES,
        Platform::Finn => &FINN_RULES,
        Platform::Generic => &[],
    };

    let mut text = WHITESPACE_RE.replace_all(raw, " ").into_owned();
    let mut changed = false;
    for rule in rules {
        let next = rule.regex.replace_all(&text, rule.replacement).into_owned();
        if next != text {
            changed = true;
            text = next;
        }
    }
    (text, changed)
}

fn tidy(text: &str) -> String {
    WHITESPACE_RE
        .replace_all(text, " ")
        .trim_matches(|c: char| c.is_whitespace() || "|-–—:,.;".contains(c))
        .to_string()
}

#[derive(Debug, Default)]
struct ParsedAddress {
    street: Option<String>,
    house_number: Option<String>,
    postal_code: Option<String>,
    city: Option<String>,
    /// Byte ranges of `cleaned` consumed as house number or postal code.
    consumed: Vec<(usize, usize)>,
}

fn parse_norwegian(cleaned: &str) -> ParsedAddress {
    let mut parsed = ParsedAddress::default();

    // Addresses end with "NNNN Place", so the last postal match wins. A match
    // whose place is only stop words ("4500 kr") is not a postal code.
    let postal = POSTAL_RE
        .captures_iter(cleaned)
        .filter_map(|caps| {
            let city = clean_city(&caps["city"])?;
            Some((caps, city))
        })
        .last();
    let street_search_end = match postal {
        Some((caps, city)) => {
            let m = caps.name("postal").expect("postal group");
            parsed.postal_code = Some(m.as_str().to_string());
            parsed.city = Some(city);
            parsed.consumed.push((m.start(), m.end()));
            m.start()
        }
        None => cleaned.len(),
    };

    let head = &cleaned[..street_search_end];
    if let Some((street_start, number_match)) = find_street_number(head) {
        let street = expand_street(head, street_start, number_match.start());
        parsed.street = Some(street);
        parsed.house_number = Some(
            number_match
                .as_str()
                .split_whitespace()
                .collect::<String>()
                .to_uppercase(),
        );
        parsed
            .consumed
            .push((number_match.start(), number_match.end()));
    } else if let Some(m) = STREET_ONLY_RE.find(head) {
        parsed.street = Some(m.as_str().to_string());
    }

    parsed
}

/// Pick the best "Street 12" candidate. Candidates whose street token ends in a
/// known suffix win; otherwise the first capitalized one not followed by `-`
/// (which would be "3-roms" and the like).
fn find_street_number(head: &str) -> Option<(usize, regex::Match<'_>)> {
    let mut fallback = None;

    for caps in STREET_NUMBER_RE.captures_iter(head) {
        let street = caps.name("street").expect("street group");
        let number = caps.name("number").expect("number group");

        if head[number.end()..].starts_with('-') {
            continue;
        }

        let token = street.as_str().to_lowercase();
        if STOP_WORDS.contains(&token.as_str()) {
            continue;
        }
        if STREET_SUFFIXES.iter().any(|s| token.ends_with(s)) {
            return Some((street.start(), number));
        }
        let capitalized = street
            .as_str()
            .chars()
            .next()
            .map(|c| c.is_uppercase())
            .unwrap_or(false);
        if capitalized && fallback.is_none() {
            fallback = Some((street.start(), number));
        }
    }

    fallback
}

/// Walk backwards from the matched street token, pulling in preceding
/// capitalized words ("Kong Oscars gate").
fn expand_street(head: &str, street_start: usize, number_start: usize) -> String {
    let mut words: Vec<&str> = vec![head[street_start..number_start].trim()];

    for token in head[..street_start].split_whitespace().rev().take(3) {
        if token.ends_with([',', ':', '|', ';']) || token.chars().all(|c| "-–—|".contains(c)) {
            break;
        }
        let starts_upper = token.chars().next().map(|c| c.is_uppercase()).unwrap_or(false);
        if !starts_upper || STOP_WORDS.contains(&token.to_lowercase().as_str()) {
            break;
        }
        words.push(token);
    }

    words.reverse();
    words.join(" ")
}

fn clean_city(raw: &str) -> Option<String> {
    let words: Vec<String> = raw
        .split_whitespace()
        .take_while(|w| !STOP_WORDS.contains(&w.to_lowercase().as_str()))
        .take(3)
        .map(title_case)
        .collect();

    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

/// "OSLO" -> "Oslo", "oslo" -> "Oslo", "MO I RANA" -> "Mo i Rana".
/// Mixed-case words are kept.
fn title_case(word: &str) -> String {
    let lower = word.to_lowercase();
    if lower == "i" {
        return lower;
    }
    if word.chars().any(|c| c.is_lowercase()) && word.chars().any(|c| c.is_uppercase()) {
        return word.to_string();
    }
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn score(cleaned: &str, parsed: &ParsedAddress, platform_rule_applied: bool) -> u8 {
    let mut score: i32 = 0;

    match (&parsed.street, &parsed.house_number) {
        (Some(_), Some(_)) => score += 40,
        (Some(_), None) => score += 10,
        _ => {}
    }
    if parsed.postal_code.is_some() {
        score += 30;
    }
    if parsed.city.is_some() {
        score += 20;
    }
    if platform_rule_applied {
        score += 10;
    }

    let lower = cleaned.to_lowercase();
    if NOISE_WORDS.iter().any(|w| lower.contains(w)) {
        score -= 20;
    }
    if cleaned.chars().count() > 80 {
        score -= 10;
    }
    if has_unconsumed_digits(cleaned, &parsed.consumed) {
        score -= 15;
    }

    score.clamp(0, 100) as u8
}

fn has_unconsumed_digits(cleaned: &str, consumed: &[(usize, usize)]) -> bool {
    DIGIT_RE
        .find_iter(cleaned)
        .any(|m| !consumed.iter().any(|(s, e)| m.start() >= *s && m.end() <= *e))
}

fn format_address(parsed: &ParsedAddress) -> String {
    let street_part = match (&parsed.street, &parsed.house_number) {
        (Some(street), Some(number)) => Some(format!("{} {}", street, number)),
        (Some(street), None) => Some(street.clone()),
        _ => None,
    };
    let postal_part = match (&parsed.postal_code, &parsed.city) {
        (Some(postal), Some(city)) => Some(format!("{} {}", postal, city)),
        (Some(postal), None) => Some(postal.clone()),
        (None, Some(city)) => Some(city.clone()),
        (None, None) => None,
    };

    [street_part, postal_part]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finn_title() {
        let addr = normalize("Storgata 12B, 0155 Oslo | FINN eiendom", Platform::Finn);
        assert_eq!(addr.street.as_deref(), Some("Storgata"));
        assert_eq!(addr.house_number.as_deref(), Some("12B"));
        assert_eq!(addr.postal_code.as_deref(), Some("0155"));
        assert_eq!(addr.city.as_deref(), Some("Oslo"));
        assert_eq!(addr.formatted, "Storgata 12B, 0155 Oslo");
        assert_eq!(addr.confidence, 100);
    }

    #[test]
    fn test_finn_code_removed() {
        let addr = normalize("Bolig til salgs: Fjordveien 3, 1363 Høvik Finnkode: 123456789", Platform::Finn);
        assert_eq!(addr.cleaned, "Fjordveien 3, 1363 Høvik");
        assert_eq!(addr.formatted, "Fjordveien 3, 1363 Høvik");
        assert_eq!(addr.confidence, 100);
    }

    #[test]
    fn test_pholio_multiword_street() {
        let addr = normalize(
            "Bildegalleri - Kong Oscars gate 5, 5017 BERGEN - Pholio",
            Platform::Pholio,
        );
        assert_eq!(addr.street.as_deref(), Some("Kong Oscars gate"));
        assert_eq!(addr.house_number.as_deref(), Some("5"));
        assert_eq!(addr.city.as_deref(), Some("Bergen"));
        assert_eq!(addr.formatted, "Kong Oscars gate 5, 5017 Bergen");
        assert_eq!(addr.confidence, 100);
    }

    #[test]
    fn test_notar_branding() {
        let addr = normalize("Notar Eiendom - Til salgs: Eplehagen 3 1360 Fornebu", Platform::Notar);
        assert_eq!(addr.street.as_deref(), Some("Eplehagen"));
        assert_eq!(addr.postal_code.as_deref(), Some("1360"));
        assert_eq!(addr.formatted, "Eplehagen 3, 1360 Fornebu");
    }

    #[test]
    fn test_generic_with_listing_noise() {
        let addr = normalize("Flott 3-roms leilighet i Storgata 12, 0155 Oslo", Platform::Generic);
        assert_eq!(addr.street.as_deref(), Some("Storgata"));
        assert_eq!(addr.house_number.as_deref(), Some("12"));
        // leftover "3" costs 15 points, no platform bonus
        assert_eq!(addr.confidence, 75);
    }

    #[test]
    fn test_postal_only() {
        let addr = normalize("0155 Oslo", Platform::Generic);
        assert_eq!(addr.street, None);
        assert_eq!(addr.formatted, "0155 Oslo");
        assert_eq!(addr.confidence, 50);
    }

    #[test]
    fn test_street_without_number() {
        let addr = normalize("Leilighet på Frognerveien", Platform::Generic);
        assert_eq!(addr.street.as_deref(), Some("Frognerveien"));
        assert!(addr.house_number.is_none());
        assert_eq!(addr.formatted, "Frognerveien");
        assert_eq!(addr.confidence, 10);
    }

    #[test]
    fn test_noise_penalty() {
        let addr = normalize("Bilder fra visning Storgata 12, 0155 Oslo", Platform::Generic);
        assert_eq!(addr.formatted, "Storgata 12, 0155 Oslo");
        assert_eq!(addr.confidence, 70);
    }

    #[test]
    fn test_empty_input() {
        let addr = normalize("  |  ", Platform::Finn);
        assert_eq!(addr.confidence, 0);
        assert!(addr.formatted.is_empty());
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("OSLO"), "Oslo");
        assert_eq!(title_case("I"), "i");
        assert_eq!(title_case("Ålesund"), "Ålesund");
        assert_eq!(title_case("oslo"), "Oslo");
        assert_eq!(title_case("ålesund"), "Ålesund");
    }

    #[test]
    fn test_lowercase_i_is_not_a_house_letter() {
        let addr = normalize("Storgata 12 i Oslo", Platform::Generic);
        assert_eq!(addr.street.as_deref(), Some("Storgata"));
        assert_eq!(addr.house_number.as_deref(), Some("12"));
        assert_eq!(addr.formatted, "Storgata 12");

        let spaced = normalize("Storgata 12 B, 0155 Oslo", Platform::Generic);
        assert_eq!(spaced.house_number.as_deref(), Some("12B"));
    }

    #[test]
    fn test_lowercase_city() {
        let addr = normalize("Storgata 12, 0155 oslo", Platform::Generic);
        assert_eq!(addr.postal_code.as_deref(), Some("0155"));
        assert_eq!(addr.city.as_deref(), Some("Oslo"));
        assert_eq!(addr.formatted, "Storgata 12, 0155 Oslo");
        assert_eq!(addr.confidence, 90);
    }

    #[test]
    fn test_price_is_not_a_postal_code() {
        let addr = normalize("Storgata 12, 0155 Oslo, 4500 kr", Platform::Generic);
        assert_eq!(addr.postal_code.as_deref(), Some("0155"));
        assert_eq!(addr.city.as_deref(), Some("Oslo"));
    }

    #[test]
    fn test_long_text_penalty() {
        let short = normalize("Storgata 12, 0155 Oslo", Platform::Generic);
        let long_input =
            "Lys og romslig selveierleilighet med vestvendt balkong og utsikt over fjorden, Storgata 12, 0155 Oslo";
        assert!(long_input.chars().count() > 80);
        let long = normalize(long_input, Platform::Generic);
        assert_eq!(long.formatted, "Storgata 12, 0155 Oslo");
        assert_eq!(short.confidence, 90);
        assert_eq!(long.confidence, 80);
    }

    #[test]
    fn test_pholio_gallery_prefixes() {
        let galleri = normalize("Galleri: Storgata 12, 0155 Oslo", Platform::Pholio);
        assert_eq!(galleri.cleaned, "Storgata 12, 0155 Oslo");
        assert_eq!(galleri.confidence, 100);

        let bilder = normalize("Bilder fra Fjordveien 3, 1363 Høvik", Platform::Pholio);
        assert_eq!(bilder.cleaned, "Fjordveien 3, 1363 Høvik");
        assert_eq!(bilder.formatted, "Fjordveien 3, 1363 Høvik");
        assert_eq!(bilder.confidence, 100);
    }
}

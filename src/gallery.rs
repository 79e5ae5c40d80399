//! Gallery page scraping: image URLs and the raw address string.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};
use url::Url;

/// Listing host, used to pick address cleanup rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Pholio,
    Notar,
    Finn,
    #[default]
    Generic,
}

impl Platform {
    pub fn detect(page_url: &str) -> Platform {
        let host = Url::parse(page_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_else(|| {
                let lower = page_url.to_lowercase();
                lower.split('/').next().unwrap_or_default().to_string()
            });

        if host_matches(&host, "pholio.no") {
            Platform::Pholio
        } else if host_matches(&host, "notar.no") {
            Platform::Notar
        } else if host_matches(&host, "finn.no") {
            Platform::Finn
        } else {
            Platform::Generic
        }
    }
}

/// `host` is `domain` itself or one of its subdomains.
fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .map(|rest| rest.ends_with('.'))
            .unwrap_or(false)
}

/// Scraped gallery page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gallery {
    pub source_url: String,
    pub platform: Platform,
    pub images: Vec<String>,
    pub raw_address: Option<String>,
}

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".avif"];

const REJECT_MARKERS: &[&str] = &[
    "logo", "icon", "sprite", "favicon", "pixel", "tracking", "avatar", "placeholder", "spinner",
    "badge",
];

static INLINE_IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)https?://[^\s"'<>\\]+?\.(?:jpe?g|png|webp|avif)(?:\?[^\s"'<>\\]*)?"#)
        .expect("static pattern")
});

/// Fetch a gallery page and extract its images and address.
pub async fn fetch_gallery(client: &Client, page_url: &str) -> Result<Gallery> {
    info!("Fetching gallery: {}", page_url);

    let response = client
        .get(page_url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch gallery page {}", page_url))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("Gallery page returned {} for {}", status, page_url);
    }

    let final_url = response.url().to_string();
    let html = response
        .text()
        .await
        .context("Failed to read gallery page body")?;

    let gallery = parse_gallery(&html, &final_url)?;
    info!(
        "Gallery {} ({:?}): {} images, address={:?}",
        page_url,
        gallery.platform,
        gallery.images.len(),
        gallery.raw_address
    );
    Ok(gallery)
}

/// Parse gallery HTML. `page_url` is used to resolve relative links.
pub fn parse_gallery(html: &str, page_url: &str) -> Result<Gallery> {
    let base = Url::parse(page_url).with_context(|| format!("Invalid page URL: {}", page_url))?;
    let doc = Html::parse_document(html);

    let mut collector = ImageCollector::new(&base);

    for el in doc.select(&selector(r#"meta[property="og:image"]"#)) {
        collector.push(el.value().attr("content"), true);
    }

    for el in doc.select(&selector("img, source")) {
        for attr in ["data-src", "data-lazy-src", "data-original", "src"] {
            collector.push(el.value().attr(attr), true);
        }
        for attr in ["srcset", "data-srcset"] {
            if let Some(srcset) = el.value().attr(attr) {
                collector.push(largest_srcset_candidate(srcset).as_deref(), true);
            }
        }
    }

    for el in doc.select(&selector("a[href]")) {
        collector.push(el.value().attr("href"), false);
    }

    // Galleries rendered client-side keep their image list in inline JSON.
    for el in doc.select(&selector("script")) {
        let text = el.text().collect::<String>().replace("\\/", "/");
        for m in INLINE_IMAGE_RE.find_iter(&text) {
            collector.push(Some(m.as_str()), false);
        }
    }

    let raw_address = extract_raw_address(&doc);

    debug!(
        "Parsed gallery {}: {} images, {} rejected",
        page_url,
        collector.images.len(),
        collector.rejected
    );

    Ok(Gallery {
        source_url: page_url.to_string(),
        platform: Platform::detect(page_url),
        images: collector.images,
        raw_address,
    })
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

struct ImageCollector<'a> {
    base: &'a Url,
    seen: HashSet<String>,
    images: Vec<String>,
    rejected: usize,
}

impl<'a> ImageCollector<'a> {
    fn new(base: &'a Url) -> Self {
        Self {
            base,
            seen: HashSet::new(),
            images: Vec::new(),
            rejected: 0,
        }
    }

    /// `from_image_tag` relaxes the extension requirement: an `<img>` is an
    /// image even when the CDN path has no extension.
    fn push(&mut self, candidate: Option<&str>, from_image_tag: bool) {
        let Some(candidate) = candidate.map(str::trim).filter(|c| !c.is_empty()) else {
            return;
        };
        if candidate.starts_with("data:") || candidate.starts_with("javascript:") {
            return;
        }

        let Ok(mut resolved) = self.base.join(candidate) else {
            return;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            return;
        }
        resolved.set_fragment(None);

        let path = resolved.path().to_lowercase();
        let has_image_ext = IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext));
        if !from_image_tag && !has_image_ext {
            return;
        }

        let url = resolved.to_string();
        if is_rejected(&url) {
            self.rejected += 1;
            return;
        }

        if self.seen.insert(url.clone()) {
            self.images.push(url);
        }
    }
}

fn is_rejected(url: &str) -> bool {
    let lower = url.to_lowercase();
    let path = lower.split('?').next().unwrap_or(&lower);
    path.ends_with(".svg")
        || path.ends_with(".gif")
        || path.ends_with(".ico")
        || REJECT_MARKERS.iter().any(|m| path.contains(m))
}

/// Pick the widest entry of a `srcset` attribute.
fn largest_srcset_candidate(srcset: &str) -> Option<String> {
    srcset
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split_whitespace();
            let url = parts.next()?;
            let weight = parts
                .next()
                .and_then(|d| d.trim_end_matches(['w', 'x']).parse::<f64>().ok())
                .unwrap_or(1.0);
            Some((url.to_string(), weight))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(url, _)| url)
}

fn extract_raw_address(doc: &Html) -> Option<String> {
    let meta = |css: &str| {
        doc.select(&selector(css))
            .filter_map(|el| el.value().attr("content"))
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
    };
    let text_of = |css: &str| {
        doc.select(&selector(css))
            .map(element_text)
            .find(|s| !s.is_empty())
    };

    meta(r#"meta[property="og:title"]"#)
        .or_else(|| text_of("h1"))
        .or_else(|| text_of("title"))
        .or_else(|| meta(r#"meta[name="description"]"#))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

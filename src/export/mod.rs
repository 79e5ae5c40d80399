//! Report assembly and document export.
//!
//! An [`Analysis`] is first flattened into a [`Report`] (headings, paragraphs,
//! bullets); the Word and PDF renderers only know about that layout model.

pub mod docx;
pub mod pdf;

use crate::market::format_nok;
use crate::schema::{Analysis, RoomType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Docx,
    Pdf,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "docx" | "word" => Some(Self::Docx),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Docx => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            Self::Pdf => "application/pdf",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Docx => "docx",
            Self::Pdf => "pdf",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Subheading(String),
    Paragraph(String),
    Bullet(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub heading: String,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub title: String,
    pub subtitle: Option<String>,
    pub sections: Vec<Section>,
}

impl Report {
    pub fn from_analysis(analysis: &Analysis) -> Self {
        let title = analysis
            .display_address()
            .unwrap_or_else(|| "Boligpresentasjon".to_string());

        let subtitle = analysis
            .property_type
            .as_ref()
            .map(|p| p.property_type.label().to_string());

        let mut sections = Vec::new();

        if let Some(intro) = analysis.intro.as_ref().filter(|s| !s.trim().is_empty()) {
            sections.push(Section {
                heading: "Innledning".to_string(),
                blocks: paragraphs(intro),
            });
        }

        let rooms = room_blocks(analysis);
        if !rooms.is_empty() {
            sections.push(Section {
                heading: "Rom for rom".to_string(),
                blocks: rooms,
            });
        }

        if let Some(market) = &analysis.market {
            let trend_sign = if market.trend_12m_percent >= 0.0 { "+" } else { "" };
            sections.push(Section {
                heading: "Markedsanalyse".to_string(),
                blocks: vec![
                    Block::Paragraph(market.summary.clone()),
                    Block::Bullet(format!(
                        "Estimert kvadratmeterpris: {} kr/m²",
                        format_nok(market.price_per_m2 as u64)
                    )),
                    Block::Bullet(format!(
                        "Verdiestimat: {} - {} kr",
                        format_nok(market.estimated_price_low),
                        format_nok(market.estimated_price_high)
                    )),
                    Block::Bullet(format!(
                        "Prisutvikling siste 12 mnd: {}{:.1} %",
                        trend_sign, market.trend_12m_percent
                    )),
                    Block::Bullet(format!(
                        "Gjennomsnittlig salgstid: {} dager",
                        market.avg_days_on_market
                    )),
                ],
            });
        }

        if let Some(location) = &analysis.location {
            let mut blocks = vec![Block::Paragraph(location.summary.clone())];
            blocks.extend(location.amenities.iter().map(|a| {
                Block::Bullet(format!(
                    "{}: {} ({} m, {} min gange)",
                    a.kind.label(),
                    a.name,
                    format_nok(a.distance_m as u64),
                    a.walk_minutes
                ))
            }));
            sections.push(Section {
                heading: "Beliggenhet".to_string(),
                blocks,
            });
        }

        if let Some(competitors) = &analysis.competitors {
            let mut blocks = vec![Block::Paragraph(competitors.summary.clone())];
            blocks.extend(competitors.listings.iter().map(|c| {
                Block::Bullet(format!(
                    "{}: {:.0} m², {} kr ({} kr/m²), {} dager på markedet",
                    c.address,
                    c.area_m2,
                    format_nok(c.asking_price),
                    format_nok(c.price_per_m2 as u64),
                    c.days_listed
                ))
            }));
            sections.push(Section {
                heading: "Konkurrerende boliger".to_string(),
                blocks,
            });
        }

        Self {
            title,
            subtitle,
            sections,
        }
    }

    /// File name stem derived from the title.
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .title
            .chars()
            .map(|c| match c {
                'æ' | 'Æ' => "ae".to_string(),
                'ø' | 'Ø' => "o".to_string(),
                'å' | 'Å' => "a".to_string(),
                c if c.is_ascii_alphanumeric() => c.to_ascii_lowercase().to_string(),
                _ => "-".to_string(),
            })
            .collect();

        let collapsed = stem
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        if collapsed.is_empty() {
            "boligpresentasjon".to_string()
        } else {
            collapsed
        }
    }
}

/// Render to bytes in the requested format.
pub fn render(report: &Report, format: ExportFormat) -> anyhow::Result<Vec<u8>> {
    match format {
        ExportFormat::Docx => docx::render_docx(report),
        ExportFormat::Pdf => pdf::render_pdf(report),
    }
}

fn paragraphs(text: &str) -> Vec<Block> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| Block::Paragraph(p.to_string()))
        .collect()
}

/// Successful photos grouped by room type, groups in first-seen order.
fn room_blocks(analysis: &Analysis) -> Vec<Block> {
    let mut order: Vec<RoomType> = Vec::new();
    for image in analysis.images.iter().filter(|i| i.is_ok()) {
        if image.room_type != RoomType::FloorPlan && !order.contains(&image.room_type) {
            order.push(image.room_type);
        }
    }

    let mut blocks = Vec::new();
    for room in order {
        blocks.push(Block::Subheading(room.label().to_string()));
        for image in analysis
            .images
            .iter()
            .filter(|i| i.is_ok() && i.room_type == room)
        {
            blocks.push(Block::Paragraph(image.description.clone()));
        }
    }
    blocks
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::address::normalize;
    use crate::gallery::Platform;
    use crate::market::{competitor_data, location_data, market_data, MarketInput};
    use crate::schema::{ImageAnalysis, PropertyType, PropertyTypeResult, TargetGroup};

    fn image(room_type: RoomType, description: &str) -> ImageAnalysis {
        ImageAnalysis {
            url: format!("https://cdn.example.no/{}.jpg", description.len()),
            room_type,
            description: description.to_string(),
            cached: false,
            error: None,
        }
    }

    /// A fully populated analysis used by the renderer tests too.
    pub(crate) fn sample_analysis() -> Analysis {
        let mut analysis = Analysis::new(Some("https://www.finn.no/ad".into()), TargetGroup::Family);
        analysis.address = Some(normalize("Storgata 12, 0155 Oslo", Platform::Generic));
        analysis.property_type = Some(PropertyTypeResult {
            property_type: PropertyType::Apartment,
            confidence: 0.9,
            reasoning: String::new(),
        });
        analysis.intro = Some("Lys og trivelig leilighet.\n\nKort vei til alt.".to_string());
        analysis.images = vec![
            image(RoomType::Kitchen, "Kjøkken med øy & god plass."),
            image(RoomType::LivingRoom, "Stue med <store> vinduer."),
            image(RoomType::Kitchen, "Spiseplass ved vinduet."),
            image(RoomType::FloorPlan, "Plantegning."),
            ImageAnalysis::failed("https://cdn.example.no/x.jpg", "boom"),
        ];
        let input = MarketInput {
            address: analysis.address.clone(),
            raw_address: None,
            property_type: Some(PropertyType::Apartment),
            area_m2: Some(65.0),
        };
        analysis.market = Some(market_data(&input));
        analysis.location = Some(location_data(&input));
        analysis.competitors = Some(competitor_data(&input));
        analysis
    }

    #[test]
    fn test_report_sections() {
        let report = Report::from_analysis(&sample_analysis());
        assert_eq!(report.title, "Storgata 12, 0155 Oslo");
        assert_eq!(report.subtitle.as_deref(), Some("Leilighet"));

        let headings: Vec<&str> = report.sections.iter().map(|s| s.heading.as_str()).collect();
        assert_eq!(
            headings,
            vec!["Innledning", "Rom for rom", "Markedsanalyse", "Beliggenhet", "Konkurrerende boliger"]
        );
        assert_eq!(report.sections[0].blocks.len(), 2);
    }

    #[test]
    fn test_rooms_grouped_in_first_seen_order() {
        let report = Report::from_analysis(&sample_analysis());
        let rooms = &report.sections[1].blocks;
        assert_eq!(
            rooms,
            &vec![
                Block::Subheading("Kjøkken".to_string()),
                Block::Paragraph("Kjøkken med øy & god plass.".to_string()),
                Block::Paragraph("Spiseplass ved vinduet.".to_string()),
                Block::Subheading("Stue".to_string()),
                Block::Paragraph("Stue med <store> vinduer.".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_analysis_report() {
        let report = Report::from_analysis(&Analysis::new(None, TargetGroup::Standard));
        assert_eq!(report.title, "Boligpresentasjon");
        assert!(report.sections.is_empty());
    }

    #[test]
    fn test_file_stem() {
        let report = Report::from_analysis(&sample_analysis());
        assert_eq!(report.file_stem(), "storgata-12-0155-oslo");

        let mut analysis = Analysis::new(None, TargetGroup::Standard);
        analysis.raw_address = Some("Bjørkeveien 4, Ås".to_string());
        assert_eq!(Report::from_analysis(&analysis).file_stem(), "bjorkeveien-4-as");
    }

    #[test]
    fn test_export_format_parse() {
        assert_eq!(ExportFormat::parse("PDF"), Some(ExportFormat::Pdf));
        assert_eq!(ExportFormat::parse("word"), Some(ExportFormat::Docx));
        assert_eq!(ExportFormat::parse("odt"), None);
    }
}

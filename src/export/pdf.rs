//! A4 PDF rendering with the built-in Helvetica fonts.

use anyhow::{Context, Result};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};

use super::{Block, Report};

const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN: i64 = 56;
const BULLET_INDENT: i64 = 14;

#[derive(Debug, Clone, Copy)]
enum Font {
    Regular,
    Bold,
}

impl Font {
    fn resource(&self) -> &'static str {
        match self {
            Font::Regular => "F1",
            Font::Bold => "F2",
        }
    }
}

/// Text lines laid out top to bottom, broken into pages.
struct Layout {
    pages: Vec<Vec<Operation>>,
    current: Vec<Operation>,
    y: i64,
}

impl Layout {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            current: Vec::new(),
            y: PAGE_HEIGHT - MARGIN,
        }
    }

    fn ensure_room(&mut self, height: i64) {
        if self.y - height < MARGIN {
            self.page_break();
        }
    }

    fn page_break(&mut self) {
        let page = std::mem::take(&mut self.current);
        self.pages.push(page);
        self.y = PAGE_HEIGHT - MARGIN;
    }

    fn line(&mut self, text: &str, font: Font, size: i64, x: i64, prefix: Option<&str>) {
        let leading = size + size / 3 + 1;
        self.ensure_room(leading);
        self.y -= leading;
        if let Some(prefix) = prefix {
            self.show(prefix, font, size, x - BULLET_INDENT);
        }
        self.show(text, font, size, x);
    }

    fn show(&mut self, text: &str, font: Font, size: i64, x: i64) {
        self.current.extend([
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![font.resource().into(), size.into()]),
            Operation::new("Td", vec![x.into(), self.y.into()]),
            Operation::new("Tj", vec![Object::string_literal(to_win_ansi(text))]),
            Operation::new("ET", vec![]),
        ]);
    }

    /// Word-wrapped text. `first_prefix` is drawn before the first line only.
    fn text(&mut self, text: &str, font: Font, size: i64, x: i64, first_prefix: Option<&str>) {
        let width = wrap_width(size, x);
        for (i, line) in wrap(text, width).iter().enumerate() {
            let prefix = if i == 0 { first_prefix } else { None };
            self.line(line, font, size, x, prefix);
        }
    }

    fn gap(&mut self, points: i64) {
        self.y -= points;
    }

    fn finish(mut self) -> Vec<Vec<Operation>> {
        if !self.current.is_empty() || self.pages.is_empty() {
            self.page_break();
        }
        self.pages
    }
}

/// Render the report as a PDF document.
pub fn render_pdf(report: &Report) -> Result<Vec<u8>> {
    let mut layout = Layout::new();

    layout.text(&report.title, Font::Bold, 22, MARGIN, None);
    if let Some(subtitle) = &report.subtitle {
        layout.text(subtitle, Font::Regular, 14, MARGIN, None);
    }
    layout.gap(12);

    for section in &report.sections {
        // Keep a heading together with at least its first lines
        layout.ensure_room(70);
        layout.gap(8);
        layout.text(&section.heading, Font::Bold, 16, MARGIN, None);
        layout.gap(4);

        for block in &section.blocks {
            match block {
                Block::Subheading(text) => {
                    layout.ensure_room(50);
                    layout.gap(4);
                    layout.text(text, Font::Bold, 12, MARGIN, None);
                }
                Block::Paragraph(text) => {
                    layout.text(text, Font::Regular, 11, MARGIN, None);
                    layout.gap(6);
                }
                Block::Bullet(text) => {
                    layout.text(text, Font::Regular, 11, MARGIN + BULLET_INDENT, Some("\u{2022}"));
                    layout.gap(2);
                }
            }
        }
    }

    build_document(layout.finish(), &report.title)
}

fn build_document(pages: Vec<Vec<Operation>>, title: &str) -> Result<Vec<u8>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let regular_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let bold_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => regular_id,
            "F2" => bold_id,
        },
    });

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for operations in pages {
        let content = Content { operations };
        let encoded = content.encode().context("Failed to encode page content")?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id: ObjectId = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    let info_id = doc.add_object(dictionary! {
        "Title" => Object::string_literal(to_win_ansi(title)),
        "Producer" => Object::string_literal("eiendomstekst"),
    });
    doc.trailer.set("Root", catalog_id);
    doc.trailer.set("Info", info_id);
    doc.compress();

    let mut out = Vec::new();
    doc.save_to(&mut out).context("Failed to write PDF")?;
    Ok(out)
}

/// Approximate characters per line; Helvetica averages about half an em.
fn wrap_width(size: i64, x: i64) -> usize {
    let available = PAGE_WIDTH - MARGIN - x;
    ((available * 2) / size).max(10) as usize
}

fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let needed = current.chars().count() + word.chars().count() + usize::from(!current.is_empty());
        if needed > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Encode for the WinAnsiEncoding of the standard fonts. Latin-1 maps
/// directly; unmappable characters become '?'.
pub(crate) fn to_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c {
            '\u{20AC}' => 0x80,
            '\u{2026}' => 0x85,
            '\u{2018}' => 0x91,
            '\u{2019}' => 0x92,
            '\u{201C}' => 0x93,
            '\u{201D}' => 0x94,
            '\u{2022}' => 0x95,
            '\u{2013}' => 0x96,
            '\u{2014}' => 0x97,
            '\u{00A0}' => b' ',
            c if (c as u32) < 0x80 && !c.is_control() => c as u8,
            c if (0xA1..=0xFF).contains(&(c as u32)) => c as u32 as u8,
            _ => b'?',
        })
        .collect()
}

// PDF document renderer

use super::DocumentRenderer;
use crate::errors::GenerationError;
use crate::models::{RenderedDocument, Subject};
use chrono::Utc;
use printpdf::{
    BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference,
};

const MISSING: &str = "N/D";

/// Business info rows shown above the generated body: (label, field name)
const INFO_ROWS: [(&str, &str); 5] = [
    ("Negocio", "negocio"),
    ("Giro", "giro"),
    ("Descripción", "descripcion"),
    ("Contacto", "nombre"),
    ("Teléfono", "telefono"),
];

// A4 portrait
const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const MARGIN: f32 = 20.0;

const TITLE_SIZE: f32 = 18.0;
const BODY_SIZE: f32 = 11.0;
const LINE_HEIGHT: f32 = 6.0;
const PARAGRAPH_GAP: f32 = 3.0;

/// Characters per body line at `BODY_SIZE` Helvetica across the text width
const WRAP_COLUMNS: usize = 88;

/// What goes on the page, independent of how it is drawn
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentLayout {
    pub heading: String,
    pub info: Vec<(String, String)>,
    /// Paragraphs already wrapped into lines
    pub paragraphs: Vec<Vec<String>>,
}

impl DocumentLayout {
    pub fn build(title: &str, subject: &Subject, content: &str) -> Self {
        let field = |name: &str| {
            subject
                .fields
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let heading = match field("negocio") {
            Some(negocio) => format!("{} para {}", title, negocio),
            None => title.to_string(),
        };

        let mut info: Vec<(String, String)> = INFO_ROWS
            .iter()
            .map(|(label, name)| {
                (
                    label.to_string(),
                    field(name).unwrap_or_else(|| MISSING.to_string()),
                )
            })
            .collect();
        info.push((
            "Fecha".to_string(),
            field("fecha").unwrap_or_else(|| Utc::now().format("%d/%m/%Y").to_string()),
        ));

        let paragraphs = paragraphs(content)
            .into_iter()
            .map(|lines| {
                lines
                    .iter()
                    .flat_map(|line| wrap(line, WRAP_COLUMNS))
                    .collect()
            })
            .collect();

        Self {
            heading,
            info,
            paragraphs,
        }
    }
}

/// Renders generated text as an A4 PDF with the business info block on top
#[derive(Debug, Clone)]
pub struct PdfDocumentRenderer {
    title: String,
}

impl PdfDocumentRenderer {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}

impl Default for PdfDocumentRenderer {
    fn default() -> Self {
        Self::new("Estrategia de Marketing")
    }
}

impl DocumentRenderer for PdfDocumentRenderer {
    fn render(&self, subject: &Subject, content: &str) -> Result<RenderedDocument, GenerationError> {
        if content.trim().is_empty() {
            return Err(GenerationError::Rendering(
                "Cannot render an empty document".to_string(),
            ));
        }

        let layout = DocumentLayout::build(&self.title, subject, content);
        let bytes = draw(&layout)?;

        Ok(RenderedDocument {
            bytes,
            content_type: "application/pdf".to_string(),
            extension: "pdf".to_string(),
        })
    }
}

fn pdf_error(e: printpdf::Error) -> GenerationError {
    GenerationError::Rendering(format!("PDF generation failed: {}", e))
}

/// Top-down text cursor that starts a new page when the bottom margin is reached
struct PageWriter {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    y: f32,
    pages: usize,
}

impl PageWriter {
    fn new(title: &str) -> Self {
        let (doc, page, layer) =
            PdfDocument::new(title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Página 1");
        let layer = doc.get_page(page).get_layer(layer);
        Self {
            doc,
            layer,
            y: PAGE_HEIGHT - MARGIN,
            pages: 1,
        }
    }

    fn line(&mut self, text: &str, size: f32, x: f32, font: &IndirectFontRef) {
        if self.y < MARGIN {
            self.pages += 1;
            let (page, layer) = self.doc.add_page(
                Mm(PAGE_WIDTH),
                Mm(PAGE_HEIGHT),
                format!("Página {}", self.pages),
            );
            self.layer = self.doc.get_page(page).get_layer(layer);
            self.y = PAGE_HEIGHT - MARGIN;
        }
        self.layer.use_text(text, size, Mm(x), Mm(self.y), font);
        self.y -= LINE_HEIGHT;
    }

    fn gap(&mut self, mm: f32) {
        self.y -= mm;
    }
}

fn draw(layout: &DocumentLayout) -> Result<Vec<u8>, GenerationError> {
    let mut writer = PageWriter::new(&layout.heading);
    let bold = writer
        .doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(pdf_error)?;
    let regular = writer
        .doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(pdf_error)?;

    for line in wrap(&layout.heading, WRAP_COLUMNS / 2) {
        writer.line(&line, TITLE_SIZE, MARGIN, &bold);
    }
    writer.gap(LINE_HEIGHT);

    for (label, value) in &layout.info {
        writer.line(&format!("{}:", label), BODY_SIZE, MARGIN, &bold);
        writer.gap(-LINE_HEIGHT);
        for line in wrap(value, WRAP_COLUMNS - 20) {
            writer.line(&line, BODY_SIZE, MARGIN + 35.0, &regular);
        }
    }
    writer.gap(LINE_HEIGHT);

    for paragraph in &layout.paragraphs {
        for line in paragraph {
            writer.line(line, BODY_SIZE, MARGIN, &regular);
        }
        writer.gap(PARAGRAPH_GAP);
    }

    writer.doc.save_to_bytes().map_err(pdf_error)
}

/// Split on blank lines; each paragraph keeps its own source lines
fn paragraphs(content: &str) -> Vec<Vec<String>> {
    let mut result = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                result.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line.trim().to_string());
        }
    }
    if !current.is_empty() {
        result.push(current);
    }
    result
}

/// Greedy word wrap; words longer than `columns` are split
fn wrap(text: &str, columns: usize) -> Vec<String> {
    let columns = columns.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > columns {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            lines.push(word.drain(..columns).collect());
        }
        if word.is_empty() {
            continue;
        }

        let word: String = word.into_iter().collect();
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > columns {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

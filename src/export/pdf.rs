//! Landscape A4 table export.

use chrono::Utc;
use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfLayerReference};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{cell_text, Entity, ExportError};

const PAGE_WIDTH: f32 = 297.0;
const PAGE_HEIGHT: f32 = 210.0;
const MARGIN: f32 = 12.0;
const TITLE_SIZE: f32 = 14.0;
const BODY_SIZE: f32 = 9.0;
const LINE_HEIGHT: f32 = 6.0;
// Top of the table body, below title and header row.
const TABLE_TOP: f32 = PAGE_HEIGHT - MARGIN - 22.0;
const TABLE_BOTTOM: f32 = MARGIN + 8.0;
// Rough Helvetica advance at 9pt.
const CHAR_WIDTH: f32 = 1.7;

pub(crate) fn rows_per_page() -> usize {
    ((TABLE_TOP - TABLE_BOTTOM) / LINE_HEIGHT).floor() as usize
}

pub(crate) fn page_count(rows: usize) -> usize {
    rows.div_ceil(rows_per_page()).max(1)
}

fn clip(text: &str, width: f32) -> String {
    let max = ((width / CHAR_WIDTH) as usize).max(4);
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max - 3).collect();
    out.push_str("...");
    out
}

struct Fonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
}

fn draw_page(
    layer: &PdfLayerReference,
    fonts: &Fonts,
    entity: Entity,
    title: &str,
    rows: &[Value],
    page: usize,
    pages: usize,
) {
    let columns = entity.columns();
    let col_width = (PAGE_WIDTH - 2.0 * MARGIN) / columns.len() as f32;

    layer.use_text(title, TITLE_SIZE, Mm(MARGIN), Mm(PAGE_HEIGHT - MARGIN - 4.0), &fonts.bold);
    let header_y = TABLE_TOP + LINE_HEIGHT + 2.0;
    for (i, column) in columns.iter().enumerate() {
        let x = MARGIN + i as f32 * col_width;
        layer.use_text(clip(column.header, col_width), BODY_SIZE, Mm(x), Mm(header_y), &fonts.bold);
    }

    for (n, row) in rows.iter().enumerate() {
        let y = TABLE_TOP - n as f32 * LINE_HEIGHT;
        for (i, column) in columns.iter().enumerate() {
            let x = MARGIN + i as f32 * col_width;
            let text = cell_text(row, column.key);
            if !text.is_empty() {
                layer.use_text(clip(&text, col_width), BODY_SIZE, Mm(x), Mm(y), &fonts.regular);
            }
        }
    }

    let footer = format!(
        "{} - généré le {} - page {}/{}",
        entity.label(),
        Utc::now().format("%d/%m/%Y"),
        page,
        pages
    );
    layer.use_text(footer, 8.0, Mm(MARGIN), Mm(MARGIN), &fonts.regular);
}

fn pdf_err(err: impl std::fmt::Display) -> ExportError {
    ExportError::Pdf(err.to_string())
}

#[instrument(skip_all, fields(entity = %entity, rows = rows.len()))]
pub fn export_pdf(entity: Entity, title: &str, rows: &[Value]) -> Result<Vec<u8>, ExportError> {
    let (doc, first_page, first_layer) =
        PdfDocument::new(title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "table");
    let fonts = Fonts {
        regular: doc.add_builtin_font(BuiltinFont::Helvetica).map_err(pdf_err)?,
        bold: doc.add_builtin_font(BuiltinFont::HelveticaBold).map_err(pdf_err)?,
    };

    let pages = page_count(rows.len());
    let mut chunks = rows.chunks(rows_per_page());
    let first_rows = chunks.next().unwrap_or(&[]);
    let layer = doc.get_page(first_page).get_layer(first_layer);
    draw_page(&layer, &fonts, entity, title, first_rows, 1, pages);

    for (i, chunk) in chunks.enumerate() {
        let (page, layer) = doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "table");
        let layer = doc.get_page(page).get_layer(layer);
        draw_page(&layer, &fonts, entity, title, chunk, i + 2, pages);
    }

    let bytes = doc.save_to_bytes().map_err(pdf_err)?;
    debug!(pages, bytes = bytes.len(), "pdf export written");
    Ok(bytes)
}

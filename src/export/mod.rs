//! Spreadsheet and PDF exports, import templates and import parsing.

use std::collections::BTreeMap;
use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument};

pub mod columns;
mod pdf;

pub use columns::{normalize_header, Column, Entity};
pub use pdf::export_pdf;

const DATA_SHEET: &str = "Données";
const INSTRUCTIONS_SHEET: &str = "Instructions";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unknown export entity: {0}")]
    UnknownEntity(String),
    #[error("spreadsheet write failed: {0}")]
    Xlsx(#[from] XlsxError),
    #[error("spreadsheet read failed: {0}")]
    Read(#[from] calamine::Error),
    #[error("workbook has no sheets")]
    EmptyWorkbook,
    #[error("pdf generation failed: {0}")]
    Pdf(String),
}

/// One non-blank data row of an imported sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    /// 1-based sheet row, header included.
    pub line: usize,
    pub values: BTreeMap<String, String>,
}

impl ImportRow {
    pub fn get(&self, column: &Column) -> Option<&str> {
        self.values
            .get(&normalize_header(column.header))
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIssue {
    pub line: usize,
    pub missing: Vec<&'static str>,
}

/// Render a row value for a cell.
pub(crate) fn cell_text(row: &Value, key: &str) -> String {
    match row.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(true)) => "Oui".into(),
        Some(Value::Bool(false)) => "Non".into(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Some(other) => other.to_string(),
    }
}

#[instrument(skip_all, fields(entity = %entity, rows = rows.len()))]
pub fn export_xlsx(entity: Entity, rows: &[Value]) -> Result<Vec<u8>, ExportError> {
    let bold = Format::new().set_bold();
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(entity.label())?;
    for (c, column) in entity.columns().iter().enumerate() {
        let c = c as u16;
        sheet.write_string_with_format(0, c, column.header, &bold)?;
        sheet.set_column_width(c, column_width(column.header))?;
    }
    for (r, row) in rows.iter().enumerate() {
        let r = r as u32 + 1;
        for (c, column) in entity.columns().iter().enumerate() {
            match row.get(column.key) {
                Some(Value::Number(n)) if n.as_f64().is_some() => {
                    sheet.write_number(r, c as u16, n.as_f64().unwrap_or_default())?;
                }
                _ => {
                    sheet.write_string(r, c as u16, cell_text(row, column.key))?;
                }
            }
        }
    }
    let bytes = workbook.save_to_buffer()?;
    debug!(bytes = bytes.len(), "xlsx export written");
    Ok(bytes)
}

fn column_width(header: &str) -> f64 {
    (header.chars().count() as f64 + 6.0).max(14.0)
}

/// Workbook with the entity's headers (`*` on required ones), two example
/// rows, and an instructions sheet.
#[instrument(skip_all, fields(entity = %entity))]
pub fn generate_import_template(entity: Entity) -> Result<Vec<u8>, ExportError> {
    let bold = Format::new().set_bold();
    let mut workbook = Workbook::new();

    let sheet = workbook.add_worksheet();
    sheet.set_name(DATA_SHEET)?;
    for (c, column) in entity.columns().iter().enumerate() {
        let header = column.template_header();
        sheet.write_string_with_format(0, c as u16, &header, &bold)?;
        sheet.set_column_width(c as u16, column_width(&header))?;
    }
    for (r, example) in entity.example_rows().iter().enumerate() {
        for (c, value) in example.iter().enumerate() {
            sheet.write_string(r as u32 + 1, c as u16, *value)?;
        }
    }

    let help = workbook.add_worksheet();
    help.set_name(INSTRUCTIONS_SHEET)?;
    help.set_column_width(0, 28)?;
    help.set_column_width(1, 16)?;
    help.write_string_with_format(0, 0, format!("Import : {}", entity.label()), &bold)?;
    help.write_string(
        1,
        0,
        "Remplissez la feuille « Données » à partir de la ligne 2. Les colonnes marquées * sont obligatoires.",
    )?;
    help.write_string(2, 0, "Supprimez les lignes d'exemple avant l'import.")?;
    help.write_string_with_format(4, 0, "Colonne", &bold)?;
    help.write_string_with_format(4, 1, "Obligatoire", &bold)?;
    for (i, column) in entity.columns().iter().enumerate() {
        let r = i as u32 + 5;
        help.write_string(r, 0, column.header)?;
        help.write_string(r, 1, if column.required { "Oui" } else { "Non" })?;
    }

    Ok(workbook.save_to_buffer()?)
}

fn data_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) if ts.time() == chrono::NaiveTime::MIN => ts.date().to_string(),
            Some(ts) => ts.to_string(),
            None => dt.as_f64().to_string(),
        },
        other => other.to_string(),
    }
}

/// Read the first sheet. Keys are normalized headers; blank rows are skipped.
#[instrument(skip_all, fields(bytes = bytes.len()))]
pub fn parse_import_file(bytes: &[u8]) -> Result<Vec<ImportRow>, ExportError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(ExportError::EmptyWorkbook)??;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let keys: Vec<String> = header.iter().map(|c| normalize_header(&data_text(c))).collect();
    let first_line = range.start().map(|(r, _)| r as usize + 1).unwrap_or(1);

    let mut parsed = Vec::new();
    for (offset, row) in rows.enumerate() {
        let mut values = BTreeMap::new();
        for (key, cell) in keys.iter().zip(row) {
            if key.is_empty() {
                continue;
            }
            values.insert(key.clone(), data_text(cell));
        }
        if values.values().all(|v| v.is_empty()) {
            continue;
        }
        parsed.push(ImportRow {
            line: first_line + offset + 1,
            values,
        });
    }
    debug!(rows = parsed.len(), "import parsed");
    Ok(parsed)
}

/// Rows missing required fields, with the headers they lack.
pub fn validate_import_rows(entity: Entity, rows: &[ImportRow]) -> Vec<RowIssue> {
    rows.iter()
        .filter_map(|row| {
            let missing: Vec<&'static str> = entity
                .columns()
                .iter()
                .filter(|c| c.required && row.get(c).is_none())
                .map(|c| c.header)
                .collect();
            (!missing.is_empty()).then_some(RowIssue {
                line: row.line,
                missing,
            })
        })
        .collect()
}

/// Map imported rows onto the entity's field keys.
pub fn to_records(entity: Entity, rows: &[ImportRow]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let record: Map<String, Value> = entity
                .columns()
                .iter()
                .filter_map(|c| row.get(c).map(|v| (c.key.to_string(), Value::String(v.to_string()))))
                .collect();
            Value::Object(record)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_parses_back_to_normalized_headers() {
        let bytes = generate_import_template(Entity::Students).unwrap();
        let rows = parse_import_file(&bytes).unwrap();
        assert_eq!(rows.len(), 2);
        let expected: Vec<String> = Entity::Students
            .columns()
            .iter()
            .map(|c| normalize_header(&c.template_header()))
            .collect();
        let mut keys: Vec<String> = rows[0].values.keys().cloned().collect();
        let mut sorted = expected.clone();
        sorted.sort();
        keys.sort();
        assert_eq!(keys, sorted);
        assert_eq!(rows[0].line, 2);
        assert_eq!(rows[0].values["prenom"], "Aminata");
        assert!(validate_import_rows(Entity::Students, &rows).is_empty());
    }

    #[test]
    fn reports_missing_required_fields() {
        let mut values = BTreeMap::new();
        values.insert("prenom".to_string(), "Aminata".to_string());
        values.insert("nom".to_string(), "  ".to_string());
        let rows = vec![ImportRow { line: 3, values }];
        let issues = validate_import_rows(Entity::Students, &rows);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].line, 3);
        assert_eq!(issues[0].missing, vec!["Nom", "Téléphone du parent"]);
    }

    #[test]
    fn export_writes_a_workbook_that_reads_back() {
        let rows = vec![
            json!({"full_name": "Mariama Sow", "email": "m@ecole.sn", "role": "principal", "is_active": true}),
            json!({"full_name": "Abdou Kane", "role": "teacher", "is_active": false}),
        ];
        let bytes = export_xlsx(Entity::Users, &rows).unwrap();
        let parsed = parse_import_file(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].values["nom_complet"], "Mariama Sow");
        assert_eq!(parsed[1].values["actif"], "Non");
        assert_eq!(parsed[1].values["email"], "");
    }

    #[test]
    fn records_use_field_keys() {
        let bytes = generate_import_template(Entity::Teachers).unwrap();
        let rows = parse_import_file(&bytes).unwrap();
        let records = to_records(Entity::Teachers, &rows);
        assert_eq!(records[0]["first_name"], "Fatou");
        assert_eq!(records[0]["subject"], "Mathématiques");
        assert!(records[1].get("phone").is_none());
    }

    #[test]
    fn cell_text_flattens_values() {
        let row = json!({"children": ["Awa", "Ali"], "count": 3, "none": null});
        assert_eq!(cell_text(&row, "children"), "Awa, Ali");
        assert_eq!(cell_text(&row, "count"), "3");
        assert_eq!(cell_text(&row, "none"), "");
        assert_eq!(cell_text(&row, "missing"), "");
    }
}

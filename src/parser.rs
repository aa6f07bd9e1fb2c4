//! CSV file parsing
//!
//! Source files are `;`-delimited exports with a localized header row. Rows
//! are projected onto [`CompanyRecord`] by header name, so column order does
//! not matter and absent columns resolve to empty strings. Any I/O or
//! malformed-record error fails the whole file — partially ingested files are
//! worse than retried ones.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::types::CompanyRecord;

// Header labels as they appear in the source exports.
const COL_NAME: &str = "Название";
const COL_REGION: &str = "Регион";
const COL_DISTRICT: &str = "Район";
const COL_CITY: &str = "Город";
const COL_EMAIL: &str = "Email";
const COL_PHONE: &str = "Телефон";
const COL_CATEGORY: &str = "Рубрика";
const COL_SUBCATEGORY: &str = "Подрубрика";

/// Parse a CSV file into company records.
pub fn parse_file(path: &Path) -> Result<Vec<CompanyRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let headers = reader
        .headers()
        .context("failed to read CSV headers")?
        .clone();
    let index: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, header)| (header, i))
        .collect();

    let field = |record: &csv::StringRecord, label: &str| -> String {
        index
            .get(label)
            .and_then(|&i| record.get(i))
            .unwrap_or_default()
            .to_string()
    };

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.context("failed to read CSV record")?;
        records.push(CompanyRecord {
            name: field(&row, COL_NAME),
            region: field(&row, COL_REGION),
            district: field(&row, COL_DISTRICT),
            city: field(&row, COL_CITY),
            email: field(&row, COL_EMAIL),
            phone: field(&row, COL_PHONE),
            category: field(&row, COL_CATEGORY),
            subcategory: field(&row, COL_SUBCATEGORY),
        });
    }

    Ok(records)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn projects_rows_by_header_name() {
        let file = write_csv(
            "Название;Регион;Район;Город;Email;Телефон;Рубрика;Подрубрика\n\
             Кафе А;Р1;;Г1;a@b.ru;+7 900;Еда, Кафе;Торты\n"
                .as_bytes(),
        );
        let records = parse_file(file.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Кафе А");
        assert_eq!(records[0].region, "Р1");
        assert_eq!(records[0].district, "");
        assert_eq!(records[0].city, "Г1");
        assert_eq!(records[0].category, "Еда, Кафе");
        assert_eq!(records[0].subcategory, "Торты");
    }

    #[test]
    fn header_order_does_not_matter() {
        let file = write_csv("Город;Название\nГ1;Кафе Б\n".as_bytes());
        let records = parse_file(file.path()).unwrap();
        assert_eq!(records[0].name, "Кафе Б");
        assert_eq!(records[0].city, "Г1");
    }

    #[test]
    fn missing_headers_resolve_to_empty_strings() {
        let file = write_csv("Название\nКафе В\n".as_bytes());
        let records = parse_file(file.path()).unwrap();
        assert_eq!(records[0].name, "Кафе В");
        assert_eq!(records[0].region, "");
        assert_eq!(records[0].category, "");
    }

    #[test]
    fn short_rows_pad_with_empty_strings() {
        let file = write_csv("Название;Регион;Город\nКафе Г\n".as_bytes());
        let records = parse_file(file.path()).unwrap();
        assert_eq!(records[0].name, "Кафе Г");
        assert_eq!(records[0].region, "");
        assert_eq!(records[0].city, "");
    }

    #[test]
    fn fields_and_headers_are_trimmed() {
        let file = write_csv("  Название ; Город \n  Кафе Д ;  Г2 \n".as_bytes());
        let records = parse_file(file.path()).unwrap();
        assert_eq!(records[0].name, "Кафе Д");
        assert_eq!(records[0].city, "Г2");
    }

    #[test]
    fn four_byte_utf8_survives() {
        let file = write_csv("Название\nКафе \u{1F354}\n".as_bytes());
        let records = parse_file(file.path()).unwrap();
        assert_eq!(records[0].name, "Кафе \u{1F354}");
    }

    #[test]
    fn header_only_file_yields_no_records() {
        let file = write_csv("Название;Город\n".as_bytes());
        assert!(parse_file(file.path()).unwrap().is_empty());
    }

    #[test]
    fn invalid_utf8_fails_the_whole_file() {
        let mut content = "Название\n".as_bytes().to_vec();
        content.extend_from_slice(&[0xFF, 0xFE, 0xFD, b'\n']);
        let file = write_csv(&content);
        assert!(parse_file(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(parse_file(Path::new("/nonexistent/companies.csv")).is_err());
    }
}

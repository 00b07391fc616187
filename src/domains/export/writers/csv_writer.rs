use crate::domains::export::types::{ExportError, ExportResult};
use crate::domains::export::writer::StagedWorkbook;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Write the single sheet of `workbook` as delimited text.
///
/// A UTF-8 BOM is written first so spreadsheet applications pick the right
/// encoding.
pub fn render_csv(
    workbook: &StagedWorkbook,
    delimiter: u8,
    quote_char: u8,
    path: &Path,
) -> ExportResult<()> {
    if workbook.sheets.len() > 1 {
        return Err(ExportError::Render(format!(
            "csv output holds a single sheet, workbook has {}",
            workbook.sheets.len()
        )));
    }

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(UTF8_BOM)?;

    {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .quote(quote_char)
            .flexible(true)
            .from_writer(&mut out);

        if let Some(sheet) = workbook.sheets.first() {
            for row in &sheet.rows {
                let record: Vec<String> = row.iter().map(format_csv_value).collect();
                wtr.write_record(&record)
                    .map_err(|e| ExportError::Render(format!("csv write failed: {}", e)))?;
            }
        }
        wtr.flush()?;
    }

    out.flush()?;
    Ok(())
}

fn format_csv_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(arr) => arr
            .iter()
            .map(format_csv_value)
            .collect::<Vec<_>>()
            .join("; "),
        serde_json::Value::Object(_) => value.to_string(),
    }
}

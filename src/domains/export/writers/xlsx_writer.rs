use crate::domains::export::types::{ExportError, ExportResult};
use crate::domains::export::writer::StagedWorkbook;
use rust_xlsxwriter::{DocProperties, Workbook, Worksheet, XlsxError};
use std::path::Path;

/// Excel's per-sheet limits
pub const XLSX_MAX_ROWS: usize = 1_048_576;
pub const XLSX_MAX_COLS: usize = 16_384;

/// Write `workbook` as an xlsx file, one worksheet per staged sheet.
pub fn render_xlsx(workbook: &StagedWorkbook, path: &Path) -> ExportResult<()> {
    let mut book = Workbook::new();
    book.set_properties(&doc_properties(workbook));

    for (index, sheet) in workbook.sheets.iter().enumerate() {
        if sheet.rows.len() > XLSX_MAX_ROWS {
            return Err(ExportError::Render(format!(
                "sheet {} has {} rows, xlsx allows {}",
                index,
                sheet.rows.len(),
                XLSX_MAX_ROWS
            )));
        }

        let worksheet = book.add_worksheet();
        worksheet.set_name(&sheet.title).map_err(xlsx_error)?;

        for (row_idx, row) in sheet.rows.iter().enumerate() {
            if row.len() > XLSX_MAX_COLS {
                return Err(ExportError::Render(format!(
                    "sheet {} row {} has {} cells, xlsx allows {}",
                    index,
                    row_idx,
                    row.len(),
                    XLSX_MAX_COLS
                )));
            }
            for (col_idx, value) in row.iter().enumerate() {
                write_cell(worksheet, row_idx as u32, col_idx as u16, value)?;
            }
        }
    }

    book.save(path).map_err(xlsx_error)?;
    Ok(())
}

fn write_cell(
    worksheet: &mut Worksheet,
    row: u32,
    col: u16,
    value: &serde_json::Value,
) -> ExportResult<()> {
    match value {
        serde_json::Value::Null => return Ok(()),
        serde_json::Value::Bool(b) => {
            worksheet.write_boolean(row, col, *b).map_err(xlsx_error)?;
        }
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) => {
                worksheet.write_number(row, col, f).map_err(xlsx_error)?;
            }
            None => {
                worksheet
                    .write_string(row, col, n.to_string())
                    .map_err(xlsx_error)?;
            }
        },
        serde_json::Value::String(s) => {
            worksheet.write_string(row, col, s).map_err(xlsx_error)?;
        }
        other => {
            worksheet
                .write_string(row, col, other.to_string())
                .map_err(xlsx_error)?;
        }
    }
    Ok(())
}

fn doc_properties(workbook: &StagedWorkbook) -> DocProperties {
    let mut props = DocProperties::new();
    if let Some(title) = &workbook.title {
        props = props.set_title(title);
    }
    for (key, value) in &workbook.properties {
        props = match key.as_str() {
            "title" => props.set_title(value),
            "subject" => props.set_subject(value),
            "author" | "creator" => props.set_author(value),
            "manager" => props.set_manager(value),
            "company" => props.set_company(value),
            "category" => props.set_category(value),
            "keywords" => props.set_keywords(value),
            "comment" | "description" => props.set_comment(value),
            other => {
                log::warn!("Ignoring unsupported document property '{}'", other);
                props
            }
        };
    }
    props
}

fn xlsx_error(err: XlsxError) -> ExportError {
    ExportError::Render(format!("xlsx: {}", err))
}

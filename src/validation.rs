use crate::errors::{ValidationError, ValidationResult};
use regex::Regex;
use std::sync::OnceLock;

/// Excel sheet name maximum length.
pub const SHEET_TITLE_MAX_LEN: usize = 31;

/// Characters not allowed in sheet titles.
pub const SHEET_TITLE_ILLEGAL: [char; 7] = ['*', ':', '?', '/', '\\', '[', ']'];

fn identifier_regex() -> &'static Regex {
    static IDENTIFIER_REGEX: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER_REGEX.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
}

/// Validate a table or column name before it is pushed into a SQL string.
///
/// Only plain identifiers are accepted; quoting is never attempted.
pub fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    if value.is_empty() {
        return Err(ValidationError::required(field));
    }
    if !identifier_regex().is_match(value) {
        return Err(ValidationError::format(
            field,
            "must start with a letter or underscore and contain only letters, digits or underscores",
        ));
    }
    Ok(())
}

/// Validate a worksheet title.
pub fn validate_sheet_title(title: &str) -> ValidationResult<()> {
    if title.trim().is_empty() {
        return Err(ValidationError::required("sheet_title"));
    }
    if title.chars().count() > SHEET_TITLE_MAX_LEN {
        return Err(ValidationError::max_length("sheet_title", SHEET_TITLE_MAX_LEN));
    }
    if let Some(c) = title.chars().find(|c| SHEET_TITLE_ILLEGAL.contains(c)) {
        return Err(ValidationError::format(
            "sheet_title",
            &format!("contains illegal character '{}'", c),
        ));
    }
    if title.starts_with('\'') || title.ends_with('\'') {
        return Err(ValidationError::format(
            "sheet_title",
            "cannot start or end with an apostrophe",
        ));
    }
    Ok(())
}

/// Default title for the sheet at `sheet_index`.
pub fn default_sheet_title(sheet_index: usize) -> String {
    if sheet_index == 0 {
        "Worksheet".to_string()
    } else {
        format!("Worksheet{}", sheet_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("table", "users").is_ok());
        assert!(validate_identifier("column", "_created_at2").is_ok());
        assert!(validate_identifier("column", "").is_err());
        assert!(validate_identifier("column", "1abc").is_err());
        assert!(validate_identifier("column", "name; DROP TABLE users").is_err());
        assert!(validate_identifier("column", "a.b").is_err());
    }

    #[test]
    fn test_sheet_title_validation() {
        assert!(validate_sheet_title("Orders 2024").is_ok());
        assert!(validate_sheet_title("   ").is_err());
        assert!(validate_sheet_title("a/b").is_err());
        assert!(validate_sheet_title("[draft]").is_err());
        assert!(validate_sheet_title("'quoted").is_err());
        assert!(validate_sheet_title(&"x".repeat(32)).is_err());
        assert!(validate_sheet_title(&"x".repeat(31)).is_ok());
    }

    #[test]
    fn test_default_sheet_titles() {
        assert_eq!(default_sheet_title(0), "Worksheet");
        assert_eq!(default_sheet_title(2), "Worksheet2");
    }
}

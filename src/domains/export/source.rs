//! Export definitions: the user-supplied data sources a queued export is built from.
//!
//! A sheet may declare an in-memory row collection or a queryable source. Both
//! are optional fields so that a conflicting definition is representable and
//! can be rejected when the chain is assembled; [`SheetDefinition::resolve`]
//! turns the capabilities into a single [`SheetSource`] tag.

use crate::domains::export::types::{ExportError, ExportResult, Row};
use crate::validation::{default_sheet_title, validate_identifier, validate_sheet_title};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

/// Capability of a row object to be converted into a plain row.
pub trait ToRow: Send + Sync {
    fn to_row(&self) -> Result<Row, String>;
}

impl<T: Serialize + Send + Sync> ToRow for T {
    fn to_row(&self) -> Result<Row, String> {
        let value = serde_json::to_value(self).map_err(|e| e.to_string())?;
        Ok(normalize_value(value))
    }
}

/// Flatten a JSON value into a row: arrays keep their order, objects keep
/// field order, scalars become a single cell.
pub fn normalize_value(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
        other => vec![other],
    }
}

/// Ordered in-memory rows for one sheet.
#[derive(Default)]
pub struct RowCollection {
    rows: Vec<Box<dyn ToRow>>,
}

impl fmt::Debug for RowCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowCollection")
            .field("rows", &self.rows.len())
            .finish()
    }
}

impl RowCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows<I, T>(rows: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToRow + 'static,
    {
        Self {
            rows: rows
                .into_iter()
                .map(|row| Box::new(row) as Box<dyn ToRow>)
                .collect(),
        }
    }

    pub fn push<T: ToRow + 'static>(&mut self, row: T) {
        self.rows.push(Box::new(row));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Borrow a contiguous slice of rows. Out of range bounds are clamped.
    pub fn slice(&self, range: Range<usize>) -> &[Box<dyn ToRow>] {
        let end = range.end.min(self.rows.len());
        let start = range.start.min(end);
        &self.rows[start..end]
    }
}

/// Comparison applied by a query condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => " = ",
            Operator::NotEq => " <> ",
            Operator::Lt => " < ",
            Operator::Lte => " <= ",
            Operator::Gt => " > ",
            Operator::Gte => " >= ",
            Operator::Like => " LIKE ",
            Operator::IsNull => " IS NULL",
            Operator::IsNotNull => " IS NOT NULL",
        }
    }

    /// Whether the operator takes a bound value
    pub fn takes_value(&self) -> bool {
        !matches!(self, Operator::IsNull | Operator::IsNotNull)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

/// One page of a query: `number` starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageWindow {
    pub number: u64,
    pub size: usize,
}

impl PageWindow {
    pub fn offset(&self) -> u64 {
        self.number.saturating_sub(1) * self.size as u64
    }
}

/// A query captured by its parameters, never by a live cursor, so it can be
/// carried inside a unit across a worker boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedQuery {
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PageWindow>,
}

impl SerializedQuery {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            conditions: Vec::new(),
            order_by: Vec::new(),
            page: None,
        }
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(
        mut self,
        column: impl Into<String>,
        operator: Operator,
        value: serde_json::Value,
    ) -> Self {
        self.conditions.push(Condition {
            column: column.into(),
            operator,
            value,
        });
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    /// The same query restricted to page `number` of `size` rows.
    pub fn for_page(&self, number: u64, size: usize) -> Self {
        let mut paged = self.clone();
        paged.page = Some(PageWindow { number, size });
        paged
    }

    /// Reject identifiers that cannot be safely embedded in SQL.
    pub fn validate(&self) -> ExportResult<()> {
        validate_identifier("table", &self.table)?;
        for column in &self.columns {
            validate_identifier("column", column)?;
        }
        for condition in &self.conditions {
            validate_identifier("condition.column", &condition.column)?;
        }
        for order in &self.order_by {
            validate_identifier("order_by.column", &order.column)?;
        }
        if let Some(page) = &self.page {
            if page.number == 0 || page.size == 0 {
                return Err(ExportError::InvalidConfig(
                    "page number and size must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// The data capability a sheet resolved to
#[derive(Debug, Clone, Copy)]
pub enum SheetSource<'a> {
    InMemory(&'a RowCollection),
    Queryable(&'a SerializedQuery),
    /// Neither capability: only the sheet close unit is produced
    Empty,
}

/// One logical table of rows within an export
#[derive(Debug, Default)]
pub struct SheetDefinition {
    pub title: Option<String>,
    pub collection: Option<RowCollection>,
    pub query: Option<SerializedQuery>,
}

impl SheetDefinition {
    pub fn from_collection(rows: RowCollection) -> Self {
        Self {
            collection: Some(rows),
            ..Default::default()
        }
    }

    pub fn from_query(query: SerializedQuery) -> Self {
        Self {
            query: Some(query),
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_collection(mut self, rows: RowCollection) -> Self {
        self.collection = Some(rows);
        self
    }

    pub fn with_query(mut self, query: SerializedQuery) -> Self {
        self.query = Some(query);
        self
    }

    /// Resolve the sheet's capability. Declaring both a collection and a
    /// query is a configuration error.
    pub fn resolve(&self, sheet_index: usize) -> ExportResult<SheetSource<'_>> {
        match (&self.collection, &self.query) {
            (Some(_), Some(_)) => Err(ExportError::InvalidConfig(format!(
                "sheet {} declares both an in-memory collection and a query",
                sheet_index
            ))),
            (Some(rows), None) => Ok(SheetSource::InMemory(rows)),
            (None, Some(query)) => {
                query.validate()?;
                Ok(SheetSource::Queryable(query))
            }
            (None, None) => Ok(SheetSource::Empty),
        }
    }
}

/// Single sheet or an ordered list of sheets
#[derive(Debug)]
pub enum SheetLayout {
    Single(SheetDefinition),
    MultiSheet(Vec<SheetDefinition>),
}

/// A complete export: its sheets plus optional lifecycle hooks
#[derive(Debug)]
pub struct ExportDefinition {
    pub title: Option<String>,
    pub layout: SheetLayout,
    /// Name of a registered before-writing hook
    pub before_writing: Option<String>,
}

impl ExportDefinition {
    pub fn single(sheet: SheetDefinition) -> Self {
        Self {
            title: None,
            layout: SheetLayout::Single(sheet),
            before_writing: None,
        }
    }

    pub fn multi_sheet(sheets: Vec<SheetDefinition>) -> Self {
        Self {
            title: None,
            layout: SheetLayout::MultiSheet(sheets),
            before_writing: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_before_writing(mut self, hook: impl Into<String>) -> Self {
        self.before_writing = Some(hook.into());
        self
    }

    /// Sheets in declaration order; the position is the sheet index.
    pub fn sheets(&self) -> Vec<&SheetDefinition> {
        match &self.layout {
            SheetLayout::Single(sheet) => vec![sheet],
            SheetLayout::MultiSheet(sheets) => sheets.iter().collect(),
        }
    }

    pub fn declares_before_writing(&self) -> bool {
        self.before_writing.is_some()
    }

    /// Resolved, validated and unique sheet titles in sheet order.
    pub fn sheet_titles(&self) -> ExportResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut titles = Vec::new();
        for (index, sheet) in self.sheets().into_iter().enumerate() {
            let title = sheet
                .title
                .clone()
                .unwrap_or_else(|| default_sheet_title(index));
            validate_sheet_title(&title)?;
            if !seen.insert(title.to_lowercase()) {
                return Err(ExportError::InvalidConfig(format!(
                    "duplicate sheet title '{}'",
                    title
                )));
            }
            titles.push(title);
        }
        Ok(titles)
    }
}

use crate::domains::export::source::{Operator, SerializedQuery, SortDirection};
use crate::domains::export::types::{ExportError, ExportResult, Row};
use crate::errors::{DbError, DbResult};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, QueryBuilder, Row as _, Sqlite, SqlitePool, TypeInfo, ValueRef};

/// A data source that can count and page a serialized query.
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Number of rows matching the query, ignoring any page window
    async fn count(&self, query: &SerializedQuery) -> ExportResult<u64>;

    /// Rows of the query's page window (or every row when unpaged)
    async fn fetch_page(&self, query: &SerializedQuery) -> ExportResult<Vec<Row>>;
}

/// SQLite implementation built on `QueryBuilder`
pub struct SqliteQuerySource {
    pool: SqlitePool,
}

impl SqliteQuerySource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn push_conditions(builder: &mut QueryBuilder<'_, Sqlite>, query: &SerializedQuery) -> DbResult<()> {
        for (i, condition) in query.conditions.iter().enumerate() {
            builder.push(if i == 0 { " WHERE " } else { " AND " });
            builder.push(&condition.column);
            builder.push(condition.operator.as_sql());

            if !condition.operator.takes_value() {
                continue;
            }
            match &condition.value {
                serde_json::Value::String(s) => {
                    builder.push_bind(s.clone());
                }
                serde_json::Value::Bool(b) => {
                    builder.push_bind(*b);
                }
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        builder.push_bind(i);
                    } else if let Some(f) = n.as_f64() {
                        builder.push_bind(f);
                    } else {
                        return Err(DbError::UnsupportedValue {
                            column: condition.column.clone(),
                            reason: format!("number {} is out of range", n),
                        });
                    }
                }
                serde_json::Value::Null => {
                    return Err(DbError::UnsupportedValue {
                        column: condition.column.clone(),
                        reason: "use is_null / is_not_null to compare with NULL".to_string(),
                    });
                }
                other => {
                    return Err(DbError::UnsupportedValue {
                        column: condition.column.clone(),
                        reason: format!("cannot bind {}", other),
                    });
                }
            }
        }
        Ok(())
    }

    fn build_select(query: &SerializedQuery) -> DbResult<QueryBuilder<'static, Sqlite>> {
        let columns = if query.columns.is_empty() {
            "*".to_string()
        } else {
            query.columns.join(", ")
        };

        let mut builder = QueryBuilder::new(format!("SELECT {} FROM {}", columns, query.table));
        Self::push_conditions(&mut builder, query)?;

        // Pages are only stable under a total order
        builder.push(" ORDER BY ");
        if query.order_by.is_empty() {
            builder.push("rowid ASC");
        } else {
            let mut separated = builder.separated(", ");
            for order in &query.order_by {
                let direction = match order.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                separated.push(format!("{} {}", order.column, direction));
            }
        }

        if let Some(page) = &query.page {
            builder.push(" LIMIT ");
            builder.push_bind(page.size as i64);
            builder.push(" OFFSET ");
            builder.push_bind(page.offset() as i64);
        }

        Ok(builder)
    }

    fn row_to_cells(row: &SqliteRow) -> DbResult<Row> {
        let mut cells = Vec::with_capacity(row.columns().len());
        for column in row.columns() {
            let index = column.ordinal();
            let raw = row.try_get_raw(index)?;
            if raw.is_null() {
                cells.push(serde_json::Value::Null);
                continue;
            }
            let type_name = raw.type_info().name().to_ascii_uppercase();
            let cell = match type_name.as_str() {
                "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => serde_json::Value::from(row.try_get::<i64, _>(index)?),
                "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => serde_json::Value::from(row.try_get::<f64, _>(index)?),
                "BLOB" => serde_json::Value::String(hex::encode(row.try_get::<Vec<u8>, _>(index)?)),
                _ => serde_json::Value::String(row.try_get::<String, _>(index)?),
            };
            cells.push(cell);
        }
        Ok(cells)
    }
}

#[async_trait]
impl QuerySource for SqliteQuerySource {
    async fn count(&self, query: &SerializedQuery) -> ExportResult<u64> {
        query.validate()?;
        let mut builder = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", query.table));
        Self::push_conditions(&mut builder, query)?;

        let count: i64 = builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_page(&self, query: &SerializedQuery) -> ExportResult<Vec<Row>> {
        query.validate()?;
        let mut builder = Self::build_select(query)?;
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        log::debug!(
            "Fetched {} rows from '{}' (page {:?})",
            rows.len(),
            query.table,
            query.page.map(|p| p.number)
        );

        rows.iter()
            .map(|row| Self::row_to_cells(row).map_err(ExportError::from))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    pub(crate) async fn seeded_pool(rows: usize) -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, customer TEXT, total REAL, status TEXT, note TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        for i in 1..=rows {
            sqlx::query("INSERT INTO orders (id, customer, total, status, note) VALUES (?, ?, ?, ?, NULL)")
                .bind(i as i64)
                .bind(format!("customer-{}", i))
                .bind(i as f64 * 1.5)
                .bind(if i % 2 == 0 { "paid" } else { "open" })
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_count_respects_conditions() {
        let source = SqliteQuerySource::new(seeded_pool(9).await);
        let all = SerializedQuery::table("orders");
        assert_eq!(source.count(&all).await.unwrap(), 9);

        let paid = all.clone().filter("status", Operator::Eq, json!("paid"));
        assert_eq!(source.count(&paid).await.unwrap(), 4);

        let large = all.filter("total", Operator::Gt, json!(9.0));
        assert_eq!(source.count(&large).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_pages_are_disjoint_and_ordered() {
        let source = SqliteQuerySource::new(seeded_pool(7).await);
        let query = SerializedQuery::table("orders")
            .select(["id", "customer"])
            .order_by("id", SortDirection::Asc);

        let mut ids = Vec::new();
        for page in 1..=3 {
            let rows = source.fetch_page(&query.for_page(page, 3)).await.unwrap();
            ids.extend(rows.into_iter().map(|r| r[0].clone()));
        }
        assert_eq!(ids, (1..=7).map(|i| json!(i)).collect::<Vec<_>>());

        let beyond = source.fetch_page(&query.for_page(4, 3)).await.unwrap();
        assert!(beyond.is_empty());
    }

    #[tokio::test]
    async fn test_cells_keep_sqlite_types() {
        let source = SqliteQuerySource::new(seeded_pool(1).await);
        let query = SerializedQuery::table("orders").select(["id", "customer", "total", "note"]);
        let rows = source.fetch_page(&query).await.unwrap();
        assert_eq!(rows, vec![vec![json!(1), json!("customer-1"), json!(1.5), json!(null)]]);
    }

    #[tokio::test]
    async fn test_null_comparison_requires_null_operator() {
        let source = SqliteQuerySource::new(seeded_pool(2).await);
        let bad = SerializedQuery::table("orders").filter("note", Operator::Eq, json!(null));
        assert!(source.count(&bad).await.is_err());

        let good = SerializedQuery::table("orders").filter("note", Operator::IsNull, json!(null));
        assert_eq!(source.count(&good).await.unwrap(), 2);
    }
}

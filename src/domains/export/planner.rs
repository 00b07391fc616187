use crate::domains::export::repository::QuerySource;
use crate::domains::export::source::{PageWindow, SheetSource};
use crate::domains::export::types::{ChunkSize, ExportResult};
use serde::{Deserialize, Serialize};

/// What part of a sheet's rows a chunk covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChunkBounds {
    /// Half-open slice `[start, end)` of an in-memory collection
    Rows { start: usize, end: usize },
    /// One page of a queryable source
    Page(PageWindow),
}

/// One bounded piece of a sheet, in sheet order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub sheet_index: usize,
    /// Position of the chunk within its sheet, starting at 0
    pub ordinal: usize,
    pub bounds: ChunkBounds,
}

/// Partitions a sheet's rows into ordered chunks of at most `chunk_size` rows.
pub struct ChunkPlanner<'a> {
    query_source: &'a dyn QuerySource,
    chunk_size: ChunkSize,
    empty_query_emits_page: bool,
}

impl<'a> ChunkPlanner<'a> {
    pub fn new(
        query_source: &'a dyn QuerySource,
        chunk_size: ChunkSize,
        empty_query_emits_page: bool,
    ) -> Self {
        Self {
            query_source,
            chunk_size,
            empty_query_emits_page,
        }
    }

    pub fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    /// Plan the chunks of one sheet.
    ///
    /// For a queryable sheet this issues the single count query; dropping the
    /// returned future cancels it.
    pub async fn plan(
        &self,
        sheet_index: usize,
        source: SheetSource<'_>,
    ) -> ExportResult<Vec<ChunkDescriptor>> {
        match source {
            SheetSource::InMemory(rows) => Ok(plan_rows(sheet_index, rows.len(), self.chunk_size)),
            SheetSource::Queryable(query) => {
                let count = self.query_source.count(query).await?;
                log::debug!(
                    "Sheet {} query on '{}' matched {} rows",
                    sheet_index,
                    query.table,
                    count
                );
                Ok(plan_pages(
                    sheet_index,
                    count,
                    self.chunk_size,
                    self.empty_query_emits_page,
                ))
            }
            SheetSource::Empty => Ok(Vec::new()),
        }
    }
}

/// Consecutive row slices covering `0..total`; the last may be shorter.
pub fn plan_rows(sheet_index: usize, total: usize, chunk_size: ChunkSize) -> Vec<ChunkDescriptor> {
    let size = chunk_size.get();
    (0..total)
        .step_by(size)
        .enumerate()
        .map(|(ordinal, start)| ChunkDescriptor {
            sheet_index,
            ordinal,
            bounds: ChunkBounds::Rows {
                start,
                end: (start + size).min(total),
            },
        })
        .collect()
}

/// Pages `1..=ceil(count / chunk_size)`.
///
/// A zero count yields no pages unless `emit_for_empty` is set, in which case
/// a single page 1 is produced.
pub fn plan_pages(
    sheet_index: usize,
    count: u64,
    chunk_size: ChunkSize,
    emit_for_empty: bool,
) -> Vec<ChunkDescriptor> {
    let size = chunk_size.get();
    let mut pages = count.div_ceil(size as u64);
    if pages == 0 && emit_for_empty {
        pages = 1;
    }

    (1..=pages)
        .enumerate()
        .map(|(ordinal, number)| ChunkDescriptor {
            sheet_index,
            ordinal,
            bounds: ChunkBounds::Page(PageWindow { number, size }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::source::{RowCollection, SerializedQuery};
    use crate::domains::export::types::Row;
    use async_trait::async_trait;

    struct FixedCount(u64);

    #[async_trait]
    impl QuerySource for FixedCount {
        async fn count(&self, _query: &SerializedQuery) -> ExportResult<u64> {
            Ok(self.0)
        }

        async fn fetch_page(&self, _query: &SerializedQuery) -> ExportResult<Vec<Row>> {
            Ok(Vec::new())
        }
    }

    fn size(n: usize) -> ChunkSize {
        ChunkSize::new(n).unwrap()
    }

    #[test]
    fn test_rows_cover_everything_without_gaps() {
        for total in [0usize, 1, 999, 1000, 1001, 2500] {
            for chunk in [1usize, 7, 1000] {
                let plan = plan_rows(0, total, size(chunk));
                assert_eq!(plan.len(), total.div_ceil(chunk));

                let mut expected_start = 0;
                for (i, descriptor) in plan.iter().enumerate() {
                    assert_eq!(descriptor.ordinal, i);
                    match descriptor.bounds {
                        ChunkBounds::Rows { start, end } => {
                            assert_eq!(start, expected_start);
                            assert!(end > start && end - start <= chunk);
                            expected_start = end;
                        }
                        ChunkBounds::Page(_) => panic!("unexpected page chunk"),
                    }
                }
                assert_eq!(expected_start, total);
            }
        }
    }

    #[test]
    fn test_2500_rows_by_1000() {
        let plan = plan_rows(0, 2500, size(1000));
        let bounds: Vec<_> = plan.iter().map(|d| d.bounds).collect();
        assert_eq!(
            bounds,
            vec![
                ChunkBounds::Rows { start: 0, end: 1000 },
                ChunkBounds::Rows { start: 1000, end: 2000 },
                ChunkBounds::Rows { start: 2000, end: 2500 },
            ]
        );
    }

    #[test]
    fn test_pages_are_numbered_from_one() {
        let plan = plan_pages(1, 2001, size(1000), false);
        let numbers: Vec<u64> = plan
            .iter()
            .map(|d| match d.bounds {
                ChunkBounds::Page(page) => page.number,
                ChunkBounds::Rows { .. } => panic!("unexpected row chunk"),
            })
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(plan.iter().all(|d| d.sheet_index == 1));
    }

    #[test]
    fn test_zero_count_policy() {
        assert!(plan_pages(0, 0, size(1000), false).is_empty());

        let single = plan_pages(0, 0, size(1000), true);
        assert_eq!(single.len(), 1);
        assert_eq!(
            single[0].bounds,
            ChunkBounds::Page(PageWindow { number: 1, size: 1000 })
        );
    }

    #[tokio::test]
    async fn test_plan_dispatches_on_source() {
        let counter = FixedCount(45);
        let planner = ChunkPlanner::new(&counter, size(10), false);

        let query = SerializedQuery::table("orders");
        let pages = planner.plan(0, SheetSource::Queryable(&query)).await.unwrap();
        assert_eq!(pages.len(), 5);

        let rows = RowCollection::from_rows((0..12).map(|i| vec![i]));
        let slices = planner.plan(1, SheetSource::InMemory(&rows)).await.unwrap();
        assert_eq!(slices.len(), 2);

        let none = planner.plan(2, SheetSource::Empty).await.unwrap();
        assert!(none.is_empty());
    }
}

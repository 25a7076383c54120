//! Aggregate counters over the seen-events table.

use std::collections::HashMap;

use sqlx::{Row, SqlitePool};

use crate::DedupeError;

/// Summary of the dedupe store contents.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupeStats {
    /// Distinct event IDs recorded.
    pub total_unique: i64,
    /// Events observed more than once.
    pub events_with_duplicates: i64,
    /// Sum of all observation counts.
    pub total_seen: i64,
    /// `events_with_duplicates / total_unique` (0 when empty).
    pub duplicate_rate: f64,
    /// Distinct events per source.
    pub by_source: HashMap<String, i64>,
}

pub(crate) async fn collect(pool: &SqlitePool) -> Result<DedupeStats, DedupeError> {
    let total_unique: i64 = sqlx::query("SELECT COUNT(*) AS n FROM seen_events")
        .fetch_one(pool)
        .await?
        .get("n");

    let events_with_duplicates: i64 =
        sqlx::query("SELECT COUNT(*) AS n FROM seen_events WHERE seen_count > 1")
            .fetch_one(pool)
            .await?
            .get("n");

    let total_seen: i64 = sqlx::query("SELECT COALESCE(SUM(seen_count), 0) AS n FROM seen_events")
        .fetch_one(pool)
        .await?
        .get("n");

    let mut by_source = HashMap::new();
    let rows = sqlx::query(
        "SELECT source, COUNT(*) AS n FROM seen_events WHERE source IS NOT NULL GROUP BY source",
    )
    .fetch_all(pool)
    .await?;
    for row in rows {
        by_source.insert(row.get::<String, _>("source"), row.get::<i64, _>("n"));
    }

    let duplicate_rate = if total_unique > 0 {
        events_with_duplicates as f64 / total_unique as f64
    } else {
        0.0
    };

    Ok(DedupeStats {
        total_unique,
        events_with_duplicates,
        total_seen,
        duplicate_rate,
        by_source,
    })
}

use tracing::info;

use crate::db::{quote, TableStore};
use crate::error::StoreError;

/// Per-location price statistics over the whole staging table.
///
/// `most_common_area` is the mode of the known areas of a location. When several
/// areas are equally frequent the smallest one wins; it is NULL when no listing
/// of that location had a parsable area.
pub fn aggregate_query(staging: &str) -> String {
    let staging = quote(staging);
    format!(
        "WITH location_stats AS (
            SELECT location,
                   AVG(price) AS avg_price,
                   MAX(price) AS max_price,
                   MIN(price) AS min_price
            FROM {staging}
            GROUP BY location
        ),
        area_counts AS (
            SELECT location, area, COUNT(*) AS n
            FROM {staging}
            WHERE area IS NOT NULL
            GROUP BY location, area
        ),
        ranked_areas AS (
            SELECT location, area,
                   ROW_NUMBER() OVER (PARTITION BY location ORDER BY n DESC, area ASC) AS area_rank
            FROM area_counts
        )
        SELECT s.location,
               s.avg_price,
               s.max_price,
               s.min_price,
               r.area AS most_common_area
        FROM location_stats s
        LEFT JOIN ranked_areas r ON r.location = s.location AND r.area_rank = 1
        ORDER BY s.location"
    )
}

/// Same columns as [`aggregate_query`], no rows.
const EMPTY_AGGREGATE: &str = "SELECT CAST(NULL AS TEXT) AS location,
        CAST(NULL AS REAL) AS avg_price,
        CAST(NULL AS REAL) AS max_price,
        CAST(NULL AS REAL) AS min_price,
        CAST(NULL AS REAL) AS most_common_area
    WHERE 0";

/// Rebuild `target` from `staging`, replacing its previous contents in one step.
pub fn refresh(tables: &dyn TableStore, staging: &str, target: &str) -> Result<usize, StoreError> {
    let query = if tables.table_exists(staging)? {
        aggregate_query(staging)
    } else {
        EMPTY_AGGREGATE.to_string()
    };
    let rows = tables.replace_table_from_query(target, &query)?;
    info!(table = target, locations = rows, "aggregates refreshed");
    Ok(rows)
}

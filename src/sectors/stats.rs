use diesel::dsl::count_star;
use diesel::prelude::*;
use log::error;
use serde::Serialize;
use uuid::Uuid;

use crate::core::shared::schema::leads;
use crate::core::shared::DbPool;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub new: i64,
    pub contacted: i64,
    pub responded: i64,
    pub qualified: i64,
    pub nurture: i64,
    pub closed: i64,
    pub opted_out: i64,
    pub invalid: i64,
    pub total: i64,
}

impl StatusCounts {
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = (&'a str, i64)>) -> Self {
        let mut counts = Self::default();
        for (status, n) in rows {
            match status {
                "new" => counts.new += n,
                "contacted" => counts.contacted += n,
                "responded" => counts.responded += n,
                "qualified" => counts.qualified += n,
                "nurture" => counts.nurture += n,
                "closed" => counts.closed += n,
                "opted_out" => counts.opted_out += n,
                "invalid" => counts.invalid += n,
                _ => {}
            }
            counts.total += n;
        }
        counts
    }
}

fn query_counts(pool: &DbPool, team_id: Uuid, sector: &str) -> Result<StatusCounts, String> {
    let mut conn = pool.get().map_err(|e| e.to_string())?;
    let rows: Vec<(String, i64)> = leads::table
        .filter(leads::team_id.eq(team_id))
        .filter(leads::sector.eq(sector))
        .group_by(leads::status)
        .select((leads::status, count_star()))
        .load(&mut conn)
        .map_err(|e| e.to_string())?;

    Ok(StatusCounts::from_rows(
        rows.iter().map(|(s, n)| (s.as_str(), *n)),
    ))
}

/// Never fails: a database error is logged and reads as all zeros.
pub fn sector_stats(pool: &DbPool, team_id: Uuid, sector: &str) -> StatusCounts {
    query_counts(pool, team_id, sector).unwrap_or_else(|e| {
        error!("Sector stats for {sector} failed, returning zeros: {e}");
        StatusCounts::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_rows_into_counters() {
        let counts = StatusCounts::from_rows([("new", 4), ("qualified", 2), ("archived", 1)]);
        assert_eq!(counts.new, 4);
        assert_eq!(counts.qualified, 2);
        assert_eq!(counts.total, 7);
    }
}

//! Merging per-role grouped rows into one summary per time bucket.

use std::collections::BTreeMap;

use monitor_core::{AggregatedRow, Role};

use crate::snapshot::PeriodSummary;

/// Merge `(label, role)` rows into one [`PeriodSummary`] per label, sorted by label.
///
/// Only assistant rows contribute processing time; when a label has several
/// assistant rows their averages are combined weighted by row count.
pub fn summarize_periods(rows: &[AggregatedRow]) -> Vec<PeriodSummary> {
    let mut periods: BTreeMap<&str, (PeriodSummary, f64, u64)> = BTreeMap::new();

    for row in rows {
        let (period, latency_sum, latency_n) = periods
            .entry(row.time_group.as_str())
            .or_insert_with(|| (PeriodSummary::new(row.time_group.clone()), 0.0, 0));

        let count = period.messages.entry(row.role).or_insert(0);
        *count = count.saturating_add(row.count);
        period.prompt_tokens = period.prompt_tokens.saturating_add(row.tokens.prompt);
        period.completion_tokens = period.completion_tokens.saturating_add(row.tokens.completion);
        period.total_tokens = period.total_tokens.saturating_add(row.tokens.total);

        if row.role == Role::Assistant {
            if let Some(avg) = row.avg_processing_time.filter(|a| a.is_finite()) {
                *latency_sum += avg * row.count as f64;
                *latency_n = latency_n.saturating_add(row.count);
            }
        }
    }

    // BTreeMap iteration is label-ascending; labels are zero-padded so this is time order.
    periods
        .into_values()
        .map(|(mut period, latency_sum, latency_n)| {
            if latency_n > 0 {
                period.avg_processing_time = latency_sum / latency_n as f64;
            }
            period
        })
        .collect()
}

/// Total messages per role across a period series.
pub fn role_totals(periods: &[PeriodSummary]) -> BTreeMap<Role, u64> {
    let mut totals = BTreeMap::new();
    for period in periods {
        for (role, count) in &period.messages {
            let total = totals.entry(*role).or_insert(0u64);
            *total = total.saturating_add(*count);
        }
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_core::TokenCounts;

    fn row(label: &str, role: Role, count: u64, avg: Option<f64>, prompt: u64) -> AggregatedRow {
        AggregatedRow {
            time_group: label.into(),
            role,
            count,
            avg_processing_time: avg,
            tokens: TokenCounts::new(prompt, 1, None),
        }
    }

    #[test]
    fn test_merges_roles_per_label_sorted() {
        let rows = vec![
            row("2024-01-02", Role::User, 2, None, 5),
            row("2024-01-01", Role::Assistant, 3, Some(120.0), 0),
            row("2024-01-01", Role::User, 4, Some(999.0), 10),
        ];

        let periods = summarize_periods(&rows);
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].date, "2024-01-01");
        assert_eq!(periods[0].message_count(Role::User), 4);
        assert_eq!(periods[0].message_count(Role::Assistant), 3);
        assert_eq!(periods[0].prompt_tokens, 10);
        assert_eq!(periods[0].completion_tokens, 2);
        assert_eq!(periods[0].total_tokens, 12);
        // User rows never contribute processing time.
        assert_eq!(periods[0].avg_processing_time, 120.0);

        assert_eq!(periods[1].date, "2024-01-02");
        assert_eq!(periods[1].avg_processing_time, 0.0);
    }

    #[test]
    fn test_huge_token_rows_saturate() {
        let rows = vec![
            row("h", Role::User, 1, None, u64::MAX),
            row("h", Role::User, 1, None, 7),
        ];
        let periods = summarize_periods(&rows);
        assert_eq!(periods[0].prompt_tokens, u64::MAX);
        assert_eq!(periods[0].completion_tokens, 2);
        assert_eq!(periods[0].total_tokens, u64::MAX);
        assert_eq!(periods[0].message_count(Role::User), 2);
    }

    #[test]
    fn test_duplicate_assistant_rows_weighted() {
        let rows = vec![
            row("h", Role::Assistant, 1, Some(100.0), 0),
            row("h", Role::Assistant, 3, Some(200.0), 0),
        ];
        let periods = summarize_periods(&rows);
        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].message_count(Role::Assistant), 4);
        assert_eq!(periods[0].avg_processing_time, 175.0);
    }

    #[test]
    fn test_role_totals() {
        let rows = vec![
            row("a", Role::User, 2, None, 0),
            row("b", Role::User, 1, None, 0),
            row("b", Role::Assistant, 5, None, 0),
        ];
        let totals = role_totals(&summarize_periods(&rows));
        assert_eq!(totals[&Role::User], 3);
        assert_eq!(totals[&Role::Assistant], 5);
        assert!(summarize_periods(&[]).is_empty());
    }
}

//! Task planner: expands date range × symbols × kinds × intervals into tasks.

use crate::domain::{DataKind, DownloadTask, Interval, TaskId};
use crate::layout::StorageLayout;
use chrono::NaiveDate;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// The declarative job description the planner expands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanInput {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub kinds: Vec<DataKind>,
    pub intervals: Vec<Interval>,
    pub symbols: Vec<String>,
}

/// Every calendar day in `[start, end]`. Empty when `end < start`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

/// Expand the input into a duplicate-free task list, sorted by [`TaskId`].
///
/// The same input always yields the same list, which is what lets a re-run
/// line up with the files an earlier run left behind.
pub fn plan(input: &PlanInput, layout: &StorageLayout) -> Vec<DownloadTask> {
    let dates = date_range(input.start, input.end);
    let mut ids = BTreeSet::new();

    for &kind in &input.kinds {
        let intervals: Vec<Option<Interval>> = if kind.has_interval() {
            if input.intervals.is_empty() {
                warn!(data_type = %kind, "no kline intervals configured, skipping");
                continue;
            }
            input.intervals.iter().copied().map(Some).collect()
        } else {
            vec![None]
        };

        for symbol in &input.symbols {
            for &interval in &intervals {
                for &date in &dates {
                    ids.insert(TaskId::new(kind, symbol.as_str(), interval, date));
                }
            }
        }
    }

    if let (Some(first), Some(last)) = (dates.first(), dates.last()) {
        info!(
            days = dates.len(),
            from = %first,
            to = %last,
            symbols = input.symbols.len(),
            tasks = ids.len(),
            "planned download tasks"
        );
    }

    ids.into_iter().map(|id| layout.task(id)).collect()
}

use std::str::FromStr;

use chrono::NaiveDate;
use rustc_hash::FxHashMap;
use tracing::instrument;

use crate::pipeline::{FeatureColumn, FeatureDataset, FeatureRow};

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("unsupported aggregation method `{0}`, only `mean` is available")]
    UnsupportedMethod(String),
    #[error("bucket label `{0}` is neither `%Y-%m` nor `%Y`")]
    Bucket(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Statistic {
    #[default]
    Mean,
}

impl FromStr for Statistic {
    type Err = AggregateError;

    fn from_str(method: &str) -> Result<Self, Self::Err> {
        match method {
            "mean" => Ok(Statistic::Mean),
            other => Err(AggregateError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// Time bucket to group rows by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketColumn {
    YearMonth,
    Year,
}

impl BucketColumn {
    pub fn name(self) -> &'static str {
        match self {
            BucketColumn::YearMonth => "Year_month",
            BucketColumn::Year => "Year",
        }
    }

    fn label(self, row: &FeatureRow) -> &str {
        match self {
            BucketColumn::YearMonth => &row.buckets.year_month,
            BucketColumn::Year => &row.buckets.year,
        }
    }
}

/// Turn a bucket label into the first day of its period.
///
/// `%Y-%m` labels are tried first, then bare years.
pub fn parse_bucket(label: &str) -> Result<NaiveDate, AggregateError> {
    let label = label.trim();
    NaiveDate::parse_from_str(&format!("{label}-01"), "%Y-%m-%d")
        .or_else(|_| {
            label
                .parse::<i32>()
                .ok()
                .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1))
                .ok_or(())
        })
        .map_err(|_| AggregateError::Bucket(label.to_string()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupedRow {
    pub bucket: NaiveDate,
    /// One value per grouped column; `None` if the bucket had no value for it.
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupedDataset {
    pub by: BucketColumn,
    pub statistic: Statistic,
    pub columns: Vec<FeatureColumn>,
    /// Sorted by bucket, ascending.
    pub rows: Vec<GroupedRow>,
}

impl GroupedDataset {
    pub fn column(&self, column: FeatureColumn) -> Option<Vec<(NaiveDate, Option<f64>)>> {
        let index = self.columns.iter().position(|&c| c == column)?;
        Some(self.rows.iter().map(|row| (row.bucket, row.values[index])).collect())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(value) = value.filter(|value| !value.is_nan()) {
            self.sum += value;
            self.count += 1;
        }
    }

    fn finish(self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Reduce `columns` of every row sharing the same bucket to a single value.
///
/// Missing values are skipped, as are NaNs. An empty dataset gives an empty result.
#[instrument(skip(dataset, columns), fields(rows = dataset.len()))]
pub fn group_by(
    dataset: &FeatureDataset,
    by: BucketColumn,
    columns: &[FeatureColumn],
    method: &str,
) -> Result<GroupedDataset, AggregateError> {
    let statistic: Statistic = method.parse()?;

    let mut groups: FxHashMap<NaiveDate, Vec<Mean>> = FxHashMap::default();
    for row in &dataset.rows {
        let bucket = parse_bucket(by.label(row))?;
        let accumulators = groups
            .entry(bucket)
            .or_insert_with(|| vec![Mean::default(); columns.len()]);
        for (accumulator, column) in accumulators.iter_mut().zip(columns) {
            accumulator.push(column.value(row));
        }
    }

    let mut rows: Vec<GroupedRow> = groups
        .into_iter()
        .map(|(bucket, accumulators)| GroupedRow {
            bucket,
            values: accumulators.into_iter().map(Mean::finish).collect(),
        })
        .collect();
    rows.sort_unstable_by_key(|row| row.bucket);

    tracing::debug!(buckets = rows.len(), "grouped by {}", by.name());
    Ok(GroupedDataset {
        by,
        statistic,
        columns: columns.to_vec(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lexicon::Language, test_support::feature_row};
    use proptest::prelude::*;

    fn dataset(rows: Vec<FeatureRow>) -> FeatureDataset {
        FeatureDataset {
            language: Language::English,
            rows,
        }
    }

    fn with_crisis(id: i64, timestamp: &str, count: usize) -> FeatureRow {
        let mut row = feature_row(id, timestamp, "");
        row.crisis.count = count;
        row
    }

    #[test]
    fn mean_per_month() {
        let dataset = dataset(vec![
            with_crisis(1, "2020-01-05 00:00:00", 2),
            with_crisis(2, "2020-01-20 00:00:00", 4),
            with_crisis(3, "2020-02-01 00:00:00", 6),
        ]);

        let grouped = group_by(&dataset, BucketColumn::YearMonth, &[FeatureColumn::Crisis], "mean").unwrap();

        assert_eq!(
            grouped.rows,
            vec![
                GroupedRow {
                    bucket: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                    values: vec![Some(3.0)],
                },
                GroupedRow {
                    bucket: NaiveDate::from_ymd_opt(2020, 2, 1).unwrap(),
                    values: vec![Some(6.0)],
                },
            ]
        );
    }

    #[test]
    fn mean_per_year_skips_missing_values() {
        let mut first = with_crisis(1, "2019-03-01 00:00:00", 0);
        first.crisis.location = Some(10.0);
        let second = with_crisis(2, "2019-11-01 00:00:00", 0);
        let third = with_crisis(3, "2021-01-01 00:00:00", 0);

        let grouped = group_by(
            &dataset(vec![first, second, third]),
            BucketColumn::Year,
            &[FeatureColumn::CrisisLoc],
            "mean",
        )
        .unwrap();

        assert_eq!(
            grouped.column(FeatureColumn::CrisisLoc).unwrap(),
            vec![
                (NaiveDate::from_ymd_opt(2019, 1, 1).unwrap(), Some(10.0)),
                (NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(), None),
            ]
        );
        assert_eq!(grouped.column(FeatureColumn::Links), None);
    }

    #[test]
    fn unsupported_method() {
        let result = group_by(&dataset(vec![]), BucketColumn::Year, &[FeatureColumn::Crisis], "median");
        assert!(matches!(result, Err(AggregateError::UnsupportedMethod(method)) if method == "median"));
    }

    #[test]
    fn empty_dataset() {
        let grouped = group_by(&dataset(vec![]), BucketColumn::YearMonth, &FeatureColumn::GROUPED, "mean").unwrap();
        assert!(grouped.rows.is_empty());
        assert_eq!(grouped.columns.len(), 7);
    }

    #[test]
    fn test_parse_bucket() {
        assert_eq!(parse_bucket("2013-04").unwrap(), NaiveDate::from_ymd_opt(2013, 4, 1).unwrap());
        assert_eq!(parse_bucket("2013").unwrap(), NaiveDate::from_ymd_opt(2013, 1, 1).unwrap());
        assert!(parse_bucket("April").is_err());
        assert!(parse_bucket("2013-13").is_err());
    }

    proptest! {
        #[test]
        fn buckets_strictly_increasing(entries in prop::collection::vec((2001i32..2025, 1u32..=12, 0usize..20), 0..50)) {
            let rows = entries
                .iter()
                .enumerate()
                .map(|(i, &(year, month, count))| {
                    with_crisis(i as i64, &format!("{year}-{month:02}-15 12:00:00"), count)
                })
                .collect();

            let grouped = group_by(&dataset(rows), BucketColumn::YearMonth, &[FeatureColumn::Crisis], "mean").unwrap();

            prop_assert!(grouped.rows.windows(2).all(|pair| pair[0].bucket < pair[1].bucket));
            for row in &grouped.rows {
                let mean = row.values[0].unwrap();
                prop_assert!((0.0..20.0).contains(&mean));
            }
        }
    }
}

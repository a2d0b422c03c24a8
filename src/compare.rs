//! Line the grouped wiki signal up with an external series, and correlate feature columns.

use chrono::NaiveDate;
use rustc_hash::FxHashMap;

use crate::{
    aggregate::{BucketColumn, GroupedDataset},
    external::{ExternalSeries, Indicator},
    pipeline::{FeatureColumn, FeatureDataset},
};

#[derive(Debug, thiserror::Error)]
pub enum CompareError {
    #[error("external series are monthly, but the dataset is grouped by {0:?}")]
    GranularityMismatch(BucketColumn),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub bucket: NaiveDate,
    pub values: Vec<Option<f64>>,
    /// Mean of the series' points in this month, `None` if it has none.
    pub external: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedDataset {
    pub columns: Vec<FeatureColumn>,
    pub indicator: Indicator,
    /// Same order as the grouped rows.
    pub rows: Vec<JoinedRow>,
}

/// Left join of monthly grouped rows with `series` on the month.
pub fn join_series(
    grouped: &GroupedDataset,
    series: &ExternalSeries,
) -> Result<JoinedDataset, CompareError> {
    if grouped.by != BucketColumn::YearMonth {
        return Err(CompareError::GranularityMismatch(grouped.by));
    }

    let mut months: FxHashMap<NaiveDate, (f64, usize)> = FxHashMap::default();
    for point in &series.points {
        let entry = months.entry(point.year_month).or_default();
        entry.0 += point.value;
        entry.1 += 1;
    }

    let rows: Vec<JoinedRow> = grouped
        .rows
        .iter()
        .map(|row| JoinedRow {
            bucket: row.bucket,
            values: row.values.clone(),
            external: months
                .get(&row.bucket)
                .map(|&(sum, count)| sum / count as f64),
        })
        .collect();

    let matched = rows.iter().filter(|row| row.external.is_some()).count();
    tracing::debug!(
        rows = rows.len(),
        matched,
        indicator = series.indicator.name(),
        "joined external series"
    );

    Ok(JoinedDataset {
        columns: grouped.columns.clone(),
        indicator: series.indicator,
        rows,
    })
}

/// Square matrix of Pearson coefficients, `values[i][j]` pairs `columns[i]` with `columns[j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationMatrix {
    pub columns: Vec<FeatureColumn>,
    pub values: Vec<Vec<Option<f64>>>,
}

impl CorrelationMatrix {
    /// Columns compared by default: where the terms sit on the page, and how often they appear.
    pub const DEFAULT_COLUMNS: [FeatureColumn; 4] = [
        FeatureColumn::CrisisLoc,
        FeatureColumn::InflationLoc,
        FeatureColumn::Crisis,
        FeatureColumn::Inflation,
    ];

    pub fn get(&self, a: FeatureColumn, b: FeatureColumn) -> Option<f64> {
        let i = self.columns.iter().position(|&c| c == a)?;
        let j = self.columns.iter().position(|&c| c == b)?;
        self.values[i][j]
    }
}

/// Pearson correlation over the pairs where both values are present and not NaN.
///
/// `None` with fewer than two pairs, or if either side is constant.
pub fn pearson(pairs: impl IntoIterator<Item = (Option<f64>, Option<f64>)>) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = pairs
        .into_iter()
        .filter_map(|(x, y)| x.zip(y))
        .filter(|(x, y)| !x.is_nan() && !y.is_nan())
        .collect();
    if pairs.len() < 2 {
        return None;
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let (mut covariance, mut variance_x, mut variance_y) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        covariance += dx * dy;
        variance_x += dx * dx;
        variance_y += dy * dy;
    }

    if variance_x == 0.0 || variance_y == 0.0 {
        return None;
    }
    Some((covariance / (variance_x * variance_y).sqrt()).clamp(-1.0, 1.0))
}

pub fn correlation_matrix(dataset: &FeatureDataset, columns: &[FeatureColumn]) -> CorrelationMatrix {
    let series: Vec<Vec<Option<f64>>> = columns
        .iter()
        .map(|column| dataset.rows.iter().map(|row| column.value(row)).collect())
        .collect();

    let values = series
        .iter()
        .map(|a| {
            series
                .iter()
                .map(|b| pearson(a.iter().copied().zip(b.iter().copied())))
                .collect()
        })
        .collect();

    CorrelationMatrix {
        columns: columns.to_vec(),
        values,
    }
}

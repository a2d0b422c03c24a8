use chrono::NaiveDateTime;

use crate::{config::VandalismConfig, pipeline::pct_change, pipeline::FeatureRow};

/// Flags revisions whose link count collapses compared to the previous revision.
///
/// Blanking a page or replacing it with junk removes nearly all of its templates and
/// wiki links in one edit, which is rare for legitimate edits.
#[derive(Debug, Clone, PartialEq)]
pub struct VandalismDetector {
    threshold: f64,
    cutoff: NaiveDateTime,
    flag: bool,
    drop: bool,
}

impl VandalismDetector {
    pub fn new(config: &VandalismConfig) -> Self {
        Self {
            threshold: config.threshold,
            cutoff: config.cutoff,
            flag: config.flag,
            drop: config.drop,
        }
    }

    /// One verdict per row, in order. The first row never has a predecessor and is never flagged.
    pub fn detect(&self, rows: &[FeatureRow]) -> Vec<bool> {
        let links: Vec<f64> = rows.iter().map(|row| row.links as f64).collect();

        pct_change(&links, 1)
            .into_iter()
            .zip(rows)
            .map(|(change, row)| {
                change.is_some_and(|change| change < -self.threshold) && row.timestamp > self.cutoff
            })
            .collect()
    }

    /// Write `is_vandalized` and/or remove flagged rows, depending on the configuration.
    pub fn apply(&self, mut rows: Vec<FeatureRow>) -> Vec<FeatureRow> {
        if !self.flag && !self.drop {
            return rows;
        }

        let verdicts = self.detect(&rows);
        let flagged = verdicts.iter().filter(|&&verdict| verdict).count();
        tracing::info!(flagged, total = rows.len(), "vandalism check");

        if self.flag {
            for (row, verdict) in rows.iter_mut().zip(&verdicts) {
                row.is_vandalized = *verdict;
            }
        }

        if self.drop {
            let mut verdicts = verdicts.into_iter();
            rows.retain(|_| !verdicts.next().unwrap_or(false));
        }

        rows
    }
}

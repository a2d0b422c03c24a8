use std::borrow::Cow;

use chrono::NaiveDateTime;
use compact_str::CompactString;
use tracing::instrument;

use crate::{
    config::{ConfigError, PipelineConfig},
    export_parser::Revision,
    extract::{clean_text, count_links},
    lexicon::{apply_lexicon, FirstLocation, Language, Lexicon, LexiconError, MentionCount, TermSlot},
    vandalism::VandalismDetector,
};

/// Timestamp format of the export endpoint.
pub const EXPORT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
/// Timestamp format of previously saved datasets.
pub const SAVED_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("revision {id}: timestamp {value:?} does not match `{format}`")]
    Timestamp {
        id: i64,
        value: String,
        format: &'static str,
    },
    #[error("revision {id}: timestamp {value:?} was never parsed, but the dataset is marked as already processed")]
    UnparsedTimestamp { id: i64, value: String },
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value {value:?} for field `{field}`")]
    InvalidField { field: &'static str, value: String },
    #[error(transparent)]
    Lexicon(#[from] LexiconError),
}

/// How to read the `timestamp` of the incoming records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampMode {
    /// Straight from the paginator (`2004-08-05T02:30:31Z`).
    #[default]
    Export,
    /// Read back from a saved dataset (`2004-08-05 02:30:31`).
    Saved,
    /// Output of an earlier run; timestamps and buckets are taken as they are.
    AlreadyProcessed,
}

impl TimestampMode {
    fn format(self) -> Option<&'static str> {
        match self {
            TimestampMode::Export => Some(EXPORT_TIMESTAMP_FORMAT),
            TimestampMode::Saved => Some(SAVED_TIMESTAMP_FORMAT),
            TimestampMode::AlreadyProcessed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordTimestamp {
    Raw(String),
    Parsed(NaiveDateTime),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buckets {
    /// `%Y-%m`
    pub year_month: String,
    /// `%Y`
    pub year: String,
}

impl Buckets {
    pub fn from_timestamp(timestamp: &NaiveDateTime) -> Self {
        Self {
            year_month: timestamp.format("%Y-%m").to_string(),
            year: timestamp.format("%Y").to_string(),
        }
    }
}

/// Canonical input row of the feature pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionRecord {
    pub id: i64,
    pub timestamp: RecordTimestamp,
    pub contributor: Option<CompactString>,
    pub text: Option<String>,
    pub text_bytes: Option<u64>,
    pub text_xml: Option<CompactString>,
    /// Only set for rows that went through the pipeline before.
    pub buckets: Option<Buckets>,
}

impl From<Revision> for RevisionRecord {
    fn from(revision: Revision) -> Self {
        Self {
            id: revision.id,
            timestamp: RecordTimestamp::Raw(revision.timestamp.into()),
            contributor: revision.contributor.name().map(CompactString::from),
            text: revision.text.into_string(),
            text_bytes: revision.text_bytes,
            text_xml: revision.text_xml_space,
            buckets: None,
        }
    }
}

impl From<FeatureRow> for RevisionRecord {
    fn from(row: FeatureRow) -> Self {
        Self {
            id: row.id,
            timestamp: RecordTimestamp::Parsed(row.timestamp),
            contributor: row.contributor,
            text: Some(row.text),
            text_bytes: None,
            text_xml: None,
            buckets: Some(row.buckets),
        }
    }
}

/// Map a provider-specific field name onto the canonical one.
///
/// Strips stray quotes and flattens the attribute/content names of the export's `<text>`
/// element (`text.@bytes`, `text.@xml:space`, `text.#text`).
pub fn canonical_field_name(name: &str) -> Cow<'_, str> {
    let name: Cow<'_, str> = if name.contains('\'') {
        name.replace('\'', "").into()
    } else {
        name.into()
    };

    match name.as_ref() {
        "text.@bytes" => "text_bytes".into(),
        "text.@xml:space" => "text_xml".into(),
        "text.#text" => "text".into(),
        _ => name,
    }
}

impl RevisionRecord {
    /// Build a record from `(field, value)` pairs of a flattened table, e.g. a saved dataset.
    ///
    /// Field names go through [`canonical_field_name`]; unknown fields are ignored and empty
    /// values count as missing.
    pub fn from_fields<I, K, V>(fields: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut id = None;
        let mut timestamp = None;
        let mut username = None;
        let mut ip = None;
        let mut text = None;
        let mut text_bytes = None;
        let mut text_xml = None;
        let mut year_month = None;
        let mut year = None;

        for (name, value) in fields {
            let value = value.as_ref();
            if value.is_empty() {
                continue;
            }

            match canonical_field_name(name.as_ref()).as_ref() {
                "id" => {
                    id = Some(value.trim().parse::<i64>().map_err(|_| {
                        PipelineError::InvalidField {
                            field: "id",
                            value: value.to_string(),
                        }
                    })?);
                }
                "timestamp" => timestamp = Some(value.to_string()),
                "contributor.username" => username = Some(CompactString::from(value)),
                "contributor.ip" => ip = Some(CompactString::from(value)),
                "text" => text = Some(value.to_string()),
                "text_bytes" => {
                    // pandas writes integer columns with missing values as floats
                    text_bytes = value
                        .trim()
                        .parse::<u64>()
                        .ok()
                        .or_else(|| value.trim().parse::<f64>().ok().map(|bytes| bytes as u64));
                }
                "text_xml" => text_xml = Some(CompactString::from(value)),
                "Year_month" => year_month = Some(value.to_string()),
                "Year" => year = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            id: id.ok_or(PipelineError::MissingField("id"))?,
            timestamp: RecordTimestamp::Raw(timestamp.ok_or(PipelineError::MissingField("timestamp"))?),
            contributor: username.or(ip),
            text,
            text_bytes,
            text_xml,
            buckets: year_month
                .zip(year)
                .map(|(year_month, year)| Buckets { year_month, year }),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermFeatures {
    pub count: usize,
    /// Percent of the page above the first mention, `None` if there is no mention.
    pub location: Option<f64>,
    /// Trailing percent change of `count`.
    pub pct_change: f64,
}

/// One revision with all derived features.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub id: i64,
    pub timestamp: NaiveDateTime,
    pub contributor: Option<CompactString>,
    pub text: String,
    pub text_clean: Option<String>,
    pub crisis: TermFeatures,
    pub inflation: TermFeatures,
    pub links: usize,
    pub buckets: Buckets,
    pub is_vandalized: bool,
}

impl FeatureRow {
    pub fn term(&self, slot: TermSlot) -> &TermFeatures {
        match slot {
            TermSlot::Crisis => &self.crisis,
            TermSlot::Inflation => &self.inflation,
        }
    }

    pub fn term_mut(&mut self, slot: TermSlot) -> &mut TermFeatures {
        match slot {
            TermSlot::Crisis => &mut self.crisis,
            TermSlot::Inflation => &mut self.inflation,
        }
    }
}

/// Numeric columns of a [`FeatureRow`], as seen by aggregation and comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureColumn {
    Crisis,
    Inflation,
    CrisisLoc,
    InflationLoc,
    CrisisPct,
    InflationPct,
    Links,
    IsVandalized,
}

impl FeatureColumn {
    /// Columns reduced when grouping by time bucket.
    pub const GROUPED: [FeatureColumn; 7] = [
        FeatureColumn::Crisis,
        FeatureColumn::Inflation,
        FeatureColumn::CrisisLoc,
        FeatureColumn::InflationLoc,
        FeatureColumn::CrisisPct,
        FeatureColumn::InflationPct,
        FeatureColumn::IsVandalized,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FeatureColumn::Crisis => "crisis",
            FeatureColumn::Inflation => "inflation",
            FeatureColumn::CrisisLoc => "crisis_loc",
            FeatureColumn::InflationLoc => "inflation_loc",
            FeatureColumn::CrisisPct => "crisis_pct",
            FeatureColumn::InflationPct => "inflation_pct",
            FeatureColumn::Links => "links",
            FeatureColumn::IsVandalized => "is_vandalized",
        }
    }

    pub fn value(self, row: &FeatureRow) -> Option<f64> {
        match self {
            FeatureColumn::Crisis => Some(row.crisis.count as f64),
            FeatureColumn::Inflation => Some(row.inflation.count as f64),
            FeatureColumn::CrisisLoc => row.crisis.location,
            FeatureColumn::InflationLoc => row.inflation.location,
            FeatureColumn::CrisisPct => Some(row.crisis.pct_change),
            FeatureColumn::InflationPct => Some(row.inflation.pct_change),
            FeatureColumn::Links => Some(row.links as f64),
            FeatureColumn::IsVandalized => Some(if row.is_vandalized { 1.0 } else { 0.0 }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureDataset {
    pub language: Language,
    pub rows: Vec<FeatureRow>,
}

impl FeatureDataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Turn the rows back into pipeline input, for a run with [`TimestampMode::AlreadyProcessed`].
    pub fn into_records(self) -> Vec<RevisionRecord> {
        self.rows.into_iter().map(RevisionRecord::from).collect()
    }
}

/// `(x[i] - x[i - periods]) / x[i - periods]` for every position.
///
/// `None` where the change is undefined: the first `periods` positions and `0 / 0`.
/// A rise from zero gives `+inf`.
pub fn pct_change(values: &[f64], periods: usize) -> Vec<Option<f64>> {
    values
        .iter()
        .enumerate()
        .map(|(i, &current)| {
            if periods == 0 || i < periods {
                return None;
            }
            let previous = values[i - periods];
            let change = (current - previous) / previous;
            (!change.is_nan()).then_some(change)
        })
        .collect()
}

fn resolve_timestamp(
    id: i64,
    timestamp: RecordTimestamp,
    mode: TimestampMode,
) -> Result<NaiveDateTime, PipelineError> {
    match (timestamp, mode.format()) {
        // never parse twice
        (RecordTimestamp::Parsed(timestamp), _) => Ok(timestamp),
        (RecordTimestamp::Raw(value), None) => Err(PipelineError::UnparsedTimestamp { id, value }),
        (RecordTimestamp::Raw(value), Some(format)) => {
            NaiveDateTime::parse_from_str(value.trim(), format)
                .map_err(|_| PipelineError::Timestamp { id, value, format })
        }
    }
}

/// Cleaning and feature engineering over a whole revision table.
#[derive(Debug, Clone)]
pub struct FeaturePipeline {
    language: Language,
    lexicon: Lexicon,
    smoothing: usize,
    vandalism: VandalismDetector,
}

impl FeaturePipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            language: config.language,
            lexicon: Lexicon::with_overrides(config.language, &config.terms)?,
            smoothing: config.smoothing,
            vandalism: VandalismDetector::new(&config.vandalism),
        })
    }

    pub fn lexicon(&self) -> &Lexicon {
        &self.lexicon
    }

    /// Derive every feature column for `records`, in their given order.
    ///
    /// Records without text are dropped. Percent changes and the vandalism flag compare each
    /// row with its predecessors, so the order matters.
    #[instrument(skip(self, records), fields(language = self.language.code(), records = records.len()))]
    pub fn run(
        &self,
        records: Vec<RevisionRecord>,
        mode: TimestampMode,
    ) -> Result<FeatureDataset, PipelineError> {
        let total = records.len();
        let mut rows = Vec::with_capacity(total);

        for record in records {
            let Some(text) = record.text else {
                continue;
            };

            let timestamp = resolve_timestamp(record.id, record.timestamp, mode)?;
            let buckets = match (mode, record.buckets) {
                (TimestampMode::AlreadyProcessed, Some(buckets)) => buckets,
                _ => Buckets::from_timestamp(&timestamp),
            };
            let text_clean = clean_text(Some(&text));

            rows.push(FeatureRow {
                id: record.id,
                timestamp,
                contributor: record.contributor,
                text,
                text_clean,
                crisis: TermFeatures::default(),
                inflation: TermFeatures::default(),
                links: 0,
                buckets,
                is_vandalized: false,
            });
        }
        tracing::debug!(dropped = total - rows.len(), "dropped revisions without text");

        apply_lexicon(&mut rows, &MentionCount, self.lexicon.terms(), self.lexicon.slots())?;
        apply_lexicon(&mut rows, &FirstLocation, self.lexicon.terms(), self.lexicon.slots())?;

        for row in &mut rows {
            row.links = count_links(row.text_clean.as_deref());
        }

        for slot in TermSlot::ALL {
            let counts: Vec<f64> = rows.iter().map(|row| row.term(slot).count as f64).collect();
            for (row, change) in rows.iter_mut().zip(pct_change(&counts, self.smoothing)) {
                row.term_mut(slot).pct_change = change.unwrap_or(0.0);
            }
        }

        let rows = self.vandalism.apply(rows);

        tracing::info!(rows = rows.len(), "feature engineering done");
        Ok(FeatureDataset {
            language: self.language,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::record;

    fn english() -> FeaturePipeline {
        FeaturePipeline::new(&PipelineConfig {
            language: Language::English,
            ..PipelineConfig::default()
        })
        .unwrap()
    }

    fn sample_records() -> Vec<RevisionRecord> {
        vec![
            record(1, "2009-12-31T23:00:00Z", Some("Inflation is <b>high</b>. [[Oil]]")),
            record(2, "2010-01-15T08:00:00Z", None),
            record(3, "2010-01-20T08:00:00Z", Some("Economic crisis and inflation, {{cite}} [[Oil]]")),
            record(4, "2010-02-02T10:30:00Z", Some("inflation inflation inflation {{cite}} [[Oil]]")),
        ]
    }

    #[test]
    fn derives_all_features() {
        let dataset = english()
            .run(sample_records(), TimestampMode::Export)
            .unwrap();

        assert_eq!(dataset.language, Language::English);
        let ids: Vec<_> = dataset.rows.iter().map(|row| row.id).collect();
        assert_eq!(ids, vec![1, 3, 4]);

        let first = &dataset.rows[0];
        assert_eq!(first.text_clean.as_deref(), Some("inflation is high. [[oil]]"));
        assert_eq!(first.inflation.count, 1);
        assert_eq!(first.inflation.location, Some(0.0));
        assert_eq!(first.crisis.count, 0);
        assert_eq!(first.crisis.location, None);
        assert_eq!(first.links, 1);
        assert_eq!(first.buckets.year_month, "2009-12");
        assert_eq!(first.buckets.year, "2009");
        assert_eq!(first.inflation.pct_change, 0.0);

        let second = &dataset.rows[1];
        assert_eq!(second.crisis.count, 1);
        assert_eq!(second.links, 2);
        // 0 -> 1 mentions
        assert_eq!(second.crisis.pct_change, f64::INFINITY);
        assert_eq!(second.inflation.pct_change, 0.0);

        let third = &dataset.rows[2];
        assert_eq!(third.inflation.count, 3);
        assert_eq!(third.inflation.pct_change, 2.0);
        // 1 -> 0 mentions
        assert_eq!(third.crisis.pct_change, -1.0);
        assert_eq!(third.buckets.year_month, "2010-02");
    }

    #[test]
    fn smoothing_window_looks_further_back() {
        let pipeline = FeaturePipeline::new(&PipelineConfig {
            language: Language::English,
            smoothing: 2,
            ..PipelineConfig::default()
        })
        .unwrap();

        let dataset = pipeline.run(sample_records(), TimestampMode::Export).unwrap();
        let changes: Vec<_> = dataset.rows.iter().map(|row| row.inflation.pct_change).collect();
        assert_eq!(changes, vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn reprocessing_is_idempotent() {
        let pipeline = english();
        let first = pipeline.run(sample_records(), TimestampMode::Export).unwrap();

        let second = pipeline
            .run(first.clone().into_records(), TimestampMode::AlreadyProcessed)
            .unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn already_processed_keeps_existing_buckets() {
        let mut records = english()
            .run(sample_records(), TimestampMode::Export)
            .unwrap()
            .into_records();
        records[0].buckets = Some(Buckets {
            year_month: "1999-01".to_string(),
            year: "1999".to_string(),
        });

        let dataset = english()
            .run(records, TimestampMode::AlreadyProcessed)
            .unwrap();
        assert_eq!(dataset.rows[0].buckets.year_month, "1999-01");
        assert_eq!(dataset.rows[1].buckets.year_month, "2010-01");
    }

    #[test]
    fn raw_timestamp_in_processed_dataset_is_an_error() {
        let result = english().run(sample_records(), TimestampMode::AlreadyProcessed);
        assert!(matches!(
            result,
            Err(PipelineError::UnparsedTimestamp { id: 1, .. })
        ));
    }

    #[test]
    fn wrong_timestamp_format_is_an_error() {
        let result = english().run(sample_records(), TimestampMode::Saved);
        assert!(matches!(
            result,
            Err(PipelineError::Timestamp {
                id: 1,
                format: SAVED_TIMESTAMP_FORMAT,
                ..
            })
        ));
    }

    #[test]
    fn saved_rows_are_renamed_and_parsed() {
        let record = RevisionRecord::from_fields([
            ("'id'", "42"),
            ("timestamp", "2015-06-01 12:00:00"),
            ("contributor.username", "Someone"),
            ("text.@bytes", "31.0"),
            ("text.@xml:space", "preserve"),
            ("text.#text", "La inflación y la crisis económica"),
            ("unused", "x"),
        ])
        .unwrap();

        assert_eq!(record.id, 42);
        assert_eq!(record.text_bytes, Some(31));
        assert_eq!(record.text_xml.as_deref(), Some("preserve"));
        assert_eq!(record.contributor.as_deref(), Some("Someone"));

        let pipeline = FeaturePipeline::new(&PipelineConfig::default()).unwrap();
        let dataset = pipeline.run(vec![record], TimestampMode::Saved).unwrap();
        assert_eq!(dataset.language, Language::Spanish);
        assert_eq!(dataset.rows[0].crisis.count, 1);
        assert_eq!(dataset.rows[0].inflation.count, 1);
        assert_eq!(dataset.rows[0].buckets.year, "2015");
    }

    #[test]
    fn saved_row_without_id_is_rejected() {
        let result = RevisionRecord::from_fields([("timestamp", "2015-06-01 12:00:00")]);
        assert!(matches!(result, Err(PipelineError::MissingField("id"))));
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_field_name("'text.#text'"), "text");
        assert_eq!(canonical_field_name("text.@bytes"), "text_bytes");
        assert_eq!(canonical_field_name("text.@xml:space"), "text_xml");
        assert_eq!(canonical_field_name("timestamp"), "timestamp");
    }

    #[test]
    fn test_pct_change() {
        let values = [0.0, 0.0, 2.0, 4.0, 1.0];
        assert_eq!(
            pct_change(&values, 1),
            vec![None, None, Some(f64::INFINITY), Some(1.0), Some(-0.75)]
        );
        assert_eq!(pct_change(&values, 2), vec![None, None, Some(f64::INFINITY), Some(f64::INFINITY), Some(-0.5)]);
    }
}

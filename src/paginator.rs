//! Walk a page's revision history through the `Special:Export` endpoint, one batch at a time.
//!
//! Each request asks for up to `page_size` revisions after a cursor; the timestamp of the
//! last revision in a batch becomes the cursor for the next one.

use std::{fmt, thread, time::Duration};

use chrono::NaiveDateTime;
use reqwest::{blocking::Client, StatusCode};
use serde::Deserialize;
use tracing::instrument;

use crate::{
    config::{ConfigError, HarvestConfig},
    export_parser::{parse_export, ParsingError, Revision},
    lexicon::Language,
    pipeline::{RevisionRecord, EXPORT_TIMESTAMP_FORMAT},
};

/// Position in the revision history.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Cursor {
    /// Before the oldest revision.
    #[default]
    Start,
    /// After the revision with this timestamp.
    At(NaiveDateTime),
}

impl Cursor {
    /// Value of the `offset` form field.
    pub fn as_offset(&self) -> String {
        match self {
            Cursor::Start => "1".to_string(),
            Cursor::At(timestamp) => timestamp.format(EXPORT_TIMESTAMP_FORMAT).to_string(),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_offset())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest<'a> {
    pub page: &'a str,
    pub limit: usize,
    pub offset: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("request failed")]
    Http(#[from] reqwest::Error),
    #[error("export endpoint answered with status {0}")]
    Status(StatusCode),
    #[error("{0}")]
    Other(String),
}

/// Something that answers export requests with an export XML document.
pub trait RevisionSource {
    fn fetch_export(&mut self, request: &ExportRequest<'_>) -> Result<String, SourceError>;
}

/// `https://<language>.wikipedia.org/w/index.php?title=Special:Export`
pub fn export_endpoint(language: Language) -> String {
    format!(
        "https://{}.wikipedia.org/w/index.php?title=Special:Export",
        language.code()
    )
}

/// [`RevisionSource`] backed by a blocking HTTP client.
#[derive(Debug, Clone)]
pub struct ExportClient {
    client: Client,
    endpoint: String,
}

impl ExportClient {
    pub fn new(config: &HarvestConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            endpoint: export_endpoint(config.language),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl RevisionSource for ExportClient {
    fn fetch_export(&mut self, request: &ExportRequest<'_>) -> Result<String, SourceError> {
        let limit = request.limit.to_string();
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("pages", request.page),
                ("action", "submit"),
                ("limit", limit.as_str()),
                ("offset", request.offset.as_str()),
            ])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status));
        }
        Ok(response.text()?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("failed to fetch batch")]
    Source(#[from] SourceError),
    #[error("failed to parse batch")]
    Parse(#[from] ParsingError),
    #[error("revision {id}: cannot continue after timestamp {timestamp:?}")]
    Cursor { id: i64, timestamp: String },
    #[error("all {skipped} revisions of the batch were malformed")]
    NoUsableRevisions { skipped: usize },
}

/// Result of a single fetch.
#[derive(Debug)]
pub enum BatchOutcome {
    Page {
        revisions: Vec<Revision>,
        next_cursor: Cursor,
    },
    /// No revisions after the cursor.
    Exhausted,
    TransientError(BatchError),
}

/// What to do when a batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop and keep what was collected so far.
    #[default]
    StopWithPartial,
    /// Try the same cursor again, up to `max_retries` times in a row, then stop like
    /// [`FailurePolicy::StopWithPartial`].
    Retry { max_retries: usize },
    /// Abort the harvest with the error.
    Propagate,
}

/// Why a harvest ended.
#[derive(Debug)]
pub enum Termination {
    /// All requested iterations were fetched. The history may have more revisions.
    BudgetReached,
    Exhausted,
    Failed(BatchError),
}

#[derive(Debug)]
pub struct RevisionBatch {
    /// Cursor the batch was requested with.
    pub cursor: Cursor,
    /// In the order the source returned them.
    pub revisions: Vec<Revision>,
}

#[derive(Debug)]
pub struct Harvest {
    pub batches: Vec<RevisionBatch>,
    pub termination: Termination,
}

impl Harvest {
    /// Number of batches fetched.
    pub fn iterations(&self) -> usize {
        self.batches.len()
    }

    /// Number of revisions over all batches.
    pub fn len(&self) -> usize {
        self.batches.iter().map(|batch| batch.revisions.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revisions(&self) -> impl Iterator<Item = &Revision> {
        self.batches.iter().flat_map(|batch| &batch.revisions)
    }

    pub fn into_revisions(self) -> Vec<Revision> {
        self.batches
            .into_iter()
            .flat_map(|batch| batch.revisions)
            .collect()
    }

    /// All revisions as pipeline input, batches concatenated in order.
    pub fn into_records(self) -> Vec<RevisionRecord> {
        self.into_revisions()
            .into_iter()
            .map(RevisionRecord::from)
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("batch {} failed", completed + 1)]
    Batch {
        /// Batches fetched before the failure.
        completed: usize,
        #[source]
        source: BatchError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Paginator {
    page: String,
    page_size: usize,
    iterations: usize,
    delay: Duration,
    start: Cursor,
    failure_policy: FailurePolicy,
}

impl Paginator {
    pub fn new(config: &HarvestConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            page: config.page.clone(),
            page_size: config.page_size,
            iterations: config.iterations,
            delay: config.delay(),
            start: config.offset.map_or(Cursor::Start, Cursor::At),
            failure_policy: config.failure_policy,
        })
    }

    /// Fetch and parse the batch after `cursor`.
    pub fn step<S: RevisionSource + ?Sized>(&self, source: &mut S, cursor: &Cursor) -> BatchOutcome {
        let request = ExportRequest {
            page: &self.page,
            limit: self.page_size,
            offset: cursor.as_offset(),
        };

        let document = match source.fetch_export(&request) {
            Ok(document) => document,
            Err(error) => return BatchOutcome::TransientError(error.into()),
        };

        let page = match parse_export(&document) {
            Ok(Some(page)) => page,
            Ok(None) => return BatchOutcome::Exhausted,
            Err(error) => return BatchOutcome::TransientError(error.into()),
        };

        let Some(last) = page.revisions.last() else {
            if page.skipped_revisions > 0 {
                return BatchOutcome::TransientError(BatchError::NoUsableRevisions {
                    skipped: page.skipped_revisions,
                });
            }
            return BatchOutcome::Exhausted;
        };
        let next_cursor = match NaiveDateTime::parse_from_str(&last.timestamp, EXPORT_TIMESTAMP_FORMAT) {
            Ok(timestamp) => Cursor::At(timestamp),
            Err(_) => {
                return BatchOutcome::TransientError(BatchError::Cursor {
                    id: last.id,
                    timestamp: last.timestamp.to_string(),
                })
            }
        };

        BatchOutcome::Page {
            revisions: page.revisions,
            next_cursor,
        }
    }

    /// Fetch up to the configured number of batches, sleeping before every request.
    ///
    /// Only [`FailurePolicy::Propagate`] turns a failed batch into an error; otherwise the
    /// reason is reported in [`Harvest::termination`].
    #[instrument(skip(self, source), fields(page = self.page.as_str(), iterations = self.iterations))]
    pub fn harvest<S: RevisionSource + ?Sized>(&self, source: &mut S) -> Result<Harvest, HarvestError> {
        let mut cursor = self.start.clone();
        let mut batches: Vec<RevisionBatch> = Vec::new();
        let mut retries = 0;

        let termination = loop {
            if batches.len() >= self.iterations {
                break Termination::BudgetReached;
            }

            thread::sleep(self.delay);

            match self.step(source, &cursor) {
                BatchOutcome::Page {
                    revisions,
                    next_cursor,
                } => {
                    tracing::info!(
                        iteration = batches.len() + 1,
                        revisions = revisions.len(),
                        cursor = %next_cursor,
                        "fetched batch"
                    );
                    batches.push(RevisionBatch {
                        cursor: std::mem::replace(&mut cursor, next_cursor),
                        revisions,
                    });
                    retries = 0;
                }
                BatchOutcome::Exhausted => {
                    tracing::info!(cursor = %cursor, "no revisions left");
                    break Termination::Exhausted;
                }
                BatchOutcome::TransientError(error) => match self.failure_policy {
                    FailurePolicy::Retry { max_retries } if retries < max_retries => {
                        retries += 1;
                        tracing::warn!(
                            message = "batch failed, retrying",
                            error = %error,
                            attempt = retries,
                            cursor = %cursor,
                        );
                    }
                    FailurePolicy::StopWithPartial | FailurePolicy::Retry { .. } => {
                        tracing::warn!(
                            message = "batch failed, stopping with what was collected",
                            error = %error,
                            batches = batches.len(),
                            cursor = %cursor,
                        );
                        break Termination::Failed(error);
                    }
                    FailurePolicy::Propagate => {
                        return Err(HarvestError::Batch {
                            completed: batches.len(),
                            source: error,
                        })
                    }
                },
            }
        };

        let harvest = Harvest {
            batches,
            termination,
        };
        tracing::info!(
            batches = harvest.iterations(),
            revisions = harvest.len(),
            "harvest done"
        );
        Ok(harvest)
    }
}

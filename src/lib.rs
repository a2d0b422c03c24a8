// SPDX-License-Identifier: MPL-2.0
//! # wikisignal
//!
//! Turn the edit history of a Wikipedia page into an economic signal.
//!
//! ## Overview
//!
//! `wikisignal` downloads the full revision history of a page (by default the Spanish article on
//! Venezuela) through the `Special:Export` endpoint, measures how often and how prominently a small
//! lexicon of economic terms ("crisis económica", "inflación") appears in every revision, flags
//! likely vandalism, and reduces the result to monthly or yearly means that can be compared with
//! macroeconomic series such as the inflation rate or the price of oil.
//!
//! **Stages:**
//!
//! - **Harvest**: batched, rate limited export requests, each one continuing after the last
//!   revision of the previous batch.
//! - **Features**: cleaned text, mention counts, first-mention position, link counts, trailing
//!   percent changes and a vandalism flag per revision.
//! - **Aggregation**: one row per month or year.
//! - **Comparison**: join with an external series, correlation between feature columns.
//!
//! ## Getting Started
//!
//! ### Basic Usage
//!
//! Harvest a page and compute monthly means:
//!
//! ```rust,no_run
//! use wikisignal::aggregate::{group_by, BucketColumn};
//! use wikisignal::config::Config;
//! use wikisignal::paginator::{ExportClient, Paginator};
//! use wikisignal::pipeline::{FeatureColumn, FeaturePipeline, TimestampMode};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("wikisignal.toml")?;
//!
//!     let mut client = ExportClient::new(&config.harvest)?;
//!     let harvest = Paginator::new(&config.harvest)?.harvest(&mut client)?;
//!     println!(
//!         "{} revisions in {} batches, stopped: {:?}",
//!         harvest.len(),
//!         harvest.iterations(),
//!         harvest.termination
//!     );
//!
//!     let dataset = FeaturePipeline::new(&config.pipeline)?
//!         .run(harvest.into_records(), TimestampMode::Export)?;
//!     let monthly = group_by(&dataset, BucketColumn::YearMonth, &FeatureColumn::GROUPED, "mean")?;
//!
//!     for row in &monthly.rows {
//!         println!("{} {:?}", row.bucket, row.values);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Comparing with External Data
//!
//! ```rust,no_run
//! use wikisignal::aggregate::GroupedDataset;
//! use wikisignal::compare::join_series;
//! use wikisignal::external::{fetch_series, Indicator, SeriesRequest};
//!
//! fn compare(monthly: &GroupedDataset) -> Result<(), Box<dyn std::error::Error>> {
//!     let client = reqwest::blocking::Client::new();
//!     let petrol = fetch_series(
//!         &client,
//!         &SeriesRequest::petrol_price("<FRED api key>"),
//!         Indicator::PetrolPrice,
//!     )?;
//!
//!     for row in join_series(monthly, &petrol)?.rows {
//!         println!("{} {:?} {:?}", row.bucket, row.values, row.external);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules and API
//!
//! ### `paginator` Module
//!
//! **Purpose**: Fetches the revision history in batches.
//!
//! - The source of export documents is the [`paginator::RevisionSource`] trait; the HTTP
//!   implementation is [`paginator::ExportClient`].
//! - A failed batch is handled by the configured [`paginator::FailurePolicy`]. By default the harvest
//!   stops and returns everything collected so far.
//! - [`paginator::Harvest::termination`] tells whether the iteration budget ran out, the history was
//!   exhausted, or a batch failed.
//!
//! ### `export_parser` Module
//!
//! **Purpose**: Streaming parser for `Special:Export` documents.
//!
//! ### `pipeline`, `lexicon` and `extract` Modules
//!
//! **Purpose**: Feature engineering. [`pipeline::FeaturePipeline::run`] accepts freshly harvested
//! records, records read back from a saved dataset, or its own earlier output; see
//! [`pipeline::TimestampMode`].
//!
//! ### `vandalism` Module
//!
//! **Purpose**: Flags revisions whose link count collapses from one revision to the next.
//!
//! ### `aggregate`, `external` and `compare` Modules
//!
//! **Purpose**: Group by time bucket, load external series and line both up.
//!
//! ## Features and Configuration
//!
//! All settings live in [`config::Config`] and can be read from TOML. Nothing is read from the
//! environment.
//!
//! ### Logging and Error Handling
//!
//! - Uses the `tracing` crate for logging; the library never installs a subscriber.
//! - The export parser skips malformed revisions with a warning. Enable the `strict` feature to make
//!   it fail instead:
//!
//! ```toml
//! [dependencies]
//! wikisignal = { version = "0.1.0", features = ["strict"] }
//! ```
//!
//! ## Limitations
//!
//! - **Single threaded**: requests are sequential and the delay between them blocks the calling
//!   thread.
//! - **Heuristics**: the vandalism check only looks at link counts and will miss subtle edits.
//! - **Export Format**: tested with export format version 0.11.

pub mod aggregate;
pub mod compare;
pub mod config;
pub mod export_parser;
pub mod external;
pub mod extract;
pub mod lexicon;
pub mod paginator;
pub mod pipeline;
#[cfg(test)]
mod test_support;
pub mod vandalism;

//! Macroeconomic series to compare the wiki signal against.
//!
//! Two providers are supported: plain `Date,<value>` text files, and the observations
//! endpoint of the FRED API. Parsing is kept apart from fetching.

use chrono::{Datelike, NaiveDate};
use reqwest::{blocking::Client, StatusCode};
use serde::Deserialize;
use tracing::instrument;

pub const FRED_OBSERVATIONS_URL: &str = "https://api.stlouisfed.org/fred/series/observations";
/// Monthly Brent crude oil price, USD per barrel.
pub const PETROL_SERIES_ID: &str = "POILBREUSDM";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, thiserror::Error)]
pub enum SeriesError {
    #[error("request failed")]
    Http(#[from] reqwest::Error),
    #[error("provider answered with status {0}")]
    Status(StatusCode),
    #[error("invalid provider response")]
    Json(#[from] serde_json::Error),
    #[error("line {line}: expected `date,value`, got {content:?}")]
    MalformedRow { line: usize, content: String },
    #[error("line {line}: invalid date {value:?}")]
    InvalidDate { line: usize, value: String },
    #[error("line {line}: invalid value {value:?}")]
    InvalidValue { line: usize, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Indicator {
    #[serde(rename = "Inflation_Rate")]
    InflationRate,
    #[serde(rename = "Petrol_Price")]
    PetrolPrice,
}

impl Indicator {
    pub fn name(self) -> &'static str {
        match self {
            Indicator::InflationRate => "Inflation_Rate",
            Indicator::PetrolPrice => "Petrol_Price",
        }
    }

    fn has_log_value(self) -> bool {
        matches!(self, Indicator::InflationRate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
    /// `ln(value)`, inflation only.
    pub log_value: Option<f64>,
    /// First day of the point's month.
    pub year_month: NaiveDate,
}

impl SeriesPoint {
    fn new(indicator: Indicator, date: NaiveDate, value: f64) -> Self {
        Self {
            date,
            value,
            log_value: indicator.has_log_value().then(|| value.ln()),
            year_month: date.with_day(1).unwrap_or(date),
        }
    }
}

/// Points of one indicator, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalSeries {
    pub indicator: Indicator,
    pub points: Vec<SeriesPoint>,
}

impl ExternalSeries {
    fn new(indicator: Indicator, mut points: Vec<SeriesPoint>) -> Self {
        points.sort_by(|a, b| b.date.cmp(&a.date));
        Self { indicator, points }
    }
}

/// Where and how to get a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesRequest {
    /// `Date,<value>` lines behind a plain GET.
    Delimited { url: String },
    Fred {
        series_id: String,
        api_key: String,
        start: NaiveDate,
        end: NaiveDate,
    },
}

impl SeriesRequest {
    /// The petrol price series over the years the wiki history is usually harvested for.
    pub fn petrol_price(api_key: impl Into<String>) -> Self {
        SeriesRequest::Fred {
            series_id: PETROL_SERIES_ID.to_string(),
            api_key: api_key.into(),
            start: NaiveDate::from_ymd_opt(2002, 1, 1).unwrap_or_default(),
            end: NaiveDate::from_ymd_opt(2020, 11, 9).unwrap_or_default(),
        }
    }
}

#[instrument(skip(client, request), fields(indicator = indicator.name()))]
pub fn fetch_series(
    client: &Client,
    request: &SeriesRequest,
    indicator: Indicator,
) -> Result<ExternalSeries, SeriesError> {
    let response = match request {
        SeriesRequest::Delimited { url } => client.get(url).send()?,
        SeriesRequest::Fred {
            series_id,
            api_key,
            start,
            end,
        } => {
            let start = start.format(DATE_FORMAT).to_string();
            let end = end.format(DATE_FORMAT).to_string();
            client
                .get(FRED_OBSERVATIONS_URL)
                .query(&[
                    ("series_id", series_id.as_str()),
                    ("api_key", api_key.as_str()),
                    ("file_type", "json"),
                    ("observation_start", start.as_str()),
                    ("observation_end", end.as_str()),
                ])
                .send()?
        }
    };

    if !response.status().is_success() {
        return Err(SeriesError::Status(response.status()));
    }
    let body = response.text()?;

    let series = match request {
        SeriesRequest::Delimited { .. } => parse_delimited(&body, indicator)?,
        SeriesRequest::Fred { .. } => parse_fred_observations(&body, indicator)?,
    };
    tracing::info!(points = series.points.len(), "fetched external series");
    Ok(series)
}

/// Parse `Date,<value>` text. The first line is a header and the last one is whatever
/// follows the final newline, both are ignored.
pub fn parse_delimited(body: &str, indicator: Indicator) -> Result<ExternalSeries, SeriesError> {
    let lines: Vec<&str> = body.split('\n').collect();
    let data = match lines.len() {
        0..=2 => &[][..],
        len => &lines[1..len - 1],
    };

    let mut points = Vec::with_capacity(data.len());
    for (index, line) in data.iter().enumerate() {
        let line_number = index + 2;
        let line = line.trim_end_matches('\r');

        let mut fields = line.split(',');
        let (Some(date), Some(value), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(SeriesError::MalformedRow {
                line: line_number,
                content: line.to_string(),
            });
        };

        let date = NaiveDate::parse_from_str(date.trim(), DATE_FORMAT).map_err(|_| {
            SeriesError::InvalidDate {
                line: line_number,
                value: date.to_string(),
            }
        })?;
        let value = value
            .trim()
            .parse::<f64>()
            .map_err(|_| SeriesError::InvalidValue {
                line: line_number,
                value: value.to_string(),
            })?;

        points.push(SeriesPoint::new(indicator, date, value));
    }

    Ok(ExternalSeries::new(indicator, points))
}

#[derive(Debug, Deserialize)]
struct FredResponse {
    observations: Vec<FredObservation>,
}

#[derive(Debug, Deserialize)]
struct FredObservation {
    date: String,
    value: String,
}

/// Parse the JSON of FRED's `series/observations`. Missing observations (`"."`) are skipped.
pub fn parse_fred_observations(
    body: &str,
    indicator: Indicator,
) -> Result<ExternalSeries, SeriesError> {
    let response: FredResponse = serde_json::from_str(body)?;

    let mut points = Vec::with_capacity(response.observations.len());
    for (index, observation) in response.observations.into_iter().enumerate() {
        let line = index + 1;
        if observation.value.trim() == "." {
            tracing::debug!(date = observation.date.as_str(), "skipping missing observation");
            continue;
        }

        let date = NaiveDate::parse_from_str(&observation.date, DATE_FORMAT)
            .map_err(|_| SeriesError::InvalidDate {
                line,
                value: observation.date.clone(),
            })?;
        let value = observation
            .value
            .trim()
            .parse::<f64>()
            .map_err(|_| SeriesError::InvalidValue {
                line,
                value: observation.value.clone(),
            })?;

        points.push(SeriesPoint::new(indicator, date, value));
    }

    Ok(ExternalSeries::new(indicator, points))
}

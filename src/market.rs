use crate::model::FeatureVector;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Columns every normalized dataset must carry.
pub const REQUIRED_COLUMNS: [&str; 10] = [
    "Date",
    "Price_Float",
    "FearGreed_Scaled",
    "sin_month",
    "cos_month",
    "sin_doy",
    "cos_doy",
    "sin_dow",
    "cos_dow",
    "Year_Scaled",
];

/// Date layouts accepted in the `Date` column: ISO, then the raw export format.
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d %b, %Y"];

#[derive(Error, Debug)]
pub enum DatasetLoadError {
    #[error("Could not open dataset `{path}`: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed dataset: {0}")]
    Csv(#[from] csv::Error),
    #[error("Dataset is missing required column `{0}`")]
    MissingColumn(String),
    #[error("Row {row}: unparsable date `{value}`")]
    BadDate { row: usize, value: String },
    #[error("Row {row}: price must be positive and finite, got {price}")]
    BadPrice { row: usize, price: f64 },
    #[error("Row {row}: feature `{column}` is not finite")]
    BadFeature { row: usize, column: &'static str },
    #[error("No rows between {start} and {end}")]
    EmptyWindow { start: NaiveDate, end: NaiveDate },
}

/// The eight scaled/cyclical inputs of one trading day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketFeatures {
    pub sin_month: f64,
    pub cos_month: f64,
    pub sin_doy: f64,
    pub cos_doy: f64,
    pub sin_dow: f64,
    pub cos_dow: f64,
    pub year_scaled: f64,
    pub fear_greed: f64,
}

impl MarketFeatures {
    /// Canonical model input order: month, day of year, day of week
    /// (sin then cos each), scaled year, scaled sentiment.
    pub fn to_vector(&self) -> FeatureVector {
        [
            self.sin_month,
            self.cos_month,
            self.sin_doy,
            self.cos_doy,
            self.sin_dow,
            self.cos_dow,
            self.year_scaled,
            self.fear_greed,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketTick {
    pub date: NaiveDate,
    pub price: f64,
    pub features: MarketFeatures,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Price_Float")]
    price: f64,
    #[serde(rename = "FearGreed_Scaled")]
    fear_greed: f64,
    sin_month: f64,
    cos_month: f64,
    sin_doy: f64,
    cos_doy: f64,
    sin_dow: f64,
    cos_dow: f64,
    #[serde(rename = "Year_Scaled")]
    year_scaled: f64,
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
}

impl RawRow {
    fn into_tick(self, row: usize) -> Result<MarketTick, DatasetLoadError> {
        let date = parse_date(&self.date).ok_or_else(|| DatasetLoadError::BadDate {
            row,
            value: self.date.clone(),
        })?;
        if !(self.price.is_finite() && self.price > 0.0) {
            return Err(DatasetLoadError::BadPrice {
                row,
                price: self.price,
            });
        }
        let features = MarketFeatures {
            sin_month: self.sin_month,
            cos_month: self.cos_month,
            sin_doy: self.sin_doy,
            cos_doy: self.cos_doy,
            sin_dow: self.sin_dow,
            cos_dow: self.cos_dow,
            year_scaled: self.year_scaled,
            fear_greed: self.fear_greed,
        };
        let columns = REQUIRED_COLUMNS[2..].iter();
        let values = [
            features.fear_greed,
            features.sin_month,
            features.cos_month,
            features.sin_doy,
            features.cos_doy,
            features.sin_dow,
            features.cos_dow,
            features.year_scaled,
        ];
        if let Some((&column, _)) = columns.zip(values).find(|(_, v)| !v.is_finite()) {
            return Err(DatasetLoadError::BadFeature { row, column });
        }

        Ok(MarketTick {
            date,
            price: self.price,
            features,
        })
    }
}

/// Chronologically ordered ticks inside the configured training window.
#[derive(Debug, Clone)]
pub struct Dataset {
    ticks: Vec<MarketTick>,
}

impl Dataset {
    /// Reads a normalized CSV and keeps the rows dated within `[start, end]`.
    pub fn load(path: &Path, start: NaiveDate, end: NaiveDate) -> Result<Self, DatasetLoadError> {
        let file = File::open(path).map_err(|source| DatasetLoadError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let ticks = Self::read_ticks(file)?;
        let dataset = Self::from_ticks(ticks, start, end)?;
        info!(
            "Loaded {} trading days from {} ({} to {})",
            dataset.len(),
            path.display(),
            start,
            end
        );
        Ok(dataset)
    }

    pub fn read_ticks<R: std::io::Read>(source: R) -> Result<Vec<MarketTick>, DatasetLoadError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);
        let headers = reader.headers()?.clone();
        if let Some(missing) = REQUIRED_COLUMNS
            .iter()
            .find(|column| !headers.iter().any(|h| h == **column))
        {
            return Err(DatasetLoadError::MissingColumn(missing.to_string()));
        }

        let mut ticks = Vec::new();
        for (i, record) in reader.deserialize::<RawRow>().enumerate() {
            // Header is line 1, so data row i sits on line i + 2.
            ticks.push(record?.into_tick(i + 2)?);
        }
        debug!("Parsed {} dataset rows", ticks.len());
        Ok(ticks)
    }

    /// Filters to the inclusive window and orders ascending by date. The sort
    /// is stable, so same-day rows keep their file order.
    pub fn from_ticks(
        ticks: Vec<MarketTick>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Self, DatasetLoadError> {
        let mut ticks: Vec<MarketTick> = ticks
            .into_iter()
            .filter(|tick| tick.date >= start && tick.date <= end)
            .collect();
        if ticks.is_empty() {
            return Err(DatasetLoadError::EmptyWindow { start, end });
        }
        ticks.sort_by_key(|tick| tick.date);
        Ok(Dataset { ticks })
    }

    pub fn ticks(&self) -> &[MarketTick] {
        &self.ticks
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Last tick of the window, used for the end-of-generation liquidation.
    pub fn last(&self) -> &MarketTick {
        // from_ticks never builds an empty dataset
        &self.ticks[self.ticks.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prepare::encode_calendar;
    use std::fmt::Write;

    const HEADER: &str = "Date,Fear_Greed,Price,sin_month,cos_month,sin_doy,cos_doy,sin_dow,cos_dow,Year_Scaled,FearGreed_Scaled,Price_Float";

    fn row(date: NaiveDate, price: f64) -> String {
        let c = encode_calendar(date, 2020, 2023);
        format!(
            "{},50,{price},{},{},{},{},{},{},{},0.5,{price}",
            date.format("%Y-%m-%d"),
            c.sin_month,
            c.cos_month,
            c.sin_doy,
            c.cos_doy,
            c.sin_dow,
            c.cos_dow,
            c.year_scaled
        )
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_window_filter_is_inclusive_and_sorted() {
        let mut csv = String::from(HEADER);
        // Four years of data, every 10th day, written newest first.
        let mut date = ymd(2023, 12, 31);
        while date >= ymd(2020, 1, 1) {
            write!(csv, "\n{}", row(date, 100.0)).unwrap();
            date -= chrono::Duration::days(10);
        }
        write!(csv, "\n{}", row(ymd(2021, 1, 1), 1.0)).unwrap();
        write!(csv, "\n{}", row(ymd(2021, 12, 31), 2.0)).unwrap();

        let ticks = Dataset::read_ticks(csv.as_bytes()).unwrap();
        let dataset = Dataset::from_ticks(ticks, ymd(2021, 1, 1), ymd(2021, 12, 31)).unwrap();

        assert!(dataset
            .ticks()
            .iter()
            .all(|t| t.date >= ymd(2021, 1, 1) && t.date <= ymd(2021, 12, 31)));
        assert!(dataset.ticks().windows(2).all(|w| w[0].date <= w[1].date));
        assert_eq!(dataset.ticks()[0].date, ymd(2021, 1, 1));
        assert_eq!(dataset.last().date, ymd(2021, 12, 31));
    }

    #[test]
    fn test_missing_column_fails_fast() {
        let csv = "Date,Price_Float,FearGreed_Scaled\n2021-01-01,100,0.5\n";
        match Dataset::read_ticks(csv.as_bytes()) {
            Err(DatasetLoadError::MissingColumn(column)) => assert_eq!(column, "sin_month"),
            other => panic!("expected missing column, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_window_is_an_error() {
        let csv = format!("{HEADER}\n{}", row(ymd(2020, 5, 5), 100.0));
        let ticks = Dataset::read_ticks(csv.as_bytes()).unwrap();
        assert!(matches!(
            Dataset::from_ticks(ticks, ymd(2022, 1, 1), ymd(2022, 2, 1)),
            Err(DatasetLoadError::EmptyWindow { .. })
        ));
    }

    #[test]
    fn test_bad_rows_are_rejected() {
        let csv = format!("{HEADER}\n{}", row(ymd(2020, 5, 5), 0.0));
        assert!(matches!(
            Dataset::read_ticks(csv.as_bytes()),
            Err(DatasetLoadError::BadPrice { row: 2, .. })
        ));

        let csv = format!("{HEADER}\n{}", row(ymd(2020, 5, 5), 10.0).replacen("2020-05-05", "5/5/20", 1));
        assert!(matches!(
            Dataset::read_ticks(csv.as_bytes()),
            Err(DatasetLoadError::BadDate { .. })
        ));
    }

    #[test]
    fn test_parse_date_accepts_raw_export_format() {
        assert_eq!(parse_date("05 Mar, 2021"), Some(ymd(2021, 3, 5)));
        assert_eq!(parse_date("2021-03-05"), Some(ymd(2021, 3, 5)));
        assert_eq!(parse_date("March 5th"), None);
    }

    #[test]
    fn test_feature_vector_order() {
        let features = MarketFeatures {
            sin_month: 1.0,
            cos_month: 2.0,
            sin_doy: 3.0,
            cos_doy: 4.0,
            sin_dow: 5.0,
            cos_dow: 6.0,
            year_scaled: 7.0,
            fear_greed: 8.0,
        };
        assert_eq!(features.to_vector(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }
}

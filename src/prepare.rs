//! Builds the dataset the simulation reads from two raw exports: a daily
//! price series and the Fear & Greed index. `merge_raw_csv` joins them by
//! date, then `normalize_raw_csv` adds cyclical calendar encodings, a min-max
//! scaled year and a sentiment index scaled to [0, 1].

use crate::market::{parse_date, DatasetLoadError};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::fs::File;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalendarFeatures {
    pub sin_month: f64,
    pub cos_month: f64,
    pub sin_doy: f64,
    pub cos_doy: f64,
    pub sin_dow: f64,
    pub cos_dow: f64,
    pub year_scaled: f64,
}

fn cyclical(value: u32, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * value as f64 / period;
    (angle.sin(), angle.cos())
}

/// Encodes a date as sine/cosine pairs over month, day of year and day of
/// week (Monday = 1) plus the year scaled to `[min_year, max_year]`.
pub fn encode_calendar(date: NaiveDate, min_year: i32, max_year: i32) -> CalendarFeatures {
    // Leap day 366 shares a slot with 365 so the period stays 365.
    let day_of_year = date.ordinal().min(365);
    let day_of_week = date.weekday().number_from_monday();
    let (sin_month, cos_month) = cyclical(date.month(), 12.0);
    let (sin_doy, cos_doy) = cyclical(day_of_year, 365.0);
    let (sin_dow, cos_dow) = cyclical(day_of_week, 7.0);

    let year_scaled = if max_year != min_year {
        (date.year() - min_year) as f64 / (max_year - min_year) as f64
    } else {
        0.0
    };

    CalendarFeatures {
        sin_month,
        cos_month,
        sin_doy,
        cos_doy,
        sin_dow,
        cos_dow,
        year_scaled,
    }
}

/// Date layout of the price export, e.g. `01/31/2021`.
const PRICE_DATE_FORMAT: &str = "%m/%d/%Y";
/// Date layout of the Fear & Greed export, e.g. `31 Jan, 2021`.
const FEAR_GREED_DATE_FORMAT: &str = "%d %b, %Y";

#[derive(Debug, Deserialize)]
struct PriceRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Price")]
    price: String,
}

#[derive(Debug, Deserialize)]
struct FearGreedRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Debug, Serialize)]
struct MergedRecord<'a> {
    #[serde(rename = "Date")]
    date: &'a str,
    #[serde(rename = "Price")]
    price: &'a str,
    #[serde(rename = "Fear_Greed")]
    fear_greed: &'a str,
}

/// Joins the price export with the Fear & Greed export on their dates and
/// writes `Date,Price,Fear_Greed` rows in Fear & Greed file order. Days
/// missing from either export are dropped. Returns the number of rows written.
pub fn merge_raw_csv(
    price: &Path,
    fear_greed: &Path,
    output: &Path,
) -> Result<usize, DatasetLoadError> {
    let open = |path: &Path| {
        File::open(path).map_err(|source| DatasetLoadError::Open {
            path: path.to_path_buf(),
            source,
        })
    };
    let price_source = open(price)?;
    let fear_greed_source = open(fear_greed)?;
    let sink = File::create(output).map_err(|source| DatasetLoadError::Open {
        path: output.to_path_buf(),
        source,
    })?;
    let written = merge_rows(price_source, fear_greed_source, sink)?;
    info!(
        "Merged {} and {} into {} ({} rows)",
        price.display(),
        fear_greed.display(),
        output.display(),
        written
    );
    Ok(written)
}

fn merge_rows<P: std::io::Read, F: std::io::Read, W: std::io::Write>(
    price_source: P,
    fear_greed_source: F,
    sink: W,
) -> Result<usize, DatasetLoadError> {
    let mut prices = HashMap::new();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(price_source);
    for (i, record) in reader.deserialize::<PriceRow>().enumerate() {
        let row = record?;
        let date = NaiveDate::parse_from_str(&row.date, PRICE_DATE_FORMAT).map_err(|_| {
            DatasetLoadError::BadDate {
                row: i + 2,
                value: row.date.clone(),
            }
        })?;
        prices.insert(date, row.price);
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(fear_greed_source);
    let mut writer = csv::Writer::from_writer(sink);
    let mut written = 0;
    for (i, record) in reader.deserialize::<FearGreedRow>().enumerate() {
        let row = record?;
        let date = NaiveDate::parse_from_str(&row.date, FEAR_GREED_DATE_FORMAT).map_err(|_| {
            DatasetLoadError::BadDate {
                row: i + 2,
                value: row.date.clone(),
            }
        })?;
        if let Some(price) = prices.get(&date) {
            writer.serialize(MergedRecord {
                date: &row.date,
                price,
                fear_greed: &row.value,
            })?;
            written += 1;
        }
    }
    writer
        .flush()
        .map_err(|e| DatasetLoadError::Csv(csv::Error::from(e)))?;
    Ok(written)
}

#[derive(Debug, Deserialize)]
struct MergedRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Fear_Greed")]
    fear_greed: f64,
    #[serde(rename = "Price")]
    price: String,
}

#[derive(Debug, Serialize)]
struct NormalizedRow<'a> {
    #[serde(rename = "Date")]
    date: &'a str,
    #[serde(rename = "Fear_Greed")]
    fear_greed: f64,
    #[serde(rename = "Price")]
    price: &'a str,
    #[serde(rename = "Year")]
    year: i32,
    #[serde(rename = "Month")]
    month: u32,
    #[serde(rename = "Day")]
    day: u32,
    #[serde(rename = "Day_of_Year")]
    day_of_year: u32,
    #[serde(rename = "Day_of_Week")]
    day_of_week: u32,
    sin_month: f64,
    cos_month: f64,
    sin_doy: f64,
    cos_doy: f64,
    sin_dow: f64,
    cos_dow: f64,
    #[serde(rename = "Year_Scaled")]
    year_scaled: f64,
    #[serde(rename = "FearGreed_Scaled")]
    fear_greed_scaled: f64,
    #[serde(rename = "Price_Float")]
    price_float: f64,
}

/// Normalizes `input` into `output` and returns the number of rows written.
pub fn normalize_raw_csv(
    input: &Path,
    output: &Path,
    min_year: i32,
    max_year: i32,
) -> Result<usize, DatasetLoadError> {
    let source = File::open(input).map_err(|source| DatasetLoadError::Open {
        path: input.to_path_buf(),
        source,
    })?;
    let sink = File::create(output).map_err(|source| DatasetLoadError::Open {
        path: output.to_path_buf(),
        source,
    })?;
    let written = normalize_rows(source, sink, min_year, max_year)?;
    info!(
        "Normalized {} rows from {} into {}",
        written,
        input.display(),
        output.display()
    );
    Ok(written)
}

fn normalize_rows<R: std::io::Read, W: std::io::Write>(
    source: R,
    sink: W,
    min_year: i32,
    max_year: i32,
) -> Result<usize, DatasetLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(source);
    let mut writer = csv::Writer::from_writer(sink);
    let mut written = 0;

    for (i, record) in reader.deserialize::<MergedRow>().enumerate() {
        let row = record?;
        let line = i + 2;
        let date = parse_date(&row.date).ok_or_else(|| DatasetLoadError::BadDate {
            row: line,
            value: row.date.clone(),
        })?;
        let price_float: f64 = row
            .price
            .replace(',', "")
            .parse()
            .map_err(|_| DatasetLoadError::BadPrice {
                row: line,
                price: f64::NAN,
            })?;
        let calendar = encode_calendar(date, min_year, max_year);

        writer.serialize(NormalizedRow {
            date: &row.date,
            fear_greed: row.fear_greed,
            price: &row.price,
            year: date.year(),
            month: date.month(),
            day: date.day(),
            day_of_year: date.ordinal().min(365),
            day_of_week: date.weekday().number_from_monday(),
            sin_month: calendar.sin_month,
            cos_month: calendar.cos_month,
            sin_doy: calendar.sin_doy,
            cos_doy: calendar.cos_doy,
            sin_dow: calendar.sin_dow,
            cos_dow: calendar.cos_dow,
            year_scaled: calendar.year_scaled,
            fear_greed_scaled: row.fear_greed / 100.0,
            price_float,
        })?;
        written += 1;
    }
    writer
        .flush()
        .map_err(|e| DatasetLoadError::Csv(csv::Error::from(e)))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::Dataset;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_encode_calendar_known_values() {
        // 2021-03-01 is a Monday, day 60 of the year.
        let date = NaiveDate::from_ymd_opt(2021, 3, 1).unwrap();
        let c = encode_calendar(date, 2020, 2023);
        assert_abs_diff_eq!(c.sin_month, (2.0 * PI * 3.0 / 12.0).sin(), epsilon = 1e-12);
        assert_abs_diff_eq!(c.cos_month, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.sin_doy, (2.0 * PI * 60.0 / 365.0).sin(), epsilon = 1e-12);
        assert_abs_diff_eq!(c.sin_dow, (2.0 * PI / 7.0).sin(), epsilon = 1e-12);
        assert_abs_diff_eq!(c.year_scaled, 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_leap_day_366_folds_onto_365() {
        let dec31_leap = NaiveDate::from_ymd_opt(2020, 12, 31).unwrap();
        let dec31 = NaiveDate::from_ymd_opt(2021, 12, 31).unwrap();
        let a = encode_calendar(dec31_leap, 2020, 2023);
        let b = encode_calendar(dec31, 2020, 2023);
        assert_eq!(a.sin_doy, b.sin_doy);
        assert_eq!(a.cos_doy, b.cos_doy);
    }

    #[test]
    fn test_merge_then_normalize_yields_a_dataset() {
        let price = "Date,Price,Open,High,Low\n\
                     01/03/2021,\"32,782.02\",\"32,127.27\",\"34,608.56\",\"32,052.32\"\n\
                     01/02/2021,\"32,127.27\",\"29,374.15\",\"33,155.12\",\"29,091.18\"\n\
                     01/01/2021,\"29,374.15\",\"28,951.68\",\"29,600.63\",\"28,803.59\"\n";
        let fear_greed = "Date,Value,Classification\n\
                          \"04 Jan, 2021\",70,Greed\n\
                          \"03 Jan, 2021\",80,Extreme Greed\n\
                          \"01 Jan, 2021\",40,Fear\n";
        let mut merged = Vec::new();
        let written = merge_rows(price.as_bytes(), fear_greed.as_bytes(), &mut merged).unwrap();
        // 4 Jan has no price and 2 Jan has no sentiment value.
        assert_eq!(written, 2);

        let mut normalized = Vec::new();
        assert_eq!(normalize_rows(merged.as_slice(), &mut normalized, 2020, 2023).unwrap(), 2);

        let ticks = Dataset::read_ticks(normalized.as_slice()).unwrap();
        assert_eq!(ticks[0].date, NaiveDate::from_ymd_opt(2021, 1, 3).unwrap());
        assert_abs_diff_eq!(ticks[0].price, 32782.02, epsilon = 1e-9);
        assert_abs_diff_eq!(ticks[0].features.fear_greed, 0.8, epsilon = 1e-12);
        assert_eq!(ticks[1].date, NaiveDate::from_ymd_opt(2021, 1, 1).unwrap());
        assert_abs_diff_eq!(ticks[1].features.fear_greed, 0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_merge_rejects_unparsable_price_date() {
        let price = "Date,Price\n2021-01-01,100\n";
        let fear_greed = "Date,Value\n\"01 Jan, 2021\",40\n";
        assert!(matches!(
            merge_rows(price.as_bytes(), fear_greed.as_bytes(), Vec::new()),
            Err(DatasetLoadError::BadDate { row: 2, .. })
        ));
    }

    #[test]
    fn test_normalized_output_loads_as_dataset() {
        let raw = "Date,Fear_Greed,Price\n\
                   \"01 Jan, 2021\",40,\"29,374.15\"\n\
                   \"02 Jan, 2021\",55,\"32,127.27\"\n";
        let mut out = Vec::new();
        let written = normalize_rows(raw.as_bytes(), &mut out, 2020, 2023).unwrap();
        assert_eq!(written, 2);

        let ticks = Dataset::read_ticks(out.as_slice()).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_abs_diff_eq!(ticks[0].price, 29374.15, epsilon = 1e-9);
        assert_abs_diff_eq!(ticks[1].features.fear_greed, 0.55, epsilon = 1e-12);
    }
}

//! Yahoo Finance data provider.
//!
//! Price series and quote fields come from the v8 chart API, documents from
//! `quoteSummary`, and shares outstanding from the fundamentals timeseries
//! endpoint. Every request shares one retry loop with exponential backoff and
//! the circuit breaker.
//!
//! Yahoo Finance has no official API and is subject to unannounced format
//! changes; anything unexpected surfaces as `ResponseFormatChanged`.

use super::circuit_breaker::CircuitBreaker;
use super::{MarketDataProvider, ProviderError, RawRow};
use crate::domain::{Interval, MetaValue, SharesPoint};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const CHART_BASE: &str = "https://query2.finance.yahoo.com/v8/finance/chart";
const SUMMARY_BASE: &str = "https://query2.finance.yahoo.com/v10/finance/quoteSummary";
const TIMESERIES_BASE: &str =
    "https://query2.finance.yahoo.com/ws/fundamentals-timeseries/v1/finance/timeseries";

/// `info` is assembled from these quoteSummary modules.
const INFO_MODULES: &[&str] = &[
    "assetProfile",
    "summaryDetail",
    "defaultKeyStatistics",
    "financialData",
    "price",
];

/// quoteSummary module behind each document name.
fn summary_module(name: &str) -> Option<&'static str> {
    Some(match name {
        "balance_sheet" => "balanceSheetHistory",
        "quarterly_balance_sheet" => "balanceSheetHistoryQuarterly",
        "cashflow" => "cashflowStatementHistory",
        "quarterly_cashflow" => "cashflowStatementHistoryQuarterly",
        "financials" => "incomeStatementHistory",
        "quarterly_financials" => "incomeStatementHistoryQuarterly",
        "earnings" | "quarterly_earnings" => "earnings",
        "calendar" => "calendarEvents",
        "recommendations" => "recommendationTrend",
        "major_holders" => "majorHoldersBreakdown",
        "institutional_holders" => "institutionOwnership",
        "sustainability" => "esgScores",
        _ => return None,
    })
}

// ── Chart API response ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    meta: Map<String, Value>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
    events: Option<Events>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Default, Deserialize)]
struct Events {
    #[serde(default)]
    dividends: HashMap<String, DividendEvent>,
    #[serde(default)]
    splits: HashMap<String, SplitEvent>,
}

#[derive(Debug, Deserialize)]
struct DividendEvent {
    amount: f64,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct SplitEvent {
    numerator: f64,
    denominator: f64,
    date: i64,
}

impl SplitEvent {
    fn ratio(&self) -> Option<f64> {
        (self.numerator > 0.0 && self.denominator > 0.0).then(|| self.numerator / self.denominator)
    }
}

fn split_product(events: &Events, since: i64) -> f64 {
    events
        .splits
        .values()
        .filter(|s| s.date >= since)
        .filter_map(SplitEvent::ratio)
        .product()
}

/// Chart prices, volumes and dividends come back adjusted for every split
/// up to today. Scale each row by the splits after it so the cache holds
/// what actually traded. A row's own split is its ex-date and does not
/// apply to it.
fn undo_split_adjustment(rows: &mut [RawRow], later_splits: f64) {
    let mut factor = later_splits;
    for row in rows.iter_mut().rev() {
        if factor != 1.0 {
            for price in [&mut row.open, &mut row.high, &mut row.low, &mut row.close] {
                *price = price.map(|p| p * factor);
            }
            row.dividends *= factor;
            row.volume = row.volume.map(|v| (v as f64 / factor).round() as u64);
        }
        if row.stock_splits > 0.0 {
            factor *= row.stock_splits;
        }
    }
}

// ── quoteSummary response ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryResponse {
    quote_summary: SummaryResult,
}

#[derive(Debug, Deserialize)]
struct SummaryResult {
    result: Option<Vec<Map<String, Value>>>,
    error: Option<ApiError>,
}

pub struct YahooProvider {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
}

impl YahooProvider {
    pub fn new(circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            circuit_breaker,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    /// Transport-level retries for 429, 5xx and connection failures.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn chart_url(symbol: &str, interval: Interval, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        format!(
            "{CHART_BASE}/{symbol}?period1={}&period2={}&interval={interval}\
             &events=div%2Csplits&includePrePost=false",
            start.timestamp(),
            end.timestamp(),
        )
    }

    fn parse_chart(symbol: &str, resp: ChartResponse) -> Result<ChartData, ProviderError> {
        let result = resp.chart.result.ok_or_else(|| match resp.chart.error {
            Some(err) if err.code == "Not Found" => ProviderError::SymbolNotFound {
                symbol: symbol.to_string(),
            },
            Some(err) => {
                ProviderError::ResponseFormatChanged(format!("{}: {}", err.code, err.description))
            }
            None => ProviderError::ResponseFormatChanged("empty result with no error".into()),
        })?;

        result
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ResponseFormatChanged("result array is empty".into()))
    }

    /// Rows in `[start, end)` with dividend and split events attached to the
    /// last row at or before each event, scaled back to traded prices.
    ///
    /// `later_splits` is the product of split ratios dated at or after `end`,
    /// which Yahoo has already applied to every row in the window.
    fn parse_rows(
        data: ChartData,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        later_splits: f64,
    ) -> Result<Vec<RawRow>, ProviderError> {
        // An empty range comes back without timestamps.
        let Some(timestamps) = data.timestamp else {
            return Ok(Vec::new());
        };
        let quote = data.indicators.quote.into_iter().next().unwrap_or_default();

        let mut rows = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            let timestamp = DateTime::from_timestamp(ts, 0).ok_or_else(|| {
                ProviderError::ResponseFormatChanged(format!("invalid timestamp: {ts}"))
            })?;
            if timestamp < start || timestamp >= end {
                continue;
            }
            rows.push(RawRow {
                timestamp,
                open: quote.open.get(i).copied().flatten(),
                high: quote.high.get(i).copied().flatten(),
                low: quote.low.get(i).copied().flatten(),
                close: quote.close.get(i).copied().flatten(),
                volume: quote.volume.get(i).copied().flatten(),
                dividends: 0.0,
                stock_splits: 0.0,
            });
        }
        rows.sort_by_key(|r| r.timestamp);

        let events = data.events.unwrap_or_default();
        let later_splits = later_splits * split_product(&events, end.timestamp());
        let owner = |date: i64| -> Option<usize> {
            let at = DateTime::from_timestamp(date, 0)?;
            rows.partition_point(|r| r.timestamp <= at).checked_sub(1)
        };
        let dividends: Vec<_> = events
            .dividends
            .values()
            .filter_map(|d| owner(d.date).map(|i| (i, d.amount)))
            .collect();
        let splits: Vec<_> = events
            .splits
            .values()
            .filter(|s| s.date < end.timestamp())
            .filter_map(|s| Some((owner(s.date)?, s.ratio()?)))
            .collect();
        for (i, amount) in dividends {
            rows[i].dividends += amount;
        }
        for (i, ratio) in splits {
            rows[i].stock_splits = ratio;
        }

        undo_split_adjustment(&mut rows, later_splits);
        Ok(rows)
    }

    /// Product of split ratios from `since` up to now.
    fn splits_since(&self, symbol: &str, since: DateTime<Utc>) -> Result<f64, ProviderError> {
        let now = Utc::now();
        if since >= now {
            return Ok(1.0);
        }
        let url = format!(
            "{CHART_BASE}/{symbol}?period1={}&period2={}&interval=1d&events=split",
            since.timestamp(),
            now.timestamp(),
        );
        let chart: ChartResponse = self.get_json(symbol, &url)?;
        let data = Self::parse_chart(symbol, chart)?;
        Ok(data
            .events
            .as_ref()
            .map_or(1.0, |events| split_product(events, since.timestamp())))
    }

    /// GET with retry and circuit breaker logic.
    fn get_json<T: DeserializeOwned>(&self, symbol: &str, url: &str) -> Result<T, ProviderError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(ProviderError::CircuitBreakerTripped);
        }

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                tracing::debug!(symbol, attempt, ?delay, "retrying provider request");
                std::thread::sleep(delay);
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(ProviderError::CircuitBreakerTripped);
            }

            let resp = match self.client.get(url).send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_error = Some(ProviderError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(ProviderError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();
            match status {
                reqwest::StatusCode::FORBIDDEN => {
                    // IP ban: stop everything
                    self.circuit_breaker.trip();
                    return Err(ProviderError::CircuitBreakerTripped);
                }
                reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    self.circuit_breaker.record_failure();
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(60);
                    last_error = Some(ProviderError::RateLimited {
                        retry_after_secs: retry_after,
                    });
                    continue;
                }
                reqwest::StatusCode::UNAUTHORIZED => {
                    return Err(ProviderError::AuthenticationRequired(
                        "Yahoo Finance requires authentication".into(),
                    ));
                }
                reqwest::StatusCode::NOT_FOUND => {
                    return Err(ProviderError::SymbolNotFound {
                        symbol: symbol.to_string(),
                    });
                }
                s if !s.is_success() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(ProviderError::Other(format!("HTTP {s} for {symbol}")));
                    continue;
                }
                _ => {}
            }

            let parsed = resp.json::<T>().map_err(|e| {
                ProviderError::ResponseFormatChanged(format!(
                    "failed to parse response for {symbol}: {e}"
                ))
            })?;
            self.circuit_breaker.record_success();
            return Ok(parsed);
        }

        Err(last_error.unwrap_or_else(|| ProviderError::Other("max retries exceeded".into())))
    }

    fn quote_summary(&self, symbol: &str, modules: &[&str]) -> Result<Map<String, Value>, ProviderError> {
        let url = format!("{SUMMARY_BASE}/{symbol}?modules={}", modules.join("%2C"));
        let resp: SummaryResponse = self.get_json(symbol, &url)?;
        let result = resp.quote_summary.result.ok_or_else(|| match resp.quote_summary.error {
            Some(err) if err.code == "Not Found" => ProviderError::SymbolNotFound {
                symbol: symbol.to_string(),
            },
            Some(err) => {
                ProviderError::ResponseFormatChanged(format!("{}: {}", err.code, err.description))
            }
            None => ProviderError::ResponseFormatChanged("empty quoteSummary result".into()),
        })?;
        result
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ResponseFormatChanged("quoteSummary result is empty".into()))
    }
}

/// Yahoo wraps numbers as `{"raw": 1.5, "fmt": "1.50"}`; keep the raw value.
fn unwrap_raw(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("raw") => map.remove("raw").unwrap_or(Value::Null),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, unwrap_raw(v))).collect()),
        Value::Array(items) => Value::Array(items.into_iter().map(unwrap_raw).collect()),
        other => other,
    }
}

fn parse_shares(symbol: &str, body: &Value) -> Result<Vec<SharesPoint>, ProviderError> {
    let result = body
        .pointer("/timeseries/result/0")
        .ok_or_else(|| ProviderError::ResponseFormatChanged(format!("no timeseries result for {symbol}")))?;
    let (Some(timestamps), Some(values)) = (
        result.get("timestamp").and_then(Value::as_array),
        result.get("shares_out").and_then(Value::as_array),
    ) else {
        // No reports in range
        return Ok(Vec::new());
    };

    let mut points: Vec<SharesPoint> = timestamps
        .iter()
        .zip(values)
        .filter_map(|(ts, v)| {
            let date = DateTime::from_timestamp(ts.as_i64()?, 0)?.date_naive();
            let shares = v.as_u64().or_else(|| v.as_f64().map(|f| f.round() as u64))?;
            Some(SharesPoint { date, shares })
        })
        .collect();
    points.sort_by_key(|p| p.date);
    points.dedup_by_key(|p| p.date);
    Ok(points)
}

impl MarketDataProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch_series(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawRow>, ProviderError> {
        let url = Self::chart_url(symbol, interval, start, end);
        let chart: ChartResponse = self.get_json(symbol, &url)?;
        let data = Self::parse_chart(symbol, chart)?;
        let later_splits = self.splits_since(symbol, end)?;
        Self::parse_rows(data, start, end, later_splits)
    }

    fn fetch_scalar(&self, symbol: &str, field: &str) -> Result<MetaValue, ProviderError> {
        let url = format!("{CHART_BASE}/{symbol}?range=1d&interval=1d");
        let chart: ChartResponse = self.get_json(symbol, &url)?;
        let data = Self::parse_chart(symbol, chart)?;
        data.meta
            .get(field)
            .and_then(MetaValue::from_json)
            .ok_or_else(|| ProviderError::FieldNotFound {
                symbol: symbol.to_string(),
                field: field.to_string(),
            })
    }

    fn fetch_shares_outstanding(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SharesPoint>, ProviderError> {
        let period = |d: NaiveDate| d.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
        let url = format!(
            "{TIMESERIES_BASE}/{symbol}?symbol={symbol}&type=shares_out&period1={}&period2={}",
            period(start),
            period(end),
        );
        let body: Value = self.get_json(symbol, &url)?;
        let points = parse_shares(symbol, &body)?;
        Ok(points
            .into_iter()
            .filter(|p| p.date >= start && p.date < end)
            .collect())
    }

    fn fetch_document(&self, symbol: &str, name: &str) -> Result<Value, ProviderError> {
        if name == "info" {
            let modules = self.quote_summary(symbol, INFO_MODULES)?;
            let mut info = Map::new();
            for (_, module) in modules {
                if let Value::Object(fields) = unwrap_raw(module) {
                    info.extend(fields);
                }
            }
            return Ok(Value::Object(info));
        }

        let module = summary_module(name)
            .ok_or_else(|| ProviderError::Other(format!("no Yahoo source for document '{name}'")))?;
        let mut modules = self.quote_summary(symbol, &[module])?;
        modules
            .remove(module)
            .map(unwrap_raw)
            .ok_or_else(|| ProviderError::ResponseFormatChanged(format!("module {module} missing")))
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn chart(body: Value) -> ChartResponse {
        serde_json::from_value(body).unwrap()
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn parses_rows_with_events() {
        let resp = chart(json!({
            "chart": {
                "result": [{
                    "meta": {"exchangeName": "NMS"},
                    "timestamp": [1704205800, 1704292200],
                    "indicators": {"quote": [{
                        "open": [187.15, 184.22],
                        "high": [188.44, 185.88],
                        "low": [183.89, 183.43],
                        "close": [185.64, 184.25],
                        "volume": [82488700, null]
                    }]},
                    "events": {
                        "dividends": {"1704292200": {"amount": 0.24, "date": 1704292200}},
                        "splits": {"1704205800": {"numerator": 4.0, "denominator": 1.0, "date": 1704205800}}
                    }
                }],
                "error": null
            }
        }));
        let data = YahooProvider::parse_chart("AAPL", resp).unwrap();
        let (start, end) = window();
        let rows = YahooProvider::parse_rows(data, start, end, 1.0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].stock_splits, 4.0);
        assert_eq!(rows[1].dividends, 0.24);
        assert_eq!(rows[1].volume, None);
        assert_eq!(rows[0].close, Some(185.64));
    }

    #[test]
    fn split_adjusted_prices_are_restored() {
        // 2:1 split on the third session, and a 3:1 split after the window.
        let resp = chart(json!({
            "chart": {
                "result": [{
                    "timestamp": [1704205800, 1704292200, 1704378600],
                    "indicators": {"quote": [{
                        "open": [49.0, 50.0, 101.0],
                        "high": [51.0, 52.0, 103.0],
                        "low": [48.0, 49.0, 99.0],
                        "close": [50.0, 51.0, 102.0],
                        "volume": [600, 1200, 300]
                    }]},
                    "events": {
                        "dividends": {"1704292200": {"amount": 0.1, "date": 1704292200}},
                        "splits": {"1704378600": {"numerator": 2.0, "denominator": 1.0, "date": 1704378600}}
                    }
                }],
                "error": null
            }
        }));
        let data = YahooProvider::parse_chart("AAPL", resp).unwrap();
        let (start, end) = window();
        let rows = YahooProvider::parse_rows(data, start, end, 3.0).unwrap();

        assert_eq!(rows[0].close, Some(300.0));
        assert_eq!(rows[0].open, Some(294.0));
        assert_eq!(rows[0].volume, Some(100));
        assert_eq!(rows[1].close, Some(306.0));
        assert!((rows[1].dividends - 0.6).abs() < 1e-12);
        // The ex-date row only carries the later split.
        assert_eq!(rows[2].close, Some(306.0));
        assert_eq!(rows[2].volume, Some(100));
        assert_eq!(rows[2].stock_splits, 2.0);
    }

    #[test]
    fn splits_after_window_apply_to_every_row() {
        let events = Events {
            splits: HashMap::from([
                ("a".to_string(), SplitEvent { numerator: 4.0, denominator: 1.0, date: 200 }),
                ("b".to_string(), SplitEvent { numerator: 1.0, denominator: 2.0, date: 300 }),
                ("c".to_string(), SplitEvent { numerator: 10.0, denominator: 1.0, date: 50 }),
                ("d".to_string(), SplitEvent { numerator: 0.0, denominator: 1.0, date: 400 }),
            ]),
            ..Events::default()
        };
        assert_eq!(split_product(&events, 100), 2.0);
        assert_eq!(split_product(&events, 500), 1.0);
    }

    #[test]
    fn empty_range_is_not_an_error() {
        let resp = chart(json!({
            "chart": {"result": [{"meta": {}, "indicators": {"quote": [{}]}}], "error": null}
        }));
        let data = YahooProvider::parse_chart("AAPL", resp).unwrap();
        let (start, end) = window();
        assert!(YahooProvider::parse_rows(data, start, end, 1.0).unwrap().is_empty());
    }

    #[test]
    fn not_found_maps_to_symbol_error() {
        let resp = chart(json!({
            "chart": {"result": null, "error": {"code": "Not Found", "description": "No data found"}}
        }));
        assert!(matches!(
            YahooProvider::parse_chart("NOPE", resp),
            Err(ProviderError::SymbolNotFound { symbol }) if symbol == "NOPE"
        ));
    }

    #[test]
    fn raw_wrappers_are_unwrapped() {
        let v = unwrap_raw(json!({"marketCap": {"raw": 3.0e12, "fmt": "3T"}, "list": [{"raw": 1}]}));
        assert_eq!(v, json!({"marketCap": 3.0e12, "list": [1]}));
    }

    #[test]
    fn shares_parse_sorted_and_deduped() {
        let body = json!({"timeseries": {"result": [{
            "timestamp": [1706745600, 1704067200, 1704067200],
            "shares_out": [15_400_000_000u64, 15_500_000_000u64, 15_500_000_000u64]
        }]}});
        let points = parse_shares("AAPL", &body).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(points[1].shares, 15_400_000_000);
    }

    #[test]
    fn statement_names_have_modules() {
        assert_eq!(summary_module("quarterly_cashflow"), Some("cashflowStatementHistoryQuarterly"));
        assert_eq!(summary_module("history-1d"), None);
    }
}

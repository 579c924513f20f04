//! Mandi price tools.
//!
//! `get_market_data` looks up one commodity for a single day or a date range.
//! `compare_state_market_data` runs the same lookup once per state (or per
//! district) and returns one block of market data per region.
//!
//! Both tools read through a [`MarketDataSource`]. [`RecordTable`] answers from
//! records held in memory, e.g. loaded from a JSON export of the mandi API.

use crate::tools::dispatcher::{ToolContext, ToolHandler};
use crate::tools::schema::{FunctionDeclaration, ParameterSchema};
use crate::tools::types::{MandiRecord, MarketData, ToolResult};
use anyhow::Context;
use chrono::{Local, NaiveDate};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const MARKET_TOOL_NAME: &str = "get_market_data";
pub const COMPARISON_TOOL_NAME: &str = "compare_state_market_data";

/// Dates on the wire and in mandi records: `DD/MM/YYYY`.
const DATE_FORMAT: &str = "%d/%m/%Y";

const INVALID_RANGE: &str =
    "Invalid date range provided. Please use DD/MM/YYYY format and ensure start date is not after end date.";
const INVALID_DAY: &str = "Invalid single date provided. Please use DD/MM/YYYY format.";

/// The days one lookup covers, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    /// Pick the days a call asks for.
    ///
    /// A complete `start`/`end` pair wins; otherwise `arrival` names one day;
    /// with neither, the lookup is for `today`. The error string goes back to
    /// the model as is.
    pub fn resolve(
        arrival: Option<&str>,
        start: Option<&str>,
        end: Option<&str>,
        today: NaiveDate,
    ) -> Result<Self, String> {
        if let (Some(start), Some(end)) = (start, end) {
            return match (parse_day(start), parse_day(end)) {
                (Some(start), Some(end)) if start <= end => Ok(Self { start, end }),
                _ => Err(INVALID_RANGE.to_string()),
            };
        }

        match arrival {
            Some(day) => parse_day(day).map(Self::single).ok_or_else(|| INVALID_DAY.to_string()),
            None => Ok(Self::single(today)),
        }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    pub fn is_single_day(&self) -> bool {
        self.start == self.end
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_single_day() {
            write!(f, "{}", self.start.format(DATE_FORMAT))
        } else {
            write!(f, "{} to {}", self.start.format(DATE_FORMAT), self.end.format(DATE_FORMAT))
        }
    }
}

fn parse_day(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).ok()
}

/// One commodity lookup. Unset filters match everything.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketQuery {
    pub commodity: String,
    pub state: Option<String>,
    pub district: Option<String>,
    pub market: Option<String>,
    pub dates: DateRange,
}

impl MarketQuery {
    fn matches(&self, record: &MandiRecord) -> bool {
        let same = |filter: &Option<String>, value: &str| {
            filter
                .as_deref()
                .map_or(true, |wanted| wanted.trim().eq_ignore_ascii_case(value.trim()))
        };

        record.commodity.trim().eq_ignore_ascii_case(self.commodity.trim())
            && same(&self.state, &record.state)
            && same(&self.district, &record.district)
            && same(&self.market, &record.market)
            && parse_day(&record.arrival_date).map_or(false, |day| self.dates.contains(day))
    }
}

/// Where mandi records come from.
pub trait MarketDataSource: Send + Sync {
    /// Every record matching the query, oldest first.
    fn fetch(&self, query: MarketQuery) -> BoxFuture<'static, anyhow::Result<Vec<MandiRecord>>>;
}

/// Mandi records held in memory. An empty table answers every lookup with
/// "no data".
#[derive(Debug, Clone, Default)]
pub struct RecordTable {
    records: Vec<MandiRecord>,
}

impl RecordTable {
    pub fn new(records: Vec<MandiRecord>) -> Self {
        Self { records }
    }

    /// Load a JSON array of records, keyed the way the mandi API keys them.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read market data from {}", path.display()))?;
        let records: Vec<MandiRecord> = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse market data in {}", path.display()))?;
        info!(records = records.len(), path = %path.display(), "Loaded market data");
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn lookup(&self, query: &MarketQuery) -> Vec<MandiRecord> {
        let mut found: Vec<MandiRecord> = self.records.iter().filter(|r| query.matches(r)).cloned().collect();
        found.sort_by_key(|r| parse_day(&r.arrival_date));
        found
    }
}

impl MarketDataSource for RecordTable {
    fn fetch(&self, query: MarketQuery) -> BoxFuture<'static, anyhow::Result<Vec<MandiRecord>>> {
        let found = self.lookup(&query);
        async move { Ok(found) }.boxed()
    }
}

fn price(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|p| p.is_finite())
}

/// Deterministic price overview for records that were found.
fn price_overview(commodity: &str, place: &str, dates: &DateRange, records: &[MandiRecord]) -> String {
    let markets: BTreeSet<&str> = records.iter().map(|r| r.market.as_str()).collect();
    let modal: Vec<f64> = records.iter().filter_map(|r| price(&r.modal_price)).collect();
    let heading = format!(
        "{} in {}, {}: {} records from {} markets.",
        commodity,
        place,
        dates,
        records.len(),
        markets.len()
    );

    if modal.is_empty() {
        return format!("{} Prices were not reported.", heading);
    }

    let average = modal.iter().sum::<f64>() / modal.len() as f64;
    let low = records
        .iter()
        .filter_map(|r| price(&r.min_price))
        .fold(f64::INFINITY, f64::min);
    let high = records
        .iter()
        .filter_map(|r| price(&r.max_price))
        .fold(f64::NEG_INFINITY, f64::max);

    let mut text = format!("{} Modal price averaged ₹{:.0}/quintal", heading, average);
    if low.is_finite() && high.is_finite() {
        text.push_str(&format!(" (lowest ₹{:.0}, highest ₹{:.0})", low, high));
    }
    text.push('.');
    if dates.is_single_day() {
        text.push_str(" This is a one-day snapshot.");
    }
    text
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketArgs {
    commodity_name: String,
    state: Option<String>,
    district: Option<String>,
    market: Option<String>,
    arrival_date: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

/// `get_market_data`: prices of one commodity for a day or a date range.
pub struct MarketDataTool {
    source: Arc<dyn MarketDataSource>,
}

impl MarketDataTool {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self { source }
    }
}

impl ToolHandler for MarketDataTool {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration::new(
            MARKET_TOOL_NAME,
            "Retrieves agricultural commodity price data from Indian Mandi markets. Can fetch data for a \
             specific date or a range of dates to identify trends. Defaults to today's date if no date is \
             specified. Provide `startDate` and `endDate` for a range, or `arrivalDate` for a single day.",
            ParameterSchema::object()
                .property(
                    "commodityName",
                    ParameterSchema::string(
                        "The name of the commodity (e.g., 'Cabbage', 'Potato', 'Onion'). This is a required field.",
                    ),
                )
                .property("state", ParameterSchema::string("The state where the market is located (e.g., 'Karnataka')."))
                .property("district", ParameterSchema::string("The district where the market is located (e.g., 'Kolar')."))
                .property("market", ParameterSchema::string("The name of the mandi (e.g., 'Kolar')."))
                .property("arrivalDate", ParameterSchema::string("Single day to query, in DD/MM/YYYY format."))
                .property("startDate", ParameterSchema::string("Start of a date range, in DD/MM/YYYY format."))
                .property("endDate", ParameterSchema::string("End of a date range, in DD/MM/YYYY format."))
                .required(&["commodityName"]),
        )
    }

    fn call(&self, args: Value, _ctx: ToolContext) -> BoxFuture<'static, anyhow::Result<ToolResult>> {
        let source = self.source.clone();
        async move {
            let args: MarketArgs = serde_json::from_value(args)?;
            let dates = match DateRange::resolve(
                args.arrival_date.as_deref(),
                args.start_date.as_deref(),
                args.end_date.as_deref(),
                Local::now().date_naive(),
            ) {
                Ok(dates) => dates,
                Err(reason) => return Ok(ToolResult::error(reason)),
            };

            let query = MarketQuery {
                commodity: args.commodity_name.trim().to_string(),
                state: non_empty(args.state),
                district: non_empty(args.district),
                market: non_empty(args.market),
                dates,
            };
            debug!(query = ?query, "Looking up mandi prices");
            let records = source.fetch(query.clone()).await?;

            let summary = if records.is_empty() {
                format!(
                    "No market data available for {} in {} {} {} for the period {}. Please check your filters \
                     or try another date/range.",
                    query.commodity,
                    query.state.as_deref().unwrap_or("any state"),
                    query.district.as_deref().unwrap_or("any district"),
                    query.market.as_deref().unwrap_or("any market"),
                    query.dates
                )
            } else {
                let place = [&query.market, &query.district, &query.state]
                    .into_iter()
                    .flatten()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                let place = if place.is_empty() { "all markets" } else { place.as_str() };
                price_overview(&query.commodity, place, &query.dates, &records)
            };

            Ok(ToolResult::MarketData(MarketData { records, summary }))
        }
        .boxed()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComparisonArgs {
    commodity_name: String,
    states: Option<Vec<String>>,
    district: Option<Vec<String>>,
    arrival_date: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

/// `compare_state_market_data`: one commodity across several states or districts.
///
/// States are compared when any are given; otherwise the districts are.
pub struct RegionalComparisonTool {
    source: Arc<dyn MarketDataSource>,
}

impl RegionalComparisonTool {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self { source }
    }
}

impl ToolHandler for RegionalComparisonTool {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration::new(
            COMPARISON_TOOL_NAME,
            "Compare modal prices of a commodity across multiple Indian states or districts for a given date \
             or date range. Returns insights per region.",
            ParameterSchema::object()
                .property(
                    "commodityName",
                    ParameterSchema::string("Name of the commodity to compare (e.g., 'Onion')."),
                )
                .property(
                    "states",
                    ParameterSchema::array(
                        ParameterSchema::string("State name"),
                        "List of Indian states to compare (e.g., ['Haryana', 'Punjab']).",
                    ),
                )
                .property(
                    "district",
                    ParameterSchema::array(
                        ParameterSchema::string("District name"),
                        "List of Indian districts to compare (e.g., ['Gurugram', 'Rewari']).",
                    ),
                )
                .property(
                    "arrivalDate",
                    ParameterSchema::string(
                        "Optional: Single day query in DD/MM/YYYY. Cannot be used with startDate/endDate.",
                    ),
                )
                .property("startDate", ParameterSchema::string("Optional: Start of date range (DD/MM/YYYY)."))
                .property("endDate", ParameterSchema::string("Optional: End of date range (DD/MM/YYYY)."))
                .required(&["commodityName"])
                .one_of_required(&["states", "district"]),
        )
    }

    fn call(&self, args: Value, _ctx: ToolContext) -> BoxFuture<'static, anyhow::Result<ToolResult>> {
        let source = self.source.clone();
        async move {
            let args: ComparisonArgs = serde_json::from_value(args)?;
            let dates = match DateRange::resolve(
                args.arrival_date.as_deref(),
                args.start_date.as_deref(),
                args.end_date.as_deref(),
                Local::now().date_naive(),
            ) {
                Ok(dates) => dates,
                Err(reason) => return Ok(ToolResult::error(reason)),
            };

            let clean = |names: Option<Vec<String>>| -> Vec<String> {
                names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect()
            };
            let states = clean(args.states);
            let by_state = !states.is_empty();
            let regions = if by_state { states } else { clean(args.district) };
            let commodity = args.commodity_name.trim().to_string();

            let mut compared = BTreeMap::new();
            for region in regions {
                let query = MarketQuery {
                    commodity: commodity.clone(),
                    state: by_state.then(|| region.clone()),
                    district: (!by_state).then(|| region.clone()),
                    market: None,
                    dates,
                };
                let records = source.fetch(query).await?;
                let summary = if records.is_empty() {
                    format!("No records found for {} during {}.", region, dates)
                } else {
                    price_overview(&commodity, &region, &dates, &records)
                };
                compared.insert(region, MarketData { records, summary });
            }

            debug!(commodity = %commodity, regions = compared.len(), "Compared regional prices");
            Ok(ToolResult::RegionalComparison { regions: compared })
        }
        .boxed()
    }
}

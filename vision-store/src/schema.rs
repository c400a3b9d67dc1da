//! Fixed column layouts of the upstream CSV files and of the stored partitions.
//!
//! Upstream formats are external and never change shape here; every stored
//! partition carries exactly these columns, plus a trailing `symbol` column
//! for kinds whose CSV does not already have one.

use polars::prelude::*;
use vision_core::DataKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Epoch milliseconds after normalisation.
    Time,
    Int,
    Float,
    Bool,
    Str,
}

impl ColumnType {
    pub fn dtype(self) -> DataType {
        match self {
            ColumnType::Time | ColumnType::Int => DataType::Int64,
            ColumnType::Float => DataType::Float64,
            ColumnType::Bool => DataType::Boolean,
            ColumnType::Str => DataType::String,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::Float)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn c(name: &'static str, ty: ColumnType) -> ColumnDef {
    ColumnDef { name, ty }
}

use ColumnType::{Bool, Float, Int, Str, Time};

const KLINES: &[ColumnDef] = &[
    c("open_time", Time),
    c("open", Float),
    c("high", Float),
    c("low", Float),
    c("close", Float),
    c("volume", Float),
    c("close_time", Time),
    c("quote_volume", Float),
    c("count", Int),
    c("taker_buy_volume", Float),
    c("taker_buy_quote_volume", Float),
    c("ignore", Float),
];

const AGG_TRADES: &[ColumnDef] = &[
    c("agg_trade_id", Int),
    c("price", Float),
    c("quantity", Float),
    c("first_trade_id", Int),
    c("last_trade_id", Int),
    c("transact_time", Time),
    c("is_buyer_maker", Bool),
];

const TRADES: &[ColumnDef] = &[
    c("id", Int),
    c("price", Float),
    c("qty", Float),
    c("quote_qty", Float),
    c("time", Time),
    c("is_buyer_maker", Bool),
];

const BOOK_TICKER: &[ColumnDef] = &[
    c("update_id", Int),
    c("best_bid_price", Float),
    c("best_bid_qty", Float),
    c("best_ask_price", Float),
    c("best_ask_qty", Float),
    c("transaction_time", Time),
    c("event_time", Time),
];

const BOOK_DEPTH: &[ColumnDef] = &[
    c("timestamp", Time),
    c("percentage", Float),
    c("depth", Float),
    c("notional", Float),
];

const METRICS: &[ColumnDef] = &[
    c("create_time", Time),
    c("symbol", Str),
    c("sum_open_interest", Float),
    c("sum_open_interest_value", Float),
    c("count_toptrader_long_short_ratio", Float),
    c("sum_toptrader_long_short_ratio", Float),
    c("count_long_short_ratio", Float),
    c("sum_taker_long_short_vol_ratio", Float),
];

const KLINES_KEY: &[&str] = &["open_time"];
const AGG_TRADES_KEY: &[&str] = &["agg_trade_id"];
const TRADES_KEY: &[&str] = &["id"];
const BOOK_TICKER_KEY: &[&str] = &["update_id"];
const BOOK_DEPTH_KEY: &[&str] = &["timestamp", "percentage"];
const METRICS_KEY: &[&str] = &["create_time"];

/// Layout of one data kind.
#[derive(Debug, Clone, Copy)]
pub struct KindSchema {
    pub kind: DataKind,
    /// CSV column order.
    pub columns: &'static [ColumnDef],
    /// Column used for day bucketing, sorting and range filters.
    pub time_column: &'static str,
    /// Natural key within one partition.
    pub key_columns: &'static [&'static str],
    /// Traded volume, for kinds that have one.
    pub volume_column: Option<&'static str>,
}

pub const SYMBOL_COLUMN: &str = "symbol";

impl KindSchema {
    pub fn for_kind(kind: DataKind) -> Self {
        let (columns, time_column, key_columns, volume_column) = match kind {
            DataKind::Klines
            | DataKind::IndexPriceKlines
            | DataKind::MarkPriceKlines
            | DataKind::PremiumIndexKlines => (KLINES, "open_time", KLINES_KEY, Some("volume")),
            DataKind::AggTrades => (AGG_TRADES, "transact_time", AGG_TRADES_KEY, Some("quantity")),
            DataKind::Trades => (TRADES, "time", TRADES_KEY, Some("qty")),
            DataKind::BookTicker => (BOOK_TICKER, "transaction_time", BOOK_TICKER_KEY, None),
            DataKind::BookDepth => (BOOK_DEPTH, "timestamp", BOOK_DEPTH_KEY, None),
            DataKind::Metrics => (METRICS, "create_time", METRICS_KEY, None),
        };
        Self {
            kind,
            columns,
            time_column,
            key_columns,
            volume_column,
        }
    }

    /// Whether the CSV itself carries a `symbol` column.
    pub fn has_symbol_column(&self) -> bool {
        self.columns.iter().any(|c| c.name == SYMBOL_COLUMN)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Key columns plus `symbol`, for deduplication across partitions.
    pub fn dedupe_columns(&self) -> Vec<&'static str> {
        let mut cols = self.key_columns.to_vec();
        cols.push(SYMBOL_COLUMN);
        cols
    }

    /// Schema of a stored partition.
    pub fn stored_schema(&self) -> Schema {
        let mut fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| Field::new(c.name.into(), c.ty.dtype()))
            .collect();
        if !self.has_symbol_column() {
            fields.push(Field::new(SYMBOL_COLUMN.into(), DataType::String));
        }
        Schema::from_iter(fields)
    }

    /// Check a frame read back from disk against the stored schema.
    pub fn validate(&self, df: &DataFrame) -> Result<(), SchemaError> {
        let expected = self.stored_schema();
        let actual = df.schema();

        for field in expected.iter_fields() {
            let actual_dtype = actual
                .get(field.name())
                .ok_or_else(|| SchemaError::MissingColumn(field.name().to_string()))?;
            if actual_dtype != field.dtype() {
                return Err(SchemaError::TypeMismatch {
                    column: field.name().to_string(),
                    expected: field.dtype().clone(),
                    actual: actual_dtype.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },
}

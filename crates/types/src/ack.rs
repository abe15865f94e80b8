use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of the captured trade, from the venue's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("BUY"),
            Side::Sell => f.write_str("SELL"),
        }
    }
}

/// Trade data gathered by core trade processing for an outbound acknowledgement.
///
/// Fields are optional because the trade may still be incomplete; the link
/// may only move to ReadyToAck once `missing_fields` is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckDraft {
    pub trade_report_id: Option<String>,
    pub exec_id: Option<String>,
    pub trade_date: Option<NaiveDate>,
    pub instrument: Option<String>,
    pub side: Option<Side>,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub counterparty: Option<String>,
}

impl AckDraft {
    /// Names of the fields that still block the acknowledgement
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if is_blank(&self.trade_report_id) {
            missing.push("trade_report_id");
        }
        if is_blank(&self.exec_id) {
            missing.push("exec_id");
        }
        if self.trade_date.is_none() {
            missing.push("trade_date");
        }
        if is_blank(&self.instrument) {
            missing.push("instrument");
        }
        if self.side.is_none() {
            missing.push("side");
        }
        match self.quantity {
            Some(q) if q > Decimal::ZERO => {}
            _ => missing.push("quantity"),
        }
        if self.price.is_none() {
            missing.push("price");
        }
        if is_blank(&self.counterparty) {
            missing.push("counterparty");
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// Build the outbound acknowledgement, or list what is missing
    pub fn build(&self, trade_id: i64) -> Result<Acknowledgement, Vec<&'static str>> {
        match (
            &self.trade_report_id,
            &self.exec_id,
            self.trade_date,
            &self.instrument,
            self.side,
            self.quantity,
            self.price,
            &self.counterparty,
        ) {
            (
                Some(trade_report_id),
                Some(exec_id),
                Some(trade_date),
                Some(instrument),
                Some(side),
                Some(quantity),
                Some(price),
                Some(counterparty),
            ) if self.is_complete() => Ok(Acknowledgement {
                trade_id,
                trade_report_id: trade_report_id.clone(),
                exec_id: exec_id.clone(),
                trade_date,
                instrument: instrument.clone(),
                side,
                quantity,
                price,
                counterparty: counterparty.clone(),
            }),
            _ => Err(self.missing_fields()),
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).map_or(true, str::is_empty)
}

/// Outbound acknowledgement (AR) for a captured trade (AE)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub trade_id: i64,
    pub trade_report_id: String,
    pub exec_id: String,
    pub trade_date: NaiveDate,
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub counterparty: String,
}

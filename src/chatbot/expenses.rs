//! Expense records, amount parsing and period reports.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use serde_json::Value;

use crate::google::GoogleError;

/// Column headers of the expense worksheet.
pub const HEADER: [&str; 4] = ["Data", "Importo", "Categoria", "Descrizione"];

/// Written as ISO so every spreadsheet locale reads the same day.
const DATE_FORMAT: &str = "%Y-%m-%d";
/// Older rows typed by hand.
const LEGACY_DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Debug, Clone, PartialEq)]
pub struct Expense {
    pub date: NaiveDate,
    pub amount: f64,
    pub category: String,
    pub description: Option<String>,
}

impl Expense {
    /// Worksheet row: `Data | Importo | Categoria | Descrizione`.
    pub fn to_row(&self) -> Vec<Value> {
        vec![
            Value::from(self.date.format(DATE_FORMAT).to_string()),
            Value::from(self.amount),
            Value::from(self.category.clone()),
            Value::from(self.description.clone().unwrap_or_default()),
        ]
    }

    /// Parse a worksheet row. Header and malformed rows yield `None`.
    pub fn from_row(row: &[Value]) -> Option<Self> {
        let date = row.first().and_then(parse_cell_date)?;
        let amount = row.get(1).and_then(parse_cell_amount)?;
        let category = row.get(2).and_then(Value::as_str)?.trim().to_string();
        let description = row
            .get(3)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Some(Self { date, amount, category, description })
    }
}

/// Where expenses are stored.
#[async_trait]
pub trait ExpenseLedger: Send + Sync {
    async fn append(&self, expense: &Expense) -> Result<(), GoogleError>;
    async fn expenses(&self) -> Result<Vec<Expense>, GoogleError>;
}

fn parse_cell_date(cell: &Value) -> Option<NaiveDate> {
    match cell {
        Value::String(s) => {
            let s = s.trim();
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .or_else(|_| NaiveDate::parse_from_str(s, LEGACY_DATE_FORMAT))
                .ok()
        }
        // Spreadsheet serial date, days since 1899-12-30
        Value::Number(n) => {
            let days = n.as_f64()?.floor() as i64;
            NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_signed(Duration::days(days))
        }
        _ => None,
    }
}

fn parse_cell_amount(cell: &Value) -> Option<f64> {
    match cell {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('€').trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

/// Parse a user-typed amount. Accepts `,` as decimal separator and an
/// optional euro sign; the result is positive and rounded to cents.
pub fn parse_amount(input: &str) -> Option<f64> {
    let cleaned = input.trim().trim_end_matches('€').trim().replace(',', ".");
    let amount: f64 = cleaned.parse().ok()?;
    if !amount.is_finite() || amount <= 0.0 {
        return None;
    }
    let rounded = (amount * 100.0).round() / 100.0;
    (rounded > 0.0).then_some(rounded)
}

/// Case-insensitive lookup of a configured category, returning its canonical name.
pub fn match_category<'a>(input: &str, categories: &'a [String]) -> Option<&'a str> {
    let input = input.trim().to_lowercase();
    categories
        .iter()
        .find(|c| c.to_lowercase() == input)
        .map(String::as_str)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Day,
    /// Since Monday of the current week.
    Week,
    Month,
    Year,
    All,
}

impl Period {
    /// Parse a period keyword as typed after `/report`.
    pub fn parse(word: &str) -> Option<Self> {
        match word.trim().to_lowercase().as_str() {
            "oggi" | "giorno" | "day" | "today" => Some(Period::Day),
            "settimana" | "week" => Some(Period::Week),
            "mese" | "month" => Some(Period::Month),
            "anno" | "year" => Some(Period::Year),
            "tutto" | "tutte" | "sempre" | "all" => Some(Period::All),
            _ => None,
        }
    }

    /// First day included in the period, `None` for no lower bound.
    pub fn start(&self, today: NaiveDate) -> Option<NaiveDate> {
        match self {
            Period::Day => Some(today),
            Period::Week => Some(today - Duration::days(today.weekday().num_days_from_monday() as i64)),
            Period::Month => today.with_day(1),
            Period::Year => NaiveDate::from_ymd_opt(today.year(), 1, 1),
            Period::All => None,
        }
    }

    pub fn contains(&self, date: NaiveDate, today: NaiveDate) -> bool {
        date <= today && self.start(today).is_none_or(|start| date >= start)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Period::Day => "di oggi",
            Period::Week => "di questa settimana",
            Period::Month => "di questo mese",
            Period::Year => "di quest'anno",
            Period::All => "totali",
        }
    }
}

/// Totals for one period, optionally restricted to one category.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub period: Period,
    pub category: Option<String>,
    pub total: f64,
    pub count: usize,
    pub by_category: BTreeMap<String, f64>,
}

impl Report {
    pub fn build(expenses: &[Expense], period: Period, category: Option<&str>, today: NaiveDate) -> Self {
        let mut by_category = BTreeMap::new();
        let mut total = 0.0;
        let mut count = 0;
        for expense in expenses {
            if !period.contains(expense.date, today) {
                continue;
            }
            if category.is_some_and(|c| !expense.category.eq_ignore_ascii_case(c)) {
                continue;
            }
            total += expense.amount;
            count += 1;
            *by_category.entry(expense.category.clone()).or_insert(0.0) += expense.amount;
        }
        Self {
            period,
            category: category.map(str::to_string),
            total,
            count,
            by_category,
        }
    }

    pub fn render(&self) -> String {
        let scope = match self.category {
            Some(ref c) => format!(" {} per {c}", self.period.label()),
            None => format!(" {}", self.period.label()),
        };
        if self.count == 0 {
            return format!("Nessuna spesa{scope}.");
        }

        let mut s = format!("📊 Spese{scope}\nTotale: {:.2}€ ({} spese)\n", self.total, self.count);
        // A single-category report has nothing to break down
        if self.category.is_none() {
            s.push_str("\nPer categoria:\n");
            let mut rows: Vec<(&String, &f64)> = self.by_category.iter().collect();
            rows.sort_by(|a, b| b.1.total_cmp(a.1));
            for (category, amount) in rows {
                let _ = writeln!(s, "• {category}: {amount:.2}€");
            }
        }
        s
    }
}

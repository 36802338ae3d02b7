//! Google Sheets v4 client backing the expense ledger.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{GoogleError, TokenProvider, check_status};
use crate::chatbot::expenses::{Expense, ExpenseLedger, HEADER};

const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4";

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Serialize)]
struct ValuesBody<'a> {
    values: &'a [Vec<Value>],
}

pub struct GoogleSheets {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    base_url: String,
    spreadsheet_id: String,
    worksheet: String,
    header_checked: OnceCell<()>,
}

impl GoogleSheets {
    pub fn new(tokens: Arc<dyn TokenProvider>, spreadsheet_id: impl Into<String>, worksheet: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            base_url: DEFAULT_BASE_URL.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            worksheet: worksheet.into(),
            header_checked: OnceCell::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// A1 range on the worksheet, e.g. `'Spese 2026'!A:D`.
    fn range(&self, cells: &str) -> String {
        format!("'{}'!{}", self.worksheet.replace('\'', "''"), cells)
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/spreadsheets/{}/values/{}",
            self.base_url,
            urlencoding::encode(&self.spreadsheet_id),
            urlencoding::encode(range)
        )
    }

    pub async fn get_values(&self, cells: &str) -> Result<Vec<Vec<Value>>, GoogleError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(self.values_url(&self.range(cells)))
            .bearer_auth(token)
            .query(&[
                ("valueRenderOption", "UNFORMATTED_VALUE"),
                ("dateTimeRenderOption", "FORMATTED_STRING"),
            ])
            .send()
            .await?;
        let range: ValueRange = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GoogleError::Parse(format!("value range: {e}")))?;
        Ok(range.values)
    }

    pub async fn update_values(&self, cells: &str, values: &[Vec<Value>]) -> Result<(), GoogleError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .put(self.values_url(&self.range(cells)))
            .bearer_auth(token)
            .query(&[("valueInputOption", "USER_ENTERED")])
            .json(&ValuesBody { values })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn append_values(&self, cells: &str, values: &[Vec<Value>]) -> Result<(), GoogleError> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}:append", self.values_url(&self.range(cells)));
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .query(&[("valueInputOption", "USER_ENTERED"), ("insertDataOption", "INSERT_ROWS")])
            .json(&ValuesBody { values })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    /// Write the header row if the worksheet is empty. Checked once per process.
    pub async fn ensure_header(&self) -> Result<(), GoogleError> {
        self.header_checked
            .get_or_try_init(|| async {
                let first = self.get_values("A1:D1").await?;
                if first.iter().all(|row| row.is_empty()) {
                    info!("Writing header to worksheet '{}'", self.worksheet);
                    let header: Vec<Value> = HEADER.iter().map(|h| Value::from(*h)).collect();
                    self.update_values("A1:D1", &[header]).await?;
                }
                Ok::<(), GoogleError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExpenseLedger for GoogleSheets {
    async fn append(&self, expense: &Expense) -> Result<(), GoogleError> {
        self.ensure_header().await?;
        self.append_values("A:D", &[expense.to_row()]).await?;
        info!("Recorded expense {:.2} in {}", expense.amount, expense.category);
        Ok(())
    }

    async fn expenses(&self) -> Result<Vec<Expense>, GoogleError> {
        let rows = self.get_values("A:D").await?;
        let expenses: Vec<Expense> = rows.iter().filter_map(|row| Expense::from_row(row)).collect();
        debug!("Read {} expenses from {} rows", expenses.len(), rows.len());
        Ok(expenses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::google::StaticToken;

    fn sheets(worksheet: &str) -> GoogleSheets {
        GoogleSheets::new(Arc::new(StaticToken("t".into())), "sheet-id", worksheet)
    }

    #[test]
    fn test_range_quotes_worksheet() {
        assert_eq!(sheets("Expenses").range("A:D"), "'Expenses'!A:D");
        assert_eq!(sheets("Spese di Ale's").range("A1:D1"), "'Spese di Ale''s'!A1:D1");
    }

    #[test]
    fn test_values_url_encodes_range() {
        let url = sheets("Spese 2026").with_base_url("http://localhost/").values_url("'Spese 2026'!A:D");
        assert_eq!(url, "http://localhost/spreadsheets/sheet-id/values/%27Spese%202026%27%21A%3AD");
    }
}

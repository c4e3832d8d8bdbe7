//! `/export` pagination and CSV assembly.

use chrono::{NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

pub const ROW_LIMIT: usize = 5000;
pub const PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid date range: from > to")]
    InvalidRange,
    #[error("invalid date format: {0}")]
    InvalidDate(String),
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
}

pub fn parse_range(from: Option<&str>, to: Option<&str>) -> Result<(NaiveDate, NaiveDate), ExportError> {
    let today = Utc::now().date_naive();
    let parse = |s: &str| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| ExportError::InvalidDate(s.to_string()))
    };
    let from_date = match from {
        Some(s) => parse(s)?,
        None => today,
    };
    let to_date = match to {
        Some(s) => parse(s)?,
        None => today,
    };
    if from_date > to_date {
        return Err(ExportError::InvalidRange);
    }
    Ok((from_date, to_date))
}

pub struct ExportPage {
    pub csv: String,
    pub row_count: usize,
    pub next_cursor: Option<i64>,
    pub utm_sources: Vec<String>,
}

pub struct ExportSource {
    pool: SqlitePool,
}

impl ExportSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// One page of the export, ordered by message id ascending so the
    /// cursor is stable across pages.
    pub async fn fetch_page(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<ExportPage, ExportError> {
        let from_ts = from.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();
        let to_ts = to
            .succ_opt()
            .unwrap_or(to)
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        let after_id = cursor.unwrap_or(0);

        let rows = sqlx::query(
            r#"
            SELECT m.id, m.user_id, m.chat_id, m.role, m.text, m.timestamp, u.utm_source
            FROM messages m
            LEFT JOIN users u ON u.user_id = m.user_id
            WHERE m.id > ?1
              AND strftime('%s', m.timestamp) >= ?2
              AND strftime('%s', m.timestamp) < ?3
            ORDER BY m.id ASC
            LIMIT ?4
            "#,
        )
        .bind(after_id)
        .bind(from_ts)
        .bind(to_ts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut csv = String::from("id,user_id,chat_id,role,text,timestamp,utm_source\n");
        let mut utm_sources = Vec::new();
        let mut last_id = None;

        for row in &rows {
            let id: i64 = row.get("id");
            let user_id: String = row.get("user_id");
            let chat_id: String = row.get("chat_id");
            let role: String = row.get("role");
            let text: String = row.get("text");
            let timestamp: String = row.get("timestamp");
            let utm_source: Option<String> = row.get("utm_source");

            if let Some(utm) = &utm_source {
                if !utm_sources.contains(utm) {
                    utm_sources.push(utm.clone());
                }
            }

            csv.push_str(&format!(
                "{},{},{},{},{},{},{}\n",
                id,
                csv_escape(&user_id),
                csv_escape(&chat_id),
                csv_escape(&role),
                csv_escape(&text),
                csv_escape(&timestamp),
                csv_escape(utm_source.as_deref().unwrap_or(""))
            ));
            last_id = Some(id);
        }

        let next_cursor = if rows.len() == limit { last_id } else { None };

        Ok(ExportPage {
            row_count: rows.len(),
            csv,
            next_cursor,
            utm_sources,
        })
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Merges paged CSVs (each with its own header) into a single CSV body,
/// keeping only the first page's header.
pub fn merge_pages(pages: &[String]) -> String {
    let mut merged = String::new();
    for (i, page) in pages.iter().enumerate() {
        let mut lines = page.lines();
        if i == 0 {
            if let Some(header) = lines.next() {
                merged.push_str(header);
                merged.push('\n');
            }
        } else {
            lines.next();
        }
        for line in lines {
            merged.push_str(line);
            merged.push('\n');
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_valid_same_day_range() {
        let (from, to) = parse_range(Some("2024-01-01"), Some("2024-01-01")).unwrap();
        assert_eq!(from, to);
    }

    #[test]
    fn rejects_from_after_to() {
        let result = parse_range(Some("2024-02-01"), Some("2024-01-01"));
        assert!(matches!(result, Err(ExportError::InvalidRange)));
    }

    #[test]
    fn rejects_malformed_dates() {
        let result = parse_range(Some("not-a-date"), None);
        assert!(matches!(result, Err(ExportError::InvalidDate(_))));
    }

    #[test]
    fn merge_pages_keeps_only_the_first_header() {
        let pages = vec![
            "id,text\n1,a\n2,b\n".to_string(),
            "id,text\n3,c\n".to_string(),
        ];
        let merged = merge_pages(&pages);
        assert_eq!(merged, "id,text\n1,a\n2,b\n3,c\n");
    }

    #[test]
    fn csv_escape_quotes_values_with_commas() {
        assert_eq!(csv_escape("hello, world"), "\"hello, world\"");
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("has \"quote\""), "\"has \"\"quote\"\"\"");
    }
}

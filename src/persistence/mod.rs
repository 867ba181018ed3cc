//! Tab store
//!
//! Append-only, spreadsheet-like storage with named tabs. The CSV backend
//! keeps one file per tab under the data directory; the memory backend is
//! used for dry runs and tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use csv::{ReaderBuilder, WriterBuilder};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::info;

/// One row: header name → cell text
pub type Row = BTreeMap<String, String>;

/// Trimmed, non-empty cell value
pub fn cell<'a>(row: &'a Row, key: &str) -> Option<&'a str> {
    row.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Numeric cell; unparsable or non-finite text reads as absent
pub fn cell_f64(row: &Row, key: &str) -> Option<f64> {
    cell(row, key)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Build a row from `(column, value)` pairs
pub fn row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tab {
    Trades,
    Signals,
    Performance,
    Events,
    Status,
    ParamsOverride,
}

impl Tab {
    pub const ALL: [Tab; 6] = [
        Tab::Trades,
        Tab::Signals,
        Tab::Performance,
        Tab::Events,
        Tab::Status,
        Tab::ParamsOverride,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Tab::Trades => "Trades",
            Tab::Signals => "Signals",
            Tab::Performance => "Performance",
            Tab::Events => "Events",
            Tab::Status => "Status",
            Tab::ParamsOverride => "Params_Override",
        }
    }

    fn file_name(&self) -> String {
        format!("{}.csv", self.name().to_lowercase())
    }

    pub fn headers(&self) -> &'static [&'static str] {
        match self {
            Tab::Trades => &[
                "ts",
                "date",
                "event",
                "id",
                "symbol",
                "side",
                "level_tag",
                "dedup_key",
                "status",
                "trigger",
                "entry_time",
                "entry_spot",
                "entry_price",
                "stop_loss",
                "take_profit",
                "trail_stop",
                "quantity",
                "exit_time",
                "exit_spot",
                "exit_price",
                "exit_reason",
                "pnl_points",
                "pnl_value",
            ],
            Tab::Signals => &[
                "ts", "symbol", "spot", "side", "level_tag", "trigger", "view", "eligible", "c1",
                "c2", "c3", "c4", "c5", "c6", "failed",
            ],
            Tab::Performance => &[
                "date",
                "symbol",
                "trades",
                "wins",
                "losses",
                "win_rate",
                "avg_pnl",
                "gross_pnl",
                "max_dd",
            ],
            Tab::Events => &["date", "type", "window", "note", "active", "symbol"],
            Tab::Status => &["ts", "worker_id", "shift_mode", "state", "message"],
            Tab::ParamsOverride => &["key", "value", "status"],
        }
    }
}

impl std::fmt::Display for Tab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[async_trait]
pub trait TabStore: Send + Sync {
    /// Append one row; unknown columns are dropped, missing ones are blank
    async fn append_row(&self, tab: Tab, row: Row) -> Result<()>;

    /// All rows of a tab in append order
    async fn read_all(&self, tab: Tab) -> Result<Vec<Row>>;

    /// Whether any row has `column == value`
    async fn contains(&self, tab: Tab, column: &str, value: &str) -> Result<bool> {
        Ok(self
            .read_all(tab)
            .await?
            .iter()
            .any(|r| cell(r, column) == Some(value)))
    }
}

/// CSV-backed tab store
pub struct CsvTabStore {
    data_dir: PathBuf,
    writers: HashMap<Tab, Arc<AsyncRwLock<csv::Writer<std::fs::File>>>>,
}

impl CsvTabStore {
    pub fn new(data_dir: &str) -> Result<Self> {
        let data_dir = PathBuf::from(data_dir);
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut writers = HashMap::new();
        for tab in Tab::ALL {
            let writer = Self::create_writer(&data_dir, tab)?;
            writers.insert(tab, Arc::new(AsyncRwLock::new(writer)));
        }

        info!(dir = %data_dir.display(), "💾 [STORE] CSV tab store ready");
        Ok(Self { data_dir, writers })
    }

    fn path(&self, tab: Tab) -> PathBuf {
        self.data_dir.join(tab.file_name())
    }

    /// Open for append; write the header only when the file is new or empty
    fn create_writer(dir: &Path, tab: Tab) -> Result<csv::Writer<std::fs::File>> {
        let path = dir.join(tab.file_name());
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if !file_has_data {
            writer
                .write_record(tab.headers())
                .context("Failed to write CSV header")?;
            writer.flush().context("Failed to flush CSV header")?;
        }
        Ok(writer)
    }

    fn writer(&self, tab: Tab) -> Result<&Arc<AsyncRwLock<csv::Writer<std::fs::File>>>> {
        self.writers
            .get(&tab)
            .with_context(|| format!("No writer for tab {}", tab))
    }
}

#[async_trait]
impl TabStore for CsvTabStore {
    async fn append_row(&self, tab: Tab, row: Row) -> Result<()> {
        let record: Vec<&str> = tab
            .headers()
            .iter()
            .map(|h| row.get(*h).map(String::as_str).unwrap_or(""))
            .collect();

        let mut writer = self.writer(tab)?.write().await;
        writer
            .write_record(&record)
            .with_context(|| format!("Failed to write {} row", tab))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush {} writer", tab))?;
        Ok(())
    }

    async fn read_all(&self, tab: Tab) -> Result<Vec<Row>> {
        // Hold the writer lock so a concurrent append cannot interleave
        let _guard = self.writer(tab)?.write().await;
        let path = self.path(tab);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let headers = reader.headers()?.clone();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("Failed to read {} row", tab))?;
            let row: Row = headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.trim().to_lowercase(), v.to_string()))
                .collect();
            rows.push(row);
        }
        Ok(rows)
    }
}

/// In-memory tab store
#[derive(Default)]
pub struct MemoryTabStore {
    tabs: AsyncRwLock<HashMap<Tab, Vec<Row>>>,
}

impl MemoryTabStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TabStore for MemoryTabStore {
    async fn append_row(&self, tab: Tab, row: Row) -> Result<()> {
        let filtered: Row = tab
            .headers()
            .iter()
            .map(|h| (h.to_string(), row.get(*h).cloned().unwrap_or_default()))
            .collect();
        self.tabs.write().await.entry(tab).or_default().push(filtered);
        Ok(())
    }

    async fn read_all(&self, tab: Tab) -> Result<Vec<Row>> {
        Ok(self
            .tabs
            .read()
            .await
            .get(&tab)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_data_dir(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ocbot_{}_{}", prefix, uuid::Uuid::new_v4()))
    }

    #[test]
    fn csv_store_appends_and_reads_back() {
        let dir = temp_data_dir("csv_roundtrip");
        let store = CsvTabStore::new(dir.to_str().unwrap()).unwrap();

        tokio_test::block_on(async {
            store
                .append_row(
                    Tab::Events,
                    row([
                        ("date", "2024-05-02"),
                        ("type", "RBI"),
                        ("window", "10:00-10:30"),
                        ("active", "yes"),
                        ("extra", "dropped"),
                    ]),
                )
                .await
                .unwrap();

            let rows = store.read_all(Tab::Events).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(cell(&rows[0], "type"), Some("RBI"));
            assert_eq!(cell(&rows[0], "note"), None);
            assert!(!rows[0].contains_key("extra"));
            assert!(store.contains(Tab::Events, "window", "10:00-10:30").await.unwrap());
            assert!(!store.contains(Tab::Events, "window", "11:00-12:00").await.unwrap());
        });

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn reopening_existing_file_does_not_repeat_header() {
        let dir = temp_data_dir("reopen");
        tokio_test::block_on(async {
            let store = CsvTabStore::new(dir.to_str().unwrap()).unwrap();
            store
                .append_row(Tab::ParamsOverride, row([("key", "HOLD"), ("value", "1")]))
                .await
                .unwrap();
            drop(store);

            let store = CsvTabStore::new(dir.to_str().unwrap()).unwrap();
            store
                .append_row(Tab::ParamsOverride, row([("key", "TARGET_RR"), ("value", "2")]))
                .await
                .unwrap();
            let rows = store.read_all(Tab::ParamsOverride).await.unwrap();
            assert_eq!(rows.len(), 2);
        });

        let text = fs::read_to_string(dir.join("params_override.csv")).unwrap();
        assert_eq!(text.matches("key,value,status").count(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn memory_store_filters_columns() {
        let store = MemoryTabStore::new();
        store
            .append_row(Tab::Status, row([("state", "UP"), ("bogus", "x")]))
            .await
            .unwrap();
        let rows = store.read_all(Tab::Status).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(cell(&rows[0], "state"), Some("UP"));
        assert_eq!(cell(&rows[0], "bogus"), None);
        assert!(store.read_all(Tab::Trades).await.unwrap().is_empty());
    }

    #[test]
    fn numeric_cells_parse_to_option() {
        let r = row([("a", " 12.5 "), ("b", "n/a"), ("c", "")]);
        assert_eq!(cell_f64(&r, "a"), Some(12.5));
        assert_eq!(cell_f64(&r, "b"), None);
        assert_eq!(cell_f64(&r, "c"), None);
    }
}

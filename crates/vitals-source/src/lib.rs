//! Row sources: read every row of a named table as a [`RawRow`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Row, TypeInfo, ValueRef};
use tokio::fs;
use tracing::{debug, info, warn, Instrument};
use vitals_core::{RawRow, RawValue, VitalsError};

pub const CRATE_NAME: &str = "vitals-source";

/// A database or table name that is safe to splice into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(value: &str) -> Result<Self, VitalsError> {
        let valid = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(VitalsError::InvalidIdentifier {
                value: value.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identifier {
    type Error = VitalsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub database: Identifier,
    pub table: Identifier,
}

impl TableRef {
    pub fn parse(database: &str, table: &str) -> Result<Self, VitalsError> {
        Ok(Self {
            database: Identifier::parse(database)?,
            table: Identifier::parse(table)?,
        })
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

#[async_trait]
pub trait RowSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Every row of the table, unfiltered. An empty table is not an error.
    async fn fetch_rows(&self, table: &TableRef) -> Result<Vec<RawRow>, VitalsError>;

    async fn list_tables(&self, database: &Identifier) -> Result<Vec<String>, VitalsError>;
}

/// Reads GarminDB SQLite files stored as `<data_dir>/<database>.db`.
#[derive(Debug, Clone)]
pub struct SqliteRowSource {
    data_dir: PathBuf,
    timeout: Duration,
}

impl SqliteRowSource {
    pub fn new(data_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            data_dir: data_dir.into(),
            timeout,
        }
    }

    pub fn database_path(&self, database: &Identifier) -> PathBuf {
        self.data_dir.join(format!("{database}.db"))
    }

    async fn connect(&self, database: &Identifier) -> Result<sqlx::SqliteConnection, VitalsError> {
        let path = self.database_path(database);
        SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true)
            .create_if_missing(false)
            .connect()
            .await
            .map_err(|err| VitalsError::source_unavailable(format!("opening {}", path.display()), err))
    }

    async fn read_table(&self, table: &TableRef) -> Result<Vec<RawRow>, VitalsError> {
        let mut conn = self.connect(&table.database).await?;
        let query = format!("SELECT * FROM \"{}\"", table.table);
        let rows = sqlx::query(&query)
            .fetch_all(&mut conn)
            .await
            .map_err(|err| VitalsError::source_unavailable(format!("reading table {table}"), err))?;
        let _ = conn.close().await;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn read_table_names(&self, database: &Identifier) -> Result<Vec<String>, VitalsError> {
        let mut conn = self.connect(database).await?;
        let rows = sqlx::query(
            r#"
            SELECT name
              FROM sqlite_master
             WHERE type = 'table'
               AND name NOT LIKE 'sqlite_%'
             ORDER BY name
            "#,
        )
        .fetch_all(&mut conn)
        .await
        .map_err(|err| VitalsError::source_unavailable(format!("listing tables of {database}"), err))?;
        let _ = conn.close().await;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| VitalsError::source_unavailable(format!("listing tables of {database}"), err))
    }

    async fn bounded<T>(
        &self,
        context: String,
        fut: impl std::future::Future<Output = Result<T, VitalsError>>,
    ) -> Result<T, VitalsError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| VitalsError::source_unavailable(context, format!("timed out after {:?}", self.timeout)))?
    }
}

#[async_trait]
impl RowSource for SqliteRowSource {
    fn source_name(&self) -> &'static str {
        "sqlite"
    }

    async fn fetch_rows(&self, table: &TableRef) -> Result<Vec<RawRow>, VitalsError> {
        let span = tracing::info_span!("fetch_rows", source = "sqlite", %table);
        async {
            let rows = self
                .bounded(format!("reading table {table}"), self.read_table(table))
                .await?;
            info!(rows = rows.len(), "read source table");
            Ok::<_, VitalsError>(rows)
        }
        .instrument(span)
        .await
    }

    async fn list_tables(&self, database: &Identifier) -> Result<Vec<String>, VitalsError> {
        self.bounded(
            format!("listing tables of {database}"),
            self.read_table_names(database),
        )
        .await
    }
}

fn decode_row(row: &SqliteRow) -> RawRow {
    row.columns()
        .iter()
        .map(|column| (column.name().to_string(), decode_cell(row, column.ordinal())))
        .collect()
}

/// Decodes by the cell's storage class; SQLite columns are dynamically typed.
fn decode_cell(row: &SqliteRow, idx: usize) -> RawValue {
    let Ok(raw) = row.try_get_raw(idx) else {
        return RawValue::Null;
    };
    if raw.is_null() {
        return RawValue::Null;
    }
    let storage = raw.type_info().name().to_ascii_uppercase();
    let integer = || row.try_get_unchecked::<i64, _>(idx).ok().map(RawValue::Integer);
    let float = || row.try_get_unchecked::<f64, _>(idx).ok().map(RawValue::Float);
    let text = || row.try_get_unchecked::<String, _>(idx).ok().map(RawValue::Text);
    let decoded = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => integer(),
        "REAL" => float(),
        "NUMERIC" => integer().or_else(float),
        _ => text().or_else(float),
    };
    decoded.unwrap_or(RawValue::Null)
}

/// In-process tables, keyed by database and table name.
#[derive(Debug, Clone, Default)]
pub struct MemoryRowSource {
    tables: HashMap<(String, String), Vec<RawRow>>,
}

impl MemoryRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, database: &str, table: &str, rows: Vec<RawRow>) -> Self {
        self.tables
            .insert((database.to_string(), table.to_string()), rows);
        self
    }
}

#[async_trait]
impl RowSource for MemoryRowSource {
    fn source_name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_rows(&self, table: &TableRef) -> Result<Vec<RawRow>, VitalsError> {
        let key = (table.database.to_string(), table.table.to_string());
        self.tables
            .get(&key)
            .cloned()
            .ok_or_else(|| VitalsError::source_unavailable(format!("reading table {table}"), "no such table"))
    }

    async fn list_tables(&self, database: &Identifier) -> Result<Vec<String>, VitalsError> {
        let mut names = self
            .tables
            .keys()
            .filter(|(db, _)| db == database.as_str())
            .map(|(_, table)| table.clone())
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }
}

/// JSON exports laid out as `<root>/<database>/<table>.json`, each an array
/// of row objects.
#[derive(Debug, Clone)]
pub struct FixtureRowSource {
    root: PathBuf,
}

impl FixtureRowSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn table_path(&self, table: &TableRef) -> PathBuf {
        self.root
            .join(table.database.as_str())
            .join(format!("{}.json", table.table))
    }
}

#[async_trait]
impl RowSource for FixtureRowSource {
    fn source_name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_rows(&self, table: &TableRef) -> Result<Vec<RawRow>, VitalsError> {
        let path = self.table_path(table);
        let text = fs::read_to_string(&path)
            .await
            .map_err(|err| VitalsError::source_unavailable(format!("reading {}", path.display()), err))?;
        let rows = parse_fixture_rows(&text)
            .map_err(|err| VitalsError::source_unavailable(format!("parsing {}", path.display()), format!("{err:#}")))?;
        debug!(%table, rows = rows.len(), "loaded fixture table");
        Ok(rows)
    }

    async fn list_tables(&self, database: &Identifier) -> Result<Vec<String>, VitalsError> {
        let dir = self.root.join(database.as_str());
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|err| VitalsError::source_unavailable(format!("reading {}", dir.display()), err))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| VitalsError::source_unavailable(format!("reading {}", dir.display()), err))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Writes `rows` to the path [`FixtureRowSource`] reads `table` from.
pub async fn write_fixture_table(
    root: &Path,
    table: &TableRef,
    rows: &[RawRow],
) -> anyhow::Result<PathBuf> {
    let path = FixtureRowSource::new(root).table_path(table);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(rows).context("serializing rows")?;
    fs::write(&path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Copies every table of `database` into a fixture tree under `root` and
/// returns each exported table with its row count. Tables whose names are
/// not plain identifiers are skipped.
pub async fn export_database(
    source: &dyn RowSource,
    database: &Identifier,
    root: &Path,
) -> anyhow::Result<Vec<(TableRef, usize)>> {
    let mut exported = Vec::new();
    for name in source.list_tables(database).await? {
        let table = match Identifier::parse(&name) {
            Ok(table) => TableRef {
                database: database.clone(),
                table,
            },
            Err(err) => {
                warn!(%database, table = %name, error = %err, "skipping table");
                continue;
            }
        };
        let rows = source.fetch_rows(&table).await?;
        let path = write_fixture_table(root, &table, &rows).await?;
        info!(%table, rows = rows.len(), path = %path.display(), "exported table");
        exported.push((table, rows.len()));
    }
    Ok(exported)
}

pub fn load_fixture_rows(path: impl AsRef<Path>) -> anyhow::Result<Vec<RawRow>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_fixture_rows(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_fixture_rows(text: &str) -> anyhow::Result<Vec<RawRow>> {
    let value: JsonValue = serde_json::from_str(text).context("fixture is not valid JSON")?;
    let items = value
        .as_array()
        .context("fixture must be a JSON array of row objects")?;
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let object = item
                .as_object()
                .with_context(|| format!("fixture row {idx} is not an object"))?;
            Ok(object
                .iter()
                .map(|(column, cell)| (column.clone(), raw_value_from_json(cell)))
                .collect())
        })
        .collect()
}

pub fn raw_value_from_json(value: &JsonValue) -> RawValue {
    match value {
        JsonValue::Null => RawValue::Null,
        JsonValue::Bool(b) => RawValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => n
            .as_i64()
            .map(RawValue::Integer)
            .or_else(|| n.as_f64().map(RawValue::Float))
            .unwrap_or(RawValue::Null),
        JsonValue::String(s) => RawValue::Text(s.clone()),
        other => RawValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn seed_sqlite(dir: &Path, database: &str, statements: &[&str]) {
        let path = dir.join(format!("{database}.db"));
        let mut conn = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .connect()
            .await
            .expect("create sqlite db");
        for statement in statements {
            sqlx::query(statement)
                .execute(&mut conn)
                .await
                .expect("seed statement");
        }
        conn.close().await.expect("close");
    }

    #[test]
    fn identifiers_reject_anything_but_word_characters() {
        assert!(Identifier::parse("days_summary").is_ok());
        assert!(Identifier::parse("garmin2024").is_ok());
        for bad in ["", "days summary", "days;DROP TABLE x", " days", "a.b", "x\"y", "tab\t"] {
            let err = Identifier::parse(bad).unwrap_err();
            assert_eq!(err.kind(), "invalid_identifier", "{bad:?}");
        }
        assert!(TableRef::parse("garmin_summary", "days;").is_err());
    }

    #[tokio::test]
    async fn sqlite_rows_decode_by_storage_class() {
        let dir = tempdir().expect("tempdir");
        seed_sqlite(
            dir.path(),
            "garmin_summary",
            &[
                "CREATE TABLE days_summary (day DATE, hr_min INTEGER, weight_avg REAL, sleep_avg TIME, stress_avg FLOAT)",
                "INSERT INTO days_summary VALUES ('2025-01-30', 48, 72.4, '07:12:30.000000', NULL)",
                "INSERT INTO days_summary VALUES ('2025-01-29', 50.6, NULL, NULL, 31.0)",
            ],
        )
        .await;

        let source = SqliteRowSource::new(dir.path(), Duration::from_secs(5));
        let table = TableRef::parse("garmin_summary", "days_summary").unwrap();
        let rows = source.fetch_rows(&table).await.expect("fetch");

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("day"), Some(&RawValue::Text("2025-01-30".into())));
        assert_eq!(rows[0].get("hr_min"), Some(&RawValue::Integer(48)));
        assert_eq!(rows[0].get("weight_avg"), Some(&RawValue::Float(72.4)));
        assert_eq!(rows[0].get("stress_avg"), Some(&RawValue::Null));
        assert_eq!(rows[1].get("hr_min"), Some(&RawValue::Float(50.6)));
        assert_eq!(rows[1].get("stress_avg"), Some(&RawValue::Float(31.0)));
    }

    #[tokio::test]
    async fn empty_tables_yield_no_rows() {
        let dir = tempdir().expect("tempdir");
        seed_sqlite(dir.path(), "garmin_summary", &["CREATE TABLE weeks_summary (first_day DATE)"]).await;
        let source = SqliteRowSource::new(dir.path(), Duration::from_secs(5));
        let table = TableRef::parse("garmin_summary", "weeks_summary").unwrap();
        assert!(source.fetch_rows(&table).await.expect("fetch").is_empty());
    }

    #[tokio::test]
    async fn missing_tables_and_databases_are_source_failures() {
        let dir = tempdir().expect("tempdir");
        seed_sqlite(dir.path(), "garmin_summary", &["CREATE TABLE days_summary (day DATE)"]).await;
        let source = SqliteRowSource::new(dir.path(), Duration::from_secs(5));

        let missing_table = TableRef::parse("garmin_summary", "nope").unwrap();
        let err = source.fetch_rows(&missing_table).await.unwrap_err();
        assert_eq!(err.kind(), "source_unavailable");

        let missing_db = TableRef::parse("not_there", "days_summary").unwrap();
        let err = source.fetch_rows(&missing_db).await.unwrap_err();
        assert_eq!(err.kind(), "source_unavailable");
        assert!(!dir.path().join("not_there.db").exists());
    }

    #[tokio::test]
    async fn sqlite_lists_user_tables() {
        let dir = tempdir().expect("tempdir");
        seed_sqlite(
            dir.path(),
            "garmin_summary",
            &[
                "CREATE TABLE weeks_summary (first_day DATE)",
                "CREATE TABLE days_summary (day DATE)",
            ],
        )
        .await;
        let source = SqliteRowSource::new(dir.path(), Duration::from_secs(5));
        let db = Identifier::parse("garmin_summary").unwrap();
        assert_eq!(
            source.list_tables(&db).await.expect("list"),
            vec!["days_summary".to_string(), "weeks_summary".to_string()]
        );
    }

    #[tokio::test]
    async fn exported_databases_read_back_as_fixtures() {
        let dir = tempdir().expect("tempdir");
        let source = MemoryRowSource::new()
            .with_table(
                "garmin_summary",
                "days_summary",
                vec![
                    RawRow::new().with("day", "2025-01-30").with("hr_min", 48i64).with("weight_avg", 72.4f64),
                    RawRow::new().with("day", "2025-01-31").with("hr_min", RawValue::Null),
                ],
            )
            .with_table("garmin_summary", "weeks_summary", Vec::new())
            .with_table("garmin_summary", "odd name", vec![RawRow::new().with("x", 1i64)])
            .with_table("garmin", "sleep", vec![RawRow::new().with("day", "2025-01-30")]);
        let db = Identifier::parse("garmin_summary").unwrap();

        let exported = export_database(&source, &db, dir.path()).await.expect("export");
        let counts = exported
            .iter()
            .map(|(table, rows)| (table.to_string(), *rows))
            .collect::<Vec<_>>();
        assert_eq!(
            counts,
            vec![
                ("garmin_summary.days_summary".to_string(), 2),
                ("garmin_summary.weeks_summary".to_string(), 0),
            ]
        );

        let fixtures = FixtureRowSource::new(dir.path());
        assert_eq!(
            fixtures.list_tables(&db).await.expect("list"),
            vec!["days_summary".to_string(), "weeks_summary".to_string()]
        );
        let days = TableRef::parse("garmin_summary", "days_summary").unwrap();
        let original = source.fetch_rows(&days).await.unwrap();
        assert_eq!(fixtures.fetch_rows(&days).await.expect("read back"), original);
        assert!(!dir.path().join("garmin").exists());
    }

    #[tokio::test]
    async fn memory_source_serves_registered_tables() {
        let source = MemoryRowSource::new().with_table(
            "garmin_summary",
            "days_summary",
            vec![RawRow::new().with("day", "2025-01-30")],
        );
        let table = TableRef::parse("garmin_summary", "days_summary").unwrap();
        assert_eq!(source.fetch_rows(&table).await.unwrap().len(), 1);

        let other = TableRef::parse("garmin_summary", "weeks_summary").unwrap();
        assert_eq!(source.fetch_rows(&other).await.unwrap_err().kind(), "source_unavailable");
    }

    #[test]
    fn fixture_json_cells_become_raw_values() {
        let rows = parse_fixture_rows(
            r#"[{"day": "2025-01-30", "hr_min": 48, "weight_avg": 72.5, "bb_max": null, "flag": true}]"#,
        )
        .expect("parse");
        assert_eq!(rows[0].get("hr_min"), Some(&RawValue::Integer(48)));
        assert_eq!(rows[0].get("weight_avg"), Some(&RawValue::Float(72.5)));
        assert_eq!(rows[0].get("bb_max"), Some(&RawValue::Null));
        assert_eq!(rows[0].get("flag"), Some(&RawValue::Integer(1)));
        assert!(parse_fixture_rows(r#"{"day": 1}"#).is_err());
    }
}

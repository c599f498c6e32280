use crate::db::{Database, Queries};
use crate::errors::SchemaError;
use crate::prelude::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde_json::{Map, Value};

/// The parsed tabular payload of a dataset: a JSON array of row objects.
///
/// Column presence is computed over the union of the row keys, so a column
/// that only some rows carry still counts as present.
pub struct Table {
    rows: Vec<Map<String, Value>>,
}

impl Table {
    pub fn parse(df: &str) -> Fallible<Table> {
        let rows: Vec<Map<String, Value>> = serde_json::from_str(df).map_err(|_| {
            SchemaError::new("'df' should be a JSON array of row objects. Use df.to_json()...")
        })?;
        Ok(Table { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.rows.iter().any(|row| row.contains_key(name))
    }

    pub fn row(&self, num_line: usize) -> Option<&Map<String, Value>> {
        self.rows.get(num_line)
    }

    /// The value of `column` at `num_line` rendered as text, the way it is fed
    /// to prompts and metrics. Non-string JSON values are serialized.
    pub fn text_field(&self, num_line: usize, column: &str) -> Option<String> {
        let value = self.row(num_line)?.get(column)?;
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Dataset {
    pub id: i64,
    pub name: String,
    pub readme: Option<String>,
    pub has_query: bool,
    pub has_output: bool,
    pub has_output_true: bool,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct DatasetFull {
    #[serde(flatten)]
    pub dataset: Dataset,
    pub df: String,
}

#[derive(Clone, Deserialize)]
pub struct DatasetNew {
    pub name: String,
    #[serde(default)]
    pub readme: Option<String>,
    pub df: String,
}

#[derive(Deserialize)]
pub struct DatasetPatch {
    pub name: Option<String>,
    pub readme: Option<String>,
}

impl Dataset {
    pub fn create(db: &Database, new: &DatasetNew) -> Fallible<Dataset> {
        let table = Table::parse(&new.df)?;
        let id = Dataset::insert(db, new, &table)?;
        Dataset::get(db, id)?.ok_or_else(|| anyhow!("dataset {} vanished after insert", id))
    }

    /// Validates the payload and inserts the row; callers needing atomicity
    /// with surrounding writes pass a transaction.
    pub(crate) fn insert<Q: Queries>(q: &Q, new: &DatasetNew, table: &Table) -> Fallible<i64> {
        let has_query = table.has_column("query");
        let has_output = table.has_column("output");
        let has_output_true = table.has_column("output_true");

        if !(has_query || has_output) {
            return Err(
                SchemaError::new("your dataset needs at least a column 'query' or 'output'")
                    .into(),
            );
        }

        q.insert(
            "INSERT INTO datasets (name, readme, df, has_query, has_output, \
             has_output_true, size, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                new.name,
                new.readme,
                new.df,
                has_query,
                has_output,
                has_output_true,
                table.len() as i64,
                Utc::now(),
            ],
        )
    }

    pub fn get(db: &Database, id: i64) -> Fallible<Option<Dataset>> {
        db.first(
            "SELECT id, name, readme, has_query, has_output, has_output_true, \
             size, created_at FROM datasets WHERE id = ?1;",
            [id],
            Dataset::from_row,
        )
    }

    pub fn by_name(db: &Database, name: &str) -> Fallible<Option<Dataset>> {
        db.first(
            "SELECT id, name, readme, has_query, has_output, has_output_true, \
             size, created_at FROM datasets WHERE name = ?1;",
            [name],
            Dataset::from_row,
        )
    }

    pub fn all(db: &Database) -> Fallible<Vec<Dataset>> {
        db.select(
            "SELECT id, name, readme, has_query, has_output, has_output_true, \
             size, created_at FROM datasets ORDER BY id;",
            [],
            Dataset::from_row,
        )
    }

    pub fn payload(db: &Database, id: i64) -> Fallible<Option<String>> {
        db.first("SELECT df FROM datasets WHERE id = ?1;", [id], |r| {
            r.get("df")
        })
    }

    pub fn table(db: &Database, id: i64) -> Fallible<Option<Table>> {
        match Dataset::payload(db, id)? {
            Some(df) => Ok(Some(Table::parse(&df)?)),
            None => Ok(None),
        }
    }

    pub fn full(db: &Database, id: i64) -> Fallible<Option<DatasetFull>> {
        let dataset = match Dataset::get(db, id)? {
            Some(dataset) => dataset,
            None => return Ok(None),
        };
        let df = Dataset::payload(db, id)?.unwrap_or_default();
        Ok(Some(DatasetFull { dataset, df }))
    }

    /// The payload is immutable; only the name and the readme can change.
    pub fn update(db: &Database, id: i64, patch: &DatasetPatch) -> Fallible<Option<Dataset>> {
        if Dataset::get(db, id)?.is_none() {
            return Ok(None);
        }

        if let Some(ref name) = patch.name {
            db.execute(
                "UPDATE datasets SET name = ?1 WHERE id = ?2;",
                params![name, id],
            )?;
        }
        if let Some(ref readme) = patch.readme {
            db.execute(
                "UPDATE datasets SET readme = ?1 WHERE id = ?2;",
                params![readme, id],
            )?;
        }

        Dataset::get(db, id)
    }

    pub fn delete(db: &Database, id: i64) -> Fallible<bool> {
        let linked: i64 = db
            .first(
                "SELECT COUNT(*) AS count FROM experiments WHERE dataset_id = ?1;",
                [id],
                |r| r.get("count"),
            )?
            .unwrap_or(0);
        if linked > 0 {
            return Err(SchemaError::new(format!(
                "this dataset is linked to {linked} experiments; \
                 delete them or associate them to another dataset first"
            ))
            .into());
        }

        let changes = db.execute("DELETE FROM datasets WHERE id = ?1;", [id])?;
        Ok(changes > 0)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Dataset> {
        Ok(Dataset {
            id: row.get("id")?,
            name: row.get("name")?,
            readme: row.get("readme")?,
            has_query: row.get("has_query")?,
            has_output: row.get("has_output")?,
            has_output_true: row.get("has_output_true")?,
            size: row.get("size")?,
            created_at: row.get("created_at")?,
        })
    }
}

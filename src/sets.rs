use crate::db::{Database, Queries};
use crate::prelude::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

/// A named collection of experiments, usually the points of a parameter grid.
#[derive(Clone, Debug, Serialize)]
pub struct ExperimentSet {
    pub id: i64,
    pub name: String,
    pub readme: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct ExperimentSetPatchFields {
    pub name: Option<String>,
    pub readme: Option<String>,
}

impl ExperimentSet {
    pub fn create(db: &Database, name: &str, readme: Option<&str>) -> Fallible<ExperimentSet> {
        let id = db.insert(
            "INSERT INTO experiment_sets (name, readme, created_at) VALUES (?1, ?2, ?3);",
            params![name, readme, Utc::now()],
        )?;
        ExperimentSet::get(db, id)?.ok_or_else(|| anyhow!("set {} vanished after insert", id))
    }

    pub fn get(db: &Database, id: i64) -> Fallible<Option<ExperimentSet>> {
        db.first(
            "SELECT * FROM experiment_sets WHERE id = ?1;",
            [id],
            ExperimentSet::from_row,
        )
    }

    pub fn all(db: &Database) -> Fallible<Vec<ExperimentSet>> {
        db.select(
            "SELECT * FROM experiment_sets ORDER BY id;",
            [],
            ExperimentSet::from_row,
        )
    }

    pub fn update(
        db: &Database,
        id: i64,
        patch: &ExperimentSetPatchFields,
    ) -> Fallible<Option<ExperimentSet>> {
        if ExperimentSet::get(db, id)?.is_none() {
            return Ok(None);
        }
        if let Some(ref name) = patch.name {
            db.execute(
                "UPDATE experiment_sets SET name = ?1 WHERE id = ?2;",
                params![name, id],
            )?;
        }
        if let Some(ref readme) = patch.readme {
            db.execute(
                "UPDATE experiment_sets SET readme = ?1 WHERE id = ?2;",
                params![readme, id],
            )?;
        }
        ExperimentSet::get(db, id)
    }

    pub fn delete(db: &Database, id: i64) -> Fallible<bool> {
        let changes = db.execute("DELETE FROM experiment_sets WHERE id = ?1;", [id])?;
        Ok(changes > 0)
    }

    /// The highest `__N` suffix among the set's experiment names. Appending
    /// picks up from here rather than from the experiment count, so
    /// pre-existing gaps can never produce a colliding name.
    pub fn max_name_suffix(db: &Database, id: i64) -> Fallible<Option<i64>> {
        let names: Vec<String> = db.select(
            "SELECT name FROM experiments WHERE experiment_set_id = ?1;",
            [id],
            |r| r.get("name"),
        )?;

        Ok(names
            .iter()
            .filter_map(|name| parse_name_suffix(name))
            .max())
    }

    fn from_row(row: &Row) -> rusqlite::Result<ExperimentSet> {
        Ok(ExperimentSet {
            id: row.get("id")?,
            name: row.get("name")?,
            readme: row.get("readme")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn parse_name_suffix(name: &str) -> Option<i64> {
    let (_, suffix) = name.rsplit_once("__")?;
    suffix.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::{parse_name_suffix, ExperimentSet};
    use crate::db::Database;

    #[test]
    fn test_name_suffix_parsing() {
        assert_eq!(parse_name_suffix("set__0"), Some(0));
        assert_eq!(parse_name_suffix("set__12"), Some(12));
        assert_eq!(parse_name_suffix("set__extra__3"), Some(3));
        assert_eq!(parse_name_suffix("set"), None);
        assert_eq!(parse_name_suffix("set__x"), None);
    }

    #[test]
    fn test_create_and_rename() {
        let db = Database::temp().unwrap();
        let set = ExperimentSet::create(&db, "sweep", Some("grid over models")).unwrap();
        assert_eq!(set.name, "sweep");

        let renamed = ExperimentSet::update(
            &db,
            set.id,
            &super::ExperimentSetPatchFields {
                name: Some("sweep-2".into()),
                readme: None,
            },
        )
        .unwrap()
        .unwrap();
        assert_eq!(renamed.name, "sweep-2");
        assert_eq!(renamed.readme.as_deref(), Some("grid over models"));
    }

    #[test]
    fn test_duplicate_set_name_conflicts() {
        let db = Database::temp().unwrap();
        ExperimentSet::create(&db, "sweep", None).unwrap();
        let err = ExperimentSet::create(&db, "sweep", None).unwrap_err();
        assert!(crate::errors::is_constraint_violation(&err));
    }
}

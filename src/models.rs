use crate::db::{Database, Queries};
use crate::prelude::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde_json::Value;

/// An LLM endpoint descriptor. Two experiments pointing at the same upstream
/// model with different parameters are two distinct rows.
#[derive(Clone, Serialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub prompt_system: Option<String>,
    pub sampling_params: Option<Value>,
    pub extra_params: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Deserialize)]
pub struct ModelNew {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub prompt_system: Option<String>,
    #[serde(default)]
    pub sampling_params: Option<Value>,
    #[serde(default)]
    pub extra_params: Option<Value>,
}

impl Model {
    pub fn create(db: &Database, new: &ModelNew) -> Fallible<Model> {
        let id = Model::insert(db, new)?;
        Model::get(db, id)?.ok_or_else(|| anyhow!("model {} vanished after insert", id))
    }

    pub(crate) fn insert<Q: Queries>(q: &Q, new: &ModelNew) -> Fallible<i64> {
        let sampling_params = match &new.sampling_params {
            Some(bag) => Some(serde_json::to_string(bag)?),
            None => None,
        };
        let extra_params = match &new.extra_params {
            Some(bag) => Some(serde_json::to_string(bag)?),
            None => None,
        };

        q.insert(
            "INSERT INTO models (name, base_url, api_key, prompt_system, \
             sampling_params, extra_params, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                new.name,
                new.base_url,
                new.api_key,
                new.prompt_system,
                sampling_params,
                extra_params,
                Utc::now(),
            ],
        )
    }

    pub fn get(db: &Database, id: i64) -> Fallible<Option<Model>> {
        let record = db.first(
            "SELECT * FROM models WHERE id = ?1;",
            [id],
            ModelDBRecord::from_row,
        )?;

        record.map(|record| record.into_model()).transpose()
    }

}

struct ModelDBRecord {
    id: i64,
    name: String,
    base_url: String,
    api_key: String,
    prompt_system: Option<String>,
    sampling_params: Option<String>,
    extra_params: Option<String>,
    created_at: DateTime<Utc>,
}

impl ModelDBRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(ModelDBRecord {
            id: row.get("id")?,
            name: row.get("name")?,
            base_url: row.get("base_url")?,
            api_key: row.get("api_key")?,
            prompt_system: row.get("prompt_system")?,
            sampling_params: row.get("sampling_params")?,
            extra_params: row.get("extra_params")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_model(self) -> Fallible<Model> {
        Ok(Model {
            id: self.id,
            name: self.name,
            base_url: self.base_url,
            api_key: self.api_key,
            prompt_system: self.prompt_system,
            sampling_params: self
                .sampling_params
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            extra_params: self
                .extra_params
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Model, ModelNew};
    use crate::db::Database;

    #[test]
    fn test_param_bags_round_trip() {
        let db = Database::temp().unwrap();

        let model = Model::create(
            &db,
            &ModelNew {
                name: "judge-large".into(),
                base_url: "http://localhost:8080/v1".into(),
                api_key: "secret".into(),
                prompt_system: Some("You are a judge.".into()),
                sampling_params: Some(serde_json::json!({"temperature": 0.2})),
                extra_params: None,
            },
        )
        .unwrap();

        let fetched = Model::get(&db, model.id).unwrap().unwrap();
        assert_eq!(fetched.name, "judge-large");
        assert_eq!(
            fetched.sampling_params.unwrap()["temperature"],
            serde_json::json!(0.2)
        );
        assert!(fetched.extra_params.is_none());
    }

    #[test]
    fn test_api_key_never_serialized() {
        let db = Database::temp().unwrap();

        let model = Model::create(
            &db,
            &ModelNew {
                name: "m".into(),
                base_url: "http://localhost".into(),
                api_key: "secret".into(),
                prompt_system: None,
                sampling_params: None,
                extra_params: None,
            },
        )
        .unwrap();

        let json = serde_json::to_string(&model).unwrap();
        assert!(!json.contains("secret"));
    }
}

use crate::datasets::{Dataset, DatasetNew, Table};
use crate::db::{Database, Queries};
use crate::errors::SchemaError;
use crate::experiments::Experiment;
use crate::metrics::{Requirement, REGISTRY};
use crate::models::{Model, ModelNew};
use crate::prelude::*;
use crate::results::{MetricResult, MetricStatus};
use chrono::Utc;

/// Either an existing dataset referenced by name or a new payload created
/// together with the experiment.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum DatasetRef {
    Name(String),
    Inline(DatasetNew),
}

#[derive(Clone, Deserialize)]
pub struct CreateExperiment {
    pub name: String,
    #[serde(default)]
    pub readme: Option<String>,
    #[serde(default)]
    pub experiment_set_id: Option<i64>,
    pub metrics: Vec<String>,
    pub dataset: DatasetRef,
    #[serde(default)]
    pub model: Option<ModelNew>,
}

/// The dataset shape the metric compatibility checks run against, resolvable
/// without writing anything.
struct DatasetShape {
    has_query: bool,
    has_output: bool,
    has_output_true: bool,
}

impl CreateExperiment {
    /// Validates the metric/dataset/model combination and creates the
    /// experiment with its pending results in one transaction. Nothing is
    /// written when validation fails.
    pub fn apply(self, db: &Database) -> Fallible<Experiment> {
        let (shape, existing_dataset, inline_table) = match &self.dataset {
            DatasetRef::Name(name) => {
                let dataset = Dataset::by_name(db, name)?.ok_or_else(|| {
                    SchemaError::new(format!("dataset '{name}' not found"))
                })?;
                let shape = DatasetShape {
                    has_query: dataset.has_query,
                    has_output: dataset.has_output,
                    has_output_true: dataset.has_output_true,
                };
                (shape, Some(dataset), None)
            }
            DatasetRef::Inline(new) => {
                let table = Table::parse(&new.df)?;
                let shape = DatasetShape {
                    has_query: table.has_column("query"),
                    has_output: table.has_column("output"),
                    has_output_true: table.has_column("output_true"),
                };
                (shape, None, Some(table))
            }
        };

        validate_metrics(&self.metrics, &shape, self.model.is_some())?;

        let experiment_id = db.write_transaction(|tx| {
            let dataset_id = match (&existing_dataset, &inline_table) {
                (Some(dataset), _) => dataset.id,
                (None, Some(table)) => match &self.dataset {
                    DatasetRef::Inline(new) => Dataset::insert(tx, new, table)?,
                    DatasetRef::Name(_) => unreachable!(),
                },
                (None, None) => unreachable!(),
            };

            let model_id = match &self.model {
                Some(model) => Some(Model::insert(tx, model)?),
                None => None,
            };

            let experiment_id = tx.insert(
                "INSERT INTO experiments (name, readme, experiment_status, \
                 dataset_id, model_id, experiment_set_id, created_at) \
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6);",
                rusqlite::params![
                    self.name,
                    self.readme,
                    dataset_id,
                    model_id,
                    self.experiment_set_id,
                    Utc::now(),
                ],
            )?;

            for metric_name in &self.metrics {
                MetricResult::create(tx, experiment_id, metric_name)?;
            }

            Ok(experiment_id)
        })?;

        Experiment::get(db, experiment_id)?
            .ok_or_else(|| anyhow!("experiment {} vanished after insert", experiment_id))
    }

    #[cfg(test)]
    pub(crate) fn dummy(db: &Database, name: &str) -> Experiment {
        CreateExperiment {
            name: name.to_string(),
            readme: None,
            experiment_set_id: None,
            metrics: vec!["judge_exactness".into()],
            dataset: DatasetRef::Inline(DatasetNew {
                name: format!("{name}-dataset"),
                readme: None,
                df: r#"[
                    {"query": "q0", "output": "o0", "output_true": "t0"},
                    {"query": "q1", "output": "o1", "output_true": "t1"}
                ]"#
                .into(),
            }),
            model: None,
        }
        .apply(db)
        .unwrap()
    }
}

/// Adds metrics to an existing experiment: already-known metrics get their
/// result reset to pending, new ones get a fresh pending result.
pub struct AddMetrics {
    pub experiment_id: i64,
    pub metrics: Vec<String>,
}

impl AddMetrics {
    pub fn apply(self, db: &Database) -> Fallible<()> {
        let experiment = Experiment::get(db, self.experiment_id)?
            .ok_or_else(|| anyhow!("experiment {} not found", self.experiment_id))?;
        let dataset = Dataset::get(db, experiment.dataset_id)?
            .ok_or_else(|| anyhow!("dataset {} not found", experiment.dataset_id))?;
        let shape = DatasetShape {
            has_query: dataset.has_query,
            has_output: dataset.has_output,
            has_output_true: dataset.has_output_true,
        };
        validate_metrics(&self.metrics, &shape, experiment.model_id.is_some())?;

        for metric_name in &self.metrics {
            match MetricResult::find(db, experiment.id, metric_name)? {
                Some(result) => {
                    MetricResult::set_status(db, result.id, MetricStatus::Pending)?;
                }
                None => {
                    db.write_transaction(|tx| {
                        MetricResult::create(tx, experiment.id, metric_name)?;
                        Ok(())
                    })?;
                }
            }
        }

        Ok(())
    }
}

fn validate_metrics(
    metrics: &[String],
    shape: &DatasetShape,
    has_model: bool,
) -> Fallible<()> {
    let mut needs_query = false;
    let mut needs_output = false;
    let mut needs_output_true = false;

    for name in metrics {
        let metric = REGISTRY
            .get(name)
            .ok_or_else(|| SchemaError::new(format!("unknown metric: {name}")))?;
        needs_query |= metric.requires(Requirement::Query);
        needs_output |= metric.requires(Requirement::Output);
        needs_output_true |= metric.requires(Requirement::OutputTrue);
    }

    if needs_query && !shape.has_query {
        return Err(SchemaError::new(
            "you need to provide a query for this metric: \
             your dataset needs a 'query' column",
        )
        .into());
    }
    if needs_output && !has_model && !shape.has_output {
        return Err(SchemaError::new(
            "you need to provide an answer for this metric: \
             either set a model to generate it or provide a dataset with an 'output' column",
        )
        .into());
    }
    if needs_output && !shape.has_output && !shape.has_query {
        return Err(SchemaError::new(
            "you need to provide an answer for this metric: \
             provide a dataset with a 'query' column to generate it \
             or with an 'output' column if you generated it yourself",
        )
        .into());
    }
    if needs_output_true && !shape.has_output_true {
        return Err(SchemaError::new(
            "you need to provide a ground truth for this metric: \
             your dataset needs an 'output_true' column",
        )
        .into());
    }
    if shape.has_output && has_model {
        return Err(SchemaError::new(
            "you can't give both a model and a dataset with an 'output' column; \
             give either one or the other",
        )
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{AddMetrics, CreateExperiment, DatasetRef};
    use crate::datasets::DatasetNew;
    use crate::db::Database;
    use crate::errors::SchemaError;
    use crate::experiments::{Experiment, ExperimentStatus};
    use crate::models::ModelNew;
    use crate::results::MetricResult;

    fn dummy_model() -> ModelNew {
        ModelNew {
            name: "model-a".into(),
            base_url: "http://localhost:8080/v1".into(),
            api_key: "key".into(),
            prompt_system: None,
            sampling_params: None,
            extra_params: None,
        }
    }

    #[test]
    fn test_creation_with_pending_results() {
        let db = Database::temp().unwrap();
        let ex = CreateExperiment::dummy(&db, "fresh");

        assert_eq!(ex.status, ExperimentStatus::Pending);
        assert_eq!(ex.num_metrics, 1);
        assert_eq!(ex.num_try, 0);

        let results = MetricResult::by_experiment(&db, ex.id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metric_name, "judge_exactness");
    }

    #[test]
    fn test_rejects_metric_without_ground_truth() {
        let db = Database::temp().unwrap();

        // The dataset has no output_true column, which judge_exactness
        // requires. Nothing must be persisted.
        let err = CreateExperiment {
            name: "invalid".into(),
            readme: None,
            experiment_set_id: None,
            metrics: vec!["judge_exactness".into()],
            dataset: DatasetRef::Inline(DatasetNew {
                name: "queries-only".into(),
                readme: None,
                df: r#"[{"query": "q0", "output": "o0"}]"#.into(),
            }),
            model: None,
        }
        .apply(&db)
        .unwrap_err();

        assert!(err.downcast_ref::<SchemaError>().is_some());
        assert!(crate::datasets::Dataset::by_name(&db, "queries-only")
            .unwrap()
            .is_none());
        assert!(Experiment::list(&db, &Default::default()).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_output_without_model_or_column() {
        let db = Database::temp().unwrap();

        let err = CreateExperiment {
            name: "invalid".into(),
            readme: None,
            experiment_set_id: None,
            metrics: vec!["nb_tokens_completion".into()],
            dataset: DatasetRef::Inline(DatasetNew {
                name: "queries-only".into(),
                readme: None,
                df: r#"[{"query": "q0"}]"#.into(),
            }),
            model: None,
        }
        .apply(&db)
        .unwrap_err();
        assert!(err.downcast_ref::<SchemaError>().is_some());
    }

    #[test]
    fn test_rejects_model_with_output_column() {
        let db = Database::temp().unwrap();

        let err = CreateExperiment {
            name: "ambiguous".into(),
            readme: None,
            experiment_set_id: None,
            metrics: vec!["nb_tokens_completion".into()],
            dataset: DatasetRef::Inline(DatasetNew {
                name: "with-output".into(),
                readme: None,
                df: r#"[{"query": "q0", "output": "o0"}]"#.into(),
            }),
            model: Some(dummy_model()),
        }
        .apply(&db)
        .unwrap_err();
        assert!(err.downcast_ref::<SchemaError>().is_some());
    }

    #[test]
    fn test_rejects_unknown_metric() {
        let db = Database::temp().unwrap();

        let err = CreateExperiment {
            name: "invalid".into(),
            readme: None,
            experiment_set_id: None,
            metrics: vec!["definitely_not_registered".into()],
            dataset: DatasetRef::Inline(DatasetNew {
                name: "ds".into(),
                readme: None,
                df: r#"[{"query": "q0", "output": "o0"}]"#.into(),
            }),
            model: None,
        }
        .apply(&db)
        .unwrap_err();
        assert!(err.downcast_ref::<SchemaError>().is_some());
    }

    #[test]
    fn test_missing_dataset_by_name() {
        let db = Database::temp().unwrap();

        let err = CreateExperiment {
            name: "invalid".into(),
            readme: None,
            experiment_set_id: None,
            metrics: vec!["output_length".into()],
            dataset: DatasetRef::Name("nowhere".into()),
            model: None,
        }
        .apply(&db)
        .unwrap_err();
        assert!(err.downcast_ref::<SchemaError>().is_some());
    }

    #[test]
    fn test_add_metrics_resets_existing_result() {
        let db = Database::temp().unwrap();
        let ex = CreateExperiment::dummy(&db, "patchable");

        AddMetrics {
            experiment_id: ex.id,
            metrics: vec!["judge_exactness".into(), "qa_f1".into()],
        }
        .apply(&db)
        .unwrap();

        let results = MetricResult::by_experiment(&db, ex.id).unwrap();
        assert_eq!(results.len(), 2);

        let ex = Experiment::get(&db, ex.id).unwrap().unwrap();
        assert_eq!(ex.num_metrics, 2);
    }
}

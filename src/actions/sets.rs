use crate::actions::CreateExperiment;
use crate::db::Database;
use crate::errors::SchemaError;
use crate::experiments::Experiment;
use crate::prelude::*;
use crate::sets::{parse_name_suffix, ExperimentSet};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The grid form of a set: every point of the cartesian product of
/// `grid_params`, merged over `common_params` and repeated `repeat` times,
/// becomes one experiment named `{set_name}__{i}`.
#[derive(Clone, Deserialize)]
pub struct GridSpec {
    pub common_params: Map<String, Value>,
    pub grid_params: BTreeMap<String, Vec<Value>>,
    #[serde(default = "default_repeat")]
    pub repeat: usize,
}

fn default_repeat() -> usize {
    1
}

#[derive(Deserialize)]
pub struct CreateExperimentSet {
    pub name: String,
    #[serde(default)]
    pub readme: Option<String>,
    #[serde(default)]
    pub experiments: Option<Vec<CreateExperiment>>,
    #[serde(default)]
    pub cv: Option<GridSpec>,
}

impl CreateExperimentSet {
    pub fn apply(self, db: &Database) -> Fallible<(ExperimentSet, Vec<Experiment>)> {
        if self.experiments.is_some() && self.cv.is_some() {
            return Err(SchemaError::new(
                "give either an experiments list or a cv parameter, not both",
            )
            .into());
        }

        let specs = match (self.experiments, self.cv) {
            (Some(specs), None) => specs,
            (None, Some(grid)) => expand_grid(&self.name, &grid)?,
            (None, None) => Vec::new(),
            (Some(_), Some(_)) => unreachable!("checked above"),
        };

        let set = ExperimentSet::create(db, &self.name, self.readme.as_deref())?;

        let mut created = Vec::with_capacity(specs.len());
        for mut spec in specs {
            spec.experiment_set_id = Some(set.id);
            match spec.apply(db) {
                Ok(experiment) => created.push(experiment),
                Err(err) => {
                    // Nothing partial survives: a set either comes up whole
                    // or not at all.
                    let _ = ExperimentSet::delete(db, set.id);
                    return Err(err);
                }
            }
        }

        Ok((set, created))
    }
}

/// Appends experiments to an existing set. Names carrying a `__N` suffix are
/// renumbered past the highest suffix already present, so reruns of the same
/// payload never collide.
pub struct AppendExperiments {
    pub set_id: i64,
    pub experiments: Vec<CreateExperiment>,
}

impl AppendExperiments {
    pub fn apply(self, db: &Database) -> Fallible<Vec<Experiment>> {
        let set = ExperimentSet::get(db, self.set_id)?
            .ok_or_else(|| anyhow!("experiment set {} not found", self.set_id))?;

        let mut next = ExperimentSet::max_name_suffix(db, set.id)?
            .map(|n| n + 1)
            .unwrap_or(0);

        let mut created = Vec::with_capacity(self.experiments.len());
        for mut spec in self.experiments {
            if parse_name_suffix(&spec.name).is_some() {
                let (prefix, _) = spec.name.rsplit_once("__").unwrap();
                let prefix = if prefix.is_empty() || prefix == "None" {
                    set.name.clone()
                } else {
                    prefix.to_string()
                };
                spec.name = format!("{prefix}__{next}");
                next += 1;
            }
            spec.experiment_set_id = Some(set.id);
            created.push(spec.apply(db)?);
        }

        Ok(created)
    }
}

fn expand_grid(set_name: &str, grid: &GridSpec) -> Fallible<Vec<CreateExperiment>> {
    let mut specs = Vec::new();
    let mut i = 0;
    for point in build_param_grid(&grid.common_params, &grid.grid_params) {
        for _ in 0..grid.repeat {
            let mut point = point.clone();
            point.insert("name".into(), Value::String(format!("{set_name}__{i}")));
            let spec: CreateExperiment = serde_json::from_value(Value::Object(point))
                .map_err(|e| SchemaError::new(format!("invalid grid point: {e}")))?;
            specs.push(spec);
            i += 1;
        }
    }
    Ok(specs)
}

/// Cartesian product of the grid parameters over the common ones. Dotted keys
/// address nested objects, so `model.name` varies a field inside the common
/// `model` block.
fn build_param_grid(
    common: &Map<String, Value>,
    grid: &BTreeMap<String, Vec<Value>>,
) -> Vec<Map<String, Value>> {
    let mut points = vec![common.clone()];
    for (key, values) in grid {
        let mut next = Vec::with_capacity(points.len() * values.len());
        for point in &points {
            for value in values {
                let mut point = point.clone();
                assign_path(&mut point, key, value.clone());
                next.push(point);
            }
        }
        points = next;
    }
    points
}

fn assign_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            assign_path(entry.as_object_mut().unwrap(), rest, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{build_param_grid, AppendExperiments, CreateExperimentSet, GridSpec};
    use crate::db::Database;
    use crate::errors::SchemaError;
    use crate::experiments::Experiment;
    use serde_json::{Map, Value};
    use std::collections::BTreeMap;

    fn grid_payload() -> GridSpec {
        serde_json::from_value(serde_json::json!({
            "common_params": {
                "metrics": ["judge_exactness"],
                "dataset": {
                    "name": "grid-dataset",
                    "df": r#"[{"query": "q0", "output": "o0", "output_true": "t0"}]"#,
                },
            },
            "grid_params": {"readme": ["variant a", "variant b"]},
            "repeat": 2,
        }))
        .unwrap()
    }

    #[test]
    fn test_param_grid_cartesian_product() {
        let common: Map<String, Value> =
            serde_json::from_value(serde_json::json!({"metrics": ["m"]})).unwrap();
        let grid: BTreeMap<String, Vec<Value>> = serde_json::from_value(serde_json::json!({
            "model.name": ["a", "b"],
            "model.sampling_params.temperature": [0.0, 1.0],
        }))
        .unwrap();

        let points = build_param_grid(&common, &grid);
        assert_eq!(points.len(), 4);
        for point in &points {
            assert_eq!(point["metrics"], serde_json::json!(["m"]));
            assert!(point["model"]["name"].is_string());
            assert!(point["model"]["sampling_params"]["temperature"].is_number());
        }
    }

    #[test]
    fn test_grid_set_naming() {
        let db = Database::temp().unwrap();

        // Grid points reference the dataset by name: an inline payload would
        // be re-created (and collide) at every point.
        crate::datasets::Dataset::create(
            &db,
            &crate::datasets::DatasetNew {
                name: "grid-dataset".into(),
                readme: None,
                df: r#"[{"query": "q0", "output": "o0", "output_true": "t0"}]"#.into(),
            },
        )
        .unwrap();

        let spec: CreateExperimentSet = serde_json::from_value(serde_json::json!({
            "name": "sweep",
            "cv": {
                "common_params": {
                    "metrics": ["judge_exactness"],
                    "dataset": "grid-dataset",
                },
                "grid_params": {"readme": ["variant a", "variant b"]},
                "repeat": 2,
            },
        }))
        .unwrap();

        let (set, experiments) = spec.apply(&db).unwrap();
        assert_eq!(experiments.len(), 4);
        let names: Vec<_> = experiments.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["sweep__0", "sweep__1", "sweep__2", "sweep__3"]);
        for experiment in &experiments {
            assert_eq!(experiment.experiment_set_id, Some(set.id));
        }
    }

    #[test]
    fn test_both_experiments_and_cv_rejected() {
        let db = Database::temp().unwrap();

        let err = CreateExperimentSet {
            name: "sweep".into(),
            readme: None,
            experiments: Some(Vec::new()),
            cv: Some(grid_payload()),
        }
        .apply(&db)
        .unwrap_err();
        assert!(err.downcast_ref::<SchemaError>().is_some());
    }

    #[test]
    fn test_failed_member_rolls_the_set_back() {
        let db = Database::temp().unwrap();

        // judge_exactness without output_true fails validation on the only
        // member; the set row must not survive.
        let spec: CreateExperimentSet = serde_json::from_value(serde_json::json!({
            "name": "doomed",
            "experiments": [{
                "name": "doomed__0",
                "metrics": ["judge_exactness"],
                "dataset": {
                    "name": "no-truth",
                    "df": r#"[{"query": "q0", "output": "o0"}]"#,
                },
            }],
        }))
        .unwrap();

        assert!(spec.apply(&db).is_err());
        assert!(crate::sets::ExperimentSet::all(&db).unwrap().is_empty());
    }

    #[test]
    fn test_append_bumps_past_max_suffix() {
        let db = Database::temp().unwrap();

        crate::datasets::Dataset::create(
            &db,
            &crate::datasets::DatasetNew {
                name: "grid-dataset".into(),
                readme: None,
                df: r#"[{"query": "q0", "output": "o0", "output_true": "t0"}]"#.into(),
            },
        )
        .unwrap();

        let spec: CreateExperimentSet = serde_json::from_value(serde_json::json!({
            "name": "sweep",
            "cv": {
                "common_params": {
                    "metrics": ["judge_exactness"],
                    "dataset": "grid-dataset",
                },
                "grid_params": {"readme": ["a", "b"]},
            },
        }))
        .unwrap();
        let (set, experiments) = spec.apply(&db).unwrap();
        assert_eq!(experiments.len(), 2);

        // Simulate a gap: delete sweep__0, leaving sweep__1 as the max.
        Experiment::delete(&db, experiments[0].id).unwrap();

        let appended = AppendExperiments {
            set_id: set.id,
            experiments: vec![serde_json::from_value(serde_json::json!({
                "name": "None__0",
                "metrics": ["judge_exactness"],
                "dataset": "grid-dataset",
            }))
            .unwrap()],
        }
        .apply(&db)
        .unwrap();

        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].name, "sweep__2");
    }
}

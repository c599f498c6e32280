mod builtin;

use crate::prelude::*;
use lazy_static::lazy_static;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

string_enum!(pub enum MetricKind {
    Llm => "llm",
    Human => "human",
    Deterministic => "deterministic",
    Ops => "ops",
});

string_enum!(pub enum Requirement {
    Query => "query",
    Output => "output",
    OutputTrue => "output_true",
});

/// What a metric callable gets to look at: the produced output, the metadata
/// bag recorded with the answer, and the dataset row fields named in the
/// metric's requirement set.
pub struct MetricInput<'a> {
    pub output: &'a str,
    pub metadata: &'a Map<String, Value>,
    pub row: &'a Map<String, Value>,
}

impl MetricInput<'_> {
    pub fn row_text(&self, column: &str) -> Option<String> {
        match self.row.get(column)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct MetricOutcome {
    pub score: Option<f64>,
    pub observation: Option<Value>,
}

impl MetricOutcome {
    pub fn score(score: f64) -> Self {
        MetricOutcome {
            score: Some(score),
            observation: None,
        }
    }

    pub fn empty() -> Self {
        MetricOutcome {
            score: None,
            observation: None,
        }
    }
}

type MetricFn = fn(&MetricInput) -> Fallible<MetricOutcome>;

pub struct Metric {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: MetricKind,
    pub require: &'static [Requirement],
    func: MetricFn,
}

impl Metric {
    pub fn evaluate(&self, input: &MetricInput) -> Fallible<MetricOutcome> {
        (self.func)(input)
    }

    pub fn requires(&self, requirement: Requirement) -> bool {
        self.require.contains(&requirement)
    }
}

/// Name → metric lookup, populated once at process init and frozen. The
/// engine only ever consults it; the callables stay opaque to it.
pub struct MetricRegistry {
    metrics: BTreeMap<&'static str, Metric>,
}

impl MetricRegistry {
    fn new() -> Self {
        MetricRegistry {
            metrics: BTreeMap::new(),
        }
    }

    fn add(&mut self, metric: Metric) {
        let name = metric.name;
        let previous = self.metrics.insert(name, metric);
        assert!(previous.is_none(), "duplicate metric registered: {}", name);
    }

    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.metrics.get(name)
    }

    pub fn all(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.metrics.keys().copied()
    }
}

lazy_static! {
    pub static ref REGISTRY: MetricRegistry = {
        let mut registry = MetricRegistry::new();
        builtin::register_all(&mut registry);
        registry
    };
}

#[cfg(test)]
mod tests {
    use super::{MetricInput, Requirement, REGISTRY};
    use serde_json::Map;

    #[test]
    fn test_builtins_are_registered() {
        for name in [
            "judge_exactness",
            "output_length",
            "qa_f1",
            "nb_tokens_prompt",
            "nb_tokens_completion",
            "nb_tool_calls",
            "generation_time",
        ] {
            assert!(REGISTRY.get(name).is_some(), "missing metric: {name}");
        }
        assert!(REGISTRY.get("does_not_exist").is_none());
    }

    #[test]
    fn test_requirement_sets() {
        let judge = REGISTRY.get("judge_exactness").unwrap();
        assert!(judge.requires(Requirement::Output));
        assert!(judge.requires(Requirement::OutputTrue));
        assert!(!judge.requires(Requirement::Query));

        let prompt_tokens = REGISTRY.get("nb_tokens_prompt").unwrap();
        assert!(prompt_tokens.requires(Requirement::Query));
    }

    #[test]
    fn test_row_text_renders_non_strings() {
        let mut row = Map::new();
        row.insert("output_true".into(), serde_json::json!(42));
        let metadata = Map::new();
        let input = MetricInput {
            output: "42",
            metadata: &metadata,
            row: &row,
        };
        assert_eq!(input.row_text("output_true").unwrap(), "42");
        assert!(input.row_text("query").is_none());
    }
}

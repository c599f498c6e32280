use super::{Metric, MetricInput, MetricKind, MetricOutcome, MetricRegistry, Requirement};
use crate::prelude::*;
use std::collections::HashSet;

pub(super) fn register_all(registry: &mut MetricRegistry) {
    registry.add(Metric {
        name: "judge_exactness",
        description: "Whether the output exactly matches the ground truth",
        kind: MetricKind::Deterministic,
        require: &[Requirement::Output, Requirement::OutputTrue],
        func: judge_exactness,
    });
    registry.add(Metric {
        name: "output_length",
        description: "Number of words in the output",
        kind: MetricKind::Deterministic,
        require: &[Requirement::Output],
        func: output_length,
    });
    registry.add(Metric {
        name: "qa_f1",
        description: "Token-level F1 between the output and the ground truth",
        kind: MetricKind::Deterministic,
        require: &[Requirement::Output, Requirement::OutputTrue],
        func: qa_f1,
    });
    registry.add(Metric {
        name: "nb_tokens_prompt",
        description: "Number of tokens in the prompt",
        kind: MetricKind::Ops,
        require: &[Requirement::Query],
        func: nb_tokens_prompt,
    });
    registry.add(Metric {
        name: "nb_tokens_completion",
        description: "Number of tokens in the completion",
        kind: MetricKind::Ops,
        require: &[Requirement::Output],
        func: nb_tokens_completion,
    });
    registry.add(Metric {
        name: "nb_tool_calls",
        description: "Number of tools that has been called for the generation",
        kind: MetricKind::Ops,
        require: &[Requirement::Output],
        func: nb_tool_calls,
    });
    registry.add(Metric {
        name: "generation_time",
        description: "The time to generate the answer/output",
        kind: MetricKind::Ops,
        require: &[Requirement::Output],
        func: generation_time,
    });
}

fn nb_tokens_prompt(input: &MetricInput) -> Fallible<MetricOutcome> {
    Ok(metadata_number(input, "nb_tokens_prompt"))
}

fn nb_tokens_completion(input: &MetricInput) -> Fallible<MetricOutcome> {
    Ok(metadata_number(input, "nb_tokens_completion"))
}

fn nb_tool_calls(input: &MetricInput) -> Fallible<MetricOutcome> {
    Ok(metadata_number(input, "nb_tool_calls"))
}

fn generation_time(input: &MetricInput) -> Fallible<MetricOutcome> {
    Ok(metadata_number(input, "generation_time"))
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn judge_exactness(input: &MetricInput) -> Fallible<MetricOutcome> {
    let truth = input
        .row_text("output_true")
        .ok_or_else(|| anyhow!("row has no output_true"))?;
    let exact = normalize(input.output) == normalize(&truth);
    Ok(MetricOutcome::score(exact as i64 as f64))
}

fn output_length(input: &MetricInput) -> Fallible<MetricOutcome> {
    Ok(MetricOutcome::score(
        input.output.split_whitespace().count() as f64,
    ))
}

fn qa_f1(input: &MetricInput) -> Fallible<MetricOutcome> {
    let truth = input
        .row_text("output_true")
        .ok_or_else(|| anyhow!("row has no output_true"))?;

    let predicted: HashSet<String> = normalize(input.output)
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let expected: HashSet<String> = normalize(&truth)
        .split_whitespace()
        .map(str::to_string)
        .collect();

    if predicted.is_empty() || expected.is_empty() {
        return Ok(MetricOutcome::score(0.0));
    }

    let overlap = predicted.intersection(&expected).count() as f64;
    if overlap == 0.0 {
        return Ok(MetricOutcome::score(0.0));
    }

    let precision = overlap / predicted.len() as f64;
    let recall = overlap / expected.len() as f64;
    Ok(MetricOutcome::score(
        2.0 * precision * recall / (precision + recall),
    ))
}

/// The ops family scores straight out of the answer metadata bag; a missing
/// key is a null score, not an error.
fn metadata_number(input: &MetricInput, key: &str) -> MetricOutcome {
    match input.metadata.get(key).and_then(|v| v.as_f64()) {
        Some(value) => MetricOutcome::score(value),
        None => MetricOutcome::empty(),
    }
}

//! Sampling evaluation suite.
//!
//! Runs a ready handle over prompts of several lengths, records latency and
//! throughput per case and produces a JSON report that can be diffed
//! against a baseline run.

use crate::metrics::{unix_ms, Metric};
use crate::session::ModelHandle;
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Instant;
use tpforge_llm::SamplingParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingEvalCase {
    pub name: String,
    pub prompt_len: usize,
    pub max_length: usize,
}

impl SamplingEvalCase {
    pub fn new(name: impl Into<String>, prompt_len: usize, max_length: usize) -> Self {
        Self {
            name: name.into(),
            prompt_len,
            max_length,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingEvalResult {
    pub case: String,
    pub prompt_len: usize,
    pub tokens_generated: usize,
    pub latency_ms: f64,
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub tokens_per_sec: f64,
    pub padded_positions: usize,
    pub prefix_preserved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub tp_degree: usize,
    pub precision: String,
    pub generated_at_unix_ms: u64,
    pub cases: Vec<SamplingEvalResult>,
}

impl EvaluationReport {
    pub fn as_map(&self) -> BTreeMap<&str, &SamplingEvalResult> {
        self.cases
            .iter()
            .map(|case| (case.case.as_str(), case))
            .collect()
    }

    pub fn diff<'a>(
        &'a self,
        baseline: &'a EvaluationReport,
    ) -> BTreeMap<&'a str, EvaluationDelta<'a>> {
        let previous = baseline.as_map();
        self.as_map()
            .into_iter()
            .filter_map(|(case, result)| {
                previous.get(case).map(|&base| {
                    (
                        case,
                        EvaluationDelta {
                            current: result,
                            baseline: base,
                            latency_ms_delta: result.latency_ms - base.latency_ms,
                            tokens_per_sec_delta: result.tokens_per_sec - base.tokens_per_sec,
                        },
                    )
                })
            })
            .collect()
    }

    /// The report as entries for a results file.
    pub fn metrics(&self) -> Vec<Metric> {
        self.cases
            .iter()
            .flat_map(|case| {
                let data = json!({
                    "case": case.case,
                    "prompt_len": case.prompt_len,
                    "tp_degree": self.tp_degree,
                    "amp": self.precision,
                });
                [
                    Metric::new(format!("{}_latency", case.case), case.latency_ms, "ms")
                        .with_additional_data(data.clone()),
                    Metric::new(
                        format!("{}_throughput", case.case),
                        case.tokens_per_sec,
                        "tokens/s",
                    )
                    .with_additional_data(data),
                ]
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct EvaluationDelta<'a> {
    pub current: &'a SamplingEvalResult,
    pub baseline: &'a SamplingEvalResult,
    pub latency_ms_delta: f64,
    pub tokens_per_sec_delta: f64,
}

pub struct EvaluationSuite {
    cases: Vec<SamplingEvalCase>,
    params: SamplingParams,
}

impl EvaluationSuite {
    pub fn new(cases: Vec<SamplingEvalCase>, params: SamplingParams) -> Self {
        Self { cases, params }
    }

    /// Short, half-bucket and near-full prompts against the largest bucket.
    pub fn bucket_sweep(largest_bucket: usize) -> Self {
        let cases = vec![
            SamplingEvalCase::new("short_prompt", 4.min(largest_bucket), largest_bucket),
            SamplingEvalCase::new("half_bucket", (largest_bucket / 2).max(1), largest_bucket),
            SamplingEvalCase::new(
                "near_full",
                (largest_bucket - largest_bucket / 8).max(1),
                largest_bucket,
            ),
        ];
        Self::new(cases, SamplingParams::new(largest_bucket, 10).with_seed(17))
    }

    pub fn cases(&self) -> &[SamplingEvalCase] {
        &self.cases
    }

    pub fn run(&self, handle: &mut ModelHandle) -> Result<EvaluationReport> {
        handle.compile()?;
        let vocab = handle.model().vocab_size;
        let batch = handle.options().batch_size;
        let mut results = Vec::with_capacity(self.cases.len());

        for case in &self.cases {
            ensure!(case.prompt_len > 0, "case {} has an empty prompt", case.name);
            let prompts: Vec<Vec<usize>> = (0..batch)
                .map(|row| deterministic_prompt(case.prompt_len, vocab, row))
                .collect();
            let params = SamplingParams {
                max_length: case.max_length,
                ..self.params.clone()
            };

            let start = Instant::now();
            let generation = handle.sample(&prompts, &params)?;
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

            let prefix_preserved = prompts
                .iter()
                .zip(&generation.sequences)
                .all(|(prompt, sequence)| sequence.starts_with(prompt));
            let m = &generation.metrics;
            results.push(SamplingEvalResult {
                case: case.name.clone(),
                prompt_len: case.prompt_len,
                tokens_generated: m.tokens_generated,
                latency_ms,
                prefill_ms: m.prefill_ms,
                decode_ms: m.decode_ms,
                tokens_per_sec: m.tokens_per_sec,
                padded_positions: m.padded_positions,
                prefix_preserved,
            });
        }

        Ok(EvaluationReport {
            tp_degree: handle.options().tp_degree,
            precision: handle.options().precision.to_string(),
            generated_at_unix_ms: unix_ms(),
            cases: results,
        })
    }
}

/// Token ids spread over the vocabulary, different per batch row.
pub fn deterministic_prompt(len: usize, vocab_size: usize, row: usize) -> Vec<usize> {
    (0..len)
        .map(|i| (i * 1313 + row * 7331 + 7) % vocab_size.max(1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(case: &str, latency_ms: f64, tokens_per_sec: f64) -> SamplingEvalResult {
        SamplingEvalResult {
            case: case.to_string(),
            prompt_len: 4,
            tokens_generated: 4,
            latency_ms,
            prefill_ms: 0.0,
            decode_ms: latency_ms,
            tokens_per_sec,
            padded_positions: 0,
            prefix_preserved: true,
        }
    }

    fn report(cases: Vec<SamplingEvalResult>) -> EvaluationReport {
        EvaluationReport {
            tp_degree: 2,
            precision: "bf16".to_string(),
            generated_at_unix_ms: 0,
            cases,
        }
    }

    #[test]
    fn diff_matches_cases_by_name() {
        let current = report(vec![result("a", 10.0, 50.0), result("b", 5.0, 80.0)]);
        let baseline = report(vec![result("a", 12.0, 40.0), result("c", 1.0, 1.0)]);
        let deltas = current.diff(&baseline);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas["a"].latency_ms_delta, -2.0);
        assert_eq!(deltas["a"].tokens_per_sec_delta, 10.0);
    }

    #[test]
    fn report_flattens_into_metrics() {
        let metrics = report(vec![result("a", 10.0, 50.0)]).metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "a_latency");
        assert_eq!(metrics[1].units, "tokens/s");
        assert_eq!(metrics[1].additional_data["amp"], "bf16");
    }

    #[test]
    fn sweep_stays_inside_the_bucket() {
        let suite = EvaluationSuite::bucket_sweep(64);
        for case in suite.cases() {
            assert!(case.prompt_len >= 1 && case.prompt_len <= case.max_length);
        }
        assert_eq!(suite.cases()[2].prompt_len, 56);
        let prompt = deterministic_prompt(10, 256, 1);
        assert!(prompt.iter().all(|&t| t < 256));
        assert_ne!(prompt, deterministic_prompt(10, 256, 0));
    }
}

//! Scoring of batch completions against the gold ledger.

use super::batch::custom_id;
use super::dataset::{AnswerLetter, CanonicalItem};
use super::run::RunDir;
use crate::error::{EvalError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;
use tracing::{debug, info};

/// A standalone uppercase choice letter.
static ANSWER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([ABCD])\b").expect("answer token pattern is valid"));

/// Pull a choice letter out of free-form completion text.
///
/// The text is trimmed and uppercased first. A whole-token `A`..`D`
/// anywhere in it wins; otherwise its first character is used if it is a
/// letter.
pub fn extract_answer(text: &str) -> Option<AnswerLetter> {
    let text = text.trim().to_uppercase();
    if let Some(caps) = ANSWER_TOKEN.captures(&text) {
        return caps[1].chars().next().and_then(AnswerLetter::from_char);
    }
    text.chars().next().and_then(AnswerLetter::from_char)
}

/// Accuracy over the gold set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
}

/// Scoring result plus counts that explain the misses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreReport {
    pub result: ScoringResult,
    /// Gold items with no completion.
    pub missing: usize,
    /// Completions with no extractable letter.
    pub unparsed: usize,
}

/// Extracted letters keyed by custom id; `None` marks a completion with no
/// letter.
///
/// Lines that are not JSON, or that lack a custom id or a response body,
/// are skipped. A later line for the same id replaces an earlier one only
/// if it yields a letter.
pub fn parse_completions(content: &str) -> HashMap<String, Option<AnswerLetter>> {
    let mut completions = HashMap::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: Value = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                debug!(line = line_no + 1, error = %e, "Skipping malformed completion line");
                continue;
            }
        };

        let Some(id) = record.get("custom_id").and_then(Value::as_str) else {
            debug!(line = line_no + 1, "Skipping completion without custom_id");
            continue;
        };
        let Some(body) = record.get("response").and_then(|r| r.get("body")) else {
            debug!(line = line_no + 1, custom_id = id, "Skipping completion without body");
            continue;
        };

        let letter = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .and_then(extract_answer);
        match completions.entry(id.to_string()) {
            Entry::Occupied(mut slot) => {
                if letter.is_some() {
                    slot.insert(letter);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(letter);
            }
        }
    }

    completions
}

/// Score completions against every gold item.
///
/// Each gold item counts once toward `total`; a missing or unparseable
/// completion counts as wrong.
pub fn score(
    gold: &[CanonicalItem],
    completions: &HashMap<String, Option<AnswerLetter>>,
) -> ScoreReport {
    let mut correct = 0;
    let mut missing = 0;
    let mut unparsed = 0;

    for item in gold {
        let predicted = match completions.get(&custom_id(item.idx)) {
            Some(letter) => {
                if letter.is_none() {
                    unparsed += 1;
                }
                *letter
            }
            None => {
                missing += 1;
                None
            }
        };
        if predicted == Some(item.answer) {
            correct += 1;
        }
    }

    let total = gold.len();
    let accuracy = if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    };

    ScoreReport {
        result: ScoringResult {
            accuracy,
            correct,
            total,
        },
        missing,
        unparsed,
    }
}

/// Score a run directory and write its metrics report.
pub fn score_run(run: &RunDir) -> Result<ScoreReport> {
    let gold = run.read_gold()?;

    let output_path = run.output_path();
    if !output_path.is_file() {
        return Err(EvalError::missing(
            "Batch output (check that the batch completed and was fetched)",
            output_path,
        ));
    }
    let content = fs::read_to_string(&output_path).map_err(|e| EvalError::io(&output_path, e))?;

    let report = score(&gold, &parse_completions(&content));
    info!(
        correct = report.result.correct,
        total = report.result.total,
        missing = report.missing,
        unparsed = report.unparsed,
        "Scored run"
    );

    let metrics_path = run.metrics_path();
    let json = serde_json::to_string_pretty(&report.result)
        .map_err(|e| EvalError::Serialization(e.to_string()))?;
    fs::write(&metrics_path, json).map_err(|e| EvalError::io(&metrics_path, e))?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use tempfile::TempDir;

    fn gold(idx: usize, answer: AnswerLetter) -> CanonicalItem {
        CanonicalItem {
            idx,
            answer,
            question: format!("q{}", idx),
            choices: ["a", "b", "c", "d"].map(String::from),
            meta: Map::new(),
        }
    }

    fn completion_line(id: &str, content: &str) -> String {
        json!({
            "custom_id": id,
            "response": {"status_code": 200, "body": {"choices": [{"message": {"content": content}}]}}
        })
        .to_string()
    }

    #[test]
    fn test_extract_standalone_token() {
        assert_eq!(extract_answer("A) because ..."), Some(AnswerLetter::A));
        assert_eq!(extract_answer("The answer is C."), Some(AnswerLetter::C));
        assert_eq!(extract_answer("정답은 D 입니다"), Some(AnswerLetter::D));
        assert_eq!(extract_answer("  B\n"), Some(AnswerLetter::B));
    }

    #[test]
    fn test_extract_lowercase_token() {
        assert_eq!(extract_answer("Answer: c"), Some(AnswerLetter::C));
        assert_eq!(extract_answer("the answer is (b)"), Some(AnswerLetter::B));
    }

    #[test]
    fn test_extract_falls_back_to_first_char() {
        assert_eq!(extract_answer(" b"), Some(AnswerLetter::B));
        assert_eq!(extract_answer("d."), Some(AnswerLetter::D));
    }

    #[test]
    fn test_extract_no_answer() {
        assert_eq!(extract_answer(""), None);
        assert_eq!(extract_answer("모르겠습니다"), None);
        assert_eq!(extract_answer("E"), None);
    }

    #[test]
    fn test_missing_completion_counts_as_wrong() {
        let gold = vec![gold(0, AnswerLetter::A), gold(1, AnswerLetter::B)];
        let completions = parse_completions(&completion_line("kmmlu-0", "A) ..."));

        let report = score(&gold, &completions);
        assert_eq!(
            report.result,
            ScoringResult {
                accuracy: 0.5,
                correct: 1,
                total: 2
            }
        );
        assert_eq!(report.missing, 1);
        assert_eq!(report.unparsed, 0);
    }

    #[test]
    fn test_empty_gold_is_zero_accuracy() {
        let report = score(&[], &HashMap::new());
        assert_eq!(report.result.accuracy, 0.0);
        assert_eq!(report.result.total, 0);
    }

    #[test]
    fn test_unparseable_counts_as_wrong() {
        let gold = vec![gold(0, AnswerLetter::A)];
        let completions = parse_completions(&completion_line("kmmlu-0", "잘 모르겠다"));
        let report = score(&gold, &completions);
        assert_eq!(report.result.correct, 0);
        assert_eq!(report.result.total, 1);
        assert_eq!(report.unparsed, 1);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let content = [
            "not json".to_string(),
            r#"{"response": {"body": {}}}"#.to_string(),
            r#"{"custom_id": "kmmlu-5", "response": null}"#.to_string(),
            String::new(),
            completion_line("kmmlu-2", "C"),
            r#"{"custom_id": "kmmlu-3", "response": {"body": {"choices": []}}}"#.to_string(),
        ]
        .join("\n");

        let completions = parse_completions(&content);
        assert_eq!(completions.len(), 2);
        assert_eq!(completions["kmmlu-2"], Some(AnswerLetter::C));
        assert_eq!(completions["kmmlu-3"], None);
    }

    #[test]
    fn test_later_empty_completion_keeps_letter() {
        let content = [
            completion_line("kmmlu-0", "A"),
            completion_line("kmmlu-0", ""),
            completion_line("kmmlu-1", "?"),
            completion_line("kmmlu-1", "D"),
        ]
        .join("\n");

        let completions = parse_completions(&content);
        assert_eq!(completions["kmmlu-0"], Some(AnswerLetter::A));
        assert_eq!(completions["kmmlu-1"], Some(AnswerLetter::D));

        let report = score(&[gold(0, AnswerLetter::A)], &completions);
        assert_eq!(report.result.correct, 1);
        assert_eq!(report.result.total, 1);
    }

    #[test]
    fn test_out_of_order_completions() {
        let gold = vec![
            gold(0, AnswerLetter::A),
            gold(1, AnswerLetter::B),
            gold(2, AnswerLetter::C),
        ];
        let content = [
            completion_line("kmmlu-2", "C"),
            completion_line("kmmlu-0", "A"),
            completion_line("kmmlu-1", "D"),
        ]
        .join("\n");

        let report = score(&gold, &parse_completions(&content));
        assert_eq!(report.result.correct, 2);
        assert_eq!(report.result.total, 3);
    }

    #[test]
    fn test_score_run_writes_metrics_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::open(dir.path());
        run.write_batch_input(&[gold(0, AnswerLetter::A), gold(1, AnswerLetter::B)], &[])
            .unwrap();
        fs::write(run.output_path(), completion_line("kmmlu-0", "A) ...")).unwrap();

        let first = score_run(&run).unwrap();
        let second = score_run(&run).unwrap();
        assert_eq!(first, second);

        let written: Value =
            serde_json::from_str(&fs::read_to_string(run.metrics_path()).unwrap()).unwrap();
        assert_eq!(written, json!({"accuracy": 0.5, "correct": 1, "total": 2}));
    }

    #[test]
    fn test_score_run_requires_artifacts() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::open(dir.path());
        assert!(matches!(score_run(&run), Err(EvalError::MissingArtifact { .. })));

        run.write_batch_input(&[gold(0, AnswerLetter::A)], &[]).unwrap();
        let err = score_run(&run).unwrap_err();
        assert!(err.to_string().contains("batch_output.jsonl"));
    }
}

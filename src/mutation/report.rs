use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::MutantId;

use super::scheduler::{ErrorCause, MutationResult, Outcome};
use super::state::{MutantState, MutationStatus, RunSnapshot};

/// Two-sided z value for 95% confidence.
const Z_95: f64 = 1.959963984540054;

/// Error groups keep at most this many example mutants.
const MAX_ERROR_EXAMPLES: usize = 3;

/// Supported output formats for run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Markdown summary.
    Markdown,
    /// JSON summary with all mutants inline.
    Json,
    /// JUnit XML format for CI systems.
    Junit,
}

/// Outcome counts for one operator or endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperatorBreakdown {
    /// Killed mutants.
    pub killed: usize,
    /// Survived mutants.
    pub survived: usize,
    /// Errored mutants.
    pub errored: usize,
}

impl OperatorBreakdown {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Killed => self.killed += 1,
            Outcome::Survived => self.survived += 1,
            Outcome::Errored { .. } => self.errored += 1,
        }
    }

    /// Killed over killed plus survived, `None` when nothing was judged.
    pub fn score(&self) -> Option<f64> {
        score(self.killed, self.survived)
    }
}

/// Wilson score interval around the mutation score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    /// Lower bound in `[0, 1]`.
    pub lower: f64,
    /// Upper bound in `[0, 1]`.
    pub upper: f64,
    /// Confidence level, e.g. `0.95`.
    pub confidence: f64,
}

impl ConfidenceInterval {
    /// 95% Wilson interval for `killed` successes out of `killed + survived`.
    pub fn wilson(killed: usize, survived: usize) -> Option<Self> {
        let n = (killed + survived) as f64;
        if n == 0.0 {
            return None;
        }
        let p = killed as f64 / n;
        let z2 = Z_95 * Z_95;
        let denom = 1.0 + z2 / n;
        let center = (p + z2 / (2.0 * n)) / denom;
        let margin = Z_95 * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denom;
        Some(Self {
            lower: (center - margin).max(0.0),
            upper: (center + margin).min(1.0),
            confidence: 0.95,
        })
    }
}

/// Errored mutants sharing a cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorGroup {
    /// Shared cause.
    pub cause: ErrorCause,
    /// Number of mutants.
    pub count: usize,
    /// A few mutant labels with their diagnostics.
    pub examples: Vec<String>,
}

/// Aggregate view of a set of mutation results.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationReport {
    /// Finished results considered: killed plus survived plus errored.
    pub total: usize,
    /// Killed mutants.
    pub killed: usize,
    /// Survived mutants.
    pub survived: usize,
    /// Errored mutants, excluded from the score.
    pub errored: usize,
    /// Killed over killed plus survived, `null` when nothing was judged.
    pub score: Option<f64>,
    /// Wilson interval around `score`.
    pub confidence_interval: Option<ConfidenceInterval>,
    /// Counts per operator kind.
    pub by_operator: BTreeMap<String, OperatorBreakdown>,
    /// Counts per endpoint.
    pub by_endpoint: BTreeMap<String, OperatorBreakdown>,
    /// Errored mutants grouped by cause.
    pub errors: Vec<ErrorGroup>,
    /// Endpoints the suite never called while any of their mutants was armed.
    #[serde(default)]
    pub uncalled_endpoints: Vec<String>,
}

fn score(killed: usize, survived: usize) -> Option<f64> {
    let judged = killed + survived;
    (judged > 0).then(|| killed as f64 / judged as f64)
}

/// Aggregate `results` into a report. Pure, so repeated calls agree.
pub fn summarize(results: &[MutationResult]) -> MutationReport {
    let mut totals = OperatorBreakdown::default();
    let mut by_operator: BTreeMap<String, OperatorBreakdown> = BTreeMap::new();
    let mut by_endpoint: BTreeMap<String, OperatorBreakdown> = BTreeMap::new();
    let mut errors: BTreeMap<ErrorCause, ErrorGroup> = BTreeMap::new();
    // Per endpoint: whether any result was judged, and whether any call matched.
    let mut reach: BTreeMap<String, (bool, bool)> = BTreeMap::new();

    for result in results {
        totals.record(result.outcome);
        by_operator
            .entry(result.operator.as_str().to_string())
            .or_default()
            .record(result.outcome);
        by_endpoint
            .entry(result.endpoint.to_string())
            .or_default()
            .record(result.outcome);

        let seen = reach.entry(result.endpoint.to_string()).or_default();
        seen.0 |= !matches!(result.outcome, Outcome::Errored { .. });
        seen.1 |= result.matched_calls > 0;

        if let Outcome::Errored { cause } = result.outcome {
            let group = errors.entry(cause).or_insert_with(|| ErrorGroup {
                cause,
                count: 0,
                examples: Vec::new(),
            });
            group.count += 1;
            if group.examples.len() < MAX_ERROR_EXAMPLES {
                group.examples.push(match &result.diagnostic {
                    Some(diagnostic) => format!("{}: {diagnostic}", result.label),
                    None => result.label.clone(),
                });
            }
        }
    }

    MutationReport {
        total: results.len(),
        killed: totals.killed,
        survived: totals.survived,
        errored: totals.errored,
        score: totals.score(),
        confidence_interval: ConfidenceInterval::wilson(totals.killed, totals.survived),
        by_operator,
        by_endpoint,
        errors: errors.into_values().collect(),
        uncalled_endpoints: reach
            .into_iter()
            .filter(|(_, (judged, called))| *judged && !called)
            .map(|(endpoint, _)| endpoint)
            .collect(),
    }
}

/// Per-mutant entry in the JSON report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct MutantEntry<'a> {
    id: MutantId,
    label: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<ErrorCause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostic: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    matched_calls: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_artifact_path: Option<&'a str>,
}

impl<'a> From<&'a MutantState> for MutantEntry<'a> {
    fn from(state: &'a MutantState) -> Self {
        let result = state.result.as_ref();
        Self {
            id: state.mutant.id,
            label: state.mutant.label(),
            status: state.status.as_str(),
            cause: result.and_then(|r| match r.outcome {
                Outcome::Errored { cause } => Some(cause),
                _ => None,
            }),
            diagnostic: result.and_then(|r| r.diagnostic.as_deref()),
            matched_calls: result.map(|r| r.matched_calls),
            duration_ms: result.map(|r| r.duration_ms),
            log_artifact_path: state.log_artifact_path.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport<'a> {
    run_id: &'a str,
    completed: bool,
    interrupted: bool,
    incomplete: usize,
    malformed_lines: usize,
    discovered: usize,
    #[serde(flatten)]
    summary: &'a MutationReport,
    mutants: Vec<MutantEntry<'a>>,
}

/// Render run report in requested format.
pub fn render_report(snapshot: &RunSnapshot, format: ReportFormat) -> String {
    let summary = summarize(&snapshot.results());
    let incomplete =
        snapshot.count(MutationStatus::Pending) + snapshot.count(MutationStatus::Running);

    match format {
        ReportFormat::Json => serde_json::to_string_pretty(&RunReport {
            run_id: &snapshot.run_id,
            completed: snapshot.completed,
            interrupted: snapshot.interrupted,
            incomplete,
            malformed_lines: snapshot.malformed_lines,
            discovered: snapshot.mutants.len(),
            summary: &summary,
            mutants: snapshot.mutants.values().map(MutantEntry::from).collect(),
        })
        .expect("report JSON should serialize"),
        ReportFormat::Markdown => render_markdown(snapshot, &summary, incomplete),
        ReportFormat::Junit => render_junit_report(snapshot),
    }
}

fn percent(score: Option<f64>) -> String {
    score
        .map(|s| format!("{:.2}%", s * 100.0))
        .unwrap_or_else(|| "N/A".to_string())
}

fn breakdown_table(
    out: &mut String,
    heading: &str,
    column: &str,
    rows: &BTreeMap<String, OperatorBreakdown>,
) {
    if rows.is_empty() {
        return;
    }
    out.push_str(&format!("\n## {heading}\n\n"));
    out.push_str(&format!(
        "| {column} | killed | survived | errored | score |\n|---|---:|---:|---:|---:|\n"
    ));
    for (name, counts) in rows {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            name,
            counts.killed,
            counts.survived,
            counts.errored,
            percent(counts.score())
        ));
    }
}

fn render_markdown(snapshot: &RunSnapshot, summary: &MutationReport, incomplete: usize) -> String {
    let mut out = format!("# Mutation Run {}\n\n", snapshot.run_id);

    out.push_str(&format!(
        "- completed: {}\n- interrupted: {}\n- malformed lines: {}\n",
        snapshot.completed, snapshot.interrupted, snapshot.malformed_lines
    ));
    if let Some(config) = &snapshot.info.config {
        out.push_str(&format!("- schema: {}\n", config.schema_path));
        if let Some(filter) = &config.filter {
            out.push_str(&format!("- filter: {filter}\n"));
        }
    }

    out.push_str("\n## Summary\n\n| metric | count |\n|---|---:|\n");
    out.push_str(&format!("| discovered | {} |\n", snapshot.mutants.len()));
    out.push_str(&format!("| total | {} |\n", summary.total));
    out.push_str(&format!("| killed | {} |\n", summary.killed));
    out.push_str(&format!("| survived | {} |\n", summary.survived));
    out.push_str(&format!("| errored | {} |\n", summary.errored));
    out.push_str(&format!("| incomplete | {incomplete} |\n"));
    let interval = summary
        .confidence_interval
        .map(|ci| {
            format!(
                " (95% CI {:.2}% to {:.2}%)",
                ci.lower * 100.0,
                ci.upper * 100.0
            )
        })
        .unwrap_or_default();
    out.push_str(&format!(
        "| mutation score | {}{} |\n",
        percent(summary.score),
        interval
    ));

    breakdown_table(&mut out, "By Operator", "operator", &summary.by_operator);
    breakdown_table(&mut out, "By Endpoint", "endpoint", &summary.by_endpoint);

    if !summary.errors.is_empty() {
        out.push_str("\n## Errors\n\n");
        for group in &summary.errors {
            out.push_str(&format!("- **{}**: {}\n", group.cause.as_str(), group.count));
            for example in &group.examples {
                out.push_str(&format!("  - {example}\n"));
            }
        }
    }

    if !summary.uncalled_endpoints.is_empty() {
        out.push_str("\n## Uncalled Endpoints\n\n");
        out.push_str("No test call reached these endpoints; their mutants cannot be killed.\n\n");
        for endpoint in &summary.uncalled_endpoints {
            out.push_str(&format!("- `{endpoint}`\n"));
        }
    }

    let survivors: Vec<&MutationResult> = snapshot
        .mutants
        .values()
        .filter_map(|m| m.result.as_ref())
        .filter(|r| r.outcome == Outcome::Survived)
        .collect();
    if !survivors.is_empty() {
        out.push_str("\n## Surviving Mutants\n\n");
        for result in survivors {
            out.push_str(&format!("- `{}` {}", result.mutant_id, result.label));
            if let Some(diagnostic) = &result.diagnostic {
                out.push_str(&format!(" ({diagnostic})"));
            }
            out.push('\n');
        }
    }

    out
}

fn render_junit_report(snapshot: &RunSnapshot) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<testsuites>\n");
    out.push_str(&format!(
        "  <testsuite name=\"mutation-{}\" tests=\"{}\">\n",
        xml_escape(&snapshot.run_id),
        snapshot.mutants.len()
    ));

    for state in snapshot.mutants.values() {
        let classname = xml_escape(&state.mutant.endpoint.to_string());
        let name = xml_escape(&state.mutant.label());
        let diagnostic = state
            .result
            .as_ref()
            .and_then(|r| r.diagnostic.as_deref())
            .unwrap_or("");

        match state.status {
            MutationStatus::Killed => {
                out.push_str(&format!(
                    "    <testcase classname=\"{classname}\" name=\"{name}\"/>\n"
                ));
            }
            MutationStatus::Survived => {
                out.push_str(&format!(
                    "    <testcase classname=\"{classname}\" name=\"{name}\">\n"
                ));
                out.push_str(&format!(
                    "      <failure message=\"Mutant survived\">{}</failure>\n",
                    xml_escape(diagnostic)
                ));
                out.push_str("    </testcase>\n");
            }
            MutationStatus::Errored => {
                let cause = state
                    .result
                    .as_ref()
                    .and_then(|r| match r.outcome {
                        Outcome::Errored { cause } => Some(cause.as_str()),
                        _ => None,
                    })
                    .unwrap_or("error");
                out.push_str(&format!(
                    "    <testcase classname=\"{classname}\" name=\"{name}\">\n"
                ));
                out.push_str(&format!(
                    "      <error message=\"{}\">{}</error>\n",
                    cause,
                    xml_escape(diagnostic)
                ));
                out.push_str("    </testcase>\n");
            }
            MutationStatus::Pending | MutationStatus::Running => {
                out.push_str(&format!(
                    "    <testcase classname=\"{classname}\" name=\"{name}\">\n"
                ));
                out.push_str(&format!(
                    "      <skipped message=\"{}\"/>\n",
                    state.status.as_str()
                ));
                out.push_str("    </testcase>\n");
            }
        }
    }

    out.push_str("  </testsuite>\n");
    out.push_str("</testsuites>\n");
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

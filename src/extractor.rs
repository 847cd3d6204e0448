//! Log scraping state machine.
//!
//! Streams a simulator log line by line. A run-start match opens a run keyed
//! by its captured integer fields; metric matches fill in that run; once the
//! required metrics are present the run is closed into a `Record`. A new
//! run-start before completion drops the open run, as does end of input.

use crate::config::{MalformedPolicy, MetricKind, Profile};
use crate::dataset::{Dataset, MetricSet, Record, RunKey, Value};
use crate::derive::{Derivation, DerivedField};
use regex::{Captures, Regex};
use std::io::{BufRead, BufReader};
use std::path::Path;

pub struct LogStatExtractor {
    profile: String,
    run_start: Regex,
    key_fields: Vec<String>,
    metrics: Vec<CompiledMetric>,
    required: Vec<String>,
    derived: Vec<DerivedField>,
    policy: MalformedPolicy,
}

struct CompiledMetric {
    name: String,
    kind: MetricKind,
    pattern: Regex,
    group: CaptureGroup,
}

enum CaptureGroup {
    Named(String),
    First,
}

impl CompiledMetric {
    fn capture<'h>(&self, caps: &Captures<'h>) -> Option<&'h str> {
        let m = match &self.group {
            CaptureGroup::Named(name) => caps.name(name),
            CaptureGroup::First => caps.get(1),
        };
        m.map(|m| m.as_str())
    }

    fn parse(&self, text: &str, line: usize) -> Result<Value, ExtractError> {
        let malformed = || ExtractError::MalformedInput {
            line,
            field: self.name.clone(),
            text: text.to_string(),
        };
        match self.kind {
            MetricKind::Int => text.trim().parse::<i64>().map(Value::Int).map_err(|_| malformed()),
            MetricKind::Float => text
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| malformed()),
        }
    }
}

#[derive(Debug, Default)]
enum RunState {
    #[default]
    Idle,
    Open {
        key: RunKey,
        metrics: MetricSet,
        started_at: usize,
    },
}

impl LogStatExtractor {
    /// Compile a profile's patterns and check that every field it refers to exists.
    pub fn new(profile: &Profile, policy: MalformedPolicy) -> Result<Self, ExtractError> {
        let invalid = |reason: String| ExtractError::InvalidProfile {
            profile: profile.name.clone(),
            reason,
        };
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ExtractError::InvalidPattern {
                profile: profile.name.clone(),
                pattern: pattern.to_string(),
                source: e,
            })
        };

        let run_start = compile(&profile.run_start)?;
        let key_fields: Vec<String> = run_start
            .capture_names()
            .flatten()
            .map(str::to_string)
            .collect();
        if key_fields.is_empty() {
            return Err(invalid(
                "run_start pattern has no named capture group".to_string(),
            ));
        }
        if profile.metrics.is_empty() {
            return Err(invalid("no metrics declared".to_string()));
        }

        let mut known: Vec<String> = key_fields.clone();
        let mut metrics = Vec::with_capacity(profile.metrics.len());
        for spec in &profile.metrics {
            if known.contains(&spec.name) {
                return Err(invalid(format!("field '{}' declared twice", spec.name)));
            }
            let pattern = compile(&spec.pattern)?;
            let group = if pattern.capture_names().flatten().any(|n| n == spec.name) {
                CaptureGroup::Named(spec.name.clone())
            } else if pattern.captures_len() > 1 {
                CaptureGroup::First
            } else {
                return Err(invalid(format!(
                    "metric '{}' pattern has no capture group",
                    spec.name
                )));
            };
            known.push(spec.name.clone());
            metrics.push(CompiledMetric {
                name: spec.name.clone(),
                kind: spec.kind,
                pattern,
                group,
            });
        }

        let required: Vec<String> = profile
            .required_metrics()
            .into_iter()
            .map(str::to_string)
            .collect();
        if required.is_empty() {
            return Err(invalid("required metric list is empty".to_string()));
        }
        if let Some(unknown) = required
            .iter()
            .find(|r| !metrics.iter().any(|m| &m.name == *r))
        {
            return Err(invalid(format!(
                "required metric '{unknown}' is not declared"
            )));
        }

        for rule in &profile.derived {
            if let Some(missing) = rule.inputs().into_iter().find(|i| !known.iter().any(|k| k == *i))
            {
                return Err(invalid(format!(
                    "derived field '{}' reads unknown field '{missing}'",
                    rule.name()
                )));
            }
            if let DerivedField::Product { divisor, .. } = rule {
                if *divisor <= 0 {
                    return Err(invalid(format!(
                        "derived field '{}' has non-positive divisor {divisor}",
                        rule.name()
                    )));
                }
            }
            if known.iter().any(|k| k == rule.name()) {
                return Err(invalid(format!("field '{}' declared twice", rule.name())));
            }
            known.push(rule.name().to_string());
        }

        Ok(Self {
            profile: profile.name.clone(),
            run_start,
            key_fields,
            metrics,
            required,
            derived: profile.derived.clone(),
            policy,
        })
    }

    pub fn profile_name(&self) -> &str {
        &self.profile
    }

    /// Key field names in capture order.
    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    /// Stream records as runs complete. `origin` names the input in diagnostics.
    pub fn scan<R: BufRead>(&self, reader: R, origin: &str) -> Scan<'_, R> {
        Scan {
            extractor: self,
            lines: reader.lines(),
            origin: origin.to_string(),
            line_no: 0,
            state: RunState::Idle,
            done: false,
        }
    }

    pub fn extract_reader<R: BufRead>(
        &self,
        reader: R,
        origin: &str,
    ) -> Result<Dataset, ExtractError> {
        let dataset: Dataset = self.scan(reader, origin).collect::<Result<_, _>>()?;
        tracing::info!(
            origin,
            profile = %self.profile,
            records = dataset.len(),
            "extracted runs"
        );
        Ok(dataset)
    }

    pub fn extract_path(&self, path: &Path) -> Result<Dataset, ExtractError> {
        let origin = path.display().to_string();
        let file = std::fs::File::open(path).map_err(|e| ExtractError::SourceUnavailable {
            origin: origin.clone(),
            source: e,
        })?;
        self.extract_reader(BufReader::new(file), &origin)
    }

    fn process_line(
        &self,
        state: &mut RunState,
        line: &str,
        line_no: usize,
    ) -> Result<Option<Record>, ExtractError> {
        if let Some(caps) = self.run_start.captures(line) {
            if let RunState::Open {
                key: dropped,
                started_at,
                ..
            } = std::mem::take(state)
            {
                tracing::debug!(
                    key = ?dropped,
                    started_at,
                    line = line_no,
                    "new run started before previous run completed, discarding it"
                );
            }
            // An unparseable key leaves the state idle until the next run start.
            let key = self.parse_key(&caps, line_no)?;
            *state = RunState::Open {
                key,
                metrics: MetricSet::new(),
                started_at: line_no,
            };
            return Ok(None);
        }

        let RunState::Open { metrics, .. } = state else {
            return Ok(None);
        };

        // Parse everything first so a malformed line leaves the run untouched.
        let mut matched = Vec::new();
        for metric in &self.metrics {
            let Some(caps) = metric.pattern.captures(line) else {
                continue;
            };
            let text = metric.capture(&caps).unwrap_or("");
            matched.push((metric.name.as_str(), metric.parse(text, line_no)?));
        }
        if matched.is_empty() {
            return Ok(None);
        }
        for (name, value) in matched {
            metrics.insert(name, value);
        }

        if !self.required.iter().all(|r| metrics.contains(r)) {
            return Ok(None);
        }
        match std::mem::take(state) {
            RunState::Open { key, metrics, .. } => Ok(self.close_run(key, metrics)),
            RunState::Idle => Ok(None),
        }
    }

    fn parse_key(&self, caps: &Captures<'_>, line_no: usize) -> Result<RunKey, ExtractError> {
        let mut key = RunKey::new();
        for field in &self.key_fields {
            let text = caps.name(field).map(|m| m.as_str()).unwrap_or("");
            let value = text
                .trim()
                .parse::<i64>()
                .map_err(|_| ExtractError::MalformedInput {
                    line: line_no,
                    field: field.clone(),
                    text: text.to_string(),
                })?;
            key.insert(field.as_str(), value);
        }
        Ok(key)
    }

    /// Build the output row: metrics in declaration order, then derived fields.
    /// Returns `None` when a derived field divides by zero.
    fn close_run(&self, key: RunKey, metrics: MetricSet) -> Option<Record> {
        let mut row: MetricSet = self
            .metrics
            .iter()
            .filter_map(|m| metrics.get(&m.name).map(|v| (m.name.as_str(), v)))
            .collect();

        for rule in &self.derived {
            let derivation = rule.evaluate(|f| key.get(f).map(Value::Int).or_else(|| row.get(f)));
            match derivation {
                Derivation::Value(v) => row.insert(rule.name(), v),
                Derivation::MissingInput(field) => {
                    tracing::debug!(derived = rule.name(), %field, "input not reported, field left out");
                }
                Derivation::ZeroDenominator => {
                    tracing::debug!(
                        key = ?key,
                        derived = rule.name(),
                        "zero denominator, run dropped"
                    );
                    return None;
                }
            }
        }
        Some(Record::new(key, row))
    }
}

/// Iterator over completed runs. Created by [`LogStatExtractor::scan`].
pub struct Scan<'a, R> {
    extractor: &'a LogStatExtractor,
    lines: std::io::Lines<R>,
    origin: String,
    line_no: usize,
    state: RunState,
    done: bool,
}

impl<R: BufRead> Iterator for Scan<'_, R> {
    type Item = Result<Record, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(ExtractError::SourceUnavailable {
                        origin: self.origin.clone(),
                        source: e,
                    }));
                }
                None => {
                    self.done = true;
                    if let RunState::Open { key, started_at, .. } = &self.state {
                        tracing::debug!(key = ?key, started_at, "input ended with run incomplete, discarding it");
                    }
                    return None;
                }
            };
            self.line_no += 1;

            match self
                .extractor
                .process_line(&mut self.state, &line, self.line_no)
            {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => {}
                Err(e) => match self.extractor.policy {
                    MalformedPolicy::Skip => {
                        tracing::warn!(origin = %self.origin, error = %e, "skipping line");
                    }
                    MalformedPolicy::Fail => {
                        self.done = true;
                        return Some(Err(e));
                    }
                },
            }
        }
        None
    }
}

#[derive(Debug)]
pub enum ExtractError {
    /// The log could not be opened or read.
    SourceUnavailable {
        origin: String,
        source: std::io::Error,
    },
    /// A captured value does not parse as its declared type.
    MalformedInput {
        line: usize,
        field: String,
        text: String,
    },
    InvalidPattern {
        profile: String,
        pattern: String,
        source: regex::Error,
    },
    InvalidProfile {
        profile: String,
        reason: String,
    },
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::SourceUnavailable { origin, source } => {
                write!(f, "cannot read {origin}: {source}")
            }
            ExtractError::MalformedInput { line, field, text } => {
                write!(f, "line {line}: cannot parse {field} from {text:?}")
            }
            ExtractError::InvalidPattern {
                profile,
                pattern,
                source,
            } => write!(f, "profile '{profile}': invalid pattern {pattern:?}: {source}"),
            ExtractError::InvalidProfile { profile, reason } => {
                write!(f, "profile '{profile}': {reason}")
            }
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExtractError::SourceUnavailable { source, .. } => Some(source),
            ExtractError::InvalidPattern { source, .. } => Some(source),
            ExtractError::MalformedInput { .. } | ExtractError::InvalidProfile { .. } => None,
        }
    }
}

#[cfg(test)]
impl LogStatExtractor {
    pub(crate) fn extract_str(&self, text: &str) -> Result<Dataset, ExtractError> {
        self.extract_reader(text.as_bytes(), "<test>")
    }
}

//! Chart-ready series from a dataset.
//!
//! This is the data half of a hit-rate/miss-rate plot: records are grouped by
//! a categorical field (one line per group), each group is reduced to `(x, y)`
//! points sorted by x, y is optionally rescaled (ratio to percent), and a
//! log2 x axis gets power-of-two ticks. Rendering is left to whatever
//! plotting tool consumes the JSON or CSV output.

use crate::config::ChartConfig;
use crate::dataset::Dataset;
use crate::export::{self, ExportError, Format};
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One plotted line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    /// `"<group field> = <value>"`, or `None` for an ungrouped chart.
    pub label: Option<String>,
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chart {
    pub x: String,
    pub y: String,
    pub log2_x: bool,
    /// Powers of two spanning the x range when `log2_x` is set, else empty.
    pub x_ticks: Vec<f64>,
    pub series: Vec<Series>,
}

impl Chart {
    pub fn point_count(&self) -> usize {
        self.series.iter().map(|s| s.points.len()).sum()
    }
}

pub fn build_chart(dataset: &Dataset, config: &ChartConfig) -> Result<Chart, SeriesError> {
    if !dataset.is_empty() {
        let fields = [Some(&config.x), Some(&config.y), config.group.as_ref()];
        for field in fields.into_iter().flatten() {
            if !dataset.has_column(field) {
                return Err(SeriesError::UnknownField {
                    field: field.clone(),
                    available: dataset.columns(),
                });
            }
        }
    }

    let groups: Vec<(Option<String>, Dataset)> = match &config.group {
        Some(group) => dataset
            .group_by(group)
            .into_iter()
            .map(|(value, ds)| (Some(format!("{group} = {value}")), ds))
            .collect(),
        None => vec![(None, dataset.clone())],
    };

    let mut series = Vec::with_capacity(groups.len());
    for (label, group) in groups {
        let mut points = Vec::with_capacity(group.len());
        for record in group.records() {
            let (Some(x), Some(y)) = (record.get(&config.x), record.get(&config.y)) else {
                continue;
            };
            let x = x.as_f64();
            if config.log2_x && x <= 0.0 {
                tracing::warn!(x, field = %config.x, "non-positive value on log2 axis, point skipped");
                continue;
            }
            points.push(Point {
                x,
                y: y.as_f64() * config.y_scale,
            });
        }
        if config.sort_x {
            points.sort_by(|a, b| a.x.total_cmp(&b.x));
        }
        series.push(Series { label, points });
    }

    let x_ticks = if config.log2_x {
        let xs = series.iter().flat_map(|s| s.points.iter().map(|p| p.x));
        let (min, max) = xs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| {
            (lo.min(x), hi.max(x))
        });
        pow2_ticks(min, max)
    } else {
        Vec::new()
    };

    Ok(Chart {
        x: config.x.clone(),
        y: config.y.clone(),
        log2_x: config.log2_x,
        x_ticks,
        series,
    })
}

/// Powers of two from `2^floor(log2(min))` up to and including `max`.
pub fn pow2_ticks(min: f64, max: f64) -> Vec<f64> {
    if !(min.is_finite() && max.is_finite()) || min <= 0.0 || min > max {
        return Vec::new();
    }
    // Below 2^-1022 powi underflows to zero and the doubling never ends.
    let exp = (min.log2().floor() as i32).max(f64::MIN_EXP - 1);
    let mut tick = 2f64.powi(exp);
    let mut ticks = Vec::new();
    while tick <= max {
        ticks.push(tick);
        tick *= 2.0;
    }
    ticks
}

pub fn write_chart(chart: &Chart, format: Format, out: &mut impl Write) -> Result<(), ExportError> {
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(&mut *out, chart)
                .map_err(|e| ExportError::Json { source: e })?;
            writeln!(out)?;
        }
        Format::Csv => {
            let mut writer = csv::Writer::from_writer(&mut *out);
            writer.write_record(["series", chart.x.as_str(), chart.y.as_str()])?;
            for s in &chart.series {
                let label = s.label.as_deref().unwrap_or("");
                for p in &s.points {
                    let (x, y) = (p.x.to_string(), p.y.to_string());
                    writer.write_record([label, x.as_str(), y.as_str()])?;
                }
            }
            writer.flush()?;
        }
        Format::Table => {
            for (i, s) in chart.series.iter().enumerate() {
                if i > 0 {
                    writeln!(out)?;
                }
                if let Some(label) = &s.label {
                    writeln!(out, "{label}")?;
                }
                let rows: Vec<Vec<String>> = s
                    .points
                    .iter()
                    .map(|p| vec![p.x.to_string(), p.y.to_string()])
                    .collect();
                export::write_table(&[chart.x.clone(), chart.y.clone()], &rows, out)?;
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
pub enum SeriesError {
    UnknownField {
        field: String,
        available: Vec<String>,
    },
}

impl std::fmt::Display for SeriesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeriesError::UnknownField { field, available } => write!(
                f,
                "field '{field}' not in dataset (columns: {})",
                available.join(", ")
            ),
        }
    }
}

impl std::error::Error for SeriesError {}

use crate::dataset::Filter;
use crate::derive::DerivedField;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Config file consulted when `--config` is not given. Its absence is not an error.
pub const DEFAULT_CONFIG_FILE: &str = "simstat.toml";

/// Top-level configuration loaded from simstat.toml.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SimstatConfig {
    pub extract: ExtractConfig,
    #[serde(rename = "profile")]
    pub profiles: Vec<Profile>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ExtractConfig {
    pub on_malformed: MalformedPolicy,
}

/// What to do with a line whose captured value does not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Log a warning and continue with the next line.
    #[default]
    Skip,
    /// Abort the scan.
    Fail,
}

/// A named extraction setup: how runs start, which metrics belong to a run,
/// when a run is complete and what gets derived from it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Regex with one or more named groups; each becomes an integer key field.
    pub run_start: String,
    #[serde(rename = "metric")]
    pub metrics: Vec<MetricSpec>,
    /// Metrics that close a run. Defaults to every declared metric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(default)]
    pub derived: Vec<DerivedField>,
    #[serde(default, rename = "filter")]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MetricSpec {
    pub name: String,
    /// Regex capturing the value in a group named after the metric, or group 1.
    pub pattern: String,
    #[serde(default)]
    pub kind: MetricKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Int,
    #[default]
    Float,
}

/// How a dataset is turned into chart series.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChartConfig {
    pub x: String,
    pub y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub log2_x: bool,
    #[serde(default = "default_y_scale")]
    pub y_scale: f64,
    #[serde(default = "default_sort_x")]
    pub sort_x: bool,
}

fn default_y_scale() -> f64 {
    1.0
}

fn default_sort_x() -> bool {
    true
}

impl Profile {
    /// Metrics that must all be seen before a run is closed.
    pub fn required_metrics(&self) -> Vec<&str> {
        match &self.required {
            Some(required) => required.iter().map(String::as_str).collect(),
            None => self.metrics.iter().map(|m| m.name.as_str()).collect(),
        }
    }
}

/// Profiles reproducing the branch-predictor sweeps: BTB size, BTB
/// associativity, return address stack and local predictor.
const BUILTIN_PROFILES: &str = r#"
[[profile]]
name = "btb"
description = "BTB hit ratio versus total BTB size (16 bytes per entry)"
run_start = 'RUNNING.*numEntries\s*=\s*(?P<numEntries>\d+)'

[[profile.metric]]
name = "BTBHitRatio"
pattern = 'system\.cpu\.branchPred\.BTBHitRatio\s+(?P<BTBHitRatio>[\d\.]+)'
kind = "float"

[[profile.derived]]
kind = "product"
name = "totalSize"
fields = ["numEntries"]
factor = 16

[profile.chart]
x = "totalSize"
y = "BTBHitRatio"
log2_x = true
y_scale = 100.0

[[profile]]
name = "btb-assoc"
description = "BTB hit ratio versus associativity, one series per BTB size up to 64 KiB"
run_start = 'RUNNING\s+associativity\s*=\s*(?P<associativity>\d+)\s+AND\s+numEntries\s*=\s*(?P<numEntries>\d+)'

[[profile.metric]]
name = "BTBHitRatio"
pattern = 'system\.cpu\.branchPred\.BTBHitRatio\s+(?P<BTBHitRatio>[\d\.]+)'
kind = "float"

[[profile.derived]]
kind = "product"
name = "totalSize"
fields = ["numEntries"]
factor = 16

[[profile.filter]]
kind = "at_most"
field = "totalSize"
value = 65536

[profile.chart]
x = "associativity"
y = "BTBHitRatio"
group = "numEntries"
log2_x = true
y_scale = 100.0

[[profile]]
name = "ras"
description = "Return address stack hit rate versus total size (8 bytes per entry)"
run_start = '(?i)RUNNING\s+numEntries\s*=\s*(?P<numEntries>\d+)'

[[profile.metric]]
name = "correct"
pattern = '(?i)system\.cpu\.branchPred\.ras\.correct\s+(?P<correct>\d+)'
kind = "int"

[[profile.metric]]
name = "used"
pattern = '(?i)system\.cpu\.branchPred\.ras\.used\s+(?P<used>\d+)'
kind = "int"

[[profile.derived]]
kind = "ratio"
name = "hitRate"
numerator = "correct"
denominator = "used"

[[profile.derived]]
kind = "product"
name = "totalSize"
fields = ["numEntries"]
factor = 8

[profile.chart]
x = "totalSize"
y = "hitRate"
log2_x = true

[[profile]]
name = "local-bp"
description = "Local branch predictor miss rate by predictor size and counter bits"
run_start = 'RUNNING LOCAL PREDICTOR WITH SIZE=(?P<predictorSize>\d+) AND COUNTER=(?P<counterBits>\d+)'

[[profile.metric]]
name = "committed"
pattern = 'system\.cpu\.branchPred\.committed_0::DirectCond\s+(?P<committed>\d+)'
kind = "int"

[[profile.metric]]
name = "mispredicted"
pattern = 'system\.cpu\.branchPred\.mispredicted_0::DirectCond\s+(?P<mispredicted>\d+)'
kind = "int"

[[profile.derived]]
kind = "ratio"
name = "missRate"
numerator = "mispredicted"
denominator = "committed"
scale = 100.0

[[profile.derived]]
kind = "product"
name = "totalSize"
fields = ["predictorSize", "counterBits"]
divisor = 8

[profile.chart]
x = "predictorSize"
y = "missRate"
group = "counterBits"
log2_x = true
"#;

static BUILTINS: LazyLock<Vec<Profile>> = LazyLock::new(|| {
    toml::from_str::<SimstatConfig>(BUILTIN_PROFILES)
        .expect("built-in profiles are valid TOML")
        .profiles
});

/// The profiles that ship with simstat.
pub fn builtin_profiles() -> &'static [Profile] {
    &BUILTINS
}

impl SimstatConfig {
    /// Built-in profiles, with any user profile of the same name taking their place,
    /// followed by the remaining user profiles in file order.
    pub fn all_profiles(&self) -> Vec<&Profile> {
        let mut all: Vec<&Profile> = builtin_profiles()
            .iter()
            .map(|b| {
                self.profiles
                    .iter()
                    .find(|p| p.name == b.name)
                    .unwrap_or(b)
            })
            .collect();
        for p in &self.profiles {
            if !builtin_profiles().iter().any(|b| b.name == p.name) {
                all.push(p);
            }
        }
        all
    }

    pub fn profile(&self, name: &str) -> Result<&Profile, ConfigError> {
        let all = self.all_profiles();
        all.iter()
            .find(|p| p.name == name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownProfile {
                name: name.to_string(),
                available: all.iter().map(|p| p.name.clone()).collect(),
            })
    }
}

/// Load configuration.
///
/// An explicit `path` must exist. Without one, `simstat.toml` in the current
/// directory is used if present, otherwise defaults (built-in profiles only).
pub fn load(path: Option<&Path>) -> Result<SimstatConfig, ConfigError> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            tracing::debug!(path = %path.display(), "no config file, using built-in profiles");
            return Ok(SimstatConfig::default());
        }
        Err(e) => return Err(ConfigError::Read { path, source: e }),
    };

    let config: SimstatConfig =
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            source: e,
        })?;
    tracing::debug!(
        path = %path.display(),
        profiles = config.profiles.len(),
        "loaded config"
    );
    Ok(config)
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    UnknownProfile {
        name: String,
        available: Vec<String>,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::UnknownProfile { name, available } => {
                write!(
                    f,
                    "unknown profile '{name}' (available: {})",
                    available.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::UnknownProfile { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Value;
    use tempfile::tempdir;

    #[test]
    fn builtins_parse() {
        let names: Vec<&str> = builtin_profiles().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["btb", "btb-assoc", "ras", "local-bp"]);
    }

    #[test]
    fn builtin_btb_shape() {
        let btb = &builtin_profiles()[0];
        assert_eq!(btb.metrics.len(), 1);
        assert_eq!(btb.metrics[0].kind, MetricKind::Float);
        assert_eq!(
            btb.derived,
            vec![DerivedField::Product {
                name: "totalSize".into(),
                fields: vec!["numEntries".into()],
                factor: Value::Int(16),
                divisor: 1,
            }]
        );
        let chart = btb.chart.as_ref().unwrap();
        assert!(chart.log2_x);
        assert!(chart.sort_x);
        assert_eq!(chart.y_scale, 100.0);
        assert!(chart.group.is_none());
    }

    #[test]
    fn builtin_btb_assoc_has_size_filter() {
        let p = &builtin_profiles()[1];
        assert_eq!(
            p.filters,
            vec![Filter::AtMost {
                field: "totalSize".into(),
                value: 65536.0
            }]
        );
        assert_eq!(
            p.chart.as_ref().unwrap().group.as_deref(),
            Some("numEntries")
        );
    }

    #[test]
    fn required_defaults_to_all_metrics() {
        let ras = &builtin_profiles()[2];
        assert_eq!(ras.required_metrics(), vec!["correct", "used"]);
    }

    #[test]
    fn default_config_has_skip_policy_and_builtins() {
        let config = SimstatConfig::default();
        assert_eq!(config.extract.on_malformed, MalformedPolicy::Skip);
        assert_eq!(config.all_profiles().len(), 4);
        assert!(config.profile("ras").is_ok());
    }

    #[test]
    fn user_profile_replaces_builtin_and_extras_append() {
        let toml_str = r#"
[extract]
on_malformed = "fail"

[[profile]]
name = "ras"
run_start = 'START n=(?P<n>\d+)'
[[profile.metric]]
name = "hits"
pattern = 'hits (\d+)'
kind = "int"

[[profile]]
name = "custom"
run_start = 'BEGIN size=(?P<size>\d+)'
required = ["ipc"]
[[profile.metric]]
name = "ipc"
pattern = 'ipc\s+(?P<ipc>[\d.]+)'
"#;
        let config: SimstatConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.extract.on_malformed, MalformedPolicy::Fail);

        let names: Vec<&str> = config
            .all_profiles()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["btb", "btb-assoc", "ras", "local-bp", "custom"]);

        let ras = config.profile("ras").unwrap();
        assert_eq!(ras.metrics[0].name, "hits");
        assert!(ras.chart.is_none());

        let custom = config.profile("custom").unwrap();
        assert_eq!(custom.metrics[0].kind, MetricKind::Float);
        assert_eq!(custom.required_metrics(), vec!["ipc"]);
    }

    #[test]
    fn unknown_profile_lists_available() {
        let config = SimstatConfig::default();
        let err = config.profile("tage").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unknown profile 'tage'"));
        assert!(msg.contains("btb-assoc"));
    }

    #[test]
    fn load_explicit_missing_file_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let err = load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_explicit_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("simstat.toml");
        std::fs::write(&path, "[extract]\non_malformed = \"fail\"\n").unwrap();
        let config = load(Some(&path)).unwrap();
        assert_eq!(config.extract.on_malformed, MalformedPolicy::Fail);
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn load_invalid_toml_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("simstat.toml");
        std::fs::write(&path, "[[profile]]\nname = ").unwrap();
        let err = load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn profile_serializes_for_dry_run() {
        let out = toml::to_string_pretty(&builtin_profiles()[2]).unwrap();
        assert!(out.contains("name = \"ras\""));
        assert!(out.contains("kind = \"ratio\""));
        assert!(!out.contains("required"));
    }
}

//! Derived fields computed once a run's inputs are all present:
//! total storage size from entry counts, hit/miss rates from counter pairs.

use crate::dataset::Value;
use serde::{Deserialize, Serialize};

/// A derived-field rule, evaluated in declaration order after a run completes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivedField {
    /// `fields[0] * fields[1] * ... * factor / divisor`
    Product {
        name: String,
        fields: Vec<String>,
        #[serde(default = "default_factor")]
        factor: Value,
        #[serde(default = "default_divisor")]
        divisor: i64,
    },
    /// `numerator / denominator * scale`, always a float.
    Ratio {
        name: String,
        numerator: String,
        denominator: String,
        #[serde(default = "default_scale")]
        scale: f64,
    },
}

fn default_factor() -> Value {
    Value::Int(1)
}

fn default_divisor() -> i64 {
    1
}

fn default_scale() -> f64 {
    1.0
}

/// Result of evaluating one rule against a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Derivation {
    Value(Value),
    /// An input was never reported for this run; the field is left out.
    MissingInput(String),
    /// The rule divides by zero; the whole record is suppressed.
    ZeroDenominator,
}

impl DerivedField {
    pub fn name(&self) -> &str {
        match self {
            DerivedField::Product { name, .. } | DerivedField::Ratio { name, .. } => name,
        }
    }

    /// Names of the fields this rule reads.
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            DerivedField::Product { fields, .. } => fields.iter().map(String::as_str).collect(),
            DerivedField::Ratio {
                numerator,
                denominator,
                ..
            } => vec![numerator.as_str(), denominator.as_str()],
        }
    }

    pub fn evaluate(&self, lookup: impl Fn(&str) -> Option<Value>) -> Derivation {
        match self {
            DerivedField::Product {
                fields,
                factor,
                divisor,
                ..
            } => {
                let mut exact: Option<i64> = Some(1);
                let mut approx = 1.0_f64;
                for field in fields {
                    let Some(v) = lookup(field) else {
                        return Derivation::MissingInput(field.clone());
                    };
                    exact = mul_exact(exact, v);
                    approx *= v.as_f64();
                }
                exact = mul_exact(exact, *factor);
                approx *= factor.as_f64();

                if *divisor == 0 {
                    return Derivation::ZeroDenominator;
                }
                let quotient = exact.and_then(|n| match n.checked_rem(*divisor) {
                    Some(0) => n.checked_div(*divisor),
                    _ => None,
                });
                match quotient {
                    Some(q) => Derivation::Value(Value::Int(q)),
                    None => Derivation::Value(Value::Float(approx / *divisor as f64)),
                }
            }
            DerivedField::Ratio {
                numerator,
                denominator,
                scale,
                ..
            } => {
                let Some(num) = lookup(numerator) else {
                    return Derivation::MissingInput(numerator.clone());
                };
                let Some(den) = lookup(denominator) else {
                    return Derivation::MissingInput(denominator.clone());
                };
                if den.is_zero() {
                    return Derivation::ZeroDenominator;
                }
                Derivation::Value(Value::Float(num.as_f64() / den.as_f64() * scale))
            }
        }
    }
}

/// Integer product, or `None` once any operand is a float or it overflows.
fn mul_exact(acc: Option<i64>, v: Value) -> Option<i64> {
    match (acc, v) {
        (Some(a), Value::Int(b)) => a.checked_mul(b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, Value)]) -> impl Fn(&str) -> Option<Value> {
        let map: HashMap<String, Value> = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        move |name: &str| map.get(name).copied()
    }

    fn product(fields: &[&str], factor: Value, divisor: i64) -> DerivedField {
        DerivedField::Product {
            name: "totalSize".into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            factor,
            divisor,
        }
    }

    fn ratio(scale: f64) -> DerivedField {
        DerivedField::Ratio {
            name: "hitRate".into(),
            numerator: "correct".into(),
            denominator: "used".into(),
            scale,
        }
    }

    #[test]
    fn product_of_entries_and_width_stays_integer() {
        let rule = product(&["numEntries"], Value::Int(16), 1);
        let out = rule.evaluate(lookup(&[("numEntries", Value::Int(4096))]));
        assert_eq!(out, Derivation::Value(Value::Int(65536)));
    }

    #[test]
    fn product_with_exact_divisor() {
        // 2048 counters * 2 bits / 8 = 512 bytes
        let rule = product(&["predictorSize", "counterBits"], Value::Int(1), 8);
        let out = rule.evaluate(lookup(&[
            ("predictorSize", Value::Int(2048)),
            ("counterBits", Value::Int(2)),
        ]));
        assert_eq!(out, Derivation::Value(Value::Int(512)));
    }

    #[test]
    fn product_with_inexact_divisor_becomes_float() {
        let rule = product(&["predictorSize", "counterBits"], Value::Int(1), 8);
        let out = rule.evaluate(lookup(&[
            ("predictorSize", Value::Int(3)),
            ("counterBits", Value::Int(1)),
        ]));
        assert_eq!(out, Derivation::Value(Value::Float(0.375)));
    }

    #[test]
    fn product_with_float_factor() {
        let rule = product(&["numEntries"], Value::Float(0.5), 1);
        let out = rule.evaluate(lookup(&[("numEntries", Value::Int(3))]));
        assert_eq!(out, Derivation::Value(Value::Float(1.5)));
    }

    #[test]
    fn product_zero_divisor_suppresses() {
        let rule = product(&["numEntries"], Value::Int(1), 0);
        let out = rule.evaluate(lookup(&[("numEntries", Value::Int(3))]));
        assert_eq!(out, Derivation::ZeroDenominator);
    }

    #[test]
    fn product_overflow_falls_back_to_float() {
        let rule = product(&["a", "b"], Value::Int(1), 1);
        let out = rule.evaluate(lookup(&[("a", Value::Int(i64::MAX)), ("b", Value::Int(2))]));
        assert!(matches!(out, Derivation::Value(Value::Float(_))));
    }

    #[test]
    fn product_min_over_negative_one_falls_back_to_float() {
        let rule = product(&["a"], Value::Int(1), -1);
        let out = rule.evaluate(lookup(&[("a", Value::Int(i64::MIN))]));
        assert_eq!(out, Derivation::Value(Value::Float(-(i64::MIN as f64))));
    }

    #[test]
    fn ratio_hit_rate() {
        let out = ratio(1.0).evaluate(lookup(&[
            ("correct", Value::Int(3)),
            ("used", Value::Int(4)),
        ]));
        assert_eq!(out, Derivation::Value(Value::Float(0.75)));
    }

    #[test]
    fn ratio_scaled_to_percent() {
        let out = ratio(100.0).evaluate(lookup(&[
            ("correct", Value::Int(1)),
            ("used", Value::Int(4)),
        ]));
        assert_eq!(out, Derivation::Value(Value::Float(25.0)));
    }

    #[test]
    fn ratio_zero_denominator_suppresses() {
        let out = ratio(1.0).evaluate(lookup(&[
            ("correct", Value::Int(0)),
            ("used", Value::Int(0)),
        ]));
        assert_eq!(out, Derivation::ZeroDenominator);
    }

    #[test]
    fn missing_input_reported() {
        let out = ratio(1.0).evaluate(lookup(&[("correct", Value::Int(1))]));
        assert_eq!(out, Derivation::MissingInput("used".into()));
    }

    #[test]
    fn deserialize_from_toml() {
        let rule: DerivedField = toml::from_str(
            "kind = \"product\"\nname = \"totalSize\"\nfields = [\"numEntries\"]\nfactor = 16",
        )
        .unwrap();
        assert_eq!(rule, product(&["numEntries"], Value::Int(16), 1));
        assert_eq!(rule.inputs(), vec!["numEntries"]);

        let rule: DerivedField = toml::from_str(
            "kind = \"ratio\"\nname = \"hitRate\"\nnumerator = \"correct\"\ndenominator = \"used\"",
        )
        .unwrap();
        assert_eq!(rule, ratio(1.0));
        assert_eq!(rule.name(), "hitRate");
    }
}

//! Parameter space definitions and the decode rules into policy tokens.
//!
//! The optimizer works on raw *dimensions*; the policy table stores
//! *columns*. Most columns mirror one dimension, but some collapse raw values
//! into special tokens (a toggle with an explicit-zero and an absent state, a
//! numeric pair that degrades to a single disabled token). Those rules are
//! declared per column and evaluated in column order.

use kt_types::{validation_error, KtResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A single raw dimension of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    /// Flag name as the optimizer sees it (e.g. "MIScheduler").
    pub name: String,
    pub kind: DimensionKind,
}

/// Describes how a dimension is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DimensionKind {
    /// Finite ordered set of string choices.
    Enumerated { choices: Vec<String> },
    /// Inclusive range, integral or real.
    Range { min: f64, max: f64, is_integer: bool },
}

/// A concrete raw value proposed by a search strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Choice(String),
}

impl ParameterValue {
    /// Numeric view of the value; choices have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Choice(_) => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Choice(v) => write!(f, "{v}"),
        }
    }
}

/// Raw optimizer configuration, keyed by dimension name.
pub type Configuration = HashMap<String, ParameterValue>;

/// How one policy column is derived from raw dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecodeRule {
    /// The dimension's value, verbatim.
    Direct { dim: String },
    /// `0` becomes `zero_token`, `1` becomes `one_token`, anything else is
    /// written verbatim.
    Toggle {
        dim: String,
        zero_token: String,
        one_token: String,
    },
    /// Two integers joined by `joiner`; either one being zero yields
    /// `disabled_token` instead.
    Pair {
        first: String,
        second: String,
        disabled_token: String,
        joiner: String,
    },
}

/// One column of the policy table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub rule: DecodeRule,
    /// Token written for kernels that have never been tuned.
    pub default: String,
}

/// The full search space: ordered dimensions plus ordered policy columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    pub dimensions: Vec<Dimension>,
    pub columns: Vec<Column>,
}

const SCHEDULERS: [&str; 3] = ["topdown", "bottomup", "bidirectional"];

impl ParameterSpace {
    pub fn new() -> Self {
        Self {
            dimensions: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// The process-wide compiler-flag space.
    pub fn declare() -> Self {
        Self::new()
            .add_choice("MIScheduler", &SCHEDULERS)
            .add_choice("PostRA-MIScheduler", &SCHEDULERS)
            .add_choice("MachineSink", &["pass", "disable"])
            .add_float("MachineLICM", 0.0, 1.0)
            .add_int("RegCoalescer_0", 0, 200)
            .add_int("RegCoalescer_1", 0, 512)
            .direct_column("MIScheduler", "bidirectional")
            .direct_column("PostRA-MIScheduler", "topdown")
            .direct_column("MachineSink", "pass")
            .column(
                "MachineLICM",
                DecodeRule::Toggle {
                    dim: "MachineLICM".into(),
                    zero_token: "0.0".into(),
                    one_token: String::new(),
                },
                "",
            )
            .column(
                "RegCoalescer",
                DecodeRule::Pair {
                    first: "RegCoalescer_0".into(),
                    second: "RegCoalescer_1".into(),
                    disabled_token: "no".into(),
                    joiner: "_and_".into(),
                },
                "no",
            )
    }

    pub fn add_choice(mut self, name: impl Into<String>, choices: &[&str]) -> Self {
        self.dimensions.push(Dimension {
            name: name.into(),
            kind: DimensionKind::Enumerated {
                choices: choices.iter().map(|c| c.to_string()).collect(),
            },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, min: i64, max: i64) -> Self {
        self.dimensions.push(Dimension {
            name: name.into(),
            kind: DimensionKind::Range {
                min: min as f64,
                max: max as f64,
                is_integer: true,
            },
        });
        self
    }

    pub fn add_float(mut self, name: impl Into<String>, min: f64, max: f64) -> Self {
        self.dimensions.push(Dimension {
            name: name.into(),
            kind: DimensionKind::Range {
                min,
                max,
                is_integer: false,
            },
        });
        self
    }

    /// Column mirroring the dimension of the same name.
    pub fn direct_column(self, dim: &str, default: &str) -> Self {
        self.column(dim, DecodeRule::Direct { dim: dim.to_string() }, default)
    }

    pub fn column(mut self, name: impl Into<String>, rule: DecodeRule, default: &str) -> Self {
        self.columns.push(Column {
            name: name.into(),
            rule,
            default: default.to_string(),
        });
        self
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// The record written for a kernel seen for the first time.
    pub fn default_settings(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.default.clone()).collect()
    }

    /// Check every dimension is present, in range and of the right type.
    pub fn validate(&self, config: &Configuration) -> KtResult<()> {
        for dim in &self.dimensions {
            let value = config
                .get(&dim.name)
                .ok_or_else(|| {
                    validation_error!("configuration is missing dimension {}", dim.name)
                })?;
            match (&dim.kind, value) {
                (DimensionKind::Enumerated { choices }, ParameterValue::Choice(v)) => {
                    if !choices.contains(v) {
                        return Err(validation_error!("{v} is not a choice of {}", dim.name));
                    }
                }
                (DimensionKind::Range { min, max, is_integer }, value) => {
                    let v = value
                        .as_f64()
                        .ok_or_else(|| {
                            validation_error!("{} expects a number, got {value}", dim.name)
                        })?;
                    if *is_integer && !matches!(value, ParameterValue::Int(_)) {
                        return Err(validation_error!(
                            "{} expects an integer, got {value}",
                            dim.name
                        ));
                    }
                    if v < *min || v > *max {
                        return Err(validation_error!("{} = {v} outside [{min}, {max}]", dim.name));
                    }
                }
                (_, value) => {
                    return Err(validation_error!("{} does not accept {value}", dim.name));
                }
            }
        }
        Ok(())
    }

    /// Turn a raw configuration into policy tokens, in column order.
    pub fn decode(&self, config: &Configuration) -> KtResult<Vec<String>> {
        self.columns
            .iter()
            .map(|column| match &column.rule {
                DecodeRule::Direct { dim } => Ok(lookup(config, dim)?.to_string()),
                DecodeRule::Toggle {
                    dim,
                    zero_token,
                    one_token,
                } => {
                    let value = lookup(config, dim)?;
                    Ok(match value.as_f64() {
                        Some(v) if v == 0.0 => zero_token.clone(),
                        Some(v) if v == 1.0 => one_token.clone(),
                        _ => value.to_string(),
                    })
                }
                DecodeRule::Pair {
                    first,
                    second,
                    disabled_token,
                    joiner,
                } => {
                    let a = integral(first, lookup(config, first)?)?;
                    let b = integral(second, lookup(config, second)?)?;
                    if a == 0 || b == 0 {
                        Ok(disabled_token.clone())
                    } else {
                        Ok(format!("{a}{joiner}{b}"))
                    }
                }
            })
            .collect()
    }

    /// Best-effort inverse of [`decode`](Self::decode).
    ///
    /// Lossy: a disabled pair comes back as both parts zero. Only
    /// `decode(encode(decode(c))) == decode(c)` holds.
    pub fn encode(&self, settings: &[String]) -> KtResult<Configuration> {
        if settings.len() != self.columns.len() {
            return Err(validation_error!(
                "expected {} settings, got {}",
                self.columns.len(),
                settings.len()
            ));
        }

        let mut config = Configuration::new();
        for (column, token) in self.columns.iter().zip(settings) {
            match &column.rule {
                DecodeRule::Direct { dim } => {
                    config.insert(dim.clone(), self.parse_token(dim, token)?);
                }
                DecodeRule::Toggle {
                    dim,
                    zero_token,
                    one_token,
                } => {
                    let value = if token == zero_token {
                        self.numeric(dim, 0.0)?
                    } else if token == one_token {
                        self.numeric(dim, 1.0)?
                    } else {
                        self.parse_token(dim, token)?
                    };
                    config.insert(dim.clone(), value);
                }
                DecodeRule::Pair {
                    first,
                    second,
                    disabled_token,
                    joiner,
                } => {
                    let (a, b) = if token == disabled_token {
                        (0, 0)
                    } else {
                        let (a, b) = token
                            .split_once(joiner.as_str())
                            .ok_or_else(|| {
                                validation_error!("{token:?} is not a {} pair", column.name)
                            })?;
                        (parse_int(first, a)?, parse_int(second, b)?)
                    };
                    config.insert(first.clone(), ParameterValue::Int(a));
                    config.insert(second.clone(), ParameterValue::Int(b));
                }
            }
        }
        Ok(config)
    }

    fn parse_token(&self, dim: &str, token: &str) -> KtResult<ParameterValue> {
        let dimension = self
            .dimension(dim)
            .ok_or_else(|| validation_error!("unknown dimension {dim}"))?;
        match &dimension.kind {
            DimensionKind::Enumerated { .. } => Ok(ParameterValue::Choice(token.to_string())),
            DimensionKind::Range { is_integer: true, .. } => {
                Ok(ParameterValue::Int(parse_int(dim, token)?))
            }
            DimensionKind::Range { .. } => token
                .trim()
                .parse::<f64>()
                .map(ParameterValue::Float)
                .map_err(|_| validation_error!("{dim} expects a number, got {token:?}")),
        }
    }

    fn numeric(&self, dim: &str, v: f64) -> KtResult<ParameterValue> {
        match self.dimension(dim).map(|d| &d.kind) {
            Some(DimensionKind::Range { is_integer: true, .. }) => {
                Ok(ParameterValue::Int(v as i64))
            }
            Some(DimensionKind::Range { .. }) => Ok(ParameterValue::Float(v)),
            _ => Err(validation_error!("{dim} is not a numeric dimension")),
        }
    }
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self::declare()
    }
}

fn lookup<'a>(config: &'a Configuration, dim: &str) -> KtResult<&'a ParameterValue> {
    config
        .get(dim)
        .ok_or_else(|| validation_error!("configuration is missing dimension {dim}"))
}

fn integral(dim: &str, value: &ParameterValue) -> KtResult<i64> {
    match value {
        ParameterValue::Int(v) => Ok(*v),
        ParameterValue::Float(v) => Ok(v.round() as i64),
        ParameterValue::Choice(v) => Err(validation_error!("{dim} expects an integer, got {v}")),
    }
}

fn parse_int(dim: &str, token: &str) -> KtResult<i64> {
    token
        .trim()
        .parse::<i64>()
        .map_err(|_| validation_error!("{dim} expects an integer, got {token:?}"))
}

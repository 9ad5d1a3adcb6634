use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Ident, ReceiverError};

/// How points falling into the same archive slot are combined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationFn {
    /// The mean of all points in the slot.
    #[default]
    Average,
    /// The smallest point in the slot.
    Min,
    /// The largest point in the slot.
    Max,
    /// The most recently applied point.
    Last,
}

impl ConsolidationFn {
    /// Merges `value`, covering `count` points, into a slot holding `current` over `seen` points.
    pub(crate) fn merge(self, current: f64, seen: u32, value: f64, count: u32) -> f64 {
        match self {
            Self::Average => {
                let total = f64::from(seen) + f64::from(count);
                (current * f64::from(seen) + value * f64::from(count)) / total
            }
            Self::Min => current.min(value),
            Self::Max => current.max(value),
            Self::Last => value,
        }
    }
}

/// One archive resolution of a data source.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RraSpec {
    /// The consolidation function of this archive.
    #[serde(default)]
    pub cf: ConsolidationFn,
    /// The width of one slot in seconds.
    pub step: u64,
    /// The number of slots kept by storage.
    pub rows: u32,
}

/// The creation spec of a data source.
///
/// A spec is resolved once when a metric is first seen and stays fixed afterwards.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DsSpec {
    /// The base resolution in seconds.
    pub step: u64,
    /// Seconds without points after which storage treats the series as unknown.
    pub heartbeat: u64,
    /// Archive resolutions.
    ///
    /// When empty, a single averaging archive at the base resolution is used.
    #[serde(default)]
    pub rras: Vec<RraSpec>,
}

impl DsSpec {
    /// Returns the base resolution.
    pub fn step(&self) -> Duration {
        Duration::from_secs(self.step)
    }

    /// Returns the heartbeat.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat)
    }

    /// Returns the archives points are consolidated into.
    pub fn archives(&self) -> Vec<RraSpec> {
        if self.rras.is_empty() {
            vec![RraSpec {
                cf: ConsolidationFn::Average,
                step: self.step,
                rows: 1,
            }]
        } else {
            self.rras.clone()
        }
    }
}

impl Default for DsSpec {
    /// 10 second resolution for 6 hours, 1 minute for a day, 10 minutes for 93 days and daily
    /// values for 5 years.
    fn default() -> Self {
        Self {
            step: 10,
            heartbeat: 2 * 60 * 60,
            rras: vec![
                RraSpec {
                    cf: ConsolidationFn::Average,
                    step: 10,
                    rows: 2160,
                },
                RraSpec {
                    cf: ConsolidationFn::Average,
                    step: 60,
                    rows: 1440,
                },
                RraSpec {
                    cf: ConsolidationFn::Average,
                    step: 600,
                    rows: 13392,
                },
                RraSpec {
                    cf: ConsolidationFn::Average,
                    step: 86400,
                    rows: 1825,
                },
            ],
        }
    }
}

/// Resolves the creation spec for metrics that storage does not know yet.
pub trait MatchingDsSpecFinder: Send + Sync {
    /// Returns the spec for a new data source, or `None` if the identity must not be created.
    fn find_matching_spec(&self, ident: &Ident) -> Option<DsSpec>;
}

/// Assigns the same spec to every well-formed identity.
#[derive(Clone, Debug, Default)]
pub struct SimpleDsFinder {
    spec: DsSpec,
}

impl SimpleDsFinder {
    /// Creates a finder that hands out `spec`.
    pub fn new(spec: DsSpec) -> Self {
        Self { spec }
    }
}

impl MatchingDsSpecFinder for SimpleDsFinder {
    fn find_matching_spec(&self, ident: &Ident) -> Option<DsSpec> {
        if ident.is_empty() {
            return None;
        }
        Some(self.spec.clone())
    }
}

/// A rule of the [`RegexDsFinder`] in configuration form.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DsRule {
    /// Regular expression matched against the metric name.
    pub pattern: String,
    /// The spec for matching metrics.
    pub spec: DsSpec,
}

/// Picks the spec of the first rule whose pattern matches the metric name.
///
/// Identities without a name tag only receive the fallback spec.
#[derive(Clone, Debug)]
pub struct RegexDsFinder {
    rules: Vec<(Regex, DsSpec)>,
    fallback: Option<DsSpec>,
}

impl RegexDsFinder {
    /// Compiles the given rules in order.
    ///
    /// Fails with [`ReceiverError::InvalidRule`] naming the first pattern that does not compile.
    pub fn new(rules: &[DsRule], fallback: Option<DsSpec>) -> Result<Self, ReceiverError> {
        let rules = rules
            .iter()
            .map(|rule| match Regex::new(&rule.pattern) {
                Ok(pattern) => Ok((pattern, rule.spec.clone())),
                Err(source) => Err(ReceiverError::InvalidRule {
                    pattern: rule.pattern.clone(),
                    source,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { rules, fallback })
    }
}

impl MatchingDsSpecFinder for RegexDsFinder {
    fn find_matching_spec(&self, ident: &Ident) -> Option<DsSpec> {
        if ident.is_empty() {
            return None;
        }

        let matched = ident.name().and_then(|name| {
            self.rules
                .iter()
                .find(|(pattern, _)| pattern.is_match(name))
                .map(|(_, spec)| spec.clone())
        });

        matched.or_else(|| self.fallback.clone())
    }
}

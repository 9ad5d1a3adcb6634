use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_system::Interface;

use crate::Ident;

/// A rate sample on its way through the pipeline.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct IncomingPoint {
    /// The metric this sample belongs to.
    pub ident: Ident,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// The sampled value.
    pub value: f64,
    /// How many times this point has been forwarded between nodes.
    #[serde(default)]
    pub hops: u32,
}

impl IncomingPoint {
    /// Creates a point that has not been forwarded yet.
    pub fn new(ident: Ident, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            ident,
            timestamp,
            value,
            hops: 0,
        }
    }
}

impl Interface for IncomingPoint {}

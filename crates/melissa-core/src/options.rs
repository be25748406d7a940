//! Aggregation configuration shared by launcher and server
//!
//! The launcher serializes [`ServerOptions`] into the server's options string
//! and the server parses it back at startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which statistics the aggregator computes (`MELISSA_STATS`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsOptions {
    #[serde(default)]
    pub mean: bool,
    #[serde(default)]
    pub variance: bool,
    #[serde(default)]
    pub skewness: bool,
    #[serde(default)]
    pub kurtosis: bool,
    #[serde(default)]
    pub min: bool,
    #[serde(default)]
    pub max: bool,
    #[serde(default)]
    pub threshold_exceedance: bool,
    #[serde(default)]
    pub threshold_values: Vec<f64>,
    #[serde(default)]
    pub quantiles: bool,
    #[serde(default)]
    pub quantile_values: Vec<f64>,
    #[serde(default)]
    pub sobol_indices: bool,
}

impl StatsOptions {
    /// Names of the enabled statistics, for logs
    pub fn enabled(&self) -> Vec<&'static str> {
        [
            (self.mean, "mean"),
            (self.variance, "variance"),
            (self.skewness, "skewness"),
            (self.kurtosis, "kurtosis"),
            (self.min, "min"),
            (self.max, "max"),
            (self.threshold_exceedance, "threshold_exceedance"),
            (self.quantiles, "quantiles"),
            (self.sobol_indices, "sobol_indices"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

/// Everything the aggregator needs to know about the study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerOptions {
    pub field_names: Vec<String>,
    pub nb_time_steps: usize,
    /// Total simulations across all groups, before any drop
    pub expected_simulations: usize,
    pub nb_parameters: u32,
    pub sobol: bool,
    #[serde(default)]
    pub learning: bool,
    #[serde(default)]
    pub verbosity: u32,
    pub simulation_timeout_secs: f64,
    pub checkpoint_interval_secs: f64,
    pub checkpoint_dir: PathBuf,
    pub high_water_mark: usize,
    #[serde(default)]
    pub stats: StatsOptions,
}

impl ServerOptions {
    pub fn to_options_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_options_string(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

//! Study configuration
//!
//! The configuration file is JSON with two sections:
//!
//! ```json
//! {
//!   "STUDY_OPTIONS": { "sampling_size": 4, "nb_parameters": 2, "nb_timesteps": 2,
//!                      "field_names": ["u"] },
//!   "MELISSA_STATS": { "mean": true, "variance": true }
//! }
//! ```
//!
//! Validation never stops at the first problem: every violation is logged on
//! its own line and the total is returned so the binary can exit non-zero
//! before anything is submitted.

use crate::error::{LauncherError, Result};
use crate::sampling::simulation_count;
use melissa_core::{CouplingMode, DEFAULT_DATA_PORT, DEFAULT_HIGH_WATER_MARK, ServerOptions, StatsOptions};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

fn default_simulation_timeout() -> f64 {
    400.0
}

fn default_checkpoint_interval() -> f64 {
    300.0
}

fn default_verbosity() -> u32 {
    1
}

fn default_poll_interval() -> f64 {
    10.0
}

fn default_server_timeout() -> f64 {
    100.0
}

fn default_ping_interval() -> f64 {
    10.0
}

fn default_cycle_interval() -> f64 {
    1.0
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}

fn default_data_port() -> u16 {
    DEFAULT_DATA_PORT
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}

/// `STUDY_OPTIONS`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyOptions {
    pub sampling_size: usize,
    pub nb_parameters: u32,
    pub nb_timesteps: usize,
    pub field_names: Vec<String>,

    /// Seconds without data before a simulation is declared hung
    #[serde(default = "default_simulation_timeout")]
    pub simulation_timeout: f64,

    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: f64,

    #[serde(default)]
    pub coupling: CouplingMode,

    /// 0 (errors only) to 3 (debug)
    #[serde(default = "default_verbosity")]
    pub verbosity: u32,

    #[serde(default)]
    pub learning: bool,

    /// State-poll loop period
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,

    /// Seconds without any aggregator message before it is declared dead
    #[serde(default = "default_server_timeout")]
    pub server_timeout: f64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval: f64,

    /// Fault detector cycle
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval: f64,

    #[serde(default = "default_high_water_mark")]
    pub data_high_water_mark: usize,

    /// Port the aggregator's data plane binds, exported to simulations
    #[serde(default = "default_data_port")]
    pub data_port: u16,

    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
}

/// Whole configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyConfig {
    #[serde(rename = "STUDY_OPTIONS")]
    pub study_options: StudyOptions,

    #[serde(rename = "MELISSA_STATS", default)]
    pub melissa_stats: StatsOptions,
}

fn secs(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value)
        .or_else(|_| Duration::try_from_secs_f64(fallback))
        .unwrap_or_default()
}

impl StudyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Sobol' groups are built when Sobol' indices are requested
    pub fn is_sobol(&self) -> bool {
        self.melissa_stats.sobol_indices
    }

    /// Simulations per group
    pub fn group_size(&self) -> usize {
        if self.is_sobol() {
            self.study_options.nb_parameters as usize + 2
        } else {
            1
        }
    }

    /// Simulations the aggregator waits for before any drop
    pub fn expected_simulations(&self) -> usize {
        self.study_options.sampling_size.saturating_mul(self.group_size())
    }

    pub fn simulation_timeout(&self) -> Duration {
        secs(self.study_options.simulation_timeout, default_simulation_timeout())
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.study_options.poll_interval, default_poll_interval())
    }

    pub fn server_timeout(&self) -> Duration {
        secs(self.study_options.server_timeout, default_server_timeout())
    }

    pub fn ping_interval(&self) -> Duration {
        secs(self.study_options.ping_interval, default_ping_interval())
    }

    pub fn cycle_interval(&self) -> Duration {
        secs(self.study_options.cycle_interval, default_cycle_interval())
    }

    /// Aggregator options derived from this study
    pub fn server_options(&self) -> ServerOptions {
        let o = &self.study_options;
        ServerOptions {
            field_names: o.field_names.clone(),
            nb_time_steps: o.nb_timesteps,
            expected_simulations: self.expected_simulations(),
            nb_parameters: o.nb_parameters,
            sobol: self.is_sobol(),
            learning: o.learning,
            verbosity: o.verbosity,
            simulation_timeout_secs: o.simulation_timeout,
            checkpoint_interval_secs: o.checkpoint_interval,
            checkpoint_dir: o.checkpoint_dir.clone(),
            high_water_mark: o.data_high_water_mark,
            stats: self.melissa_stats.clone(),
        }
    }

    /// Every rule the configuration breaks, one message each
    pub fn violations(&self) -> Vec<String> {
        let o = &self.study_options;
        let stats = &self.melissa_stats;
        let mut violations = Vec::new();

        // a single Sobol' group already holds nb_parameters + 2 simulations
        let min_sampling = if self.is_sobol() { 1 } else { 2 };
        if o.sampling_size < min_sampling {
            violations.push(format!(
                "sampling_size must be >= {min_sampling}, got {}",
                o.sampling_size
            ));
        }

        let min_parameters = if self.is_sobol() { 2 } else { 1 };
        if o.nb_parameters < min_parameters {
            violations.push(format!(
                "nb_parameters must be >= {min_parameters}{}, got {}",
                if self.is_sobol() { " with Sobol' indices" } else { "" },
                o.nb_parameters
            ));
        }

        if o.sampling_size > 0 && simulation_count(o.sampling_size, self.is_sobol(), o.nb_parameters).is_none() {
            violations.push(format!(
                "sampling_size {} with {} simulation(s) per group does not fit in u32 simulation ids",
                o.sampling_size,
                self.group_size()
            ));
        }

        if o.nb_timesteps == 0 {
            violations.push("nb_timesteps must be >= 1".to_string());
        }

        if o.field_names.is_empty() {
            violations.push("field_names must not be empty".to_string());
        }
        for (i, name) in o.field_names.iter().enumerate() {
            if name.is_empty() {
                violations.push(format!("field_names[{i}] is empty"));
            } else if name.len() > melissa_core::FIELD_NAME_WIDTH {
                violations.push(format!(
                    "field name '{name}' is longer than {} bytes",
                    melissa_core::FIELD_NAME_WIDTH
                ));
            }
            if o.field_names[..i].contains(name) {
                violations.push(format!("field name '{name}' is declared twice"));
            }
        }

        for (name, value) in [
            ("simulation_timeout", o.simulation_timeout),
            ("checkpoint_interval", o.checkpoint_interval),
            ("poll_interval", o.poll_interval),
            ("server_timeout", o.server_timeout),
            ("ping_interval", o.ping_interval),
            ("cycle_interval", o.cycle_interval),
        ] {
            if !(value.is_finite() && value > 0.0) {
                violations.push(format!("{name} must be a positive number of seconds, got {value}"));
            }
        }

        if o.verbosity > 3 {
            violations.push(format!("verbosity must be between 0 and 3, got {}", o.verbosity));
        }

        if o.data_high_water_mark == 0 {
            violations.push("data_high_water_mark must be >= 1".to_string());
        }

        if o.data_port == 0 {
            violations.push("data_port must be a fixed port, got 0".to_string());
        }

        if stats.threshold_exceedance && stats.threshold_values.is_empty() {
            violations.push("threshold_exceedance requires threshold_values".to_string());
        }
        if stats.quantiles {
            if stats.quantile_values.is_empty() {
                violations.push("quantiles requires quantile_values".to_string());
            }
            for q in &stats.quantile_values {
                if !(*q > 0.0 && *q < 1.0) {
                    violations.push(format!("quantile value {q} is outside (0, 1)"));
                }
            }
        }

        violations
    }

    /// Log every violation and return how many there were
    pub fn validate(&self) -> usize {
        let violations = self.violations();
        for violation in &violations {
            error!("Invalid study configuration: {}", violation);
        }
        violations.len()
    }
}

/// Whether `path` is an executable file
pub fn check_executable(path: &Path) -> Result<bool> {
    if !path.is_file() {
        return Err(LauncherError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} not found", path.display()),
        )));
    }
    let metadata = File::open(path)?.metadata()?;
    Ok((metadata.mode() & 0o111) != 0)
}

/// Find `program` as given or on `PATH` when it has no directory part
pub fn resolve_executable(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return check_executable(program)
            .ok()
            .filter(|ok| *ok)
            .map(|_| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| matches!(check_executable(candidate), Ok(true)))
}

/// Split raw scheduler arguments. They must start with an option flag.
pub fn parse_scheduler_args(raw: &str) -> std::result::Result<Vec<String>, String> {
    let args: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    match args.first() {
        Some(first) if !first.starts_with('-') => Err(format!(
            "scheduler arguments must start with an option flag, got '{first}'"
        )),
        _ => Ok(args),
    }
}

/// Check everything outside the configuration file the study depends on.
///
/// Logs one line per violation and returns the count.
pub fn preflight(executables: &[&Path], scheduler_args: &[&str]) -> usize {
    let mut count = 0;
    for program in executables {
        if resolve_executable(program).is_none() {
            error!("Executable not found or not executable: {}", program.display());
            count += 1;
        }
    }
    for raw in scheduler_args {
        if let Err(violation) = parse_scheduler_args(raw) {
            error!("Invalid scheduler arguments: {}", violation);
            count += 1;
        }
    }
    count
}

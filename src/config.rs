//! Simulation configuration.
//!
//! Values are read at step start and stay fixed for the whole step. Every
//! field has a builder method, and a config can be loaded from JSON:
//!
//! ```json
//! {
//!   "num_particles": 20000,
//!   "radius": 0.05,
//!   "box_size": [1.0, 1.0, 1.0],
//!   "backend": "gpu",
//!   "rules": [{ "Separate": { "strength": 2.0 } }, "ConstantSpeed"]
//! }
//! ```

use std::fs;
use std::path::Path;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigLoadError};
use crate::grid::GridGeometry;
use crate::rules::Rule;

/// Which executor runs the step pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// rayon data-parallel passes on the host.
    #[default]
    Cpu,
    /// wgpu compute passes on a headless device.
    Gpu,
}

/// What [`Simulation::inspect`](crate::Simulation::inspect) collects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectConfig {
    pub grid: bool,
    pub particles: bool,
    pub cells: bool,
    pub neighbours: bool,
    /// Number of leading entries to collect from each table.
    pub limit: usize,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            grid: true,
            particles: true,
            cells: true,
            neighbours: true,
            limit: 10,
        }
    }
}

/// Host-supplied simulation parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Particle count when seeding. Fixed for the run.
    pub num_particles: u32,
    /// Initial and target particle speed.
    pub speed: f32,
    /// Interaction radius. Also the grid cell size.
    pub radius: f32,
    /// Requested box extents, rounded to a multiple of `radius`.
    pub box_size: Vec3,
    /// Per-step velocity jitter as a fraction of `speed`.
    pub noise: f32,
    /// Seed for initial placement. `None` draws from entropy.
    pub seed: Option<u64>,
    pub backend: Backend,
    /// Integration rules, applied in order.
    pub rules: Vec<Rule>,
    pub inspect: InspectConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_particles: 500_000,
            speed: 4.0,
            radius: 5.0,
            box_size: Vec3::ONE,
            noise: 0.01,
            seed: None,
            backend: Backend::Cpu,
            rules: vec![Rule::ConstantSpeed],
            inspect: InspectConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn new(num_particles: u32) -> Self {
        Self {
            num_particles,
            ..Default::default()
        }
    }

    pub fn with_particles(mut self, num_particles: u32) -> Self {
        self.num_particles = num_particles;
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    /// Set the interaction radius (and so the cell size).
    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_box(mut self, box_size: Vec3) -> Self {
        self.box_size = box_size;
        self
    }

    pub fn with_noise(mut self, noise: f32) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Append an integration rule.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Replace all integration rules.
    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_inspect(mut self, inspect: InspectConfig) -> Self {
        self.inspect = inspect;
        self
    }

    /// Check the configuration and derive the grid.
    ///
    /// Reports the first problem found: a zero particle count, a
    /// non-finite parameter, or an invalid grid.
    pub fn validate(&self) -> Result<GridGeometry, ConfigError> {
        if self.num_particles == 0 {
            return Err(ConfigError::NoParticles);
        }
        self.validate_motion()?;
        GridGeometry::new(self.radius, self.box_size)
    }

    /// Checks that hold regardless of particle count.
    pub(crate) fn validate_motion(&self) -> Result<(), ConfigError> {
        if !self.speed.is_finite() {
            return Err(ConfigError::NonFiniteValue("speed"));
        }
        if !self.noise.is_finite() {
            return Err(ConfigError::NonFiniteValue("noise"));
        }
        if self
            .rules
            .iter()
            .filter_map(Rule::parameters)
            .any(|v| !v.is_finite())
        {
            return Err(ConfigError::NonFiniteValue("rules"));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigLoadError> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

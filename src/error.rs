//! Error types for cellgrid.
//!
//! Configuration and capacity problems are reported before the first step.
//! Anything that goes wrong inside a step is fatal for that step and poisons
//! the simulation, since later states have no meaning on partial data.

use std::fmt;

use crate::dispatch::Stage;

/// Errors found while validating a [`SimConfig`](crate::SimConfig) or grid.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Cell size (the interaction radius) was zero or negative.
    NonPositiveCellSize(f32),
    /// A box extent was zero or negative.
    NonPositiveBox {
        /// Axis index (0 = x, 1 = y, 2 = z).
        axis: usize,
        /// The offending extent.
        value: f32,
    },
    /// `num_particles` was zero.
    NoParticles,
    /// A configuration value was NaN or infinite.
    NonFiniteValue(&'static str),
    /// The grid has so many cells that cell ids collide with the sort sentinel.
    GridTooLarge {
        /// Number of cells the grid would need.
        cells: u64,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NonPositiveCellSize(v) => {
                write!(f, "Cell size must be positive, got {}", v)
            }
            ConfigError::NonPositiveBox { axis, value } => {
                let name = ["x", "y", "z"].get(*axis).copied().unwrap_or("?");
                write!(f, "Box extent on {} must be positive, got {}", name, value)
            }
            ConfigError::NoParticles => write!(f, "numParticles must be at least 1"),
            ConfigError::NonFiniteValue(field) => {
                write!(f, "Configuration value `{}` is not finite", field)
            }
            ConfigError::GridTooLarge { cells } => write!(
                f,
                "Grid needs {} cells, which does not fit in a 32-bit cell id",
                cells
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Requested buffers do not fit the device.
#[derive(Debug, Clone, PartialEq)]
pub enum CapacityError {
    /// A single buffer exceeds the device's buffer or binding size limit.
    BufferTooLarge {
        /// Buffer label.
        label: &'static str,
        /// Requested size in bytes.
        requested: u64,
        /// Largest size the device accepts.
        limit: u64,
    },
    /// The host could not reserve a step buffer.
    AllocationFailed {
        /// Buffer label.
        label: &'static str,
        /// Requested size in bytes (saturated).
        requested: u64,
    },
    /// Step buffers were sized for a different particle count.
    ParticleCountMismatch {
        /// Particles the buffers were allocated for.
        capacity: usize,
        /// Particles actually supplied.
        particles: usize,
    },
    /// A cell id does not fit the boundary table.
    CellOutsideTable {
        /// The offending cell id.
        cell: u32,
        /// Cells the table holds.
        num_cells: u32,
    },
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityError::BufferTooLarge { label, requested, limit } => write!(
                f,
                "Buffer '{}' needs {} bytes but the device allows at most {}",
                label, requested, limit
            ),
            CapacityError::AllocationFailed { label, requested } => write!(
                f,
                "Could not allocate {} bytes for '{}'",
                requested, label
            ),
            CapacityError::ParticleCountMismatch { capacity, particles } => write!(
                f,
                "Step buffers hold {} particles but {} were supplied",
                capacity, particles
            ),
            CapacityError::CellOutsideTable { cell, num_cells } => write!(
                f,
                "Cell id {} is outside a boundary table of {} cells",
                cell, num_cells
            ),
        }
    }
}

impl std::error::Error for CapacityError {}

/// A consumer read step-scoped data out of order.
///
/// This is a programming error. It is unreachable while the dispatcher runs
/// its states in order, and is reported rather than silently ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderingViolation {
    /// A state was entered while the dispatcher was in a different state.
    OutOfOrder {
        /// The state the dispatcher expected to run next.
        expected: Stage,
        /// The state that was requested.
        found: Stage,
    },
    /// A boundary table built for another step was consulted.
    StaleBoundaries {
        /// Step the table was built for, if it was ever built.
        built_for: Option<u64>,
        /// Step currently in progress.
        current: u64,
    },
}

impl fmt::Display for OrderingViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderingViolation::OutOfOrder { expected, found } => {
                write!(f, "Stage {:?} ran while {:?} was expected", found, expected)
            }
            OrderingViolation::StaleBoundaries { built_for: Some(built), current } => write!(
                f,
                "Boundary table from step {} consulted during step {}",
                built, current
            ),
            OrderingViolation::StaleBoundaries { built_for: None, current } => write!(
                f,
                "Boundary table consulted during step {} before it was ever built",
                current
            ),
        }
    }
}

impl std::error::Error for OrderingViolation {}

/// Errors that can occur during GPU initialization or readback.
#[derive(Debug)]
pub enum GpuError {
    /// No compatible GPU adapter found.
    NoAdapter,
    /// Failed to create GPU device.
    DeviceCreation(wgpu::RequestDeviceError),
    /// Failed to map buffer for reading.
    BufferMapping(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NoAdapter => write!(f, "No compatible GPU adapter found. Ensure your system has a GPU with WebGPU/Vulkan/Metal/DX12 support."),
            GpuError::DeviceCreation(e) => write!(f, "Failed to create GPU device: {}", e),
            GpuError::BufferMapping(msg) => write!(f, "Failed to map GPU buffer: {}", msg),
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::DeviceCreation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<wgpu::RequestDeviceError> for GpuError {
    fn from(e: wgpu::RequestDeviceError) -> Self {
        GpuError::DeviceCreation(e)
    }
}

/// Errors that abort a simulation step or its setup.
#[derive(Debug)]
pub enum StepError {
    /// Invalid configuration.
    Config(ConfigError),
    /// Buffers do not fit the device.
    Capacity(CapacityError),
    /// States were run out of order.
    Ordering(OrderingViolation),
    /// GPU initialization or readback failed.
    Gpu(GpuError),
    /// An earlier step failed; the simulation state is undefined.
    Poisoned,
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Config(e) => write!(f, "Configuration error: {}", e),
            StepError::Capacity(e) => write!(f, "Capacity error: {}", e),
            StepError::Ordering(e) => write!(f, "Ordering violation: {}", e),
            StepError::Gpu(e) => write!(f, "GPU error: {}", e),
            StepError::Poisoned => {
                write!(f, "A previous step failed; the simulation cannot continue")
            }
        }
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StepError::Config(e) => Some(e),
            StepError::Capacity(e) => Some(e),
            StepError::Ordering(e) => Some(e),
            StepError::Gpu(e) => Some(e),
            StepError::Poisoned => None,
        }
    }
}

impl From<ConfigError> for StepError {
    fn from(e: ConfigError) -> Self {
        StepError::Config(e)
    }
}

impl From<CapacityError> for StepError {
    fn from(e: CapacityError) -> Self {
        StepError::Capacity(e)
    }
}

impl From<OrderingViolation> for StepError {
    fn from(e: OrderingViolation) -> Self {
        StepError::Ordering(e)
    }
}

impl From<GpuError> for StepError {
    fn from(e: GpuError) -> Self {
        StepError::Gpu(e)
    }
}

/// Errors that can occur while loading a configuration file.
#[derive(Debug)]
pub enum ConfigLoadError {
    /// Failed to read file from disk.
    Io(std::io::Error),
    /// The file is not valid configuration JSON.
    Json(serde_json::Error),
    /// The file parsed but describes an invalid configuration.
    Invalid(ConfigError),
}

impl fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigLoadError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigLoadError::Json(e) => write!(f, "Failed to parse config: {}", e),
            ConfigLoadError::Invalid(e) => write!(f, "Invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigLoadError::Io(e) => Some(e),
            ConfigLoadError::Json(e) => Some(e),
            ConfigLoadError::Invalid(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for ConfigLoadError {
    fn from(e: std::io::Error) -> Self {
        ConfigLoadError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigLoadError {
    fn from(e: serde_json::Error) -> Self {
        ConfigLoadError::Json(e)
    }
}

impl From<ConfigError> for ConfigLoadError {
    fn from(e: ConfigError) -> Self {
        ConfigLoadError::Invalid(e)
    }
}

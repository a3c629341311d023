//! GPU Architecture Description
//!
//! Hardware facts consumed by the tiling policy: warp width, the native
//! shape of the pipelined warp-level MMA, the memory bandwidth table and
//! the occupancy limits used to estimate waves. Descriptions are plain data
//! so they can be loaded from JSON or taken from a built-in preset.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// GPU architecture generation.
///
/// Variants are declared oldest first, so `arch >= GpuArch::Sm80` reads as
/// "Ampere or newer".
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum GpuArch {
    /// Volta (SM 7.0) - First tensor core support
    Sm70,
    /// Turing (SM 7.5)
    Sm75,
    /// Ampere (SM 8.0) - cp.async, mma.sync m16n8k16
    #[default]
    Sm80,
    /// Ampere (SM 8.6) - Consumer Ampere
    Sm86,
    /// Ada Lovelace (SM 8.9)
    Sm89,
    /// Hopper (SM 9.0)
    Sm90,
}

impl GpuArch {
    /// Every known generation, oldest first
    pub const ALL: [GpuArch; 6] = [
        GpuArch::Sm70,
        GpuArch::Sm75,
        GpuArch::Sm80,
        GpuArch::Sm86,
        GpuArch::Sm89,
        GpuArch::Sm90,
    ];

    /// Whether the generation can overlap global loads with MMA work
    /// (asynchronous copies into shared memory).
    pub fn is_ampere_or_newer(&self) -> bool {
        *self >= GpuArch::Sm80
    }

    /// Whether the generation uses the Volta-style shared-memory swizzles
    pub fn uses_volta_layouts(&self) -> bool {
        *self < GpuArch::Sm80
    }

    /// Get maximum shared memory per block (bytes)
    pub fn max_shared_memory_per_block(&self) -> usize {
        match self {
            GpuArch::Sm70 => 96 * 1024,
            GpuArch::Sm75 => 64 * 1024,
            GpuArch::Sm80 => 163 * 1024,
            GpuArch::Sm86 => 99 * 1024,
            GpuArch::Sm89 => 99 * 1024,
            GpuArch::Sm90 => 227 * 1024,
        }
    }

    /// Get number of SMs (approximate for target)
    pub fn typical_sm_count(&self) -> usize {
        match self {
            GpuArch::Sm70 => 80,  // V100
            GpuArch::Sm75 => 40,  // T4
            GpuArch::Sm80 => 108, // A100
            GpuArch::Sm86 => 82,  // RTX 3090
            GpuArch::Sm89 => 128, // RTX 4090
            GpuArch::Sm90 => 132, // H100
        }
    }

    /// Global / shared bandwidth in GB/s, per SM for shared memory
    fn typical_bandwidth(&self) -> [f64; 2] {
        match self {
            GpuArch::Sm70 => [750.0, 12080.0],
            GpuArch::Sm75 => [320.0, 8000.0],
            GpuArch::Sm80 => [1555.0, 19490.0],
            GpuArch::Sm86 => [936.0, 14250.0],
            GpuArch::Sm89 => [1008.0, 18200.0],
            GpuArch::Sm90 => [3350.0, 33500.0],
        }
    }

    /// Get compute capability string
    pub fn compute_capability(&self) -> &'static str {
        match self {
            GpuArch::Sm70 => "70",
            GpuArch::Sm75 => "75",
            GpuArch::Sm80 => "80",
            GpuArch::Sm86 => "86",
            GpuArch::Sm89 => "89",
            GpuArch::Sm90 => "90",
        }
    }

    /// Parse a compute capability such as `"80"`, `"8.0"` or `"sm_80"`
    pub fn from_compute_capability(cc: &str) -> Option<GpuArch> {
        let digits: String = cc
            .trim()
            .trim_start_matches("sm_")
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        GpuArch::ALL
            .into_iter()
            .find(|arch| arch.compute_capability() == digits)
    }

    /// Get PTX architecture string
    pub fn ptx_arch(&self) -> &'static str {
        match self {
            GpuArch::Sm70 => "sm_70",
            GpuArch::Sm75 => "sm_75",
            GpuArch::Sm80 => "sm_80",
            GpuArch::Sm86 => "sm_86",
            GpuArch::Sm89 => "sm_89",
            GpuArch::Sm90 => "sm_90",
        }
    }
}

impl fmt::Display for GpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ptx_arch())
    }
}

/// Runtime platform the kernels are generated for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Cuda,
    Rocm,
}

/// Element type of a staged tensor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataType {
    #[default]
    #[serde(rename = "float16")]
    Half,
    #[serde(rename = "bfloat16")]
    BFloat16,
    #[serde(rename = "float32")]
    Float,
    #[serde(rename = "int8")]
    Int8,
    #[serde(rename = "int32")]
    Int32,
}

impl DataType {
    /// Get size in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::Int8 => 1,
            DataType::Half | DataType::BFloat16 => 2,
            DataType::Float | DataType::Int32 => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArchError {
    #[error("cannot read architecture description {path}: {message}")]
    Io { path: String, message: String },

    #[error("malformed architecture description: {0}")]
    Parse(String),

    #[error("invalid architecture description: {0}")]
    Invalid(String),
}

/// Hardware description handed to the tiling policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Arch {
    /// Human-readable device name
    pub name: String,
    /// Architecture generation
    pub target: GpuArch,
    #[serde(default)]
    pub platform: Platform,
    /// Threads per warp
    pub warp_size: usize,
    /// Native (M, N, K) shape of the pipelined warp-level MMA
    pub pipelined_mma: [usize; 3],
    /// Bandwidth per memory level: `[global, shared]`
    pub bandwidth: [f64; 2],
    /// Number of streaming multiprocessors
    pub sm_count: usize,
    /// Shared memory available to one block (bytes)
    pub smem_capacity: usize,
    /// Resident block limit per SM
    pub max_blocks_per_sm: usize,
    /// L2 cache size used when sizing rasterization panels (bytes)
    pub l2_cache_bytes: usize,
}

impl Arch {
    /// Built-in description for a generation
    pub fn preset(target: GpuArch) -> Self {
        let name = match target {
            GpuArch::Sm70 => "V100",
            GpuArch::Sm75 => "T4",
            GpuArch::Sm80 => "A100",
            GpuArch::Sm86 => "RTX3090",
            GpuArch::Sm89 => "RTX4090",
            GpuArch::Sm90 => "H100",
        };
        Self {
            name: name.to_string(),
            target,
            platform: Platform::Cuda,
            warp_size: 32,
            pipelined_mma: [16, 8, 16],
            bandwidth: target.typical_bandwidth(),
            sm_count: target.typical_sm_count(),
            smem_capacity: target.max_shared_memory_per_block(),
            max_blocks_per_sm: 32,
            l2_cache_bytes: 25 * 1024 * 1024,
        }
    }

    /// Parse and validate a JSON description
    pub fn from_json_str(json: &str) -> Result<Self, ArchError> {
        let arch: Arch =
            serde_json::from_str(json).map_err(|e| ArchError::Parse(e.to_string()))?;
        arch.validate()?;
        Ok(arch)
    }

    /// Load a JSON description from disk
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ArchError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ArchError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    /// Reject descriptions the policy cannot reason about
    pub fn validate(&self) -> Result<(), ArchError> {
        if self.warp_size == 0 {
            return Err(ArchError::Invalid("warp_size must be positive".into()));
        }
        if self.pipelined_mma.iter().any(|&d| d == 0) {
            return Err(ArchError::Invalid(format!(
                "pipelined_mma {:?} has a zero extent",
                self.pipelined_mma
            )));
        }
        // Warp tiles built from the native shape feed the 8x8 accumulator
        if self.pipelined_mma[0] % 8 != 0 || self.pipelined_mma[1] % 8 != 0 {
            return Err(ArchError::Invalid(format!(
                "pipelined_mma {:?} must be a multiple of 8 in M and N",
                self.pipelined_mma
            )));
        }
        if self.bandwidth.iter().any(|b| !b.is_finite() || *b <= 0.0) {
            return Err(ArchError::Invalid(format!(
                "bandwidth {:?} must be positive",
                self.bandwidth
            )));
        }
        if self.sm_count == 0 || self.max_blocks_per_sm == 0 || self.smem_capacity == 0 {
            return Err(ArchError::Invalid(
                "sm_count, max_blocks_per_sm and smem_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Shared-memory bandwidth, the denominator of warp-tile scores
    pub fn shared_bandwidth(&self) -> f64 {
        self.bandwidth[1]
    }

    pub fn is_ampere_or_newer(&self) -> bool {
        self.target.is_ampere_or_newer()
    }
}

impl Default for Arch {
    fn default() -> Self {
        Self::preset(GpuArch::default())
    }
}

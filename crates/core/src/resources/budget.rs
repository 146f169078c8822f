//! Resource budget presets and configuration.

use serde::{Deserialize, Serialize};

const GIB: u64 = 1024 * 1024 * 1024;
const KIB: u64 = 1024;

/// Environment-specific starting point for the budget.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPreset {
    /// Developer machine or dedicated host.
    #[default]
    Local,
    /// Constrained shared/sandboxed cloud execution.
    Cloud,
}

/// Effective resource ceilings, read-only at runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceBudget {
    pub max_concurrent_chunks: u64,
    pub max_scratch_bytes: u64,
    pub estimated_bytes_per_item: u64,
    /// Items per chunk when a job is partitioned.
    pub chunk_item_count: u64,
}

impl ResourceBudget {
    pub fn local() -> Self {
        Self {
            max_concurrent_chunks: 4,
            max_scratch_bytes: 10 * GIB,
            estimated_bytes_per_item: 512 * KIB,
            chunk_item_count: 500,
        }
    }

    pub fn cloud() -> Self {
        Self {
            max_concurrent_chunks: 2,
            max_scratch_bytes: 2 * GIB,
            estimated_bytes_per_item: 512 * KIB,
            chunk_item_count: 250,
        }
    }

    pub fn for_preset(preset: BudgetPreset) -> Self {
        match preset {
            BudgetPreset::Local => Self::local(),
            BudgetPreset::Cloud => Self::cloud(),
        }
    }

    /// Scratch bytes a chunk of `item_count` items reserves while active.
    pub fn required_bytes(&self, item_count: u64) -> u64 {
        item_count.saturating_mul(self.estimated_bytes_per_item)
    }
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self::local()
    }
}

/// `[budget]` section: a preset plus optional per-field overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub preset: BudgetPreset,
    #[serde(default)]
    pub max_concurrent_chunks: Option<u64>,
    #[serde(default)]
    pub max_scratch_bytes: Option<u64>,
    #[serde(default)]
    pub estimated_bytes_per_item: Option<u64>,
    #[serde(default)]
    pub chunk_item_count: Option<u64>,
}

impl BudgetConfig {
    /// Applies the overrides on top of the preset.
    pub fn resolve(&self) -> ResourceBudget {
        let base = ResourceBudget::for_preset(self.preset);
        ResourceBudget {
            max_concurrent_chunks: self
                .max_concurrent_chunks
                .unwrap_or(base.max_concurrent_chunks),
            max_scratch_bytes: self.max_scratch_bytes.unwrap_or(base.max_scratch_bytes),
            estimated_bytes_per_item: self
                .estimated_bytes_per_item
                .unwrap_or(base.estimated_bytes_per_item),
            chunk_item_count: self.chunk_item_count.unwrap_or(base.chunk_item_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_fit_one_chunk() {
        for budget in [ResourceBudget::local(), ResourceBudget::cloud()] {
            assert!(budget.required_bytes(budget.chunk_item_count) <= budget.max_scratch_bytes);
        }
        assert!(ResourceBudget::cloud().max_concurrent_chunks < ResourceBudget::local().max_concurrent_chunks);
    }

    #[test]
    fn test_required_bytes_saturates() {
        let budget = ResourceBudget::local();
        assert_eq!(budget.required_bytes(2), 1024 * 1024);
        assert_eq!(budget.required_bytes(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_resolve_overrides() {
        let config = BudgetConfig {
            preset: BudgetPreset::Cloud,
            chunk_item_count: Some(100),
            ..Default::default()
        };
        let budget = config.resolve();
        assert_eq!(budget.chunk_item_count, 100);
        assert_eq!(budget.max_concurrent_chunks, 2);
    }
}

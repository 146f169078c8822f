//! Resource budget, monitoring and admission control.

mod admission;
mod budget;
mod monitor;

pub use admission::{AdmissionController, AdmissionDecision, DenyReason};
pub use budget::{BudgetConfig, BudgetPreset, ResourceBudget};
pub use monitor::{Measurement, ResourceMonitor, ResourceSnapshot};

/// Data layer: stores, basins, feature access and filtering.
///
/// Architecture:
/// ```text
///  .parquet / .json / .csv / .tsv
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  open file → local provider + config + basin list
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐     ┌──────────────┐
///   │  chain    │ ──▶ │ basin (lazy)  │  local first, then basins by priority
///   └──────────┘     └──────────────┘
///        │
///        ▼
///   ┌──────────┐
///   │ accessor  │  length checks, scalar cache, per-event array cache
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  filter   │  manual mask ∧ criteria → included events
///   └──────────┘
/// ```

pub mod accessor;
pub mod basin;
pub mod chain;
pub mod filter;
pub mod loader;
pub mod model;
pub mod parquet_store;
pub mod provider;

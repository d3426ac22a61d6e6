//! Pricing, model mapping and the quota ledger.

pub mod ledger;
pub mod mapping;
pub mod pricing;
pub mod pricing_store;

pub use ledger::{AuditEntry, LedgerEffect, LedgerError, LogRecord, LogType};
pub use mapping::{parse_mapping_table, resolve_model_mapping, MappingError, ResolvedModel};
pub use pricing::{
    resolve_pricing, BillingHints, PricingContext, PricingTable, Surcharge, SurchargeKind,
    FALLBACK_MODEL_PRICE, QUOTA_PER_UNIT,
};
pub use pricing_store::{PricingStore, SharedPricingStore};

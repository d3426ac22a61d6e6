//! Price tables and the per-submission pricing computation.
//!
//! `finalRatio = modelPrice × (userGroupRatio | groupRatio) × ∏ otherRatios`,
//! except for fixed-price (per-call) models which skip `otherRatios`.
//! Additive surcharges are priced separately and summed into the quota.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Quota units per one currency unit of price.
pub const QUOTA_PER_UNIT: f64 = 500_000.0;

/// Last-resort per-call price when a model has no configured or built-in price.
pub const FALLBACK_MODEL_PRICE: f64 = 0.1;

/// Billing inputs an adaptor derives while validating a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BillingHints {
    /// Multiplicative factors keyed by billing dimension (`seconds`, `size`, ...).
    pub other_ratios: BTreeMap<String, f64>,
    pub surcharges: Vec<Surcharge>,
}

impl BillingHints {
    pub fn ratio(mut self, key: impl Into<String>, value: f64) -> Self {
        self.other_ratios.insert(key.into(), value);
        self
    }

    pub fn surcharge(mut self, surcharge: Surcharge) -> Self {
        self.surcharges.push(surcharge);
        self
    }

    /// Merge `other` into `self`; entries from `other` win.
    pub fn merge(&mut self, other: BillingHints) {
        self.other_ratios.extend(other.other_ratios);
        self.surcharges.extend(other.surcharges);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurchargeKind {
    InputImage,
    InputVideo,
}

impl SurchargeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputImage => "input_image",
            Self::InputVideo => "input_video",
        }
    }
}

/// Flat fee added on top of the ratio-priced amount.
#[derive(Debug, Clone, PartialEq)]
pub struct Surcharge {
    pub kind: SurchargeKind,
    /// Price per unit (per image, per second, ...).
    pub unit_price: f64,
    pub units: f64,
}

/// Configurable price tables. Persisted as `pricing.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    /// Price per call (or per unit of `otherRatios`) by model.
    #[serde(default)]
    pub model_price: HashMap<String, f64>,
    /// Quota per usage token, for token-metered settlement.
    #[serde(default)]
    pub model_ratio: HashMap<String, f64>,
    #[serde(default)]
    pub group_ratio: HashMap<String, f64>,
    /// `user_group -> using_group -> ratio`; overrides `group_ratio` when present.
    #[serde(default)]
    pub group_group_ratio: HashMap<String, HashMap<String, f64>>,
    /// Models billed strictly per call.
    #[serde(default)]
    pub fixed_price_models: HashSet<String>,
}

/// Where a model price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Configured,
    BuiltinDefault,
    Fallback,
}

/// Built-in prices for the models of the shipped adaptors.
fn builtin_model_price(model: &str) -> Option<f64> {
    let price = match model {
        "grok-imagine-video" => 0.05,
        "sora-2" => 0.1,
        "sora-2-pro" => 0.3,
        "doubao-seedance-1-0-pro-250528" => 0.3,
        "doubao-seedance-1-0-lite-t2v-250428" | "doubao-seedance-1-0-lite-i2v-250428" => 0.2,
        _ => return None,
    };
    Some(price)
}

impl PricingTable {
    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratio.get(group).copied().unwrap_or(1.0)
    }

    pub fn user_group_ratio(&self, user_group: &str, using_group: &str) -> Option<f64> {
        self.group_group_ratio
            .get(user_group)
            .and_then(|m| m.get(using_group))
            .copied()
    }

    /// User-group ratio when configured, otherwise the plain group ratio.
    pub fn effective_group_ratio(&self, user_group: &str, using_group: &str) -> f64 {
        self.user_group_ratio(user_group, using_group)
            .unwrap_or_else(|| self.group_ratio(using_group))
    }

    /// Configured token ratio. Only positive values count.
    pub fn model_ratio(&self, model: &str) -> Option<f64> {
        self.model_ratio.get(model).copied().filter(|r| *r > 0.0)
    }

    pub fn is_fixed_price(&self, model: &str) -> bool {
        self.fixed_price_models.contains(model)
    }

    pub fn model_price(&self, model: &str) -> (f64, PriceSource) {
        if let Some(price) = self.model_price.get(model) {
            return (*price, PriceSource::Configured);
        }
        if let Some(price) = builtin_model_price(model) {
            return (price, PriceSource::BuiltinDefault);
        }
        (FALLBACK_MODEL_PRICE, PriceSource::Fallback)
    }
}

/// A surcharge after pricing.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedSurcharge {
    pub surcharge: Surcharge,
    pub quota: i64,
}

/// Pricing computed once per submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingContext {
    pub model_name: String,
    pub group: String,
    pub model_price: f64,
    pub price_source: PriceSource,
    pub group_ratio: f64,
    pub user_group_ratio: Option<f64>,
    pub other_ratios: BTreeMap<String, f64>,
    pub fixed_price: bool,
    pub final_ratio: f64,
    pub surcharges: Vec<AppliedSurcharge>,
    /// Integer amount to reserve.
    pub quota: i64,
}

impl PricingContext {
    pub fn effective_group_ratio(&self) -> f64 {
        self.user_group_ratio.unwrap_or(self.group_ratio)
    }

    pub fn is_fallback(&self) -> bool {
        self.price_source == PriceSource::Fallback
    }

    /// Ratios that actually changed the price.
    fn effective_ratios(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.other_ratios.iter().filter(|(_, r)| **r != 1.0)
    }

    /// Human-readable billing rationale for the consume log.
    pub fn describe(&self, action: &str) -> String {
        let mut content = format!("Action {}", action);
        if self.fixed_price {
            content.push_str(", billed per call");
        } else {
            let parts: Vec<String> = self
                .effective_ratios()
                .map(|(k, r)| format!("{}: {:.2}", k, r))
                .collect();
            if !parts.is_empty() {
                content.push_str(&format!(", ratios: {}", parts.join(", ")));
            }
        }
        for applied in &self.surcharges {
            content.push_str(&format!(
                ", {} {} x ${:.4}",
                applied.surcharge.kind.as_str(),
                applied.surcharge.units,
                applied.surcharge.unit_price
            ));
        }
        if self.is_fallback() {
            content.push_str(", default price");
        }
        content
    }

    /// Structured pricing context for the audit log `other` map.
    pub fn audit_other(&self) -> Map<String, Value> {
        let mut other = Map::new();
        other.insert("model_price".into(), json!(self.model_price));
        other.insert("group_ratio".into(), json!(self.group_ratio));
        if let Some(ratio) = self.user_group_ratio {
            other.insert("user_group_ratio".into(), json!(ratio));
        }
        if !self.fixed_price && !self.other_ratios.is_empty() {
            other.insert("other_ratios".into(), json!(self.other_ratios));
        }
        if self.fixed_price {
            other.insert("per_call".into(), json!(true));
        }
        for applied in &self.surcharges {
            let kind = applied.surcharge.kind.as_str();
            other.insert(kind.to_string(), json!(true));
            other.insert(format!("{}_units", kind), json!(applied.surcharge.units));
            other.insert(format!("{}_price", kind), json!(applied.surcharge.unit_price));
        }
        if self.is_fallback() {
            other.insert("default_price".into(), json!(true));
        }
        other
    }
}

/// Compute the reservation for a submission.
pub fn resolve_pricing(
    table: &PricingTable,
    model_name: &str,
    using_group: &str,
    user_group: &str,
    hints: &BillingHints,
) -> PricingContext {
    let (model_price, price_source) = table.model_price(model_name);
    if price_source == PriceSource::Fallback {
        tracing::warn!(
            "No price configured for model {}; charging fallback price {:.4} per call",
            model_name,
            model_price
        );
    }

    let group_ratio = table.group_ratio(using_group);
    let user_group_ratio = table.user_group_ratio(user_group, using_group);
    let fixed_price = table.is_fixed_price(model_name);

    let mut final_ratio = model_price * user_group_ratio.unwrap_or(group_ratio);
    if !fixed_price {
        for ratio in hints.other_ratios.values() {
            if *ratio != 1.0 {
                final_ratio *= ratio;
            }
        }
    }

    let effective_group_ratio = user_group_ratio.unwrap_or(group_ratio);
    let surcharges: Vec<AppliedSurcharge> = hints
        .surcharges
        .iter()
        .filter(|s| s.units > 0.0 && s.unit_price > 0.0)
        .map(|s| AppliedSurcharge {
            surcharge: s.clone(),
            quota: (s.unit_price * s.units * effective_group_ratio * QUOTA_PER_UNIT) as i64,
        })
        .collect();

    let quota = (final_ratio * QUOTA_PER_UNIT) as i64 + surcharges.iter().map(|s| s.quota).sum::<i64>();

    tracing::debug!(
        "model: {}, model_price: {:.4}, group: {}, group_ratio: {:.4}, final_ratio: {:.4}, quota: {}",
        model_name,
        model_price,
        using_group,
        group_ratio,
        final_ratio,
        quota
    );

    PricingContext {
        model_name: model_name.to_string(),
        group: using_group.to_string(),
        model_price,
        price_source,
        group_ratio,
        user_group_ratio,
        other_ratios: hints.other_ratios.clone(),
        fixed_price,
        final_ratio,
        surcharges,
        quota,
    }
}

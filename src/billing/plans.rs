//! The plan catalog.
//!
//! Three plans exist: FREE, MONTHLY and YEARLY. The catalog maps the payment
//! provider's price ids onto them and is fixed once built.
//!
//! ```rust,ignore
//! use plansync::billing::{PlanCatalog, PlanName};
//!
//! let catalog = PlanCatalog::builder()
//!     .plan(PlanName::Free)
//!         .features(["Public profile", "Up to 3 photos"])
//!         .done()
//!     .plan(PlanName::Monthly)
//!         .external_price("price_monthly")
//!         .price(1499)
//!         .features(["Unlimited photos", "See who liked you"])
//!         .done()
//!     .plan(PlanName::Yearly)
//!         .external_price("price_yearly")
//!         .price(11988)
//!         .popular()
//!         .done()
//!     .build();
//!
//! let plan = catalog.resolve_by_external_price_id("price_monthly")?;
//! assert_eq!(plan.name, PlanName::Monthly);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{BillingError, BillingResult};
use crate::config::CatalogConfig;

/// One of the three plans a user can be on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanName {
    Free,
    Monthly,
    Yearly,
}

impl PlanName {
    /// All plans in display order.
    pub const ALL: [PlanName; 3] = [PlanName::Free, PlanName::Monthly, PlanName::Yearly];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Monthly => "MONTHLY",
            Self::Yearly => "YEARLY",
        }
    }

    #[must_use]
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl fmt::Display for PlanName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown plan name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown plan name: {0}")]
pub struct PlanNameParseError(pub String);

impl FromStr for PlanName {
    type Err = PlanNameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(Self::Free),
            "MONTHLY" => Ok(Self::Monthly),
            "YEARLY" => Ok(Self::Yearly),
            _ => Err(PlanNameParseError(s.to_string())),
        }
    }
}

/// How often a plan bills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanInterval {
    None,
    Month,
    Year,
}

impl PlanInterval {
    fn for_plan(name: PlanName) -> Self {
        match name {
            PlanName::Free => Self::None,
            PlanName::Monthly => Self::Month,
            PlanName::Yearly => Self::Year,
        }
    }
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub name: PlanName,
    /// Provider price id. Always `None` for FREE.
    pub external_price_id: Option<String>,
    /// Price per interval in minor currency units.
    pub price: u64,
    pub currency: String,
    pub interval: PlanInterval,
    pub is_popular: bool,
    /// Feature bullets in display order.
    pub features: Vec<String>,
}

impl Plan {
    fn empty(name: PlanName) -> Self {
        Self {
            name,
            external_price_id: None,
            price: 0,
            currency: "usd".to_string(),
            interval: PlanInterval::for_plan(name),
            is_popular: false,
            features: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.name == PlanName::Free
    }

    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    /// Price formatted for display, e.g. `"14.99 USD"`.
    #[must_use]
    pub fn formatted_price(&self) -> String {
        format!(
            "{}.{:02} {}",
            self.price / 100,
            self.price % 100,
            self.currency.to_uppercase()
        )
    }
}

/// The fixed set of plans.
///
/// Every [`PlanName`] always has an entry, so lookups by name cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCatalog {
    free: Plan,
    monthly: Plan,
    yearly: Plan,
}

impl PlanCatalog {
    #[must_use]
    pub fn builder() -> PlanCatalogBuilder {
        PlanCatalogBuilder::new()
    }

    /// Build the catalog from configuration.
    pub fn from_config(config: &CatalogConfig) -> BillingResult<Self> {
        let catalog = Self::builder()
            .plan(PlanName::Free)
            .currency(&config.currency)
            .features(config.free_features.iter().map(String::as_str))
            .done()
            .plan(PlanName::Monthly)
            .external_price(&config.monthly_price_id)
            .price(config.monthly_price)
            .currency(&config.currency)
            .features(config.paid_features.iter().map(String::as_str))
            .done()
            .plan(PlanName::Yearly)
            .external_price(&config.yearly_price_id)
            .price(config.yearly_price)
            .currency(&config.currency)
            .features(config.paid_features.iter().map(String::as_str))
            .popular()
            .done()
            .build();
        catalog.validate()?;
        Ok(catalog)
    }

    /// Map a provider price id to its plan.
    ///
    /// FREE has no price id and is never returned here.
    pub fn resolve_by_external_price_id(&self, price_id: &str) -> BillingResult<&Plan> {
        self.iter()
            .find(|plan| plan.external_price_id.as_deref() == Some(price_id))
            .ok_or_else(|| BillingError::UnresolvablePlan {
                price_id: price_id.to_string(),
            })
    }

    #[must_use]
    pub fn resolve_by_name(&self, name: PlanName) -> &Plan {
        match name {
            PlanName::Free => &self.free,
            PlanName::Monthly => &self.monthly,
            PlanName::Yearly => &self.yearly,
        }
    }

    /// Plans in display order.
    pub fn iter(&self) -> impl Iterator<Item = &Plan> {
        [&self.free, &self.monthly, &self.yearly].into_iter()
    }

    #[must_use]
    pub fn external_price_ids(&self) -> Vec<&str> {
        self.iter()
            .filter_map(|p| p.external_price_id.as_deref())
            .collect()
    }

    /// Savings of YEARLY against twelve months of MONTHLY, in whole percent.
    #[must_use]
    pub fn yearly_savings_percent(&self) -> u8 {
        let twelve_months = self.monthly.price.saturating_mul(12);
        if twelve_months == 0 || self.yearly.price >= twelve_months {
            return 0;
        }
        let saved = twelve_months - self.yearly.price;
        u8::try_from(saved * 100 / twelve_months).unwrap_or(100)
    }

    /// Check that paid plans are purchasable and price ids are unambiguous.
    pub fn validate(&self) -> BillingResult<()> {
        let mut seen = HashSet::new();
        for plan in self.iter() {
            match (&plan.external_price_id, plan.name.is_paid()) {
                (None, true) => {
                    return Err(BillingError::Internal {
                        message: format!("plan {} has no external price id", plan.name),
                    });
                }
                (Some(id), _) if id.is_empty() => {
                    return Err(BillingError::Internal {
                        message: format!("plan {} has an empty external price id", plan.name),
                    });
                }
                (Some(id), _) if !seen.insert(id.as_str()) => {
                    return Err(BillingError::Internal {
                        message: format!("external price id {} is used by more than one plan", id),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Builder for [`PlanCatalog`].
#[derive(Debug)]
pub struct PlanCatalogBuilder {
    free: Plan,
    monthly: Plan,
    yearly: Plan,
}

impl PlanCatalogBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            free: Plan::empty(PlanName::Free),
            monthly: Plan::empty(PlanName::Monthly),
            yearly: Plan::empty(PlanName::Yearly),
        }
    }

    /// Start configuring a plan.
    #[must_use]
    pub fn plan(mut self, name: PlanName) -> PlanBuilder {
        let plan = std::mem::replace(self.slot(name), Plan::empty(name));
        PlanBuilder { parent: self, plan }
    }

    #[must_use]
    pub fn build(mut self) -> PlanCatalog {
        self.free.external_price_id = None;
        self.free.price = 0;
        PlanCatalog {
            free: self.free,
            monthly: self.monthly,
            yearly: self.yearly,
        }
    }

    fn slot(&mut self, name: PlanName) -> &mut Plan {
        match name {
            PlanName::Free => &mut self.free,
            PlanName::Monthly => &mut self.monthly,
            PlanName::Yearly => &mut self.yearly,
        }
    }
}

impl Default for PlanCatalogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a single plan.
#[derive(Debug)]
pub struct PlanBuilder {
    parent: PlanCatalogBuilder,
    plan: Plan,
}

impl PlanBuilder {
    #[must_use]
    pub fn external_price(mut self, price_id: &str) -> Self {
        self.plan.external_price_id = Some(price_id.to_string());
        self
    }

    /// Price in minor currency units.
    #[must_use]
    pub fn price(mut self, amount: u64) -> Self {
        self.plan.price = amount;
        self
    }

    #[must_use]
    pub fn currency(mut self, currency: &str) -> Self {
        self.plan.currency = currency.to_lowercase();
        self
    }

    #[must_use]
    pub fn popular(mut self) -> Self {
        self.plan.is_popular = true;
        self
    }

    #[must_use]
    pub fn features<'a, I>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.plan.features = features.into_iter().map(str::to_string).collect();
        self
    }

    /// Finish this plan and return to the catalog builder.
    #[must_use]
    pub fn done(mut self) -> PlanCatalogBuilder {
        let name = self.plan.name;
        *self.parent.slot(name) = self.plan;
        self.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PlanCatalog {
        PlanCatalog::builder()
            .plan(PlanName::Free)
            .features(["Public profile", "Up to 3 photos"])
            .done()
            .plan(PlanName::Monthly)
            .external_price("price_monthly")
            .price(1500)
            .done()
            .plan(PlanName::Yearly)
            .external_price("price_yearly")
            .price(12000)
            .popular()
            .done()
            .build()
    }

    #[test]
    fn test_resolve_by_external_price_id() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve_by_external_price_id("price_monthly").unwrap().name,
            PlanName::Monthly
        );
        assert_eq!(
            catalog.resolve_by_external_price_id("price_yearly").unwrap().name,
            PlanName::Yearly
        );
    }

    #[test]
    fn test_unknown_price_is_unresolvable() {
        let err = catalog()
            .resolve_by_external_price_id("price_from_2019")
            .unwrap_err();
        assert_eq!(
            err,
            BillingError::UnresolvablePlan {
                price_id: "price_from_2019".to_string()
            }
        );
    }

    #[test]
    fn test_free_never_resolves_by_price() {
        let catalog = PlanCatalog::builder()
            .plan(PlanName::Free)
            .external_price("price_free")
            .price(999)
            .done()
            .build();

        let free = catalog.resolve_by_name(PlanName::Free);
        assert!(free.external_price_id.is_none());
        assert_eq!(free.price, 0);
        assert!(catalog.resolve_by_external_price_id("price_free").is_err());
    }

    #[test]
    fn test_resolve_by_name_covers_all_plans() {
        let catalog = catalog();
        for name in PlanName::ALL {
            assert_eq!(catalog.resolve_by_name(name).name, name);
        }
        assert!(catalog.resolve_by_name(PlanName::Free).has_feature("Up to 3 photos"));
    }

    #[test]
    fn test_yearly_savings() {
        assert_eq!(catalog().yearly_savings_percent(), 33);
    }

    #[test]
    fn test_validate_rejects_duplicate_price_ids() {
        let catalog = PlanCatalog::builder()
            .plan(PlanName::Monthly)
            .external_price("price_same")
            .done()
            .plan(PlanName::Yearly)
            .external_price("price_same")
            .done()
            .build();
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn test_validate_requires_paid_prices() {
        let empty = PlanCatalog::builder().build();
        assert!(empty.validate().is_err());
        assert!(catalog().validate().is_ok());
    }

    #[test]
    fn test_plan_name_parsing() {
        assert_eq!("monthly".parse::<PlanName>().unwrap(), PlanName::Monthly);
        assert_eq!(" YEARLY ".parse::<PlanName>().unwrap(), PlanName::Yearly);
        assert!("weekly".parse::<PlanName>().is_err());
        assert_eq!(serde_json::to_string(&PlanName::Free).unwrap(), "\"FREE\"");
    }

    #[test]
    fn test_formatted_price() {
        assert_eq!(
            catalog().resolve_by_name(PlanName::Monthly).formatted_price(),
            "15.00 USD"
        );
    }
}

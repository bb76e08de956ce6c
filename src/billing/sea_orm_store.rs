//! SeaORM-backed billing storage.
//!
//! Subscriptions and processed webhook ids live in their own tables; the plan
//! flag is the `subscription_type` column of the application's `users` table,
//! guarded by a `billing_version` column on the same table.
//! [`BillingStore::commit_sync`] writes both inside one transaction.
//!
//! # Example
//!
//! ```rust,ignore
//! use plansync::billing::SeaOrmBillingStore;
//!
//! let store = SeaOrmBillingStore::new(db.clone());
//! let manager = BillingManager::builder(store, catalog)
//!     // ...
//!     .build()?;
//! ```

use async_trait::async_trait;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, TransactionTrait, sea_query::{Expr, OnConflict},
};

use super::error::{BillingError, BillingResult};
use super::plans::PlanName;
use super::storage::{BillingStore, StoredSubscription, SubscriptionStatus, SyncWrite, UserRecord};
use crate::utils::unix_now;

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    pub mod user {
        use sea_orm::entity::prelude::*;

        /// The columns of the application's users table that billing touches.
        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "users")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            pub subscription_type: String,
            pub email: Option<String>,
            pub billing_version: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod billing_subscription {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_subscriptions")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            #[sea_orm(indexed)]
            pub reference_id: String,
            pub plan: String,
            pub status: String,
            pub period_end: Option<i64>,
            pub external_customer_id: Option<String>,
            pub last_event_at: Option<i64>,
            /// Compare-and-swap token for `commit_sync`.
            pub version: i64,
            pub created_at: i64,
            pub updated_at: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod billing_processed_event {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_processed_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub event_id: String,
            pub processed_at: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{billing_processed_event, billing_subscription, user};

// =============================================================================
// Helper Functions
// =============================================================================

/// Convert i64 to u64 safely (negative values become 0).
#[inline]
fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Convert u64 to i64 safely (values > i64::MAX become i64::MAX).
#[inline]
fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_plan(raw: &str) -> BillingResult<PlanName> {
    raw.parse()
        .map_err(|e| BillingError::storage(format!("stored plan {:?}: {}", raw, e)))
}

fn model_to_stored_subscription(
    model: billing_subscription::Model,
) -> BillingResult<StoredSubscription> {
    let status = SubscriptionStatus::from_provider(&model.status)
        .ok_or_else(|| BillingError::storage(format!("stored status {:?} is not recognized", model.status)))?;

    Ok(StoredSubscription {
        plan: parse_plan(&model.plan)?,
        status,
        id: model.id,
        reference_id: model.reference_id,
        period_end: model.period_end.map(i64_to_u64),
        external_customer_id: model.external_customer_id,
        last_event_at: model.last_event_at.map(i64_to_u64),
        version: i64_to_u64(model.version),
        created_at: i64_to_u64(model.created_at),
        updated_at: i64_to_u64(model.updated_at),
    })
}

fn subscription_to_active_model(subscription: &StoredSubscription) -> billing_subscription::ActiveModel {
    billing_subscription::ActiveModel {
        id: Set(subscription.id.clone()),
        reference_id: Set(subscription.reference_id.clone()),
        plan: Set(subscription.plan.as_str().to_string()),
        status: Set(subscription.status.as_str().to_string()),
        period_end: Set(subscription.period_end.map(u64_to_i64)),
        external_customer_id: Set(subscription.external_customer_id.clone()),
        last_event_at: Set(subscription.last_event_at.map(u64_to_i64)),
        version: Set(u64_to_i64(subscription.version)),
        created_at: Set(u64_to_i64(subscription.created_at)),
        updated_at: Set(u64_to_i64(subscription.updated_at)),
    }
}

fn model_to_user_record(model: user::Model) -> BillingResult<UserRecord> {
    Ok(UserRecord {
        subscription_type: parse_plan(&model.subscription_type)?,
        id: model.id,
        email: model.email,
        version: i64_to_u64(model.billing_version),
    })
}

fn partial(subscription_id: &str) -> impl Fn(DbErr) -> BillingError + '_ {
    move |e| BillingError::PartialUpdate {
        subscription_id: subscription_id.to_string(),
        message: e.to_string(),
    }
}

// =============================================================================
// SeaOrmBillingStore
// =============================================================================

/// SeaORM-backed billing store.
#[derive(Clone, Debug)]
pub struct SeaOrmBillingStore {
    db: DatabaseConnection,
}

impl SeaOrmBillingStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get a reference to the underlying database connection.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl BillingStore for SeaOrmBillingStore {
    async fn get_user(&self, user_id: &str) -> BillingResult<Option<UserRecord>> {
        let Some(model) = user::Entity::find_by_id(user_id)
            .one(&self.db)
            .await
            .map_err(BillingError::storage)?
        else {
            return Ok(None);
        };

        model_to_user_record(model).map(Some)
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<StoredSubscription>> {
        tracing::debug!(
            target: "plansync::billing::store",
            subscription_id = %subscription_id,
            "fetching subscription"
        );

        billing_subscription::Entity::find_by_id(subscription_id)
            .one(&self.db)
            .await
            .map_err(BillingError::storage)?
            .map(model_to_stored_subscription)
            .transpose()
    }

    async fn list_subscriptions_for_user(
        &self,
        reference_id: &str,
    ) -> BillingResult<Vec<StoredSubscription>> {
        billing_subscription::Entity::find()
            .filter(billing_subscription::Column::ReferenceId.eq(reference_id))
            .order_by_asc(billing_subscription::Column::Id)
            .all(&self.db)
            .await
            .map_err(BillingError::storage)?
            .into_iter()
            .map(model_to_stored_subscription)
            .collect()
    }

    async fn commit_sync(&self, write: &SyncWrite) -> BillingResult<()> {
        let subscription = &write.subscription;
        tracing::debug!(
            target: "plansync::billing::store",
            subscription_id = %subscription.id,
            expected_version = ?write.expected_version,
            expected_user_version = write.expected_user_version,
            new_version = subscription.version,
            "committing subscription sync"
        );

        // Dropping the transaction on any early return rolls it back.
        let txn = self.db.begin().await.map_err(BillingError::storage)?;

        let rows = match write.expected_version {
            Some(expected) => {
                billing_subscription::Entity::update_many()
                    .col_expr(billing_subscription::Column::Plan, Expr::value(subscription.plan.as_str()))
                    .col_expr(billing_subscription::Column::Status, Expr::value(subscription.status.as_str()))
                    .col_expr(
                        billing_subscription::Column::PeriodEnd,
                        Expr::value(subscription.period_end.map(u64_to_i64)),
                    )
                    .col_expr(
                        billing_subscription::Column::ExternalCustomerId,
                        Expr::value(subscription.external_customer_id.clone()),
                    )
                    .col_expr(
                        billing_subscription::Column::LastEventAt,
                        Expr::value(subscription.last_event_at.map(u64_to_i64)),
                    )
                    .col_expr(billing_subscription::Column::Version, Expr::value(u64_to_i64(subscription.version)))
                    .col_expr(
                        billing_subscription::Column::UpdatedAt,
                        Expr::value(u64_to_i64(subscription.updated_at)),
                    )
                    .filter(billing_subscription::Column::Id.eq(subscription.id.as_str()))
                    .filter(billing_subscription::Column::Version.eq(u64_to_i64(expected)))
                    .exec(&txn)
                    .await
                    .map_err(BillingError::storage)?
                    .rows_affected
            }
            None => billing_subscription::Entity::insert(subscription_to_active_model(subscription))
                .on_conflict(
                    OnConflict::column(billing_subscription::Column::Id)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&txn)
                .await
                .map_err(BillingError::storage)?,
        };
        if rows == 0 {
            tracing::debug!(
                target: "plansync::billing::store",
                subscription_id = %subscription.id,
                "version mismatch - concurrent modification detected"
            );
            return Err(BillingError::ConcurrentModification {
                subscription_id: subscription.id.clone(),
            });
        }

        let updated = user::Entity::update_many()
            .col_expr(user::Column::SubscriptionType, Expr::value(write.subscription_type.as_str()))
            .col_expr(
                user::Column::BillingVersion,
                Expr::value(u64_to_i64(write.expected_user_version.saturating_add(1))),
            )
            .filter(user::Column::Id.eq(subscription.reference_id.as_str()))
            .filter(user::Column::BillingVersion.eq(u64_to_i64(write.expected_user_version)))
            .exec(&txn)
            .await
            .map_err(partial(&subscription.id))?;
        if updated.rows_affected == 0 {
            let exists = user::Entity::find_by_id(subscription.reference_id.as_str())
                .one(&txn)
                .await
                .map_err(partial(&subscription.id))?
                .is_some();
            return Err(if exists {
                BillingError::ConcurrentModification {
                    subscription_id: subscription.id.clone(),
                }
            } else {
                BillingError::PartialUpdate {
                    subscription_id: subscription.id.clone(),
                    message: format!("user {} does not exist", subscription.reference_id),
                }
            });
        }

        txn.commit().await.map_err(partial(&subscription.id))?;
        Ok(())
    }

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
        let event = billing_processed_event::Entity::find_by_id(event_id)
            .one(&self.db)
            .await
            .map_err(BillingError::storage)?;

        Ok(event.is_some())
    }

    async fn mark_event_processed(&self, event_id: &str) -> BillingResult<()> {
        tracing::debug!(
            target: "plansync::billing::store",
            event_id = %event_id,
            "marking event as processed"
        );

        let event = billing_processed_event::ActiveModel {
            event_id: Set(event_id.to_string()),
            processed_at: Set(u64_to_i64(unix_now())),
        };

        billing_processed_event::Entity::insert(event)
            .on_conflict(
                OnConflict::column(billing_processed_event::Column::EventId)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await
            .map_err(BillingError::storage)?;

        Ok(())
    }

    async fn cleanup_old_events(&self, older_than_days: u32) -> BillingResult<usize> {
        let cutoff = unix_now().saturating_sub(u64::from(older_than_days) * 24 * 60 * 60);

        let result = billing_processed_event::Entity::delete_many()
            .filter(billing_processed_event::Column::ProcessedAt.lt(u64_to_i64(cutoff)))
            .exec(&self.db)
            .await
            .map_err(BillingError::storage)?;

        Ok(usize::try_from(result.rows_affected).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> billing_subscription::Model {
        billing_subscription::Model {
            id: "sub_abc".to_string(),
            reference_id: "u1".to_string(),
            plan: "YEARLY".to_string(),
            status: "past_due".to_string(),
            period_end: Some(1_702_592_000),
            external_customer_id: Some("cus_xyz".to_string()),
            last_event_at: Some(1_700_000_000),
            version: 4,
            created_at: 1_690_000_000,
            updated_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_model_to_stored_subscription() {
        let stored = model_to_stored_subscription(model()).unwrap();

        assert_eq!(stored.id, "sub_abc");
        assert_eq!(stored.reference_id, "u1");
        assert_eq!(stored.plan, PlanName::Yearly);
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
        assert_eq!(stored.period_end, Some(1_702_592_000));
        assert_eq!(stored.version, 4);
    }

    #[test]
    fn test_unknown_stored_values_are_storage_errors() {
        let mut bad_status = model();
        bad_status.status = "melted".to_string();
        assert!(matches!(
            model_to_stored_subscription(bad_status),
            Err(BillingError::Storage { .. })
        ));

        let mut bad_plan = model();
        bad_plan.plan = "PLATINUM".to_string();
        assert!(matches!(
            model_to_stored_subscription(bad_plan),
            Err(BillingError::Storage { .. })
        ));
    }

    #[test]
    fn test_active_model_round_trips_columns() {
        let stored = model_to_stored_subscription(model()).unwrap();
        let active = subscription_to_active_model(&stored);

        assert_eq!(active.plan, Set("YEARLY".to_string()));
        assert_eq!(active.status, Set("past_due".to_string()));
        assert_eq!(active.version, Set(4));
    }

    #[test]
    fn test_user_model_carries_version() {
        let user = model_to_user_record(user::Model {
            id: "u1".to_string(),
            subscription_type: "MONTHLY".to_string(),
            email: None,
            billing_version: 7,
        })
        .unwrap();

        assert_eq!(user.subscription_type, PlanName::Monthly);
        assert_eq!(user.version, 7);
    }

    #[test]
    fn test_safe_conversions() {
        assert_eq!(i64_to_u64(-5), 0);
        assert_eq!(u64_to_i64(u64::MAX), i64::MAX);
    }
}

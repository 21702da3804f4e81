//! Canonical domain model, error taxonomy, and channel registry for CWS.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cws-core";

/// Per-tenant connector configuration, created lazily on first run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: Uuid,
    pub tenant_id: String,
    pub connector_type: String,
    pub status: String,
    pub settings: Value,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Closed set of normalized order states. Every vendor status string maps
/// into exactly one of these via [`OrderStatus::normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Delivered,
    Cancelled,
    Returned,
    Shipping,
    Processing,
    Confirmed,
    Pending,
}

/// Ordered substring classification rules. Check order is a fixed contract:
/// a string matching several keyword groups resolves to the first match.
const STATUS_RULES: &[(&[&str], OrderStatus)] = &[
    (&["complete", "delivered", "finish"], OrderStatus::Delivered),
    (&["cancel"], OrderStatus::Cancelled),
    (&["return", "refund"], OrderStatus::Returned),
    (&["ship", "transit", "delivery"], OrderStatus::Shipping),
    (&["process", "ready"], OrderStatus::Processing),
    (&["confirm", "paid", "pay"], OrderStatus::Confirmed),
    (&["pending", "unpaid"], OrderStatus::Pending),
];

/// A keyword hit does not count when the occurrence is negated by an `un`
/// prefix: `unpaid` must fall through to the pending group instead of
/// matching `paid` in the confirmed group.
fn keyword_match(lowered: &str, needle: &str) -> bool {
    lowered
        .match_indices(needle)
        .any(|(idx, _)| !lowered[..idx].ends_with("un"))
}

impl OrderStatus {
    /// Total classification of arbitrary vendor status text. Unrecognized or
    /// empty input falls through to `Pending`.
    pub fn normalize(raw: &str) -> Self {
        let lowered = raw.to_ascii_lowercase();
        for (needles, status) in STATUS_RULES {
            if needles.iter().any(|needle| keyword_match(&lowered, needle)) {
                return *status;
            }
        }
        OrderStatus::Pending
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Returned => "returned",
            OrderStatus::Shipping => "shipping",
            OrderStatus::Processing => "processing",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Pending => "pending",
        }
    }
}

/// Normalized order row, keyed by (tenant_id, integration_id, external_order_id).
///
/// Monetary fields are always populated; absent source values coerce to 0 so
/// downstream arithmetic never meets a null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalOrder {
    pub tenant_id: String,
    pub integration_id: Uuid,
    pub external_order_id: String,
    pub channel: String,
    pub order_date: Option<DateTime<Utc>>,
    pub currency: String,
    pub customer_name: String,
    pub total_amount: f64,
    pub seller_income: f64,
    pub platform_fee: f64,
    pub commission_fee: f64,
    pub payment_fee: f64,
    pub service_fee: f64,
    pub total_fees: f64,
    pub shipping_fee: f64,
    pub shipping_fee_discount: f64,
    pub total_cogs: f64,
    pub net_revenue: f64,
    pub gross_profit: f64,
    pub net_profit: f64,
    pub status: OrderStatus,
    pub raw_data: Value,
}

/// Line item keyed by (tenant_id, external_order_id, item_id). Margin is
/// computed downstream, never by this pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalOrderItem {
    pub tenant_id: String,
    pub external_order_id: String,
    pub item_id: String,
    pub product_id: String,
    pub name: String,
    pub sku: String,
    pub quantity: i64,
    pub price: f64,
    pub cogs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSettlement {
    pub tenant_id: String,
    pub integration_id: Uuid,
    pub external_settlement_id: String,
    pub external_order_id: String,
    pub channel: String,
    pub amount: f64,
    pub fee: f64,
    pub payout_date: Option<DateTime<Utc>>,
    pub raw_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub tenant_id: String,
    pub integration_id: Uuid,
    pub external_product_id: String,
    pub channel: String,
    pub name: String,
    pub sku: String,
    pub price: f64,
    pub cost: f64,
    pub stock: i64,
    pub raw_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCustomer {
    pub tenant_id: String,
    pub external_customer_id: String,
    pub channel: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub region: String,
    pub raw_data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkStatus {
    Syncing,
    Completed,
    Failed,
}

/// Progress marker per (tenant_id, data_model). Only advances on success; a
/// failed attempt records the failure but keeps the prior successful value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub tenant_id: String,
    pub data_model: String,
    pub sync_status: WatermarkStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub total_records_synced: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

/// Audit row for one invocation. Created at run start, finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_fetched: i64,
    pub records_created: i64,
    pub records_failed: i64,
    pub sync_metadata: Value,
}

/// Error taxonomy for a sync run.
///
/// `Auth` aborts the whole run; `Query` is scoped to one channel; `Load` to
/// one batch; `State` to bookkeeping writes. Mapping failures never surface
/// here — malformed row data is absorbed into zero/empty defaults.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("auth: {0}")]
    Auth(String),
    #[error("query failed for channel {channel}: {message}")]
    Query { channel: String, message: String },
    #[error("load failed for table {table}: {message}")]
    Load { table: String, message: String },
    #[error("state store: {0}")]
    State(String),
}

/// Dataset/table/id-field wiring for one source channel. Pure data; these
/// values are compiled-in identifiers and are the only strings interpolated
/// into warehouse SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    pub channel: &'static str,
    pub dataset: &'static str,
    pub orders_table: &'static str,
    pub settlements_table: &'static str,
    pub products_table: &'static str,
    pub customers_table: &'static str,
    pub order_id_field: &'static str,
    pub order_ts_field: &'static str,
}

const CHANNELS: &[ChannelSpec] = &[
    ChannelSpec {
        channel: "shopee",
        dataset: "shopee_raw",
        orders_table: "orders",
        settlements_table: "wallet_transactions",
        products_table: "item_list",
        customers_table: "buyers",
        order_id_field: "order_sn",
        order_ts_field: "create_time",
    },
    ChannelSpec {
        channel: "lazada",
        dataset: "lazada_raw",
        orders_table: "orders",
        settlements_table: "transaction_details",
        products_table: "products",
        customers_table: "customers",
        order_id_field: "order_number",
        order_ts_field: "created_at",
    },
    ChannelSpec {
        channel: "tiktok",
        dataset: "tiktok_shop_raw",
        orders_table: "order_list",
        settlements_table: "settlements",
        products_table: "products",
        customers_table: "buyers",
        order_id_field: "order_id",
        order_ts_field: "create_time",
    },
];

pub struct ChannelRegistry;

impl ChannelRegistry {
    pub fn all() -> &'static [ChannelSpec] {
        CHANNELS
    }

    pub fn lookup(channel: &str) -> Option<&'static ChannelSpec> {
        CHANNELS.iter().find(|spec| spec.channel == channel)
    }

    pub fn channel_names() -> Vec<String> {
        CHANNELS.iter().map(|spec| spec.channel.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_normalization_is_total() {
        for raw in ["", "???", "SEDANG DIKIRIM", "\u{1f600}", "null"] {
            let status = OrderStatus::normalize(raw);
            assert!(matches!(
                status,
                OrderStatus::Delivered
                    | OrderStatus::Cancelled
                    | OrderStatus::Returned
                    | OrderStatus::Shipping
                    | OrderStatus::Processing
                    | OrderStatus::Confirmed
                    | OrderStatus::Pending
            ));
        }
        assert_eq!(OrderStatus::normalize(""), OrderStatus::Pending);
        assert_eq!(OrderStatus::normalize("garbage"), OrderStatus::Pending);
    }

    #[test]
    fn status_keyword_priority_is_check_order() {
        // "cancelled after shipping" matches both cancel and ship; the
        // cancel group is checked first.
        assert_eq!(
            OrderStatus::normalize("Cancelled after shipping"),
            OrderStatus::Cancelled
        );
        assert_eq!(OrderStatus::normalize("Out for delivery"), OrderStatus::Shipping);
        assert_eq!(OrderStatus::normalize("DELIVERED"), OrderStatus::Delivered);
        assert_eq!(OrderStatus::normalize("To Confirm Receive"), OrderStatus::Confirmed);
        // "refund_completed" carries both refund and complete; the delivered
        // group wins because it is checked before returns.
        assert_eq!(OrderStatus::normalize("refund_completed"), OrderStatus::Delivered);
    }

    #[test]
    fn status_common_vendor_values() {
        assert_eq!(OrderStatus::normalize("COMPLETED"), OrderStatus::Delivered);
        assert_eq!(OrderStatus::normalize("IN_CANCEL"), OrderStatus::Cancelled);
        assert_eq!(OrderStatus::normalize("RETURN_REQUESTED"), OrderStatus::Returned);
        assert_eq!(OrderStatus::normalize("in transit"), OrderStatus::Shipping);
        // the ship group sits ahead of the process/ready group, so
        // READY_TO_SHIP classifies as shipping rather than processing
        assert_eq!(OrderStatus::normalize("READY_TO_SHIP"), OrderStatus::Shipping);
        assert_eq!(OrderStatus::normalize("processing"), OrderStatus::Processing);
        assert_eq!(OrderStatus::normalize("UNPAID"), OrderStatus::Pending);
    }

    #[test]
    fn un_prefixed_keywords_do_not_leak_into_earlier_groups() {
        // "paid" occurs inside "unpaid" but the occurrence is negated, so the
        // string reaches the pending group instead of confirmed
        assert_eq!(OrderStatus::normalize("unpaid"), OrderStatus::Pending);
        assert_eq!(OrderStatus::normalize("ORDER_UNPAID"), OrderStatus::Pending);
        // a genuine paid/pay hit still resolves ahead of the pending group
        assert_eq!(OrderStatus::normalize("pending payment"), OrderStatus::Confirmed);
        assert_eq!(OrderStatus::normalize("prepaid"), OrderStatus::Confirmed);
    }

    #[test]
    fn registry_lookup_round_trip() {
        for spec in ChannelRegistry::all() {
            assert_eq!(
                ChannelRegistry::lookup(spec.channel).map(|s| s.dataset),
                Some(spec.dataset)
            );
        }
        assert!(ChannelRegistry::lookup("etsy").is_none());
    }
}

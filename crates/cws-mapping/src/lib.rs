//! Per-entity transforms from heterogeneous vendor rows into canonical
//! records. Mapping is pure and total: malformed values coerce to zero/empty
//! defaults instead of erroring, so one bad row can never abort a batch.

use chrono::{DateTime, NaiveDateTime, Utc};
use cws_core::{
    CanonicalCustomer, CanonicalOrder, CanonicalOrderItem, CanonicalProduct, CanonicalSettlement,
    OrderStatus,
};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cws-mapping";

/// Identity scope threaded through every mapping call.
#[derive(Debug, Clone)]
pub struct MapContext {
    pub tenant_id: String,
    pub integration_id: Uuid,
    pub channel: String,
}

/// Ordered vendor alias lists per canonical field. Distinct platforms name
/// the same concept differently; the first present, non-null alias wins.
/// Extending a channel means extending these tables, not the mapping code.
mod aliases {
    pub const ORDER_ID: &[&str] = &["order_sn", "order_number", "order_id", "ordersn", "id"];
    pub const ORDER_DATE: &[&str] = &["create_time", "created_at", "order_date", "create_date"];
    pub const CURRENCY: &[&str] = &["currency", "currency_code"];
    pub const CUSTOMER_NAME: &[&str] = &[
        "buyer_username",
        "customer_name",
        "buyer_name",
        "recipient_name",
    ];
    pub const TOTAL_AMOUNT: &[&str] = &[
        "total_amount",
        "order_amount",
        "grand_total",
        "total_price",
        "payment_amount",
        "price",
    ];
    pub const SELLER_INCOME: &[&str] = &[
        "seller_income",
        "escrow_amount",
        "net_amount",
        "payout_amount",
    ];
    pub const PLATFORM_FEE: &[&str] = &["platform_fee", "platform_fees", "marketplace_fee"];
    pub const COMMISSION_FEE: &[&str] = &["commission_fee", "commission", "commission_amount"];
    pub const PAYMENT_FEE: &[&str] = &[
        "payment_fee",
        "transaction_fee",
        "payment_processing_fee",
    ];
    pub const SERVICE_FEE: &[&str] = &["service_fee", "service_charge"];
    pub const SHIPPING_FEE: &[&str] = &[
        "shipping_fee",
        "actual_shipping_fee",
        "shipping_cost",
        "delivery_fee",
    ];
    pub const SHIPPING_FEE_DISCOUNT: &[&str] = &[
        "shipping_fee_discount",
        "shipping_rebate",
        "free_shipping_subsidy",
    ];
    pub const STATUS: &[&str] = &["order_status", "status", "status_desc"];
    pub const ITEMS: &[&str] = &["items", "item_list", "order_items", "line_items"];

    pub const ITEM_ID: &[&str] = &["item_id", "order_item_id", "sku_id", "id"];
    pub const ITEM_PRODUCT_ID: &[&str] = &["product_id", "item_id", "sku_id"];
    pub const ITEM_NAME: &[&str] = &["item_name", "name", "product_name", "title"];
    pub const ITEM_SKU: &[&str] = &["model_sku", "sku", "seller_sku", "sku_code"];
    pub const ITEM_QUANTITY: &[&str] = &["quantity", "qty", "model_quantity_purchased"];
    pub const ITEM_PRICE: &[&str] = &[
        "item_price",
        "model_discounted_price",
        "paid_price",
        "sale_price",
        "price",
    ];
    pub const ITEM_COGS: &[&str] = &["cogs", "unit_cost", "cost_price", "cost"];

    pub const SETTLEMENT_ID: &[&str] = &[
        "transaction_id",
        "settlement_id",
        "statement_id",
        "id",
    ];
    pub const SETTLEMENT_AMOUNT: &[&str] = &["amount", "settlement_amount", "release_amount"];
    pub const SETTLEMENT_FEE: &[&str] = &["fee", "total_fee", "fee_amount"];
    pub const SETTLEMENT_DATE: &[&str] = &[
        "payout_date",
        "release_time",
        "transaction_date",
        "created_at",
    ];

    pub const PRODUCT_ID: &[&str] = &["item_id", "product_id", "id"];
    pub const PRODUCT_NAME: &[&str] = &["item_name", "product_name", "name", "title"];
    pub const PRODUCT_SKU: &[&str] = &["item_sku", "seller_sku", "sku"];
    pub const PRODUCT_PRICE: &[&str] = &["price", "original_price", "current_price"];
    pub const PRODUCT_COST: &[&str] = &["cost", "cogs", "unit_cost"];
    pub const PRODUCT_STOCK: &[&str] = &["stock", "normal_stock", "available_stock", "quantity"];

    pub const CUSTOMER_ID: &[&str] = &["buyer_id", "customer_id", "user_id", "id"];
    pub const CUSTOMER_FULL_NAME: &[&str] = &[
        "buyer_username",
        "customer_name",
        "full_name",
        "name",
    ];
    pub const CUSTOMER_EMAIL: &[&str] = &["email", "buyer_email", "contact_email"];
    pub const CUSTOMER_PHONE: &[&str] = &["phone", "mobile", "contact_phone"];
    pub const CUSTOMER_REGION: &[&str] = &["region", "state", "province", "city"];
}

/// First present, non-null alias wins. Presence-based, so a valid `0` or
/// empty string on an early alias is not skipped in favour of a later one.
pub fn coalesce<'a>(row: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    for alias in aliases {
        if let Some(value) = row.get(*alias) {
            if !value.is_null() {
                return Some(value);
            }
        }
    }
    None
}

/// Defensive float coercion: numbers pass through, numeric strings are
/// parsed after stripping grouping/currency noise, everything else is 0.
pub fn as_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse::<f64>().unwrap_or(0.0)
        }
        _ => 0.0,
    }
}

pub fn as_i64(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_else(|| {
            n.as_f64().map(|f| f as i64).unwrap_or(0)
        }),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

pub fn as_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Timestamp coercion across the shapes the warehouse emits: RFC3339,
/// `YYYY-MM-DD HH:MM:SS`, or epoch seconds (numeric or stringified).
pub fn as_datetime(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value {
        Some(Value::String(s)) => {
            let s = s.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(naive.and_utc());
            }
            if let Ok(epoch) = s.parse::<i64>() {
                return DateTime::from_timestamp(epoch, 0);
            }
            if let Ok(epoch) = s.parse::<f64>() {
                return DateTime::from_timestamp(epoch as i64, 0);
            }
            None
        }
        Some(Value::Number(n)) => DateTime::from_timestamp(n.as_i64().unwrap_or(0), 0),
        _ => None,
    }
}

/// Normalize the `items` field at the input boundary: an array passes
/// through, a JSON string is parsed, and any failure yields an empty list.
pub fn parse_items(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Map one raw order row into a canonical order plus its line items.
///
/// Derived financials:
/// `total_fees = platform + commission + payment + service`;
/// `net_revenue = seller_income when > 0, else total_amount - total_fees`;
/// `gross_profit = net_revenue - total_cogs` with
/// `total_cogs = Σ item.cogs × item.quantity`;
/// `net_profit = gross_profit - shipping_fee + shipping_fee_discount`.
pub fn map_order(
    row: &Map<String, Value>,
    ctx: &MapContext,
) -> (CanonicalOrder, Vec<CanonicalOrderItem>) {
    let external_order_id = as_string(coalesce(row, aliases::ORDER_ID));

    let raw_items = parse_items(coalesce(row, aliases::ITEMS));
    let items: Vec<CanonicalOrderItem> = raw_items
        .iter()
        .filter_map(|item| item.as_object())
        .map(|item| map_order_item(item, &external_order_id, ctx))
        .collect();

    let total_cogs: f64 = items
        .iter()
        .map(|item| item.cogs * item.quantity as f64)
        .sum();

    let total_amount = as_f64(coalesce(row, aliases::TOTAL_AMOUNT));
    let seller_income = as_f64(coalesce(row, aliases::SELLER_INCOME));
    let platform_fee = as_f64(coalesce(row, aliases::PLATFORM_FEE));
    let commission_fee = as_f64(coalesce(row, aliases::COMMISSION_FEE));
    let payment_fee = as_f64(coalesce(row, aliases::PAYMENT_FEE));
    let service_fee = as_f64(coalesce(row, aliases::SERVICE_FEE));
    let shipping_fee = as_f64(coalesce(row, aliases::SHIPPING_FEE));
    let shipping_fee_discount = as_f64(coalesce(row, aliases::SHIPPING_FEE_DISCOUNT));

    let total_fees = platform_fee + commission_fee + payment_fee + service_fee;
    let net_revenue = if seller_income > 0.0 {
        seller_income
    } else {
        total_amount - total_fees
    };
    let gross_profit = net_revenue - total_cogs;
    let net_profit = gross_profit - shipping_fee + shipping_fee_discount;

    let order = CanonicalOrder {
        tenant_id: ctx.tenant_id.clone(),
        integration_id: ctx.integration_id,
        external_order_id,
        channel: ctx.channel.clone(),
        order_date: as_datetime(coalesce(row, aliases::ORDER_DATE)),
        currency: as_string(coalesce(row, aliases::CURRENCY)),
        customer_name: as_string(coalesce(row, aliases::CUSTOMER_NAME)),
        total_amount,
        seller_income,
        platform_fee,
        commission_fee,
        payment_fee,
        service_fee,
        total_fees,
        shipping_fee,
        shipping_fee_discount,
        total_cogs,
        net_revenue,
        gross_profit,
        net_profit,
        status: OrderStatus::normalize(&as_string(coalesce(row, aliases::STATUS))),
        raw_data: Value::Object(row.clone()),
    };

    (order, items)
}

fn map_order_item(
    item: &Map<String, Value>,
    external_order_id: &str,
    ctx: &MapContext,
) -> CanonicalOrderItem {
    CanonicalOrderItem {
        tenant_id: ctx.tenant_id.clone(),
        external_order_id: external_order_id.to_string(),
        item_id: as_string(coalesce(item, aliases::ITEM_ID)),
        product_id: as_string(coalesce(item, aliases::ITEM_PRODUCT_ID)),
        name: as_string(coalesce(item, aliases::ITEM_NAME)),
        sku: as_string(coalesce(item, aliases::ITEM_SKU)),
        quantity: as_i64(coalesce(item, aliases::ITEM_QUANTITY)),
        price: as_f64(coalesce(item, aliases::ITEM_PRICE)),
        cogs: as_f64(coalesce(item, aliases::ITEM_COGS)),
    }
}

pub fn map_settlement(row: &Map<String, Value>, ctx: &MapContext) -> CanonicalSettlement {
    CanonicalSettlement {
        tenant_id: ctx.tenant_id.clone(),
        integration_id: ctx.integration_id,
        external_settlement_id: as_string(coalesce(row, aliases::SETTLEMENT_ID)),
        external_order_id: as_string(coalesce(row, aliases::ORDER_ID)),
        channel: ctx.channel.clone(),
        amount: as_f64(coalesce(row, aliases::SETTLEMENT_AMOUNT)),
        fee: as_f64(coalesce(row, aliases::SETTLEMENT_FEE)),
        payout_date: as_datetime(coalesce(row, aliases::SETTLEMENT_DATE)),
        raw_data: Value::Object(row.clone()),
    }
}

pub fn map_product(row: &Map<String, Value>, ctx: &MapContext) -> CanonicalProduct {
    CanonicalProduct {
        tenant_id: ctx.tenant_id.clone(),
        integration_id: ctx.integration_id,
        external_product_id: as_string(coalesce(row, aliases::PRODUCT_ID)),
        channel: ctx.channel.clone(),
        name: as_string(coalesce(row, aliases::PRODUCT_NAME)),
        sku: as_string(coalesce(row, aliases::PRODUCT_SKU)),
        price: as_f64(coalesce(row, aliases::PRODUCT_PRICE)),
        cost: as_f64(coalesce(row, aliases::PRODUCT_COST)),
        stock: as_i64(coalesce(row, aliases::PRODUCT_STOCK)),
        raw_data: Value::Object(row.clone()),
    }
}

pub fn map_customer(row: &Map<String, Value>, ctx: &MapContext) -> CanonicalCustomer {
    CanonicalCustomer {
        tenant_id: ctx.tenant_id.clone(),
        external_customer_id: as_string(coalesce(row, aliases::CUSTOMER_ID)),
        channel: ctx.channel.clone(),
        name: as_string(coalesce(row, aliases::CUSTOMER_FULL_NAME)),
        email: as_string(coalesce(row, aliases::CUSTOMER_EMAIL)),
        phone: as_string(coalesce(row, aliases::CUSTOMER_PHONE)),
        region: as_string(coalesce(row, aliases::CUSTOMER_REGION)),
        raw_data: Value::Object(row.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> MapContext {
        MapContext {
            tenant_id: "tenant-1".to_string(),
            integration_id: Uuid::new_v4(),
            channel: "shopee".to_string(),
        }
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().expect("test row is an object").clone()
    }

    #[test]
    fn financial_identity_holds_with_fee_breakdown() {
        let row = obj(json!({
            "order_sn": "SN-100",
            "total_amount": "250.00",
            "platform_fee": 5.0,
            "commission_fee": "12.5",
            "payment_fee": 2.5,
            "service_fee": 0,
            "shipping_fee": 15.0,
            "shipping_fee_discount": 10.0,
            "order_status": "COMPLETED",
            "items": [
                {"item_id": "A", "quantity": 2, "item_price": 100.0, "cogs": 40.0},
                {"item_id": "B", "quantity": 1, "item_price": 50.0, "cogs": 20.0}
            ]
        }));

        let (order, items) = map_order(&row, &ctx());
        assert_eq!(items.len(), 2);
        assert_eq!(order.total_fees, 20.0);
        assert_eq!(order.total_cogs, 100.0);
        // seller_income absent -> net_revenue falls back to amount minus fees
        assert_eq!(order.net_revenue, 230.0);
        assert_eq!(order.gross_profit, 130.0);
        assert_eq!(order.net_profit, 125.0);
        assert_eq!(
            order.net_profit,
            order.net_revenue - order.total_cogs - order.shipping_fee
                + order.shipping_fee_discount
        );
        assert_eq!(order.status, OrderStatus::Delivered);
    }

    #[test]
    fn seller_income_branch_overrides_fee_subtraction() {
        let row = obj(json!({
            "order_id": "T-1",
            "total_amount": 100.0,
            "seller_income": 88.0,
            "platform_fee": 50.0
        }));
        let (order, _) = map_order(&row, &ctx());
        assert_eq!(order.net_revenue, 88.0);
        assert_eq!(
            order.net_profit,
            order.net_revenue - order.total_cogs - order.shipping_fee
                + order.shipping_fee_discount
        );
    }

    #[test]
    fn malformed_items_string_maps_to_empty_list_and_zero_cogs() {
        let row = obj(json!({
            "order_sn": "SN-BAD",
            "total_amount": 10.0,
            "items": "{not json"
        }));
        let (order, items) = map_order(&row, &ctx());
        assert!(items.is_empty());
        assert_eq!(order.total_cogs, 0.0);
        assert_eq!(order.net_revenue, 10.0);
    }

    #[test]
    fn items_arrive_as_json_string_or_array() {
        let as_string_row = obj(json!({
            "order_sn": "SN-1",
            "items": "[{\"item_id\": \"X\", \"quantity\": \"3\", \"price\": \"9.50\"}]"
        }));
        let (_, items) = map_order(&as_string_row, &ctx());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 3);
        assert_eq!(items[0].price, 9.5);
        assert_eq!(items[0].external_order_id, "SN-1");
    }

    #[test]
    fn coalesce_is_presence_based_so_valid_zero_wins() {
        let row = obj(json!({
            "platform_fee": 0,
            "marketplace_fee": 99.0
        }));
        assert_eq!(as_f64(coalesce(&row, aliases::PLATFORM_FEE)), 0.0);

        // null on the first alias falls through to the next one
        let row = obj(json!({
            "platform_fee": null,
            "marketplace_fee": 3.5
        }));
        assert_eq!(as_f64(coalesce(&row, aliases::PLATFORM_FEE)), 3.5);
    }

    #[test]
    fn numeric_coercion_is_total() {
        assert_eq!(as_f64(Some(&json!("1,234.50"))), 1234.5);
        assert_eq!(as_f64(Some(&json!("Rp 5.000"))), 5.0);
        assert_eq!(as_f64(Some(&json!("abc"))), 0.0);
        assert_eq!(as_f64(Some(&json!(true))), 0.0);
        assert_eq!(as_f64(None), 0.0);
        assert_eq!(as_i64(Some(&json!("7"))), 7);
        assert_eq!(as_i64(Some(&json!("2.9"))), 2);
        assert_eq!(as_i64(Some(&json!(null))), 0);
    }

    #[test]
    fn datetime_coercion_handles_warehouse_shapes() {
        assert!(as_datetime(Some(&json!("2026-08-01T10:00:00Z"))).is_some());
        assert!(as_datetime(Some(&json!("2026-08-01 10:00:00"))).is_some());
        let epoch = as_datetime(Some(&json!("1700000000"))).expect("epoch string");
        assert_eq!(epoch.timestamp(), 1_700_000_000);
        assert!(as_datetime(Some(&json!("yesterday"))).is_none());
        assert!(as_datetime(None).is_none());
    }

    #[test]
    fn settlement_product_customer_rows_map_defensively() {
        let settlement = map_settlement(
            &obj(json!({
                "transaction_id": "TX-9",
                "order_sn": "SN-9",
                "amount": "42.0",
                "release_time": 1700000000
            })),
            &ctx(),
        );
        assert_eq!(settlement.external_settlement_id, "TX-9");
        assert_eq!(settlement.amount, 42.0);
        assert_eq!(settlement.fee, 0.0);
        assert!(settlement.payout_date.is_some());

        let product = map_product(&obj(json!({"item_id": 5011, "stock": "12"})), &ctx());
        assert_eq!(product.external_product_id, "5011");
        assert_eq!(product.stock, 12);
        assert_eq!(product.cost, 0.0);

        let customer = map_customer(&obj(json!({"buyer_id": "B-1", "region": "Jakarta"})), &ctx());
        assert_eq!(customer.external_customer_id, "B-1");
        assert_eq!(customer.region, "Jakarta");
        assert_eq!(customer.email, "");
    }
}

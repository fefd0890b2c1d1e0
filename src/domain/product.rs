use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A catalog entry as the inventory ledger sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(alias = "_id")]
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub count_in_stock: i32,
}

/// Stock taken off the shelf for one cart line, with the price at that moment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
}

//! Facts exchanged between the product and inventory authorities.
//!
//! A fact is addressed by a dotted routing key (`stock.out_of_stock`) on one
//! of two durable topic exchanges, and carries a camelCase JSON body of the
//! shape `{ productId, quantity?, sellerId? }`. Each routing key decodes into
//! exactly one [`Fact`] variant; anything else is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exchange owned by the product authority.
pub const PRODUCTS_EXCHANGE: &str = "products_event";
/// Exchange owned by the inventory authority.
pub const INVENTORY_EXCHANGE: &str = "inventory_event";

/// Identifier of a product. Owned by the product authority; the inventory
/// authority only ever compares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub i64);

impl ProductId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for ProductId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FactError {
    #[error("unknown routing key '{0}'")]
    UnknownRoutingKey(String),

    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: FactKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} payload is missing '{field}'")]
    MissingField { kind: FactKind, field: &'static str },

    #[error("{kind} payload must not carry '{field}'")]
    UnexpectedField { kind: FactKind, field: &'static str },

    #[error("{kind} payload has negative quantity {quantity}")]
    NegativeQuantity { kind: FactKind, quantity: i64 },
}

/// Discriminant of a [`Fact`]; knows where the fact is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactKind {
    ProductCreated,
    ProductDeleted,
    StockCreated,
    StockDeleted,
    StockOutOfStock,
    StockReplenish,
}

impl FactKind {
    pub const ALL: [FactKind; 6] = [
        FactKind::ProductCreated,
        FactKind::ProductDeleted,
        FactKind::StockCreated,
        FactKind::StockDeleted,
        FactKind::StockOutOfStock,
        FactKind::StockReplenish,
    ];

    pub fn routing_key(self) -> &'static str {
        match self {
            FactKind::ProductCreated => "product.created",
            FactKind::ProductDeleted => "product.deleted",
            FactKind::StockCreated => "stock.created",
            FactKind::StockDeleted => "stock.deleted",
            FactKind::StockOutOfStock => "stock.out_of_stock",
            FactKind::StockReplenish => "stock.replenish",
        }
    }

    pub fn exchange(self) -> &'static str {
        match self {
            FactKind::ProductCreated | FactKind::ProductDeleted => PRODUCTS_EXCHANGE,
            _ => INVENTORY_EXCHANGE,
        }
    }

    pub fn from_routing_key(routing_key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.routing_key() == routing_key)
    }
}

impl fmt::Display for FactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}

/// An immutable record of a state transition in one authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fact {
    ProductCreated {
        product_id: ProductId,
        quantity: i64,
        seller_id: Option<i64>,
    },
    ProductDeleted {
        product_id: ProductId,
        seller_id: Option<i64>,
    },
    /// `quantity` is the number of units available when the entry was announced.
    StockCreated {
        product_id: ProductId,
        quantity: i64,
    },
    StockDeleted {
        product_id: ProductId,
        quantity: Option<i64>,
    },
    StockOutOfStock {
        product_id: ProductId,
    },
    /// `available` is the number of units available after the replenishment.
    StockReplenish {
        product_id: ProductId,
        available: Option<i64>,
    },
}

/// Body shared by every fact on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WirePayload {
    product_id: ProductId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seller_id: Option<i64>,
}

impl Fact {
    pub fn kind(&self) -> FactKind {
        match self {
            Fact::ProductCreated { .. } => FactKind::ProductCreated,
            Fact::ProductDeleted { .. } => FactKind::ProductDeleted,
            Fact::StockCreated { .. } => FactKind::StockCreated,
            Fact::StockDeleted { .. } => FactKind::StockDeleted,
            Fact::StockOutOfStock { .. } => FactKind::StockOutOfStock,
            Fact::StockReplenish { .. } => FactKind::StockReplenish,
        }
    }

    pub fn product_id(&self) -> ProductId {
        match self {
            Fact::ProductCreated { product_id, .. }
            | Fact::ProductDeleted { product_id, .. }
            | Fact::StockCreated { product_id, .. }
            | Fact::StockDeleted { product_id, .. }
            | Fact::StockOutOfStock { product_id }
            | Fact::StockReplenish { product_id, .. } => *product_id,
        }
    }

    pub fn routing_key(&self) -> &'static str {
        self.kind().routing_key()
    }

    pub fn exchange(&self) -> &'static str {
        self.kind().exchange()
    }

    fn to_wire(&self) -> WirePayload {
        let product_id = self.product_id();
        let (quantity, seller_id) = match self {
            Fact::ProductCreated {
                quantity,
                seller_id,
                ..
            } => (Some(*quantity), *seller_id),
            Fact::ProductDeleted { seller_id, .. } => (None, *seller_id),
            Fact::StockCreated { quantity, .. } => (Some(*quantity), None),
            Fact::StockDeleted { quantity, .. } => (*quantity, None),
            Fact::StockOutOfStock { .. } => (None, None),
            Fact::StockReplenish { available, .. } => (*available, None),
        };
        WirePayload {
            product_id,
            quantity,
            seller_id,
        }
    }

    /// JSON body of this fact.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self.to_wire())
    }

    /// Decode a delivery into the variant selected by its routing key.
    pub fn decode(routing_key: &str, body: &[u8]) -> Result<Self, FactError> {
        let kind = FactKind::from_routing_key(routing_key)
            .ok_or_else(|| FactError::UnknownRoutingKey(routing_key.to_string()))?;
        let wire: WirePayload =
            serde_json::from_slice(body).map_err(|source| FactError::Malformed { kind, source })?;

        if let Some(quantity) = wire.quantity.filter(|q| *q < 0) {
            return Err(FactError::NegativeQuantity { kind, quantity });
        }

        let required_quantity = || {
            wire.quantity.ok_or(FactError::MissingField {
                kind,
                field: "quantity",
            })
        };
        let reject_seller = || match wire.seller_id {
            Some(_) => Err(FactError::UnexpectedField {
                kind,
                field: "sellerId",
            }),
            None => Ok(()),
        };
        let reject_quantity = || match wire.quantity {
            Some(_) => Err(FactError::UnexpectedField {
                kind,
                field: "quantity",
            }),
            None => Ok(()),
        };

        let product_id = wire.product_id;
        let fact = match kind {
            FactKind::ProductCreated => Fact::ProductCreated {
                product_id,
                quantity: required_quantity()?,
                seller_id: wire.seller_id,
            },
            FactKind::ProductDeleted => {
                reject_quantity()?;
                Fact::ProductDeleted {
                    product_id,
                    seller_id: wire.seller_id,
                }
            }
            FactKind::StockCreated => {
                reject_seller()?;
                Fact::StockCreated {
                    product_id,
                    quantity: required_quantity()?,
                }
            }
            FactKind::StockDeleted => {
                reject_seller()?;
                Fact::StockDeleted {
                    product_id,
                    quantity: wire.quantity,
                }
            }
            FactKind::StockOutOfStock => {
                reject_seller()?;
                reject_quantity()?;
                Fact::StockOutOfStock { product_id }
            }
            FactKind::StockReplenish => {
                reject_seller()?;
                Fact::StockReplenish {
                    product_id,
                    available: wire.quantity,
                }
            }
        };
        Ok(fact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routing_table() {
        assert_eq!(FactKind::ProductCreated.exchange(), PRODUCTS_EXCHANGE);
        assert_eq!(FactKind::StockOutOfStock.exchange(), INVENTORY_EXCHANGE);
        assert_eq!(
            FactKind::from_routing_key("stock.replenish"),
            Some(FactKind::StockReplenish)
        );
        assert_eq!(FactKind::from_routing_key("stock.*"), None);
    }

    #[test]
    fn test_product_created_wire_shape() {
        let fact = Fact::ProductCreated {
            product_id: ProductId(7),
            quantity: 12,
            seller_id: Some(3),
        };
        assert_eq!(
            fact.payload().unwrap(),
            json!({ "productId": 7, "quantity": 12, "sellerId": 3 })
        );

        let out_of_stock = Fact::StockOutOfStock {
            product_id: ProductId(7),
        };
        assert_eq!(out_of_stock.payload().unwrap(), json!({ "productId": 7 }));
    }

    #[test]
    fn test_decode_selects_variant_by_routing_key() {
        let fact = Fact::decode("stock.created", br#"{"productId":42,"quantity":5}"#).unwrap();
        assert_eq!(
            fact,
            Fact::StockCreated {
                product_id: ProductId(42),
                quantity: 5
            }
        );

        let fact = Fact::decode("product.deleted", br#"{"productId":42,"sellerId":9}"#).unwrap();
        assert_eq!(
            fact,
            Fact::ProductDeleted {
                product_id: ProductId(42),
                seller_id: Some(9)
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_routing_key() {
        let err = Fact::decode("stock.vanished", br#"{"productId":1}"#).unwrap_err();
        assert!(matches!(err, FactError::UnknownRoutingKey(key) if key == "stock.vanished"));
    }

    #[test]
    fn test_decode_requires_quantity_for_creation() {
        let err = Fact::decode("product.created", br#"{"productId":1}"#).unwrap_err();
        assert!(matches!(
            err,
            FactError::MissingField {
                kind: FactKind::ProductCreated,
                field: "quantity"
            }
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_and_misplaced_fields() {
        let err = Fact::decode("stock.created", br#"{"productId":1,"quantity":1,"sku":"x"}"#)
            .unwrap_err();
        assert!(matches!(err, FactError::Malformed { .. }));

        let err = Fact::decode("stock.out_of_stock", br#"{"productId":1,"sellerId":2}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            FactError::UnexpectedField {
                field: "sellerId",
                ..
            }
        ));
    }

    #[test]
    fn test_decode_rejects_negative_quantity() {
        let err = Fact::decode("product.created", br#"{"productId":1,"quantity":-4}"#).unwrap_err();
        assert!(matches!(
            err,
            FactError::NegativeQuantity { quantity: -4, .. }
        ));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let err = Fact::decode("stock.replenish", b"not json").unwrap_err();
        assert!(matches!(
            err,
            FactError::Malformed {
                kind: FactKind::StockReplenish,
                ..
            }
        ));
    }
}

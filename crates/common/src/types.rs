use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Each ledger entity gets its own id type so an order id can never be
/// passed where a job id is expected.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Identifies an order.
    OrderId
);
uuid_id!(
    /// Identifies a line item within an order.
    OrderItemId
);
uuid_id!(
    /// Identifies a single-use stock unit.
    StockItemId
);
uuid_id!(
    /// Identifies one payment attempt for an order.
    PaymentId
);
uuid_id!(
    /// Identifies a fulfillment job.
    JobId
);
uuid_id!(
    /// Identifies a storefront account (buyer or reseller).
    AccountId
);
uuid_id!(
    /// Identifies a reseller-owned webhook endpoint.
    WebhookEndpointId
);
uuid_id!(
    /// Identifies one logged webhook delivery attempt.
    WebhookDeliveryId
);
uuid_id!(
    /// Identifies a wallet ledger entry.
    WalletTransactionId
);

/// Catalog product identifier (SKU).
///
/// Products live in the storefront catalog; the pipeline only ever refers
/// to them by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Creates a new product ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the product ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProductId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ProductId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(OrderId::new(), OrderId::new());
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        assert_eq!(PaymentId::from_uuid(uuid).as_uuid(), uuid);
    }

    #[test]
    fn ids_parse_from_display() {
        let id = OrderItemId::new();
        let parsed: OrderItemId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<OrderId>().is_err());
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = AccountId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }

    #[test]
    fn product_id_conversions() {
        let a = ProductId::from("SKU-001");
        let b = ProductId::new(String::from("SKU-001"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "SKU-001");
        assert_eq!(a.to_string(), "SKU-001");
    }
}

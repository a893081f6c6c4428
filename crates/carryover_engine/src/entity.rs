//! Per-kind entity profiles: natural keys, references and aggregates.

use carryover_ledger::EntityKind;
use serde_json::Value;

/// How an unmapped reference is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefRole {
    /// The entity cannot exist without it, in any mapping mode.
    Required,
    /// Narrows the entity's scope; dropped in lenient mode.
    Scope,
}

/// A payload field holding the ID (or IDs) of another entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceField {
    /// Payload field name.
    pub field: &'static str,
    /// Kind of the referenced entity.
    pub target: EntityKind,
    /// How an unmapped reference is treated.
    pub role: RefRole,
}

/// What the engine needs to know about one entity kind.
#[derive(Debug, Clone, Copy)]
pub struct EntityProfile {
    /// The kind described.
    pub kind: EntityKind,
    /// Fields tried in order for the natural key.
    pub key_fields: &'static [&'static str],
    /// Cross-references to map before creation.
    pub references: &'static [ReferenceField],
    /// Fields tried in order for the desired balance.
    pub balance_fields: &'static [&'static str],
    /// Whether balances are money (read in major units, kept in cents).
    pub balance_is_money: bool,
    /// Fields removed from the create payload and applied after creation.
    pub deferred_fields: &'static [&'static str],
    /// Returns true when the entity declares it needs no scope reference.
    pub unscoped: Option<fn(&Value) -> bool>,
}

const NONE: &[&str] = &[];

fn coupon_is_unscoped(item: &Value) -> bool {
    let text = |field: &str| {
        item.get(field)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_lowercase())
    };
    text("applies_to").as_deref() == Some("all")
        || matches!(text("scope").as_deref(), Some("global" | "all"))
}

static BRAND: EntityProfile = EntityProfile {
    kind: EntityKind::Brand,
    key_fields: &["name"],
    references: &[],
    balance_fields: NONE,
    balance_is_money: false,
    deferred_fields: NONE,
    unscoped: None,
};

static LOYALTY_ACCOUNT: EntityProfile = EntityProfile {
    kind: EntityKind::LoyaltyAccount,
    key_fields: &["email"],
    references: &[],
    balance_fields: &["points", "balance", "loyalty_points"],
    balance_is_money: false,
    deferred_fields: NONE,
    unscoped: None,
};

static GIFT_CARD: EntityProfile = EntityProfile {
    kind: EntityKind::GiftCard,
    key_fields: &["code"],
    references: &[ReferenceField {
        field: "customer_id",
        target: EntityKind::LoyaltyAccount,
        role: RefRole::Scope,
    }],
    balance_fields: &["balance", "current_balance", "initial_value"],
    balance_is_money: true,
    deferred_fields: NONE,
    unscoped: None,
};

static INFO_SECTION: EntityProfile = EntityProfile {
    kind: EntityKind::InfoSection,
    key_fields: &["handle", "title"],
    references: &[ReferenceField {
        field: "brand_id",
        target: EntityKind::Brand,
        role: RefRole::Scope,
    }],
    balance_fields: NONE,
    balance_is_money: false,
    deferred_fields: NONE,
    unscoped: None,
};

static COUPON: EntityProfile = EntityProfile {
    kind: EntityKind::Coupon,
    key_fields: &["code"],
    references: &[
        ReferenceField {
            field: "brand_id",
            target: EntityKind::Brand,
            role: RefRole::Scope,
        },
        ReferenceField {
            field: "brand_ids",
            target: EntityKind::Brand,
            role: RefRole::Scope,
        },
    ],
    balance_fields: NONE,
    balance_is_money: false,
    deferred_fields: NONE,
    unscoped: Some(coupon_is_unscoped),
};

static ORDER: EntityProfile = EntityProfile {
    kind: EntityKind::Order,
    key_fields: &["order_number", "number", "name"],
    references: &[
        ReferenceField {
            field: "customer_id",
            target: EntityKind::LoyaltyAccount,
            role: RefRole::Required,
        },
        ReferenceField {
            field: "gift_card_id",
            target: EntityKind::GiftCard,
            role: RefRole::Scope,
        },
    ],
    balance_fields: NONE,
    balance_is_money: false,
    deferred_fields: &["payments", "fulfillments"],
    unscoped: None,
};

impl EntityProfile {
    /// The profile for `kind`.
    #[must_use]
    pub fn for_kind(kind: EntityKind) -> &'static EntityProfile {
        match kind {
            EntityKind::Brand => &BRAND,
            EntityKind::LoyaltyAccount => &LOYALTY_ACCOUNT,
            EntityKind::GiftCard => &GIFT_CARD,
            EntityKind::InfoSection => &INFO_SECTION,
            EntityKind::Coupon => &COUPON,
            EntityKind::Order => &ORDER,
        }
    }

    /// The entity's natural key as written (trimmed), if it has one.
    #[must_use]
    pub fn natural_key(&self, item: &Value) -> Option<String> {
        self.key_fields
            .iter()
            .filter_map(|field| item.get(*field).and_then(scalar_text))
            .map(|key| key.trim().to_string())
            .find(|key| !key.is_empty())
    }

    /// The natural key, normalized for comparison.
    #[must_use]
    pub fn normalized_key(&self, item: &Value) -> Option<String> {
        self.natural_key(item).map(|key| normalize_key(&key))
    }

    /// Returns true if the entity declares it needs no scope reference.
    #[must_use]
    pub fn is_unscoped(&self, item: &Value) -> bool {
        self.unscoped.is_some_and(|check| check(item))
    }

    /// Desired balance in the smallest unit, if the entity carries one.
    #[must_use]
    pub fn desired_balance(&self, item: &Value) -> Option<i64> {
        let value = self
            .balance_fields
            .iter()
            .find_map(|field| item.get(*field).filter(|v| !v.is_null()))?;
        if self.balance_is_money {
            minor_units(value)
        } else {
            whole_points(value)
        }
    }

    /// The create payload: the source item without deferred fields or its
    /// source ID.
    #[must_use]
    pub fn create_payload(&self, item: &Value) -> Value {
        let mut payload = item.clone();
        if let Some(object) = payload.as_object_mut() {
            object.remove("id");
            for field in self.deferred_fields {
                object.remove(*field);
            }
        }
        payload
    }
}

/// Case-folds and trims a natural key.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// The entity's own ID (`id`), as text.
#[must_use]
pub fn entity_id(item: &Value) -> Option<String> {
    item.get("id")
        .and_then(scalar_text)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

/// Strings as-is, numbers formatted; anything else is not text.
#[must_use]
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Follows a dotted path (`audit.created_at`) into nested objects.
#[must_use]
pub fn lookup_path<'v>(item: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(item, |value, segment| value.get(segment))
}

fn whole_points(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f.round() as i64)),
        _ => None,
    }
}

/// Parses an amount given in major units (`12.5`, `"12.50"`) into minor
/// units (`1250`).
#[must_use]
pub fn minor_units(value: &Value) -> Option<i64> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.as_str()),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        // Exponent notation and other shapes go through a float.
        return text.parse::<f64>().ok().map(|f| (f * 100.0).round() as i64);
    }

    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut cents: i64 = 0;
    let mut digits = fraction.chars();
    for scale in [10, 1] {
        if let Some(d) = digits.next() {
            cents += i64::from(d.to_digit(10)?) * scale;
        }
    }
    // Round half up on the third decimal.
    if digits.next().and_then(|d| d.to_digit(10)).is_some_and(|d| d >= 5) {
        cents += 1;
    }
    let total = whole.checked_mul(100)?.checked_add(cents)?;
    Some(if negative { -total } else { total })
}

/// Parses a whole, non-negative count: `2`, `2.0` or `"2"`.
#[must_use]
pub fn whole_units(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let minor = minor_units(value).filter(|m| m % 100 == 0)?;
    u64::try_from(minor / 100).ok()
}

/// The count in `field`, zero when absent or unreadable.
#[must_use]
pub fn quantity(item: &Value, field: &str) -> u32 {
    item.get(field)
        .and_then(whole_units)
        .map_or(0, |q| u32::try_from(q).unwrap_or(u32::MAX))
}

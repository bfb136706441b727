//! Core domain types for beacon
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Identifier kind** | A category of user/platform identifier with a fixed overwrite policy |
//! | **Identifiers** | A snapshot mapping identifier kinds to values |
//! | **Event** | An immutable tagged attribute set produced by a tracking call |
//! | **Test mode** | Development switch that suppresses or fails network IO |

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// ============================================
// Identifiers
// ============================================

/// A category of user or platform identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    /// Generated once per installation
    Install,
    /// Advertiser ID, resolved asynchronously by the platform
    Advertising,
    /// Vendor-scoped platform ID
    Vendor,
    /// Application supplied ID
    Custom,
    Facebook,
    GooglePlus,
    Twitter,
}

/// How an identifier update treats a value already stored in a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPolicy {
    /// The new value always replaces the stored one
    AlwaysOverwrite,
    /// The new value is only stored if the current one is empty
    FirstWriteWins,
}

impl IdKind {
    pub const ALL: [IdKind; 7] = [
        IdKind::Install,
        IdKind::Advertising,
        IdKind::Vendor,
        IdKind::Custom,
        IdKind::Facebook,
        IdKind::GooglePlus,
        IdKind::Twitter,
    ];

    /// Wire name used in the `identifiers` object
    pub fn as_str(&self) -> &'static str {
        match self {
            IdKind::Install => "install",
            IdKind::Advertising => "advertising",
            IdKind::Vendor => "vendor",
            IdKind::Custom => "custom",
            IdKind::Facebook => "facebook",
            IdKind::GooglePlus => "google_plus",
            IdKind::Twitter => "twitter",
        }
    }

    /// Parse a wire name (case-insensitive, `-` accepted for `_`)
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|kind| kind.as_str() == normalized)
    }

    /// Platform-resolved kinds keep the first value they receive.
    pub fn policy(&self) -> IdPolicy {
        match self {
            IdKind::Install | IdKind::Advertising | IdKind::Vendor => IdPolicy::FirstWriteWins,
            IdKind::Custom | IdKind::Facebook | IdKind::GooglePlus | IdKind::Twitter => {
                IdPolicy::AlwaysOverwrite
            }
        }
    }
}

impl std::fmt::Display for IdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of identifier values.
///
/// Only non-empty values are stored, so the serialized form never contains
/// empty identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Identifiers {
    values: BTreeMap<IdKind, String>,
}

impl<'de> Deserialize<'de> for Identifiers {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let mut values = BTreeMap::<IdKind, String>::deserialize(deserializer)?;
        values.retain(|_, value| !value.is_empty());
        Ok(Self { values })
    }
}

impl Identifiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `kind`, or `""` if unknown.
    pub fn get(&self, kind: IdKind) -> &str {
        self.values.get(&kind).map(String::as_str).unwrap_or("")
    }

    /// Stores `value` for `kind`; an empty value removes the entry.
    pub fn set(&mut self, kind: IdKind, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.values.remove(&kind);
        } else {
            self.values.insert(kind, value);
        }
    }

    pub fn clear(&mut self, kind: IdKind) {
        self.values.remove(&kind);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (IdKind, &str)> {
        self.values.iter().map(|(kind, value)| (*kind, value.as_str()))
    }

    /// Applies `value` according to the policy of `kind`.
    ///
    /// Returns true if the stored value changed.
    pub fn apply(&mut self, kind: IdKind, value: &str) -> bool {
        let current = self.get(kind);
        if current == value {
            return false;
        }
        if kind.policy() == IdPolicy::FirstWriteWins && !current.is_empty() {
            return false;
        }
        self.set(kind, value);
        true
    }
}

// ============================================
// Events
// ============================================

/// Tag of an event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Revenue,
    ItemPurchase,
    Tutorial,
    Milestone,
    Marketing,
    UserAttribute,
    Country,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Revenue => "revenue",
            EventType::ItemPurchase => "item_purchase",
            EventType::Tutorial => "tutorial",
            EventType::Milestone => "milestone",
            EventType::Marketing => "marketing",
            EventType::UserAttribute => "user_attribute",
            EventType::Country => "country",
        }
    }
}

/// Immutable event record: a `type` tag plus attributes.
///
/// Serializes to a flat object, e.g. `{"type":"milestone","name":"level","value":"3",...}`.
/// Constructors validate their arguments and return `None` for invalid input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
    fields: Map<String, Value>,
}

impl Event {
    /// Builds an event from a tag and attributes, stamping the current time.
    pub fn new(event_type: EventType, attributes: Map<String, Value>) -> Self {
        let mut fields = Map::new();
        fields.insert("type".into(), Value::String(event_type.as_str().into()));
        fields.insert(
            "timestamp".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        for (key, value) in attributes {
            if key != "type" {
                fields.insert(key, value);
            }
        }
        Self { fields }
    }

    /// Rebuilds an event from stored fields.
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// The event tag, or `""` if it cannot be determined.
    pub fn event_type(&self) -> &str {
        self.fields
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Payment made by the user.
    pub fn revenue(
        amount: f64,
        currency: &str,
        virtual_amount: Option<f64>,
        reward: Option<&str>,
    ) -> Option<Self> {
        let currency = iso_code(currency, 3)?;
        let mut attrs = Map::new();
        attrs.insert("amount".into(), number(amount)?);
        attrs.insert("currency".into(), Value::String(currency));
        if let Some(vc) = virtual_amount {
            attrs.insert("vc_amount".into(), number(vc)?);
        }
        if let Some(reward) = non_empty(reward) {
            attrs.insert("reward".into(), Value::String(reward.into()));
        }
        Some(Self::new(EventType::Revenue, attrs))
    }

    /// Purchase of an item, optionally paid with virtual currency.
    pub fn item_purchase(name: &str, virtual_amount: Option<f64>) -> Option<Self> {
        let name = non_empty(Some(name))?;
        let mut attrs = Map::new();
        attrs.insert("name".into(), Value::String(name.into()));
        if let Some(vc) = virtual_amount {
            attrs.insert("vc_amount".into(), number(vc)?);
        }
        Some(Self::new(EventType::ItemPurchase, attrs))
    }

    pub fn tutorial(step: &str) -> Option<Self> {
        let step = non_empty(Some(step))?;
        let mut attrs = Map::new();
        attrs.insert("step".into(), Value::String(step.into()));
        Some(Self::new(EventType::Tutorial, attrs))
    }

    pub fn milestone(name: &str, value: &str) -> Option<Self> {
        let name = non_empty(Some(name))?;
        let mut attrs = Map::new();
        attrs.insert("name".into(), Value::String(name.into()));
        attrs.insert("value".into(), Value::String(value.into()));
        Some(Self::new(EventType::Milestone, attrs))
    }

    /// Marketing source; at least one of the values must be present.
    pub fn marketing(
        partner: Option<&str>,
        campaign: Option<&str>,
        ad: Option<&str>,
        sub_id: Option<&str>,
        sub_sub_id: Option<&str>,
    ) -> Option<Self> {
        let mut attrs = Map::new();
        for (key, value) in [
            ("partner", partner),
            ("campaign", campaign),
            ("ad", ad),
            ("subid", sub_id),
            ("subsubid", sub_sub_id),
        ] {
            if let Some(value) = non_empty(value) {
                attrs.insert(key.into(), Value::String(value.into()));
            }
        }
        if attrs.is_empty() {
            return None;
        }
        Some(Self::new(EventType::Marketing, attrs))
    }

    pub fn user_attribute(name: &str, value: &str) -> Option<Self> {
        let name = non_empty(Some(name))?;
        let mut attrs = Map::new();
        attrs.insert("name".into(), Value::String(name.into()));
        attrs.insert("value".into(), Value::String(value.into()));
        Some(Self::new(EventType::UserAttribute, attrs))
    }

    /// Country as ISO 3166-1 alpha-2 code.
    pub fn country(country: &str) -> Option<Self> {
        let country = iso_code(country, 2)?;
        let mut attrs = Map::new();
        attrs.insert("country".into(), Value::String(country));
        Some(Self::new(EventType::Country, attrs))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn number(value: f64) -> Option<Value> {
    serde_json::Number::from_f64(value).map(Value::Number)
}

/// Upper-cased alphabetic code of exactly `len` ASCII letters
fn iso_code(code: &str, len: usize) -> Option<String> {
    let code = code.trim();
    (code.len() == len && code.chars().all(|c| c.is_ascii_alphabetic()))
        .then(|| code.to_ascii_uppercase())
}

// ============================================
// Test mode
// ============================================

/// Development switch controlling network IO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    /// Normal operation
    #[default]
    None,
    /// No network IO; every transaction succeeds
    SimulateServer,
    /// No network IO; the endpoint appears offline
    SimulateOffline,
}

impl TestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::None => "none",
            TestMode::SimulateServer => "simulate_server",
            TestMode::SimulateOffline => "simulate_offline",
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            TestMode::None => 0,
            TestMode::SimulateServer => 1,
            TestMode::SimulateOffline => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => TestMode::SimulateServer,
            2 => TestMode::SimulateOffline,
            _ => TestMode::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_skip_empty_values() {
        let mut ids = Identifiers::new();
        ids.set(IdKind::Custom, "user-1");
        ids.set(IdKind::Facebook, "");
        assert_eq!(ids.get(IdKind::Custom), "user-1");
        assert_eq!(ids.get(IdKind::Facebook), "");

        let json = serde_json::to_value(&ids).unwrap();
        assert_eq!(json, serde_json::json!({"custom": "user-1"}));

        ids.set(IdKind::Custom, "");
        assert!(ids.is_empty());
    }

    #[test]
    fn test_stored_empty_identifiers_are_dropped() {
        let ids: Identifiers =
            serde_json::from_str(r#"{"custom":"","vendor":"v-1"}"#).unwrap();
        assert_eq!(ids.get(IdKind::Custom), "");
        assert_eq!(ids.iter().count(), 1);
        assert_eq!(serde_json::to_string(&ids).unwrap(), r#"{"vendor":"v-1"}"#);
    }

    #[test]
    fn test_identifier_policies() {
        let mut ids = Identifiers::new();
        assert!(ids.apply(IdKind::Advertising, "ad-1"));
        assert!(!ids.apply(IdKind::Advertising, "ad-2"));
        assert_eq!(ids.get(IdKind::Advertising), "ad-1");

        assert!(ids.apply(IdKind::Custom, "c-1"));
        assert!(ids.apply(IdKind::Custom, "c-2"));
        assert_eq!(ids.get(IdKind::Custom), "c-2");
        assert!(!ids.apply(IdKind::Custom, "c-2"));
    }

    #[test]
    fn test_id_kind_parse() {
        assert_eq!(IdKind::parse("google-plus"), Some(IdKind::GooglePlus));
        assert_eq!(IdKind::parse("CUSTOM"), Some(IdKind::Custom));
        assert_eq!(IdKind::parse("myspace"), None);
        for kind in IdKind::ALL {
            assert_eq!(IdKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_revenue_event() {
        let event = Event::revenue(4.99, "eur", Some(100.0), Some("gems")).unwrap();
        assert_eq!(event.event_type(), "revenue");
        assert_eq!(event.get("currency").unwrap(), "EUR");
        assert_eq!(event.get("amount").unwrap(), 4.99);
        assert_eq!(event.get("vc_amount").unwrap(), 100.0);
        assert_eq!(event.get("reward").unwrap(), "gems");
        assert!(event.get("timestamp").is_some());

        assert!(Event::revenue(1.0, "EURO", None, None).is_none());
        assert!(Event::revenue(f64::NAN, "EUR", None, None).is_none());
        let no_reward = Event::revenue(1.0, "USD", None, Some("  ")).unwrap();
        assert!(no_reward.get("reward").is_none());
    }

    #[test]
    fn test_invalid_arguments_yield_no_event() {
        assert!(Event::item_purchase("", None).is_none());
        assert!(Event::tutorial("   ").is_none());
        assert!(Event::milestone("", "1").is_none());
        assert!(Event::user_attribute("", "x").is_none());
        assert!(Event::country("USA").is_none());
        assert!(Event::marketing(None, Some(""), None, None, None).is_none());
    }

    #[test]
    fn test_marketing_includes_present_values_only() {
        let event = Event::marketing(Some("partner"), None, Some("ad-7"), None, None).unwrap();
        assert_eq!(event.event_type(), "marketing");
        assert_eq!(event.get("partner").unwrap(), "partner");
        assert_eq!(event.get("ad").unwrap(), "ad-7");
        assert!(event.get("campaign").is_none());
    }

    #[test]
    fn test_event_type_indeterminate() {
        let event = Event::from_fields(Map::new());
        assert_eq!(event.event_type(), "");
        assert_eq!(Event::country("nl").unwrap().get("country").unwrap(), "NL");
    }

    #[test]
    fn test_test_mode_round_trips_through_u8() {
        for mode in [
            TestMode::None,
            TestMode::SimulateServer,
            TestMode::SimulateOffline,
        ] {
            assert_eq!(TestMode::from_u8(mode.as_u8()), mode);
        }
        assert_eq!(TestMode::SimulateServer.as_str(), "simulate_server");
    }
}

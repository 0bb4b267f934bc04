use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single price reading delivered by the feed.
///
/// `price` arrives as a raw integer-valued number that is normalised by
/// dividing through `price_scale`; every other vendor field is carried
/// through untouched in `fields`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub price_scale: Option<u32>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Quote {
    pub fn with_price(price: f64) -> Self {
        Self {
            price: Some(price),
            ..Self::default()
        }
    }

    pub fn scaled(price: f64, price_scale: u32) -> Self {
        Self {
            price: Some(price),
            price_scale: Some(price_scale),
            ..Self::default()
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

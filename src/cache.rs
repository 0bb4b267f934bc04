use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::quote::Quote;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuoteError {
    #[error("quote for {symbol} carries a price scale of zero")]
    ZeroPriceScale { symbol: String },
}

/// Latest two quotes seen for a symbol and the move between them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub current: Option<Quote>,
    pub previous: Option<Quote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage_change: Option<f64>,
}

impl SymbolEntry {
    fn first(quote: Quote) -> Self {
        Self {
            current: Some(quote),
            previous: None,
            percentage_change: None,
        }
    }

    fn advance(&mut self, quote: Quote) {
        self.previous = self.current.replace(quote);

        let previous_price = self.previous.as_ref().and_then(|q| q.price);
        let current_price = self.current.as_ref().and_then(|q| q.price);
        self.percentage_change = match (previous_price, current_price) {
            (Some(previous), Some(current)) => Some(percentage_change(previous, current)),
            _ => None,
        };
    }
}

/// Outcome of a single cache update, handed back to the caller for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedUpdate {
    pub created: bool,
    pub price: Option<f64>,
    pub percentage_change: Option<f64>,
}

/// Relative move from `previous` to `current` in percent; a zero previous price yields zero.
pub fn percentage_change(previous: f64, current: f64) -> f64 {
    if previous == 0.0 {
        return 0.0;
    }
    ((current - previous) / previous) * 100.0
}

/// Divides the raw price through its scale when both are present.
pub fn normalise(symbol: &str, mut quote: Quote) -> Result<Quote, QuoteError> {
    if let (Some(price), Some(scale)) = (quote.price, quote.price_scale) {
        if scale == 0 {
            return Err(QuoteError::ZeroPriceScale {
                symbol: symbol.to_string(),
            });
        }
        quote.price = Some(price / f64::from(scale));
    }
    Ok(quote)
}

/// Symbol-keyed quote store shared by the dispatcher, the refresh loop and
/// the HTTP handlers. Every read and write goes through one mutex, and the
/// guard never outlives the method call.
#[derive(Clone, Default)]
pub struct QuoteCache {
    entries: Arc<Mutex<HashMap<String, SymbolEntry>>>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply_update(
        &self,
        symbol: &str,
        quote: Quote,
    ) -> Result<AppliedUpdate, QuoteError> {
        let quote = normalise(symbol, quote)?;
        let price = quote.price;

        let mut guard = self.entries.lock().await;
        match guard.get_mut(symbol) {
            Some(entry) => {
                entry.advance(quote);
                Ok(AppliedUpdate {
                    created: false,
                    price,
                    percentage_change: entry.percentage_change,
                })
            }
            None => {
                guard.insert(symbol.to_string(), SymbolEntry::first(quote));
                Ok(AppliedUpdate {
                    created: true,
                    price,
                    percentage_change: None,
                })
            }
        }
    }

    pub async fn get(&self, symbol: &str) -> Option<SymbolEntry> {
        self.entries.lock().await.get(symbol).cloned()
    }

    /// Serialises the whole map while holding the lock, ordered by symbol.
    pub async fn snapshot_json(&self) -> serde_json::Result<Vec<u8>> {
        let guard = self.entries.lock().await;
        let ordered: BTreeMap<&String, &SymbolEntry> = guard.iter().collect();
        serde_json::to_vec(&ordered)
    }

    /// Removes `symbol` if it is cached, running `before_remove` under the
    /// same lock acquisition so no update can slip in between.
    pub async fn evict<F>(&self, symbol: &str, before_remove: F) -> Option<SymbolEntry>
    where
        F: FnOnce(&str),
    {
        let mut guard = self.entries.lock().await;
        if !guard.contains_key(symbol) {
            return None;
        }
        before_remove(symbol);
        guard.remove(symbol)
    }

    pub async fn symbols(&self) -> Vec<String> {
        let guard = self.entries.lock().await;
        let mut symbols: Vec<String> = guard.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

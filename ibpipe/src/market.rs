// ibpipe/src/market.rs
// Request-side data types: the contract description and the market data
// subscription request, with a builder that enforces the one required
// attribute (the symbol) and defaults the rest.

use serde::{Deserialize, Serialize};

use crate::base::PipeError;

/// Minimal contract description for data subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpec {
  pub symbol: String,
  pub sec_type: String,
  pub exchange: String,
  pub currency: String,
}

impl ContractSpec {
  /// A stock on SMART routing in USD, the common case.
  pub fn stock(symbol: impl Into<String>) -> ContractSpec {
    ContractSpec {
      symbol: symbol.into(),
      sec_type: "STK".to_string(),
      exchange: "SMART".to_string(),
      currency: "USD".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataRequest {
  pub ticker_id: i32,
  pub contract: ContractSpec,
  /// Comma-separated generic tick ids, empty for the default set.
  pub generic_tick_list: String,
  pub snapshot: bool,
}

impl MarketDataRequest {
  pub fn builder(ticker_id: i32) -> MarketDataRequestBuilder {
    MarketDataRequestBuilder {
      ticker_id,
      symbol: None,
      sec_type: "STK".to_string(),
      exchange: "SMART".to_string(),
      currency: "USD".to_string(),
      generic_tick_list: String::new(),
      snapshot: false,
    }
  }
}

pub struct MarketDataRequestBuilder {
  ticker_id: i32,
  symbol: Option<String>,
  sec_type: String,
  exchange: String,
  currency: String,
  generic_tick_list: String,
  snapshot: bool,
}

impl MarketDataRequestBuilder {
  pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
    self.symbol = Some(symbol.into());
    self
  }

  pub fn sec_type(mut self, sec_type: impl Into<String>) -> Self {
    self.sec_type = sec_type.into();
    self
  }

  pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
    self.exchange = exchange.into();
    self
  }

  pub fn currency(mut self, currency: impl Into<String>) -> Self {
    self.currency = currency.into();
    self
  }

  pub fn generic_tick_list(mut self, list: impl Into<String>) -> Self {
    self.generic_tick_list = list.into();
    self
  }

  pub fn snapshot(mut self, snapshot: bool) -> Self {
    self.snapshot = snapshot;
    self
  }

  pub fn build(self) -> Result<MarketDataRequest, PipeError> {
    let symbol = self
      .symbol
      .ok_or_else(|| PipeError::Misconfigured("market data request needs a symbol".to_string()))?;
    Ok(MarketDataRequest {
      ticker_id: self.ticker_id,
      contract: ContractSpec {
        symbol,
        sec_type: self.sec_type,
        exchange: self.exchange,
        currency: self.currency,
      },
      generic_tick_list: self.generic_tick_list,
      snapshot: self.snapshot,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_defaults_and_required_symbol() {
    let req = MarketDataRequest::builder(1000).symbol("AAPL").build().unwrap();
    assert_eq!(req.contract, ContractSpec::stock("AAPL"));
    assert_eq!(req.ticker_id, 1000);
    assert!(!req.snapshot);
    assert!(req.generic_tick_list.is_empty());

    assert!(matches!(
      MarketDataRequest::builder(1).build(),
      Err(PipeError::Misconfigured(_))
    ));
  }

  #[test]
  fn builder_overrides() {
    let req = MarketDataRequest::builder(7)
      .symbol("ES")
      .sec_type("FUT")
      .exchange("GLOBEX")
      .currency("USD")
      .generic_tick_list("100,101")
      .snapshot(true)
      .build()
      .unwrap();
    assert_eq!(req.contract.sec_type, "FUT");
    assert_eq!(req.contract.exchange, "GLOBEX");
    assert_eq!(req.generic_tick_list, "100,101");
    assert!(req.snapshot);
  }
}

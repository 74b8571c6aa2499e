//! Shared handles every cache component works through.

use crate::calendar::TradingCalendar;
use crate::clock::Clock;
use crate::provider::MarketDataProvider;
use crate::store::RecordStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct CacheContext {
    pub store: Arc<RecordStore>,
    pub provider: Arc<dyn MarketDataProvider>,
    pub calendar: Arc<dyn TradingCalendar>,
    pub clock: Arc<dyn Clock>,
}

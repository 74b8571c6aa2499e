//! Domain types for the market-data cache

pub mod bar;
pub mod interval;
pub mod record;
pub mod table;

pub use bar::{Bar, PriceRow};
pub use interval::Interval;
pub use record::{metadata_from_json, CacheKey, Expiry, MetaValue, Metadata, Payload, Record};
pub use table::{PriceTable, SharesPoint, SharesTable, UnorderedRows};

/// Symbol type alias
pub type Symbol = String;

pub mod price_monitor;

pub use price_monitor::{
    AlertCallback, AlertKind, CachedPrice, MonitorStatus, PriceAlert, PriceChange, PriceMonitor,
    RangeAlertStatus, RangeLabel,
};

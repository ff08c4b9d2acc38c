//! Proxy domain: targets, probing, parsing, geolocation

pub mod geo;
pub mod models;
pub mod parser;
pub mod prober;

pub use geo::{GeoInfo, GeoLocator};
pub use models::{
    CheckResult, NewProxy, ProxyAuth, ProxyRecord, ProxyScheme, ProxyStatus, ProxyTarget,
};
pub use parser::ProxyParser;
pub use prober::{HttpProber, Probe, ProberConfig};

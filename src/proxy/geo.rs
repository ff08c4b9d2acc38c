//! Country lookup for proxy IPs using a MaxMind MMDB file

use crate::Result;
use maxminddb::{geoip2, Reader};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Location fields the dashboard stores alongside a proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoInfo {
    /// ISO 3166-1 alpha-2 country code (e.g. "US", "DE")
    pub country_code: Option<String>,
    /// City name in English
    pub city: Option<String>,
}

impl GeoInfo {
    pub fn is_empty(&self) -> bool {
        self.country_code.is_none() && self.city.is_none()
    }
}

/// IP geolocation over an MMDB database
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Open an MMDB file (GeoLite2-City or GeoLite2-Country)
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up a host. Hosts that are not IP literals and IPs the
    /// database does not know yield None rather than an error, so
    /// import flows can ignore them.
    pub fn lookup(&self, host: &str) -> Result<Option<GeoInfo>> {
        let ip: IpAddr = match host.parse() {
            Ok(ip) => ip,
            Err(_) => return Ok(None),
        };

        let lookup_result = self.reader.lookup(ip)?;
        let city: Option<geoip2::City> = lookup_result.decode()?;

        let Some(city) = city else {
            return Ok(None);
        };

        let info = GeoInfo {
            country_code: city.country.iso_code.map(String::from),
            city: city.city.names.english.map(String::from),
        };

        Ok(if info.is_empty() { None } else { Some(info) })
    }
}

impl Clone for GeoLocator {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
        }
    }
}

//! Parsed view of a caster sourcetable
//!
//! The raw sourcetable bytes are always relayed untouched; this module gives
//! library users (and the debug log) a structured view of the `STR` records:
//! stream format, carried messages, constellations and the station location,
//! which makes picking the nearest mountpoint possible.

use std::str::FromStr;

use geoutils::Location;
use isocountry::CountryCode;
use strum::{Display, EnumString, VariantNames};

use tracing::debug;

/// A caster's catalog: response metadata plus one entry per mountpoint.
#[derive(Clone, PartialEq, Debug)]
pub struct SourceTable {
    pub server: Option<String>,
    pub date: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<usize>,

    pub mounts: Vec<MountPoint>,
}

/// One `STR` record of the sourcetable.
#[derive(Clone, PartialEq, Debug)]
pub struct MountPoint {
    pub name: String,
    pub identifier: String,
    pub format: StreamFormat,
    /// Message list as advertised, e.g. `1004(1)`.
    pub messages: Vec<String>,
    pub constellations: Vec<Constellation>,
    pub network: String,
    pub country: Option<CountryCode>,
    pub location: Location,
}

/// Correction stream formats a caster may advertise.
#[derive(Clone, PartialEq, Debug, EnumString, Display, VariantNames)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StreamFormat {
    #[strum(serialize = "RTCM 2")]
    Rtcm2,
    #[strum(serialize = "RTCM 3")]
    Rtcm3,
    #[strum(serialize = "RTCM 3.0")]
    Rtcm3_0,
    #[strum(serialize = "RTCM 3.2")]
    Rtcm3_2,
    #[strum(serialize = "RTCM 3.3")]
    Rtcm3_3,
    #[strum(serialize = "CMRx")]
    CMRx,
    #[strum(serialize = "RAW")]
    Raw,
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

/// GNSS constellations named in the nav-system field.
#[derive(Clone, PartialEq, Debug, EnumString, Display, VariantNames)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Constellation {
    #[strum(serialize = "GPS")]
    Gps,
    #[strum(serialize = "GLO")]
    Glonass,
    #[strum(serialize = "GAL")]
    Galileo,
    #[strum(serialize = "BDS")]
    BeiDou,
    #[strum(serialize = "QZS")]
    Qzss,
    #[strum(serialize = "SBAS")]
    Sbas,
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

impl SourceTable {
    /// Parse a sourcetable body (and any response headers mixed in front of
    /// it) from an iterator of lines.
    pub fn parse<'a>(lines: impl Iterator<Item = &'a str>) -> Self {
        let mut table = SourceTable {
            server: None,
            date: None,
            content_type: None,
            content_length: None,
            mounts: Vec::new(),
        };

        for line in lines {
            if let Some(server) = line.strip_prefix("Server: ") {
                table.server = Some(server.to_string());
            } else if let Some(date) = line.strip_prefix("Date: ") {
                table.date = Some(date.to_string());
            } else if let Some(content_type) = line.strip_prefix("Content-Type: ") {
                table.content_type = Some(content_type.to_string());
            } else if let Some(length) = line.strip_prefix("Content-Length: ") {
                table.content_length = length.trim().parse().ok();
            } else if line.starts_with("STR;") {
                match MountPoint::parse(line) {
                    Some(mount) => table.mounts.push(mount),
                    None => {
                        debug!("Failed to parse STR line: {}", line);
                    }
                }
            }
        }

        table
    }

    /// Nearest mountpoint to `location` within 100 km, with its distance in
    /// meters.
    pub fn find_nearest(&self, location: &Location) -> Option<(&MountPoint, f64)> {
        let mut best: Option<(usize, f64)> = None;

        for (i, mount) in self.mounts.iter().enumerate() {
            let Ok(distance) = mount.location.distance_to(location) else {
                continue;
            };
            let meters = distance.meters();
            if meters < best.map_or(100_000f64, |(_, d)| d) {
                best = Some((i, meters));
            }
        }

        best.map(|(i, meters)| (&self.mounts[i], meters))
    }
}

impl MountPoint {
    /// Parse one `STR;…` record; `None` when the record is too short to
    /// name a stream.
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split(';').collect();
        if parts.first() != Some(&"STR") || parts.len() < 3 {
            return None;
        }

        let field = |i: usize| parts.get(i).map(|s| s.trim());

        let format = field(3)
            .and_then(|s| StreamFormat::from_str(s).ok())
            .unwrap_or(StreamFormat::Raw);

        let messages = field(4)
            .map(|msgs| {
                msgs.split(',')
                    .filter(|m| !m.is_empty())
                    .map(|m| m.trim().to_string())
                    .collect()
            })
            .unwrap_or_default();

        // field 5 is the carrier phase indicator, unused here
        let constellations = field(6)
            .map(|systems| {
                systems
                    .split('+')
                    .filter(|s| !s.is_empty())
                    .map(|s| Constellation::from_str(s).unwrap_or(Constellation::Unknown))
                    .collect()
            })
            .unwrap_or_default();

        let country = field(8).and_then(|s| CountryCode::for_alpha3(s).ok());

        let location = Location::new(
            field(9).and_then(|s| s.parse().ok()).unwrap_or(0.0),
            field(10).and_then(|s| s.parse().ok()).unwrap_or(0.0),
        );

        Some(MountPoint {
            name: parts[1].to_string(),
            identifier: parts[2].trim().to_string(),
            format,
            messages,
            constellations,
            network: field(7).unwrap_or("").to_string(),
            country,
            location,
        })
    }
}

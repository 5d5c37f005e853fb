//! Configuration surface (§6, §7.2): the name/value attributes the array's
//! host exposes for a bitmap, each read as a short ASCII string and written
//! with validation. Mirrors the teacher's small parsed-value-type pattern
//! (`PageSize: FromStr` in the CLI) rather than a generic key/value map.
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::consts::{COUNTER_MAX, MAX_SCHED_SECONDS};
use crate::error::BitmapError;

macro_rules! warn_once_file_location {
    () => {{
        use $crate::deps::lazy_static::lazy_static;
        use $crate::deps::log::warn;

        lazy_static! {
            static ref WARNED: ::std::sync::Once = ::std::sync::Once::new();
        }

        (&*WARNED).call_once(|| {
            warn!("[WARN_ONCE] `file:` bitmap location is parsed but not supported");
        })
    }};
}

/// `location`: where the bitmap image lives relative to the array's
/// superblock. `File` is parsed but rejected -- re-enabling it needs a
/// concrete file-open contract the spec's Open Questions defer (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    None,
    Offset(i64),
}

impl FromStr for Location {
    type Err = BitmapError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value == "none" {
            return Ok(Location::None);
        }
        if let Some(rest) = value.strip_prefix("file:") {
            warn_once_file_location!();
            return Err(BitmapError::Parse {
                value: value.to_string(),
                typename: "Location",
                reason: format!("file-backed location {:?} is parsed but not supported", rest),
            });
        }
        if let Some(digits) = value.strip_prefix('+') {
            return digits
                .parse::<i64>()
                .map(Location::Offset)
                .map_err(|e| parse_err::<Location>(value, e.to_string()));
        }
        if let Some(digits) = value.strip_prefix('-') {
            return digits
                .parse::<i64>()
                .map(|n: i64| Location::Offset(-n))
                .map_err(|e| parse_err::<Location>(value, e.to_string()));
        }
        Err(parse_err::<Location>(
            value,
            "value was not one of: none, +<N>, -<N>, file:...".to_string(),
        ))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Location::None => write!(f, "none"),
            Location::Offset(n) if *n >= 0 => write!(f, "+{}", n),
            Location::Offset(n) => write!(f, "-{}", -n),
        }
    }
}

/// `metadata`: whether the superblock is embedded with the bit array
/// (`Internal`) or tracked by the array's own metadata (`External`, no
/// superblock page).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metadata {
    Internal,
    External,
}

impl FromStr for Metadata {
    type Err = BitmapError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "internal" => Ok(Metadata::Internal),
            "external" => Ok(Metadata::External),
            _ => Err(parse_err::<Metadata>(
                value,
                "value was not one of: internal, external".to_string(),
            )),
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Metadata::Internal => write!(f, "internal"),
            Metadata::External => write!(f, "external"),
        }
    }
}

fn parse_err<T>(value: &str, reason: String) -> BitmapError {
    BitmapError::Parse {
        value: value.to_string(),
        typename: std::any::type_name::<T>(),
        reason,
    }
}

/// `max_backlog_used`'s high-water mark (§6). A tiny free-standing counter
/// rather than a `Bitmap` field so the config surface can read/reset it
/// without borrowing the whole bitmap mutably -- the `Bitmap` root stores
/// the real gauge and exposes this view via `ConfigView`.
#[derive(Debug, Default)]
pub struct HighWaterMark(AtomicU64);

impl HighWaterMark {
    pub fn record(&self, value: u64) {
        self.0.fetch_max(value, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Reading `max_backlog_used` is side-effecting: any write resets it to
    /// zero (§6).
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::SeqCst)
    }
}

/// One validated configuration attribute (§6). `parse(name, value)` is the
/// entry point used by both the CLI's `config set` subcommand and direct
/// library callers; `render()` is the matching read-side formatter.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Location(Location),
    Space { sectors: u64 },
    TimeBase(std::time::Duration),
    Backlog(u32),
    ChunkSize(u32),
    Metadata(Metadata),
    CanClear(bool),
}

impl Attribute {
    pub fn parse(name: &str, value: &str) -> Result<Self, BitmapError> {
        match name {
            "location" => Ok(Attribute::Location(value.parse()?)),
            "space" => {
                let sectors = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| parse_err::<Attribute>(value, e.to_string()))?;
                Ok(Attribute::Space { sectors })
            }
            "time_base" => {
                let seconds: f64 = value
                    .trim()
                    .parse()
                    .map_err(|e: std::num::ParseFloatError| parse_err::<Attribute>(value, e.to_string()))?;
                if !(1.0..=(MAX_SCHED_SECONDS as f64)).contains(&seconds) {
                    return Err(parse_err::<Attribute>(
                        value,
                        format!("daemon_sleep must be within [1, {}] seconds", MAX_SCHED_SECONDS),
                    ));
                }
                Ok(Attribute::TimeBase(std::time::Duration::from_secs_f64(seconds)))
            }
            "backlog" => {
                let n = value
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| parse_err::<Attribute>(value, e.to_string()))?;
                if n as u16 > COUNTER_MAX {
                    return Err(parse_err::<Attribute>(
                        value,
                        format!("backlog must not exceed {}", COUNTER_MAX),
                    ));
                }
                Ok(Attribute::Backlog(n))
            }
            "chunksize" => {
                let n = value
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| parse_err::<Attribute>(value, e.to_string()))?;
                if n < 512 || !n.is_power_of_two() {
                    return Err(parse_err::<Attribute>(
                        value,
                        "chunksize must be a power of two >= 512".to_string(),
                    ));
                }
                Ok(Attribute::ChunkSize(n))
            }
            "metadata" => Ok(Attribute::Metadata(value.parse()?)),
            "can_clear" => {
                let b = value
                    .trim()
                    .parse::<bool>()
                    .map_err(|e| parse_err::<Attribute>(value, e.to_string()))?;
                Ok(Attribute::CanClear(b))
            }
            "max_backlog_used" => Err(BitmapError::Busy {
                reason: "max_backlog_used is read-only; writing it resets it to zero".into(),
            }),
            other => Err(BitmapError::Parse {
                value: value.to_string(),
                typename: "Attribute",
                reason: format!("unknown attribute {:?}", other),
            }),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Attribute::Location(loc) => loc.to_string(),
            Attribute::Space { sectors } => sectors.to_string(),
            Attribute::TimeBase(d) => format!("{:.4}", d.as_secs_f64()),
            Attribute::Backlog(n) => n.to_string(),
            Attribute::ChunkSize(n) => n.to_string(),
            Attribute::Metadata(m) => m.to_string(),
            Attribute::CanClear(b) => b.to_string(),
        }
    }
}

/// Guards applied before an `Attribute` write is allowed to take effect
/// (§6, §7): `chunksize` only while no bitmap is active, `can_clear=true`
/// only on a non-degraded array.
pub fn check_store_allowed(
    attr: &Attribute,
    bitmap_active: bool,
    array_degraded: bool,
) -> Result<(), BitmapError> {
    match attr {
        Attribute::ChunkSize(_) if bitmap_active => Err(BitmapError::Busy {
            reason: "chunksize is editable only when no bitmap is active".into(),
        }),
        Attribute::CanClear(true) if array_degraded => Err(BitmapError::Busy {
            reason: "can_clear cannot be set true on a degraded array".into(),
        }),
        _ => Ok(()),
    }
}

use crate::deps::lazy_static::lazy_static;

lazy_static! {
    /// Every writable attribute name, used by the CLI to validate `config
    /// set <name>` before even trying to parse the value, and to drive
    /// `config list` (mirrors the teacher's static lookup-table pattern in
    /// `maps/column.rs`).
    pub static ref ATTRIBUTE_NAMES: Vec<&'static str> = vec![
        "location",
        "space",
        "time_base",
        "backlog",
        "chunksize",
        "metadata",
        "can_clear",
        "max_backlog_used",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_round_trips_positive_and_negative_offsets() {
        assert_eq!(Location::from_str("+8").unwrap(), Location::Offset(8));
        assert_eq!(Location::from_str("-8").unwrap(), Location::Offset(-8));
        assert_eq!(Location::from_str("none").unwrap(), Location::None);
        assert_eq!(Location::Offset(8).to_string(), "+8");
        assert_eq!(Location::Offset(-8).to_string(), "-8");
    }

    #[test]
    fn file_location_is_parsed_but_rejected() {
        let err = Location::from_str("file:/tmp/foo");
        assert!(err.is_err());
    }

    #[test]
    fn chunksize_rejects_non_power_of_two() {
        assert!(Attribute::parse("chunksize", "4097").is_err());
        assert!(Attribute::parse("chunksize", "4096").is_ok());
    }

    #[test]
    fn backlog_rejects_values_above_counter_max() {
        assert!(Attribute::parse("backlog", "100000").is_err());
        assert!(Attribute::parse("backlog", "16").is_ok());
    }

    #[test]
    fn can_clear_true_rejected_on_degraded_array() {
        let attr = Attribute::parse("can_clear", "true").unwrap();
        assert!(check_store_allowed(&attr, false, true).is_err());
        assert!(check_store_allowed(&attr, false, false).is_ok());
    }

    #[test]
    fn chunksize_store_rejected_while_bitmap_active() {
        let attr = Attribute::parse("chunksize", "8192").unwrap();
        assert!(check_store_allowed(&attr, true, false).is_err());
        assert!(check_store_allowed(&attr, false, false).is_ok());
    }

    #[test]
    fn high_water_mark_tracks_max_and_resets_on_read() {
        let hwm = HighWaterMark::default();
        hwm.record(3);
        hwm.record(1);
        hwm.record(5);
        assert_eq!(hwm.get(), 5);
        assert_eq!(hwm.take(), 5);
        assert_eq!(hwm.get(), 0);
    }

    #[test]
    fn max_backlog_used_is_read_only() {
        assert!(Attribute::parse("max_backlog_used", "0").is_err());
    }
}

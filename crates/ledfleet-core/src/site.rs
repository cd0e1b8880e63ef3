//! Data-driven site topology.
//!
//! A site is described by plain data: its pixel count, target frame rate,
//! the device channels that slice its buffer, and a schedule of producers.
//! Nothing here performs I/O; the engine turns descriptors into running
//! schedulers and channel workers.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::producer::ProducerSpec;

/// TCP port the device firmware listens on.
pub const DEFAULT_DEVICE_PORT: u16 = 49152;

// ============================================================================
// Clock Format
// ============================================================================

/// Which timestamp layout a device's firmware understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockFormat {
    /// 64-bit seconds and microseconds (current firmware)
    #[default]
    Wide64,
    /// 32-bit seconds and microseconds (firmware predating 64-bit clocks)
    Legacy32,
}

impl ClockFormat {
    /// Returns true for firmware that predates 64-bit clock support.
    pub fn is_legacy(self) -> bool {
        matches!(self, Self::Legacy32)
    }
}

impl fmt::Display for ClockFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wide64 => write!(f, "wide64"),
            Self::Legacy32 => write!(f, "legacy32"),
        }
    }
}

// ============================================================================
// Channel Descriptor
// ============================================================================

/// One contiguous LED segment delivered to one device on one logical channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Device hostname (or IP literal)
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Human-readable label shown in telemetry
    #[serde(rename = "name")]
    pub friendly_name: String,

    #[serde(default)]
    pub offset: usize,

    pub length: usize,

    /// Strip is fed from its far end
    #[serde(default)]
    pub reversed: bool,

    #[serde(default)]
    pub swap_red_green: bool,

    #[serde(default = "default_true")]
    pub compress: bool,

    /// Logical LED channel on the device (0 if unused)
    #[serde(default)]
    pub channel: u16,

    /// Frames to accumulate before a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub clock: ClockFormat,
}

fn default_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    1
}

impl ChannelDescriptor {
    /// Creates a descriptor with default flags for `[offset, offset + length)`.
    pub fn new(
        host: impl Into<String>,
        friendly_name: impl Into<String>,
        offset: usize,
        length: usize,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_DEVICE_PORT,
            friendly_name: friendly_name.into(),
            offset,
            length,
            reversed: false,
            swap_red_green: false,
            compress: true,
            channel: 0,
            batch_size: 1,
            clock: ClockFormat::Wide64,
        }
    }

    /// Exclusive end of the segment, if it does not overflow.
    pub fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.length)
    }

    /// Checks the descriptor against a site buffer of `width` pixels.
    pub fn validate(&self, width: usize) -> DomainResult<()> {
        if self.host.trim().is_empty() {
            return Err(DomainError::invalid("host", &self.host, "non-empty hostname"));
        }
        if self.length == 0 {
            return Err(DomainError::invalid("length", self.length, "> 0"));
        }
        if self.batch_size == 0 {
            return Err(DomainError::invalid("batch_size", self.batch_size, ">= 1"));
        }
        match self.end() {
            Some(end) if end <= width => Ok(()),
            _ => Err(DomainError::SegmentOutOfRange {
                offset: self.offset,
                length: self.length,
                width,
            }),
        }
    }
}

// ============================================================================
// Schedule Windows
// ============================================================================

/// A set of weekdays, stored as a bitmask with Monday in bit 0.
///
/// Deserializes from `"all"`, `"weekdays"`, `"weekends"`, or a list of day
/// names such as `["mon", "fri"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DaySet(u8);

impl DaySet {
    pub const ALL: DaySet = DaySet(0b111_1111);
    pub const WEEKDAYS: DaySet = DaySet(0b001_1111);
    pub const WEEKENDS: DaySet = DaySet(0b110_0000);
    pub const NONE: DaySet = DaySet(0);

    /// Builds a set from individual days.
    pub fn from_days(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self(
            days.into_iter()
                .fold(0, |mask, day| mask | (1 << day.num_days_from_monday())),
        )
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for DaySet {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDaySet {
    Named(String),
    List(Vec<String>),
}

fn parse_weekday(name: &str) -> DomainResult<Weekday> {
    name.trim()
        .parse::<Weekday>()
        .map_err(|_| DomainError::invalid("days", name, "weekday name like \"mon\""))
}

impl TryFrom<RawDaySet> for DaySet {
    type Error = DomainError;

    fn try_from(raw: RawDaySet) -> Result<Self, Self::Error> {
        match raw {
            RawDaySet::Named(name) => match name.trim().to_ascii_lowercase().as_str() {
                "all" | "daily" => Ok(Self::ALL),
                "weekdays" => Ok(Self::WEEKDAYS),
                "weekends" => Ok(Self::WEEKENDS),
                other => Ok(Self::from_days([parse_weekday(other)?])),
            },
            RawDaySet::List(names) => {
                let days = names
                    .iter()
                    .map(|n| parse_weekday(n))
                    .collect::<DomainResult<Vec<_>>>()?;
                Ok(Self::from_days(days))
            }
        }
    }
}

impl<'de> Deserialize<'de> for DaySet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawDaySet::deserialize(deserializer)?;
        DaySet::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for DaySet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let days: Vec<String> = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter(|d| self.contains(*d))
        .map(|d| d.to_string().to_ascii_lowercase())
        .collect();
        days.serialize(serializer)
    }
}

/// Wall-clock time of day with minute resolution. `24:00` is allowed as an
/// end-of-day marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay { hour: 0, minute: 0 };
    pub const END_OF_DAY: TimeOfDay = TimeOfDay { hour: 24, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> DomainResult<Self> {
        let valid = (hour < 24 && minute < 60) || (hour == 24 && minute == 0);
        if !valid {
            return Err(DomainError::invalid(
                "time",
                format!("{hour:02}:{minute:02}"),
                "HH:MM between 00:00 and 24:00",
            ));
        }
        Ok(Self { hour, minute })
    }

    fn minutes(self) -> u32 {
        u32::from(self.hour) * 60 + u32::from(self.minute)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_err = || DomainError::ParseError {
            field: "time".to_string(),
            reason: format!("{s:?} is not HH:MM"),
        };
        let (h, m) = s.trim().split_once(':').ok_or_else(parse_err)?;
        let hour = h.parse::<u8>().map_err(|_| parse_err())?;
        let minute = m.parse::<u8>().map_err(|_| parse_err())?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

/// Days plus an inclusive start/end time during which a producer may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    #[serde(default)]
    pub days: DaySet,
    #[serde(default = "start_of_day")]
    pub start: TimeOfDay,
    #[serde(default = "end_of_day")]
    pub end: TimeOfDay,
}

fn start_of_day() -> TimeOfDay {
    TimeOfDay::MIDNIGHT
}

fn end_of_day() -> TimeOfDay {
    TimeOfDay::END_OF_DAY
}

impl ScheduleWindow {
    /// A window covering every minute of every day.
    pub const ALWAYS: ScheduleWindow = ScheduleWindow {
        days: DaySet::ALL,
        start: TimeOfDay::MIDNIGHT,
        end: TimeOfDay::END_OF_DAY,
    };

    pub fn new(days: DaySet, start: TimeOfDay, end: TimeOfDay) -> Self {
        Self { days, start, end }
    }

    /// Returns true if `now` falls on an included day and between `start`
    /// and `end`, both inclusive.
    pub fn contains<T: Datelike + Timelike>(&self, now: &T) -> bool {
        if !self.days.contains(now.weekday()) {
            return false;
        }
        let minutes = now.hour() * 60 + now.minute();
        minutes >= self.start.minutes() && minutes <= self.end.minutes()
    }
}

impl Default for ScheduleWindow {
    fn default() -> Self {
        Self::ALWAYS
    }
}

/// A producer specification together with the window it is eligible in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(flatten)]
    pub window: ScheduleWindow,
    pub producer: ProducerSpec,
}

// ============================================================================
// Site Descriptor
// ============================================================================

/// Static description of one physical installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteDescriptor {
    pub name: String,

    /// Number of pixels in the site buffer
    pub width: usize,

    /// Target frame rate; 0 means unset
    #[serde(default)]
    pub fps: u32,

    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelDescriptor>,

    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

impl SiteDescriptor {
    /// Validates the site and every channel segment against its width.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::invalid("site name", &self.name, "non-empty"));
        }
        if self.width == 0 {
            return Err(DomainError::invalid("width", self.width, "> 0"));
        }
        for channel in &self.channels {
            channel.validate(self.width)?;
        }
        for entry in &self.schedule {
            if entry.window.days.is_empty() {
                return Err(DomainError::invalid("days", "[]", "at least one day"));
            }
            if entry.window.start > entry.window.end {
                return Err(DomainError::invalid(
                    "schedule",
                    format!("{}-{}", entry.window.start, entry.window.end),
                    "start <= end",
                ));
            }
        }
        Ok(())
    }
}

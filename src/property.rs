//! Typed catalog of the detector properties used by this crate.
//!
//! The detector itself only speaks text; these types give callers a checked
//! way to read and write the handful of properties the acquisition flow
//! depends on. Arbitrary names still work through `ControlClient::get`/`set`.

use std::fmt;
use std::str::FromStr;

use crate::error::{AppResult, MerlinError};

/// Value of `TRIGGERSTART` selecting the software trigger.
pub const SOFTWARE_TRIGGER: i64 = 5;

/// Value type carried by a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Signed integer
    Int,
    /// Floating point
    Float,
    /// `0`/`1` on the wire.
    Bool,
}

/// Known detector properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    /// Photon energy, keV
    OperatingEnergy,
    /// Trigger source; 5 selects the software trigger
    TriggerStart,
    /// Exposure time in milliseconds
    AcquisitionTime,
    /// Frame period in milliseconds
    AcquisitionPeriod,
    /// Frames in the next acquisition
    NumFramesToAcquire,
    /// Frames acquired per trigger
    NumFramesPerTrigger,
    /// Continuous read/write mode
    ContinuousRw,
    /// Counter depth in bits
    CounterDepth,
    /// Detector state; 1 and 4 mean armed
    DetectorStatus,
}

impl Property {
    /// Every catalogued property.
    pub const ALL: [Property; 9] = [
        Property::OperatingEnergy,
        Property::TriggerStart,
        Property::AcquisitionTime,
        Property::AcquisitionPeriod,
        Property::NumFramesToAcquire,
        Property::NumFramesPerTrigger,
        Property::ContinuousRw,
        Property::CounterDepth,
        Property::DetectorStatus,
    ];

    /// Name as sent on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Self::OperatingEnergy => "OPERATINGENERGY",
            Self::TriggerStart => "TRIGGERSTART",
            Self::AcquisitionTime => "ACQUISITIONTIME",
            Self::AcquisitionPeriod => "ACQUISITIONPERIOD",
            Self::NumFramesToAcquire => "NUMFRAMESTOACQUIRE",
            Self::NumFramesPerTrigger => "NUMFRAMESPERTRIGGER",
            Self::ContinuousRw => "CONTINUOUSRW",
            Self::CounterDepth => "COUNTERDEPTH",
            Self::DetectorStatus => "DETECTORSTATUS",
        }
    }

    /// Value kind this property takes.
    pub fn kind(self) -> ValueKind {
        match self {
            Self::OperatingEnergy | Self::AcquisitionTime | Self::AcquisitionPeriod => {
                ValueKind::Float
            }
            Self::ContinuousRw => ValueKind::Bool,
            Self::TriggerStart
            | Self::NumFramesToAcquire
            | Self::NumFramesPerTrigger
            | Self::CounterDepth
            | Self::DetectorStatus => ValueKind::Int,
        }
    }

    /// Parse the text of a GET response into this property's value kind.
    pub fn parse_value(self, text: &str) -> AppResult<PropertyValue> {
        let text = text.trim();
        let invalid = || {
            MerlinError::Decode(format!(
                "{} value {:?} is not a valid {:?}",
                self.name(),
                text,
                self.kind()
            ))
        };
        match self.kind() {
            ValueKind::Int => text
                .parse()
                .map(PropertyValue::Int)
                .or_else(|_| {
                    // The detector sometimes reports integers as "12.0".
                    text.parse::<f64>()
                        .ok()
                        .filter(|v| v.fract() == 0.0)
                        .map(|v| PropertyValue::Int(v as i64))
                        .ok_or_else(invalid)
                }),
            ValueKind::Float => text.parse().map(PropertyValue::Float).map_err(|_| invalid()),
            ValueKind::Bool => match text {
                "0" => Ok(PropertyValue::Bool(false)),
                "1" => Ok(PropertyValue::Bool(true)),
                _ => Err(invalid()),
            },
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Property {
    type Err = MerlinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| MerlinError::Decode(format!("unknown property {:?}", s)))
    }
}

/// A typed property value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    /// Integer value
    Int(i64),
    /// Floating-point value
    Float(f64),
    /// Boolean, `0`/`1` on the wire
    Bool(bool),
}

impl PropertyValue {
    /// Integer view; `None` for floats.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(v),
            Self::Bool(v) => Some(i64::from(v)),
            Self::Float(_) => None,
        }
    }

    /// Numeric view of any value.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
            Self::Bool(v) => f64::from(u8::from(v)),
        }
    }

    /// Kind of this value.
    pub fn kind(self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Bool(_) => ValueKind::Bool,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", u8::from(*v)),
        }
    }
}

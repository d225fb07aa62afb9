//! Room status derived from the latest reading of a sensor topic.

#![allow(missing_docs)]

use serde::Serialize;

use crate::core::config::StatusConfig;
use crate::registry::topics::topic_label;

/// What a topic measures, inferred from its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Co2,
    AirTemperature,
    RelativeHumidity,
    Other,
}

impl SensorKind {
    #[must_use]
    pub fn of_topic(topic: &str) -> Self {
        let label = topic_label(topic).to_ascii_lowercase();
        if label.ends_with("co2-ppm") {
            Self::Co2
        } else if label.contains("air-temperature") {
            Self::AirTemperature
        } else if label.ends_with("rh-percent") || label.ends_with("rh|percent") {
            Self::RelativeHumidity
        } else {
            Self::Other
        }
    }
}

/// Classification shown next to a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Occupied,
    Unoccupied,
    Low,
    Normal,
    High,
    NoData,
    Unknown,
}

impl Status {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Occupied => "Occupied",
            Self::Unoccupied => "Unoccupied",
            Self::Low => "Low",
            Self::Normal => "Normal",
            Self::High => "High",
            Self::NoData => "No Data",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Classify the latest value of `topic`. `None` means the topic has no rows yet.
#[must_use]
pub fn classify(topic: &str, latest: Option<f64>, thresholds: &StatusConfig) -> Status {
    let Some(value) = latest else {
        return Status::NoData;
    };
    match SensorKind::of_topic(topic) {
        SensorKind::Co2 => {
            if value > thresholds.co2_occupied_ppm {
                Status::Occupied
            } else {
                Status::Unoccupied
            }
        }
        SensorKind::AirTemperature => band(
            value,
            thresholds.temperature_low_c,
            thresholds.temperature_high_c,
        ),
        SensorKind::RelativeHumidity => {
            band(value, thresholds.humidity_low_pct, thresholds.humidity_high_pct)
        }
        SensorKind::Other => Status::Unknown,
    }
}

fn band(value: f64, low: f64, high: f64) -> Status {
    if value < low {
        Status::Low
    } else if value > high {
        Status::High
    } else {
        Status::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CO2: &str = "KNX/13/0/0<Livingroom.Sensors.CO2-ppm>";
    const TEMP: &str = "KNX/14/0/2<Bedroom.Sensors.Air-temperature-C>";
    const RH: &str = "KNX/15/0/1<Bathroom.Sensors.RH|percent>";
    const FLOOR: &str = "KNX/15/0/3<Bathroom.Sensors.Floor-temp-C>";

    #[test]
    fn co2_occupancy_threshold() {
        let t = StatusConfig::default();
        assert_eq!(classify(CO2, Some(612.0), &t), Status::Occupied);
        assert_eq!(classify(CO2, Some(429.5), &t), Status::Unoccupied);
        assert_eq!(classify(CO2, Some(410.0), &t), Status::Unoccupied);
    }

    #[test]
    fn temperature_bands_are_inclusive() {
        let t = StatusConfig::default();
        assert_eq!(classify(TEMP, Some(17.9), &t), Status::Low);
        assert_eq!(classify(TEMP, Some(18.0), &t), Status::Normal);
        assert_eq!(classify(TEMP, Some(24.0), &t), Status::Normal);
        assert_eq!(classify(TEMP, Some(24.1), &t), Status::High);
    }

    #[test]
    fn humidity_matches_both_label_spellings() {
        let t = StatusConfig::default();
        assert_eq!(SensorKind::of_topic(RH), SensorKind::RelativeHumidity);
        assert_eq!(
            SensorKind::of_topic("KNX/13/0/1<Livingroom.Sensors.Rh-percent>"),
            SensorKind::RelativeHumidity
        );
        assert_eq!(classify(RH, Some(65.0), &t), Status::High);
        assert_eq!(classify(RH, Some(45.0), &t), Status::Normal);
    }

    #[test]
    fn missing_value_and_other_kinds() {
        let t = StatusConfig::default();
        assert_eq!(classify(TEMP, None, &t), Status::NoData);
        assert_eq!(classify(FLOOR, Some(22.0), &t), Status::Unknown);
        assert_eq!(Status::NoData.to_string(), "No Data");
    }
}

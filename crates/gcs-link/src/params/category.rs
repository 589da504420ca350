//! ArduPilot parameter grouping by subsystem.
//!
//! Rules are substring matches on the upper-cased name, tried in order; the
//! first hit wins. Several prefixes overlap ("RC" appears in many names) so
//! the order matters as much as the keywords.

use std::collections::BTreeMap;

use serde::Serialize;

use super::ParameterTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Category {
    System,
    #[serde(rename = "GPS")]
    Gps,
    Battery,
    Serial,
    Compass,
    #[serde(rename = "IMU")]
    Imu,
    Navigation,
    Motors,
    Servos,
    #[serde(rename = "RC")]
    Rc,
    #[serde(rename = "Flight Modes")]
    FlightModes,
    Safety,
    #[serde(rename = "EKF")]
    Ekf,
    #[serde(rename = "AHRS")]
    Ahrs,
    Control,
    Pilot,
    Landing,
    Barometer,
    RangeFinder,
    #[serde(rename = "RPM")]
    Rpm,
    Notifications,
    #[serde(rename = "OSD")]
    Osd,
    Logging,
    Scheduler,
    Streaming,
    Miscellaneous,
}

enum Match {
    Contains(&'static [&'static str]),
    Exact(&'static str),
}

use Match::{Contains, Exact};

const RULES: &[(Category, &[Match])] = &[
    (Category::System, &[Contains(&["SYSID", "FORMAT", "FRAME", "BRD_", "STAT_", "DEV_"])]),
    (Category::Gps, &[Contains(&["GPS"])]),
    (Category::Battery, &[Contains(&["BATT", "MOT_BAT"])]),
    (Category::Serial, &[Contains(&["SERIAL", "TELEM"])]),
    (Category::Compass, &[Contains(&["COMPASS", "ARMING_MAGTHRESH"])]),
    (Category::Imu, &[Contains(&["INS_", "EK3_IMU"])]),
    (
        Category::Navigation,
        &[Contains(&[
            "WPNAV", "RTL_", "LOIT", "CIRCLE", "AVOID", "RALLY", "FENCE", "SRTL", "GUID", "SURFTRAK", "WP_YAW",
        ])],
    ),
    (Category::Motors, &[Contains(&["MOT_", "ESC_"])]),
    (Category::Servos, &[Contains(&["SERVO"])]),
    (Category::Rc, &[Contains(&["RC"])]),
    (Category::FlightModes, &[Contains(&["FLTMODE", "INITIAL_MODE", "SIMPLE", "THROW_"])]),
    (Category::Safety, &[Contains(&["FS_", "ARMING", "DISARM"])]),
    (Category::Ekf, &[Contains(&["EK3_"]), Exact("AHRS_EKF_TYPE")]),
    (Category::Ahrs, &[Contains(&["AHRS_"])]),
    (Category::Control, &[Contains(&["ATC_", "PSC_", "ACRO_", "ANGLE_", "PHLD_"])]),
    (Category::Pilot, &[Contains(&["PILOT_", "TKOFF_", "THR_DZ"])]),
    (Category::Landing, &[Contains(&["LAND_", "PLDP_"])]),
    (Category::Barometer, &[Contains(&["BARO"])]),
    (Category::RangeFinder, &[Contains(&["RNGFND"])]),
    (Category::Rpm, &[Contains(&["RPM"])]),
    (Category::Notifications, &[Contains(&["NTF_"])]),
    (Category::Osd, &[Contains(&["OSD"])]),
    (Category::Logging, &[Contains(&["LOG_"])]),
    (Category::Scheduler, &[Contains(&["SCHED"])]),
    (Category::Streaming, &[Contains(&["SR"])]),
];

pub fn categorize_name(name: &str) -> Category {
    let upper = name.to_ascii_uppercase();
    RULES
        .iter()
        .find(|(_, matchers)| {
            matchers.iter().any(|m| match m {
                Contains(kws) => kws.iter().any(|kw| upper.contains(kw)),
                Exact(s) => upper == *s,
            })
        })
        .map(|(c, _)| *c)
        .unwrap_or(Category::Miscellaneous)
}

pub type CategorizedParameters = BTreeMap<Category, BTreeMap<String, f32>>;

/// Only categories with at least one parameter are present.
pub fn categorize(table: &ParameterTable) -> CategorizedParameters {
    let mut out: CategorizedParameters = BTreeMap::new();
    for (name, value) in table.iter() {
        out.entry(categorize_name(name)).or_default().insert(name.to_string(), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_rule_wins() {
        assert_eq!(categorize_name("SYSID_THISMAV"), Category::System);
        assert_eq!(categorize_name("AHRS_GPS_USE"), Category::Gps);
        assert_eq!(categorize_name("MOT_BAT_VOLT_MAX"), Category::Battery);
        assert_eq!(categorize_name("MOT_SPIN_ARM"), Category::Motors);
        assert_eq!(categorize_name("SERIAL2_PROTOCOL"), Category::Serial);
        assert_eq!(categorize_name("ARMING_MAGTHRESH"), Category::Compass);
        assert_eq!(categorize_name("ARMING_CHECK"), Category::Safety);
        assert_eq!(categorize_name("EK3_IMU_MASK"), Category::Imu);
        assert_eq!(categorize_name("EK3_ENABLE"), Category::Ekf);
        assert_eq!(categorize_name("AHRS_EKF_TYPE"), Category::Ekf);
        assert_eq!(categorize_name("AHRS_ORIENTATION"), Category::Ahrs);
        assert_eq!(categorize_name("RC7_OPTION"), Category::Rc);
        assert_eq!(categorize_name("CIRCLE_RADIUS"), Category::Navigation);
        assert_eq!(categorize_name("FLTMODE1"), Category::FlightModes);
        assert_eq!(categorize_name("ATC_RAT_RLL_P"), Category::Control);
        assert_eq!(categorize_name("SR0_EXTRA1"), Category::Streaming);
        assert_eq!(categorize_name("TERRAIN_ENABLE"), Category::Miscellaneous);
    }

    #[test]
    fn matching_ignores_case() {
        assert_eq!(categorize_name("batt_monitor"), Category::Battery);
    }

    #[test]
    fn groups_table_by_category() {
        let table: ParameterTable =
            [("BATT_MONITOR", 4.0), ("BATT_CAPACITY", 5200.0), ("GPS_TYPE", 1.0), ("FLTMODE1", 0.0)]
                .into_iter()
                .collect();
        let cats = categorize(&table);
        assert_eq!(cats.len(), 3);
        assert_eq!(cats[&Category::Battery].len(), 2);
        assert_eq!(cats[&Category::Gps]["GPS_TYPE"], 1.0);

        let json = serde_json::to_value(&cats).unwrap();
        assert!(json.get("GPS").is_some());
        assert_eq!(json["Flight Modes"]["FLTMODE1"], 0.0);
        assert!(json.get("Gps").is_none());
    }
}

//! Wind-direction directives and their direction-group keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShadeError};

/// Key shared by the directives of one direction group.
///
/// Numeric keys sort numerically and before label keys, so `BTreeMap`s keyed
/// by `GroupKey` list sectors in compass order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupKey {
    Number(u64),
    Label(String),
}

impl GroupKey {
    /// File stem for the persisted group maximum, e.g. `45_max`.
    pub fn artifact_stem(&self) -> String {
        format!("{self}_max")
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Number(n) => write!(f, "{n}"),
            GroupKey::Label(s) => f.write_str(s),
        }
    }
}

/// Group key of a free-text label: the first run of ASCII digits, read as an
/// integer. Labels without digits (or with a digit run too long for `u64`)
/// are keyed by the full label.
pub fn group_key_from_label(label: &str) -> GroupKey {
    let digits: String = label
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    match digits.parse::<u64>() {
        Ok(n) => GroupKey::Number(n),
        Err(_) => GroupKey::Label(label.to_string()),
    }
}

/// One wind direction to scan: where the wind comes from, how steep the
/// sheltering sightline is, and which class shadowed cells receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Directive {
    label: String,
    bearing_deg: f64,
    altitude_deg: f64,
    severity_class: u32,
    group_key: GroupKey,
}

impl Directive {
    /// Validates and normalises a directive; the group key is derived from the label.
    ///
    /// The bearing is reduced to `[0, 360)`. The altitude must lie in `(0, 90]`
    /// and the severity class must be at least 1.
    pub fn new(
        label: impl Into<String>,
        bearing_deg: f64,
        altitude_deg: f64,
        severity_class: u32,
    ) -> Result<Self> {
        let label = label.into();
        let group_key = group_key_from_label(&label);
        Self::with_group_key(label, bearing_deg, altitude_deg, severity_class, group_key)
    }

    pub fn with_group_key(
        label: impl Into<String>,
        bearing_deg: f64,
        altitude_deg: f64,
        severity_class: u32,
        group_key: GroupKey,
    ) -> Result<Self> {
        let label = label.into();
        let invalid = |reason: String| ShadeError::InvalidDirective {
            label: label.clone(),
            reason,
        };

        if !bearing_deg.is_finite() {
            return Err(invalid(format!("bearing must be finite, got {bearing_deg}")));
        }
        if !altitude_deg.is_finite() || altitude_deg <= 0.0 || altitude_deg > 90.0 {
            return Err(invalid(format!(
                "altitude must lie in (0, 90] degrees, got {altitude_deg}"
            )));
        }
        if severity_class == 0 {
            return Err(invalid("severity class must be a positive integer".into()));
        }

        Ok(Self {
            bearing_deg: normalize_bearing(bearing_deg),
            altitude_deg,
            severity_class,
            group_key,
            label,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Compass bearing the wind arrives from, degrees clockwise from north.
    pub fn bearing_deg(&self) -> f64 {
        self.bearing_deg
    }

    pub fn altitude_deg(&self) -> f64 {
        self.altitude_deg
    }

    pub fn severity_class(&self) -> u32 {
        self.severity_class
    }

    pub fn group_key(&self) -> &GroupKey {
        &self.group_key
    }

    /// A sightline straight up cannot be blocked by neighbouring cells.
    pub fn is_vertical(&self) -> bool {
        self.altitude_deg >= 90.0
    }

    /// File stem for the persisted mask,
    /// e.g. `r45a_sm_az45_alt36_c2` for label `r45a`.
    pub fn artifact_stem(&self, prefix: &str, suffix: &str) -> String {
        format!(
            "{prefix}{}{suffix}_sm_az{}_alt{}_c{}",
            slug(&self.label),
            self.bearing_deg.round() as i64,
            self.altitude_deg.round() as i64,
            self.severity_class
        )
    }
}

/// Reduces a bearing to `[0, 360)`.
pub fn normalize_bearing(bearing_deg: f64) -> f64 {
    let b = bearing_deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if b >= 360.0 {
        0.0
    } else {
        b
    }
}

fn slug(name: &str) -> String {
    let s: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let s = s.trim_matches(|c| c == ' ' || c == '.');
    if s.is_empty() {
        "shadow".to_string()
    } else {
        s.to_string()
    }
}

/// Number of equally spaced compass sectors the bearings describe.
///
/// Returns `default_sectors` when fewer than four distinct bearings are given
/// or the spacing is irregular by more than `tolerance_deg`.
pub fn infer_sector_count(bearings: &[f64], tolerance_deg: f64, default_sectors: usize) -> usize {
    const MIN_PARTS: usize = 4;

    let mut az: Vec<f64> = bearings
        .iter()
        .filter(|b| b.is_finite())
        .map(|&b| (normalize_bearing(b) * 1e6).round() / 1e6)
        .collect();
    az.sort_by(f64::total_cmp);
    az.dedup();

    if az.len() < MIN_PARTS {
        return default_sectors;
    }

    let mut diffs: Vec<f64> = az.windows(2).map(|w| w[1] - w[0]).collect();
    diffs.push(360.0 - (az[az.len() - 1] - az[0]));

    let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
    if mean <= 0.0 {
        return default_sectors;
    }
    let max_dev = diffs
        .iter()
        .map(|d| (d - mean).abs())
        .fold(0.0_f64, f64::max);
    let total: f64 = diffs.iter().sum();

    if max_dev <= tolerance_deg && (350.0..=370.0).contains(&total) {
        (360.0 / mean).round() as usize
    } else {
        default_sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_group_key_first_integer() {
        assert_eq!(group_key_from_label("N45_primary"), GroupKey::Number(45));
        assert_eq!(group_key_from_label("NE45_b"), GroupKey::Number(45));
        assert_eq!(group_key_from_label("45deg_extra"), GroupKey::Number(45));
        assert_eq!(group_key_from_label("r045a_hs_az45_alt36"), GroupKey::Number(45));
        assert_eq!(group_key_from_label("sector_270_2"), GroupKey::Number(270));
    }

    #[test]
    fn test_group_key_without_digits_is_label() {
        assert_eq!(
            group_key_from_label("north"),
            GroupKey::Label("north".to_string())
        );
        assert_eq!(group_key_from_label(""), GroupKey::Label(String::new()));
        let huge = "x99999999999999999999999";
        assert_eq!(group_key_from_label(huge), GroupKey::Label(huge.to_string()));
    }

    #[test]
    fn test_group_key_ordering() {
        let mut keys = vec![
            GroupKey::Label("north".into()),
            GroupKey::Number(270),
            GroupKey::Number(45),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                GroupKey::Number(45),
                GroupKey::Number(270),
                GroupKey::Label("north".into())
            ]
        );
        assert_eq!(GroupKey::Number(45).artifact_stem(), "45_max");
    }

    #[test]
    fn test_directive_validation() {
        assert!(Directive::new("a", 90.0, 0.0, 1).is_err());
        assert!(Directive::new("a", 90.0, -5.0, 1).is_err());
        assert!(Directive::new("a", 90.0, 90.5, 1).is_err());
        assert!(Directive::new("a", 90.0, 30.0, 0).is_err());
        assert!(Directive::new("a", f64::NAN, 30.0, 1).is_err());
        let d = Directive::new("a", 90.0, 90.0, 1).unwrap();
        assert!(d.is_vertical());
    }

    #[test]
    fn test_bearing_normalisation() {
        let d = Directive::new("r1", 360.0, 30.0, 1).unwrap();
        assert_relative_eq!(d.bearing_deg(), 0.0);
        let d = Directive::new("r1", -90.0, 30.0, 1).unwrap();
        assert_relative_eq!(d.bearing_deg(), 270.0);
        assert_relative_eq!(normalize_bearing(725.0), 5.0);
    }

    #[test]
    fn test_artifact_stem() {
        let d = Directive::new("r45a zone/1", 45.0, 36.4, 2).unwrap();
        assert_eq!(d.artifact_stem("", ""), "r45a_zone_1_sm_az45_alt36_c2");
        assert_eq!(
            d.artifact_stem("pre_", "_x"),
            "pre_r45a_zone_1_x_sm_az45_alt36_c2"
        );
        let d = Directive::new("...", 0.0, 10.0, 1).unwrap();
        assert!(d.artifact_stem("", "").starts_with("shadow_sm"));
    }

    #[test]
    fn test_infer_sector_count() {
        let eight: Vec<f64> = (0..8).map(|i| i as f64 * 45.0).collect();
        assert_eq!(infer_sector_count(&eight, 0.25, 32), 8);

        let twelve: Vec<f64> = (0..12).map(|i| i as f64 * 30.0).collect();
        // duplicates and 360 == 0 do not disturb the spacing
        let mut noisy = twelve.clone();
        noisy.push(360.0);
        noisy.push(30.0);
        assert_eq!(infer_sector_count(&noisy, 0.25, 32), 12);

        assert_eq!(infer_sector_count(&[0.0, 90.0, 180.0], 0.25, 32), 32);
        assert_eq!(infer_sector_count(&[0.0, 10.0, 180.0, 270.0], 0.25, 32), 32);
    }
}

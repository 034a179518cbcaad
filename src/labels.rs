//! Raw detector class names to display categories.

use crate::model::ModelType;

/// Traffic-violation model classes, as emitted by the detector, mapped to
/// the vocabulary shown on dashboards.
const TRAFFIC_VIOLATION_LABELS: [(&str, &str); 9] = [
    ("0 - motorcycle", "Motorcycle Violation"),
    ("1 - motorcycle - pedestrian road", "Motorcycle on Pedestrian Road"),
    ("13 - bicycle - stop line", "Bicycle on Stop Line"),
    ("14 - bicycle - crosswalk", "Bicycle on Crosswalk"),
    ("3 - motorcycle - jaywalk", "Motorcycle Jaywalking"),
    ("5 - motorcycle - stop line", "Motorcycle on Stop Line"),
    ("6 - motorcycle - crosswalk", "Motorcycle on Crosswalk"),
    ("7 - bicycle", "Bicycle Violation"),
    ("9 - bicycle - pedestrian road", "Bicycle on Pedestrian Road"),
];

/// Map a raw category to its display category.
///
/// Unknown raw labels pass through unchanged.
pub fn map_label(model: ModelType, raw: &str) -> String {
    match model {
        ModelType::TrafficViolation => TRAFFIC_VIOLATION_LABELS
            .iter()
            .find(|(key, _)| *key == raw)
            .map(|(_, display)| (*display).to_string())
            .unwrap_or_else(|| raw.to_string()),
        ModelType::Pothole => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_traffic_labels() {
        assert_eq!(
            map_label(ModelType::TrafficViolation, "14 - bicycle - crosswalk"),
            "Bicycle on Crosswalk"
        );
        assert_eq!(
            map_label(ModelType::TrafficViolation, "0 - motorcycle"),
            "Motorcycle Violation"
        );
    }

    #[test]
    fn unknown_traffic_label_passes_through() {
        assert_eq!(
            map_label(ModelType::TrafficViolation, "42 - tram"),
            "42 - tram"
        );
    }

    #[test]
    fn pothole_is_identity_even_for_traffic_keys() {
        assert_eq!(map_label(ModelType::Pothole, "7 - bicycle"), "7 - bicycle");
        assert_eq!(map_label(ModelType::Pothole, "pothole"), "pothole");
    }

    #[test]
    fn mapping_is_idempotent() {
        for (raw, _) in TRAFFIC_VIOLATION_LABELS {
            let once = map_label(ModelType::TrafficViolation, raw);
            let twice = map_label(ModelType::TrafficViolation, raw);
            assert_eq!(once, twice);
            // display names are not keys, so re-mapping leaves them alone
            assert_eq!(map_label(ModelType::TrafficViolation, &once), once);
        }
    }
}

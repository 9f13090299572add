//! Region and zone selection per creation attempt.
//!
//! Exactly one of regions or zones is configured. Attempt `n` uses entry
//! `min(n, len - 1)` of whichever list is set, so attempts past the end keep
//! reusing the last location.

use thiserror::Error;

/// Errors raised when building a [`LocationSet`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LocationError {
    /// Both regions and zones were configured.
    #[error("configure either regions or zones, not both")]
    Both,
    /// Neither regions nor zones were configured.
    #[error("at least one region or zone is required")]
    Neither,
    /// A configured entry was blank.
    #[error("region and zone entries must not be empty")]
    BlankEntry,
}

/// Ordered candidate locations for cluster creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LocationSet {
    /// Regional clusters, tried in order.
    Regions(Vec<String>),
    /// Zonal clusters, tried in order.
    Zones(Vec<String>),
}

impl LocationSet {
    /// Builds a location set from the raw lists.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError`] unless exactly one list is non-empty and all
    /// of its entries are non-blank.
    pub fn new(regions: Vec<String>, zones: Vec<String>) -> Result<Self, LocationError> {
        let set = match (regions.is_empty(), zones.is_empty()) {
            (false, false) => return Err(LocationError::Both),
            (true, true) => return Err(LocationError::Neither),
            (false, true) => Self::Regions(regions),
            (true, false) => Self::Zones(zones),
        };
        if set.entries().iter().any(|entry| entry.trim().is_empty()) {
            return Err(LocationError::BlankEntry);
        }
        Ok(set)
    }

    fn entries(&self) -> &[String] {
        match self {
            Self::Regions(entries) | Self::Zones(entries) => entries,
        }
    }

    /// Number of attempts available before creation is declared failed.
    #[must_use]
    pub fn total_try_count(&self) -> usize {
        self.entries().len()
    }

    /// Returns `--region=<r>` or `--zone=<z>` for `attempt`.
    #[must_use]
    pub fn location_arg(&self, attempt: usize) -> String {
        match self {
            Self::Regions(regions) => location_arg(regions, &[], attempt),
            Self::Zones(zones) => location_arg(&[], zones, attempt),
        }
        .unwrap_or_default()
    }

    /// Returns the bare region or zone name for `attempt`.
    #[must_use]
    pub fn location(&self, attempt: usize) -> String {
        pick(self.entries(), attempt).unwrap_or_default().to_owned()
    }

    /// Returns the region that `attempt` places clusters in.
    #[must_use]
    pub fn region(&self, attempt: usize) -> String {
        match self {
            Self::Regions(regions) => region_from_location(regions, &[], attempt),
            Self::Zones(zones) => region_from_location(&[], zones, attempt),
        }
        .unwrap_or_default()
    }
}

fn pick(entries: &[String], attempt: usize) -> Option<&str> {
    let index = attempt.min(entries.len().checked_sub(1)?);
    entries.get(index).map(String::as_str)
}

/// Returns the location flag for `attempt`, preferring regions when set.
///
/// Returns `None` only when both lists are empty, which configuration
/// validation rejects earlier.
#[must_use]
pub fn location_arg(regions: &[String], zones: &[String], attempt: usize) -> Option<String> {
    if regions.is_empty() {
        pick(zones, attempt).map(|zone| format!("--zone={zone}"))
    } else {
        pick(regions, attempt).map(|region| format!("--region={region}"))
    }
}

/// Returns the region for `attempt`; zones are reduced to their region.
#[must_use]
pub fn region_from_location(regions: &[String], zones: &[String], attempt: usize) -> Option<String> {
    if regions.is_empty() {
        pick(zones, attempt).map(|zone| region_of_zone(zone).to_owned())
    } else {
        pick(regions, attempt).map(str::to_owned)
    }
}

/// Strips the trailing `-<letter>` from a zone (`us-central1-c` →
/// `us-central1`).
#[must_use]
pub fn region_of_zone(zone: &str) -> &str {
    zone.rsplit_once('-').map_or(zone, |(region, _)| region)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_owned()).collect()
    }

    #[rstest]
    #[case(0, "--region=us-central1")]
    #[case(1, "--region=us-east1")]
    #[case(7, "--region=us-east1")]
    fn location_arg_uses_regions_when_present(#[case] attempt: usize, #[case] expected: &str) {
        let regions = list(&["us-central1", "us-east1"]);
        assert_eq!(
            location_arg(&regions, &[], attempt).as_deref(),
            Some(expected)
        );
    }

    #[rstest]
    #[case(0, "--zone=us-central1-c")]
    #[case(1, "--zone=europe-west1-b")]
    #[case(2, "--zone=europe-west1-b")]
    fn location_arg_falls_back_to_zones(#[case] attempt: usize, #[case] expected: &str) {
        let zones = list(&["us-central1-c", "europe-west1-b"]);
        assert_eq!(location_arg(&[], &zones, attempt).as_deref(), Some(expected));
    }

    #[rstest]
    fn location_arg_is_none_without_locations() {
        assert_eq!(location_arg(&[], &[], 0), None);
        assert_eq!(region_from_location(&[], &[], 0), None);
    }

    #[rstest]
    #[case("us-central1-c", "us-central1")]
    #[case("europe-west4-a", "europe-west4")]
    #[case("nodash", "nodash")]
    fn region_of_zone_strips_suffix(#[case] zone: &str, #[case] region: &str) {
        assert_eq!(region_of_zone(zone), region);
    }

    #[rstest]
    fn region_from_location_maps_zones() {
        let zones = list(&["us-central1-c", "us-west1-a"]);
        assert_eq!(
            region_from_location(&[], &zones, 1).as_deref(),
            Some("us-west1")
        );
    }

    #[rstest]
    fn location_set_rejects_both_lists() {
        let err = LocationSet::new(list(&["us-central1"]), list(&["us-central1-c"]))
            .expect_err("both lists should be rejected");
        assert_eq!(err, LocationError::Both);
    }

    #[rstest]
    fn location_set_rejects_empty_lists() {
        let err = LocationSet::new(Vec::new(), Vec::new()).expect_err("no lists");
        assert_eq!(err, LocationError::Neither);
    }

    #[rstest]
    fn location_set_rejects_blank_entries() {
        let err = LocationSet::new(list(&["us-central1", " "]), Vec::new())
            .expect_err("blank entry");
        assert_eq!(err, LocationError::BlankEntry);
    }

    #[rstest]
    fn location_set_reports_attempt_details() {
        let set = LocationSet::new(Vec::new(), list(&["us-central1-c", "us-east1-b"]))
            .expect("zones are valid");
        assert_eq!(set.total_try_count(), 2);
        assert_eq!(set.location_arg(1), "--zone=us-east1-b");
        assert_eq!(set.location(1), "us-east1-b");
        assert_eq!(set.region(1), "us-east1");
    }
}

//! Routing cost helpers built on the popularity index.
//!
//! The router computes `base * priority * popularity_weight` per edge, where
//! `priority` comes from [`classify`] over the way's tags and the popularity
//! weight shrinks the cost of well-ridden edges down to half.

use std::collections::HashMap;

use crate::store::PopularityLookup;
use crate::EdgeId;

/// Popularity at which the weight bottoms out.
const POPULARITY_SCALE: f64 = 5000.0;
const MIN_POPULARITY_WEIGHT: f64 = 0.5;

/// Multiplier for an edge with the given popularity score.
///
/// Score 1 (never ridden) is neutral; higher scores fall linearly towards
/// [`MIN_POPULARITY_WEIGHT`].
pub fn popularity_weight(popularity: u32) -> f64 {
    if popularity > 1 {
        (1.0 - f64::from(popularity) / POPULARITY_SCALE).max(MIN_POPULARITY_WEIGHT)
    } else {
        1.0
    }
}

/// Cost without popularity: base edge weight scaled by bike priority.
#[inline]
pub fn priority_only_weight(base_weight: f64, priority: f64) -> f64 {
    base_weight * priority
}

/// Edge weighting that folds in popularity from any [`PopularityLookup`].
pub struct PopularityWeighting<'a, P: ?Sized> {
    lookup: &'a P,
}

impl<'a, P: PopularityLookup + ?Sized> PopularityWeighting<'a, P> {
    pub fn new(lookup: &'a P) -> Self {
        Self { lookup }
    }

    #[inline]
    pub fn edge_weight(&self, base_weight: f64, priority: f64, edge_id: EdgeId) -> f64 {
        priority_only_weight(base_weight, priority)
            * popularity_weight(self.lookup.popularity(edge_id))
    }
}

// ============================================================================
// Way classification
// ============================================================================

/// OSM tags of a way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WayAttributes {
    tags: HashMap<String, String>,
}

impl WayAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// True if `key` is set to any of `values`.
    pub fn has_tag(&self, key: &str, values: &[&str]) -> bool {
        self.tag(key).is_some_and(|v| values.contains(&v))
    }

    /// Lane count; defaults to 1 on one-way roads and 2 otherwise, also when
    /// the tag does not parse.
    pub fn lanes(&self) -> u32 {
        let default = if self.has_tag("oneway", &["yes"]) { 1 } else { 2 };
        self.tag("lanes")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn is_bike_path(&self) -> bool {
        self.has_tag("highway", &["cycleway"])
            || (self.has_tag("highway", &["footway"]) && self.has_tag("bicycle", &["yes"]))
            || (self.has_tag("highway", &["path"])
                && self.has_tag("bicycle", &["designated", "official", "yes"]))
            || (self.has_tag("highway", &["service"]) && self.has_tag("bicycle", &["designated"]))
    }

    pub fn is_bike_lane(&self) -> bool {
        self.has_tag(
            "cycleway",
            &["left", "right", "track", "lane", "opposite_lane"],
        ) || self.has_tag("cycleway:left", &["lane"])
            || self.has_tag("cycleway:right", &["lane"])
            || self.has_tag("cycleway:both", &["lane"])
    }

    pub fn is_shared_bike_lane(&self) -> bool {
        self.has_tag("cycleway", &["shared_lane"])
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for WayAttributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            tags: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Bike priority multiplier for a way. Lower is preferred.
///
/// `in_cycle_network` is true when the way belongs to an international,
/// national, regional or local cycle route relation.
pub fn classify(way: &WayAttributes, in_cycle_network: bool) -> f64 {
    let bike_path = way.is_bike_path();

    let mut cost = if bike_path {
        0.6
    } else if way.is_bike_lane() {
        0.7
    } else if way.is_shared_bike_lane() {
        0.75
    } else if way.has_tag("highway", &["track"]) {
        match way.tag("tracktype") {
            Some("grade1") => 0.6,
            Some("grade2") => 0.7,
            Some("grade3") => 0.8,
            _ => 1.0,
        }
    } else if way.has_tag("highway", &["motorway", "trunk"]) {
        2.5
    } else if way.has_tag("highway", &["path", "track"])
        && !way.has_tag("bicycle", &["designated", "official", "yes"])
    {
        2.5
    } else {
        0.8
    };

    if in_cycle_network {
        cost *= 0.65;
    }

    if let Some(scale) = way.tag("mtb:scale") {
        cost *= match scale {
            "0-" => 1.5,
            "0" => 2.0,
            _ => 2.5,
        };
    }

    if way.has_tag("RLIS:bicycle", &["caution_area"]) {
        cost *= 1.25;
    }

    // Lane penalties only apply when riding in traffic.
    if !way.has_tag("cycleway", &["track"]) && !bike_path {
        let lanes = way.lanes();
        if lanes > 3 {
            cost += 0.05;
        }
        if lanes > 1 && way.has_tag("oneway", &["yes"]) {
            cost += 0.05;
        }
    }

    cost
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn way(tags: &[(&str, &str)]) -> WayAttributes {
        tags.iter().copied().collect()
    }

    struct Fixed(Vec<u32>);

    impl PopularityLookup for Fixed {
        fn popularity(&self, edge_id: EdgeId) -> u32 {
            self.0[edge_id as usize]
        }
    }

    #[test]
    fn test_popularity_weight_curve() {
        assert_eq!(popularity_weight(0), 1.0);
        assert_eq!(popularity_weight(1), 1.0);
        assert!(approx_eq(popularity_weight(2), 1.0 - 2.0 / 5000.0));
        assert!(approx_eq(popularity_weight(1000), 0.8));
        assert_eq!(popularity_weight(2500), 0.5);
        assert_eq!(popularity_weight(100_000), 0.5);
    }

    #[test]
    fn test_edge_weight() {
        let lookup = Fixed(vec![1, 1000]);
        let weighting = PopularityWeighting::new(&lookup);
        assert!(approx_eq(weighting.edge_weight(10.0, 0.8, 0), 8.0));
        assert!(approx_eq(weighting.edge_weight(10.0, 0.8, 1), 6.4));
        assert!(approx_eq(priority_only_weight(10.0, 0.8), 8.0));
    }

    #[test]
    fn test_classify_base_table() {
        let two_way = |highway: &str| way(&[("highway", highway)]);

        assert!(approx_eq(classify(&way(&[("highway", "cycleway")]), false), 0.6));
        assert!(approx_eq(classify(&way(&[("highway", "residential"), ("cycleway", "lane")]), false), 0.7));
        assert!(approx_eq(classify(&way(&[("highway", "residential"), ("cycleway", "shared_lane")]), false), 0.75));
        assert!(approx_eq(classify(&way(&[("highway", "track"), ("tracktype", "grade2")]), false), 0.7));
        assert!(approx_eq(classify(&two_way("track"), false), 1.0));
        assert!(approx_eq(classify(&two_way("trunk"), false), 2.5));
        assert!(approx_eq(classify(&two_way("path"), false), 2.5));
        assert!(approx_eq(classify(&two_way("residential"), false), 0.8));
    }

    #[test]
    fn test_classify_modifiers() {
        let path = way(&[("highway", "cycleway")]);
        assert!(approx_eq(classify(&path, true), 0.6 * 0.65));

        let mtb = way(&[("highway", "cycleway"), ("mtb:scale", "0")]);
        assert!(approx_eq(classify(&mtb, false), 1.2));

        let caution = way(&[("highway", "residential"), ("RLIS:bicycle", "caution_area")]);
        assert!(approx_eq(classify(&caution, false), 0.8 * 1.25));
    }

    #[test]
    fn test_classify_lane_penalties() {
        let wide = way(&[("highway", "primary"), ("lanes", "4")]);
        assert!(approx_eq(classify(&wide, false), 0.85));

        let wide_oneway = way(&[("highway", "primary"), ("lanes", "4"), ("oneway", "yes")]);
        assert!(approx_eq(classify(&wide_oneway, false), 0.9));

        // Separated track shields the rider from traffic.
        let with_track = way(&[("highway", "primary"), ("lanes", "4"), ("cycleway", "track")]);
        assert!(approx_eq(classify(&with_track, false), 0.7));
    }

    #[test]
    fn test_lanes_defaults() {
        assert_eq!(way(&[]).lanes(), 2);
        assert_eq!(way(&[("oneway", "yes")]).lanes(), 1);
        assert_eq!(way(&[("lanes", "two")]).lanes(), 2);
        assert_eq!(way(&[("lanes", "3")]).lanes(), 3);
    }
}

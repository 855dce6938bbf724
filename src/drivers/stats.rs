use crate::drivers::format::format_value;

/// Count/min/max/mean of the readings between the two markers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IntervalStats {
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
}

impl IntervalStats {
    /// Markers may be given in either order. Unset markers or an empty point
    /// set yield the empty statistic.
    pub fn between(marker_a: Option<f64>, marker_b: Option<f64>, points: &[(f64, f64)]) -> Self {
        let (Some(a), Some(b)) = (marker_a, marker_b) else {
            return Self::default();
        };
        let (lo, hi) = (a.min(b), a.max(b));
        let mut stats = Self::default();
        let mut sum = 0.0;
        for &(_, value) in points.iter().filter(|(t, _)| lo <= *t && *t <= hi) {
            stats.count += 1;
            sum += value;
            stats.min = Some(stats.min.map_or(value, |m| m.min(value)));
            stats.max = Some(stats.max.map_or(value, |m| m.max(value)));
        }
        if stats.count > 0 {
            stats.mean = Some(sum / stats.count as f64);
        }
        stats
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn summary(&self, unit: &str) -> String {
        if self.is_empty() {
            return "n=0  min=—  max=—  mean=—".to_owned();
        }
        format!(
            "n={}  min={}  max={}  mean={}",
            self.count,
            format_value(self.min, unit),
            format_value(self.max, unit),
            format_value(self.mean, unit)
        )
    }
}

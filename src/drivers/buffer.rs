use crate::drivers::instrument::allows_negative;
use crate::drivers::stats::IntervalStats;
use crate::types::Sample;

/// One stored reading, `t` in seconds since the run's first sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub t: f64,
    pub value: Option<f64>,
}

/// Trailing slice of the series prepared for display.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VisibleWindow {
    pub t_min: f64,
    pub t_max: f64,
    pub points: Vec<(f64, f64)>, // (t, value), missing readings dropped
    pub ceiling: Option<f64>,
    pub allow_negative: bool,
}

impl VisibleWindow {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Y-axis bounds for the window, `None` when there is nothing to show.
    pub fn y_range(&self) -> Option<(f64, f64)> {
        let first = self.points.first()?.1;
        let (lo, hi) = self
            .points
            .iter()
            .fold((first, first), |(lo, hi), &(_, v)| (lo.min(v), hi.max(v)));
        if let Some(ceiling) = self.ceiling {
            let floor = if self.allow_negative { lo } else { 0.0 };
            return Some((floor, ceiling));
        }
        let mut lo = if self.allow_negative { lo } else { lo.max(0.0) };
        let mut hi = hi;
        if lo == hi {
            lo -= 1.0;
            hi += 1.0;
        }
        let margin = (hi - lo) * 0.05;
        let mut floor = lo - margin;
        if !self.allow_negative {
            floor = floor.max(0.0);
        }
        Some((floor, hi + margin))
    }
}

/// Append-only history of one acquisition run plus the two interval markers.
#[derive(Clone, Debug, Default)]
pub struct TimeSeries {
    points: Vec<Point>,
    epoch: Option<f64>,
    marker_a: Option<f64>,
    marker_b: Option<f64>,
}

impl TimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a sample relative to the run epoch, fixing the epoch on the first
    /// sample. Readings of sign-restricted modes are clamped at zero.
    pub fn apply_sample(&mut self, sample: &Sample) {
        if self.points.is_empty() {
            self.epoch = Some(sample.timestamp);
        }
        let epoch = self.epoch.unwrap_or(sample.timestamp);
        let floor = self.points.last().map_or(0.0, |p| p.t);
        let t = (sample.timestamp - epoch).max(floor);
        let value = match sample.value {
            Some(v) if v < 0.0 && !allows_negative(sample.mode.as_deref()) => Some(0.0),
            other => other,
        };
        self.points.push(Point { t, value });
    }

    /// Drops every point and both markers; `now` becomes the provisional epoch
    /// until the next sample arrives.
    pub fn clear(&mut self, now: f64) {
        self.points.clear();
        self.marker_a = None;
        self.marker_b = None;
        self.epoch = Some(now);
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn epoch(&self) -> Option<f64> {
        self.epoch
    }

    pub fn latest(&self) -> Option<&Point> {
        self.points.last()
    }

    pub fn set_marker_a(&mut self, t: f64) {
        self.marker_a = Some(t);
    }

    pub fn set_marker_b(&mut self, t: f64) {
        self.marker_b = Some(t);
    }

    pub fn clear_markers(&mut self) {
        self.marker_a = None;
        self.marker_b = None;
    }

    pub fn markers(&self) -> (Option<f64>, Option<f64>) {
        (self.marker_a, self.marker_b)
    }

    pub fn marker_span(&self) -> Option<f64> {
        Some((self.marker_a? - self.marker_b?).abs())
    }

    /// Points within the trailing `duration_seconds`, with missing readings and
    /// readings above `ceiling` removed and negatives clamped unless allowed.
    pub fn visible_window(
        &self,
        duration_seconds: f64,
        ceiling: Option<f64>,
        allow_negative: bool,
    ) -> VisibleWindow {
        let Some(last) = self.points.last() else {
            return VisibleWindow {
                ceiling,
                allow_negative,
                ..VisibleWindow::default()
            };
        };
        let t_max = last.t;
        let t_min = (t_max - duration_seconds).max(0.0);
        let points = self
            .points
            .iter()
            .filter(|p| p.t >= t_min)
            .filter_map(|p| p.value.map(|v| (p.t, v)))
            .filter(|&(_, v)| ceiling.map_or(true, |c| v <= c))
            .map(|(t, v)| {
                if !allow_negative && v < 0.0 {
                    (t, 0.0)
                } else {
                    (t, v)
                }
            })
            .collect();
        VisibleWindow {
            t_min,
            t_max,
            points,
            ceiling,
            allow_negative,
        }
    }

    pub fn interval_stats(&self, window: &VisibleWindow) -> IntervalStats {
        if window.is_empty() {
            return IntervalStats::default();
        }
        IntervalStats::between(self.marker_a, self.marker_b, &window.points)
    }
}

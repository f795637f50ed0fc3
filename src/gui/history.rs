use std::collections::VecDeque;

/// The last few seconds of force readings, as `(seconds, load)` points.
///
/// Lives with the dashboard; the session core only ever keeps the newest
/// reading.
#[derive(Debug, Clone)]
pub struct ForceHistory {
    points: VecDeque<(f64, f64)>,
    span: f64,
    capacity: usize,
}

impl ForceHistory {
    /// Keeps `span` seconds of points, and never more than `capacity` of them.
    pub fn new(span: f64, capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity.min(4096)),
            span: span.max(f64::EPSILON),
            capacity: capacity.max(1),
        }
    }

    /// Adds a point, forgetting anything that has scrolled out of view.
    /// Points must arrive in time order; older ones are ignored.
    pub fn push(&mut self, t: f64, load: f64) {
        if self.points.back().map_or(false, |&(last, _)| t < last) {
            return;
        }
        self.points.push_back((t, load));
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
        while self.points.front().map_or(false, |&(first, _)| first < t - self.span) {
            self.points.pop_front();
        }
    }

    /// Points in time order.
    pub fn points(&mut self) -> &[(f64, f64)] {
        self.points.make_contiguous()
    }

    /// Number of points held.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Nothing recorded yet.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Time of the newest point.
    pub fn latest_time(&self) -> Option<f64> {
        self.points.back().map(|&(t, _)| t)
    }

    /// The x range to plot: the last `span` seconds.
    pub fn x_bounds(&self) -> [f64; 2] {
        let end = self.latest_time().unwrap_or(0.0).max(self.span);
        [end - self.span, end]
    }

    /// Largest load held, if any.
    pub fn peak(&self) -> Option<f64> {
        self.points.iter().map(|&(_, load)| load).reduce(f64::max)
    }

    /// Smallest load held, if any.
    pub fn trough(&self) -> Option<f64> {
        self.points.iter().map(|&(_, load)| load).reduce(f64::min)
    }
}

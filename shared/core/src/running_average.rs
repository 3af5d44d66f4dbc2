use std::collections::{BTreeMap, VecDeque};

#[derive(Debug)]
struct Window {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    total_pushes: u64,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
            total_pushes: 0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
        self.total_pushes += 1;
    }

    fn average(&self) -> Option<f64> {
        (!self.samples.is_empty()).then(|| self.sum / self.samples.len() as f64)
    }
}

/// Windowed averages of named per-step metrics (step time, loss, ...).
#[derive(Debug)]
pub struct RunningAverage {
    window: usize,
    entries: BTreeMap<&'static str, Window>,
}

impl RunningAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            entries: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, name: &'static str, value: f64) {
        let window = self.window;
        self.entries
            .entry(name)
            .or_insert_with(|| Window::new(window))
            .push(value);
    }

    pub fn average(&self, name: &str) -> Option<f64> {
        self.entries.get(name).and_then(Window::average)
    }

    pub fn total_pushes(&self, name: &str) -> u64 {
        self.entries.get(name).map_or(0, |w| w.total_pushes)
    }

    pub fn averages(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.entries
            .iter()
            .filter_map(|(name, w)| w.average().map(|avg| (*name, avg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_evicts_oldest() {
        let mut avg = RunningAverage::new(2);
        avg.push("loss", 4.0);
        avg.push("loss", 2.0);
        assert_eq!(avg.average("loss"), Some(3.0));
        avg.push("loss", 0.0);
        assert_eq!(avg.average("loss"), Some(1.0));
        assert_eq!(avg.total_pushes("loss"), 3);
    }

    #[test]
    fn test_unknown_metric() {
        let avg = RunningAverage::new(8);
        assert_eq!(avg.average("step_time"), None);
        assert_eq!(avg.total_pushes("step_time"), 0);
        assert_eq!(avg.averages().count(), 0);
    }
}

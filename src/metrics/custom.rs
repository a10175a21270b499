//! Workload defined statistics.
//!
//! Workload code attaches named [`CustomMetrics`] through the driver context.
//! They travel with the thread's [`crate::metrics::Metrics`], are merged by
//! name on aggregation and contribute their [`CustomStat`] rows, including an
//! optional pass/fail verdict, to the summary.
use std::any::Any;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

/// One row of a custom statistics table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomStat {
    pub description: String,
    pub result: String,
    pub target: Option<String>,
    pub allowed_deviation: Option<String>,
    /// `None` when the row is informational only.
    pub passed: Option<bool>,
}

impl CustomStat {
    pub fn new(description: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            result: result.into(),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_allowed_deviation(mut self, deviation: impl Into<String>) -> Self {
        self.allowed_deviation = Some(deviation.into());
        self
    }

    pub fn with_passed(mut self, passed: bool) -> Self {
        self.passed = Some(passed);
        self
    }
}

/// Statistics collected by workload code.
///
/// # Example
/// ```rust
/// use std::any::Any;
/// use fleetload::metrics::{CustomMetrics, CustomStat};
///
/// #[derive(Debug, Clone, Default)]
/// struct CacheHits { hits: u64, lookups: u64 }
///
/// impl CustomMetrics for CacheHits {
///     fn merge(&mut self, other: &dyn CustomMetrics) {
///         if let Some(other) = other.as_any().downcast_ref::<Self>() {
///             self.hits += other.hits;
///             self.lookups += other.lookups;
///         }
///     }
///
///     fn results(&self) -> Vec<CustomStat> {
///         let ratio = self.hits as f64 / self.lookups.max(1) as f64;
///         vec![CustomStat::new("Cache hit ratio", format!("{ratio:.3}"))
///             .with_target(">= 0.9")
///             .with_passed(ratio >= 0.9)]
///     }
///
///     fn clone_box(&self) -> Box<dyn CustomMetrics> {
///         Box::new(self.clone())
///     }
///
///     fn as_any(&self) -> &dyn Any {
///         self
///     }
/// }
/// ```
pub trait CustomMetrics: Any + Send + Sync + Debug {
    /// Adds the statistics of `other`, an attachment registered under the same name.
    fn merge(&mut self, other: &dyn CustomMetrics);

    fn results(&self) -> Vec<CustomStat>;

    fn clone_box(&self) -> Box<dyn CustomMetrics>;

    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn CustomMetrics> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Named attachments in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Attachments {
    entries: Vec<(String, Box<dyn CustomMetrics>)>,
}

impl Attachments {
    /// Registers `metrics` under `name`, replacing any earlier attachment.
    pub fn attach(&mut self, name: &str, metrics: Box<dyn CustomMetrics>) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = metrics,
            None => self.entries.push((name.to_string(), metrics)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn CustomMetrics> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn CustomMetrics>> {
        self.entries.iter_mut().find(|(n, _)| n == name).map(|(_, m)| m)
    }

    pub fn merge(&mut self, other: Attachments) {
        for (name, metrics) in other.entries {
            match self.entries.iter_mut().find(|(n, _)| *n == name) {
                Some((_, mine)) => mine.merge(metrics.as_ref()),
                None => self.entries.push((name, metrics)),
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn CustomMetrics)> {
        self.entries.iter().map(|(n, m)| (n.as_str(), m.as_ref()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    pub(crate) struct Counter {
        pub count: u64,
        pub target: u64,
    }

    impl CustomMetrics for Counter {
        fn merge(&mut self, other: &dyn CustomMetrics) {
            if let Some(other) = other.as_any().downcast_ref::<Self>() {
                self.count += other.count;
            }
        }

        fn results(&self) -> Vec<CustomStat> {
            vec![
                CustomStat::new("count", self.count.to_string())
                    .with_target(self.target.to_string())
                    .with_passed(self.count >= self.target),
            ]
        }

        fn clone_box(&self) -> Box<dyn CustomMetrics> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn counter(count: u64) -> Box<dyn CustomMetrics> {
        Box::new(Counter { count, target: 10 })
    }

    #[test]
    fn merge_by_name() {
        let mut a = Attachments::default();
        a.attach("orders", counter(3));
        let mut b = Attachments::default();
        b.attach("orders", counter(4));
        b.attach("carts", counter(1));

        a.merge(b);

        assert_eq!(a.len(), 2);
        let names: Vec<_> = a.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["orders", "carts"]);
        let orders = a.get("orders").unwrap().results();
        assert_eq!(orders[0].result, "7");
        assert_eq!(orders[0].passed, Some(false));
    }

    #[test]
    fn attach_replaces() {
        let mut a = Attachments::default();
        a.attach("orders", counter(3));
        a.attach("orders", counter(12));
        assert_eq!(a.len(), 1);
        assert_eq!(a.get("orders").unwrap().results()[0].passed, Some(true));
    }

    #[test]
    fn clones_are_independent() {
        let mut a = Attachments::default();
        a.attach("orders", counter(3));
        let copy = a.clone();
        a.merge(copy.clone());
        assert_eq!(a.get("orders").unwrap().results()[0].result, "6");
        assert_eq!(copy.get("orders").unwrap().results()[0].result, "3");
    }
}

// crates/drudge-telemetry/src/registry.rs
//
// Metric registry: a named inventory of counters, gauges and distributions
// backed by a `prometheus::Registry`.
//
// Registration is check-and-insert under one lock, so two concurrent
// registrations of the same name cannot both succeed. A duplicate name is a
// configuration error and is never resolved by overwriting.

use std::collections::BTreeMap;
use std::fmt;

use drudge_core::DrudgeError;
use parking_lot::Mutex;
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, TextEncoder};
use serde::Serialize;

/// Kind of instrument held by a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Counter,
    Gauge,
    Distribution,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentKind::Counter => write!(f, "counter"),
            InstrumentKind::Gauge => write!(f, "gauge"),
            InstrumentKind::Distribution => write!(f, "distribution"),
        }
    }
}

/// How recorded values are combined.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    LastValue,
    Distribution { buckets: Vec<f64> },
}

/// Name, help text, unit and tag keys of an instrument to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    name: String,
    description: String,
    unit: String,
    tag_keys: Vec<String>,
}

impl MetricDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            unit: "1".to_string(),
            tag_keys: Vec::new(),
        }
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn tag_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Introspection record for one registered instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEntry {
    pub name: String,
    pub kind: InstrumentKind,
    pub description: String,
    pub unit: String,
    pub tag_keys: Vec<String>,
    pub aggregation: Aggregation,
}

#[derive(Clone)]
enum Collector {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Distribution(HistogramVec),
}

/// Handle returned by registration and passed to [`record`].
#[derive(Clone)]
pub struct Instrument {
    name: String,
    tag_keys: Vec<String>,
    collector: Collector,
}

impl Instrument {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InstrumentKind {
        match self.collector {
            Collector::Counter(_) => InstrumentKind::Counter,
            Collector::Gauge(_) => InstrumentKind::Gauge,
            Collector::Distribution(_) => InstrumentKind::Distribution,
        }
    }

    fn label_values<'a>(&self, tags: &[(&'a str, &'a str)]) -> Vec<&'a str> {
        self.tag_keys
            .iter()
            .map(|key| {
                tags.iter()
                    .find(|(k, _)| *k == key.as_str())
                    .map(|(_, v)| *v)
                    .unwrap_or("")
            })
            .collect()
    }

    fn observe(&self, value: f64, tags: &[(&str, &str)]) -> Result<(), prometheus::Error> {
        let labels = self.label_values(tags);
        match &self.collector {
            Collector::Counter(vec) => {
                if value < 0.0 {
                    return Err(prometheus::Error::Msg(format!(
                        "counter {} cannot decrease (got {value})",
                        self.name
                    )));
                }
                vec.get_metric_with_label_values(&labels)?.inc_by(value);
            }
            Collector::Gauge(vec) => vec.get_metric_with_label_values(&labels)?.set(value),
            Collector::Distribution(vec) => {
                vec.get_metric_with_label_values(&labels)?.observe(value)
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("tag_keys", &self.tag_keys)
            .finish()
    }
}

/// Record `value` on an instrument. A missing instrument is a no-op; tags
/// not supplied are recorded as empty strings.
pub fn record(instrument: Option<&Instrument>, value: f64, tags: &[(&str, &str)]) {
    let Some(instrument) = instrument else {
        return;
    };
    if let Err(e) = instrument.observe(value, tags) {
        tracing::warn!(metric = %instrument.name, error = %e, "Failed to record metric");
    }
}

/// Default latency buckets in seconds.
pub const DEFAULT_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Concurrency-safe metric inventory.
pub struct MetricRegistry {
    entries: Mutex<BTreeMap<String, RegistryEntry>>,
    prometheus: prometheus::Registry,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            prometheus: prometheus::Registry::new(),
        }
    }

    pub fn register_counter(&self, desc: MetricDescriptor) -> Result<Instrument, DrudgeError> {
        self.register(desc, InstrumentKind::Counter, Aggregation::Sum)
    }

    pub fn register_gauge(&self, desc: MetricDescriptor) -> Result<Instrument, DrudgeError> {
        self.register(desc, InstrumentKind::Gauge, Aggregation::LastValue)
    }

    pub fn register_distribution(
        &self,
        desc: MetricDescriptor,
        buckets: Vec<f64>,
    ) -> Result<Instrument, DrudgeError> {
        self.register(
            desc,
            InstrumentKind::Distribution,
            Aggregation::Distribution { buckets },
        )
    }

    fn register(
        &self,
        desc: MetricDescriptor,
        kind: InstrumentKind,
        aggregation: Aggregation,
    ) -> Result<Instrument, DrudgeError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&desc.name) {
            return Err(DrudgeError::DuplicateMetric(desc.name));
        }

        let labels: Vec<&str> = desc.tag_keys.iter().map(String::as_str).collect();
        let opts = Opts::new(desc.name.clone(), desc.description.clone());
        let collector = match &aggregation {
            Aggregation::Sum => CounterVec::new(opts, &labels).map(Collector::Counter),
            Aggregation::LastValue => GaugeVec::new(opts, &labels).map(Collector::Gauge),
            Aggregation::Distribution { buckets } => {
                HistogramVec::new(HistogramOpts::from(opts).buckets(buckets.clone()), &labels)
                    .map(Collector::Distribution)
            }
        }
        .map_err(|e| DrudgeError::Config(format!("metric {}: {e}", desc.name)))?;

        let boxed: Box<dyn prometheus::core::Collector> = match &collector {
            Collector::Counter(c) => Box::new(c.clone()),
            Collector::Gauge(g) => Box::new(g.clone()),
            Collector::Distribution(h) => Box::new(h.clone()),
        };
        self.prometheus.register(boxed).map_err(|e| match e {
            prometheus::Error::AlreadyReg => DrudgeError::DuplicateMetric(desc.name.clone()),
            other => DrudgeError::Config(format!("metric {}: {other}", desc.name)),
        })?;

        entries.insert(
            desc.name.clone(),
            RegistryEntry {
                name: desc.name.clone(),
                kind,
                description: desc.description,
                unit: desc.unit,
                tag_keys: desc.tag_keys.clone(),
                aggregation,
            },
        );
        tracing::debug!(metric = %desc.name, %kind, "Registered metric");

        Ok(Instrument {
            name: desc.name,
            tag_keys: desc.tag_keys,
            collector,
        })
    }

    /// Snapshot of every registered entry, keyed by name.
    pub fn list(&self) -> BTreeMap<String, RegistryEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Prometheus text exposition of every instrument.
    pub fn gather_text(&self) -> Result<String, DrudgeError> {
        let families = self.prometheus.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|e| DrudgeError::Serialization(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| DrudgeError::Serialization(e.to_string()))
    }

    /// The backing Prometheus registry, for hosts that export it elsewhere.
    pub fn prometheus(&self) -> &prometheus::Registry {
        &self.prometheus
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = MetricRegistry::new();
        registry
            .register_counter(MetricDescriptor::new("jobs_total", "Jobs run"))
            .unwrap();
        let err = registry
            .register_gauge(MetricDescriptor::new("jobs_total", "Jobs again"))
            .unwrap_err();
        assert!(matches!(err, DrudgeError::DuplicateMetric(ref name) if name == "jobs_total"));
        assert!(err.is_config());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_two_entries() {
        let registry = MetricRegistry::new();
        registry
            .register_counter(MetricDescriptor::new("a_total", "A").tag_keys(["route"]))
            .unwrap();
        registry
            .register_distribution(
                MetricDescriptor::new("b_seconds", "B").unit("s"),
                DEFAULT_LATENCY_BUCKETS.to_vec(),
            )
            .unwrap();

        let listed = registry.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed["a_total"].kind, InstrumentKind::Counter);
        assert_eq!(listed["a_total"].tag_keys, vec!["route"]);
        assert_eq!(listed["b_seconds"].unit, "s");

        let json = serde_json::to_value(&listed).unwrap();
        assert_eq!(json["a_total"]["aggregation"]["type"], "sum");
        assert_eq!(json["b_seconds"]["kind"], "distribution");
    }

    #[test]
    fn test_record_absent_instrument_is_noop() {
        record(None, 1.0, &[("route", "/x")]);
    }

    #[test]
    fn test_record_with_and_without_tags() {
        let registry = MetricRegistry::new();
        let counter = registry
            .register_counter(MetricDescriptor::new("hits_total", "Hits").tag_keys(["route", "code"]))
            .unwrap();
        record(Some(&counter), 2.0, &[("route", "/a"), ("code", "OK")]);
        record(Some(&counter), 1.0, &[]);

        let text = registry.gather_text().unwrap();
        assert!(text.contains(r#"hits_total{code="OK",route="/a"} 2"#), "{text}");
        assert!(text.contains(r#"hits_total{code="",route=""} 1"#), "{text}");
    }

    #[test]
    fn test_negative_counter_increment_is_dropped() {
        let registry = MetricRegistry::new();
        let counter = registry
            .register_counter(MetricDescriptor::new("neg_total", "Negative"))
            .unwrap();
        record(Some(&counter), -1.0, &[]);
        record(Some(&counter), 3.0, &[]);
        assert!(registry.gather_text().unwrap().contains("neg_total 3"));
    }

    #[test]
    fn test_invalid_name_is_config_error() {
        let registry = MetricRegistry::new();
        let err = registry
            .register_counter(MetricDescriptor::new("bad name", "Spaces"))
            .unwrap_err();
        assert!(matches!(err, DrudgeError::Config(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_registration_same_name() {
        let registry = Arc::new(MetricRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .register_counter(MetricDescriptor::new("race_total", "Race"))
                        .is_ok()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(registry.len(), 1);
    }
}

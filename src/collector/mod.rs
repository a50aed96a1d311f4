//! Scrape-time aggregator: turns drained facts into Prometheus families.
//!
//! Registered once in the `prometheus::Registry`. Every `collect()` drains
//! every poller's queue, groups the facts by canonical label set, and
//! returns the liveness gauge, the instance-count family and the
//! per-poller health families. Groups are rebuilt from scratch on each
//! pass, so a scrape reports only what was drained during it.

use prometheus::core::{Collector, Desc};
use prometheus::proto::{self, LabelPair, MetricFamily, MetricType};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::poller::{Fact, LabelSet, PollerWorker};

pub const ALIVE_METRIC: &str = "ec2monitor_exporter_alive";
pub const INSTANCES_METRIC: &str = "ec2_number_instances";
pub const POLLER_UP_METRIC: &str = "ec2monitor_poller_up";
pub const POLLER_ERRORS_METRIC: &str = "ec2monitor_poller_errors_total";

// ── Metric Groups ───────────────────────────────────────────────────

/// A label set as sorted (name, value) pairs: an order-independent key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalLabels(Vec<(String, String)>);

impl CanonicalLabels {
    /// Sanitize label names, then sort by name.
    pub fn from_labels(labels: &LabelSet) -> Self {
        let sanitized: BTreeMap<String, String> = labels
            .iter()
            .map(|(name, value)| (sanitize_label_name(name), value.clone()))
            .collect();
        Self(sanitized.into_iter().collect())
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn values(&self) -> Vec<String> {
        self.0.iter().map(|(_, value)| value.clone()).collect()
    }
}

/// Accumulated count for one canonical label set within a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricGroup {
    pub label_names: Vec<String>,
    pub label_values: Vec<String>,
    pub count: u64,
}

/// Fold facts into one group per canonical label set, in key order.
pub fn group_facts(facts: impl IntoIterator<Item = Fact>) -> Vec<MetricGroup> {
    let mut groups: BTreeMap<CanonicalLabels, MetricGroup> = BTreeMap::new();
    for fact in facts {
        let key = CanonicalLabels::from_labels(&fact.labels);
        groups
            .entry(key)
            .or_insert_with_key(|key| MetricGroup {
                label_names: key.names(),
                label_values: key.values(),
                count: 0,
            })
            .count += fact.count;
    }
    groups.into_values().collect()
}

/// Map a tag name onto the Prometheus label alphabet `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn sanitize_label_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

// ── Aggregator ──────────────────────────────────────────────────────

pub struct Aggregator {
    host: String,
    pollers: Vec<Arc<PollerWorker>>,
    /// Serializes scrape passes.
    pass: Mutex<()>,
}

impl Aggregator {
    pub fn new(host: impl Into<String>, pollers: Vec<Arc<PollerWorker>>) -> Self {
        Self {
            host: host.into(),
            pollers,
            pass: Mutex::new(()),
        }
    }

    /// One aggregation pass.
    pub fn collect_families(&self) -> Vec<MetricFamily> {
        let _pass = self.pass.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut facts = Vec::new();
        for poller in &self.pollers {
            facts.extend(poller.drain());
        }
        let drained = facts.len();
        let groups = group_facts(facts);

        debug!(facts = drained, groups = groups.len(), "Scrape aggregated");

        let mut families = Vec::with_capacity(4);
        families.push(gauge_family(
            ALIVE_METRIC,
            "Ec2 Monitor Exporter Status",
            vec![sample(&["host"], &[self.host.as_str()], 1.0)],
        ));

        let instance_samples: Vec<proto::Metric> = groups
            .iter()
            .map(|group| sample(&group.label_names, &group.label_values, group.count as f64))
            .collect();
        if !instance_samples.is_empty() {
            families.push(gauge_family(
                INSTANCES_METRIC,
                "Number of Aws EC2 instances",
                instance_samples,
            ));
        }

        if !self.pollers.is_empty() {
            let labels = ["zone", "region"];
            let up = self
                .pollers
                .iter()
                .map(|p| {
                    let value = if p.health().is_up() { 1.0 } else { 0.0 };
                    sample(&labels, &[p.zone(), p.region()], value)
                })
                .collect();
            families.push(gauge_family(
                POLLER_UP_METRIC,
                "Whether the last poll of this zone/region succeeded",
                up,
            ));

            let errors = self
                .pollers
                .iter()
                .map(|p| {
                    counter_sample(&labels, &[p.zone(), p.region()], p.health().total_failures() as f64)
                })
                .collect();
            families.push(family(
                POLLER_ERRORS_METRIC,
                "Total failed polls of this zone/region",
                MetricType::COUNTER,
                errors,
            ));
        }

        families
    }
}

impl Collector for Aggregator {
    // Families are dynamic, so the collector is registered unchecked.
    fn desc(&self) -> Vec<&Desc> {
        Vec::new()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.collect_families()
    }
}

// ── Proto Builders ──────────────────────────────────────────────────

fn label_pairs<N: AsRef<str>, V: AsRef<str>>(names: &[N], values: &[V]) -> Vec<LabelPair> {
    names
        .iter()
        .zip(values)
        .map(|(name, value)| {
            let mut pair = LabelPair::default();
            pair.set_name(name.as_ref().to_string());
            pair.set_value(value.as_ref().to_string());
            pair
        })
        .collect()
}

fn sample<N: AsRef<str>, V: AsRef<str>>(names: &[N], values: &[V], value: f64) -> proto::Metric {
    let mut gauge = proto::Gauge::default();
    gauge.set_value(value);
    let mut metric = proto::Metric::default();
    for pair in label_pairs(names, values) {
        metric.mut_label().push(pair);
    }
    metric.set_gauge(gauge);
    metric
}

fn counter_sample<N: AsRef<str>, V: AsRef<str>>(
    names: &[N],
    values: &[V],
    value: f64,
) -> proto::Metric {
    let mut counter = proto::Counter::default();
    counter.set_value(value);
    let mut metric = proto::Metric::default();
    for pair in label_pairs(names, values) {
        metric.mut_label().push(pair);
    }
    metric.set_counter(counter);
    metric
}

fn gauge_family(name: &str, help: &str, metrics: Vec<proto::Metric>) -> MetricFamily {
    family(name, help, MetricType::GAUGE, metrics)
}

fn family(name: &str, help: &str, kind: MetricType, metrics: Vec<proto::Metric>) -> MetricFamily {
    let mut family = MetricFamily::default();
    family.set_name(name.to_string());
    family.set_help(help.to_string());
    family.set_field_type(kind);
    for metric in metrics {
        family.mut_metric().push(metric);
    }
    family
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, OneOrMany};
    use crate::poller::PollerSettings;
    use crate::testutil::{instance, spec_for, FakeConnector, StaticSource};
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::time::Duration;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn settings() -> PollerSettings {
        PollerSettings {
            poll_interval: Duration::from_secs(3600),
            stop_timeout: Duration::from_secs(3),
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(20),
        }
    }

    fn family_named<'a>(families: &'a [MetricFamily], name: &str) -> Option<&'a MetricFamily> {
        families.iter().find(|f| f.get_name() == name)
    }

    fn label_map(metric: &proto::Metric) -> BTreeMap<String, String> {
        metric
            .get_label()
            .iter()
            .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
            .collect()
    }

    /// Started worker whose single fetch cycle has already been queued.
    async fn primed_worker(zone: &str, instances: Vec<crate::provider::Instance>) -> Arc<PollerWorker> {
        let filter = FilterConfig {
            status: Some(OneOrMany::One("running".into())),
            ..Default::default()
        };
        let worker = Arc::new(PollerWorker::new(
            spec_for(zone, "eu-west-1", filter),
            FakeConnector::new(StaticSource::new(instances)),
            settings(),
        ));
        worker.start().unwrap();
        for _ in 0..300 {
            if worker.health().is_up() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The cycle is enqueued before the long sleep begins.
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker
    }

    #[test]
    fn test_canonical_labels_order_independent() {
        let a = labels(&[("zone", "z"), ("ami", "a"), ("env", "prod")]);
        let b = labels(&[("env", "prod"), ("zone", "z"), ("ami", "a")]);
        assert_eq!(CanonicalLabels::from_labels(&a), CanonicalLabels::from_labels(&b));
        assert_eq!(
            CanonicalLabels::from_labels(&a).names(),
            vec!["ami", "env", "zone"]
        );
    }

    #[test]
    fn test_identical_label_sets_grouped() {
        let set = labels(&[("zone", "z"), ("machine", "t2.micro")]);
        let groups = group_facts(vec![Fact::single(set.clone()), Fact::single(set)]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].label_names, vec!["machine", "zone"]);
        assert_eq!(groups[0].label_values, vec!["t2.micro", "z"]);
    }

    #[test]
    fn test_distinct_label_sets_separate() {
        let groups = group_facts(vec![
            Fact::single(labels(&[("zone", "a")])),
            Fact::single(labels(&[("zone", "b")])),
            Fact::single(labels(&[("zone", "a")])),
            Fact::single(labels(&[("zone", "a"), ("env", "prod")])),
        ]);
        let counts: Vec<u64> = groups.iter().map(|g| g.count).collect();
        assert_eq!(groups.len(), 3);
        assert_eq!(counts.iter().sum::<u64>(), 4);
    }

    #[test]
    fn test_group_facts_empty() {
        assert!(group_facts(Vec::new()).is_empty());
    }

    #[test]
    fn test_sanitize_label_name() {
        assert_eq!(sanitize_label_name("env"), "env");
        assert_eq!(sanitize_label_name("aws:cloudformation:stack-name"), "aws_cloudformation_stack_name");
        assert_eq!(sanitize_label_name("9lives"), "_9lives");
        assert_eq!(sanitize_label_name(""), "_");
        assert_eq!(sanitize_label_name("Name"), "Name");
    }

    #[test]
    fn test_sanitized_names_group_together() {
        let groups = group_facts(vec![
            Fact::single(labels(&[("team-name", "x")])),
            Fact::single(labels(&[("team_name", "x")])),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 2);
    }

    #[test]
    fn test_alive_metric_without_pollers() {
        let aggregator = Aggregator::new("host-1", Vec::new());
        let families = aggregator.collect_families();
        assert_eq!(families.len(), 1);
        let alive = &families[0];
        assert_eq!(alive.get_name(), ALIVE_METRIC);
        assert_eq!(alive.get_field_type(), MetricType::GAUGE);
        let metric = &alive.get_metric()[0];
        assert_eq!(label_map(metric)["host"], "host-1");
        assert_eq!(metric.get_gauge().get_value(), 1.0);
    }

    #[tokio::test]
    async fn test_scenario_c_duplicates_counted_once() {
        let worker = primed_worker(
            "europe",
            vec![
                instance("running", "t2.micro", "ami-1", &[("env", "prod")]),
                instance("running", "t2.micro", "ami-1", &[("env", "prod")]),
                instance("stopped", "t2.micro", "ami-1", &[("env", "prod")]),
            ],
        )
        .await;
        let aggregator = Aggregator::new("host-1", vec![Arc::clone(&worker)]);

        let families = aggregator.collect_families();
        assert_eq!(families[0].get_name(), ALIVE_METRIC);
        let instances = family_named(&families, INSTANCES_METRIC).unwrap();
        assert_eq!(instances.get_metric().len(), 1);
        let metric = &instances.get_metric()[0];
        assert_eq!(metric.get_gauge().get_value(), 2.0);
        let map = label_map(metric);
        assert_eq!(map["zone"], "europe");
        assert_eq!(map["region"], "eu-west-1");
        assert_eq!(map["machine"], "t2.micro");
        assert_eq!(map["ami"], "ami-1");
        assert_eq!(map["env"], "prod");
        // Label order follows the sorted names.
        let names: Vec<&str> = metric.get_label().iter().map(|l| l.get_name()).collect();
        assert_eq!(names, vec!["ami", "env", "machine", "region", "zone"]);

        assert!(worker.stop().await);
    }

    #[tokio::test]
    async fn test_each_scrape_reflects_only_drained_facts() {
        let worker = primed_worker("europe", vec![instance("running", "t2.micro", "ami-1", &[])]).await;
        let aggregator = Aggregator::new("host-1", vec![Arc::clone(&worker)]);

        let first = aggregator.collect_families();
        assert!(family_named(&first, INSTANCES_METRIC).is_some());

        // The worker is sleeping; nothing new has been queued.
        let second = aggregator.collect_families();
        assert!(family_named(&second, INSTANCES_METRIC).is_none());
        assert_eq!(second[0].get_name(), ALIVE_METRIC);

        assert!(worker.stop().await);
    }

    #[tokio::test]
    async fn test_facts_from_all_pollers_merged() {
        let a = primed_worker("europe", vec![instance("running", "t2.micro", "ami-1", &[])]).await;
        let b = primed_worker("america", vec![instance("running", "t2.micro", "ami-1", &[])]).await;
        let aggregator = Aggregator::new("host-1", vec![Arc::clone(&a), Arc::clone(&b)]);

        let families = aggregator.collect_families();
        let instances = family_named(&families, INSTANCES_METRIC).unwrap();
        let zones: Vec<String> = instances
            .get_metric()
            .iter()
            .map(|m| label_map(m)["zone"].clone())
            .collect();
        assert_eq!(zones, vec!["america", "europe"]);

        let up = family_named(&families, POLLER_UP_METRIC).unwrap();
        assert_eq!(up.get_metric().len(), 2);
        assert!(up.get_metric().iter().all(|m| m.get_gauge().get_value() == 1.0));

        let errors = family_named(&families, POLLER_ERRORS_METRIC).unwrap();
        assert_eq!(errors.get_field_type(), MetricType::COUNTER);
        assert!(errors.get_metric().iter().all(|m| m.get_counter().get_value() == 0.0));

        assert!(a.stop().await);
        assert!(b.stop().await);
    }

    #[tokio::test]
    async fn test_failing_poller_reported_down() {
        let worker = Arc::new(PollerWorker::new(
            spec_for("europe", "eu-west-1", FilterConfig::default()),
            FakeConnector::refusing(),
            settings(),
        ));
        worker.start().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let aggregator = Aggregator::new("host-1", vec![Arc::clone(&worker)]);
        let families = aggregator.collect_families();
        assert!(family_named(&families, INSTANCES_METRIC).is_none());
        let up = family_named(&families, POLLER_UP_METRIC).unwrap();
        assert_eq!(up.get_metric()[0].get_gauge().get_value(), 0.0);
        let errors = family_named(&families, POLLER_ERRORS_METRIC).unwrap();
        assert!(errors.get_metric()[0].get_counter().get_value() >= 1.0);

        assert!(worker.stop().await);
    }

    #[tokio::test]
    async fn test_registry_text_exposition() {
        let worker = primed_worker(
            "europe",
            vec![instance("running", "t2.micro", "ami-1", &[("aws:autoscaling:groupName", "web")])],
        )
        .await;
        let registry = Registry::new();
        registry
            .register(Box::new(Aggregator::new("host-1", vec![Arc::clone(&worker)])))
            .unwrap();

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("ec2monitor_exporter_alive{host=\"host-1\"} 1"));
        assert!(text.contains("# TYPE ec2_number_instances gauge"));
        assert!(text.contains("aws_autoscaling_groupName=\"web\""));
        assert!(text.contains("ec2monitor_poller_up{zone=\"europe\",region=\"eu-west-1\"} 1"));

        assert!(worker.stop().await);
    }
}

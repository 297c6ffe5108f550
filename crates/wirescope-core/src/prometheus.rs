//! Prometheus text exposition
//!
//! Modules write samples into a [`PrometheusText`]; samples sharing a
//! metric name are grouped under one `# HELP`/`# TYPE` header when rendered.

use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

struct Family {
    name: String,
    help: String,
    kind: MetricKind,
    samples: Vec<String>,
}

/// Metric families in first-written order
#[derive(Default)]
pub struct PrometheusText {
    families: Vec<Family>,
}

impl PrometheusText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&mut self, name: &str, help: &str, labels: &[(&str, &str)], value: u64) {
        self.sample(MetricKind::Counter, name, help, labels, value);
    }

    pub fn gauge(&mut self, name: &str, help: &str, labels: &[(&str, &str)], value: impl Display) {
        self.sample(MetricKind::Gauge, name, help, labels, value);
    }

    fn sample(
        &mut self,
        kind: MetricKind,
        name: &str,
        help: &str,
        labels: &[(&str, &str)],
        value: impl Display,
    ) {
        let line = if labels.is_empty() {
            format!("{} {}", name, value)
        } else {
            format!("{}{{{}}} {}", name, label_set(labels), value)
        };

        match self.families.iter_mut().find(|f| f.name == name) {
            Some(family) => family.samples.push(line),
            None => self.families.push(Family {
                name: name.to_string(),
                help: help.to_string(),
                kind,
                samples: vec![line],
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn render(&self) -> String {
        let mut output = String::new();
        for family in &self.families {
            output.push_str(&format!("# HELP {} {}\n", family.name, family.help));
            output.push_str(&format!("# TYPE {} {}\n", family.name, family.kind.as_str()));
            for sample in &family.samples {
                output.push_str(sample);
                output.push('\n');
            }
            output.push('\n');
        }
        output
    }
}

fn label_set(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", key, escape(value)))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

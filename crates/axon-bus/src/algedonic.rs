//! Algedonic escalation.
//!
//! Pain/pleasure signals bypass ordinary reporting. A signal at or above
//! the escalator's threshold is pushed into every subscriber's algedonic
//! lane in publish order; subscribers drain that lane before anything
//! else, and it is never shed under backpressure. Signals below the
//! threshold travel as ordinary events on the same topic.
//!
//! The threshold lives here and only here. Detectors construct signals
//! with whatever intensity they measured; they never pre-filter.
//!
//! The path is lossy-fast: no retry, no persistence, no deduplication.

use std::sync::atomic::{AtomicU64, Ordering};

use axon_clock::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::{EventBus, Priority, Topic};

/// Default escalation threshold.
pub const DEFAULT_THRESHOLD: f64 = 0.8;

/// Polarity of an algedonic signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Pain,
    Pleasure,
}

/// A pain/pleasure signal, created at detection time and routed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgedonicSignal {
    pub kind: SignalKind,
    /// Strength in `[0, 1]`.
    pub intensity: f64,
    /// Who detected it (subsystem, sensor, pattern id...).
    pub source: String,
    /// Embedding of the pattern that triggered the signal, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_vector: Option<Vec<f32>>,
    pub hlc: Timestamp,
}

impl AlgedonicSignal {
    pub fn new(kind: SignalKind, intensity: f64, source: impl Into<String>, hlc: Timestamp) -> Result<Self> {
        validate_unit(intensity)?;
        Ok(Self {
            kind,
            intensity,
            source: source.into(),
            pattern_vector: None,
            hlc,
        })
    }

    #[must_use]
    pub fn with_pattern_vector(mut self, vector: Vec<f32>) -> Self {
        self.pattern_vector = Some(vector);
        self
    }
}

fn validate_unit(value: f64) -> Result<()> {
    if value.is_nan() || !(0.0..=1.0).contains(&value) {
        return Err(Error::InvalidIntensity(value));
    }
    Ok(())
}

/// Configuration for [`AlgedonicEscalator`].
#[derive(Debug, Clone, Copy)]
pub struct EscalatorConfig {
    /// Minimum intensity (inclusive) that takes the priority lane.
    pub threshold: f64,
}

impl Default for EscalatorConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl EscalatorConfig {
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

/// How a signal was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Delivered on the algedonic lane to this many subscribers.
    Escalated { delivered: usize },
    /// Below threshold; published as an ordinary event.
    Ordinary { delivered: usize },
}

impl Escalation {
    pub fn is_escalated(&self) -> bool {
        matches!(self, Self::Escalated { .. })
    }
}

/// Counters exposed by [`AlgedonicEscalator::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EscalatorStats {
    pub escalated: u64,
    pub ordinary: u64,
}

/// Privileged publish path for high-intensity signals.
#[derive(Debug)]
pub struct AlgedonicEscalator {
    bus: EventBus,
    config: EscalatorConfig,
    escalated: AtomicU64,
    ordinary: AtomicU64,
}

impl AlgedonicEscalator {
    pub fn new(bus: EventBus, config: EscalatorConfig) -> Result<Self> {
        validate_unit(config.threshold)?;
        Ok(Self {
            bus,
            config,
            escalated: AtomicU64::new(0),
            ordinary: AtomicU64::new(0),
        })
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    /// Route a signal according to its intensity.
    pub fn escalate(&self, signal: &AlgedonicSignal) -> Result<Escalation> {
        validate_unit(signal.intensity)?;
        let payload = serde_json::to_value(signal)?;

        if signal.intensity >= self.config.threshold {
            let (event, delivered) = self
                .bus
                .publish_with_priority(Topic::Algedonic, payload, Priority::Algedonic);
            self.escalated.fetch_add(1, Ordering::Relaxed);
            info!(
                kind = ?signal.kind,
                intensity = signal.intensity,
                source = %signal.source,
                id = %event.id,
                delivered,
                "algedonic signal escalated"
            );
            Ok(Escalation::Escalated { delivered })
        } else {
            let (_, delivered) = self
                .bus
                .publish_with_priority(Topic::Algedonic, payload, Priority::Ordinary);
            self.ordinary.fetch_add(1, Ordering::Relaxed);
            debug!(
                kind = ?signal.kind,
                intensity = signal.intensity,
                source = %signal.source,
                "algedonic signal below threshold, published as ordinary event"
            );
            Ok(Escalation::Ordinary { delivered })
        }
    }

    /// Stamp a new signal with the bus clock and route it.
    pub fn signal(&self, kind: SignalKind, intensity: f64, source: impl Into<String>) -> Result<Escalation> {
        let signal = AlgedonicSignal::new(kind, intensity, source, self.bus.hlc().now())?;
        self.escalate(&signal)
    }

    pub fn stats(&self) -> EscalatorStats {
        EscalatorStats {
            escalated: self.escalated.load(Ordering::Relaxed),
            ordinary: self.ordinary.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BusConfig;
    use axon_clock::{Hlc, ManualClock, NodeId};
    use serde_json::json;
    use std::sync::Arc;

    fn bus(capacity: usize) -> EventBus {
        let hlc = Arc::new(Hlc::with_source(
            NodeId::new("n1").unwrap(),
            Arc::new(ManualClock::new(10)),
        ));
        EventBus::with_config(hlc, BusConfig::default().with_subscriber_capacity(capacity))
    }

    #[test]
    fn rejects_out_of_range_intensity() {
        let bus = bus(4);
        let ts = bus.hlc().now();
        assert!(AlgedonicSignal::new(SignalKind::Pain, 1.2, "s1", ts.clone()).is_err());
        assert!(AlgedonicSignal::new(SignalKind::Pain, f64::NAN, "s1", ts.clone()).is_err());
        assert!(AlgedonicSignal::new(SignalKind::Pain, -0.1, "s1", ts).is_err());
        assert!(AlgedonicEscalator::new(bus, EscalatorConfig::default().with_threshold(2.0)).is_err());
    }

    #[test]
    fn threshold_is_inclusive() {
        let bus = bus(4);
        let escalator = AlgedonicEscalator::new(bus.clone(), EscalatorConfig::default()).unwrap();
        let _sub = bus.subscribe(Topic::Algedonic).unwrap();

        let at = escalator.signal(SignalKind::Pain, 0.8, "s3").unwrap();
        let below = escalator.signal(SignalKind::Pleasure, 0.79, "s3").unwrap();

        assert_eq!(at, Escalation::Escalated { delivered: 1 });
        assert_eq!(below, Escalation::Ordinary { delivered: 1 });
        assert_eq!(escalator.stats(), EscalatorStats { escalated: 1, ordinary: 1 });
    }

    #[test]
    fn escalated_signal_overtakes_a_full_ordinary_backlog() {
        let bus = bus(3);
        let a = bus.subscribe(Topic::Algedonic).unwrap();
        let mut b = bus.subscribe(Topic::StateChanged).unwrap();
        b.subscribe(Topic::Algedonic).unwrap();

        for n in 0..10 {
            bus.publish(Topic::Algedonic, json!({ "n": n }));
            bus.publish(Topic::StateChanged, json!({ "n": n }));
        }
        assert_eq!(a.pending(), 3);
        assert_eq!(b.pending(), 3);

        let escalator = AlgedonicEscalator::new(bus.clone(), EscalatorConfig::default()).unwrap();
        let signal = AlgedonicSignal::new(SignalKind::Pain, 0.95, "s1.ops", bus.hlc().now())
            .unwrap()
            .with_pattern_vector(vec![0.1, 0.2]);
        let outcome = escalator.escalate(&signal).unwrap();
        assert_eq!(outcome, Escalation::Escalated { delivered: 2 });

        for sub in [&a, &b] {
            let first = sub.try_recv().unwrap();
            assert!(first.is_algedonic());
            let decoded: AlgedonicSignal = first.payload_as().unwrap();
            assert_eq!(decoded, signal);
            assert!(!sub.try_recv().unwrap().is_algedonic());
        }
        assert_eq!(a.dropped(), 7);
    }

    #[test]
    fn escalated_signals_keep_publish_order() {
        let bus = bus(1);
        let sub = bus.subscribe(Topic::Algedonic).unwrap();
        let escalator = AlgedonicEscalator::new(bus.clone(), EscalatorConfig::default()).unwrap();
        for n in 0..20 {
            escalator
                .signal(SignalKind::Pain, 0.9, format!("sensor-{n}"))
                .unwrap();
        }
        for n in 0..20 {
            let event = sub.try_recv().unwrap();
            let signal: AlgedonicSignal = event.payload_as().unwrap();
            assert_eq!(signal.source, format!("sensor-{n}"));
        }
        assert_eq!(sub.dropped(), 0);
    }
}

//! replkv-observe: vendor-neutral observability ABI.
//!
//! The storage and consensus crates depend only on these traits and event types.
//! Exporters (Prometheus, OTLP, a live dashboard) implement [`Meter`] elsewhere.

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: VizEvent);
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
struct NoopH;
impl Histogram for NoopH {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, _e: VizEvent) {}
}

/// Typed events for live visualization (keys/values never included).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum VizEvent {
    Wal(WalEvt),
    Raft(RaftEvt),
}

#[derive(Clone, Debug)]
pub struct WalEvt {
    pub node: u32,
    /// Generation number of the log file the event refers to.
    pub generation: u64,
    pub kind: WalKind,
}
#[derive(Clone, Debug)]
pub enum WalKind {
    Fsync { ms: u32 },
    CorruptionTruncated { bytes: u64 },
    /// The log was rewritten into a new generation (compaction).
    Rewrite { bytes: u64 },
    GenerationGc,
}

#[derive(Clone, Debug)]
pub struct RaftEvt {
    pub node: String,
    pub term: u64,
    pub kind: RaftKind,
}
#[derive(Clone, Debug)]
pub enum RaftKind {
    VoteReq,
    VoteGranted { candidate: String },
    LeaderElected { votes: usize },
    StepDown,
    SnapshotTaken { index: u64 },
    SnapshotInstalled { index: u64 },
    StorageFailed,
}

/// Macros (simple versions). Can be feature-gated if desired.
#[macro_export]
macro_rules! obs_count {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.counter($name, $labels).inc($v as u64);
    }};
}
#[macro_export]
macro_rules! obs_gauge {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.gauge($name, $labels).set($v as i64);
    }};
}
#[macro_export]
macro_rules! obs_hist {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.histo($name, &[], $labels).observe($v as f64);
    }};
}
#[macro_export]
macro_rules! obs_timed {
    ($m:expr, $name:expr, $labels:expr, $body:block) => {{
        let __t = std::time::Instant::now();
        let __ret = { $body };
        let __ms = __t.elapsed().as_secs_f64() * 1000.0;
        $m.histo($name, &[], $labels).observe(__ms);
        __ret
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<VizEvent>>,
        total: Arc<AtomicU64>,
    }

    struct Sum(Arc<AtomicU64>);
    impl Counter for Sum {
        fn inc(&self, v: u64) {
            self.0.fetch_add(v, Ordering::Relaxed);
        }
    }

    impl Meter for Recording {
        fn counter(
            &self,
            _n: &'static str,
            _l: &'static [(&'static str, &'static str)],
        ) -> Box<dyn Counter> {
            Box::new(Sum(self.total.clone()))
        }
        fn gauge(
            &self,
            _n: &'static str,
            _l: &'static [(&'static str, &'static str)],
        ) -> Box<dyn Gauge> {
            Box::new(NoopG)
        }
        fn histo(
            &self,
            _n: &'static str,
            _b: &'static [f64],
            _l: &'static [(&'static str, &'static str)],
        ) -> Box<dyn Histogram> {
            Box::new(NoopH)
        }
        fn emit(&self, evt: VizEvent) {
            self.events.lock().unwrap().push(evt);
        }
    }

    #[test]
    fn test_noop_meter_accepts_everything() {
        let m = NoopMeter;
        obs_count!(m, "wal_appends_total", &[], 3);
        obs_gauge!(m, "raft_term", &[], 7);
        obs_hist!(m, "wal_fsync_ms", &[], 1.5);
        let v = obs_timed!(m, "noop_ms", &[], { 40 + 2 });
        assert_eq!(v, 42);
        m.emit(VizEvent::Raft(RaftEvt {
            node: "n1".into(),
            term: 1,
            kind: RaftKind::StepDown,
        }));
    }

    #[test]
    fn test_custom_meter_sees_counts_and_events() {
        let m = Recording::default();
        obs_count!(m, "x", &[], 2);
        obs_count!(m, "x", &[], 5);
        assert_eq!(m.total.load(Ordering::Relaxed), 7);

        m.emit(VizEvent::Wal(WalEvt {
            node: 0,
            generation: 3,
            kind: WalKind::Rewrite { bytes: 128 },
        }));
        let events = m.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            VizEvent::Wal(WalEvt { generation: 3, .. })
        ));
    }
}

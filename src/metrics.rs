use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::RejectionKind;

pub struct Metrics {
    // Binder
    pub binds_total: AtomicU64,
    pub clears_total: AtomicU64,
    pub clear_failures_total: AtomicU64,
    pub connections_discarded_total: AtomicU64,

    // Pipeline
    pub requests_bound_total: AtomicU64,
    pub requests_unbound_total: AtomicU64,
    pub rejections_malformed_total: AtomicU64,
    pub rejections_unknown_total: AtomicU64,
    pub rejections_mismatch_total: AtomicU64,
    pub rejections_missing_total: AtomicU64,
    pub rejections_internal_total: AtomicU64,

    // Admin path
    pub admin_access_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            binds_total: AtomicU64::new(0),
            clears_total: AtomicU64::new(0),
            clear_failures_total: AtomicU64::new(0),
            connections_discarded_total: AtomicU64::new(0),
            requests_bound_total: AtomicU64::new(0),
            requests_unbound_total: AtomicU64::new(0),
            rejections_malformed_total: AtomicU64::new(0),
            rejections_unknown_total: AtomicU64::new(0),
            rejections_mismatch_total: AtomicU64::new(0),
            rejections_missing_total: AtomicU64::new(0),
            rejections_internal_total: AtomicU64::new(0),
            admin_access_total: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    pub fn record_bind(&self) {
        self.binds_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clear(&self) {
        self.clears_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clear_failure(&self) {
        self.clear_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.connections_discarded_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, bound: bool) {
        if bound {
            self.requests_bound_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_unbound_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejection(&self, kind: RejectionKind) {
        let counter = match kind {
            RejectionKind::MalformedIdentity => &self.rejections_malformed_total,
            RejectionKind::UnknownOrInactiveScope => &self.rejections_unknown_total,
            RejectionKind::ScopeMismatch => &self.rejections_mismatch_total,
            RejectionKind::MissingScope => &self.rejections_missing_total,
            _ => &self.rejections_internal_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admin_access(&self) {
        self.admin_access_total.fetch_add(1, Ordering::Relaxed);
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    let counters: [(&str, &AtomicU64); 12] = [
        ("rowguard_binds_total", &m.binds_total),
        ("rowguard_clears_total", &m.clears_total),
        ("rowguard_clear_failures_total", &m.clear_failures_total),
        (
            "rowguard_connections_discarded_total",
            &m.connections_discarded_total,
        ),
        ("rowguard_requests_bound_total", &m.requests_bound_total),
        ("rowguard_requests_unbound_total", &m.requests_unbound_total),
        (
            "rowguard_rejections_malformed_total",
            &m.rejections_malformed_total,
        ),
        (
            "rowguard_rejections_unknown_total",
            &m.rejections_unknown_total,
        ),
        (
            "rowguard_rejections_mismatch_total",
            &m.rejections_mismatch_total,
        ),
        (
            "rowguard_rejections_missing_total",
            &m.rejections_missing_total,
        ),
        (
            "rowguard_rejections_internal_total",
            &m.rejections_internal_total,
        ),
        ("rowguard_admin_access_total", &m.admin_access_total),
    ];
    for (name, value) in counters {
        let _ = writeln!(
            s,
            "# TYPE {name} counter\n{name} {}",
            value.load(Ordering::Relaxed)
        );
    }
    s
}

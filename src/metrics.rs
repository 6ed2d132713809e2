use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};


lazy_static! {
    pub static ref UPDATES_TOTAL: Counter =
        register_counter!("gateway_updates_total", "Total number of inbound updates").unwrap();
    pub static ref ADMISSION_DECISIONS: CounterVec = register_counter_vec!(
        "gateway_admission_decisions_total",
        "Admission outcomes by command class and result",
        &["class", "outcome"]
    )
    .unwrap();
    pub static ref CREDITS_CHARGED: Counter =
        register_counter!("gateway_trial_credits_charged_total", "Trial credits consumed").unwrap();
    pub static ref CREDITS_REFUNDED: Counter = register_counter!(
        "gateway_trial_credits_refunded_total",
        "Trial credits returned after a cached or failed answer"
    )
    .unwrap();
    pub static ref EFFECT_SEARCHES: Counter =
        register_counter!("gateway_effect_searches_total", "Effect lookups sent to search").unwrap();
    pub static ref STORE_FAILURES: Counter = register_counter!(
        "gateway_admission_store_failures_total",
        "Entitlement store errors seen by the admission pipeline"
    )
    .unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("gateway_cache_hits_total", "Total cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("gateway_cache_misses_total", "Total cache misses").unwrap();
    pub static ref COMPLETION_LATENCY: Histogram = register_histogram!(
        "gateway_completion_latency_seconds",
        "Completion latency in seconds"
    )
    .unwrap();
    pub static ref CACHE_SIZE: Gauge =
        register_gauge!("gateway_cache_size", "Current number of items in cache").unwrap();
}

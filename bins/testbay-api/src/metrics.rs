// Prometheus counters for the job API

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec, TextEncoder};

lazy_static! {
    pub static ref JOBS_ADMITTED: IntCounter = register_int_counter!(
        "testbay_jobs_admitted_total",
        "Runs recorded and queued"
    )
    .expect("metric can be registered");

    pub static ref QUOTA_REJECTIONS: IntCounter = register_int_counter!(
        "testbay_quota_rejections_total",
        "Counted runs refused because the test case limit was reached"
    )
    .expect("metric can be registered");

    pub static ref PUBLISH_FAILURES: IntCounter = register_int_counter!(
        "testbay_publish_failures_total",
        "Runs recorded whose work message could not be published"
    )
    .expect("metric can be registered");

    pub static ref ARTIFACT_FAILURES: IntCounter = register_int_counter!(
        "testbay_artifact_failures_total",
        "Finished runs whose result bodies could not be loaded"
    )
    .expect("metric can be registered");

    pub static ref RESULTS_INGESTED: IntCounterVec = register_int_counter_vec!(
        "testbay_results_ingested_total",
        "Result messages consumed, by outcome",
        &["outcome"]
    )
    .expect("metric can be registered");
}

/// Force registration so every counter is exported from the first scrape
pub fn register() {
    lazy_static::initialize(&JOBS_ADMITTED);
    lazy_static::initialize(&QUOTA_REJECTIONS);
    lazy_static::initialize(&PUBLISH_FAILURES);
    lazy_static::initialize(&ARTIFACT_FAILURES);
    lazy_static::initialize(&RESULTS_INGESTED);
}

/// Render the default registry in the text exposition format
pub fn render() -> Result<String, prometheus::Error> {
    register();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

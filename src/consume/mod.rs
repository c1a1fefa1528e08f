//! Consumption pipeline: write-behind aggregation and log persistence.

pub mod batch;
pub mod log_writer;

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::model::log::RequestLog;

static PIPELINE: Lazy<Arc<batch::Pipeline>> = Lazy::new(|| Arc::new(batch::Pipeline::new()));

pub fn pipeline() -> Arc<batch::Pipeline> {
    PIPELINE.clone()
}

/// Entry point for the dispatcher: merge the record into the write-behind
/// buffer and hand it to the log writer. Neither path can fail the
/// client-visible response.
pub fn submit(log: RequestLog) {
    PIPELINE.batch_update(&log);
    log_writer::persist(&log);
}

/// Start the periodic flusher.
pub fn spawn_flush_loop() {
    let pipeline = PIPELINE.clone();
    tokio::spawn(async move {
        let interval_secs = crate::config::load().batch_flush_interval_secs.max(1);
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tick.tick().await;
            pipeline.flush(&crate::store::global());
        }
    });
}

use log::info;

/// Fire-and-forget notification channel for pipeline progress. A failing
/// sink must never fail the pipeline, so these methods do not return
/// errors; implementations swallow their own.
pub trait EventSink: Send + Sync {
    /// A posting was scored and persisted.
    fn job_processed(&self, title: &str, company: &str, location: &str, overall: u8);

    /// Free-form progress line.
    fn log_line(&self, message: &str);
}

/// Default sink: write everything through the log facade.
pub struct LogSink;

impl EventSink for LogSink {
    fn job_processed(&self, title: &str, company: &str, location: &str, overall: u8) {
        info!("Processed: {title} @ {company} - {location} (overall {overall})");
    }

    fn log_line(&self, message: &str) {
        info!("{message}");
    }
}

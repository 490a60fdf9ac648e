//! Buffered log forwarding to the upstream execution engine.
//!
//! Grounded in `JobRunner/logger.py`: lines accumulate in a small buffer and
//! flush to `add_job_logs` once the buffer reaches a threshold, or on an
//! explicit [`LogSink::flush`]; `log_lines` (the bulk path used for
//! container stdout/stderr draining) bypasses the buffer and posts
//! immediately. When `DEBUG_RUNNER` is set, every line is also mirrored to
//! this process's stdout/stderr (`spec.md` SUPPLEMENTED FEATURES).

use std::sync::Arc;

use crate::upstream::ExecutionEngineClient;
use crate::upstream::LogLine;

/// Number of buffered lines that triggers an automatic flush.
const FLUSH_THRESHOLD: usize = 5;

/// A buffered forwarder of job log lines to the upstream execution engine.
pub struct LogSink {
    /// The job these lines belong to.
    job_id: String,
    /// The upstream client lines are flushed to.
    upstream: Arc<dyn ExecutionEngineClient>,
    /// Lines accumulated since the last flush.
    buffer: Vec<LogLine>,
    /// Mirror every line to this process's stdout/stderr.
    debug: bool,
}

impl LogSink {
    /// Creates a new sink for `job_id`, forwarding through `upstream`.
    pub fn new(job_id: impl Into<String>, upstream: Arc<dyn ExecutionEngineClient>, debug: bool) -> Self {
        Self {
            job_id: job_id.into(),
            upstream,
            buffer: Vec::new(),
            debug,
        }
    }

    /// Buffers a single log line, flushing automatically once the buffer
    /// reaches [`FLUSH_THRESHOLD`].
    pub async fn log_line(&mut self, line: impl Into<String>, is_error: bool) {
        let line = line.into();
        self.mirror(&line, is_error);
        self.buffer.push(LogLine { line, is_error });
        if self.buffer.len() > FLUSH_THRESHOLD {
            self.flush().await;
        }
    }

    /// Convenience for a non-error line.
    pub async fn log(&mut self, line: impl Into<String>) {
        self.log_line(line, false).await;
    }

    /// Convenience for an error line.
    pub async fn error(&mut self, line: impl Into<String>) {
        self.log_line(line, true).await;
    }

    /// Posts a batch of lines immediately, bypassing the buffer. Used to
    /// drain a container's full stdout/stderr history in one call.
    pub async fn log_lines(&mut self, lines: Vec<(String, bool)>) {
        for (line, is_error) in &lines {
            self.mirror(line, *is_error);
        }
        let lines: Vec<LogLine> = lines
            .into_iter()
            .map(|(line, is_error)| LogLine { line, is_error })
            .collect();
        if let Err(err) = self.upstream.add_job_logs(&self.job_id, &lines).await {
            tracing::warn!(job_id = %self.job_id, error = %err, "failed to post job logs");
        }
    }

    /// Flushes any buffered lines to the upstream execution engine.
    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut self.buffer);
        if let Err(err) = self.upstream.add_job_logs(&self.job_id, &lines).await {
            tracing::warn!(job_id = %self.job_id, error = %err, "failed to flush job logs");
        }
    }

    /// Mirrors a line to this process's stdout/stderr when debug mode is on.
    fn mirror(&self, line: &str, is_error: bool) {
        if !self.debug {
            return;
        }
        if is_error {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobConfigDoc;
    use crate::job::JobParams;
    use crate::upstream::UpstreamError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingUpstream {
        posted: Mutex<Vec<Vec<LogLine>>>,
    }

    #[async_trait::async_trait]
    impl ExecutionEngineClient for RecordingUpstream {
        async fn check_job_canceled(&self, _job_id: &str) -> Result<bool, UpstreamError> {
            Ok(false)
        }

        async fn get_job_params(
            &self,
            _job_id: &str,
        ) -> Result<(JobParams, JobConfigDoc), UpstreamError> {
            unreachable!()
        }

        async fn update_job_started(&self, _job_id: &str) -> Result<(), UpstreamError> {
            Ok(())
        }

        async fn add_job_logs(&self, _job_id: &str, lines: &[LogLine]) -> Result<(), UpstreamError> {
            self.posted.lock().unwrap().push(lines.to_vec());
            Ok(())
        }

        async fn finish_job(&self, _job_id: &str, _output: &serde_json::Value) -> Result<(), UpstreamError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn flush_happens_automatically_past_threshold() {
        let upstream = Arc::new(RecordingUpstream::default());
        let mut sink = LogSink::new("job-1", upstream.clone(), false);

        for i in 0..FLUSH_THRESHOLD {
            sink.log(format!("line {i}")).await;
        }
        {
            let posted = upstream.posted.lock().unwrap();
            assert!(posted.is_empty(), "must not flush at exactly the threshold");
        }

        sink.log("one more line").await;

        let posted = upstream.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].len(), FLUSH_THRESHOLD + 1);
    }

    #[tokio::test]
    async fn explicit_flush_posts_partial_buffer() {
        let upstream = Arc::new(RecordingUpstream::default());
        let mut sink = LogSink::new("job-1", upstream.clone(), false);

        sink.log("only one line").await;
        sink.flush().await;

        let posted = upstream.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].len(), 1);
    }

    #[tokio::test]
    async fn log_lines_bypasses_the_buffer() {
        let upstream = Arc::new(RecordingUpstream::default());
        let mut sink = LogSink::new("job-1", upstream.clone(), false);

        sink.log_lines(vec![
            (String::from("stdout line"), false),
            (String::from("stderr line"), true),
        ])
        .await;

        assert!(sink.buffer.is_empty());
        let posted = upstream.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].len(), 2);
    }
}

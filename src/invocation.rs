//! # Device Invocation Loop
//!
//! Drives the repeated call sequence against a single device. Iterations on
//! one device are strictly sequential; the loop shares nothing with other
//! devices except the read-only [`InvocationSpec`], the cancellation signal,
//! the statistics accumulator and the result sink.
//!
//! ## Iteration
//!
//! 1. Build the digit payload (`None` when the size is zero)
//! 2. Stamp the start, invoke with the per-call timeout, stamp the end
//! 3. Status 200 is a success and its adjusted latency is the elapsed time
//!    minus the device-side wait; anything else is a failed sample
//! 4. Record the sample and write its line to the sink
//! 5. Stop if cancellation was requested, otherwise sleep the interval
//!
//! A call in flight is never abandoned on cancellation. The per-call timeout
//! bounds how long the loop can take to notice a stop request.

use crate::cancel::CancellationSignal;
use crate::config::InvocationSpec;
use crate::sink::ResultSink;
use crate::stats::{FailureCause, InvocationSample, SampleOutcome, StatisticsAccumulator};
use crate::transport::{MethodRequest, RpcTransport};
use crate::utils::{digit_cycle, format_timestamp};
use chrono::Local;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

/// Synthetic payload of exactly `size` digits, or no payload for size 0
pub fn build_payload(size: usize) -> Option<Vec<u8>> {
    (size > 0).then(|| digit_cycle(size))
}

/// Format the record line for one sample
pub fn sample_line(sample: &InvocationSample) -> String {
    let head = format!(
        "[{}]start:{}->end:{}",
        sample.sequence_number,
        format_timestamp(&sample.started_at),
        format_timestamp(&sample.finished_at)
    );
    match &sample.outcome {
        SampleOutcome::Succeeded {
            adjusted_latency_ms,
        } => format!("{} = {}", head, adjusted_latency_ms),
        SampleOutcome::Failed(cause) => format!("{} failed: {}", head, cause),
    }
}

/// What one device loop got through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRunSummary {
    pub device_id: String,
    pub attempted: usize,
    pub succeeded: usize,
    /// The loop ended because of a stop request before its last iteration
    pub cancelled: bool,
}

pub struct DeviceInvocationLoop {
    device_id: String,
    spec: Arc<InvocationSpec>,
    cancel: CancellationSignal,
    accumulator: Arc<StatisticsAccumulator>,
    sink: Arc<dyn ResultSink>,
}

impl DeviceInvocationLoop {
    pub fn new(
        device_id: impl Into<String>,
        spec: Arc<InvocationSpec>,
        cancel: CancellationSignal,
        accumulator: Arc<StatisticsAccumulator>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            spec,
            cancel,
            accumulator,
            sink,
        }
    }

    fn request(&self) -> MethodRequest {
        MethodRequest {
            device_id: self.device_id.clone(),
            module_id: self.spec.module_id.clone(),
            method_name: self.spec.method_name.clone(),
            payload: build_payload(self.spec.payload_size),
        }
    }

    async fn invoke_once(
        &self,
        transport: &mut dyn RpcTransport,
        request: &MethodRequest,
        sequence_number: usize,
    ) -> InvocationSample {
        let call_timeout = self.spec.call_timeout();
        let started_at = Local::now();
        let clock = Instant::now();
        let result = transport.invoke(request, call_timeout).await;
        let elapsed = clock.elapsed();
        let finished_at = Local::now();

        let outcome = match result {
            Ok(response) if response.is_success() => {
                if let Err(e) = response.body_json() {
                    debug!(
                        "{} [{}] response body is not JSON: {}",
                        self.device_id, sequence_number, e
                    );
                }
                let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
                SampleOutcome::Succeeded {
                    adjusted_latency_ms: elapsed_ms - self.spec.wait_in_method_ms as f64,
                }
            }
            Ok(response) => {
                warn!(
                    "{} [{}] invocation returned status {}",
                    self.device_id, sequence_number, response.status
                );
                SampleOutcome::Failed(FailureCause::Status(response.status))
            }
            Err(e) => {
                warn!(
                    "{} [{}] invocation failed: {}",
                    self.device_id, sequence_number, e
                );
                SampleOutcome::Failed(FailureCause::Transport(e.to_string()))
            }
        };

        InvocationSample {
            device_id: self.device_id.clone(),
            sequence_number,
            started_at,
            finished_at,
            outcome,
        }
    }

    /// Run the whole sequence on an opened transport.
    pub async fn run(&self, transport: &mut dyn RpcTransport) -> DeviceRunSummary {
        let request = self.request();
        let iterations = self.spec.iteration_count;
        let interval = self.spec.interval();
        let mut summary = DeviceRunSummary {
            device_id: self.device_id.clone(),
            attempted: 0,
            succeeded: 0,
            cancelled: false,
        };

        debug!(
            "Starting {} invocation(s) of {} on {}",
            iterations, self.spec.method_name, self.device_id
        );

        for sequence_number in 0..iterations {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let sample = self.invoke_once(transport, &request, sequence_number).await;
            summary.attempted += 1;
            if sample.succeeded() {
                summary.succeeded += 1;
            }
            trace!("{}", sample);
            self.accumulator.record(&sample);
            self.sink.write_line(&sample_line(&sample));

            let last = sequence_number + 1 == iterations;
            if self.cancel.is_cancelled() {
                summary.cancelled = !last;
                break;
            }
            if last || interval.is_zero() {
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                _ = sleep(interval) => {}
            }
        }

        debug!(
            "{} finished: {}/{} succeeded{}",
            self.device_id,
            summary.succeeded,
            summary.attempted,
            if summary.cancelled { " (stopped)" } else { "" }
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::transport::{CloseError, ConnectError, InvokeError, MethodResponse};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Answers with a scripted list of statuses, 200 once the list runs out
    struct ScriptedTransport {
        statuses: VecDeque<Result<u16, ()>>,
        requests: Vec<MethodRequest>,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn new(statuses: Vec<Result<u16, ()>>) -> Self {
            Self {
                statuses: statuses.into(),
                requests: Vec::new(),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn open(&mut self) -> Result<(), ConnectError> {
            Ok(())
        }

        async fn invoke(
            &mut self,
            request: &MethodRequest,
            timeout: Duration,
        ) -> Result<MethodResponse, InvokeError> {
            self.requests.push(request.clone());
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            match self.statuses.pop_front().unwrap_or(Ok(200)) {
                Ok(status) => Ok(MethodResponse::json(
                    status,
                    &serde_json::json!({ "response-data": "invoked" }),
                )),
                Err(()) => Err(InvokeError::Timeout(timeout)),
            }
        }

        async fn close(&mut self) -> Result<(), CloseError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn spec(iterations: usize, interval_ms: u64, wait_ms: u64) -> Arc<InvocationSpec> {
        Arc::new(InvocationSpec {
            method_name: "DeviceMethodTest".to_string(),
            payload_size: 5,
            response_data_size: 0,
            iteration_count: iterations,
            interval_ms,
            call_timeout_ms: 1000,
            wait_in_method_ms: wait_ms,
            module_id: None,
        })
    }

    fn device_loop(
        spec: Arc<InvocationSpec>,
        cancel: CancellationSignal,
    ) -> (DeviceInvocationLoop, Arc<StatisticsAccumulator>, Arc<MemorySink>) {
        let accumulator = Arc::new(StatisticsAccumulator::new());
        let sink = Arc::new(MemorySink::new());
        let device_loop =
            DeviceInvocationLoop::new("d1", spec, cancel, accumulator.clone(), sink.clone());
        (device_loop, accumulator, sink)
    }

    #[test]
    fn test_build_payload() {
        assert_eq!(build_payload(0), None);
        assert_eq!(build_payload(13), Some(b"0123456789012".to_vec()));
    }

    #[tokio::test]
    async fn test_three_successful_iterations() {
        let (device_loop, accumulator, sink) = device_loop(spec(3, 0, 0), CancellationSignal::new());
        let mut transport = ScriptedTransport::new(vec![]);

        let summary = device_loop.run(&mut transport).await;
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 3);
        assert!(!summary.cancelled);

        let stats = accumulator.snapshot();
        assert_eq!(stats.total_attempted, 3);
        assert_eq!(stats.succeeded, 3);
        assert!(stats.latency.summary().unwrap().population_std_dev >= 0.0);

        assert_eq!(transport.requests.len(), 3);
        assert_eq!(transport.requests[0].payload, Some(b"01234".to_vec()));
        assert_eq!(transport.requests[0].method_name, "DeviceMethodTest");

        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("[0]start:"));
        assert!(lines[2].starts_with("[2]start:"));
        assert!(lines[1].contains("->end:"));
    }

    #[tokio::test]
    async fn test_failed_status_and_transport_error_continue() {
        let (device_loop, accumulator, sink) = device_loop(spec(4, 0, 0), CancellationSignal::new());
        let mut transport = ScriptedTransport::new(vec![Ok(200), Ok(500), Err(()), Ok(200)]);

        let summary = device_loop.run(&mut transport).await;
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.succeeded, 2);

        let stats = accumulator.snapshot();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.latency.summary().unwrap().count, 2);

        let lines = sink.lines();
        assert!(lines[1].ends_with("failed: status 500"));
        assert!(lines[2].contains("failed: no response within"));
    }

    #[tokio::test]
    async fn test_wait_in_method_can_make_latency_negative() {
        let (device_loop, accumulator, _) = device_loop(spec(1, 0, 10_000), CancellationSignal::new());
        let mut transport = ScriptedTransport::new(vec![]);
        device_loop.run(&mut transport).await;

        let stats = accumulator.snapshot();
        assert!(stats.latency.summary().unwrap().mean < 0.0);
        assert_eq!(stats.negative_latencies, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start_issues_no_call() {
        let cancel = CancellationSignal::new();
        cancel.cancel();
        let (device_loop, accumulator, _) = device_loop(spec(5, 0, 0), cancel);
        let mut transport = ScriptedTransport::new(vec![]);

        let summary = device_loop.run(&mut transport).await;
        assert!(summary.cancelled);
        assert_eq!(summary.attempted, 0);
        assert!(transport.requests.is_empty());
        assert!(accumulator.snapshot().latency.is_no_data());
    }

    #[tokio::test]
    async fn test_cancel_wakes_sleeping_loop() {
        let cancel = CancellationSignal::new();
        let (device_loop, accumulator, _) = device_loop(spec(100, 60_000, 0), cancel.clone());
        let mut transport = ScriptedTransport::new(vec![]);

        let stopper = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let started = Instant::now();
        let summary = device_loop.run(&mut transport).await;
        stopper.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(summary.cancelled);
        assert_eq!(summary.attempted, 1);
        assert_eq!(accumulator.snapshot().total_attempted, 1);
    }

    #[tokio::test]
    async fn test_call_in_flight_completes_after_cancel() {
        let cancel = CancellationSignal::new();
        let (device_loop, accumulator, _) = device_loop(spec(10, 0, 0), cancel.clone());
        let mut transport = ScriptedTransport::new(vec![]);
        transport.delay = Duration::from_millis(100);

        let stopper = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let summary = device_loop.run(&mut transport).await;
        stopper.await.unwrap();

        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.succeeded, 1);
        assert!(summary.cancelled);
        assert_eq!(accumulator.snapshot().succeeded, 1);
    }
}

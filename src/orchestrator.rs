//! Drives one run: measure and connect concurrently, then walk the stages.
//!
//! Each stage's `display` invocation is spawned and left to finish on its
//! own; the dwell timer starts right after the spawn and alone decides when
//! the next stage goes out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::display::{ActionOutcome, DisplayContent, STAGES};
use crate::measure::{MeasurementError, MeasurementProvider, MeasurementResult};
use crate::thing::{ActionInvoker, DeviceConnector, DeviceError};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("speed test failed: {0}")]
    Measurement(#[from] MeasurementError),

    #[error("thing connection failed: {0}")]
    Device(#[from] DeviceError),

    #[error("display sequence failed: {0}")]
    Sequence(#[from] serde_json::Error),
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingJoin,
    Connected,
    Showing(&'static str),
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::AwaitingJoin => write!(f, "awaiting-join"),
            Phase::Connected => write!(f, "connected"),
            Phase::Showing(label) => write!(f, "showing-{}", label.to_ascii_lowercase()),
            Phase::Done => write!(f, "done"),
        }
    }
}

fn enter(phase: Phase) {
    debug!(%phase, "run phase");
}

/// Run the speed test, fetch the description and start the clients all at
/// once. Any failure fails the whole join. On success the description is
/// consumed into a live handle.
pub async fn connect_and_measure<P, C>(
    provider: &P,
    connector: &C,
    description_url: &str,
) -> Result<(C::Thing, MeasurementResult), RunError>
where
    P: MeasurementProvider + ?Sized,
    C: DeviceConnector,
{
    enter(Phase::AwaitingJoin);
    let (measurement, td, ()) = tokio::try_join!(
        async { provider.measure().await.map_err(RunError::from) },
        async {
            connector
                .fetch_description(description_url)
                .await
                .map_err(RunError::from)
        },
        async { connector.start().await.map_err(RunError::from) },
    )?;
    let thing = connector.consume(td, description_url).await?;
    enter(Phase::Connected);
    Ok((thing, measurement))
}

/// Show every stage on `thing`, holding each one for `dwell`.
pub async fn show_stages<T: ActionInvoker>(
    thing: Arc<T>,
    action: &str,
    measurement: &MeasurementResult,
    dwell: Duration,
) -> Result<(), RunError> {
    for stage in &STAGES {
        enter(Phase::Showing(stage.label));
        let content = stage.content(measurement);
        let payload = serde_json::to_value(&content)?;
        set_display(thing.clone(), action.to_string(), content, payload);
        tokio::time::sleep(dwell).await;
    }
    enter(Phase::Done);
    Ok(())
}

/// Fire the action and log its outcome whenever it arrives.
fn set_display<T: ActionInvoker>(
    thing: Arc<T>,
    action: String,
    content: DisplayContent,
    payload: serde_json::Value,
) {
    tokio::spawn(async move {
        match thing.invoke_action(&action, payload).await {
            Ok(reply) => match serde_json::from_value::<ActionOutcome>(reply) {
                Ok(outcome) if outcome.is_created() => {
                    info!(
                        headline = %content.headline,
                        subheadline = %content.subheadline,
                        body = %content.body,
                        "showing content was successful"
                    );
                }
                Ok(outcome) => {
                    warn!(
                        status = %outcome.display.status,
                        headline = %content.headline,
                        subheadline = %content.subheadline,
                        body = %content.body,
                        "showing content failed"
                    );
                }
                Err(e) => {
                    error!(error = %e, headline = %content.headline, "setDisplay error: unexpected reply");
                }
            },
            Err(e) => {
                error!(error = %e, headline = %content.headline, "setDisplay error");
            }
        }
    });
}

/// One full run: join, consume, present. Nothing is torn down afterwards.
pub async fn orchestrate<P, C>(
    provider: &P,
    connector: &C,
    description_url: &str,
    action: &str,
    dwell: Duration,
) -> Result<(), RunError>
where
    P: MeasurementProvider + ?Sized,
    C: DeviceConnector,
{
    enter(Phase::Idle);
    info!(url = %description_url, "starting run");

    let (thing, measurement) = match connect_and_measure(provider, connector, description_url).await {
        Ok(joined) => joined,
        Err(e) => {
            error!(error = %e, "consumed thing error");
            return Err(e);
        }
    };

    if let Err(e) = show_stages(Arc::new(thing), action, &measurement, dwell).await {
        error!(error = %e, "fetch error");
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thing::ThingDescription;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    const URL: &str = "http://192.168.178.27/.well-known/wot-thing-description";
    const DWELL: Duration = Duration::from_secs(10);

    struct FixedProvider(Option<MeasurementResult>);

    #[async_trait::async_trait]
    impl MeasurementProvider for FixedProvider {
        fn id(&self) -> &'static str {
            "fixed"
        }

        async fn measure(&self) -> Result<MeasurementResult, MeasurementError> {
            self.0.clone().ok_or(MeasurementError::NoResult)
        }
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Created,
        Rejected,
        TransportError,
        Hang,
    }

    #[derive(Default)]
    struct Calls {
        seen: Mutex<Vec<(Instant, String, serde_json::Value)>>,
    }

    struct FakeThing {
        reply: Reply,
        calls: Arc<Calls>,
    }

    #[async_trait::async_trait]
    impl ActionInvoker for FakeThing {
        async fn invoke_action(
            &self,
            name: &str,
            input: serde_json::Value,
        ) -> Result<serde_json::Value, DeviceError> {
            self.calls
                .seen
                .lock()
                .unwrap()
                .push((Instant::now(), name.to_string(), input));
            match self.reply {
                Reply::Created => Ok(serde_json::json!({"display": {"status": "created"}})),
                Reply::Rejected => Ok(serde_json::json!({"display": {"status": "busy"}})),
                Reply::TransportError => Err(DeviceError::Coap("connection refused".into())),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    struct FakeConnector {
        reply: Reply,
        calls: Arc<Calls>,
        fail_fetch: bool,
        fail_start: bool,
        started: AtomicUsize,
    }

    impl FakeConnector {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                calls: Arc::new(Calls::default()),
                fail_fetch: false,
                fail_start: false,
                started: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl DeviceConnector for FakeConnector {
        type Thing = FakeThing;

        async fn fetch_description(&self, url: &str) -> Result<ThingDescription, DeviceError> {
            assert_eq!(url, URL);
            if self.fail_fetch {
                return Err(DeviceError::Status {
                    url: url.to_string(),
                    code: "404 Not Found".into(),
                });
            }
            Ok(ThingDescription {
                title: "Display".into(),
                ..ThingDescription::default()
            })
        }

        async fn start(&self) -> Result<(), DeviceError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(DeviceError::NotStarted);
            }
            Ok(())
        }

        async fn consume(&self, td: ThingDescription, _url: &str) -> Result<FakeThing, DeviceError> {
            assert_eq!(td.title, "Display");
            Ok(FakeThing {
                reply: self.reply,
                calls: self.calls.clone(),
            })
        }
    }

    fn measurement() -> MeasurementResult {
        MeasurementResult::new(23.4, 12_500_000.0, 4_375_000.0, "Frankfurt")
    }

    /// Paused time advances in whole timer ticks.
    fn assert_within_tick(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(5),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    async fn run(connector: &FakeConnector, provider: &FixedProvider) -> Result<(), RunError> {
        orchestrate(provider, connector, URL, "display", DWELL).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_stages_in_order_one_dwell_apart() {
        let connector = FakeConnector::new(Reply::Created);
        let started = Instant::now();
        run(&connector, &FixedProvider(Some(measurement()))).await.unwrap();
        assert_within_tick(started.elapsed(), DWELL * 3);

        let seen = connector.calls.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        let headlines: Vec<&str> = seen.iter().map(|(_, _, v)| v["headline"].as_str().unwrap()).collect();
        assert_eq!(headlines, vec!["Ping", "Download", "Upload"]);
        assert!(seen.iter().all(|(_, name, _)| name == "display"));
        assert_eq!(seen[0].2["body"], "23.4 ms");
        assert_eq!(seen[1].2["body"], "100.00 mbit/s");
        assert_eq!(seen[2].2["subheadline"], "Frankfurt");
        for pair in seen.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= DWELL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_action_does_not_hold_the_sequence() {
        let connector = FakeConnector::new(Reply::Hang);
        let started = Instant::now();
        run(&connector, &FixedProvider(Some(measurement()))).await.unwrap();
        assert_within_tick(started.elapsed(), DWELL * 3);

        let seen = connector.calls.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_within_tick(seen[1].0 - seen[0].0, DWELL);
        assert_within_tick(seen[2].0 - seen[1].0, DWELL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_or_rejected_actions_do_not_abort() {
        for reply in [Reply::TransportError, Reply::Rejected] {
            let connector = FakeConnector::new(reply);
            run(&connector, &FixedProvider(Some(measurement()))).await.unwrap();
            assert_eq!(connector.calls.seen.lock().unwrap().len(), 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_measurement_failure_skips_display() {
        let connector = FakeConnector::new(Reply::Created);
        let err = run(&connector, &FixedProvider(None)).await.unwrap_err();
        assert!(matches!(err, RunError::Measurement(MeasurementError::NoResult)));
        assert!(connector.calls.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_skips_display() {
        let mut connector = FakeConnector::new(Reply::Created);
        connector.fail_fetch = true;
        let err = run(&connector, &FixedProvider(Some(measurement()))).await.unwrap_err();
        assert!(matches!(err, RunError::Device(DeviceError::Status { .. })));
        assert!(connector.calls.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_skips_display() {
        let mut connector = FakeConnector::new(Reply::Created);
        connector.fail_start = true;
        let err = run(&connector, &FixedProvider(Some(measurement()))).await.unwrap_err();
        assert!(matches!(err, RunError::Device(DeviceError::NotStarted)));
        assert_eq!(connector.started.load(Ordering::SeqCst), 1);
        assert!(connector.calls.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::Showing("Download").to_string(), "showing-download");
        assert_eq!(Phase::AwaitingJoin.to_string(), "awaiting-join");
    }
}

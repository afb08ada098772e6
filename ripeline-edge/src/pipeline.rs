//! Edge orchestration loop
//!
//! ## State Machine
//!
//! One trigger is processed end to end before the next is considered:
//!
//! ```text
//!            ┌─────────────┐ trigger ┌─────────┐ frame ┌──────────┐ prediction ┌──────────┐
//!     ┌─────▶│ WaitTrigger │────────▶│ Capture │──────▶│ Classify │───────────▶│ Dispatch │
//!     │      └─────────────┘         └─────────┘       └──────────┘            └──────────┘
//!     │        idle: poll              │ fail            │ fail      publish, then actuate
//!     └────────────────────────────────┴─────────────────┴───────────────────────────┘
//! ```
//!
//! - No trigger is the idle condition, not an error.
//! - Capture or classification failure drops the trigger; the event counter
//!   is untouched.
//! - On success the counter advances and both side effects run for the same
//!   event, regardless of each other's outcome. Actuation is never skipped
//!   because a publish failed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use ripeline_connectors::mqtt::{MqttPublisher, PublishTransport};
use ripeline_connectors::{Actuator, ConnectionStats, TriggerSource};
use ripeline_core::config::{CaptureStrategy, EdgeConfig};
use ripeline_core::{ActuationMap, ClassificationEvent, EventFactory, TimeSource};
use ripeline_vision::{Camera, CaptureError, Classifier, Frame, FrameSource, InferenceError, Model, Prediction};

/// Image acquisition as seen by the loop
pub trait Capture {
    fn capture(&mut self, strategy: CaptureStrategy) -> Result<Frame, CaptureError>;

    fn release(&mut self) {}
}

impl<S: FrameSource> Capture for Camera<S> {
    fn capture(&mut self, strategy: CaptureStrategy) -> Result<Frame, CaptureError> {
        self.capture_with(strategy)
    }

    fn release(&mut self) {
        Camera::release(self)
    }
}

/// Classification as seen by the loop
pub trait Classify {
    fn classify(&mut self, frame: &Frame) -> Result<Prediction, InferenceError>;
}

impl<M: Model> Classify for Classifier<M> {
    fn classify(&mut self, frame: &Frame) -> Result<Prediction, InferenceError> {
        Classifier::classify(self, frame)
    }
}

/// Event publication as seen by the loop
pub trait Publish {
    /// `false` when the event did not reach the broker
    fn publish(&mut self, event: &ClassificationEvent) -> bool;

    /// Broker link counters, if the publisher keeps any
    fn link_stats(&self) -> ConnectionStats {
        ConnectionStats::default()
    }

    fn shutdown(&mut self) {}
}

impl<T: PublishTransport> Publish for MqttPublisher<T> {
    fn publish(&mut self, event: &ClassificationEvent) -> bool {
        MqttPublisher::publish(self, event)
    }

    fn link_stats(&self) -> ConnectionStats {
        self.stats()
    }

    fn shutdown(&mut self) {
        self.disconnect();
    }
}

/// Loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    WaitTrigger,
    Capture,
    Classify,
    Dispatch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::WaitTrigger => "wait-trigger",
            Stage::Capture => "capture",
            Stage::Classify => "classify",
            Stage::Dispatch => "dispatch",
        };
        f.write_str(name)
    }
}

/// Result of one pass through the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No trigger
    Idle,
    /// Trigger dropped at a stage
    Dropped { stage: Stage, reason: String },
    /// Event produced; side-effect results attached
    Completed {
        event: ClassificationEvent,
        published: bool,
        actuated: bool,
    },
}

/// Counters over a loop run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub triggers: u64,
    pub completed: u64,
    pub dropped: u64,
    pub published: u64,
    pub actuated: u64,
    /// Publisher link counters, filled in when the loop stops
    pub link: ConnectionStats,
}

impl RunStats {
    fn record(&mut self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Idle => {}
            CycleOutcome::Dropped { .. } => {
                self.triggers += 1;
                self.dropped += 1;
            }
            CycleOutcome::Completed {
                published, actuated, ..
            } => {
                self.triggers += 1;
                self.completed += 1;
                self.published += u64::from(*published);
                self.actuated += u64::from(*actuated);
            }
        }
    }
}

/// The edge pipeline over its five collaborators
pub struct Pipeline<T, C, K, P, A, Clk>
where
    T: TriggerSource,
    C: Capture,
    K: Classify,
    P: Publish,
    A: Actuator,
    Clk: TimeSource,
{
    trigger: T,
    camera: C,
    classifier: K,
    publisher: P,
    actuator: A,
    events: EventFactory<Clk>,
    actuation: ActuationMap,
    strategy: CaptureStrategy,
    poll_interval: Duration,
    settle_delay: Duration,
    counter: u64,
    stage: Stage,
    stats: RunStats,
}

impl<T, C, K, P, A, Clk> Pipeline<T, C, K, P, A, Clk>
where
    T: TriggerSource,
    C: Capture,
    K: Classify,
    P: Publish,
    A: Actuator,
    Clk: TimeSource,
{
    pub fn new(config: &EdgeConfig, trigger: T, camera: C, classifier: K, publisher: P, actuator: A, clock: Clk) -> Self {
        Self {
            trigger,
            camera,
            classifier,
            publisher,
            actuator,
            events: EventFactory::new(&config.device_id, config.classes.clone(), clock),
            actuation: config.actuation.clone(),
            strategy: config.capture,
            poll_interval: config.poll_interval,
            settle_delay: config.settle_delay,
            counter: 0,
            stage: Stage::WaitTrigger,
            stats: RunStats::default(),
        }
    }

    /// Process at most one trigger
    pub fn run_once(&mut self) -> CycleOutcome {
        let outcome = self.cycle();
        self.stage = Stage::WaitTrigger;
        self.stats.record(&outcome);
        outcome
    }

    fn cycle(&mut self) -> CycleOutcome {
        self.stage = Stage::WaitTrigger;
        match self.trigger.poll_trigger() {
            Ok(Some(_)) => log::info!("object #{} detected by IR sensor", self.counter + 1),
            Ok(None) => return CycleOutcome::Idle,
            Err(e) => {
                log::warn!("trigger read failed: {e}");
                return CycleOutcome::Idle;
            }
        }

        self.stage = Stage::Capture;
        let frame = match self.camera.capture(self.strategy) {
            Ok(frame) => frame,
            Err(e) => return self.drop_trigger(e),
        };

        self.stage = Stage::Classify;
        let prediction = match self.classifier.classify(&frame) {
            Ok(prediction) => prediction,
            Err(e) => return self.drop_trigger(e),
        };
        drop(frame);

        let event = self
            .events
            .create(self.counter, prediction.class_index, prediction.confidence);
        self.counter += 1;
        log::info!(
            "class: {} | confidence: {:.2}% | id: {}",
            event.class_name,
            event.confidence * 100.0,
            event.event_id
        );

        self.stage = Stage::Dispatch;
        let published = self.publisher.publish(&event);
        let command = self.actuation.get_servo_action(event.class_index);
        let actuated = match self.actuator.actuate(command) {
            Ok(()) => true,
            Err(e) => {
                log::error!("actuation for {} failed: {e}", event.event_id);
                false
            }
        };

        CycleOutcome::Completed {
            event,
            published,
            actuated,
        }
    }

    fn drop_trigger(&self, reason: impl fmt::Display) -> CycleOutcome {
        log::warn!("dropping trigger at {}: {reason}", self.stage);
        CycleOutcome::Dropped {
            stage: self.stage,
            reason: reason.to_string(),
        }
    }

    /// Loop until `shutdown` is set, then release the camera and broker link
    pub fn run(&mut self, shutdown: &AtomicBool) -> RunStats {
        log::info!("system ready, waiting for objects");

        while !shutdown.load(Ordering::SeqCst) {
            let pause = match self.run_once() {
                CycleOutcome::Completed { .. } => self.settle_delay,
                CycleOutcome::Idle | CycleOutcome::Dropped { .. } => self.poll_interval,
            };
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }

        log::info!("shutting down");
        self.stats.link = self.publisher.link_stats();
        self.publisher.shutdown();
        self.camera.release();
        self.stats.clone()
    }

    /// Successful classifications so far
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use ripeline_connectors::SerialError;
    use ripeline_core::time::FixedTime;
    use ripeline_core::ActuatorCommand;
    use ripeline_connectors::Trigger;
    use std::collections::VecDeque;

    struct Triggers(VecDeque<bool>);

    impl TriggerSource for Triggers {
        fn poll_trigger(&mut self) -> Result<Option<Trigger>, SerialError> {
            Ok(self
                .0
                .pop_front()
                .filter(|fired| *fired)
                .map(|_| Trigger { timestamp: None }))
        }
    }

    struct Frames {
        results: VecDeque<Result<Frame, CaptureError>>,
        released: bool,
    }

    impl Capture for Frames {
        fn capture(&mut self, _strategy: CaptureStrategy) -> Result<Frame, CaptureError> {
            self.results
                .pop_front()
                .unwrap_or(Err(CaptureError::DeviceUnavailable { attempts: 3 }))
        }

        fn release(&mut self) {
            self.released = true;
        }
    }

    struct Predictions(VecDeque<Result<Prediction, InferenceError>>);

    impl Classify for Predictions {
        fn classify(&mut self, _frame: &Frame) -> Result<Prediction, InferenceError> {
            self.0.pop_front().unwrap_or(Err(InferenceError::EmptyOutput))
        }
    }

    #[derive(Default)]
    struct Outbox {
        events: Vec<ClassificationEvent>,
        accept: bool,
        closed: bool,
    }

    impl Publish for Outbox {
        fn publish(&mut self, event: &ClassificationEvent) -> bool {
            self.events.push(event.clone());
            self.accept
        }

        fn link_stats(&self) -> ConnectionStats {
            ConnectionStats {
                messages_sent: self.events.len() as u64,
                ..ConnectionStats::default()
            }
        }

        fn shutdown(&mut self) {
            self.closed = true;
        }
    }

    #[derive(Default)]
    struct Servo(Vec<ActuatorCommand>);

    impl Actuator for Servo {
        fn actuate(&mut self, command: ActuatorCommand) -> Result<(), SerialError> {
            self.0.push(command);
            Ok(())
        }
    }

    fn frame() -> Frame {
        Frame::new(RgbImage::from_pixel(4, 4, Rgb([200, 30, 30])))
    }

    type TestPipeline = Pipeline<Triggers, Frames, Predictions, Outbox, Servo, FixedTime>;

    fn pipeline(
        triggers: Vec<bool>,
        frames: Vec<Result<Frame, CaptureError>>,
        predictions: Vec<Result<Prediction, InferenceError>>,
    ) -> TestPipeline {
        let config = EdgeConfig::new("raspberrypi_01");
        Pipeline::new(
            &config,
            Triggers(triggers.into()),
            Frames {
                results: frames.into(),
                released: false,
            },
            Predictions(predictions.into()),
            Outbox {
                accept: true,
                ..Outbox::default()
            },
            Servo::default(),
            FixedTime::at_unix(1_735_732_800),
        )
    }

    fn ripe() -> Result<Prediction, InferenceError> {
        Ok(Prediction {
            class_index: 1,
            confidence: 0.87,
        })
    }

    #[test]
    fn no_trigger_is_idle() {
        let mut p = pipeline(vec![false], vec![], vec![]);
        assert_eq!(p.run_once(), CycleOutcome::Idle);
        assert_eq!(p.run_once(), CycleOutcome::Idle);
        assert_eq!(p.stats(), &RunStats::default());
    }

    #[test]
    fn completed_cycle_publishes_then_actuates() {
        let mut p = pipeline(vec![true], vec![Ok(frame())], vec![ripe()]);

        match p.run_once() {
            CycleOutcome::Completed {
                event,
                published,
                actuated,
            } => {
                assert!(published && actuated);
                assert_eq!(event.event_id, "tm_1735732800_000");
                assert_eq!(event.class_name, "ripe");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.counter(), 1);
        assert_eq!(p.stage(), Stage::WaitTrigger);
        assert_eq!(p.actuator.0, vec![ActuatorCommand::new(1, 90)]);
    }

    #[test]
    fn capture_failure_drops_trigger_without_counting() {
        let mut p = pipeline(
            vec![true, true],
            vec![Err(CaptureError::DeviceUnavailable { attempts: 3 }), Ok(frame())],
            vec![ripe()],
        );

        match p.run_once() {
            CycleOutcome::Dropped { stage, .. } => assert_eq!(stage, Stage::Capture),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.counter(), 0);
        assert!(p.publisher.events.is_empty());
        assert!(p.actuator.0.is_empty());

        // next trigger reuses counter 0
        match p.run_once() {
            CycleOutcome::Completed { event, .. } => assert!(event.event_id.ends_with("_000")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn inference_failure_drops_trigger() {
        let mut p = pipeline(
            vec![true],
            vec![Ok(frame())],
            vec![Err(InferenceError::Invocation("cuda oom".into()))],
        );

        assert!(matches!(
            p.run_once(),
            CycleOutcome::Dropped {
                stage: Stage::Classify,
                ..
            }
        ));
        assert_eq!(p.counter(), 0);
        assert_eq!(p.stats().dropped, 1);
    }

    #[test]
    fn publish_failure_still_actuates() {
        let mut p = pipeline(vec![true], vec![Ok(frame())], vec![ripe()]);
        p.publisher.accept = false;

        match p.run_once() {
            CycleOutcome::Completed {
                published, actuated, ..
            } => {
                assert!(!published);
                assert!(actuated);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.counter(), 1);
        assert_eq!(p.actuator.0.len(), 1);
    }

    #[test]
    fn unknown_class_goes_to_reject_bin() {
        let mut p = pipeline(
            vec![true],
            vec![Ok(frame())],
            vec![Ok(Prediction {
                class_index: 9,
                confidence: 0.4,
            })],
        );

        match p.run_once() {
            CycleOutcome::Completed { event, .. } => assert_eq!(event.class_name, "unknown"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.actuator.0, vec![ActuationMap::default().reject()]);
    }

    #[test]
    fn counter_advances_per_success() {
        let mut p = pipeline(
            vec![true, false, true, true],
            vec![Ok(frame()), Ok(frame()), Ok(frame())],
            vec![ripe(), ripe(), ripe()],
        );
        let ids: Vec<String> = (0..4)
            .filter_map(|_| match p.run_once() {
                CycleOutcome::Completed { event, .. } => Some(event.event_id),
                _ => None,
            })
            .collect();

        assert_eq!(ids, vec!["tm_1735732800_000", "tm_1735732800_001", "tm_1735732800_002"]);
        assert_eq!(p.stats().triggers, 3);
        assert_eq!(p.stats().published, 3);
    }

    #[test]
    fn run_reports_publisher_link_stats() {
        let mut p = pipeline(vec![true, true], vec![Ok(frame()), Ok(frame())], vec![ripe(), ripe()]);
        p.run_once();
        p.run_once();

        let stats = p.run(&AtomicBool::new(true));
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.link.messages_sent, 2);
    }

    #[test]
    fn run_releases_resources_on_shutdown() {
        let mut p = pipeline(vec![], vec![], vec![]);
        let stats = p.run(&AtomicBool::new(true));

        assert_eq!(stats, RunStats::default());
        assert!(p.camera.released);
        assert!(p.publisher.closed);
    }
}

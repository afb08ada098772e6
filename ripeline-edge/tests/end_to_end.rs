//! A trigger travels through real capture, classification, publishing and
//! actuation components, with the hardware and broker replaced by fakes.

use std::io::{self, BufReader, Cursor, Write};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use image::{Rgb, RgbImage};
use ndarray::Array3;
use ripeline_connectors::mqtt::{self, MqttPublisher, PublishError, PublishTransport, SessionState, TopicSubscriber};
use ripeline_connectors::{LineActuator, LineTrigger};
use ripeline_core::config::{CaptureStrategy, EdgeConfig};
use ripeline_core::time::FixedTime;
use ripeline_edge::{CycleOutcome, Pipeline};
use ripeline_vision::{Camera, CaptureError, Classifier, FrameSource, InferenceError, Model};
use rumqttc::{ClientError, ConnAck, ConnectReturnCode, ConnectionError, Event, Outgoing, Packet, PubAck};

/// Always scores class 1 highest
struct RipeModel;

impl Model for RipeModel {
    fn predict(&mut self, _input: &Array3<f32>) -> Result<Vec<f64>, InferenceError> {
        Ok(vec![0.05, 0.87, 0.06, 0.02])
    }
}

struct StillCamera;

impl FrameSource for StillCamera {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        Ok(Some(RgbImage::from_fn(64, 48, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                Rgb([220, 40, 30])
            } else {
                Rgb([90, 160, 60])
            }
        })))
    }
}

/// Broker stand-in acknowledging every publish through the session stream
struct AckingBroker {
    notifications: Sender<Result<Event, ConnectionError>>,
    published: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PublishTransport for AckingBroker {
    fn enqueue(&self, _topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let mut published = self.published.lock().unwrap();
        published.push(payload);
        let pkid = published.len() as u16;
        self.notifications.send(Ok(Event::Outgoing(Outgoing::Publish(pkid)))).unwrap();
        self.notifications
            .send(Ok(Event::Incoming(Packet::PubAck(PubAck::new(pkid)))))
            .unwrap();
        Ok(())
    }

    fn close(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

struct NoTopics;

impl TopicSubscriber for NoTopics {
    fn request_subscription(&self, _topic: &str) -> Result<(), ClientError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SerialOut(Arc<Mutex<Vec<u8>>>);

impl Write for SerialOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn ripe_tomato_is_published_and_sorted() {
    let config = EdgeConfig::new("raspberrypi_01").with_capture(CaptureStrategy::BestOf {
        frames: 3,
        inter_frame_delay: Duration::ZERO,
    });

    let (tx, rx) = crossbeam_channel::unbounded();
    let published = Arc::new(Mutex::new(Vec::new()));
    let (publisher, mut link) = MqttPublisher::new(
        AckingBroker {
            notifications: tx.clone(),
            published: Arc::clone(&published),
        },
        &config.broker.topic,
        Duration::from_secs(2),
    );
    let session = thread::spawn(move || {
        let mut session = SessionState::new();
        mqtt::drive_blocking(rx, &mut session, &mut link, &NoTopics, Duration::ZERO, &AtomicBool::new(false));
    });
    tx.send(Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)))))
        .unwrap();
    assert!(publisher.wait_connected(Duration::from_secs(2)));

    let serial_in = BufReader::new(Cursor::new(b"{\"ir_detected\": true, \"timestamp\": \"5123\"}\n".to_vec()));
    let serial_out = SerialOut::default();
    let camera = Camera::new(
        StillCamera,
        &ripeline_core::config::CameraConfig {
            retry_delay: Duration::ZERO,
            ..Default::default()
        },
    );

    let mut pipeline = Pipeline::new(
        &config,
        LineTrigger::new(serial_in),
        camera,
        Classifier::new(RipeModel, 32),
        publisher,
        LineActuator::new(serial_out.clone()),
        FixedTime::at_unix(1_735_732_800),
    );

    match pipeline.run_once() {
        CycleOutcome::Completed {
            published, actuated, ..
        } => assert!(published && actuated),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(pipeline.run_once(), CycleOutcome::Idle);

    let payloads = published.lock().unwrap().clone();
    assert_eq!(payloads.len(), 1);
    let wire: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
    assert_eq!(wire["class"], 1);
    assert_eq!(wire["class_name"], "ripe");
    assert_eq!(wire["confidence"], 0.87);
    assert_eq!(wire["device_id"], "raspberrypi_01");
    assert_eq!(wire["tomato_id"], "tm_1735732800_000");
    assert_eq!(wire["rasp_timestamp"], "2025-01-01T12:00:00Z");

    let servo = String::from_utf8(serial_out.0.lock().unwrap().clone()).unwrap();
    assert_eq!(servo, "{\"servo\":1,\"angle\":90}\n");

    drop(pipeline);
    drop(tx);
    session.join().unwrap();
}

// THEORY:
// The `pipeline` module holds the frame pump: the one task that owns the
// camera loop. Each iteration reads the clock once and runs the same stages
// in the same order against that one reading:
//
// 1.  Daily reset check, before capture, so the day rolls over even while
//     the camera is failing.
// 2.  Capture through the `CaptureBroker`.
// 3.  Detection through the `DetectorAdapter`.
// 4.  Log detections and read the schedule in one `SharedState` transaction.
// 5.  Decide, and if due hand off to the `ActuationController`, which runs the
//     sequence in its own task so this loop never waits on the servo.
// 6.  Annotate, encode and publish to the `StreamHub` when anyone is watching.
//
// Camera and detector failures are logged and skipped; nothing in here can
// take the loop down except shutdown or a released camera.

use crate::config::{DetectionLogMode, EngineConfig};
use crate::core_modules::actuation::{ActuationController, ActuationError, ActuationOutcome};
use crate::core_modules::annotate::{draw_detections, encode_jpeg};
use crate::core_modules::capture_broker::{CaptureBroker, CaptureError, Frame};
use crate::core_modules::detector::{Detection, DetectorAdapter};
use crate::core_modules::schedule_clock::ScheduleClock;
use crate::core_modules::shared_state::{DetectionEvent, SharedState};
use crate::core_modules::stream_hub::{FramePacket, StreamHub};
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What the scheduled path concluded for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Window open, target present, not yet fed today.
    Fire,
    /// Feeding time has not passed yet.
    NotDue,
    /// Window open but no target in this frame.
    NoTarget,
    /// Target present in the open window, but today's feeding already ran.
    AlreadyActivated,
}

/// The pure scheduled-trigger rule.
pub fn decide(window_open: bool, hit: bool, activated_today: bool) -> Decision {
    match (window_open, hit, activated_today) {
        (false, _, _) => Decision::NotDue,
        (true, false, _) => Decision::NoTarget,
        (true, true, true) => Decision::AlreadyActivated,
        (true, true, false) => Decision::Fire,
    }
}

/// The outcome of processing a single frame.
#[derive(Debug)]
pub struct FrameReport {
    pub seq: u64,
    pub detections: Vec<Detection>,
    pub window_open: bool,
    pub decision: Decision,
    /// Present when this frame started a scheduled actuation.
    pub actuation: Option<JoinHandle<ActuationOutcome>>,
    /// Viewers that received the frame.
    pub delivered_to: usize,
}

impl FrameReport {
    pub fn hit(&self) -> bool {
        !self.detections.is_empty()
    }
}

/// Running counters for the pump, shared with the status endpoint.
#[derive(Debug, Default)]
pub struct PumpStats {
    frames: AtomicU64,
    capture_failures: AtomicU64,
    detector_failures: AtomicU64,
    scheduled_actuations: AtomicU64,
    deadline_misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PumpStatsSnapshot {
    pub frames: u64,
    pub capture_failures: u64,
    pub detector_failures: u64,
    pub scheduled_actuations: u64,
    pub deadline_misses: u64,
}

impl PumpStats {
    pub fn snapshot(&self) -> PumpStatsSnapshot {
        PumpStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            scheduled_actuations: self.scheduled_actuations.load(Ordering::Relaxed),
            deadline_misses: self.deadline_misses.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The single producer: capture, detect, decide, publish.
pub struct FramePump {
    broker: CaptureBroker,
    detector: DetectorAdapter,
    controller: ActuationController,
    state: SharedState,
    schedule: ScheduleClock,
    hub: StreamHub,
    config: Arc<EngineConfig>,
    stats: Arc<PumpStats>,
    target_seen_last_frame: bool,
}

impl FramePump {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: CaptureBroker,
        detector: DetectorAdapter,
        controller: ActuationController,
        state: SharedState,
        schedule: ScheduleClock,
        hub: StreamHub,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            broker,
            detector,
            controller,
            state,
            schedule,
            hub,
            config,
            stats: Arc::new(PumpStats::default()),
            target_seen_last_frame: false,
        }
    }

    pub fn stats(&self) -> Arc<PumpStats> {
        Arc::clone(&self.stats)
    }

    /// Loops until `shutdown` flips to true, its sender drops, or the camera
    /// is released.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval = ?self.config.frame_interval,
            targets = ?self.detector.params().target_classes,
            "frame pump started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();

            // Stage 1: Daily reset, before anything reads the flag.
            let now = self.schedule.now();
            self.schedule.check_daily_reset_at(&self.state, now);

            // Stage 2: Capture
            let captured = tokio::select! {
                _ = shutdown.changed() => break,
                captured = self.broker.acquire_frame() => captured,
            };

            match captured {
                Ok(frame) => {
                    self.handle_frame(frame, now).await;
                }
                Err(CaptureError::Released) => {
                    tracing::info!("camera released, frame pump stopping");
                    break;
                }
                Err(error) => {
                    PumpStats::bump(&self.stats.capture_failures);
                    tracing::warn!(%error, "camera read failed, retrying");
                    if !pause(&mut shutdown, self.config.capture_retry_delay).await {
                        break;
                    }
                    continue;
                }
            }

            let elapsed = started.elapsed();
            if elapsed < self.config.frame_interval {
                if !pause(&mut shutdown, self.config.frame_interval - elapsed).await {
                    break;
                }
            } else if !self.config.frame_interval.is_zero() {
                PumpStats::bump(&self.stats.deadline_misses);
            }
        }

        tracing::info!(stats = ?self.stats.snapshot(), "frame pump stopped");
    }

    /// Runs stages 1 and 3–6 on an already captured frame.
    pub async fn process_frame(&mut self, frame: Frame) -> FrameReport {
        let now = self.schedule.now();
        self.schedule.check_daily_reset_at(&self.state, now);
        self.handle_frame(frame, now).await
    }

    /// Stages 3–6, with `now` being the reading the reset already used.
    async fn handle_frame(&mut self, frame: Frame, now: NaiveDateTime) -> FrameReport {
        // Stage 3: Detection
        let detections = match self.detector.detect(Arc::clone(&frame.image)).await {
            Ok(detections) => detections,
            Err(error) => {
                PumpStats::bump(&self.stats.detector_failures);
                tracing::warn!(seq = frame.seq, %error, "detection skipped for frame");
                Vec::new()
            }
        };
        let hit = !detections.is_empty();

        // Stage 4: Log and read the schedule in one transaction.
        let log_this_frame = match self.config.detection_log {
            DetectionLogMode::EveryFrame => true,
            DetectionLogMode::Transitions => !self.target_seen_last_frame,
        };
        let (window_open, activated_today) = self.state.with_lock(|schedule| {
            let window_open = ScheduleClock::is_feeding_window_open(schedule, now);
            if window_open && log_this_frame {
                for detection in &detections {
                    schedule.append(DetectionEvent::detected(now, detection.class_name.as_str()));
                }
            }
            (window_open, schedule.activated_today())
        });
        self.target_seen_last_frame = hit;

        // Stage 5: Decision
        let decision = decide(window_open, hit, activated_today);
        let actuation = match decision {
            Decision::Fire => self.fire(frame.seq),
            _ => None,
        };

        // Stage 6: Publish
        let delivered_to = self.publish(&frame, &detections).await;

        PumpStats::bump(&self.stats.frames);
        FrameReport {
            seq: frame.seq,
            detections,
            window_open,
            decision,
            actuation,
            delivered_to,
        }
    }

    fn fire(&self, seq: u64) -> Option<JoinHandle<ActuationOutcome>> {
        match self.controller.trigger_scheduled() {
            Ok(handle) => {
                PumpStats::bump(&self.stats.scheduled_actuations);
                tracing::info!(seq, "target detected in feeding window, dispensing");
                Some(handle)
            }
            Err(ActuationError::Busy | ActuationError::AlreadyActivated) => None,
            Err(error @ ActuationError::ShutDown) => {
                tracing::warn!(seq, %error, "scheduled actuation skipped");
                None
            }
        }
    }

    async fn publish(&self, frame: &Frame, detections: &[Detection]) -> usize {
        if self.hub.viewer_count() == 0 {
            return 0;
        }

        let image = Arc::clone(&frame.image);
        let detections = if self.config.annotate {
            detections.to_vec()
        } else {
            Vec::new()
        };
        let quality = self.config.jpeg_quality;
        let encoded = tokio::task::spawn_blocking(move || {
            if detections.is_empty() {
                encode_jpeg(&image, quality)
            } else {
                let mut annotated = (*image).clone();
                draw_detections(&mut annotated, &detections);
                encode_jpeg(&annotated, quality)
            }
        })
        .await;

        match encoded {
            Ok(Ok(data)) => self.hub.publish(FramePacket {
                seq: frame.seq,
                captured_at: frame.captured_at,
                width: frame.image.width(),
                height: frame.image.height(),
                data,
            }),
            Ok(Err(error)) => {
                tracing::warn!(seq = frame.seq, %error, "frame encoding failed");
                0
            }
            Err(error) => {
                tracing::warn!(seq = frame.seq, %error, "frame encoding task failed");
                0
            }
        }
    }
}

/// Sleeps for `duration` unless shutdown arrives first. Returns false on
/// shutdown.
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::actuation::ActuationConfig;
    use crate::core_modules::schedule_clock::ManualClock;
    use crate::testing::{
        ActuatorProbe, DetectorScript, RecordingActuator, ScriptedDetector, SourceProbe,
        StaticSource, dog,
    };
    use chrono::{NaiveDate, NaiveTime};

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    struct Rig {
        pump: FramePump,
        broker: CaptureBroker,
        state: SharedState,
        clock: ManualClock,
        script: DetectorScript,
        servo: ActuatorProbe,
        camera: SourceProbe,
        hub: StreamHub,
    }

    fn rig(config: EngineConfig, now: NaiveDateTime) -> Rig {
        let clock = ManualClock::new(now);
        let schedule = ScheduleClock::new(Arc::new(clock.clone()));
        let state = SharedState::new(NaiveTime::from_hms_opt(12, 0, 0).unwrap(), now.date());
        let (source, camera) = StaticSource::new(64, 48);
        let (detector, script) = ScriptedDetector::new();
        let (actuator, servo) = RecordingActuator::new();
        let broker = CaptureBroker::new(Box::new(source), schedule.clock());
        let controller = ActuationController::new(
            Box::new(actuator),
            state.clone(),
            schedule.clock(),
            config.actuation.clone(),
        );
        let hub = StreamHub::new(config.viewer_buffer);
        let pump = FramePump::new(
            broker.clone(),
            DetectorAdapter::new(Box::new(detector), config.detection.clone()),
            controller,
            state.clone(),
            schedule,
            hub.clone(),
            Arc::new(config),
        );
        Rig {
            pump,
            broker,
            state,
            clock,
            script,
            servo,
            camera,
            hub,
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            actuation: ActuationConfig {
                dwell: Duration::from_millis(5),
                ..ActuationConfig::default()
            },
            frame_interval: Duration::from_millis(2),
            capture_retry_delay: Duration::from_millis(2),
            ..EngineConfig::default()
        }
    }

    impl Rig {
        async fn frame(&mut self) -> FrameReport {
            let frame = self.broker.acquire_frame().await.unwrap();
            self.pump.process_frame(frame).await
        }
    }

    #[test]
    fn decision_table() {
        assert_eq!(decide(false, true, false), Decision::NotDue);
        assert_eq!(decide(true, false, false), Decision::NoTarget);
        assert_eq!(decide(true, true, true), Decision::AlreadyActivated);
        assert_eq!(decide(true, true, false), Decision::Fire);
    }

    #[tokio::test]
    async fn dog_after_feeding_time_dispenses_once_then_only_logs() {
        let mut rig = rig(fast_config(), at(1, 12, 0, 1));
        rig.script.set_steady(vec![dog(0.9)]);

        let first = rig.frame().await;
        assert_eq!(first.decision, Decision::Fire);
        assert!(first.actuation.unwrap().await.unwrap().dispensed());

        let snapshot = rig.state.snapshot();
        assert!(snapshot.activated_today);
        assert_eq!(snapshot.dispensed_count(), 1);
        assert_eq!(snapshot.detected_count(), 1);
        assert_eq!(rig.servo.sequences(90.0), 1);

        let second = rig.frame().await;
        assert_eq!(second.decision, Decision::AlreadyActivated);
        assert!(second.actuation.is_none());

        let snapshot = rig.state.snapshot();
        assert_eq!(snapshot.dispensed_count(), 1);
        assert_eq!(snapshot.detected_count(), 2);
        assert_eq!(rig.servo.sequences(90.0), 1);
    }

    #[tokio::test]
    async fn nothing_happens_before_feeding_time() {
        let mut rig = rig(fast_config(), at(1, 11, 59, 59));
        rig.script.set_steady(vec![dog(0.9)]);

        let report = rig.frame().await;

        assert_eq!(report.decision, Decision::NotDue);
        assert!(report.hit());
        assert!(rig.state.snapshot().log.is_empty());
        assert!(rig.servo.moves().is_empty());
    }

    #[tokio::test]
    async fn frames_during_a_running_sequence_do_not_fire_again() {
        let mut config = fast_config();
        config.actuation.dwell = Duration::from_millis(200);
        let mut rig = rig(config, at(1, 12, 30, 0));
        rig.script.set_steady(vec![dog(0.8)]);

        let first = rig.frame().await;
        let second = rig.frame().await;
        let third = rig.frame().await;
        assert!(second.actuation.is_none());
        assert!(third.actuation.is_none());

        first.actuation.unwrap().await.unwrap();
        let fourth = rig.frame().await;
        assert_eq!(fourth.decision, Decision::AlreadyActivated);
        assert_eq!(rig.state.snapshot().dispensed_count(), 1);
        assert_eq!(rig.servo.sequences(90.0), 1);
    }

    #[tokio::test]
    async fn detector_failure_counts_as_no_hit() {
        let mut rig = rig(fast_config(), at(1, 13, 0, 0));
        rig.script.push_failure();

        let report = rig.frame().await;

        assert_eq!(report.decision, Decision::NoTarget);
        assert!(report.actuation.is_none());
        assert_eq!(rig.pump.stats().snapshot().detector_failures, 1);
    }

    #[tokio::test]
    async fn new_day_resets_before_the_decision() {
        let mut rig = rig(fast_config(), at(1, 12, 0, 1));
        rig.script.set_steady(vec![dog(0.9)]);
        rig.frame().await.actuation.unwrap().await.unwrap();
        assert!(rig.state.snapshot().activated_today);

        rig.clock.set(at(2, 12, 0, 1));
        let report = rig.frame().await;

        assert_eq!(report.decision, Decision::Fire);
        report.actuation.unwrap().await.unwrap();
        let snapshot = rig.state.snapshot();
        assert_eq!(snapshot.last_reset_date, at(2, 0, 0, 0).date());
        assert_eq!(snapshot.dispensed_count(), 1);
        assert_eq!(snapshot.detected_count(), 1);
    }

    #[tokio::test]
    async fn sequence_started_before_midnight_does_not_use_up_the_next_day() {
        let mut config = fast_config();
        config.actuation.dwell = Duration::from_millis(200);
        let mut rig = rig(config, at(1, 23, 0, 0));
        rig.script.set_steady(vec![dog(0.9)]);

        let yesterday = rig.frame().await;
        assert_eq!(yesterday.decision, Decision::Fire);
        let yesterday = yesterday.actuation.unwrap();

        // The date rolls over while the feeder is still moving.
        rig.clock.set(at(2, 12, 30, 0));
        let during = rig.frame().await;
        assert_eq!(during.decision, Decision::Fire);
        assert!(during.actuation.is_none());

        assert!(yesterday.await.unwrap().dispensed());
        let snapshot = rig.state.snapshot();
        assert_eq!(snapshot.last_reset_date, at(2, 0, 0, 0).date());
        assert!(!snapshot.activated_today);
        assert_eq!(snapshot.dispensed_count(), 0);

        let today = rig.frame().await;
        assert_eq!(today.decision, Decision::Fire);
        assert!(today.actuation.unwrap().await.unwrap().dispensed());
        let snapshot = rig.state.snapshot();
        assert!(snapshot.activated_today);
        assert_eq!(snapshot.dispensed_count(), 1);
        assert!(snapshot.log.iter().all(|event| event.timestamp == at(2, 12, 30, 0)));
        assert_eq!(rig.servo.sequences(90.0), 2);
    }

    #[tokio::test]
    async fn transitions_mode_logs_only_new_appearances() {
        let mut config = fast_config();
        config.detection_log = DetectionLogMode::Transitions;
        let mut rig = rig(config, at(1, 12, 0, 1));
        rig.state.with_lock(|s| s.mark_activated());

        rig.script.push(vec![dog(0.9)]);
        rig.script.push(vec![dog(0.9)]);
        rig.script.push(vec![]);
        rig.script.push(vec![dog(0.7)]);
        for _ in 0..4 {
            rig.frame().await;
        }

        assert_eq!(rig.state.snapshot().detected_count(), 2);
    }

    #[tokio::test]
    async fn frames_are_published_only_to_connected_viewers() {
        let mut rig = rig(fast_config(), at(1, 9, 0, 0));
        assert_eq!(rig.frame().await.delivered_to, 0);

        let mut viewer = rig.hub.subscribe().unwrap();
        rig.script.push(vec![dog(0.9)]);
        let report = rig.frame().await;

        assert_eq!(report.delivered_to, 1);
        let packet = viewer.next_frame().await.unwrap();
        assert_eq!(packet.seq, report.seq);
        assert_eq!((packet.width, packet.height), (64, 48));
        assert_eq!(&packet.data[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn run_loop_survives_camera_failures_and_stops_on_shutdown() {
        let rig = rig(fast_config(), at(1, 9, 0, 0));
        rig.camera.fail_next_captures(3);
        let stats = rig.pump.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let camera = rig.camera.clone();

        let pump = tokio::spawn(rig.pump.run(shutdown_rx));
        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.snapshot().frames < 3 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stats.snapshot().capture_failures, 3);
        assert!(camera.captures() >= 3);
    }

    #[tokio::test]
    async fn day_rolls_over_while_the_camera_is_down() {
        let rig = rig(fast_config(), at(1, 12, 0, 1));
        rig.state.with_lock(|s| s.mark_activated());
        rig.camera.fail_next_captures(usize::MAX);
        rig.clock.set(at(2, 9, 0, 0));
        let stats = rig.pump.stats();
        let state = rig.state.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(rig.pump.run(shutdown_rx));
        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.snapshot().capture_failures < 10 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stats.snapshot().frames, 0);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.last_reset_date, at(2, 0, 0, 0).date());
        assert!(!snapshot.activated_today);
    }
}

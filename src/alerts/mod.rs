//! Per-hazard alert state machine.
//!
//! A hazard inside the alert band is either shown as a visual hint (driver
//! within the speed tolerance) or raised to a full alert: a one-shot spoken
//! announcement followed by a pulse cadence that speeds up and rises in pitch
//! as the hazard gets closer. A full alert ends as `Reacted` when the driver
//! slows down or dismisses it, `Ignored` when the hazard is passed without
//! slowing, or `Expired` after a minute.

pub mod outputs;
pub mod settings;

pub use outputs::{AudioOutput, LogAudio, LogSpeech, SoundTheme, SpeechOutput, Tone, Utterance};
pub use settings::{merge, AlertSettings, AlertSettingsOverrides, HazardAlertSetting};

use crate::proximity::TickReport;
use crate::types::{DriverReaction, Obstacle, ObstacleType, ReactionAction, Warning};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;

pub const ALERT_TIMEOUT: Duration = Duration::from_secs(60);
/// Speed drop since alert start that counts as the driver reacting
pub const REACTION_SPEED_DROP_KMH: f64 = 5.0;
const MIN_PULSE_INTERVAL_MS: f64 = 150.0;

/// Pulse pitch multiplier, rising as the hazard gets closer
pub fn pulse_pitch(distance_m: f64) -> f64 {
    if distance_m < 50.0 {
        1.5
    } else if distance_m < 100.0 {
        1.3
    } else if distance_m < 200.0 {
        1.1
    } else {
        1.0
    }
}

fn base_pulse_interval_ms(distance_m: f64) -> f64 {
    if distance_m < 50.0 {
        400.0
    } else if distance_m < 100.0 {
        600.0
    } else if distance_m < 200.0 {
        900.0
    } else if distance_m < 500.0 {
        1300.0
    } else {
        1800.0
    }
}

/// Gap between pulses: base interval by distance, shortened for more severe
/// hazards (severity 1 halves it) and for larger speed excess
pub fn pulse_interval(distance_m: f64, max_severity: u8, speed_excess_kmh: f64) -> Duration {
    let severity_factor = 1.0 + f64::from(5 - max_severity.clamp(1, 5)) / 4.0;
    let excess_factor = 1.0 + speed_excess_kmh.max(0.0) / 50.0;
    let ms = (base_pulse_interval_ms(distance_m) / severity_factor / excess_factor).max(MIN_PULSE_INTERVAL_MS);
    Duration::from_millis(ms.round() as u64)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Visual,
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Alerted,
    Reacted,
    Ignored,
    Expired,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub obstacle_id: String,
    pub state: AlertState,
}

/// What the UI would show for one hazard
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveWarning {
    pub obstacle_id: String,
    pub obstacle_type: ObstacleType,
    pub distance: f64,
    pub level: AlertLevel,
    pub recommended_speed: f64,
    pub speed_excess: f64,
}

/// Result of one orchestrator update
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlertUpdate {
    pub transitions: Vec<Transition>,
    /// To be fed back into the proximity tracker
    pub reactions: Vec<DriverReaction>,
}

struct AlertRecord {
    obstacle: Obstacle,
    started_at: Instant,
    start_speed_kmh: f64,
    speed_excess: f64,
    next_pulse: Instant,
}

pub struct AlertOrchestrator<S: SpeechOutput, A: AudioOutput> {
    speech: Rc<S>,
    audio: Rc<A>,
    settings: AlertSettings,
    alerted: HashMap<String, AlertRecord>,
    /// Terminal state per hazard; retired hazards are never re-alerted
    retired: HashMap<String, AlertState>,
    visual: Vec<ActiveWarning>,
    announced_warnings: HashSet<String>,
}

impl<S: SpeechOutput, A: AudioOutput> AlertOrchestrator<S, A> {
    pub fn new(speech: Rc<S>, audio: Rc<A>, settings: AlertSettings) -> Self {
        Self {
            speech,
            audio,
            settings,
            alerted: HashMap::new(),
            retired: HashMap::new(),
            visual: Vec::new(),
            announced_warnings: HashSet::new(),
        }
    }

    pub fn settings(&self) -> &AlertSettings {
        &self.settings
    }

    /// `None` while a hazard has not been alerted this session
    pub fn state(&self, obstacle_id: &str) -> Option<AlertState> {
        if self.alerted.contains_key(obstacle_id) {
            Some(AlertState::Alerted)
        } else {
            self.retired.get(obstacle_id).copied()
        }
    }

    /// Advance every alert using the latest tracking tick.
    ///
    /// `alert_distance` is the learned alert distance per hazard type; it
    /// scales the configured band's upper edge.
    pub async fn update(
        &mut self,
        report: &TickReport,
        speed_kmh: f64,
        alert_distance: impl Fn(ObstacleType) -> f64,
    ) -> AlertUpdate {
        let now = Instant::now();
        let mut update = AlertUpdate::default();

        self.advance_alerted(report, speed_kmh, now, &mut update);

        self.visual.clear();
        for obstacle in &report.active {
            if self.alerted.contains_key(&obstacle.id) || self.retired.contains_key(&obstacle.id) {
                continue;
            }
            let upper = self.settings.max_distance_m * alert_distance(obstacle.obstacle_type)
                / crate::proximity::adaptation::DEFAULT_ALERT_DISTANCE_M;
            let distance = obstacle.relevant_distance;
            if distance < self.settings.min_distance_m || distance > upper {
                continue;
            }

            let recommended = self.settings.recommended_speed(obstacle.obstacle_type);
            let excess = speed_kmh - recommended;
            if excess > self.settings.speed_excess_threshold_kmh {
                self.raise(obstacle, speed_kmh, excess, now).await;
                update.transitions.push(Transition {
                    obstacle_id: obstacle.id.clone(),
                    state: AlertState::Alerted,
                });
            } else {
                self.visual.push(ActiveWarning {
                    obstacle_id: obstacle.id.clone(),
                    obstacle_type: obstacle.obstacle_type,
                    distance,
                    level: AlertLevel::Visual,
                    recommended_speed: recommended,
                    speed_excess: excess,
                });
            }
        }

        update
    }

    fn advance_alerted(&mut self, report: &TickReport, speed_kmh: f64, now: Instant, update: &mut AlertUpdate) {
        let passed: HashSet<&str> = report.passed.iter().map(|o| o.id.as_str()).collect();
        let mut finished = Vec::new();

        for (id, record) in self.alerted.iter_mut() {
            let slowed = record.start_speed_kmh - speed_kmh > REACTION_SPEED_DROP_KMH;
            if let Some(fresh) = report
                .active
                .iter()
                .chain(report.passed.iter())
                .find(|o| &o.id == id)
            {
                record.obstacle = fresh.clone();
            }

            let outcome = if slowed {
                Some((AlertState::Reacted, Some(ReactionAction::Confirmed)))
            } else if passed.contains(id.as_str()) {
                Some((AlertState::Ignored, Some(ReactionAction::Ignored)))
            } else if now.duration_since(record.started_at) >= ALERT_TIMEOUT {
                Some((AlertState::Expired, None))
            } else {
                record.speed_excess = speed_kmh - self.settings.recommended_speed(record.obstacle.obstacle_type);
                None
            };

            if let Some((state, action)) = outcome {
                finished.push((id.clone(), state, action));
            }
        }

        for (id, state, action) in finished {
            if let Some(record) = self.alerted.remove(&id) {
                log::info!("Alert for {} {}: {:?}", record.obstacle.obstacle_type, id, state);
                if let Some(action) = action {
                    update.reactions.push(DriverReaction::new(&record.obstacle, action));
                }
            }
            self.retired.insert(id.clone(), state);
            update.transitions.push(Transition { obstacle_id: id, state });
        }
    }

    async fn raise(&mut self, obstacle: &Obstacle, speed_kmh: f64, excess: f64, now: Instant) {
        log::info!(
            "Full alert: {} {} at {:.0} m, {:.0} km/h over",
            obstacle.obstacle_type,
            obstacle.id,
            obstacle.relevant_distance,
            excess
        );
        self.alerted.insert(
            obstacle.id.clone(),
            AlertRecord {
                obstacle: obstacle.clone(),
                started_at: now,
                start_speed_kmh: speed_kmh,
                speed_excess: excess,
                next_pulse: now,
            },
        );

        if self.settings.voice_enabled {
            let text = self.announcement(obstacle);
            self.say(text).await;
        }
    }

    fn announcement(&self, obstacle: &Obstacle) -> String {
        if let Some(phrase) = self.settings.phrase(obstacle.obstacle_type) {
            return phrase.to_string();
        }
        let metres = (obstacle.relevant_distance / 10.0).round() * 10.0;
        format!(
            "{} ahead in {:.0} metres. Recommended speed {:.0} kilometres per hour.",
            obstacle.obstacle_type,
            metres,
            self.settings.recommended_speed(obstacle.obstacle_type)
        )
    }

    async fn say(&self, text: String) {
        let utterance = Utterance {
            text,
            language: self.settings.language.clone(),
            rate: self.settings.speech_rate,
            pitch: 1.0,
            volume: self.settings.volume,
        };
        if let Err(e) = self.speech.speak(&utterance).await {
            log::warn!("Speech failed: {}", e);
        }
    }

    /// Earliest pending pulse among full alerts
    pub fn next_pulse_at(&self) -> Option<Instant> {
        if !self.settings.sound_enabled {
            return None;
        }
        self.alerted.values().map(|r| r.next_pulse).min()
    }

    /// Play every pulse that is due and schedule the next one. A failed
    /// playback is logged and still counts as played.
    pub async fn play_due_pulses(&mut self) -> usize {
        if !self.settings.sound_enabled {
            return 0;
        }
        let now = Instant::now();
        let mut due = Vec::new();
        for record in self.alerted.values_mut() {
            if record.next_pulse > now {
                continue;
            }
            let distance = record.obstacle.relevant_distance;
            record.next_pulse = now + pulse_interval(distance, record.obstacle.severity.max, record.speed_excess);
            due.push(Tone {
                theme: self.settings.sound_theme,
                volume: self.settings.volume,
                playback_rate: pulse_pitch(distance),
            });
        }

        for tone in &due {
            if let Err(e) = self.audio.play(tone).await {
                log::warn!("Alert tone failed: {}", e);
            }
        }
        due.len()
    }

    /// Driver explicitly dismissed an alert
    pub fn dismiss(&mut self, obstacle_id: &str) -> Option<DriverReaction> {
        let record = self.alerted.remove(obstacle_id)?;
        log::info!("Alert for {} dismissed", obstacle_id);
        self.retired.insert(obstacle_id.to_string(), AlertState::Reacted);
        Some(DriverReaction::new(&record.obstacle, ReactionAction::Dismissed))
    }

    /// Full alerts first, then visual hints, each nearest first
    pub fn active_warnings(&self) -> Vec<ActiveWarning> {
        let mut full: Vec<ActiveWarning> = self
            .alerted
            .values()
            .map(|r| ActiveWarning {
                obstacle_id: r.obstacle.id.clone(),
                obstacle_type: r.obstacle.obstacle_type,
                distance: r.obstacle.relevant_distance,
                level: AlertLevel::Full,
                recommended_speed: self.settings.recommended_speed(r.obstacle.obstacle_type),
                speed_excess: r.speed_excess,
            })
            .collect();
        full.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        full.extend(self.visual.iter().cloned());
        full
    }

    /// Speak a backend warning once per id. Returns whether it was new.
    pub async fn announce_backend_warning(&mut self, warning: &Warning) -> bool {
        if !self.announced_warnings.insert(warning.id.clone()) {
            return false;
        }
        log::info!("Backend warning {}: {}", warning.id, warning.message);
        if self.settings.voice_enabled && !warning.message.is_empty() {
            self.say(warning.message.clone()).await;
        }
        true
    }

    /// Drop all alert state
    pub fn clear(&mut self) {
        self.alerted.clear();
        self.retired.clear();
        self.visual.clear();
        self.announced_warnings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingAudio, RecordingSpeech};
    use crate::types::SeverityStats;
    use approx::assert_abs_diff_eq;

    type TestOrchestrator = AlertOrchestrator<RecordingSpeech, RecordingAudio>;

    fn orchestrator() -> (Rc<RecordingSpeech>, Rc<RecordingAudio>, TestOrchestrator) {
        let speech = Rc::new(RecordingSpeech::default());
        let audio = Rc::new(RecordingAudio::default());
        let orch = AlertOrchestrator::new(speech.clone(), audio.clone(), AlertSettings::default());
        (speech, audio, orch)
    }

    fn hazard(id: &str, relevant_distance: f64) -> Obstacle {
        Obstacle {
            id: id.to_string(),
            obstacle_type: ObstacleType::Pothole,
            latitude: 45.0,
            longitude: 7.0,
            distance: relevant_distance.abs(),
            bearing: 0.0,
            relevant_distance,
            severity: SeverityStats { avg: 2.0, max: 2 },
            confidence: 0.9,
            confirmations: 3,
            last_reported: None,
            priority: 1,
        }
    }

    fn ahead(obstacles: Vec<Obstacle>) -> TickReport {
        TickReport {
            active: obstacles,
            passed: Vec::new(),
        }
    }

    fn default_distance(_: ObstacleType) -> f64 {
        500.0
    }

    #[test]
    fn test_pitch_bands() {
        assert_eq!(pulse_pitch(10.0), 1.5);
        assert_eq!(pulse_pitch(50.0), 1.3);
        assert_eq!(pulse_pitch(150.0), 1.1);
        assert_eq!(pulse_pitch(200.0), 1.0);
    }

    #[test]
    fn test_pulse_interval() {
        // Least severe, no excess: base interval
        assert_eq!(pulse_interval(320.0, 5, 0.0), Duration::from_millis(1300));
        // Severity 1 halves it, 50 km/h excess halves it again
        assert_eq!(pulse_interval(320.0, 1, 50.0), Duration::from_millis(325));
        // Closer is faster
        assert!(pulse_interval(80.0, 3, 10.0) < pulse_interval(300.0, 3, 10.0));
        // Floor
        assert_eq!(pulse_interval(10.0, 1, 200.0), Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_full_alert_when_speed_excess_over_threshold() {
        let (speech, _audio, mut orch) = orchestrator();

        // 65 km/h against a 40 km/h recommendation: 25 over
        let update = orch.update(&ahead(vec![hazard("p1", 320.0)]), 65.0, default_distance).await;
        assert_eq!(update.transitions.len(), 1);
        assert_eq!(update.transitions[0].state, AlertState::Alerted);
        assert_eq!(orch.state("p1"), Some(AlertState::Alerted));

        let warnings = orch.active_warnings();
        assert_eq!(warnings[0].level, AlertLevel::Full);
        assert_abs_diff_eq!(warnings[0].speed_excess, 25.0);

        let spoken = speech.spoken.borrow();
        assert_eq!(spoken.len(), 1);
        assert!(spoken[0].text.contains("Pothole ahead in 320 metres"));
        assert!(spoken[0].text.contains("40"));
    }

    #[tokio::test]
    async fn test_visual_only_within_tolerance() {
        let (speech, _audio, mut orch) = orchestrator();

        let update = orch.update(&ahead(vec![hazard("p1", 320.0)]), 55.0, default_distance).await;
        assert!(update.transitions.is_empty());
        assert_eq!(orch.state("p1"), None);
        assert_eq!(orch.active_warnings()[0].level, AlertLevel::Visual);
        assert!(speech.spoken.borrow().is_empty());

        // Speeding up escalates
        orch.update(&ahead(vec![hazard("p1", 300.0)]), 70.0, default_distance).await;
        assert_eq!(orch.state("p1"), Some(AlertState::Alerted));
    }

    #[tokio::test]
    async fn test_outside_band_ignored() {
        let (_speech, _audio, mut orch) = orchestrator();
        orch.update(&ahead(vec![hazard("far", 800.0)]), 90.0, default_distance).await;
        assert!(orch.active_warnings().is_empty());

        // A learned distance of 1000 m widens the band
        orch.update(&ahead(vec![hazard("far", 800.0)]), 90.0, |_| 1000.0).await;
        assert_eq!(orch.state("far"), Some(AlertState::Alerted));
    }

    #[tokio::test]
    async fn test_speed_drop_is_confirmed_reaction() {
        let (_speech, _audio, mut orch) = orchestrator();
        orch.update(&ahead(vec![hazard("p1", 320.0)]), 70.0, default_distance).await;

        let update = orch.update(&ahead(vec![hazard("p1", 250.0)]), 60.0, default_distance).await;
        assert_eq!(update.transitions[0].state, AlertState::Reacted);
        assert_eq!(update.reactions.len(), 1);
        assert_eq!(update.reactions[0].action, ReactionAction::Confirmed);
        assert_eq!(update.reactions[0].distance_at_reaction, 250.0);
        assert_eq!(orch.state("p1"), Some(AlertState::Reacted));

        // Retired hazards do not alert again
        let update = orch.update(&ahead(vec![hazard("p1", 200.0)]), 80.0, default_distance).await;
        assert!(update.transitions.is_empty());
    }

    #[tokio::test]
    async fn test_small_speed_drop_keeps_alert() {
        let (_speech, _audio, mut orch) = orchestrator();
        orch.update(&ahead(vec![hazard("p1", 320.0)]), 70.0, default_distance).await;
        let update = orch.update(&ahead(vec![hazard("p1", 280.0)]), 65.0, default_distance).await;
        assert!(update.transitions.is_empty());
        assert_eq!(orch.state("p1"), Some(AlertState::Alerted));
    }

    #[tokio::test]
    async fn test_passed_without_slowing_is_ignored() {
        let (_speech, _audio, mut orch) = orchestrator();
        orch.update(&ahead(vec![hazard("p1", 120.0)]), 70.0, default_distance).await;

        let report = TickReport {
            active: Vec::new(),
            passed: vec![hazard("p1", 40.0)],
        };
        let update = orch.update(&report, 70.0, default_distance).await;
        assert_eq!(update.transitions[0].state, AlertState::Ignored);
        assert_eq!(update.reactions[0].action, ReactionAction::Ignored);
        assert_eq!(orch.state("p1"), Some(AlertState::Ignored));
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_expires() {
        let (_speech, _audio, mut orch) = orchestrator();
        orch.update(&ahead(vec![hazard("p1", 450.0)]), 70.0, default_distance).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let update = orch.update(&ahead(vec![hazard("p1", 440.0)]), 70.0, default_distance).await;
        assert_eq!(update.transitions[0].state, AlertState::Expired);
        assert!(update.reactions.is_empty());
        assert_eq!(orch.state("p1"), Some(AlertState::Expired));

        orch.clear();
        assert_eq!(orch.state("p1"), None);
    }

    #[tokio::test]
    async fn test_dismiss_records_dismissed() {
        let (_speech, _audio, mut orch) = orchestrator();
        orch.update(&ahead(vec![hazard("p1", 300.0)]), 70.0, default_distance).await;

        let reaction = orch.dismiss("p1").unwrap();
        assert_eq!(reaction.action, ReactionAction::Dismissed);
        assert_eq!(orch.state("p1"), Some(AlertState::Reacted));
        assert!(orch.dismiss("p1").is_none());
        assert!(orch.active_warnings().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulses_follow_cadence() {
        let (_speech, audio, mut orch) = orchestrator();
        orch.update(&ahead(vec![hazard("p1", 80.0)]), 70.0, default_distance).await;

        assert_eq!(orch.play_due_pulses().await, 1);
        assert_eq!(orch.play_due_pulses().await, 0);
        assert_eq!(audio.played.borrow()[0].playback_rate, 1.3);

        let next = orch.next_pulse_at().unwrap();
        // 600 ms base, severity 2 -> /1.75, 30 km/h over -> /1.6
        assert_eq!(next - Instant::now(), Duration::from_millis(214));

        tokio::time::advance(Duration::from_millis(214)).await;
        assert_eq!(orch.play_due_pulses().await, 1);
    }

    #[tokio::test]
    async fn test_playback_failure_does_not_stall() {
        let (speech, audio, mut orch) = orchestrator();
        speech.fail.set(true);
        audio.fail.set(true);

        orch.update(&ahead(vec![hazard("p1", 300.0)]), 70.0, default_distance).await;
        assert_eq!(orch.state("p1"), Some(AlertState::Alerted));
        assert_eq!(orch.play_due_pulses().await, 1);
        assert!(orch.next_pulse_at().unwrap() > Instant::now());
    }

    #[tokio::test]
    async fn test_backend_warning_spoken_once() {
        let (speech, _audio, mut orch) = orchestrator();
        let warning = Warning {
            id: "w1".to_string(),
            warning_type: "pothole".to_string(),
            message: "Pothole reported ahead".to_string(),
            severity: Some(2),
            latitude: None,
            longitude: None,
            distance: Some(150.0),
        };
        assert!(orch.announce_backend_warning(&warning).await);
        assert!(!orch.announce_backend_warning(&warning).await);
        assert_eq!(speech.spoken.borrow().len(), 1);
    }
}

use super::outputs::SoundTheme;
use crate::error::{Result, SentinelError};
use crate::storage::{KvStore, ALERT_SETTINGS_KEY};
use crate::types::ObstacleType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HazardAlertSetting {
    pub recommended_speed_kmh: f64,
    /// Replaces the generated announcement when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phrase: Option<String>,
}

/// User-tunable alert behaviour, persisted in the local store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertSettings {
    pub voice_enabled: bool,
    pub sound_enabled: bool,
    pub language: String,
    pub speech_rate: f64,
    pub volume: f64,
    pub sound_theme: SoundTheme,
    /// Speed over the recommendation that turns a visual hint into a full alert
    pub speed_excess_threshold_kmh: f64,
    pub min_distance_m: f64,
    pub max_distance_m: f64,
    pub hazards: BTreeMap<ObstacleType, HazardAlertSetting>,
}

impl Default for AlertSettings {
    fn default() -> Self {
        let hazards = ObstacleType::ALL
            .iter()
            .map(|&t| {
                let speed = match t {
                    ObstacleType::SpeedBump => 20.0,
                    ObstacleType::Bump | ObstacleType::Accident | ObstacleType::Flooding => 30.0,
                    ObstacleType::Pothole | ObstacleType::Debris => 40.0,
                    ObstacleType::Construction | ObstacleType::Other => 50.0,
                };
                (
                    t,
                    HazardAlertSetting {
                        recommended_speed_kmh: speed,
                        phrase: None,
                    },
                )
            })
            .collect();

        Self {
            voice_enabled: true,
            sound_enabled: true,
            language: "en-US".to_string(),
            speech_rate: 1.0,
            volume: 1.0,
            sound_theme: SoundTheme::Classic,
            speed_excess_threshold_kmh: 20.0,
            min_distance_m: 0.0,
            max_distance_m: 500.0,
            hazards,
        }
    }
}

impl AlertSettings {
    pub fn recommended_speed(&self, obstacle_type: ObstacleType) -> f64 {
        self.hazards
            .get(&obstacle_type)
            .or_else(|| self.hazards.get(&ObstacleType::Other))
            .map_or(50.0, |h| h.recommended_speed_kmh)
    }

    pub fn phrase(&self, obstacle_type: ObstacleType) -> Option<&str> {
        self.hazards.get(&obstacle_type).and_then(|h| h.phrase.as_deref())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.speech_rate > 0.0) {
            return Err(SentinelError::InvalidConfig("alerts.speech_rate must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(SentinelError::InvalidConfig("alerts.volume must be within [0, 1]".into()));
        }
        if !(self.speed_excess_threshold_kmh >= 0.0) {
            return Err(SentinelError::InvalidConfig(
                "alerts.speed_excess_threshold_kmh must be >= 0".into(),
            ));
        }
        if !(self.min_distance_m >= 0.0 && self.min_distance_m < self.max_distance_m) {
            return Err(SentinelError::InvalidConfig(format!(
                "alerts distance band [{}, {}] is invalid",
                self.min_distance_m, self.max_distance_m
            )));
        }
        if let Some((t, _)) = self.hazards.iter().find(|(_, h)| !(h.recommended_speed_kmh >= 0.0)) {
            return Err(SentinelError::InvalidConfig(format!(
                "recommended speed for {} must be >= 0",
                t
            )));
        }
        Ok(())
    }

    /// Stored settings, or defaults when nothing valid is stored
    pub fn load(store: &KvStore) -> Self {
        match store.load_or_warn::<AlertSettings>(ALERT_SETTINGS_KEY) {
            Some(settings) => match settings.validate() {
                Ok(()) => settings,
                Err(e) => {
                    log::warn!("Ignoring stored alert settings: {}", e);
                    AlertSettings::default()
                }
            },
            None => AlertSettings::default(),
        }
    }

    pub fn save(&self, store: &KvStore) -> Result<()> {
        store.save(ALERT_SETTINGS_KEY, self)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HazardAlertOverrides {
    pub recommended_speed_kmh: Option<f64>,
    pub phrase: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertSettingsOverrides {
    pub voice_enabled: Option<bool>,
    pub sound_enabled: Option<bool>,
    pub language: Option<String>,
    pub speech_rate: Option<f64>,
    pub volume: Option<f64>,
    pub sound_theme: Option<SoundTheme>,
    pub speed_excess_threshold_kmh: Option<f64>,
    pub min_distance_m: Option<f64>,
    pub max_distance_m: Option<f64>,
    #[serde(default)]
    pub hazards: BTreeMap<ObstacleType, HazardAlertOverrides>,
}

/// Apply `overrides` field by field on top of `defaults`, then validate
pub fn merge(defaults: &AlertSettings, overrides: &AlertSettingsOverrides) -> Result<AlertSettings> {
    let mut s = defaults.clone();

    if let Some(v) = overrides.voice_enabled {
        s.voice_enabled = v;
    }
    if let Some(v) = overrides.sound_enabled {
        s.sound_enabled = v;
    }
    if let Some(v) = &overrides.language {
        s.language = v.clone();
    }
    if let Some(v) = overrides.speech_rate {
        s.speech_rate = v;
    }
    if let Some(v) = overrides.volume {
        s.volume = v;
    }
    if let Some(v) = overrides.sound_theme {
        s.sound_theme = v;
    }
    if let Some(v) = overrides.speed_excess_threshold_kmh {
        s.speed_excess_threshold_kmh = v;
    }
    if let Some(v) = overrides.min_distance_m {
        s.min_distance_m = v;
    }
    if let Some(v) = overrides.max_distance_m {
        s.max_distance_m = v;
    }
    for (obstacle_type, o) in &overrides.hazards {
        let entry = s.hazards.entry(*obstacle_type).or_insert(HazardAlertSetting {
            recommended_speed_kmh: defaults.recommended_speed(*obstacle_type),
            phrase: None,
        });
        if let Some(v) = o.recommended_speed_kmh {
            entry.recommended_speed_kmh = v;
        }
        if let Some(v) = &o.phrase {
            entry.phrase = Some(v.clone());
        }
    }

    s.validate()?;
    Ok(s)
}

//! Speech and audio seams. The orchestrator only ever talks to these traits.

use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundTheme {
    #[default]
    Classic,
    Soft,
    Beep,
}

impl SoundTheme {
    pub fn waveform(&self) -> &'static str {
        match self {
            SoundTheme::Classic => "square",
            SoundTheme::Soft => "sine",
            SoundTheme::Beep => "triangle",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub language: String,
    pub rate: f64,
    pub pitch: f64,
    pub volume: f64,
}

/// One pulse of the alert cadence
#[derive(Clone, Debug, PartialEq)]
pub struct Tone {
    pub theme: SoundTheme,
    pub volume: f64,
    pub playback_rate: f64,
}

#[allow(async_fn_in_trait)]
pub trait SpeechOutput {
    async fn speak(&self, utterance: &Utterance) -> Result<()>;
}

#[allow(async_fn_in_trait)]
pub trait AudioOutput {
    async fn play(&self, tone: &Tone) -> Result<()>;
}

/// Writes announcements to the log; used by the binaries
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSpeech;

impl SpeechOutput for LogSpeech {
    async fn speak(&self, utterance: &Utterance) -> Result<()> {
        log::info!("[speech {}] {}", utterance.language, utterance.text);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogAudio;

impl AudioOutput for LogAudio {
    async fn play(&self, tone: &Tone) -> Result<()> {
        log::debug!(
            "[tone {} x{:.1} vol {:.1}]",
            tone.theme.waveform(),
            tone.playback_rate,
            tone.volume
        );
        Ok(())
    }
}

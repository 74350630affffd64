//! Session configuration from the environment

use crate::protocol::{
    AudioFormat, InputAudioTranscription, MaxResponseOutputTokens, Modality, SessionConfig,
    ToolChoice, ToolDefinition, TurnDetection,
};
use crate::protocol::session::InfTokens;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";
pub const DEFAULT_VOICE: &str = "echo";
pub const DEFAULT_INSTRUCTIONS: &str = "You are Jarvis, a helpful voice assistant. \
Provide insightful and supportive responses tailored to the user's needs. \
Keep your responses as concise and to the point as possible. Never break character.";
pub const DEFAULT_VAD_THRESHOLD: f32 = 0.5;
pub const DEFAULT_PREFIX_PADDING_MS: u32 = 300;
pub const DEFAULT_SILENCE_DURATION_MS: u32 = 700;

/// Realtime session settings
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub modalities: Vec<Modality>,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub turn_detection: TurnDetection,
    /// Transcription model for user audio (`None` disables transcription)
    pub transcription_model: Option<String>,
    pub temperature: Option<f32>,
    pub max_response_output_tokens: Option<MaxResponseOutputTokens>,
    /// Enforced by the tool registry, not the session
    pub tool_timeout: Option<Duration>,
    /// Sent as one user message when the session starts
    pub initial_prompts: Vec<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            modalities: vec![Modality::Text, Modality::Audio],
            input_audio_format: AudioFormat::Pcm16,
            output_audio_format: AudioFormat::Pcm16,
            turn_detection: TurnDetection::ServerVad {
                threshold: Some(DEFAULT_VAD_THRESHOLD),
                prefix_padding_ms: Some(DEFAULT_PREFIX_PADDING_MS),
                silence_duration_ms: Some(DEFAULT_SILENCE_DURATION_MS),
            },
            transcription_model: None,
            temperature: None,
            max_response_output_tokens: None,
            tool_timeout: None,
            initial_prompts: Vec::new(),
        }
    }
}

impl RealtimeConfig {
    /// Read `REALTIME_*` variables; unset or unparsable values keep defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<f64>().ok());

        let turn_detection = match lookup("REALTIME_TURN_DETECTION").as_deref() {
            Some("none" | "manual") => TurnDetection::Disabled,
            _ => TurnDetection::ServerVad {
                threshold: lookup("REALTIME_VAD_THRESHOLD")
                    .and_then(|v| v.trim().parse().ok())
                    .or(Some(DEFAULT_VAD_THRESHOLD)),
                prefix_padding_ms: lookup("REALTIME_VAD_PREFIX_PADDING_MS")
                    .and_then(|v| v.trim().parse().ok())
                    .or(Some(DEFAULT_PREFIX_PADDING_MS)),
                silence_duration_ms: lookup("REALTIME_VAD_SILENCE_DURATION_MS")
                    .and_then(|v| v.trim().parse().ok())
                    .or(Some(DEFAULT_SILENCE_DURATION_MS)),
            },
        };

        let max_response_output_tokens =
            lookup("REALTIME_MAX_RESPONSE_OUTPUT_TOKENS").and_then(|v| match v.trim() {
                "inf" => Some(MaxResponseOutputTokens::Inf(InfTokens::Inf)),
                n => n.parse().ok().map(MaxResponseOutputTokens::Limited),
            });

        Self {
            model: lookup("REALTIME_MODEL").unwrap_or(defaults.model),
            voice: lookup("REALTIME_VOICE").unwrap_or(defaults.voice),
            instructions: lookup("REALTIME_INSTRUCTIONS").unwrap_or(defaults.instructions),
            modalities: lookup("REALTIME_MODALITIES")
                .map(|v| parse_modalities(&v))
                .filter(|m| !m.is_empty())
                .unwrap_or(defaults.modalities),
            input_audio_format: lookup("REALTIME_INPUT_AUDIO_FORMAT")
                .and_then(|v| parse_audio_format(&v))
                .unwrap_or(defaults.input_audio_format),
            output_audio_format: lookup("REALTIME_OUTPUT_AUDIO_FORMAT")
                .and_then(|v| parse_audio_format(&v))
                .unwrap_or(defaults.output_audio_format),
            turn_detection,
            transcription_model: lookup("REALTIME_TRANSCRIPTION_MODEL")
                .filter(|v| !v.trim().is_empty()),
            temperature: lookup("REALTIME_TEMPERATURE").and_then(|v| v.trim().parse().ok()),
            max_response_output_tokens,
            tool_timeout: parsed("REALTIME_TOOL_TIMEOUT_SECS")
                .filter(|secs| *secs > 0.0)
                .map(Duration::from_secs_f64),
            initial_prompts: lookup("REALTIME_PROMPTS")
                .map(|v| {
                    v.split('|')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// The `session.update` payload, advertising `tools`.
    pub fn session_config(&self, tools: Vec<ToolDefinition>) -> SessionConfig {
        let has_tools = !tools.is_empty();
        SessionConfig {
            modalities: Some(self.modalities.clone()),
            instructions: Some(self.instructions.clone()),
            voice: Some(self.voice.clone()),
            input_audio_format: Some(self.input_audio_format),
            output_audio_format: Some(self.output_audio_format),
            input_audio_transcription: self
                .transcription_model
                .clone()
                .map(|model| InputAudioTranscription { model }),
            turn_detection: Some(self.turn_detection.clone()),
            tools: Some(tools),
            tool_choice: has_tools.then(ToolChoice::auto),
            temperature: self.temperature,
            max_response_output_tokens: self.max_response_output_tokens,
        }
    }
}

fn parse_modalities(value: &str) -> Vec<Modality> {
    value
        .split(',')
        .filter_map(|m| match m.trim() {
            "text" => Some(Modality::Text),
            "audio" => Some(Modality::Audio),
            _ => None,
        })
        .collect()
}

fn parse_audio_format(value: &str) -> Option<AudioFormat> {
    match value.trim() {
        "pcm16" => Some(AudioFormat::Pcm16),
        "g711_ulaw" => Some(AudioFormat::G711Ulaw),
        "g711_alaw" => Some(AudioFormat::G711Alaw),
        _ => None,
    }
}

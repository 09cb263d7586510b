use serde::{Deserialize, Serialize};

/// The API shape an inbound request is relayed as. Derived once from the request path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    Unknown,
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    ImageGeneration,
    Edits,
    AudioTranscription,
}

#[derive(Clone, Copy, Debug)]
enum PathMatcher {
    Prefix(&'static str),
    Suffix(&'static str),
}

impl PathMatcher {
    fn matches(self, path: &str) -> bool {
        match self {
            PathMatcher::Prefix(prefix) => path.starts_with(prefix),
            PathMatcher::Suffix(suffix) => path.ends_with(suffix),
        }
    }
}

// Evaluated top to bottom; the first hit wins.
const RELAY_MODE_TABLE: &[(PathMatcher, RelayMode)] = &[
    (
        PathMatcher::Prefix("/v1/chat/completions"),
        RelayMode::ChatCompletions,
    ),
    (PathMatcher::Prefix("/v1/completions"), RelayMode::Completions),
    (PathMatcher::Prefix("/v1/embeddings"), RelayMode::Embeddings),
    (PathMatcher::Suffix("embeddings"), RelayMode::Embeddings),
    (PathMatcher::Prefix("/v1/moderations"), RelayMode::Moderations),
    (
        PathMatcher::Prefix("/v1/images/generations"),
        RelayMode::ImageGeneration,
    ),
    (PathMatcher::Prefix("/v1/edits"), RelayMode::Edits),
];

/// Which relay pipeline handles a mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayPipeline {
    Text,
    Image,
    Audio,
}

impl RelayMode {
    pub fn from_path(path: &str) -> Self {
        RELAY_MODE_TABLE
            .iter()
            .find(|(matcher, _)| matcher.matches(path))
            .map(|(_, mode)| *mode)
            .unwrap_or(RelayMode::Unknown)
    }

    pub fn pipeline(self) -> RelayPipeline {
        match self {
            RelayMode::ImageGeneration => RelayPipeline::Image,
            RelayMode::AudioTranscription => RelayPipeline::Audio,
            _ => RelayPipeline::Text,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelayMode::Unknown => "unknown",
            RelayMode::ChatCompletions => "chat_completions",
            RelayMode::Completions => "completions",
            RelayMode::Embeddings => "embeddings",
            RelayMode::Moderations => "moderations",
            RelayMode::ImageGeneration => "image_generation",
            RelayMode::Edits => "edits",
            RelayMode::AudioTranscription => "audio_transcription",
        }
    }
}

impl std::fmt::Display for RelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_prefixes() {
        assert_eq!(
            RelayMode::from_path("/v1/chat/completions"),
            RelayMode::ChatCompletions
        );
        assert_eq!(
            RelayMode::from_path("/v1/completions"),
            RelayMode::Completions
        );
        assert_eq!(RelayMode::from_path("/v1/embeddings"), RelayMode::Embeddings);
        assert_eq!(
            RelayMode::from_path("/v1/moderations"),
            RelayMode::Moderations
        );
        assert_eq!(
            RelayMode::from_path("/v1/images/generations"),
            RelayMode::ImageGeneration
        );
        assert_eq!(RelayMode::from_path("/v1/edits"), RelayMode::Edits);
    }

    #[test]
    fn embeddings_suffix_matches_engine_paths() {
        assert_eq!(
            RelayMode::from_path("/v1/engines/text-embedding-ada-002/embeddings"),
            RelayMode::Embeddings
        );
    }

    #[test]
    fn earlier_entries_take_priority() {
        // Would also satisfy the embeddings suffix rule.
        assert_eq!(
            RelayMode::from_path("/v1/chat/completions/embeddings"),
            RelayMode::ChatCompletions
        );
    }

    #[test]
    fn everything_else_is_unknown() {
        assert_eq!(RelayMode::from_path("/v1/unknown/path"), RelayMode::Unknown);
        assert_eq!(
            RelayMode::from_path("/v1/audio/transcriptions"),
            RelayMode::Unknown
        );
        assert_eq!(RelayMode::from_path(""), RelayMode::Unknown);
    }

    #[test]
    fn pipelines() {
        assert_eq!(
            RelayMode::ImageGeneration.pipeline(),
            RelayPipeline::Image
        );
        assert_eq!(
            RelayMode::AudioTranscription.pipeline(),
            RelayPipeline::Audio
        );
        assert_eq!(RelayMode::Moderations.pipeline(), RelayPipeline::Text);
        assert_eq!(RelayMode::Unknown.pipeline(), RelayPipeline::Text);
    }
}

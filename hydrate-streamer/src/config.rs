use crate::{StreamerError, StreamerResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for the request pools of a [`StreamerContext`](crate::StreamerContext). Missing
/// fields take their default value when loaded from json.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerContextConfig {
    // Requests allocated up front when the context is created
    pub initial_internal_requests: usize,
    pub initial_external_requests: usize,
    // Recycled requests beyond these limits are freed instead of pooled
    pub max_pooled_internal_requests: usize,
    pub max_pooled_external_requests: usize,
}

impl Default for StreamerContextConfig {
    fn default() -> Self {
        StreamerContextConfig {
            initial_internal_requests: 16,
            initial_external_requests: 16,
            max_pooled_internal_requests: 512,
            max_pooled_external_requests: 512,
        }
    }
}

impl StreamerContextConfig {
    pub fn from_json_str(json: &str) -> StreamerResult<Self> {
        let config: StreamerContextConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn read_from_path(path: &Path) -> StreamerResult<Self> {
        log::info!("Reading streamer config from {:?}", path);
        let file_contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&file_contents)
    }

    pub fn validate(&self) -> StreamerResult<()> {
        if self.initial_internal_requests > self.max_pooled_internal_requests {
            return Err(StreamerError::StringError(format!(
                "initial_internal_requests ({}) is larger than max_pooled_internal_requests ({})",
                self.initial_internal_requests, self.max_pooled_internal_requests
            )));
        }

        if self.initial_external_requests > self.max_pooled_external_requests {
            return Err(StreamerError::StringError(format!(
                "initial_external_requests ({}) is larger than max_pooled_external_requests ({})",
                self.initial_external_requests, self.max_pooled_external_requests
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = StreamerContextConfig::from_json_str(r#"{ "initial_internal_requests": 4 }"#)
            .unwrap();
        assert_eq!(config.initial_internal_requests, 4);
        assert_eq!(
            config.max_pooled_internal_requests,
            StreamerContextConfig::default().max_pooled_internal_requests
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        let result = StreamerContextConfig::from_json_str("{ not json");
        assert!(matches!(result, Err(StreamerError::JsonError(_))));
    }

    #[test]
    fn initial_larger_than_max_is_rejected() {
        let result = StreamerContextConfig::from_json_str(
            r#"{ "initial_external_requests": 10, "max_pooled_external_requests": 2 }"#,
        );
        assert!(matches!(result, Err(StreamerError::StringError(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = StreamerContextConfig::read_from_path(Path::new("does/not/exist.json"));
        assert!(matches!(result, Err(StreamerError::IoError(_))));
    }
}

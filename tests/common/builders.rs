//! Test data builders for creating test objects

use frameflow_rs::config::{FrameDetection, OperationMode, PoolSettings, WorkerConfig};
use frameflow_rs::framing::checksum::ChecksumAlgorithm;

/// Builder for creating test WorkerConfigs
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
        }
    }

    pub fn mode(mut self, mode: OperationMode) -> Self {
        self.config.operation_mode = mode;
        self
    }

    pub fn detection(mut self, detection: FrameDetection) -> Self {
        self.config.frame_detection = detection;
        self
    }

    pub fn delimiters(mut self, start: &str, finish: &str) -> Self {
        self.config.start_sequence = start.as_bytes().to_vec();
        self.config.finish_sequence = finish.as_bytes().to_vec();
        self
    }

    pub fn checksum(mut self, algorithm: &str) -> Self {
        self.config.checksum_algorithm = algorithm.to_string();
        self
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.config.max_workers = Some(count);
        self
    }

    pub fn capacity(mut self, bytes: usize) -> Self {
        self.config.buffer_capacity = Some(bytes);
        self
    }

    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

impl Default for WorkerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool settings with short timeouts for tests
pub fn fast_settings() -> PoolSettings {
    PoolSettings {
        parse_timeout_ms: 200,
        stall_timeout_ms: 2_000,
        shutdown_grace_ms: 500,
        ..PoolSettings::default()
    }
}

/// Frame body followed by its checksum bytes
pub fn with_checksum(body: &[u8], algorithm: ChecksumAlgorithm) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend(algorithm.compute(body));
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfigBuilder::new()
            .detection(FrameDetection::StartAndEndDelimiter)
            .delimiters("<", ">")
            .checksum("crc-16")
            .workers(2)
            .build();

        assert_eq!(config.start_sequence, b"<".to_vec());
        assert_eq!(config.max_workers(), 2);
        assert!(config.validate().is_ok());
    }
}

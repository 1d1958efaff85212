//! Resource limits for command execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource limits applied to each executed command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum captured output (stdout or stderr, each) in bytes
    pub max_output_bytes: u64,
    /// Wall-clock timeout; the subprocess is killed when it expires
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,    // 1 MB output
            timeout: Duration::from_secs(30), // 30 second wall clock
        }
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

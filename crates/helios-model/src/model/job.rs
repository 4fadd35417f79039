use std::collections::BTreeMap;

use helios_coordination::JobId;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// A job definition, stored at `/jobs/<id>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    /// Creation time in epoch millis, set by the master
    #[serde(default)]
    pub created: Option<i64>,
    /// Expiry in epoch millis
    #[serde(default)]
    pub expires: Option<i64>,
}

impl Job {
    pub fn new(id: JobId, image: impl Into<String>) -> Self {
        Self {
            id,
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            metadata: BTreeMap::new(),
            grace_period: None,
            network_mode: None,
            created: None,
            expires: None,
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Job name, the part of the id before the first `:`.
    pub fn name(&self) -> &str {
        self.id
            .as_str()
            .split_once(':')
            .map_or(self.id.as_str(), |(name, _)| name)
    }

    /// Job version, the second `:`-separated part of the id.
    pub fn version(&self) -> Option<&str> {
        self.id.as_str().split(':').nth(1)
    }

    /// Check the definition before it is stored.
    pub fn validate(&self) -> Result<()> {
        let parts: Vec<&str> = self.id.as_str().split(':').collect();
        if !(2..=3).contains(&parts.len()) || parts.iter().any(|p| p.is_empty()) {
            return Err(ModelError::InvalidJob(format!(
                "job id {} must be name:version[:hash]",
                self.id
            )));
        }
        if self.image.trim().is_empty() {
            return Err(ModelError::InvalidJob(format!("job {} has no image", self.id)));
        }
        if let (Some(created), Some(expires)) = (self.created, self.expires)
            && expires <= created
        {
            return Err(ModelError::InvalidJob(format!(
                "job {} expires before it is created",
                self.id
            )));
        }
        Ok(())
    }
}

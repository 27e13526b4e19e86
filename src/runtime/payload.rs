//! Job payload: what to run and what it may touch.

use crate::engine::BindMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A host directory to expose inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerBind {
    /// Host path; must lie inside one of the environment's work dirs.
    pub source: PathBuf,
    /// Mount point inside the container.
    pub target: String,
    #[serde(default)]
    pub mode: BindMode,
}

impl DockerBind {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>, mode: BindMode) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mode,
        }
    }
}

/// Immutable description of one job attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePayload {
    /// Image repository, e.g. `taskbox/base`.
    pub image: String,
    /// Image tag.
    pub tag: String,
    /// Command override; empty runs the image default.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub user: Option<String>,
    /// Working directory inside the container.
    #[serde(default)]
    pub work_dir: Option<String>,
    /// Container ports to publish.
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub binds: Vec<DockerBind>,
}

impl RuntimePayload {
    /// Creates a payload running the default command of `image:tag`.
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
            command: Vec::new(),
            env: HashMap::new(),
            user: None,
            work_dir: None,
            ports: Vec::new(),
            binds: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<String>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    #[must_use]
    pub fn with_bind(mut self, bind: DockerBind) -> Self {
        self.binds.push(bind);
        self
    }

    /// `image:tag`.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_image_ref() {
        let payload = RuntimePayload::new("taskbox/base", "1.2")
            .with_command(["sh", "-c", "echo hi"])
            .with_env("MODE", "test")
            .with_port(8080)
            .with_bind(DockerBind::new("/tmp/w/in", "/work/in", BindMode::Ro));

        assert_eq!(payload.image_ref(), "taskbox/base:1.2");
        assert_eq!(payload.command.len(), 3);
        assert_eq!(payload.ports, vec![8080]);
        assert_eq!(payload.binds[0].mode, BindMode::Ro);
    }

    #[test]
    fn test_deserialize_defaults() {
        let payload: RuntimePayload =
            serde_json::from_str(r#"{"image": "taskbox/wasm", "tag": "latest"}"#).unwrap();
        assert!(payload.command.is_empty());
        assert!(payload.binds.is_empty());
        assert!(payload.user.is_none());
    }

    #[test]
    fn test_bind_mode_default_rw() {
        let bind: DockerBind =
            serde_json::from_str(r#"{"source": "/tmp/w", "target": "/work"}"#).unwrap();
        assert_eq!(bind.mode, BindMode::Rw);
    }
}

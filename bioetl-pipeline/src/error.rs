use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Config,
    Extract,
    Transform,
    Validate,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "config",
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Validate => "validate",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

/// How far a run got before it stopped. Nothing is written unless the write stage completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub pages_fetched: usize,
    pub rows_validated: usize,
}

#[derive(Debug)]
pub struct PipelineError {
    pub stage: Stage,
    pub progress: Progress,
    pub source: anyhow::Error,
}

impl PipelineError {
    pub fn new(stage: Stage, progress: Progress, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            progress,
            source: source.into(),
        }
    }

    pub fn config(source: impl Into<anyhow::Error>) -> Self {
        Self::new(Stage::Config, Progress::default(), source)
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed", self.stage)?;
        if self.stage != Stage::Config {
            write!(
                f,
                " ({} pages fetched, {} rows validated, no output written)",
                self.progress.pages_fetched, self.progress.rows_validated
            )?;
        }
        write!(f, ": {:#}", self.source)
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source: &(dyn std::error::Error + 'static) = self.source.as_ref();
        Some(source)
    }
}

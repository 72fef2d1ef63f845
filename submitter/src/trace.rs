use eyre::Result;
use serde::Deserialize;
use tracing::Subscriber;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt,
    prelude::*,
    registry::LookupSpan,
    Layer,
};

/// Logging level. A "higher level" means more will be logged.
#[derive(Default, Debug, Clone, Copy, Deserialize, PartialOrd, Ord, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Level {
    /// Off
    Off = 0,
    /// Error
    Error = 1,
    /// Warn
    Warn = 2,
    /// Debug
    Debug = 4,
    /// Trace
    Trace = 5,
    /// Info
    #[serde(other)]
    #[default]
    Info = 3,
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> LevelFilter {
        match level {
            Level::Off => LevelFilter::OFF,
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Debug => LevelFilter::DEBUG,
            Level::Trace => LevelFilter::TRACE,
            Level::Info => LevelFilter::INFO,
        }
    }
}

/// Output format of the stdout log layer.
#[derive(Default, Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Style {
    /// Multi-line, human readable output
    #[default]
    Pretty,
    /// `tracing_subscriber`'s default single-line format
    Full,
    Compact,
    /// One JSON object per line
    Json,
}

impl Style {
    fn layer<S>(self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        match self {
            Style::Pretty => fmt::layer().pretty().boxed(),
            Style::Full => fmt::layer().boxed(),
            Style::Compact => fmt::layer().compact().boxed(),
            Style::Json => fmt::layer().json().boxed(),
        }
    }
}

/// Configuration for the tracing subscriber of the submitter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub fmt: Style,
    #[serde(default)]
    pub level: Level,
}

impl TracingConfig {
    fn targets(&self) -> Targets {
        let mut targets = Targets::new().with_default(LevelFilter::from(self.level));
        if self.level < Level::Trace {
            // only show these debug and trace logs at trace level
            targets = targets.with_target("hyper", LevelFilter::INFO);
            targets = targets.with_target("reqwest", LevelFilter::INFO);
        }
        targets
    }

    /// Attempt to instantiate and register a tracing subscriber setup from
    /// settings.
    pub fn start_tracing(&self) -> Result<()> {
        tracing_subscriber::Registry::default()
            .with(self.targets())
            .with(self.fmt.layer())
            .try_init()?;
        Ok(())
    }
}

use std::fmt;
use std::future::Future;

use log::{debug, error, info, warn};

use crate::config::LoggingConfig;
use crate::error::PlatformError;

/// Structured call context handed explicitly to every component boundary.
#[derive(Debug, Clone)]
pub struct LogContext {
    module: &'static str,
    method: &'static str,
    fields: Vec<(&'static str, String)>,
}

impl LogContext {
    pub fn new(module: &'static str, method: &'static str) -> Self {
        Self {
            module,
            method,
            fields: Vec::new(),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    /// Derive a context for a nested call, keeping the parent's fields.
    pub fn child(&self, method: &'static str) -> Self {
        Self {
            module: self.module,
            method,
            fields: self.fields.clone(),
        }
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    pub fn method(&self) -> &'static str {
        self.method
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.method)?;
        for (key, value) in &self.fields {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Run a component operation, logging entry and outcome at one place.
pub async fn traced<T, F>(ctx: &LogContext, operation: F) -> Result<T, PlatformError>
where
    F: Future<Output = Result<T, PlatformError>>,
{
    info!(target: ctx.module, "{} called", ctx);
    match operation.await {
        Ok(value) => {
            debug!(target: ctx.module, "{} succeeded", ctx);
            Ok(value)
        }
        Err(err) => {
            if err.is_caller_error() {
                warn!(target: ctx.module, "{} rejected: {}", ctx, err);
            } else {
                error!(target: ctx.module, "{} failed: {}", ctx, err);
            }
            Err(err)
        }
    }
}

/// Install env_logger with the configured default level and module filters.
pub fn init(config: &LoggingConfig) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.level.as_str()),
    );
    for (module, level) in &config.filters {
        match level.parse::<log::LevelFilter>() {
            Ok(level) => {
                builder.filter_module(module, level);
            }
            Err(_) => eprintln!("ignoring log filter {}={}: unknown level", module, level),
        }
    }
    let _ = builder.try_init();
}

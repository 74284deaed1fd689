//! Configuration for recording and reporting.

use crate::report::ReportConfig;

/// Path of the connection decorators, the interception layer shipped here.
pub const INTERCEPTOR_PATH_PREFIX: &str = "sea_orm_nplusone::connection";

/// Configuration options for the tracker and the traced connection.
///
/// # Example
///
/// ```rust
/// use sea_orm_nplusone::{NPlusOneConfig, ReportConfig};
///
/// let config = NPlusOneConfig::default()
///     .with_application_prefix("my_app")
///     .with_proxy_prefix("my_app::db::wrappers")
///     .with_report(ReportConfig::default().with_enabled(true));
/// ```
#[derive(Debug, Clone)]
pub struct NPlusOneConfig {
    /// Path prefixes of the monitored application. Frames under them are
    /// application frames.
    /// Default: empty (every frame outside the proxy prefixes is third-party)
    pub application_prefixes: Vec<String>,

    /// Path prefixes of the interception layer. Checked before the
    /// application prefixes.
    /// Default: this crate's connection decorators
    pub proxy_prefixes: Vec<String>,

    /// Upper bound on resolved frames per capture, innermost frames first.
    /// Default: 128
    pub max_frames: usize,

    /// Whether sessions that closed without any operation are recorded.
    /// Default: `true`
    pub record_empty_sessions: bool,

    /// Whether the traced connection puts SQL text on its spans.
    /// Default: `false`
    pub log_statements: bool,

    /// Session report written to the log when a session closes.
    pub report: ReportConfig,
}

impl Default for NPlusOneConfig {
    fn default() -> Self {
        Self {
            application_prefixes: Vec::new(),
            proxy_prefixes: vec![INTERCEPTOR_PATH_PREFIX.to_string()],
            max_frames: 128,
            record_empty_sessions: true,
            log_statements: false,
            report: ReportConfig::default(),
        }
    }
}

impl NPlusOneConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a path prefix of the monitored application, e.g. `"my_app"`.
    pub fn with_application_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.application_prefixes.push(prefix.into());
        self
    }

    /// Add a path prefix of code that wraps application services.
    pub fn with_proxy_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.proxy_prefixes.push(prefix.into());
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Record or skip sessions that closed without operations.
    pub fn with_empty_sessions(mut self, enabled: bool) -> Self {
        self.record_empty_sessions = enabled;
        self
    }

    /// Enable or disable SQL text on statement spans.
    ///
    /// **Security Warning**: statement text may contain literal values.
    pub fn with_statement_logging(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }

    pub fn with_report(mut self, report: ReportConfig) -> Self {
        self.report = report;
        self
    }

    /// Configuration for local development: reports every session and puts
    /// SQL on spans.
    pub fn development(application_prefix: impl Into<String>) -> Self {
        Self::default()
            .with_application_prefix(application_prefix)
            .with_statement_logging(true)
            .with_report(ReportConfig::default().with_enabled(true))
    }

    /// Configuration for test suites: records everything, reports nothing.
    pub fn test(application_prefix: impl Into<String>) -> Self {
        Self::default().with_application_prefix(application_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NPlusOneConfig::default()
            .with_application_prefix("shop")
            .with_proxy_prefix("shop::proxy")
            .with_empty_sessions(false);

        assert_eq!(config.application_prefixes, vec!["shop".to_string()]);
        assert_eq!(
            config.proxy_prefixes,
            vec![INTERCEPTOR_PATH_PREFIX.to_string(), "shop::proxy".to_string()]
        );
        assert!(!config.record_empty_sessions);
    }

    #[test]
    fn test_development_config() {
        let config = NPlusOneConfig::development("shop");
        assert!(config.log_statements);
        assert!(config.report.enabled);
    }

    #[test]
    fn test_test_config() {
        let config = NPlusOneConfig::test("shop");
        assert!(!config.log_statements);
        assert!(!config.report.enabled);
        assert!(config.record_empty_sessions);
    }
}

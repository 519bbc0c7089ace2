//! PostgreSQL option lists and `postgresql.conf` rendering

use serde::{Deserialize, Serialize};

/// Header written at the top of every rendered configuration file
pub const CONFIG_HEADER: &str = "# Auto Generated PostgreSQL Configuration";

/// File name PostgreSQL logs to when [`logging_config`] is used.
/// Relative to `<data_dir>/pg_log`.
pub const TEST_LOG_FILE_NAME: &str = "postgresql-tests.log";

/// A PostgreSQL option.
///
/// Used both for `postgresql.conf` entries, rendered as
///
/// ```text
/// key = value # comment
/// ```
///
/// and for command line arguments, where `key` is the flag and `value` its
/// argument (omitted when empty).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOpt {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub comment: String,
}

impl ConfigOpt {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            comment: String::new(),
        }
    }

    /// A bare command line flag with no argument
    pub fn flag(key: impl Into<String>) -> Self {
        Self::new(key, "")
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

/// Render options into `postgresql.conf` text. Order is preserved.
pub fn render_config(opts: &[ConfigOpt]) -> String {
    let mut out = String::with_capacity(CONFIG_HEADER.len() + 1 + opts.len() * 32);
    out.push_str(CONFIG_HEADER);
    out.push('\n');
    for opt in opts {
        out.push_str(&opt.key);
        out.push_str(" = ");
        out.push_str(&opt.value);
        if !opt.comment.is_empty() {
            out.push_str(" # ");
            out.push_str(&opt.comment);
        }
        out.push('\n');
    }
    out
}

/// Flatten options into an argument vector
pub fn make_args(opts: &[ConfigOpt]) -> Vec<String> {
    let mut args = Vec::with_capacity(opts.len() * 2);
    for opt in opts {
        args.push(opt.key.clone());
        if !opt.value.is_empty() {
            args.push(opt.value.clone());
        }
    }
    args
}

/// Sane defaults for a cluster used in unit tests
pub fn test_config() -> Vec<ConfigOpt> {
    vec![
        ConfigOpt::new("port", "5432")
            .with_comment("Use the default port since we disable TCP listen"),
        ConfigOpt::new("listen_addresses", "''").with_comment(
            "Do not listen on TCP. Instead use a unix domain socket for communication",
        ),
        ConfigOpt::new("ssl", "false").with_comment("No ssl for unit tests"),
        ConfigOpt::new("shared_buffers", "10MB")
            .with_comment("Smaller shared buffers to reduce resource usage"),
        ConfigOpt::new("fsync", "off")
            .with_comment("Ignore system crashes, since tests will fail in that event anyway"),
        ConfigOpt::new("full_page_writes", "off").with_comment("Useless without fsync"),
    ]
}

/// Logging defaults that make test failures easier to debug
pub fn logging_config() -> Vec<ConfigOpt> {
    vec![
        ConfigOpt::new("logging_collector", "on")
            .with_comment("Collecting query logs can be useful to debug tests"),
        ConfigOpt::new("log_directory", "'pg_log'")
            .with_comment("Newer servers default to 'log'"),
        ConfigOpt::new("log_filename", TEST_LOG_FILE_NAME)
            .with_comment("Well known file name to make log parsing easy in tests"),
        ConfigOpt::new("log_statement", "all").with_comment("Log all statements"),
    ]
}

/// [`test_config`] followed by [`logging_config`]
pub fn test_config_with_logging() -> Vec<ConfigOpt> {
    let mut opts = test_config();
    opts.extend(logging_config());
    opts
}

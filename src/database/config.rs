use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_postgres::config::SslMode as PgSslMode;

use crate::error::{Error, Result};

/// Default server port
pub const DEFAULT_PORT: u16 = 5432;
/// Default timeout for establishing a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on a single engine call
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time a promotion may take before it is reported as failed
pub const DEFAULT_PROMOTE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default application name reported to the server
pub const DEFAULT_APPLICATION_NAME: &str = "rdbha";

const DEFAULT_MAX_OPEN_CONNS: u32 = 10;
const DEFAULT_MAX_IDLE_CONNS: u32 = 5;
const DEFAULT_CONN_MAX_LIFETIME: Duration = Duration::from_secs(3600);
const DEFAULT_CONN_MAX_IDLE_TIME: Duration = Duration::from_secs(30 * 60);

/// Placeholder written instead of credentials in anything meant for logs
pub const MASKED_PASSWORD: &str = "********";

/// TLS negotiation mode, using the libpq names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Plaintext only
    #[default]
    Disable,
    /// Plaintext preferred, TLS accepted
    Allow,
    /// TLS preferred, plaintext accepted
    Prefer,
    /// TLS required, server certificate not verified
    Require,
    /// TLS required, certificate chain verified
    VerifyCa,
    /// TLS required, certificate chain and host name verified
    VerifyFull,
}

impl SslMode {
    /// The libpq spelling of this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }

    /// Whether the server certificate chain is checked against trusted roots
    pub fn verifies_chain(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }

    /// Whether the server certificate must match the host name
    pub fn verifies_hostname(&self) -> bool {
        matches!(self, SslMode::VerifyFull)
    }

    /// tokio-postgres only knows disable/prefer/require; `allow` is treated as `prefer`.
    pub(crate) fn to_driver(self) -> PgSslMode {
        match self {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Allow | SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => PgSslMode::Require,
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(Error::config(format!("unknown sslmode '{}'", other))),
        }
    }
}

/// Connection settings for one managed database node
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Host name or IP address of the server
    pub host: String,

    /// Server port, 0 means [`DEFAULT_PORT`]
    pub port: u16,

    /// Login role
    pub user: String,

    /// Login password, empty when the server does not ask for one
    pub password: String,

    /// Database to connect to
    pub dbname: String,

    /// TLS negotiation mode
    pub ssl_mode: SslMode,

    /// Client certificate (PEM)
    pub ssl_cert_path: Option<String>,

    /// Client private key (PEM)
    pub ssl_key_path: Option<String>,

    /// Trusted root certificates (PEM); the bundled web PKI roots are used when absent
    pub ssl_root_cert_path: Option<String>,

    /// Bound on establishing a live connection
    pub connect_timeout: Duration,

    /// Bound on any single engine call
    pub operation_timeout: Duration,

    /// How long a waiting promotion may take
    pub promote_timeout: Duration,

    /// Maximum number of pooled connections
    pub max_open_conns: u32,

    /// Maximum number of idle pooled connections
    pub max_idle_conns: u32,

    /// Maximum lifetime of a pooled connection
    pub conn_max_lifetime: Duration,

    /// Maximum idle time of a pooled connection
    pub conn_max_idle_time: Duration,

    /// Name reported to the server in `application_name`.
    ///
    /// It is also the tag a standby reports to its upstream, so it must be unique per
    /// node. When left at the default, the adapter reports `host_port` upstream instead.
    pub application_name: String,

    /// Replay lag above which a standby is reported unhealthy
    pub max_replication_lag: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            user: String::new(),
            password: String::new(),
            dbname: String::new(),
            ssl_mode: SslMode::default(),
            ssl_cert_path: None,
            ssl_key_path: None,
            ssl_root_cert_path: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            promote_timeout: DEFAULT_PROMOTE_TIMEOUT,
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            conn_max_lifetime: DEFAULT_CONN_MAX_LIFETIME,
            conn_max_idle_time: DEFAULT_CONN_MAX_IDLE_TIME,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            max_replication_lag: None,
        }
    }
}

// Hand-written so the password never reaches a log line through `{:?}`.
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &MASKED_PASSWORD)
            .field("dbname", &self.dbname)
            .field("ssl_mode", &self.ssl_mode)
            .field("ssl_cert_path", &self.ssl_cert_path)
            .field("ssl_key_path", &self.ssl_key_path)
            .field("ssl_root_cert_path", &self.ssl_root_cert_path)
            .field("connect_timeout", &self.connect_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .field("promote_timeout", &self.promote_timeout)
            .field("max_open_conns", &self.max_open_conns)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("conn_max_lifetime", &self.conn_max_lifetime)
            .field("conn_max_idle_time", &self.conn_max_idle_time)
            .field("application_name", &self.application_name)
            .field("max_replication_lag", &self.max_replication_lag)
            .finish()
    }
}

impl DatabaseConfig {
    /// Creates a configuration for the given node with defaults for everything else
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        dbname: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            dbname: dbname.into(),
            ..Default::default()
        }
    }

    /// Validates the configuration and fills unset numeric fields with defaults
    pub fn validate(&mut self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("database host is required"));
        }
        if self.user.trim().is_empty() {
            return Err(Error::config("database user is required"));
        }
        if self.dbname.trim().is_empty() {
            return Err(Error::config("database dbname is required"));
        }

        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        if self.connect_timeout.is_zero() {
            self.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        }
        if self.operation_timeout.is_zero() {
            self.operation_timeout = DEFAULT_OPERATION_TIMEOUT;
        }
        if self.promote_timeout.is_zero() {
            self.promote_timeout = DEFAULT_PROMOTE_TIMEOUT;
        }
        if self.max_open_conns == 0 {
            self.max_open_conns = DEFAULT_MAX_OPEN_CONNS;
        }
        if self.max_idle_conns == 0 {
            self.max_idle_conns = DEFAULT_MAX_IDLE_CONNS;
        }
        self.max_idle_conns = self.max_idle_conns.min(self.max_open_conns);
        if self.conn_max_lifetime.is_zero() {
            self.conn_max_lifetime = DEFAULT_CONN_MAX_LIFETIME;
        }
        if self.conn_max_idle_time.is_zero() {
            self.conn_max_idle_time = DEFAULT_CONN_MAX_IDLE_TIME;
        }

        match (&self.ssl_cert_path, &self.ssl_key_path) {
            (Some(_), None) => {
                return Err(Error::config("ssl_cert_path is set but ssl_key_path is missing"))
            }
            (None, Some(_)) => {
                return Err(Error::config("ssl_key_path is set but ssl_cert_path is missing"))
            }
            _ => {}
        }

        Ok(())
    }

    /// Stable `host:port` address of the node
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Key/value connection descriptor including the password.
    ///
    /// Never log this; use [`DatabaseConfig::masked_dsn`].
    pub fn dsn(&self) -> String {
        self.render_dsn(Some(self.password.as_str()))
    }

    /// Connection descriptor with the password replaced by [`MASKED_PASSWORD`]
    pub fn masked_dsn(&self) -> String {
        self.render_dsn(None)
    }

    /// Whole seconds for the descriptor, rounded up; libpq reads 0 as "wait forever"
    fn connect_timeout_secs(&self) -> u64 {
        let secs = self.connect_timeout.as_secs();
        let secs = if self.connect_timeout.subsec_nanos() > 0 { secs + 1 } else { secs };
        secs.max(1)
    }

    fn render_dsn(&self, password: Option<&str>) -> String {
        let mut parts = vec![
            format!("host={}", quote_value(&self.host)),
            format!("port={}", self.port),
            format!("user={}", quote_value(&self.user)),
            format!("dbname={}", quote_value(&self.dbname)),
            format!("sslmode={}", self.ssl_mode),
            format!("connect_timeout={}", self.connect_timeout_secs()),
        ];
        if !self.password.is_empty() {
            match password {
                Some(pw) => parts.push(format!("password={}", quote_value(pw))),
                None => parts.push(format!("password={}", MASKED_PASSWORD)),
            }
        }
        if let Some(path) = &self.ssl_cert_path {
            parts.push(format!("sslcert={}", quote_value(path)));
        }
        if let Some(path) = &self.ssl_key_path {
            parts.push(format!("sslkey={}", quote_value(path)));
        }
        if let Some(path) = &self.ssl_root_cert_path {
            parts.push(format!("sslrootcert={}", quote_value(path)));
        }
        if !self.application_name.is_empty() {
            parts.push(format!("application_name={}", quote_value(&self.application_name)));
        }
        parts.join(" ")
    }

    /// Builds the driver configuration
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .connect_timeout(self.connect_timeout)
            .ssl_mode(self.ssl_mode.to_driver());
        if !self.password.is_empty() {
            pg_config.password(&self.password);
        }
        if !self.application_name.is_empty() {
            pg_config.application_name(&self.application_name);
        }
        pg_config
    }
}

/// Quotes a descriptor value the way libpq expects when it is empty or contains
/// whitespace, quotes or backslashes.
pub(crate) fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

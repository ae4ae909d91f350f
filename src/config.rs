//! Connection configuration.
//!
//! [`ConnectionConfig`] carries everything needed to reach and
//! authenticate against a server. The charset is configured by name and
//! must resolve through [`charset::id_for`] before a connection is
//! created.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::messages::frontend::capabilities;

/// SSL negotiation policy.
///
/// The policy travels with the configuration for the TLS collaborator to
/// act on; this driver itself does not negotiate TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslPolicy {
    /// Plain TCP only
    #[default]
    Disable,
    /// Use TLS if the server offers it
    Prefer,
    /// Fail unless TLS is negotiated
    Require,
}

/// Character set name to collation id mapping.
pub mod charset {
    pub const LATIN1: u8 = 8;
    pub const UTF8: u8 = 33;
    pub const ASCII: u8 = 11;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4: u8 = 45;

    /// Resolves a configured charset name to its collation id.
    ///
    /// Names are matched the way the server does: ASCII
    /// case-insensitively.
    pub fn id_for(name: &str) -> Option<u8> {
        let name = name.to_ascii_lowercase();
        match name.as_str() {
            "latin1" => Some(LATIN1),
            "utf8" | "utf8mb3" => Some(UTF8),
            "ascii" => Some(ASCII),
            "binary" => Some(BINARY),
            "utf8mb4" => Some(UTF8MB4),
            _ => None,
        }
    }
}

/// Configuration for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default 3306)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password, absent for passwordless accounts
    pub password: Option<String>,
    /// Default schema selected at connect time
    pub database: Option<String>,
    /// Character set name; must resolve through [`charset::id_for`]
    pub charset: String,
    /// Per-query deadline; `None` or zero disables timeouts
    pub query_timeout: Option<Duration>,
    /// SSL policy for the TLS collaborator
    pub ssl: SslPolicy,
    /// Sent to the server as the `program_name` connection attribute
    pub application_name: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            database: None,
            charset: "utf8mb4".to_string(),
            query_timeout: None,
            ssl: SslPolicy::default(),
            application_name: None,
        }
    }
}

impl ConnectionConfig {
    /// Creates a configuration for the given user with defaults for
    /// everything else.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn ssl(mut self, policy: SslPolicy) -> Self {
        self.ssl = policy;
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// The `host:port` pair for the TCP connect.
    pub fn socket_addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    /// Resolves the configured charset, failing construction when the
    /// name is unknown.
    pub fn charset_id(&self) -> Result<u8> {
        charset::id_for(&self.charset).ok_or_else(|| Error::UnknownCharset(self.charset.clone()))
    }

    /// The effective per-query deadline, if timeouts are enabled.
    pub fn effective_query_timeout(&self) -> Option<Duration> {
        self.query_timeout.filter(|d| !d.is_zero())
    }

    /// Capability flags this configuration asks for.
    pub fn capability_flags(&self) -> u32 {
        let mut flags = capabilities::BASE_CLIENT_FLAGS;
        if self.database.is_some() {
            flags |= capabilities::CLIENT_CONNECT_WITH_DB;
        }
        if self.ssl != SslPolicy::Disable {
            flags |= capabilities::CLIENT_SSL;
        }
        if self.application_name.is_some() {
            flags |= capabilities::CLIENT_CONNECT_ATTRS;
        }
        flags
    }

    /// Connection attributes sent under `CLIENT_CONNECT_ATTRS`.
    pub fn connect_attributes(&self) -> Vec<(String, String)> {
        match &self.application_name {
            Some(name) => vec![("program_name".to_string(), name.clone())],
            None => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ConnectionConfig::new("app")
            .host("db.example.com")
            .port(3307)
            .password("secret")
            .database("orders")
            .charset("utf8")
            .query_timeout(Duration::from_millis(250))
            .application_name("billing");

        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.port, 3307);
        assert_eq!(config.user, "app");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.database.as_deref(), Some("orders"));
        assert_eq!(config.charset_id().unwrap(), charset::UTF8);
        assert_eq!(
            config.effective_query_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            config.connect_attributes(),
            vec![("program_name".to_string(), "billing".to_string())]
        );
    }

    #[test]
    fn test_charset_resolution() {
        assert_eq!(charset::id_for("utf8mb4"), Some(charset::UTF8MB4));
        assert_eq!(charset::id_for("UTF8MB4"), Some(charset::UTF8MB4));
        assert_eq!(charset::id_for("latin1"), Some(charset::LATIN1));
        assert_eq!(charset::id_for("klingon"), None);

        let config = ConnectionConfig::new("app").charset("klingon");
        assert!(matches!(
            config.charset_id(),
            Err(Error::UnknownCharset(name)) if name == "klingon"
        ));
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let config = ConnectionConfig::new("app").query_timeout(Duration::ZERO);
        assert_eq!(config.effective_query_timeout(), None);
    }

    #[test]
    fn test_capability_flags() {
        use crate::messages::frontend::capabilities::*;

        let config = ConnectionConfig::new("app");
        let flags = config.capability_flags();
        assert!(flags & CLIENT_PROTOCOL_41 != 0);
        assert!(flags & CLIENT_SECURE_CONNECTION != 0);
        assert!(flags & CLIENT_PLUGIN_AUTH != 0);
        assert!(flags & CLIENT_CONNECT_WITH_DB == 0);
        assert!(flags & CLIENT_DEPRECATE_EOF == 0);

        let flags = config.database("x").capability_flags();
        assert!(flags & CLIENT_CONNECT_WITH_DB != 0);
    }
}

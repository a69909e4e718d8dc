//! Connection-parameter snapshot. An `Account` is assembled up front,
//! validated at the setters, and copied into the connection at connect
//! time; the handle never mutates it afterwards.

use std::fmt;

use crate::conn::Connection;
use crate::consts::CapabilityFlags;
use crate::error::{Error, Result};

/// SSL bundle: paths to PEM material plus an optional cipher preference,
/// mirroring the classic `(key, cert, ca, capath, cipher)` tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslOpts {
    key: Option<String>,
    cert: Option<String>,
    ca: Option<String>,
    ca_path: Option<String>,
    cipher: Option<String>,
}

impl SslOpts {
    pub fn new() -> SslOpts {
        SslOpts::default()
    }

    pub fn with_key(mut self, path: impl Into<String>) -> SslOpts {
        self.key = Some(path.into());
        self
    }

    pub fn with_cert(mut self, path: impl Into<String>) -> SslOpts {
        self.cert = Some(path.into());
        self
    }

    pub fn with_ca(mut self, path: impl Into<String>) -> SslOpts {
        self.ca = Some(path.into());
        self
    }

    pub fn with_ca_path(mut self, path: impl Into<String>) -> SslOpts {
        self.ca_path = Some(path.into());
        self
    }

    pub fn with_cipher(mut self, cipher: impl Into<String>) -> SslOpts {
        self.cipher = Some(cipher.into());
        self
    }

    pub fn key_file(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn cert_file(&self) -> Option<&str> {
        self.cert.as_deref()
    }

    pub fn ca_file(&self) -> Option<&str> {
        self.ca.as_deref()
    }

    pub fn ca_path(&self) -> Option<&str> {
        self.ca_path.as_deref()
    }

    pub fn cipher(&self) -> Option<&str> {
        self.cipher.as_deref()
    }
}

/// Connection parameters: endpoint, credentials, client flags, SSL bundle,
/// session options and the autocommit toggle.
#[derive(Clone)]
pub struct Account {
    host: String,
    port: u16,
    user: String,
    password: String,
    database: String,
    socket: Option<String>,
    flags: CapabilityFlags,
    ssl: Option<SslOpts>,
    options: Vec<(String, String)>,
    autocommit: bool,
}

impl Default for Account {
    fn default() -> Account {
        Account {
            host: String::from("localhost"),
            port: 3306,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            socket: None,
            flags: CapabilityFlags::empty(),
            ssl: None,
            options: Vec::new(),
            autocommit: true,
        }
    }
}

impl Account {
    pub fn new() -> Account {
        Account::default()
    }

    /// Accepts `host` or `host:port`; a trailing numeric port overrides the
    /// configured one. IPv6 literals pass through untouched.
    pub fn set_host(&mut self, host: &str) -> Result<()> {
        if let Some((h, p)) = host.rsplit_once(':') {
            let looks_like_port =
                !h.is_empty() && !h.contains(':') && !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
            if looks_like_port {
                self.set_port(p.parse::<u32>().unwrap_or(u32::MAX))?;
                self.host = h.to_string();
                return Ok(());
            }
        }
        self.host = host.to_string();
        Ok(())
    }

    pub fn set_port(&mut self, port: u32) -> Result<()> {
        if port > u32::from(u16::MAX) {
            return Err(Error::Configuration(format!(
                "port {port} outside the 16-bit range"
            )));
        }
        self.port = port as u16;
        Ok(())
    }

    pub fn set_user(&mut self, user: &str) {
        self.user = user.to_string();
    }

    pub fn set_password(&mut self, password: &str) {
        self.password = password.to_string();
    }

    pub fn set_database(&mut self, database: &str) {
        self.database = database.to_string();
    }

    pub fn set_socket(&mut self, path: Option<&str>) {
        self.socket = path.map(str::to_string);
    }

    /// Raw client-capability bits OR-ed into the handshake request.
    pub fn set_flags(&mut self, flags: CapabilityFlags) {
        self.flags = flags;
    }

    /// Toggles a client capability by its option name. Unknown names are
    /// rejected rather than ignored.
    pub fn set_client_option(&mut self, name: &str, on: bool) -> Result<()> {
        let flag = match name {
            "compress" => CapabilityFlags::CLIENT_COMPRESS,
            "found_rows" => CapabilityFlags::CLIENT_FOUND_ROWS,
            "ignore_space" => CapabilityFlags::CLIENT_IGNORE_SPACE,
            "interactive" => CapabilityFlags::CLIENT_INTERACTIVE,
            "local_infile" => CapabilityFlags::CLIENT_LOCAL_FILES,
            "multi_statements" => CapabilityFlags::CLIENT_MULTI_STATEMENTS,
            "multi_results" => CapabilityFlags::CLIENT_MULTI_RESULTS,
            "no_schema" => CapabilityFlags::CLIENT_NO_SCHEMA,
            _ => return Err(Error::Value(format!("unknown client option '{name}'"))),
        };
        self.flags.set(flag, on);
        Ok(())
    }

    /// Session variable applied as `SET OPTION key=value` at connect time.
    /// Insertion order is preserved; re-setting a key overwrites in place.
    pub fn set_option(&mut self, key: &str, value: &str) {
        match self.options.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.options.push((key.to_string(), value.to_string())),
        }
    }

    pub fn set_ssl(&mut self, ssl: Option<SslOpts>) {
        self.ssl = ssl;
    }

    pub fn set_autocommit(&mut self, autocommit: bool) {
        self.autocommit = autocommit;
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn socket(&self) -> Option<&str> {
        self.socket.as_deref()
    }

    pub fn flags(&self) -> CapabilityFlags {
        self.flags
    }

    pub fn ssl(&self) -> Option<&SslOpts> {
        self.ssl.as_ref()
    }

    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    /// Opens a connection from this snapshot.
    pub fn connect(&self) -> Result<Connection> {
        Connection::connect(self)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("socket", &self.socket)
            .field("flags", &self.flags)
            .field("ssl", &self.ssl)
            .field("options", &self.options)
            .field("autocommit", &self.autocommit)
            .finish()
    }
}

//! The connection handle: transport selection, handshake and
//! authentication, session setup, and the text-protocol commands. Statement
//! and result handles share the inner state through `Rc<RefCell<_>>`, so a
//! live child keeps the session alive.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use log::{debug, trace, warn};

use crate::account::Account;
use crate::consts::{
    CapabilityFlags, StatusFlags, COM_PING, COM_QUERY, COM_QUIT, COM_STMT_CLOSE,
    UTF8MB4_GENERAL_CI,
};
use crate::error::{cr, Error, Result, ServerError};
use crate::proto::auth::scramble_for_plugin;
use crate::proto::codec::ParseBuf;
use crate::proto::handshake::{build_handshake_response, parse_auth_switch, parse_handshake};
use crate::proto::packet::PacketStream;
use crate::proto::packets::{is_eof, parse_column_definition, parse_eof, parse_err, parse_ok};
use crate::proto::packets::{EofPacket, OkPacket};
use crate::result::ResultSet;
use crate::stmt::Statement;
use crate::stream::Stream;
use crate::Column;

/// Advertised maximum client packet, 16 MiB.
const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// First packet of a command response, after OK/ERR classification.
pub(crate) enum Response {
    Ok(OkPacket),
    /// A result set follows; the value is the column count.
    ResultSet(usize),
}

pub(crate) struct Conn {
    stream: Option<PacketStream<Stream>>,
    pub(crate) capabilities: CapabilityFlags,
    pub(crate) status: StatusFlags,
    pub(crate) last_error: Option<ServerError>,
    pub(crate) affected_rows: u64,
    pub(crate) last_insert_id: u64,
    charset: String,
    connection_id: u32,
    server_version: String,
}

impl Conn {
    pub(crate) fn send_command(&mut self, cmd: u8, body: &[u8]) -> Result<()> {
        self.last_error = None;
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(Error::gone()),
        };
        stream.reset_seq();
        let mut packet = Vec::with_capacity(1 + body.len());
        packet.push(cmd);
        packet.extend_from_slice(body);
        trace!("command 0x{cmd:02x}, {} byte body", body.len());
        stream.write_packet(&packet)
    }

    pub(crate) fn read_packet(&mut self) -> Result<Vec<u8>> {
        match self.stream.as_mut() {
            Some(s) => s.read_packet(),
            None => Err(Error::gone()),
        }
    }

    fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        match self.stream.as_mut() {
            Some(s) => s.write_packet(payload),
            None => Err(Error::gone()),
        }
    }

    fn note_ok(&mut self, ok: &OkPacket) {
        self.status = ok.status;
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        if ok.warnings > 0 {
            debug!("server reported {} warning(s)", ok.warnings);
        }
    }

    fn note_eof(&mut self, eof: &EofPacket) {
        self.status = eof.status;
        if eof.warnings > 0 {
            debug!("result carried {} warning(s)", eof.warnings);
        }
    }

    pub(crate) fn record_error(&mut self, err: ServerError) -> ServerError {
        self.last_error = Some(err.clone());
        err
    }

    /// Reads the first packet of a command response. Native errors are
    /// recorded on the session and wrapped with the caller's error class.
    pub(crate) fn read_response(&mut self, wrap: fn(ServerError) -> Error) -> Result<Response> {
        let payload = self.read_packet()?;
        match payload.first().copied() {
            Some(0x00) => {
                let ok = parse_ok(&payload)?;
                self.note_ok(&ok);
                Ok(Response::Ok(ok))
            }
            Some(0xff) => {
                let err = parse_err(&payload)?;
                Err(wrap(self.record_error(err)))
            }
            Some(0xfb) => self.refuse_local_infile(&payload, wrap),
            Some(_) => {
                let mut b = ParseBuf(&payload);
                Ok(Response::ResultSet(b.eat_lenenc_int()? as usize))
            }
            None => Err(Error::malformed("empty response packet")),
        }
    }

    /// A LOCAL INFILE request cannot be served; end the transfer with an
    /// empty packet so the stream stays usable, then report failure.
    fn refuse_local_infile(
        &mut self,
        request: &[u8],
        wrap: fn(ServerError) -> Error,
    ) -> Result<Response> {
        let filename = String::from_utf8_lossy(&request[1..]).into_owned();
        debug!("refusing LOCAL INFILE request for '{filename}'");
        self.write_packet(&[])?;
        let reply = self.read_packet()?;
        let err = if reply.first() == Some(&0xff) {
            parse_err(&reply)?
        } else {
            ServerError::client(
                cr::CR_MALFORMED_PACKET,
                format!("LOCAL INFILE '{filename}' is not supported"),
            )
        };
        Err(wrap(self.record_error(err)))
    }

    /// Reads `count` column definitions plus the EOF that closes the block.
    pub(crate) fn read_columns(
        &mut self,
        count: usize,
        wrap: fn(ServerError) -> Error,
    ) -> Result<Vec<Column>> {
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.read_packet()?;
            if payload.first() == Some(&0xff) {
                let err = parse_err(&payload)?;
                return Err(wrap(self.record_error(err)));
            }
            columns.push(parse_column_definition(&payload)?);
        }
        let payload = self.read_packet()?;
        if !is_eof(&payload) {
            return Err(Error::malformed("missing EOF after column definitions"));
        }
        let eof = parse_eof(&payload)?;
        self.note_eof(&eof);
        Ok(columns)
    }

    /// Buffers row packets until the EOF that ends the set. Works for both
    /// the text and the binary protocol; the packets are kept raw.
    pub(crate) fn collect_rows(
        &mut self,
        wrap: fn(ServerError) -> Error,
    ) -> Result<(Vec<Vec<u8>>, EofPacket)> {
        let mut rows = Vec::new();
        loop {
            let payload = self.read_packet()?;
            if is_eof(&payload) {
                let eof = parse_eof(&payload)?;
                self.note_eof(&eof);
                return Ok((rows, eof));
            }
            if payload.first() == Some(&0xff) {
                let err = parse_err(&payload)?;
                return Err(wrap(self.record_error(err)));
            }
            rows.push(payload);
        }
    }

    /// Reads and discards row packets until EOF.
    pub(crate) fn skip_rows(&mut self, wrap: fn(ServerError) -> Error) -> Result<EofPacket> {
        loop {
            let payload = self.read_packet()?;
            if is_eof(&payload) {
                let eof = parse_eof(&payload)?;
                self.note_eof(&eof);
                return Ok(eof);
            }
            if payload.first() == Some(&0xff) {
                let err = parse_err(&payload)?;
                return Err(wrap(self.record_error(err)));
            }
        }
    }

    /// Consumes every result of the pending command, discarding rows, and
    /// sums the affected-row counts the OK packets report.
    pub(crate) fn drain_results(&mut self, wrap: fn(ServerError) -> Error) -> Result<u64> {
        let mut affected = 0u64;
        loop {
            let more = match self.read_response(wrap)? {
                Response::Ok(ok) => {
                    affected = affected.saturating_add(ok.affected_rows);
                    ok.more_results()
                }
                Response::ResultSet(n) => {
                    self.read_columns(n, wrap)?;
                    self.skip_rows(wrap)?.more_results()
                }
            };
            if !more {
                return Ok(affected);
            }
        }
    }

    /// Discards any results still queued behind the one already consumed.
    pub(crate) fn drain_remaining(
        &mut self,
        mut more: bool,
        wrap: fn(ServerError) -> Error,
    ) -> Result<()> {
        while more {
            more = match self.read_response(wrap)? {
                Response::Ok(ok) => ok.more_results(),
                Response::ResultSet(n) => {
                    self.read_columns(n, wrap)?;
                    self.skip_rows(wrap)?.more_results()
                }
            };
        }
        Ok(())
    }

    fn send_query(&mut self, query: &str) -> Result<()> {
        if query.is_empty() {
            return Err(Error::Value(String::from("query string is empty")));
        }
        trace!("query: {query}");
        self.send_command(COM_QUERY, query.as_bytes())
    }

    /// Session-setup statement; any failure aborts the connect.
    fn run_setup(&mut self, sql: &str) -> Result<()> {
        debug!("session setup: {sql}");
        self.send_query(sql)?;
        match self.read_response(Error::Connection)? {
            Response::Ok(ok) => self.drain_remaining(ok.more_results(), Error::Connection),
            Response::ResultSet(n) => {
                self.read_columns(n, Error::Connection)?;
                let more = self.skip_rows(Error::Connection)?.more_results();
                self.drain_remaining(more, Error::Connection)
            }
        }
    }

    /// Fire-and-forget statement teardown. No response follows, and the
    /// recorded diagnostic stays as it was.
    pub(crate) fn close_statement(&mut self, id: u32) {
        if let Some(stream) = self.stream.as_mut() {
            trace!("closing statement {id}");
            stream.reset_seq();
            let mut packet = Vec::with_capacity(5);
            packet.push(COM_STMT_CLOSE);
            packet.extend_from_slice(&id.to_le_bytes());
            let _ = stream.write_packet(&packet);
        }
    }

    pub(crate) fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            trace!("closing connection {}", self.connection_id);
            stream.reset_seq();
            let _ = stream.write_packet(&[COM_QUIT]);
        }
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}

/// Capabilities this client asks for: the fixed set it always speaks plus
/// the account's extra flags, minus bits the implementation cannot honor.
fn client_capabilities(account: &Account) -> CapabilityFlags {
    let mut caps = CapabilityFlags::CLIENT_PROTOCOL_41
        | CapabilityFlags::CLIENT_LONG_PASSWORD
        | CapabilityFlags::CLIENT_LONG_FLAG
        | CapabilityFlags::CLIENT_TRANSACTIONS
        | CapabilityFlags::CLIENT_SECURE_CONNECTION
        | CapabilityFlags::CLIENT_PLUGIN_AUTH
        | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CapabilityFlags::CLIENT_MULTI_STATEMENTS
        | CapabilityFlags::CLIENT_MULTI_RESULTS
        | CapabilityFlags::CLIENT_PS_MULTI_RESULTS;
    if !account.database().is_empty() {
        caps |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
    }
    let mut extra = account.flags();
    if extra.contains(CapabilityFlags::CLIENT_COMPRESS) {
        warn!("wire compression is not implemented; ignoring the compress flag");
    }
    extra -= CapabilityFlags::CLIENT_COMPRESS
        | CapabilityFlags::CLIENT_SSL
        | CapabilityFlags::CLIENT_DEPRECATE_EOF;
    caps | extra
}

#[cfg_attr(not(feature = "tls"), allow(unused_variables, unused_mut))]
fn start_tls(
    mut stream: PacketStream<Stream>,
    caps: CapabilityFlags,
    host: &str,
    ssl: &crate::account::SslOpts,
) -> Result<PacketStream<Stream>> {
    #[cfg(feature = "tls")]
    {
        use crate::proto::handshake::build_ssl_request;
        stream.write_packet(&build_ssl_request(caps, MAX_PACKET_SIZE, UTF8MB4_GENERAL_CI))?;
        let (raw, seq) = stream.into_parts();
        let upgraded = crate::tls::upgrade(raw, host, ssl)?;
        Ok(PacketStream::from_parts(upgraded, seq))
    }
    #[cfg(not(feature = "tls"))]
    Err(Error::Connection(ServerError::client(
        cr::CR_SSL_CONNECTION_ERROR,
        "TLS requested but this build does not include the `tls` feature",
    )))
}

/// A session handle. Cheap to clone; all clones share one wire session.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<Conn>>,
}

impl Connection {
    pub(crate) fn connect(account: &Account) -> Result<Connection> {
        let transport = match account.socket() {
            #[cfg(unix)]
            Some(path) if account.host().is_empty() || account.host() == "localhost" => {
                Stream::connect_unix(path)?
            }
            _ => Stream::connect_tcp(account.host(), account.port())?,
        };
        let mut stream = PacketStream::new(transport);

        let first = stream.read_packet()?;
        if first.first() == Some(&0xff) {
            return Err(Error::Connection(parse_err(&first)?));
        }
        let handshake = parse_handshake(&first)?;
        debug!(
            "server {} protocol v{} (connection id {}), auth plugin '{}'",
            handshake.server_version,
            handshake.protocol_version,
            handshake.connection_id,
            handshake.auth_plugin
        );
        trace!(
            "server collation {}, status {:?}",
            handshake.default_collation,
            handshake.status
        );
        if !handshake
            .capabilities
            .contains(CapabilityFlags::CLIENT_PROTOCOL_41)
        {
            return Err(Error::Connection(ServerError::client(
                cr::CR_CONNECTION_ERROR,
                "server does not support the 4.1 protocol",
            )));
        }

        let mut caps = client_capabilities(account) & handshake.capabilities;
        let secure = if let Some(ssl) = account.ssl() {
            if !handshake.capabilities.contains(CapabilityFlags::CLIENT_SSL) {
                return Err(Error::Connection(ServerError::client(
                    cr::CR_SSL_CONNECTION_ERROR,
                    "SSL was required but the server does not support it",
                )));
            }
            caps |= CapabilityFlags::CLIENT_SSL;
            stream = start_tls(stream, caps, account.host(), ssl)?;
            true
        } else {
            false
        };

        let plugin = handshake.auth_plugin.clone();
        let scramble = scramble_for_plugin(&plugin, &handshake.nonce, account.password().as_bytes())
            .map_err(plugin_err)?;
        let response = build_handshake_response(
            caps,
            MAX_PACKET_SIZE,
            UTF8MB4_GENERAL_CI,
            account.user(),
            scramble.as_deref().unwrap_or_default(),
            account.database(),
            &plugin,
        );
        stream.write_packet(&response)?;
        let ok = authenticate(&mut stream, account.password(), secure)?;

        let mut conn = Conn {
            stream: Some(stream),
            capabilities: caps,
            status: ok.status,
            last_error: None,
            affected_rows: 0,
            last_insert_id: 0,
            charset: String::from("utf8mb4"),
            connection_id: handshake.connection_id,
            server_version: handshake.server_version,
        };

        for (name, value) in account.options() {
            conn.run_setup(&format!("SET OPTION {name}={value}"))?;
        }
        conn.run_setup(&format!(
            "SET autocommit={}",
            if account.autocommit() { 1 } else { 0 }
        ))?;

        Ok(Connection {
            inner: Rc::new(RefCell::new(conn)),
        })
    }

    /// Runs a query, drains every result it produces with rows discarded,
    /// and returns the summed affected-row count.
    pub fn execute(&self, query: &str) -> Result<u64> {
        let mut conn = self.inner.borrow_mut();
        conn.send_query(query)?;
        conn.drain_results(Error::Query)
    }

    /// Runs a query and materializes its first result set; any further
    /// results in the batch are drained and discarded. A query that
    /// produces no result set at all is an error.
    pub fn query(&self, query: &str) -> Result<ResultSet> {
        let mut conn = self.inner.borrow_mut();
        conn.send_query(query)?;
        match conn.read_response(Error::Query)? {
            Response::ResultSet(n) => {
                let columns = conn.read_columns(n, Error::Query)?;
                let (rows, eof) = conn.collect_rows(Error::Query)?;
                conn.drain_remaining(eof.more_results(), Error::Query)?;
                drop(conn);
                ResultSet::direct(Rc::clone(&self.inner), columns, rows)
            }
            Response::Ok(ok) => {
                conn.drain_remaining(ok.more_results(), Error::Query)?;
                let err = conn.record_error(ServerError::client(
                    cr::CR_NO_RESULT_SET,
                    "the statement returned no result set",
                ));
                Err(Error::Query(err))
            }
        }
    }

    /// Runs an INSERT-like query and returns the auto-generated id the
    /// session reports once every result has been drained.
    pub fn insert(&self, query: &str) -> Result<u64> {
        let mut conn = self.inner.borrow_mut();
        conn.send_query(query)?;
        conn.drain_results(Error::Query)?;
        Ok(conn.last_insert_id)
    }

    /// Prepares a statement with `?` placeholders for later binding.
    pub fn prepare(&self, query: &str) -> Result<Statement> {
        Statement::prepare(Rc::clone(&self.inner), query)
    }

    /// Doubles up the characters MySQL string literals treat specially.
    /// Safe for any UTF-8 input; continuation bytes never collide with the
    /// escaped set.
    pub fn escape_string(&self, input: &str) -> String {
        escape_string(input)
    }

    pub fn ping(&self) -> Result<()> {
        let mut conn = self.inner.borrow_mut();
        conn.send_command(COM_PING, &[])?;
        match conn.read_response(Error::Connection)? {
            Response::Ok(_) => Ok(()),
            Response::ResultSet(_) => Err(Error::malformed("unexpected result set for ping")),
        }
    }

    /// Sends COM_QUIT and tears the session down. Safe to call repeatedly;
    /// later commands on this handle fail with a server-gone error.
    pub fn disconnect(&self) {
        self.inner.borrow_mut().close();
    }

    /// The most recent native diagnostic, cleared by the next successful
    /// command.
    pub fn last_error(&self) -> Option<ServerError> {
        self.inner.borrow().last_error.clone()
    }

    pub fn affected_rows(&self) -> u64 {
        self.inner.borrow().affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.inner.borrow().last_insert_id
    }

    pub fn character_set_name(&self) -> String {
        self.inner.borrow().charset.clone()
    }

    pub fn server_version(&self) -> String {
        self.inner.borrow().server_version.clone()
    }

    pub fn connection_id(&self) -> u32 {
        self.inner.borrow().connection_id
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(conn) => f
                .debug_struct("Connection")
                .field("connection_id", &conn.connection_id)
                .field("server_version", &conn.server_version)
                .field("capabilities", &conn.capabilities)
                .field("connected", &conn.stream.is_some())
                .finish(),
            Err(_) => f.debug_struct("Connection").finish_non_exhaustive(),
        }
    }
}

pub(crate) fn escape_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 2);
    for ch in input.chars() {
        match ch {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\u{1a}' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out
}

fn plugin_err(name: String) -> Error {
    Error::Connection(ServerError::client(
        cr::CR_AUTH_PLUGIN_ERR,
        format!("authentication plugin '{name}' cannot be loaded"),
    ))
}

/// Drives the post-response auth exchange to its final OK: plugin switches,
/// the caching_sha2 fast path, and its full path (secure transport only).
fn authenticate(
    stream: &mut PacketStream<Stream>,
    password: &str,
    secure: bool,
) -> Result<OkPacket> {
    loop {
        let payload = stream.read_packet()?;
        match payload.first().copied() {
            Some(0x00) => return parse_ok(&payload),
            Some(0xff) => return Err(Error::Connection(parse_err(&payload)?)),
            Some(0xfe) if payload.len() < 9 => {
                // the pre-4.1 auth switch short form
                return Err(plugin_err(String::from("mysql_old_password")));
            }
            Some(0xfe) => {
                let switch = parse_auth_switch(&payload)?;
                debug!("auth switch to '{}'", switch.plugin);
                let scramble =
                    scramble_for_plugin(&switch.plugin, &switch.nonce, password.as_bytes())
                        .map_err(plugin_err)?;
                stream.write_packet(scramble.as_deref().unwrap_or_default())?;
            }
            Some(0x01) => match payload.get(1).copied() {
                // fast-path accepted; the OK follows
                Some(0x03) => trace!("caching_sha2 fast authentication accepted"),
                Some(0x04) => {
                    if !secure {
                        return Err(Error::Connection(ServerError::client(
                            cr::CR_AUTH_PLUGIN_ERR,
                            "caching_sha2_password full authentication requires a secure connection",
                        )));
                    }
                    trace!("caching_sha2 full authentication over TLS");
                    let mut cleartext = password.as_bytes().to_vec();
                    cleartext.push(0);
                    stream.write_packet(&cleartext)?;
                }
                _ => return Err(Error::malformed("unexpected authentication continuation")),
            },
            _ => return Err(Error::malformed("unexpected packet during authentication")),
        }
    }
}

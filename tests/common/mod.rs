//! Scripted in-process MySQL server. Each test starts one server with a
//! reply script, points an `Account` at it, and afterwards inspects the
//! commands the client actually put on the wire.
//!
//! The server auto-replies OK to `SET ...` session-setup queries and to
//! pings; everything else consumes the next scripted reply. A reply marked
//! `more` chains the following script entry into the same response, which
//! is how multi-statement batches are emulated.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use tinymysql::Account;

pub const NONCE: &[u8; 20] = b"abcdefghijklmnopqrst";
pub const SERVER_VERSION: &str = "8.0.36";
pub const CONNECTION_ID: u32 = 99;

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;
pub const COM_PING: u8 = 0x0e;
pub const COM_STMT_PREPARE: u8 = 0x16;
pub const COM_STMT_EXECUTE: u8 = 0x17;
pub const COM_STMT_CLOSE: u8 = 0x19;

const SERVER_CAPS: u32 = 0x0000_0001 // LONG_PASSWORD
    | 0x0000_0004 // LONG_FLAG
    | 0x0000_0008 // CONNECT_WITH_DB
    | 0x0000_0200 // PROTOCOL_41
    | 0x0000_2000 // TRANSACTIONS
    | 0x0000_8000 // SECURE_CONNECTION
    | 0x0001_0000 // MULTI_STATEMENTS
    | 0x0002_0000 // MULTI_RESULTS
    | 0x0004_0000 // PS_MULTI_RESULTS
    | 0x0008_0000 // PLUGIN_AUTH
    | 0x0020_0000; // PLUGIN_AUTH_LENENC_CLIENT_DATA

const STATUS_AUTOCOMMIT: u16 = 0x0002;
const STATUS_MORE_RESULTS: u16 = 0x0008;

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One result-set column as the fake server will describe it.
#[derive(Debug, Clone)]
pub struct TestCol {
    pub name: String,
    pub table: String,
    pub org_table: String,
    pub tag: u8,
    pub flags: u16,
}

impl TestCol {
    pub fn new(name: &str, tag: u8) -> TestCol {
        TestCol {
            name: name.to_string(),
            table: "t".to_string(),
            org_table: "t".to_string(),
            tag,
            flags: 0,
        }
    }

    pub fn unsigned(mut self) -> TestCol {
        self.flags |= 0x0020;
        self
    }

    pub fn table(mut self, alias: &str, real: &str) -> TestCol {
        self.table = alias.to_string();
        self.org_table = real.to_string();
        self
    }
}

/// One binary-protocol cell, encoded per its column's wire type.
#[derive(Debug, Clone)]
pub enum BinCell {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Date(u16, u8, u8),
    DateTime(u16, u8, u8, u8, u8, u8),
    Time(bool, u32, u8, u8),
}

/// What the server answers to the next non-automatic command. `more`
/// chains the next script entry into the same response.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok {
        affected: u64,
        insert_id: u64,
        more: bool,
    },
    Err {
        code: u16,
        msg: String,
    },
    TextRows {
        cols: Vec<TestCol>,
        rows: Vec<Vec<Option<String>>>,
        more: bool,
    },
    BinRows {
        cols: Vec<TestCol>,
        rows: Vec<Vec<Option<BinCell>>>,
        more: bool,
    },
    PrepareOk {
        stmt_id: u32,
        params: u16,
        cols: u16,
    },
    /// Asks the client to upload a local file, then refuses whatever comes
    /// back with the server's not-allowed error.
    LocalInfile {
        filename: String,
    },
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::Ok {
            affected: 0,
            insert_id: 0,
            more: false,
        }
    }

    pub fn affected(n: u64) -> Reply {
        Reply::Ok {
            affected: n,
            insert_id: 0,
            more: false,
        }
    }

    pub fn insert_id(id: u64) -> Reply {
        Reply::Ok {
            affected: 1,
            insert_id: id,
            more: false,
        }
    }

    fn more_flag(&self) -> bool {
        match self {
            Reply::Ok { more, .. }
            | Reply::TextRows { more, .. }
            | Reply::BinRows { more, .. } => *more,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerCfg {
    /// Password the server expects the scramble to match.
    pub password: String,
    /// Auth plugin advertised in the handshake.
    pub plugin: String,
    /// Demand a switch to this plugin after the first response.
    pub switch_to: Option<String>,
    /// Reject authentication outright with ERR 1045.
    pub reject: bool,
    /// Answer the first session-setup `SET` with a parse error.
    pub fail_setup: bool,
}

impl Default for ServerCfg {
    fn default() -> ServerCfg {
        ServerCfg {
            password: "secret".to_string(),
            plugin: "mysql_native_password".to_string(),
            switch_to: None,
            reject: false,
            fail_setup: false,
        }
    }
}

/// Everything observed on the wire, for post-test assertions.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub commands: Vec<(u8, Vec<u8>)>,
    pub user: String,
    pub database: String,
    pub client_caps: u32,
}

impl Recorded {
    pub fn queries(&self) -> Vec<String> {
        self.commands
            .iter()
            .filter(|(cmd, _)| *cmd == COM_QUERY)
            .map(|(_, body)| String::from_utf8_lossy(body).into_owned())
            .collect()
    }

    pub fn bodies(&self, cmd: u8) -> Vec<Vec<u8>> {
        self.commands
            .iter()
            .filter(|(c, _)| *c == cmd)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn count(&self, cmd: u8) -> usize {
        self.commands.iter().filter(|(c, _)| *c == cmd).count()
    }
}

pub struct TestServer {
    pub port: u16,
    recorded: Arc<Mutex<Recorded>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(cfg: ServerCfg, script: Vec<Reply>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let port = listener.local_addr().expect("listener addr").port();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let shared = Arc::clone(&recorded);
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept client");
            stream.set_nodelay(true).ok();
            drive(stream, cfg, script, shared);
        });
        TestServer {
            port,
            recorded,
            handle: Some(handle),
        }
    }

    #[cfg(unix)]
    pub fn start_unix(path: &std::path::Path, cfg: ServerCfg, script: Vec<Reply>) -> TestServer {
        let _ = std::fs::remove_file(path);
        let listener = std::os::unix::net::UnixListener::bind(path).expect("bind unix listener");
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let shared = Arc::clone(&recorded);
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept client");
            drive(stream, cfg, script, shared);
        });
        TestServer {
            port: 0,
            recorded,
            handle: Some(handle),
        }
    }

    /// An account already pointing at this server.
    pub fn account(&self, password: &str) -> Account {
        let mut account = Account::new();
        account.set_host("127.0.0.1").expect("host");
        account.set_port(u32::from(self.port)).expect("port");
        account.set_user("game");
        account.set_password(password);
        account.set_database("test");
        account
    }

    /// Joins the server thread and hands back the recording. Panics from
    /// the server (script exhausted, bad scramble) surface here.
    pub fn finish(mut self) -> Recorded {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("server thread");
        }
        self.recorded.lock().expect("recording lock").clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Packet framing over any byte stream; one shared sequence counter, the
/// way both sides of the real protocol keep it.
struct Wire<S> {
    stream: S,
    seq: u8,
}

impl<S: Read + Write> Wire<S> {
    fn new(stream: S) -> Wire<S> {
        Wire { stream, seq: 0 }
    }

    fn read_packet(&mut self) -> io::Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header)?;
        let len = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
        self.seq = header[3].wrapping_add(1);
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn write_packet(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut header = [0u8; 4];
        header[0] = payload.len() as u8;
        header[1] = (payload.len() >> 8) as u8;
        header[2] = (payload.len() >> 16) as u8;
        header[3] = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.stream.write_all(&header)?;
        self.stream.write_all(payload)?;
        self.stream.flush()
    }
}

fn put_lenenc(buf: &mut Vec<u8>, v: u64) {
    if v < 251 {
        buf.push(v as u8);
    } else if v < 65_536 {
        buf.push(0xfc);
        buf.write_u16::<LittleEndian>(v as u16).unwrap();
    } else if v < 16_777_216 {
        buf.push(0xfd);
        buf.push(v as u8);
        buf.push((v >> 8) as u8);
        buf.push((v >> 16) as u8);
    } else {
        buf.push(0xfe);
        buf.write_u64::<LittleEndian>(v).unwrap();
    }
}

fn put_lenenc_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_lenenc(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn read_cstr(cur: &mut Cursor<&[u8]>) -> String {
    let mut out = Vec::new();
    loop {
        match cur.read_u8() {
            Ok(0) | Err(_) => break,
            Ok(b) => out.push(b),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn read_lenenc(cur: &mut Cursor<&[u8]>) -> u64 {
    match cur.read_u8().unwrap_or(0) {
        v @ 0..=250 => u64::from(v),
        0xfc => u64::from(cur.read_u16::<LittleEndian>().unwrap()),
        0xfd => {
            let mut b = [0u8; 3];
            cur.read_exact(&mut b).unwrap();
            u64::from(b[0]) | u64::from(b[1]) << 8 | u64::from(b[2]) << 16
        }
        _ => cur.read_u64::<LittleEndian>().unwrap(),
    }
}

pub fn native_scramble(password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let first: [u8; 20] = Sha1::digest(password).into();
    let double: [u8; 20] = Sha1::digest(first).into();
    let mut h = Sha1::new();
    h.update(NONCE);
    h.update(double);
    let salted: [u8; 20] = h.finalize().into();
    first.iter().zip(salted).map(|(a, b)| a ^ b).collect()
}

pub fn sha2_scramble(password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let first: [u8; 32] = Sha256::digest(password).into();
    let double: [u8; 32] = Sha256::digest(first).into();
    let mut h = Sha256::new();
    h.update(double);
    h.update(NONCE);
    let salted: [u8; 32] = h.finalize().into();
    first.iter().zip(salted).map(|(a, b)| a ^ b).collect()
}

fn expected_scramble(plugin: &str, password: &str) -> Vec<u8> {
    match plugin {
        "caching_sha2_password" => sha2_scramble(password.as_bytes()),
        _ => native_scramble(password.as_bytes()),
    }
}

fn handshake_packet(plugin: &str) -> Vec<u8> {
    let mut p = vec![10];
    p.extend_from_slice(SERVER_VERSION.as_bytes());
    p.push(0);
    p.write_u32::<LittleEndian>(CONNECTION_ID).unwrap();
    p.extend_from_slice(&NONCE[..8]);
    p.push(0);
    p.write_u16::<LittleEndian>(SERVER_CAPS as u16).unwrap();
    p.push(45); // utf8mb4
    p.write_u16::<LittleEndian>(STATUS_AUTOCOMMIT).unwrap();
    p.write_u16::<LittleEndian>((SERVER_CAPS >> 16) as u16).unwrap();
    p.push(21); // auth data length
    p.extend_from_slice(&[0u8; 10]);
    p.extend_from_slice(&NONCE[8..]);
    p.push(0);
    p.extend_from_slice(plugin.as_bytes());
    p.push(0);
    p
}

fn ok_packet(affected: u64, insert_id: u64, more: bool) -> Vec<u8> {
    let mut p = vec![0x00];
    put_lenenc(&mut p, affected);
    put_lenenc(&mut p, insert_id);
    let status = STATUS_AUTOCOMMIT | if more { STATUS_MORE_RESULTS } else { 0 };
    p.write_u16::<LittleEndian>(status).unwrap();
    p.write_u16::<LittleEndian>(0).unwrap();
    p
}

fn eof_packet(more: bool) -> Vec<u8> {
    let mut p = vec![0xfe];
    p.write_u16::<LittleEndian>(0).unwrap();
    let status = STATUS_AUTOCOMMIT | if more { STATUS_MORE_RESULTS } else { 0 };
    p.write_u16::<LittleEndian>(status).unwrap();
    p
}

fn err_packet(code: u16, state: &str, msg: &str) -> Vec<u8> {
    let mut p = vec![0xff];
    p.write_u16::<LittleEndian>(code).unwrap();
    p.push(b'#');
    p.extend_from_slice(state.as_bytes());
    p.extend_from_slice(msg.as_bytes());
    p
}

fn column_def(col: &TestCol) -> Vec<u8> {
    let mut p = Vec::new();
    put_lenenc_bytes(&mut p, b"def");
    put_lenenc_bytes(&mut p, b"test");
    put_lenenc_bytes(&mut p, col.table.as_bytes());
    put_lenenc_bytes(&mut p, col.org_table.as_bytes());
    put_lenenc_bytes(&mut p, col.name.as_bytes());
    put_lenenc_bytes(&mut p, col.name.as_bytes());
    p.push(0x0c);
    p.write_u16::<LittleEndian>(45).unwrap();
    p.write_u32::<LittleEndian>(255).unwrap();
    p.push(col.tag);
    p.write_u16::<LittleEndian>(col.flags).unwrap();
    p.push(0); // decimals
    p.write_u16::<LittleEndian>(0).unwrap();
    p
}

fn encode_bin_cell(p: &mut Vec<u8>, cell: &BinCell) {
    match cell {
        BinCell::Int8(v) => p.push(*v as u8),
        BinCell::UInt8(v) => p.push(*v),
        BinCell::Int16(v) => p.write_i16::<LittleEndian>(*v).unwrap(),
        BinCell::UInt16(v) => p.write_u16::<LittleEndian>(*v).unwrap(),
        BinCell::Int32(v) => p.write_i32::<LittleEndian>(*v).unwrap(),
        BinCell::UInt32(v) => p.write_u32::<LittleEndian>(*v).unwrap(),
        BinCell::Int64(v) => p.write_i64::<LittleEndian>(*v).unwrap(),
        BinCell::UInt64(v) => p.write_u64::<LittleEndian>(*v).unwrap(),
        BinCell::F32(v) => p.write_f32::<LittleEndian>(*v).unwrap(),
        BinCell::F64(v) => p.write_f64::<LittleEndian>(*v).unwrap(),
        BinCell::Str(s) => put_lenenc_bytes(p, s.as_bytes()),
        BinCell::Bytes(b) => put_lenenc_bytes(p, b),
        BinCell::Date(y, m, d) => {
            p.push(4);
            p.write_u16::<LittleEndian>(*y).unwrap();
            p.push(*m);
            p.push(*d);
        }
        BinCell::DateTime(y, mo, d, h, mi, s) => {
            p.push(7);
            p.write_u16::<LittleEndian>(*y).unwrap();
            p.push(*mo);
            p.push(*d);
            p.push(*h);
            p.push(*mi);
            p.push(*s);
        }
        BinCell::Time(neg, hours, mins, secs) => {
            p.push(8);
            p.push(u8::from(*neg));
            p.write_u32::<LittleEndian>(hours / 24).unwrap();
            p.push((hours % 24) as u8);
            p.push(*mins);
            p.push(*secs);
        }
    }
}

fn bin_row_packet(cells: &[Option<BinCell>]) -> Vec<u8> {
    let mut p = vec![0x00];
    let mut bitmap = vec![0u8; (cells.len() + 9) / 8];
    for (i, cell) in cells.iter().enumerate() {
        if cell.is_none() {
            let bit = i + 2;
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }
    p.extend_from_slice(&bitmap);
    for cell in cells.iter().flatten() {
        encode_bin_cell(&mut p, cell);
    }
    p
}

fn send_reply<S: Read + Write>(wire: &mut Wire<S>, reply: &Reply) -> io::Result<()> {
    match reply {
        Reply::Ok {
            affected,
            insert_id,
            more,
        } => wire.write_packet(&ok_packet(*affected, *insert_id, *more)),
        Reply::Err { code, msg } => wire.write_packet(&err_packet(*code, "HY000", msg)),
        Reply::TextRows { cols, rows, more } => {
            let mut count = Vec::new();
            put_lenenc(&mut count, cols.len() as u64);
            wire.write_packet(&count)?;
            for col in cols {
                wire.write_packet(&column_def(col))?;
            }
            wire.write_packet(&eof_packet(false))?;
            for row in rows {
                let mut p = Vec::new();
                for cell in row {
                    match cell {
                        None => p.push(0xfb),
                        Some(s) => put_lenenc_bytes(&mut p, s.as_bytes()),
                    }
                }
                wire.write_packet(&p)?;
            }
            wire.write_packet(&eof_packet(*more))
        }
        Reply::BinRows { cols, rows, more } => {
            let mut count = Vec::new();
            put_lenenc(&mut count, cols.len() as u64);
            wire.write_packet(&count)?;
            for col in cols {
                wire.write_packet(&column_def(col))?;
            }
            wire.write_packet(&eof_packet(false))?;
            for row in rows {
                wire.write_packet(&bin_row_packet(row))?;
            }
            wire.write_packet(&eof_packet(*more))
        }
        Reply::PrepareOk {
            stmt_id,
            params,
            cols,
        } => {
            let mut p = vec![0x00];
            p.write_u32::<LittleEndian>(*stmt_id).unwrap();
            p.write_u16::<LittleEndian>(*cols).unwrap();
            p.write_u16::<LittleEndian>(*params).unwrap();
            p.push(0);
            p.write_u16::<LittleEndian>(0).unwrap();
            wire.write_packet(&p)?;
            for i in 0..*params {
                let col = TestCol::new(&format!("?{i}"), 0xfd);
                wire.write_packet(&column_def(&col))?;
            }
            if *params > 0 {
                wire.write_packet(&eof_packet(false))?;
            }
            for i in 0..*cols {
                let col = TestCol::new(&format!("c{i}"), 0xfd);
                wire.write_packet(&column_def(&col))?;
            }
            if *cols > 0 {
                wire.write_packet(&eof_packet(false))?;
            }
            Ok(())
        }
        Reply::LocalInfile { filename } => {
            let mut p = vec![0xfb];
            p.extend_from_slice(filename.as_bytes());
            wire.write_packet(&p)?;
            // the client ends the transfer with one empty packet
            let _ = wire.read_packet()?;
            wire.write_packet(&err_packet(
                1148,
                "42000",
                "The used command is not allowed with this MySQL version",
            ))
        }
    }
}

/// Runs the handshake, then serves commands until QUIT or disconnect.
fn drive<S: Read + Write>(
    stream: S,
    cfg: ServerCfg,
    script: Vec<Reply>,
    recorded: Arc<Mutex<Recorded>>,
) {
    let mut wire = Wire::new(stream);
    let mut script: VecDeque<Reply> = script.into();

    wire.write_packet(&handshake_packet(&cfg.plugin))
        .expect("send handshake");
    let response = match wire.read_packet() {
        Ok(p) => p,
        // client gave up before answering (unknown plugin and the like)
        Err(_) => return,
    };

    let mut cur = Cursor::new(response.as_slice());
    let client_caps = cur.read_u32::<LittleEndian>().expect("client caps");
    let _max_packet = cur.read_u32::<LittleEndian>().expect("max packet");
    let _collation = cur.read_u8().expect("collation");
    let mut filler = [0u8; 23];
    cur.read_exact(&mut filler).expect("filler");
    let user = read_cstr(&mut cur);
    let auth_len = read_lenenc(&mut cur) as usize;
    let mut auth = vec![0u8; auth_len];
    cur.read_exact(&mut auth).expect("auth data");
    let database = if client_caps & 0x8 != 0 {
        read_cstr(&mut cur)
    } else {
        String::new()
    };
    {
        let mut rec = recorded.lock().expect("recording lock");
        rec.user = user;
        rec.database = database;
        rec.client_caps = client_caps;
    }

    if cfg.reject {
        wire.write_packet(&err_packet(
            1045,
            "28000",
            "Access denied for user 'game'@'localhost' (using password: YES)",
        ))
        .expect("send access denied");
        return;
    }

    let authed = if let Some(next_plugin) = &cfg.switch_to {
        let mut switch = vec![0xfe];
        switch.extend_from_slice(next_plugin.as_bytes());
        switch.push(0);
        switch.extend_from_slice(NONCE);
        switch.push(0);
        wire.write_packet(&switch).expect("send auth switch");
        let reply = match wire.read_packet() {
            Ok(p) => p,
            Err(_) => return,
        };
        reply == expected_scramble(next_plugin, &cfg.password)
    } else {
        auth == expected_scramble(&cfg.plugin, &cfg.password)
    };
    if !authed {
        wire.write_packet(&err_packet(
            1045,
            "28000",
            "Access denied for user 'game'@'localhost' (using password: YES)",
        ))
        .expect("send access denied");
        return;
    }
    if cfg.plugin == "caching_sha2_password" && cfg.switch_to.is_none() {
        // fast-path acknowledgement precedes the final OK
        wire.write_packet(&[0x01, 0x03]).expect("send fast-auth ok");
    }
    wire.write_packet(&ok_packet(0, 0, false)).expect("send auth ok");

    let mut failed_setup = false;
    loop {
        let packet = match wire.read_packet() {
            Ok(p) => p,
            Err(_) => return,
        };
        let (cmd, body) = match packet.split_first() {
            Some((cmd, body)) => (*cmd, body.to_vec()),
            None => continue,
        };
        recorded
            .lock()
            .expect("recording lock")
            .commands
            .push((cmd, body.clone()));
        match cmd {
            COM_QUIT => return,
            COM_PING => wire.write_packet(&ok_packet(0, 0, false)).expect("pong"),
            COM_STMT_CLOSE => {} // no response by protocol
            COM_QUERY if body.starts_with(b"SET ") => {
                if cfg.fail_setup && !failed_setup {
                    failed_setup = true;
                    wire.write_packet(&err_packet(1064, "42000", "You have an error in your SQL syntax"))
                        .expect("send setup error");
                } else {
                    wire.write_packet(&ok_packet(0, 0, false)).expect("setup ok");
                }
            }
            _ => loop {
                let reply = script.pop_front().expect("reply script exhausted");
                let more = reply.more_flag();
                send_reply(&mut wire, &reply).expect("send scripted reply");
                if !more {
                    break;
                }
            },
        }
    }
}

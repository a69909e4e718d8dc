mod common;

use common::{ServerCfg, TestServer, COM_PING, COM_QUIT};
use tinymysql::error::cr;
use tinymysql::Error;

#[test]
fn connect_runs_session_setup_in_order() {
    common::init_logs();
    let server = TestServer::start(ServerCfg::default(), vec![]);
    let mut account = server.account("secret");
    account.set_option("wait_timeout", "100");
    account.set_option("sql_mode", "ANSI_QUOTES");

    let conn = account.connect().unwrap();
    assert_eq!(conn.character_set_name(), "utf8mb4");
    assert_eq!(conn.server_version(), common::SERVER_VERSION);
    assert_eq!(conn.connection_id(), common::CONNECTION_ID);
    conn.ping().unwrap();
    conn.disconnect();
    conn.disconnect(); // second call is a no-op

    let rec = server.finish();
    assert_eq!(rec.user, "game");
    assert_eq!(rec.database, "test");
    assert_eq!(
        rec.queries(),
        vec![
            "SET OPTION wait_timeout=100",
            "SET OPTION sql_mode=ANSI_QUOTES",
            "SET autocommit=1",
        ]
    );
    assert_eq!(rec.count(COM_PING), 1);
    assert_eq!(rec.count(COM_QUIT), 1);
}

#[test]
fn autocommit_off_is_part_of_setup() {
    common::init_logs();
    let server = TestServer::start(ServerCfg::default(), vec![]);
    let mut account = server.account("secret");
    account.set_autocommit(false);

    let conn = account.connect().unwrap();
    drop(conn);

    let rec = server.finish();
    assert_eq!(rec.queries(), vec!["SET autocommit=0"]);
}

#[test]
fn wrong_password_is_access_denied() {
    common::init_logs();
    let server = TestServer::start(ServerCfg::default(), vec![]);
    let account = server.account("not-the-password");

    let err = account.connect().unwrap_err();
    match err {
        Error::Connection(se) => {
            assert_eq!(se.code, 1045);
            assert_eq!(se.state, "28000");
            assert!(se.message.contains("Access denied"));
        }
        other => panic!("expected a connection error, got {other:?}"),
    }
}

#[test]
fn auth_switch_is_followed() {
    common::init_logs();
    let cfg = ServerCfg {
        plugin: "caching_sha2_password".to_string(),
        switch_to: Some("mysql_native_password".to_string()),
        ..ServerCfg::default()
    };
    let server = TestServer::start(cfg, vec![]);

    let conn = server.account("secret").connect().unwrap();
    conn.ping().unwrap();
}

#[test]
fn caching_sha2_fast_path_succeeds() {
    common::init_logs();
    let cfg = ServerCfg {
        plugin: "caching_sha2_password".to_string(),
        ..ServerCfg::default()
    };
    let server = TestServer::start(cfg, vec![]);

    let conn = server.account("secret").connect().unwrap();
    conn.ping().unwrap();
}

#[test]
fn unknown_auth_plugin_is_rejected_client_side() {
    common::init_logs();
    let cfg = ServerCfg {
        plugin: "sha256_password".to_string(),
        ..ServerCfg::default()
    };
    let server = TestServer::start(cfg, vec![]);

    let err = server.account("secret").connect().unwrap_err();
    match err {
        Error::Connection(se) => {
            assert_eq!(se.code, cr::CR_AUTH_PLUGIN_ERR);
            assert!(se.message.contains("sha256_password"));
        }
        other => panic!("expected a connection error, got {other:?}"),
    }
}

#[test]
fn failed_session_setup_aborts_the_connect() {
    common::init_logs();
    let cfg = ServerCfg {
        fail_setup: true,
        ..ServerCfg::default()
    };
    let server = TestServer::start(cfg, vec![]);
    let mut account = server.account("secret");
    account.set_option("wait_timeout", "100");

    let err = account.connect().unwrap_err();
    match err {
        Error::Connection(se) => assert_eq!(se.code, 1064),
        other => panic!("expected a connection error, got {other:?}"),
    }
}

#[test]
fn commands_after_disconnect_report_server_gone() {
    common::init_logs();
    let server = TestServer::start(ServerCfg::default(), vec![]);
    let conn = server.account("secret").connect().unwrap();
    conn.disconnect();

    let err = conn.ping().unwrap_err();
    assert_eq!(
        err.server_error().map(|se| se.code),
        Some(cr::CR_SERVER_GONE_ERROR)
    );
    let err = conn.execute("UPDATE t SET a = 1").unwrap_err();
    assert_eq!(
        err.server_error().map(|se| se.code),
        Some(cr::CR_SERVER_GONE_ERROR)
    );
}

#[cfg(unix)]
#[test]
fn connects_over_a_unix_socket() {
    common::init_logs();
    let path = std::env::temp_dir().join(format!("tinymysql-test-{}.sock", std::process::id()));
    let server = TestServer::start_unix(&path, ServerCfg::default(), vec![]);

    let mut account = tinymysql::Account::new();
    account.set_socket(Some(path.to_str().unwrap()));
    account.set_user("game");
    account.set_password("secret");
    account.set_database("test");

    let conn = account.connect().unwrap();
    conn.ping().unwrap();
    conn.disconnect();

    let rec = server.finish();
    assert_eq!(rec.user, "game");
    let _ = std::fs::remove_file(&path);
}

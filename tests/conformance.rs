//! Client against server through the public API, with the in-memory plugin
//! behind the server.

use std::io;
use std::sync::Arc;

use nbd_core::capability::Capability;
use nbd_core::command_request::CommandKind;
use nbd_core::config::PluginConfig;
use nbd_core::connection::{list_exports, Connection, ConnectionState};
use nbd_core::errors::{ConnectError, Error, NegotiationError, ValidationError};
use nbd_core::flags::{CommandFlags, HandlerFlags};
use nbd_core::memory::MemoryPlugin;
use nbd_core::server::NbdServer;
use nbd_core::transport::{Target, Transport};
use tokio::task::JoinHandle;

struct Session {
    connection: Connection,
    plugin: Arc<MemoryPlugin>,
    server: JoinHandle<io::Result<()>>,
}

impl Session {
    async fn start(json: &str) -> Self {
        let config = PluginConfig::from_json(json).unwrap();
        let plugin = Arc::new(MemoryPlugin::new(config).unwrap());
        let server = NbdServer::new(Arc::clone(&plugin));

        let (client, server_end) = tokio::io::duplex(1 << 20);
        let server = tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(server_end);
            server.serve(reader, writer).await
        });

        let connection = Connection::from_transport(Transport::from_stream(client), "")
            .await
            .unwrap();

        Self {
            connection,
            plugin,
            server,
        }
    }

    async fn finish(self) {
        self.connection.close().await;
        assert_eq!(self.connection.state(), ConnectionState::Closed);
        assert!(self.server.await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn test_size_is_reported() {
    for size in [0, 512, 1 << 20] {
        let session = Session::start(&format!(r#"{{"size": {size}}}"#)).await;
        assert_eq!(session.connection.get_size(), size);
        session.finish().await;
    }
}

#[tokio::test]
async fn test_boolean_probes_follow_configuration() {
    for value in [false, true] {
        let session = Session::start(&format!(
            r#"{{"size": 512, "is_rotational": {value}, "can_multi_conn": {value},
                "can_flush": {value}, "can_trim": {value}, "can_fast_zero": {value}}}"#
        ))
        .await;
        let connection = &session.connection;
        assert_eq!(connection.is_rotational(), value);
        assert_eq!(connection.can_multi_conn(), value);
        assert_eq!(connection.can_flush(), value);
        assert_eq!(connection.can_trim(), value);
        assert_eq!(connection.can_fast_zero(), value);
        assert!(!connection.is_read_only());
        session.finish().await;

        let session = Session::start(&format!(r#"{{"size": 512, "can_write": {value}}}"#)).await;
        assert_eq!(session.connection.is_read_only(), !value);
        session.finish().await;
    }
}

#[tokio::test]
async fn test_tri_state_probes() {
    for (mode, supported) in [("none", false), ("emulate", true), ("native", true)] {
        let session = Session::start(&format!(
            r#"{{"size": 512, "can_fua": "{mode}", "can_cache": "{mode}"}}"#
        ))
        .await;
        assert_eq!(session.connection.can_fua(), supported);
        assert_eq!(session.connection.can_cache(), supported);
        session.finish().await;
    }
}

#[tokio::test]
async fn test_emulate_and_native_are_distinguished() {
    let session = Session::start(r#"{"size": 512, "can_fua": "emulate", "can_cache": "native"}"#).await;
    let flags = session.connection.export().flags();
    assert_eq!(flags.supports_fua, Capability::Emulate);
    assert_eq!(flags.supports_cache, Capability::Native);
    session.finish().await;
}

#[tokio::test]
async fn test_undeclared_capability_never_reaches_plugin() {
    let session = Session::start(r#"{"size": 512, "can_zero": false}"#).await;

    let error = session.connection.flush().await.unwrap_err();
    assert!(matches!(
        error,
        Error::Validation(ValidationError::Unsupported(CommandKind::Flush))
    ));
    let error = session
        .connection
        .zero(0, 512, CommandFlags::empty())
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        Error::Validation(ValidationError::Unsupported(CommandKind::Zero))
    ));
    assert!(session.connection.cache(0, 512).await.is_err());

    assert_eq!(session.plugin.flush_count(), 0);
    assert!(session.plugin.delivered_flags().is_empty());
    session.finish().await;
}

#[tokio::test]
async fn test_native_fua_reaches_handler() {
    let session = Session::start(
        r#"{"size": 512, "can_fua": "native", "can_trim": true,
            "pwrite_expect_fua": true, "trim_expect_fua": true, "zero_expect_fua": true}"#,
    )
    .await;
    let connection = &session.connection;

    connection.write(0, &[1; 512], CommandFlags::FUA).await.unwrap();
    connection.trim(0, 512, CommandFlags::FUA).await.unwrap();
    connection.zero(0, 512, CommandFlags::FUA).await.unwrap();

    assert_eq!(session.plugin.flush_count(), 0);
    assert_eq!(
        session.plugin.delivered_flags(),
        vec![
            (CommandKind::Write, HandlerFlags::FUA),
            (CommandKind::Trim, HandlerFlags::FUA),
            (CommandKind::Zero, HandlerFlags::FUA | HandlerFlags::MAY_TRIM),
        ]
    );
    session.finish().await;
}

#[tokio::test]
async fn test_emulated_fua_flushes_once_per_command() {
    let session = Session::start(
        r#"{"size": 512, "can_fua": "emulate", "can_flush": true, "can_trim": true,
            "pwrite_expect_fua": false, "trim_expect_fua": false, "zero_expect_fua": false}"#,
    )
    .await;
    let connection = &session.connection;

    connection.write(0, &[1; 512], CommandFlags::FUA).await.unwrap();
    assert_eq!(session.plugin.flush_count(), 1);
    connection.trim(0, 512, CommandFlags::FUA).await.unwrap();
    assert_eq!(session.plugin.flush_count(), 2);
    connection.zero(0, 512, CommandFlags::FUA).await.unwrap();
    assert_eq!(session.plugin.flush_count(), 3);

    // Without FUA nothing extra happens
    connection.write(0, &[1; 512], CommandFlags::empty()).await.unwrap();
    assert_eq!(session.plugin.flush_count(), 3);
    session.finish().await;
}

#[tokio::test]
async fn test_fua_without_support_fails_before_transmission() {
    let session = Session::start(r#"{"size": 512, "can_trim": true}"#).await;
    let connection = &session.connection;

    for result in [
        connection.write(0, &[1; 512], CommandFlags::FUA).await,
        connection.trim(0, 512, CommandFlags::FUA).await,
        connection.zero(0, 512, CommandFlags::FUA).await,
    ] {
        assert!(matches!(
            result,
            Err(Error::Validation(ValidationError::FuaUnsupported))
        ));
    }
    assert!(session.plugin.delivered_flags().is_empty());
    session.finish().await;
}

#[tokio::test]
async fn test_zero_may_trim_hint() {
    let session = Session::start(r#"{"size": 512, "zero_expect_may_trim": true}"#).await;
    session
        .connection
        .zero(0, 512, CommandFlags::empty())
        .await
        .unwrap();
    session.finish().await;

    let session = Session::start(r#"{"size": 512, "zero_expect_may_trim": false}"#).await;
    session
        .connection
        .zero(0, 512, CommandFlags::NO_HOLE)
        .await
        .unwrap();

    // A hint the handler did not expect comes back as EINVAL
    let error = session
        .connection
        .zero(0, 512, CommandFlags::empty())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Protocol(_)));
    assert_eq!(error.errno(), libc::EINVAL);
    assert_eq!(error.errnum(), 22);
    assert_eq!(session.connection.state(), ConnectionState::Ready);
    session.finish().await;
}

#[tokio::test]
async fn test_fast_zero() {
    let session = Session::start(r#"{"size": 512, "can_fast_zero": false}"#).await;
    let error = session
        .connection
        .zero(0, 512, CommandFlags::FAST_ZERO)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        Error::Validation(ValidationError::FastZeroUnsupported)
    ));
    session.finish().await;

    let session = Session::start(
        r#"{"size": 512, "can_fast_zero": true, "zero_expect_fast_zero": true}"#,
    )
    .await;
    session
        .connection
        .zero(0, 512, CommandFlags::FAST_ZERO | CommandFlags::NO_HOLE)
        .await
        .unwrap();
    assert_eq!(
        session.plugin.delivered_flags(),
        vec![(CommandKind::Zero, HandlerFlags::FAST_ZERO)]
    );
    session.finish().await;
}

#[tokio::test]
async fn test_read_write_round_trip() {
    let session = Session::start(r#"{"size": 512}"#).await;
    let connection = &session.connection;

    assert_eq!(connection.read(0, 512).await.unwrap(), vec![0; 512]);

    let data: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
    connection.write(0, &data, CommandFlags::empty()).await.unwrap();
    assert_eq!(connection.read(0, 512).await.unwrap(), data);

    connection.zero(256, 256, CommandFlags::empty()).await.unwrap();
    let read = connection.read(0, 512).await.unwrap();
    assert_eq!(&read[..256], &data[..256]);
    assert_eq!(&read[256..], &[0; 256][..]);
    session.finish().await;
}

#[tokio::test]
async fn test_out_of_range() {
    let session = Session::start(r#"{"size": 512}"#).await;
    let connection = &session.connection;

    assert!(matches!(
        connection.read(1, 512).await,
        Err(Error::Validation(ValidationError::OutOfRange { .. }))
    ));
    assert!(matches!(
        connection.write(512, &[1], CommandFlags::empty()).await,
        Err(Error::Validation(ValidationError::OutOfRange { .. }))
    ));
    assert!(session.plugin.delivered_flags().is_empty());
    session.finish().await;
}

#[tokio::test]
async fn test_cache_modes() {
    for mode in ["emulate", "native"] {
        let session = Session::start(&format!(r#"{{"size": 4096, "can_cache": "{mode}"}}"#)).await;
        session.connection.cache(0, 4096).await.unwrap();
        session.finish().await;
    }
}

fn test_server(extra: &[&str], config: &PluginConfig) -> Target {
    let mut argv = vec![env!("CARGO_BIN_EXE_nbd-test-server").to_string()];
    argv.extend(extra.iter().map(|arg| arg.to_string()));
    argv.push(config.to_arg().unwrap());
    Target::Command(argv)
}

#[tokio::test]
async fn test_spawned_server() {
    let config = PluginConfig::from_json(r#"{"size": 1048576, "can_flush": true, "can_fua": "emulate"}"#).unwrap();
    let connection = Connection::connect(&test_server(&[], &config)).await.unwrap();

    assert_eq!(connection.get_size(), 1 << 20);
    assert!(connection.can_fua());
    connection.write(4096, &[9; 512], CommandFlags::FUA).await.unwrap();
    connection.flush().await.unwrap();
    assert_eq!(connection.read(4096, 512).await.unwrap(), vec![9; 512]);

    connection.close().await;
    connection.close().await;
    assert!(matches!(
        connection.read(0, 512).await,
        Err(Error::Io(_))
    ));
}

#[tokio::test]
async fn test_spawned_server_export_names() {
    let config = PluginConfig::default();
    let target = test_server(&["--export-name", "disk"], &config);

    assert_eq!(list_exports(&target).await.unwrap(), vec!["disk".to_string()]);

    let error = Connection::connect_export(&target, "other")
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        Error::Connect(ConnectError::Negotiation(NegotiationError::ExportNotFound(_)))
    ));

    let connection = Connection::connect_export(&target, "disk").await.unwrap();
    assert_eq!(connection.export_name(), "disk");
    connection.close().await;
}

//! Control endpoint tests: activation gating, stream lifecycle errors, and
//! orderly shutdown, driven through a real TCP client.

use daemon::Daemon;
use daemon::client::ControlClient;
use daemon::config::DaemonConfig;
use tv_core::config::{BaseConfig, RelayConfig};
use tv_core::input_uri::InputUri;
use tv_core::StreamConfig;
use tv_proto::commands::{
    ActivateInfo, ServerPingInfo, ServiceInfo, StartStreamInfo, StateServiceInfo, StreamIdInfo,
    pack, unpack,
};
use tv_proto::{ErrorKind, methods};

const LICENSE: &str = "test-license";

fn test_cfg(feedback_dir: &std::path::Path) -> DaemonConfig {
    DaemonConfig {
        control_bind: "127.0.0.1:0".to_owned(),
        subscribers_bind: "127.0.0.1:0".to_owned(),
        feedback_dir: feedback_dir.display().to_string(),
        // Spawn attempts must fail deterministically in these tests.
        worker_binary: Some("/nonexistent/stream-worker".to_owned()),
        ..DaemonConfig::default()
    }
}

async fn start_daemon() -> (Daemon, ControlClient, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(test_cfg(dir.path()), LICENSE.to_owned())
        .await
        .unwrap();
    let client = ControlClient::connect(&daemon.control_addr.to_string())
        .await
        .unwrap();
    (daemon, client, dir)
}

fn license_params(license: &str) -> Option<String> {
    Some(pack(&ActivateInfo {
        license: license.to_owned(),
    }))
}

fn relay_config(id: &str, inputs: &[&str]) -> StreamConfig {
    StreamConfig::Relay(RelayConfig {
        base: BaseConfig {
            id: id.to_owned(),
            input: inputs
                .iter()
                .enumerate()
                .map(|(i, raw)| InputUri::new(i as u64, raw.parse().unwrap()))
                .collect(),
            output: vec![],
            feedback_dir: "ignored".to_owned(),
            log_level: "info".to_owned(),
            stats_interval_secs: 1,
            restart_attempts: None,
        },
    })
}

#[tokio::test]
async fn activation_gates_the_service_methods() {
    let (_daemon, mut client, _dir) = start_daemon().await;

    // Service methods are refused before activation.
    let err = client
        .call(methods::STATE_SERVICE, None)
        .await
        .unwrap_err();
    match err {
        daemon::client::ClientError::Refused(e) => assert_eq!(e.code, ErrorKind::Unauthorized),
        other => panic!("expected refusal, got {other:?}"),
    }

    // A bad license does not activate.
    let err = client
        .call(methods::ACTIVATE, license_params("wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, daemon::client::ClientError::Refused(_)));

    // The right license does, and returns the service fingerprint.
    let result = client
        .call(methods::ACTIVATE, license_params(LICENSE))
        .await
        .unwrap();
    let info: ServiceInfo = unpack(Some(&result)).unwrap();
    assert_eq!(info.fingerprint, LICENSE);

    // Now service methods answer.
    let result = client.call(methods::STATE_SERVICE, None).await.unwrap();
    let state: StateServiceInfo = unpack(Some(&result)).unwrap();
    assert!(state.streams.is_empty());
}

#[tokio::test]
async fn ping_service_needs_no_activation() {
    let (_daemon, mut client, _dir) = start_daemon().await;
    let result = client.call(methods::PING_SERVICE, None).await.unwrap();
    let pong: ServerPingInfo = unpack(Some(&result)).unwrap();
    assert!(pong.timestamp > 0);
}

#[tokio::test]
async fn start_stream_failures_surface_to_the_caller() {
    let (_daemon, mut client, _dir) = start_daemon().await;
    client
        .call(methods::ACTIVATE, license_params(LICENSE))
        .await
        .unwrap();

    // Invalid config: multi-input relay over the network has no variant.
    let bad = relay_config("s1", &["udp://239.0.0.1:1", "udp://239.0.0.2:2"]);
    let err = client
        .call(
            methods::START_STREAM,
            Some(pack(&StartStreamInfo { config: bad })),
        )
        .await
        .unwrap_err();
    match err {
        daemon::client::ClientError::Refused(e) => {
            assert_eq!(e.code, ErrorKind::InvalidConfig);
        }
        other => panic!("expected InvalidConfig, got {other:?}"),
    }

    // Valid config, but the worker binary cannot be spawned: the error is
    // surfaced and no half-registered stream is left behind.
    let good = relay_config("s2", &["udp://239.0.0.1:1234"]);
    let err = client
        .call(
            methods::START_STREAM,
            Some(pack(&StartStreamInfo { config: good })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, daemon::client::ClientError::Refused(_)));

    let result = client.call(methods::STATE_SERVICE, None).await.unwrap();
    let state: StateServiceInfo = unpack(Some(&result)).unwrap();
    assert!(state.streams.is_empty(), "failed spawn leaked an entry");
}

#[tokio::test]
async fn stream_ops_on_unknown_ids_are_not_found() {
    let (_daemon, mut client, _dir) = start_daemon().await;
    client
        .call(methods::ACTIVATE, license_params(LICENSE))
        .await
        .unwrap();

    for method in [
        methods::STOP_STREAM,
        methods::RESTART_STREAM,
        methods::GET_LOG_STREAM,
    ] {
        let err = client
            .call(
                method,
                Some(pack(&StreamIdInfo {
                    id: "ghost".to_owned(),
                })),
            )
            .await
            .unwrap_err();
        match err {
            daemon::client::ClientError::Refused(e) => {
                assert_eq!(e.code, ErrorKind::NotFound, "{method}");
            }
            other => panic!("expected NotFound for {method}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn stop_service_is_license_gated_and_shuts_down() {
    let (mut daemon, mut client, _dir) = start_daemon().await;

    let err = client
        .call(methods::STOP_SERVICE, license_params("wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, daemon::client::ClientError::Refused(_)));

    client
        .call(methods::STOP_SERVICE, license_params(LICENSE))
        .await
        .unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), daemon.wait_for_shutdown())
        .await
        .expect("daemon did not signal shutdown");
}

//! End-to-end controller tests over a real socket pair: the test plays the
//! supervisor role on one end, the controller runs on the other.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use stream_worker::Controller;
use stream_worker::media::SyntheticBackend;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tv_core::config::{BaseConfig, EncodeConfig, EncodeSettings};
use tv_core::input_uri::{InputUri, OutputUri};
use tv_core::stats::StatsRegion;
use tv_core::{StreamConfig, StreamStatus};
use tv_proto::commands::{ChangedSourcesInfo, StatisticInfo, unpack};
use tv_proto::{Message, Request, RpcCodec, methods};

fn test_config(feedback_dir: &std::path::Path) -> StreamConfig {
    StreamConfig::Encode(EncodeConfig {
        base: BaseConfig {
            id: "s42".to_owned(),
            input: vec![InputUri::new(0, "test://".parse().unwrap())],
            output: vec![OutputUri::new(0, "udp://239.0.0.1:1234".parse().unwrap())],
            feedback_dir: feedback_dir.display().to_string(),
            log_level: "info".to_owned(),
            stats_interval_secs: 1,
            restart_attempts: None,
        },
        encode: EncodeSettings::default(),
    })
}

fn fast_backend() -> SyntheticBackend {
    SyntheticBackend {
        buffer_bytes: 1_000,
        tick_ms: 10,
    }
}

async fn next_message(sup: &mut Framed<UnixStream, RpcCodec>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), sup.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("control connection closed")
        .expect("codec error")
}

/// Wait for the next `statistic_stream` broadcast, skipping other traffic.
async fn next_statistic(sup: &mut Framed<UnixStream, RpcCodec>) -> StatisticInfo {
    loop {
        if let Message::Request(req) = next_message(sup).await {
            if req.method == methods::STATISTIC_STREAM {
                return unpack(req.params.as_deref()).unwrap();
            }
        }
    }
}

#[tokio::test]
async fn publishes_statistics_with_positive_input_bps() {
    let dir = tempfile::tempdir().unwrap();
    let (sup_end, worker_end) = UnixStream::pair().unwrap();
    let mut sup = Framed::new(sup_end, RpcCodec::new());

    let controller =
        Controller::new(test_config(dir.path()), dir.path(), fast_backend(), 3).unwrap();
    let worker = tokio::spawn(controller.run(worker_end));

    // The active source is announced before data flows.
    let mut saw_changed_source = false;
    let stats = loop {
        if let Message::Request(req) = next_message(&mut sup).await {
            match req.method.as_str() {
                methods::CHANGED_SOURCE_STREAM => {
                    let info: ChangedSourcesInfo = unpack(req.params.as_deref()).unwrap();
                    assert_eq!(info.id, "s42");
                    assert_eq!(info.source.uri.as_str(), "test://");
                    saw_changed_source = true;
                }
                methods::STATISTIC_STREAM => {
                    break unpack::<StatisticInfo>(req.params.as_deref()).unwrap();
                }
                other => panic!("unexpected broadcast {other}"),
            }
        }
    };
    assert!(saw_changed_source);
    assert_eq!(stats.id, "s42");
    assert!(
        matches!(stats.status, StreamStatus::Init | StreamStatus::Playing),
        "{:?}",
        stats.status
    );
    assert!(stats.bps_input[0] > 0, "no input traffic: {stats:?}");

    // The snapshot region is being republished alongside the broadcasts.
    let record = StatsRegion::new(dir.path()).sample().unwrap().unwrap();
    assert_eq!(record.id, "s42");

    drop(sup);
    let code = worker.await.unwrap().unwrap();
    assert_eq!(code, 0, "control close is an orderly stop");
}

#[tokio::test]
async fn restart_rebuilds_pipeline_in_process() {
    let dir = tempfile::tempdir().unwrap();
    let (sup_end, worker_end) = UnixStream::pair().unwrap();
    let mut sup = Framed::new(sup_end, RpcCodec::new());

    let controller =
        Controller::new(test_config(dir.path()), dir.path(), fast_backend(), 3).unwrap();
    let worker = tokio::spawn(controller.run(worker_end));

    // Reach playing first.
    loop {
        let stats = next_statistic(&mut sup).await;
        if stats.status == StreamStatus::Playing {
            break;
        }
    }

    let restart = Request::new("1".to_owned(), methods::RESTART, None);
    sup.send(Message::Request(restart)).await.unwrap();

    // The reply and a later return to playing, in either interleaving.
    let mut acked = false;
    let mut playing_again = false;
    while !(acked && playing_again) {
        match next_message(&mut sup).await {
            Message::Response(resp) => {
                assert_eq!(resp.id, "1");
                assert!(resp.result.is_ok());
                acked = true;
            }
            Message::Request(req) if req.method == methods::STATISTIC_STREAM => {
                let stats: StatisticInfo = unpack(req.params.as_deref()).unwrap();
                if acked && stats.status == StreamStatus::Playing {
                    playing_again = true;
                }
            }
            Message::Request(_) => {}
        }
    }

    let stop = Request::new("2".to_owned(), methods::STOP, None);
    sup.send(Message::Request(stop)).await.unwrap();
    loop {
        match next_message(&mut sup).await {
            Message::Response(resp) => {
                assert_eq!(resp.id, "2");
                assert!(resp.result.is_ok());
                break;
            }
            Message::Request(_) => {}
        }
    }

    let code = worker.await.unwrap().unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn unknown_method_gets_not_found_but_worker_keeps_running() {
    let dir = tempfile::tempdir().unwrap();
    let (sup_end, worker_end) = UnixStream::pair().unwrap();
    let mut sup = Framed::new(sup_end, RpcCodec::new());

    let controller =
        Controller::new(test_config(dir.path()), dir.path(), fast_backend(), 3).unwrap();
    let worker = tokio::spawn(controller.run(worker_end));

    let bogus = Request::new("9".to_owned(), "bogus_method", None);
    sup.send(Message::Request(bogus)).await.unwrap();

    loop {
        match next_message(&mut sup).await {
            Message::Response(resp) => {
                assert_eq!(resp.id, "9");
                assert!(resp.result.is_err());
                break;
            }
            Message::Request(_) => {}
        }
    }

    // Still alive: statistics keep flowing.
    let _ = next_statistic(&mut sup).await;

    drop(sup);
    let code = worker.await.unwrap().unwrap();
    assert_eq!(code, 0);
}

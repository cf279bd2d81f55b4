//! End-to-end tests: a real [`jt808_terminal::Terminal`] against a real
//! [`jt808_platform::Platform`] over loopback TCP.

use std::time::Duration;

use jt808_platform::{Platform, PlatformConfig};
use jt808_proto::{MultimediaUpload, TerminalParams, params as term_params};
use jt808_terminal::{SessionState, Terminal, TerminalConfig};
use tokio::time::{sleep, timeout};

const STEP: Duration = Duration::from_secs(10);

async fn start_platform() -> Platform {
    let mut platform = Platform::bind(PlatformConfig {
        bind_addr: "127.0.0.1:0".to_owned(),
        ..PlatformConfig::default()
    })
    .await
    .expect("bind platform");
    platform.run().expect("run platform");
    platform
}

async fn start_terminal(platform: &Platform) -> Terminal {
    let mut terminal = Terminal::new(TerminalConfig {
        remote_addr: platform.local_addr().to_string(),
        report_interval: Duration::from_millis(200),
        ..TerminalConfig::default()
    });
    terminal.connect().await.expect("connect");
    terminal.authenticate().await.expect("authenticate");
    terminal.run().expect("run");
    terminal
}

async fn wait_for_client(platform: &Platform) -> u64 {
    timeout(STEP, async {
        loop {
            if let Some(&id) = platform.client_ids().first() {
                return id;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client never registered")
}

#[tokio::test]
async fn terminal_registers_against_the_platform() {
    let mut platform = start_platform().await;
    let mut terminal = start_terminal(&platform).await;

    let client_id = wait_for_client(&platform).await;
    assert_eq!(terminal.state(), SessionState::Running);
    assert_eq!(platform.client_phone(client_id).as_deref(), Some("13395279527"));

    terminal.stop().await;
    platform.stop().await;
}

#[tokio::test]
async fn platform_pushes_parameters_to_the_terminal() {
    let mut platform = start_platform().await;
    let mut terminal = start_terminal(&platform).await;
    let client_id = wait_for_client(&platform).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    terminal.on_terminal_params_updated(move || {
        let _ = tx.send(());
    });

    let mut items = TerminalParams::new();
    term_params::set_heartbeat_interval(&mut items, 25);
    term_params::set_u8(&mut items, 0x0090, 0x03);
    platform.set_terminal_params(client_id, items).await.expect("send 0x8103");

    timeout(STEP, rx.recv()).await.expect("callback timed out").expect("callback dropped");

    let stored = terminal.terminal_params();
    assert_eq!(term_params::heartbeat_interval(&stored), Some(25));
    assert_eq!(term_params::get_u8(&stored, 0x0090), Some(0x03));

    // Round-trip the query path too; the respond is surfaced via logs.
    platform.query_terminal_params(client_id).await.expect("send 0x8104");
    sleep(Duration::from_millis(200)).await;

    terminal.stop().await;
    platform.stop().await;
}

#[tokio::test]
async fn small_upgrade_is_delivered_in_one_frame() {
    let mut platform = start_platform().await;
    let mut terminal = start_terminal(&platform).await;
    let client_id = wait_for_client(&platform).await;

    let file: Vec<u8> = (0..600u32).map(|i| (i % 256) as u8).collect();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    terminal.on_upgrade(move |kind, data| {
        let _ = tx.send((kind, data.to_vec()));
    });

    platform
        .upgrade_request(client_id, 0x00, b"SKOEM", "3.2.1", &file)
        .await
        .expect("upgrade should be acknowledged");

    let (kind, data) = timeout(STEP, rx.recv()).await.expect("upgrade timed out").unwrap();
    assert_eq!(kind, 0x00);
    assert_eq!(data, file);

    terminal.stop().await;
    platform.stop().await;
}

#[tokio::test]
async fn large_upgrade_is_segmented_and_reassembled() {
    let mut platform = start_platform().await;
    let mut terminal = start_terminal(&platform).await;
    let client_id = wait_for_client(&platform).await;

    // Five fragments at the 1023 - 9 - len("1.0") bound.
    let file: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    terminal.on_upgrade(move |kind, data| {
        let _ = tx.send((kind, data.to_vec()));
    });

    platform
        .upgrade_request_by_phone("13395279527", 0x00, b"SKOEM", "1.0", &file)
        .await
        .expect("upgrade should be acknowledged");

    let (_, data) = timeout(STEP, rx.recv()).await.expect("upgrade timed out").unwrap();
    assert_eq!(data, file);

    terminal.stop().await;
    platform.stop().await;
}

#[tokio::test]
async fn segmented_multimedia_upload_reaches_the_callback() {
    let mut platform = start_platform().await;
    let mut terminal = start_terminal(&platform).await;
    wait_for_client(&platform).await;

    let payload: Vec<u8> = (0..2500u32).map(|i| (i % 253) as u8).collect();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    platform.on_multimedia_uploaded(move |media| {
        let _ = tx.send((media.media_id, media.data.clone()));
    });

    terminal
        .multimedia_upload(MultimediaUpload {
            media_id: 9,
            media_type: 0,
            format: 0,
            event: 1,
            channel_id: 2,
            location: vec![0; 28],
            data: payload.clone(),
        })
        .expect("queue multimedia upload");

    let (media_id, data) = timeout(STEP, rx.recv()).await.expect("upload timed out").unwrap();
    assert_eq!(media_id, 9);
    assert_eq!(data, payload);

    terminal.stop().await;
    platform.stop().await;
}

#[tokio::test]
async fn location_reports_reach_the_platform_in_order() {
    let mut platform = start_platform().await;
    let mut terminal = start_terminal(&platform).await;
    wait_for_client(&platform).await;

    // A positioned fix makes the periodic reporter emit.
    terminal.set_status(0b10);
    terminal.update_location(22.570336, 113.937577, 54.0, 0.8, 0.0, "200702145429");

    // Let a few report periods elapse; the reports are consumed by the
    // service loop and acknowledged, which must not disturb the session.
    sleep(Duration::from_millis(700)).await;
    assert_eq!(terminal.state(), SessionState::Running);

    terminal.stop().await;
    platform.stop().await;
}

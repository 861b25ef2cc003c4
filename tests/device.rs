//! Serial link and display integration tests
//!
//! Runs the link against a scripted firmware instead of a real port

use std::time::{Duration, Instant};

use hearth::Error;
use hearth::device::{Backoff, Command, LinkState};
use serde_json::json;

mod common;

use common::{
    device, display_on, fast_settings, link_to, shared_link_to, write_gif, write_png,
};

const PATH: &str = "/dev/ttyFAKE0";

/// Scheduler noise tolerated on top of a computed time bound
const SLACK: Duration = Duration::from_millis(150);

/// Worst case for `send_image`: every ack window plus every retry pause
fn image_bound(timeout: Duration, retries: u32) -> Duration {
    timeout * (retries + 1) + fast_settings().retry_delay * retries + SLACK
}

#[test]
fn test_command_reply_skips_stale_input() {
    let dev = device();
    let mut link = link_to(&dev);
    assert!(link.open(PATH));

    // Leftover reply from an earlier, timed-out exchange
    dev.lock()
        .unwrap()
        .inbound
        .extend(b"{\"result\":\"stale\"}\n");

    let reply = link.send_command(&Command::new("ping")).unwrap();
    assert_eq!(reply, json!(true));
    assert_eq!(link.state(), LinkState::Open);
    assert_eq!(dev.lock().unwrap().commands, vec!["ping"]);
}

#[test]
fn test_commands_alternate_with_replies() {
    let dev = device();
    dev.lock()
        .unwrap()
        .replies
        .push(("get_state".to_string(), "{\"result\":{\"state\":\"idle\"}}".to_string()));
    let mut link = link_to(&dev);
    assert!(link.open(PATH));

    let first = link
        .send_command(&Command::with_params("set_state", json!({ "state": "listening" })))
        .unwrap();
    let second = link.send_command(&Command::new("get_state")).unwrap();

    assert_eq!(first, json!(true));
    assert_eq!(second, json!({ "state": "idle" }));
    assert_eq!(dev.lock().unwrap().commands, vec!["set_state", "get_state"]);
}

#[test]
fn test_remote_error_keeps_link_open() {
    let dev = device();
    dev.lock()
        .unwrap()
        .replies
        .push(("move".to_string(), "{\"error\":\"out of range\"}".to_string()));
    let mut link = link_to(&dev);
    assert!(link.open(PATH));

    let err = link
        .send_command(&Command::with_params("move", json!({ "angle": 400 })))
        .unwrap_err();
    match err {
        Error::Remote(message) => assert_eq!(message, "out of range"),
        other => panic!("expected remote error, got {other:?}"),
    }
    assert_eq!(link.state(), LinkState::Open);
}

#[test]
fn test_missing_reply_degrades_link() {
    let dev = device();
    dev.lock().unwrap().mute_methods.push("slow".to_string());
    let mut link = link_to(&dev);
    assert!(link.open(PATH));

    let started = Instant::now();
    let err = link.send_command(&Command::new("slow")).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(link.state(), LinkState::Degraded);

    // The next exchange still works
    assert_eq!(link.send_command(&Command::new("ping")).unwrap(), json!(true));
    assert_eq!(link.state(), LinkState::Open);
}

#[test]
fn test_write_failure_closes_link() {
    let dev = device();
    let mut link = link_to(&dev);
    assert!(link.open(PATH));
    dev.lock().unwrap().broken = true;

    let err = link.send_command(&Command::new("ping")).unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(link.state(), LinkState::Closed);
    assert!(!link.send_image(b"frame", Duration::from_millis(10), 0));
}

#[test]
fn test_image_is_probed_and_acknowledged() {
    let dev = device();
    let mut link = link_to(&dev);
    assert!(link.open(PATH));

    let payload = vec![0xAB; 512];
    assert!(link.send_image(&payload, Duration::from_millis(60), 0));

    let state = dev.lock().unwrap();
    assert_eq!(state.images, vec![payload]);
    // The ack byte was drained with the exchange
    assert!(state.inbound.is_empty());
}

#[test]
fn test_image_succeeds_on_second_attempt() {
    let dev = device();
    dev.lock().unwrap().ignore_images = 1;
    let mut link = link_to(&dev);
    assert!(link.open(PATH));

    let timeout = Duration::from_millis(60);
    let started = Instant::now();
    assert!(link.send_image(b"frame", timeout, 2));
    let elapsed = started.elapsed();

    // One missed ack window plus the retry pause
    assert!(elapsed >= timeout + Duration::from_millis(20));
    assert!(elapsed < timeout * 2 + Duration::from_millis(20) + SLACK, "took {elapsed:?}");
    assert_eq!(dev.lock().unwrap().images.len(), 2);
    assert_eq!(link.state(), LinkState::Open);
}

#[test]
fn test_unacknowledged_image_is_bounded() {
    let dev = device();
    dev.lock().unwrap().silent = true;
    let mut link = link_to(&dev);
    assert!(link.open(PATH));

    let timeout = Duration::from_millis(60);
    let started = Instant::now();
    assert!(!link.send_image(b"frame", timeout, 2));
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(3 * 60 + 2 * 20));
    assert!(elapsed < image_bound(timeout, 2), "took {elapsed:?}");
    assert_eq!(dev.lock().unwrap().images.len(), 3);
    assert_eq!(link.state(), LinkState::Degraded);
}

#[test]
fn test_stalled_payload_write_is_retried() {
    let dev = device();
    dev.lock().unwrap().stall_payloads = 1;
    let mut link = link_to(&dev);
    assert!(link.open(PATH));

    let timeout = Duration::from_millis(60);
    let started = Instant::now();
    assert!(link.send_image(b"frame", timeout, 2));

    assert!(started.elapsed() < image_bound(timeout, 2));
    assert_eq!(dev.lock().unwrap().images, vec![b"frame".to_vec()]);
    assert_eq!(link.state(), LinkState::Open);
    assert_eq!(dev.lock().unwrap().closed, 0);
}

#[test]
fn test_stalled_writes_exhaust_retries_without_closing() {
    let dev = device();
    dev.lock().unwrap().stall_payloads = 3;
    let mut link = link_to(&dev);
    assert!(link.open(PATH));

    assert!(!link.send_image(b"frame", Duration::from_millis(20), 2));
    assert_eq!(link.state(), LinkState::Degraded);

    // Still usable once the port drains
    assert!(link.send_image(b"frame", Duration::from_millis(20), 0));
}

#[test]
fn test_overlong_reply_is_a_protocol_error() {
    let dev = device();
    dev.lock()
        .unwrap()
        .replies
        .push(("dump".to_string(), "x".repeat(70_000)));
    let mut link = link_to(&dev);
    assert!(link.open(PATH));

    let err = link.send_command(&Command::new("dump")).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    assert_eq!(link.state(), LinkState::Degraded);

    assert_eq!(link.send_command(&Command::new("ping")).unwrap(), json!(true));
    assert_eq!(link.state(), LinkState::Open);
}

#[test]
fn test_reply_reads_stay_inside_command_timeout() {
    let dev = device();
    dev.lock().unwrap().mute_methods.push("slow".to_string());
    let mut link = link_to(&dev);
    assert!(link.open(PATH));
    let settings = fast_settings();

    assert!(link.send_command(&Command::new("slow")).is_err());

    let timeouts = dev.lock().unwrap().timeouts.clone();
    assert!(timeouts.len() >= 2);
    let (restored, reads) = timeouts.split_last().unwrap();
    assert!(reads.iter().all(|t| *t <= settings.command_timeout));
    // Later reads only get what is left of the deadline
    assert!(reads.last().unwrap() < reads.first().unwrap());
    assert_eq!(*restored, settings.open_timeout);
}

#[test]
fn test_ensure_open_gives_up_after_attempts() {
    let dev = device();
    dev.lock().unwrap().refuse_opens = 3;
    let mut link = link_to(&dev);

    assert!(!link.ensure_open(PATH, 3, Backoff::Fixed(Duration::from_millis(5))));
    assert_eq!(link.state(), LinkState::Closed);
    assert_eq!(dev.lock().unwrap().open_calls, 3);
}

#[test]
fn test_ensure_open_retries_until_present() {
    let dev = device();
    dev.lock().unwrap().refuse_opens = 2;
    let mut link = link_to(&dev);

    let backoff = Backoff::Incremental {
        base: Duration::from_millis(5),
        step: Duration::from_millis(5),
    };
    assert!(link.ensure_open(PATH, 3, backoff));
    assert_eq!(link.state(), LinkState::Open);
    assert_eq!(link.path(), Some(PATH));

    // Already open: no further attempts
    assert!(link.ensure_open(PATH, 3, backoff));
    assert_eq!(dev.lock().unwrap().open_calls, 3);
}

#[tokio::test]
async fn test_shared_link_round_trip() {
    let dev = device();
    let link = shared_link_to(&dev);

    assert_eq!(link.state(), LinkState::Closed);
    assert!(link.ensure_open().await);

    let reply = link.send_command(Command::new("ping")).await.unwrap();
    assert_eq!(reply, json!(true));
    assert!(link.send_image(vec![1, 2, 3].into()).await);

    link.close().await;
    assert_eq!(link.state(), LinkState::Closed);
    assert!(link.send_command(Command::new("ping")).await.is_err());
}

#[tokio::test]
async fn test_display_still_and_blank() {
    let dir = tempfile::tempdir().unwrap();
    let png = write_png(dir.path(), "idle.png", [0, 0, 0]);
    let dev = device();
    let mut display = display_on(&dev);
    assert!(display.link().ensure_open().await);

    assert!(display.show_still(&png).await.unwrap());
    assert!(display.blank().await.unwrap());

    let state = dev.lock().unwrap();
    assert_eq!(state.images.len(), 2);
    assert_eq!(state.images[0].len(), 16 * 16 * 2);
    assert!(state.images[1].iter().all(|&b| b == 0xFF));
}

#[tokio::test]
async fn test_display_missing_image_is_an_error() {
    let dev = device();
    let mut display = display_on(&dev);
    assert!(display.link().ensure_open().await);

    let result = display.show_still(std::path::Path::new("/nonexistent/idle.png")).await;
    assert!(result.is_err());
    assert!(dev.lock().unwrap().images.is_empty());
}

#[tokio::test]
async fn test_animation_loops_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let gif = write_gif(dir.path(), "talk.gif", 3);
    let dev = device();
    let mut display = display_on(&dev);
    assert!(display.link().ensure_open().await);

    display.play_loop(&gif, Duration::from_millis(10)).await.unwrap();
    assert!(display.is_animating());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = display.stop().await.unwrap();
    assert!(!display.is_animating());
    assert!(stats.sent >= 3, "sent {}", stats.sent);
    assert_eq!(stats.dropped, 0);

    // Nothing is sent once stopped
    let sent = dev.lock().unwrap().images.len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dev.lock().unwrap().images.len(), sent);
}

#[tokio::test]
async fn test_animation_frames_are_not_kept_between_loops() {
    let dir = tempfile::tempdir().unwrap();
    let gif = write_gif(dir.path(), "talk.gif", 2);
    let dev = device();
    let mut display = display_on(&dev);
    assert!(display.link().ensure_open().await);

    display.play_loop(&gif, Duration::from_millis(10)).await.unwrap();
    display.stop().await.unwrap();

    // The next loop decodes afresh
    std::fs::remove_file(&gif).unwrap();
    assert!(display.play_loop(&gif, Duration::from_millis(10)).await.is_err());
    assert!(!display.is_animating());
}

#[tokio::test]
async fn test_animation_drops_unacknowledged_frames() {
    let dir = tempfile::tempdir().unwrap();
    let gif = write_gif(dir.path(), "talk.gif", 2);
    let dev = device();
    dev.lock().unwrap().silent = true;
    let mut display = display_on(&dev);
    assert!(display.link().ensure_open().await);

    display.play_loop(&gif, Duration::from_millis(10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = display.stop().await.unwrap();
    assert_eq!(stats.sent, 0);
    assert!(stats.dropped >= 1);
}

#[tokio::test]
async fn test_fade_stops_at_first_missed_step() {
    let dir = tempfile::tempdir().unwrap();
    let png = write_png(dir.path(), "idle.png", [200, 100, 50]);
    let dev = device();
    let mut display = display_on(&dev);
    assert!(display.link().ensure_open().await);

    assert!(display.fade_to(&png, 4).await.unwrap());
    assert_eq!(dev.lock().unwrap().images.len(), 4);

    dev.lock().unwrap().silent = true;
    assert!(!display.fade_to(&png, 4).await.unwrap());
    // One step, three attempts
    assert_eq!(dev.lock().unwrap().images.len(), 4 + 3);
}

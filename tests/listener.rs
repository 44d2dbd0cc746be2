//! Reverse-shell listener lifecycle through the `Sessions` facade, using a
//! stand-in listener program so no real netcat is needed.

use shellrelay::config::{Config, ListenerKind};
use shellrelay::error::SessionError;
use shellrelay::registry::Sessions;
use std::net::TcpListener;
use std::time::Duration;

fn stand_in_sessions() -> Sessions {
    let mut config = Config::default();
    config.reverse_shell.listener = ListenerKind::Custom;
    config.reverse_shell.custom_program = Some("sleep".into());
    config.reverse_shell.custom_args = vec!["30".into()];
    config.reverse_shell.spawn_check_ms = 100;
    config.reverse_shell.connect_poll_ms = 100;
    config.reverse_shell.kill_grace_secs = 1;
    config.reverse_shell.force_port_cleanup = false;
    Sessions::new(config)
}

#[tokio::test]
async fn port_held_by_another_process_is_a_conflict() {
    let holder = TcpListener::bind(("0.0.0.0", 0)).expect("bind ephemeral port");
    let port = holder.local_addr().expect("local addr").port();

    let sessions = stand_in_sessions();
    let err = sessions
        .start_listener("blocked", port, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ResourceConflict(_)), "got: {err}");
    assert!(sessions.list_listeners().is_empty());
}

#[tokio::test]
async fn listener_without_peer_times_out_and_stops_cleanly() {
    let port = TcpListener::bind(("0.0.0.0", 0))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("ephemeral port");

    let sessions = stand_in_sessions();
    let status = sessions
        .start_listener("idle", port, None)
        .await
        .expect("listener starts");
    assert!(!status.connected);
    assert_eq!(status.listen_port, Some(port));

    let connected = sessions
        .wait_for_connection("idle", Duration::from_millis(500))
        .await
        .expect("known session");
    assert!(!connected);

    let err = sessions
        .shell_command("idle", "id", Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotConnected), "got: {err}");

    assert_eq!(sessions.stop_all().await, 1);
    assert!(sessions.status("idle").is_none());
}

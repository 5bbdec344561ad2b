//! Session state machine driven by real transfers.

mod common;

use std::time::Duration;

use common::{datagram, reach, start, start_enabled, wait_until, SUB};
use satlink_core::SatelliteConfig;
use satlink_models::{DatagramType, ModemState, SessionState};

#[tokio::test(start_paused = true)]
async fn send_cycles_through_transferring_and_listening() {
    let config = SatelliteConfig {
        listening_timeout_ms: 2_000,
        ..SatelliteConfig::default()
    };
    let t = start(config);
    assert_eq!(*t.session.session_state().borrow(), SessionState::PowerOff);

    t.session.set_satellite_enabled(true);
    reach(&t.session, SessionState::Idle).await;

    t.session
        .send_satellite_datagram(SUB, DatagramType::SosMessage, datagram(b"x"), false)
        .await
        .unwrap();
    // Listening is only entered from Transferring.
    reach(&t.session, SessionState::Listening).await;

    let listening_since = tokio::time::Instant::now();
    reach(&t.session, SessionState::Idle).await;
    assert!(listening_since.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn attach_required_link_connects_and_gates_transfers() {
    let config = SatelliteConfig {
        attach_required: true,
        ..SatelliteConfig::default()
    };
    let t = start_enabled(config).await;

    // Nothing moves until the modem reports a connection.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(*t.session.session_state().borrow(), SessionState::NotConnected);

    t.session.on_modem_state_changed(ModemState::Connected);
    reach(&t.session, SessionState::Connected).await;

    t.session
        .send_satellite_datagram(SUB, DatagramType::SosMessage, datagram(b"x"), false)
        .await
        .unwrap();
    // Suppressed on the way into Transferring, released on the way out.
    wait_until(|| *t.backend.scanning.lock().unwrap() == vec![true, false]).await;
    reach(&t.session, SessionState::Connected).await;

    let snapshot = t.session.session_snapshot().await.unwrap();
    assert!(!snapshot.scanning_suppressed);
}

#[tokio::test(start_paused = true)]
async fn attach_link_drops_to_idle_after_inactivity() {
    let config = SatelliteConfig {
        attach_required: true,
        nb_iot_inactivity_timeout_ms: 10_000,
        ..SatelliteConfig::default()
    };
    let t = start_enabled(config).await;
    t.session.on_modem_state_changed(ModemState::Connected);
    reach(&t.session, SessionState::Connected).await;

    let connected_at = tokio::time::Instant::now();
    reach(&t.session, SessionState::Idle).await;
    assert!(connected_at.elapsed() >= Duration::from_secs(10));

    t.session.on_modem_state_changed(ModemState::NotConnected);
    reach(&t.session, SessionState::NotConnected).await;
}

#[tokio::test(start_paused = true)]
async fn disabling_satellite_powers_off() {
    let t = start_enabled(SatelliteConfig::default()).await;
    t.session.set_satellite_enabled(false);
    reach(&t.session, SessionState::PowerOff).await;

    t.session.set_satellite_enabled(true);
    reach(&t.session, SessionState::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn support_changes_move_through_unavailable() {
    let t = start_enabled(SatelliteConfig::default()).await;
    t.session.set_satellite_supported(false);
    reach(&t.session, SessionState::Unavailable).await;

    t.session.set_satellite_supported(true);
    reach(&t.session, SessionState::PowerOff).await;
}

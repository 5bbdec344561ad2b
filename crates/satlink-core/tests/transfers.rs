//! Send and receive flows through a full session.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{datagram, reach, start, start_enabled, wait_until, FakeBackend, RecordingListener, RecordingSink, SUB};
use satlink_core::{select_backend, PerSubscriptionChannels, SatelliteConfig, SatelliteDatagramListener, SatelliteSession};
use satlink_models::{
    DatagramId, DatagramTransferState as S, DatagramType, ModemState, ResultCode, SatelliteError, SessionState,
    TransferStatus,
};

#[tokio::test(start_paused = true)]
async fn send_reports_sending_terminal_then_idle() {
    let t = start_enabled(SatelliteConfig::default()).await;

    let result = t
        .session
        .send_satellite_datagram(SUB, DatagramType::SosMessage, datagram(b"sos"), true)
        .await;
    assert_eq!(result, Ok(()));

    wait_until(|| t.sink.send_states().len() == 3).await;
    assert_eq!(
        t.sink.send_statuses(),
        vec![
            TransferStatus::new(S::Sending, 1, ResultCode::Success),
            TransferStatus::new(S::SendSuccess, 0, ResultCode::Success),
            TransferStatus::idle(),
        ]
    );
    assert_eq!(t.sink.pointing_ui_requests.load(Ordering::SeqCst), 1);
    assert_eq!(*t.backend.sends.lock().unwrap(), vec![(SUB, b"sos".to_vec(), false)]);

    // Nothing else trails the idle report.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(t.sink.send_states().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn backend_failure_reaches_caller_unchanged() {
    let t = start_enabled(SatelliteConfig::default()).await;
    *t.backend.send_error.lock().unwrap() = Some(SatelliteError::ServiceError);

    let result = t
        .session
        .send_satellite_datagram(SUB, DatagramType::LocationSharing, datagram(b"pos"), false)
        .await;
    assert_eq!(result, Err(SatelliteError::ServiceError));

    wait_until(|| t.sink.send_states().len() == 3).await;
    let statuses = t.sink.send_statuses();
    assert_eq!(statuses[1].state, S::SendFailed);
    assert_eq!(statuses[1].result, ResultCode::ServiceError);
    assert_eq!(statuses[2], TransferStatus::idle());
}

#[tokio::test(start_paused = true)]
async fn requests_right_after_enabling_are_admitted() {
    let t = start(SatelliteConfig::default());
    t.session.set_satellite_enabled(true);

    let send = t
        .session
        .send_satellite_datagram(SUB, DatagramType::SosMessage, datagram(b"x"), false)
        .await;
    assert_eq!(send, Ok(()));
    assert_eq!(t.backend.sends.lock().unwrap().len(), 1);

    let t = start(SatelliteConfig::default());
    t.session.set_satellite_enabled(true);
    let poll = t.session.poll_pending_satellite_datagrams(SUB).await;
    assert_eq!(poll, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn last_pushed_datagram_reaches_listener_and_backend() {
    let t = start_enabled(SatelliteConfig::default()).await;
    let listener = RecordingListener::new();
    t.session
        .register_for_satellite_datagram(SUB, listener.clone())
        .await
        .unwrap();

    t.backend.push(SUB, 42, b"last-one", 0);
    wait_until(|| listener.count() == 1).await;
    wait_until(|| t.sink.receive_states() == vec![S::ReceiveNone, S::Idle]).await;
    assert!(t.backend.acks().is_empty());

    assert_eq!(listener.ack_next(), b"last-one".to_vec());
    wait_until(|| t.backend.acks() == vec![DatagramId::new(42)]).await;
}

#[tokio::test(start_paused = true)]
async fn requests_while_powered_off_are_invalid_modem_state() {
    let t = start(SatelliteConfig::default());

    let send = t
        .session
        .send_satellite_datagram(SUB, DatagramType::SosMessage, datagram(b"x"), false)
        .await;
    let poll = t.session.poll_pending_satellite_datagrams(SUB).await;
    assert_eq!(send, Err(SatelliteError::InvalidModemState));
    assert_eq!(poll, Err(SatelliteError::InvalidModemState));
    assert!(t.backend.sends.lock().unwrap().is_empty());
    assert!(t.sink.send_states().is_empty());
}

#[tokio::test(start_paused = true)]
async fn poll_during_send_is_modem_busy() {
    let t = start_enabled(SatelliteConfig::default()).await;
    t.backend.hang_sends.store(true, Ordering::SeqCst);

    let send = t
        .session
        .send_satellite_datagram(SUB, DatagramType::SosMessage, datagram(b"x"), false);
    let poll = t.session.poll_pending_satellite_datagrams(SUB).await;
    assert_eq!(poll, Err(SatelliteError::ModemBusy));
    assert_eq!(t.backend.polls.load(Ordering::SeqCst), 0);
    assert!(t.sink.receive_states().is_empty());

    t.session.set_satellite_enabled(false);
    assert_eq!(send.await, Err(SatelliteError::RequestAborted));
}

#[tokio::test(start_paused = true)]
async fn send_during_poll_is_modem_busy() {
    let t = start_enabled(SatelliteConfig::default()).await;

    assert_eq!(t.session.poll_pending_satellite_datagrams(SUB).await, Ok(()));
    let send = t
        .session
        .send_satellite_datagram(SUB, DatagramType::KeepAlive, datagram(b"k"), false)
        .await;
    assert_eq!(send, Err(SatelliteError::ModemBusy));
    assert!(t.backend.sends.lock().unwrap().is_empty());

    // The poll finishes with nothing received; sending is admitted again.
    wait_until(|| t.sink.receive_states() == vec![S::Receiving, S::ReceiveNone, S::Idle]).await;
    let send = t
        .session
        .send_satellite_datagram(SUB, DatagramType::KeepAlive, datagram(b"k"), false)
        .await;
    assert_eq!(send, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn pushes_report_counts_and_wait_for_acknowledgment() {
    let t = start_enabled(SatelliteConfig::default()).await;
    let listener = RecordingListener::new();
    t.session
        .register_for_satellite_datagram(SUB, listener.clone())
        .await
        .unwrap();

    t.backend.push(SUB, 1, b"", 0);
    wait_until(|| t.sink.receive_states() == vec![S::ReceiveNone, S::Idle]).await;
    assert_eq!(listener.count(), 0);
    assert_eq!(t.backend.acks(), vec![DatagramId::new(1)]);

    t.backend.push(SUB, 2, b"first", 10);
    t.backend.push(SUB, 3, b"second", 9);
    wait_until(|| t.sink.receive_states().len() == 6).await;
    let success = t.sink.receive_statuses()[2];
    assert_eq!(success.state, S::ReceiveSuccess);
    assert_eq!(success.pending_count, 10);
    assert_eq!(listener.count(), 1);
    assert_eq!(t.backend.acks().len(), 1);

    assert_eq!(listener.ack_next(), b"first".to_vec());
    wait_until(|| listener.count() == 1).await;
    assert_eq!(t.backend.acks(), vec![DatagramId::new(1), DatagramId::new(2)]);

    assert_eq!(listener.ack_next(), b"second".to_vec());
    wait_until(|| t.backend.acks().len() == 3).await;
    assert_eq!(listener.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn every_listener_acknowledges_before_backend_does() {
    let t = start_enabled(SatelliteConfig::default()).await;
    let a = RecordingListener::new();
    let b = RecordingListener::new();
    t.session.register_for_satellite_datagram(SUB, a.clone()).await.unwrap();
    t.session.register_for_satellite_datagram(SUB, b.clone()).await.unwrap();

    t.backend.push(SUB, 7, b"both", 1);
    wait_until(|| a.count() == 1 && b.count() == 1).await;

    a.ack_next();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(t.backend.acks().is_empty());

    b.ack_next();
    wait_until(|| t.backend.acks() == vec![DatagramId::new(7)]).await;
}

#[tokio::test(start_paused = true)]
async fn datagram_channel_is_reference_counted() {
    let t = start_enabled(SatelliteConfig::default()).await;
    let a: Arc<dyn SatelliteDatagramListener> = RecordingListener::new();
    let b: Arc<dyn SatelliteDatagramListener> = RecordingListener::new();

    t.session.register_for_satellite_datagram(SUB, a.clone()).await.unwrap();
    t.session.register_for_satellite_datagram(SUB, b.clone()).await.unwrap();
    assert_eq!(t.backend.registrations.load(Ordering::SeqCst), 1);

    t.session.unregister_for_satellite_datagram(SUB, a).await.unwrap();
    assert_eq!(t.backend.unregistrations.load(Ordering::SeqCst), 0);

    t.session.unregister_for_satellite_datagram(SUB, b).await.unwrap();
    assert_eq!(t.backend.unregistrations.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn poll_waits_for_attachment_then_times_out() {
    let config = SatelliteConfig {
        attach_required: true,
        connect_wait_timeout_ms: 1_000,
        ..SatelliteConfig::default()
    };
    let t = start_enabled(config).await;

    let started = tokio::time::Instant::now();
    let result = t.session.poll_pending_satellite_datagrams(SUB).await;
    assert_eq!(result, Err(SatelliteError::NotReachable));
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(t.backend.polls.load(Ordering::SeqCst), 0);

    wait_until(|| t.sink.receive_states().len() == 3).await;
    let statuses = t.sink.receive_statuses();
    assert_eq!(statuses[0].state, S::WaitingToConnect);
    assert_eq!(statuses[1].state, S::ReceiveFailed);
    assert_eq!(statuses[1].result, ResultCode::NotReachable);
    assert_eq!(statuses[2], TransferStatus::idle());
}

#[tokio::test(start_paused = true)]
async fn waiting_poll_proceeds_once_connected() {
    let config = SatelliteConfig {
        attach_required: true,
        ..SatelliteConfig::default()
    };
    let t = start_enabled(config).await;

    let poll = t.session.poll_pending_satellite_datagrams(SUB);
    wait_until(|| t.sink.receive_states() == vec![S::WaitingToConnect]).await;

    t.session.on_modem_state_changed(ModemState::Connected);
    assert_eq!(poll.await, Ok(()));
    assert_eq!(t.backend.polls.load(Ordering::SeqCst), 1);
    reach(&t.session, SessionState::Transferring).await;
}

#[tokio::test(start_paused = true)]
async fn modem_off_aborts_outstanding_send() {
    let t = start_enabled(SatelliteConfig::default()).await;
    t.backend.hang_sends.store(true, Ordering::SeqCst);

    let send = t
        .session
        .send_satellite_datagram(SUB, DatagramType::SosMessage, datagram(b"x"), false);
    wait_until(|| t.sink.send_states() == vec![S::Sending]).await;

    t.session.on_modem_state_changed(ModemState::Off);
    assert_eq!(send.await, Err(SatelliteError::RequestAborted));
    reach(&t.session, SessionState::PowerOff).await;

    wait_until(|| t.sink.send_states().len() == 3).await;
    let statuses = t.sink.send_statuses();
    assert_eq!(statuses[1].state, S::SendFailed);
    assert_eq!(statuses[1].result, ResultCode::RequestAborted);
    assert_eq!(statuses[2], TransferStatus::idle());
}

#[tokio::test(start_paused = true)]
async fn missing_command_channel_is_invalid_telephony_state() {
    let sink = RecordingSink::new();
    let backend = select_backend(None, PerSubscriptionChannels::new());
    let session = SatelliteSession::start(SatelliteConfig::default(), backend, sink.clone());
    session.set_satellite_enabled(true);
    reach(&session, SessionState::Idle).await;

    let result = session
        .send_satellite_datagram(SUB, DatagramType::SosMessage, datagram(b"x"), false)
        .await;
    assert_eq!(result, Err(SatelliteError::InvalidTelephonyState));

    let listener: Arc<dyn SatelliteDatagramListener> = RecordingListener::new();
    let registered = session.register_for_satellite_datagram(SUB, listener).await;
    assert_eq!(registered, Err(SatelliteError::InvalidTelephonyState));
}

#[tokio::test(start_paused = true)]
async fn fallback_router_forwards_to_subscription_channel() {
    let channel = FakeBackend::new();
    let backend = select_backend(None, PerSubscriptionChannels::new().with_channel(SUB, channel.clone()));
    let session = SatelliteSession::start(SatelliteConfig::default(), backend, RecordingSink::new());
    session.set_satellite_enabled(true);
    reach(&session, SessionState::Idle).await;

    let result = session
        .send_satellite_datagram(SUB, DatagramType::LastSosMessageStillNeedHelp, datagram(b"x"), false)
        .await;
    assert_eq!(result, Ok(()));
    assert_eq!(*channel.sends.lock().unwrap(), vec![(SUB, b"x".to_vec(), true)]);
}

#[tokio::test(start_paused = true)]
async fn transfer_state_listeners_follow_registration() {
    let t = start_enabled(SatelliteConfig::default()).await;
    let observer = RecordingSink::new();
    t.session.register_for_transfer_state(SUB, observer.clone());

    t.session
        .send_satellite_datagram(SUB, DatagramType::KeepAlive, datagram(b"1"), false)
        .await
        .unwrap();
    wait_until(|| observer.send_states() == vec![S::Sending, S::SendSuccess, S::Idle]).await;

    t.session.unregister_for_transfer_state(SUB, observer.clone());
    t.session
        .send_satellite_datagram(SUB, DatagramType::KeepAlive, datagram(b"2"), false)
        .await
        .unwrap();
    wait_until(|| t.sink.send_states().len() == 6).await;
    assert_eq!(observer.send_states().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn snapshot_reflects_idle_directions() {
    let t = start_enabled(SatelliteConfig::default()).await;
    let snapshot = t.session.transfer_snapshot(SUB).await.unwrap();
    assert_eq!(snapshot.send, S::Idle);
    assert_eq!(snapshot.receive, S::Idle);
    assert!(snapshot.sending_idle && snapshot.polling_idle);
}

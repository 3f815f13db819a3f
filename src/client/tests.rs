use std::time::{Duration, Instant};

use super::inflight::Inflight;
use super::{Connection, ConnectionState};
use crate::broker::message::{Delivery, Message, QoS};
use crate::utils::error::{DeliveryError, DisconnectReason};

fn active_connection(capacity: usize) -> (Connection, super::ConnectionHandle) {
    let (conn, handle) = Connection::new("client1", None, capacity);
    conn.authenticate().unwrap();
    conn.activate().unwrap();
    (conn, handle)
}

fn delivery(topic: &str, qos: QoS) -> Delivery {
    Delivery::new(Message::new(topic, "hello").with_qos(qos), qos)
}

#[test]
fn test_connection_new() {
    let (conn, handle) = Connection::new("client1", None, 8);
    assert_eq!(conn.id(), "client1");
    assert_eq!(conn.state(), ConnectionState::Connecting);
    assert_eq!(handle.client_id(), "client1");
    assert_eq!(handle.session_id(), conn.session_id());
    assert!(!handle.is_closed());
}

#[test]
fn test_state_machine_happy_path() {
    let (conn, _handle) = Connection::new("client1", None, 8);
    conn.authenticate().unwrap();
    assert_eq!(conn.state(), ConnectionState::Authenticated);
    conn.activate().unwrap();
    assert!(conn.is_active());
    assert!(conn.close(DisconnectReason::ClientClosed));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[test]
fn test_cannot_activate_without_authentication() {
    let (conn, _handle) = Connection::new("client1", None, 8);
    let err = conn.activate().unwrap_err();
    assert_eq!(err.from, ConnectionState::Connecting);
    assert_eq!(err.to, ConnectionState::Active);
}

#[test]
fn test_disconnected_is_terminal() {
    let (conn, handle) = active_connection(8);
    assert!(conn.close(DisconnectReason::DeliveryTimeout));
    assert!(!conn.close(DisconnectReason::ClientClosed));
    assert!(conn.authenticate().is_err());
    assert!(conn.activate().is_err());
    assert!(handle.is_closed());
    assert_eq!(
        handle.disconnect_reason(),
        Some(DisconnectReason::DeliveryTimeout)
    );
}

#[tokio::test]
async fn test_deliver_and_receive() {
    let (conn, mut handle) = active_connection(8);
    conn.deliver(delivery("x/y", QoS::AtMostOnce), Duration::from_millis(50))
        .await
        .unwrap();

    let received = handle.recv().await.unwrap();
    assert_eq!(received.topic(), "x/y");
    assert_eq!(received.packet_id, None);
}

#[tokio::test]
async fn test_deliver_to_inactive_connection_fails() {
    let (conn, _handle) = Connection::new("client1", None, 8);
    let result = conn
        .deliver(delivery("x/y", QoS::AtMostOnce), Duration::from_millis(50))
        .await;
    assert_eq!(result, Err(DeliveryError::Closed));
}

#[tokio::test]
async fn test_full_queue_times_out() {
    let (conn, _handle) = active_connection(1);
    conn.deliver(delivery("x/y", QoS::AtLeastOnce), Duration::from_millis(10))
        .await
        .unwrap();

    let result = conn
        .deliver(delivery("x/y", QoS::AtLeastOnce), Duration::from_millis(10))
        .await;
    assert_eq!(result, Err(DeliveryError::Timeout));
    // the failed delivery is not left in flight
    assert_eq!(conn.inflight_len(), 1);
}

#[tokio::test]
async fn test_close_unblocks_waiting_delivery() {
    let (conn, _handle) = active_connection(1);
    let conn = std::sync::Arc::new(conn);
    conn.deliver(delivery("x/y", QoS::AtMostOnce), Duration::from_secs(5))
        .await
        .unwrap();

    let waiting = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.deliver(delivery("x/y", QoS::AtMostOnce), Duration::from_secs(30))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.close(DisconnectReason::ClientClosed);

    let result = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("publisher stayed blocked")
        .unwrap();
    assert_eq!(result, Err(DeliveryError::Closed));
}

#[tokio::test]
async fn test_handle_stops_yielding_after_close() {
    let (conn, mut handle) = active_connection(8);
    conn.deliver(delivery("x/y", QoS::AtMostOnce), Duration::from_millis(50))
        .await
        .unwrap();
    conn.close(DisconnectReason::ClientClosed);

    assert!(handle.recv().await.is_none());
    assert!(handle.try_recv().is_none());
}

#[tokio::test]
async fn test_qos1_delivery_tracked_until_acknowledged() {
    let (conn, mut handle) = active_connection(8);
    conn.deliver(delivery("x/y", QoS::AtLeastOnce), Duration::from_millis(50))
        .await
        .unwrap();

    let received = handle.recv().await.unwrap();
    let packet_id = received.packet_id.expect("qos1 delivery carries a packet id");
    assert_eq!(conn.inflight_len(), 1);

    assert!(conn.acknowledge(packet_id));
    assert!(!conn.acknowledge(packet_id));
    assert_eq!(conn.inflight_len(), 0);
}

#[tokio::test]
async fn test_resend_expired_marks_duplicates() {
    let (conn, mut handle) = active_connection(8);
    conn.deliver(delivery("x/y", QoS::AtLeastOnce), Duration::from_millis(50))
        .await
        .unwrap();
    let first = handle.recv().await.unwrap();
    assert!(!first.dup);

    let later = Instant::now() + Duration::from_secs(10);
    let (resent, dropped) = conn.resend_expired(later, Duration::from_secs(5), 3);
    assert_eq!((resent, dropped), (1, 0));

    let again = handle.recv().await.unwrap();
    assert!(again.dup);
    assert_eq!(again.packet_id, first.packet_id);
}

#[test]
fn test_inflight_packet_ids_skip_zero_and_in_use() {
    let mut inflight = Inflight::new();
    let mut first = delivery("a", QoS::AtLeastOnce);
    let mut second = delivery("b", QoS::AtLeastOnce);

    assert_eq!(inflight.track(&mut first), Some(1));
    assert_eq!(inflight.track(&mut second), Some(2));
    assert_eq!(second.packet_id, Some(2));
    assert!(inflight.get(1).is_some());
}

#[test]
fn test_inflight_sweep_drops_after_max_retries() {
    let mut inflight = Inflight::new();
    let mut d = delivery("a", QoS::AtLeastOnce);
    inflight.track(&mut d);

    let timeout = Duration::from_secs(1);
    let mut now = Instant::now();
    for attempt in 1..=2u8 {
        now += Duration::from_secs(2);
        let sweep = inflight.sweep(now, timeout, 2);
        assert_eq!(sweep.resend.len(), 1);
        assert!(sweep.resend[0].dup);
        assert!(inflight.mark_resent(1, now));
        assert_eq!(inflight.get(1).unwrap().retries, attempt);
    }

    now += Duration::from_secs(2);
    let sweep = inflight.sweep(now, timeout, 2);
    assert!(sweep.resend.is_empty());
    assert_eq!(sweep.dropped, vec![1]);
    assert!(inflight.is_empty());
}

#[test]
fn test_inflight_sweep_without_resend_does_not_count_attempt() {
    let mut inflight = Inflight::new();
    let mut d = delivery("a", QoS::AtLeastOnce);
    inflight.track(&mut d);

    let later = Instant::now() + Duration::from_secs(2);
    for _ in 0..3 {
        let sweep = inflight.sweep(later, Duration::from_secs(1), 1);
        assert_eq!(sweep.resend.len(), 1);
        assert!(sweep.dropped.is_empty());
    }
    assert_eq!(inflight.get(1).unwrap().retries, 0);
    assert!(!inflight.get(1).unwrap().delivery.dup);
    assert!(!inflight.mark_resent(9, later));
}

#[tokio::test]
async fn test_full_queue_resend_is_retried_not_dropped() {
    let (conn, mut handle) = active_connection(1);
    conn.deliver(delivery("x/y", QoS::AtLeastOnce), Duration::from_millis(50))
        .await
        .unwrap();

    // queue still holds the original: nothing re-sent, nothing dropped
    for _ in 0..2 {
        let (resent, dropped) = conn.resend_expired(Instant::now(), Duration::ZERO, 1);
        assert_eq!((resent, dropped), (0, 0));
    }
    assert_eq!(conn.inflight_len(), 1);

    let original = handle.recv().await.unwrap();
    assert!(!original.dup);

    let (resent, dropped) = conn.resend_expired(Instant::now(), Duration::ZERO, 1);
    assert_eq!((resent, dropped), (1, 0));
    let again = handle.recv().await.unwrap();
    assert!(again.dup);
    assert_eq!(again.packet_id, original.packet_id);

    // the one allowed attempt is used up
    let (resent, dropped) = conn.resend_expired(Instant::now(), Duration::ZERO, 1);
    assert_eq!((resent, dropped), (0, 1));
    assert_eq!(conn.inflight_len(), 0);
}

#[tokio::test]
async fn test_ordered_delivery_goes_ahead_of_waiting_deliver() {
    let (conn, mut handle) = active_connection(8);
    let conn = std::sync::Arc::new(conn);

    let order = conn.ordered().await;
    let live = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.deliver(delivery("live", QoS::AtMostOnce), Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(handle.try_recv().is_none());

    order
        .deliver(delivery("replay", QoS::AtMostOnce), Duration::from_millis(50))
        .await
        .unwrap();
    drop(order);
    live.await.unwrap().unwrap();

    assert_eq!(handle.recv().await.unwrap().topic(), "replay");
    assert_eq!(handle.recv().await.unwrap().topic(), "live");
}

#[tokio::test]
async fn test_deliver_times_out_waiting_for_order_lock() {
    let (conn, _handle) = active_connection(8);
    let _order = conn.ordered().await;
    let result = conn
        .deliver(delivery("x/y", QoS::AtMostOnce), Duration::from_millis(10))
        .await;
    assert_eq!(result, Err(DeliveryError::Timeout));
}

#[test]
fn test_incoming_qos2_ids() {
    let (conn, _handle) = active_connection(8);
    assert!(conn.begin_incoming(7));
    assert!(!conn.begin_incoming(7));
    assert!(conn.release_incoming(7));
    assert!(!conn.release_incoming(7));
    assert!(conn.begin_incoming(7));
}

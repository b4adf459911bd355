use abyss_core::{AbyssError, Identity};
use abyss_node::{Engine, EventKind};

fn pem() -> Vec<u8> {
    Identity::generate().to_pem().unwrap().into_bytes()
}

#[test]
fn blocking_join_and_sync() {
    let engine = Engine::new().unwrap();
    let resolver_a = engine.new_path_resolver();
    let resolver_b = engine.new_path_resolver();
    let a = engine.new_host(&pem(), resolver_a).unwrap();
    let b = engine.new_host(&pem(), resolver_b).unwrap();
    let world_a = engine.host_open_world(a, "/rooms/1").unwrap();
    let url = engine.world_url(world_a).unwrap();

    let world_b = std::thread::scope(|s| {
        let joiner = s.spawn(|| engine.host_join_world(b, &url, 5_000));
        let (kind, request) = engine.world_wait_event(world_a).unwrap();
        assert_eq!(kind, EventKind::PeerRequest);
        let peer = engine.world_peer_request_accept(request).unwrap();
        assert_eq!(
            engine.world_peer_id(peer).unwrap(),
            engine.world_peer_request_peer(request).unwrap()
        );
        joiner.join().unwrap().unwrap()
    });

    assert_eq!(engine.world_wait_event(world_a).unwrap().0, EventKind::PeerJoined);
    assert_eq!(engine.world_wait_event(world_b).unwrap().0, EventKind::PeerJoined);

    engine
        .world_append_objects(world_b, r#"[{"id":"msg1","text":"hello"}]"#)
        .unwrap();
    let (kind, change) = engine.world_wait_event(world_a).unwrap();
    assert_eq!(kind, EventKind::ObjectsChanged);
    assert_eq!(
        engine.objects_changed_added(change).unwrap(),
        r#"[{"id":"msg1","text":"hello"}]"#
    );
    assert_eq!(engine.objects_changed_removed(change).unwrap(), "[]");
    let sender = engine.objects_changed_peer(change).unwrap();
    assert_eq!(
        engine.world_peer_hash(sender).unwrap(),
        engine.world_hash(world_b).unwrap()
    );
    assert_eq!(engine.world_hash(world_a).unwrap(), engine.world_hash(world_b).unwrap());

    let b_hash = engine.world_hash(world_b).unwrap();
    engine.close_handle(world_b);
    let (kind, leave) = engine.world_wait_event(world_a).unwrap();
    assert_eq!(kind, EventKind::PeerLeft);
    assert_eq!(engine.world_peer_leave_hash(leave).unwrap(), Some(b_hash));
    assert_eq!(engine.world_wait_event(world_b).unwrap_err(), AbyssError::NotFound);

    engine.close_handle(a);
    engine.close_handle(b);
}

#[test]
fn declined_join_is_reported_and_queued() {
    let engine = Engine::new().unwrap();
    let resolver = engine.new_path_resolver();
    let a = engine.new_host(&pem(), resolver).unwrap();
    let b = engine.new_host(&pem(), engine.new_path_resolver()).unwrap();
    let world_a = engine.host_open_world(a, "/rooms/1").unwrap();
    let url = engine.world_url(world_a).unwrap();

    let err = std::thread::scope(|s| {
        let joiner = s.spawn(|| engine.host_join_world(b, &url, 5_000));
        let (_, request) = engine.world_wait_event(world_a).unwrap();
        engine
            .world_peer_request_decline(request, 403, "world full")
            .unwrap();
        assert_eq!(
            engine.world_peer_request_accept(request).unwrap_err(),
            AbyssError::NotFound
        );
        joiner.join().unwrap().unwrap_err()
    });
    assert_eq!(
        err,
        AbyssError::JoinRejected {
            code: 403,
            message: "world full".into()
        }
    );

    // Both the rejected join and the late accept land in the queue.
    let mut bodies = Vec::new();
    while let Some(body) = engine.pop_error() {
        bodies.push(body);
    }
    assert!(bodies.iter().any(|b| b == "join world: join rejected (403): world full"), "{bodies:?}");
    assert!(bodies.iter().any(|b| b.starts_with("accept join:")), "{bodies:?}");
}

#[test]
fn abyst_round_trip_through_handles() {
    let engine = Engine::new().unwrap();
    let a = engine.new_host(&pem(), engine.new_path_resolver()).unwrap();
    let b = engine.new_host(&pem(), engine.new_path_resolver()).unwrap();
    let a_url = engine.host_local_url(a).unwrap();
    let a_hash = a_url
        .trim_start_matches("abyss:")
        .split(':')
        .next()
        .unwrap()
        .to_string();

    assert!(matches!(
        engine.host_abyst_client(b, &a_hash, 1_000),
        Err(AbyssError::PeerUnknown(_))
    ));
    engine.host_open_outbound_connection(b, &a_url).unwrap();
    let client = engine.host_abyst_client(b, &a_hash, 2_000).unwrap();
    let response = engine.abyst_client_request(client, 0, "/anything").unwrap();
    assert_eq!(engine.abyst_response_status(response).unwrap(), 404);
    assert!(engine.abyst_response_body(response).unwrap().is_empty());
    assert!(matches!(
        engine.abyst_client_request(client, 7, "/"),
        Err(AbyssError::InvalidArgument(_))
    ));
}

#[test]
fn releasing_world_wakes_blocked_waiter() {
    let engine = Engine::new().unwrap();
    let a = engine.new_host(&pem(), engine.new_path_resolver()).unwrap();
    let world = engine.host_open_world(a, "/quiet").unwrap();

    let result = std::thread::scope(|s| {
        let waiter = s.spawn(|| engine.world_wait_event(world));
        // Let the waiter block on the empty queue first.
        std::thread::sleep(std::time::Duration::from_millis(200));
        engine.close_handle(world);
        waiter.join().unwrap()
    });
    assert_eq!(result.unwrap_err(), AbyssError::WorldClosed);
    engine.close_handle(a);
}

#[test]
fn releasing_host_fails_inflight_join() {
    let engine = Engine::new().unwrap();
    let a = engine.new_host(&pem(), engine.new_path_resolver()).unwrap();
    let b = engine.new_host(&pem(), engine.new_path_resolver()).unwrap();
    let world_a = engine.host_open_world(a, "/rooms/1").unwrap();
    let url = engine.world_url(world_a).unwrap();

    let result = std::thread::scope(|s| {
        let joiner = s.spawn(|| engine.host_join_world(b, &url, 10_000));
        // The request reached the host, so the join is waiting for an answer.
        let (kind, _request) = engine.world_wait_event(world_a).unwrap();
        assert_eq!(kind, EventKind::PeerRequest);
        engine.close_handle(b);
        joiner.join().unwrap()
    });
    assert_eq!(result.unwrap_err(), AbyssError::Closed);
    assert_eq!(engine.host_local_url(b).unwrap_err(), AbyssError::NotFound);
    engine.close_handle(a);
}

#[test]
fn joined_world_has_its_own_session_id() {
    let engine = Engine::new().unwrap();
    let a = engine.new_host(&pem(), engine.new_path_resolver()).unwrap();
    let b = engine.new_host(&pem(), engine.new_path_resolver()).unwrap();
    let world_a = engine.host_open_world(a, "/rooms/1").unwrap();
    let url = engine.world_url(world_a).unwrap();

    let world_b = std::thread::scope(|s| {
        let joiner = s.spawn(|| engine.host_join_world(b, &url, 5_000));
        let (_, request) = engine.world_wait_event(world_a).unwrap();
        engine.world_peer_request_accept(request).unwrap();
        joiner.join().unwrap().unwrap()
    });
    let host_session = engine.world_session_id(world_a).unwrap();
    let member_session = engine.world_session_id(world_b).unwrap();
    assert_ne!(host_session, member_session);
    assert_eq!(engine.world_url(world_b).unwrap(), url);
}

mod common;

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use common::*;
use core_sim::{
    absorb_notification, run_tick, start_frame_publisher, start_notification_hub,
    start_rpc_server, subscribe_frames, AuthorityEvent, Catalog, FrameOutbox, FrontendReplica,
    ModelAuthority, NotificationLink, RpcClient,
};
use crossbeam_channel::unbounded;
use sim_proto::{
    DefinitionId, ErrorCode, MapPosition, NotificationEnvelope, ReplyPayload, Request, Scalar,
};

fn any_port() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

#[test]
fn concurrent_callers_each_get_their_own_reply() {
    let mut world = seeded_model(Scalar::from_i64(1_000));
    let store = place_built_store(&mut world, 1, MapPosition::new(4, 4));
    let mut authority = ModelAuthority::new(
        test_config(),
        Catalog::builtin(),
        Box::new(unbounded::<NotificationEnvelope>().0),
        false,
    );
    authority.add_planet(world);

    let (events, inbox) = unbounded();
    let server = start_rpc_server(any_port(), events.clone()).expect("rpc server");
    let authority = thread::spawn(move || {
        authority.run(&inbox);
        authority
    });

    let client = RpcClient::connect(server.local_addr(), Duration::from_secs(2)).expect("client");
    let callers: Vec<_> = (0..4)
        .map(|caller| {
            let client = client.clone();
            thread::spawn(move || {
                for call in 0..25 {
                    let name = format!("caller-{caller}-{call}");
                    let reply = client
                        .call(Request::RenameBuilding {
                            planet_id: PLANET,
                            tycoon_id: TYCOON,
                            building_id: store,
                            name: name.clone(),
                        })
                        .expect("transport");
                    let Ok(ReplyPayload::Building(renamed)) = reply else {
                        panic!("unexpected reply {reply:?}");
                    };
                    assert_eq!(renamed.name.as_deref(), Some(name.as_str()));
                }
            })
        })
        .collect();
    for caller in callers {
        caller.join().expect("caller");
    }

    assert_eq!(client.call(Request::Ping).expect("transport"), Ok(ReplyPayload::Pong));
    events.send(AuthorityEvent::Shutdown).expect("authority alive");
    let authority = authority.join().expect("authority");
    let renamed = authority
        .planet(PLANET)
        .and_then(|model| model.buildings.get(&store))
        .and_then(|building| building.name.clone())
        .expect("renamed");
    assert!(renamed.ends_with("-24"));
}

#[test]
fn read_only_authority_answers_pings_and_refuses_writes() {
    let mut world = seeded_model(Scalar::from_i64(1_000));
    let store = place_built_store(&mut world, 1, MapPosition::new(4, 4));
    let mut authority = ModelAuthority::new(
        test_config(),
        Catalog::builtin(),
        Box::new(unbounded::<NotificationEnvelope>().0),
        true,
    );
    authority.add_planet(world);

    let (events, inbox) = unbounded();
    let server = start_rpc_server(any_port(), events.clone()).expect("rpc server");
    let authority = thread::spawn(move || authority.run(&inbox));

    let client = RpcClient::connect(server.local_addr(), Duration::from_secs(2)).expect("client");
    assert_eq!(client.call(Request::Ping).expect("transport"), Ok(ReplyPayload::Pong));
    assert_eq!(
        client
            .call(Request::DemolishBuilding {
                planet_id: PLANET,
                tycoon_id: TYCOON,
                building_id: store,
            })
            .expect("transport"),
        Err(ErrorCode::ReadOnly)
    );

    events.send(AuthorityEvent::Shutdown).expect("authority alive");
    authority.join().expect("authority");
}

#[test]
fn a_construction_flows_from_front_end_through_simulation_and_back() {
    let config = test_config();
    let backoff = config.reconnect_backoff();
    let cash = Scalar::from_i64(10_000);

    let (events, inbox) = unbounded();
    let hub = start_notification_hub(any_port(), events.clone()).expect("hub");
    let hub_addr = hub.local_addr();
    let rpc = start_rpc_server(any_port(), events.clone()).expect("rpc server");

    let mut authority =
        ModelAuthority::new(config.clone(), Catalog::builtin(), Box::new(hub), false);
    authority.add_planet(seeded_model(cash));

    // Simulation side: its own replica plus the frame channel.
    let publisher = start_frame_publisher(any_port(), config.frame_backlog_limit).expect("frames");
    subscribe_frames(publisher.local_addr(), backoff, events.clone(), AuthorityEvent::frame)
        .expect("frame subscriber");
    let sim_link = NotificationLink::connect(hub_addr, backoff).expect("sim link");
    let mut app = planet_app(seeded_model(cash));

    let authority = thread::spawn(move || {
        authority.run(&inbox);
        authority
    });

    let mut front_end = FrontendReplica::new(
        RpcClient::connect(rpc.local_addr(), config.rpc_timeout()).expect("client"),
        NotificationLink::connect(hub_addr, backoff).expect("front-end link"),
    );
    front_end.add_planet(seeded_model(cash));
    // Broadcasts are at-most-once: give both links time to subscribe.
    thread::sleep(Duration::from_millis(300));

    let reply = front_end
        .mutate(Request::ConstructBuilding {
            planet_id: PLANET,
            tycoon_id: TYCOON,
            company_id: COMPANY,
            definition_id: DefinitionId::new("store"),
            position: MapPosition::new(4, 4),
            name: Some("Corner Store".into()),
        })
        .expect("transport");
    let Ok(ReplyPayload::Building(building)) = reply else {
        panic!("unexpected reply {reply:?}");
    };
    assert!(front_end.building(PLANET, building.id).is_some());

    let mut absorbed = 0;
    while absorbed < 3 {
        let envelope = sim_link
            .inbound()
            .recv_timeout(Duration::from_secs(5))
            .expect("mutation broadcast");
        if absorb_notification(&mut app, &envelope) {
            absorbed += 1;
        }
    }
    assert!(model(&app).constructions.contains(&building.id));

    for _ in 0..10 {
        run_tick(&mut app).expect("frame");
        let bytes = app
            .world
            .resource_mut::<FrameOutbox>()
            .encoded
            .take()
            .expect("encoded frame");
        publisher.publish(bytes);
    }
    assert!(model(&app)
        .buildings
        .get(&building.id)
        .is_some_and(|simulated| simulated.is_constructed()));

    let caught_up = wait_until(Duration::from_secs(5), || {
        front_end.sync();
        front_end.planet(PLANET).is_some_and(|planet| {
            planet.planet_snapshot().time == 10
                && planet
                    .buildings
                    .get(&building.id)
                    .is_some_and(|replicated| replicated.is_constructed())
                && planet
                    .corporations
                    .get(&CORPORATION)
                    .is_some_and(|corporation| corporation.cash == cash - Scalar::from_i64(250))
        })
    });
    assert!(caught_up, "front end never saw the finished building");

    let replica = front_end.planet(PLANET).expect("planet");
    let finished = replica.buildings.get(&building.id).expect("building");
    assert_eq!(finished.name.as_deref(), Some("Corner Store"));
    assert_eq!(finished.construction_finished_at, Some(10));
    assert!(!replica.constructions.contains(&building.id));

    events.send(AuthorityEvent::Shutdown).expect("authority alive");
    let authority = authority.join().expect("authority");
    let canonical = authority.planet(PLANET).expect("planet");
    assert_eq!(canonical.planet_snapshot().time, 10);
    assert!(canonical
        .buildings
        .get(&building.id)
        .is_some_and(|stored| stored.is_constructed()));
}

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_test::assert_ok;
use tokio_util::codec::Framed;
use ulid::Ulid;

use triplock::notify::{Notification, TemplateKind};
use triplock::tenant::{TenantManager, TenantSettings};
use triplock::wire::{self, Frame, JsonLinesCodec};

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("triplock_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, TenantSettings::default()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm).await;
            });
        }
    });

    (addr, tm)
}

struct Client {
    framed: Framed<TcpStream, JsonLinesCodec>,
    /// Notifications that arrived while waiting for a reply.
    inbox: VecDeque<Notification>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self { framed: Framed::new(socket, JsonLinesCodec::default()), inbox: VecDeque::new() }
    }

    async fn next_frame(&mut self) -> Option<Frame> {
        let line = self.framed.next().await?.unwrap();
        Some(serde_json::from_slice(&line).unwrap())
    }

    /// Send one request and wait for its reply.
    async fn call(&mut self, request: Value) -> Result<Value, String> {
        let mut line = serde_json::to_vec(&request).unwrap();
        line.push(b'\n');
        self.framed.get_mut().write_all(&line).await.unwrap();
        loop {
            match self.next_frame().await.expect("server closed the connection") {
                Frame::Ok { result } => return Ok(result),
                Frame::Error { code, .. } => return Err(code),
                Frame::Notification(n) => self.inbox.push_back(n),
            }
        }
    }

    async fn recv_notification(&mut self, timeout: Duration) -> Option<Notification> {
        if let Some(n) = self.inbox.pop_front() {
            return Some(n);
        }
        match tokio::time::timeout(timeout, self.next_frame()).await.ok()?? {
            Frame::Notification(n) => Some(n),
            other => panic!("unexpected frame outside a call: {other:?}"),
        }
    }
}

const WAIT: Duration = Duration::from_secs(2);

async fn create_trip(client: &mut Client, rider: &str) -> Ulid {
    let trip = assert_ok!(client.call(json!({ "op": "create_trip", "rider_id": rider })).await);
    trip["id"].as_str().unwrap().parse().unwrap()
}

async fn create_claim(client: &mut Client, trip_id: Ulid, driver: &str) -> Ulid {
    let request = json!({
        "op": "create_claim",
        "trip_id": trip_id.to_string(),
        "driver_id": driver,
    });
    let claim = assert_ok!(client.call(request).await);
    claim["id"].as_str().unwrap().parse().unwrap()
}

/// Poll until every claim on the trip has been decided.
async fn settled_claims(client: &mut Client, trip_id: Ulid) -> Vec<Value> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let request = json!({ "op": "list_claims", "trip_id": trip_id.to_string() });
        let claims = assert_ok!(client.call(request).await);
        let claims = claims.as_array().unwrap().clone();
        let open = claims
            .iter()
            .any(|c| c["status"] == "pending" || c["status"] == "attempting_accept");
        if !open {
            return claims;
        }
        assert!(tokio::time::Instant::now() < deadline, "claims never settled: {claims:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn accept_over_tcp_claims_trip_and_notifies_rider() {
    let (addr, _tm) = start_test_server().await;
    let mut rider = Client::connect(addr).await;
    let mut driver = Client::connect(addr).await;

    assert_ok!(rider.call(json!({ "op": "listen", "recipient": "rider-1" })).await);
    let trip_id = create_trip(&mut rider, "rider-1").await;
    let claim_id = create_claim(&mut driver, trip_id, "D1").await;

    let accept = json!({ "op": "accept", "claim_id": claim_id.to_string() });
    let reply = assert_ok!(driver.call(accept).await);
    assert_eq!(reply["status"], "attempting_accept");

    let n = rider.recv_notification(WAIT).await.expect("rider notified");
    assert_eq!(n.kind, TemplateKind::TripAccepted);
    assert_eq!(n.payload.trip_id, Some(trip_id));
    assert_eq!(n.payload.data["driver_id"], "D1");

    let trip = assert_ok!(rider.call(json!({ "op": "get_trip", "id": trip_id.to_string() })).await);
    assert_eq!(trip["status"], "claimed");
    assert_eq!(trip["owner_id"], "D1");
    assert_eq!(trip["accepted_claim_id"], claim_id.to_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_drivers_produce_one_winner() {
    let (addr, _tm) = start_test_server().await;
    let mut rider = Client::connect(addr).await;
    assert_ok!(rider.call(json!({ "op": "listen", "recipient": "rider-1" })).await);
    let trip_id = create_trip(&mut rider, "rider-1").await;

    let drivers: Vec<String> = (0..6).map(|i| format!("D{i}")).collect();
    let mut clients = Vec::new();
    for driver in &drivers {
        let mut client = Client::connect(addr).await;
        assert_ok!(client.call(json!({ "op": "listen", "recipient": driver })).await);
        let claim_id = create_claim(&mut client, trip_id, driver).await;
        clients.push((driver.clone(), claim_id, client));
    }

    let taps = clients.into_iter().map(|(driver, claim_id, mut client)| {
        tokio::spawn(async move {
            // A claim superseded before its tap lands refuses the tap.
            let _ = client.call(json!({ "op": "accept", "claim_id": claim_id.to_string() })).await;
            (driver, client)
        })
    });
    let mut clients = Vec::new();
    for tap in taps {
        clients.push(tap.await.unwrap());
    }

    let claims = settled_claims(&mut rider, trip_id).await;
    let winners: Vec<&Value> = claims.iter().filter(|c| c["status"] == "accepted").collect();
    assert_eq!(winners.len(), 1, "{claims:?}");
    let winner = winners[0]["driver_id"].as_str().unwrap().to_string();

    let accepted = rider.recv_notification(WAIT).await.expect("rider notified");
    assert_eq!(accepted.kind, TemplateKind::TripAccepted);
    assert_eq!(accepted.payload.data["driver_id"], winner.as_str());

    for (driver, mut client) in clients {
        if driver == winner {
            continue;
        }
        let n = client.recv_notification(WAIT).await.expect("loser notified");
        assert!(
            matches!(n.kind, TemplateKind::ClaimRejected | TemplateKind::ClaimSuperseded),
            "{driver} got {:?}",
            n.kind
        );
        assert_eq!(n.payload.trip_id, Some(trip_id));
    }

    let trip = assert_ok!(rider.call(json!({ "op": "get_trip", "id": trip_id.to_string() })).await);
    assert_eq!(trip["owner_id"], winner.as_str());
}

#[tokio::test]
async fn claims_on_a_claimed_trip_are_refused() {
    let (addr, _tm) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    assert_ok!(client.call(json!({ "op": "listen", "recipient": "rider-1" })).await);
    let trip_id = create_trip(&mut client, "rider-1").await;
    let claim_id = create_claim(&mut client, trip_id, "D1").await;
    assert_ok!(client.call(json!({ "op": "accept", "claim_id": claim_id.to_string() })).await);
    client.recv_notification(WAIT).await.expect("trip accepted");

    let err = client
        .call(json!({ "op": "create_claim", "trip_id": trip_id.to_string(), "driver_id": "D2" }))
        .await
        .unwrap_err();
    assert_eq!(err, "not_claimable");
}

#[tokio::test]
async fn refusals_carry_error_codes() {
    let (addr, _tm) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let trip_id = create_trip(&mut client, "rider-1").await;

    let err = client
        .call(json!({ "op": "accept", "claim_id": Ulid::new().to_string() }))
        .await
        .unwrap_err();
    assert_eq!(err, "not_found");

    let err = client
        .call(json!({ "op": "update_trip", "id": trip_id.to_string(), "status": "claimed" }))
        .await
        .unwrap_err();
    assert_eq!(err, "invalid_transition");

    create_claim(&mut client, trip_id, "D1").await;
    let err = client
        .call(json!({ "op": "create_claim", "trip_id": trip_id.to_string(), "driver_id": "D1" }))
        .await
        .unwrap_err();
    assert_eq!(err, "duplicate_claim");

    let err = client.call(json!({ "op": "fly_to_moon" })).await.unwrap_err();
    assert_eq!(err, "bad_request");

    let err = client
        .call(json!({ "op": "test_notification", "recipient": "", "title": "t", "body": "b" }))
        .await
        .unwrap_err();
    assert_eq!(err, "invalid_argument");
}

#[tokio::test]
async fn cancelling_a_pending_trip_expires_claims() {
    let (addr, _tm) = start_test_server().await;
    let mut rider = Client::connect(addr).await;
    let mut driver = Client::connect(addr).await;
    assert_ok!(driver.call(json!({ "op": "listen", "recipient": "D1" })).await);

    let trip_id = create_trip(&mut rider, "rider-1").await;
    let claim_id = create_claim(&mut driver, trip_id, "D1").await;
    let cancel = json!({
        "op": "update_trip",
        "id": trip_id.to_string(),
        "status": "cancelled",
        "cancelled_by": "rider",
    });
    let trip = assert_ok!(rider.call(cancel).await);
    assert_eq!(trip["status"], "cancelled");

    let mut kinds = Vec::new();
    while let Some(n) = driver.recv_notification(Duration::from_millis(500)).await {
        kinds.push(n.kind);
    }
    assert!(kinds.contains(&TemplateKind::ClaimExpired), "{kinds:?}");

    let claim =
        assert_ok!(driver.call(json!({ "op": "get_claim", "id": claim_id.to_string() })).await);
    assert_eq!(claim["status"], "expired");
    assert_eq!(claim["reason"], "trip cancelled");
}

#[tokio::test]
async fn test_notification_and_unlisten() {
    let (addr, _tm) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    assert_ok!(client.call(json!({ "op": "listen", "recipient": "u1" })).await);

    let send = json!({
        "op": "test_notification",
        "recipient": "u1",
        "title": "Hi",
        "body": "there",
        "data": { "k": 1 },
    });
    let reply = assert_ok!(client.call(send).await);
    assert_eq!(reply["delivered"], true);
    let n = client.recv_notification(WAIT).await.expect("test notification");
    assert_eq!(n.kind, TemplateKind::General);
    assert_eq!(n.payload.title, "Hi");
    assert_eq!(n.payload.data["k"], 1);

    let reply = assert_ok!(client.call(json!({ "op": "unlisten", "recipient": "u1" })).await);
    assert_eq!(reply["was_listening"], true);
    let send = json!({
        "op": "test_notification",
        "recipient": "u1",
        "title": "Hi",
        "body": "again",
    });
    let reply = assert_ok!(client.call(send).await);
    assert_eq!(reply["delivered"], false);
    assert!(client.recv_notification(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, _tm) = start_test_server().await;
    let mut a = Client::connect(addr).await;
    let mut b = Client::connect(addr).await;
    assert_ok!(b.call(json!({ "op": "use", "tenant": "city_b" })).await);

    let trip_id = create_trip(&mut a, "rider-1").await;
    let err = b.call(json!({ "op": "get_trip", "id": trip_id.to_string() })).await.unwrap_err();
    assert_eq!(err, "not_found");
    assert_ok!(a.call(json!({ "op": "get_trip", "id": trip_id.to_string() })).await);
}

#[tokio::test]
async fn disconnect_drops_listeners() {
    let (addr, tm) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    assert_ok!(client.call(json!({ "op": "listen", "recipient": "u1" })).await);
    assert_ok!(client.call(json!({ "op": "listen", "recipient": "u2" })).await);

    let hub = tm.get_or_create(wire::DEFAULT_TENANT).unwrap().hub.clone();
    assert_eq!(hub.channel_count(), 2);
    drop(client);

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        hub.prune();
        if hub.channel_count() == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "listeners outlived their connection");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

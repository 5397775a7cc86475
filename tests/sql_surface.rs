use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use fleetcal::tenant::{TenantManager, TenantSettings};
use fleetcal::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("fleetcal_int_test_{}", Ulid::new()));
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
                let _ = wire::process_connection(socket, tm, "fleetcal".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user(user)
        .password("fleetcal");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_default()
}

/// A day comfortably in the future, so tests never hit the past-date guard.
fn future(days: u64) -> NaiveDate {
    Utc::now().date_naive() + Days::new(30 + days)
}

async fn add_vehicle(client: &tokio_postgres::Client) -> Ulid {
    let vid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO vehicles (id, name, days, opens, closes) VALUES ('{vid}', 'Civic', 'all', '08:00', '20:00')"
        ))
        .await
        .unwrap();
    vid
}

async fn submit(
    client: &tokio_postgres::Client,
    vid: Ulid,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<SimpleQueryRow, tokio_postgres::Error> {
    let messages = client
        .simple_query(&format!(
            "INSERT INTO bookings (vehicle_id, start_date, end_date, pickup_time, return_time, note) \
             VALUES ('{vid}', '{start}', '{end}', '10:00', '18:00', 'weekend trip')"
        ))
        .await?;
    Ok(rows(messages).remove(0))
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn host_creates_and_lists_vehicle() {
    let (addr, _tm) = start_test_server().await;
    let host = connect(addr, "hana").await;

    let vid = add_vehicle(&host).await;
    let listed = rows(host.simple_query("SELECT * FROM vehicles").await.unwrap());
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(vid.to_string().as_str()));
    assert_eq!(listed[0].get("owner"), Some("hana"));
    assert_eq!(listed[0].get("opens"), Some("08:00"));
}

#[tokio::test]
async fn submission_returns_pending_and_blocks_overlap() {
    let (addr, _tm) = start_test_server().await;
    let host = connect(addr, "hana").await;
    let renter = connect(addr, "ravi").await;
    let other = connect(addr, "olu").await;
    let vid = add_vehicle(&host).await;

    let row = submit(&renter, vid, future(0), future(2)).await.unwrap();
    assert_eq!(row.get("status"), Some("pending"));
    assert!(Ulid::from_string(row.get("id").unwrap()).is_ok());

    // Pending requests already hold their days.
    let err = submit(&other, vid, future(2), future(4)).await.unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    let blocking = rows(
        other
            .simple_query(&format!(
                "SELECT * FROM bookable WHERE vehicle_id = '{vid}' AND start_date = '{}' AND end_date = '{}'",
                future(1),
                future(4)
            ))
            .await
            .unwrap(),
    );
    let days: Vec<_> = blocking.iter().filter_map(|r| r.get("day")).collect();
    assert_eq!(days, vec![future(1).to_string(), future(2).to_string()]);
    assert!(blocking.iter().all(|r| r.get("ok") == Some("f")));

    let clear = rows(
        other
            .simple_query(&format!(
                "SELECT * FROM bookable WHERE vehicle_id = '{vid}' AND start_date = '{}' AND end_date = '{}'",
                future(3),
                future(5)
            ))
            .await
            .unwrap(),
    );
    assert_eq!(clear.len(), 1);
    assert_eq!(clear[0].get("ok"), Some("t"));
    assert_eq!(clear[0].get("day"), None);
}

#[tokio::test]
async fn anonymous_login_cannot_submit() {
    let (addr, _tm) = start_test_server().await;
    let host = connect(addr, "hana").await;
    let guest = connect(addr, "anonymous").await;
    let vid = add_vehicle(&host).await;

    let err = submit(&guest, vid, future(0), future(1)).await.unwrap_err();
    assert_eq!(sqlstate(&err), "28000");

    // A bad range is reported before the missing login.
    let err = submit(&guest, vid, future(3), future(1)).await.unwrap_err();
    assert_eq!(sqlstate(&err), "22023");
}

#[tokio::test]
async fn host_confirms_and_rental_becomes_active() {
    let (addr, _tm) = start_test_server().await;
    let host = connect(addr, "hana").await;
    let renter = connect(addr, "ravi").await;
    let vid = add_vehicle(&host).await;

    let row = submit(&renter, vid, future(10), future(12)).await.unwrap();
    let bid = row.get("id").unwrap().to_string();

    // Only the owner decides.
    let err = renter
        .batch_execute(&format!(
            "INSERT INTO decisions (booking_id, decision) VALUES ('{bid}', 'confirm')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    host.batch_execute(&format!(
        "INSERT INTO decisions (booking_id, decision) VALUES ('{bid}', 'confirm')"
    ))
    .await
    .unwrap();

    let active = rows(
        host.simple_query(&format!("SELECT * FROM active_rentals WHERE vehicle_id = '{vid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].get("id"), Some(bid.as_str()));
    assert_eq!(active[0].get("status"), Some("confirmed"));
    assert_eq!(active[0].get("requester"), Some("ravi"));

    // Not returned yet.
    let err = host
        .batch_execute(&format!(
            "INSERT INTO decisions (booking_id, decision) VALUES ('{bid}', 'complete')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0001");
}

#[tokio::test]
async fn reject_records_reason_and_frees_days() {
    let (addr, _tm) = start_test_server().await;
    let host = connect(addr, "hana").await;
    let renter = connect(addr, "ravi").await;
    let vid = add_vehicle(&host).await;

    let row = submit(&renter, vid, future(5), future(6)).await.unwrap();
    let bid = row.get("id").unwrap().to_string();
    host.batch_execute(&format!(
        "INSERT INTO decisions (booking_id, decision, reason) VALUES ('{bid}', 'reject', 'in the shop')"
    ))
    .await
    .unwrap();

    let listed = rows(
        host.simple_query(&format!("SELECT * FROM bookings WHERE vehicle_id = '{vid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(listed[0].get("status"), Some("rejected"));
    assert_eq!(listed[0].get("decision_note"), Some("in the shop"));

    // Same days can be requested again.
    let again = submit(&renter, vid, future(5), future(6)).await.unwrap();
    assert_eq!(again.get("status"), Some("pending"));
}

#[tokio::test]
async fn renter_cancels_own_booking() {
    let (addr, _tm) = start_test_server().await;
    let host = connect(addr, "hana").await;
    let renter = connect(addr, "ravi").await;
    let stranger = connect(addr, "sam").await;
    let vid = add_vehicle(&host).await;

    let row = submit(&renter, vid, future(1), future(3)).await.unwrap();
    let bid = row.get("id").unwrap().to_string();

    let err = stranger
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{bid}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    renter
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{bid}'"))
        .await
        .unwrap();

    let status = rows(
        host.simple_query(&format!(
            "SELECT * FROM day_status WHERE vehicle_id = '{vid}' AND day = '{}'",
            future(2)
        ))
        .await
        .unwrap(),
    );
    assert_eq!(status[0].get("status"), Some("available"));
}

#[tokio::test]
async fn overrides_and_calendar_projection() {
    let (addr, _tm) = start_test_server().await;
    let host = connect(addr, "hana").await;
    let vid = add_vehicle(&host).await;

    host.batch_execute(&format!(
        "INSERT INTO overrides (vehicle_id, day, available) VALUES ('{vid}', '2030-02-14', false)"
    ))
    .await
    .unwrap();

    let overrides = rows(
        host.simple_query(&format!("SELECT * FROM overrides WHERE vehicle_id = '{vid}'"))
            .await
            .unwrap(),
    );
    assert_eq!(overrides.len(), 1);
    assert_eq!(overrides[0].get("day"), Some("2030-02-14"));
    assert_eq!(overrides[0].get("available"), Some("f"));

    let calendar = rows(
        host.simple_query(&format!(
            "SELECT * FROM calendar WHERE vehicle_id = '{vid}' AND year = 2030 AND month = 2"
        ))
        .await
        .unwrap(),
    );
    assert_eq!(calendar.len(), 28);
    let feb14 = calendar
        .iter()
        .find(|r| r.get("day") == Some("2030-02-14"))
        .unwrap();
    assert_eq!(feb14.get("status"), Some("unavailable"));

    let summary = rows(
        host.simple_query(&format!(
            "SELECT * FROM calendar_summary WHERE vehicle_id = '{vid}' AND year = 2030 AND month = 2 AND months = 2"
        ))
        .await
        .unwrap(),
    );
    assert_eq!(summary.len(), 2);
    assert_eq!(summary[0].get("unavailable"), Some("1"));
    assert_eq!(summary[0].get("available"), Some("27"));
    assert_eq!(summary[1].get("month"), Some("3"));

    host.batch_execute(&format!(
        "DELETE FROM overrides WHERE vehicle_id = '{vid}' AND day = '2030-02-14'"
    ))
    .await
    .unwrap();
    let status = rows(
        host.simple_query(&format!(
            "SELECT * FROM day_status WHERE vehicle_id = '{vid}' AND day = '2030-02-14'"
        ))
        .await
        .unwrap(),
    );
    assert_eq!(status[0].get("status"), Some("available"));
}

#[tokio::test]
async fn disabled_dates_cover_bookings() {
    let (addr, _tm) = start_test_server().await;
    let host = connect(addr, "hana").await;
    let renter = connect(addr, "ravi").await;
    let vid = add_vehicle(&host).await;

    submit(&renter, vid, future(0), future(1)).await.unwrap();

    let disabled = rows(
        renter
            .simple_query(&format!(
                "SELECT * FROM disabled_dates WHERE vehicle_id = '{vid}' AND horizon = 90"
            ))
            .await
            .unwrap(),
    );
    let days: Vec<_> = disabled.iter().filter_map(|r| r.get("day")).collect();
    assert_eq!(days, vec![future(0).to_string(), future(1).to_string()]);
    assert_eq!(
        disabled[0].get("before"),
        Some(Utc::now().date_naive().to_string().as_str())
    );
}

#[tokio::test]
async fn owner_cannot_delete_vehicle_with_open_requests() {
    let (addr, _tm) = start_test_server().await;
    let host = connect(addr, "hana").await;
    let renter = connect(addr, "ravi").await;
    let vid = add_vehicle(&host).await;

    let row = submit(&renter, vid, future(0), future(1)).await.unwrap();
    let bid = row.get("id").unwrap().to_string();

    assert!(host
        .batch_execute(&format!("DELETE FROM vehicles WHERE id = '{vid}'"))
        .await
        .is_err());

    renter
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{bid}'"))
        .await
        .unwrap();
    host.batch_execute(&format!("DELETE FROM vehicles WHERE id = '{vid}'"))
        .await
        .unwrap();

    let err = host
        .simple_query(&format!("SELECT * FROM bookings WHERE vehicle_id = '{vid}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "02000");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let host = connect(addr, "hana").await;
    let vid = add_vehicle(&host).await;

    let vid_text = vid.to_string();
    let day_text = "2030-06-01".to_string();
    let rows = host
        .query(
            "SELECT * FROM day_status WHERE vehicle_id = $1 AND day = $2",
            &[&vid_text, &day_text],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let status: &str = rows[0].get("status");
    assert_eq!(status, "available");
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, _tm) = start_test_server().await;
    let host = connect(addr, "hana").await;
    add_vehicle(&host).await;

    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("other_fleet")
        .user("hana")
        .password("fleetcal");
    let (other, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let listed = rows(other.simple_query("SELECT * FROM vehicles").await.unwrap());
    assert!(listed.is_empty());
}

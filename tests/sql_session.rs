use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use spotbook::engine::Engine;
use spotbook::wire;

const PASSWORD: &str = "spotbook";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("spotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("spotbook.wal")).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

/// Open a connection. The startup `user` name grants nothing; the
/// connection is anonymous until it logs in.
async fn connect(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("spotbook")
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.err().expect("query should fail");
    err.code().expect("server error").code().to_string()
}

fn in_days(n: u64) -> NaiveDate {
    Utc::now().date_naive() + Days::new(n)
}

async fn sign_up(addr: SocketAddr, username: &str) -> String {
    let anon = connect(addr, "anonymous").await;
    anon.simple_query(&format!(
        "INSERT INTO users (username, email, first_name, last_name, password) \
         VALUES ('{username}', '{username}@user.io', 'Demo', 'Lition', 'password-{username}')"
    ))
    .await
    .unwrap();
    user_id(addr, username).await
}

/// A connection logged in as `username`.
async fn sign_in(addr: SocketAddr, username: &str) -> Client {
    let client = connect(addr, username).await;
    let login = rows(
        &client,
        &format!(
            "SELECT * FROM session WHERE credential = '{username}' AND password = 'password-{username}'"
        ),
    )
    .await;
    assert_eq!(login.len(), 1);
    client
}

async fn user_id(addr: SocketAddr, username: &str) -> String {
    let client = sign_in(addr, username).await;
    let session = rows(&client, "SELECT * FROM session").await;
    session[0].get("id").unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_flow_over_the_wire() {
    let addr = start_test_server().await;

    let host_id = sign_up(addr, "host").await;
    sign_up(addr, "guest").await;
    sign_up(addr, "other").await;

    let host = sign_in(addr, "host").await;
    let session = rows(&host, "SELECT * FROM session").await;
    assert_eq!(session[0].get("id"), Some(host_id.as_str()));

    let spot_id = Ulid::new().to_string();
    host.simple_query(&format!(
        "INSERT INTO spots (id, address, city, state, country, lat, lng, name, description, price) \
         VALUES ('{spot_id}', '123 Disney Lane', 'San Francisco', 'California', \
         'United States of America', 37.7645358, -122.4730327, 'App Academy', \
         'Place where web developers are created', 123)"
    ))
    .await
    .unwrap();

    let spots = rows(&host, &format!("SELECT * FROM spots WHERE owner_id = '{host_id}'")).await;
    assert_eq!(spots.len(), 1);
    assert_eq!(spots[0].get("name"), Some("App Academy"));
    assert_eq!(spots[0].get("num_reviews"), Some("0"));
    assert_eq!(spots[0].get("avg_rating"), None);

    // Owners can't book their own spot.
    let (start, end) = (in_days(10), in_days(13));
    let own = format!(
        "INSERT INTO bookings (spot_id, start_date, end_date) VALUES ('{spot_id}', '{start}', '{end}')"
    );
    assert_eq!(sqlstate(&host, &own).await, "42501");

    let guest = sign_in(addr, "guest").await;
    guest
        .simple_query(&format!(
            "INSERT INTO bookings (spot_id, start_date, end_date) \
             VALUES ('{spot_id}', '{start}', '{end}')"
        ))
        .await
        .unwrap();

    // End date lands on the existing start: inclusive overlap.
    let other = sign_in(addr, "other").await;
    let clash = format!(
        "INSERT INTO bookings (spot_id, start_date, end_date) \
         VALUES ('{spot_id}', '{}', '{start}')",
        in_days(8)
    );
    assert_eq!(sqlstate(&other, &clash).await, "23P01");

    let bad_date = format!(
        "INSERT INTO bookings (spot_id, start_date, end_date) \
         VALUES ('{spot_id}', '2030-02-30', '{end}')"
    );
    assert_eq!(sqlstate(&other, &bad_date).await, "22007");

    // Non-owners see which dates are taken, not who took them.
    let seen_by_other = rows(&other, &format!("SELECT * FROM bookings WHERE spot_id = '{spot_id}'")).await;
    assert_eq!(seen_by_other.len(), 1);
    assert_eq!(seen_by_other[0].get("id"), None);
    assert_eq!(seen_by_other[0].get("start_date"), Some(start.to_string().as_str()));

    let seen_by_host = rows(&host, &format!("SELECT * FROM bookings WHERE spot_id = '{spot_id}'")).await;
    assert!(seen_by_host[0].get("user_id").is_some());

    let mine = rows(&guest, "SELECT * FROM bookings").await;
    assert_eq!(mine.len(), 1);

    let anon = connect(addr, "anonymous").await;
    assert_eq!(sqlstate(&anon, "SELECT * FROM bookings").await, "28000");
}

#[tokio::test]
async fn login_failures_and_bad_sql() {
    let addr = start_test_server().await;
    sign_up(addr, "demo-lition").await;

    let anon = connect(addr, "anonymous").await;
    let wrong = "SELECT * FROM session WHERE credential = 'demo-lition' AND password = 'nope'";
    assert_eq!(sqlstate(&anon, wrong).await, "28P01");

    assert!(rows(&anon, "SELECT * FROM session").await.is_empty());
    assert_eq!(sqlstate(&anon, "SELECT * FROM listings").await, "42P01");
    assert_eq!(
        sqlstate(&anon, &format!("DELETE FROM spots WHERE id = '{}'", Ulid::new())).await,
        "P0002"
    );
    let anon_spot = "INSERT INTO spots (address, city, state, country, lat, lng, name, description, price) \
                     VALUES ('1 Main St', 'Austin', 'Texas', 'USA', 30.2, -97.7, 'Loft', 'Downtown', 50)";
    assert_eq!(sqlstate(&anon, anon_spot).await, "28000");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    sign_up(addr, "reviewer").await;
    sign_up(addr, "owner").await;

    let owner = sign_in(addr, "owner").await;
    let spot_id = Ulid::new().to_string();
    owner
        .execute(
            "INSERT INTO spots (id, address, city, state, country, lat, lng, name, description, price) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &[
                &spot_id,
                &"1 Main St",
                &"Austin",
                &"Texas",
                &"USA",
                &"30.2672",
                &"-97.7431",
                &"Bungalow",
                &"Quiet spot near the river",
                &"89.5",
            ],
        )
        .await
        .unwrap();

    let reviewer = sign_in(addr, "reviewer").await;
    reviewer
        .execute(
            "INSERT INTO reviews (spot_id, review, stars) VALUES ($1, $2, $3)",
            &[&spot_id, &"Lovely, would stay again", &"5"],
        )
        .await
        .unwrap();

    let spot = rows(&reviewer, &format!("SELECT * FROM spots WHERE id = '{spot_id}'")).await;
    assert_eq!(spot[0].get("num_reviews"), Some("1"));
    let avg: f64 = spot[0].get("avg_rating").unwrap().parse().unwrap();
    assert_eq!(avg, 5.0);
}

#[tokio::test]
async fn startup_user_name_grants_nothing() {
    let addr = start_test_server().await;
    let victim_id = sign_up(addr, "victim").await;

    // Server password plus the victim's name, but no login.
    let intruder = connect(addr, "victim").await;
    assert!(rows(&intruder, "SELECT * FROM session").await.is_empty());
    let spot = "INSERT INTO spots (address, city, state, country, lat, lng, name, description, price) \
                VALUES ('1 Main St', 'Austin', 'Texas', 'USA', 30.2, -97.7, 'Loft', 'Downtown', 50)";
    assert_eq!(sqlstate(&intruder, spot).await, "28000");
    assert_eq!(
        sqlstate(&intruder, &format!("DELETE FROM users WHERE id = '{victim_id}'")).await,
        "28000"
    );

    // A wrong password doesn't open a session either.
    let guess = "SELECT * FROM session WHERE credential = 'victim' AND password = 'guess'";
    assert_eq!(sqlstate(&intruder, guess).await, "28P01");
    assert!(rows(&intruder, "SELECT * FROM session").await.is_empty());

    // Logging in on one connection doesn't sign in another.
    let victim = sign_in(addr, "victim").await;
    assert_eq!(rows(&victim, "SELECT * FROM session").await[0].get("id"), Some(victim_id.as_str()));
    assert!(rows(&intruder, "SELECT * FROM session").await.is_empty());
}

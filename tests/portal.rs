use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use makerlab::site::SiteManager;
use makerlab::wire;

const PASSWORD: &str = "makerlab";
const OPERATOR: &str = "operator";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("makerlab_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let sites = Arc::new(SiteManager::new(dir, 1000));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let sites = sites.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(
                    socket,
                    sites,
                    PASSWORD.to_string(),
                    OPERATOR.to_string(),
                    None,
                )
                .await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, site: &str, login: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(site)
        .user(login)
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
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn sqlstate_of(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| panic!("expected database error, got {err}"))
}

struct Site {
    addr: SocketAddr,
    name: String,
    op: Client,
}

impl Site {
    async fn open(addr: SocketAddr) -> Self {
        let name = format!("site_{}", Ulid::new());
        let op = connect(addr, &name, OPERATOR).await;
        Self { addr, name, op }
    }

    async fn member(&self, name: &str) -> (Ulid, Client) {
        let id = Ulid::new();
        self.op
            .simple_query(&format!(
                "INSERT INTO users (id, name, is_admin) VALUES ('{id}', '{name}', false)"
            ))
            .await
            .unwrap();
        (id, connect(self.addr, &self.name, &id.to_string()).await)
    }

    async fn machine(&self, name: &str, requires_certification: bool) -> Ulid {
        let row = rows(
            &self.op,
            &format!(
                "INSERT INTO machines (name, type, requires_certification) \
                 VALUES ('{name}', 'fab', {requires_certification}) RETURNING *"
            ),
        )
        .await;
        Ulid::from_string(row[0].get("id").unwrap()).unwrap()
    }
}

async fn request(client: &Client, machine: Ulid, date: &str, time: &str) -> SimpleQueryRow {
    rows(
        client,
        &format!(
            "INSERT INTO bookings (machine_id, date, time) VALUES ('{machine}', '{date}', '{time}') RETURNING *"
        ),
    )
    .await
    .remove(0)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn request_approve_cancel_over_the_wire() {
    let addr = start_test_server().await;
    let site = Site::open(addr).await;
    let (_u1, c1) = site.member("Ada").await;
    let (_u2, c2) = site.member("Bo").await;
    let m = site.machine("Laser", false).await;

    let b1 = request(&c1, m, "2024-06-01", "10:00").await;
    assert_eq!(b1.get("status"), Some("pending"));
    assert_eq!(b1.get("date"), Some("2024-06-01"));
    assert_eq!(b1.get("machine_name"), Some("Laser"));
    let b1_id = b1.get("id").unwrap().to_string();

    // Same slot while pending
    let code = sqlstate_of(
        &c2,
        &format!("INSERT INTO bookings (machine_id, date, time) VALUES ('{m}', '2024-06-01T00:00:00Z', '10:00')"),
    )
    .await;
    assert_eq!(code, "23P01");

    // Members cannot approve
    let code = sqlstate_of(
        &c1,
        &format!("UPDATE bookings SET status = 'approved' WHERE id = '{b1_id}'"),
    )
    .await;
    assert_eq!(code, "42501");

    let approved = rows(
        &site.op,
        &format!("UPDATE bookings SET status = 'approved' WHERE id = '{b1_id}' RETURNING *"),
    )
    .await;
    assert_eq!(approved[0].get("status"), Some("approved"));

    let machine = rows(&site.op, &format!("SELECT * FROM machines WHERE id = '{m}'")).await;
    assert_eq!(machine[0].get("held_slots"), Some(r#"["2024-06-01-10:00"]"#));

    // Owner cancels, slot frees up
    rows(
        &c1,
        &format!("UPDATE bookings SET status = 'canceled' WHERE id = '{b1_id}'"),
    )
    .await;
    let machine = rows(&site.op, &format!("SELECT * FROM machines WHERE id = '{m}'")).await;
    assert_eq!(machine[0].get("held_slots"), Some("[]"));

    let b3 = request(&c2, m, "2024-06-01", "10:00").await;
    assert_eq!(b3.get("status"), Some("pending"));
}

#[tokio::test]
async fn certification_and_availability_errors() {
    let addr = start_test_server().await;
    let site = Site::open(addr).await;
    let (u, c) = site.member("Cy").await;
    let m = site.machine("Waterjet", true).await;

    let insert = format!("INSERT INTO bookings (machine_id, date, time) VALUES ('{m}', '2024-06-01', '10:00')");
    assert_eq!(sqlstate_of(&c, &insert).await, "P0003");

    rows(
        &site.op,
        &format!("INSERT INTO certifications (user_id, machine_id) VALUES ('{u}', '{m}')"),
    )
    .await;
    let certs = rows(&c, "SELECT * FROM certifications").await;
    assert_eq!(certs.len(), 1);
    assert_eq!(certs[0].get("machine_id"), Some(m.to_string().as_str()));

    rows(
        &site.op,
        &format!("UPDATE machines SET status = 'maintenance', maintenance_note = 'nozzle' WHERE id = '{m}'"),
    )
    .await;
    assert_eq!(sqlstate_of(&c, &insert).await, "55000");

    rows(
        &site.op,
        &format!("UPDATE machines SET status = 'available', maintenance_note = NULL WHERE id = '{m}'"),
    )
    .await;
    rows(&c, &insert).await;
}

#[tokio::test]
async fn invalid_input_sqlstates() {
    let addr = start_test_server().await;
    let site = Site::open(addr).await;
    let (_u, c) = site.member("Dee").await;
    let m = site.machine("Lathe", false).await;

    let code = sqlstate_of(
        &c,
        &format!("INSERT INTO bookings (machine_id, date, time) VALUES ('{m}', 'someday', '10:00')"),
    )
    .await;
    assert_eq!(code, "22023");

    let b = request(&c, m, "2024-06-01", "10:00").await;
    let id = b.get("id").unwrap();
    let code = sqlstate_of(
        &site.op,
        &format!("UPDATE bookings SET status = 'done' WHERE id = '{id}'"),
    )
    .await;
    assert_eq!(code, "22P02");

    let code = sqlstate_of(
        &site.op,
        &format!("SELECT * FROM bookings WHERE id = '{}'", Ulid::new()),
    )
    .await;
    assert_eq!(code, "P0002");

    assert_eq!(sqlstate_of(&c, "SELECT * FROM holds").await, "42P01");

    // An extra WHERE term is refused rather than ignored
    let code = sqlstate_of(
        &c,
        &format!("DELETE FROM bookings WHERE id = '{id}' AND status = 'approved'"),
    )
    .await;
    assert_eq!(code, "42703");
    assert_eq!(rows(&c, "SELECT * FROM bookings").await.len(), 1);
}

#[tokio::test]
async fn unknown_login_is_unauthorized() {
    let addr = start_test_server().await;
    let site = Site::open(addr).await;
    let stranger = connect(addr, &site.name, "mallory").await;
    assert_eq!(sqlstate_of(&stranger, "SELECT * FROM machines").await, "28000");
}

#[tokio::test]
async fn listings_follow_principal() {
    let addr = start_test_server().await;
    let site = Site::open(addr).await;
    let (u1, c1) = site.member("Eve").await;
    let (_u2, c2) = site.member("Fin").await;
    let m = site.machine("Saw", false).await;

    request(&c1, m, "2024-06-01", "10:00").await;
    request(&c1, m, "2024-06-03", "10:00").await;
    request(&c2, m, "2024-06-02", "10:00").await;

    // Member sees own bookings, newest date first
    let own = rows(&c1, "SELECT * FROM bookings").await;
    let dates: Vec<_> = own.iter().map(|r| r.get("date").unwrap()).collect();
    assert_eq!(dates, vec!["2024-06-03", "2024-06-01"]);

    assert_eq!(
        sqlstate_of(&c2, &format!("SELECT * FROM bookings WHERE user_id = '{u1}'")).await,
        "42501"
    );

    // Administrator sees everything, enriched
    let all = rows(&site.op, "SELECT * FROM bookings").await;
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|r| r.get("machine_name") == Some("Saw")));

    let slots = rows(
        &c2,
        &format!("SELECT * FROM slots WHERE machine_id = '{m}' AND date = '2024-06-01'"),
    )
    .await;
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].get("time"), Some("10:00"));
    assert_eq!(slots[0].get("status"), Some("pending"));
}

#[tokio::test]
async fn extended_protocol_status_update() {
    let addr = start_test_server().await;
    let site = Site::open(addr).await;
    let (_u, c) = site.member("Gil").await;
    let m = site.machine("Press", false).await;

    let b = request(&c, m, "2024-06-01", "10:00").await;
    let id = b.get("id").unwrap().to_string();

    let n = site
        .op
        .execute(
            "UPDATE bookings SET status = $1 WHERE id = $2",
            &[&"approved", &id.as_str()],
        )
        .await
        .unwrap();
    assert_eq!(n, 1);

    let n = c
        .execute("DELETE FROM bookings WHERE id = $1", &[&id.as_str()])
        .await
        .unwrap();
    assert_eq!(n, 1);

    let machine = rows(&site.op, &format!("SELECT * FROM machines WHERE id = '{m}'")).await;
    assert_eq!(machine[0].get("held_slots"), Some("[]"));
}

#[tokio::test]
async fn sites_are_isolated() {
    let addr = start_test_server().await;
    let north = Site::open(addr).await;
    let south = Site::open(addr).await;

    north.machine("Kiln", false).await;
    assert_eq!(rows(&north.op, "SELECT * FROM machines").await.len(), 1);
    assert!(rows(&south.op, "SELECT * FROM machines").await.is_empty());
}

#![allow(dead_code)]

//! Shared PostgreSQL container for integration tests.
//!
//! One container is started per test binary. Each test gets its own database in it, so
//! tests can run in parallel without seeing each other's version tables or locks.

use once_cell::sync::OnceCell;
use postgres::{Client, NoTls};
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

/// The runtime the container was started on, kept alive with it until the process exits.
struct Shared {
    _runtime: tokio::runtime::Runtime,
    port: u16,
}

static SHARED: OnceCell<Shared> = OnceCell::new();

fn port() -> u16 {
    SHARED
        .get_or_init(|| {
            let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            let port = runtime.block_on(async {
                let container = Postgres::default()
                    .start()
                    .await
                    .expect("failed to start postgres container");
                let port = container
                    .get_host_port_ipv4(5432)
                    .await
                    .expect("failed to get postgres port");
                // The container is removed when the test process exits.
                std::mem::forget(container);
                port
            });
            Shared {
                _runtime: runtime,
                port,
            }
        })
        .port
}

/// Connection URL for database `db` in the shared container.
pub fn url_with_db(db: &str) -> String {
    format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        PG_USER,
        PG_PASSWORD,
        port(),
        db
    )
}

/// Creates a database with a unique name and returns its name.
pub fn fresh_postgres_db() -> String {
    let mut admin =
        Client::connect(&url_with_db(PG_DB), NoTls).expect("failed to connect as admin");
    let name = format!("test_{}", Uuid::new_v4().simple());
    admin
        .batch_execute(&format!("CREATE DATABASE \"{}\"", name))
        .expect("failed to create test database");
    name
}

/// Opens another connection to database `db`.
pub fn connect(db: &str) -> Client {
    Client::connect(&url_with_db(db), NoTls).expect("failed to connect to test database")
}

/// A connection to a fresh, isolated database.
pub fn get_test_client() -> Client {
    connect(&fresh_postgres_db())
}

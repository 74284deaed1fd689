//! Basic example showing how an N+1 pattern shows up in the recorded tree.
//!
//! Run with: RUST_LOG=debug cargo run --example basic

use std::collections::BTreeMap;
use std::sync::Arc;

use sea_orm::{ConnectionTrait, DatabaseBackend, MockDatabase, Statement, Value};
use sea_orm_nplusone::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn row(id: i32, name: &str) -> BTreeMap<&'static str, Value> {
    BTreeMap::from([("id", Value::from(id)), ("name", Value::from(name.to_owned()))])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sea_orm_nplusone=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let tracker = Arc::new(Tracker::new(NPlusOneConfig::development("basic")));

    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![row(1, "Cheese Cake"), row(2, "Chocolate Cake")]])
        .append_query_results([vec![row(10, "Apple")]])
        .append_query_results([vec![row(20, "Banana")]])
        .into_connection()
        .with_nplusone(Arc::clone(&tracker));

    {
        let _session = db.session(SessionBoundary::Join);

        let cakes = db
            .query_all(Statement::from_string(
                DatabaseBackend::Postgres,
                r#"SELECT "id", "name" FROM "cake""#,
            ))
            .await?;

        for cake in cakes {
            let id: i32 = cake.try_get("", "id")?;
            let _load = db.lazy_load(LazyInitialisation::collection("basic::Cake", "fruits"));
            db.query_all(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                r#"SELECT "id", "name" FROM "fruit" WHERE "cake_id" = $1"#,
                [id.into()],
            ))
            .await?;
        }
    }

    match SessionAssertion::within_last_session()
        .no_implicit_operations()
        .verify(tracker.root())
    {
        Ok(()) => tracing::info!("no lazy loading detected"),
        Err(e) => tracing::warn!("N+1 detected: {e}"),
    }

    Ok(())
}

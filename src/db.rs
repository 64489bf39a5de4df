use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::env::ENV_CONFIG;

pub fn get_db_url_with_name(name: &str) -> String {
    let db_url = ENV_CONFIG
        .db_url
        .as_ref()
        .expect("DATABASE_URL is required in env to connect to the canonical store");
    format!("{db_url}?application_name={name}")
}

pub async fn get_db_pool(name: &str, max_connections: u32) -> sqlx::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&get_db_url_with_name(name))
        .await
}

#[cfg(test)]
pub mod tests {
    use std::sync::atomic::AtomicUsize;

    use sqlx::{postgres::PgPoolOptions, Connection, Executor};
    use test_context::AsyncTestContext;

    use super::*;

    fn get_test_db_url() -> String {
        let url = ENV_CONFIG
            .db_url
            .clone()
            .expect("DATABASE_URL is required to run store tests");
        if !url.contains("testdb") {
            panic!("tried to run tests against db that is not 'testdb'");
        }
        url
    }

    pub struct TestDb {
        pub pool: PgPool,
        name: String,
    }

    static DB_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);
    fn get_id() -> usize {
        DB_ID_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    impl TestDb {
        pub async fn new() -> Self {
            let name = format!("testdb_{}_{}", std::process::id(), get_id());
            let url = get_test_db_url();

            let mut connection = sqlx::PgConnection::connect(&url).await.unwrap();
            connection
                .execute(format!("CREATE DATABASE {name}").as_str())
                .await
                .unwrap();

            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(&url.replace("testdb", &name))
                .await
                .unwrap();

            sqlx::migrate!("./migrations").run(&pool).await.unwrap();

            Self { pool, name }
        }

        pub async fn cleanup(&self) {
            self.pool.close().await;
            let mut connection = sqlx::PgConnection::connect(&get_test_db_url())
                .await
                .unwrap();
            connection
                .execute(format!("DROP DATABASE {}", self.name).as_str())
                .await
                .unwrap();
        }
    }

    impl AsyncTestContext for TestDb {
        async fn setup() -> TestDb {
            TestDb::new().await
        }

        async fn teardown(self) {
            self.cleanup().await
        }
    }
}

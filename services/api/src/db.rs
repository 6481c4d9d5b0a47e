use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn create_pool(database_url: &str) -> PgPool {
    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .connect(database_url)
        .await
        .expect("failed to connect to Postgres")
}

use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Build, Rocket};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::migrate::Migrator;
use std::path::Path;
use std::str::FromStr;

static MIGRATOR: Migrator = sqlx::migrate!("db/migrations");

pub struct DbPool(pub SqlitePool);

pub struct DbPoolFairing();
#[rocket::async_trait]
impl Fairing for DbPoolFairing {
    fn info(&self) -> Info {
        Info {
            name: "SQLite Database Pool with Migrations",
            kind: Kind::Ignite | Kind::Liftoff,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let database_url = if cfg!(test) {
            "sqlite::memory:".to_string()
        } else {
            let figment = rocket.figment();
            let database_url = figment.extract_inner::<String>("database_url").expect("database_url");
            if database_url.starts_with("sqlite://") {
                let db_path = database_url.trim_start_matches("sqlite://");
                if !Path::new(db_path).exists() {
                    std::fs::File::create(db_path).expect("Failed to create SQLite database file");
                }
            }
            database_url
        };

        info!("Opening database: {database_url}");
        let opts = SqliteConnectOptions::from_str(&database_url).expect("valid sqlite url")
            .journal_mode(SqliteJournalMode::Wal) // use WAL for better concurrency
            .foreign_keys(true);
        let pool = match SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
        {
            Ok(pool) => pool,
            Err(err) => {
                error!("Database connection error: {:?}", err);
                return Err(rocket);
            }
        };

        match MIGRATOR.run(&pool).await {
            Ok(_) => info!("Migrations applied successfully!"),
            Err(err) => {
                error!("Migration error: {:?}", err);
                return Err(rocket);
            }
        };

        Ok(rocket.manage(DbPool(pool)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn migrated_pool() -> SqlitePool {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:").unwrap()
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .unwrap();
        MIGRATOR.run(&pool).await.unwrap();
        pool
    }

    #[rocket::async_test]
    async fn test_one_session_per_trainer_and_start_time() {
        let pool = migrated_pool().await;
        sqlx::query("INSERT INTO users(username, password_hash) VALUES ('anna', 'x$y')")
            .execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO trainers(user_id, slug) VALUES (1, 'anna')")
            .execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO services(name, slug, duration_min) VALUES ('Yoga', 'yoga', 60)")
            .execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO schedule(service_id, trainer_id, start_time) VALUES (1, 1, '2026-09-01 10:00:00')")
            .execute(&pool).await.unwrap();
        let err = sqlx::query("INSERT INTO schedule(service_id, trainer_id, start_time) VALUES (1, 1, '2026-09-01 10:00:00')")
            .execute(&pool).await.unwrap_err();
        match err {
            sqlx::Error::Database(e) => assert!(e.is_unique_violation()),
            e => panic!("unexpected error: {e}"),
        }
    }
}

use chrono::{TimeDelta, Utc};
use rocket::response::status::Custom;
use rocket::response::Redirect;
use rocket::{Build, Rocket, State};
use crate::auth::create_user;
use crate::catalog::{ServiceId, TrainerId};
use crate::db::DbPool;
use crate::users::UserId;
use crate::util::status_sqlx_error;

// Demo data set, also the fixture for the end-to-end tests:
// anna is the trainer of every session, bob and carol are clients.
// Session 1: Yoga in two days (bookable, cancellable).
// Session 2: Pilates in two days with a single seat (capacity tests).
// Session 3: Yoga in twelve hours (bookable, past the cancellation cutoff).
// Session 4: Yoga two hours ago (not bookable).

async fn seed_demo(db: &State<DbPool>) -> Result<(), sqlx::Error> {
    let anna: UserId = create_user("anna", "anna@fitpro.example", "Anna", "Petrova", "trenerka1", db).await?;
    let bob: UserId = create_user("bob", "bob@fitpro.example", "Bob", "Smirnov", "sekretno1", db).await?;
    let _carol: UserId = create_user("carol", "carol@fitpro.example", "Carol", "Ivanova", "sekretno2", db).await?;

    let trainer_id: (TrainerId,) = sqlx::query_as(
        "INSERT INTO trainers(user_id, slug, specialization, achievements, experience_since) \
         VALUES (?, 'anna-petrova', 'Yoga' || char(10) || 'Pilates', 'Certified instructor', '2015-06-01') RETURNING id")
        .bind(anna)
        .fetch_one(&db.0)
        .await?;
    let trainer_id = trainer_id.0;

    let yoga: (ServiceId,) = sqlx::query_as(
        "INSERT INTO services(name, slug, description, duration_min, price, max_participants, color) \
         VALUES ('Yoga', 'yoga', 'Hatha yoga for everyone', 60, 500, 10, '#6c757d') RETURNING id")
        .fetch_one(&db.0)
        .await?;
    let pilates: (ServiceId,) = sqlx::query_as(
        "INSERT INTO services(name, slug, description, duration_min, price, max_participants, color) \
         VALUES ('Pilates', 'pilates', 'Individual pilates session', 45, 700, 1, '#0d6efd') RETURNING id")
        .fetch_one(&db.0)
        .await?;
    for service_id in [yoga.0, pilates.0] {
        sqlx::query("INSERT INTO service_trainers(service_id, trainer_id) VALUES (?, ?)")
            .bind(service_id)
            .bind(trainer_id)
            .execute(&db.0)
            .await?;
    }

    let now = Utc::now();
    let sessions = [
        (yoga.0, now + TimeDelta::hours(48)),
        (pilates.0, now + TimeDelta::hours(49)),
        (yoga.0, now + TimeDelta::hours(12)),
        (yoga.0, now - TimeDelta::hours(2)),
    ];
    for (service_id, start_time) in sessions {
        sqlx::query("INSERT INTO schedule(service_id, trainer_id, start_time) VALUES (?, ?, ?)")
            .bind(service_id)
            .bind(trainer_id)
            .bind(start_time)
            .execute(&db.0)
            .await?;
    }
    info!("Demo data created, trainer: {anna}, client: {bob}");
    Ok(())
}

#[get("/dev/seed-demo")]
async fn get_seed_demo(db: &State<DbPool>) -> Result<Redirect, Custom<String>> {
    seed_demo(db).await.map_err(status_sqlx_error)?;
    Ok(Redirect::to("/"))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_seed_demo,
        ])
}

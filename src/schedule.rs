use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeDelta, Utc};
use itertools::Itertools;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use rocket::request::FlashMessage;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::auth::{load_user_by_token, maybe_session_user};
use crate::catalog::{ServiceId, TrainerId};
use crate::db::DbPool;
use crate::users::{trainer_id_of, UserId};
use crate::util::{dtstr, status_sqlx_error};
use crate::{ApiToken, SessionId, SharedAppState};

pub type ScheduleId = i64;

/// One timetable row joined with its service, trainer and booking counters.
/// `booking_id` is the viewer's own active booking, when there is one.
#[derive(Serialize, FromRow, Clone, Debug)]
pub struct ScheduleRow {
    pub id: ScheduleId,
    pub service_id: ServiceId,
    pub trainer_id: TrainerId,
    pub start_time: DateTime<Utc>,
    pub service_name: String,
    pub duration_min: i64,
    pub color: String,
    pub max_participants: i64,
    pub trainer_name: String,
    pub trainer_user_id: UserId,
    pub bookings_count: i64,
    pub booking_id: Option<i64>,
}
impl ScheduleRow {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + TimeDelta::minutes(self.duration_min)
    }
    pub fn count_remained_seats(&self) -> i64 {
        self.max_participants - self.bookings_count
    }
    pub fn in_future(&self) -> bool {
        self.start_time > Utc::now()
    }
    // cancellation cutoff, 24 hours before start
    pub fn day_before(&self) -> bool {
        self.start_time - TimeDelta::hours(24) > Utc::now()
    }
    pub fn is_available(&self) -> bool {
        self.count_remained_seats() > 0 && self.in_future()
    }
    pub fn label(&self) -> String {
        format!("{} - {}", self.service_name, dtstr(&self.start_time))
    }
    pub fn to_item(&self, viewer: UserId) -> ScheduleItem {
        ScheduleItem {
            id: self.id,
            service_id: self.service_id,
            trainer_id: self.trainer_id,
            start_time: self.start_time,
            end_time: self.end_time(),
            count_remained_seats: self.count_remained_seats(),
            booking_id: self.booking_id,
            can_book: self.is_available() && self.booking_id.is_none() && viewer != self.trainer_user_id,
            can_cancel: self.booking_id.is_some() && self.day_before(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ScheduleItem {
    pub id: ScheduleId,
    pub service_id: ServiceId,
    pub trainer_id: TrainerId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub count_remained_seats: i64,
    pub booking_id: Option<i64>,
    pub can_book: bool,
    pub can_cancel: bool,
}

const SCHEDULE_SELECT: &str = "SELECT s.id, s.service_id, s.trainer_id, s.start_time, \
 sv.name AS service_name, sv.duration_min, sv.color, sv.max_participants, \
 TRIM(u.last_name || ' ' || u.first_name) AS trainer_name, t.user_id AS trainer_user_id, \
 (SELECT COUNT(*) FROM bookings b WHERE b.schedule_id = s.id AND b.canceled = 0) AS bookings_count, \
 (SELECT b.id FROM bookings b WHERE b.schedule_id = s.id AND b.client_id = ?1 AND b.canceled = 0) AS booking_id \
 FROM schedule s \
 JOIN services sv ON sv.id = s.service_id \
 JOIN trainers t ON t.id = s.trainer_id \
 JOIN users u ON u.id = t.user_id";

pub async fn load_schedule_row(schedule_id: ScheduleId, viewer: UserId, db: &State<DbPool>) -> Result<Option<ScheduleRow>, sqlx::Error> {
    sqlx::query_as(&format!("{SCHEDULE_SELECT} WHERE s.id = ?2"))
        .bind(viewer)
        .bind(schedule_id)
        .fetch_optional(&db.0)
        .await
}

/// Today plus the six following days, with all sessions falling inside.
pub async fn week_schedule(viewer: UserId, db: &State<DbPool>) -> Result<(Vec<NaiveDate>, Vec<ScheduleRow>), sqlx::Error> {
    let today = Utc::now().date_naive();
    let days = (0..7).map(|i| today + Days::new(i)).collect::<Vec<_>>();
    let start = today.and_time(NaiveTime::MIN).and_utc();
    let end = (today + Days::new(7)).and_time(NaiveTime::MIN).and_utc();
    let rows = sqlx::query_as(&format!("{SCHEDULE_SELECT} WHERE s.start_time >= ?2 AND s.start_time < ?3 ORDER BY s.start_time, sv.name"))
        .bind(viewer)
        .bind(start)
        .bind(end)
        .fetch_all(&db.0)
        .await?;
    Ok((days, rows))
}

fn row_ctx(row: &ScheduleRow, viewer: UserId) -> rocket::serde::json::Value {
    let item = row.to_item(viewer);
    let label = row.label();
    let row = row.clone();
    rocket::serde::json::json!({
        "row": row,
        "item": item,
        "label": label,
    })
}

#[get("/schedule")]
async fn get_schedule(session_id: Option<SessionId>, flash: Option<FlashMessage<'_>>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let user = maybe_session_user(session_id, state, db).await;
    let viewer = user.as_ref().map(|u| u.id).unwrap_or(0);
    let (days, rows) = week_schedule(viewer, db).await.map_err(status_sqlx_error)?;
    let mut by_day = rows.into_iter().into_group_map_by(|r| r.start_time.date_naive());
    let days = days.into_iter().map(|date| {
        let items = by_day.remove(&date).unwrap_or_default();
        let items = items.iter().map(|r| row_ctx(r, viewer)).collect::<Vec<_>>();
        context! { date, items }
    }).collect::<Vec<_>>();
    Ok(Template::render("schedule", context! {
        title: "Schedule",
        user,
        days,
        flash: flash.map(|f| (f.kind().to_string(), f.message().to_string())),
    }))
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ScheduleResponse {
    pub days: Vec<NaiveDate>,
    pub items: Vec<ScheduleItem>,
}
#[get("/api/schedule")]
async fn get_api_schedule(api_token: ApiToken, db: &State<DbPool>) -> Result<Json<ScheduleResponse>, Custom<String>> {
    let user = load_user_by_token(&api_token, db).await?;
    let (days, rows) = week_schedule(user.id, db).await.map_err(status_sqlx_error)?;
    let items = rows.iter().map(|r| r.to_item(user.id)).collect();
    Ok(Json(ScheduleResponse { days, items }))
}

#[derive(FromRow, Clone, Debug)]
struct MyScheduleRow {
    id: ScheduleId,
    service_id: ServiceId,
    start_time: DateTime<Utc>,
    duration_min: i64,
}
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrainerScheduleItem {
    pub id: ScheduleId,
    pub service_id: ServiceId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct BookingJson {
    pub id: i64,
    pub schedule_id: ScheduleId,
    pub client_id: UserId,
    pub booked_at: DateTime<Utc>,
}
#[derive(FromRow, Clone, Debug)]
struct ClientRow {
    id: UserId,
    first_name: String,
    last_name: String,
    middle_name: Option<String>,
    email: String,
    phone_number: Option<String>,
    photo: Option<String>,
}
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClientJson {
    pub id: UserId,
    pub full_name: String,
    pub email: String,
    pub phone_number: Option<String>,
    pub photo: Option<String>,
}
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrainerScheduleResponse {
    pub items: Vec<TrainerScheduleItem>,
    pub clients: Vec<ClientJson>,
    pub bookings: Vec<BookingJson>,
}

#[get("/api/schedule/my")]
async fn get_api_schedule_my(api_token: ApiToken, db: &State<DbPool>) -> Result<Json<TrainerScheduleResponse>, Custom<String>> {
    let user = load_user_by_token(&api_token, db).await?;
    let Some(trainer_id) = trainer_id_of(user.id, db).await.map_err(status_sqlx_error)? else {
        return Err(Custom(Status::Forbidden, "Not a trainer".to_string()));
    };
    let rows: Vec<MyScheduleRow> = sqlx::query_as(
        "SELECT s.id, s.service_id, s.start_time, sv.duration_min \
         FROM schedule s \
         JOIN services sv ON sv.id = s.service_id \
         WHERE s.trainer_id=? \
         ORDER BY date(s.start_time) DESC, time(s.start_time)")
        .bind(trainer_id)
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let items = rows.into_iter().map(|r| TrainerScheduleItem {
        id: r.id,
        service_id: r.service_id,
        start_time: r.start_time,
        end_time: r.start_time + TimeDelta::minutes(r.duration_min),
    }).collect();
    let bookings: Vec<BookingJson> = sqlx::query_as(
        "SELECT b.id, b.schedule_id, b.client_id, b.booked_at \
         FROM bookings b \
         JOIN schedule s ON s.id = b.schedule_id \
         WHERE s.trainer_id=? AND b.canceled = 0 \
         ORDER BY b.booked_at")
        .bind(trainer_id)
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let clients: Vec<ClientRow> = sqlx::query_as(
        "SELECT DISTINCT u.id, u.first_name, u.last_name, u.middle_name, u.email, u.phone_number, u.photo \
         FROM users u \
         JOIN bookings b ON b.client_id = u.id \
         JOIN schedule s ON s.id = b.schedule_id \
         WHERE s.trainer_id=? AND b.canceled = 0 \
         ORDER BY u.id")
        .bind(trainer_id)
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let clients = clients.into_iter().map(|c| {
        let full_name = [
            c.last_name.as_str(),
            c.first_name.as_str(),
            c.middle_name.as_deref().unwrap_or(""),
        ].iter().filter(|part| !part.is_empty()).copied().collect::<Vec<_>>().join(" ");
        ClientJson {
            id: c.id,
            full_name,
            email: c.email,
            phone_number: c.phone_number,
            photo: c.photo,
        }
    }).collect();
    Ok(Json(TrainerScheduleResponse { items, clients, bookings }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_schedule,
            get_api_schedule,
            get_api_schedule_my,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    fn row(start_in: TimeDelta, max: i64, booked: i64, booking_id: Option<i64>) -> ScheduleRow {
        ScheduleRow {
            id: 1,
            service_id: 1,
            trainer_id: 1,
            start_time: Utc::now() + start_in,
            service_name: "Yoga".to_string(),
            duration_min: 60,
            color: "#6c757d".to_string(),
            max_participants: max,
            trainer_name: "Petrova Anna".to_string(),
            trainer_user_id: 1,
            bookings_count: booked,
            booking_id,
        }
    }

    #[test]
    fn test_remained_seats() {
        assert_eq!(row(TimeDelta::hours(48), 10, 3, None).count_remained_seats(), 7);
        assert_eq!(row(TimeDelta::hours(48), 1, 1, None).count_remained_seats(), 0);
    }

    #[test]
    fn test_availability_window() {
        assert!(row(TimeDelta::hours(48), 10, 0, None).is_available());
        // full
        assert!(!row(TimeDelta::hours(48), 1, 1, None).is_available());
        // already started
        assert!(!row(TimeDelta::hours(-1), 10, 0, None).is_available());
    }

    #[test]
    fn test_day_before_cutoff() {
        assert!(row(TimeDelta::hours(25), 10, 0, None).day_before());
        assert!(!row(TimeDelta::hours(23), 10, 0, None).day_before());
        assert!(!row(TimeDelta::hours(-1), 10, 0, None).day_before());
    }

    #[test]
    fn test_to_item_flags() {
        // free seat, future, not the trainer, no own booking
        let item = row(TimeDelta::hours(48), 10, 0, None).to_item(2);
        assert!(item.can_book);
        assert!(!item.can_cancel);
        // trainer's own session
        let item = row(TimeDelta::hours(48), 10, 0, None).to_item(1);
        assert!(!item.can_book);
        // own active booking, cancellable until the cutoff
        let item = row(TimeDelta::hours(48), 10, 1, Some(7)).to_item(2);
        assert!(!item.can_book);
        assert!(item.can_cancel);
        assert_eq!(item.booking_id, Some(7));
        let item = row(TimeDelta::hours(12), 10, 1, Some(7)).to_item(2);
        assert!(!item.can_cancel);
    }
}

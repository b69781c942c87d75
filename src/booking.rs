use chrono::{DateTime, TimeDelta, Utc};
use rocket::form::Form;
use rocket::response::status::Custom;
use rocket::response::{Flash, Redirect};
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use rocket::request::FlashMessage;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::auth::{load_user_by_token, session_user};
use crate::catalog::{ServiceId, TrainerId};
use crate::db::DbPool;
use crate::schedule::{load_schedule_row, ScheduleId, ScheduleItem};
use crate::users::UserId;
use crate::util::status_sqlx_error;
use crate::{ApiToken, SessionId, SharedAppState};

pub type BookingId = i64;

/// Result of a booking or cancellation attempt, rendered as a flash message
/// on the web path and returned as JSON on the API path.
#[derive(Serialize, Deserialize, Debug)]
pub struct BookingOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub item: Option<ScheduleItem>,
}
impl BookingOutcome {
    fn failure(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), item: None }
    }
}

/// Booking rule evaluator. Guard order matters: an existing active booking
/// wins over every other rejection so the client sees "already booked"
/// rather than "no seats".
pub async fn to_book(user_id: UserId, schedule_id: ScheduleId, db: &State<DbPool>) -> Result<BookingOutcome, Custom<String>> {
    let Some(mut row) = load_schedule_row(schedule_id, user_id, db).await.map_err(status_sqlx_error)? else {
        return Ok(BookingOutcome::failure("Class not found!"));
    };
    let label = row.label();
    let reservation: Option<(BookingId, bool)> = sqlx::query_as("SELECT id, canceled FROM bookings WHERE schedule_id=? AND client_id=?")
        .bind(schedule_id)
        .bind(user_id)
        .fetch_optional(&db.0)
        .await
        .map_err(status_sqlx_error)?;

    let mut outcome = if matches!(reservation, Some((_, false))) {
        BookingOutcome::failure(format!("You are already booked for '{label}'!"))
    } else if row.trainer_user_id == user_id {
        BookingOutcome::failure(format!("You cannot book your own class '{label}'"))
    } else if row.count_remained_seats() <= 0 {
        BookingOutcome::failure(format!("No free seats left for '{label}'!"))
    } else if !row.in_future() {
        BookingOutcome::failure(format!("It is too late to book '{label}'!"))
    } else {
        let booking_id = if let Some((booking_id, _)) = reservation {
            // re-booking a canceled seat reactivates the original row
            sqlx::query("UPDATE bookings SET canceled=0 WHERE id=?")
                .bind(booking_id)
                .execute(&db.0)
                .await
                .map_err(status_sqlx_error)?;
            Some(booking_id)
        } else {
            let res: Result<(BookingId,), sqlx::Error> = sqlx::query_as("INSERT INTO bookings(schedule_id, client_id) VALUES (?, ?) RETURNING id")
                .bind(schedule_id)
                .bind(user_id)
                .fetch_one(&db.0)
                .await;
            match res {
                Ok(id) => Some(id.0),
                // lost a race with a concurrent request of the same client
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => None,
                Err(e) => return Err(status_sqlx_error(e)),
            }
        };
        match booking_id {
            Some(booking_id) => {
                info!("Booking created, user: {user_id}, schedule: {schedule_id}, booking: {booking_id}");
                row.booking_id = Some(booking_id);
                row.bookings_count += 1;
                BookingOutcome { success: true, message: format!("You have successfully booked '{label}'"), item: None }
            }
            None => BookingOutcome::failure(format!("You are already booked for '{label}'!")),
        }
    };
    if let Some((booking_id, false)) = reservation {
        row.booking_id = Some(booking_id);
    }
    outcome.item = Some(row.to_item(user_id));
    Ok(outcome)
}

/// Cancellation rule evaluator, 24-hour cutoff before session start.
pub async fn cancel(user_id: UserId, booking_id: BookingId, db: &State<DbPool>) -> Result<BookingOutcome, Custom<String>> {
    let reservation: Option<(ScheduleId, bool)> = sqlx::query_as("SELECT schedule_id, canceled FROM bookings WHERE id=? AND client_id=?")
        .bind(booking_id)
        .bind(user_id)
        .fetch_optional(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let Some((schedule_id, canceled)) = reservation else {
        return Ok(BookingOutcome::failure("Booking not found!"));
    };
    let Some(mut row) = load_schedule_row(schedule_id, user_id, db).await.map_err(status_sqlx_error)? else {
        return Ok(BookingOutcome::failure("Class not found!"));
    };
    let label = row.label();

    let mut outcome = if canceled {
        BookingOutcome::failure(format!("Your booking for '{label}' is already canceled!"))
    } else if !row.day_before() {
        BookingOutcome::failure(format!("It is too late to cancel your booking for '{label}'!"))
    } else {
        sqlx::query("UPDATE bookings SET canceled=1 WHERE id=?")
            .bind(booking_id)
            .execute(&db.0)
            .await
            .map_err(status_sqlx_error)?;
        info!("Booking canceled, user: {user_id}, schedule: {schedule_id}, booking: {booking_id}");
        row.booking_id = None;
        row.bookings_count -= 1;
        BookingOutcome { success: true, message: format!("You have successfully canceled your booking for '{label}'"), item: None }
    };
    outcome.item = Some(row.to_item(user_id));
    Ok(outcome)
}

fn outcome_flash(outcome: BookingOutcome, redirect: Redirect) -> Flash<Redirect> {
    if outcome.success {
        Flash::success(redirect, outcome.message)
    } else {
        Flash::error(redirect, outcome.message)
    }
}

#[derive(Debug, FromForm)]
struct BookingFormValues<'v> {
    schedule_id: ScheduleId,
    next: Option<&'v str>,
}
#[post("/schedule/booking", data = "<form>")]
async fn post_booking(form: Form<BookingFormValues<'_>>, session_id: Option<SessionId>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Flash<Redirect>, Custom<String>> {
    let redirect = Redirect::to(form.next.unwrap_or("/schedule").to_string());
    let Some(session_id) = session_id else {
        return Ok(Flash::error(redirect, "You must be logged in to book a class!"));
    };
    let user = session_user(&session_id, state, db).await?;
    let outcome = to_book(user.id, form.schedule_id, db).await?;
    Ok(outcome_flash(outcome, redirect))
}

#[derive(Debug, FromForm)]
struct CancelFormValues<'v> {
    next: Option<&'v str>,
}
#[post("/schedule/cancel/<booking_id>", data = "<form>")]
async fn post_booking_cancel(booking_id: BookingId, form: Option<Form<CancelFormValues<'_>>>, session_id: Option<SessionId>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Flash<Redirect>, Custom<String>> {
    let next = form.as_ref().and_then(|f| f.next).unwrap_or("/schedule");
    let redirect = Redirect::to(next.to_string());
    let Some(session_id) = session_id else {
        return Ok(Flash::error(redirect, "Could not cancel the booking!"));
    };
    let user = session_user(&session_id, state, db).await?;
    let outcome = cancel(user.id, booking_id, db).await?;
    Ok(outcome_flash(outcome, redirect))
}

/// A row of the caller's booking history joined with its session.
#[derive(Serialize, FromRow, Clone, Debug)]
pub struct BookedRow {
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
    pub my_booking_id: BookingId,
    pub my_canceled: bool,
}
impl BookedRow {
    fn end_time(&self) -> DateTime<Utc> {
        self.start_time + TimeDelta::minutes(self.duration_min)
    }
    fn count_remained_seats(&self) -> i64 {
        self.max_participants - self.bookings_count
    }
    fn day_before(&self) -> bool {
        self.start_time - TimeDelta::hours(24) > Utc::now()
    }
    fn is_available(&self) -> bool {
        self.count_remained_seats() > 0 && self.start_time > Utc::now()
    }
    pub fn to_item(&self) -> ScheduleItem {
        ScheduleItem {
            id: self.id,
            service_id: self.service_id,
            trainer_id: self.trainer_id,
            start_time: self.start_time,
            end_time: self.end_time(),
            count_remained_seats: self.count_remained_seats(),
            booking_id: (!self.my_canceled).then_some(self.my_booking_id),
            can_book: self.is_available() && self.my_canceled,
            can_cancel: !self.my_canceled && self.day_before(),
        }
    }
}

const BOOKED_SELECT: &str = "SELECT s.id, s.service_id, s.trainer_id, s.start_time, \
 sv.name AS service_name, sv.duration_min, sv.color, sv.max_participants, \
 TRIM(u.last_name || ' ' || u.first_name) AS trainer_name, t.user_id AS trainer_user_id, \
 (SELECT COUNT(*) FROM bookings b2 WHERE b2.schedule_id = s.id AND b2.canceled = 0) AS bookings_count, \
 b.id AS my_booking_id, b.canceled AS my_canceled \
 FROM bookings b \
 JOIN schedule s ON s.id = b.schedule_id \
 JOIN services sv ON sv.id = s.service_id \
 JOIN trainers t ON t.id = s.trainer_id \
 JOIN users u ON u.id = t.user_id \
 WHERE b.client_id = ? \
 ORDER BY date(s.start_time) DESC, time(s.start_time)";

pub async fn booked_schedule(user_id: UserId, db: &State<DbPool>) -> Result<Vec<BookedRow>, Custom<String>> {
    sqlx::query_as(BOOKED_SELECT)
        .bind(user_id)
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)
}

#[get("/users/classes")]
async fn get_my_classes(session_id: SessionId, flash: Option<FlashMessage<'_>>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let user = session_user(&session_id, state, db).await?;
    let rows = booked_schedule(user.id, db).await?;
    let items = rows.iter().map(|r| {
        let item = r.to_item();
        rocket::serde::json::json!({
            "row": r,
            "item": item,
        })
    }).collect::<Vec<_>>();
    Ok(Template::render("my-classes", context! {
        title: "My classes",
        user,
        items,
        flash: flash.map(|f| (f.kind().to_string(), f.message().to_string())),
    }))
}

#[get("/api/bookings")]
async fn get_api_bookings(api_token: ApiToken, db: &State<DbPool>) -> Result<Json<Vec<ScheduleItem>>, Custom<String>> {
    let user = load_user_by_token(&api_token, db).await?;
    let rows = booked_schedule(user.id, db).await?;
    Ok(Json(rows.iter().map(|r| r.to_item()).collect()))
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateBookingRequest {
    pub schedule_id: ScheduleId,
}
#[post("/api/bookings", data = "<request>")]
async fn post_api_bookings(api_token: ApiToken, request: Json<CreateBookingRequest>, db: &State<DbPool>) -> Result<Json<BookingOutcome>, Custom<String>> {
    let user = load_user_by_token(&api_token, db).await?;
    let outcome = to_book(user.id, request.schedule_id, db).await?;
    Ok(Json(outcome))
}

#[post("/api/bookings/<booking_id>/cancel")]
async fn post_api_booking_cancel(booking_id: BookingId, api_token: ApiToken, db: &State<DbPool>) -> Result<Json<BookingOutcome>, Custom<String>> {
    let user = load_user_by_token(&api_token, db).await?;
    let outcome = cancel(user.id, booking_id, db).await?;
    Ok(Json(outcome))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_booking,
            post_booking_cancel,
            get_my_classes,
            get_api_bookings,
            post_api_bookings,
            post_api_booking_cancel,
        ])
}

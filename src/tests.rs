use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;
use crate::auth::{Credentials, TokenResponse};
use crate::booking::{BookingOutcome, CreateBookingRequest};
use crate::catalog::{ServiceJson, TrainerJson};
use crate::schedule::{ScheduleResponse, TrainerScheduleResponse};
use crate::users::UserJson;

// Ids created by /dev/seed-demo, in insertion order.
const YOGA_IN_2_DAYS: i64 = 1;
const PILATES_SINGLE_SEAT: i64 = 2;
const YOGA_IN_12_HOURS: i64 = 3;
const YOGA_IN_THE_PAST: i64 = 4;

fn create_test_server() -> Client {
    let client = Client::tracked(super::rocket()).unwrap();
    {
        let resp = client.get("/dev/seed-demo").dispatch();
        assert_eq!(resp.status(), Status::SeeOther);
    }
    client
}

fn obtain_token(client: &Client, username: &str, password: &str) -> String {
    let resp = client.post("/api/token")
        .json(&Credentials { username: username.to_string(), password: password.to_string() })
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    resp.into_json::<TokenResponse>().unwrap().access
}

fn book(client: &Client, token: &str, schedule_id: i64) -> BookingOutcome {
    let resp = client.post("/api/bookings")
        .header(Header::new("fit-api-token", token.to_string()))
        .json(&CreateBookingRequest { schedule_id })
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    resp.into_json::<BookingOutcome>().unwrap()
}

fn cancel_booking(client: &Client, token: &str, booking_id: i64) -> BookingOutcome {
    let resp = client.post(format!("/api/bookings/{booking_id}/cancel"))
        .header(Header::new("fit-api-token", token.to_string()))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    resp.into_json::<BookingOutcome>().unwrap()
}

#[test]
fn double_booking_rejected() {
    let client = create_test_server();
    let token = obtain_token(&client, "bob", "sekretno1");

    let outcome = book(&client, &token, YOGA_IN_2_DAYS);
    assert!(outcome.success);
    let item = outcome.item.unwrap();
    assert_eq!(item.count_remained_seats, 9);
    assert!(item.booking_id.is_some());

    let outcome = book(&client, &token, YOGA_IN_2_DAYS);
    assert!(!outcome.success);
    assert!(outcome.message.contains("already booked"));
    // seat count unchanged
    assert_eq!(outcome.item.unwrap().count_remained_seats, 9);
}

#[test]
fn booking_fails_when_no_seats_left() {
    let client = create_test_server();
    let bob = obtain_token(&client, "bob", "sekretno1");
    let carol = obtain_token(&client, "carol", "sekretno2");

    let outcome = book(&client, &bob, PILATES_SINGLE_SEAT);
    assert!(outcome.success);
    assert_eq!(outcome.item.unwrap().count_remained_seats, 0);

    let outcome = book(&client, &carol, PILATES_SINGLE_SEAT);
    assert!(!outcome.success);
    assert!(outcome.message.contains("No free seats"));
}

#[test]
fn trainer_cannot_book_own_session() {
    let client = create_test_server();
    let anna = obtain_token(&client, "anna", "trenerka1");

    let outcome = book(&client, &anna, YOGA_IN_2_DAYS);
    assert!(!outcome.success);
    assert!(outcome.message.contains("your own class"));
}

#[test]
fn past_session_not_bookable() {
    let client = create_test_server();
    let token = obtain_token(&client, "bob", "sekretno1");

    let outcome = book(&client, &token, YOGA_IN_THE_PAST);
    assert!(!outcome.success);
    assert!(outcome.message.contains("too late to book"));
}

#[test]
fn cancel_and_rebook_reactivates_booking() {
    let client = create_test_server();
    let token = obtain_token(&client, "bob", "sekretno1");

    let outcome = book(&client, &token, YOGA_IN_2_DAYS);
    assert!(outcome.success);
    let booking_id = outcome.item.unwrap().booking_id.unwrap();

    let outcome = cancel_booking(&client, &token, booking_id);
    assert!(outcome.success);
    let item = outcome.item.unwrap();
    assert_eq!(item.count_remained_seats, 10);
    assert_eq!(item.booking_id, None);

    let outcome = cancel_booking(&client, &token, booking_id);
    assert!(!outcome.success);
    assert!(outcome.message.contains("already canceled"));

    // re-booking brings back the same booking row
    let outcome = book(&client, &token, YOGA_IN_2_DAYS);
    assert!(outcome.success);
    assert_eq!(outcome.item.unwrap().booking_id, Some(booking_id));
}

#[test]
fn cancellation_blocked_within_24_hours() {
    let client = create_test_server();
    let token = obtain_token(&client, "bob", "sekretno1");

    let outcome = book(&client, &token, YOGA_IN_12_HOURS);
    assert!(outcome.success);
    let item = outcome.item.unwrap();
    assert!(!item.can_cancel);

    let outcome = cancel_booking(&client, &token, item.booking_id.unwrap());
    assert!(!outcome.success);
    assert!(outcome.message.contains("too late to cancel"));
}

#[test]
fn foreign_booking_cannot_be_canceled() {
    let client = create_test_server();
    let bob = obtain_token(&client, "bob", "sekretno1");
    let carol = obtain_token(&client, "carol", "sekretno2");

    let outcome = book(&client, &bob, YOGA_IN_2_DAYS);
    let booking_id = outcome.item.unwrap().booking_id.unwrap();

    let outcome = cancel_booking(&client, &carol, booking_id);
    assert!(!outcome.success);
    assert!(outcome.message.contains("not found"));
}

#[test]
fn token_auth() {
    let client = create_test_server();

    let resp = client.post("/api/token")
        .json(&Credentials { username: "bob".to_string(), password: "wrong-password".to_string() })
        .dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);

    let resp = client.get("/api/trainers").dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);

    let token = obtain_token(&client, "bob", "sekretno1");
    let resp = client.get("/api/users/me")
        .header(Header::new("fit-api-token", token.clone()))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.content_type(), Some(ContentType::JSON));
    let user = resp.into_json::<UserJson>().unwrap();
    assert_eq!(user.username, "bob");
    assert_eq!(user.trainer_id, None);

    // revoked token no longer works
    let resp = client.delete("/api/token")
        .header(Header::new("fit-api-token", token.clone()))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get("/api/users/me")
        .header(Header::new("fit-api-token", token))
        .dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
}

#[test]
fn weekly_schedule_api() {
    let client = create_test_server();
    let token = obtain_token(&client, "bob", "sekretno1");

    let resp = client.get("/api/schedule")
        .header(Header::new("fit-api-token", token.clone()))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let schedule = resp.into_json::<ScheduleResponse>().unwrap();
    assert_eq!(schedule.days.len(), 7);
    let item = schedule.items.iter().find(|i| i.id == YOGA_IN_2_DAYS).unwrap();
    assert!(item.can_book);
    assert_eq!(item.count_remained_seats, 10);
}

#[test]
fn trainer_schedule_api() {
    let client = create_test_server();
    let bob = obtain_token(&client, "bob", "sekretno1");
    let anna = obtain_token(&client, "anna", "trenerka1");

    let resp = client.get("/api/schedule/my")
        .header(Header::new("fit-api-token", bob.clone()))
        .dispatch();
    assert_eq!(resp.status(), Status::Forbidden);

    book(&client, &bob, YOGA_IN_2_DAYS);

    let resp = client.get("/api/schedule/my")
        .header(Header::new("fit-api-token", anna))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let my = resp.into_json::<TrainerScheduleResponse>().unwrap();
    assert_eq!(my.items.len(), 4);
    assert_eq!(my.bookings.len(), 1);
    assert_eq!(my.bookings[0].schedule_id, YOGA_IN_2_DAYS);
    assert_eq!(my.clients.len(), 1);
    assert_eq!(my.clients[0].full_name, "Smirnov Bob");
}

#[test]
fn booking_history_api() {
    let client = create_test_server();
    let token = obtain_token(&client, "bob", "sekretno1");

    book(&client, &token, YOGA_IN_2_DAYS);
    let outcome = book(&client, &token, YOGA_IN_12_HOURS);
    let twelve_hours_booking = outcome.item.unwrap().booking_id.unwrap();

    let resp = client.get("/api/bookings")
        .header(Header::new("fit-api-token", token.clone()))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let items = resp.into_json::<Vec<crate::schedule::ScheduleItem>>().unwrap();
    assert_eq!(items.len(), 2);
    let cutoff_item = items.iter().find(|i| i.id == YOGA_IN_12_HOURS).unwrap();
    assert_eq!(cutoff_item.booking_id, Some(twelve_hours_booking));
    assert!(!cutoff_item.can_cancel);
    let free_item = items.iter().find(|i| i.id == YOGA_IN_2_DAYS).unwrap();
    assert!(free_item.can_cancel);
}

#[test]
fn catalog_api() {
    let client = create_test_server();
    let token = obtain_token(&client, "bob", "sekretno1");

    let resp = client.get("/api/trainers")
        .header(Header::new("fit-api-token", token.clone()))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let trainers = resp.into_json::<Vec<TrainerJson>>().unwrap();
    assert_eq!(trainers.len(), 1);
    assert_eq!(trainers[0].full_name, "Petrova Anna");
    assert!(trainers[0].experience_years.unwrap() >= 10);

    let resp = client.get("/api/services")
        .header(Header::new("fit-api-token", token))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let services = resp.into_json::<Vec<ServiceJson>>().unwrap();
    assert_eq!(services.len(), 2);
    let yoga = services.iter().find(|s| s.name == "Yoga").unwrap();
    assert_eq!(yoga.max_participants, 10);
    assert_eq!(yoga.trainers, vec![1]);
}

#[test]
fn user_profile_api() {
    let client = create_test_server();
    let token = obtain_token(&client, "bob", "sekretno1");

    let resp = client.patch("/api/users/me")
        .header(Header::new("fit-api-token", token.clone()))
        .json(&serde_json::json!({"phone_number": "+7 (900) 123 45-67", "gender": "M"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let user = resp.into_json::<UserJson>().unwrap();
    assert_eq!(user.phone_number.as_deref(), Some("+7 (900) 123 45-67"));
    assert_eq!(user.gender.as_deref(), Some("M"));
    // untouched fields keep their values
    assert_eq!(user.first_name, "Bob");

    let resp = client.patch("/api/users/me")
        .header(Header::new("fit-api-token", token))
        .json(&serde_json::json!({"gender": "X"}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
}

#[test]
fn api_registration_issues_token() {
    let client = create_test_server();

    let resp = client.post("/api/users")
        .json(&serde_json::json!({
            "username": "dave",
            "email": "dave@fitpro.example",
            "first_name": "Dave",
            "last_name": "Orlov",
            "password": "sekretno3",
        }))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let created = resp.into_json::<crate::users::CreateUserResponse>().unwrap();
    assert_eq!(created.user.username, "dave");

    let resp = client.get("/api/users/me")
        .header(Header::new("fit-api-token", created.token.access))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);

    // short password rejected
    let resp = client.post("/api/users")
        .json(&serde_json::json!({
            "username": "eve",
            "email": "eve@fitpro.example",
            "first_name": "Eve",
            "last_name": "Orlova",
            "password": "short",
        }))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
}

#[test]
fn deactivated_account_loses_access() {
    let client = create_test_server();
    let token = obtain_token(&client, "bob", "sekretno1");

    let resp = client.delete("/api/users/me")
        .header(Header::new("fit-api-token", token.clone()))
        .dispatch();
    assert_eq!(resp.status(), Status::NoContent);

    let resp = client.get("/api/users/me")
        .header(Header::new("fit-api-token", token))
        .dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);

    // password login is refused as well
    let resp = client.post("/api/token")
        .json(&Credentials { username: "bob".to_string(), password: "sekretno1".to_string() })
        .dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
}

#[test]
fn web_login_and_booking_flow() {
    let client = create_test_server();

    // anonymous booking attempt redirects back with an error flash
    let resp = client.post("/schedule/booking")
        .header(ContentType::Form)
        .body(format!("schedule_id={YOGA_IN_2_DAYS}"))
        .dispatch();
    assert_eq!(resp.status(), Status::SeeOther);

    let resp = client.post("/login")
        .header(ContentType::Form)
        .body("username=bob&password=sekretno1")
        .dispatch();
    assert_eq!(resp.status(), Status::SeeOther);

    let resp = client.post("/schedule/booking")
        .header(ContentType::Form)
        .body(format!("schedule_id={YOGA_IN_2_DAYS}"))
        .dispatch();
    assert_eq!(resp.status(), Status::SeeOther);

    // the booking shows up on the weekly schedule page
    let resp = client.get("/schedule").dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.get("/users/profile").dispatch();
    assert_eq!(resp.status(), Status::Ok);
}

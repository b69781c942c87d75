use chrono::{Datelike, NaiveDate, Utc};
use itertools::Itertools;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::auth::{load_user_by_token, maybe_session_user};
use crate::db::DbPool;
use crate::util::status_sqlx_error;
use crate::{ApiToken, SessionId, SharedAppState};

pub type TrainerId = i64;
pub type ServiceId = i64;

pub const DEFAULT_TRAINER_IMAGE: &str = "/images/default-trainer.svg";
pub const DEFAULT_SERVICE_IMAGE: &str = "/images/default-service.svg";

const TRAINER_SELECT: &str = "SELECT t.id, t.user_id, t.slug, t.specialization, t.achievements, t.experience_since, t.photo, \
 u.first_name, u.last_name, u.middle_name, u.email, u.phone_number \
 FROM trainers t \
 JOIN users u ON u.id = t.user_id";

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct TrainerRecord {
    pub id: TrainerId,
    pub user_id: i64,
    pub slug: String,
    pub specialization: String,
    pub achievements: String,
    pub experience_since: Option<NaiveDate>,
    pub photo: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub email: String,
    pub phone_number: Option<String>,
}
impl TrainerRecord {
    pub fn full_name(&self) -> String {
        [
            self.last_name.as_str(),
            self.first_name.as_str(),
            self.middle_name.as_deref().unwrap_or(""),
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
    }
    pub fn experience_years(&self) -> Option<i64> {
        let since = self.experience_since?;
        let days = Utc::now().date_naive().signed_duration_since(since).num_days();
        Some(days / 365)
    }
    pub fn specialization_list(&self) -> Vec<&str> {
        self.specialization.lines().filter(|l| !l.is_empty()).collect()
    }
    pub fn achievements_list(&self) -> Vec<&str> {
        self.achievements.lines().filter(|l| !l.is_empty()).collect()
    }
    pub fn avatar(&self) -> String {
        self.photo.clone().unwrap_or_else(|| DEFAULT_TRAINER_IMAGE.to_string())
    }
}

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct ServiceRecord {
    pub id: ServiceId,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub duration_min: i64,
    pub price: f64,
    pub photo: Option<String>,
    pub max_participants: i64,
    pub color: String,
}
impl ServiceRecord {
    pub fn avatar(&self) -> String {
        self.photo.clone().unwrap_or_else(|| DEFAULT_SERVICE_IMAGE.to_string())
    }
}

async fn list_trainers(db: &State<DbPool>) -> Result<Vec<TrainerRecord>, Custom<String>> {
    sqlx::query_as(&format!("{TRAINER_SELECT} ORDER BY u.last_name, u.first_name, u.middle_name"))
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)
}
async fn list_services(db: &State<DbPool>) -> Result<Vec<ServiceRecord>, Custom<String>> {
    sqlx::query_as("SELECT * FROM services ORDER BY name")
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)
}

// Current calendar month, used by the home page popularity ranking.
fn month_range() -> (NaiveDate, NaiveDate) {
    let today = Utc::now().date_naive();
    let start = today.with_day(1).expect("first day of month");
    let end = start.checked_add_months(chrono::Months::new(1)).expect("next month");
    (start, end)
}

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct PopularTrainer {
    pub id: TrainerId,
    pub slug: String,
    pub full_name: String,
    pub photo: Option<String>,
    pub count_distinct_clients: i64,
    pub count_clients: i64,
}
pub async fn popular_trainers(db: &State<DbPool>) -> Result<Vec<PopularTrainer>, Custom<String>> {
    let (start, end) = month_range();
    sqlx::query_as(
        "SELECT t.id, t.slug, \
         TRIM(u.last_name || ' ' || u.first_name || ' ' || COALESCE(u.middle_name, '')) AS full_name, \
         t.photo, \
         COUNT(DISTINCT b.client_id) AS count_distinct_clients, \
         COUNT(b.id) AS count_clients \
         FROM trainers t \
         JOIN users u ON u.id = t.user_id \
         JOIN schedule s ON s.trainer_id = t.id \
         JOIN bookings b ON b.schedule_id = s.id AND b.canceled = 0 \
         WHERE date(s.start_time) >= ? AND date(s.start_time) < ? \
         GROUP BY t.id \
         ORDER BY count_distinct_clients DESC, count_clients DESC, u.last_name, u.first_name \
         LIMIT 3")
        .bind(start)
        .bind(end)
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)
}

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct PopularService {
    pub id: ServiceId,
    pub slug: String,
    pub name: String,
    pub color: String,
    pub photo: Option<String>,
    pub count_distinct_clients: i64,
    pub count_clients: i64,
}
pub async fn popular_services(db: &State<DbPool>) -> Result<Vec<PopularService>, Custom<String>> {
    let (start, end) = month_range();
    sqlx::query_as(
        "SELECT sv.id, sv.slug, sv.name, sv.color, sv.photo, \
         COUNT(DISTINCT b.client_id) AS count_distinct_clients, \
         COUNT(b.id) AS count_clients \
         FROM services sv \
         JOIN schedule s ON s.service_id = sv.id \
         JOIN bookings b ON b.schedule_id = s.id AND b.canceled = 0 \
         WHERE date(s.start_time) >= ? AND date(s.start_time) < ? \
         GROUP BY sv.id \
         ORDER BY count_distinct_clients DESC, count_clients DESC, sv.name \
         LIMIT 3")
        .bind(start)
        .bind(end)
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)
}

#[get("/trainers")]
async fn get_trainers(session_id: Option<SessionId>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let user = maybe_session_user(session_id, state, db).await;
    let trainers = list_trainers(db).await?;
    let trainers = trainers.iter().map(|t| context! {
        slug: &t.slug,
        full_name: t.full_name(),
        avatar: t.avatar(),
        specializations: t.specialization_list(),
    }).collect::<Vec<_>>();
    Ok(Template::render("trainers", context! {
        title: "Our team",
        user,
        trainers,
    }))
}

#[get("/trainers/<trainer_slug>")]
async fn get_trainer(trainer_slug: &str, session_id: Option<SessionId>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let user = maybe_session_user(session_id, state, db).await;
    let trainer: Option<TrainerRecord> = sqlx::query_as(&format!("{TRAINER_SELECT} WHERE t.slug=?"))
        .bind(trainer_slug)
        .fetch_optional(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let Some(trainer) = trainer else {
        return Err(Custom(Status::NotFound, format!("Trainer {trainer_slug} not found")));
    };
    let services: Vec<ServiceRecord> = sqlx::query_as(
        "SELECT sv.* FROM services sv \
         JOIN service_trainers st ON st.service_id = sv.id \
         WHERE st.trainer_id=? ORDER BY sv.name")
        .bind(trainer.id)
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let specializations: Vec<String> = trainer.specialization_list().iter().map(|s| s.to_string()).collect();
    let achievements: Vec<String> = trainer.achievements_list().iter().map(|s| s.to_string()).collect();
    Ok(Template::render("trainer", context! {
        title: trainer.full_name(),
        full_name: trainer.full_name(),
        avatar: trainer.avatar(),
        experience_years: trainer.experience_years(),
        specializations,
        achievements,
        trainer,
        services,
        user,
    }))
}

#[get("/services")]
async fn get_services(session_id: Option<SessionId>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let user = maybe_session_user(session_id, state, db).await;
    let services = list_services(db).await?;
    Ok(Template::render("services", context! {
        title: "Classes",
        user,
        services,
    }))
}

#[get("/services/<service_slug>")]
async fn get_service(service_slug: &str, session_id: Option<SessionId>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let user = maybe_session_user(session_id, state, db).await;
    let service: Option<ServiceRecord> = sqlx::query_as("SELECT * FROM services WHERE slug=?")
        .bind(service_slug)
        .fetch_optional(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let Some(service) = service else {
        return Err(Custom(Status::NotFound, format!("Service {service_slug} not found")));
    };
    let trainers: Vec<TrainerRecord> = sqlx::query_as(&format!(
        "{TRAINER_SELECT} \
         JOIN service_trainers st ON st.trainer_id = t.id \
         WHERE st.service_id=? ORDER BY u.last_name, u.first_name"))
        .bind(service.id)
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let trainers = trainers.iter().map(|t| context! {
        slug: &t.slug,
        full_name: t.full_name(),
        avatar: t.avatar(),
    }).collect::<Vec<_>>();
    Ok(Template::render("service", context! {
        title: service.name.clone(),
        avatar: service.avatar(),
        service,
        trainers,
        user,
    }))
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrainerJson {
    pub id: TrainerId,
    pub full_name: String,
    pub email: String,
    pub phone_number: Option<String>,
    pub specialization: String,
    pub achievements: String,
    pub experience_years: Option<i64>,
    pub photo: Option<String>,
}
#[get("/api/trainers")]
async fn get_api_trainers(api_token: ApiToken, db: &State<DbPool>) -> Result<Json<Vec<TrainerJson>>, Custom<String>> {
    load_user_by_token(&api_token, db).await?;
    let trainers: Vec<TrainerRecord> = sqlx::query_as(&format!("{TRAINER_SELECT} ORDER BY t.id"))
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let trainers = trainers.into_iter().map(|t| TrainerJson {
        id: t.id,
        full_name: t.full_name(),
        email: t.email.clone(),
        phone_number: t.phone_number.clone(),
        specialization: t.specialization.clone(),
        achievements: t.achievements.clone(),
        experience_years: t.experience_years(),
        photo: t.photo.clone(),
    }).collect();
    Ok(Json(trainers))
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServiceJson {
    pub id: ServiceId,
    pub name: String,
    pub description: String,
    pub duration_min: i64,
    pub photo: Option<String>,
    pub color: String,
    pub max_participants: i64,
    pub trainers: Vec<TrainerId>,
}
#[get("/api/services")]
async fn get_api_services(api_token: ApiToken, db: &State<DbPool>) -> Result<Json<Vec<ServiceJson>>, Custom<String>> {
    load_user_by_token(&api_token, db).await?;
    let services: Vec<ServiceRecord> = sqlx::query_as("SELECT * FROM services ORDER BY id")
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let links: Vec<(ServiceId, TrainerId)> = sqlx::query_as("SELECT service_id, trainer_id FROM service_trainers ORDER BY service_id, trainer_id")
        .fetch_all(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let trainers_by_service = links.into_iter().into_group_map();
    let services = services.into_iter().map(|sv| {
        let trainers = trainers_by_service.get(&sv.id).cloned().unwrap_or_default();
        ServiceJson {
            id: sv.id,
            name: sv.name,
            description: sv.description,
            duration_min: sv.duration_min,
            photo: sv.photo,
            color: sv.color,
            max_participants: sv.max_participants,
            trainers,
        }
    }).collect();
    Ok(Json(services))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_trainers,
            get_trainer,
            get_services,
            get_service,
            get_api_trainers,
            get_api_services,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    fn trainer(first: &str, last: &str, middle: Option<&str>) -> TrainerRecord {
        TrainerRecord {
            id: 1,
            user_id: 1,
            slug: "x".to_string(),
            specialization: "Yoga\nPilates".to_string(),
            achievements: "".to_string(),
            experience_since: None,
            photo: None,
            first_name: first.to_string(),
            last_name: last.to_string(),
            middle_name: middle.map(|s| s.to_string()),
            email: "x@example.com".to_string(),
            phone_number: None,
        }
    }

    #[test]
    fn test_full_name_skips_missing_parts() {
        assert_eq!(trainer("Anna", "Petrova", None).full_name(), "Petrova Anna");
        assert_eq!(trainer("Anna", "Petrova", Some("Ivanovna")).full_name(), "Petrova Anna Ivanovna");
        assert_eq!(trainer("", "", None).full_name(), "");
    }

    #[test]
    fn test_specialization_list() {
        let t = trainer("Anna", "Petrova", None);
        assert_eq!(t.specialization_list(), vec!["Yoga", "Pilates"]);
        assert!(t.achievements_list().is_empty());
    }

    #[test]
    fn test_experience_years() {
        let mut t = trainer("Anna", "Petrova", None);
        assert_eq!(t.experience_years(), None);
        t.experience_since = Some(Utc::now().date_naive() - chrono::Days::new(800));
        assert_eq!(t.experience_years(), Some(2));
    }
}

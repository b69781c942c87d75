use chrono::{DateTime, NaiveDate, Utc};
use rocket::form::Form;
use rocket::http::{CookieJar, Status};
use rocket::request::FlashMessage;
use rocket::response::status::Custom;
use rocket::response::{Flash, Redirect};
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::auth::{close_session, create_user, issue_api_token, load_user_by_token, session_user, TokenResponse};
use crate::catalog::TrainerId;
use crate::db::DbPool;
use crate::util::status_sqlx_error;
use crate::{ApiToken, SessionId, SharedAppState};

pub type UserId = i64;

pub const DEFAULT_USER_IMAGE: &str = "/images/default-user.svg";

const USER_COLUMNS: &str = "id, username, email, first_name, last_name, middle_name, \
    phone_number, gender, birth_date, photo, is_active, is_staff, date_joined";

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub phone_number: Option<String>,
    pub gender: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub photo: Option<String>,
    pub is_active: bool,
    pub is_staff: bool,
    pub date_joined: DateTime<Utc>,
}
impl UserRecord {
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
    pub fn display_name(&self) -> String {
        let full_name = self.full_name();
        if full_name.is_empty() {
            self.username.clone()
        } else {
            full_name
        }
    }
    pub fn avatar(&self) -> String {
        self.photo.clone().unwrap_or_else(|| DEFAULT_USER_IMAGE.to_string())
    }
}

pub async fn load_user(user_id: UserId, db: &State<DbPool>) -> Result<UserRecord, Custom<String>> {
    let user: UserRecord = sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id=?"))
        .bind(user_id)
        .fetch_one(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    Ok(user)
}

pub async fn trainer_id_of(user_id: UserId, db: &State<DbPool>) -> Result<Option<TrainerId>, sqlx::Error> {
    let row: Option<(TrainerId,)> = sqlx::query_as("SELECT id FROM trainers WHERE user_id=?")
        .bind(user_id)
        .fetch_optional(&db.0)
        .await?;
    Ok(row.map(|r| r.0))
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UserJson {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub photo: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub phone_number: Option<String>,
    pub gender: Option<String>,
    pub trainer_id: Option<TrainerId>,
    pub date_joined_ms: i64,
    pub is_staff: bool,
}
pub async fn user_json(user: &UserRecord, db: &State<DbPool>) -> Result<UserJson, Custom<String>> {
    let trainer_id = trainer_id_of(user.id, db).await.map_err(status_sqlx_error)?;
    Ok(UserJson {
        id: user.id,
        username: user.username.clone(),
        email: user.email.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        middle_name: user.middle_name.clone(),
        photo: user.photo.clone(),
        birth_date: user.birth_date,
        phone_number: user.phone_number.clone(),
        gender: user.gender.clone(),
        trainer_id,
        date_joined_ms: user.date_joined.timestamp() * 1000,
        is_staff: user.is_staff,
    })
}

async fn deactivate_user(user_id: UserId, db: &State<DbPool>) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET is_active=0, api_token=NULL WHERE id=?")
        .bind(user_id)
        .execute(&db.0)
        .await?;
    info!("User deactivated, id: {user_id}");
    Ok(())
}

#[derive(Serialize, Debug)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
}
async fn delete_user_photo(user: &UserRecord, db: &State<DbPool>) -> Result<ActionOutcome, sqlx::Error> {
    if user.photo.is_none() {
        return Ok(ActionOutcome {
            success: false,
            message: "You don't have a profile photo yet".to_string(),
        });
    }
    sqlx::query("UPDATE users SET photo=NULL WHERE id=?")
        .bind(user.id)
        .execute(&db.0)
        .await?;
    Ok(ActionOutcome {
        success: true,
        message: "Your photo has been successfully deleted".to_string(),
    })
}

#[get("/users/profile")]
async fn get_profile(session_id: SessionId, flash: Option<FlashMessage<'_>>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let user = session_user(&session_id, state, db).await?;
    let trainer_id = trainer_id_of(user.id, db).await.map_err(status_sqlx_error)?;
    Ok(Template::render("profile", context! {
        title: "Profile",
        full_name: user.display_name(),
        avatar: user.avatar(),
        trainer_id,
        user,
        flash: flash.map(|f| (f.kind().to_string(), f.message().to_string())),
    }))
}

#[get("/users/profile/edit")]
async fn get_profile_edit(session_id: SessionId, flash: Option<FlashMessage<'_>>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let user = session_user(&session_id, state, db).await?;
    Ok(Template::render("profile-edit", context! {
        title: "Edit profile",
        user,
        flash: flash.map(|f| (f.kind().to_string(), f.message().to_string())),
    }))
}

#[derive(Debug, FromForm)]
struct ProfileFormValues<'v> {
    first_name: &'v str,
    last_name: &'v str,
    middle_name: &'v str,
    email: &'v str,
    phone_number: &'v str,
    gender: &'v str,
    birth_date: &'v str,
    photo: &'v str,
}
fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}
#[post("/users/profile/edit", data = "<form>")]
async fn post_profile_edit(form: Form<ProfileFormValues<'_>>, session_id: SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Flash<Redirect>, Custom<String>> {
    let user = session_user(&session_id, state, db).await?;
    let birth_date = match non_empty(form.birth_date) {
        Some(s) => match s.parse::<NaiveDate>() {
            Ok(d) => Some(d),
            Err(_) => return Ok(Flash::error(Redirect::to("/users/profile/edit"), format!("Unrecognized date: {s}"))),
        },
        None => None,
    };
    let gender = non_empty(form.gender);
    if let Some(g) = gender {
        if g != "M" && g != "F" {
            return Ok(Flash::error(Redirect::to("/users/profile/edit"), "Gender must be 'M' or 'F'".to_string()));
        }
    }
    let res = sqlx::query("UPDATE users SET first_name=?, last_name=?, middle_name=?, email=?, phone_number=?, gender=?, birth_date=?, photo=? WHERE id=?")
        .bind(form.first_name.trim())
        .bind(form.last_name.trim())
        .bind(non_empty(form.middle_name))
        .bind(form.email.trim())
        .bind(non_empty(form.phone_number))
        .bind(gender)
        .bind(birth_date)
        .bind(non_empty(form.photo))
        .bind(user.id)
        .execute(&db.0)
        .await;
    match res {
        Ok(_) => Ok(Flash::success(Redirect::to("/users/profile/edit"), "Your profile has been successfully updated")),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Ok(Flash::error(Redirect::to("/users/profile/edit"), "A user with that phone number already exists!"))
        }
        Err(e) => Err(status_sqlx_error(e)),
    }
}

#[post("/users/delete")]
async fn post_user_delete(session_id: SessionId, cookies: &CookieJar<'_>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Flash<Redirect>, Custom<String>> {
    let user = session_user(&session_id, state, db).await?;
    deactivate_user(user.id, db).await.map_err(status_sqlx_error)?;
    close_session(Some(session_id), state, cookies);
    Ok(Flash::success(Redirect::to("/login"), "Your account has been successfully deleted. Thank you for staying with us!"))
}

#[post("/users/delete-photo")]
async fn post_delete_photo(session_id: SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Flash<Redirect>, Custom<String>> {
    let user = session_user(&session_id, state, db).await?;
    let outcome = delete_user_photo(&user, db).await.map_err(status_sqlx_error)?;
    let redirect = Redirect::to("/users/profile/edit");
    if outcome.success {
        Ok(Flash::success(redirect, outcome.message))
    } else {
        Ok(Flash::error(redirect, outcome.message))
    }
}

#[get("/api/users/me")]
async fn get_api_user_me(api_token: ApiToken, db: &State<DbPool>) -> Result<Json<UserJson>, Custom<String>> {
    let user = load_user_by_token(&api_token, db).await?;
    Ok(Json(user_json(&user, db).await?))
}

// username and email stay read-only through the API, as on the web form.
#[derive(Deserialize, Default, Clone, Debug)]
pub struct UserUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub middle_name: Option<String>,
    pub photo: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub phone_number: Option<String>,
    pub gender: Option<String>,
}
#[patch("/api/users/me", data = "<update>")]
async fn patch_api_user_me(api_token: ApiToken, update: Json<UserUpdate>, db: &State<DbPool>) -> Result<Json<UserJson>, Custom<String>> {
    let mut user = load_user_by_token(&api_token, db).await?;
    let update = update.into_inner();
    if let Some(first_name) = update.first_name {
        user.first_name = first_name;
    }
    if let Some(last_name) = update.last_name {
        user.last_name = last_name;
    }
    if let Some(middle_name) = update.middle_name {
        user.middle_name = Some(middle_name);
    }
    if let Some(photo) = update.photo {
        user.photo = Some(photo);
    }
    if let Some(birth_date) = update.birth_date {
        user.birth_date = Some(birth_date);
    }
    if let Some(phone_number) = update.phone_number {
        user.phone_number = Some(phone_number);
    }
    if let Some(gender) = update.gender {
        if gender != "M" && gender != "F" {
            return Err(Custom(Status::BadRequest, "Gender must be 'M' or 'F'".to_string()));
        }
        user.gender = Some(gender);
    }
    sqlx::query("UPDATE users SET first_name=?, last_name=?, middle_name=?, photo=?, birth_date=?, phone_number=?, gender=? WHERE id=?")
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.middle_name)
        .bind(&user.photo)
        .bind(user.birth_date)
        .bind(&user.phone_number)
        .bind(&user.gender)
        .bind(user.id)
        .execute(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    Ok(Json(user_json(&user, db).await?))
}

#[delete("/api/users/me")]
async fn delete_api_user_me(api_token: ApiToken, db: &State<DbPool>) -> Result<Status, Custom<String>> {
    let user = load_user_by_token(&api_token, db).await?;
    deactivate_user(user.id, db).await.map_err(status_sqlx_error)?;
    Ok(Status::NoContent)
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateUserResponse {
    pub user: UserJson,
    pub token: TokenResponse,
}
#[post("/api/users", data = "<request>")]
async fn post_api_users(request: Json<CreateUserRequest>, db: &State<DbPool>) -> Result<Json<CreateUserResponse>, Custom<String>> {
    if request.password.len() < 8 {
        return Err(Custom(Status::BadRequest, "Password must be at least 8 characters long!".to_string()));
    }
    let user_id = match create_user(&request.username, &request.email, &request.first_name, &request.last_name, &request.password, db).await {
        Ok(user_id) => user_id,
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            return Err(Custom(Status::BadRequest, "A user with that username already exists!".to_string()));
        }
        Err(e) => return Err(status_sqlx_error(e)),
    };
    let token = issue_api_token(user_id, db).await.map_err(status_sqlx_error)?;
    let user = load_user(user_id, db).await?;
    Ok(Json(CreateUserResponse {
        user: user_json(&user, db).await?,
        token: TokenResponse { access: token.0 },
    }))
}

#[derive(Serialize, Debug)]
struct PhotoDeleteResponse {
    success: bool,
    message: String,
    user: UserJson,
}
#[delete("/api/users/me/photo")]
async fn delete_api_user_photo(api_token: ApiToken, db: &State<DbPool>) -> Result<Json<PhotoDeleteResponse>, Custom<String>> {
    let user = load_user_by_token(&api_token, db).await?;
    let outcome = delete_user_photo(&user, db).await.map_err(status_sqlx_error)?;
    let user = load_user(user.id, db).await?;
    Ok(Json(PhotoDeleteResponse {
        success: outcome.success,
        message: outcome.message,
        user: user_json(&user, db).await?,
    }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_profile,
            get_profile_edit,
            post_profile_edit,
            post_user_delete,
            post_delete_photo,
            get_api_user_me,
            patch_api_user_me,
            delete_api_user_me,
            post_api_users,
            delete_api_user_photo,
        ])
}

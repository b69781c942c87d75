use rand::Rng;
use rocket::form::Form;
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::request::FlashMessage;
use rocket::response::status::Custom;
use rocket::response::{Flash, Redirect};
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use crate::db::DbPool;
use crate::users::{load_user, UserId, UserRecord};
use crate::util::status_sqlx_error;
use crate::{ApiToken, FitSession, SessionId, SharedAppState};

pub const FIT_SESSION_ID: &str = "fit_session_id";

pub fn generate_random_string(len: usize) -> String {
    const WOWELS: &str = "aeiouy";
    const CONSONANTS: &str = "bcdfghjklmnopqrstvwxz";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|n| {
            let charset = if n % 2 == 0 { CONSONANTS } else { WOWELS };
            let idx = rng.gen_range(0..charset.len());
            charset.chars().nth(idx).unwrap()
        })
        .collect()
}

const PASSWORD_ROUNDS: u32 = 50_000;

// iterated salted digest, the salt is folded into every round
fn password_digest(salt: &str, password: &str) -> String {
    let mut digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(b"$")
        .chain_update(password.as_bytes())
        .finalize();
    for _ in 1..PASSWORD_ROUNDS {
        digest = Sha256::new()
            .chain_update(salt.as_bytes())
            .chain_update(&digest)
            .finalize();
    }
    hex::encode(digest)
}
// stored as "salt$hexdigest"
pub fn make_password_hash(password: &str) -> String {
    let salt = generate_random_string(16);
    format!("{salt}${}", password_digest(&salt, password))
}
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Some((salt, digest)) = stored_hash.split_once('$') else {
        return false;
    };
    password_digest(salt, password) == digest
}

pub async fn create_user(username: &str, email: &str, first_name: &str, last_name: &str, password: &str, db: &State<DbPool>) -> Result<UserId, sqlx::Error> {
    let id: (i64,) = sqlx::query_as("INSERT INTO users(username, email, first_name, last_name, password_hash) VALUES (?, ?, ?, ?, ?) RETURNING id")
        .bind(username)
        .bind(email)
        .bind(first_name)
        .bind(last_name)
        .bind(make_password_hash(password))
        .fetch_one(&db.0)
        .await?;
    info!("User created, id: {}, username: {username}", id.0);
    Ok(id.0)
}

/// Checks username/password against the users table, `None` when the
/// credentials don't match or the account was deactivated.
pub async fn authenticate(username: &str, password: &str, db: &State<DbPool>) -> Result<Option<UserId>, sqlx::Error> {
    let row: Option<(UserId, String, bool)> = sqlx::query_as("SELECT id, password_hash, is_active FROM users WHERE username=?")
        .bind(username)
        .fetch_optional(&db.0)
        .await?;
    let Some((user_id, password_hash, is_active)) = row else {
        return Ok(None);
    };
    if is_active && verify_password(password, &password_hash) {
        Ok(Some(user_id))
    } else {
        Ok(None)
    }
}

pub fn open_session(user_id: UserId, state: &State<SharedAppState>, cookies: &CookieJar<'_>) {
    let session_id = generate_random_string(32);
    state.write().expect("not poisoned").sessions.insert(SessionId(session_id.clone()), FitSession { user_id });
    cookies.add_private(
        Cookie::build((FIT_SESSION_ID, session_id))
            .same_site(SameSite::Lax)
            .build()
    );
}
pub fn close_session(session_id: Option<SessionId>, state: &State<SharedAppState>, cookies: &CookieJar<'_>) {
    if let Some(session_id) = session_id {
        state.write().expect("not poisoned").sessions.remove(&session_id);
    }
    cookies.remove_private(FIT_SESSION_ID);
}

pub fn session_user_id(session_id: &SessionId, state: &State<SharedAppState>) -> Result<UserId, Custom<String>> {
    state.read().map_err(|e| Custom(Status::InternalServerError, e.to_string()))?
        .sessions.get(session_id).map(|s| s.user_id)
        .ok_or(Custom(Status::Unauthorized, "Session expired".to_string()))
}
pub async fn session_user(session_id: &SessionId, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<UserRecord, Custom<String>> {
    let user_id = session_user_id(session_id, state)?;
    load_user(user_id, db).await
}
pub async fn maybe_session_user(session_id: Option<SessionId>, state: &State<SharedAppState>, db: &State<DbPool>) -> Option<UserRecord> {
    let session_id = session_id?;
    session_user(&session_id, state, db).await.ok()
}

pub async fn load_user_by_token(api_token: &ApiToken, db: &State<DbPool>) -> Result<UserRecord, Custom<String>> {
    let id: (UserId,) = sqlx::query_as("SELECT id FROM users WHERE api_token=? AND is_active=1")
        .bind(&api_token.0)
        .fetch_one(&db.0)
        .await
        .map_err(|e| Custom(Status::Unauthorized, e.to_string()))?;
    load_user(id.0, db).await
}

pub async fn issue_api_token(user_id: UserId, db: &State<DbPool>) -> Result<ApiToken, sqlx::Error> {
    let token = ApiToken(generate_random_string(24));
    sqlx::query("UPDATE users SET api_token=? WHERE id=?")
        .bind(&token.0)
        .bind(user_id)
        .execute(&db.0)
        .await?;
    Ok(token)
}

#[derive(Debug, FromForm)]
struct LoginFormValues<'v> {
    username: &'v str,
    password: &'v str,
}
#[get("/login")]
fn get_login(flash: Option<FlashMessage<'_>>) -> Template {
    Template::render("login", context! {
        title: "Log in",
        flash: flash.map(|f| (f.kind().to_string(), f.message().to_string())),
    })
}
#[post("/login", data = "<form>")]
async fn post_login(form: Form<LoginFormValues<'_>>, cookies: &CookieJar<'_>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Flash<Redirect>, Custom<String>> {
    match authenticate(form.username, form.password, db).await.map_err(status_sqlx_error)? {
        Some(user_id) => {
            info!("User log in, username: {}", form.username);
            open_session(user_id, state, cookies);
            Ok(Flash::success(Redirect::to("/"), format!("Welcome back, {}!", form.username)))
        }
        None => Ok(Flash::error(Redirect::to("/login"), "Invalid username or password!")),
    }
}
#[get("/logout")]
fn get_logout(session_id: Option<SessionId>, cookies: &CookieJar<'_>, state: &State<SharedAppState>) -> Redirect {
    close_session(session_id, state, cookies);
    Redirect::to("/")
}

#[derive(Debug, FromForm)]
struct RegisterFormValues<'v> {
    username: &'v str,
    email: &'v str,
    first_name: &'v str,
    last_name: &'v str,
    password1: &'v str,
    password2: &'v str,
}
#[get("/register")]
fn get_register(flash: Option<FlashMessage<'_>>) -> Template {
    Template::render("register", context! {
        title: "Sign up",
        flash: flash.map(|f| (f.kind().to_string(), f.message().to_string())),
    })
}
#[post("/register", data = "<form>")]
async fn post_register(form: Form<RegisterFormValues<'_>>, cookies: &CookieJar<'_>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Flash<Redirect>, Custom<String>> {
    if form.password1 != form.password2 {
        return Ok(Flash::error(Redirect::to("/register"), "Passwords do not match!"));
    }
    if form.password1.len() < 8 {
        return Ok(Flash::error(Redirect::to("/register"), "Password must be at least 8 characters long!"));
    }
    match create_user(form.username, form.email, form.first_name, form.last_name, form.password1, db).await {
        Ok(user_id) => {
            open_session(user_id, state, cookies);
            Ok(Flash::success(Redirect::to("/"), "You have successfully registered"))
        }
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Ok(Flash::error(Redirect::to("/register"), "A user with that username already exists!"))
        }
        Err(e) => Err(status_sqlx_error(e)),
    }
}

#[derive(Debug, FromForm)]
struct PasswordChangeFormValues<'v> {
    old_password: &'v str,
    new_password1: &'v str,
    new_password2: &'v str,
}
#[post("/users/password-change", data = "<form>")]
async fn post_password_change(form: Form<PasswordChangeFormValues<'_>>, session_id: SessionId, cookies: &CookieJar<'_>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Flash<Redirect>, Custom<String>> {
    let user = session_user(&session_id, state, db).await?;
    if authenticate(&user.username, form.old_password, db).await.map_err(status_sqlx_error)?.is_none() {
        return Ok(Flash::error(Redirect::to("/users/profile/edit"), "Current password is incorrect!"));
    }
    if form.new_password1 != form.new_password2 {
        return Ok(Flash::error(Redirect::to("/users/profile/edit"), "Passwords do not match!"));
    }
    if form.new_password1.len() < 8 {
        return Ok(Flash::error(Redirect::to("/users/profile/edit"), "Password must be at least 8 characters long!"));
    }
    sqlx::query("UPDATE users SET password_hash=? WHERE id=?")
        .bind(make_password_hash(form.new_password1))
        .bind(user.id)
        .execute(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    close_session(Some(session_id), state, cookies);
    Ok(Flash::success(Redirect::to("/login"), "You have successfully changed your password"))
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TokenResponse {
    pub access: String,
}
#[post("/api/token", data = "<credentials>")]
async fn post_api_token(credentials: Json<Credentials>, db: &State<DbPool>) -> Result<Json<TokenResponse>, Custom<String>> {
    let Some(user_id) = authenticate(&credentials.username, &credentials.password, db).await.map_err(status_sqlx_error)? else {
        return Err(Custom(Status::Unauthorized, "Invalid username or password!".to_string()));
    };
    let token = issue_api_token(user_id, db).await.map_err(status_sqlx_error)?;
    Ok(Json(TokenResponse { access: token.0 }))
}
#[delete("/api/token")]
async fn delete_api_token(api_token: ApiToken, db: &State<DbPool>) -> Result<(), Custom<String>> {
    let res = sqlx::query("UPDATE users SET api_token=NULL WHERE api_token=?")
        .bind(&api_token.0)
        .execute(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    if res.rows_affected() == 0 {
        Err(Custom(Status::Unauthorized, "Unknown API token".to_string()))
    } else {
        Ok(())
    }
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_login,
            post_login,
            get_logout,
            get_register,
            post_register,
            post_password_change,
            post_api_token,
            delete_api_token,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_generate_random_string() {
        let s = generate_random_string(10);
        assert_eq!(s.len(), 10);
        assert!(s.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = make_password_hash("sekretno1");
        assert!(verify_password("sekretno1", &hash));
        assert!(!verify_password("sekretno2", &hash));
        // two hashes of the same password differ by salt
        assert_ne!(hash, make_password_hash("sekretno1"));
    }

    #[test]
    fn test_verify_password_malformed_hash() {
        assert!(!verify_password("whatever", "no-dollar-separator"));
    }

    #[test]
    fn test_password_digest_is_iterated() {
        let single_round = {
            let mut hasher = Sha256::new();
            hasher.update(b"salt$sekretno1");
            hex::encode(hasher.finalize())
        };
        assert_ne!(password_digest("salt", "sekretno1"), single_round);
        // deterministic for a fixed salt
        assert_eq!(password_digest("salt", "sekretno1"), password_digest("salt", "sekretno1"));
    }
}

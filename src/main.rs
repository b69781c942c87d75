#[macro_use] extern crate rocket;
#[macro_use] extern crate log;

use std::collections::HashMap;
use std::sync::RwLock;
use rocket::fs::FileServer;
use rocket::http::{CookieJar, Status};
use rocket::request::FlashMessage;
use rocket::response::status::Custom;
use rocket::{request, State};
use rocket_dyn_templates::handlebars::{Handlebars, Helper};
use rocket_dyn_templates::{context, handlebars, Template};
use serde::{Deserialize, Serialize};
use crate::auth::{maybe_session_user, FIT_SESSION_ID};
use crate::catalog::{popular_services, popular_trainers};
use crate::db::{DbPool, DbPoolFairing};
use crate::users::UserId;
use crate::util::{dtstr_iso, durstr};

#[cfg(test)]
mod tests;
mod db;
mod auth;
mod users;
mod catalog;
mod schedule;
mod booking;
mod demo;
mod util;

pub struct FitSession {
    user_id: UserId,
}
#[derive(Eq, Hash, PartialEq, Clone)]
pub struct SessionId(String);
#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for SessionId {
    type Error = ();
    async fn from_request(request: &'r request::Request<'_>) -> request::Outcome<SessionId, ()> {
        let cookies = request
            .guard::<&CookieJar<'_>>()
            .await
            .expect("request cookies");
        if let Some(cookie) = cookies.get_private(FIT_SESSION_ID) {
            return request::Outcome::Success(SessionId(cookie.value().to_string()));
        }
        request::Outcome::Forward(Status::Unauthorized)
    }
}

pub const FIT_API_TOKEN_HEADER: &str = "fit-api-token";

#[derive(Serialize, Deserialize, PartialEq, Default, Clone, Debug)]
pub struct ApiToken(pub String);

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for ApiToken {
    type Error = ();
    async fn from_request(request: &'r request::Request<'_>) -> request::Outcome<ApiToken, ()> {
        if let Some(api_token) = request.headers().get_one(FIT_API_TOKEN_HEADER) {
            return request::Outcome::Success(ApiToken(api_token.to_string()));
        }
        // forwarding would fall through to the static file server and 404
        request::Outcome::Error((Status::Unauthorized, ()))
    }
}

pub struct AppState {
    sessions: HashMap<SessionId, FitSession>,
}
impl AppState {
    fn new() -> Self {
        Self {
            sessions: Default::default(),
        }
    }
}
pub type SharedAppState = RwLock<AppState>;

#[get("/")]
async fn index(session_id: Option<SessionId>, flash: Option<FlashMessage<'_>>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let user = maybe_session_user(session_id, state, db).await;
    let trainers = popular_trainers(db).await?;
    let services = popular_services(db).await?;
    Ok(Template::render("index", context! {
        title: "Home",
        user,
        trainers,
        services,
        flash: flash.map(|f| (f.kind().to_string(), f.message().to_string())),
    }))
}

#[launch]
fn rocket() -> _ {
    let rocket = rocket::build()
        .attach(Template::custom(|engines| {
            let handlebars = &mut engines.handlebars;

            handlebars.register_helper("dtstr",
                                       Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                           let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("dtstr", 0))?.value();
                                           let s = dtstr_iso(val.as_str());
                                           out.write(&s)?;
                                           Ok(())
                                       }));
            handlebars.register_helper("durstr",
                                       Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                           let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("durstr", 0))?.value();
                                           if let Some(min) = val.as_i64() {
                                               out.write(&durstr(min))?;
                                           } else {
                                               out.write("--")?;
                                           }
                                           Ok(())
                                       }));
        }))
        .attach(DbPoolFairing())
        .mount("/", FileServer::from("./static"))
        .mount("/", routes![
            index,
        ]);
    let rocket = auth::extend(rocket);
    let rocket = users::extend(rocket);
    let rocket = catalog::extend(rocket);
    let rocket = schedule::extend(rocket);
    let rocket = booking::extend(rocket);
    let rocket = demo::extend(rocket);

    rocket.manage(SharedAppState::new(AppState::new()))
}

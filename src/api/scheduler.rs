use actix_web::{get, post, web, Responder, Scope};

use crate::{error::Error, service::Service};

#[get("/status")]
async fn status(service: web::Data<Service>) -> impl Responder {
    web::Json(service.status().await)
}

#[post("/tick")]
async fn tick(service: web::Data<Service>) -> Result<impl Responder, Error> {
    Ok(web::Json(service.tick().await?))
}

pub fn service() -> Scope {
    web::scope("/scheduler").service(status).service(tick)
}

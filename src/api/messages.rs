use actix_web::{get, post, web, HttpResponse, Responder, Scope};
use serde::Deserialize;

use crate::{
    error::Error,
    message::{MessageId, MessageStatus, NewMessage},
    service::Service,
};

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    status: Option<MessageStatus>,
    limit: Option<u32>,
}

#[get("")]
async fn list_messages(
    service: web::Data<Service>,
    query: web::Query<ListMessagesQuery>,
) -> Result<impl Responder, Error> {
    let ListMessagesQuery { status, limit } = query.into_inner();

    Ok(web::Json(service.list(status, limit).await?))
}

/// Enqueues a message and makes the first attempt before responding.
#[post("")]
async fn send_message(
    service: web::Data<Service>,
    data: web::Json<NewMessage>,
) -> Result<impl Responder, Error> {
    let message = service.send(data.into_inner()).await?;

    Ok(HttpResponse::Created().json(message))
}

#[get("/{id}")]
async fn get_message(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    Ok(web::Json(service.get(MessageId(*path)).await?))
}

#[post("/{id}/retry")]
async fn retry_message(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    Ok(web::Json(service.force_retry(MessageId(*path)).await?))
}

#[post("/{id}/reject")]
async fn reject_message(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    Ok(web::Json(service.reject(MessageId(*path)).await?))
}

pub fn service() -> Scope {
    web::scope("/messages")
        .service(list_messages)
        .service(send_message)
        .service(get_message)
        .service(retry_message)
        .service(reject_message)
}

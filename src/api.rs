//! HTTP endpoints for inspecting messages and operating on them by hand.

use actix_web::web;

pub mod messages;
pub mod scheduler;

/// Registers every scope on an app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(messages::service())
        .service(scheduler::service());
}

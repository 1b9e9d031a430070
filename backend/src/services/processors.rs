//! `GET /api/processors`: the processing kinds this server offers, with
//! their cost and input requirements. Served from the same catalog the
//! submitter validates against.

use crate::processing::KindCatalog;
use actix_web::web::{get, scope};
use actix_web::{web, HttpResponse, Scope};

const API_PATH: &str = "/api/processors";

pub fn configure_routes() -> Scope {
    scope(API_PATH).route("", get().to(process))
}

async fn process(catalog: web::Data<KindCatalog>) -> HttpResponse {
    HttpResponse::Ok().json(catalog.describe())
}

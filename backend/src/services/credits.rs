//! Credit balance endpoints.
//!
//! - `GET /api/credits`: the caller's balance. Accounts are opened with the
//!   default allowance on first use.
//! - `POST /api/credits/check`: whether the caller can afford `cost`. Nothing
//!   is charged.

use crate::error::CoreError;
use crate::identity::Caller;
use crate::ledger::CreditLedger;
use actix_web::web::{get, post, scope};
use actix_web::{web, HttpResponse, Scope};
use common::requests::{BalanceResponse, CreditCheckRequest, CreditCheckResponse};

const API_PATH: &str = "/api/credits";

pub fn configure_routes() -> Scope {
    scope(API_PATH)
        .route("", get().to(balance))
        .route("/check", post().to(check))
}

async fn balance(
    caller: Caller,
    ledger: web::Data<dyn CreditLedger>,
) -> Result<HttpResponse, CoreError> {
    let balance = ledger.balance(caller.id())?;
    Ok(HttpResponse::Ok().json(BalanceResponse {
        user: caller.0,
        balance,
    }))
}

async fn check(
    caller: Caller,
    ledger: web::Data<dyn CreditLedger>,
    body: web::Json<CreditCheckRequest>,
) -> Result<HttpResponse, CoreError> {
    let result = ledger.check(caller.id(), body.cost)?;
    Ok(HttpResponse::Ok().json(CreditCheckResponse {
        sufficient: result.sufficient,
        current_balance: result.current_balance,
    }))
}

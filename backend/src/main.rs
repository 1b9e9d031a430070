use actix_web::middleware::Logger;
use actix_web::{App, HttpServer};
use backend::config::Settings;
use backend::db::Database;
use backend::processing::engines_from_settings;
use backend::AppContext;
use env_logger::Env;
use log::info;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // A missing .env is fine; the environment and defaults still apply.
    dotenvy::dotenv().ok();
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let settings = Settings::from_env();
    let db = Database::open(&settings.database_path).map_err(std::io::Error::other)?;
    let engines = engines_from_settings(&settings);

    let (ctx, rx) = AppContext::new(settings.clone(), db, engines).map_err(std::io::Error::other)?;
    let restored = ctx.jobs.restore().await.map_err(std::io::Error::other)?;
    if restored > 0 {
        info!("Restored {} job(s) from {}", restored, settings.database_path.display());
    }
    ctx.spawn_background(rx);

    info!("Server running at {}", settings.bind_url());

    HttpServer::new(move || {
        let ctx = ctx.clone();
        App::new()
            .wrap(Logger::default())
            .configure(move |cfg| ctx.configure(cfg))
    })
    .bind((settings.host.as_str(), settings.port))?
    .run()
    .await
}

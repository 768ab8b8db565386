use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use lifeline::config::load_config;
use lifeline::db::SosDb;
use lifeline::http;
use lifeline::scheduler::Scheduler;
use lifeline::state::AppState;
use lifeline::telephony::TelephonyClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = load_config()?;

    let db = match &config.db_path {
        Some(path) => SosDb::open_at(PathBuf::from(path))?,
        None => SosDb::open()?,
    };

    if !config.telephony.is_configured() {
        log::warn!("Telephony credentials not configured; SOS triggers will be rejected");
    }

    let telephony = Arc::new(TelephonyClient::new(config.telephony.clone()));
    let state = Arc::new(AppState::new(config, db, telephony));

    // Scheduler: escalation ring-window sweep + retention schedule
    let scheduler = Scheduler::new(state.clone());
    tokio::spawn(scheduler.run());

    let addr: SocketAddr = state.config.http.bind.parse()?;
    let app = http::router(state);

    log::info!("lifelined listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

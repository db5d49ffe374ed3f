use actix_web::{middleware, web, App, HttpServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sockethub::config::Config;
use sockethub::handlers::build_server;
use sockethub::routes::configure_routes;
use sockethub::socketio::Dispatcher;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting sockethub");

    let config = Config::from_env().map_err(anyhow::Error::msg)?;
    info!("Configuration loaded from environment");

    let bind_addr = config.bind_addr();
    let server = build_server(config)?;
    let dispatcher = Dispatcher::new(server.clone());

    let sweeper = server.spawn_ack_sweeper();

    info!("Server running at http://{}", bind_addr);

    let server_data = web::Data::new(server.clone());
    let dispatcher_data = web::Data::new(dispatcher);

    HttpServer::new(move || {
        App::new()
            .app_data(server_data.clone())
            .app_data(dispatcher_data.clone())
            .wrap(middleware::Logger::default())
            .configure(configure_routes)
    })
    .bind(&bind_addr)?
    .run()
    .await?;

    server.shutdown().await;
    sweeper.abort();

    Ok(())
}

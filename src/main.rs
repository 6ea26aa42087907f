use log::info;

use nextier::main_module::{
    create_app_state, init_database, init_logging, load_config, run_server,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    info!("Starting nextier {}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    let server = config.server.clone();
    let pool = init_database(&config)?;
    let state = create_app_state(config, pool).await?;

    run_server(state, &server).await?;
    info!("Server stopped");
    Ok(())
}

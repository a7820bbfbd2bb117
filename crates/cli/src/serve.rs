//! `toolhub serve`: one tool server in the foreground.
//!
//! This is what the supervisor launches for each built-in server.

use std::net::IpAddr;

use capabilities::{OpenAiTranslator, OpenWeather, PptServer, SqlServer, WeatherServer};
use mcp::{ToolServer, ToolService};
use runtime::Capability;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::signal::Interrupt;

/// Serve `capability` until interrupted.
///
/// Runs on a single-threaded runtime; concurrent calls interleave at
/// await points and blocking work goes to the blocking pool.
pub fn run(config: &Config, capability: Capability, host: IpAddr, port: u16) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config, capability, host, port))
}

async fn serve(config: &Config, capability: Capability, host: IpAddr, port: u16) -> Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(%capability, addr = %listener.local_addr()?, "tool server listening");

    match capability {
        Capability::Weather => {
            let source = OpenWeather::new(config.weather_config())?;
            run_server(WeatherServer::new(source), listener).await
        }
        Capability::Sql => {
            let server = SqlServer::new(&config.sql.database).with_max_rows(config.sql.max_rows);
            run_server(server, listener).await
        }
        Capability::PptTranslate => {
            let translator = OpenAiTranslator::new(config.translator_config())?;
            let server = PptServer::new(translator)
                .with_max_file_bytes(config.translator.max_file_bytes)
                .with_max_expanded_bytes(config.translator.max_expanded_bytes);
            run_server(server, listener).await
        }
    }
}

async fn run_server<S: ToolService>(service: S, listener: TcpListener) -> Result<()> {
    let mut interrupt = Interrupt::install()?;
    ToolServer::new(service)
        .serve(listener, async move { interrupt.recv().await })
        .await?;
    info!("tool server stopped");
    Ok(())
}

//! Runs both ends of the link in one process and exercises the parameter
//! calls over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tether::{
    CommandId, Config, Connection, MemoryStore, ParamId, ParamSpec, ParameterDispatcher, ParameterFacade,
    ParameterStore,
};
use tokio::time::sleep;
use tracing::info;

const CALL_TIMEOUT: Duration = Duration::from_secs(1);

fn table() -> tether::Result<Arc<MemoryStore>> {
    let mut specs = vec![ParamSpec::new(0, 1, 0); 3];
    specs.extend([
        ParamSpec::new(0, 100, 50),   // speed
        ParamSpec::new(-45, 45, 0),   // steering trim
        ParamSpec::new(0, 3000, 500), // ramp time in ms
    ]);
    Ok(Arc::new(MemoryStore::new(specs)?))
}

#[tokio::main]
async fn main() -> tether::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let controller_table = table()?;
    let resettable = Arc::clone(&controller_table);
    let dispatcher = ParameterDispatcher::new(Arc::clone(&controller_table))
        .with_safe_state(vec![(ParamId(3), 0)])
        .with_command_handler(Arc::new(move |command: CommandId| {
            info!(%command, "command received");
            match command {
                CommandId::SAVE_PARAMETERS => true,
                CommandId::RESTORE_DEFAULTS => {
                    resettable.reset_to_defaults();
                    true
                }
                _ => false,
            }
        }));
    let any_port = SocketAddr::from(([127, 0, 0, 1], 0));
    let server = Connection::new(Config::server(any_port), Arc::new(dispatcher))?;
    server.start();

    let addr = loop {
        if let Some(addr) = server.local_addr() {
            break addr;
        }
        sleep(Duration::from_millis(10)).await;
    };

    let handheld_table = table()?;
    let client = Connection::new(
        Config::client(addr),
        Arc::new(ParameterDispatcher::new(Arc::clone(&handheld_table))),
    )?;
    client.start();
    if !client.try_connect_with_timeout(Duration::from_secs(3)).await {
        return Err(tether::Error::timeout(format!("no link to {}", addr)));
    }

    let params = ParameterFacade::new(client.broker(), handheld_table);
    let refreshed = params.get_all(CALL_TIMEOUT).await?;
    info!(refreshed, table = ?params.store().table(), "handheld table refreshed");

    params.set_value(ParamId(3), 80, CALL_TIMEOUT).await?;
    let speed = params.get_value(ParamId(3), CALL_TIMEOUT).await?;
    info!(speed, "speed confirmed by controller");

    if let Err(e) = params.set_value(ParamId(4), 90, CALL_TIMEOUT).await {
        info!(error = %e, "steering trim refused locally");
    }

    params.send_command(CommandId::SAVE_PARAMETERS, CALL_TIMEOUT).await?;
    info!(table = ?controller_table.table(), "controller table");

    params.send_command(CommandId::RESTORE_DEFAULTS, CALL_TIMEOUT).await?;
    params.get_all(CALL_TIMEOUT).await?;
    info!(table = ?params.store().table(), "defaults restored");

    client.stop();
    server.stop();
    sleep(Duration::from_millis(200)).await;
    Ok(())
}

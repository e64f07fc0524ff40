use structopt::StructOpt;
use structopt_toml::StructOptToml;

use odata_server::opt::Opt;
use odata_server::provider::DbConnection;
use odata_server::{http, schema};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = load_opt().await?;

    if opt.show_config {
        println!("{}", serde_json::to_string_pretty(&opt)?);
        return Ok(());
    }

    env_logger::init();

    let db = DbConnection::connect(&opt).await?;
    let registry = schema::load_registry(&opt.schema).await?;
    log::info!(
        "loaded {} entities from {}",
        registry.entities().count(),
        opt.schema.display()
    );

    let (shutdown_tx, shutdown_rx) = utils::make_signal_channel();
    tokio::spawn(async move {
        if let Err(err) = wait_for_shutdown_signal().await {
            log::error!("failed to install shutdown signal handlers: {err}");
            return;
        }
        let _ = shutdown_tx.send(()).await;
    });

    http::serve(opt, db, registry, async move {
        let _ = shutdown_rx.recv().await;
    })
    .await
}

/// Reads `--config` (if given) from a first pass over argv, then re-parses
/// with that file's contents as the TOML defaults layer so CLI flags still
/// win over it.
async fn load_opt() -> anyhow::Result<Opt> {
    let preliminary = Opt::from_args();
    match &preliminary.config {
        Some(path) => Opt::from_file(path).await,
        None => Ok(preliminary),
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

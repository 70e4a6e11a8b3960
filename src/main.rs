use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::time;
use tracing::{error, info, warn};

use clortho::persist;
use clortho::store::SharedKeystore;
use clortho::web::{self, WebState};

/// Interval between unprompted saves of the live keystore.
const SAVE_INTERVAL: Duration = Duration::from_secs(3600);
/// How long the final save may run before the process exits anyway.
const FINAL_SAVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "clortho", version, about = "Clortho key server", long_about = None)]
struct Cli {
    /// Hostname or IP address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port number to listen to
    #[arg(long, default_value_t = 9001)]
    port: u16,
    /// File to store keys in
    #[arg(long, default_value = "clortho.dat")]
    keystore: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    let image = persist::load(&cli.keystore).await?;
    let store = SharedKeystore::from_image(image);
    info!(
        path = %cli.keystore.display(),
        clients = store.clients_len(),
        "keystore loaded"
    );

    let saver = tokio::spawn(save_loop(store.clone(), cli.keystore.clone()));

    let state = WebState {
        store: store.clone(),
    };
    let served = web::run(&cli.host, cli.port, state, shutdown_signal()).await;

    saver.abort();

    info!("saving keystore before exit");
    let final_save = persist::save(&cli.keystore, store.snapshot());
    match time::timeout(FINAL_SAVE_TIMEOUT, final_save).await {
        Ok(Ok(())) => info!("keystore saved"),
        Ok(Err(err)) => error!(error = %err, "final keystore save failed, recent writes are lost"),
        Err(_) => error!(
            timeout_secs = FINAL_SAVE_TIMEOUT.as_secs(),
            "final keystore save timed out, recent writes may be lost"
        ),
    }

    served
}

/// Background persistence loop. One task owns both triggers, the interval
/// tick and the save-now signal, so no two saves ever run concurrently.
/// Save failures degrade to warnings; the store stays live.
async fn save_loop(store: SharedKeystore, path: PathBuf) {
    let mut tick = time::interval(SAVE_INTERVAL);
    tick.tick().await; // the first tick completes immediately

    #[cfg(unix)]
    let mut save_now = match signal::unix::signal(signal::unix::SignalKind::user_defined1()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            warn!(error = %err, "SIGUSR1 handler unavailable, save-now signal disabled");
            None
        }
    };

    loop {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tick.tick() => info!("save interval elapsed, saving keystore"),
                _ = next_save_signal(&mut save_now) => info!("got save signal, saving keystore"),
            }
        }
        #[cfg(not(unix))]
        {
            tick.tick().await;
            info!("save interval elapsed, saving keystore");
        }

        let image = store.snapshot();
        if let Err(err) = persist::save(&path, image).await {
            warn!(path = %path.display(), error = %err, "keystore save failed");
        }
    }
}

#[cfg(unix)]
async fn next_save_signal(stream: &mut Option<signal::unix::Signal>) {
    match stream {
        Some(stream) => {
            stream.recv().await;
        }
        None => std::future::pending().await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("got termination signal, shutting down");
}

pub mod err;
pub mod routes;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gradebook::config::{Config, DEFAULT_ACTOR};
use gradebook::Gradebook;

/// Student records and grades over HTTP, behind a single administrator login.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// IP on which to listen for HTTP connections.
    #[clap(long, env = "GRADEBOOK_LISTEN_ADDR", default_value = "127.0.0.1")]
    pub listen_addr: IpAddr,

    /// Port on which to listen for HTTP connections.
    #[clap(long, env = "GRADEBOOK_PORT", default_value = "8000")]
    pub port: u16,

    /// Directory holding students, logs, credentials, tokens and the field key.
    #[clap(long, env = "GRADEBOOK_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Rotation applied to audit messages at rest.
    #[clap(long, env = "GRADEBOOK_LOG_SHIFT", default_value = "3", allow_hyphen_values = true)]
    pub log_shift: i32,

    /// Persist student identifiers only in ciphered form.
    #[clap(long, env = "GRADEBOOK_CIPHERED_ONLY")]
    pub ciphered_only: bool,
}

impl Args {
    pub fn config(&self) -> Config {
        Config {
            data_dir: self.data_dir.clone(),
            log_shift: self.log_shift,
            actor: DEFAULT_ACTOR.to_string(),
            keep_plain_identifier: !self.ciphered_only,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let book = Arc::new(Gradebook::open(&args.config())?);
    let app = routes::router(book.clone());

    let addr = SocketAddr::new(args.listen_addr, args.port);
    log::info!("Starting Gradebook HTTP Server on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::error!("Could not listen for shutdown signal: {}", err);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    book.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ciphered_only_drops_plain_identifier() {
        let args = Args::try_parse_from(["gradebook-server"]).unwrap();
        assert_eq!(args.port, 8000);
        assert!(args.config().keep_plain_identifier);

        let args = Args::try_parse_from(["gradebook-server", "--ciphered-only", "--log-shift", "-2"])
            .unwrap();
        let config = args.config();
        assert!(!config.keep_plain_identifier);
        assert_eq!(config.log_shift, -2);
    }
}

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use nicind_core::{Origin, Scope};
use nicind_sync::{run_from_env, RunRequest};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "nicind")]
#[command(about = "Download, normalise and load Nicaraguan economic and financial indicators")]
struct Cli {
    /// `todos`, `ultimo` or a `yyyymm` period
    #[arg(default_value = "ultimo")]
    scope: String,
    /// BCN, SIBOIF or CONAMI; every source when omitted
    origin: Option<String>,
    /// Only keep rows for this institution (SIBOIF and CONAMI)
    #[arg(long)]
    institution: Option<String>,
    /// Also write the collected rows to a Parquet file
    #[arg(long)]
    export: Option<PathBuf>,
    /// Collect without touching the database
    #[arg(long)]
    skip_load: bool,
}

impl Cli {
    /// `Err` carries the message shown for an unusable argument.
    fn run_request(self) -> Result<RunRequest, String> {
        let scope: Scope = self
            .scope
            .parse()
            .map_err(|_| format!("invalid scope `{}`: use todos, ultimo or yyyymm", self.scope))?;
        let origin = self
            .origin
            .as_deref()
            .map(|raw| {
                raw.parse::<Origin>()
                    .map_err(|_| format!("invalid origin `{raw}`: use BCN, SIBOIF or CONAMI"))
            })
            .transpose()?;
        Ok(RunRequest {
            scope,
            origin,
            institution: self.institution,
            export: self.export,
            skip_load: self.skip_load,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env is fine
    let _ = dotenvy::dotenv();

    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder().with_env_filter(env).init();

    let request = match Cli::parse().run_request() {
        Ok(request) => request,
        Err(message) => {
            println!("{message}");
            return Ok(());
        }
    };

    let summary = run_from_env(&request).await?;
    info!(run_id = %summary.run_id, "done");
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

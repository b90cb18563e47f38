// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use authn_k8s::*;
use tracing::info;

fn main() -> anyhow::Result<()> {
    telemetry::setup_logging();

    // Subcommand is argv[1]; serve by default.
    match std::env::args().nth(1).as_deref() {
        None | Some("serve") => (),
        Some("version") => return version(),
        Some("help") => return help(),
        Some(unknown) => {
            eprintln!("unknown command: {unknown}");
            help()?;
            std::process::exit(1)
        }
    };

    let config = config::parse_config()?;
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move { serve(config).await })
}

fn help() -> anyhow::Result<()> {
    let version = version::BuildInfo::new();
    println!(
        "
Conjur authn-k8s ({version})

Commands:
serve (default) - Start the authenticator
version         - Print the version of authn-k8s
help            - Print commands and version of authn-k8s"
    );
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", version::BuildInfo::new());
    Ok(())
}

async fn serve(config: config::Config) -> anyhow::Result<()> {
    info!("version: {}", version::BuildInfo::new());
    info!(
        account = config.account,
        authenticators = ?config.authenticators,
        exec_timeout = ?config.exec_timeout,
        "running with config"
    );
    let bound = app::build(config).await?;
    info!(address = %bound.address, "serving");
    bound.wait_termination().await
}

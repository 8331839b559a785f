// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use vantage_common::tracing::init_tracing_with_default_env_filter;
use vantage_worker_executor::config::make_config_loader;
use vantage_worker_executor::{metrics, run};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    match make_config_loader().load_or_dump_config() {
        Some(config) => {
            let config = config.with_env_overrides();
            init_tracing_with_default_env_filter(&config.tracing);

            let prometheus = metrics::register_all();

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;

            runtime.block_on(run(config, prometheus))?;
            Ok(())
        }
        None => Ok(()),
    }
}

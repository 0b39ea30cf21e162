/*
 * Copyright (C) 2025 The Podfarm Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use podfarm::podfarm::alerting::LogAlerter;
use podfarm::podfarm::config::PreparerConfig;
use podfarm::podfarm::ds::farm::Farm;
use podfarm::podfarm::labels::Applicator;
use podfarm::podfarm::logger::Logger;
use podfarm::podfarm::store::dsstore::DsStore;
use podfarm::podfarm::store::intent::IntentStore;
use podfarm::podfarm::store::kv::KvStore;
use podfarm::podfarm::store::session::Session;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SESSION_TTL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let logger = Logger::new(&[("app", "ds-farm")]);

    let config = match PreparerConfig::load_from_env() {
        Ok(config) => config,
        Err(err) => {
            logger.error("could not load configuration", &[("error", &err.to_string())]);
            process::exit(1);
        }
    };

    logger.info(
        "farm starting",
        &[
            ("node_name", &config.node_name),
            ("consul", &config.consul_address),
            ("hooks_dir", &config.hooks_directory),
        ],
    );

    let kv = KvStore::new();
    let session = Session::new(format!("ds-farm:{}", config.node_name), SESSION_TTL);
    let farm = Arc::new(Farm::new(
        DsStore::new(kv.clone()),
        IntentStore::new(kv.clone()),
        Applicator::new(kv),
        session,
        logger.sub_logger(&[("component", "farm")]),
        Arc::new(LogAlerter::new(logger.sub_logger(&[("component", "alerter")]))),
    ));

    let quit = CancellationToken::new();

    let cleanup_farm = Arc::clone(&farm);
    let cleanup_quit = quit.clone();
    let cleanup = tokio::spawn(async move {
        cleanup_farm.cleanup_daemon_set_pods(cleanup_quit).await;
    });

    let loop_farm = Arc::clone(&farm);
    let loop_quit = quit.clone();
    let main_loop = tokio::spawn(async move {
        loop_farm.main_loop(loop_quit).await;
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        logger.error("could not listen for shutdown signal", &[("error", &err.to_string())]);
    }

    quit.cancel();
    let _ = main_loop.await;
    let _ = cleanup.await;
    logger.info("terminating", &[]);
}

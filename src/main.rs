// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use async_std::task;
use clap::Parser;

use rtsp_hub::{Conf, Server};

/// RTSP server relaying media streams between publishers and readers.
#[derive(Parser)]
#[command(name = "rtsp-hub", version)]
struct Args {
    /// Path to a config file. Use 'stdin' to read it from standard input.
    #[arg(default_value = "conf.yml")]
    confpath: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let conf = match Conf::load(&args.confpath) {
        Ok(conf) => conf,
        Err(err) => {
            eprintln!("ERR: {}", err);
            std::process::exit(1);
        }
    };

    task::block_on(async {
        let server = match Server::run(conf).await {
            Ok(server) => server,
            Err(err) => {
                eprintln!("ERR: {}", err);
                std::process::exit(1);
            }
        };

        server.wait().await;
    });
}

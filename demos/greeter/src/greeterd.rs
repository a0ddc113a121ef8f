// Copyright 2018-2020 Cargill Incorporated
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

//! An example greeting service: exposes a `greet` function next to the
//! framework built-ins.

use clap::{App, Arg};
use log::{debug, error};

use std::error::Error;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use courier::config::ServiceToml;
use courier::directory::redis::RedisDirectory;
use courier::registry::ServiceRegistry;
use courier::service::{FunctionHandler, ServiceBuilder, ServiceContext};
use courier::transport::raw::RawTransport;

use greeter::{GreetRequest, GreetResponse};

fn main() {
    let matches = App::new("greeterd")
        .about("Greeting service")
        .arg(
            Arg::with_name("config_file")
                .short("c")
                .long("config_file")
                .takes_value(true)
                .required(true)
                .help("config file"),
        )
        .get_matches();

    flexi_logger::Logger::with_env_or_str("info")
        .start()
        .expect("Failed to create logger");

    let config_file = matches
        .value_of("config_file")
        .expect("config_file is required");

    if let Err(err) = run(config_file) {
        error!("greeting service failed: {}", err);
        std::process::exit(1);
    }
}

fn run(config_file: &str) -> Result<(), Box<dyn Error>> {
    courier::utils::set_time_zone("America/Los_Angeles");

    debug!("loading configuration file {}", config_file);
    let config = ServiceToml::from_file(Path::new(config_file))?;
    let settings = config.settings()?;

    let directory = RedisDirectory::open(&config.redis_config())?;
    let registry = ServiceRegistry::new(Box::new(directory));

    let running = Arc::new(AtomicBool::new(true));
    let interrupt_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        interrupt_flag.store(false, Ordering::SeqCst);
    })?;

    let mut service = ServiceBuilder::new(settings)
        .with_registry(registry)
        .with_transport(Box::new(RawTransport::default()))
        .with_running_flag(running)
        .with_handler(
            "greet",
            FunctionHandler::boxed(
                |request: &GreetRequest, response: &mut GreetResponse, _: &ServiceContext<'_>| {
                    if request.name.is_empty() {
                        response.message = "Hello world".into();
                    } else {
                        response.message = format!("Hello, {}", request.name);
                    }
                    Ok(())
                },
            ),
        )
        .start()?;

    println!(
        "Running greeter service: name: {}, host: {}, port: {}, guid: {}",
        service.identity().name,
        service.identity().host,
        service.identity().port,
        service.identity().guid
    );

    service.run()?;
    Ok(())
}

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

//! An interactive client for the greeting service.

use clap::{App, Arg};
use log::error;

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::Path;

use courier::client::{ClientOptions, RequestOptions, ServiceClient};
use courier::config::ServiceToml;
use courier::directory::redis::{RedisConfig, RedisDirectory};
use courier::registry::ServiceRegistry;
use courier::transport::raw::RawTransport;

use greeter::{GreetRequest, GreetResponse};

fn main() {
    let matches = App::new("greeter")
        .about("Greeting service client")
        .arg(
            Arg::with_name("config_file")
                .short("c")
                .long("config_file")
                .takes_value(true)
                .help("config file"),
        )
        .get_matches();

    flexi_logger::Logger::with_env_or_str("warn")
        .start()
        .expect("Failed to create logger");

    if let Err(err) = run(matches.value_of("config_file")) {
        error!("greeting client failed: {}", err);
        std::process::exit(1);
    }
}

fn run(config_file: Option<&str>) -> Result<(), Box<dyn Error>> {
    let redis_config = match config_file {
        Some(path) => ServiceToml::from_file(Path::new(path))?.redis_config(),
        None => RedisConfig::default(),
    };

    let directory = RedisDirectory::open(&redis_config)?;
    let mut registry = ServiceRegistry::new(Box::new(directory));
    let mut client = ServiceClient::connect(
        "greeter",
        &mut registry,
        Box::new(RawTransport::default()),
        ClientOptions::default(),
    )?;

    let stdin = io::stdin();
    loop {
        print!("[ping/health/description/hello/stop] ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        match line.trim().to_lowercase().as_str() {
            "ping" => println!("[Response] {}", String::from_utf8_lossy(&client.ping()?)),
            "health" => println!(
                "[Response] {}",
                String::from_utf8_lossy(&client.healthcheck()?)
            ),
            "description" => println!(
                "[Response] {}",
                String::from_utf8_lossy(&client.description()?)
            ),
            "hello" => {
                print!("Name? ");
                io::stdout().flush()?;
                let mut name = String::new();
                stdin.lock().read_line(&mut name)?;

                let mut request = GreetRequest::default();
                request.header.client = client.guid().to_string();
                request.name = name.trim().to_string();
                let response: GreetResponse =
                    client.request_message("greet", &request, &RequestOptions::default())?;
                println!("[Response] {}", response.message);
            }
            "stop" => {
                let reply = client.stop()?;
                if reply == b"STOPPED" {
                    println!("Service stopped");
                }
                break;
            }
            "" => continue,
            other => println!("unknown command: {}", other),
        }
    }
    Ok(())
}

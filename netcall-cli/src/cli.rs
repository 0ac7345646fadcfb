//! Application definition.

extern crate simplelog;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;

use netcall_core::{Args, Encoding};
use netcall_net::{
    Balancer, BalancerConfig, CallMode, CallResult, Client, ClientConfig, Context, CoopScheduler,
    Response, Scheduler, Service, ServiceConfig, ThreadScheduler, Transport,
};

use crate::demo::Demo;
use crate::util::{self, BalancerFile};

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

/// Time given to an ignored request to leave before the client closes.
const IGNORE_FLUSH: Duration = Duration::from_millis(100);

pub fn app<'a, 'b>() -> App<'a, 'b> {
    let app = App::new("netcall")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Run netcall load balancers and workers, or call remote procedures.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output"))
        .arg(Arg::with_name("scheduler")
            .long("scheduler")
            .takes_value(true)
            .default_value("thread")
            .possible_values(&["thread", "coop"])
            .global(true)
            .help("Run every loop on its own thread, or all of them cooperatively \
            on the main thread"))
        .arg(Arg::with_name("encoding")
            .long("encoding")
            .short("e")
            .takes_value(true)
            .default_value("bincode")
            .global(true)
            .help("Encoding of arguments and results (bincode, msgpack, json)"))

        // balancer subcommand
        .subcommand(SubCommand::with_name("balancer")
            .display_order(10)
            .about("Start a load balancer")
            .long_about("Start a load balancer\n\n\
            Workers are taken from the config file, which is read again on every \n\
            discovery round, and from any `--worker` arguments.")
            .arg(Arg::with_name("clients")
                .long("clients")
                .short("c")
                .takes_value(true)
                .multiple(true)
                .value_name("address")
                .help("Address to accept clients on (e.g. tcp://0.0.0.0:9900)"))
            .arg(Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .value_name("path")
                .help("Path to a TOML config file"))
            .arg(Arg::with_name("worker")
                .long("worker")
                .short("w")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .value_name("address=id")
                .help("Worker to balance to, given as its address and id"))
            .arg(Arg::with_name("interval")
                .long("interval")
                .takes_value(true)
                .value_name("seconds")
                .help("Time between discovery rounds"))
            .arg(Arg::with_name("stats")
                .long("stats")
                .takes_value(true)
                .value_name("seconds")
                .help("Print balancer stats periodically")))

        // worker subcommand
        .subcommand(SubCommand::with_name("worker")
            .display_order(11)
            .about("Start a worker serving demo procedures")
            .long_about("Start a worker serving demo procedures\n\n\
            Served procedures: echo, add, count (streams 0..n), fail and whoami.")
            .arg(Arg::with_name("bind")
                .long("bind")
                .short("b")
                .required(true)
                .takes_value(true)
                .value_name("address")
                .help("Address to serve on (e.g. tcp://0.0.0.0:9910)"))
            .arg(Arg::with_name("id")
                .long("id")
                .required(true)
                .takes_value(true)
                .value_name("worker-id")
                .help("Worker id, the same one given to the balancer"))
            .arg(Arg::with_name("name")
                .long("name")
                .takes_value(true)
                .help("Name sent with every acknowledgement (defaults to the id)")))

        // call subcommand
        .subcommand(SubCommand::with_name("call")
            .display_order(12)
            .about("Call a remote procedure")
            .arg(Arg::with_name("address")
                .required(true)
                .value_name("address")
                .help("Address of a worker or balancer"))
            .arg(Arg::with_name("procedure")
                .required(true)
                .value_name("procedure"))
            .arg(Arg::with_name("args")
                .multiple(true)
                .value_name("args")
                .help("Positional arguments, numbers and booleans are recognized"))
            .arg(Arg::with_name("kwarg")
                .long("kwarg")
                .short("k")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .value_name("key=value")
                .help("Keyword argument"))
            .arg(Arg::with_name("mode")
                .long("mode")
                .short("m")
                .takes_value(true)
                .default_value("sync")
                .possible_values(&["sync", "async", "ignore"]))
            .arg(Arg::with_name("timeout")
                .long("timeout")
                .short("t")
                .takes_value(true)
                .default_value("30")
                .value_name("seconds")
                .help("Time to wait for the reply, 0 waits forever")));

    app
}

pub fn app_matches() -> ArgMatches<'static> {
    app().get_matches()
}

/// Runs based on specified subcommand.
pub fn start(matches: ArgMatches) -> Result<()> {
    match matches.subcommand() {
        ("balancer", Some(m)) => start_balancer(m),
        ("worker", Some(m)) => start_worker(m),
        ("call", Some(m)) => start_call(m),
        _ => Ok(()),
    }
}

fn start_balancer(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let sched = scheduler(matches);

    let mut config = BalancerConfig::default();
    let config_path = matches.value_of("config").map(PathBuf::from);
    let mut clients = Vec::new();
    let mut workers = Vec::new();
    if let Some(path) = &config_path {
        let file = BalancerFile::load(path)?;
        file.apply(&mut config)?;
        clients.extend(file.clients.iter().cloned());
        workers.extend(file.workers().into_iter());
    }
    if let Some(urls) = matches.values_of("clients") {
        clients.extend(urls.map(|s| s.to_string()));
    }
    if clients.is_empty() {
        return Err(Error::msg(
            "no address to accept clients on, use --clients or the config file",
        ));
    }
    if let Some(secs) = matches.value_of("interval") {
        config.interval = util::seconds(secs.parse()?)?;
    }
    let mut extra = Vec::new();
    for worker in matches.values_of("worker").into_iter().flatten() {
        extra.push(util::parse_worker(worker)?);
    }
    workers.extend(extra.iter().cloned());

    config.client_transport = Transport::from_url(&clients[0])?;
    config.worker_transport = match workers.first() {
        Some((address, _)) => Transport::from_url(address)?,
        None => config.client_transport,
    };

    let ctx = Context::new();
    let mut balancer = Balancer::new(&ctx, config, util::file_discovery(config_path, extra))?;
    balancer.bind(&clients.iter().map(|s| s.as_str()).collect::<Vec<_>>())?;
    let handle = balancer.start(sched.clone())?;
    println!("accepting clients on: {}", clients.join(", "));

    let stats_every = match matches.value_of("stats") {
        Some(secs) => Some(util::seconds(secs.parse()?)?),
        None => None,
    };
    let mut last_stats = Instant::now();
    run_until_interrupted(&*sched, || {
        if let Some(every) = stats_every {
            if last_stats.elapsed() >= every {
                last_stats = Instant::now();
                match handle.stats() {
                    Ok(stats) => println!(
                        "{} known, {} pending, {} in flight, load: {}",
                        stats.known.len(),
                        stats.pending,
                        stats.inflight,
                        stats
                            .workers
                            .iter()
                            .map(|(w, c)| format!("{}={}", w, c))
                            .collect::<Vec<_>>()
                            .join(" ")
                    ),
                    Err(e) => warn!("failed reading stats: {}", e),
                }
            }
        }
    })?;

    println!("Initiating graceful shutdown...");
    handle.stop()?;
    sched.join();
    Ok(())
}

fn start_worker(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let sched = scheduler(matches);

    let address = matches
        .value_of("bind")
        .ok_or_else(|| Error::msg("missing --bind address"))?;
    let id = matches
        .value_of("id")
        .ok_or_else(|| Error::msg("missing --id"))?;
    let name = matches.value_of("name").unwrap_or(id).to_string();

    let ctx = Context::new();
    let mut service = Service::new(
        &ctx,
        ServiceConfig {
            name: name.clone(),
            identity: Some(id.as_bytes().to_vec()),
            transport: Transport::from_url(address)?,
            encoding: encoding(matches)?,
        },
    )?;
    let count = service.register_object(&Demo { name }, &[], None)?;
    service.bind(&[address])?;
    let handle = service.start(sched.clone())?;
    println!("worker {} serving {} procedures on: {}", id, count, address);

    run_until_interrupted(&*sched, || ())?;

    println!("Initiating graceful shutdown...");
    handle.stop()?;
    sched.join();
    Ok(())
}

fn start_call(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let sched = scheduler(matches);

    let address = matches
        .value_of("address")
        .ok_or_else(|| Error::msg("missing address"))?;
    let proc_name = matches
        .value_of("procedure")
        .ok_or_else(|| Error::msg("missing procedure name"))?;
    let args: Args = matches
        .values_of("args")
        .map(|values| values.map(util::parse_value).collect())
        .unwrap_or_default();
    let kwargs = util::parse_kwargs(matches.values_of("kwarg").into_iter().flatten())?;
    let mode: CallMode = matches.value_of("mode").unwrap_or("sync").parse()?;
    let timeout = match util::seconds(matches.value_of("timeout").unwrap_or("30").parse()?)? {
        t if t == Duration::from_secs(0) => None,
        t => Some(t),
    };

    let ctx = Context::new();
    let client = Client::new(
        &ctx,
        ClientConfig {
            transport: Transport::from_url(address)?,
            encoding: encoding(matches)?,
            default_timeout: timeout,
            ..ClientConfig::default()
        },
        sched.clone(),
    )?;
    client.connect(&[address], false)?;

    match client.call(proc_name, args, kwargs, mode, timeout)? {
        CallResult::Done(response) => print_response(response)?,
        CallResult::Pending(future) => {
            println!("{}", "request sent, waiting for the reply".dimmed());
            print_response(future.wait(timeout)?)?;
        }
        CallResult::Ignored => {
            sched.wait(&mut || false, Some(IGNORE_FLUSH));
            println!("{}", "request sent, not waiting for a reply".dimmed());
        }
    }
    client.close()?;
    sched.join();
    Ok(())
}

fn print_response(response: Response) -> Result<()> {
    match response {
        Response::Value(value) => println!("{}", value),
        Response::Stream(stream) => {
            for (n, item) in stream.enumerate() {
                println!("{} {}", format!("[{}]", n).dimmed(), item?);
            }
        }
    }
    Ok(())
}

/// Keeps the loops going until Ctrl-C, calling `tick` every so often.
fn run_until_interrupted<F: FnMut()>(sched: &dyn Scheduler, mut tick: F) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    while running.load(Ordering::SeqCst) {
        sched.wait(
            &mut || !running.load(Ordering::SeqCst),
            Some(Duration::from_millis(200)),
        );
        tick();
    }
    Ok(())
}

fn scheduler(matches: &ArgMatches) -> Arc<dyn Scheduler> {
    match matches.value_of("scheduler") {
        Some("coop") => Arc::new(CoopScheduler::new()),
        _ => Arc::new(ThreadScheduler::new()),
    }
}

/// Unknown encodings and ones not compiled in are both errors.
fn encoding(matches: &ArgMatches) -> Result<Encoding> {
    Ok(matches.value_of("encoding").unwrap_or("bincode").parse()?)
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use self::simplelog::{LevelFilter, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" | "default" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        },
        _ => LevelFilter::Warn,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Error)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    if TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed).is_err() {
        eprintln!("failed initializing the terminal logger");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_parse() {
        let matches = app()
            .get_matches_from_safe(vec![
                "netcall", "call", "inproc://x", "add", "1", "2", "-k", "scale=2", "--mode", "async",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand();
        assert_eq!(name, "call");
        let sub = sub.unwrap();
        assert_eq!(sub.values_of("args").unwrap().collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(sub.value_of("mode"), Some("async"));
        assert_eq!(sub.value_of("timeout"), Some("30"));

        let matches = app()
            .get_matches_from_safe(vec![
                "netcall", "balancer", "--clients", "inproc://lb", "-w", "inproc://a=a", "-w", "inproc://b=b",
            ])
            .unwrap();
        let sub = matches.subcommand_matches("balancer").unwrap();
        assert_eq!(sub.values_of("worker").unwrap().count(), 2);

        assert!(app()
            .get_matches_from_safe(vec!["netcall", "worker", "--bind", "inproc://w"])
            .is_err());
    }
}

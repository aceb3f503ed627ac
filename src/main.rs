use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use dirsort::DirSorterBuilder;

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let input_dir = arg_parser.value_of("input_dir").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");
    let memory = arg_parser.value_of("memory").expect("value has a default");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let fan_in: Option<usize> = arg_parser
        .is_present("fan_in")
        .then(|| arg_parser.value_of_t_or_exit("fan_in"));

    let mut sorter_builder = DirSorterBuilder::new()
        .with_memory_budget(memory.parse::<ByteSize>().expect("value is pre-validated").as_u64())
        .with_cleanup_on_failure(arg_parser.is_present("cleanup"));

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_workers(threads);
    }

    if let Some(fan_in) = fan_in {
        sorter_builder = sorter_builder.with_fan_in(fan_in);
    }

    let sorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    match sorter.sort(path::Path::new(input_dir), path::Path::new(output)) {
        Ok(stats) => {
            log::info!(
                "sorted {} records from {} runs in {} merge rounds",
                stats.records,
                stats.runs,
                stats.merge_rounds
            );
        }
        Err(err) => {
            log::error!("sorting error: {}", err);
            process::exit(1);
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("dirsort")
        .about("external merge sorter for directories of binary i64 record files")
        .arg(
            clap::Arg::new("input_dir")
                .short('i')
                .long("input-dir")
                .help("directory of record files to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("memory")
                .short('m')
                .long("memory")
                .help("memory budget for sort buffers")
                .takes_value(true)
                .default_value("64MiB")
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Memory budget format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of worker threads")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("fan_in")
                .short('f')
                .long("fan-in")
                .help("maximum number of runs merged in one pass")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("cleanup")
                .short('c')
                .long("cleanup")
                .help("remove temporary files if the sort fails")
                .takes_value(false),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}

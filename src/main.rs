use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use acoutest_lib::app::commands::{self, SweepStartRequest, TestRequest};
use acoutest_lib::app::config::config_path;
use acoutest_lib::app::error::AppError;
use acoutest_lib::app::events::{AppEvent, EventSink};
use acoutest_lib::app::hal::HalProperty;
use acoutest_lib::app::logging::init_logging;
use acoutest_lib::app::models::CommandResponse;
use acoutest_lib::app::session::SessionKind;
use acoutest_lib::app::state::AppState;
use serde::Serialize;
use uuid::Uuid;

const USAGE: &str = "\
Usage: acoutest [--json] [--serial SERIAL] [--config PATH] <command> [options]

Commands:
  check                                   adb version and location
  devices                                 refresh and list attached devices
  connect <host:port>                     adb connect
  record loopback --audio FILE [--seconds N]
  record mic [--seconds N]                record until Enter (or N seconds), then pull
  play <FILE> [--seconds N]               multichannel playback through tinyplay
  hal-dump [--prop NAME=VALUE]... [--seconds N]
  sweep <DIR | FILE...> [--batch NAME]    play and record each sweep file in turn
  screenshot
  logcat [--filter SPEC] [--seconds N]
  logcat-clear
  key <KEY>                               e.g. play, next, volume_up, 85
  host-play <FILE> [--seconds N]          play on this computer
  hal-props                               read back configured HAL properties
  status                                  test and sweep state
  diagnostics [--out DIR]
  config [--reset]
";

#[derive(Debug, Default)]
struct Args {
    json: bool,
    serial: Option<String>,
    config: Option<PathBuf>,
    command: String,
    rest: Vec<String>,
}

fn parse_args(raw: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut args = Args {
        serial: std::env::var("ANDROID_SERIAL")
            .ok()
            .filter(|value| !value.trim().is_empty()),
        ..Args::default()
    };
    let mut it = raw.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--json" => args.json = true,
            "--serial" => {
                args.serial = it
                    .next()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty());
                if args.serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--config" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                args.config = Some(PathBuf::from(value));
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other if other.starts_with("--") => return Err(format!("Unknown arg: {other}")),
            _ => {
                args.command = arg;
                args.rest = it.collect();
                break;
            }
        }
    }
    if args.command.is_empty() {
        return Err(USAGE.to_string());
    }
    Ok(args)
}

/// Options after the command: `--name value` pairs (repeatable), bare switches, positionals.
#[derive(Debug, Default)]
struct SubArgs {
    positional: Vec<String>,
    options: HashMap<String, Vec<String>>,
    switches: Vec<String>,
}

impl SubArgs {
    fn parse(rest: &[String], switches: &[&str]) -> Result<Self, String> {
        let mut parsed = SubArgs::default();
        let mut it = rest.iter();
        while let Some(arg) = it.next() {
            if switches.contains(&arg.as_str()) {
                parsed.switches.push(arg.clone());
            } else if arg.starts_with("--") {
                let value = it
                    .next()
                    .ok_or_else(|| format!("{arg} requires a value"))?;
                parsed.options.entry(arg.clone()).or_default().push(value.clone());
            } else {
                parsed.positional.push(arg.clone());
            }
        }
        Ok(parsed)
    }

    fn value(&self, name: &str) -> Option<String> {
        self.options.get(name).and_then(|values| values.last().cloned())
    }

    fn values(&self, name: &str) -> Vec<String> {
        self.options.get(name).cloned().unwrap_or_default()
    }

    fn has(&self, switch: &str) -> bool {
        self.switches.iter().any(|value| value == switch)
    }

    fn seconds(&self) -> Result<Option<u64>, String> {
        self.value("--seconds")
            .map(|value| {
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("--seconds expects a whole number, got {value:?}"))
            })
            .transpose()
    }

    fn first(&self, what: &str) -> Result<String, String> {
        self.positional
            .first()
            .cloned()
            .ok_or_else(|| format!("missing {what}"))
    }
}

struct Printer {
    json: bool,
}

impl Printer {
    fn emit<T: Serialize>(&self, response: CommandResponse<T>) {
        let rendered = if self.json {
            serde_json::to_string(&response)
        } else {
            serde_json::to_string_pretty(&response.data)
        };
        match rendered {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("Failed to render result: {err}"),
        }
    }

    fn error(&self, err: &AppError) {
        if self.json {
            match serde_json::to_string(err) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{{\"error\":{:?}}}", err.error),
            }
        } else {
            eprintln!("error [{}]: {} (trace {})", err.code, err.error, err.trace_id);
        }
    }
}

/// Progress goes to stderr; logcat lines to stdout so they can be piped.
fn console_sink(json: bool) -> EventSink {
    Arc::new(move |event: AppEvent| match event {
        AppEvent::LogcatLines { lines, .. } if !json => {
            for line in lines {
                println!("{line}");
            }
        }
        AppEvent::LogcatLines { .. } => {}
        other => {
            if let Ok(text) = serde_json::to_string(&other) {
                eprintln!("{text}");
            }
        }
    })
}

fn wait_for(seconds: Option<u64>) {
    match seconds {
        Some(seconds) => std::thread::sleep(Duration::from_secs(seconds)),
        None => {
            eprintln!("Press Enter to stop...");
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
        }
    }
}

fn usage_error(message: impl Into<String>, trace_id: &str) -> AppError {
    AppError::validation(message, trace_id)
}

fn parse_prop(raw: &str, trace_id: &str) -> Result<HalProperty, AppError> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| usage_error(format!("--prop expects NAME=VALUE, got {raw:?}"), trace_id))?;
    Ok(HalProperty {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
        enabled: true,
    })
}

fn run_session(
    state: &AppState,
    printer: &Printer,
    request: TestRequest,
    serial: Option<String>,
    seconds: Option<u64>,
    trace_id: &str,
) -> Result<(), AppError> {
    let kind = request.kind();
    printer.emit(commands::start_test(state, request, serial, Some(trace_id.to_string()))?);
    wait_for(seconds);
    printer.emit(commands::stop_test(state, kind, Some(trace_id.to_string()))?);
    Ok(())
}

fn run(state: &AppState, args: &Args, printer: &Printer, trace_id: &str) -> Result<(), AppError> {
    let trace = || Some(trace_id.to_string());
    let serial = args.serial.clone();
    let sub = SubArgs::parse(&args.rest, &["--reset"]).map_err(|msg| usage_error(msg, trace_id))?;
    let seconds = sub.seconds().map_err(|msg| usage_error(msg, trace_id))?;
    let required = |what: &str| sub.first(what).map_err(|msg| usage_error(msg, trace_id));

    match args.command.as_str() {
        "check" => printer.emit(commands::check_adb(state, trace())?),
        "devices" => printer.emit(commands::refresh_devices(state, trace())?),
        "connect" => printer.emit(commands::connect_device(state, required("address")?, trace())?),
        "record" => {
            let kind = SessionKind::parse(&required("test kind (loopback|mic)")?);
            let request = match kind {
                Some(SessionKind::Loopback) => TestRequest::Loopback {
                    audio_file: sub
                        .value("--audio")
                        .ok_or_else(|| usage_error("record loopback needs --audio FILE", trace_id))?,
                    capture: None,
                    playback: None,
                },
                Some(SessionKind::Microphone) => TestRequest::Microphone { capture: None },
                _ => return Err(usage_error("record expects loopback or mic", trace_id)),
            };
            run_session(state, printer, request, serial, seconds, trace_id)?;
        }
        "play" => {
            let request = TestRequest::Multichannel {
                audio_file: required("audio file")?,
                playback: None,
            };
            run_session(state, printer, request, serial, seconds, trace_id)?;
        }
        "hal-dump" => {
            let properties = sub
                .values("--prop")
                .iter()
                .map(|raw| parse_prop(raw, trace_id))
                .collect::<Result<Vec<_>, _>>()?;
            run_session(state, printer, TestRequest::HalDump { properties }, serial, seconds, trace_id)?;
        }
        "sweep" => {
            let mut request = SweepStartRequest {
                batch_name: sub.value("--batch"),
                ..SweepStartRequest::default()
            };
            match sub.positional.as_slice() {
                [] => return Err(usage_error("sweep needs a directory or files", trace_id)),
                [single] if Path::new(single).is_dir() => request.dir = Some(single.clone()),
                files => request.files = files.to_vec(),
            }
            printer.emit(commands::start_sweep(state, request, serial, trace())?);
            printer.emit(commands::wait_sweep(state, trace())?);
        }
        "screenshot" => printer.emit(commands::capture_screenshot(state, serial, trace())?),
        "logcat" => {
            let started = commands::start_logcat(state, serial.clone(), sub.value("--filter"), trace())?;
            eprintln!("logcat -> {}", started.data.output_path);
            wait_for(seconds);
            printer.emit(commands::stop_logcat(state, Some(started.data.serial), trace())?);
        }
        "logcat-clear" => printer.emit(commands::clear_logcat(state, serial, trace())?),
        "key" => printer.emit(commands::send_keyevent(state, serial, required("key")?, trace())?),
        "host-play" => {
            printer.emit(commands::play_on_host(state, required("audio file")?, trace())?);
            match seconds {
                Some(_) => {
                    wait_for(seconds);
                    commands::stop_host_playback(state, trace())?;
                }
                None => {
                    while state.playback.is_playing() {
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        }
        "hal-props" => printer.emit(commands::read_hal_properties(state, serial, trace())?),
        "status" => {
            printer.emit(commands::session_snapshots(state, trace())?);
            printer.emit(commands::sweep_status(state, trace())?);
        }
        "diagnostics" => printer.emit(commands::export_diagnostics(state, sub.value("--out"), trace())?),
        "config" => {
            if sub.has("--reset") {
                printer.emit(commands::reset_config(state, trace())?);
            } else {
                eprintln!("config file: {}", state.config_path().display());
                printer.emit(commands::get_config(state, trace())?);
            }
        }
        other => return Err(usage_error(format!("Unknown command: {other}\n\n{USAGE}"), trace_id)),
    }
    Ok(())
}

fn main() {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let printer = Printer { json: args.json };
    let path = args.config.clone().unwrap_or_else(config_path);

    let logging = init_logging("info");
    let state = match AppState::load(path, console_sink(args.json), &trace_id) {
        Ok(state) => state,
        Err(err) => {
            printer.error(&err);
            std::process::exit(1);
        }
    };
    logging.apply(&state.config().logging.log_level);

    let result = run(&state, &args, &printer, &trace_id);
    state.shutdown(&trace_id);
    if let Err(err) = result {
        printer.error(&err);
        std::process::exit(1);
    }
}

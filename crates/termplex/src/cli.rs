//! Command line parsing for termplex

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use multiplexer::wire::TransportKind;

pub const USAGE: &str = "\
usage: termplex [options] [-c COMMAND]...

options:
  -c COMMAND           run COMMAND in its own terminal (repeatable)
  --requests FILE      read spawn requests from FILE, one JSON object per line
  --config FILE        load configuration from FILE instead of the default paths
  --transport KIND     override the transport (standard | sequenced)
  --duration-ms MS     stop after MS milliseconds (default 2000)
  --viewport-rows N    rows of the stack that count as on screen (default 48)
  --print-config       print the effective configuration and exit
  -h, --help           show this help";

const DEFAULT_DURATION_MS: u64 = 2000;
const DEFAULT_VIEWPORT_ROWS: u32 = 48;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub commands: Vec<String>,
    pub requests: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub transport: Option<TransportKind>,
    pub duration: Duration,
    pub viewport_rows: u32,
    pub print_config: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            requests: None,
            config: None,
            transport: None,
            duration: Duration::from_millis(DEFAULT_DURATION_MS),
            viewport_rows: DEFAULT_VIEWPORT_ROWS,
            print_config: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Run(Options),
    Help,
}

/// Parse arguments, excluding the program name
pub fn parse(args: &[String]) -> Result<Action> {
    let mut options = Options::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("{} requires a value", flag))
        };

        match arg.as_str() {
            "-h" | "--help" => return Ok(Action::Help),
            "-c" => options.commands.push(value("-c")?),
            "--requests" => options.requests = Some(PathBuf::from(value("--requests")?)),
            "--config" => options.config = Some(PathBuf::from(value("--config")?)),
            "--transport" => {
                let kind = value("--transport")?;
                options.transport = Some(
                    kind.parse()
                        .with_context(|| format!("invalid --transport '{}'", kind))?,
                );
            }
            "--duration-ms" => {
                let ms = value("--duration-ms")?;
                let ms: u64 = ms
                    .parse()
                    .with_context(|| format!("invalid --duration-ms '{}'", ms))?;
                options.duration = Duration::from_millis(ms);
            }
            "--viewport-rows" => {
                let rows = value("--viewport-rows")?;
                options.viewport_rows = rows
                    .parse()
                    .with_context(|| format!("invalid --viewport-rows '{}'", rows))?;
                if options.viewport_rows == 0 {
                    bail!("--viewport-rows must be > 0");
                }
            }
            "--print-config" => options.print_config = true,
            other => bail!("unknown argument '{}'\n\n{}", other, USAGE),
        }
    }

    Ok(Action::Run(options))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn options(list: &[&str]) -> Options {
        match parse(&args(list)).unwrap() {
            Action::Run(options) => options,
            Action::Help => panic!("expected run options"),
        }
    }

    #[test]
    fn no_arguments_uses_defaults() {
        assert_eq!(options(&[]), Options::default());
    }

    #[test]
    fn commands_accumulate_in_order() {
        let opts = options(&["-c", "ls", "-c", "echo hi"]);
        assert_eq!(opts.commands, vec!["ls", "echo hi"]);
    }

    #[test]
    fn value_flags_are_parsed() {
        let opts = options(&[
            "--config",
            "/tmp/termplex.toml",
            "--transport",
            "standard",
            "--duration-ms",
            "150",
            "--viewport-rows",
            "10",
            "--requests",
            "reqs.jsonl",
            "--print-config",
        ]);
        assert_eq!(opts.config, Some(PathBuf::from("/tmp/termplex.toml")));
        assert_eq!(opts.transport, Some(TransportKind::Standard));
        assert_eq!(opts.duration, Duration::from_millis(150));
        assert_eq!(opts.viewport_rows, 10);
        assert_eq!(opts.requests, Some(PathBuf::from("reqs.jsonl")));
        assert!(opts.print_config);
    }

    #[test]
    fn help_short_circuits() {
        assert_eq!(parse(&args(&["-c", "ls", "--help"])).unwrap(), Action::Help);
    }

    #[test]
    fn missing_value_is_an_error() {
        let err = parse(&args(&["-c"])).unwrap_err();
        assert!(err.to_string().contains("-c requires a value"));
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(parse(&args(&["--transport", "carrier-pigeon"])).is_err());
        assert!(parse(&args(&["--duration-ms", "soon"])).is_err());
        assert!(parse(&args(&["--viewport-rows", "0"])).is_err());
    }

    #[test]
    fn unknown_flag_is_an_error() {
        let err = parse(&args(&["--frobnicate"])).unwrap_err();
        assert!(err.to_string().contains("unknown argument '--frobnicate'"));
    }
}

//! termplex - run commands on PTYs through the output multiplexer
//!
//! Each command gets a terminal stacked below the previous one. Terminals
//! that fall outside `--viewport-rows` are hidden and get suspended like
//! off-screen panes would. When the run ends, every buffer is printed
//! followed by the multiplexer's stats as JSON.

mod cli;

use std::cell::Cell;
use std::env;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use calloop::EventLoop;

use multiplexer::host::{HostConfig, ProcessLayer, PtyHost, PtySpawner};
use multiplexer::visibility::{Region, Viewport};
use multiplexer::wire::{SpawnRequest, TerminalId};
use multiplexer::{Config, LoopContext, Multiplexer};
use terminal::{BufferEvent, RenderBuffer};

use cli::{Action, Options};

/// How often buffers are polled for emulator replies
const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on the time spent closing panes at exit
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

struct Pane {
    id: TerminalId,
    buffer: Rc<RenderBuffer>,
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = match cli::parse(&args)? {
        Action::Help => {
            println!("{}", cli::USAGE);
            return Ok(());
        }
        Action::Run(options) => options,
    };

    setup_logging();

    let mut config = match &options.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::load(),
    };
    if let Some(kind) = options.transport {
        config.transport.default_kind = kind;
    }

    if options.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let requests = collect_requests(&options, &config)?;
    run(config, &options, requests)
}

fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Respect NO_COLOR environment variable for testing
    let use_ansi = env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .with_ansi(use_ansi),
        )
        .with(filter)
        .init();
}

/// Requests from `-c` flags followed by those in `--requests`
///
/// With neither, a single interactive shell is started.
fn collect_requests(options: &Options, config: &Config) -> Result<Vec<SpawnRequest>> {
    let cwd = env::current_dir().context("reading current directory")?;
    let make = |index: usize, command: Option<String>| SpawnRequest {
        id: TerminalId::new(format!("term-{}", index)),
        cwd: cwd.clone(),
        rows: config.session.rows,
        cols: config.session.cols,
        env: Default::default(),
        command,
    };

    let mut requests: Vec<SpawnRequest> = options
        .commands
        .iter()
        .enumerate()
        .map(|(i, command)| make(i, Some(command.clone())))
        .collect();

    if let Some(path) = &options.requests {
        requests.extend(read_requests(path)?);
    }

    if requests.is_empty() {
        requests.push(make(0, None));
    }
    Ok(requests)
}

fn read_requests(path: &Path) -> Result<Vec<SpawnRequest>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut requests = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request = SpawnRequest::from_json_line(&line)
            .with_context(|| format!("{}:{}", path.display(), number + 1))?;
        requests.push(request);
    }
    Ok(requests)
}

fn run(config: Config, options: &Options, requests: Vec<SpawnRequest>) -> Result<()> {
    let mut event_loop: EventLoop<'static, ()> =
        EventLoop::try_new().context("creating event loop")?;
    let ctx = LoopContext::new(event_loop.handle())?;

    let host = PtyHost::new(
        Box::new(PtySpawner {
            shell: config.session.shell.clone(),
        }),
        HostConfig::from(&config.transport),
    );
    host.attach_pump(&ctx, Duration::from_millis(config.transport.pump_interval_ms))?;
    let layer: Rc<dyn ProcessLayer> = host.clone();

    let mux = Multiplexer::new(
        layer,
        ctx.clone(),
        config.clone(),
        Viewport::new(0, options.viewport_rows),
    );

    let mut panes = Vec::new();
    let pending = Rc::new(Cell::new(requests.len()));
    let mut top = 0i64;
    for request in requests {
        let buffer = Rc::new(RenderBuffer::with_scrollback(
            request.cols,
            request.rows,
            config.session.scrollback,
        )?);
        let region = Region::new(top, request.rows as u32);
        top += request.rows as i64;

        panes.push(Pane {
            id: request.id.clone(),
            buffer: buffer.clone(),
        });

        let mux = mux.clone();
        let pending = pending.clone();
        let kind = config.transport.default_kind;
        ctx.spawn(async move {
            let id = request.id.clone();
            if let Err(e) = mux.spawn_terminal(request, kind, buffer, region).await {
                tracing::error!(%id, error = %e, "failed to start terminal");
            }
            pending.set(pending.get() - 1);
        });
    }

    let panes = Rc::new(panes);
    forward_replies(&ctx, &mux, &panes)?;

    let deadline = Instant::now() + options.duration;
    while Instant::now() < deadline {
        event_loop.dispatch(Some(Duration::from_millis(10)), &mut ())?;
        if pending.get() == 0 && all_exited(&host, &mux) {
            tracing::info!("all processes exited");
            break;
        }
    }

    let stats = mux.stats();
    shutdown(&mut event_loop, &ctx, &mux, &host)?;

    for pane in panes.iter() {
        println!("==> {} <==", pane.id);
        let lines = pane.buffer.lines();
        let end = lines
            .iter()
            .rposition(|l| !l.trim().is_empty())
            .map_or(0, |i| i + 1);
        for line in &lines[..end] {
            println!("{}", line.trim_end());
        }
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

/// Send emulator replies (cursor reports and the like) back to the process
fn forward_replies(ctx: &LoopContext, mux: &Rc<Multiplexer>, panes: &Rc<Vec<Pane>>) -> Result<()> {
    let spawner = ctx.clone();
    let mux = mux.clone();
    let panes = panes.clone();
    ctx.interval(REPLY_POLL_INTERVAL, move || {
        for pane in panes.iter() {
            for event in pane.buffer.poll_events() {
                match event {
                    BufferEvent::Reply(text) => {
                        let mux = mux.clone();
                        let id = pane.id.clone();
                        spawner.spawn(async move {
                            if let Err(e) = mux.write_input(&id, &text).await {
                                tracing::debug!(%id, error = %e, "dropping emulator reply");
                            }
                        });
                    }
                    BufferEvent::Title(title) => {
                        tracing::debug!(id = %pane.id, %title, "title changed");
                    }
                    BufferEvent::Bell => {}
                }
            }
        }
    })?;
    Ok(())
}

/// True once every open terminal's process has exited and its output is flushed
fn all_exited(host: &PtyHost, mux: &Multiplexer) -> bool {
    mux.terminal_ids().iter().all(|id| {
        host.has_exited(id) != Some(false)
            && mux.queue_stats(id).map_or(true, |s| s.queued_bytes == 0)
    })
}

/// Close every pane, restoring suspended buffers, then end the processes
fn shutdown(
    event_loop: &mut EventLoop<'static, ()>,
    ctx: &LoopContext,
    mux: &Rc<Multiplexer>,
    host: &Rc<PtyHost>,
) -> Result<()> {
    let done = Rc::new(Cell::new(false));
    let flag = done.clone();
    let mux = mux.clone();
    let layer: Rc<dyn ProcessLayer> = host.clone();
    let sessions = host.session_ids();
    ctx.spawn(async move {
        mux.dispose().await;
        for id in sessions {
            if let Err(e) = layer.kill(&id).await {
                tracing::warn!(%id, error = %e, "failed to kill process");
            }
        }
        flag.set(true);
    });

    let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
    while !done.get() && Instant::now() < deadline {
        event_loop.dispatch(Some(Duration::from_millis(10)), &mut ())?;
    }
    if !done.get() {
        tracing::warn!("shutdown timed out");
    }
    Ok(())
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side operator shell for the ZPLC runtime.
//!
//! This is the thin front-end the design talks about: a line-oriented
//! command loop over stdin/stdout, driving an in-process [`Runtime`] with
//! a std-backed HAL (monotonic `Instant` clock, file-per-key
//! persistence). On a real controller the same commands arrive over a
//! serial port; the core's debug surface does all the formatting either
//! way.
//!
//! Every command answers either `OK` (possibly preceded by payload
//! lines), a single JSON object when `--json` is given, or
//! `ERROR: <reason>`.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::io::{BufRead, Write as _};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use zplc_kern::debug;
use zplc_kern::hal::{Clock, Hal, HalError};
use zplc_kern::loader;
use zplc_kern::memory::CODE_SIZE;
use zplc_kern::policy::Policy;
use zplc_kern::runtime::Runtime;
use zplc_kern::sched::Poll;
use zplc_kern::time::Timestamp;

/// Interactive shell for a hosted ZPLC runtime.
#[derive(Parser)]
#[clap(name = "zplcsh", version)]
struct Args {
    /// `.zplc` image (or raw bytecode with --raw) to load at startup.
    #[clap(long)]
    program: Option<PathBuf>,

    /// Treat --program as bare bytecode instead of a `.zplc` image.
    #[clap(long)]
    raw: bool,

    /// Directory for persisted state; also enables boot replay.
    #[clap(long)]
    persist_dir: Option<PathBuf>,

    /// Allow `dbg poke` into the input process image.
    #[clap(long)]
    allow_poke: bool,

    /// Start the scheduler immediately.
    #[clap(long)]
    start: bool,
}

/// Std-backed platform: monotonic clock since process start, sleep via
/// the OS, persistence as one file per key. Inputs and outputs have no
/// physical backing here, so latch and flush leave the images alone --
/// which is exactly what makes `dbg poke` useful in this shell.
struct HostHal {
    epoch: Instant,
    persist_dir: Option<PathBuf>,
}

impl HostHal {
    fn new(persist_dir: Option<PathBuf>) -> Self {
        Self {
            epoch: Instant::now(),
            persist_dir,
        }
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, HalError> {
        let dir = self.persist_dir.as_ref().ok_or(HalError::Unsupported)?;
        Ok(dir.join(format!("{key}.bin")))
    }
}

impl Clock for HostHal {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

impl Hal for HostHal {
    fn sleep_until(&mut self, deadline: Timestamp) {
        let now = self.now_us();
        if deadline.as_micros() > now {
            std::thread::sleep(Duration::from_micros(
                deadline.as_micros() - now,
            ));
        }
    }

    fn latch_inputs(&mut self, _ipi: &mut [u8]) {}

    fn flush_outputs(&mut self, _opi: &[u8]) {}

    fn persist_write(
        &mut self,
        key: &str,
        value: &[u8],
    ) -> Result<(), HalError> {
        let path = self.key_path(key)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|_| HalError::Failed)?;
        }
        std::fs::write(path, value).map_err(|_| HalError::Failed)
    }

    fn persist_read(
        &mut self,
        key: &str,
        buf: &mut [u8],
    ) -> Result<usize, HalError> {
        let path = self.key_path(key)?;
        let data = std::fs::read(path).map_err(|_| HalError::NotFound)?;
        if data.len() > buf.len() {
            return Err(HalError::TooLarge);
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn persist_clear(&mut self, key: &str) -> Result<(), HalError> {
        let path = self.key_path(key)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(HalError::Failed),
        }
    }
}

/// Everything the dispatcher thread and the command loop share.
struct App {
    rt: Box<Runtime>,
    hal: HostHal,
}

/// State of a multi-line `load <size>` transfer.
struct Transfer {
    expected: usize,
    bytes: Vec<u8>,
    raw: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let policy = Policy {
        allow_poke: args.allow_poke,
        ..Policy::default()
    };
    let mut app = App {
        rt: Box::new(Runtime::new(policy)),
        hal: HostHal::new(args.persist_dir.clone()),
    };

    if let Some(path) = &args.program {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let count = if args.raw {
            app.rt
                .load_raw(&bytes, &mut app.hal)
                .map_err(|e| anyhow!("load failed: {}", e.as_str()))?
        } else {
            app.rt
                .load(&bytes, &mut app.hal)
                .map_err(|e| anyhow!("load failed: {}", e.as_str()))?
        };
        eprintln!("loaded {} task(s) from {}", count, path.display());
    } else if args.persist_dir.is_some() {
        let mut scratch = vec![0u8; CODE_SIZE + 4096];
        match app.rt.replay_persisted(&mut app.hal, &mut scratch) {
            Ok(Some(count)) => {
                eprintln!("restored {count} task(s) from persisted program")
            }
            Ok(None) => {}
            Err(e) => eprintln!("persisted program ignored: {}", e.as_str()),
        }
    }

    if args.start {
        app.rt.start(&mut app.hal);
    }

    let shared = Arc::new(Mutex::new(app));
    spawn_dispatcher(Arc::clone(&shared));

    let stdin = std::io::stdin();
    let mut transfer: Option<Transfer> = None;
    for line in stdin.lock().lines() {
        let line = line?;
        let reply = {
            let mut app = shared.lock().unwrap();
            handle_line(&mut app, &mut transfer, line.trim())
        };
        match reply {
            Ok(text) => println!("{text}"),
            Err(e) => println!("ERROR: {e}"),
        }
        std::io::stdout().flush()?;
    }
    Ok(())
}

/// The dispatcher runs on its own thread, like it would on a platform
/// main loop, taking the app lock only around a single poll so commands
/// stay responsive. Sleeps happen outside the lock against the real
/// clock.
fn spawn_dispatcher(shared: Arc<Mutex<App>>) {
    std::thread::spawn(move || loop {
        let outcome = {
            let mut app = shared.lock().unwrap();
            let App { rt, hal } = &mut *app;
            rt.poll(hal)
        };
        match outcome {
            Poll::Ran { .. } => {}
            Poll::Sleep { until } => {
                let now = {
                    let app = shared.lock().unwrap();
                    app.hal.now_us()
                };
                if until.as_micros() > now {
                    // Cap the nap so stop/load take effect promptly.
                    let nap = (until.as_micros() - now).min(50_000);
                    std::thread::sleep(Duration::from_micros(nap));
                }
            }
            Poll::Idle => {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    });
}

fn handle_line(
    app: &mut App,
    transfer: &mut Option<Transfer>,
    line: &str,
) -> Result<String> {
    if line.is_empty() {
        return Ok("OK".into());
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let json = tokens.iter().any(|t| *t == "--json");
    let args: Vec<&str> =
        tokens.iter().filter(|t| **t != "--json").copied().collect();
    if args.is_empty() {
        return Ok("OK".into());
    }

    // A transfer in progress swallows `data` lines until it's complete.
    if let Some(t) = transfer.as_mut() {
        if args[0] == "data" {
            let hex = args.get(1).ok_or_else(|| anyhow!("missing hex"))?;
            t.bytes.extend(parse_hex(hex)?);
            if t.bytes.len() < t.expected {
                return Ok(format!(
                    "OK {}/{}",
                    t.bytes.len(),
                    t.expected
                ));
            }
            if t.bytes.len() > t.expected {
                *transfer = None;
                bail!("more data than declared");
            }
            let t = transfer.take().unwrap();
            let count = if t.raw {
                app.rt
                    .load_raw(&t.bytes, &mut app.hal)
                    .map_err(|e| anyhow!(e.as_str()))?
            } else {
                app.rt
                    .load(&t.bytes, &mut app.hal)
                    .map_err(|e| anyhow!(e.as_str()))?
            };
            if let Err(e) = app.rt.persist_image(&t.bytes, &mut app.hal) {
                if e != HalError::Unsupported {
                    return Ok(format!(
                        "OK {count} task(s); persist failed: {}",
                        e.as_str()
                    ));
                }
            }
            return Ok(format!("OK {count} task(s)"));
        }
        *transfer = None;
        bail!("transfer aborted by '{}'", args[0]);
    }

    match args[0] {
        "status" => {
            let now = Timestamp::from_micros(app.hal.now_us());
            if json {
                let mut out = String::new();
                debug::emit_status(
                    &mut out,
                    app.rt.scheduler(),
                    app.rt.memory(),
                    now,
                )?;
                Ok(out)
            } else {
                let stats =
                    debug::stats_snapshot(app.rt.scheduler(), now);
                Ok(format!(
                    "state={} uptime_ms={} cycles={} overruns={} tasks={}\nOK",
                    stats.state,
                    stats.uptime_ms,
                    stats.total_cycles,
                    stats.total_overruns,
                    stats.active_tasks,
                ))
            }
        }
        "start" => {
            let App { rt, hal } = app;
            rt.start(hal);
            Ok("OK".into())
        }
        "stop" => {
            app.rt.stop();
            Ok("OK".into())
        }
        "reset" => {
            let App { rt, hal } = app;
            rt.reset(hal);
            Ok("OK".into())
        }
        "resume" => {
            let slot = parse_num(args.get(1))? as usize;
            if app.rt.resume(slot) {
                Ok("OK".into())
            } else {
                bail!("slot {slot} is not paused")
            }
        }
        "load" => {
            let size = parse_num(args.get(1))? as usize;
            if size == 0 || size > CODE_SIZE + 4096 {
                bail!("bad size {size}");
            }
            *transfer = Some(Transfer {
                expected: size,
                bytes: Vec::with_capacity(size),
                raw: args.get(2) == Some(&"raw"),
            });
            Ok(format!("OK send {size} bytes as 'data <hex>'"))
        }
        "dbg" => handle_dbg(app, &args[1..], json),
        "sched" => handle_sched(app, &args[1..]),
        "persist" => handle_persist(app, &args[1..]),
        other => bail!("unknown command '{other}'"),
    }
}

fn handle_dbg(app: &mut App, args: &[&str], json: bool) -> Result<String> {
    match args.first().copied() {
        Some("info") => {
            let slot = args
                .get(1)
                .map(|s| parse_num(Some(s)))
                .transpose()?
                .unwrap_or(0) as usize;
            if json {
                let mut out = String::new();
                debug::emit_dbg_info(
                    &mut out,
                    app.rt.scheduler(),
                    slot,
                    app.rt.memory(),
                )?;
                Ok(out)
            } else {
                let snap = debug::vm_snapshot(app.rt.scheduler(), slot)
                    .ok_or_else(|| anyhow!("no task in slot {slot}"))?;
                Ok(format!(
                    "pc={:#06X} sp={} top={:?} halted={} paused={} error={}\nOK",
                    snap.pc,
                    snap.sp,
                    snap.top,
                    snap.halted,
                    snap.paused,
                    snap.error.map(|e| e.as_str()).unwrap_or("none"),
                ))
            }
        }
        Some("peek") => {
            let addr = parse_num(args.get(1))? as u16;
            let len = args
                .get(2)
                .map(|s| parse_num(Some(s)))
                .transpose()?
                .unwrap_or(16) as usize;
            let bytes = debug::memory_peek(app.rt.memory(), addr, len);
            let mut out = String::new();
            for (i, b) in bytes.iter().enumerate() {
                if i % 16 == 0 {
                    if i != 0 {
                        out.push('\n');
                    }
                    out.push_str(&format!("{:04X}:", addr as usize + i));
                }
                out.push_str(&format!(" {b:02X}"));
            }
            out.push_str("\nOK");
            Ok(out)
        }
        Some("poke") => {
            let addr = parse_num(args.get(1))? as u16;
            let value = parse_num(args.get(2))? as u8;
            let policy = *app.rt.scheduler().policy();
            debug::memory_poke(
                app.rt.memory_mut(),
                &policy,
                addr,
                value,
            )
            .map_err(|e| anyhow!(e.as_str()))?;
            Ok("OK".into())
        }
        Some("list") => {
            let mut pc = parse_num(args.get(1))? as u16;
            let count = args
                .get(2)
                .map(|s| parse_num(Some(s)))
                .transpose()?
                .unwrap_or(8);
            let code = app.rt.memory().code();
            let mut out = String::new();
            for _ in 0..count {
                if pc as usize >= code.len() {
                    break;
                }
                let mut line = String::new();
                pc = debug::disasm_line(code, pc, &mut line)?;
                out.push_str(&line);
                out.push('\n');
            }
            out.push_str("OK");
            Ok(out)
        }
        _ => bail!("usage: dbg info|peek|poke|list"),
    }
}

fn handle_sched(app: &mut App, args: &[&str]) -> Result<String> {
    match args.first().copied() {
        Some("status") => {
            let sched = app.rt.scheduler();
            Ok(format!(
                "state={} active={}\nOK",
                sched.state().as_str(),
                sched.active_tasks()
            ))
        }
        Some("tasks") => {
            let mut out = String::new();
            for (index, slot) in app.rt.scheduler().slots() {
                let t = slot.task();
                let s = slot.stats();
                out.push_str(&format!(
                    "slot={} id={} prio={} interval_us={} entry={:#06X} \
                     cycles={} overruns={} last_us={}\n",
                    index,
                    t.id,
                    t.priority.0,
                    t.interval_us,
                    t.entry_point,
                    s.cycle_count,
                    s.overrun_count,
                    s.last_exec_time_us,
                ));
            }
            out.push_str("OK");
            Ok(out)
        }
        _ => bail!("usage: sched status|tasks"),
    }
}

fn handle_persist(app: &mut App, args: &[&str]) -> Result<String> {
    match args.first().copied() {
        Some("info") => match loader::persisted_len(&mut app.hal) {
            Some(len) => Ok(format!("stored {len} bytes\nOK")),
            None => Ok("no stored program\nOK".into()),
        },
        Some("clear") => {
            loader::clear_persisted(&mut app.hal)
                .map_err(|e| anyhow!(e.as_str()))?;
            Ok("OK".into())
        }
        _ => bail!("usage: persist info|clear"),
    }
}

fn parse_num(token: Option<&&str>) -> Result<u64> {
    let t = token.ok_or_else(|| anyhow!("missing argument"))?;
    let parsed = if let Some(hex) = t.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        t.parse()
    };
    parsed.map_err(|_| anyhow!("bad number '{t}'"))
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        bail!("odd hex length");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| anyhow!("bad hex at {i}"))
        })
        .collect()
}
